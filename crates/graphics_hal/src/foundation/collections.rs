//! Specialized collection types

pub use slotmap::{SlotMap, new_key_type};

new_key_type! {
    /// Stable key of a command list registered with a frame tracker
    pub struct CommandListKey;
}

/// Handle-based map keyed by [`CommandListKey`]
pub type CommandListMap<T> = SlotMap<CommandListKey, T>;

/// Fixed-capacity recycling pool
///
/// Items returned with [`Pool::put`] are handed back out by [`Pool::take`]
/// in LIFO order, which keeps recently used native objects warm.
#[derive(Debug)]
pub struct Pool<T> {
    items: Vec<T>,
    capacity: usize,
}

impl<T> Pool<T> {
    /// Create an empty pool that keeps at most `capacity` items
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Return an item to the pool; gives it back when the pool is full
    pub fn put(&mut self, item: T) -> Option<T> {
        if self.items.len() >= self.capacity {
            return Some(item);
        }
        self.items.push(item);
        None
    }

    /// Take a pooled item, if any
    pub fn take(&mut self) -> Option<T> {
        self.items.pop()
    }

    /// Number of pooled items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the pool is empty
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Remove every pooled item
    pub fn drain(&mut self) -> std::vec::Drain<'_, T> {
        self.items.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_respects_capacity() {
        let mut pool = Pool::with_capacity(2);
        assert!(pool.put(1).is_none());
        assert!(pool.put(2).is_none());
        assert_eq!(pool.put(3), Some(3));
        assert_eq!(pool.take(), Some(2));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_command_list_map_keys_are_stable() {
        let mut map: CommandListMap<&str> = CommandListMap::with_key();
        let a = map.insert("a");
        let b = map.insert("b");
        map.remove(a);
        assert_eq!(map.get(b), Some(&"b"));
        assert!(map.get(a).is_none());
    }
}
