//! Ordered group of binding slots

use std::sync::Arc;

use super::{Bindable, BindingSlot, SlotBinder};
use crate::backend::NativeContext;

/// Fixed-size array of slots sharing one binder
///
/// The group remembers the range touched by its last bind pass
/// (`first_changed..=last_changed`, `changed_count` slots).
#[derive(Debug)]
pub struct BindingSlotGroup<T, B> {
    slots: Vec<BindingSlot<T>>,
    binder: B,
    first_changed: u32,
    last_changed: u32,
    changed_count: u32,
}

impl<T: Bindable, B: SlotBinder<T>> BindingSlotGroup<T, B> {
    /// Create a group of `count` empty slots
    pub fn new(count: u32, binder: B) -> Self {
        Self {
            slots: (0..count).map(BindingSlot::new).collect(),
            binder,
            first_changed: 0,
            last_changed: 0,
            changed_count: 0,
        }
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the group has no slots
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot at `index`
    pub fn slot(&self, index: u32) -> Option<&BindingSlot<T>> {
        self.slots.get(index as usize)
    }

    /// Stage a value in one slot; returns `false` if `index` is out of range
    pub fn set(&mut self, index: u32, value: Option<Arc<T>>) -> bool {
        match self.slots.get_mut(index as usize) {
            Some(slot) => {
                slot.set(value);
                true
            }
            None => false,
        }
    }

    /// Staged value of one slot
    pub fn value(&self, index: u32) -> Option<&Arc<T>> {
        self.slots.get(index as usize).and_then(BindingSlot::value)
    }

    /// Bound value of one slot
    pub fn bound(&self, index: u32) -> Option<&Arc<T>> {
        self.slots.get(index as usize).and_then(BindingSlot::bound)
    }

    /// Stage `None` in every slot
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.set(None);
        }
    }

    /// Iterate the slots in order
    pub fn iter(&self) -> std::slice::Iter<'_, BindingSlot<T>> {
        self.slots.iter()
    }

    /// Range touched by the last bind pass, if any slot changed
    pub fn changed_range(&self) -> Option<(u32, u32, u32)> {
        (self.changed_count > 0).then_some((self.first_changed, self.last_changed, self.changed_count))
    }

    /// Bind every dirty slot
    ///
    /// A single dirty slot goes through the one-slot path. Several dirty slots
    /// are sent as one bulk call covering `[first_changed, last_changed]`;
    /// clean slots inside that range are re-sent because the native call
    /// takes a contiguous array, but nothing outside the range is touched.
    /// Returns `true` if anything was bound.
    pub fn bind_all(&mut self, ctx: &mut dyn NativeContext) -> bool {
        self.changed_count = 0;
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.is_dirty() {
                let i = i as u32;
                if self.changed_count == 0 {
                    self.first_changed = i;
                }
                self.last_changed = i;
                self.changed_count += 1;
            }
        }

        match self.changed_count {
            0 => false,
            1 => self.slots[self.first_changed as usize].bind(&self.binder, ctx),
            _ => {
                let first = self.first_changed as usize;
                let last = self.last_changed as usize;
                let range = &mut self.slots[first..=last];

                if range.iter().all(|slot| slot.value().is_none()) {
                    self.binder.unbind_group(ctx, self.first_changed, range.len() as u32);
                } else {
                    self.binder.bind_group(ctx, self.first_changed, range, self.changed_count);
                }

                for slot in range.iter_mut() {
                    slot.mark_bound();
                }
                true
            }
        }
    }

    /// Forget every bound value so the next [`Self::bind_all`] reissues all calls
    pub fn invalidate(&mut self) {
        for slot in &mut self.slots {
            slot.invalidate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::binders::tests::{CountingBinder, Obj};
    use crate::backend::headless::HeadlessDevice;
    use crate::backend::{ContextKind, NativeDevice};

    fn group(count: u32) -> BindingSlotGroup<Obj, CountingBinder> {
        BindingSlotGroup::new(count, CountingBinder::default())
    }

    #[test]
    fn test_single_change_uses_single_path() {
        let device = HeadlessDevice::default();
        let mut ctx = device.create_context(ContextKind::Immediate).unwrap();
        let mut group = group(8);

        group.set(5, Some(Arc::new(Obj::new(1))));
        assert!(group.bind_all(ctx.as_mut()));
        assert_eq!(group.binder.binds(), 1);
        assert_eq!(group.binder.group_binds(), 0);
        assert_eq!(group.changed_range(), Some((5, 5, 1)));
    }

    #[test]
    fn test_group_bind_covers_minimal_range() {
        let device = HeadlessDevice::default();
        let mut ctx = device.create_context(ContextKind::Immediate).unwrap();
        let mut group = group(16);

        group.set(3, Some(Arc::new(Obj::new(1))));
        group.set(7, Some(Arc::new(Obj::new(2))));
        assert!(group.bind_all(ctx.as_mut()));

        assert_eq!(group.binder.group_binds(), 1);
        assert_eq!(group.binder.last_group_range(), Some((3, 5)));
        assert_eq!(group.changed_range(), Some((3, 7, 2)));
    }

    #[test]
    fn test_clean_group_issues_nothing() {
        let device = HeadlessDevice::default();
        let mut ctx = device.create_context(ContextKind::Immediate).unwrap();
        let mut group = group(4);

        group.set(0, Some(Arc::new(Obj::new(1))));
        group.set(1, Some(Arc::new(Obj::new(2))));
        group.bind_all(ctx.as_mut());
        assert!(!group.bind_all(ctx.as_mut()));
        assert_eq!(group.binder.group_binds(), 1);
        assert_eq!(group.changed_range(), None);
    }

    #[test]
    fn test_clearing_range_unbinds_group() {
        let device = HeadlessDevice::default();
        let mut ctx = device.create_context(ContextKind::Immediate).unwrap();
        let mut group = group(4);

        group.set(1, Some(Arc::new(Obj::new(1))));
        group.set(2, Some(Arc::new(Obj::new(2))));
        group.bind_all(ctx.as_mut());

        group.clear();
        assert!(group.bind_all(ctx.as_mut()));
        assert_eq!(group.binder.group_unbinds(), 1);
        assert!(group.bound(1).is_none());
        assert!(group.bound(2).is_none());
    }

    #[test]
    fn test_out_of_range_set_rejected() {
        let mut group = group(2);
        assert!(!group.set(2, Some(Arc::new(Obj::new(1)))));
    }
}
