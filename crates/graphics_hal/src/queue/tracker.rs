//! Command-list lifecycle tracking

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::backend::{CommandListFlags, NativeCommandList, NativeContext};
use crate::foundation::collections::{CommandListKey, CommandListMap, Pool};

/// Closed command list produced by [`super::CommandQueue::end`]
///
/// Deferred lists are handed to a primary queue's
/// [`super::CommandQueue::execute`]; the primary list keeps them alive until
/// the GPU has finished with it.
#[derive(Debug)]
pub struct CommandList {
    native: NativeCommandList,
    flags: CommandListFlags,
    frame: u64,
    branch: u32,
    submitted: AtomicBool,
    dependencies: Vec<Arc<CommandList>>,
}

impl CommandList {
    pub(crate) fn new(
        native: NativeCommandList,
        flags: CommandListFlags,
        frame: u64,
        branch: u32,
        dependencies: Vec<Arc<CommandList>>,
    ) -> Self {
        Self { native, flags, frame, branch, submitted: AtomicBool::new(false), dependencies }
    }

    /// Native list
    pub const fn native(&self) -> &NativeCommandList {
        &self.native
    }

    /// Flags the list was recorded with
    pub const fn flags(&self) -> CommandListFlags {
        self.flags
    }

    /// Whether the list was recorded on a deferred queue
    pub const fn is_deferred(&self) -> bool {
        self.flags.contains(CommandListFlags::DEFERRED)
    }

    /// Frame the list was recorded in
    pub const fn frame(&self) -> u64 {
        self.frame
    }

    /// Recording index within its frame
    pub const fn branch(&self) -> u32 {
        self.branch
    }

    /// Whether the list was submitted to the device
    pub fn is_submitted(&self) -> bool {
        self.submitted.load(Ordering::Acquire)
    }

    /// Deferred lists executed inside this one
    pub fn dependencies(&self) -> &[Arc<CommandList>] {
        &self.dependencies
    }

    pub(crate) fn mark_submitted(&self) -> bool {
        !self.submitted.swap(true, Ordering::AcqRel)
    }
}

/// Per-queue bookkeeping of closed command lists
///
/// A tracked list is retired once nothing outside the tracker references it
/// and its completion signal has been observed; its native list then goes
/// back to a pool for reuse.
#[derive(Debug)]
pub(crate) struct FrameTracker {
    frame: u64,
    branch_count: u32,
    lists: CommandListMap<Arc<CommandList>>,
    pool: Pool<NativeCommandList>,
}

impl FrameTracker {
    pub fn new(pool_size: usize) -> Self {
        Self {
            frame: 0,
            branch_count: 0,
            lists: CommandListMap::with_key(),
            pool: Pool::with_capacity(pool_size),
        }
    }

    /// Enter device frame `frame`, reset per-frame counters and retire finished lists
    pub fn start_frame(&mut self, frame: u64, ctx: &mut dyn NativeContext) -> usize {
        self.frame = frame;
        self.branch_count = 0;
        self.retire(ctx)
    }

    pub const fn frame(&self) -> u64 {
        self.frame
    }

    /// Index for the next recording in this frame
    pub fn next_branch(&mut self) -> u32 {
        let branch = self.branch_count;
        self.branch_count += 1;
        branch
    }

    pub fn track(&mut self, list: Arc<CommandList>) -> CommandListKey {
        self.lists.insert(list)
    }

    pub fn tracked(&self) -> usize {
        self.lists.len()
    }

    pub fn pooled(&self) -> usize {
        self.pool.len()
    }

    /// Recycle every list the GPU and the client are done with
    pub fn retire(&mut self, ctx: &mut dyn NativeContext) -> usize {
        let finished: Vec<CommandListKey> = self
            .lists
            .iter()
            .filter(|(_, list)| Arc::strong_count(list) == 1 && ctx.is_complete(list.native()))
            .map(|(key, _)| key)
            .collect();

        for key in &finished {
            if let Some(list) = self.lists.remove(*key) {
                let native = *list.native();
                if let Some(overflow) = self.pool.put(native) {
                    ctx.free_list(overflow);
                }
            }
        }
        if !finished.is_empty() {
            log::trace!("Retired {} command lists ({} pooled)", finished.len(), self.pool.len());
        }
        finished.len()
    }

    /// Native list ready for reuse
    pub fn acquire(&mut self) -> Option<NativeCommandList> {
        self.pool.take()
    }

    /// Free every pooled list and every list no one references any more
    pub fn drain(&mut self, ctx: &mut dyn NativeContext) {
        for native in self.pool.drain() {
            ctx.free_list(native);
        }
        let lists = std::mem::take(&mut self.lists);
        for (_, list) in lists {
            match Arc::try_unwrap(list) {
                Ok(list) => ctx.free_list(list.native),
                Err(list) => log::warn!("Command list {} still referenced at shutdown", list.native.handle),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::HeadlessDevice;
    use crate::backend::{CommandListLevel, ContextKind, NativeDevice, NativeHandle};

    fn list(handle: u64) -> Arc<CommandList> {
        let native = NativeCommandList { handle: NativeHandle(handle), fence: NativeHandle::NULL, level: CommandListLevel::Primary };
        Arc::new(CommandList::new(native, CommandListFlags::empty(), 1, 0, Vec::new()))
    }

    #[test]
    fn test_branches_reset_per_frame() {
        let device = HeadlessDevice::default();
        let mut ctx = device.create_context(ContextKind::Immediate).unwrap();
        let mut tracker = FrameTracker::new(4);
        assert_eq!(tracker.next_branch(), 0);
        assert_eq!(tracker.next_branch(), 1);
        tracker.start_frame(7, ctx.as_mut());
        assert_eq!(tracker.next_branch(), 0);
        assert_eq!(tracker.frame(), 7);
    }

    #[test]
    fn test_referenced_list_is_not_retired() {
        let device = HeadlessDevice::default();
        let mut ctx = device.create_context(ContextKind::Immediate).unwrap();
        let mut tracker = FrameTracker::new(4);

        let held = list(10);
        tracker.track(Arc::clone(&held));
        tracker.track(list(11));

        assert_eq!(tracker.retire(ctx.as_mut()), 1);
        assert_eq!(tracker.tracked(), 1);
        assert_eq!(tracker.acquire().map(|native| native.handle), Some(NativeHandle(11)));

        drop(held);
        assert_eq!(tracker.retire(ctx.as_mut()), 1);
        assert_eq!(tracker.pooled(), 1);
    }

    #[test]
    fn test_dependencies_keep_deferred_lists_alive() {
        let deferred = list(20);
        let primary = CommandList::new(
            *list(21).native(),
            CommandListFlags::empty(),
            1,
            0,
            vec![Arc::clone(&deferred)],
        );
        assert_eq!(Arc::strong_count(&deferred), 2);
        assert!(primary.mark_submitted());
        assert!(!primary.mark_submitted());
        drop(primary);
        assert_eq!(Arc::strong_count(&deferred), 1);
    }
}
