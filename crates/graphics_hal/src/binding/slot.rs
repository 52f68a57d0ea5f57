//! Single binding slot

use std::sync::Arc;

use super::{Bindable, SlotBinder};
use crate::backend::NativeContext;

/// One logical pipeline attachment point
///
/// `value` is what the client last requested, `bound` is what the native
/// context currently holds. The slot keeps both alive through `Arc`, so an
/// object cannot be released while it is still bound.
///
/// After [`Self::invalidate`] a slot that held a value is `stale`: the native
/// context may still hold that value, so the next bind is issued even when
/// the slot is staged empty.
#[derive(Debug)]
pub struct BindingSlot<T> {
    index: u32,
    value: Option<Arc<T>>,
    bound: Option<Arc<T>>,
    bound_version: u64,
    stale: bool,
}

impl<T: Bindable> BindingSlot<T> {
    /// Create an empty slot
    pub const fn new(index: u32) -> Self {
        Self {
            index,
            value: None,
            bound: None,
            bound_version: 0,
            stale: false,
        }
    }

    /// Slot index within its group
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Stage a value; no native call is made until [`Self::bind`]
    pub fn set(&mut self, value: Option<Arc<T>>) {
        self.value = value;
    }

    /// Staged value
    pub fn value(&self) -> Option<&Arc<T>> {
        self.value.as_ref()
    }

    /// Value the native context currently holds
    pub fn bound(&self) -> Option<&Arc<T>> {
        self.bound.as_ref()
    }

    /// Whether the staged value differs from the bound one
    ///
    /// Compares object identity, never contents: two distinct objects with
    /// equal contents still count as a change.
    pub fn is_dirty(&self) -> bool {
        if self.stale {
            return true;
        }
        match (&self.value, &self.bound) {
            (None, None) => false,
            (Some(value), Some(bound)) => {
                !Arc::ptr_eq(value, bound) || value.version() != self.bound_version
            }
            _ => true,
        }
    }

    /// Reconcile the staged value with the native context
    ///
    /// Issues exactly one bind (or unbind, for an empty value) when the slot
    /// is dirty and returns `true`; otherwise makes no native call.
    pub fn bind<B: SlotBinder<T>>(&mut self, binder: &B, ctx: &mut dyn NativeContext) -> bool {
        if !self.is_dirty() {
            return false;
        }

        match &self.value {
            Some(value) => binder.bind(ctx, self.index, value),
            None => binder.unbind(ctx, self.index),
        }
        self.mark_bound();
        true
    }

    /// Record the staged value as bound without a native call
    pub(crate) fn mark_bound(&mut self) {
        self.bound_version = self.value.as_ref().map_or(0, |v| v.version());
        self.bound = self.value.clone();
        self.stale = false;
    }

    /// Forget what is bound so the next [`Self::bind`] reissues the call
    ///
    /// A slot that never held a value stays clean while staged empty.
    pub fn invalidate(&mut self) {
        self.stale |= self.bound.is_some();
        self.bound = None;
        self.bound_version = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::binders::tests::{CountingBinder, Obj};
    use crate::backend::headless::HeadlessDevice;
    use crate::backend::{ContextKind, NativeDevice};

    #[test]
    fn test_bind_only_when_changed() {
        let device = HeadlessDevice::default();
        let mut ctx = device.create_context(ContextKind::Immediate).unwrap();
        let binder = CountingBinder::default();
        let mut slot = BindingSlot::new(0);

        let a = Arc::new(Obj::new(1));
        slot.set(Some(a.clone()));
        assert!(slot.bind(&binder, ctx.as_mut()));
        assert!(!slot.bind(&binder, ctx.as_mut()));
        assert_eq!(binder.binds(), 1);

        slot.set(Some(a));
        assert!(!slot.bind(&binder, ctx.as_mut()));
        assert_eq!(binder.binds(), 1);
    }

    #[test]
    fn test_identity_not_equality() {
        let device = HeadlessDevice::default();
        let mut ctx = device.create_context(ContextKind::Immediate).unwrap();
        let binder = CountingBinder::default();
        let mut slot = BindingSlot::new(2);

        slot.set(Some(Arc::new(Obj::new(5))));
        slot.bind(&binder, ctx.as_mut());
        slot.set(Some(Arc::new(Obj::new(5))));
        assert!(slot.is_dirty());
        assert!(slot.bind(&binder, ctx.as_mut()));
        assert_eq!(binder.binds(), 2);
    }

    #[test]
    fn test_null_value_unbinds() {
        let device = HeadlessDevice::default();
        let mut ctx = device.create_context(ContextKind::Immediate).unwrap();
        let binder = CountingBinder::default();
        let mut slot = BindingSlot::new(0);

        assert!(!slot.bind(&binder, ctx.as_mut()));
        slot.set(Some(Arc::new(Obj::new(1))));
        slot.bind(&binder, ctx.as_mut());
        slot.set(None);
        assert!(slot.bind(&binder, ctx.as_mut()));
        assert_eq!(binder.unbinds(), 1);
        assert!(slot.bound().is_none());
    }

    #[test]
    fn test_version_bump_rebinds() {
        let device = HeadlessDevice::default();
        let mut ctx = device.create_context(ContextKind::Immediate).unwrap();
        let binder = CountingBinder::default();
        let mut slot = BindingSlot::new(0);

        let obj = Arc::new(Obj::new(1));
        slot.set(Some(obj.clone()));
        slot.bind(&binder, ctx.as_mut());
        obj.bump();
        assert!(slot.bind(&binder, ctx.as_mut()));
        assert_eq!(binder.binds(), 2);
    }

    #[test]
    fn test_invalidated_slot_left_empty_unbinds() {
        let device = HeadlessDevice::default();
        let mut ctx = device.create_context(ContextKind::Immediate).unwrap();
        let binder = CountingBinder::default();
        let mut slot = BindingSlot::new(3);

        slot.set(Some(Arc::new(Obj::new(1))));
        slot.bind(&binder, ctx.as_mut());
        slot.invalidate();
        slot.invalidate();
        slot.set(None);
        assert!(slot.is_dirty());
        assert!(slot.bind(&binder, ctx.as_mut()));
        assert_eq!(binder.unbinds(), 1);

        assert!(!slot.bind(&binder, ctx.as_mut()));
        assert_eq!(binder.unbinds(), 1);
    }

    #[test]
    fn test_invalidated_empty_slot_stays_clean() {
        let device = HeadlessDevice::default();
        let mut ctx = device.create_context(ContextKind::Immediate).unwrap();
        let binder = CountingBinder::default();
        let mut slot = BindingSlot::<Obj>::new(0);

        slot.invalidate();
        assert!(!slot.is_dirty());
        assert!(!slot.bind(&binder, ctx.as_mut()));
        assert_eq!(binder.unbinds(), 0);
    }
}
