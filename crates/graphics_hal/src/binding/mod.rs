//! Slot-based binding cache
//!
//! Every pipeline attachment point is a [`BindingSlot`]: a staged value, the
//! value the native API currently holds, and an identity diff between them.
//! Arrays of attachment points (vertex buffers, samplers, render targets) are
//! a [`BindingSlotGroup`] that binds only the smallest range covering the
//! changed slots. The native call itself is issued by a [`SlotBinder`].

mod binders;
mod group;
mod slot;

pub use binders::*;
pub use group::BindingSlotGroup;
pub use slot::BindingSlot;

use crate::backend::NativeHandle;

/// Object that can sit in a binding slot
pub trait Bindable: Send + Sync {
    /// Primary native handle
    fn native_handle(&self) -> NativeHandle;

    /// Counter bumped whenever the native representation is recreated
    ///
    /// A slot whose bound object changed version is rebound even though the
    /// object identity did not change.
    fn version(&self) -> u64 {
        0
    }
}
