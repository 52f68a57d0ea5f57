//! # Graphics HAL
//!
//! An API-agnostic command and resource model for real-time graphics, with
//! one implementation per native backend.
//!
//! ## Features
//!
//! - **Slot-based binding cache**: every pipeline attachment point is a
//!   [`binding::BindingSlot`], diffed by identity so only changed bindings
//!   reach the native API
//! - **Validated draws**: draw and dispatch calls report a typed
//!   [`queue::BindResult`] instead of failing hard on missing bindings
//! - **Immediate and deferred queues**: deferred queues record replayable
//!   command lists that a primary queue executes
//! - **Priority-deferred resource tasks**: resource mutations run immediately,
//!   right before next use, or at a frame boundary
//! - **Backends**: a headless immediate-mode backend and an explicit Vulkan
//!   backend built on `ash`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use graphics_hal::prelude::*;
//!
//! fn main() -> Result<(), HalError> {
//!     let device = GraphicsDevice::new(Box::new(HeadlessDevice::default()), HalConfig::default())?;
//!     let mut queue = device.create_queue(ContextKind::Immediate)?;
//!
//!     queue.begin(CommandListFlags::empty())?;
//!     // bind surfaces, buffers and a shader, then draw
//!     queue.end()?;
//!     queue.submit(CommandListFlags::empty())?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod foundation;
pub mod config;
pub mod backend;
pub mod binding;
pub mod shader;
pub mod resource;
pub mod device;
pub mod queue;

mod error;

pub use error::{HalError, HalResult};

/// Common imports for users of the HAL
pub mod prelude {
    pub use crate::{
        HalError, HalResult,
        backend::{
            CommandListFlags, ContextKind, NativeContext, NativeDevice, NativeHandle,
            Rect, Viewport,
            headless::HeadlessDevice,
        },
        config::{ConfigError, ConfigFormat, HalConfig},
        device::{DeviceCapabilities, GraphicsDevice},
        queue::{BindResult, CommandList, CommandQueue, QueueValidationMode},
        resource::{
            GraphicsPriority, GraphicsResource, GraphicsStream, MapType, ResourceDesc,
            ResourceFlags, ResourceKind, ResourceTask,
        },
        shader::{
            PrimitiveTopology, Shader, ShaderComposition, ShaderPass, ShaderStageKind,
        },
    };
}
