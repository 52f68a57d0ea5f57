//! Fences, semaphores and pipeline barriers
//!
//! Every primary command list owns a [`Fence`] created signaled, so a list
//! that was never submitted polls as complete. The fence is reset right
//! before submission and signaled by the queue when the list retires.
//!
//! Immediate contexts chain their submissions through a pair of
//! [`Semaphore`]s: submission `n` signals semaphore `n % 2` and waits on the
//! one signaled by submission `n - 1`.

use ash::{vk, Device};

use crate::{HalError, HalResult};

/// Fence wrapper with RAII cleanup
pub struct Fence {
    device: Device,
    fence: vk::Fence,
}

impl Fence {
    /// Create a new fence
    pub fn new(device: Device, signaled: bool) -> HalResult<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };

        let create_info = vk::FenceCreateInfo::builder().flags(flags);

        let fence = unsafe { device.create_fence(&create_info, None).map_err(HalError::Vulkan)? };

        Ok(Self { device, fence })
    }

    /// Block until the fence is signaled
    pub fn wait(&self, timeout: u64) -> HalResult<()> {
        unsafe { self.device.wait_for_fences(&[self.fence], true, timeout).map_err(HalError::Vulkan) }
    }

    /// Return the fence to the unsignaled state
    pub fn reset(&self) -> HalResult<()> {
        unsafe { self.device.reset_fences(&[self.fence]).map_err(HalError::Vulkan) }
    }

    /// Poll without blocking; device loss reads as signaled
    pub fn is_signaled(&self) -> bool {
        unsafe { self.device.get_fence_status(self.fence).unwrap_or(true) }
    }

    /// Get the fence handle
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_fence(self.fence, None);
        }
    }
}

/// Binary semaphore with RAII cleanup
pub struct Semaphore {
    device: Device,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Create a new unsignaled semaphore
    pub fn new(device: Device) -> HalResult<Self> {
        let create_info = vk::SemaphoreCreateInfo::builder();
        let semaphore = unsafe { device.create_semaphore(&create_info, None).map_err(HalError::Vulkan)? };
        Ok(Self { device, semaphore })
    }

    /// Get the semaphore handle
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_semaphore(self.semaphore, None);
        }
    }
}

/// Make all prior writes visible to all later commands
///
/// Transfers, mip blits and dispatches are followed by this barrier instead
/// of per-resource tracking; every image stays in `GENERAL` layout.
pub fn full_barrier(device: &Device, command_buffer: vk::CommandBuffer) {
    let barrier = vk::MemoryBarrier::builder()
        .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
        .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE)
        .build();

    unsafe {
        device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::DependencyFlags::empty(),
            &[barrier],
            &[],
            &[],
        );
    }
}

/// Move every subresource of a fresh image from `UNDEFINED` to `GENERAL`
pub fn initial_layout_barrier(device: &Device, command_buffer: vk::CommandBuffer, image: vk::Image, aspect: vk::ImageAspectFlags) {
    let barrier = vk::ImageMemoryBarrier::builder()
        .old_layout(vk::ImageLayout::UNDEFINED)
        .new_layout(vk::ImageLayout::GENERAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: vk::REMAINING_MIP_LEVELS,
            base_array_layer: 0,
            layer_count: vk::REMAINING_ARRAY_LAYERS,
        })
        .src_access_mask(vk::AccessFlags::empty())
        .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE)
        .build();

    unsafe {
        device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}
