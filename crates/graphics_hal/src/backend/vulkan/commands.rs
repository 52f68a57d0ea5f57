//! Command pool and one-shot command recording

use ash::{vk, Device};

use super::sync::Fence;
use crate::backend::CommandListLevel;
use crate::{HalError, HalResult};

/// Command pool owned by one context
///
/// Vulkan pools are externally synchronized, so each context and the
/// device's upload path get their own.
pub struct CommandPool {
    device: Device,
    command_pool: vk::CommandPool,
}

impl CommandPool {
    /// Create a pool whose buffers can be reset individually
    pub fn new(device: Device, queue_family_index: u32) -> HalResult<Self> {
        let pool_create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family_index);

        let command_pool = unsafe { device.create_command_pool(&pool_create_info, None).map_err(HalError::Vulkan)? };

        Ok(Self { device, command_pool })
    }

    /// Allocate one command buffer of the given level
    pub fn allocate(&self, level: CommandListLevel) -> HalResult<vk::CommandBuffer> {
        let level = match level {
            CommandListLevel::Primary => vk::CommandBufferLevel::PRIMARY,
            CommandListLevel::Secondary => vk::CommandBufferLevel::SECONDARY,
        };
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(level)
            .command_buffer_count(1);

        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info).map_err(HalError::Vulkan)? };
        buffers
            .into_iter()
            .next()
            .ok_or_else(|| HalError::Creation("command buffer allocation returned nothing".to_string()))
    }

    /// Return a command buffer to the pool
    pub fn free(&self, command_buffer: vk::CommandBuffer) {
        unsafe {
            self.device.free_command_buffers(self.command_pool, &[command_buffer]);
        }
    }

    /// Record commands into a throwaway primary buffer, submit and wait
    ///
    /// Used for resource initialization outside any queue.
    pub fn run_once<F>(&self, queue: vk::Queue, record: F) -> HalResult<()>
    where
        F: FnOnce(&Device, vk::CommandBuffer) -> HalResult<()>,
    {
        let command_buffer = self.allocate(CommandListLevel::Primary)?;
        let result = self.record_and_wait(queue, command_buffer, record);
        self.free(command_buffer);
        result
    }

    fn record_and_wait<F>(&self, queue: vk::Queue, command_buffer: vk::CommandBuffer, record: F) -> HalResult<()>
    where
        F: FnOnce(&Device, vk::CommandBuffer) -> HalResult<()>,
    {
        let begin_info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .begin_command_buffer(command_buffer, &begin_info)
                .map_err(HalError::Vulkan)?;
        }

        record(&self.device, command_buffer)?;

        unsafe {
            self.device.end_command_buffer(command_buffer).map_err(HalError::Vulkan)?;
        }

        let fence = Fence::new(self.device.clone(), false)?;
        let command_buffers = [command_buffer];
        let submit = vk::SubmitInfo::builder().command_buffers(&command_buffers).build();
        unsafe {
            self.device
                .queue_submit(queue, &[submit], fence.handle())
                .map_err(HalError::Vulkan)?;
        }
        fence.wait(u64::MAX)
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            self.device.destroy_command_pool(self.command_pool, None);
        }
    }
}
