//! Deferred resource mutations

use std::sync::Arc;

use crate::backend::ResourceRegion;
use crate::queue::CommandQueue;
use crate::resource::{GraphicsResource, MapType, ResourceFlags, ResourceKind};
use crate::{HalError, HalResult};

/// When a resource task runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GraphicsPriority {
    /// Now, on the calling queue
    Immediate,
    /// Right before the resource is next used by a draw or dispatch
    Apply,
    /// At the next `begin_frame`, before anything is drawn
    StartOfFrame,
    /// At the next `end_frame`, after presentation
    EndOfFrame,
}

impl GraphicsPriority {
    /// Index into the device's frame-task queues
    pub const fn frame_slot(self) -> Option<usize> {
        match self {
            Self::StartOfFrame => Some(0),
            Self::EndOfFrame => Some(1),
            Self::Immediate | Self::Apply => None,
        }
    }
}

/// A mutation of a GPU resource
///
/// `process` returns `true` when the resource's native representation was
/// replaced, so bound slots holding it must be re-sent.
pub trait ResourceTask: Send {
    /// Perform the mutation on `queue`
    fn process(&mut self, queue: &mut CommandQueue, resource: &GraphicsResource) -> HalResult<bool>;

    /// Short name for log messages
    fn label(&self) -> &'static str {
        "task"
    }
}

impl<F> ResourceTask for F
where
    F: FnMut(&mut CommandQueue, &GraphicsResource) -> HalResult<bool> + Send,
{
    fn process(&mut self, queue: &mut CommandQueue, resource: &GraphicsResource) -> HalResult<bool> {
        self(queue, resource)
    }

    fn label(&self) -> &'static str {
        "closure"
    }
}

/// Write bytes into a resource
///
/// CPU-writable buffers are written through a map; everything else goes
/// through the command stream.
#[derive(Debug, Clone)]
pub struct SetDataTask {
    data: Vec<u8>,
    offset: u32,
    subresource: u32,
}

impl SetDataTask {
    /// Write `data` at the start of subresource 0
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, offset: 0, subresource: 0 }
    }

    /// Write plain-old-data values
    pub fn from_slice<T: bytemuck::Pod>(values: &[T]) -> Self {
        Self::new(bytemuck::cast_slice(values).to_vec())
    }

    /// Byte offset inside the subresource
    pub fn at_offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    /// Target subresource
    pub fn with_subresource(mut self, subresource: u32) -> Self {
        self.subresource = subresource;
        self
    }
}

impl ResourceTask for SetDataTask {
    fn process(&mut self, queue: &mut CommandQueue, resource: &GraphicsResource) -> HalResult<bool> {
        let end = u64::from(self.offset) + self.data.len() as u64;
        if resource.kind().is_buffer() && end > resource.size_in_bytes() {
            return Err(HalError::invalid(format!(
                "{} bytes at offset {} overflow '{}' ({} bytes)",
                self.data.len(),
                self.offset,
                resource.name(),
                resource.size_in_bytes()
            )));
        }

        if resource.kind().is_buffer() && resource.flags().contains(ResourceFlags::CPU_WRITE) {
            let whole = self.offset == 0 && end == resource.size_in_bytes();
            let map_type = if whole { MapType::Discard } else { MapType::Write };
            let mut stream = queue.map_resource(resource, self.subresource, self.offset, map_type)?;
            let written = stream.write_bytes(&self.data);
            queue.unmap_resource(stream)?;
            written?;
        } else {
            let region = resource
                .kind()
                .is_buffer()
                .then(|| ResourceRegion::bytes(self.offset, self.data.len() as u32));
            queue.update_resource(resource, self.subresource, region, &self.data)?;
        }
        Ok(false)
    }

    fn label(&self) -> &'static str {
        "set-data"
    }
}

/// Recreate a resource with new dimensions; contents are lost
#[derive(Debug, Clone, Copy)]
pub struct ResizeTask {
    size_in_bytes: Option<u64>,
    extent: Option<(u32, u32)>,
}

impl ResizeTask {
    /// Resize a buffer
    pub const fn buffer(size_in_bytes: u64) -> Self {
        Self { size_in_bytes: Some(size_in_bytes), extent: None }
    }

    /// Resize a texture or surface
    pub const fn texture(width: u32, height: u32) -> Self {
        Self { size_in_bytes: None, extent: Some((width, height)) }
    }
}

impl ResourceTask for ResizeTask {
    fn process(&mut self, _queue: &mut CommandQueue, resource: &GraphicsResource) -> HalResult<bool> {
        let mut desc = resource.desc();
        if let Some(size) = self.size_in_bytes {
            desc.size_in_bytes = size;
        }
        if let Some((width, height)) = self.extent {
            desc.width = width;
            desc.height = height;
        }
        if desc == resource.desc() {
            return Ok(false);
        }
        resource.recreate(desc)?;
        Ok(true)
    }

    fn label(&self) -> &'static str {
        "resize"
    }
}

/// Copy the whole resource into `destination`
#[derive(Debug, Clone)]
pub struct CopyTask {
    destination: Arc<GraphicsResource>,
}

impl CopyTask {
    /// Copy into `destination`
    pub fn new(destination: Arc<GraphicsResource>) -> Self {
        Self { destination }
    }
}

impl ResourceTask for CopyTask {
    fn process(&mut self, queue: &mut CommandQueue, resource: &GraphicsResource) -> HalResult<bool> {
        queue.copy_resource(resource, &self.destination)?;
        Ok(false)
    }

    fn label(&self) -> &'static str {
        "copy"
    }
}

/// Rebuild a texture's mip chain from its top level
#[derive(Debug, Clone, Copy, Default)]
pub struct GenerateMipsTask;

impl ResourceTask for GenerateMipsTask {
    fn process(&mut self, queue: &mut CommandQueue, resource: &GraphicsResource) -> HalResult<bool> {
        queue.generate_mips(resource)?;
        Ok(false)
    }

    fn label(&self) -> &'static str {
        "generate-mips"
    }
}

type ReadbackCallback = Box<dyn FnOnce(HalResult<Vec<u8>>) + Send>;

/// Read a subresource back to the CPU
///
/// Resources without CPU read access are copied into a temporary staging
/// resource first. The callback runs once with the bytes or the failure.
pub struct GetDataTask {
    subresource: u32,
    callback: Option<ReadbackCallback>,
}

impl GetDataTask {
    /// Read subresource 0 and hand the bytes to `callback`
    pub fn new(callback: impl FnOnce(HalResult<Vec<u8>>) + Send + 'static) -> Self {
        Self { subresource: 0, callback: Some(Box::new(callback)) }
    }

    /// Source subresource
    pub fn with_subresource(mut self, subresource: u32) -> Self {
        self.subresource = subresource;
        self
    }

    fn read(&self, queue: &mut CommandQueue, resource: &GraphicsResource) -> HalResult<Vec<u8>> {
        if resource.flags().contains(ResourceFlags::CPU_READ) {
            return read_mapped(queue, resource, self.subresource);
        }

        let device = resource.device()?;
        let staging = device.create_staging_for(resource)?;
        queue.copy_resource(resource, &staging)?;
        read_mapped(queue, &staging, self.subresource)
    }
}

fn read_mapped(queue: &mut CommandQueue, resource: &GraphicsResource, subresource: u32) -> HalResult<Vec<u8>> {
    let mut stream = queue.map_resource(resource, subresource, 0, MapType::Read)?;
    let bytes = stream.read_to_vec();
    queue.unmap_resource(stream)?;
    bytes
}

impl ResourceTask for GetDataTask {
    fn process(&mut self, queue: &mut CommandQueue, resource: &GraphicsResource) -> HalResult<bool> {
        if resource.kind() == ResourceKind::DepthSurface {
            return Err(HalError::Unsupported(format!("readback of depth surface '{}'", resource.name())));
        }
        let result = self.read(queue, resource);
        let failed = result.as_ref().err().map(ToString::to_string);
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
        match failed {
            Some(reason) => Err(HalError::invalid(reason)),
            None => Ok(false),
        }
    }

    fn label(&self) -> &'static str {
        "get-data"
    }
}

impl std::fmt::Debug for GetDataTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GetDataTask")
            .field("subresource", &self.subresource)
            .field("pending", &self.callback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_slots() {
        assert_eq!(GraphicsPriority::StartOfFrame.frame_slot(), Some(0));
        assert_eq!(GraphicsPriority::EndOfFrame.frame_slot(), Some(1));
        assert_eq!(GraphicsPriority::Apply.frame_slot(), None);
        assert_eq!(GraphicsPriority::Immediate.frame_slot(), None);
    }

    #[test]
    fn test_set_data_from_slice() {
        let task = SetDataTask::from_slice(&[1.0f32, 2.0]).at_offset(8);
        assert_eq!(task.data.len(), 8);
        assert_eq!(task.offset, 8);
    }

    #[test]
    fn test_closure_is_a_task() {
        let task = |_: &mut CommandQueue, _: &GraphicsResource| -> HalResult<bool> { Ok(true) };
        let boxed: Box<dyn ResourceTask> = Box::new(task);
        assert_eq!(boxed.label(), "closure");
    }
}
