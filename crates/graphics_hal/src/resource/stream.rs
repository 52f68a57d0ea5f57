//! CPU access to a mapped resource

use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::backend::{MappedRegion, NativeMapMode};
use crate::resource::GraphicsResource;
use crate::{HalError, HalResult};

/// Open map of one subresource
///
/// Obtained from [`crate::queue::CommandQueue::map_resource`] and handed back
/// to [`crate::queue::CommandQueue::unmap_resource`]. Only one stream can be
/// open per resource. The cursor starts at the byte offset given when mapping.
pub struct GraphicsStream<'a> {
    resource: &'a GraphicsResource,
    region: Option<Box<dyn MappedRegion>>,
    subresource: u32,
    mode: NativeMapMode,
    position: u64,
}

impl<'a> GraphicsStream<'a> {
    pub(crate) fn new(
        resource: &'a GraphicsResource,
        region: Box<dyn MappedRegion>,
        subresource: u32,
        mode: NativeMapMode,
        offset: u64,
    ) -> Self {
        Self { resource, region: Some(region), subresource, mode, position: offset }
    }

    /// Mapped resource
    pub fn resource(&self) -> &'a GraphicsResource {
        self.resource
    }

    /// Mapped subresource
    pub const fn subresource(&self) -> u32 {
        self.subresource
    }

    /// Native access mode
    pub const fn mode(&self) -> NativeMapMode {
        self.mode
    }

    /// Length of the mapped memory
    pub fn len(&self) -> u64 {
        self.region.as_ref().map_or(0, |region| region.bytes().len() as u64)
    }

    /// Whether the mapped memory is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cursor position
    pub const fn position(&self) -> u64 {
        self.position
    }

    /// Write plain-old-data values at the cursor
    pub fn write_slice<T: bytemuck::Pod>(&mut self, values: &[T]) -> HalResult<()> {
        self.write_bytes(bytemuck::cast_slice(values))
    }

    /// Read `count` plain-old-data values at the cursor
    pub fn read_slice<T: bytemuck::Pod>(&mut self, count: usize) -> HalResult<Vec<T>> {
        let mut values = vec![T::zeroed(); count];
        self.read_exact(bytemuck::cast_slice_mut(&mut values))?;
        Ok(values)
    }

    /// Write all of `bytes` at the cursor
    pub fn write_bytes(&mut self, bytes: &[u8]) -> HalResult<()> {
        if !self.mode.can_write() {
            return Err(self.access_error("stream is read-only"));
        }
        self.write_all(bytes)?;
        Ok(())
    }

    /// Read everything from the cursor to the end
    pub fn read_to_vec(&mut self) -> HalResult<Vec<u8>> {
        if !self.mode.can_read() {
            return Err(self.access_error("stream is write-only"));
        }
        let mut bytes = Vec::new();
        self.read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    pub(crate) fn take_region(&mut self) -> Option<Box<dyn MappedRegion>> {
        self.region.take()
    }

    fn access_error(&self, reason: &str) -> HalError {
        HalError::InvalidMapAccess { name: self.resource.name().to_string(), reason: reason.to_string() }
    }

    fn remaining(&self) -> io::Result<usize> {
        let len = self.len();
        if self.region.is_none() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "stream is unmapped"));
        }
        Ok(len.saturating_sub(self.position) as usize)
    }
}

impl Read for GraphicsStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = self.remaining()?.min(buf.len());
        if count == 0 {
            return Ok(0);
        }
        let start = self.position as usize;
        if let Some(region) = self.region.as_ref() {
            buf[..count].copy_from_slice(&region.bytes()[start..start + count]);
        }
        self.position += count as u64;
        Ok(count)
    }
}

impl Write for GraphicsStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let count = self.remaining()?.min(buf.len());
        if count == 0 {
            return Ok(0);
        }
        let start = self.position as usize;
        if let Some(region) = self.region.as_mut() {
            region.bytes_mut()[start..start + count].copy_from_slice(&buf[..count]);
        }
        self.position += count as u64;
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for GraphicsStream<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.len() as i128;
        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::End(delta) => len + i128::from(delta),
            SeekFrom::Current(delta) => i128::from(self.position) + i128::from(delta),
        };
        if target < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "seek before start of mapped memory"));
        }
        self.position = target as u64;
        Ok(self.position)
    }
}

impl std::fmt::Debug for GraphicsStream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsStream")
            .field("resource", &self.resource.name())
            .field("subresource", &self.subresource)
            .field("mode", &self.mode)
            .field("position", &self.position)
            .field("len", &self.len())
            .finish()
    }
}

impl Drop for GraphicsStream<'_> {
    fn drop(&mut self) {
        if self.region.take().is_some() {
            log::warn!("Stream on '{}' dropped without unmap_resource", self.resource.name());
            // The native context is not reachable here; release the CPU-side guard.
            let _ = self.resource.end_map();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;

    use super::*;
    use crate::backend::NativeResource;
    use crate::resource::ResourceDesc;

    struct VecRegion(Vec<u8>);

    impl MappedRegion for VecRegion {
        fn bytes(&self) -> &[u8] {
            &self.0
        }

        fn bytes_mut(&mut self) -> &mut [u8] {
            &mut self.0
        }
    }

    fn resource() -> GraphicsResource {
        GraphicsResource::new("stream", ResourceDesc::constant_buffer(16), NativeResource::default(), Weak::new())
    }

    #[test]
    fn test_write_then_read_through_seek() {
        let resource = resource();
        resource.begin_map().unwrap();
        let mut stream = GraphicsStream::new(&resource, Box::new(VecRegion(vec![0; 16])), 0, NativeMapMode::ReadWrite, 4);
        stream.write_slice(&[7u32, 9]).unwrap();
        assert_eq!(stream.position(), 12);

        stream.seek(SeekFrom::Start(4)).unwrap();
        assert_eq!(stream.read_slice::<u32>(2).unwrap(), vec![7, 9]);
    }

    #[test]
    fn test_write_past_end_fails() {
        let resource = resource();
        resource.begin_map().unwrap();
        let mut stream = GraphicsStream::new(&resource, Box::new(VecRegion(vec![0; 4])), 0, NativeMapMode::Write, 0);
        assert!(stream.write_bytes(&[1, 2, 3, 4, 5]).is_err());
    }

    #[test]
    fn test_read_only_stream_rejects_writes() {
        let resource = resource();
        resource.begin_map().unwrap();
        let mut stream = GraphicsStream::new(&resource, Box::new(VecRegion(vec![0; 4])), 0, NativeMapMode::Read, 0);
        assert!(matches!(stream.write_bytes(&[1]), Err(HalError::InvalidMapAccess { .. })));
    }

    #[test]
    fn test_drop_releases_map_guard() {
        let resource = resource();
        resource.begin_map().unwrap();
        drop(GraphicsStream::new(&resource, Box::new(VecRegion(vec![0; 4])), 0, NativeMapMode::Write, 0));
        assert!(!resource.is_mapped());
    }
}
