//! Buffer and image allocation
//!
//! Resources the CPU may map live in host-visible, coherent memory. Textures
//! with CPU access are stored as tightly packed host-visible buffers (array
//! layer major, then mip level) rather than linear images, so mapping and
//! copying them never depends on driver tiling support.

use ash::{vk, Device};

use crate::resource::{Format, ResourceDesc, ResourceFlags, ResourceKind};
use crate::shader::{AddressMode, ComparisonFunc, Filter, SamplerDesc};
use crate::{HalError, HalResult};

/// Find a memory type matching `type_filter` with all of `properties`
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> HalResult<u32> {
    (0..memory_properties.memory_type_count)
        .find(|&i| {
            (type_filter & (1 << i)) != 0
                && memory_properties.memory_types[i as usize].property_flags.contains(properties)
        })
        .ok_or(HalError::NoSuitableMemoryType)
}

/// Buffer with its dedicated memory
#[derive(Debug, Clone, Copy)]
pub struct BufferAllocation {
    /// Buffer handle
    pub buffer: vk::Buffer,
    /// Backing memory
    pub memory: vk::DeviceMemory,
    /// Size in bytes
    pub size: vk::DeviceSize,
    /// Whether the memory can be mapped
    pub host_visible: bool,
}

impl BufferAllocation {
    /// Create a buffer and bind fresh memory to it
    pub fn new(
        device: &Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        host_visible: bool,
    ) -> HalResult<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size.max(1))
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.create_buffer(&buffer_info, None).map_err(HalError::Vulkan)? };

        let properties = if host_visible {
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
        } else {
            vk::MemoryPropertyFlags::DEVICE_LOCAL
        };
        let memory = match allocate(device, memory_properties, unsafe { device.get_buffer_memory_requirements(buffer) }, properties) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(err);
            }
        };

        unsafe {
            device.bind_buffer_memory(buffer, memory, 0).map_err(HalError::Vulkan)?;
        }

        Ok(Self { buffer, memory, size, host_visible })
    }

    /// Host-visible transfer source filled with `data`
    pub fn staging(device: &Device, memory_properties: &vk::PhysicalDeviceMemoryProperties, data: &[u8]) -> HalResult<Self> {
        let staging = Self::new(
            device,
            memory_properties,
            data.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            true,
        )?;
        if let Err(err) = staging.write(device, 0, data) {
            staging.destroy(device);
            return Err(err);
        }
        Ok(staging)
    }

    /// Copy bytes into host-visible memory
    pub fn write(&self, device: &Device, offset: vk::DeviceSize, data: &[u8]) -> HalResult<()> {
        if !self.host_visible {
            return Err(HalError::invalid("buffer memory is not host visible"));
        }
        if data.is_empty() {
            return Ok(());
        }
        unsafe {
            let ptr = device
                .map_memory(self.memory, offset, data.len() as vk::DeviceSize, vk::MemoryMapFlags::empty())
                .map_err(HalError::Vulkan)?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.cast::<u8>(), data.len());
            device.unmap_memory(self.memory);
        }
        Ok(())
    }

    /// Destroy the buffer and free its memory
    pub fn destroy(&self, device: &Device) {
        unsafe {
            device.destroy_buffer(self.buffer, None);
            device.free_memory(self.memory, None);
        }
    }
}

/// Shape of a texture and how its subresources are indexed
#[derive(Debug, Clone, Copy)]
pub struct TextureInfo {
    /// Native format
    pub format: vk::Format,
    /// Aspect used for views and copies
    pub aspect: vk::ImageAspectFlags,
    /// Width of mip 0
    pub width: u32,
    /// Height of mip 0
    pub height: u32,
    /// Mip levels per layer
    pub mip_levels: u32,
    /// Array layers
    pub array_layers: u32,
    /// Bytes per texel
    pub texel_size: u32,
}

impl TextureInfo {
    /// Shape described by `desc`
    pub fn from_desc(desc: &ResourceDesc) -> HalResult<Self> {
        let aspect = if desc.format.is_depth() {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        };
        Ok(Self {
            format: vk_format(desc.format)?,
            aspect,
            width: desc.width.max(1),
            height: desc.height.max(1),
            mip_levels: desc.mip_levels.max(1),
            array_layers: desc.array_size.max(1),
            texel_size: desc.format.bytes_per_pixel(),
        })
    }

    /// Mip level and array layer of a subresource index
    pub const fn split(&self, subresource: u32) -> (u32, u32) {
        (subresource % self.mip_levels, subresource / self.mip_levels)
    }

    /// Size of a mip level
    pub fn mip_extent(&self, mip: u32) -> vk::Extent3D {
        vk::Extent3D {
            width: (self.width >> mip).max(1),
            height: (self.height >> mip).max(1),
            depth: 1,
        }
    }

    /// Layers addressed by one subresource
    pub fn layers(&self, subresource: u32) -> vk::ImageSubresourceLayers {
        let (mip, layer) = self.split(subresource);
        vk::ImageSubresourceLayers {
            aspect_mask: self.aspect,
            mip_level: mip,
            base_array_layer: layer,
            layer_count: 1,
        }
    }

    /// Bytes per row of a mip level in the packed layout
    pub fn row_pitch(&self, mip: u32) -> u64 {
        u64::from(self.mip_extent(mip).width) * u64::from(self.texel_size)
    }

    /// Byte offset and length of a subresource in the packed layout
    pub fn packed_range(&self, subresource: u32) -> HalResult<(u64, u64)> {
        if subresource >= self.mip_levels * self.array_layers {
            return Err(HalError::invalid(format!("subresource {subresource} is out of range")));
        }
        let level_size = |mip: u32| self.row_pitch(mip) * u64::from(self.mip_extent(mip).height);
        let layer_size: u64 = (0..self.mip_levels).map(level_size).sum();
        let (mip, layer) = self.split(subresource);
        let offset = u64::from(layer) * layer_size + (0..mip).map(level_size).sum::<u64>();
        Ok((offset, level_size(mip)))
    }

    /// Total bytes in the packed layout
    pub fn packed_size(&self) -> u64 {
        let layer_size: u64 = (0..self.mip_levels)
            .map(|mip| self.row_pitch(mip) * u64::from(self.mip_extent(mip).height))
            .sum();
        layer_size * u64::from(self.array_layers)
    }
}

/// Device-local optimal-tiling image
#[derive(Debug, Clone, Copy)]
pub struct ImageAllocation {
    /// Image handle
    pub image: vk::Image,
    /// Backing memory
    pub memory: vk::DeviceMemory,
    /// Shape
    pub info: TextureInfo,
}

impl ImageAllocation {
    /// Create an image and bind device-local memory to it
    pub fn new(
        device: &Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        info: TextureInfo,
        usage: vk::ImageUsageFlags,
    ) -> HalResult<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(info.format)
            .extent(info.mip_extent(0))
            .mip_levels(info.mip_levels)
            .array_layers(info.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { device.create_image(&image_info, None).map_err(HalError::Vulkan)? };

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let memory = match allocate(device, memory_properties, requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { device.destroy_image(image, None) };
                return Err(err);
            }
        };

        unsafe {
            device.bind_image_memory(image, memory, 0).map_err(HalError::Vulkan)?;
        }

        Ok(Self { image, memory, info })
    }

    /// Create a view over every mip level and layer
    pub fn create_view(&self, device: &Device) -> HalResult<vk::ImageView> {
        let view_type = if self.info.array_layers > 1 {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        };
        let view_info = vk::ImageViewCreateInfo::builder()
            .image(self.image)
            .view_type(view_type)
            .format(self.info.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: self.info.aspect,
                base_mip_level: 0,
                level_count: self.info.mip_levels,
                base_array_layer: 0,
                layer_count: self.info.array_layers,
            });

        unsafe { device.create_image_view(&view_info, None).map_err(HalError::Vulkan) }
    }

    /// Destroy the image and free its memory
    pub fn destroy(&self, device: &Device) {
        unsafe {
            device.destroy_image(self.image, None);
            device.free_memory(self.memory, None);
        }
    }
}

fn allocate(
    device: &Device,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    requirements: vk::MemoryRequirements,
    properties: vk::MemoryPropertyFlags,
) -> HalResult<vk::DeviceMemory> {
    let memory_type_index = find_memory_type(memory_properties, requirements.memory_type_bits, properties)?;

    let alloc_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);

    unsafe { device.allocate_memory(&alloc_info, None).map_err(HalError::Vulkan) }
}

/// Whether the CPU may map the resource
pub fn is_host_accessible(desc: &ResourceDesc) -> bool {
    desc.flags.intersects(ResourceFlags::CPU_READ | ResourceFlags::CPU_WRITE)
}

/// Buffer usage for a resource description
pub fn buffer_usage(desc: &ResourceDesc) -> vk::BufferUsageFlags {
    let mut usage = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
    usage |= match desc.kind {
        ResourceKind::VertexBuffer => vk::BufferUsageFlags::VERTEX_BUFFER,
        ResourceKind::IndexBuffer => vk::BufferUsageFlags::INDEX_BUFFER,
        ResourceKind::ConstantBuffer => vk::BufferUsageFlags::UNIFORM_BUFFER,
        _ => vk::BufferUsageFlags::empty(),
    };
    if desc.flags.intersects(ResourceFlags::GPU_READ | ResourceFlags::UNORDERED_ACCESS)
        || desc.kind == ResourceKind::StructuredBuffer
    {
        usage |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    usage
}

/// Image usage for a resource description
pub fn image_usage(desc: &ResourceDesc) -> vk::ImageUsageFlags {
    let mut usage =
        vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED;
    match desc.kind {
        ResourceKind::Surface => usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT,
        ResourceKind::DepthSurface => usage |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        _ => {}
    }
    if desc.flags.contains(ResourceFlags::UNORDERED_ACCESS) {
        usage |= vk::ImageUsageFlags::STORAGE;
    }
    usage
}

/// Native format of a texel format
pub fn vk_format(format: Format) -> HalResult<vk::Format> {
    Ok(match format {
        Format::Unknown => return Err(HalError::Unsupported("textures need a texel format".to_string())),
        Format::R8Unorm => vk::Format::R8_UNORM,
        Format::R8G8B8A8Unorm => vk::Format::R8G8B8A8_UNORM,
        Format::B8G8R8A8Unorm => vk::Format::B8G8R8A8_UNORM,
        Format::R16G16B16A16Float => vk::Format::R16G16B16A16_SFLOAT,
        Format::R32Float => vk::Format::R32_SFLOAT,
        Format::R32G32B32A32Float => vk::Format::R32G32B32A32_SFLOAT,
        Format::D24UnormS8Uint => vk::Format::D24_UNORM_S8_UINT,
        Format::D32Float => vk::Format::D32_SFLOAT,
    })
}

/// Sampler creation parameters for a sampler description
pub fn sampler_info(desc: &SamplerDesc, anisotropy_supported: bool) -> vk::SamplerCreateInfo {
    let filter = match desc.filter {
        Filter::Point => vk::Filter::NEAREST,
        Filter::Linear | Filter::Anisotropic => vk::Filter::LINEAR,
    };
    let mipmap_mode = match desc.filter {
        Filter::Point => vk::SamplerMipmapMode::NEAREST,
        Filter::Linear | Filter::Anisotropic => vk::SamplerMipmapMode::LINEAR,
    };
    let anisotropy = desc.filter == Filter::Anisotropic && anisotropy_supported;

    vk::SamplerCreateInfo::builder()
        .mag_filter(filter)
        .min_filter(filter)
        .mipmap_mode(mipmap_mode)
        .address_mode_u(address_mode(desc.address_u))
        .address_mode_v(address_mode(desc.address_v))
        .address_mode_w(address_mode(desc.address_w))
        .anisotropy_enable(anisotropy)
        .max_anisotropy(desc.max_anisotropy.max(1) as f32)
        .compare_enable(desc.comparison.is_some())
        .compare_op(desc.comparison.map_or(vk::CompareOp::ALWAYS, compare_op))
        .min_lod(0.0)
        .max_lod(vk::LOD_CLAMP_NONE)
        .border_color(vk::BorderColor::FLOAT_TRANSPARENT_BLACK)
        .build()
}

const fn address_mode(mode: AddressMode) -> vk::SamplerAddressMode {
    match mode {
        AddressMode::Wrap => vk::SamplerAddressMode::REPEAT,
        AddressMode::Mirror => vk::SamplerAddressMode::MIRRORED_REPEAT,
        AddressMode::Clamp => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        AddressMode::Border => vk::SamplerAddressMode::CLAMP_TO_BORDER,
    }
}

/// Native comparison operator
pub const fn compare_op(func: ComparisonFunc) -> vk::CompareOp {
    match func {
        ComparisonFunc::Never => vk::CompareOp::NEVER,
        ComparisonFunc::Less => vk::CompareOp::LESS,
        ComparisonFunc::Equal => vk::CompareOp::EQUAL,
        ComparisonFunc::LessEqual => vk::CompareOp::LESS_OR_EQUAL,
        ComparisonFunc::Greater => vk::CompareOp::GREATER,
        ComparisonFunc::NotEqual => vk::CompareOp::NOT_EQUAL,
        ComparisonFunc::GreaterEqual => vk::CompareOp::GREATER_OR_EQUAL,
        ComparisonFunc::Always => vk::CompareOp::ALWAYS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texture_info(mips: u32, layers: u32) -> TextureInfo {
        TextureInfo {
            format: vk::Format::R8G8B8A8_UNORM,
            aspect: vk::ImageAspectFlags::COLOR,
            width: 8,
            height: 4,
            mip_levels: mips,
            array_layers: layers,
            texel_size: 4,
        }
    }

    #[test]
    fn test_packed_layout_is_layer_major() {
        let info = texture_info(2, 2);
        // mip 0: 8x4x4 = 128 bytes, mip 1: 4x2x4 = 32 bytes
        assert_eq!(info.packed_range(0).unwrap(), (0, 128));
        assert_eq!(info.packed_range(1).unwrap(), (128, 32));
        assert_eq!(info.packed_range(2).unwrap(), (160, 128));
        assert_eq!(info.packed_size(), 320);
        assert!(info.packed_range(4).is_err());
    }

    #[test]
    fn test_subresource_split() {
        let info = texture_info(3, 2);
        assert_eq!(info.split(4), (1, 1));
        let layers = info.layers(5);
        assert_eq!((layers.mip_level, layers.base_array_layer), (2, 1));
        assert_eq!(info.mip_extent(2).width, 2);
    }

    #[test]
    fn test_find_memory_type_respects_filter() {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = 2;
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        props.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

        let host = vk::MemoryPropertyFlags::HOST_VISIBLE;
        assert_eq!(find_memory_type(&props, 0b11, host).unwrap(), 1);
        assert!(find_memory_type(&props, 0b01, host).is_err());
    }

    #[test]
    fn test_buffer_usage_follows_kind() {
        let desc = ResourceDesc::constant_buffer(64);
        assert!(buffer_usage(&desc).contains(vk::BufferUsageFlags::UNIFORM_BUFFER));
        assert!(vk_format(Format::Unknown).is_err());
    }
}
