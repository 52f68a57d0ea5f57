//! Instance, physical-device selection and logical-device creation
//!
//! The HAL renders off-screen, so no surface or swapchain extension is
//! requested. Devices must expose Vulkan 1.3 (dynamic rendering and
//! extended dynamic state) and `VK_KHR_push_descriptor`.

use std::ffi::{c_void, CStr, CString};
use std::sync::Mutex;

use ash::extensions::ext::DebugUtils;
use ash::extensions::khr::PushDescriptor;
use ash::{vk, Device, Entry, Instance};

use crate::backend::{DebugMessage, DebugSeverity};
use crate::foundation::sync::lock;
use crate::{HalError, HalResult};

/// Messages collected by the debug messenger until a context drains them
pub type DebugSink = Mutex<Vec<DebugMessage>>;

/// Vulkan instance with optional validation messenger
pub struct VulkanInstance {
    /// Loader entry points
    pub entry: Entry,
    /// Instance handle
    pub instance: Instance,
    /// Debug-utils loader, present when the debug layer is enabled
    pub debug_utils: Option<DebugUtils>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
    // Boxed so the messenger's user-data pointer stays valid.
    sink: Box<DebugSink>,
}

impl VulkanInstance {
    /// Load Vulkan and create an instance
    pub fn new(app_name: &str, enable_validation: bool) -> HalResult<Self> {
        let entry = unsafe { Entry::load() }
            .map_err(|e| HalError::Initialization(format!("Failed to load Vulkan: {e:?}")))?;

        let app_name_cstr = CString::new(app_name)
            .map_err(|_| HalError::Initialization(format!("Application name contains a NUL byte: {app_name:?}")))?;
        let engine_name_cstr = CString::new("graphics_hal").map_err(|e| HalError::Initialization(e.to_string()))?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&engine_name_cstr)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_3);

        let mut extensions: Vec<*const i8> = Vec::new();
        let mut layer_names: Vec<CString> = Vec::new();
        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
            layer_names.push(
                CString::new("VK_LAYER_KHRONOS_validation").map_err(|e| HalError::Initialization(e.to_string()))?,
            );
        }
        let layer_names_ptrs: Vec<*const i8> = layer_names.iter().map(|name| name.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names_ptrs);

        let instance = unsafe { entry.create_instance(&create_info, None).map_err(HalError::Vulkan)? };

        let sink: Box<DebugSink> = Box::default();
        let (debug_utils, debug_messenger) = if enable_validation {
            let debug_utils = DebugUtils::new(&entry, &instance);
            match Self::setup_debug_messenger(&debug_utils, &sink) {
                Ok(messenger) => (Some(debug_utils), Some(messenger)),
                Err(err) => {
                    log::warn!("Vulkan debug messenger unavailable: {err}");
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        Ok(Self { entry, instance, debug_utils, debug_messenger, sink })
    }

    fn setup_debug_messenger(debug_utils: &DebugUtils, sink: &DebugSink) -> HalResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback))
            .user_data((sink as *const DebugSink).cast_mut().cast::<c_void>());

        unsafe { debug_utils.create_debug_utils_messenger(&create_info, None).map_err(HalError::Vulkan) }
    }

    /// Take every message collected since the last drain
    pub fn drain_messages(&self) -> Vec<DebugMessage> {
        std::mem::take(&mut *lock(&self.sink))
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let (Some(debug_utils), Some(debug_messenger)) = (&self.debug_utils, self.debug_messenger) {
                debug_utils.destroy_debug_utils_messenger(debug_messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    user_data: *mut c_void,
) -> vk::Bool32 {
    if callback_data.is_null() || user_data.is_null() {
        return vk::FALSE;
    }
    let callback_data = *callback_data;
    if callback_data.p_message.is_null() {
        return vk::FALSE;
    }
    let text = CStr::from_ptr(callback_data.p_message).to_string_lossy().into_owned();

    let severity = if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        DebugSeverity::Error
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        DebugSeverity::Warning
    } else {
        DebugSeverity::Info
    };

    let sink = &*user_data.cast::<DebugSink>();
    lock(sink).push(DebugMessage { severity, text });
    vk::FALSE
}

/// Selected GPU and its queue family
pub struct PhysicalDeviceInfo {
    /// Physical device handle
    pub device: vk::PhysicalDevice,
    /// Properties and limits
    pub properties: vk::PhysicalDeviceProperties,
    /// Supported core features
    pub features: vk::PhysicalDeviceFeatures,
    /// Memory heaps and types
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Family supporting graphics, compute and transfer
    pub queue_family: u32,
}

impl PhysicalDeviceInfo {
    /// Pick the first suitable device, preferring discrete GPUs
    pub fn select(instance: &Instance) -> HalResult<Self> {
        let devices = unsafe { instance.enumerate_physical_devices().map_err(HalError::Vulkan)? };

        let mut candidates: Vec<Self> = devices
            .into_iter()
            .filter_map(|device| match Self::evaluate_device(instance, device) {
                Ok(info) => Some(info),
                Err(err) => {
                    log::debug!("Skipping physical device: {err}");
                    None
                }
            })
            .collect();
        candidates.sort_by_key(|info| info.properties.device_type != vk::PhysicalDeviceType::DISCRETE_GPU);

        let selected = candidates
            .into_iter()
            .next()
            .ok_or_else(|| HalError::Initialization("No suitable GPU found".to_string()))?;
        log::info!("Selected GPU: {}", selected.name());
        Ok(selected)
    }

    fn evaluate_device(instance: &Instance, device: vk::PhysicalDevice) -> HalResult<Self> {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let features = unsafe { instance.get_physical_device_features(device) };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };
        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };

        if properties.api_version < vk::API_VERSION_1_3 {
            return Err(HalError::Unsupported("Vulkan 1.3 is required".to_string()));
        }

        let wanted = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;
        let queue_family = queue_families
            .iter()
            .position(|family| family.queue_flags.contains(wanted))
            .ok_or_else(|| HalError::Unsupported("No graphics and compute queue family found".to_string()))?;

        let extensions = unsafe { instance.enumerate_device_extension_properties(device).map_err(HalError::Vulkan)? };
        let has_push_descriptor = extensions.iter().any(|available| {
            let extension_name = unsafe { CStr::from_ptr(available.extension_name.as_ptr()) };
            extension_name == PushDescriptor::name()
        });
        if !has_push_descriptor {
            return Err(HalError::Unsupported("VK_KHR_push_descriptor is not supported".to_string()));
        }

        Ok(Self {
            device,
            properties,
            features,
            memory_properties,
            queue_family: queue_family as u32,
        })
    }

    /// Device name reported by the driver
    pub fn name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }
}

/// Create the logical device and fetch its queue
pub fn create_logical_device(instance: &Instance, physical: &PhysicalDeviceInfo) -> HalResult<(Device, vk::Queue)> {
    let priorities = [1.0];
    let queue_infos = [vk::DeviceQueueCreateInfo::builder()
        .queue_family_index(physical.queue_family)
        .queue_priorities(&priorities)
        .build()];

    let required_extensions = [PushDescriptor::name().as_ptr()];
    let device_features = vk::PhysicalDeviceFeatures::builder()
        .sampler_anisotropy(physical.features.sampler_anisotropy == vk::TRUE)
        .multi_viewport(physical.features.multi_viewport == vk::TRUE)
        .build();
    let mut vulkan13_features = vk::PhysicalDeviceVulkan13Features::builder().dynamic_rendering(true);

    let create_info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(&queue_infos)
        .enabled_extension_names(&required_extensions)
        .enabled_features(&device_features)
        .push_next(&mut vulkan13_features);

    let device = unsafe {
        instance
            .create_device(physical.device, &create_info, None)
            .map_err(HalError::Vulkan)?
    };
    let queue = unsafe { device.get_device_queue(physical.queue_family, 0) };
    Ok((device, queue))
}
