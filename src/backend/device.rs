// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Debug messenger forwarding validation output to `log`
// - Physical device selection (graphics + present support, prefer discrete GPU)
// - Logical device + queue creation

use anyhow::{Context, Result};
use ash::extensions::{ext::DebugUtils, khr::Surface};
use ash::{vk, Entry};
use raw_window_handle::RawDisplayHandle;
use std::collections::BTreeSet;
use std::ffi::{c_char, CStr, CString};

pub const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Device extensions every candidate GPU must support
pub fn required_device_extensions() -> [&'static CStr; 1] {
    [ash::extensions::khr::Swapchain::name()]
}

// =============================================================================
// INSTANCE
// =============================================================================

pub fn create_instance(
    entry: &Entry,
    app_name: &str,
    display_handle: RawDisplayHandle,
    enable_validation: bool,
) -> Result<ash::Instance> {
    log_available_extensions(entry);

    if enable_validation && !check_validation_layer_support(entry)? {
        anyhow::bail!("validation layers requested, but not available");
    }

    let app_name_cstr = CString::new(app_name)?;
    let engine_name = c"No Engine";

    let app_info = vk::ApplicationInfo::builder()
        .application_name(&app_name_cstr)
        .application_version(vk::make_api_version(0, 1, 0, 0))
        .engine_name(engine_name)
        .engine_version(vk::make_api_version(0, 1, 0, 0))
        .api_version(vk::API_VERSION_1_0);

    let extensions = required_instance_extensions(display_handle, enable_validation)?;
    for &name in &extensions {
        log::debug!("Required instance extension: {}", unsafe {
            CStr::from_ptr(name).to_string_lossy()
        });
    }

    let layer_names = if enable_validation {
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        vec![]
    };

    // Chained so that instance creation and destruction are reported as well
    let mut debug_info = DebugMessenger::create_info().build();

    let mut create_info = vk::InstanceCreateInfo::builder()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layer_names);
    if enable_validation {
        create_info = create_info.push_next(&mut debug_info);
    }

    let instance = unsafe { entry.create_instance(&create_info, None) }
        .context("Failed to create Vulkan instance")?;

    Ok(instance)
}

/// Surface extensions for this window system, plus debug utils when validating
fn required_instance_extensions(
    display_handle: RawDisplayHandle,
    enable_validation: bool,
) -> Result<Vec<*const c_char>> {
    let mut extensions = ash_window::enumerate_required_extensions(display_handle)
        .context("Failed to query required surface extensions")?
        .to_vec();

    if enable_validation {
        extensions.push(DebugUtils::name().as_ptr());
    }

    Ok(extensions)
}

fn log_available_extensions(entry: &Entry) {
    match entry.enumerate_instance_extension_properties(None) {
        Ok(extensions) => {
            log::debug!("Available instance extensions:");
            for ext in &extensions {
                let name = unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) };
                log::debug!("\t{}", name.to_string_lossy());
            }
        }
        Err(e) => log::warn!("Could not enumerate instance extensions: {}", e),
    }
}

fn check_validation_layer_support(entry: &Entry) -> Result<bool> {
    let available = entry
        .enumerate_instance_layer_properties()
        .context("Failed to enumerate instance layers")?;

    let names: Vec<&CStr> = available
        .iter()
        .map(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) })
        .collect();

    let missing = missing_names(&[VALIDATION_LAYER], &names);
    for name in &missing {
        log::warn!("Missing layer: {}", name.to_string_lossy());
    }

    Ok(missing.is_empty())
}

/// Entries of `required` that do not appear in `available`
pub fn missing_names<'a>(required: &[&'a CStr], available: &[&CStr]) -> Vec<&'a CStr> {
    required
        .iter()
        .copied()
        .filter(|name| !available.contains(name))
        .collect()
}

// =============================================================================
// DEBUG MESSENGER
// =============================================================================

pub struct DebugMessenger {
    loader: DebugUtils,
    messenger: vk::DebugUtilsMessengerEXT,
}

impl DebugMessenger {
    pub fn new(entry: &Entry, instance: &ash::Instance) -> Result<Self> {
        let loader = DebugUtils::new(entry, instance);
        let create_info = Self::create_info();

        let messenger = unsafe { loader.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to set up debug messenger")?;

        Ok(Self { loader, messenger })
    }

    fn create_info<'a>() -> vk::DebugUtilsMessengerCreateInfoEXTBuilder<'a> {
        vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback))
    }

    pub fn destroy(&self) {
        unsafe {
            self.loader
                .destroy_debug_utils_messenger(self.messenger, None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message).to_string_lossy();

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan {:?}] {}", message_type, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan {:?}] {}", message_type, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            log::debug!("[Vulkan {:?}] {}", message_type, message);
        }
        _ => {
            log::trace!("[Vulkan {:?}] {}", message_type, message);
        }
    }

    vk::FALSE
}

// =============================================================================
// PHYSICAL DEVICE
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
}

impl QueueFamilyIndices {
    /// First graphics-capable family and first family that can present.
    ///
    /// A family that does both is preferred for presenting so the swap chain
    /// can stay in exclusive mode.
    pub fn find(
        families: &[vk::QueueFamilyProperties],
        mut supports_present: impl FnMut(u32) -> Result<bool>,
    ) -> Result<Self> {
        let mut indices = Self::default();

        for (i, family) in families.iter().enumerate() {
            let i = i as u32;
            let graphics = family.queue_count > 0
                && family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
            let present = supports_present(i)?;

            if graphics && indices.graphics.is_none() {
                indices.graphics = Some(i);
            }
            if present && (indices.present.is_none() || (graphics && indices.graphics == Some(i))) {
                indices.present = Some(i);
            }
        }

        Ok(indices)
    }

    pub fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some()
    }

    /// Distinct families, sorted
    pub fn unique(&self) -> Vec<u32> {
        self.graphics
            .into_iter()
            .chain(self.present)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn graphics_family(&self) -> Result<u32> {
        self.graphics.context("No graphics queue family")
    }

    pub fn present_family(&self) -> Result<u32> {
        self.present.context("No present queue family")
    }
}

/// Preference among suitable devices (higher wins)
pub fn rate_device_type(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 10,
        _ => 1,
    }
}

/// The GPU we render with, plus what we learned about it during selection
pub struct PhysicalDevice {
    pub handle: vk::PhysicalDevice,
    pub queue_families: QueueFamilyIndices,
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl PhysicalDevice {
    pub fn name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }
}

pub fn pick_physical_device(
    instance: &ash::Instance,
    surface_loader: &Surface,
    surface: vk::SurfaceKHR,
) -> Result<PhysicalDevice> {
    let devices = unsafe { instance.enumerate_physical_devices() }
        .context("Failed to enumerate physical devices")?;

    if devices.is_empty() {
        anyhow::bail!("failed to find GPUs with Vulkan support");
    }

    let mut best: Option<(u32, vk::PhysicalDevice, QueueFamilyIndices)> = None;

    for device in devices {
        let Some(indices) = check_device_suitable(instance, surface_loader, surface, device)? else {
            continue;
        };

        let props = unsafe { instance.get_physical_device_properties(device) };
        let score = rate_device_type(props.device_type);
        if best.map_or(true, |(best_score, _, _)| score > best_score) {
            best = Some((score, device, indices));
        }
    }

    let (_, handle, queue_families) = best.context("failed to find a suitable GPU")?;

    let properties = unsafe { instance.get_physical_device_properties(handle) };
    let memory_properties = unsafe { instance.get_physical_device_memory_properties(handle) };

    let device = PhysicalDevice {
        handle,
        queue_families,
        properties,
        memory_properties,
    };

    log::info!("Selected GPU: {}", device.name());
    log::info!(
        "API Version: {}.{}.{}",
        vk::api_version_major(properties.api_version),
        vk::api_version_minor(properties.api_version),
        vk::api_version_patch(properties.api_version)
    );

    Ok(device)
}

/// Queue families of `device` if it can drive our swap chain, `None` otherwise
fn check_device_suitable(
    instance: &ash::Instance,
    surface_loader: &Surface,
    surface: vk::SurfaceKHR,
    device: vk::PhysicalDevice,
) -> Result<Option<QueueFamilyIndices>> {
    let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
    let indices = QueueFamilyIndices::find(&families, |i| unsafe {
        surface_loader
            .get_physical_device_surface_support(device, i, surface)
            .context("Failed to query surface support")
    })?;

    if !indices.is_complete() {
        return Ok(None);
    }

    let available = unsafe { instance.enumerate_device_extension_properties(device) }
        .context("Failed to enumerate device extensions")?;
    let names: Vec<&CStr> = available
        .iter()
        .map(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) })
        .collect();
    if !missing_names(&required_device_extensions(), &names).is_empty() {
        return Ok(None);
    }

    let support = super::swapchain::SwapchainSupport::query(surface_loader, device, surface)?;
    if !support.is_adequate() {
        return Ok(None);
    }

    Ok(Some(indices))
}

// =============================================================================
// LOGICAL DEVICE
// =============================================================================

pub struct LogicalDevice {
    pub device: ash::Device,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
}

impl LogicalDevice {
    pub fn new(
        instance: &ash::Instance,
        physical: &PhysicalDevice,
        enable_validation: bool,
    ) -> Result<Self> {
        let indices = physical.queue_families;
        let queue_priorities = [1.0];

        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = indices
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extensions: Vec<*const c_char> = required_device_extensions()
            .iter()
            .map(|name| name.as_ptr())
            .collect();

        // Device layers are deprecated but older implementations still read them
        let layer_names = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let features = vk::PhysicalDeviceFeatures::default();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(physical.handle, &create_info, None) }
            .context("Failed to create logical device")?;

        let graphics_queue = unsafe { device.get_device_queue(indices.graphics_family()?, 0) };
        let present_queue = unsafe { device.get_device_queue(indices.present_family()?, 0) };

        Ok(Self {
            device,
            graphics_queue,
            present_queue,
        })
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("Failed to wait for device idle")?;
        Ok(())
    }

    pub fn destroy(&self) {
        unsafe {
            self.device.destroy_device(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn finds_shared_graphics_and_present_family() {
        let families = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
        ];
        let indices = QueueFamilyIndices::find(&families, |_| Ok(true)).unwrap();

        assert_eq!(indices.graphics, Some(1));
        assert_eq!(indices.present, Some(1));
        assert_eq!(indices.unique(), vec![1]);
    }

    #[test]
    fn finds_separate_present_family() {
        let families = [family(vk::QueueFlags::GRAPHICS), family(vk::QueueFlags::TRANSFER)];
        let indices = QueueFamilyIndices::find(&families, |i| Ok(i == 1)).unwrap();

        assert!(indices.is_complete());
        assert_eq!(indices.unique(), vec![0, 1]);
    }

    #[test]
    fn incomplete_without_present_support() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        let indices = QueueFamilyIndices::find(&families, |_| Ok(false)).unwrap();

        assert!(!indices.is_complete());
        assert!(indices.present_family().is_err());
    }

    #[test]
    fn empty_queue_families_are_ignored() {
        let mut empty = family(vk::QueueFlags::GRAPHICS);
        empty.queue_count = 0;
        let indices = QueueFamilyIndices::find(&[empty], |_| Ok(true)).unwrap();

        assert_eq!(indices.graphics, None);
    }

    #[test]
    fn present_query_errors_propagate() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        let result = QueueFamilyIndices::find(&families, |_| anyhow::bail!("lost surface"));
        assert!(result.is_err());
    }

    #[test]
    fn discrete_gpus_rank_highest() {
        let discrete = rate_device_type(vk::PhysicalDeviceType::DISCRETE_GPU);
        let integrated = rate_device_type(vk::PhysicalDeviceType::INTEGRATED_GPU);
        let virt = rate_device_type(vk::PhysicalDeviceType::VIRTUAL_GPU);
        let cpu = rate_device_type(vk::PhysicalDeviceType::CPU);

        assert!(discrete > integrated && integrated > virt && virt > cpu);
    }

    #[test]
    fn reports_missing_names() {
        let available = [c"VK_LAYER_LUNARG_monitor", VALIDATION_LAYER];
        assert!(missing_names(&[VALIDATION_LAYER], &available).is_empty());

        let missing = missing_names(&required_device_extensions(), &available);
        assert_eq!(missing, vec![c"VK_KHR_swapchain"]);
    }
}
