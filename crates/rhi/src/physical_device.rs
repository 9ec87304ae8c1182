//! Physical device (GPU) selection.
//!
//! This module handles GPU enumeration and selection based on queue
//! capabilities. Selection is headless: a device qualifies as soon as it
//! exposes a graphics-capable queue family, and discrete GPUs are
//! preferred over integrated ones.
//!
//! # Example
//!
//! ```no_run
//! use vkforge_rhi::instance::{Instance, InstanceConfig};
//! use vkforge_rhi::physical_device::select_physical_device;
//!
//! let instance = Instance::new(InstanceConfig::default()).expect("instance");
//! let info = select_physical_device(instance.handle()).expect("no suitable GPU");
//! println!("Selected GPU: {}", info.device_name());
//! ```

use std::ffi::CStr;

use ash::vk;
use tracing::{debug, info, warn};

use crate::error::RhiError;

/// Device limits the command core depends on.
///
/// Extracted once at selection time so downstream code never re-queries
/// `vk::PhysicalDeviceProperties`.
#[derive(Clone, Copy, Debug)]
pub struct DeviceLimits {
    /// Maximum total push constant size in bytes.
    pub max_push_constants_size: u32,
    /// Required offset alignment for uniform buffer bindings.
    pub min_uniform_buffer_offset_alignment: vk::DeviceSize,
    /// Required offset alignment for storage buffer bindings.
    pub min_storage_buffer_offset_alignment: vk::DeviceSize,
    /// Maximum number of bound descriptor sets.
    pub max_bound_descriptor_sets: u32,
    /// Nanoseconds per timestamp tick; 0.0 if timestamps are unsupported.
    pub timestamp_period: f32,
}

impl From<&vk::PhysicalDeviceLimits> for DeviceLimits {
    fn from(limits: &vk::PhysicalDeviceLimits) -> Self {
        Self {
            max_push_constants_size: limits.max_push_constants_size,
            min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment,
            min_storage_buffer_offset_alignment: limits.min_storage_buffer_offset_alignment,
            max_bound_descriptor_sets: limits.max_bound_descriptor_sets,
            timestamp_period: limits.timestamp_period,
        }
    }
}

/// Information about a physical device (GPU).
///
/// This struct contains all the information needed to create a logical
/// device and drive the command core.
#[derive(Clone)]
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle.
    pub device: vk::PhysicalDevice,
    /// Device properties (name, limits, API version, etc.).
    pub properties: vk::PhysicalDeviceProperties,
    /// Supported device features.
    pub features: vk::PhysicalDeviceFeatures,
    /// Memory properties (heap sizes, memory types).
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Properties of every queue family, indexed by family.
    pub queue_family_properties: Vec<vk::QueueFamilyProperties>,
    /// Limits the command core needs.
    pub limits: DeviceLimits,
}

impl PhysicalDeviceInfo {
    /// Returns the device name as a string.
    pub fn device_name(&self) -> &str {
        unsafe {
            CStr::from_ptr(self.properties.device_name.as_ptr())
                .to_str()
                .unwrap_or("Unknown")
        }
    }

    /// Returns the device type.
    #[inline]
    pub fn device_type(&self) -> vk::PhysicalDeviceType {
        self.properties.device_type
    }

    /// Returns a human-readable device type name.
    pub fn device_type_name(&self) -> &'static str {
        match self.properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => "Discrete GPU",
            vk::PhysicalDeviceType::INTEGRATED_GPU => "Integrated GPU",
            vk::PhysicalDeviceType::VIRTUAL_GPU => "Virtual GPU",
            vk::PhysicalDeviceType::CPU => "CPU",
            _ => "Other",
        }
    }

    /// Returns the supported API version as (major, minor, patch).
    pub fn api_version(&self) -> (u32, u32, u32) {
        let version = self.properties.api_version;
        (
            vk::api_version_major(version),
            vk::api_version_minor(version),
            vk::api_version_patch(version),
        )
    }

    /// Finds the first queue family supporting all of `flags`.
    ///
    /// Families are scanned in index order, which on most drivers puts
    /// the general graphics+compute family first.
    pub fn find_queue_family(&self, flags: vk::QueueFlags) -> Option<u32> {
        self.queue_family_properties
            .iter()
            .position(|props| props.queue_flags.contains(flags))
            .map(|index| index as u32)
    }

    /// Returns every queue family index, deduplicated, that the device
    /// should create a queue for: one per distinct family so any
    /// capability combination can be served later.
    pub fn unique_queue_families(&self) -> Vec<u32> {
        (0..self.queue_family_properties.len() as u32).collect()
    }
}

impl std::fmt::Debug for PhysicalDeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (major, minor, patch) = self.api_version();
        f.debug_struct("PhysicalDeviceInfo")
            .field("name", &self.device_name())
            .field("type", &self.device_type_name())
            .field("api_version", &format!("{}.{}.{}", major, minor, patch))
            .field("queue_families", &self.queue_family_properties.len())
            .finish()
    }
}

/// Selects the most suitable physical device.
///
/// This function enumerates all available GPUs and selects one based on:
/// 1. Graphics queue support (required)
/// 2. Device type preference (discrete GPU preferred)
/// 3. Device-local memory size as a tie breaker
///
/// # Errors
///
/// Returns [`RhiError::NoSuitableGpu`] if no suitable GPU is found.
pub fn select_physical_device(instance: &ash::Instance) -> Result<PhysicalDeviceInfo, RhiError> {
    let devices = unsafe { instance.enumerate_physical_devices()? };

    if devices.is_empty() {
        warn!("No Vulkan-capable GPUs found");
        return Err(RhiError::NoSuitableGpu);
    }

    info!("Found {} GPU(s)", devices.len());

    let mut suitable: Vec<(PhysicalDeviceInfo, u64)> = Vec::new();

    for device in devices {
        let info = query_device_info(instance, device);

        if info.find_queue_family(vk::QueueFlags::GRAPHICS).is_none() {
            debug!("GPU '{}' rejected: no graphics queue", info.device_name());
            continue;
        }

        let score = rate_device(&info);
        debug!(
            "GPU '{}' ({}) - Score: {}",
            info.device_name(),
            info.device_type_name(),
            score
        );
        suitable.push((info, score));
    }

    if suitable.is_empty() {
        warn!("No suitable GPU found with required capabilities");
        return Err(RhiError::NoSuitableGpu);
    }

    suitable.sort_by(|a, b| b.1.cmp(&a.1));
    let (selected, score) = suitable.remove(0);

    let (major, minor, patch) = selected.api_version();
    info!(
        "Selected GPU: '{}' ({}) - Vulkan {}.{}.{}, Score: {}",
        selected.device_name(),
        selected.device_type_name(),
        major,
        minor,
        patch,
        score
    );

    Ok(selected)
}

/// Gathers everything we need to know about one physical device.
fn query_device_info(instance: &ash::Instance, device: vk::PhysicalDevice) -> PhysicalDeviceInfo {
    let properties = unsafe { instance.get_physical_device_properties(device) };
    let features = unsafe { instance.get_physical_device_features(device) };
    let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };
    let queue_family_properties =
        unsafe { instance.get_physical_device_queue_family_properties(device) };

    let limits = DeviceLimits::from(&properties.limits);

    PhysicalDeviceInfo {
        device,
        properties,
        features,
        memory_properties,
        queue_family_properties,
        limits,
    }
}

/// Scores a device: device type dominates, device-local memory breaks ties.
fn rate_device(info: &PhysicalDeviceInfo) -> u64 {
    let type_score: u64 = match info.device_type() {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1 << 40,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 1 << 39,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 1 << 38,
        _ => 0,
    };

    let local_memory: u64 = info
        .memory_properties
        .memory_heaps
        .iter()
        .take(info.memory_properties.memory_heap_count as usize)
        .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|heap| heap.size)
        .sum();

    type_score + (local_memory >> 20)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_with(
        device_type: vk::PhysicalDeviceType,
        families: Vec<vk::QueueFamilyProperties>,
    ) -> PhysicalDeviceInfo {
        let properties = vk::PhysicalDeviceProperties {
            device_type,
            ..Default::default()
        };
        PhysicalDeviceInfo {
            device: vk::PhysicalDevice::null(),
            limits: DeviceLimits::from(&properties.limits),
            properties,
            features: Default::default(),
            memory_properties: Default::default(),
            queue_family_properties: families,
        }
    }

    #[test]
    fn test_find_queue_family_by_capability() {
        let families = vec![
            vk::QueueFamilyProperties {
                queue_flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
                queue_count: 1,
                ..Default::default()
            },
            vk::QueueFamilyProperties {
                queue_flags: vk::QueueFlags::TRANSFER,
                queue_count: 2,
                ..Default::default()
            },
        ];
        let info = info_with(vk::PhysicalDeviceType::DISCRETE_GPU, families);

        assert_eq!(info.find_queue_family(vk::QueueFlags::GRAPHICS), Some(0));
        assert_eq!(info.find_queue_family(vk::QueueFlags::TRANSFER), Some(1));
        assert_eq!(
            info.find_queue_family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            Some(0)
        );
        assert_eq!(
            info.find_queue_family(vk::QueueFlags::SPARSE_BINDING),
            None
        );
    }

    #[test]
    fn test_discrete_outranks_integrated() {
        let discrete = info_with(vk::PhysicalDeviceType::DISCRETE_GPU, vec![]);
        let integrated = info_with(vk::PhysicalDeviceType::INTEGRATED_GPU, vec![]);
        assert!(rate_device(&discrete) > rate_device(&integrated));
    }
}
