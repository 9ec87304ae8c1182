//! Vulkan logical device and queue management.
//!
//! This module handles VkDevice creation, queue retrieval, and
//! gpu-allocator initialization.
//!
//! # Overview
//!
//! The [`Device`] struct provides a safe abstraction over the Vulkan
//! logical device, including:
//! - Logical device creation with one queue per queue family
//! - Queue lookup by capability flags
//! - Memory allocation via gpu-allocator
//!
//! # Example
//!
//! ```no_run
//! use vkforge_rhi::instance::{Instance, InstanceConfig};
//! use vkforge_rhi::physical_device::select_physical_device;
//! use vkforge_rhi::device::Device;
//! use ash::vk;
//!
//! let instance = Instance::new(InstanceConfig::default()).expect("instance");
//! let info = select_physical_device(instance.handle()).expect("no suitable GPU");
//! let device = Device::new(&instance, &info).expect("device");
//!
//! let graphics = device
//!     .queue_by_capability(vk::QueueFlags::GRAPHICS)
//!     .expect("graphics queue");
//! ```

use std::mem::ManuallyDrop;
use std::sync::{Arc, Mutex};

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use tracing::{debug, info};

use crate::error::{RhiError, RhiResult};
use crate::instance::Instance;
use crate::physical_device::{DeviceLimits, PhysicalDeviceInfo};
use crate::queue::Queue;

/// Vulkan logical device wrapper.
///
/// This struct manages the lifetime of the Vulkan logical device and its
/// associated resources including queues and the memory allocator.
///
/// # Thread Safety
///
/// The [`Device`] is designed to be shared across threads using `Arc`.
/// The internal allocator is protected by a `Mutex` for thread-safe
/// memory allocation.
pub struct Device {
    /// Vulkan logical device handle.
    device: ash::Device,
    /// Physical device handle.
    physical_device: vk::PhysicalDevice,
    /// GPU memory allocator (thread-safe via Mutex).
    ///
    /// ManuallyDrop so it can be torn down before the device is destroyed.
    allocator: ManuallyDrop<Mutex<Allocator>>,
    /// One queue per queue family, in family order.
    queues: Vec<Queue>,
    /// Device limits the command core depends on.
    limits: DeviceLimits,
}

impl Device {
    /// Creates a new logical device.
    ///
    /// One queue is created for every queue family the physical device
    /// exposes, so any later capability request can be served. The
    /// gpu-allocator is initialized against the new device.
    ///
    /// # Errors
    ///
    /// Returns an error if device creation or allocator initialization
    /// fails. Both are construction-time failures with no retry path.
    pub fn new(instance: &Instance, info: &PhysicalDeviceInfo) -> RhiResult<Arc<Self>> {
        let families = info.unique_queue_families();
        let queue_priorities = [1.0f32];

        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
            })
            .collect();

        debug!(
            "Creating {} queue(s) for families: {:?}",
            queue_create_infos.len(),
            families
        );

        // Only the base features the command core exercises.
        let features = vk::PhysicalDeviceFeatures::default()
            .fill_mode_non_solid(info.features.fill_mode_non_solid == vk::TRUE)
            .wide_lines(info.features.wide_lines == vk::TRUE)
            .multi_draw_indirect(info.features.multi_draw_indirect == vk::TRUE);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_features(&features);

        let device = unsafe {
            instance
                .handle()
                .create_device(info.device, &create_info, None)?
        };

        info!("Logical device created on '{}'", info.device_name());

        let queues: Vec<Queue> = families
            .iter()
            .map(|&family| {
                let handle = unsafe { device.get_device_queue(family, 0) };
                let properties = info.queue_family_properties[family as usize];
                debug!(
                    "Queue retrieved from family {} ({:?})",
                    family, properties.queue_flags
                );
                Queue::new(device.clone(), handle, family, properties)
            })
            .collect();

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.handle().clone(),
            device: device.clone(),
            physical_device: info.device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;

        info!("GPU memory allocator initialized");

        Ok(Arc::new(Self {
            device,
            physical_device: info.device,
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            queues,
            limits: info.limits,
        }))
    }

    /// Returns the Vulkan logical device handle.
    #[inline]
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    /// Returns the physical device handle.
    #[inline]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Returns the device limits captured at selection time.
    #[inline]
    pub fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    /// Returns the GPU memory allocator.
    #[inline]
    pub fn allocator(&self) -> &Mutex<Allocator> {
        &self.allocator
    }

    /// Returns the first queue whose family supports all of `flags`.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::NoSuitableQueue`] if no family matches.
    pub fn queue_by_capability(&self, flags: vk::QueueFlags) -> RhiResult<&Queue> {
        self.queues
            .iter()
            .find(|queue| queue.supports(flags))
            .ok_or(RhiError::NoSuitableQueue(flags))
    }

    /// Returns the graphics queue.
    ///
    /// Present on every device this crate accepts; selection rejects
    /// devices without a graphics-capable family.
    pub fn graphics_queue(&self) -> &Queue {
        self.queues
            .iter()
            .find(|queue| queue.supports(vk::QueueFlags::GRAPHICS))
            .expect("device was selected with a graphics queue family")
    }

    /// Returns all queues, one per family.
    #[inline]
    pub fn queues(&self) -> &[Queue] {
        &self.queues
    }

    /// Waits for the device to become idle.
    ///
    /// This function blocks until all outstanding operations on all
    /// queues have completed. Useful before destroying resources or
    /// rebuilding pools.
    ///
    /// # Errors
    ///
    /// Returns an error if the wait fails.
    pub fn wait_idle(&self) -> RhiResult<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            // Wait for all operations to complete before cleanup
            if let Err(e) = self.device.device_wait_idle() {
                tracing::error!("Failed to wait for device idle during drop: {:?}", e);
            }

            // The allocator must release its memory before the device goes away.
            ManuallyDrop::drop(&mut self.allocator);

            self.device.destroy_device(None);
        }
        info!("Logical device destroyed");
    }
}

// Safety: ash::Device is Send+Sync, handles are Copy, and the allocator
// is protected by a Mutex.
unsafe impl Send for Device {}
unsafe impl Sync for Device {}
