//! Device queue abstraction.
//!
//! A [`Queue`] pairs a `vk::Queue` handle with the capability flags of its
//! family, so callers select queues by what they can do rather than by
//! driver-specific family indices. Submission is asynchronous: `submit`
//! enqueues work and returns; commands submitted to the same queue execute
//! in submission order, while ordering across queues requires semaphores.

use ash::vk;

use crate::command::CommandBuffer;
use crate::error::RhiResult;

/// A single device queue and its family's capabilities.
///
/// Queues are created by [`Device::new`](crate::device::Device::new), one
/// per family, and borrowed from the device for the lifetime of the
/// application.
///
/// # Thread Safety
///
/// Vulkan requires external synchronization for `vkQueueSubmit`; callers
/// submitting from multiple threads must serialize access to one `Queue`.
pub struct Queue {
    /// Cloned device function table (ash devices are internally shared).
    device: ash::Device,
    /// Native queue handle.
    handle: vk::Queue,
    /// Queue family index this queue was created from.
    family_index: u32,
    /// Properties of the owning family, including capability flags.
    properties: vk::QueueFamilyProperties,
}

impl Queue {
    /// Wraps a retrieved device queue.
    pub(crate) fn new(
        device: ash::Device,
        handle: vk::Queue,
        family_index: u32,
        properties: vk::QueueFamilyProperties,
    ) -> Self {
        Self {
            device,
            handle,
            family_index,
            properties,
        }
    }

    /// Returns the native queue handle.
    #[inline]
    pub fn handle(&self) -> vk::Queue {
        self.handle
    }

    /// Returns the queue family index.
    #[inline]
    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    /// Returns the capability flags of the owning family.
    #[inline]
    pub fn capabilities(&self) -> vk::QueueFlags {
        self.properties.queue_flags
    }

    /// Returns true if the family supports all of `flags`.
    #[inline]
    pub fn supports(&self, flags: vk::QueueFlags) -> bool {
        self.properties.queue_flags.contains(flags)
    }

    /// Submits raw submit infos, optionally signalling `fence` when the
    /// batch completes.
    ///
    /// # Errors
    ///
    /// Returns an error if the submission is rejected by the driver.
    pub fn submit(&self, submit_infos: &[vk::SubmitInfo], fence: vk::Fence) -> RhiResult<()> {
        unsafe { self.device.queue_submit(self.handle, submit_infos, fence)? };
        Ok(())
    }

    /// Submits a single executable command buffer.
    ///
    /// Convenience wrapper for the common one-buffer case with optional
    /// wait/signal semaphores. `fence` is signalled when the GPU finishes
    /// the buffer; pass `vk::Fence::null()` when no CPU-side wait is
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the submission is rejected by the driver.
    pub fn submit_command_buffer(
        &self,
        command_buffer: &CommandBuffer,
        wait_semaphores: &[vk::Semaphore],
        wait_stages: &[vk::PipelineStageFlags],
        signal_semaphores: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> RhiResult<()> {
        debug_assert_eq!(wait_semaphores.len(), wait_stages.len());

        let command_buffers = [command_buffer.handle()];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(wait_semaphores)
            .wait_dst_stage_mask(wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(signal_semaphores);

        self.submit(&[submit_info], fence)
    }

    /// Waits until this queue has drained all submitted work.
    ///
    /// # Errors
    ///
    /// Returns an error if the wait fails.
    pub fn wait_idle(&self) -> RhiResult<()> {
        unsafe { self.device.queue_wait_idle(self.handle)? };
        Ok(())
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("family_index", &self.family_index)
            .field("capabilities", &self.properties.queue_flags)
            .finish()
    }
}
