//! Per-frame resource aggregation.
//!
//! A [`RenderFrame`] owns every transient resource one frame in flight
//! needs: command pools partitioned by queue family and recording
//! thread, a descriptor cache per thread, ring-buffer pools per buffer
//! usage class and thread, and the fence/semaphore pools that track the
//! frame's submissions. When the frame's fence signals, one [`reset`] rewinds
//! everything and the frame records again from scratch.
//!
//! [`reset`]: RenderFrame::reset

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ash::vk;
use tracing::{debug, warn};

use vkforge_rhi::binding::ResourceSet;
use vkforge_rhi::buffer::{BufferAllocation, BufferPool, BufferUsage};
use vkforge_rhi::cache::ResourceCache;
use vkforge_rhi::command::{CommandBuffer, CommandBufferLevel, CommandPool, ResetMode};
use vkforge_rhi::descriptor::{DescriptorCache, DescriptorSetLayout};
use vkforge_rhi::device::Device;
use vkforge_rhi::RhiResult;
use vkforge_rhi::sync::{FencePool, Semaphore, SemaphorePool};

/// Default ring-buffer block size per usage class: 256 KiB.
pub const BUFFER_BLOCK_SIZE: vk::DeviceSize = 256 * 1024;

/// Transient resources for one frame in flight.
///
/// Command pools and descriptor caches are created lazily, keyed by
/// the recording thread, so single-threaded use pays for one of each.
/// The frame itself is not `Sync`: multi-threaded recording hands each
/// thread its own pool through an external scheduler.
pub struct RenderFrame {
    device: Arc<Device>,
    resource_cache: Arc<ResourceCache>,
    buffer_block_size: vk::DeviceSize,
    fence_pool: FencePool,
    semaphore_pool: SemaphorePool,
    /// Command pools keyed by `(queue family, thread index)`.
    command_pools: HashMap<(u32, usize), CommandPool>,
    /// One descriptor cache per recording thread.
    descriptor_caches: HashMap<usize, Arc<Mutex<DescriptorCache>>>,
    /// Ring-buffer pools keyed by `(usage class, thread index)`,
    /// created on first use.
    buffer_pools: HashMap<(BufferUsage, usize), BufferPool>,
}

impl RenderFrame {
    /// Creates an empty frame.
    ///
    /// `buffer_block_size` is fixed for the frame's lifetime; every
    /// transient pool the frame creates uses it.
    pub fn new(
        device: Arc<Device>,
        resource_cache: Arc<ResourceCache>,
        buffer_block_size: vk::DeviceSize,
    ) -> Self {
        let fence_pool = FencePool::new(device.clone());
        let semaphore_pool = SemaphorePool::new(device.clone());
        Self {
            device,
            resource_cache,
            buffer_block_size,
            fence_pool,
            semaphore_pool,
            command_pools: HashMap::new(),
            descriptor_caches: HashMap::new(),
            buffer_pools: HashMap::new(),
        }
    }

    /// Returns a command buffer recording for `queue_family_index` on
    /// `thread_index`, creating the backing pool on first request.
    ///
    /// `reset_mode` must match the pool's mode; if an existing pool was
    /// built with a different mode, the device is drained and the pool
    /// rebuilt, which is expensive and logged. Pick one mode per
    /// `(family, thread)` and stick to it.
    ///
    /// # Errors
    ///
    /// Returns an error if pool creation, the mismatch drain, or buffer
    /// allocation fails.
    pub fn request_command_buffer(
        &mut self,
        queue_family_index: u32,
        reset_mode: ResetMode,
        level: CommandBufferLevel,
        thread_index: usize,
    ) -> RhiResult<&mut CommandBuffer> {
        let descriptor_cache = self
            .descriptor_caches
            .entry(thread_index)
            .or_insert_with(|| Arc::new(Mutex::new(DescriptorCache::new(self.device.clone()))))
            .clone();

        let key = (queue_family_index, thread_index);
        let mismatched = self
            .command_pools
            .get(&key)
            .is_some_and(|pool| pool.reset_mode() != reset_mode);
        if mismatched {
            warn!(
                "Reset mode changed for command pool (family {}, thread {}); draining device and rebuilding",
                queue_family_index, thread_index
            );
            self.device.wait_idle()?;
            self.command_pools.remove(&key);
        }

        if !self.command_pools.contains_key(&key) {
            let pool = CommandPool::new(
                self.device.clone(),
                queue_family_index,
                thread_index,
                reset_mode,
                self.resource_cache.clone(),
                descriptor_cache,
            )?;
            self.command_pools.insert(key, pool);
        }
        // The entry was just ensured above.
        let pool = self
            .command_pools
            .get_mut(&key)
            .ok_or_else(|| vkforge_rhi::RhiError::InvalidHandle("command pool vanished".into()))?;
        pool.request_command_buffer(level)
    }

    /// Returns a descriptor set from `thread_index`'s cache whose writes
    /// match `resources`.
    ///
    /// Command buffers normally materialize sets themselves at flush
    /// time; this entry point serves callers composing submissions
    /// outside a tracked recording.
    ///
    /// # Errors
    ///
    /// Returns an error if set allocation fails.
    pub fn request_descriptor_set(
        &mut self,
        layout: &Arc<DescriptorSetLayout>,
        resources: &ResourceSet,
        thread_index: usize,
    ) -> RhiResult<vk::DescriptorSet> {
        let cache = self
            .descriptor_caches
            .entry(thread_index)
            .or_insert_with(|| Arc::new(Mutex::new(DescriptorCache::new(self.device.clone()))));
        cache.lock().unwrap().request_descriptor_set(layout, resources)
    }

    /// Requests a fence tracking one of this frame's submissions.
    ///
    /// # Errors
    ///
    /// Returns an error if fence creation fails.
    pub fn request_fence(&mut self) -> RhiResult<vk::Fence> {
        self.fence_pool.request_fence()
    }

    /// Requests a pool-owned semaphore valid until the frame resets.
    ///
    /// # Errors
    ///
    /// Returns an error if semaphore creation fails.
    pub fn request_semaphore(&mut self) -> RhiResult<vk::Semaphore> {
        self.semaphore_pool.request_semaphore()
    }

    /// Requests a semaphore whose ownership transfers to the caller,
    /// e.g. to hand to a swapchain present that outlives the frame.
    ///
    /// # Errors
    ///
    /// Returns an error if semaphore creation fails.
    pub fn request_semaphore_with_ownership(&mut self) -> RhiResult<Semaphore> {
        self.semaphore_pool.request_semaphore_with_ownership()
    }

    /// Returns an owned semaphore to the frame for recycling at the
    /// next reset.
    pub fn release_owned_semaphore(&mut self, semaphore: Semaphore) {
        self.semaphore_pool.release_owned_semaphore(semaphore);
    }

    /// Suballocates transient buffer memory of `usage` for this frame,
    /// from `thread_index`'s private pool.
    ///
    /// Each `(usage, thread)` pair gets its own ring, so recording
    /// threads never contend on a bump cursor. The allocation is valid
    /// until [`reset`](Self::reset); nothing is freed individually.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationTooLarge`] if `size` exceeds the frame's
    /// block size, or an allocation error if a new block cannot be
    /// created.
    ///
    /// [`AllocationTooLarge`]: vkforge_rhi::RhiError::AllocationTooLarge
    pub fn allocate_buffer(
        &mut self,
        usage: BufferUsage,
        size: vk::DeviceSize,
        thread_index: usize,
    ) -> RhiResult<BufferAllocation> {
        let block_size = self.buffer_block_size;
        let device = self.device.clone();
        let pool = self
            .buffer_pools
            .entry((usage, thread_index))
            .or_insert_with(|| BufferPool::new(device, usage, block_size));
        pool.request_buffer(size)
    }

    /// Waits for the frame's submissions and rewinds every pool.
    ///
    /// Order matters: fences are waited and reset first, which proves
    /// the GPU is done with the frame; only then are command pools,
    /// descriptor caches, buffer pools and finally the semaphore pool
    /// recycled.
    ///
    /// # Errors
    ///
    /// Returns [`FenceWaitTimeout`] if the frame's fences do not signal
    /// within the default timeout, or any native reset error.
    ///
    /// [`FenceWaitTimeout`]: vkforge_rhi::RhiError::FenceWaitTimeout
    pub fn reset(&mut self) -> RhiResult<()> {
        self.fence_pool.wait(None)?;
        self.fence_pool.reset()?;

        for pool in self.command_pools.values_mut() {
            pool.reset_pool()?;
        }
        for cache in self.descriptor_caches.values() {
            cache.lock().unwrap().reset()?;
        }
        for pool in self.buffer_pools.values_mut() {
            pool.reset();
        }
        self.semaphore_pool.reset();

        debug!(
            "Frame reset: {} command pool(s), {} buffer pool(s)",
            self.command_pools.len(),
            self.buffer_pools.len()
        );
        Ok(())
    }

    /// The fence pool tracking this frame's submissions.
    pub fn fence_pool(&self) -> &FencePool {
        &self.fence_pool
    }

    /// The semaphore pool for this frame's submission ordering.
    pub fn semaphore_pool(&self) -> &SemaphorePool {
        &self.semaphore_pool
    }

    /// Number of command pools created so far.
    pub fn command_pool_count(&self) -> usize {
        self.command_pools.len()
    }
}
