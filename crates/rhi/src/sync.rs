//! Synchronization primitives and their per-frame pools.
//!
//! This module provides wrappers for Vulkan synchronization objects:
//! - [`Semaphore`] - GPU-to-GPU synchronization (between queue operations)
//! - [`Fence`] - GPU-to-CPU synchronization (for host waiting)
//! - [`FencePool`] / [`SemaphorePool`] - per-frame recycling pools
//!
//! # Pooling model
//!
//! Each pool hands out primitives with `request_*` and tracks how many are
//! active this cycle. The pool only ever grows; `reset()` rewinds the
//! active count so the same primitives are reused next frame. For fences,
//! `wait()` and `reset()` operate strictly over the first `active_count`
//! entries, so primitives requested this frame are exactly the ones waited
//! on.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vkforge_rhi::device::Device;
//! use vkforge_rhi::sync::FencePool;
//!
//! # fn example(device: Arc<Device>) -> Result<(), vkforge_rhi::RhiError> {
//! let mut fences = FencePool::new(device);
//! let fence = fences.request_fence()?;
//! // ... submit work signalling `fence` ...
//! fences.wait(None)?;
//! fences.reset()?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// Default fence wait timeout: large but finite, so a wedged GPU surfaces
/// as an explicit error instead of a silent hang.
pub const FENCE_WAIT_TIMEOUT_NS: u64 = 100_000_000_000;

/// Vulkan semaphore wrapper.
///
/// Semaphores are used for GPU-to-GPU synchronization between queue
/// operations.
///
/// # Thread Safety
///
/// The semaphore is immutable after creation and can be safely shared
/// between threads.
pub struct Semaphore {
    /// Reference to the logical device.
    device: Arc<Device>,
    /// Vulkan semaphore handle.
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Creates a new semaphore in the unsignaled state.
    ///
    /// # Errors
    ///
    /// Returns an error if semaphore creation fails.
    pub fn new(device: Arc<Device>) -> RhiResult<Self> {
        let create_info = vk::SemaphoreCreateInfo::default();

        let semaphore = unsafe { device.handle().create_semaphore(&create_info, None)? };

        Ok(Self { device, semaphore })
    }

    /// Returns the Vulkan semaphore handle.
    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_semaphore(self.semaphore, None);
        }
    }
}

/// Vulkan fence wrapper.
///
/// Fences are used for GPU-to-CPU synchronization, allowing the host to
/// wait for GPU operations to complete.
pub struct Fence {
    /// Reference to the logical device.
    device: Arc<Device>,
    /// Vulkan fence handle.
    fence: vk::Fence,
}

impl Fence {
    /// Creates a new fence.
    ///
    /// # Arguments
    ///
    /// * `device` - The logical device
    /// * `signaled` - If true, creates the fence in the signaled state.
    ///   Useful for fences waited on before the first submission that
    ///   would signal them.
    ///
    /// # Errors
    ///
    /// Returns an error if fence creation fails.
    pub fn new(device: Arc<Device>, signaled: bool) -> RhiResult<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };

        let create_info = vk::FenceCreateInfo::default().flags(flags);

        let fence = unsafe { device.handle().create_fence(&create_info, None)? };

        Ok(Self { device, fence })
    }

    /// Returns the Vulkan fence handle.
    #[inline]
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    /// Waits for the fence to become signaled.
    ///
    /// # Arguments
    ///
    /// * `timeout` - Timeout in nanoseconds; defaults to
    ///   [`FENCE_WAIT_TIMEOUT_NS`] when `None`.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::FenceWaitTimeout`] if the timeout elapses, or
    /// another error if the wait fails. A timeout does not abort the GPU
    /// work the fence guards.
    pub fn wait(&self, timeout: Option<u64>) -> RhiResult<()> {
        let timeout_ns = timeout.unwrap_or(FENCE_WAIT_TIMEOUT_NS);
        let fences = [self.fence];
        let result = unsafe {
            self.device
                .handle()
                .wait_for_fences(&fences, true, timeout_ns)
        };
        match result {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(RhiError::FenceWaitTimeout { timeout_ns }),
            Err(e) => Err(e.into()),
        }
    }

    /// Resets the fence to the unsignaled state.
    ///
    /// The fence must not be in use by any queue operation.
    ///
    /// # Errors
    ///
    /// Returns an error if the reset operation fails.
    pub fn reset(&self) -> RhiResult<()> {
        let fences = [self.fence];
        unsafe { self.device.handle().reset_fences(&fences)? };
        Ok(())
    }

    /// Checks if the fence is currently signaled without blocking.
    pub fn is_signaled(&self) -> bool {
        let result = unsafe { self.device.handle().get_fence_status(self.fence) };
        matches!(result, Ok(true))
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_fence(self.fence, None);
        }
    }
}

/// A growable pool of reusable fences.
///
/// Fences move through `Free → Active → Signaled → Free`: `request_fence`
/// activates the next free fence (creating one past the high-water mark),
/// `wait` blocks on every active fence, and `reset` unsignals them and
/// returns them to the free region. The pool never shrinks.
pub struct FencePool {
    /// Reference to the logical device.
    device: Arc<Device>,
    /// All fences ever created by this pool, active ones first.
    fences: Vec<Fence>,
    /// How many fences are checked out this cycle.
    active_count: usize,
}

impl FencePool {
    /// Creates an empty fence pool.
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            fences: Vec::new(),
            active_count: 0,
        }
    }

    /// Returns an unsignaled fence for this cycle.
    ///
    /// Reuses a pooled fence when one is free, otherwise creates a new
    /// one and grows the pool.
    ///
    /// # Errors
    ///
    /// Returns an error if a new fence must be created and creation fails.
    pub fn request_fence(&mut self) -> RhiResult<vk::Fence> {
        if self.active_count < self.fences.len() {
            let handle = self.fences[self.active_count].handle();
            self.active_count += 1;
            return Ok(handle);
        }

        let fence = Fence::new(self.device.clone(), false)?;
        let handle = fence.handle();
        self.fences.push(fence);
        self.active_count += 1;
        debug!("Fence pool grew to {} fence(s)", self.fences.len());
        Ok(handle)
    }

    /// Waits for every active fence to be signaled.
    ///
    /// A no-op when nothing is active this cycle.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::FenceWaitTimeout`] if the timeout elapses.
    pub fn wait(&self, timeout: Option<u64>) -> RhiResult<()> {
        if self.active_count == 0 {
            return Ok(());
        }

        let timeout_ns = timeout.unwrap_or(FENCE_WAIT_TIMEOUT_NS);
        let handles: Vec<vk::Fence> = self.fences[..self.active_count]
            .iter()
            .map(Fence::handle)
            .collect();

        let result = unsafe {
            self.device
                .handle()
                .wait_for_fences(&handles, true, timeout_ns)
        };
        match result {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(RhiError::FenceWaitTimeout { timeout_ns }),
            Err(e) => Err(e.into()),
        }
    }

    /// Unsignals every active fence and returns them to the free region.
    ///
    /// # Errors
    ///
    /// Returns an error if the native reset fails; the active count is
    /// left untouched in that case.
    pub fn reset(&mut self) -> RhiResult<()> {
        if self.active_count == 0 {
            return Ok(());
        }

        let handles: Vec<vk::Fence> = self.fences[..self.active_count]
            .iter()
            .map(Fence::handle)
            .collect();

        unsafe { self.device.handle().reset_fences(&handles)? };
        self.active_count = 0;
        Ok(())
    }

    /// Number of fences checked out this cycle.
    #[inline]
    pub fn active_count(&self) -> usize {
        self.active_count
    }

    /// Total fences owned by the pool (the high-water mark).
    #[inline]
    pub fn fence_count(&self) -> usize {
        self.fences.len()
    }
}

/// A growable pool of reusable semaphores.
///
/// Two ownership modes:
/// - `request_semaphore` hands out a pool-owned handle that is implicitly
///   recycled at the next `reset()`.
/// - `request_semaphore_with_ownership` transfers a [`Semaphore`] to the
///   caller, who must hand it back via `release_owned_semaphore` once the
///   GPU no longer references it; released semaphores rejoin the free
///   list at the next `reset()`.
pub struct SemaphorePool {
    /// Reference to the logical device.
    device: Arc<Device>,
    /// Pool-owned semaphores, active ones first.
    semaphores: Vec<Semaphore>,
    /// Semaphores handed back by callers, recycled at reset.
    released: Vec<Semaphore>,
    /// How many pool-owned semaphores are checked out this cycle.
    active_count: usize,
}

impl SemaphorePool {
    /// Creates an empty semaphore pool.
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            semaphores: Vec::new(),
            released: Vec::new(),
            active_count: 0,
        }
    }

    /// Returns a pool-owned semaphore for this cycle.
    ///
    /// # Errors
    ///
    /// Returns an error if a new semaphore must be created and creation
    /// fails.
    pub fn request_semaphore(&mut self) -> RhiResult<vk::Semaphore> {
        if self.active_count < self.semaphores.len() {
            let handle = self.semaphores[self.active_count].handle();
            self.active_count += 1;
            return Ok(handle);
        }

        let semaphore = Semaphore::new(self.device.clone())?;
        let handle = semaphore.handle();
        self.semaphores.push(semaphore);
        self.active_count += 1;
        debug!("Semaphore pool grew to {} semaphore(s)", self.semaphores.len());
        Ok(handle)
    }

    /// Transfers a semaphore out of the pool to the caller.
    ///
    /// Reuses a free pooled semaphore when possible. The caller is
    /// responsible for handing it back with
    /// [`release_owned_semaphore`](Self::release_owned_semaphore); dropping
    /// it instead simply destroys it, which is safe but defeats reuse.
    ///
    /// # Errors
    ///
    /// Returns an error if a new semaphore must be created and creation
    /// fails.
    pub fn request_semaphore_with_ownership(&mut self) -> RhiResult<Semaphore> {
        if self.active_count < self.semaphores.len() {
            return Ok(self.semaphores.pop().expect("pool is non-empty"));
        }
        Semaphore::new(self.device.clone())
    }

    /// Hands a caller-owned semaphore back for recycling.
    ///
    /// The semaphore must be unsignaled and unreferenced by pending GPU
    /// work; it becomes requestable again after the next `reset()`.
    pub fn release_owned_semaphore(&mut self, semaphore: Semaphore) {
        self.released.push(semaphore);
    }

    /// Rewinds the active count and folds released semaphores back into
    /// the free list.
    pub fn reset(&mut self) {
        self.active_count = 0;
        self.semaphores.append(&mut self.released);
    }

    /// Number of pool-owned semaphores checked out this cycle.
    #[inline]
    pub fn active_count(&self) -> usize {
        self.active_count
    }

    /// Total semaphores currently owned by the pool.
    #[inline]
    pub fn semaphore_count(&self) -> usize {
        self.semaphores.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fence_timeout_is_finite() {
        assert!(FENCE_WAIT_TIMEOUT_NS < u64::MAX);
        // At least a second; anything shorter would trip on busy frames.
        assert!(FENCE_WAIT_TIMEOUT_NS >= 1_000_000_000);
    }

    #[test]
    fn test_semaphore_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Semaphore>();
    }

    #[test]
    fn test_fence_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Fence>();
    }

    #[test]
    fn test_pools_are_send() {
        fn assert_send<T: Send>() {}
        assert_send::<FencePool>();
        assert_send::<SemaphorePool>();
    }
}
