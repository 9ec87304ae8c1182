//! RHI-specific error types.

use ash::vk;
use thiserror::Error;

/// RHI-specific error type.
///
/// Construction-time native failures surface through the `#[from]`
/// conversions and are fatal to the caller. Runtime exhaustion
/// (push-constant overflow, over-sized transient allocations) and
/// recording misuse get dedicated variants so callers can recover
/// without tearing the device down.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan API error
    #[error("Vulkan error: {0}")]
    VulkanError(#[from] vk::Result),

    /// Failed to load Vulkan library
    #[error("Failed to load Vulkan: {0}")]
    LoadingError(#[from] ash::LoadingError),

    /// GPU allocator error
    #[error("Allocator error: {0}")]
    AllocatorError(#[from] gpu_allocator::AllocationError),

    /// No suitable GPU found
    #[error("No suitable GPU found")]
    NoSuitableGpu,

    /// No queue with the requested capabilities
    #[error("No queue supports {0:?}")]
    NoSuitableQueue(vk::QueueFlags),

    /// Command buffer operation attempted in the wrong recording state
    #[error("Invalid command buffer state: expected {expected}, found {found}")]
    InvalidCommandBufferState {
        /// The state the operation requires.
        expected: &'static str,
        /// The state the buffer was actually in.
        found: &'static str,
    },

    /// Command buffer reset requested with a mode other than its pool's
    #[error("Reset mode {requested} does not match the pool's {pool_mode}")]
    ResetModeMismatch {
        /// The mode the owning pool was built with.
        pool_mode: &'static str,
        /// The mode the caller passed.
        requested: &'static str,
    },

    /// Accumulated push constants would exceed the device limit
    #[error("Push constant range of {requested} bytes exceeds device maximum of {max}")]
    PushConstantOverflow {
        /// Total bytes the call would have accumulated.
        requested: u32,
        /// Device-reported maximum push constant size.
        max: u32,
    },

    /// Transient allocation larger than the pool's block size
    #[error("Allocation of {requested} bytes exceeds the {block_size} byte block size")]
    AllocationTooLarge {
        /// Requested allocation size in bytes.
        requested: u64,
        /// Fixed block size of the pool.
        block_size: u64,
    },

    /// A fence wait ran out its (large but finite) timeout
    #[error("Timed out waiting for fences after {timeout_ns} ns")]
    FenceWaitTimeout {
        /// The timeout that elapsed, in nanoseconds.
        timeout_ns: u64,
    },

    /// Pipeline creation error
    #[error("Pipeline error: {0}")]
    PipelineError(String),

    /// Invalid handle error
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),
}

impl RhiError {
    /// Returns true if this error signals an out-of-date or suboptimal
    /// surface, i.e. the swapchain should be rebuilt and the operation
    /// retried. Every other error from a submit/present path is fatal.
    pub fn requires_surface_rebuild(&self) -> bool {
        matches!(
            self,
            RhiError::VulkanError(vk::Result::ERROR_OUT_OF_DATE_KHR)
                | RhiError::VulkanError(vk::Result::SUBOPTIMAL_KHR)
        )
    }
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_surface_rebuild_classification() {
        let out_of_date = RhiError::VulkanError(vk::Result::ERROR_OUT_OF_DATE_KHR);
        let suboptimal = RhiError::VulkanError(vk::Result::SUBOPTIMAL_KHR);
        let device_lost = RhiError::VulkanError(vk::Result::ERROR_DEVICE_LOST);

        assert!(out_of_date.requires_surface_rebuild());
        assert!(suboptimal.requires_surface_rebuild());
        assert!(!device_lost.requires_surface_rebuild());
        assert!(!RhiError::NoSuitableGpu.requires_surface_rebuild());
    }

    #[test]
    fn test_overflow_errors_carry_sizes() {
        let err = RhiError::PushConstantOverflow {
            requested: 256,
            max: 128,
        };
        assert!(err.to_string().contains("256"));
        assert!(err.to_string().contains("128"));
    }
}
