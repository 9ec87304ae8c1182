//! Vulkan command recording and per-frame resource management core.
//!
//! This crate provides a safe abstraction over Vulkan using the `ash` crate.
//! It handles:
//! - Instance and device creation
//! - Command buffer recording with lazy pipeline/descriptor flushing
//! - Pipeline state tracking behind a dirty flag
//! - Resource binding tracking and descriptor set caching
//! - Transient buffer sub-allocation (ring buffers)
//! - Synchronization primitive pools
//!
//! # Recording model
//!
//! Bind and set calls on a [`CommandBuffer`](command::CommandBuffer) only
//! mutate in-memory state. The first draw or dispatch after a state change
//! flushes that state: a pipeline is looked up (or created) in the
//! [`ResourceCache`](cache::ResourceCache), descriptor sets are looked up
//! (or written) in the per-thread descriptor cache, and only then is the
//! native command emitted. Unchanged state between draws costs nothing.

mod error;

pub mod binding;
pub mod buffer;
pub mod cache;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod instance;
pub mod physical_device;
pub mod pipeline;
pub mod queue;
pub mod sync;

pub use error::{RhiError, RhiResult};

// Re-export ash types that users might need
pub use ash::vk;
