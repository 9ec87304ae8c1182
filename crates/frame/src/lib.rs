//! Frame-in-flight resource management built on `vkforge-rhi`.
//!
//! The renderer records a new frame while the GPU consumes the previous
//! one. Each in-flight frame owns its transient resources (command
//! pools, descriptor caches, ring-buffer allocations, fences and
//! semaphores), aggregated in a [`RenderFrame`]; [`FrameManager`]
//! cycles the ring and enforces the CPU/GPU distance.

pub mod frame_manager;
pub mod render_frame;

pub use frame_manager::FrameManager;
pub use render_frame::{RenderFrame, BUFFER_BLOCK_SIZE};

/// Number of frames the CPU may record ahead of the GPU.
///
/// Two is the usual sweet spot: one frame recording while one executes,
/// without the extra latency a third would add.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;
