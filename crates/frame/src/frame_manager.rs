//! Frame-in-flight cycling.

use std::sync::Arc;

use ash::vk;
use tracing::info;

use vkforge_rhi::cache::ResourceCache;
use vkforge_rhi::device::Device;
use vkforge_rhi::RhiResult;

use crate::render_frame::{RenderFrame, BUFFER_BLOCK_SIZE};
use crate::MAX_FRAMES_IN_FLIGHT;

/// Owns the ring of [`RenderFrame`]s and cycles through them.
///
/// `begin_frame` recycles the oldest frame (waiting on its fences if
/// the GPU is still using it) and hands it out for recording;
/// `next_frame` advances the ring. The CPU therefore never runs more
/// than [`MAX_FRAMES_IN_FLIGHT`] frames ahead of the GPU.
pub struct FrameManager {
    frames: Vec<RenderFrame>,
    current: usize,
    frame_count: u64,
}

impl FrameManager {
    /// Creates the frame ring with the default transient block size.
    pub fn new(device: Arc<Device>, resource_cache: Arc<ResourceCache>) -> Self {
        Self::with_block_size(device, resource_cache, BUFFER_BLOCK_SIZE)
    }

    /// Creates the frame ring with an explicit transient buffer block
    /// size.
    pub fn with_block_size(
        device: Arc<Device>,
        resource_cache: Arc<ResourceCache>,
        buffer_block_size: vk::DeviceSize,
    ) -> Self {
        let frames = (0..MAX_FRAMES_IN_FLIGHT)
            .map(|_| RenderFrame::new(device.clone(), resource_cache.clone(), buffer_block_size))
            .collect();
        info!(
            "Frame manager initialized ({} frames in flight)",
            MAX_FRAMES_IN_FLIGHT
        );
        Self {
            frames,
            current: 0,
            frame_count: 0,
        }
    }

    /// Recycles and returns the frame that will record next.
    ///
    /// Blocks until the GPU finishes the frame's previous use.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame's fences time out or a pool reset
    /// fails.
    pub fn begin_frame(&mut self) -> RhiResult<&mut RenderFrame> {
        let frame = &mut self.frames[self.current];
        frame.reset()?;
        Ok(frame)
    }

    /// Returns the frame currently recording.
    pub fn current_frame(&mut self) -> &mut RenderFrame {
        &mut self.frames[self.current]
    }

    /// Advances to the next frame slot after submission.
    pub fn next_frame(&mut self) {
        self.current = (self.current + 1) % self.frames.len();
        self.frame_count += 1;
    }

    /// Index of the active slot, in `0..MAX_FRAMES_IN_FLIGHT`.
    pub fn frame_index(&self) -> usize {
        self.current
    }

    /// Total frames completed since creation.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_index_wraps() {
        // Pure index arithmetic, no device needed.
        let mut current = 0usize;
        for expected in [1, 0, 1, 0] {
            current = (current + 1) % MAX_FRAMES_IN_FLIGHT;
            assert_eq!(current, expected);
        }
    }
}
