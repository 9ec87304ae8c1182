//! Headless smoke run: records and submits a few frames of buffer
//! uploads without a window or swapchain.
//!
//! Run with `RUST_LOG=debug` to watch pools grow on the first frame and
//! go quiet on later ones.

use std::sync::Arc;

use anyhow::{Context, Result};
use ash::vk;

use vkforge_core::init_logging;
use vkforge_frame::FrameManager;
use vkforge_rhi::buffer::{Buffer, BufferUsage};
use vkforge_rhi::cache::ResourceCache;
use vkforge_rhi::command::{CommandBufferLevel, ResetMode};
use vkforge_rhi::device::Device;
use vkforge_rhi::instance::{Instance, InstanceConfig};
use vkforge_rhi::physical_device::select_physical_device;

const FRAMES: usize = 8;
const UPLOAD_SIZE: vk::DeviceSize = 4 * 1024;

fn main() -> Result<()> {
    init_logging();

    let instance = Instance::new(InstanceConfig::default()).context("creating instance")?;
    let gpu = select_physical_device(instance.handle()).context("selecting physical device")?;
    let device = Device::new(&instance, &gpu).context("creating device")?;

    let resource_cache = ResourceCache::new(device.clone());
    let mut frames = FrameManager::new(device.clone(), resource_cache);

    // A persistent destination the per-frame staging data is copied into.
    let vertex_buffer = Buffer::new(Arc::clone(&device), BufferUsage::Vertex, UPLOAD_SIZE)
        .context("creating vertex buffer")?;

    let payload: Vec<u8> = (0..UPLOAD_SIZE).map(|i| (i % 251) as u8).collect();
    let family = device.graphics_queue().family_index();

    for frame_number in 0..FRAMES {
        let frame = frames.begin_frame()?;

        // Frame-transient staging memory from the ring buffer.
        let staging = frame.allocate_buffer(BufferUsage::Staging, UPLOAD_SIZE, 0)?;
        staging.write(0, &payload)?;

        let fence = frame.request_fence()?;
        let cmd =
            frame.request_command_buffer(family, ResetMode::ResetPool, CommandBufferLevel::Primary, 0)?;

        cmd.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT, None)?;
        let region = vk::BufferCopy {
            src_offset: staging.offset(),
            dst_offset: 0,
            size: UPLOAD_SIZE,
        };
        // The staging allocation is a slice of a pooled buffer, so the
        // copy sources from its offset.
        cmd.copy_buffer(staging.buffer(), vertex_buffer.handle(), &[region]);
        cmd.end()?;

        device
            .graphics_queue()
            .submit_command_buffer(cmd, &[], &[], &[], fence)?;

        frames.next_frame();
        tracing::info!("Frame {frame_number} submitted");
    }

    device.wait_idle()?;
    tracing::info!("Headless run complete: {} frames", frames.frame_count());
    Ok(())
}
