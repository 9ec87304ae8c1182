//! Command pools and recording command buffers.
//!
//! A [`CommandPool`] belongs to one queue family and one recording
//! thread; it owns its buffers and hands out `&mut CommandBuffer`
//! borrows, so recording needs no internal locking. The pool's
//! [`ResetMode`] is fixed at construction and decides how buffers are
//! recycled between frames.
//!
//! [`CommandBuffer`] is a state machine: `Initial` until `begin`,
//! `Recording` until `end`, then `Executable` and ready to submit.
//! While recording, pipeline and resource bindings accumulate in CPU
//! trackers ([`PipelineState`](crate::pipeline::PipelineState),
//! [`ResourceBindingState`](crate::binding::ResourceBindingState)) and
//! are flushed to the driver lazily at the next draw or dispatch.
//! Control operations (`begin`, `end`, `reset`) return
//! [`RhiError::InvalidCommandBufferState`] on misuse; per-draw setters
//! are hot-path and guard with `debug_assert!` only.

use std::sync::{Arc, Mutex};

use ash::vk;
use tracing::debug;

use crate::binding::{BufferBinding, ImageBinding, ResourceBindingState};
use crate::cache::ResourceCache;
use crate::descriptor::DescriptorCache;
use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::pipeline::{
    ColorBlendState, DepthStencilState, InputAssemblyState, MultisampleState, PipelineLayout,
    PipelineState, RasterizationState, VertexInputState,
};

/// How a pool recycles its command buffers between frames.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResetMode {
    /// One `vkResetCommandPool` rewinds every buffer at once. Cheapest;
    /// the whole pool must be done on the GPU first.
    #[default]
    ResetPool,
    /// Buffers are reset one by one and reused in request order.
    ResetIndividually,
    /// Buffers are freed at reset and reallocated on demand.
    AlwaysAllocate,
}

impl ResetMode {
    fn as_str(self) -> &'static str {
        match self {
            ResetMode::ResetPool => "ResetPool",
            ResetMode::ResetIndividually => "ResetIndividually",
            ResetMode::AlwaysAllocate => "AlwaysAllocate",
        }
    }

    /// Pool create flags implied by the reset mode.
    fn create_flags(self) -> vk::CommandPoolCreateFlags {
        match self {
            // Whole-pool resets pair with short-lived recordings.
            ResetMode::ResetPool => vk::CommandPoolCreateFlags::TRANSIENT,
            ResetMode::ResetIndividually | ResetMode::AlwaysAllocate => {
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER
            }
        }
    }
}

/// Primary or secondary command buffer level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CommandBufferLevel {
    #[default]
    Primary,
    Secondary,
}

impl CommandBufferLevel {
    fn to_vk(self) -> vk::CommandBufferLevel {
        match self {
            CommandBufferLevel::Primary => vk::CommandBufferLevel::PRIMARY,
            CommandBufferLevel::Secondary => vk::CommandBufferLevel::SECONDARY,
        }
    }
}

/// Lifecycle state of a command buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CommandBufferState {
    /// Freshly allocated or reset; `begin` is legal.
    #[default]
    Initial,
    /// Between `begin` and `end`; recording commands is legal.
    Recording,
    /// After `end`; ready for submission.
    Executable,
    /// A recording error poisoned the buffer; only reset recovers it.
    Invalid,
}

impl CommandBufferState {
    fn as_str(self) -> &'static str {
        match self {
            CommandBufferState::Initial => "Initial",
            CommandBufferState::Recording => "Recording",
            CommandBufferState::Executable => "Executable",
            CommandBufferState::Invalid => "Invalid",
        }
    }
}

/// Render pass context a secondary buffer inherits from its primary.
#[derive(Clone, Copy, Debug)]
pub struct CommandBufferInheritance {
    pub render_pass: vk::RenderPass,
    pub subpass: u32,
    /// May be null if the framebuffer is not known at record time.
    pub framebuffer: vk::Framebuffer,
}

// =============================================================================
// Push constant accumulator
// =============================================================================

/// CPU-side staging for push constant bytes.
///
/// Writes land in a fixed buffer sized to the device limit; the dirty
/// range is emitted as a single `vkCmdPushConstants` at the next flush.
#[derive(Clone, Debug)]
struct PushConstantState {
    data: Vec<u8>,
    /// Dirty byte range `[start, end)`, if any write happened.
    dirty: Option<(u32, u32)>,
}

impl PushConstantState {
    fn new(max_size: u32) -> Self {
        Self {
            data: vec![0; max_size as usize],
            dirty: None,
        }
    }

    /// Stores bytes at `offset`, widening the dirty range.
    fn set(&mut self, offset: u32, bytes: &[u8]) -> RhiResult<()> {
        let end = offset as usize + bytes.len();
        if end > self.data.len() {
            return Err(RhiError::PushConstantOverflow {
                requested: end as u32,
                max: self.data.len() as u32,
            });
        }
        self.data[offset as usize..end].copy_from_slice(bytes);
        self.dirty = Some(match self.dirty {
            Some((start, stop)) => (start.min(offset), stop.max(end as u32)),
            None => (offset, end as u32),
        });
        Ok(())
    }

    /// Returns the dirty range and its bytes, if any.
    fn dirty(&self) -> Option<(u32, &[u8])> {
        self.dirty
            .map(|(start, end)| (start, &self.data[start as usize..end as usize]))
    }

    fn clear_dirty(&mut self) {
        self.dirty = None;
    }

    fn reset(&mut self) {
        self.data.fill(0);
        self.dirty = None;
    }
}

/// Intersects a declared push constant range with the dirty byte span
/// `[start, end)`, returning the clipped span if it is non-empty.
fn clip_push_range(range: &vk::PushConstantRange, start: u32, end: u32) -> Option<(u32, u32)> {
    let lo = range.offset.max(start);
    let hi = (range.offset + range.size).min(end);
    (lo < hi).then_some((lo, hi))
}

// =============================================================================
// CommandBuffer
// =============================================================================

/// A recording command buffer with CPU-side state tracking.
///
/// Obtained from [`CommandPool::request_command_buffer`]; the `&mut`
/// borrow ties the buffer to its pool and recording thread.
pub struct CommandBuffer {
    device: Arc<Device>,
    handle: vk::CommandBuffer,
    level: CommandBufferLevel,
    state: CommandBufferState,
    /// The owning pool's reset mode; decides what [`reset`](Self::reset)
    /// is allowed to do.
    reset_mode: ResetMode,
    resource_cache: Arc<ResourceCache>,
    descriptor_cache: Arc<Mutex<DescriptorCache>>,
    pipeline_state: PipelineState,
    binding_state: ResourceBindingState,
    push_constants: PushConstantState,
}

impl CommandBuffer {
    fn new(
        device: Arc<Device>,
        pool: vk::CommandPool,
        level: CommandBufferLevel,
        reset_mode: ResetMode,
        resource_cache: Arc<ResourceCache>,
        descriptor_cache: Arc<Mutex<DescriptorCache>>,
    ) -> RhiResult<Self> {
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(level.to_vk())
            .command_buffer_count(1);
        let handles = unsafe { device.handle().allocate_command_buffers(&allocate_info)? };
        let max_push = device.limits().max_push_constants_size;

        Ok(Self {
            device,
            handle: handles[0],
            level,
            state: CommandBufferState::Initial,
            reset_mode,
            resource_cache,
            descriptor_cache,
            pipeline_state: PipelineState::new(),
            binding_state: ResourceBindingState::new(),
            push_constants: PushConstantState::new(max_push),
        })
    }

    /// Returns the native handle for submission.
    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    #[inline]
    pub fn level(&self) -> CommandBufferLevel {
        self.level
    }

    #[inline]
    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    #[inline]
    pub fn is_recording(&self) -> bool {
        self.state == CommandBufferState::Recording
    }

    fn expect_state(&self, expected: CommandBufferState) -> RhiResult<()> {
        if self.state != expected {
            return Err(RhiError::InvalidCommandBufferState {
                expected: expected.as_str(),
                found: self.state.as_str(),
            });
        }
        Ok(())
    }

    /// Begins recording.
    ///
    /// Secondary buffers recorded with `RENDER_PASS_CONTINUE` must pass
    /// `inheritance`; the inherited pass and subpass seed the pipeline
    /// state so draws inside the secondary resolve pipelines correctly.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidCommandBufferState`] unless the buffer
    /// is `Initial`, or [`RhiError::InvalidHandle`] if a secondary
    /// continuing a render pass lacks inheritance info.
    pub fn begin(
        &mut self,
        usage: vk::CommandBufferUsageFlags,
        inheritance: Option<&CommandBufferInheritance>,
    ) -> RhiResult<()> {
        self.expect_state(CommandBufferState::Initial)?;

        self.pipeline_state.reset();
        self.binding_state.reset();
        self.push_constants.reset();

        let mut inheritance_info = vk::CommandBufferInheritanceInfo::default();
        let mut begin_info = vk::CommandBufferBeginInfo::default().flags(usage);

        if self.level == CommandBufferLevel::Secondary {
            let continues = usage.contains(vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE);
            match inheritance {
                Some(info) => {
                    inheritance_info = inheritance_info
                        .render_pass(info.render_pass)
                        .subpass(info.subpass)
                        .framebuffer(info.framebuffer);
                    self.pipeline_state.set_render_pass(info.render_pass);
                    self.pipeline_state.set_subpass_index(info.subpass);
                }
                None if continues => {
                    return Err(RhiError::InvalidHandle(
                        "secondary buffer continuing a render pass needs inheritance info".into(),
                    ));
                }
                None => {}
            }
            begin_info = begin_info.inheritance_info(&inheritance_info);
        }

        unsafe { self.device.handle().begin_command_buffer(self.handle, &begin_info)? };
        self.state = CommandBufferState::Recording;
        Ok(())
    }

    /// Ends recording, making the buffer submittable.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidCommandBufferState`] unless the buffer
    /// is `Recording`.
    pub fn end(&mut self) -> RhiResult<()> {
        self.expect_state(CommandBufferState::Recording)?;
        if let Err(err) = unsafe { self.device.handle().end_command_buffer(self.handle) } {
            self.state = CommandBufferState::Invalid;
            return Err(err.into());
        }
        self.state = CommandBufferState::Executable;
        Ok(())
    }

    /// Resets the buffer back to `Initial`, discarding its tracked
    /// state.
    ///
    /// `mode` must name the owning pool's reset mode. Only
    /// [`ResetMode::ResetIndividually`] pools carry the
    /// `RESET_COMMAND_BUFFER` flag, so only they issue the native
    /// per-buffer reset; for the other modes this is a bookkeeping
    /// transition and the native rewind happens at
    /// [`CommandPool::reset_pool`].
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::ResetModeMismatch`] if `mode` differs from
    /// the pool's, or an error if the native reset fails.
    pub fn reset(&mut self, mode: ResetMode) -> RhiResult<()> {
        if mode != self.reset_mode {
            return Err(RhiError::ResetModeMismatch {
                pool_mode: self.reset_mode.as_str(),
                requested: mode.as_str(),
            });
        }
        if self.reset_mode == ResetMode::ResetIndividually {
            unsafe {
                self.device
                    .handle()
                    .reset_command_buffer(self.handle, vk::CommandBufferResetFlags::empty())?;
            }
        }
        self.mark_reset();
        Ok(())
    }

    /// Marks the buffer `Initial` after a pool-level reset already
    /// rewound it natively.
    fn mark_reset(&mut self) {
        self.state = CommandBufferState::Initial;
        self.pipeline_state.reset();
        self.binding_state.reset();
        self.push_constants.reset();
    }

    // -------------------------------------------------------------------------
    // Render pass control
    // -------------------------------------------------------------------------

    /// Begins a render pass and seeds the tracked pipeline state with
    /// it.
    pub fn begin_render_pass(
        &mut self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        render_area: vk::Rect2D,
        clear_values: &[vk::ClearValue],
        contents: vk::SubpassContents,
    ) {
        debug_assert!(self.is_recording());
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(render_area)
            .clear_values(clear_values);
        unsafe {
            self.device
                .handle()
                .cmd_begin_render_pass(self.handle, &begin_info, contents);
        }
        self.pipeline_state.set_render_pass(render_pass);
        self.pipeline_state.set_subpass_index(0);
    }

    /// Advances to the next subpass.
    pub fn next_subpass(&mut self, contents: vk::SubpassContents) {
        debug_assert!(self.is_recording());
        unsafe { self.device.handle().cmd_next_subpass(self.handle, contents) };
        self.pipeline_state
            .set_subpass_index(self.pipeline_state.subpass_index() + 1);
    }

    /// Ends the current render pass.
    pub fn end_render_pass(&mut self) {
        debug_assert!(self.is_recording());
        unsafe { self.device.handle().cmd_end_render_pass(self.handle) };
    }

    // -------------------------------------------------------------------------
    // Tracked state setters
    // -------------------------------------------------------------------------

    /// Binds the pipeline layout used by subsequent draws/dispatches.
    ///
    /// A layout change invalidates every descriptor set binding, so all
    /// tracked sets are marked dirty.
    pub fn bind_pipeline_layout(&mut self, layout: Arc<PipelineLayout>) {
        debug_assert!(self.is_recording());
        self.pipeline_state.set_pipeline_layout(layout);
        self.binding_state.mark_all_dirty();
    }

    pub fn set_vertex_input_state(&mut self, state: VertexInputState) {
        debug_assert!(self.is_recording());
        self.pipeline_state.set_vertex_input_state(state);
    }

    pub fn set_input_assembly_state(&mut self, state: InputAssemblyState) {
        debug_assert!(self.is_recording());
        self.pipeline_state.set_input_assembly_state(state);
    }

    pub fn set_rasterization_state(&mut self, state: RasterizationState) {
        debug_assert!(self.is_recording());
        self.pipeline_state.set_rasterization_state(state);
    }

    pub fn set_multisample_state(&mut self, state: MultisampleState) {
        debug_assert!(self.is_recording());
        self.pipeline_state.set_multisample_state(state);
    }

    pub fn set_depth_stencil_state(&mut self, state: DepthStencilState) {
        debug_assert!(self.is_recording());
        self.pipeline_state.set_depth_stencil_state(state);
    }

    pub fn set_color_blend_state(&mut self, state: ColorBlendState) {
        debug_assert!(self.is_recording());
        self.pipeline_state.set_color_blend_state(state);
    }

    pub fn set_specialization_constant(&mut self, constant_id: u32, data: &[u8]) {
        debug_assert!(self.is_recording());
        self.pipeline_state
            .set_specialization_constant(constant_id, data);
    }

    /// Read access to the tracked pipeline state.
    pub fn pipeline_state(&self) -> &PipelineState {
        &self.pipeline_state
    }

    // -------------------------------------------------------------------------
    // Resource binding
    // -------------------------------------------------------------------------

    /// Binds a buffer region to a descriptor slot.
    pub fn bind_buffer(
        &mut self,
        set: u32,
        binding: u32,
        array_element: u32,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) {
        debug_assert!(self.is_recording());
        self.binding_state.bind_buffer(
            set,
            binding,
            array_element,
            BufferBinding {
                buffer,
                offset,
                range,
            },
        );
    }

    /// Binds an image view (and optional sampler) to a descriptor slot.
    pub fn bind_image(
        &mut self,
        set: u32,
        binding: u32,
        array_element: u32,
        image_view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    ) {
        debug_assert!(self.is_recording());
        self.binding_state.bind_image(
            set,
            binding,
            array_element,
            ImageBinding {
                image_view,
                sampler,
                layout,
            },
        );
    }

    /// Stages push constant bytes; emitted at the next draw/dispatch.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::PushConstantOverflow`] if `offset + data`
    /// exceeds the device's push constant limit.
    pub fn push_constants(&mut self, offset: u32, data: &[u8]) -> RhiResult<()> {
        debug_assert!(self.is_recording());
        self.push_constants.set(offset, data)
    }

    // -------------------------------------------------------------------------
    // Direct (untracked) commands
    // -------------------------------------------------------------------------

    pub fn set_viewport(&mut self, viewport: vk::Viewport) {
        debug_assert!(self.is_recording());
        unsafe {
            self.device
                .handle()
                .cmd_set_viewport(self.handle, 0, &[viewport]);
        }
    }

    pub fn set_scissor(&mut self, scissor: vk::Rect2D) {
        debug_assert!(self.is_recording());
        unsafe {
            self.device
                .handle()
                .cmd_set_scissor(self.handle, 0, &[scissor]);
        }
    }

    /// Binds vertex buffers starting at `first_binding`.
    pub fn bind_vertex_buffers(
        &mut self,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    ) {
        debug_assert!(self.is_recording());
        debug_assert_eq!(buffers.len(), offsets.len());
        unsafe {
            self.device
                .handle()
                .cmd_bind_vertex_buffers(self.handle, first_binding, buffers, offsets);
        }
    }

    pub fn bind_index_buffer(
        &mut self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        debug_assert!(self.is_recording());
        unsafe {
            self.device
                .handle()
                .cmd_bind_index_buffer(self.handle, buffer, offset, index_type);
        }
    }

    // -------------------------------------------------------------------------
    // Draws and dispatches
    // -------------------------------------------------------------------------

    /// Draws non-indexed geometry, flushing tracked state first.
    ///
    /// # Errors
    ///
    /// Returns an error if flushing fails, e.g. pipeline creation.
    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> RhiResult<()> {
        self.flush(vk::PipelineBindPoint::GRAPHICS)?;
        unsafe {
            self.device.handle().cmd_draw(
                self.handle,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            );
        }
        Ok(())
    }

    /// Draws indexed geometry, flushing tracked state first.
    ///
    /// # Errors
    ///
    /// Returns an error if flushing fails.
    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> RhiResult<()> {
        self.flush(vk::PipelineBindPoint::GRAPHICS)?;
        unsafe {
            self.device.handle().cmd_draw_indexed(
                self.handle,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
        Ok(())
    }

    /// Issues indirect draws from a GPU buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if flushing fails.
    pub fn draw_indirect(
        &mut self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        draw_count: u32,
        stride: u32,
    ) -> RhiResult<()> {
        self.flush(vk::PipelineBindPoint::GRAPHICS)?;
        unsafe {
            self.device
                .handle()
                .cmd_draw_indirect(self.handle, buffer, offset, draw_count, stride);
        }
        Ok(())
    }

    /// Issues indexed indirect draws from a GPU buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if flushing fails.
    pub fn draw_indexed_indirect(
        &mut self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        draw_count: u32,
        stride: u32,
    ) -> RhiResult<()> {
        self.flush(vk::PipelineBindPoint::GRAPHICS)?;
        unsafe {
            self.device
                .handle()
                .cmd_draw_indexed_indirect(self.handle, buffer, offset, draw_count, stride);
        }
        Ok(())
    }

    /// Dispatches compute work, flushing tracked state first.
    ///
    /// # Errors
    ///
    /// Returns an error if flushing fails.
    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> RhiResult<()> {
        self.flush(vk::PipelineBindPoint::COMPUTE)?;
        unsafe { self.device.handle().cmd_dispatch(self.handle, x, y, z) };
        Ok(())
    }

    /// Dispatches compute work with GPU-sourced group counts.
    ///
    /// # Errors
    ///
    /// Returns an error if flushing fails.
    pub fn dispatch_indirect(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize) -> RhiResult<()> {
        self.flush(vk::PipelineBindPoint::COMPUTE)?;
        unsafe {
            self.device
                .handle()
                .cmd_dispatch_indirect(self.handle, buffer, offset);
        }
        Ok(())
    }

    /// Flushes dirty tracked state into native bind commands.
    ///
    /// Order: pipeline (rebuilt from the cache when dirty), push
    /// constants, then each dirty descriptor set with its dynamic
    /// offsets.
    fn flush(&mut self, bind_point: vk::PipelineBindPoint) -> RhiResult<()> {
        debug_assert!(self.is_recording());

        if self.pipeline_state.is_dirty() {
            let pipeline = match bind_point {
                vk::PipelineBindPoint::COMPUTE => {
                    self.resource_cache.request_compute_pipeline(&self.pipeline_state)?
                }
                _ => self.resource_cache.request_graphics_pipeline(&self.pipeline_state)?,
            };
            unsafe {
                self.device
                    .handle()
                    .cmd_bind_pipeline(self.handle, bind_point, pipeline);
            }
            self.pipeline_state.clear_dirty();
        }

        let Some(layout) = self.pipeline_state.pipeline_layout().cloned() else {
            // Nothing bound through the trackers can be flushed without
            // a layout; direct commands are unaffected.
            return Ok(());
        };

        if let Some((start, bytes)) = self.push_constants.dirty() {
            // One emit per declared range, clipped to the dirty span, so
            // no stage receives bytes outside its declaration.
            let end = start + bytes.len() as u32;
            for range in layout.push_constant_ranges() {
                if let Some((lo, hi)) = clip_push_range(range, start, end) {
                    unsafe {
                        self.device.handle().cmd_push_constants(
                            self.handle,
                            layout.handle(),
                            range.stage_flags,
                            lo,
                            &bytes[(lo - start) as usize..(hi - start) as usize],
                        );
                    }
                }
            }
            self.push_constants.clear_dirty();
        }

        let dirty_sets: Vec<u32> = self.binding_state.dirty_sets().collect();
        for set_index in dirty_sets {
            let Some(set_layout) = layout.set_layout(set_index) else {
                // Bound resources for a set the layout does not declare;
                // leave them tracked in case a later layout uses them.
                continue;
            };
            let Some(resources) = self.binding_state.set(set_index) else {
                continue;
            };

            let descriptor_set = self
                .descriptor_cache
                .lock()
                .unwrap()
                .request_descriptor_set(set_layout, resources)?;

            // Dynamic offsets in slot order, matching the set's dynamic
            // descriptors.
            let mut dynamic_offsets: Vec<u32> = Vec::new();
            for (&(binding, _), resource) in resources.iter() {
                let Some(info) = set_layout.binding(binding) else {
                    continue;
                };
                if info.is_dynamic() {
                    if let crate::binding::ResourceBinding::Buffer(buffer) = resource {
                        dynamic_offsets.push(buffer.offset as u32);
                    }
                }
            }

            unsafe {
                self.device.handle().cmd_bind_descriptor_sets(
                    self.handle,
                    bind_point,
                    layout.handle(),
                    set_index,
                    &[descriptor_set],
                    &dynamic_offsets,
                );
            }
            self.binding_state.clear_dirty(set_index);
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Transfers, barriers, queries
    // -------------------------------------------------------------------------

    /// Copies regions between buffers.
    pub fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        debug_assert!(self.is_recording());
        unsafe {
            self.device
                .handle()
                .cmd_copy_buffer(self.handle, src, dst, regions);
        }
    }

    /// Copies buffer contents into an image.
    pub fn copy_buffer_to_image(
        &mut self,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        debug_assert!(self.is_recording());
        unsafe {
            self.device.handle().cmd_copy_buffer_to_image(
                self.handle,
                src,
                dst,
                dst_layout,
                regions,
            );
        }
    }

    /// Copies regions between images.
    pub fn copy_image(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageCopy],
    ) {
        debug_assert!(self.is_recording());
        unsafe {
            self.device.handle().cmd_copy_image(
                self.handle,
                src,
                src_layout,
                dst,
                dst_layout,
                regions,
            );
        }
    }

    /// Blits (scaled/filtered copy) between images.
    pub fn blit_image(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    ) {
        debug_assert!(self.is_recording());
        unsafe {
            self.device.handle().cmd_blit_image(
                self.handle,
                src,
                src_layout,
                dst,
                dst_layout,
                regions,
                filter,
            );
        }
    }

    /// Resolves a multisampled image into a single-sampled one.
    pub fn resolve_image(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageResolve],
    ) {
        debug_assert!(self.is_recording());
        unsafe {
            self.device.handle().cmd_resolve_image(
                self.handle,
                src,
                src_layout,
                dst,
                dst_layout,
                regions,
            );
        }
    }

    /// Records a pipeline barrier.
    pub fn pipeline_barrier(
        &mut self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        memory_barriers: &[vk::MemoryBarrier],
        buffer_barriers: &[vk::BufferMemoryBarrier],
        image_barriers: &[vk::ImageMemoryBarrier],
    ) {
        debug_assert!(self.is_recording());
        unsafe {
            self.device.handle().cmd_pipeline_barrier(
                self.handle,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                memory_barriers,
                buffer_barriers,
                image_barriers,
            );
        }
    }

    /// Resets a query pool range before reuse.
    pub fn reset_query_pool(&mut self, pool: vk::QueryPool, first_query: u32, query_count: u32) {
        debug_assert!(self.is_recording());
        unsafe {
            self.device
                .handle()
                .cmd_reset_query_pool(self.handle, pool, first_query, query_count);
        }
    }

    /// Begins a query.
    pub fn begin_query(&mut self, pool: vk::QueryPool, query: u32, flags: vk::QueryControlFlags) {
        debug_assert!(self.is_recording());
        unsafe {
            self.device
                .handle()
                .cmd_begin_query(self.handle, pool, query, flags);
        }
    }

    /// Ends a query.
    pub fn end_query(&mut self, pool: vk::QueryPool, query: u32) {
        debug_assert!(self.is_recording());
        unsafe { self.device.handle().cmd_end_query(self.handle, pool, query) };
    }

    /// Writes a timestamp at the given pipeline stage.
    pub fn write_timestamp(
        &mut self,
        stage: vk::PipelineStageFlags,
        pool: vk::QueryPool,
        query: u32,
    ) {
        debug_assert!(self.is_recording());
        unsafe {
            self.device
                .handle()
                .cmd_write_timestamp(self.handle, stage, pool, query);
        }
    }

    /// Executes recorded secondary buffers inside this primary.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidCommandBufferState`] if any secondary
    /// is not `Executable`.
    pub fn execute_commands(&mut self, secondaries: &[&CommandBuffer]) -> RhiResult<()> {
        debug_assert!(self.is_recording());
        debug_assert_eq!(self.level, CommandBufferLevel::Primary);

        let mut handles = Vec::with_capacity(secondaries.len());
        for secondary in secondaries {
            debug_assert_eq!(secondary.level(), CommandBufferLevel::Secondary);
            secondary.expect_state(CommandBufferState::Executable)?;
            handles.push(secondary.handle());
        }

        unsafe { self.device.handle().cmd_execute_commands(self.handle, &handles) };
        Ok(())
    }
}

// =============================================================================
// CommandPool
// =============================================================================

/// Command pool bound to one queue family and one recording thread.
///
/// Buffers are owned by the pool and reused frame to frame; callers
/// never hold one across a [`reset_pool`](Self::reset_pool).
pub struct CommandPool {
    device: Arc<Device>,
    handle: vk::CommandPool,
    queue_family_index: u32,
    thread_index: usize,
    reset_mode: ResetMode,
    resource_cache: Arc<ResourceCache>,
    descriptor_cache: Arc<Mutex<DescriptorCache>>,
    primary: Vec<CommandBuffer>,
    secondary: Vec<CommandBuffer>,
    active_primary: usize,
    active_secondary: usize,
}

impl CommandPool {
    /// Creates a command pool for `queue_family_index`.
    ///
    /// `thread_index` identifies the recording thread the pool serves;
    /// it only disambiguates pools in logs and frame bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns an error if native pool creation fails.
    pub fn new(
        device: Arc<Device>,
        queue_family_index: u32,
        thread_index: usize,
        reset_mode: ResetMode,
        resource_cache: Arc<ResourceCache>,
        descriptor_cache: Arc<Mutex<DescriptorCache>>,
    ) -> RhiResult<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(reset_mode.create_flags());
        let handle = unsafe { device.handle().create_command_pool(&create_info, None)? };

        debug!(
            "Created command pool (family {}, thread {}, {:?})",
            queue_family_index, thread_index, reset_mode
        );

        Ok(Self {
            device,
            handle,
            queue_family_index,
            thread_index,
            reset_mode,
            resource_cache,
            descriptor_cache,
            primary: Vec::new(),
            secondary: Vec::new(),
            active_primary: 0,
            active_secondary: 0,
        })
    }

    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    #[inline]
    pub fn thread_index(&self) -> usize {
        self.thread_index
    }

    #[inline]
    pub fn reset_mode(&self) -> ResetMode {
        self.reset_mode
    }

    /// Number of buffers handed out since the last reset.
    pub fn active_count(&self, level: CommandBufferLevel) -> usize {
        match level {
            CommandBufferLevel::Primary => self.active_primary,
            CommandBufferLevel::Secondary => self.active_secondary,
        }
    }

    /// Hands out the next command buffer of `level`.
    ///
    /// Reusable modes return previously allocated buffers in request
    /// order; [`ResetMode::AlwaysAllocate`] allocates fresh every time.
    ///
    /// # Errors
    ///
    /// Returns an error if buffer allocation fails.
    pub fn request_command_buffer(
        &mut self,
        level: CommandBufferLevel,
    ) -> RhiResult<&mut CommandBuffer> {
        let device = self.device.clone();
        let pool_handle = self.handle;
        let resource_cache = self.resource_cache.clone();
        let descriptor_cache = self.descriptor_cache.clone();
        let reset_mode = self.reset_mode;

        let (buffers, active) = match level {
            CommandBufferLevel::Primary => (&mut self.primary, &mut self.active_primary),
            CommandBufferLevel::Secondary => (&mut self.secondary, &mut self.active_secondary),
        };

        if reset_mode != ResetMode::AlwaysAllocate && *active < buffers.len() {
            let index = *active;
            *active += 1;
            return Ok(&mut buffers[index]);
        }

        let buffer = CommandBuffer::new(
            device,
            pool_handle,
            level,
            reset_mode,
            resource_cache,
            descriptor_cache,
        )?;
        buffers.push(buffer);
        *active += 1;
        let index = buffers.len() - 1;
        Ok(&mut buffers[index])
    }

    /// Recycles every buffer according to the pool's reset mode and
    /// rewinds the active counts.
    ///
    /// The caller must ensure the GPU has finished all of the pool's
    /// buffers, normally by waiting on the frame fence.
    ///
    /// # Errors
    ///
    /// Returns an error if a native reset or free fails.
    pub fn reset_pool(&mut self) -> RhiResult<()> {
        match self.reset_mode {
            ResetMode::ResetPool => {
                unsafe {
                    self.device
                        .handle()
                        .reset_command_pool(self.handle, vk::CommandPoolResetFlags::empty())?;
                }
                for buffer in self.primary.iter_mut().chain(self.secondary.iter_mut()) {
                    buffer.mark_reset();
                }
            }
            ResetMode::ResetIndividually => {
                for buffer in self
                    .primary
                    .iter_mut()
                    .take(self.active_primary)
                    .chain(self.secondary.iter_mut().take(self.active_secondary))
                {
                    buffer.reset(ResetMode::ResetIndividually)?;
                }
            }
            ResetMode::AlwaysAllocate => {
                let handles: Vec<vk::CommandBuffer> = self
                    .primary
                    .iter()
                    .chain(self.secondary.iter())
                    .map(|buffer| buffer.handle())
                    .collect();
                if !handles.is_empty() {
                    unsafe {
                        self.device.handle().free_command_buffers(self.handle, &handles);
                    }
                }
                self.primary.clear();
                self.secondary.clear();
            }
        }
        self.active_primary = 0;
        self.active_secondary = 0;
        Ok(())
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        // Destroying the pool frees its buffers; drop them first so no
        // CommandBuffer outlives the native pool.
        self.primary.clear();
        self.secondary.clear();
        unsafe {
            self.device.handle().destroy_command_pool(self.handle, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_mode_create_flags() {
        assert_eq!(
            ResetMode::ResetPool.create_flags(),
            vk::CommandPoolCreateFlags::TRANSIENT
        );
        assert_eq!(
            ResetMode::ResetIndividually.create_flags(),
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER
        );
        assert_eq!(
            ResetMode::AlwaysAllocate.create_flags(),
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER
        );
    }

    #[test]
    fn test_push_constants_accumulate_and_merge_range() {
        let mut state = PushConstantState::new(128);
        assert!(state.dirty().is_none());

        state.set(16, &[1, 2, 3, 4]).unwrap();
        state.set(4, &[9, 9]).unwrap();

        let (offset, bytes) = state.dirty().unwrap();
        assert_eq!(offset, 4);
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes[0], 9);
        assert_eq!(bytes[12], 1);

        state.clear_dirty();
        assert!(state.dirty().is_none());
    }

    #[test]
    fn test_push_constants_overflow() {
        let mut state = PushConstantState::new(64);
        let err = state.set(60, &[0; 8]).unwrap_err();
        match err {
            RhiError::PushConstantOverflow { requested, max } => {
                assert_eq!(requested, 68);
                assert_eq!(max, 64);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // A failed write leaves no dirty range.
        assert!(state.dirty().is_none());
    }

    #[test]
    fn test_push_constants_reset_zeroes() {
        let mut state = PushConstantState::new(32);
        state.set(0, &[0xFF; 8]).unwrap();
        state.reset();
        assert!(state.dirty().is_none());
        state.set(0, &[1]).unwrap();
        let (_, bytes) = state.dirty().unwrap();
        assert_eq!(bytes, &[1]);
    }

    #[test]
    fn test_push_range_clipping() {
        let vertex = vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::VERTEX,
            offset: 0,
            size: 16,
        };
        let fragment = vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::FRAGMENT,
            offset: 16,
            size: 16,
        };

        // A dirty span inside one range never leaks into the other.
        assert_eq!(clip_push_range(&vertex, 4, 12), Some((4, 12)));
        assert_eq!(clip_push_range(&fragment, 4, 12), None);

        // A span crossing the boundary splits along it.
        assert_eq!(clip_push_range(&vertex, 8, 24), Some((8, 16)));
        assert_eq!(clip_push_range(&fragment, 8, 24), Some((16, 24)));

        // Touching the edge without overlap emits nothing.
        assert_eq!(clip_push_range(&fragment, 0, 16), None);
    }

    #[test]
    fn test_reset_mode_names() {
        assert_eq!(ResetMode::ResetPool.as_str(), "ResetPool");
        assert_eq!(ResetMode::ResetIndividually.as_str(), "ResetIndividually");
        assert_eq!(ResetMode::AlwaysAllocate.as_str(), "AlwaysAllocate");
    }

    #[test]
    fn test_state_names_for_errors() {
        assert_eq!(CommandBufferState::Initial.as_str(), "Initial");
        assert_eq!(CommandBufferState::Recording.as_str(), "Recording");
        assert_eq!(CommandBufferState::Executable.as_str(), "Executable");
        assert_eq!(CommandBufferState::Invalid.as_str(), "Invalid");
    }

    #[test]
    fn test_level_to_vk() {
        assert_eq!(
            CommandBufferLevel::Primary.to_vk(),
            vk::CommandBufferLevel::PRIMARY
        );
        assert_eq!(
            CommandBufferLevel::Secondary.to_vk(),
            vk::CommandBufferLevel::SECONDARY
        );
    }
}
