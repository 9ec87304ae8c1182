//! Pipeline layout and tracked pipeline state.
//!
//! This module provides:
//! - Strongly-typed fixed-function enums with `to_vk` conversions
//! - The per-stage state blocks ([`VertexInputState`],
//!   [`RasterizationState`], ...)
//! - [`PipelineState`] - the dirty-flagged aggregate a command buffer
//!   mutates during recording
//! - [`PipelineLayout`] - the native layout plus the shader stages and
//!   set layouts needed to build pipelines from a state snapshot
//!
//! # Dirty tracking
//!
//! Every setter on [`PipelineState`] compares against the current value
//! and only marks the state dirty on an actual change. The state hashes
//! and compares over every field except the dirty bit, so a snapshot is
//! its own cache key: flushing an unchanged state twice must find the
//! same cached pipeline (see [`ResourceCache`](crate::cache::ResourceCache)).

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::descriptor::DescriptorSetLayout;
use crate::device::Device;
use crate::error::RhiResult;

// =============================================================================
// Fixed-function enums
// =============================================================================

/// Primitive topology for input assembly.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
    TriangleFan,
}

impl PrimitiveTopology {
    /// Converts to the Vulkan topology.
    pub fn to_vk(self) -> vk::PrimitiveTopology {
        match self {
            PrimitiveTopology::PointList => vk::PrimitiveTopology::POINT_LIST,
            PrimitiveTopology::LineList => vk::PrimitiveTopology::LINE_LIST,
            PrimitiveTopology::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
            PrimitiveTopology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
            PrimitiveTopology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
            PrimitiveTopology::TriangleFan => vk::PrimitiveTopology::TRIANGLE_FAN,
        }
    }
}

/// Polygon rasterization mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PolygonMode {
    #[default]
    Fill,
    Line,
    Point,
}

impl PolygonMode {
    /// Converts to the Vulkan polygon mode.
    pub fn to_vk(self) -> vk::PolygonMode {
        match self {
            PolygonMode::Fill => vk::PolygonMode::FILL,
            PolygonMode::Line => vk::PolygonMode::LINE,
            PolygonMode::Point => vk::PolygonMode::POINT,
        }
    }
}

/// Face culling mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CullMode {
    None,
    Front,
    #[default]
    Back,
    FrontAndBack,
}

impl CullMode {
    /// Converts to Vulkan cull mode flags.
    pub fn to_vk(self) -> vk::CullModeFlags {
        match self {
            CullMode::None => vk::CullModeFlags::NONE,
            CullMode::Front => vk::CullModeFlags::FRONT,
            CullMode::Back => vk::CullModeFlags::BACK,
            CullMode::FrontAndBack => vk::CullModeFlags::FRONT_AND_BACK,
        }
    }
}

/// Winding order that defines the front face.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FrontFace {
    #[default]
    CounterClockwise,
    Clockwise,
}

impl FrontFace {
    /// Converts to the Vulkan front face.
    pub fn to_vk(self) -> vk::FrontFace {
        match self {
            FrontFace::CounterClockwise => vk::FrontFace::COUNTER_CLOCKWISE,
            FrontFace::Clockwise => vk::FrontFace::CLOCKWISE,
        }
    }
}

/// Depth/stencil comparison operator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Never,
    Less,
    Equal,
    #[default]
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

impl CompareOp {
    /// Converts to the Vulkan compare op.
    pub fn to_vk(self) -> vk::CompareOp {
        match self {
            CompareOp::Never => vk::CompareOp::NEVER,
            CompareOp::Less => vk::CompareOp::LESS,
            CompareOp::Equal => vk::CompareOp::EQUAL,
            CompareOp::LessOrEqual => vk::CompareOp::LESS_OR_EQUAL,
            CompareOp::Greater => vk::CompareOp::GREATER,
            CompareOp::NotEqual => vk::CompareOp::NOT_EQUAL,
            CompareOp::GreaterOrEqual => vk::CompareOp::GREATER_OR_EQUAL,
            CompareOp::Always => vk::CompareOp::ALWAYS,
        }
    }
}

/// Blend factor for color blending.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    DstColor,
    OneMinusDstColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
}

impl BlendFactor {
    /// Converts to the Vulkan blend factor.
    pub fn to_vk(self) -> vk::BlendFactor {
        match self {
            BlendFactor::Zero => vk::BlendFactor::ZERO,
            BlendFactor::One => vk::BlendFactor::ONE,
            BlendFactor::SrcColor => vk::BlendFactor::SRC_COLOR,
            BlendFactor::OneMinusSrcColor => vk::BlendFactor::ONE_MINUS_SRC_COLOR,
            BlendFactor::DstColor => vk::BlendFactor::DST_COLOR,
            BlendFactor::OneMinusDstColor => vk::BlendFactor::ONE_MINUS_DST_COLOR,
            BlendFactor::SrcAlpha => vk::BlendFactor::SRC_ALPHA,
            BlendFactor::OneMinusSrcAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            BlendFactor::DstAlpha => vk::BlendFactor::DST_ALPHA,
            BlendFactor::OneMinusDstAlpha => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
        }
    }
}

/// Blend operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlendOp {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

impl BlendOp {
    /// Converts to the Vulkan blend op.
    pub fn to_vk(self) -> vk::BlendOp {
        match self {
            BlendOp::Add => vk::BlendOp::ADD,
            BlendOp::Subtract => vk::BlendOp::SUBTRACT,
            BlendOp::ReverseSubtract => vk::BlendOp::REVERSE_SUBTRACT,
            BlendOp::Min => vk::BlendOp::MIN,
            BlendOp::Max => vk::BlendOp::MAX,
        }
    }
}

// =============================================================================
// State blocks
// =============================================================================

/// One vertex buffer binding slot description.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexInputBinding {
    pub binding: u32,
    pub stride: u32,
    /// Per-vertex or per-instance stepping.
    pub input_rate: vk::VertexInputRate,
}

/// One vertex attribute description.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexInputAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: vk::Format,
    pub offset: u32,
}

/// Vertex input layout: bindings and attributes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct VertexInputState {
    pub bindings: Vec<VertexInputBinding>,
    pub attributes: Vec<VertexInputAttribute>,
}

/// Input assembly configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct InputAssemblyState {
    pub topology: PrimitiveTopology,
    pub primitive_restart_enable: bool,
}

/// Rasterization configuration.
#[derive(Clone, Copy, Debug)]
pub struct RasterizationState {
    pub depth_clamp_enable: bool,
    pub rasterizer_discard_enable: bool,
    pub polygon_mode: PolygonMode,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub depth_bias_enable: bool,
    pub depth_bias_constant_factor: f32,
    pub depth_bias_clamp: f32,
    pub depth_bias_slope_factor: f32,
    pub line_width: f32,
}

impl Default for RasterizationState {
    fn default() -> Self {
        Self {
            depth_clamp_enable: false,
            rasterizer_discard_enable: false,
            polygon_mode: PolygonMode::Fill,
            cull_mode: CullMode::Back,
            front_face: FrontFace::CounterClockwise,
            depth_bias_enable: false,
            depth_bias_constant_factor: 0.0,
            depth_bias_clamp: 0.0,
            depth_bias_slope_factor: 0.0,
            line_width: 1.0,
        }
    }
}

// Floats compare and hash by bit pattern so the state can act as a cache
// key; NaN payloads are preserved rather than collapsed.
impl PartialEq for RasterizationState {
    fn eq(&self, other: &Self) -> bool {
        self.depth_clamp_enable == other.depth_clamp_enable
            && self.rasterizer_discard_enable == other.rasterizer_discard_enable
            && self.polygon_mode == other.polygon_mode
            && self.cull_mode == other.cull_mode
            && self.front_face == other.front_face
            && self.depth_bias_enable == other.depth_bias_enable
            && self.depth_bias_constant_factor.to_bits() == other.depth_bias_constant_factor.to_bits()
            && self.depth_bias_clamp.to_bits() == other.depth_bias_clamp.to_bits()
            && self.depth_bias_slope_factor.to_bits() == other.depth_bias_slope_factor.to_bits()
            && self.line_width.to_bits() == other.line_width.to_bits()
    }
}

impl Eq for RasterizationState {}

impl Hash for RasterizationState {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.depth_clamp_enable.hash(state);
        self.rasterizer_discard_enable.hash(state);
        self.polygon_mode.hash(state);
        self.cull_mode.hash(state);
        self.front_face.hash(state);
        self.depth_bias_enable.hash(state);
        self.depth_bias_constant_factor.to_bits().hash(state);
        self.depth_bias_clamp.to_bits().hash(state);
        self.depth_bias_slope_factor.to_bits().hash(state);
        self.line_width.to_bits().hash(state);
    }
}

/// Multisampling configuration.
#[derive(Clone, Copy, Debug)]
pub struct MultisampleState {
    pub rasterization_samples: vk::SampleCountFlags,
    pub sample_shading_enable: bool,
    pub min_sample_shading: f32,
    pub alpha_to_coverage_enable: bool,
    pub alpha_to_one_enable: bool,
}

impl Default for MultisampleState {
    fn default() -> Self {
        Self {
            rasterization_samples: vk::SampleCountFlags::TYPE_1,
            sample_shading_enable: false,
            min_sample_shading: 0.0,
            alpha_to_coverage_enable: false,
            alpha_to_one_enable: false,
        }
    }
}

impl PartialEq for MultisampleState {
    fn eq(&self, other: &Self) -> bool {
        self.rasterization_samples == other.rasterization_samples
            && self.sample_shading_enable == other.sample_shading_enable
            && self.min_sample_shading.to_bits() == other.min_sample_shading.to_bits()
            && self.alpha_to_coverage_enable == other.alpha_to_coverage_enable
            && self.alpha_to_one_enable == other.alpha_to_one_enable
    }
}

impl Eq for MultisampleState {}

impl Hash for MultisampleState {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rasterization_samples.hash(state);
        self.sample_shading_enable.hash(state);
        self.min_sample_shading.to_bits().hash(state);
        self.alpha_to_coverage_enable.hash(state);
        self.alpha_to_one_enable.hash(state);
    }
}

/// Per-face stencil configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StencilOpState {
    pub fail_op: vk::StencilOp,
    pub pass_op: vk::StencilOp,
    pub depth_fail_op: vk::StencilOp,
    pub compare_op: CompareOp,
}

impl Default for StencilOpState {
    fn default() -> Self {
        Self {
            fail_op: vk::StencilOp::KEEP,
            pass_op: vk::StencilOp::KEEP,
            depth_fail_op: vk::StencilOp::KEEP,
            compare_op: CompareOp::Always,
        }
    }
}

impl StencilOpState {
    /// Converts to the Vulkan stencil op state.
    ///
    /// Compare mask, write mask and reference are dynamic state.
    pub fn to_vk(self) -> vk::StencilOpState {
        vk::StencilOpState {
            fail_op: self.fail_op,
            pass_op: self.pass_op,
            depth_fail_op: self.depth_fail_op,
            compare_op: self.compare_op.to_vk(),
            compare_mask: !0,
            write_mask: !0,
            reference: !0,
        }
    }
}

/// Depth/stencil configuration.
///
/// Depth bounds values are dynamic state and do not participate here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DepthStencilState {
    pub depth_test_enable: bool,
    pub depth_write_enable: bool,
    pub depth_compare_op: CompareOp,
    pub depth_bounds_test_enable: bool,
    pub stencil_test_enable: bool,
    pub front: StencilOpState,
    pub back: StencilOpState,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self {
            depth_test_enable: true,
            depth_write_enable: true,
            depth_compare_op: CompareOp::LessOrEqual,
            depth_bounds_test_enable: false,
            stencil_test_enable: false,
            front: StencilOpState::default(),
            back: StencilOpState::default(),
        }
    }
}

/// Per-attachment blend configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ColorBlendAttachment {
    pub blend_enable: bool,
    pub src_color_blend_factor: BlendFactor,
    pub dst_color_blend_factor: BlendFactor,
    pub color_blend_op: BlendOp,
    pub src_alpha_blend_factor: BlendFactor,
    pub dst_alpha_blend_factor: BlendFactor,
    pub alpha_blend_op: BlendOp,
    pub color_write_mask: vk::ColorComponentFlags,
}

impl Default for ColorBlendAttachment {
    fn default() -> Self {
        Self {
            blend_enable: false,
            src_color_blend_factor: BlendFactor::One,
            dst_color_blend_factor: BlendFactor::Zero,
            color_blend_op: BlendOp::Add,
            src_alpha_blend_factor: BlendFactor::One,
            dst_alpha_blend_factor: BlendFactor::Zero,
            alpha_blend_op: BlendOp::Add,
            color_write_mask: vk::ColorComponentFlags::RGBA,
        }
    }
}

impl ColorBlendAttachment {
    /// Standard alpha blending configuration.
    pub fn alpha_blend() -> Self {
        Self {
            blend_enable: true,
            src_color_blend_factor: BlendFactor::SrcAlpha,
            dst_color_blend_factor: BlendFactor::OneMinusSrcAlpha,
            color_blend_op: BlendOp::Add,
            src_alpha_blend_factor: BlendFactor::One,
            dst_alpha_blend_factor: BlendFactor::OneMinusSrcAlpha,
            alpha_blend_op: BlendOp::Add,
            color_write_mask: vk::ColorComponentFlags::RGBA,
        }
    }

    /// Converts to the Vulkan attachment blend state.
    pub fn to_vk(&self) -> vk::PipelineColorBlendAttachmentState {
        vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(self.blend_enable)
            .src_color_blend_factor(self.src_color_blend_factor.to_vk())
            .dst_color_blend_factor(self.dst_color_blend_factor.to_vk())
            .color_blend_op(self.color_blend_op.to_vk())
            .src_alpha_blend_factor(self.src_alpha_blend_factor.to_vk())
            .dst_alpha_blend_factor(self.dst_alpha_blend_factor.to_vk())
            .alpha_blend_op(self.alpha_blend_op.to_vk())
            .color_write_mask(self.color_write_mask)
    }
}

/// Color blend configuration across all attachments.
///
/// Blend constants are dynamic state and do not participate here.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ColorBlendState {
    pub logic_op_enable: bool,
    pub logic_op: vk::LogicOp,
    pub attachments: Vec<ColorBlendAttachment>,
}

impl Default for ColorBlendState {
    fn default() -> Self {
        Self {
            logic_op_enable: false,
            logic_op: vk::LogicOp::CLEAR,
            attachments: vec![ColorBlendAttachment::default()],
        }
    }
}

/// Specialization constant bytes keyed by constant id.
///
/// Stored as raw little-endian bytes; a `BTreeMap` keeps iteration (and
/// therefore hashing) deterministic.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct SpecializationConstantState {
    constants: std::collections::BTreeMap<u32, Vec<u8>>,
}

impl SpecializationConstantState {
    /// Sets the bytes for one constant id, returning true if the value
    /// actually changed.
    pub fn set(&mut self, constant_id: u32, data: &[u8]) -> bool {
        match self.constants.get(&constant_id) {
            Some(existing) if existing.as_slice() == data => false,
            _ => {
                self.constants.insert(constant_id, data.to_vec());
                true
            }
        }
    }

    /// Returns true if no constants are set.
    pub fn is_empty(&self) -> bool {
        self.constants.is_empty()
    }

    /// Iterates over `(constant_id, bytes)` pairs in id order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &[u8])> {
        self.constants.iter().map(|(id, data)| (*id, data.as_slice()))
    }

    /// Removes every constant.
    pub fn clear(&mut self) {
        self.constants.clear();
    }
}

// =============================================================================
// PipelineLayout
// =============================================================================

/// One programmable stage of a pipeline.
///
/// Shader modules are created and owned by the caller (shader
/// compilation lives outside this crate); the layout only references
/// them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ShaderStage {
    pub stage: vk::ShaderStageFlags,
    pub module: vk::ShaderModule,
}

/// Pipeline layout wrapper.
///
/// Owns the native `vk::PipelineLayout` and keeps the shader stages, set
/// layouts, and push constant ranges it was built from, so a pipeline
/// can be created from a [`PipelineState`] snapshot and descriptor
/// flushing can see the binding types of each set.
pub struct PipelineLayout {
    /// Reference to the logical device.
    device: Arc<Device>,
    /// Vulkan pipeline layout handle.
    layout: vk::PipelineLayout,
    /// Programmable stages, in stage order.
    stages: Vec<ShaderStage>,
    /// Descriptor set layouts, indexed by set number.
    set_layouts: Vec<Arc<DescriptorSetLayout>>,
    /// Push constant ranges declared by the shaders.
    push_constant_ranges: Vec<vk::PushConstantRange>,
}

impl PipelineLayout {
    /// Creates a pipeline layout.
    ///
    /// # Errors
    ///
    /// Returns an error if native layout creation fails.
    pub fn new(
        device: Arc<Device>,
        stages: Vec<ShaderStage>,
        set_layouts: Vec<Arc<DescriptorSetLayout>>,
        push_constant_ranges: Vec<vk::PushConstantRange>,
    ) -> RhiResult<Arc<Self>> {
        let raw_layouts: Vec<vk::DescriptorSetLayout> =
            set_layouts.iter().map(|layout| layout.handle()).collect();

        let create_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&raw_layouts)
            .push_constant_ranges(&push_constant_ranges);

        let layout = unsafe { device.handle().create_pipeline_layout(&create_info, None)? };

        debug!(
            "Created pipeline layout with {} set layout(s), {} stage(s)",
            set_layouts.len(),
            stages.len()
        );

        Ok(Arc::new(Self {
            device,
            layout,
            stages,
            set_layouts,
            push_constant_ranges,
        }))
    }

    /// Returns the Vulkan pipeline layout handle.
    #[inline]
    pub fn handle(&self) -> vk::PipelineLayout {
        self.layout
    }

    /// Returns the programmable stages.
    #[inline]
    pub fn stages(&self) -> &[ShaderStage] {
        &self.stages
    }

    /// Returns the descriptor set layout for `set`, if declared.
    pub fn set_layout(&self, set: u32) -> Option<&Arc<DescriptorSetLayout>> {
        self.set_layouts.get(set as usize)
    }

    /// Returns every descriptor set layout, indexed by set number.
    #[inline]
    pub fn set_layouts(&self) -> &[Arc<DescriptorSetLayout>] {
        &self.set_layouts
    }

    /// Push constant ranges declared by the layout's shaders.
    #[inline]
    pub fn push_constant_ranges(&self) -> &[vk::PushConstantRange] {
        &self.push_constant_ranges
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_pipeline_layout(self.layout, None);
        }
    }
}

impl std::fmt::Debug for PipelineLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineLayout")
            .field("handle", &self.layout)
            .field("stages", &self.stages.len())
            .field("set_layouts", &self.set_layouts.len())
            .finish()
    }
}

// =============================================================================
// PipelineState
// =============================================================================

/// Tracked description of the complete pipeline configuration.
///
/// A command buffer owns one of these and mutates it through the
/// setters; nothing native happens until the next draw/dispatch flushes
/// the state into a cached `vk::Pipeline`. Setters only raise the dirty
/// flag on an actual change, so redundant state calls between draws are
/// free.
#[derive(Clone, Debug, Default)]
pub struct PipelineState {
    dirty: bool,
    pipeline_layout: Option<Arc<PipelineLayout>>,
    render_pass: vk::RenderPass,
    subpass_index: u32,
    vertex_input: VertexInputState,
    input_assembly: InputAssemblyState,
    rasterization: RasterizationState,
    multisample: MultisampleState,
    depth_stencil: DepthStencilState,
    color_blend: ColorBlendState,
    specialization: SpecializationConstantState,
}

macro_rules! compare_and_set {
    ($self:ident, $field:ident, $value:expr) => {{
        let value = $value;
        if $self.$field != value {
            $self.$field = value;
            $self.dirty = true;
        }
    }};
}

impl PipelineState {
    /// Returns a clean default state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears everything back to defaults and drops the dirty flag.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// True if any setter changed the state since the last flush.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Marks the state clean. Called by the flush path after binding the
    /// cached pipeline.
    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Binds the pipeline layout used for subsequent flushes.
    pub fn set_pipeline_layout(&mut self, layout: Arc<PipelineLayout>) {
        let changed = self
            .pipeline_layout
            .as_ref()
            .map_or(true, |current| current.handle() != layout.handle());
        if changed {
            self.pipeline_layout = Some(layout);
            self.dirty = true;
        }
    }

    /// Sets the render pass the pipeline will execute in.
    pub fn set_render_pass(&mut self, render_pass: vk::RenderPass) {
        compare_and_set!(self, render_pass, render_pass);
    }

    /// Sets the subpass index within the render pass.
    pub fn set_subpass_index(&mut self, subpass_index: u32) {
        compare_and_set!(self, subpass_index, subpass_index);
    }

    pub fn set_vertex_input_state(&mut self, state: VertexInputState) {
        compare_and_set!(self, vertex_input, state);
    }

    pub fn set_input_assembly_state(&mut self, state: InputAssemblyState) {
        compare_and_set!(self, input_assembly, state);
    }

    pub fn set_rasterization_state(&mut self, state: RasterizationState) {
        compare_and_set!(self, rasterization, state);
    }

    pub fn set_multisample_state(&mut self, state: MultisampleState) {
        compare_and_set!(self, multisample, state);
    }

    pub fn set_depth_stencil_state(&mut self, state: DepthStencilState) {
        compare_and_set!(self, depth_stencil, state);
    }

    pub fn set_color_blend_state(&mut self, state: ColorBlendState) {
        compare_and_set!(self, color_blend, state);
    }

    /// Sets one specialization constant's bytes.
    pub fn set_specialization_constant(&mut self, constant_id: u32, data: &[u8]) {
        if self.specialization.set(constant_id, data) {
            self.dirty = true;
        }
    }

    // Accessors used by the flush/caching path.

    pub fn pipeline_layout(&self) -> Option<&Arc<PipelineLayout>> {
        self.pipeline_layout.as_ref()
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn subpass_index(&self) -> u32 {
        self.subpass_index
    }

    pub fn vertex_input_state(&self) -> &VertexInputState {
        &self.vertex_input
    }

    pub fn input_assembly_state(&self) -> &InputAssemblyState {
        &self.input_assembly
    }

    pub fn rasterization_state(&self) -> &RasterizationState {
        &self.rasterization
    }

    pub fn multisample_state(&self) -> &MultisampleState {
        &self.multisample
    }

    pub fn depth_stencil_state(&self) -> &DepthStencilState {
        &self.depth_stencil
    }

    pub fn color_blend_state(&self) -> &ColorBlendState {
        &self.color_blend
    }

    pub fn specialization_constants(&self) -> &SpecializationConstantState {
        &self.specialization
    }
}

// The dirty flag is bookkeeping, not configuration: two states that
// describe the same pipeline must collide in the cache regardless of it.
impl PartialEq for PipelineState {
    fn eq(&self, other: &Self) -> bool {
        let layout_eq = match (&self.pipeline_layout, &other.pipeline_layout) {
            (Some(a), Some(b)) => a.handle() == b.handle(),
            (None, None) => true,
            _ => false,
        };
        layout_eq
            && self.render_pass == other.render_pass
            && self.subpass_index == other.subpass_index
            && self.vertex_input == other.vertex_input
            && self.input_assembly == other.input_assembly
            && self.rasterization == other.rasterization
            && self.multisample == other.multisample
            && self.depth_stencil == other.depth_stencil
            && self.color_blend == other.color_blend
            && self.specialization == other.specialization
    }
}

impl Eq for PipelineState {}

impl Hash for PipelineState {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.pipeline_layout
            .as_ref()
            .map(|layout| layout.handle())
            .hash(state);
        self.render_pass.hash(state);
        self.subpass_index.hash(state);
        self.vertex_input.hash(state);
        self.input_assembly.hash(state);
        self.rasterization.hash(state);
        self.multisample.hash(state);
        self.depth_stencil.hash(state);
        self.color_blend.hash(state);
        self.specialization.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(state: &PipelineState) -> u64 {
        let mut hasher = DefaultHasher::new();
        state.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_setters_dirty_only_on_change() {
        let mut state = PipelineState::new();
        assert!(!state.is_dirty());

        // Setting the default value is a no-op.
        state.set_rasterization_state(RasterizationState::default());
        assert!(!state.is_dirty());

        state.set_rasterization_state(RasterizationState {
            cull_mode: CullMode::None,
            ..Default::default()
        });
        assert!(state.is_dirty());

        state.clear_dirty();
        // Same value again: stays clean.
        state.set_rasterization_state(RasterizationState {
            cull_mode: CullMode::None,
            ..Default::default()
        });
        assert!(!state.is_dirty());
    }

    #[test]
    fn test_unchanged_state_keeps_its_key() {
        let mut a = PipelineState::new();
        let b = PipelineState::new();
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));

        // Dirty flag does not participate in the key.
        a.set_subpass_index(1);
        a.set_subpass_index(0);
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn test_single_field_change_changes_key() {
        let base = PipelineState::new();

        let mut changed = base.clone();
        changed.set_input_assembly_state(InputAssemblyState {
            topology: PrimitiveTopology::LineList,
            primitive_restart_enable: false,
        });
        assert_ne!(base, changed);
        assert_ne!(hash_of(&base), hash_of(&changed));

        let mut changed = base.clone();
        changed.set_subpass_index(2);
        assert_ne!(base, changed);
        assert_ne!(hash_of(&base), hash_of(&changed));

        let mut changed = base.clone();
        changed.set_specialization_constant(0, &16u32.to_le_bytes());
        assert_ne!(base, changed);
        assert_ne!(hash_of(&base), hash_of(&changed));
    }

    #[test]
    fn test_specialization_constant_set_reports_change() {
        let mut constants = SpecializationConstantState::default();
        assert!(constants.set(3, &[1, 2, 3, 4]));
        assert!(!constants.set(3, &[1, 2, 3, 4]));
        assert!(constants.set(3, &[4, 3, 2, 1]));
        assert_eq!(constants.iter().count(), 1);
    }

    #[test]
    fn test_reset_clears_state_and_dirty() {
        let mut state = PipelineState::new();
        state.set_subpass_index(3);
        assert!(state.is_dirty());

        state.reset();
        assert!(!state.is_dirty());
        assert_eq!(state.subpass_index(), 0);
        assert_eq!(state, PipelineState::new());
    }

    #[test]
    fn test_float_fields_hash_by_bits() {
        let a = RasterizationState {
            line_width: 2.0,
            ..Default::default()
        };
        let b = RasterizationState {
            line_width: 2.0,
            ..Default::default()
        };
        assert_eq!(a, b);

        let c = RasterizationState {
            line_width: 3.0,
            ..Default::default()
        };
        assert_ne!(a, c);
    }
}
