//! Content-addressed caching of pipelines, render passes and
//! framebuffers.
//!
//! Every `request_*` call hashes the full description of the object; a
//! hit returns the existing handle, a miss builds the object and stores
//! it. Two call sites that describe the same pipeline therefore bind
//! the identical `vk::Pipeline`, and the driver-side cost of pipeline
//! creation is paid once per distinct state.
//!
//! The cache is shared across threads behind internal `Mutex`es. A lock
//! is held across a miss's driver build; pipeline builds are rare after
//! warm-up, so the simple scheme beats per-entry synchronization.

use std::collections::HashMap;
use std::ffi::CStr;
use std::sync::{Arc, Mutex};

use ash::vk;
use tracing::debug;

use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::pipeline::{PipelineState, SpecializationConstantState};

/// Shader entry point used for every stage.
const SHADER_ENTRY: &CStr = c"main";

/// One attachment of a cached render pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AttachmentInfo {
    pub format: vk::Format,
    pub samples: vk::SampleCountFlags,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
}

/// One subpass of a cached render pass, referencing attachments by
/// index into the attachment list.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct SubpassInfo {
    pub input_attachments: Vec<u32>,
    pub color_attachments: Vec<u32>,
    pub depth_stencil_attachment: Option<u32>,
}

/// Complete description of a render pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct RenderPassKey {
    pub attachments: Vec<AttachmentInfo>,
    pub subpasses: Vec<SubpassInfo>,
}

/// Complete description of a framebuffer.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FramebufferKey {
    pub render_pass: vk::RenderPass,
    pub attachments: Vec<vk::ImageView>,
    pub extent: vk::Extent2D,
    pub layers: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ComputePipelineKey {
    layout: vk::PipelineLayout,
    module: vk::ShaderModule,
    specialization: SpecializationConstantState,
}

/// Shared cache of driver objects that are expensive to create and
/// cheap to compare by description.
///
/// Frame-agnostic: cached objects live until [`clear`](Self::clear) or
/// drop. Framebuffers referencing swapchain views must be purged with
/// [`clear_framebuffers`](Self::clear_framebuffers) when the swapchain
/// is rebuilt.
pub struct ResourceCache {
    device: Arc<Device>,
    graphics_pipelines: Mutex<HashMap<PipelineState, vk::Pipeline>>,
    compute_pipelines: Mutex<HashMap<ComputePipelineKey, vk::Pipeline>>,
    render_passes: Mutex<HashMap<RenderPassKey, vk::RenderPass>>,
    framebuffers: Mutex<HashMap<FramebufferKey, vk::Framebuffer>>,
}

impl ResourceCache {
    pub fn new(device: Arc<Device>) -> Arc<Self> {
        Arc::new(Self {
            device,
            graphics_pipelines: Mutex::new(HashMap::new()),
            compute_pipelines: Mutex::new(HashMap::new()),
            render_passes: Mutex::new(HashMap::new()),
            framebuffers: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the graphics pipeline for a state snapshot, building it
    /// on first request.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::PipelineError`] if the state has no layout
    /// or no render pass, or a Vulkan error if the build fails.
    pub fn request_graphics_pipeline(&self, state: &PipelineState) -> RhiResult<vk::Pipeline> {
        let mut cache = self.graphics_pipelines.lock().unwrap();
        if let Some(pipeline) = cache.get(state) {
            return Ok(*pipeline);
        }

        let pipeline = self.build_graphics_pipeline(state)?;
        debug!("Built graphics pipeline #{}", cache.len());
        cache.insert(state.clone(), pipeline);
        Ok(pipeline)
    }

    /// Returns the compute pipeline for the state's layout, compute
    /// stage and specialization constants, building it on first request.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::PipelineError`] if the layout is missing or
    /// carries no compute stage.
    pub fn request_compute_pipeline(&self, state: &PipelineState) -> RhiResult<vk::Pipeline> {
        let layout = state
            .pipeline_layout()
            .ok_or_else(|| RhiError::PipelineError("no pipeline layout bound".into()))?;
        let stage = layout
            .stages()
            .iter()
            .find(|stage| stage.stage.contains(vk::ShaderStageFlags::COMPUTE))
            .ok_or_else(|| RhiError::PipelineError("layout has no compute stage".into()))?;

        let key = ComputePipelineKey {
            layout: layout.handle(),
            module: stage.module,
            specialization: state.specialization_constants().clone(),
        };

        let mut cache = self.compute_pipelines.lock().unwrap();
        if let Some(pipeline) = cache.get(&key) {
            return Ok(*pipeline);
        }

        let (spec_entries, spec_data) = specialization_parts(state.specialization_constants());
        let spec_info = vk::SpecializationInfo::default()
            .map_entries(&spec_entries)
            .data(&spec_data);

        let mut stage_info = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(stage.module)
            .name(SHADER_ENTRY);
        if !spec_entries.is_empty() {
            stage_info = stage_info.specialization_info(&spec_info);
        }

        let create_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage_info)
            .layout(layout.handle());

        let pipelines = unsafe {
            self.device
                .handle()
                .create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None)
                .map_err(|(_, err)| err)?
        };
        let pipeline = pipelines[0];

        debug!("Built compute pipeline #{}", cache.len());
        cache.insert(key, pipeline);
        Ok(pipeline)
    }

    /// Returns the render pass for a description, building it on first
    /// request.
    ///
    /// # Errors
    ///
    /// Returns an error if render pass creation fails.
    pub fn request_render_pass(&self, key: &RenderPassKey) -> RhiResult<vk::RenderPass> {
        let mut cache = self.render_passes.lock().unwrap();
        if let Some(render_pass) = cache.get(key) {
            return Ok(*render_pass);
        }

        let attachments: Vec<vk::AttachmentDescription> = key
            .attachments
            .iter()
            .map(|info| {
                vk::AttachmentDescription::default()
                    .format(info.format)
                    .samples(info.samples)
                    .load_op(info.load_op)
                    .store_op(info.store_op)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(info.initial_layout)
                    .final_layout(info.final_layout)
            })
            .collect();

        // Reference arrays must stay alive until create_render_pass.
        let mut color_refs: Vec<Vec<vk::AttachmentReference>> = Vec::new();
        let mut input_refs: Vec<Vec<vk::AttachmentReference>> = Vec::new();
        let mut depth_refs: Vec<Option<vk::AttachmentReference>> = Vec::new();
        for subpass in &key.subpasses {
            color_refs.push(
                subpass
                    .color_attachments
                    .iter()
                    .map(|&index| vk::AttachmentReference {
                        attachment: index,
                        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    })
                    .collect(),
            );
            input_refs.push(
                subpass
                    .input_attachments
                    .iter()
                    .map(|&index| vk::AttachmentReference {
                        attachment: index,
                        layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    })
                    .collect(),
            );
            depth_refs.push(subpass.depth_stencil_attachment.map(|index| {
                vk::AttachmentReference {
                    attachment: index,
                    layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                }
            }));
        }

        let subpasses: Vec<vk::SubpassDescription> = key
            .subpasses
            .iter()
            .enumerate()
            .map(|(index, _)| {
                let mut description = vk::SubpassDescription::default()
                    .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                    .color_attachments(&color_refs[index])
                    .input_attachments(&input_refs[index]);
                if let Some(depth) = depth_refs[index].as_ref() {
                    description = description.depth_stencil_attachment(depth);
                }
                description
            })
            .collect();

        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses);

        let render_pass = unsafe { self.device.handle().create_render_pass(&create_info, None)? };
        debug!(
            "Built render pass #{} ({} attachment(s), {} subpass(es))",
            cache.len(),
            key.attachments.len(),
            key.subpasses.len()
        );
        cache.insert(key.clone(), render_pass);
        Ok(render_pass)
    }

    /// Returns the framebuffer for a description, building it on first
    /// request.
    ///
    /// # Errors
    ///
    /// Returns an error if framebuffer creation fails.
    pub fn request_framebuffer(&self, key: &FramebufferKey) -> RhiResult<vk::Framebuffer> {
        let mut cache = self.framebuffers.lock().unwrap();
        if let Some(framebuffer) = cache.get(key) {
            return Ok(*framebuffer);
        }

        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(key.render_pass)
            .attachments(&key.attachments)
            .width(key.extent.width)
            .height(key.extent.height)
            .layers(key.layers);

        let framebuffer = unsafe { self.device.handle().create_framebuffer(&create_info, None)? };
        debug!("Built framebuffer #{} ({}x{})", cache.len(), key.extent.width, key.extent.height);
        cache.insert(key.clone(), framebuffer);
        Ok(framebuffer)
    }

    /// Destroys cached framebuffers. Required when the image views they
    /// reference are destroyed, e.g. on swapchain rebuild.
    pub fn clear_framebuffers(&self) {
        let mut cache = self.framebuffers.lock().unwrap();
        for framebuffer in cache.values() {
            unsafe {
                self.device.handle().destroy_framebuffer(*framebuffer, None);
            }
        }
        cache.clear();
    }

    /// Destroys every cached object. The caller must ensure the GPU is
    /// idle.
    pub fn clear(&self) {
        self.clear_framebuffers();
        unsafe {
            let mut pipelines = self.graphics_pipelines.lock().unwrap();
            for pipeline in pipelines.values() {
                self.device.handle().destroy_pipeline(*pipeline, None);
            }
            pipelines.clear();

            let mut pipelines = self.compute_pipelines.lock().unwrap();
            for pipeline in pipelines.values() {
                self.device.handle().destroy_pipeline(*pipeline, None);
            }
            pipelines.clear();

            let mut passes = self.render_passes.lock().unwrap();
            for render_pass in passes.values() {
                self.device.handle().destroy_render_pass(*render_pass, None);
            }
            passes.clear();
        }
    }

    /// Number of distinct graphics pipelines built so far.
    pub fn graphics_pipeline_count(&self) -> usize {
        self.graphics_pipelines.lock().unwrap().len()
    }

    /// Number of distinct render passes built so far.
    pub fn render_pass_count(&self) -> usize {
        self.render_passes.lock().unwrap().len()
    }

    fn build_graphics_pipeline(&self, state: &PipelineState) -> RhiResult<vk::Pipeline> {
        let layout = state
            .pipeline_layout()
            .ok_or_else(|| RhiError::PipelineError("no pipeline layout bound".into()))?;
        if state.render_pass() == vk::RenderPass::null() {
            return Err(RhiError::PipelineError(
                "no render pass bound for graphics pipeline".into(),
            ));
        }

        let (spec_entries, spec_data) = specialization_parts(state.specialization_constants());
        let spec_info = vk::SpecializationInfo::default()
            .map_entries(&spec_entries)
            .data(&spec_data);

        let stages: Vec<vk::PipelineShaderStageCreateInfo> = layout
            .stages()
            .iter()
            .map(|stage| {
                let mut info = vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage.stage)
                    .module(stage.module)
                    .name(SHADER_ENTRY);
                if !spec_entries.is_empty() {
                    info = info.specialization_info(&spec_info);
                }
                info
            })
            .collect();

        let vertex_input = state.vertex_input_state();
        let binding_descriptions: Vec<vk::VertexInputBindingDescription> = vertex_input
            .bindings
            .iter()
            .map(|binding| vk::VertexInputBindingDescription {
                binding: binding.binding,
                stride: binding.stride,
                input_rate: binding.input_rate,
            })
            .collect();
        let attribute_descriptions: Vec<vk::VertexInputAttributeDescription> = vertex_input
            .attributes
            .iter()
            .map(|attribute| vk::VertexInputAttributeDescription {
                location: attribute.location,
                binding: attribute.binding,
                format: attribute.format,
                offset: attribute.offset,
            })
            .collect();
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&binding_descriptions)
            .vertex_attribute_descriptions(&attribute_descriptions);

        let input_assembly = state.input_assembly_state();
        let input_assembly_info = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(input_assembly.topology.to_vk())
            .primitive_restart_enable(input_assembly.primitive_restart_enable);

        // Viewport and scissor are dynamic; only the counts matter here.
        let viewport_info = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let raster = state.rasterization_state();
        let rasterization_info = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(raster.depth_clamp_enable)
            .rasterizer_discard_enable(raster.rasterizer_discard_enable)
            .polygon_mode(raster.polygon_mode.to_vk())
            .cull_mode(raster.cull_mode.to_vk())
            .front_face(raster.front_face.to_vk())
            .depth_bias_enable(raster.depth_bias_enable)
            .depth_bias_constant_factor(raster.depth_bias_constant_factor)
            .depth_bias_clamp(raster.depth_bias_clamp)
            .depth_bias_slope_factor(raster.depth_bias_slope_factor)
            .line_width(raster.line_width);

        let multisample = state.multisample_state();
        let multisample_info = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(multisample.rasterization_samples)
            .sample_shading_enable(multisample.sample_shading_enable)
            .min_sample_shading(multisample.min_sample_shading)
            .alpha_to_coverage_enable(multisample.alpha_to_coverage_enable)
            .alpha_to_one_enable(multisample.alpha_to_one_enable);

        let depth_stencil = state.depth_stencil_state();
        let depth_stencil_info = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(depth_stencil.depth_test_enable)
            .depth_write_enable(depth_stencil.depth_write_enable)
            .depth_compare_op(depth_stencil.depth_compare_op.to_vk())
            .depth_bounds_test_enable(depth_stencil.depth_bounds_test_enable)
            .stencil_test_enable(depth_stencil.stencil_test_enable)
            .front(depth_stencil.front.to_vk())
            .back(depth_stencil.back.to_vk());

        let color_blend = state.color_blend_state();
        let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = color_blend
            .attachments
            .iter()
            .map(|attachment| attachment.to_vk())
            .collect();
        let color_blend_info = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(color_blend.logic_op_enable)
            .logic_op(color_blend.logic_op)
            .attachments(&blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_info =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly_info)
            .viewport_state(&viewport_info)
            .rasterization_state(&rasterization_info)
            .multisample_state(&multisample_info)
            .depth_stencil_state(&depth_stencil_info)
            .color_blend_state(&color_blend_info)
            .dynamic_state(&dynamic_info)
            .layout(layout.handle())
            .render_pass(state.render_pass())
            .subpass(state.subpass_index());

        let pipelines = unsafe {
            self.device
                .handle()
                .create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
                .map_err(|(_, err)| err)?
        };
        Ok(pipelines[0])
    }
}

impl Drop for ResourceCache {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Flattens specialization constants into map entries plus one packed
/// data buffer.
fn specialization_parts(
    constants: &SpecializationConstantState,
) -> (Vec<vk::SpecializationMapEntry>, Vec<u8>) {
    let mut entries = Vec::new();
    let mut data = Vec::new();
    for (constant_id, bytes) in constants.iter() {
        entries.push(vk::SpecializationMapEntry {
            constant_id,
            offset: data.len() as u32,
            size: bytes.len(),
        });
        data.extend_from_slice(bytes);
    }
    (entries, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn hash_of<T: Hash>(value: &T) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_specialization_parts_pack_in_id_order() {
        let mut constants = SpecializationConstantState::default();
        constants.set(7, &1u32.to_le_bytes());
        constants.set(2, &[0xAB]);

        let (entries, data) = specialization_parts(&constants);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].constant_id, 2);
        assert_eq!(entries[0].offset, 0);
        assert_eq!(entries[0].size, 1);
        assert_eq!(entries[1].constant_id, 7);
        assert_eq!(entries[1].offset, 1);
        assert_eq!(entries[1].size, 4);
        assert_eq!(data.len(), 5);
    }

    #[test]
    fn test_render_pass_keys_compare_by_content() {
        let key = RenderPassKey {
            attachments: vec![AttachmentInfo {
                format: vk::Format::B8G8R8A8_SRGB,
                samples: vk::SampleCountFlags::TYPE_1,
                load_op: vk::AttachmentLoadOp::CLEAR,
                store_op: vk::AttachmentStoreOp::STORE,
                initial_layout: vk::ImageLayout::UNDEFINED,
                final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            }],
            subpasses: vec![SubpassInfo {
                color_attachments: vec![0],
                ..Default::default()
            }],
        };

        let same = key.clone();
        assert_eq!(key, same);
        assert_eq!(hash_of(&key), hash_of(&same));

        let mut different = key.clone();
        different.attachments[0].load_op = vk::AttachmentLoadOp::LOAD;
        assert_ne!(key, different);
    }
}
