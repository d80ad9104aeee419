use std::path::{Path, PathBuf};
use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::descriptor::{
    AllocateSetsError, BindingResource, DescriptorBindingSpec, DescriptorPool,
    DescriptorSet, DescriptorSetLayout, PoolCreationError,
    WriteDescriptorError, create_descriptor_pool, create_descriptor_sets,
    write_descriptor_sets,
};
use crate::device::RawDevice;
use crate::shader::{ShaderLoadError, ShaderModule, ShaderStage};
use crate::vertex::Vertex;

pub const DEFAULT_PIPELINE_NAME: &str = "default pipeline name";

/// States supplied at record time rather than baked into the pipeline.
pub const DYNAMIC_STATES: [vk::DynamicState; 3] = [
    vk::DynamicState::VIEWPORT,
    vk::DynamicState::SCISSOR,
    vk::DynamicState::CULL_MODE,
];

// ---------------------------------------------------------------------------
// Fixed-function state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputAssemblyState {
    pub topology: vk::PrimitiveTopology,
    pub primitive_restart: bool,
}

impl Default for InputAssemblyState {
    fn default() -> Self {
        Self {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            primitive_restart: false,
        }
    }
}

impl InputAssemblyState {
    fn to_vk(self) -> vk::PipelineInputAssemblyStateCreateInfo<'static> {
        vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(self.topology)
            .primitive_restart_enable(self.primitive_restart)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterizerState {
    pub polygon_mode: vk::PolygonMode,
    /// Baked into the pipeline and also re-applied as dynamic state when
    /// recording.
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub line_width: f32,
}

impl Default for RasterizerState {
    fn default() -> Self {
        Self {
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            line_width: 1.0,
        }
    }
}

impl RasterizerState {
    fn to_vk(self) -> vk::PipelineRasterizationStateCreateInfo<'static> {
        vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(self.polygon_mode)
            .cull_mode(self.cull_mode)
            .front_face(self.front_face)
            .line_width(self.line_width)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MultisampleState {
    pub samples: vk::SampleCountFlags,
    pub sample_shading: bool,
    pub min_sample_shading: f32,
    pub alpha_to_coverage: bool,
    pub alpha_to_one: bool,
}

impl Default for MultisampleState {
    fn default() -> Self {
        Self {
            samples: vk::SampleCountFlags::TYPE_1,
            sample_shading: false,
            min_sample_shading: 1.0,
            alpha_to_coverage: false,
            alpha_to_one: false,
        }
    }
}

impl MultisampleState {
    fn to_vk(self) -> vk::PipelineMultisampleStateCreateInfo<'static> {
        vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(self.samples)
            .sample_shading_enable(self.sample_shading)
            .min_sample_shading(self.min_sample_shading)
            .alpha_to_coverage_enable(self.alpha_to_coverage)
            .alpha_to_one_enable(self.alpha_to_one)
    }
}

/// One color target. Blending is always off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorAttachmentState {
    pub write_mask: vk::ColorComponentFlags,
}

impl ColorAttachmentState {
    fn to_vk(self) -> vk::PipelineColorBlendAttachmentState {
        vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(false)
            .color_write_mask(self.write_mask)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthStencilState {
    pub test_enable: bool,
    pub write_enable: bool,
    pub compare_op: vk::CompareOp,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self {
            test_enable: false,
            write_enable: false,
            compare_op: vk::CompareOp::LESS,
        }
    }
}

impl DepthStencilState {
    fn to_vk(self) -> vk::PipelineDepthStencilStateCreateInfo<'static> {
        vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(self.test_enable)
            .depth_write_enable(self.write_enable)
            .depth_compare_op(self.compare_op)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false)
    }
}

/// Formats of the dynamic-rendering attachments the pipeline draws into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentFormats {
    pub colors: Vec<vk::Format>,
    /// `UNDEFINED` means no depth attachment.
    pub depth: vk::Format,
}

impl Default for AttachmentFormats {
    fn default() -> Self {
        Self {
            colors: Vec::new(),
            depth: vk::Format::UNDEFINED,
        }
    }
}

/// A loaded shader module and the stage it runs in.
#[derive(Debug)]
pub struct ShaderStageEntry {
    pub stage: ShaderStage,
    pub path: PathBuf,
    pub module: ShaderModule,
}

// ---------------------------------------------------------------------------
// PipelineLayout / Pipeline
// ---------------------------------------------------------------------------

/// An owned wrapper around a `VkPipelineLayout`.
pub struct PipelineLayout {
    parent: Arc<dyn RawDevice>,
    handle: vk::PipelineLayout,
}

impl std::fmt::Debug for PipelineLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineLayout")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl PipelineLayout {
    /// Create a pipeline layout over the given set layouts, with no push
    /// constant ranges.
    pub fn new(
        device: &Arc<dyn RawDevice>,
        set_layouts: &[&DescriptorSetLayout],
    ) -> Result<Self, vk::Result> {
        let raw_layouts: Vec<vk::DescriptorSetLayout> = set_layouts
            .iter()
            .map(|l| l.raw_descriptor_set_layout())
            .collect();
        let create_info =
            vk::PipelineLayoutCreateInfo::default().set_layouts(&raw_layouts);
        // SAFETY: create_info references valid set layouts created from
        // device.
        let handle = unsafe { device.create_raw_pipeline_layout(&create_info) }?;
        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    pub fn raw_handle(&self) -> vk::PipelineLayout {
        self.handle
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        tracing::debug!("Dropping pipeline layout {:?}", self.handle);
        // SAFETY: handle was created from parent and is being destroyed during
        // teardown. All pipelines using this layout must be dropped first.
        unsafe { self.parent.destroy_raw_pipeline_layout(self.handle) };
    }
}

/// A graphics pipeline built for dynamic rendering. No render pass object
/// is involved; the caller's `VkRenderingInfo` must match the attachment
/// formats the pipeline was built with.
pub struct Pipeline {
    parent: Arc<dyn RawDevice>,
    handle: vk::Pipeline,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn raw_handle(&self) -> vk::Pipeline {
        self.handle
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        tracing::debug!("Dropping pipeline {:?}", self.handle);
        // SAFETY: handle was created from parent and is being destroyed during
        // teardown. All in-flight GPU work referencing this pipeline must be
        // completed before drop.
        unsafe { self.parent.destroy_raw_pipeline(self.handle) };
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IncompleteConfigurationError {
    #[error("No shader stages added")]
    NoShaderStages,

    #[error("No color attachments added")]
    NoColorAttachments,
}

#[derive(Debug, Error)]
pub enum BuildPipelineError {
    #[error("Incomplete pipeline configuration: {0}")]
    Incomplete(#[from] IncompleteConfigurationError),

    #[error("Vulkan error creating descriptor set layout: {0}")]
    DescriptorSetLayout(vk::Result),

    #[error("Vulkan error creating pipeline layout: {0}")]
    PipelineLayout(vk::Result),

    #[error("Vulkan error creating graphics pipeline: {0}")]
    Pipeline(vk::Result),
}

#[derive(Debug, Error)]
pub enum AllocateDescriptorsError {
    #[error(transparent)]
    Pool(#[from] PoolCreationError),

    #[error(transparent)]
    Sets(#[from] AllocateSetsError),
}

// ---------------------------------------------------------------------------
// PipelineBuilder
// ---------------------------------------------------------------------------

/// Staged configuration for a [`PipelineBundle`].
///
/// Setters may be called in any order. Anything never set keeps the
/// defaults of the state structs above.
pub struct PipelineBuilder {
    device: Arc<dyn RawDevice>,
    name: String,
    stages: Vec<ShaderStageEntry>,
    input_assembly: InputAssemblyState,
    rasterizer: RasterizerState,
    multisample: MultisampleState,
    color_attachments: Vec<ColorAttachmentState>,
    depth_stencil: DepthStencilState,
    formats: AttachmentFormats,
}

impl std::fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("name", &self.name)
            .field("stages", &self.stages.len())
            .field("color_attachments", &self.color_attachments.len())
            .finish_non_exhaustive()
    }
}

impl PipelineBuilder {
    pub fn new(device: &Arc<dyn RawDevice>) -> Self {
        Self {
            device: Arc::clone(device),
            name: DEFAULT_PIPELINE_NAME.to_owned(),
            stages: Vec::new(),
            input_assembly: InputAssemblyState::default(),
            rasterizer: RasterizerState::default(),
            multisample: MultisampleState::default(),
            color_attachments: Vec::new(),
            depth_stencil: DepthStencilState::default(),
            formats: AttachmentFormats::default(),
        }
    }

    pub fn set_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = name.into();
        self
    }

    /// Load a SPIR-V file and attach it as `stage`. The module is created
    /// immediately and owned by the resulting bundle.
    pub fn add_shader_stage(
        &mut self,
        path: impl AsRef<Path>,
        stage: ShaderStage,
    ) -> Result<&mut Self, ShaderLoadError> {
        let path = path.as_ref();
        let module = ShaderModule::from_file(&self.device, path)?;
        tracing::debug!("Loaded {stage:?} shader from {}", path.display());
        self.stages.push(ShaderStageEntry {
            stage,
            path: path.to_owned(),
            module,
        });
        Ok(self)
    }

    pub fn set_topology(&mut self, topology: vk::PrimitiveTopology) -> &mut Self {
        self.input_assembly = InputAssemblyState {
            topology,
            primitive_restart: false,
        };
        self
    }

    pub fn set_rasterizer(
        &mut self,
        cull_mode: vk::CullModeFlags,
        front_face: vk::FrontFace,
        polygon_mode: vk::PolygonMode,
    ) -> &mut Self {
        self.rasterizer = RasterizerState {
            polygon_mode,
            cull_mode,
            front_face,
            line_width: 1.0,
        };
        self
    }

    pub fn set_multisampling_none(&mut self) -> &mut Self {
        self.multisample = MultisampleState::default();
        self
    }

    /// Append a non-blending color target.
    pub fn add_color_attachment(
        &mut self,
        write_mask: vk::ColorComponentFlags,
    ) -> &mut Self {
        self.color_attachments
            .push(ColorAttachmentState { write_mask });
        self
    }

    pub fn set_color_and_depth_formats(
        &mut self,
        colors: &[vk::Format],
        depth: vk::Format,
    ) -> &mut Self {
        self.formats = AttachmentFormats {
            colors: colors.to_vec(),
            depth,
        };
        self
    }

    pub fn set_depth_stencil(
        &mut self,
        test_enable: bool,
        write_enable: bool,
        compare_op: vk::CompareOp,
    ) -> &mut Self {
        self.depth_stencil = DepthStencilState {
            test_enable,
            write_enable,
            compare_op,
        };
        self
    }

    /// Create the descriptor set layout, pipeline layout and pipeline.
    ///
    /// On failure, objects created so far are destroyed along with the
    /// builder's shader modules.
    pub fn build(
        self,
        bindings: &[DescriptorBindingSpec],
    ) -> Result<PipelineBundle, BuildPipelineError> {
        if self.stages.is_empty() {
            return Err(IncompleteConfigurationError::NoShaderStages.into());
        }
        if self.color_attachments.is_empty() {
            return Err(IncompleteConfigurationError::NoColorAttachments.into());
        }

        let set_layout = DescriptorSetLayout::new(&self.device, bindings)
            .map_err(BuildPipelineError::DescriptorSetLayout)?;
        self.name_object(
            set_layout.raw_descriptor_set_layout(),
            "descriptor set layout",
        );

        let layout = PipelineLayout::new(&self.device, &[&set_layout])
            .map_err(BuildPipelineError::PipelineLayout)?;
        self.name_object(layout.raw_handle(), "pipeline layout");

        let pipeline = self
            .create_pipeline(&layout)
            .map_err(BuildPipelineError::Pipeline)?;
        self.name_object(pipeline.raw_handle(), "pipeline");

        let bundle = PipelineBundle {
            descriptor_sets: Vec::new(),
            descriptor_pool: None,
            pipeline,
            layout,
            set_layout,
            stages: self.stages,
            name: self.name,
            input_assembly: self.input_assembly,
            rasterizer: self.rasterizer,
            multisample: self.multisample,
            color_attachments: self.color_attachments,
            depth_stencil: self.depth_stencil,
            formats: self.formats,
        };
        tracing::info!("Created pipeline:\n{bundle}");
        Ok(bundle)
    }

    fn create_pipeline(
        &self,
        layout: &PipelineLayout,
    ) -> Result<Pipeline, vk::Result> {
        let stage_create_infos: Vec<vk::PipelineShaderStageCreateInfo<'_>> =
            self.stages
                .iter()
                .map(|s| s.module.stage_create_info(s.stage))
                .collect();

        let binding_descriptions = [Vertex::binding_description()];
        let attribute_descriptions = Vertex::attribute_descriptions();
        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&binding_descriptions)
            .vertex_attribute_descriptions(&attribute_descriptions);

        let input_assembly_state = self.input_assembly.to_vk();

        // Viewport and scissor counts must be declared even though their
        // values are supplied dynamically.
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization_state = self.rasterizer.to_vk();
        let multisample_state = self.multisample.to_vk();
        let depth_stencil_state = self.depth_stencil.to_vk();

        let color_blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> =
            self.color_attachments.iter().map(|a| a.to_vk()).collect();
        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let dynamic_state = vk::PipelineDynamicStateCreateInfo::default()
            .dynamic_states(&DYNAMIC_STATES);

        let mut rendering_create_info = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&self.formats.colors)
            .depth_attachment_format(self.formats.depth);

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stage_create_infos)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .multisample_state(&multisample_state)
            .depth_stencil_state(&depth_stencil_state)
            .color_blend_state(&color_blend_state)
            .dynamic_state(&dynamic_state)
            .layout(layout.raw_handle())
            .push_next(&mut rendering_create_info);

        // SAFETY: create_info references valid shader stages, a valid pipeline
        // layout, and a valid VkPipelineRenderingCreateInfo; all derived from
        // self.device and valid for the duration of this call.
        let handle =
            unsafe { self.device.create_raw_graphics_pipeline(&create_info) }?;
        Ok(Pipeline {
            parent: Arc::clone(&self.device),
            handle,
        })
    }

    fn name_object<H: vk::Handle + Copy + std::fmt::Debug>(
        &self,
        handle: H,
        what: &str,
    ) {
        let name = format!("{} {what}", self.name);
        // SAFETY: handle is a live object created from self.device.
        let name_result =
            unsafe { self.device.set_object_name_str(handle, Some(&name)) };
        if let Err(e) = name_result {
            tracing::warn!("Failed to name {what} {:?}: {e}", handle);
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineBundle
// ---------------------------------------------------------------------------

/// A built pipeline with everything needed to draw with it.
///
/// Fields drop in declaration order: descriptor sets and pool, then the
/// pipeline, its layout, the set layout, and finally the shader modules.
pub struct PipelineBundle {
    descriptor_sets: Vec<DescriptorSet>,
    descriptor_pool: Option<DescriptorPool>,
    pipeline: Pipeline,
    layout: PipelineLayout,
    set_layout: DescriptorSetLayout,
    stages: Vec<ShaderStageEntry>,
    name: String,
    input_assembly: InputAssemblyState,
    rasterizer: RasterizerState,
    multisample: MultisampleState,
    color_attachments: Vec<ColorAttachmentState>,
    depth_stencil: DepthStencilState,
    formats: AttachmentFormats,
}

impl std::fmt::Debug for PipelineBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineBundle")
            .field("name", &self.name)
            .field("pipeline", &self.pipeline)
            .field("layout", &self.layout)
            .field("descriptor_sets", &self.descriptor_sets.len())
            .finish_non_exhaustive()
    }
}

impl std::fmt::Display for PipelineBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Name: {}", self.name)?;
        for s in &self.stages {
            writeln!(f, "  {:?} stage: {}", s.stage, s.path.display())?;
        }
        writeln!(f, "  Topology: {:?}", self.input_assembly.topology)?;
        writeln!(
            f,
            "  Rasterizer: {:?} / cull {:?} / {:?}",
            self.rasterizer.polygon_mode,
            self.rasterizer.cull_mode,
            self.rasterizer.front_face
        )?;
        writeln!(
            f,
            "  Depth: test {} write {} {:?}",
            self.depth_stencil.test_enable,
            self.depth_stencil.write_enable,
            self.depth_stencil.compare_op
        )?;
        writeln!(
            f,
            "  Formats: color {:?} depth {:?}",
            self.formats.colors, self.formats.depth
        )?;
        write!(
            f,
            "  Bindings: {} / color attachments: {}",
            self.set_layout.bindings().len(),
            self.color_attachments.len()
        )
    }
}

impl PipelineBundle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn pipeline_layout(&self) -> &PipelineLayout {
        &self.layout
    }

    pub fn set_layout(&self) -> &DescriptorSetLayout {
        &self.set_layout
    }

    pub fn bindings(&self) -> &[DescriptorBindingSpec] {
        self.set_layout.bindings()
    }

    pub fn stages(&self) -> &[ShaderStageEntry] {
        &self.stages
    }

    pub fn input_assembly(&self) -> InputAssemblyState {
        self.input_assembly
    }

    pub fn rasterizer(&self) -> RasterizerState {
        self.rasterizer
    }

    pub fn multisample(&self) -> MultisampleState {
        self.multisample
    }

    pub fn color_attachments(&self) -> &[ColorAttachmentState] {
        &self.color_attachments
    }

    pub fn depth_stencil(&self) -> DepthStencilState {
        self.depth_stencil
    }

    pub fn formats(&self) -> &AttachmentFormats {
        &self.formats
    }

    pub fn descriptor_pool(&self) -> Option<&DescriptorPool> {
        self.descriptor_pool.as_ref()
    }

    pub fn descriptor_sets(&self) -> &[DescriptorSet] {
        &self.descriptor_sets
    }

    pub fn descriptor_set(&self, frame: usize) -> Option<DescriptorSet> {
        self.descriptor_sets.get(frame).copied()
    }

    /// Create a pool sized from this bundle's bindings and allocate one set
    /// per frame in flight. Any previous pool and sets are released first.
    pub fn allocate_descriptors(
        &mut self,
        frames: u32,
    ) -> Result<(), AllocateDescriptorsError> {
        self.descriptor_sets.clear();
        self.descriptor_pool = None;

        let device = Arc::clone(&self.layout.parent);
        let pool = create_descriptor_pool(&device, self.bindings(), frames)?;
        let sets = create_descriptor_sets(&self.set_layout, &pool, frames)?;
        tracing::debug!(
            "Allocated {} descriptor sets for pipeline {}",
            sets.len(),
            self.name
        );
        self.descriptor_pool = Some(pool);
        self.descriptor_sets = sets;
        Ok(())
    }

    /// Write `resources` (one per binding) into every allocated set.
    ///
    /// # Safety
    /// See [`write_descriptor_sets`].
    pub unsafe fn bind_frame_resources(
        &self,
        resources: &[BindingResource<'_>],
    ) -> Result<(), WriteDescriptorError> {
        if self.descriptor_sets.is_empty() {
            return Err(WriteDescriptorError::NoDescriptorSets);
        }
        // SAFETY: Forwarded to the caller.
        unsafe {
            write_descriptor_sets(
                &self.layout.parent,
                &self.descriptor_sets,
                self.bindings(),
                resources,
                self.descriptor_sets.len(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::MemoryAllocator;
    use crate::mock::{Call, Fail, MockAllocator, MockDevice};
    use crate::uniform::{create_frame_slots, create_slot_array};
    use std::io::Write;

    struct Fixture {
        mock: Arc<MockDevice>,
        device: Arc<dyn RawDevice>,
        vert: tempfile::NamedTempFile,
        frag: tempfile::NamedTempFile,
    }

    fn spirv() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0x03, 0x02, 0x23, 0x07, 0, 0, 0, 0]).unwrap();
        file
    }

    fn fixture() -> Fixture {
        let mock = MockDevice::new();
        let device: Arc<dyn RawDevice> = mock.clone();
        Fixture {
            mock,
            device,
            vert: spirv(),
            frag: spirv(),
        }
    }

    fn scene_bindings() -> Vec<DescriptorBindingSpec> {
        let stages = vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT;
        vec![
            DescriptorBindingSpec::uniform(0, 1, stages),
            DescriptorBindingSpec::uniform(1, 1, stages),
            DescriptorBindingSpec::uniform(2, 100, stages),
        ]
    }

    fn configured(fx: &Fixture) -> PipelineBuilder {
        let mut builder = PipelineBuilder::new(&fx.device);
        builder
            .set_name("scene")
            .set_topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .set_rasterizer(
                vk::CullModeFlags::BACK,
                vk::FrontFace::COUNTER_CLOCKWISE,
                vk::PolygonMode::FILL,
            )
            .set_multisampling_none()
            .add_color_attachment(vk::ColorComponentFlags::RGBA)
            .set_color_and_depth_formats(
                &[vk::Format::B8G8R8A8_SRGB],
                vk::Format::D32_SFLOAT,
            )
            .set_depth_stencil(true, true, vk::CompareOp::LESS);
        builder
            .add_shader_stage(fx.vert.path(), ShaderStage::Vertex)
            .unwrap()
            .add_shader_stage(fx.frag.path(), ShaderStage::Fragment)
            .unwrap();
        builder
    }

    #[test]
    fn build_without_stages_is_incomplete() {
        let fx = fixture();
        let mut builder = PipelineBuilder::new(&fx.device);
        builder.add_color_attachment(vk::ColorComponentFlags::RGBA);
        let err = builder.build(&scene_bindings()).unwrap_err();
        assert!(matches!(
            err,
            BuildPipelineError::Incomplete(
                IncompleteConfigurationError::NoShaderStages
            )
        ));
        assert!(fx.mock.calls().is_empty());
    }

    #[test]
    fn build_without_color_attachments_is_incomplete() {
        let fx = fixture();
        let mut builder = PipelineBuilder::new(&fx.device);
        builder
            .add_shader_stage(fx.vert.path(), ShaderStage::Vertex)
            .unwrap();
        let err = builder.build(&scene_bindings()).unwrap_err();
        assert!(matches!(
            err,
            BuildPipelineError::Incomplete(
                IncompleteConfigurationError::NoColorAttachments
            )
        ));
    }

    #[test]
    fn missing_shader_is_reported_by_add_shader_stage() {
        let fx = fixture();
        let dir = tempfile::tempdir().unwrap();
        let mut builder = PipelineBuilder::new(&fx.device);
        assert!(matches!(
            builder.add_shader_stage(dir.path().join("x.spv"), ShaderStage::Vertex),
            Err(ShaderLoadError::Missing(_))
        ));
    }

    #[test]
    fn pipeline_create_info_carries_builder_state() {
        let fx = fixture();
        let bundle = configured(&fx).build(&scene_bindings()).unwrap();

        let pipelines = fx.mock.pipelines();
        assert_eq!(pipelines.len(), 1);
        let p = &pipelines[0];
        assert_eq!(p.handle, bundle.pipeline().raw_handle());
        assert_eq!(p.layout, bundle.pipeline_layout().raw_handle());
        assert_eq!(p.stages.len(), 2);
        assert_eq!(p.stages[0].0, vk::ShaderStageFlags::VERTEX);
        assert_eq!(p.stages[1].0, vk::ShaderStageFlags::FRAGMENT);
        assert!(p.stages.iter().all(|s| s.2 == "main"));
        assert_eq!(p.vertex_stride, 36);
        assert_eq!(
            p.vertex_attributes,
            [
                (0, vk::Format::R32G32B32_SFLOAT, 0),
                (1, vk::Format::R32G32B32_SFLOAT, 12),
                (2, vk::Format::R32G32B32_SFLOAT, 24),
            ]
        );
        assert_eq!(p.topology, vk::PrimitiveTopology::TRIANGLE_LIST);
        assert_eq!((p.viewport_count, p.scissor_count), (1, 1));
        assert_eq!(p.cull_mode, vk::CullModeFlags::BACK);
        assert_eq!(p.line_width, 1.0);
        assert_eq!(p.samples, vk::SampleCountFlags::TYPE_1);
        assert!(p.depth_test && p.depth_write);
        assert_eq!(p.depth_compare, vk::CompareOp::LESS);
        assert!(!p.logic_op_enable);
        assert_eq!(p.color_write_masks, [vk::ColorComponentFlags::RGBA]);
        assert_eq!(p.dynamic_states, DYNAMIC_STATES);
        assert_eq!(p.color_formats, [vk::Format::B8G8R8A8_SRGB]);
        assert_eq!(p.depth_format, vk::Format::D32_SFLOAT);

        let layout_bindings = fx.mock.calls().into_iter().find_map(|c| match c {
            Call::CreateDescriptorSetLayout(_, b) => Some(b),
            _ => None,
        });
        assert_eq!(layout_bindings.map(|b| b.len()), Some(3));
        assert_eq!(bundle.bindings().len(), 3);
        assert!(fx.mock.calls().contains(&Call::CreatePipelineLayout(
            bundle.pipeline_layout().raw_handle(),
            vec![bundle.set_layout().raw_descriptor_set_layout()],
        )));
    }

    #[test]
    fn defaults_apply_when_setters_are_skipped() {
        let fx = fixture();
        let mut builder = PipelineBuilder::new(&fx.device);
        builder
            .add_shader_stage(fx.vert.path(), ShaderStage::Vertex)
            .unwrap()
            .add_color_attachment(vk::ColorComponentFlags::RGBA);
        let bundle = builder.build(&[]).unwrap();

        assert_eq!(bundle.name(), DEFAULT_PIPELINE_NAME);
        assert_eq!(bundle.rasterizer(), RasterizerState::default());
        assert_eq!(bundle.depth_stencil(), DepthStencilState::default());
        let p = &fx.mock.pipelines()[0];
        assert_eq!(p.polygon_mode, vk::PolygonMode::FILL);
        assert_eq!(p.front_face, vk::FrontFace::COUNTER_CLOCKWISE);
        assert!(!p.depth_test && !p.depth_write);
        assert!(p.color_formats.is_empty());
        assert_eq!(p.depth_format, vk::Format::UNDEFINED);
    }

    #[test]
    fn identical_builds_share_state_but_not_handles() {
        let fx = fixture();
        let a = configured(&fx).build(&scene_bindings()).unwrap();
        let b = configured(&fx).build(&scene_bindings()).unwrap();

        assert_eq!(a.rasterizer(), b.rasterizer());
        assert_eq!(a.input_assembly(), b.input_assembly());
        assert_eq!(a.multisample(), b.multisample());
        assert_eq!(a.depth_stencil(), b.depth_stencil());
        assert_eq!(a.color_attachments(), b.color_attachments());
        assert_eq!(a.formats(), b.formats());
        assert_ne!(a.pipeline().raw_handle(), b.pipeline().raw_handle());
        assert_ne!(
            a.pipeline_layout().raw_handle(),
            b.pipeline_layout().raw_handle()
        );
    }

    #[test]
    fn failed_pipeline_creation_releases_layouts_and_modules() {
        let fx = fixture();
        fx.mock.fail_on(Fail::GraphicsPipeline);
        let err = configured(&fx).build(&scene_bindings()).unwrap_err();
        assert!(matches!(err, BuildPipelineError::Pipeline(_)));

        let calls = fx.mock.calls();
        let count = |f: fn(&Call) -> bool| calls.iter().filter(|c| f(c)).count();
        assert_eq!(count(|c| matches!(c, Call::DestroyPipelineLayout(_))), 1);
        assert_eq!(
            count(|c| matches!(c, Call::DestroyDescriptorSetLayout(_))),
            1
        );
        assert_eq!(count(|c| matches!(c, Call::DestroyShaderModule(_))), 2);
    }

    #[test]
    fn failed_set_layout_maps_to_its_variant() {
        let fx = fixture();
        fx.mock.fail_on(Fail::DescriptorSetLayout);
        assert!(matches!(
            configured(&fx).build(&scene_bindings()),
            Err(BuildPipelineError::DescriptorSetLayout(_))
        ));
    }

    #[test]
    fn bundle_drops_in_dependency_order() {
        let fx = fixture();
        let mut bundle = configured(&fx).build(&scene_bindings()).unwrap();
        bundle.allocate_descriptors(2).unwrap();
        fx.mock.clear_calls();
        drop(bundle);

        let kinds: Vec<&str> = fx
            .mock
            .calls()
            .iter()
            .map(|c| match c {
                Call::DestroyDescriptorPool(_) => "pool",
                Call::DestroyPipeline(_) => "pipeline",
                Call::DestroyPipelineLayout(_) => "pipeline layout",
                Call::DestroyDescriptorSetLayout(_) => "set layout",
                Call::DestroyShaderModule(_) => "module",
                _ => "other",
            })
            .collect();
        assert_eq!(
            kinds,
            [
                "pool",
                "pipeline",
                "pipeline layout",
                "set layout",
                "module",
                "module"
            ]
        );
    }

    #[test]
    fn bind_before_allocate_is_rejected() {
        let fx = fixture();
        let bundle = configured(&fx).build(&scene_bindings()).unwrap();
        // SAFETY: nothing is written.
        let result = unsafe { bundle.bind_frame_resources(&[]) };
        assert_eq!(result, Err(WriteDescriptorError::NoDescriptorSets));
    }

    #[test]
    fn scene_bundle_binds_camera_player_and_environment() {
        let fx = fixture();
        let alloc_mock = MockAllocator::new();
        let allocator: Arc<dyn MemoryAllocator> = alloc_mock.clone();

        let mut bundle = configured(&fx).build(&scene_bindings()).unwrap();
        bundle.allocate_descriptors(2).unwrap();
        assert_eq!(bundle.descriptor_sets().len(), 2);
        let pool = bundle.descriptor_pool().unwrap().raw_descriptor_pool();
        assert!(fx.mock.calls().contains(&Call::CreateDescriptorPool {
            pool,
            max_sets: 2,
            flags: vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET,
            sizes: vec![(vk::DescriptorType::UNIFORM_BUFFER, 102)],
        }));

        let camera = create_frame_slots(&allocator, 64, 2, "camera").unwrap();
        let player = create_frame_slots(&allocator, 64, 2, "player").unwrap();
        let env = create_slot_array(&allocator, 32, 100, 2, "env").unwrap();
        assert_eq!(alloc_mock.live_count(), 204);

        // SAFETY: mock buffers are never submitted to a GPU.
        unsafe {
            bundle.bind_frame_resources(&[
                BindingResource::single(&camera),
                BindingResource::single(&player),
                BindingResource::array(&env),
            ])
        }
        .unwrap();

        let updates = fx.mock.update_calls();
        assert_eq!(updates.len(), 2);
        for (frame, writes) in updates.iter().enumerate() {
            let set = bundle.descriptor_sets()[frame].raw_descriptor_set();
            assert_eq!(writes.len(), 3);
            let env_write = writes.iter().find(|w| w.binding == 2).unwrap();
            assert_eq!(env_write.set, set);
            assert_eq!(env_write.descriptor_count, 100);
            assert_eq!(env_write.buffers[7].0, env[7][frame].buffer().raw());
            assert_eq!(env_write.buffers[7].2, 32);
        }
    }
}
