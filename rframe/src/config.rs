//! TOML render settings and pipeline descriptions.
//!
//! A [`PipelineDesc`] file names the SPIR-V stages, fixed-function state,
//! attachment formats and descriptor bindings of one pipeline; shader paths
//! are written with forward slashes and resolved against the file's
//! directory. A [`RenderConfig`] file holds frame-level settings. Every
//! field is optional and falls back to the same defaults the
//! [`PipelineBuilder`] uses.

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ash::vk;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::descriptor::{DescriptorBindingSpec, DescriptorKind};
use crate::device::{DEPTH_FORMAT_CANDIDATES, RawDevice};
use crate::frame::FrameCounter;
use crate::pipeline::{DEFAULT_PIPELINE_NAME, PipelineBuilder};
use crate::shader::{ShaderLoadError, ShaderStage};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("frames_in_flight must be at least 1")]
    ZeroFrames,

    #[error("No depth format candidates listed")]
    NoDepthFormats,

    #[error("Pipeline {0} lists no shaders")]
    NoShaders(String),

    #[error("Descriptor binding {0} is declared more than once")]
    DuplicateBinding(u32),

    #[error(transparent)]
    Shader(#[from] ShaderLoadError),
}

fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_owned(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_owned(),
        source,
    })
}

// ---- Vulkan enum mirrors ---------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
    TriangleFan,
}

impl From<Topology> for vk::PrimitiveTopology {
    fn from(t: Topology) -> Self {
        match t {
            Topology::PointList => Self::POINT_LIST,
            Topology::LineList => Self::LINE_LIST,
            Topology::LineStrip => Self::LINE_STRIP,
            Topology::TriangleList => Self::TRIANGLE_LIST,
            Topology::TriangleStrip => Self::TRIANGLE_STRIP,
            Topology::TriangleFan => Self::TRIANGLE_FAN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CullMode {
    #[default]
    None,
    Front,
    Back,
    FrontAndBack,
}

impl From<CullMode> for vk::CullModeFlags {
    fn from(c: CullMode) -> Self {
        match c {
            CullMode::None => Self::NONE,
            CullMode::Front => Self::FRONT,
            CullMode::Back => Self::BACK,
            CullMode::FrontAndBack => Self::FRONT_AND_BACK,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrontFace {
    #[default]
    CounterClockwise,
    Clockwise,
}

impl From<FrontFace> for vk::FrontFace {
    fn from(f: FrontFace) -> Self {
        match f {
            FrontFace::CounterClockwise => Self::COUNTER_CLOCKWISE,
            FrontFace::Clockwise => Self::CLOCKWISE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolygonMode {
    #[default]
    Fill,
    Line,
    Point,
}

impl From<PolygonMode> for vk::PolygonMode {
    fn from(p: PolygonMode) -> Self {
        match p {
            PolygonMode::Fill => Self::FILL,
            PolygonMode::Line => Self::LINE,
            PolygonMode::Point => Self::POINT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Never,
    #[default]
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

impl From<CompareOp> for vk::CompareOp {
    fn from(c: CompareOp) -> Self {
        match c {
            CompareOp::Never => Self::NEVER,
            CompareOp::Less => Self::LESS,
            CompareOp::Equal => Self::EQUAL,
            CompareOp::LessOrEqual => Self::LESS_OR_EQUAL,
            CompareOp::Greater => Self::GREATER,
            CompareOp::NotEqual => Self::NOT_EQUAL,
            CompareOp::GreaterOrEqual => Self::GREATER_OR_EQUAL,
            CompareOp::Always => Self::ALWAYS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorFormat {
    B8g8r8a8Srgb,
    B8g8r8a8Unorm,
    R8g8b8a8Srgb,
    R8g8b8a8Unorm,
    R16g16b16a16Sfloat,
}

impl From<ColorFormat> for vk::Format {
    fn from(f: ColorFormat) -> Self {
        match f {
            ColorFormat::B8g8r8a8Srgb => Self::B8G8R8A8_SRGB,
            ColorFormat::B8g8r8a8Unorm => Self::B8G8R8A8_UNORM,
            ColorFormat::R8g8b8a8Srgb => Self::R8G8B8A8_SRGB,
            ColorFormat::R8g8b8a8Unorm => Self::R8G8B8A8_UNORM,
            ColorFormat::R16g16b16a16Sfloat => Self::R16G16B16A16_SFLOAT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepthFormat {
    D32Sfloat,
    D32SfloatS8Uint,
    D24UnormS8Uint,
    D16Unorm,
}

impl From<DepthFormat> for vk::Format {
    fn from(f: DepthFormat) -> Self {
        match f {
            DepthFormat::D32Sfloat => Self::D32_SFLOAT,
            DepthFormat::D32SfloatS8Uint => Self::D32_SFLOAT_S8_UINT,
            DepthFormat::D24UnormS8Uint => Self::D24_UNORM_S8_UINT,
            DepthFormat::D16Unorm => Self::D16_UNORM,
        }
    }
}

impl DepthFormat {
    fn from_vk(format: vk::Format) -> Option<Self> {
        [
            Self::D32Sfloat,
            Self::D32SfloatS8Uint,
            Self::D24UnormS8Uint,
            Self::D16Unorm,
        ]
        .into_iter()
        .find(|f| vk::Format::from(*f) == format)
    }
}

/// Color channels written by an attachment, spelled as a subset of
/// `"rgba"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WriteMask(pub vk::ColorComponentFlags);

impl WriteMask {
    pub const RGBA: Self = Self(vk::ColorComponentFlags::RGBA);
}

impl TryFrom<String> for WriteMask {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        let mut flags = vk::ColorComponentFlags::empty();
        for c in s.chars() {
            flags |= match c.to_ascii_lowercase() {
                'r' => vk::ColorComponentFlags::R,
                'g' => vk::ColorComponentFlags::G,
                'b' => vk::ColorComponentFlags::B,
                'a' => vk::ColorComponentFlags::A,
                other => {
                    return Err(format!(
                        "invalid channel {other:?} in write mask {s:?}"
                    ));
                }
            };
        }
        Ok(Self(flags))
    }
}

impl From<WriteMask> for String {
    fn from(mask: WriteMask) -> Self {
        [
            (vk::ColorComponentFlags::R, 'r'),
            (vk::ColorComponentFlags::G, 'g'),
            (vk::ColorComponentFlags::B, 'b'),
            (vk::ColorComponentFlags::A, 'a'),
        ]
        .into_iter()
        .filter(|(flag, _)| mask.0.contains(*flag))
        .map(|(_, c)| c)
        .collect()
    }
}

// ---- RenderConfig ----------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RenderConfig {
    pub frames_in_flight: u32,
    pub clear_color: [f32; 4],
    /// Tried in order against the device.
    pub depth_formats: Vec<DepthFormat>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            depth_formats: DEPTH_FORMAT_CANDIDATES
                .iter()
                .filter_map(|f| DepthFormat::from_vk(*f))
                .collect(),
        }
    }
}

impl RenderConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = read_toml(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.frames()?;
        if self.depth_formats.is_empty() {
            return Err(ConfigError::NoDepthFormats);
        }
        Ok(())
    }

    pub fn frames(&self) -> Result<NonZeroU32, ConfigError> {
        NonZeroU32::new(self.frames_in_flight).ok_or(ConfigError::ZeroFrames)
    }

    pub fn frame_counter(&self) -> Result<FrameCounter, ConfigError> {
        Ok(FrameCounter::new(self.frames()?))
    }

    pub fn depth_format_candidates(&self) -> Vec<vk::Format> {
        self.depth_formats.iter().map(|f| (*f).into()).collect()
    }
}

// ---- PipelineDesc ----------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShaderDesc {
    #[serde(with = "path_serde")]
    pub path: PathBuf,
    pub stage: ShaderStage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RasterizerDesc {
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub polygon_mode: PolygonMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DepthDesc {
    pub test: bool,
    pub write: bool,
    pub compare: CompareOp,
}

fn one() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BindingDesc {
    pub binding: u32,
    pub kind: DescriptorKind,
    #[serde(default = "one")]
    pub count: u32,
    pub stages: Vec<ShaderStage>,
}

impl From<&BindingDesc> for DescriptorBindingSpec {
    fn from(b: &BindingDesc) -> Self {
        Self {
            binding: b.binding,
            kind: b.kind,
            count: b.count,
            stages: b
                .stages
                .iter()
                .fold(vk::ShaderStageFlags::empty(), |acc, s| {
                    acc | vk::ShaderStageFlags::from(*s)
                }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineDesc {
    pub name: String,
    pub topology: Topology,
    pub color_attachments: Vec<WriteMask>,
    pub color_formats: Vec<ColorFormat>,
    pub depth_format: Option<DepthFormat>,
    pub rasterizer: RasterizerDesc,
    pub depth: DepthDesc,
    pub shaders: Vec<ShaderDesc>,
    pub bindings: Vec<BindingDesc>,
}

impl Default for PipelineDesc {
    fn default() -> Self {
        Self {
            name: DEFAULT_PIPELINE_NAME.to_owned(),
            topology: Topology::default(),
            color_attachments: vec![WriteMask::RGBA],
            color_formats: Vec::new(),
            depth_format: None,
            rasterizer: RasterizerDesc::default(),
            depth: DepthDesc::default(),
            shaders: Vec::new(),
            bindings: Vec::new(),
        }
    }
}

impl PipelineDesc {
    /// Parse and validate a description file. Relative shader paths are
    /// resolved against the file's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut desc: Self = read_toml(path)?;
        if let Some(base) = path.parent() {
            desc.resolve_paths(base);
        }
        desc.validate()?;
        Ok(desc)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn resolve_paths(&mut self, base: &Path) {
        for shader in &mut self.shaders {
            if shader.path.is_relative() {
                shader.path = base.join(&shader.path);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shaders.is_empty() {
            return Err(ConfigError::NoShaders(self.name.clone()));
        }
        let mut seen = std::collections::BTreeSet::new();
        for b in &self.bindings {
            if !seen.insert(b.binding) {
                return Err(ConfigError::DuplicateBinding(b.binding));
            }
        }
        Ok(())
    }

    pub fn binding_specs(&self) -> Vec<DescriptorBindingSpec> {
        self.bindings.iter().map(Into::into).collect()
    }

    /// Apply every setting to `builder`, loading each shader stage.
    pub fn configure(&self, builder: &mut PipelineBuilder) -> Result<(), ConfigError> {
        builder
            .set_name(self.name.as_str())
            .set_topology(self.topology.into())
            .set_rasterizer(
                self.rasterizer.cull_mode.into(),
                self.rasterizer.front_face.into(),
                self.rasterizer.polygon_mode.into(),
            )
            .set_multisampling_none()
            .set_depth_stencil(
                self.depth.test,
                self.depth.write,
                self.depth.compare.into(),
            );

        let colors: Vec<vk::Format> =
            self.color_formats.iter().map(|f| (*f).into()).collect();
        let depth = self
            .depth_format
            .map_or(vk::Format::UNDEFINED, Into::into);
        builder.set_color_and_depth_formats(&colors, depth);

        for mask in &self.color_attachments {
            builder.add_color_attachment(mask.0);
        }
        for shader in &self.shaders {
            builder.add_shader_stage(&shader.path, shader.stage)?;
        }
        Ok(())
    }

    /// A builder for `device` with this description applied.
    pub fn builder(
        &self,
        device: &Arc<dyn RawDevice>,
    ) -> Result<PipelineBuilder, ConfigError> {
        let mut builder = PipelineBuilder::new(device);
        self.configure(&mut builder)?;
        Ok(builder)
    }
}

// ---- Serde helpers: forward-slash paths -----------------------------

mod path_serde {
    use std::path::PathBuf;

    use path_slash::PathBufExt as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        path: &PathBuf,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        path.to_slash_lossy().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<PathBuf, D::Error> {
        Ok(PathBuf::from_slash(String::deserialize(d)?))
    }
}
