use std::ffi::CStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ash::vk;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::RawDevice;

/// Entry point every shader stage is expected to export.
pub const ENTRY_POINT: &CStr = c"main";

#[derive(Debug, Error)]
pub enum ShaderLoadError {
    #[error("Shader file {0} does not exist")]
    Missing(PathBuf),

    #[error("Failed to read shader file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Shader file {0} is empty")]
    Empty(PathBuf),

    #[error("SPIR-V byte length ({len}) of {path} is not a multiple of 4")]
    InvalidLength { path: PathBuf, len: usize },

    #[error("Vulkan error creating shader module: {0}")]
    Module(vk::Result),
}

/// A single pipeline stage that a shader module is attached to.
///
/// Unlike [`vk::ShaderStageFlags`], this enum can only represent one stage
/// at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShaderStage {
    Vertex,
    Fragment,
    TessellationControl,
    TessellationEvaluation,
    Geometry,
}

impl From<ShaderStage> for vk::ShaderStageFlags {
    fn from(stage: ShaderStage) -> Self {
        match stage {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::TessellationControl => {
                vk::ShaderStageFlags::TESSELLATION_CONTROL
            }
            ShaderStage::TessellationEvaluation => {
                vk::ShaderStageFlags::TESSELLATION_EVALUATION
            }
            ShaderStage::Geometry => vk::ShaderStageFlags::GEOMETRY,
        }
    }
}

/// Decode SPIR-V bytes into little-endian words.
pub fn spirv_words(path: &Path, bytes: &[u8]) -> Result<Vec<u32>, ShaderLoadError> {
    if bytes.is_empty() {
        return Err(ShaderLoadError::Empty(path.to_owned()));
    }
    if !bytes.len().is_multiple_of(4) {
        return Err(ShaderLoadError::InvalidLength {
            path: path.to_owned(),
            len: bytes.len(),
        });
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Read a compiled SPIR-V file. The contents are not validated beyond
/// length.
pub fn read_spirv(path: &Path) -> Result<Vec<u32>, ShaderLoadError> {
    let bytes = std::fs::read(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            ShaderLoadError::Missing(path.to_owned())
        } else {
            ShaderLoadError::Io {
                path: path.to_owned(),
                source,
            }
        }
    })?;
    spirv_words(path, &bytes)
}

pub struct ShaderModule {
    parent: Arc<dyn RawDevice>,
    handle: vk::ShaderModule,
}

impl std::fmt::Debug for ShaderModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderModule")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl ShaderModule {
    /// Create a shader module from SPIR-V words.
    ///
    /// `name` is an optional debug label applied via `VK_EXT_debug_utils`
    /// when the extension is available. Naming failures are logged as
    /// warnings and do not cause the call to fail.
    pub fn new(
        device: &Arc<dyn RawDevice>,
        code: &[u32],
        name: Option<&str>,
    ) -> Result<Self, ShaderLoadError> {
        let create_info = vk::ShaderModuleCreateInfo::default().code(code);

        // SAFETY: create_info contains word-aligned SPIR-V.
        let handle = unsafe { device.create_raw_shader_module(&create_info) }
            .map_err(ShaderLoadError::Module)?;

        // SAFETY: handle is a valid shader module created from device.
        let name_result = unsafe { device.set_object_name_str(handle, name) };
        if let Err(e) = name_result {
            tracing::warn!("Failed to name shader module {:?}: {e}", handle);
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    /// Load and wrap a SPIR-V file, named after its path.
    pub fn from_file(
        device: &Arc<dyn RawDevice>,
        path: &Path,
    ) -> Result<Self, ShaderLoadError> {
        let code = read_spirv(path)?;
        let name = path.display().to_string();
        Self::new(device, &code, Some(&name))
    }

    /// Stage create info for this module's [`ENTRY_POINT`].
    pub fn stage_create_info(
        &self,
        stage: ShaderStage,
    ) -> vk::PipelineShaderStageCreateInfo<'static> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(stage.into())
            .module(self.handle)
            .name(ENTRY_POINT)
    }

    pub fn raw_handle(&self) -> vk::ShaderModule {
        self.handle
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        tracing::debug!("Dropping shader module {:?}", self.handle);
        // SAFETY: handle was created from parent and is being destroyed during
        // teardown. All pipeline objects derived from this module must be
        // destroyed before this ShaderModule is dropped.
        unsafe { self.parent.destroy_raw_shader_module(self.handle) };
    }
}
