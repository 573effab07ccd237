//! SPIR-V shader modules and entry points.

use std::ffi::CString;
use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;

/// First word of every SPIR-V module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CreateShaderModuleError {
    #[error("SPIR-V length ({0} bytes) is not a non-zero multiple of 4")]
    InvalidLength(usize),
    #[error("Not SPIR-V: first word is {0:#010x}")]
    BadMagic(u32),
    #[error("Vulkan error creating shader module: {0}")]
    Vulkan(vk::Result),
}

/// Decode little-endian SPIR-V bytes into words, checking the length and
/// the magic number.
pub fn spirv_words_from_bytes(bytes: &[u8]) -> Result<Vec<u32>, CreateShaderModuleError> {
    if bytes.is_empty() || !bytes.len().is_multiple_of(4) {
        return Err(CreateShaderModuleError::InvalidLength(bytes.len()));
    }
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    match words.first() {
        Some(&SPIRV_MAGIC) => Ok(words),
        Some(&other) => Err(CreateShaderModuleError::BadMagic(other)),
        None => Err(CreateShaderModuleError::InvalidLength(bytes.len())),
    }
}

/// The two programmable stages the scene pipeline uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl From<ShaderStage> for vk::ShaderStageFlags {
    fn from(stage: ShaderStage) -> Self {
        match stage {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
        }
    }
}

/// An owned `VkShaderModule`.
///
/// Only needed until the pipelines that use it are built.
pub struct ShaderModule {
    parent: Arc<Device>,
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
    pub fn new(
        device: &Arc<Device>,
        spirv_bytes: &[u8],
        name: Option<&str>,
    ) -> Result<Self, CreateShaderModuleError> {
        let code = spirv_words_from_bytes(spirv_bytes)?;
        Self::from_words(device, &code, name)
    }

    /// Create from already-decoded SPIR-V words.
    pub fn from_words(
        device: &Arc<Device>,
        code: &[u32],
        name: Option<&str>,
    ) -> Result<Self, CreateShaderModuleError> {
        match code.first() {
            Some(&SPIRV_MAGIC) => {}
            Some(&other) => return Err(CreateShaderModuleError::BadMagic(other)),
            None => return Err(CreateShaderModuleError::InvalidLength(0)),
        }
        let create_info = vk::ShaderModuleCreateInfo::default().code(code);
        // SAFETY: code is validated SPIR-V framing and outlives the call.
        let handle = unsafe { device.create_raw_shader_module(&create_info) }
            .map_err(CreateShaderModuleError::Vulkan)?;
        // SAFETY: handle was just created from device.
        unsafe { device.name_or_warn(handle, name) };
        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    /// Name an entry point in this module for `stage`.
    ///
    /// Fails only when `name` contains a NUL byte.
    pub fn entry_point(
        &self,
        name: &str,
        stage: ShaderStage,
    ) -> Result<EntryPoint<'_>, std::ffi::NulError> {
        Ok(EntryPoint {
            module: self,
            name: CString::new(name)?,
            stage,
        })
    }

    pub fn raw_handle(&self) -> vk::ShaderModule {
        self.handle
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        tracing::debug!("Dropping shader module {:?}", self.handle);
        // SAFETY: pipelines do not reference their modules after creation.
        unsafe { self.parent.destroy_raw_shader_module(self.handle) };
    }
}

/// A module, entry point name and stage, borrowed for pipeline creation.
#[derive(Debug)]
pub struct EntryPoint<'a> {
    module: &'a ShaderModule,
    name: CString,
    stage: ShaderStage,
}

impl EntryPoint<'_> {
    pub fn stage_create_info(&self) -> vk::PipelineShaderStageCreateInfo<'_> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(self.stage.into())
            .module(self.module.raw_handle())
            .name(&self.name)
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words_to_bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn accepts_little_endian_spirv() {
        let bytes = words_to_bytes(&[SPIRV_MAGIC, 0x0001_0000, 0, 1, 0]);
        let words = spirv_words_from_bytes(&bytes).unwrap();
        assert_eq!(words.len(), 5);
        assert_eq!(words[1], 0x0001_0000);
    }

    #[test]
    fn rejects_bad_lengths() {
        assert_eq!(
            spirv_words_from_bytes(&[]),
            Err(CreateShaderModuleError::InvalidLength(0))
        );
        let mut bytes = words_to_bytes(&[SPIRV_MAGIC]);
        bytes.push(0);
        assert_eq!(
            spirv_words_from_bytes(&bytes),
            Err(CreateShaderModuleError::InvalidLength(5))
        );
    }

    #[test]
    fn rejects_non_spirv_data() {
        let bytes = b"#version 450\n\0\0\0";
        assert!(matches!(
            spirv_words_from_bytes(bytes),
            Err(CreateShaderModuleError::BadMagic(_))
        ));
    }

    #[test]
    fn stages_map_to_vulkan_flags() {
        assert_eq!(
            vk::ShaderStageFlags::from(ShaderStage::Vertex),
            vk::ShaderStageFlags::VERTEX
        );
        assert_eq!(
            vk::ShaderStageFlags::from(ShaderStage::Fragment),
            vk::ShaderStageFlags::FRAGMENT
        );
    }
}
