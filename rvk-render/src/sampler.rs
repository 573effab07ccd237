//! Texture samplers.

use std::sync::Arc;

use ash::vk;

use crate::device::Device;

/// Filtering and addressing for a [`Sampler`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDesc {
    pub filter: vk::Filter,
    pub address_mode: vk::SamplerAddressMode,
    pub mipmap_mode: vk::SamplerMipmapMode,
    /// `None` disables anisotropic filtering.
    pub max_anisotropy: Option<f32>,
    /// Upper LOD clamp; the mip count of the textures it samples.
    pub max_lod: f32,
}

impl SamplerDesc {
    /// Linear, repeating, trilinear across `mip_levels`, with the device's
    /// maximum anisotropy when the feature is on.
    pub fn textured(device: &Device, mip_levels: u32) -> Self {
        Self {
            filter: vk::Filter::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            max_anisotropy: device.max_sampler_anisotropy(),
            max_lod: mip_levels as f32,
        }
    }

    fn create_info(&self) -> vk::SamplerCreateInfo<'static> {
        vk::SamplerCreateInfo::default()
            .mag_filter(self.filter)
            .min_filter(self.filter)
            .address_mode_u(self.address_mode)
            .address_mode_v(self.address_mode)
            .address_mode_w(self.address_mode)
            .anisotropy_enable(self.max_anisotropy.is_some())
            .max_anisotropy(self.max_anisotropy.unwrap_or(1.0))
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(self.mipmap_mode)
            .mip_lod_bias(0.0)
            .min_lod(0.0)
            .max_lod(self.max_lod)
    }
}

/// An owned `VkSampler`.
pub struct Sampler {
    parent: Arc<Device>,
    handle: vk::Sampler,
}

impl std::fmt::Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sampler")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl Sampler {
    pub fn new(
        device: &Arc<Device>,
        desc: &SamplerDesc,
        name: Option<&str>,
    ) -> Result<Self, vk::Result> {
        let create_info = desc.create_info();
        // SAFETY: create_info borrows nothing.
        let handle = unsafe { device.create_raw_sampler(&create_info) }?;
        // SAFETY: handle was just created from device.
        unsafe { device.name_or_warn(handle, name) };
        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    pub fn raw_sampler(&self) -> vk::Sampler {
        self.handle
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        tracing::debug!("Dropping sampler {:?}", self.handle);
        // SAFETY: owners wait for idle before dropping.
        unsafe { self.parent.destroy_raw_sampler(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anisotropy_off_without_limit() {
        let desc = SamplerDesc {
            filter: vk::Filter::NEAREST,
            address_mode: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            mipmap_mode: vk::SamplerMipmapMode::NEAREST,
            max_anisotropy: None,
            max_lod: 1.0,
        };
        let info = desc.create_info();
        assert_eq!(info.anisotropy_enable, vk::FALSE);
        assert_eq!(info.max_anisotropy, 1.0);
    }

    #[test]
    fn lod_range_covers_the_mip_chain() {
        let desc = SamplerDesc {
            filter: vk::Filter::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            max_anisotropy: Some(16.0),
            max_lod: 9.0,
        };
        let info = desc.create_info();
        assert_eq!(info.anisotropy_enable, vk::TRUE);
        assert_eq!(info.max_anisotropy, 16.0);
        assert_eq!(info.min_lod, 0.0);
        assert_eq!(info.max_lod, 9.0);
        assert_eq!(info.address_mode_v, vk::SamplerAddressMode::REPEAT);
    }
}
