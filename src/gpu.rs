use std::panic;

use thiserror::Error;

/// Texel format of the uploaded volume. Must be filterable for trilinear
/// sampling.
pub const VOLUME_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::R16Float;

#[derive(Debug, Error)]
pub enum RendererError {
    #[error("No GPU adapter capable of volume rendering")]
    AdapterUnavailable,

    #[error("Failed to create GPU device: {0}")]
    DeviceRequest(#[from] wgpu::RequestDeviceError),

    #[error("Volume {width}x{height}x{depth} is too large for this GPU (3D texture limit {max})")]
    VolumeTooLarge {
        width: usize,
        height: usize,
        depth: usize,
        max: u32,
    },

    #[error("Transfer function resolution {resolution} exceeds the GPU texture limit {max}")]
    TransferFunctionTooLarge { resolution: u32, max: u32 },

    #[error("GPU out of memory: {0}")]
    OutOfMemory(String),

    #[error("GPU validation error: {0}")]
    Validation(String),

    #[error("GPU device lost: {0}")]
    DeviceLost(String),

    #[error("Surface error: {0}")]
    Surface(#[from] wgpu::SurfaceError),

    #[error("Surface is not supported by the adapter")]
    SurfaceUnsupported,

    #[error("Failed to read back frame: {0}")]
    Readback(String),

    #[error("Frame readback is only available for offscreen targets")]
    ReadbackUnsupported,
}

/// What the capability check found.
#[derive(Clone, Debug)]
pub struct AdapterSummary {
    pub name: String,
    pub backend: String,
    pub max_texture_dimension_3d: u32,
}

/// Device and queue the renderer draws with, plus the instance and adapter
/// needed to create and configure surfaces.
pub struct GpuContext {
    pub instance: wgpu::Instance,
    pub adapter: wgpu::Adapter,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

impl GpuContext {
    /// Request an adapter and device without a presentation surface.
    pub async fn new_headless() -> Result<Self, RendererError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        Self::request(instance, None).await
    }

    /// Request an adapter (optionally compatible with `surface`) and a device
    /// using the adapter's own limits, so large volumes fit.
    pub async fn request(
        instance: wgpu::Instance,
        compatible_surface: Option<&wgpu::Surface<'_>>,
    ) -> Result<Self, RendererError> {
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|_| RendererError::AdapterUnavailable)?;

        if !supports_volume_rendering(&adapter) {
            return Err(RendererError::AdapterUnavailable);
        }

        let info = adapter.get_info();
        log::info!("Adapter: {} ({:?})", info.name, info.backend);
        log::debug!("Adapter limits: {:?}", adapter.limits());

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("dicom-vrt device"),
                required_features: wgpu::Features::empty(),
                required_limits: adapter.limits(),
                ..Default::default()
            })
            .await?;

        Ok(Self {
            instance,
            adapter,
            device,
            queue,
        })
    }

    /// Wrap a device the host already owns.
    pub fn from_parts(
        instance: wgpu::Instance,
        adapter: wgpu::Adapter,
        device: wgpu::Device,
        queue: wgpu::Queue,
    ) -> Self {
        Self {
            instance,
            adapter,
            device,
            queue,
        }
    }
}

fn supports_volume_rendering(adapter: &wgpu::Adapter) -> bool {
    let filterable = adapter
        .get_texture_format_features(VOLUME_FORMAT)
        .flags
        .contains(wgpu::TextureFormatFeatureFlags::FILTERABLE);
    filterable && adapter.limits().max_texture_dimension_3d > 0
}

/// Look for an adapter that can sample filtered 3D textures.
pub async fn query_adapter() -> Option<AdapterSummary> {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
    let adapter = instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        })
        .await
        .ok()?;

    if !supports_volume_rendering(&adapter) {
        return None;
    }
    let info = adapter.get_info();
    Some(AdapterSummary {
        name: info.name,
        backend: format!("{:?}", info.backend),
        max_texture_dimension_3d: adapter.limits().max_texture_dimension_3d,
    })
}

/// Whether this machine can run the volume renderer.
///
/// Never panics and never errors: any failure while probing reads as
/// `false`, which hosts should treat as "use a 2D viewer" rather than retry.
/// Blocks on the adapter request; on the web use [`query_adapter`] instead.
pub fn is_volume_rendering_available() -> bool {
    match panic::catch_unwind(|| pollster::block_on(query_adapter())) {
        Ok(Some(summary)) => {
            log::debug!(
                "Volume rendering available on {} ({}), 3D limit {}",
                summary.name,
                summary.backend,
                summary.max_texture_dimension_3d
            );
            true
        }
        Ok(None) => {
            log::info!("No GPU adapter suitable for volume rendering");
            false
        }
        Err(_) => {
            log::warn!("GPU adapter query panicked; treating volume rendering as unavailable");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_query_returns_without_panicking() {
        let available = is_volume_rendering_available();
        let summary = pollster::block_on(query_adapter());
        // Both answers come from the same adapter query.
        assert_eq!(available, summary.is_some());
    }

    #[test]
    fn volume_too_large_names_the_limit() {
        let error = RendererError::VolumeTooLarge {
            width: 4096,
            height: 512,
            depth: 512,
            max: 2048,
        };
        assert_eq!(
            error.to_string(),
            "Volume 4096x512x512 is too large for this GPU (3D texture limit 2048)"
        );
    }
}
