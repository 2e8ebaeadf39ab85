use std::borrow::Cow;
use std::sync::{Arc, OnceLock};

use glam::Vec3;
use web_time::Instant;

use crate::{
    camera::{self, CameraState},
    gpu::{GpuContext, RendererError, VOLUME_FORMAT},
    math::invert_matrix4,
    transfer_function::{IntensityDomain, TransferFunctionTexture},
    volume::VolumeDataset,
};

const TRANSFER_FUNCTION_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// Where frames go.
pub enum RenderTarget {
    /// A texture owned by the renderer, readable with
    /// [`VolumeRenderer::read_pixels`].
    Offscreen {
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
    },
    /// A window or canvas surface created from the same instance as the
    /// renderer's [`GpuContext`].
    Surface {
        surface: wgpu::Surface<'static>,
        width: u32,
        height: u32,
    },
}

impl RenderTarget {
    pub fn offscreen(width: u32, height: u32) -> Self {
        RenderTarget::Offscreen {
            width,
            height,
            format: wgpu::TextureFormat::Rgba8Unorm,
        }
    }

    pub fn surface(surface: wgpu::Surface<'static>, width: u32, height: u32) -> Self {
        RenderTarget::Surface {
            surface,
            width,
            height,
        }
    }
}

/// Raymarch quality and appearance.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderSettings {
    /// Samples per smallest voxel edge along a ray.
    pub sample_rate: f32,
    /// Upper bound on samples per ray. Longer rays take larger steps.
    pub max_steps: u32,
    /// Accumulated opacity at which a ray stops.
    pub early_termination: f32,
    /// Gradient-based headlight shading.
    pub shading: bool,
    /// Straight (non-premultiplied) RGBA behind the volume.
    pub background: [f32; 4],
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            sample_rate: 2.0,
            max_steps: 1024,
            early_termination: 0.98,
            shading: true,
            background: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

impl RenderSettings {
    pub fn with_sample_rate(mut self, sample_rate: f32) -> Self {
        if sample_rate.is_finite() {
            self.sample_rate = sample_rate.clamp(0.25, 8.0);
        }
        self
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps.clamp(16, 8192);
        self
    }

    pub fn with_early_termination(mut self, alpha: f32) -> Self {
        if alpha.is_finite() {
            self.early_termination = alpha.clamp(0.5, 1.0);
        }
        self
    }

    pub fn with_shading(mut self, shading: bool) -> Self {
        self.shading = shading;
        self
    }

    pub fn with_background(mut self, rgba: [f32; 4]) -> Self {
        self.background = rgba.map(|c| if c.is_finite() { c.clamp(0.0, 1.0) } else { 0.0 });
        self
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct RenderUniforms {
    inv_view_proj: [[f32; 4]; 4],
    extent: [f32; 4],
    texel: [f32; 4],
    intensity_map: [f32; 4],
    background: [f32; 4],
    limits: [u32; 4],
}

enum FrameTarget {
    Offscreen {
        texture: wgpu::Texture,
        view: wgpu::TextureView,
    },
    Surface {
        surface: wgpu::Surface<'static>,
        config: wgpu::SurfaceConfiguration,
    },
}

/// What the renderer remembers about the uploaded volume.
#[derive(Clone, Copy, Debug)]
struct VolumeInfo {
    dims: (u32, u32, u32),
    extent: Vec3,
    min_spacing: f32,
    value_range: (f32, f32),
}

/// What the renderer remembers about the uploaded transfer function.
#[derive(Clone, Copy, Debug)]
struct BoundTransferFunction {
    fingerprint: u64,
    resolution: u32,
    domain: IntensityDomain,
}

impl BoundTransferFunction {
    fn of(texture: &TransferFunctionTexture) -> Self {
        Self {
            fingerprint: texture.fingerprint(),
            resolution: texture.resolution(),
            domain: texture.domain(),
        }
    }
}

/// GPU raycaster for one volume.
///
/// Owns every GPU object it creates. Two renderers never share textures, so
/// a host showing two volumes simply creates two renderers.
pub struct VolumeRenderer {
    context: GpuContext,
    target: FrameTarget,
    format: wgpu::TextureFormat,
    viewport: (u32, u32),
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    bind_group: wgpu::BindGroup,
    sampler: wgpu::Sampler,
    uniform_buffer: wgpu::Buffer,
    volume_texture: wgpu::Texture,
    volume_view: wgpu::TextureView,
    transfer_function_texture: wgpu::Texture,
    transfer_function_view: wgpu::TextureView,
    volume: VolumeInfo,
    transfer_function: BoundTransferFunction,
    settings: RenderSettings,
    device_lost: Arc<OnceLock<String>>,
    transfer_function_uploads: u64,
}

impl VolumeRenderer {
    /// Upload `volume` and `transfer_function` and build the raycast
    /// pipeline for `target`.
    ///
    /// The volume is never downsampled: a grid larger than the device's 3D
    /// texture limit fails with [`RendererError::VolumeTooLarge`]. Allocation
    /// and validation failures during setup are reported as errors instead of
    /// surfacing later as a lost device.
    ///
    /// Registers a device-lost callback on `context.device`, replacing any the
    /// host set before.
    pub async fn new(
        context: GpuContext,
        target: RenderTarget,
        volume: &VolumeDataset,
        transfer_function: &TransferFunctionTexture,
        camera: &CameraState,
        settings: RenderSettings,
    ) -> Result<Self, RendererError> {
        let limits = context.device.limits();
        Self::check_volume_fits(volume, &limits)?;
        Self::check_transfer_function_fits(transfer_function, &limits)?;

        let (target, format, viewport) = Self::create_frame_target(&context, target)?;

        let device_lost = Arc::new(OnceLock::new());
        {
            let device_lost = Arc::clone(&device_lost);
            context.device.set_device_lost_callback(move |reason, message| {
                if matches!(reason, wgpu::DeviceLostReason::Destroyed) {
                    log::debug!("GPU device destroyed: {message}");
                } else {
                    log::error!("GPU device lost ({reason:?}): {message}");
                }
                let _ = device_lost.set(format!("{reason:?}: {message}"));
            });
        }

        let started = Instant::now();
        context.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        context.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let (volume_texture, volume_view) = Self::upload_volume(&context, volume);
        let (transfer_function_texture, transfer_function_view) =
            Self::create_transfer_function_texture(&context.device, transfer_function.resolution());
        Self::write_transfer_function(&context.queue, &transfer_function_texture, transfer_function);

        let sampler = context.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Volume Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let uniform_buffer = context.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Volume Render Uniforms"),
            size: std::mem::size_of::<RenderUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let bind_group_layout = Self::create_bind_group_layout(&context.device);
        let pipeline = Self::create_pipeline(&context.device, &bind_group_layout, format);
        let bind_group = Self::create_bind_group(
            &context.device,
            &bind_group_layout,
            &uniform_buffer,
            &volume_view,
            &transfer_function_view,
            &sampler,
        );

        let validation = context.device.pop_error_scope().await;
        let out_of_memory = context.device.pop_error_scope().await;
        if let Some(error) = out_of_memory {
            return Err(RendererError::OutOfMemory(error.to_string()));
        }
        if let Some(error) = validation {
            return Err(RendererError::Validation(error.to_string()));
        }

        let (depth, height, width) = volume.dim();
        let (depth, height, width) = (depth as u32, height as u32, width as u32);
        log::info!(
            "Volume renderer ready: {width}x{height}x{depth} volume, {}x{} viewport, {:?} in {:?}",
            viewport.0,
            viewport.1,
            format,
            started.elapsed()
        );

        let renderer = Self {
            context,
            target,
            format,
            viewport,
            pipeline,
            bind_group_layout,
            bind_group,
            sampler,
            uniform_buffer,
            volume_texture,
            volume_view,
            transfer_function_texture,
            transfer_function_view,
            volume: VolumeInfo {
                dims: (width, height, depth),
                extent: volume.extent(),
                min_spacing: volume.min_spacing(),
                value_range: volume.value_range(),
            },
            transfer_function: BoundTransferFunction::of(transfer_function),
            settings,
            device_lost,
            transfer_function_uploads: 1,
        };
        renderer.write_uniforms(camera);
        Ok(renderer)
    }

    /// Draw one frame.
    ///
    /// The transfer function texture is re-uploaded only when
    /// `transfer_function` differs from the bound one. On a surface target an
    /// outdated or timed-out swapchain skips the frame instead of failing.
    pub fn render(
        &mut self,
        camera: &CameraState,
        transfer_function: &TransferFunctionTexture,
    ) -> Result<(), RendererError> {
        if let Some(reason) = self.device_lost.get() {
            return Err(RendererError::DeviceLost(reason.clone()));
        }
        let started = Instant::now();

        if transfer_function.fingerprint() != self.transfer_function.fingerprint {
            self.update_transfer_function(transfer_function)?;
        }
        self.write_uniforms(camera);

        match &self.target {
            FrameTarget::Offscreen { view, .. } => {
                let commands = self.encode_frame(view);
                self.context.queue.submit(Some(commands));
            }
            FrameTarget::Surface { surface, config } => {
                let frame = match surface.get_current_texture() {
                    Ok(frame) => frame,
                    Err(wgpu::SurfaceError::Outdated | wgpu::SurfaceError::Lost) => {
                        log::warn!("Surface outdated, reconfiguring and skipping frame");
                        surface.configure(&self.context.device, config);
                        return Ok(());
                    }
                    Err(wgpu::SurfaceError::Timeout) => {
                        log::warn!("Timed out acquiring surface texture, skipping frame");
                        return Ok(());
                    }
                    Err(wgpu::SurfaceError::OutOfMemory) => {
                        return Err(RendererError::OutOfMemory(
                            "acquiring surface texture".to_string(),
                        ));
                    }
                    Err(error) => return Err(error.into()),
                };
                let view = frame
                    .texture
                    .create_view(&wgpu::TextureViewDescriptor::default());
                let commands = self.encode_frame(&view);
                self.context.queue.submit(Some(commands));
                frame.present();
            }
        }

        log::trace!("Frame submitted in {:?}", started.elapsed());
        Ok(())
    }

    /// Resize the render target. Sizes are clamped to
    /// `1..=max_texture_dimension_2d`; the applied size is returned.
    ///
    /// Resizing to the current size does nothing. The volume texture is
    /// never touched.
    pub fn resize(&mut self, width: u32, height: u32) -> (u32, u32) {
        let max = self.context.device.limits().max_texture_dimension_2d;
        let size = clamp_viewport(width, height, max);
        if size == self.viewport {
            return size;
        }
        if size != (width, height) {
            log::debug!("Requested viewport {width}x{height} clamped to {}x{}", size.0, size.1);
        }

        match &mut self.target {
            FrameTarget::Offscreen { texture, view } => {
                let (new_texture, new_view) =
                    create_offscreen_texture(&self.context.device, size, self.format);
                *texture = new_texture;
                *view = new_view;
            }
            FrameTarget::Surface { surface, config } => {
                config.width = size.0;
                config.height = size.1;
                surface.configure(&self.context.device, config);
            }
        }
        self.viewport = size;
        log::debug!("Viewport resized to {}x{}", size.0, size.1);
        size
    }

    /// Upload a new transfer function. [`render`](Self::render) does this on
    /// its own when handed a different texture.
    pub fn update_transfer_function(
        &mut self,
        transfer_function: &TransferFunctionTexture,
    ) -> Result<(), RendererError> {
        Self::check_transfer_function_fits(transfer_function, &self.context.device.limits())?;

        if transfer_function.resolution() != self.transfer_function.resolution {
            let (texture, view) = Self::create_transfer_function_texture(
                &self.context.device,
                transfer_function.resolution(),
            );
            self.transfer_function_texture = texture;
            self.transfer_function_view = view;
            self.bind_group = Self::create_bind_group(
                &self.context.device,
                &self.bind_group_layout,
                &self.uniform_buffer,
                &self.volume_view,
                &self.transfer_function_view,
                &self.sampler,
            );
        }
        Self::write_transfer_function(
            &self.context.queue,
            &self.transfer_function_texture,
            transfer_function,
        );
        self.transfer_function = BoundTransferFunction::of(transfer_function);
        self.transfer_function_uploads += 1;
        log::debug!(
            "Transfer function updated ({} entries, {:?})",
            transfer_function.resolution(),
            transfer_function.domain()
        );
        Ok(())
    }

    /// Copy the last offscreen frame back to the CPU as tightly packed rows
    /// in the target format's byte order.
    pub async fn read_pixels(&self) -> Result<Vec<u8>, RendererError> {
        let FrameTarget::Offscreen { texture, .. } = &self.target else {
            return Err(RendererError::ReadbackUnsupported);
        };
        let (width, height) = self.viewport;
        let bytes_per_pixel = self.format.block_copy_size(None).unwrap_or(4);
        let unpadded_row = width * bytes_per_pixel;
        let padded_row = unpadded_row.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

        let device = &self.context.device;
        let staging_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Frame Staging Buffer"),
            size: u64::from(padded_row) * u64::from(height),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Frame Readback Encoder"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging_buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.context.queue.submit(Some(encoder.finish()));

        let buffer_slice = staging_buffer.slice(..);
        let (sender, receiver) = futures::channel::oneshot::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map_err(|error| RendererError::Readback(error.to_string()))?;
        receiver
            .await
            .map_err(|_| RendererError::Readback("map callback dropped".to_string()))?
            .map_err(|error| RendererError::Readback(error.to_string()))?;

        let data = buffer_slice.get_mapped_range();
        let mut pixels = Vec::with_capacity((unpadded_row * height) as usize);
        for row in data.chunks(padded_row as usize) {
            pixels.extend_from_slice(&row[..unpadded_row as usize]);
        }
        drop(data);
        staging_buffer.unmap();
        Ok(pixels)
    }

    /// View of the offscreen frame, for hosts compositing it themselves.
    pub fn frame_view(&self) -> Option<&wgpu::TextureView> {
        match &self.target {
            FrameTarget::Offscreen { view, .. } => Some(view),
            FrameTarget::Surface { .. } => None,
        }
    }

    pub fn viewport(&self) -> (u32, u32) {
        self.viewport
    }

    pub fn format(&self) -> wgpu::TextureFormat {
        self.format
    }

    /// Fingerprint of the transfer function currently on the GPU.
    pub fn transfer_function_fingerprint(&self) -> u64 {
        self.transfer_function.fingerprint
    }

    /// Transfer function texture writes since creation, counting the
    /// initial upload.
    pub fn transfer_function_uploads(&self) -> u64 {
        self.transfer_function_uploads
    }

    pub fn settings(&self) -> RenderSettings {
        self.settings
    }

    /// Takes effect on the next [`render`](Self::render).
    pub fn set_settings(&mut self, settings: RenderSettings) {
        self.settings = settings;
    }

    pub fn context(&self) -> &GpuContext {
        &self.context
    }

    /// Release every GPU object the renderer created. Dropping the renderer
    /// frees them too; this makes the release point explicit and immediate.
    pub fn dispose(self) {
        let Self {
            target,
            uniform_buffer,
            volume_texture,
            transfer_function_texture,
            ..
        } = self;
        volume_texture.destroy();
        transfer_function_texture.destroy();
        uniform_buffer.destroy();
        if let FrameTarget::Offscreen { texture, .. } = target {
            texture.destroy();
        }
        log::debug!("Volume renderer disposed");
    }

    fn check_volume_fits(volume: &VolumeDataset, limits: &wgpu::Limits) -> Result<(), RendererError> {
        let (depth, height, width) = volume.dim();
        let max = limits.max_texture_dimension_3d;
        if [width, height, depth]
            .iter()
            .all(|&extent| extent <= max as usize)
        {
            Ok(())
        } else {
            Err(RendererError::VolumeTooLarge {
                width,
                height,
                depth,
                max,
            })
        }
    }

    fn check_transfer_function_fits(
        transfer_function: &TransferFunctionTexture,
        limits: &wgpu::Limits,
    ) -> Result<(), RendererError> {
        let resolution = transfer_function.resolution();
        let max = limits.max_texture_dimension_2d;
        if resolution > max {
            return Err(RendererError::TransferFunctionTooLarge { resolution, max });
        }
        Ok(())
    }

    fn create_frame_target(
        context: &GpuContext,
        target: RenderTarget,
    ) -> Result<(FrameTarget, wgpu::TextureFormat, (u32, u32)), RendererError> {
        let max = context.device.limits().max_texture_dimension_2d;
        match target {
            RenderTarget::Offscreen {
                width,
                height,
                format,
            } => {
                let size = clamp_viewport(width, height, max);
                let (texture, view) = create_offscreen_texture(&context.device, size, format);
                Ok((FrameTarget::Offscreen { texture, view }, format, size))
            }
            RenderTarget::Surface {
                surface,
                width,
                height,
            } => {
                let size = clamp_viewport(width, height, max);
                let capabilities = surface.get_capabilities(&context.adapter);
                // Colors are composited in linear space and written as-is.
                let format = capabilities
                    .formats
                    .iter()
                    .copied()
                    .find(|format| !format.is_srgb())
                    .or_else(|| capabilities.formats.first().copied())
                    .ok_or(RendererError::SurfaceUnsupported)?;
                let config = wgpu::SurfaceConfiguration {
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                    format,
                    width: size.0,
                    height: size.1,
                    present_mode: wgpu::PresentMode::Fifo,
                    desired_maximum_frame_latency: 2,
                    alpha_mode: capabilities
                        .alpha_modes
                        .first()
                        .copied()
                        .unwrap_or(wgpu::CompositeAlphaMode::Auto),
                    view_formats: vec![],
                };
                surface.configure(&context.device, &config);
                Ok((FrameTarget::Surface { surface, config }, format, size))
            }
        }
    }

    fn upload_volume(
        context: &GpuContext,
        volume: &VolumeDataset,
    ) -> (wgpu::Texture, wgpu::TextureView) {
        let (depth, height, width) = volume.dim();
        let (depth, height, width) = (depth as u32, height as u32, width as u32);
        let texture_size = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: depth,
        };

        let volume_texture = context.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Volume 3D Texture"),
            size: texture_size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D3,
            format: VOLUME_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        let samples = volume.normalized_f16();
        context.queue.write_texture(
            wgpu::TexelCopyTextureInfoBase {
                texture: &volume_texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(&samples),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(width * std::mem::size_of::<half::f16>() as u32),
                rows_per_image: Some(height),
            },
            texture_size,
        );

        let volume_view = volume_texture.create_view(&wgpu::TextureViewDescriptor::default());
        (volume_texture, volume_view)
    }

    fn create_transfer_function_texture(
        device: &wgpu::Device,
        resolution: u32,
    ) -> (wgpu::Texture, wgpu::TextureView) {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Transfer Function Texture"),
            size: wgpu::Extent3d {
                width: resolution,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TRANSFER_FUNCTION_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        (texture, view)
    }

    fn write_transfer_function(
        queue: &wgpu::Queue,
        texture: &wgpu::Texture,
        transfer_function: &TransferFunctionTexture,
    ) {
        let resolution = transfer_function.resolution();
        queue.write_texture(
            wgpu::TexelCopyTextureInfoBase {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            transfer_function.data(),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(4 * resolution),
                rows_per_image: Some(1),
            },
            wgpu::Extent3d {
                width: resolution,
                height: 1,
                depth_or_array_layers: 1,
            },
        );
    }

    fn create_bind_group_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
        device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Volume Render Bind Group Layout"),
            entries: &[
                // Uniforms
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Volume
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D3,
                        multisampled: false,
                    },
                    count: None,
                },
                // Transfer function
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                // Sampler
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        })
    }

    fn create_bind_group(
        device: &wgpu::Device,
        layout: &wgpu::BindGroupLayout,
        uniform_buffer: &wgpu::Buffer,
        volume_view: &wgpu::TextureView,
        transfer_function_view: &wgpu::TextureView,
        sampler: &wgpu::Sampler,
    ) -> wgpu::BindGroup {
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Volume Render Bind Group"),
            layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(volume_view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(transfer_function_view),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::Sampler(sampler),
                },
            ],
        })
    }

    fn create_pipeline(
        device: &wgpu::Device,
        bind_group_layout: &wgpu::BindGroupLayout,
        format: wgpu::TextureFormat,
    ) -> wgpu::RenderPipeline {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Volume Raycast Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(include_str!(
                "shaders/volume_raycast.wgsl"
            ))),
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Volume Raycast Pipeline Layout"),
            bind_group_layouts: &[bind_group_layout],
            push_constant_ranges: &[],
        });

        device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Volume Raycast Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                buffers: &[],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        })
    }

    /// Keeps the previous camera when the view-projection cannot be inverted.
    fn write_uniforms(&self, camera: &CameraState) {
        let (width, height) = self.viewport;
        let aspect_ratio = width as f32 / height as f32;
        let inverse = camera::view_projection_matrix(camera, aspect_ratio)
            .ok()
            .and_then(|matrix| invert_matrix4(&matrix));
        let Some(inv_view_proj) = inverse else {
            log::warn!("Camera matrix is not invertible, keeping previous view");
            return;
        };

        let uniforms = self.build_uniforms(inv_view_proj.to_cols_array_2d());
        self.context
            .queue
            .write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&uniforms));
    }

    fn build_uniforms(&self, inv_view_proj: [[f32; 4]; 4]) -> RenderUniforms {
        let VolumeInfo {
            dims: (width, height, depth),
            extent,
            min_spacing,
            value_range,
        } = self.volume;
        let base_step = min_spacing / self.settings.sample_rate.max(f32::EPSILON);
        let (scale, offset) = intensity_mapping(value_range, self.transfer_function.domain);
        let [r, g, b, a] = self.settings.background;

        RenderUniforms {
            inv_view_proj,
            extent: [extent.x, extent.y, extent.z, base_step],
            texel: [
                1.0 / width as f32,
                1.0 / height as f32,
                1.0 / depth as f32,
                min_spacing,
            ],
            intensity_map: [
                scale,
                offset,
                self.settings.early_termination,
                if self.settings.shading { 1.0 } else { 0.0 },
            ],
            background: [r, g, b, a],
            limits: [
                self.settings.max_steps.max(1),
                self.transfer_function.resolution,
                0,
                0,
            ],
        }
    }

    fn encode_frame(&self, view: &wgpu::TextureView) -> wgpu::CommandBuffer {
        let mut encoder = self
            .context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Volume Render Encoder"),
            });
        {
            let [r, g, b, a] = self.settings.background;
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Volume Render Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color {
                            r: f64::from(r),
                            g: f64::from(g),
                            b: f64::from(b),
                            a: f64::from(a),
                        }),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            render_pass.set_pipeline(&self.pipeline);
            render_pass.set_bind_group(0, &self.bind_group, &[]);
            render_pass.draw(0..3, 0..1);
        }
        encoder.finish()
    }
}

fn clamp_viewport(width: u32, height: u32, max: u32) -> (u32, u32) {
    let max = max.max(1);
    (width.clamp(1, max), height.clamp(1, max))
}

fn create_offscreen_texture(
    device: &wgpu::Device,
    (width, height): (u32, u32),
    format: wgpu::TextureFormat,
) -> (wgpu::Texture, wgpu::TextureView) {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Volume Frame Texture"),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT
            | wgpu::TextureUsages::COPY_SRC
            | wgpu::TextureUsages::TEXTURE_BINDING,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    (texture, view)
}

/// Linear map from a normalized volume sample (`0` at the dataset minimum,
/// `1` at its maximum) to the transfer function's `[0, 1]` coordinate.
fn intensity_mapping(value_range: (f32, f32), domain: IntensityDomain) -> (f32, f32) {
    let (volume_min, volume_max) = value_range;
    let (domain_min, domain_max) = domain.resolve(value_range);
    let domain_span = domain_max - domain_min;
    if !(domain_span > 0.0) {
        return (1.0, 0.0);
    }
    let scale = (volume_max - volume_min) / domain_span;
    let offset = (volume_min - domain_min) / domain_span;
    (scale, offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniforms_are_vec4_aligned() {
        assert_eq!(std::mem::size_of::<RenderUniforms>() % 16, 0);
        assert_eq!(std::mem::size_of::<RenderUniforms>(), 144);
    }

    #[test]
    fn viewport_is_clamped_to_device_limits() {
        assert_eq!(clamp_viewport(0, 0, 8192), (1, 1));
        assert_eq!(clamp_viewport(640, 480, 8192), (640, 480));
        assert_eq!(clamp_viewport(20000, 10, 8192), (8192, 10));
    }

    #[test]
    fn dataset_domain_maps_identity() {
        let (scale, offset) = intensity_mapping((-1000.0, 3000.0), IntensityDomain::Dataset);
        assert!((scale - 1.0).abs() < 1e-6);
        assert!(offset.abs() < 1e-6);
    }

    #[test]
    fn fixed_domain_maps_hounsfield_units() {
        // Volume spans [-1000, 1000] HU, transfer function covers [0, 1000].
        let domain = IntensityDomain::Fixed {
            min: 0.0,
            max: 1000.0,
        };
        let (scale, offset) = intensity_mapping((-1000.0, 1000.0), domain);
        let map = |s: f32| s * scale + offset;
        assert!((map(0.5) - 0.0).abs() < 1e-6);
        assert!((map(0.75) - 0.5).abs() < 1e-6);
        assert!((map(1.0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn settings_builders_clamp() {
        let settings = RenderSettings::default()
            .with_sample_rate(100.0)
            .with_max_steps(1)
            .with_early_termination(f32::NAN)
            .with_background([2.0, -1.0, f32::INFINITY, 0.5]);
        assert_eq!(settings.sample_rate, 8.0);
        assert_eq!(settings.max_steps, 16);
        assert_eq!(settings.early_termination, 0.98);
        assert_eq!(settings.background, [1.0, 0.0, 0.0, 0.5]);
    }
}
