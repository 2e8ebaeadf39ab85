//! # DICOM volume rendering library
//!
//! This crate renders DICOM series as GPU volume renderings (VRT) using WGPU.
//! A series is loaded into a [`VolumeDataset`], uploaded once as a 3D texture
//! and raymarched every frame with a transfer function that maps intensities
//! to color and opacity.
//!
//! The pieces are usable on their own:
//!  - [`volume_loader`] reads a directory of `.dcm` files (in parallel using
//!    rayon) into a volume with Hounsfield-unit samples
//!  - [`camera`] is pure orbit camera math: rotate, zoom, pan and the
//!    matrices derived from them
//!  - [`transfer_function`] holds the clinical presets and turns them into
//!    RGBA lookup tables
//!  - [`gpu`] answers whether volume rendering is possible at all
//!  - [`renderer`] owns every GPU object and draws frames to a surface or an
//!    offscreen texture
//!
//! Hosts should call [`is_volume_rendering_available`] first and fall back to
//! a 2D viewer when it returns `false`. DICOM files are assumed to have the
//! following attributes:
//!   - Axial data set
//!   - No multiframe (always the first frame is used)
//!   - Images from the same series (Series Instance UID) and acquisition
//!     (Acquisition Number)
//!
//! # Examples
//!
//! ## Rendering a CT series to a PNG
//!
//! ```no_run
//! # use dicom_vrt::{
//! #     GpuContext, RenderSettings, RenderTarget, SortBy, VolumeLoader, VolumeRenderer,
//! #     camera, transfer_function,
//! # };
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let volume = VolumeLoader::load_from_directory("dicom", SortBy::ImagePositionPatient)?;
//! let camera = camera::create_default_camera(&volume);
//! let bone = transfer_function::preset_texture("ct-bone", 256)?;
//!
//! let context = GpuContext::new_headless().await?;
//! let mut renderer = VolumeRenderer::new(
//!     context,
//!     RenderTarget::offscreen(512, 512),
//!     &volume,
//!     &bone,
//!     &camera,
//!     RenderSettings::default(),
//! )
//! .await?;
//!
//! let camera = camera::apply_rotation(&camera, 0.5, -0.3);
//! renderer.render(&camera, &bone)?;
//! let pixels = renderer.read_pixels().await?;
//! image::RgbaImage::from_raw(512, 512, pixels)
//!     .ok_or("frame size mismatch")?
//!     .save("result.png")?;
//! renderer.dispose();
//! # Ok(())
//! # }
//! ```

pub mod camera;
pub mod enums;
pub mod gpu;
pub mod math;
pub mod renderer;
pub mod transfer_function;
pub mod volume;
pub mod volume_loader;

pub use camera::{CameraConfig, CameraError, CameraState};
pub use enums::{Orientation, Projection, SortBy};
pub use gpu::{GpuContext, RendererError, is_volume_rendering_available, query_adapter};
pub use renderer::{RenderSettings, RenderTarget, VolumeRenderer};
pub use transfer_function::{
    TransferFunctionPreset, TransferFunctionTexture, generate_transfer_function_texture,
};
pub use volume::VolumeDataset;
pub use volume_loader::VolumeLoader;
