use std::{env, error::Error, path::PathBuf, process};

use dicom_vrt::{
    GpuContext, RenderSettings, RenderTarget, SortBy, VolumeLoader, VolumeRenderer, camera,
    is_volume_rendering_available, transfer_function,
};

const FRAME_SIZE: u32 = 512;

fn usage() -> String {
    let presets: Vec<_> = transfer_function::preset_names().collect();
    format!(
        "usage: dicom-vrt <dicom-dir> [preset] [out.png]\npresets: {}",
        presets.join(", ")
    )
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let mut args = env::args().skip(1);
    let Some(directory) = args.next().map(PathBuf::from) else {
        eprintln!("{}", usage());
        process::exit(2);
    };
    let preset = args.next().unwrap_or_else(|| "ct-bone".to_string());
    let output = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("result.png"));

    if !is_volume_rendering_available() {
        eprintln!("Volume rendering is not available on this machine");
        process::exit(1);
    }

    let volume = VolumeLoader::load_from_directory(&directory, SortBy::ImagePositionPatient)?;
    let transfer_function = transfer_function::preset_texture(&preset, 256)?;
    let camera = camera::apply_rotation(&camera::create_default_camera(&volume), 0.6, -0.35);

    let context = GpuContext::new_headless().await?;
    let mut renderer = VolumeRenderer::new(
        context,
        RenderTarget::offscreen(FRAME_SIZE, FRAME_SIZE),
        &volume,
        &transfer_function,
        &camera,
        RenderSettings::default(),
    )
    .await?;

    renderer.render(&camera, &transfer_function)?;
    let pixels = renderer.read_pixels().await?;
    let (width, height) = renderer.viewport();
    renderer.dispose();

    image::RgbaImage::from_raw(width, height, pixels)
        .ok_or("rendered frame has unexpected size")?
        .save(&output)?;
    log::info!("Saved {} rendering to {}", preset, output.display());
    Ok(())
}
