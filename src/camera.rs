//! Orbit camera for volume viewing.
//!
//! `CameraState` is a small `Copy` value. Every gesture handler returns a new
//! state instead of mutating in place, so undo stacks and readers on other
//! panes never observe a half-applied update. Nothing here touches the GPU.

use std::f32::consts::FRAC_PI_2;

use glam::{Mat4, Quat, Vec3};
use thiserror::Error;

use crate::enums::{Orientation, Projection};
use crate::volume::VolumeDataset;

/// Extra room around the bounding sphere in the default framing.
const FRAMING_MARGIN: f32 = 1.1;

#[derive(Debug, Error, PartialEq)]
pub enum CameraError {
    #[error("Aspect ratio must be positive and finite, got {0}")]
    InvalidAspectRatio(f32),
}

/// Smallest and largest accepted vertical field of view, in degrees.
const FOV_RANGE_DEGREES: (f32, f32) = (1.0, 170.0);

/// Static camera limits and lens settings.
///
/// Built from [`Default`] and the `with_*` builders, which keep every field
/// in range: a positive field of view below 180 degrees, ordered positive
/// zoom limits and a non-negative pan speed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraConfig {
    fov_y: f32,
    min_zoom: f32,
    max_zoom: f32,
    projection: Projection,
    pan_speed: f32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            fov_y: std::f32::consts::FRAC_PI_4,
            min_zoom: 0.1,
            max_zoom: 20.0,
            projection: Projection::Perspective,
            pan_speed: 1.0,
        }
    }
}

impl CameraConfig {
    /// Vertical field of view in radians.
    pub fn fov_y(&self) -> f32 {
        self.fov_y
    }

    pub fn min_zoom(&self) -> f32 {
        self.min_zoom
    }

    pub fn max_zoom(&self) -> f32 {
        self.max_zoom
    }

    pub fn projection(&self) -> Projection {
        self.projection
    }

    /// Multiplier on the screen-consistent pan distance.
    pub fn pan_speed(&self) -> f32 {
        self.pan_speed
    }

    /// Set the vertical field of view, clamped to 1..=170 degrees.
    pub fn with_fov_degrees(mut self, degrees: f32) -> Self {
        if degrees.is_finite() {
            let (min, max) = FOV_RANGE_DEGREES;
            self.fov_y = degrees.clamp(min, max).to_radians();
        }
        self
    }

    /// Set the zoom limits. Non-positive or non-finite limits are ignored and
    /// swapped limits are put back in order.
    pub fn with_zoom_limits(mut self, min_zoom: f32, max_zoom: f32) -> Self {
        let valid = |z: f32| z.is_finite() && z > 0.0;
        if valid(min_zoom) && valid(max_zoom) {
            self.min_zoom = min_zoom.min(max_zoom);
            self.max_zoom = min_zoom.max(max_zoom);
        }
        self
    }

    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    pub fn with_pan_speed(mut self, pan_speed: f32) -> Self {
        if pan_speed.is_finite() {
            self.pan_speed = pan_speed.max(0.0);
        }
        self
    }

    /// Puts every field back in range, replacing values the builders would
    /// have rejected with their defaults.
    fn sanitized(self) -> Self {
        let defaults = Self::default();
        let (min_fov, max_fov) = FOV_RANGE_DEGREES;
        let fov_y = if self.fov_y.is_finite() && self.fov_y > 0.0 {
            self.fov_y.clamp(min_fov.to_radians(), max_fov.to_radians())
        } else {
            defaults.fov_y
        };
        let limits = defaults.with_zoom_limits(self.min_zoom, self.max_zoom);
        let pan_speed = if self.pan_speed.is_finite() {
            self.pan_speed.max(0.0)
        } else {
            defaults.pan_speed
        };
        Self {
            fov_y,
            min_zoom: limits.min_zoom,
            max_zoom: limits.max_zoom,
            projection: self.projection,
            pan_speed,
        }
    }
}

/// Orientation, zoom and pan of the viewer around a pivot.
///
/// Invariants: `rotation` is a unit quaternion and `zoom` lies within the
/// configured limits, which keeps the view matrix invertible.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraState {
    rotation: Quat,
    zoom: f32,
    pan: Vec3,
    target: Vec3,
    distance: f32,
    radius: f32,
    config: CameraConfig,
}

impl CameraState {
    /// Camera framing a sphere of `radius` around `target`, unrotated and at
    /// unit zoom.
    pub fn looking_at(target: Vec3, radius: f32, config: CameraConfig) -> Self {
        let config = config.sanitized();
        let radius = if radius.is_finite() && radius > 0.0 {
            radius
        } else {
            1.0
        };
        let distance = radius / (config.fov_y * 0.5).sin() * FRAMING_MARGIN;
        Self {
            rotation: Quat::IDENTITY,
            zoom: 1.0_f32.clamp(config.min_zoom, config.max_zoom),
            pan: Vec3::ZERO,
            target,
            distance,
            radius,
            config,
        }
    }

    pub fn for_volume(volume: &VolumeDataset, config: CameraConfig) -> Self {
        Self::looking_at(volume_center(volume), volume.bounding_radius(), config)
    }

    pub fn rotation(&self) -> Quat {
        self.rotation
    }

    pub fn zoom(&self) -> f32 {
        self.zoom
    }

    pub fn pan(&self) -> Vec3 {
        self.pan
    }

    /// The pivot the camera orbits, before panning.
    pub fn target(&self) -> Vec3 {
        self.target
    }

    /// Eye-to-pivot distance at unit zoom.
    pub fn distance(&self) -> f32 {
        self.distance
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    fn focal_distance(&self) -> f32 {
        self.distance / self.zoom
    }

    fn half_fov_tan(&self) -> f32 {
        (self.config.fov_y * 0.5).tan()
    }
}

/// Default camera for a dataset: looking at its center from far enough away
/// that the whole volume fits in view.
pub fn create_default_camera(volume: &VolumeDataset) -> CameraState {
    CameraState::for_volume(volume, CameraConfig::default())
}

/// Geometric center of the volume in world coordinates.
pub fn volume_center(volume: &VolumeDataset) -> Vec3 {
    volume.center()
}

/// Compose an incremental rotation: yaw about world up, pitch about the
/// camera's own horizontal axis. Angles are in radians.
pub fn apply_rotation(camera: &CameraState, delta_yaw: f32, delta_pitch: f32) -> CameraState {
    if !delta_yaw.is_finite() || !delta_pitch.is_finite() {
        log::debug!("Ignoring non-finite rotation ({delta_yaw}, {delta_pitch})");
        return *camera;
    }
    let rotation =
        Quat::from_rotation_y(delta_yaw) * camera.rotation * Quat::from_rotation_x(delta_pitch);
    CameraState {
        rotation: rotation.normalize(),
        ..*camera
    }
}

/// Multiply the zoom by `factor`, clamped to the configured limits.
pub fn apply_zoom(camera: &CameraState, factor: f32) -> CameraState {
    if !factor.is_finite() || factor <= 0.0 {
        log::debug!("Ignoring invalid zoom factor {factor}");
        return *camera;
    }
    let zoom = (camera.zoom * factor).clamp(camera.config.min_zoom, camera.config.max_zoom);
    CameraState { zoom, ..*camera }
}

/// Move eye and pivot together in the view plane.
///
/// `delta_x` and `delta_y` are fractions of the viewport height; positive
/// values move the view right and up. The world-space distance follows the
/// visible height at the pivot, so the same gesture pans the same number of
/// pixels at any zoom.
pub fn apply_pan(camera: &CameraState, delta_x: f32, delta_y: f32) -> CameraState {
    if !delta_x.is_finite() || !delta_y.is_finite() {
        log::debug!("Ignoring non-finite pan ({delta_x}, {delta_y})");
        return *camera;
    }
    let visible_height = 2.0 * camera.focal_distance() * camera.half_fov_tan();
    let right = camera.rotation * Vec3::X;
    let up = camera.rotation * Vec3::Y;
    let offset = (right * delta_x + up * delta_y) * visible_height * camera.config.pan_speed;
    CameraState {
        pan: camera.pan + offset,
        ..*camera
    }
}

/// Snap to a standard anatomical view, keeping zoom and pan.
pub fn apply_standard_view(camera: &CameraState, orientation: Orientation) -> CameraState {
    let rotation = match orientation {
        Orientation::Axial => Quat::IDENTITY,
        Orientation::Coronal => Quat::from_rotation_x(FRAC_PI_2),
        Orientation::Sagittal => Quat::from_rotation_z(FRAC_PI_2) * Quat::from_rotation_x(FRAC_PI_2),
    };
    CameraState {
        rotation,
        ..*camera
    }
}

pub fn look_at_point(camera: &CameraState) -> Vec3 {
    camera.target + camera.pan
}

pub fn eye_position(camera: &CameraState) -> Vec3 {
    look_at_point(camera) + camera.rotation * Vec3::Z * camera.focal_distance()
}

pub fn up_vector(camera: &CameraState) -> Vec3 {
    camera.rotation * Vec3::Y
}

/// World-to-camera transform.
pub fn view_matrix(camera: &CameraState) -> Mat4 {
    Mat4::look_at_rh(eye_position(camera), look_at_point(camera), up_vector(camera))
}

/// Camera-to-clip transform for a viewport of the given aspect ratio.
///
/// Depth follows the wgpu convention (`[0, 1]`). The clip range is derived
/// from the pivot distance and the volume radius so the whole volume stays
/// between the planes at every zoom level.
pub fn projection_matrix(camera: &CameraState, aspect_ratio: f32) -> Result<Mat4, CameraError> {
    if !aspect_ratio.is_finite() || aspect_ratio <= 0.0 {
        return Err(CameraError::InvalidAspectRatio(aspect_ratio));
    }
    let focal = camera.focal_distance();
    let reach = camera.radius * 2.0 + camera.pan.length();
    let far = focal + reach;

    let matrix = match camera.config.projection {
        Projection::Perspective => {
            // No part of the volume is closer to the eye than `focal - reach`.
            let near = (focal - reach).max(camera.radius * 1e-3).max(1e-4);
            Mat4::perspective_rh(camera.config.fov_y, aspect_ratio, near, far)
        }
        Projection::Orthographic => {
            let half_height = focal * camera.half_fov_tan();
            let half_width = half_height * aspect_ratio;
            // The eye may sit inside the volume at high zoom; a negative near
            // plane keeps the part behind it visible.
            Mat4::orthographic_rh(
                -half_width,
                half_width,
                -half_height,
                half_height,
                -reach,
                far,
            )
        }
    };
    Ok(matrix)
}

pub fn view_projection_matrix(
    camera: &CameraState,
    aspect_ratio: f32,
) -> Result<Mat4, CameraError> {
    Ok(projection_matrix(camera, aspect_ratio)? * view_matrix(camera))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::{invert_matrix4, is_finite_matrix};
    use ndarray::Array3;

    fn test_volume() -> VolumeDataset {
        VolumeDataset::new(Array3::zeros((40, 64, 32)), (1.0, 1.0, 1.0)).unwrap()
    }

    fn assert_vec_close(a: Vec3, b: Vec3) {
        assert!((a - b).length() < 1e-4, "{a:?} != {b:?}");
    }

    #[test]
    fn default_camera_looks_at_volume_center() {
        let volume = test_volume();
        let camera = create_default_camera(&volume);
        assert_eq!(camera.target(), Vec3::new(16.0, 32.0, 20.0));
        assert_eq!(camera.zoom(), 1.0);
        assert_eq!(camera.rotation(), Quat::IDENTITY);
        assert!(camera.distance() > volume.bounding_radius());
    }

    #[test]
    fn zoom_by_one_is_identity() {
        let camera = apply_rotation(&create_default_camera(&test_volume()), 0.3, -0.2);
        assert_eq!(apply_zoom(&camera, 1.0), camera);
    }

    #[test]
    fn tiny_zoom_clamps_to_minimum() {
        let camera = create_default_camera(&test_volume());
        let zoomed = apply_zoom(&camera, 0.0001);
        assert_eq!(zoomed.zoom(), camera.config().min_zoom());
        assert!(invert_matrix4(&view_matrix(&zoomed)).is_some());
    }

    #[test]
    fn huge_zoom_clamps_to_maximum() {
        let camera = create_default_camera(&test_volume());
        assert_eq!(apply_zoom(&camera, 1e6).zoom(), camera.config().max_zoom());
    }

    #[test]
    fn invalid_zoom_factor_is_ignored() {
        let camera = create_default_camera(&test_volume());
        assert_eq!(apply_zoom(&camera, 0.0), camera);
        assert_eq!(apply_zoom(&camera, -2.0), camera);
        assert_eq!(apply_zoom(&camera, f32::NAN), camera);
    }

    #[test]
    fn rotation_is_undone_by_its_negation() {
        let camera = create_default_camera(&test_volume());
        let there = apply_rotation(&camera, 1.2, -0.7);
        let back = apply_rotation(&there, -1.2, 0.7);
        assert!(back.rotation().abs_diff_eq(camera.rotation(), 1e-5));
    }

    #[test]
    fn rotation_stays_normalized_after_many_steps() {
        let mut camera = create_default_camera(&test_volume());
        for _ in 0..10_000 {
            camera = apply_rotation(&camera, 0.013, 0.007);
        }
        assert!((camera.rotation().length() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn pitching_past_the_pole_keeps_view_invertible() {
        let camera = apply_rotation(&create_default_camera(&test_volume()), 0.0, FRAC_PI_2);
        assert!(invert_matrix4(&view_matrix(&camera)).is_some());
    }

    #[test]
    fn pan_moves_eye_and_pivot_together() {
        let camera = create_default_camera(&test_volume());
        let panned = apply_pan(&camera, 0.25, 0.0);
        let shift = look_at_point(&panned) - look_at_point(&camera);
        assert!(shift.x > 0.0);
        assert_vec_close(eye_position(&panned) - eye_position(&camera), shift);
    }

    #[test]
    fn pan_distance_shrinks_with_zoom() {
        let camera = create_default_camera(&test_volume());
        let zoomed = apply_zoom(&camera, 2.0);
        let wide = apply_pan(&camera, 0.1, 0.1).pan().length();
        let tight = apply_pan(&zoomed, 0.1, 0.1).pan().length();
        assert!((wide / tight - 2.0).abs() < 1e-4);
    }

    #[test]
    fn projection_rejects_bad_aspect_ratios() {
        let camera = create_default_camera(&test_volume());
        assert_eq!(
            projection_matrix(&camera, 0.0),
            Err(CameraError::InvalidAspectRatio(0.0))
        );
        assert!(projection_matrix(&camera, -1.5).is_err());
        assert!(projection_matrix(&camera, f32::NAN).is_err());
        assert!(projection_matrix(&camera, 16.0 / 9.0).is_ok());
    }

    #[test]
    fn orthographic_projection_is_affine() {
        let config = CameraConfig::default().with_projection(Projection::Orthographic);
        let camera = CameraState::for_volume(&test_volume(), config);
        let proj = projection_matrix(&camera, 1.0).unwrap();
        assert!((proj.w_axis.w - 1.0).abs() < 1e-6);
        assert!(invert_matrix4(&proj).is_some());
    }

    #[test]
    fn volume_center_projects_to_screen_center() {
        let camera = create_default_camera(&test_volume());
        let clip = view_projection_matrix(&camera, 1.3).unwrap() * camera.target().extend(1.0);
        let ndc = clip.truncate() / clip.w;
        assert!(ndc.x.abs() < 1e-4 && ndc.y.abs() < 1e-4);
        assert!((0.0..=1.0).contains(&ndc.z));
    }

    #[test]
    fn standard_views_place_the_eye_on_the_expected_axis() {
        let camera = CameraState::looking_at(Vec3::ZERO, 1.0, CameraConfig::default());
        let eye_dir = |o| eye_position(&apply_standard_view(&camera, o)).normalize();
        assert_vec_close(eye_dir(Orientation::Axial), Vec3::Z);
        assert_vec_close(eye_dir(Orientation::Coronal), Vec3::NEG_Y);
        assert_vec_close(eye_dir(Orientation::Sagittal), Vec3::X);
    }

    #[test]
    fn out_of_range_config_literals_are_sanitized() {
        let swapped = CameraConfig {
            min_zoom: 5.0,
            max_zoom: 1.0,
            ..CameraConfig::default()
        };
        let camera = CameraState::looking_at(Vec3::ZERO, 10.0, swapped);
        assert_eq!((camera.config().min_zoom(), camera.config().max_zoom()), (1.0, 5.0));
        assert_eq!(camera.zoom(), 1.0);
        assert_eq!(apply_zoom(&camera, 100.0).zoom(), 5.0);

        let flat = CameraConfig {
            fov_y: 0.0,
            min_zoom: f32::NAN,
            pan_speed: f32::INFINITY,
            ..CameraConfig::default()
        };
        let camera = CameraState::looking_at(Vec3::ZERO, 10.0, flat);
        assert_eq!(camera.config(), &CameraConfig::default());
        assert!(camera.distance().is_finite());
        assert!(is_finite_matrix(&view_matrix(&camera)));
        assert!(is_finite_matrix(&view_projection_matrix(&camera, 1.0).unwrap()));
    }

    #[test]
    fn zoom_limit_builder_orders_and_validates() {
        let config = CameraConfig::default().with_zoom_limits(8.0, 0.5);
        assert_eq!((config.min_zoom(), config.max_zoom()), (0.5, 8.0));
        let unchanged = CameraConfig::default().with_zoom_limits(0.0, 4.0);
        assert_eq!(unchanged, CameraConfig::default());
    }
}
