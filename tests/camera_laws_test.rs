//! Property tests for the camera and matrix helpers.

use dicom_vrt::{CameraConfig, CameraState, Projection, camera, math::invert_matrix4};
use glam::{Mat4, Quat, Vec3};
use proptest::prelude::*;
use std::f32::consts::PI;

fn arb_camera() -> impl Strategy<Value = CameraState> {
    (
        -PI..PI,
        -PI..PI,
        0.1f32..20.0,
        1.0f32..500.0,
        any::<bool>(),
    )
        .prop_map(|(yaw, pitch, zoom, radius, ortho)| {
            let projection = if ortho {
                Projection::Orthographic
            } else {
                Projection::Perspective
            };
            let config = CameraConfig::default().with_projection(projection);
            let base = CameraState::looking_at(Vec3::splat(radius * 0.5), radius, config);
            camera::apply_zoom(&camera::apply_rotation(&base, yaw, pitch), zoom)
        })
}

fn quat_close(a: Quat, b: Quat) -> bool {
    // q and -q are the same rotation.
    a.dot(b).abs() > 1.0 - 1e-5
}

fn mat_close(a: &Mat4, b: &Mat4) -> bool {
    a.to_cols_array()
        .iter()
        .zip(b.to_cols_array().iter())
        .all(|(x, y)| (x - y).abs() <= 1e-3 * (1.0 + x.abs().max(y.abs())))
}

proptest! {
    #[test]
    fn zoom_by_one_is_identity(camera in arb_camera()) {
        prop_assert_eq!(camera::apply_zoom(&camera, 1.0), camera);
    }

    #[test]
    fn zoom_stays_within_limits(camera in arb_camera(), factor in 1e-6f32..1e6) {
        let zoom = camera::apply_zoom(&camera, factor).zoom();
        let config = camera.config();
        prop_assert!(zoom >= config.min_zoom() && zoom <= config.max_zoom());
    }

    #[test]
    fn rotation_is_undone_by_its_negation(
        camera in arb_camera(),
        yaw in -PI..PI,
        pitch in -PI..PI,
    ) {
        let there = camera::apply_rotation(&camera, yaw, pitch);
        let back = camera::apply_rotation(&there, -yaw, -pitch);
        prop_assert!(quat_close(back.rotation(), camera.rotation()));
    }

    #[test]
    fn rotation_keeps_unit_length(camera in arb_camera(), yaw in -10.0f32..10.0, pitch in -10.0f32..10.0) {
        let rotated = camera::apply_rotation(&camera, yaw, pitch);
        prop_assert!((rotated.rotation().length() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn view_projection_is_invertible(camera in arb_camera(), aspect in 0.25f32..4.0) {
        let matrix = camera::view_projection_matrix(&camera, aspect).unwrap();
        prop_assert!(invert_matrix4(&matrix).is_some());
    }

    #[test]
    fn double_inverse_is_identity(
        scale in (0.5f32..2.0, 0.5f32..2.0, 0.5f32..2.0),
        angles in (-PI..PI, -PI..PI, -PI..PI),
        translation in (-50.0f32..50.0, -50.0f32..50.0, -50.0f32..50.0),
    ) {
        let m = Mat4::from_scale_rotation_translation(
            Vec3::new(scale.0, scale.1, scale.2),
            Quat::from_euler(glam::EulerRot::YXZ, angles.0, angles.1, angles.2),
            Vec3::new(translation.0, translation.1, translation.2),
        );
        let inverse = invert_matrix4(&m).unwrap();
        let back = invert_matrix4(&inverse).unwrap();
        prop_assert!(mat_close(&back, &m));
    }
}
