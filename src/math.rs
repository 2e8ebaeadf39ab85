//! Small matrix helpers shared by the camera and the renderer.

use glam::Mat4;

/// Smallest accepted ratio of `|det|` to the product of the column lengths.
/// By Hadamard's inequality the ratio lies in `[0, 1]` and does not depend on
/// per-axis scale, only on how close the columns are to linear dependence.
const SINGULAR_EPSILON: f32 = 1e-6;

/// Inverts a 4x4 matrix.
///
/// Returns `None` when the matrix is singular (determinant ~0 relative to its
/// column lengths) or contains non-finite values. Callers unprojecting screen points
/// are expected to handle `None` by skipping the frame's interaction.
pub fn invert_matrix4(m: &Mat4) -> Option<Mat4> {
    if !is_finite_matrix(m) {
        return None;
    }
    let volume = m.x_axis.length() * m.y_axis.length() * m.z_axis.length() * m.w_axis.length();
    if volume == 0.0 || !volume.is_finite() {
        return None;
    }

    let det = m.determinant();
    if !det.is_finite() || (det / volume).abs() < SINGULAR_EPSILON {
        return None;
    }

    let inverse = m.inverse();
    is_finite_matrix(&inverse).then_some(inverse)
}

pub fn is_finite_matrix(m: &Mat4) -> bool {
    m.to_cols_array().iter().all(|v| v.is_finite())
}
