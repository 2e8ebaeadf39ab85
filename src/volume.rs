use glam::Vec3;
use half::f16;
use ndarray::Array3;
use rayon::prelude::*;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum VolumeError {
    #[error("Volume has no samples ({width}x{height}x{depth})")]
    Empty {
        width: usize,
        height: usize,
        depth: usize,
    },

    #[error("Invalid voxel spacing {0:?}")]
    InvalidSpacing((f32, f32, f32)),
}

/// Row and column direction cosines of an axial acquisition.
pub const IDENTITY_DIRECTION: [f32; 6] = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0];

/// A scalar voxel grid in modality units (HU for rescaled CT).
///
/// The grid is indexed `(depth, height, width)`. World space places the first
/// voxel corner at the origin with axes scaled by the voxel spacing, so the
/// volume occupies `[0, extent]` on every axis. Datasets are never mutated; a
/// new series means a new dataset.
#[derive(Clone, Debug)]
pub struct VolumeDataset {
    data: Array3<f32>,
    spacing: (f32, f32, f32),
    origin: Vec3,
    direction: [f32; 6],
    value_range: (f32, f32),
}

impl VolumeDataset {
    /// Wraps a voxel grid. `spacing` is `(x, y, z)` in millimetres.
    pub fn new(data: Array3<f32>, spacing: (f32, f32, f32)) -> Result<Self, VolumeError> {
        let (depth, height, width) = data.dim();
        if data.is_empty() {
            return Err(VolumeError::Empty {
                width,
                height,
                depth,
            });
        }
        let (sx, sy, sz) = spacing;
        if ![sx, sy, sz].iter().all(|s| s.is_finite() && *s > 0.0) {
            return Err(VolumeError::InvalidSpacing(spacing));
        }
        let value_range = Self::compute_value_range(&data);
        log::debug!(
            "Volume {width}x{height}x{depth}, spacing {spacing:?}, values {value_range:?}"
        );
        Ok(Self {
            data,
            spacing,
            origin: Vec3::ZERO,
            direction: IDENTITY_DIRECTION,
            value_range,
        })
    }

    /// Attaches the patient-space position of the first voxel and the
    /// row/column direction cosines of the series.
    pub fn with_patient_geometry(mut self, origin: Vec3, direction: [f32; 6]) -> Self {
        self.origin = origin;
        self.direction = direction;
        self
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn spacing(&self) -> (f32, f32, f32) {
        self.spacing
    }

    pub fn origin(&self) -> Vec3 {
        self.origin
    }

    pub fn direction(&self) -> [f32; 6] {
        self.direction
    }

    /// Smallest and largest finite sample.
    pub fn value_range(&self) -> (f32, f32) {
        self.value_range
    }

    /// World-space size of the voxel grid.
    pub fn extent(&self) -> Vec3 {
        let (depth, height, width) = self.dim();
        let (sx, sy, sz) = self.spacing;
        Vec3::new(width as f32 * sx, height as f32 * sy, depth as f32 * sz)
    }

    pub fn center(&self) -> Vec3 {
        self.extent() * 0.5
    }

    /// Radius of the sphere enclosing the whole grid.
    pub fn bounding_radius(&self) -> f32 {
        self.extent().length() * 0.5
    }

    pub fn min_spacing(&self) -> f32 {
        let (sx, sy, sz) = self.spacing;
        sx.min(sy).min(sz)
    }

    /// Samples rescaled to `[0, 1]` across the value range, in upload order
    /// (x fastest, then y, then z).
    pub fn normalized_f16(&self) -> Vec<f16> {
        let (min, max) = self.value_range;
        let span = max - min;
        let scale = if span > 0.0 { 1.0 / span } else { 0.0 };
        let normalize = |v: f32| {
            let t = (v - min) * scale;
            if t.is_nan() {
                f16::ZERO
            } else {
                f16::from_f32(t.clamp(0.0, 1.0))
            }
        };

        let standard = self.data.as_standard_layout();
        match standard.as_slice() {
            Some(samples) => samples.par_iter().map(|&v| normalize(v)).collect(),
            None => standard.iter().map(|&v| normalize(v)).collect(),
        }
    }

    fn compute_value_range(data: &Array3<f32>) -> (f32, f32) {
        let (min, max) = data
            .iter()
            .filter(|v| v.is_finite())
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        if min > max { (0.0, 0.0) } else { (min, max) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(depth: usize, height: usize, width: usize) -> Array3<f32> {
        Array3::from_shape_fn((depth, height, width), |(z, y, x)| (x + y + z) as f32)
    }

    #[test]
    fn center_with_unit_spacing_is_half_the_dimensions() {
        let volume = VolumeDataset::new(ramp(8, 6, 4), (1.0, 1.0, 1.0)).unwrap();
        assert_eq!(volume.center(), Vec3::new(2.0, 3.0, 4.0));
    }

    #[test]
    fn extent_scales_with_spacing() {
        let volume = VolumeDataset::new(ramp(10, 20, 30), (0.5, 0.5, 2.5)).unwrap();
        assert_eq!(volume.extent(), Vec3::new(15.0, 10.0, 25.0));
        assert_eq!(volume.min_spacing(), 0.5);
    }

    #[test]
    fn rejects_empty_grid_and_bad_spacing() {
        let empty = Array3::<f32>::zeros((0, 4, 4));
        assert!(matches!(
            VolumeDataset::new(empty, (1.0, 1.0, 1.0)),
            Err(VolumeError::Empty { depth: 0, .. })
        ));
        assert_eq!(
            VolumeDataset::new(ramp(2, 2, 2), (1.0, 0.0, 1.0)).unwrap_err(),
            VolumeError::InvalidSpacing((1.0, 0.0, 1.0))
        );
        assert!(VolumeDataset::new(ramp(2, 2, 2), (1.0, f32::NAN, 1.0)).is_err());
    }

    #[test]
    fn value_range_ignores_nan() {
        let mut data = ramp(2, 2, 2);
        data[[0, 0, 0]] = f32::NAN;
        data[[1, 1, 1]] = -1024.0;
        let volume = VolumeDataset::new(data, (1.0, 1.0, 1.0)).unwrap();
        assert_eq!(volume.value_range(), (-1024.0, 4.0));
    }

    #[test]
    fn normalized_samples_span_unit_range() {
        let volume = VolumeDataset::new(ramp(3, 4, 5), (1.0, 1.0, 1.0)).unwrap();
        let samples = volume.normalized_f16();
        assert_eq!(samples.len(), 3 * 4 * 5);
        assert_eq!(samples[0], f16::ZERO);
        assert_eq!(*samples.last().unwrap(), f16::ONE);
        assert!(samples.iter().all(|s| (0.0..=1.0).contains(&s.to_f32())));
    }

    #[test]
    fn constant_volume_normalizes_to_zero() {
        let volume =
            VolumeDataset::new(Array3::from_elem((2, 2, 2), 40.0), (1.0, 1.0, 1.0)).unwrap();
        assert!(volume.normalized_f16().iter().all(|s| *s == f16::ZERO));
    }
}
