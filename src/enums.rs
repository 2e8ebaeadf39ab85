/// Standard anatomical viewing directions for the volume camera.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Orientation {
    /// Looking down the slice (Z) axis.
    Axial,
    /// Looking along the Y axis.
    Coronal,
    /// Looking along the X axis.
    Sagittal,
}

/// Camera lens model.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Projection {
    /// Rays converge at the eye.
    #[default]
    Perspective,
    /// Parallel rays; size does not change with distance.
    Orthographic,
}

/// Slice ordering applied when assembling a series into a volume.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortBy {
    #[default]
    ImagePositionPatient,
    TablePosition,
    InstanceNumber,
    None,
}
