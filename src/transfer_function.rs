//! Transfer functions: intensity to RGBA lookup.
//!
//! A preset is a list of control points over an intensity domain. Generating
//! a texture resamples the piecewise-linear curve at a fixed resolution into
//! RGBA8 texels. The result covers the whole domain, so every intensity maps
//! to a defined color.

use std::borrow::Cow;
use std::hash::{DefaultHasher, Hash, Hasher};

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum TransferFunctionError {
    #[error("Transfer function resolution must be at least 1")]
    InvalidResolution,

    #[error("Unknown transfer function preset '{0}'")]
    UnknownPreset(String),
}

/// Straight (non-premultiplied) RGBA at one intensity. Channels are in `[0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ControlPoint {
    pub intensity: f32,
    pub color: [f32; 4],
}

impl ControlPoint {
    pub const fn new(intensity: f32, r: f32, g: f32, b: f32, a: f32) -> Self {
        Self {
            intensity,
            color: [r, g, b, a],
        }
    }
}

/// Intensity range covered by a transfer function.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum IntensityDomain {
    /// Absolute modality units, e.g. Hounsfield units for CT.
    Fixed { min: f32, max: f32 },
    /// The loaded dataset's own value range. Control points are given in
    /// `[0, 1]` across that range.
    Dataset,
}

impl IntensityDomain {
    /// Units the control points are expressed in.
    pub fn bounds(self) -> (f32, f32) {
        match self {
            IntensityDomain::Fixed { min, max } => sanitize_range(min, max),
            IntensityDomain::Dataset => (0.0, 1.0),
        }
    }

    /// Concrete intensity range for a dataset with the given value range.
    pub fn resolve(self, dataset_range: (f32, f32)) -> (f32, f32) {
        match self {
            IntensityDomain::Fixed { .. } => self.bounds(),
            IntensityDomain::Dataset => sanitize_range(dataset_range.0, dataset_range.1),
        }
    }
}

fn sanitize_range(min: f32, max: f32) -> (f32, f32) {
    if !min.is_finite() || !max.is_finite() || !(max - min).is_finite() {
        (0.0, 1.0)
    } else if max > min {
        (min, max)
    } else {
        (min, min + 1.0)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TransferFunctionPreset {
    pub name: Cow<'static, str>,
    pub description: Cow<'static, str>,
    pub domain: IntensityDomain,
    pub points: Cow<'static, [ControlPoint]>,
}

impl TransferFunctionPreset {
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        domain: IntensityDomain,
        points: Vec<ControlPoint>,
    ) -> Self {
        Self {
            name: name.into(),
            description: Cow::Borrowed(""),
            domain,
            points: Cow::Owned(points),
        }
    }

    /// Same curve moved along the intensity axis, e.g. to follow a contrast
    /// bolus. The domain is unchanged.
    pub fn shifted(&self, offset: f32) -> Self {
        if !offset.is_finite() {
            return self.clone();
        }
        let points = self
            .points
            .iter()
            .map(|p| ControlPoint {
                intensity: p.intensity + offset,
                ..*p
            })
            .collect();
        Self {
            points: Cow::Owned(points),
            ..self.clone()
        }
    }

    /// Same curve with every alpha multiplied by `scale`.
    pub fn with_opacity_scale(&self, scale: f32) -> Self {
        let points = self
            .points
            .iter()
            .map(|p| {
                let [r, g, b, a] = p.color;
                ControlPoint {
                    color: [r, g, b, a * scale],
                    ..*p
                }
            })
            .collect();
        Self {
            points: Cow::Owned(points),
            ..self.clone()
        }
    }
}

const fn cp(intensity: f32, r: f32, g: f32, b: f32, a: f32) -> ControlPoint {
    ControlPoint::new(intensity, r, g, b, a)
}

const CT_BONE: &[ControlPoint] = &[
    cp(-1000.0, 0.0, 0.0, 0.0, 0.0),
    cp(150.0, 0.55, 0.25, 0.15, 0.0),
    cp(300.0, 0.88, 0.80, 0.68, 0.35),
    cp(700.0, 0.96, 0.93, 0.85, 0.7),
    cp(1500.0, 1.0, 1.0, 0.97, 0.9),
    cp(3000.0, 1.0, 1.0, 1.0, 1.0),
];

const CT_SOFT_TISSUE: &[ControlPoint] = &[
    cp(-1000.0, 0.0, 0.0, 0.0, 0.0),
    cp(-160.0, 0.0, 0.0, 0.0, 0.0),
    cp(-60.0, 0.55, 0.25, 0.15, 0.05),
    cp(40.0, 0.86, 0.42, 0.34, 0.3),
    cp(80.0, 0.93, 0.67, 0.58, 0.45),
    cp(240.0, 1.0, 0.93, 0.85, 0.0),
    cp(1000.0, 1.0, 1.0, 1.0, 0.0),
];

const CT_LUNG: &[ControlPoint] = &[
    cp(-1000.0, 0.0, 0.0, 0.0, 0.0),
    cp(-950.0, 0.15, 0.15, 0.2, 0.0),
    cp(-800.0, 0.75, 0.55, 0.5, 0.08),
    cp(-600.0, 0.9, 0.7, 0.65, 0.12),
    cp(-400.0, 0.9, 0.8, 0.75, 0.0),
    cp(500.0, 0.0, 0.0, 0.0, 0.0),
];

const CT_SKIN: &[ControlPoint] = &[
    cp(-1000.0, 0.0, 0.0, 0.0, 0.0),
    cp(-500.0, 0.8, 0.6, 0.5, 0.0),
    cp(-200.0, 0.93, 0.75, 0.65, 0.6),
    cp(200.0, 0.98, 0.85, 0.75, 0.85),
    cp(1000.0, 1.0, 1.0, 1.0, 0.95),
];

const CT_ANGIO: &[ControlPoint] = &[
    cp(-1000.0, 0.0, 0.0, 0.0, 0.0),
    cp(100.0, 0.6, 0.1, 0.1, 0.0),
    cp(200.0, 0.85, 0.2, 0.15, 0.4),
    cp(400.0, 1.0, 0.7, 0.6, 0.8),
    cp(1500.0, 1.0, 1.0, 1.0, 0.95),
];

const MR_DEFAULT: &[ControlPoint] = &[
    cp(0.0, 0.0, 0.0, 0.0, 0.0),
    cp(0.15, 0.3, 0.25, 0.2, 0.0),
    cp(0.4, 0.8, 0.65, 0.55, 0.25),
    cp(1.0, 1.0, 0.95, 0.9, 0.7),
];

const GRAYSCALE: &[ControlPoint] = &[cp(0.0, 0.0, 0.0, 0.0, 0.0), cp(1.0, 1.0, 1.0, 1.0, 1.0)];

/// Built-in presets. CT presets are in Hounsfield units.
pub static PRESETS: [TransferFunctionPreset; 7] = [
    TransferFunctionPreset {
        name: Cow::Borrowed("ct-bone"),
        description: Cow::Borrowed("Cortical and trabecular bone, soft tissue hidden"),
        domain: IntensityDomain::Fixed {
            min: -1000.0,
            max: 3000.0,
        },
        points: Cow::Borrowed(CT_BONE),
    },
    TransferFunctionPreset {
        name: Cow::Borrowed("ct-soft-tissue"),
        description: Cow::Borrowed("Fat to muscle band, air and bone transparent"),
        domain: IntensityDomain::Fixed {
            min: -1000.0,
            max: 1000.0,
        },
        points: Cow::Borrowed(CT_SOFT_TISSUE),
    },
    TransferFunctionPreset {
        name: Cow::Borrowed("ct-lung"),
        description: Cow::Borrowed("Aerated lung parenchyma"),
        domain: IntensityDomain::Fixed {
            min: -1000.0,
            max: 500.0,
        },
        points: Cow::Borrowed(CT_LUNG),
    },
    TransferFunctionPreset {
        name: Cow::Borrowed("ct-skin"),
        description: Cow::Borrowed("Body surface"),
        domain: IntensityDomain::Fixed {
            min: -1000.0,
            max: 1000.0,
        },
        points: Cow::Borrowed(CT_SKIN),
    },
    TransferFunctionPreset {
        name: Cow::Borrowed("ct-angio"),
        description: Cow::Borrowed("Contrast-enhanced vessels and bone"),
        domain: IntensityDomain::Fixed {
            min: -1000.0,
            max: 1500.0,
        },
        points: Cow::Borrowed(CT_ANGIO),
    },
    TransferFunctionPreset {
        name: Cow::Borrowed("mr-default"),
        description: Cow::Borrowed("Generic MR ramp over the series value range"),
        domain: IntensityDomain::Dataset,
        points: Cow::Borrowed(MR_DEFAULT),
    },
    TransferFunctionPreset {
        name: Cow::Borrowed("grayscale"),
        description: Cow::Borrowed("Linear gray and opacity ramp over the series value range"),
        domain: IntensityDomain::Dataset,
        points: Cow::Borrowed(GRAYSCALE),
    },
];

pub fn preset(name: &str) -> Option<&'static TransferFunctionPreset> {
    PRESETS.iter().find(|p| p.name == name)
}

pub fn preset_names() -> impl Iterator<Item = &'static str> {
    PRESETS.iter().map(|p| p.name.as_ref())
}

/// RGBA8 lookup table produced from a preset.
#[derive(Clone, Debug, PartialEq)]
pub struct TransferFunctionTexture {
    resolution: u32,
    domain: IntensityDomain,
    data: Vec<u8>,
    fingerprint: u64,
}

impl TransferFunctionTexture {
    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    pub fn domain(&self) -> IntensityDomain {
        self.domain
    }

    /// Tightly packed RGBA8 texels, `4 * resolution` bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Content hash; equal textures have equal fingerprints.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn texel(&self, index: u32) -> Option<[u8; 4]> {
        let start = index as usize * 4;
        self.data.get(start..start + 4)?.try_into().ok()
    }
}

/// Resample a preset into a lookup texture of `resolution` texels.
///
/// Texel `i` holds the color at `i / (resolution - 1)` across the domain (the
/// domain midpoint when `resolution == 1`). Control points may be sparse,
/// unsorted or contain NaN; invalid points are dropped and colors clamped, so
/// every texel is a valid color. Output is deterministic.
pub fn generate_transfer_function_texture(
    preset: &TransferFunctionPreset,
    resolution: u32,
) -> Result<TransferFunctionTexture, TransferFunctionError> {
    if resolution == 0 {
        return Err(TransferFunctionError::InvalidResolution);
    }
    let points = normalized_points(preset);
    let mut data = Vec::with_capacity(resolution as usize * 4);
    for i in 0..resolution {
        let t = if resolution == 1 {
            0.5
        } else {
            i as f32 / (resolution - 1) as f32
        };
        data.extend(sample_curve(&points, t).map(encode_unorm8));
    }

    let mut hasher = DefaultHasher::new();
    resolution.hash(&mut hasher);
    let (min, max) = preset.domain.bounds();
    matches!(preset.domain, IntensityDomain::Dataset).hash(&mut hasher);
    min.to_bits().hash(&mut hasher);
    max.to_bits().hash(&mut hasher);
    data.hash(&mut hasher);
    let fingerprint = hasher.finish();

    log::debug!(
        "Generated transfer function '{}' ({} points, {resolution} texels)",
        preset.name,
        points.len()
    );
    Ok(TransferFunctionTexture {
        resolution,
        domain: preset.domain,
        data,
        fingerprint,
    })
}

/// Generate the texture for a built-in preset by name.
pub fn preset_texture(
    name: &str,
    resolution: u32,
) -> Result<TransferFunctionTexture, TransferFunctionError> {
    let preset = preset(name).ok_or_else(|| TransferFunctionError::UnknownPreset(name.into()))?;
    generate_transfer_function_texture(preset, resolution)
}

/// Control points in domain coordinates (`0` at the domain minimum, `1` at
/// its maximum), sanitized and sorted. Points past either end are kept so
/// they still shape the curve at the domain edges.
fn normalized_points(preset: &TransferFunctionPreset) -> Vec<(f32, [f32; 4])> {
    let (min, max) = preset.domain.bounds();
    let span = max - min;
    let mut points: Vec<_> = preset
        .points
        .iter()
        .map(|p| ((p.intensity - min) / span, p.color.map(sanitize_channel)))
        .filter(|(t, _)| t.is_finite())
        .collect();
    points.sort_by(|a, b| a.0.total_cmp(&b.0));
    points
}

fn sample_curve(points: &[(f32, [f32; 4])], t: f32) -> [f32; 4] {
    let Some(&(_, first)) = points.first() else {
        return [0.0; 4];
    };
    let upper = points.partition_point(|(x, _)| *x <= t);
    if upper == 0 {
        return first;
    }
    if upper == points.len() {
        return points[upper - 1].1;
    }
    let (x0, c0) = points[upper - 1];
    let (x1, c1) = points[upper];
    let f = ((t - x0) / (x1 - x0)).clamp(0.0, 1.0);
    std::array::from_fn(|i| c0[i] + (c1[i] - c0[i]) * f)
}

fn sanitize_channel(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

fn encode_unorm8(value: f32) -> u8 {
    (sanitize_channel(value) * 255.0).round() as u8
}
