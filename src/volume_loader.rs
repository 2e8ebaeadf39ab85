use crate::{
    enums::SortBy,
    volume::{IDENTITY_DIRECTION, VolumeDataset, VolumeError},
};

use dicom::{
    object::{FileDicomObject, InMemDicomObject, open_file},
    pixeldata::{ConvertOptions, PixelDecoder, VoiLutOption},
};
use dicom_dictionary_std::tags;
use glam::Vec3;
use ndarray::{Array2, Array3, s};
use rayon::prelude::*;
use std::{fs, path::Path};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VolumeLoaderError {
    #[error("No valid DICOM images found")]
    NoValidImages,

    #[error("Inconsistent image dimensions")]
    InconsistentDimensions,

    #[error("Missing spacing information")]
    MissingSpacing,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),

    #[error("Invalid volume: {0}")]
    Volume(#[from] VolumeError),
}

/// One decoded slice with the attributes used to place it in the stack.
struct Slice {
    order: Option<f32>,
    position: Option<Vec3>,
    image: Array2<f32>,
}

pub struct VolumeLoader;

impl VolumeLoader {
    /// Assemble a volume from DICOM objects of a single series.
    ///
    /// Pixel data is decoded with the modality LUT applied, so CT samples end
    /// up in Hounsfield units. Objects without decodable pixel data or without
    /// the attribute required by `sort_by` are skipped.
    ///
    /// # Errors
    ///
    /// Returns error if no valid images found, dimensions are inconsistent or
    /// no spacing information is present
    pub fn load_from_dicom_objects(
        dicom_objects: &[FileDicomObject<InMemDicomObject>],
        sort_by: SortBy,
    ) -> Result<VolumeDataset, VolumeLoaderError> {
        let mut slices: Vec<Slice> = dicom_objects
            .par_iter()
            .enumerate()
            .filter_map(|(index, dicom_object)| {
                let slice = Self::extract_slice(dicom_object, sort_by);
                if slice.is_none() {
                    log::warn!("Skipping DICOM object {index}: no usable image or sort key");
                }
                slice
            })
            .collect();

        if slices.is_empty() {
            return Err(VolumeLoaderError::NoValidImages);
        }

        Self::sort_slices(&mut slices, sort_by);
        Self::validate_dimensions(&slices)?;

        let (pixel_x, pixel_y) =
            Self::get_pixel_spacing(dicom_objects).ok_or(VolumeLoaderError::MissingSpacing)?;
        let slice_spacing = Self::slice_spacing(&slices, Self::get_slice_thickness(dicom_objects))
            .ok_or(VolumeLoaderError::MissingSpacing)?;
        let origin = slices[0].position.unwrap_or(Vec3::ZERO);
        let direction = Self::get_direction(dicom_objects).unwrap_or(IDENTITY_DIRECTION);

        let volume_array = Self::build_volume_array(&slices);
        log::info!(
            "Loaded {} slices, spacing ({pixel_x}, {pixel_y}, {slice_spacing})",
            slices.len()
        );

        Ok(
            VolumeDataset::new(volume_array, (pixel_x, pixel_y, slice_spacing))?
                .with_patient_geometry(origin, direction),
        )
    }

    /// Load a volume from file paths
    pub fn load_from_file_paths(
        paths: &[impl AsRef<Path> + Sync],
        sort_by: SortBy,
    ) -> Result<VolumeDataset, VolumeLoaderError> {
        let objects: Result<Vec<_>, _> = paths
            .par_iter()
            .map(|path| open_file(path.as_ref()))
            .collect();

        Self::load_from_dicom_objects(&objects?, sort_by)
    }

    /// Load a volume from a directory containing .dcm files
    pub fn load_from_directory(
        path: impl AsRef<Path>,
        sort_by: SortBy,
    ) -> Result<VolumeDataset, VolumeLoaderError> {
        let paths: Vec<_> = fs::read_dir(path.as_ref())?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|s| s.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"))
            })
            .collect();

        if paths.is_empty() {
            return Err(VolumeLoaderError::NoValidImages);
        }
        log::debug!("Found {} DICOM files in {}", paths.len(), path.as_ref().display());

        Self::load_from_file_paths(&paths, sort_by)
    }

    fn extract_slice(
        dicom_object: &FileDicomObject<InMemDicomObject>,
        sort_by: SortBy,
    ) -> Option<Slice> {
        let order = Self::get_sort_order(dicom_object, sort_by)?;
        let image = Self::decode_image(dicom_object)?;
        Some(Slice {
            order,
            position: Self::get_position(dicom_object),
            image,
        })
    }

    fn get_sort_order(
        dicom_object: &FileDicomObject<InMemDicomObject>,
        sort_by: SortBy,
    ) -> Option<Option<f32>> {
        match sort_by {
            SortBy::ImagePositionPatient => Some(Some(Self::get_position(dicom_object)?.z)),
            SortBy::TablePosition => {
                let pos = dicom_object
                    .element(tags::TABLE_POSITION)
                    .ok()?
                    .to_float32()
                    .ok();
                Some(pos)
            }
            SortBy::InstanceNumber => {
                let num = dicom_object
                    .element(tags::INSTANCE_NUMBER)
                    .ok()?
                    .to_int::<i32>()
                    .ok()
                    .map(|n| n as f32);
                Some(num)
            }
            SortBy::None => Some(Some(0.0)),
        }
    }

    fn get_position(dicom_object: &FileDicomObject<InMemDicomObject>) -> Option<Vec3> {
        let pos = dicom_object
            .element(tags::IMAGE_POSITION_PATIENT)
            .ok()?
            .to_multi_float32()
            .ok()?;
        match pos.as_slice() {
            [x, y, z, ..] => Some(Vec3::new(*x, *y, *z)),
            _ => None,
        }
    }

    fn decode_image(dicom_object: &FileDicomObject<InMemDicomObject>) -> Option<Array2<f32>> {
        let pixel_data = dicom_object.decode_pixel_data().ok()?;
        let options = ConvertOptions::new().with_voi_lut(VoiLutOption::Identity);
        pixel_data
            .to_ndarray_with_options::<f32>(&options)
            .ok()
            .map(|arr| arr.slice_move(s![0, .., .., 0]))
    }

    fn sort_slices(slices: &mut [Slice], sort_by: SortBy) {
        if !matches!(sort_by, SortBy::None) {
            slices.sort_by(|a, b| {
                a.order
                    .partial_cmp(&b.order)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }

        if matches!(sort_by, SortBy::ImagePositionPatient) {
            slices.reverse();
        }
    }

    fn validate_dimensions(slices: &[Slice]) -> Result<(), VolumeLoaderError> {
        let first_dim = slices[0].image.dim();
        if slices.iter().any(|slice| slice.image.dim() != first_dim) {
            return Err(VolumeLoaderError::InconsistentDimensions);
        }
        Ok(())
    }

    fn build_volume_array(slices: &[Slice]) -> Array3<f32> {
        let (height, width) = slices[0].image.dim();
        let depth = slices.len();
        let mut volume = Array3::<f32>::zeros((depth, height, width));

        for (i, slice) in slices.iter().enumerate() {
            volume.slice_mut(s![i, .., ..]).assign(&slice.image);
        }

        volume
    }

    /// Distance between the first two slice positions, which is more reliable
    /// than SliceThickness for overlapping or gapped acquisitions.
    fn position_spacing(slices: &[Slice]) -> Option<f32> {
        let first = slices.first()?.position?;
        let second = slices.get(1)?.position?;
        let distance = first.distance(second);
        (distance.is_finite() && distance > 0.0).then_some(distance)
    }

    /// Slice spacing from positions, falling back to SliceThickness.
    fn slice_spacing(slices: &[Slice], thickness: Option<f32>) -> Option<f32> {
        Self::position_spacing(slices)
            .or(thickness.filter(|t| t.is_finite() && *t > 0.0))
    }

    /// Returns in-plane spacing as (x, y). PixelSpacing is stored as
    /// (row spacing, column spacing), i.e. (y, x).
    fn get_pixel_spacing(dicom_objects: &[FileDicomObject<InMemDicomObject>]) -> Option<(f32, f32)> {
        dicom_objects.iter().find_map(|dicom_object| {
            let pixel_spacing = dicom_object
                .element(tags::PIXEL_SPACING)
                .ok()?
                .to_multi_float32()
                .ok()?;

            match pixel_spacing.as_slice() {
                [row, column, ..] => Some((*column, *row)),
                _ => None,
            }
        })
    }

    fn get_slice_thickness(dicom_objects: &[FileDicomObject<InMemDicomObject>]) -> Option<f32> {
        dicom_objects.iter().find_map(|dicom_object| {
            dicom_object
                .element(tags::SLICE_THICKNESS)
                .ok()?
                .to_float32()
                .ok()
        })
    }

    fn get_direction(dicom_objects: &[FileDicomObject<InMemDicomObject>]) -> Option<[f32; 6]> {
        dicom_objects.iter().find_map(|dicom_object| {
            let cosines = dicom_object
                .element(tags::IMAGE_ORIENTATION_PATIENT)
                .ok()?
                .to_multi_float32()
                .ok()?;
            cosines.get(..6)?.try_into().ok()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slice(order: f32, z: Option<f32>) -> Slice {
        Slice {
            order: Some(order),
            position: z.map(|z| Vec3::new(0.0, 0.0, z)),
            image: Array2::from_elem((2, 3), order),
        }
    }

    #[test]
    fn image_position_sorting_is_descending() {
        let mut slices = vec![slice(1.0, None), slice(3.0, None), slice(2.0, None)];
        VolumeLoader::sort_slices(&mut slices, SortBy::ImagePositionPatient);
        let orders: Vec<_> = slices.iter().map(|s| s.order).collect();
        assert_eq!(orders, vec![Some(3.0), Some(2.0), Some(1.0)]);
    }

    #[test]
    fn instance_number_sorting_is_ascending() {
        let mut slices = vec![slice(2.0, None), slice(1.0, None)];
        VolumeLoader::sort_slices(&mut slices, SortBy::InstanceNumber);
        assert_eq!(slices[0].order, Some(1.0));
    }

    #[test]
    fn slice_spacing_prefers_positions() {
        let slices = vec![slice(0.0, Some(10.0)), slice(1.0, Some(12.5))];
        assert_eq!(VolumeLoader::position_spacing(&slices), Some(2.5));

        let coincident = vec![slice(0.0, Some(4.0)), slice(1.0, Some(4.0))];
        assert_eq!(VolumeLoader::position_spacing(&coincident), None);
    }

    #[test]
    fn slice_thickness_is_only_a_fallback() {
        let positioned = vec![slice(0.0, Some(10.0)), slice(1.0, Some(12.5))];
        assert_eq!(VolumeLoader::slice_spacing(&positioned, None), Some(2.5));
        assert_eq!(VolumeLoader::slice_spacing(&positioned, Some(5.0)), Some(2.5));

        let unpositioned = vec![slice(0.0, None), slice(1.0, None)];
        assert_eq!(VolumeLoader::slice_spacing(&unpositioned, Some(3.0)), Some(3.0));
        assert_eq!(VolumeLoader::slice_spacing(&unpositioned, Some(0.0)), None);
        assert_eq!(VolumeLoader::slice_spacing(&unpositioned, None), None);
    }

    #[test]
    fn volume_array_stacks_slices_in_order() {
        let slices = vec![slice(7.0, None), slice(9.0, None)];
        let volume = VolumeLoader::build_volume_array(&slices);
        assert_eq!(volume.dim(), (2, 2, 3));
        assert_eq!(volume[[0, 1, 2]], 7.0);
        assert_eq!(volume[[1, 0, 0]], 9.0);
    }

    #[test]
    fn mismatched_slices_are_rejected() {
        let mut slices = vec![slice(0.0, None), slice(1.0, None)];
        slices[1].image = Array2::zeros((4, 4));
        assert!(matches!(
            VolumeLoader::validate_dimensions(&slices),
            Err(VolumeLoaderError::InconsistentDimensions)
        ));
    }

    #[test]
    fn empty_object_list_has_no_images() {
        assert!(matches!(
            VolumeLoader::load_from_dicom_objects(&[], SortBy::None),
            Err(VolumeLoaderError::NoValidImages)
        ));
    }
}
