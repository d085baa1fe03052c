use crate::enums::SortBy;
use crate::error::SliceViewError;
use crate::interpolator::Voxel;
use crate::volume::{Volume, VoxelData};

use glam::{DMat3, DVec3};
use log::debug;
use ndarray::{Array2, Array3, s};

/// One 2-D image of a stack, positioned along the stacking axis.
#[derive(Debug, Clone)]
pub struct SliceBuffer<T> {
    pub position: f64,
    pub pixels: Array2<T>,
}

/// Stacks already decoded slice buffers into a [`Volume`].
pub struct VolumeLoader;

impl VolumeLoader {
    /// Load a volume from 2-D slices
    ///
    /// # Arguments
    ///
    /// * `slices` - Slice buffers, each (height, width)
    /// * `pixel_spacing` - In-plane spacing (column, row)
    /// * `slice_thickness` - Used when the spacing cannot be derived from positions
    /// * `sort_by` - Method to sort the slices
    ///
    /// # Errors
    ///
    /// Returns error if no slices are given or dimensions are inconsistent
    pub fn load_from_slices<T: Voxel>(
        mut slices: Vec<SliceBuffer<T>>,
        pixel_spacing: (f64, f64),
        slice_thickness: f64,
        sort_by: SortBy,
    ) -> Result<Volume, SliceViewError>
    where
        Array3<T>: Into<VoxelData>,
    {
        if slices.is_empty() {
            return Err(SliceViewError::NoSlices);
        }

        Self::sort_slices(&mut slices, &sort_by);
        Self::validate_dimensions(&slices)?;

        let spacing = Self::get_spacing(&slices, pixel_spacing, slice_thickness, &sort_by);
        let origin = match sort_by {
            SortBy::Position => DVec3::new(0.0, 0.0, slices[0].position),
            SortBy::None => DVec3::ZERO,
        };
        let volume_array = Self::build_volume_array(&slices);
        debug!(
            "stacked {} slices of {:?} with spacing {:?}",
            slices.len(),
            slices[0].pixels.dim(),
            spacing
        );

        Volume::with_orientation(volume_array, spacing, origin, DMat3::IDENTITY)
    }

    fn sort_slices<T>(slices: &mut [SliceBuffer<T>], sort_by: &SortBy) {
        if matches!(sort_by, SortBy::Position) {
            slices.sort_by(|a, b| {
                a.position
                    .partial_cmp(&b.position)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
    }

    fn validate_dimensions<T>(slices: &[SliceBuffer<T>]) -> Result<(), SliceViewError> {
        let first_dim = slices[0].pixels.dim();
        if slices.iter().any(|slice| slice.pixels.dim() != first_dim) {
            return Err(SliceViewError::InconsistentDimensions);
        }
        Ok(())
    }

    fn build_volume_array<T: Voxel>(slices: &[SliceBuffer<T>]) -> Array3<T> {
        let (height, width) = slices[0].pixels.dim();
        let depth = slices.len();
        let zero = T::from_f64(0.0);
        let mut volume = Array3::<T>::from_elem((depth, height, width), zero);

        for (i, slice) in slices.iter().enumerate() {
            volume.slice_mut(s![i, .., ..]).assign(&slice.pixels);
        }

        volume
    }

    fn get_spacing<T>(
        slices: &[SliceBuffer<T>],
        pixel_spacing: (f64, f64),
        slice_thickness: f64,
        sort_by: &SortBy,
    ) -> DVec3 {
        let stacked = match sort_by {
            SortBy::Position if slices.len() > 1 => {
                let first = slices[0].position;
                let last = slices[slices.len() - 1].position;
                let step = (last - first) / (slices.len() - 1) as f64;
                if step > 0.0 { step } else { slice_thickness }
            }
            _ => slice_thickness,
        };
        DVec3::new(pixel_spacing.0, pixel_spacing.1, stacked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn slice(position: f64, value: u16) -> SliceBuffer<u16> {
        SliceBuffer {
            position,
            pixels: Array2::from_elem((3, 4), value),
        }
    }

    #[test]
    fn slices_are_sorted_by_position() {
        let slices = vec![slice(5.0, 2), slice(1.0, 0), slice(3.0, 1)];
        let volume =
            VolumeLoader::load_from_slices(slices, (0.5, 0.5), 1.0, SortBy::Position).unwrap();
        assert_eq!(volume.dim(), (3, 3, 4));
        assert_eq!(volume.value_at(0, 0, 0), Some(0.0));
        assert_eq!(volume.value_at(0, 0, 2), Some(2.0));
        assert_relative_eq!(volume.spacing().z, 2.0);
        assert_relative_eq!(volume.geometry().to_world(DVec3::ZERO).z, 1.0);
    }

    #[test]
    fn unsorted_stacks_use_slice_thickness() {
        let slices = vec![slice(5.0, 2), slice(1.0, 0)];
        let volume = VolumeLoader::load_from_slices(slices, (1.0, 1.0), 3.0, SortBy::None).unwrap();
        assert_eq!(volume.value_at(0, 0, 0), Some(2.0));
        assert_relative_eq!(volume.spacing().z, 3.0);
    }

    #[test]
    fn mismatched_slices_are_rejected() {
        let mut slices = vec![slice(0.0, 0), slice(1.0, 0)];
        slices[1].pixels = Array2::zeros((2, 2));
        let result = VolumeLoader::load_from_slices(slices, (1.0, 1.0), 1.0, SortBy::Position);
        assert!(matches!(result, Err(SliceViewError::InconsistentDimensions)));

        let empty: Vec<SliceBuffer<u8>> = Vec::new();
        let result = VolumeLoader::load_from_slices(empty, (1.0, 1.0), 1.0, SortBy::Position);
        assert!(matches!(result, Err(SliceViewError::NoSlices)));
    }
}
