use crate::enums::{Interpolation, ScalarType};
use crate::error::SliceViewError;
use crate::interpolator::{Interpolator, Voxel};

use glam::{DMat3, DMat4, DVec3};
use half::f16;
use ndarray::Array3;
use rayon::prelude::*;

/// Voxel buffer of a volume, laid out (depth, height, width) = (k, j, i).
#[derive(Debug, Clone)]
pub enum VoxelData {
    U8(Array3<u8>),
    U16(Array3<u16>),
    I16(Array3<i16>),
    F16(Array3<f16>),
    F32(Array3<f32>),
}

/// Runs `$body` with `$arr` bound to the typed voxel array.
macro_rules! with_voxels {
    ($data:expr, $arr:ident => $body:expr) => {
        match $data {
            $crate::volume::VoxelData::U8($arr) => $body,
            $crate::volume::VoxelData::U16($arr) => $body,
            $crate::volume::VoxelData::I16($arr) => $body,
            $crate::volume::VoxelData::F16($arr) => $body,
            $crate::volume::VoxelData::F32($arr) => $body,
        }
    };
}
pub(crate) use with_voxels;

macro_rules! voxel_data_from {
    ($ty:ty, $variant:ident) => {
        impl From<Array3<$ty>> for VoxelData {
            fn from(data: Array3<$ty>) -> Self {
                VoxelData::$variant(data)
            }
        }
    };
}

voxel_data_from!(u8, U8);
voxel_data_from!(u16, U16);
voxel_data_from!(i16, I16);
voxel_data_from!(f16, F16);
voxel_data_from!(f32, F32);

impl VoxelData {
    /// (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        with_voxels!(self, arr => arr.dim())
    }

    pub fn scalar_type(&self) -> ScalarType {
        match self {
            VoxelData::U8(_) => ScalarType::U8,
            VoxelData::U16(_) => ScalarType::U16,
            VoxelData::I16(_) => ScalarType::I16,
            VoxelData::F16(_) => ScalarType::F16,
            VoxelData::F32(_) => ScalarType::F32,
        }
    }
}

/// Placement of a voxel grid in world space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeGeometry {
    ijk_to_world: DMat4,
    world_to_ijk: DMat4,
    /// Voxel counts along (i, j, k).
    dimensions: [usize; 3],
}

impl VolumeGeometry {
    pub fn new(ijk_to_world: DMat4, dimensions: [usize; 3]) -> Result<Self, SliceViewError> {
        if dimensions.contains(&0) {
            return Err(SliceViewError::EmptyVolume((dimensions[2], dimensions[1], dimensions[0])));
        }
        if ijk_to_world.determinant().abs() < 1e-12 {
            return Err(SliceViewError::SingularOrientation);
        }
        Ok(Self {
            ijk_to_world,
            world_to_ijk: ijk_to_world.inverse(),
            dimensions,
        })
    }

    /// Builds the IJK-to-world matrix from spacing, origin and unit axis directions
    /// (columns of `directions` are the i, j, k axes).
    pub fn from_spacing(
        spacing: DVec3,
        origin: DVec3,
        directions: DMat3,
        dimensions: [usize; 3],
    ) -> Result<Self, SliceViewError> {
        if spacing.min_element() <= 0.0 || !spacing.is_finite() {
            return Err(SliceViewError::InvalidSpacing((spacing.x, spacing.y, spacing.z)));
        }
        let ijk_to_world = DMat4::from_cols(
            (directions.x_axis.normalize() * spacing.x).extend(0.0),
            (directions.y_axis.normalize() * spacing.y).extend(0.0),
            (directions.z_axis.normalize() * spacing.z).extend(0.0),
            origin.extend(1.0),
        );
        Self::new(ijk_to_world, dimensions)
    }

    pub fn ijk_to_world(&self) -> DMat4 {
        self.ijk_to_world
    }

    pub fn world_to_ijk(&self) -> DMat4 {
        self.world_to_ijk
    }

    pub fn dimensions(&self) -> [usize; 3] {
        self.dimensions
    }

    pub fn spacing(&self) -> DVec3 {
        DVec3::new(
            self.ijk_to_world.x_axis.truncate().length(),
            self.ijk_to_world.y_axis.truncate().length(),
            self.ijk_to_world.z_axis.truncate().length(),
        )
    }

    /// Unit world-space direction of the given index axis (0 = i, 1 = j, 2 = k).
    pub fn axis_direction(&self, axis: usize) -> DVec3 {
        self.ijk_to_world.col(axis).truncate().normalize()
    }

    pub fn to_world(&self, ijk: DVec3) -> DVec3 {
        self.ijk_to_world.transform_point3(ijk)
    }

    pub fn to_ijk(&self, world: DVec3) -> DVec3 {
        self.world_to_ijk.transform_point3(world)
    }

    /// The eight world-space corners of the grid, on voxel faces or on the
    /// outermost voxel centers.
    pub fn world_corners(&self, use_voxel_center: bool) -> [DVec3; 8] {
        let pad = if use_voxel_center { 0.0 } else { 0.5 };
        let lo = DVec3::splat(-pad);
        let hi = DVec3::new(
            self.dimensions[0] as f64 - 1.0 + pad,
            self.dimensions[1] as f64 - 1.0 + pad,
            self.dimensions[2] as f64 - 1.0 + pad,
        );
        std::array::from_fn(|corner| {
            let ijk = DVec3::new(
                if corner & 1 == 0 { lo.x } else { hi.x },
                if corner & 2 == 0 { lo.y } else { hi.y },
                if corner & 4 == 0 { lo.z } else { hi.z },
            );
            self.to_world(ijk)
        })
    }

    pub fn center_world(&self) -> DVec3 {
        let center = DVec3::new(
            (self.dimensions[0] as f64 - 1.0) * 0.5,
            (self.dimensions[1] as f64 - 1.0) * 0.5,
            (self.dimensions[2] as f64 - 1.0) * 0.5,
        );
        self.to_world(center)
    }

    /// True when the world position falls inside the voxel faces of the grid.
    pub fn contains_world(&self, world: DVec3) -> bool {
        let ijk = self.to_ijk(world);
        (0..3).all(|axis| {
            let c = ijk[axis];
            c >= -0.5 && c <= self.dimensions[axis] as f64 - 0.5
        })
    }

    /// Axis along which the grid is a single voxel thick, preferring k.
    pub fn single_slice_axis(&self) -> Option<usize> {
        (0..3).rev().find(|&axis| self.dimensions[axis] == 1)
    }
}

const HISTOGRAM_BINS: usize = 1024;

/// Intensity histogram of a volume, used to derive automatic window/level.
#[derive(Debug, Clone, PartialEq)]
pub struct IntensityStatistics {
    pub min: f64,
    pub max: f64,
    bins: Vec<u64>,
    count: u64,
}

impl IntensityStatistics {
    fn compute(data: &VoxelData) -> Self {
        with_voxels!(data, arr => {
            let (min, max) = arr
                .par_iter()
                .fold(
                    || (f64::INFINITY, f64::NEG_INFINITY),
                    |(lo, hi), &v| {
                        let v = v.to_f64();
                        (lo.min(v), hi.max(v))
                    },
                )
                .reduce(
                    || (f64::INFINITY, f64::NEG_INFINITY),
                    |a, b| (a.0.min(b.0), a.1.max(b.1)),
                );
            let width = (max - min).max(f64::EPSILON);
            let bins = arr
                .par_iter()
                .fold(
                    || vec![0u64; HISTOGRAM_BINS],
                    |mut bins, &v| {
                        let t = (v.to_f64() - min) / width;
                        let bin = ((t * HISTOGRAM_BINS as f64) as usize).min(HISTOGRAM_BINS - 1);
                        bins[bin] += 1;
                        bins
                    },
                )
                .reduce(
                    || vec![0u64; HISTOGRAM_BINS],
                    |mut a, b| {
                        a.iter_mut().zip(b).for_each(|(x, y)| *x += y);
                        a
                    },
                );
            Self { min, max, bins, count: arr.len() as u64 }
        })
    }

    /// Intensity below which `percent` of the voxels fall.
    pub fn percentile(&self, percent: f64) -> f64 {
        if self.count == 0 || self.max <= self.min {
            return self.min;
        }
        let target = (percent.clamp(0.0, 100.0) / 100.0) * self.count as f64;
        let bin_width = (self.max - self.min) / HISTOGRAM_BINS as f64;
        let mut cumulative = 0.0;
        for (index, &count) in self.bins.iter().enumerate() {
            let next = cumulative + count as f64;
            if next >= target && count > 0 {
                let fraction = ((target - cumulative) / count as f64).clamp(0.0, 1.0);
                return self.min + (index as f64 + fraction) * bin_width;
            }
            cumulative = next;
        }
        self.max
    }

    /// (low, high) intensities bracketing the given percentiles.
    pub fn auto_range(&self, low_percent: f64, high_percent: f64) -> (f64, f64) {
        let low = self.percentile(low_percent);
        let high = self.percentile(high_percent);
        if high > low { (low, high) } else { (self.min, self.max) }
    }
}

#[derive(Debug, Clone)]
pub struct Volume {
    data: VoxelData,
    geometry: VolumeGeometry,
    statistics: IntensityStatistics,
}

impl Volume {
    /// Axis-aligned volume at the world origin. `spacing` is (i, j, k).
    pub fn new(
        data: impl Into<VoxelData>,
        spacing: (f64, f64, f64),
    ) -> Result<Self, SliceViewError> {
        Self::with_orientation(
            data,
            DVec3::new(spacing.0, spacing.1, spacing.2),
            DVec3::ZERO,
            DMat3::IDENTITY,
        )
    }

    pub fn with_orientation(
        data: impl Into<VoxelData>,
        spacing: DVec3,
        origin: DVec3,
        directions: DMat3,
    ) -> Result<Self, SliceViewError> {
        let data = data.into();
        let (depth, height, width) = data.dim();
        let geometry =
            VolumeGeometry::from_spacing(spacing, origin, directions, [width, height, depth])?;
        let statistics = IntensityStatistics::compute(&data);
        Ok(Self {
            data,
            geometry,
            statistics,
        })
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &VoxelData {
        &self.data
    }

    pub fn scalar_type(&self) -> ScalarType {
        self.data.scalar_type()
    }

    pub fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    pub fn spacing(&self) -> DVec3 {
        self.geometry.spacing()
    }

    pub fn statistics(&self) -> &IntensityStatistics {
        &self.statistics
    }

    pub fn value_at(&self, i: usize, j: usize, k: usize) -> Option<f64> {
        with_voxels!(&self.data, arr => arr.get([k, j, i]).map(|v| v.to_f64()))
    }

    /// Samples the volume at a world position, `None` outside the grid.
    pub fn sample_world(&self, world: DVec3, interpolation: Interpolation) -> Option<f64> {
        let ijk = self.geometry.to_ijk(world);
        with_voxels!(&self.data, arr => {
            let view = arr.view();
            match interpolation {
                Interpolation::Nearest => Interpolator::nearest(&view, ijk),
                Interpolation::Linear => Interpolator::trilinear(&view, ijk),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn cube(n: usize) -> Volume {
        let data = Array3::from_shape_fn((n, n, n), |(k, _, _)| k as u16);
        Volume::new(data, (1.0, 1.0, 2.0)).unwrap()
    }

    #[test]
    fn geometry_follows_spacing_and_dimensions() {
        let volume = cube(4);
        let geometry = volume.geometry();
        assert_eq!(geometry.dimensions(), [4, 4, 4]);
        assert_relative_eq!(geometry.spacing().z, 2.0);
        assert_relative_eq!(geometry.to_world(DVec3::new(1.0, 2.0, 3.0)).z, 6.0);
        assert!(geometry.contains_world(DVec3::new(-0.4, 0.0, 6.9)));
        assert!(!geometry.contains_world(DVec3::new(0.0, 0.0, 7.1)));
    }

    #[test]
    fn corners_enclose_voxel_faces() {
        let geometry = *cube(2).geometry();
        let corners = geometry.world_corners(false);
        let max_z = corners.iter().map(|c| c.z).fold(f64::MIN, f64::max);
        assert_relative_eq!(max_z, 3.0);
        let centers = geometry.world_corners(true);
        let max_z = centers.iter().map(|c| c.z).fold(f64::MIN, f64::max);
        assert_relative_eq!(max_z, 2.0);
    }

    #[test]
    fn empty_or_flat_volumes_are_rejected() {
        let empty = Array3::<u8>::zeros((0, 4, 4));
        assert!(matches!(Volume::new(empty, (1.0, 1.0, 1.0)), Err(SliceViewError::EmptyVolume(_))));
        let flat = Array3::<u8>::zeros((1, 4, 4));
        assert!(matches!(
            Volume::new(flat, (1.0, 0.0, 1.0)),
            Err(SliceViewError::InvalidSpacing(_))
        ));
    }

    #[test]
    fn statistics_track_intensity_range() {
        let data = Array3::from_shape_fn((1, 10, 100), |(_, j, i)| (j * 100 + i) as f32);
        let volume = Volume::new(data, (1.0, 1.0, 1.0)).unwrap();
        let stats = volume.statistics();
        assert_relative_eq!(stats.min, 0.0);
        assert_relative_eq!(stats.max, 999.0);
        let (low, high) = stats.auto_range(0.0, 100.0);
        assert!(low <= 1.0);
        assert!(high >= 998.0);
        assert_relative_eq!(stats.percentile(50.0), 499.5, epsilon = 2.0);
    }

    #[test]
    fn world_sampling_interpolates_between_slices() {
        let volume = cube(4);
        let value = volume.sample_world(DVec3::new(1.0, 1.0, 3.0), Interpolation::Linear).unwrap();
        assert_relative_eq!(value, 1.5);
        let nearest = volume
            .sample_world(DVec3::new(1.0, 1.0, 3.2), Interpolation::Nearest)
            .unwrap();
        assert_relative_eq!(nearest, 2.0);
        assert!(volume.sample_world(DVec3::new(1.0, 1.0, -2.0), Interpolation::Linear).is_none());
    }
}
