use crate::enums::ScalarType;

use glam::DVec3;
use half::f16;
use ndarray::{ArrayView2, ArrayView3, Axis};

/// Scalar types a volume can store.
pub trait Voxel: Copy + Send + Sync + 'static {
    const SCALAR_TYPE: ScalarType;

    fn to_f64(self) -> f64;

    /// Converts back from the resampling domain, rounding and clamping for
    /// integer types.
    fn from_f64(value: f64) -> Self;
}

macro_rules! integer_voxel {
    ($ty:ty, $scalar:expr) => {
        impl Voxel for $ty {
            const SCALAR_TYPE: ScalarType = $scalar;

            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }

            #[inline]
            fn from_f64(value: f64) -> Self {
                value.round().clamp(<$ty>::MIN as f64, <$ty>::MAX as f64) as $ty
            }
        }
    };
}

integer_voxel!(u8, ScalarType::U8);
integer_voxel!(u16, ScalarType::U16);
integer_voxel!(i16, ScalarType::I16);

impl Voxel for f16 {
    const SCALAR_TYPE: ScalarType = ScalarType::F16;

    #[inline]
    fn to_f64(self) -> f64 {
        f64::from(self)
    }

    #[inline]
    fn from_f64(value: f64) -> Self {
        f16::from_f64(value)
    }
}

impl Voxel for f32 {
    const SCALAR_TYPE: ScalarType = ScalarType::F32;

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }

    #[inline]
    fn from_f64(value: f64) -> Self {
        value as f32
    }
}

// Continuous index coordinates within this distance of the outer voxel
// faces still count as inside.
const EDGE_EPSILON: f64 = 1e-6;

pub(crate) struct Interpolator;

impl Interpolator {
    /// `ijk` is a continuous (i, j, k) index; data is laid out (k, j, i).
    #[inline]
    pub(crate) fn contains<T>(data: &ArrayView3<T>, ijk: DVec3) -> bool {
        let (depth, height, width) = data.dim();
        let inside =
            |c: f64, n: usize| c >= -0.5 - EDGE_EPSILON && c <= n as f64 - 0.5 + EDGE_EPSILON;
        inside(ijk.x, width) && inside(ijk.y, height) && inside(ijk.z, depth)
    }

    #[inline]
    pub(crate) fn nearest<T: Voxel>(data: &ArrayView3<T>, ijk: DVec3) -> Option<f64> {
        if !Self::contains(data, ijk) {
            return None;
        }
        let (depth, height, width) = data.dim();
        let i = (ijk.x.round().max(0.0) as usize).min(width - 1);
        let j = (ijk.y.round().max(0.0) as usize).min(height - 1);
        let k = (ijk.z.round().max(0.0) as usize).min(depth - 1);
        Some(data[[k, j, i]].to_f64())
    }

    #[inline]
    pub(crate) fn trilinear<T: Voxel>(data: &ArrayView3<T>, ijk: DVec3) -> Option<f64> {
        if !Self::contains(data, ijk) {
            return None;
        }
        let (depth, height, width) = data.dim();

        // Clamp to valid range
        let x = ijk.x.clamp(0.0, (width - 1) as f64);
        let y = ijk.y.clamp(0.0, (height - 1) as f64);
        let z = ijk.z.clamp(0.0, (depth - 1) as f64);

        let z0 = z.floor() as usize;
        let z1 = (z0 + 1).min(depth - 1);
        let dz = z - z0 as f64;

        let v0 = Self::bilinear_interpolate(&data.index_axis(Axis(0), z0), y, x);
        if z1 == z0 || dz == 0.0 {
            return Some(v0);
        }
        let v1 = Self::bilinear_interpolate(&data.index_axis(Axis(0), z1), y, x);
        Some(v0.mul_add(1.0 - dz, v1 * dz))
    }

    #[inline]
    pub(crate) fn bilinear_interpolate<T: Voxel>(slice: &ArrayView2<T>, y: f64, x: f64) -> f64 {
        let (height, width) = slice.dim();

        let y0 = y.floor() as usize;
        let x0 = x.floor() as usize;
        let y1 = (y0 + 1).min(height - 1);
        let x1 = (x0 + 1).min(width - 1);

        let dy = y - y0 as f64;
        let dx = x - x0 as f64;
        let one_minus_dx = 1.0 - dx;
        let one_minus_dy = 1.0 - dy;

        let v00 = slice[[y0, x0]].to_f64();
        let v01 = slice[[y0, x1]].to_f64();
        let v10 = slice[[y1, x0]].to_f64();
        let v11 = slice[[y1, x1]].to_f64();

        let v0 = v00.mul_add(one_minus_dx, v01 * dx);
        let v1 = v10.mul_add(one_minus_dx, v11 * dx);

        v0.mul_add(one_minus_dy, v1 * dy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array3;

    fn ramp() -> Array3<u16> {
        // value = 100 * k + 10 * j + i
        Array3::from_shape_fn((2, 2, 2), |(k, j, i)| (100 * k + 10 * j + i) as u16)
    }

    #[test]
    fn trilinear_hits_voxel_centers_exactly() {
        let data = ramp();
        let view = data.view();
        let center = Interpolator::trilinear(&view, DVec3::new(1.0, 1.0, 1.0)).unwrap();
        assert_relative_eq!(center, 111.0);
        assert_relative_eq!(Interpolator::trilinear(&view, DVec3::ZERO).unwrap(), 0.0);
    }

    #[test]
    fn trilinear_blends_between_neighbours() {
        let data = ramp();
        let value = Interpolator::trilinear(&data.view(), DVec3::new(0.5, 0.5, 0.5)).unwrap();
        assert_relative_eq!(value, 55.5, epsilon = 1e-9);
    }

    #[test]
    fn samples_outside_the_voxel_faces_are_rejected() {
        let data = ramp();
        let view = data.view();
        assert!(Interpolator::nearest(&view, DVec3::new(-0.49, 0.0, 0.0)).is_some());
        assert!(Interpolator::nearest(&view, DVec3::new(-0.6, 0.0, 0.0)).is_none());
        assert!(Interpolator::trilinear(&view, DVec3::new(0.0, 0.0, 1.7)).is_none());
    }

    #[test]
    fn integer_voxels_round_and_clamp() {
        assert_eq!(u8::from_f64(254.6), 255);
        assert_eq!(u8::from_f64(300.0), 255);
        assert_eq!(i16::from_f64(-40000.0), i16::MIN);
    }
}
