//! Cutting-plane geometry.
//!
//! A [`SliceGeometry`] maps slice pixel coordinates (x, y) onto a plane in
//! world space. [`GeometryResolver`] computes new geometries from volume
//! metadata: fitting the field of view to volume extents, rotating the plane
//! onto volume axes, and mapping plane offsets to slice indices.
//!
//! Slice-space bounds used throughout are expressed in the slice orientation
//! without the slice translation, so their z range is directly comparable to
//! [`SliceGeometry::offset`].

use crate::config::GeometryConfig;
use crate::volume::VolumeGeometry;

use glam::{DMat3, DMat4, DVec3, UVec3};
use log::{trace, warn};

/// Tiling of the viewport into a grid of slice tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightboxLayout {
    pub rows: u32,
    pub columns: u32,
}

impl Default for LightboxLayout {
    fn default() -> Self {
        Self { rows: 1, columns: 1 }
    }
}

impl LightboxLayout {
    /// Size of a single tile for the overall viewport size.
    fn tile_size(&self, viewport_width: u32, viewport_height: u32) -> Option<(u32, u32)> {
        let width = viewport_width / self.columns.max(1);
        let height = viewport_height / self.rows.max(1);
        (width > 0 && height > 0).then_some((width, height))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SliceGeometry {
    slice_to_world: DMat4,
    field_of_view: DVec3,
    /// Pixel dimensions of one tile (x, y) and the number of slices.
    dimensions: UVec3,
    layout: LightboxLayout,
}

impl SliceGeometry {
    /// Axial plane through the world origin, in radiological orientation.
    pub fn axial(width: u32, height: u32, field_of_view: f64) -> Self {
        Self::from_axes(
            DVec3::NEG_X,
            DVec3::Y,
            DVec3::Z,
            DVec3::ZERO,
            width,
            height,
            field_of_view,
        )
    }

    pub fn sagittal(width: u32, height: u32, field_of_view: f64) -> Self {
        Self::from_axes(
            DVec3::NEG_Y,
            DVec3::Z,
            DVec3::NEG_X,
            DVec3::ZERO,
            width,
            height,
            field_of_view,
        )
    }

    pub fn coronal(width: u32, height: u32, field_of_view: f64) -> Self {
        Self::from_axes(
            DVec3::NEG_X,
            DVec3::Z,
            DVec3::Y,
            DVec3::ZERO,
            width,
            height,
            field_of_view,
        )
    }

    /// Plane spanned by `x_axis` and `y_axis` through `origin`. The field of
    /// view applies to the width and follows the viewport aspect in height.
    pub fn from_axes(
        x_axis: DVec3,
        y_axis: DVec3,
        normal: DVec3,
        origin: DVec3,
        width: u32,
        height: u32,
        field_of_view: f64,
    ) -> Self {
        let width = width.max(1);
        let height = height.max(1);
        let slice_to_world = orthonormalized(DMat4::from_cols(
            x_axis.extend(0.0),
            y_axis.extend(0.0),
            normal.extend(0.0),
            origin.extend(1.0),
        ));
        Self {
            slice_to_world,
            field_of_view: DVec3::new(
                field_of_view,
                field_of_view * height as f64 / width as f64,
                1.0,
            ),
            dimensions: UVec3::new(width, height, 1),
            layout: LightboxLayout::default(),
        }
    }

    pub fn slice_to_world(&self) -> DMat4 {
        self.slice_to_world
    }

    /// Replaces the orientation and origin; in-plane axes are re-orthonormalized.
    pub fn with_slice_to_world(mut self, slice_to_world: DMat4) -> Self {
        self.slice_to_world = orthonormalized(slice_to_world);
        self
    }

    pub fn field_of_view(&self) -> DVec3 {
        self.field_of_view
    }

    pub fn with_field_of_view(mut self, field_of_view: DVec3) -> Self {
        self.field_of_view = field_of_view;
        self
    }

    pub fn dimensions(&self) -> UVec3 {
        self.dimensions
    }

    pub fn layout(&self) -> LightboxLayout {
        self.layout
    }

    pub fn with_layout(mut self, layout: LightboxLayout) -> Self {
        self.layout = LightboxLayout {
            rows: layout.rows.max(1),
            columns: layout.columns.max(1),
        };
        self
    }

    pub fn x_axis(&self) -> DVec3 {
        self.slice_to_world.x_axis.truncate()
    }

    pub fn y_axis(&self) -> DVec3 {
        self.slice_to_world.y_axis.truncate()
    }

    pub fn normal(&self) -> DVec3 {
        self.slice_to_world.z_axis.truncate()
    }

    pub fn origin(&self) -> DVec3 {
        self.slice_to_world.w_axis.truncate()
    }

    /// Signed distance of the plane from the world origin along its normal.
    pub fn offset(&self) -> f64 {
        self.normal().dot(self.origin())
    }

    /// Moves the plane along its normal so that [`offset`](Self::offset)
    /// becomes `offset`.
    pub fn with_offset(mut self, offset: f64) -> Self {
        let origin = self.origin() + self.normal() * (offset - self.offset());
        self.slice_to_world.w_axis = origin.extend(1.0);
        self
    }

    /// Size of one slice pixel in millimeters.
    pub fn pixel_spacing(&self) -> DVec3 {
        self.field_of_view / self.dimensions.as_dvec3()
    }

    /// Maps pixel coordinates of a tile to slice coordinates, centering the
    /// field of view on the slice origin.
    pub fn xy_to_slice(&self) -> DMat4 {
        let spacing = self.pixel_spacing();
        DMat4::from_cols(
            glam::DVec4::new(spacing.x, 0.0, 0.0, 0.0),
            glam::DVec4::new(0.0, spacing.y, 0.0, 0.0),
            glam::DVec4::new(0.0, 0.0, spacing.z, 0.0),
            glam::DVec4::new(
                -self.field_of_view.x / 2.0,
                -self.field_of_view.y / 2.0,
                0.0,
                1.0,
            ),
        )
    }

    pub fn xy_to_world(&self) -> DMat4 {
        self.slice_to_world * self.xy_to_slice()
    }

    /// Rotation part of the slice transform.
    pub fn orientation(&self) -> DMat3 {
        DMat3::from_mat4(self.slice_to_world)
    }

    /// World position expressed in slice-oriented coordinates (no translation).
    pub fn world_to_oriented(&self, world: DVec3) -> DVec3 {
        self.orientation().transpose() * world
    }
}

/// Re-orthonormalizes the three axis columns of a slice transform, keeping
/// the x direction, the xy plane and the handedness of the normal.
fn orthonormalized(m: DMat4) -> DMat4 {
    let x = m.x_axis.truncate().try_normalize().unwrap_or(DVec3::X);
    let y_raw = m.y_axis.truncate();
    let y = (y_raw - x * x.dot(y_raw))
        .try_normalize()
        .unwrap_or_else(|| x.any_orthonormal_vector());
    let cross = x.cross(y);
    let z = if m.z_axis.truncate().dot(cross) < 0.0 { -cross } else { cross };
    DMat4::from_cols(x.extend(0.0), y.extend(0.0), z.extend(0.0), m.w_axis)
}

/// Axis-aligned box in slice-oriented coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SliceBounds {
    pub min: DVec3,
    pub max: DVec3,
}

impl SliceBounds {
    pub fn from_points(points: impl IntoIterator<Item = DVec3>) -> Option<Self> {
        points.into_iter().fold(None, |bounds, p| {
            Some(match bounds {
                None => SliceBounds { min: p, max: p },
                Some(b) => SliceBounds {
                    min: b.min.min(p),
                    max: b.max.max(p),
                },
            })
        })
    }

    pub fn size(&self) -> DVec3 {
        self.max - self.min
    }

    pub fn center(&self) -> DVec3 {
        (self.min + self.max) * 0.5
    }

    pub fn union(&self, other: &SliceBounds) -> SliceBounds {
        SliceBounds {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn contains(&self, other: &SliceBounds, tolerance: f64) -> bool {
        (other.min - self.min).min_element() >= -tolerance
            && (self.max - other.max).min_element() >= -tolerance
    }
}

/// Result of mapping a plane offset to a 1-based slice index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceIndex {
    Index(u32),
    /// The plane is not parallel to any volume axis.
    Rotated,
    OutOfVolume,
    NoVolume,
}

impl SliceIndex {
    pub fn index(self) -> Option<u32> {
        match self {
            SliceIndex::Index(index) => Some(index),
            _ => None,
        }
    }
}

/// Slider range for the plane offset over a volume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OffsetRange {
    pub min: f64,
    pub max: f64,
    pub resolution: f64,
}

/// World-space size and center of a volume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldBox {
    pub size: DVec3,
    pub center: DVec3,
}

#[derive(Debug, Clone)]
pub struct GeometryResolver {
    rotated_tolerance_degrees: f64,
}

impl Default for GeometryResolver {
    fn default() -> Self {
        Self::new(&GeometryConfig::default())
    }
}

impl GeometryResolver {
    pub fn new(config: &GeometryConfig) -> Self {
        Self {
            rotated_tolerance_degrees: config.rotated_tolerance_degrees.abs(),
        }
    }

    pub fn rotated_tolerance_degrees(&self) -> f64 {
        self.rotated_tolerance_degrees
    }

    /// Extent of a volume in slice-oriented coordinates, on voxel faces or
    /// on the outermost voxel centers.
    pub fn volume_slice_bounds(
        &self,
        geometry: &SliceGeometry,
        volume: &VolumeGeometry,
        use_voxel_center: bool,
    ) -> SliceBounds {
        let corners = volume.world_corners(use_voxel_center);
        let points = corners.iter().map(|&c| geometry.world_to_oriented(c));
        // eight corners are always present
        SliceBounds::from_points(points).unwrap_or(SliceBounds {
            min: DVec3::ZERO,
            max: DVec3::ZERO,
        })
    }

    pub fn volume_slice_dimensions(
        &self,
        geometry: &SliceGeometry,
        volume: &VolumeGeometry,
    ) -> DVec3 {
        self.volume_slice_bounds(geometry, volume, false).size()
    }

    /// Distance to step along each slice axis to move by one voxel.
    pub fn volume_slice_spacing(&self, geometry: &SliceGeometry, volume: &VolumeGeometry) -> DVec3 {
        voxel_step_along_slice_axes(geometry, volume)
    }

    pub fn volume_world_box(&self, volume: &VolumeGeometry) -> WorldBox {
        let corners = volume.world_corners(false);
        let min = corners.iter().copied().fold(DVec3::INFINITY, DVec3::min);
        let max = corners.iter().copied().fold(DVec3::NEG_INFINITY, DVec3::max);
        WorldBox {
            size: max - min,
            center: (min + max) * 0.5,
        }
    }

    /// Sets the field of view and offset so that `bounds` fills a viewport of
    /// `viewport_width` x `viewport_height` pixels, keeping the viewport aspect.
    /// Returns `None` for an empty extent or viewport.
    pub fn fit_slice_to_volume_extent(
        &self,
        geometry: &SliceGeometry,
        bounds: &SliceBounds,
        viewport_width: u32,
        viewport_height: u32,
    ) -> Option<SliceGeometry> {
        let tile = geometry.layout.tile_size(viewport_width, viewport_height);
        let Some((width, height)) = tile else {
            warn!("cannot fit slice to a {viewport_width}x{viewport_height} viewport");
            return None;
        };
        let size = bounds.size();
        if !(size.x > 0.0 && size.y > 0.0) {
            warn!("cannot fit slice to an empty extent {size:?}");
            return None;
        }

        let (display_x, display_y) = (width as f64, height as f64);
        let (fit_x, fit_y) = if size.x / display_x > size.y / display_y {
            (size.x, size.x * display_y / display_x)
        } else {
            (size.y * display_x / display_y, size.y)
        };
        let thickness = if size.z > 0.0 { size.z } else { geometry.field_of_view.z };

        let mut fitted = *geometry;
        fitted.field_of_view = DVec3::new(fit_x, fit_y, thickness);
        fitted.dimensions = UVec3::new(width, height, geometry.dimensions.z.max(1));
        let center = geometry.orientation() * bounds.center();
        fitted.slice_to_world.w_axis = center.extend(1.0);
        trace!("fitted field of view {:?} at {:?}", fitted.field_of_view, center);
        Some(fitted)
    }

    pub fn fit_slice_to_multiple_volumes(
        &self,
        geometry: &SliceGeometry,
        bounds: &[SliceBounds],
        viewport_width: u32,
        viewport_height: u32,
    ) -> Option<SliceGeometry> {
        let (first, rest) = bounds.split_first()?;
        let union = rest.iter().fold(*first, |acc, b| acc.union(b));
        self.fit_slice_to_volume_extent(geometry, &union, viewport_width, viewport_height)
    }

    /// Applies `field_of_view` to the smaller viewport dimension.
    pub fn fit_field_of_view(
        &self,
        geometry: &SliceGeometry,
        field_of_view: f64,
    ) -> Option<SliceGeometry> {
        if !(field_of_view > 0.0) {
            return None;
        }
        let dims = geometry.dimensions.as_dvec3();
        let (fov_x, fov_y) = if dims.x < dims.y {
            (field_of_view, field_of_view * dims.y / dims.x)
        } else {
            (field_of_view * dims.x / dims.y, field_of_view)
        };
        let mut fitted = *geometry;
        fitted.field_of_view = DVec3::new(fov_x, fov_y, geometry.field_of_view.z);
        Some(fitted)
    }

    /// Aligns the slice axes with the volume's index axes. The normal goes to
    /// the closest volume axis, unless the volume is a single slice and
    /// `force_single_plane` is set, in which case the plane becomes exactly
    /// that slice's plane.
    pub fn rotate_to_volume_axes(
        &self,
        geometry: &SliceGeometry,
        volume: &VolumeGeometry,
        force_single_plane: bool,
    ) -> SliceGeometry {
        let axes = [
            volume.axis_direction(0),
            volume.axis_direction(1),
            volume.axis_direction(2),
        ];
        let current = [geometry.x_axis(), geometry.y_axis(), geometry.normal()];
        let mut used = [false; 3];
        let mut chosen = current;

        let single_plane = if force_single_plane { volume.single_slice_axis() } else { None };
        if let Some(axis) = single_plane {
            let sign = if current[2].dot(axes[axis]) < 0.0 { -1.0 } else { 1.0 };
            chosen[2] = axes[axis] * sign;
            used[axis] = true;
        }

        let slots: &[usize] = if single_plane.is_some() { &[0, 1] } else { &[2, 0, 1] };
        for &slot in slots {
            let best = (0..3)
                .filter(|&axis| !used[axis])
                .max_by(|&a, &b| {
                    let da = current[slot].dot(axes[a]).abs();
                    let db = current[slot].dot(axes[b]).abs();
                    da.total_cmp(&db)
                });
            if let Some(axis) = best {
                let sign = if current[slot].dot(axes[axis]) < 0.0 { -1.0 } else { 1.0 };
                chosen[slot] = axes[axis] * sign;
                used[axis] = true;
            }
        }

        let mut origin = geometry.origin();
        if single_plane.is_some() {
            origin += chosen[2] * chosen[2].dot(volume.center_world() - origin);
        }
        let rotated = DMat4::from_cols(
            chosen[0].extend(0.0),
            chosen[1].extend(0.0),
            chosen[2].extend(0.0),
            origin.extend(1.0),
        );
        geometry.with_slice_to_world(rotated)
    }

    /// Maps a plane offset to the 1-based index of the volume slice it cuts.
    pub fn slice_index_from_offset(
        &self,
        geometry: &SliceGeometry,
        offset: f64,
        volume: Option<&VolumeGeometry>,
    ) -> SliceIndex {
        let Some(volume) = volume else {
            return SliceIndex::NoVolume;
        };
        let normal = geometry.normal();
        let (axis, alignment) = (0..3)
            .map(|axis| (axis, normal.dot(volume.axis_direction(axis)).abs()))
            .fold((0, f64::MIN), |best, candidate| {
                if candidate.1 > best.1 { candidate } else { best }
            });
        let angle = alignment.min(1.0).acos().to_degrees();
        if angle > self.rotated_tolerance_degrees {
            return SliceIndex::Rotated;
        }

        let point = geometry.origin() + normal * (offset - geometry.offset());
        let ijk = volume.to_ijk(point);
        let index = (ijk[axis] + 0.5).floor();
        if index < 0.0 || index >= volume.dimensions()[axis] as f64 {
            return SliceIndex::OutOfVolume;
        }
        SliceIndex::Index(index as u32 + 1)
    }

    /// Offset of the plane through the voxel center closest to `offset`.
    pub fn snap_offset_to_voxel_center(
        &self,
        geometry: &SliceGeometry,
        offset: f64,
        volume: &VolumeGeometry,
    ) -> f64 {
        let normal = geometry.normal();
        let point = geometry.origin() + normal * (offset - geometry.offset());
        let center = volume.to_world(volume.to_ijk(point).round());
        normal.dot(center)
    }

    /// Rescales the field of view after a viewport size change so that the
    /// pixel size along the less-changed dimension is kept. The size must be
    /// the overall viewport, not a lightbox tile.
    pub fn resize_for_viewport(
        &self,
        geometry: &SliceGeometry,
        viewport_width: u32,
        viewport_height: u32,
    ) -> Option<SliceGeometry> {
        let tile = geometry.layout.tile_size(viewport_width, viewport_height);
        let Some((width, height)) = tile else {
            warn!("ignoring resize to a {viewport_width}x{viewport_height} viewport");
            return None;
        };
        let old_dims = geometry.dimensions;
        let old_fov = geometry.field_of_view;
        let scaling_x = if old_dims.x != 0 { width as f64 / old_dims.x as f64 } else { 1.0 };
        let scaling_y = if old_dims.y != 0 { height as f64 / old_dims.y as f64 } else { 1.0 };
        let magnitude_x = if scaling_x >= 1.0 { scaling_x } else { 10000.0 / scaling_x };
        let magnitude_y = if scaling_y >= 1.0 { scaling_y } else { 10000.0 / scaling_y };

        let mut fov = old_fov;
        if magnitude_x < magnitude_y {
            fov.y = old_fov.y * scaling_y / scaling_x;
        } else {
            fov.x = old_fov.x * scaling_x / scaling_y;
        }

        let mut resized = *geometry;
        resized.field_of_view = fov;
        resized.dimensions = UVec3::new(width, height, old_dims.z.max(1));
        Some(resized)
    }

    /// Changes the lightbox tiling and resizes for the overall viewport.
    pub fn relayout(
        &self,
        geometry: &SliceGeometry,
        layout: LightboxLayout,
        viewport_width: u32,
        viewport_height: u32,
    ) -> Option<SliceGeometry> {
        self.resize_for_viewport(&geometry.with_layout(layout), viewport_width, viewport_height)
    }

    pub fn slice_offset_range_resolution(
        &self,
        geometry: &SliceGeometry,
        volume: &VolumeGeometry,
    ) -> OffsetRange {
        let bounds = self.volume_slice_bounds(geometry, volume, true);
        let spacing = self.volume_slice_spacing(geometry, volume);
        OffsetRange {
            min: bounds.min.z,
            max: bounds.max.z,
            resolution: spacing.z,
        }
    }
}

/// Millimetres along each slice axis that advance one voxel along the
/// volume axis most aligned with it.
pub(crate) fn voxel_step_along_slice_axes(
    geometry: &SliceGeometry,
    volume: &VolumeGeometry,
) -> DVec3 {
    let world_to_ijk = DMat3::from_mat4(volume.world_to_ijk());
    let ijk_per_mm = world_to_ijk * geometry.orientation();
    let step = |axis: usize| {
        let column = ijk_per_mm.col(axis).abs();
        let max = column.max_element();
        if max > 0.0 { 1.0 / max } else { 1.0 }
    };
    DVec3::new(step(0), step(1), step(2))
}
