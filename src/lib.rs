//! # MPR compositor library
//!
//! This crate turns volumes into the composited image of a 2-D slice view.
//! A slice view cuts up to three stacked volumes with one plane:
//!  - Background
//!  - Foreground
//!  - Label
//!
//! Each layer is resampled onto the plane, mapped to color through its own
//! window/level (or a label color table), and the layers are combined by
//! alpha blending, addition, subtraction or a checkerboard. The
//! [`SliceView`](controller::SliceView) keeps the image in sync with the
//! plane geometry, the layer volumes and the compositing parameters, and
//! recomputes only the parts affected by a change.
//!
//! Volumes are built from 2-D slice buffers with
//! [`VolumeLoader`](volume_loader::VolumeLoader) or directly from an
//! [`ndarray::Array3`], and handed to views through a
//! [`VolumeRegistry`](registry::VolumeRegistry). Per-pixel work runs in
//! parallel using rayon.
//!
//! # Examples
//!
//! ## Showing a volume in an axial view
//!
//! Fit an axial view to a background volume and save the composite.
//!
//! ```no_run
//! # use mpr_compositor::{EngineConfig, LayerKind, SliceView, Volume, VolumeRegistry};
//! # use ndarray::Array3;
//! let data = Array3::from_shape_fn((64, 256, 256), |(k, j, i)| ((i + j + k) % 256) as u16);
//! let mut registry = VolumeRegistry::new();
//! let id = registry.insert(Volume::new(data, (0.8, 0.8, 2.0)).expect("valid volume"));
//!
//! let config = EngineConfig::load().expect("should have loaded configuration");
//! let mut view = SliceView::axial("Red", 512, 512, &config);
//! view.set_layer_volume(LayerKind::Background, Some(id));
//! view.fit_slice_to_background(&registry);
//! view.process(&registry);
//!
//! if let Some(image) = view.output() {
//!     image.save("axial.png").expect("should have written image");
//! }
//! ```

pub mod compositor;
pub mod config;
pub mod controller;
pub mod enums;
pub mod error;
pub mod geometry;
mod interpolator;
pub mod layer;
pub mod registry;
pub mod volume;
pub mod volume_loader;

pub use compositor::{CompositeParameters, CompositingEngine};
pub use config::{EngineConfig, SlabSettings};
pub use controller::{
    EventQueue, NodeRef, NodeState, SceneEvent, SceneEventKind, SliceView, SyncState, ViewEvent,
};
pub use enums::{CompositingMode, Interpolation, LayerKind, ScalarType, SlabMode, SortBy};
pub use error::{ConfigError, SliceViewError};
pub use geometry::{GeometryResolver, LightboxLayout, SliceGeometry, SliceIndex};
pub use interpolator::Voxel;
pub use registry::{VolumeId, VolumeRegistry};
pub use volume::Volume;
