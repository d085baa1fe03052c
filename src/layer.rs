//! Per-layer resampling.
//!
//! Every layer owns one [`ResampleStage`] for its whole lifetime. Stages live
//! in a slotmap arena and are reconfigured in place when the source volume or
//! the slice geometry changes; they are never torn down and recreated.

use crate::config::{SlabSettings, WindowLevelConfig};
use crate::enums::{Interpolation, LayerKind, ScalarType, SlabMode};
use crate::geometry::{SliceGeometry, voxel_step_along_slice_axes};
use crate::interpolator::{Interpolator, Voxel};
use crate::registry::VolumeHandle;
use crate::volume::with_voxels;

use glam::{DMat3, DMat4, DVec3};
use half::f16;
use image::Rgba32FImage;
use log::{debug, trace, warn};
use ndarray::{Array2, ArrayView3, Zip};
use rayon::prelude::*;
use slotmap::{SlotMap, new_key_type};

new_key_type! {
    /// Arena handle of a resample stage.
    pub struct StageId;
}

/// Output connection of a resample stage. Two ports are the same connection
/// exactly when they name the same stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputPort(StageId);

impl OutputPort {
    pub fn stage(&self) -> StageId {
        self.0
    }
}

/// Resampled slice in the scalar type of the stage output.
#[derive(Debug, Clone, PartialEq)]
pub enum SliceScalars {
    U8(Array2<u8>),
    U16(Array2<u16>),
    I16(Array2<i16>),
    F16(Array2<f16>),
    F32(Array2<f32>),
}

macro_rules! slice_scalars_from {
    ($ty:ty, $variant:ident) => {
        impl From<Array2<$ty>> for SliceScalars {
            fn from(data: Array2<$ty>) -> Self {
                SliceScalars::$variant(data)
            }
        }
    };
}

slice_scalars_from!(u8, U8);
slice_scalars_from!(u16, U16);
slice_scalars_from!(i16, I16);
slice_scalars_from!(f16, F16);
slice_scalars_from!(f32, F32);

impl SliceScalars {
    /// (height, width)
    pub fn dim(&self) -> (usize, usize) {
        match self {
            SliceScalars::U8(a) => a.dim(),
            SliceScalars::U16(a) => a.dim(),
            SliceScalars::I16(a) => a.dim(),
            SliceScalars::F16(a) => a.dim(),
            SliceScalars::F32(a) => a.dim(),
        }
    }

    pub fn scalar_type(&self) -> ScalarType {
        match self {
            SliceScalars::U8(_) => ScalarType::U8,
            SliceScalars::U16(_) => ScalarType::U16,
            SliceScalars::I16(_) => ScalarType::I16,
            SliceScalars::F16(_) => ScalarType::F16,
            SliceScalars::F32(_) => ScalarType::F32,
        }
    }

    #[inline]
    pub fn value(&self, y: usize, x: usize) -> f64 {
        match self {
            SliceScalars::U8(a) => a[[y, x]].to_f64(),
            SliceScalars::U16(a) => a[[y, x]].to_f64(),
            SliceScalars::I16(a) => a[[y, x]].to_f64(),
            SliceScalars::F16(a) => Voxel::to_f64(a[[y, x]]),
            SliceScalars::F32(a) => a[[y, x]].to_f64(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResampleOutput {
    pub scalars: SliceScalars,
    /// True where the pixel falls inside the source volume.
    pub coverage: Array2<bool>,
}

type Sampler<T> = fn(&ArrayView3<T>, DVec3) -> Option<f64>;

/// Planes sampled across a thick slab, resolved for one input and geometry.
#[derive(Debug, Clone, Copy)]
struct Slab {
    count: u32,
    /// Index-space step between neighbouring planes.
    step: DVec3,
    combine: fn(f64, f64) -> f64,
    average: bool,
}

impl Slab {
    fn new(
        settings: &SlabSettings,
        geometry: &SliceGeometry,
        world_to_ijk: DMat4,
        voxel_step: f64,
    ) -> Option<Self> {
        let count = settings.slice_count(voxel_step);
        if count < 2 {
            return None;
        }
        let spacing = settings.thickness / count as f64;
        let step = DMat3::from_mat4(world_to_ijk) * (geometry.normal() * spacing);
        let combine: fn(f64, f64) -> f64 = match settings.mode {
            SlabMode::Max => f64::max,
            SlabMode::Min => f64::min,
            SlabMode::Mean | SlabMode::Sum => |a, b| a + b,
        };
        Some(Self {
            count,
            step,
            combine,
            average: settings.mode == SlabMode::Mean,
        })
    }

    /// Reduces the samples centred on the plane. Planes outside the volume
    /// are skipped; `None` when every plane misses it.
    #[inline]
    fn reduce(&self, center: DVec3, mut sample: impl FnMut(DVec3) -> Option<f64>) -> Option<f64> {
        let half = (self.count - 1) as f64 / 2.0;
        let mut reduced: Option<f64> = None;
        let mut hits = 0u32;
        for plane in 0..self.count {
            let Some(value) = sample(center + self.step * (plane as f64 - half)) else {
                continue;
            };
            hits += 1;
            reduced = Some(match reduced {
                Some(acc) => (self.combine)(acc, value),
                None => value,
            });
        }
        reduced.map(|value| if self.average { value / hits as f64 } else { value })
    }
}

fn resample_into<T: Voxel, S: Voxel>(
    voxels: ArrayView3<T>,
    xy_to_ijk: DMat4,
    interpolation: Interpolation,
    slab: Option<Slab>,
    (width, height): (usize, usize),
) -> (Array2<S>, Array2<bool>) {
    let sample: Sampler<T> = match interpolation {
        Interpolation::Nearest => Interpolator::nearest,
        Interpolation::Linear => Interpolator::trilinear,
    };
    let (low, high) = S::SCALAR_TYPE.range();
    let mut scalars = Array2::from_elem((height, width), S::from_f64(0.0));
    let mut coverage = Array2::from_elem((height, width), false);
    Zip::indexed(&mut scalars)
        .and(&mut coverage)
        .par_for_each(|(y, x), value, covered| {
            let ijk = xy_to_ijk.transform_point3(DVec3::new(x as f64, y as f64, 0.0));
            let sampled = match &slab {
                Some(slab) => slab.reduce(ijk, |at| sample(&voxels, at)),
                None => sample(&voxels, ijk),
            };
            if let Some(v) = sampled {
                *value = S::from_f64(v.clamp(low, high));
                *covered = true;
            }
        });
    (scalars, coverage)
}

fn resample_native<T: Voxel>(
    voxels: ArrayView3<T>,
    xy_to_ijk: DMat4,
    interpolation: Interpolation,
    slab: Option<Slab>,
    size: (usize, usize),
) -> (Array2<T>, Array2<bool>) {
    resample_into::<T, T>(voxels, xy_to_ijk, interpolation, slab, size)
}

/// Resamples a source volume onto the slice plane.
#[derive(Debug)]
pub struct ResampleStage {
    interpolation: Interpolation,
    label_output: bool,
    slab: SlabSettings,
    input: Option<VolumeHandle>,
    geometry: Option<SliceGeometry>,
    output: Option<ResampleOutput>,
    /// Bumped whenever the input, the output geometry or the slab changes.
    generation: u64,
    executed: Option<u64>,
}

impl ResampleStage {
    fn new(interpolation: Interpolation, label_output: bool) -> Self {
        Self {
            interpolation,
            label_output,
            slab: SlabSettings::default(),
            input: None,
            geometry: None,
            output: None,
            generation: 0,
            executed: None,
        }
    }

    pub fn interpolation(&self) -> Interpolation {
        self.interpolation
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn output(&self) -> Option<&ResampleOutput> {
        self.output.as_ref()
    }

    fn set_input(&mut self, input: Option<VolumeHandle>) -> bool {
        let unchanged = match (&self.input, &input) {
            (None, None) => true,
            (Some(a), Some(b)) => a.same_as(b),
            _ => false,
        };
        if unchanged {
            return false;
        }
        self.input = input;
        self.generation += 1;
        true
    }

    /// Updates only the output transform and extent.
    fn set_output_geometry(&mut self, geometry: &SliceGeometry) -> bool {
        if self.geometry.as_ref() == Some(geometry) {
            return false;
        }
        self.geometry = Some(*geometry);
        self.generation += 1;
        true
    }

    pub fn slab(&self) -> &SlabSettings {
        &self.slab
    }

    /// Label stages always cut a single plane.
    fn set_slab(&mut self, slab: &SlabSettings) -> bool {
        if self.label_output || self.slab == *slab {
            return false;
        }
        self.slab = *slab;
        self.generation += 1;
        true
    }

    /// Output scalar type for a given source type.
    pub fn output_scalar_type(&self, source: ScalarType) -> ScalarType {
        match (self.label_output, source) {
            (true, ScalarType::U8) => ScalarType::U8,
            (true, _) => ScalarType::U16,
            (false, source) => source,
        }
    }

    /// Resamples if the input, geometry or slab changed since the last run.
    /// Returns whether the output was recomputed.
    fn update(&mut self) -> bool {
        if self.executed == Some(self.generation) {
            return false;
        }
        self.executed = Some(self.generation);

        let (Some(input), Some(geometry)) = (&self.input, &self.geometry) else {
            self.output = None;
            return true;
        };
        let volume = input.volume();
        let dims = geometry.dimensions();
        let size = (dims.x as usize, dims.y as usize);
        let world_to_ijk = volume.geometry().world_to_ijk();
        let xy_to_ijk = world_to_ijk * geometry.xy_to_world();
        let interpolation = self.interpolation;
        let voxel_step = voxel_step_along_slice_axes(geometry, volume.geometry()).z;
        let slab = Slab::new(&self.slab, geometry, world_to_ijk, voxel_step);
        let output_type = self.output_scalar_type(volume.scalar_type());

        let (scalars, coverage): (SliceScalars, Array2<bool>) = with_voxels!(volume.data(), arr => {
            let view = arr.view();
            match output_type {
                ScalarType::U8 => {
                    let (s, c) = resample_into::<_, u8>(view, xy_to_ijk, interpolation, slab, size);
                    (s.into(), c)
                }
                ScalarType::U16 => {
                    let (s, c) =
                        resample_into::<_, u16>(view, xy_to_ijk, interpolation, slab, size);
                    (s.into(), c)
                }
                _ => {
                    let (s, c) = resample_native(view, xy_to_ijk, interpolation, slab, size);
                    (s.into(), c)
                }
            }
        });
        trace!(
            "resampled {:?} slice {}x{} ({:?}, {} slab planes)",
            scalars.scalar_type(),
            size.0,
            size.1,
            interpolation,
            slab.map_or(1, |slab| slab.count)
        );
        self.output = Some(ResampleOutput { scalars, coverage });
        true
    }
}

/// Linear intensity-to-display mapping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowLevel {
    pub window: f64,
    pub level: f64,
    /// Recompute from the source statistics whenever the source changes.
    pub auto: bool,
}

impl Default for WindowLevel {
    fn default() -> Self {
        Self {
            window: 256.0,
            level: 128.0,
            auto: true,
        }
    }
}

impl WindowLevel {
    /// Maps an intensity to [0, 1].
    #[inline]
    pub fn map(&self, value: f64) -> f32 {
        if self.window <= 0.0 {
            return if value >= self.level { 1.0 } else { 0.0 };
        }
        let low = self.level - self.window / 2.0;
        ((value - low) / self.window).clamp(0.0, 1.0) as f32
    }
}

/// Window/level state of a layer together with the source scalar range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowLevelInfo {
    pub window: f64,
    pub level: f64,
    pub range_low: f64,
    pub range_high: f64,
    pub auto: bool,
}

/// Colors for label values; label 0 is transparent.
#[derive(Debug, Clone)]
pub struct LabelColorTable {
    colors: Vec<[f32; 3]>,
}

impl Default for LabelColorTable {
    fn default() -> Self {
        Self {
            colors: vec![
                [0.50, 0.68, 0.50],
                [0.95, 0.84, 0.57],
                [0.69, 0.48, 0.40],
                [0.44, 0.72, 0.82],
                [0.85, 0.40, 0.37],
                [0.56, 0.46, 0.71],
                [0.86, 0.61, 0.27],
                [0.30, 0.50, 0.80],
            ],
        }
    }
}

impl LabelColorTable {
    pub fn new(colors: Vec<[f32; 3]>) -> Self {
        if colors.is_empty() {
            return Self::default();
        }
        Self { colors }
    }

    #[inline]
    pub fn color(&self, label: u32) -> Option<[f32; 4]> {
        if label == 0 {
            return None;
        }
        let [r, g, b] = self.colors[(label as usize - 1) % self.colors.len()];
        Some([r, g, b, 1.0])
    }
}

#[derive(Debug)]
pub struct SliceLayer {
    kind: LayerKind,
    source: Option<VolumeHandle>,
    stage: StageId,
    window_level: WindowLevel,
    rgba: Option<Rgba32FImage>,
    colors_dirty: bool,
}

impl SliceLayer {
    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    pub fn source(&self) -> Option<&VolumeHandle> {
        self.source.as_ref()
    }

    pub fn window_level(&self) -> WindowLevel {
        self.window_level
    }

    pub fn image(&self) -> Option<&Rgba32FImage> {
        self.rgba.as_ref()
    }
}

/// The fixed set of layers of one slice view and their resample stages.
#[derive(Debug)]
pub struct LayerPipeline {
    stages: SlotMap<StageId, ResampleStage>,
    layers: Vec<SliceLayer>,
    label_colors: LabelColorTable,
    window_level_config: WindowLevelConfig,
}

impl LayerPipeline {
    pub fn new(config: &WindowLevelConfig) -> Self {
        let mut stages = SlotMap::with_key();
        let layers = LayerKind::ALL
            .iter()
            .map(|&kind| {
                let stage = match kind {
                    LayerKind::Label => ResampleStage::new(Interpolation::Nearest, true),
                    _ => ResampleStage::new(Interpolation::Linear, false),
                };
                SliceLayer {
                    kind,
                    source: None,
                    stage: stages.insert(stage),
                    window_level: WindowLevel::default(),
                    rgba: None,
                    colors_dirty: true,
                }
            })
            .collect();
        Self {
            stages,
            layers,
            label_colors: LabelColorTable::default(),
            window_level_config: config.clone(),
        }
    }

    pub fn layer(&self, kind: LayerKind) -> &SliceLayer {
        &self.layers[kind.ordinal()]
    }

    fn layer_mut(&mut self, kind: LayerKind) -> &mut SliceLayer {
        &mut self.layers[kind.ordinal()]
    }

    pub fn stage(&self, kind: LayerKind) -> Option<&ResampleStage> {
        self.stages.get(self.layer(kind).stage)
    }

    pub fn set_label_colors(&mut self, colors: LabelColorTable) {
        self.label_colors = colors;
        self.layer_mut(LayerKind::Label).colors_dirty = true;
    }

    /// Swaps the source of a layer. Returns false if the same volume is
    /// already connected.
    pub fn set_source_volume(&mut self, kind: LayerKind, volume: Option<VolumeHandle>) -> bool {
        let stage_id = self.layer(kind).stage;
        let Some(stage) = self.stages.get_mut(stage_id) else {
            return false;
        };
        if !stage.set_input(volume.clone()) {
            return false;
        }

        let config = self.window_level_config.clone();
        let layer = self.layer_mut(kind);
        layer.source = volume;
        layer.colors_dirty = true;
        if let Some(source) = &layer.source
            && layer.window_level.auto
        {
            layer.window_level = auto_window_level(source, &config);
        }
        debug!(
            "{:?} layer source {}",
            kind,
            if layer.source.is_some() { "connected" } else { "cleared" }
        );
        true
    }

    /// Reconfigures every stage's output geometry. Returns false when the
    /// geometry is identical to the current one.
    pub fn update_for_geometry(&mut self, geometry: &SliceGeometry) -> bool {
        let mut changed = false;
        for stage in self.stages.values_mut() {
            changed |= stage.set_output_geometry(geometry);
        }
        changed
    }

    /// Applies thick-slab reconstruction to the background and foreground
    /// stages. The label stage keeps cutting a single plane.
    pub fn set_slab(&mut self, slab: &SlabSettings) -> bool {
        let mut changed = false;
        for stage in self.stages.values_mut() {
            changed |= stage.set_slab(slab);
        }
        if changed {
            debug!("slab reconstruction {slab:?}");
        }
        changed
    }

    /// Switches the layer to manual window/level.
    pub fn set_window_level(&mut self, kind: LayerKind, window: f64, level: f64) -> bool {
        let layer = self.layer_mut(kind);
        let manual = WindowLevel {
            window,
            level,
            auto: false,
        };
        if layer.window_level == manual {
            return false;
        }
        layer.window_level = manual;
        layer.colors_dirty = true;
        true
    }

    pub fn set_auto_window_level(&mut self, kind: LayerKind, auto: bool) -> bool {
        let config = self.window_level_config.clone();
        let layer = self.layer_mut(kind);
        if layer.window_level.auto == auto {
            return false;
        }
        layer.window_level.auto = auto;
        if let Some(source) = &layer.source
            && auto
        {
            layer.window_level = auto_window_level(source, &config);
        }
        layer.colors_dirty = true;
        true
    }

    pub fn window_level(&self, kind: LayerKind) -> WindowLevel {
        self.layer(kind).window_level
    }

    pub fn window_level_and_range(&self, kind: LayerKind) -> WindowLevelInfo {
        let layer = self.layer(kind);
        let (range_low, range_high) = layer
            .source
            .as_ref()
            .map(|s| (s.volume().statistics().min, s.volume().statistics().max))
            .unwrap_or((0.0, 0.0));
        WindowLevelInfo {
            window: layer.window_level.window,
            level: layer.window_level.level,
            range_low,
            range_high,
            auto: layer.window_level.auto,
        }
    }

    /// Connection to the layer's output, absent when the layer has no source.
    pub fn output_port(&self, kind: LayerKind) -> Option<OutputPort> {
        let layer = self.layer(kind);
        layer.source.as_ref().map(|_| OutputPort(layer.stage))
    }

    pub fn image(&self, port: OutputPort) -> Option<&Rgba32FImage> {
        self.layers
            .iter()
            .find(|layer| layer.stage == port.0)
            .and_then(|layer| layer.rgba.as_ref())
    }

    pub fn coverage(&self, port: OutputPort) -> Option<&Array2<bool>> {
        self.stages.get(port.0)?.output().map(|o| &o.coverage)
    }

    pub fn stage_generation(&self, port: OutputPort) -> Option<u64> {
        self.stages.get(port.0).map(ResampleStage::generation)
    }

    pub fn is_inside_volume(&self, kind: LayerKind, world: DVec3) -> bool {
        self.layer(kind)
            .source
            .as_ref()
            .is_some_and(|s| s.volume().geometry().contains_world(world))
    }

    /// Executes stages whose input or geometry changed and recolors layers
    /// whose samples or display mapping changed. Returns the layers whose
    /// images were regenerated.
    pub fn update(&mut self) -> Vec<LayerKind> {
        let mut refreshed = Vec::new();
        for index in 0..self.layers.len() {
            let stage_id = self.layers[index].stage;
            let Some(stage) = self.stages.get_mut(stage_id) else {
                continue;
            };
            let resampled = stage.update();
            let layer = &mut self.layers[index];
            if !(resampled || layer.colors_dirty) {
                continue;
            }
            layer.colors_dirty = false;
            let had_image = layer.rgba.is_some();
            layer.rgba = match (layer.source.is_some(), stage.output()) {
                (true, Some(output)) => {
                    colorize(layer.kind, output, &layer.window_level, &self.label_colors)
                }
                _ => None,
            };
            if had_image || layer.rgba.is_some() {
                refreshed.push(layer.kind);
            }
        }
        refreshed
    }
}

fn auto_window_level(source: &VolumeHandle, config: &WindowLevelConfig) -> WindowLevel {
    let (low, high) = source
        .volume()
        .statistics()
        .auto_range(config.auto_low_percentile, config.auto_high_percentile);
    WindowLevel {
        window: high - low,
        level: (high + low) / 2.0,
        auto: true,
    }
}

fn colorize(
    kind: LayerKind,
    output: &ResampleOutput,
    window_level: &WindowLevel,
    label_colors: &LabelColorTable,
) -> Option<Rgba32FImage> {
    let (height, width) = output.scalars.dim();
    let scalars = &output.scalars;
    let coverage = &output.coverage;
    let is_label = kind == LayerKind::Label;

    let color = |y: usize, x: usize| -> [f32; 4] {
        if !coverage[[y, x]] {
            return [0.0; 4];
        }
        let value = scalars.value(y, x);
        if is_label {
            label_colors.color(value.max(0.0) as u32).unwrap_or([0.0; 4])
        } else {
            let v = window_level.map(value);
            [v, v, v, 1.0]
        }
    };
    let color = &color;

    let pixel_data: Vec<f32> = (0..height)
        .into_par_iter()
        .flat_map_iter(|y| (0..width).flat_map(move |x| color(y, x)))
        .collect();
    let image = Rgba32FImage::from_raw(width as u32, height as u32, pixel_data);
    if image.is_none() {
        warn!("{kind:?} layer produced a mis-sized image");
    }
    image
}
