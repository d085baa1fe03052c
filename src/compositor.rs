//! Layer compositing.
//!
//! The [`CompositingEngine`] keeps a [`BlendPipeline`] of the currently present
//! layers and combines their RGBA slices into the displayed image.
//!
//! - [`CompositingMode::AlphaBlend`] - over-compositing back to front, each
//!   layer weighted by its opacity
//! - [`CompositingMode::Add`] / [`CompositingMode::Subtract`] - foreground
//!   scaled by its opacity and added to or subtracted from the background
//! - [`CompositingMode::Checkerboard`] - tiles alternate between background
//!   and foreground
//!
//! The label layer is always over-composited: label 0 is transparent, so
//! only labelled pixels show.

use crate::config::CompositingConfig;
use crate::enums::{CompositingMode, LayerKind};
use crate::layer::{LayerPipeline, OutputPort};

use image::{Rgba32FImage, RgbaImage};
use log::{debug, trace, warn};
use ndarray::Array2;
use rayon::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompositeParameters {
    mode: CompositingMode,
    foreground_opacity: f64,
    label_opacity: f64,
    clip_to_background_volume: bool,
}

impl Default for CompositeParameters {
    fn default() -> Self {
        Self::new(&CompositingConfig::default())
    }
}

impl CompositeParameters {
    pub fn new(config: &CompositingConfig) -> Self {
        Self {
            mode: config.mode,
            foreground_opacity: config.foreground_opacity.clamp(0.0, 1.0),
            label_opacity: config.label_opacity.clamp(0.0, 1.0),
            clip_to_background_volume: config.clip_to_background_volume,
        }
    }

    pub fn mode(&self) -> CompositingMode {
        self.mode
    }

    pub fn with_mode(mut self, mode: CompositingMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn foreground_opacity(&self) -> f64 {
        self.foreground_opacity
    }

    pub fn with_foreground_opacity(mut self, opacity: f64) -> Self {
        self.foreground_opacity = clamp_opacity(opacity);
        self
    }

    pub fn label_opacity(&self) -> f64 {
        self.label_opacity
    }

    pub fn with_label_opacity(mut self, opacity: f64) -> Self {
        self.label_opacity = clamp_opacity(opacity);
        self
    }

    pub fn clip_to_background_volume(&self) -> bool {
        self.clip_to_background_volume
    }

    pub fn with_clip_to_background_volume(mut self, clip: bool) -> Self {
        self.clip_to_background_volume = clip;
        self
    }

    /// Blend weight of a layer; the background is always opaque.
    pub fn opacity(&self, kind: LayerKind) -> f64 {
        match kind {
            LayerKind::Background => 1.0,
            LayerKind::Foreground => self.foreground_opacity,
            LayerKind::Label => self.label_opacity,
        }
    }
}

fn clamp_opacity(opacity: f64) -> f64 {
    if opacity.is_nan() { 0.0 } else { opacity.clamp(0.0, 1.0) }
}

/// A requested blend input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendLayerInfo {
    pub kind: LayerKind,
    pub port: OutputPort,
    pub opacity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendEntry {
    pub kind: LayerKind,
    pub port: OutputPort,
    pub opacity: f64,
}

type Arithmetic = fn(f32, f32) -> f32;

fn add(a: f32, b: f32) -> f32 {
    a + b
}

fn subtract(a: f32, b: f32) -> f32 {
    a - b
}

/// How the foreground entry is combined, resolved once per mode change.
#[derive(Debug, Clone, Copy)]
enum ForegroundOperation {
    Over,
    Arithmetic(Arithmetic),
    Checkerboard,
}

#[derive(Debug)]
struct ClipMask {
    port: OutputPort,
    generation: u64,
    mask: Array2<bool>,
}

/// Ordered blend inputs of the currently present layers.
#[derive(Debug)]
pub struct BlendPipeline {
    entries: Vec<BlendEntry>,
    mode: CompositingMode,
    operation: ForegroundOperation,
    clip_to_background: bool,
    clip: Option<ClipMask>,
    clip_rebuilds: u64,
}

impl Default for BlendPipeline {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            mode: CompositingMode::AlphaBlend,
            operation: ForegroundOperation::Over,
            clip_to_background: false,
            clip: None,
            clip_rebuilds: 0,
        }
    }
}

impl BlendPipeline {
    pub fn entries(&self) -> &[BlendEntry] {
        &self.entries
    }

    pub fn mode(&self) -> CompositingMode {
        self.mode
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of times the background clip mask has been recomputed.
    pub fn clip_mask_rebuilds(&self) -> u64 {
        self.clip_rebuilds
    }
}

#[derive(Debug)]
pub struct CompositingEngine {
    pipeline: BlendPipeline,
    checkerboard_tile_size: u32,
    output: Option<RgbaImage>,
}

impl CompositingEngine {
    pub fn new(config: &CompositingConfig) -> Self {
        Self {
            pipeline: BlendPipeline::default(),
            checkerboard_tile_size: config.checkerboard_tile_size.max(1),
            output: None,
        }
    }

    pub fn pipeline(&self) -> &BlendPipeline {
        &self.pipeline
    }

    pub fn output(&self) -> Option<&RgbaImage> {
        self.output.as_ref()
    }

    /// Brings the blend pipeline in line with the present layers and the
    /// parameters. Returns true if its topology changed.
    pub fn rebuild_blend_pipeline(
        &mut self,
        layers: &LayerPipeline,
        parameters: &CompositeParameters,
    ) -> bool {
        let requested: Vec<BlendLayerInfo> = LayerKind::ALL
            .iter()
            .filter_map(|&kind| {
                layers.output_port(kind).map(|port| BlendLayerInfo {
                    kind,
                    port,
                    opacity: parameters.opacity(kind),
                })
            })
            .collect();

        let clip = parameters.clip_to_background_volume();
        let mut changed = self.update_blend_layers(&requested, clip);
        changed |= self.update_add_sub_operation(parameters.mode());
        self.update_clip_mask(layers);
        changed
    }

    /// Applies the minimal set of insertions, removals and moves that turns
    /// the current entries into `layers`. Opacity-only differences are
    /// applied in place and do not count as a topology change.
    pub fn update_blend_layers(
        &mut self,
        layers: &[BlendLayerInfo],
        clip_to_background: bool,
    ) -> bool {
        let entries = &mut self.pipeline.entries;
        let mut edits = 0usize;

        let before = entries.len();
        entries.retain(|entry| layers.iter().any(|layer| layer.port == entry.port));
        edits += before - entries.len();

        for (index, layer) in layers.iter().enumerate() {
            match entries.iter().position(|entry| entry.port == layer.port) {
                Some(position) if position == index => {}
                Some(position) => {
                    let entry = entries.remove(position);
                    entries.insert(index, entry);
                    edits += 1;
                }
                None => {
                    entries.insert(
                        index,
                        BlendEntry {
                            kind: layer.kind,
                            port: layer.port,
                            opacity: layer.opacity,
                        },
                    );
                    edits += 1;
                }
            }
            let entry = &mut entries[index];
            entry.kind = layer.kind;
            entry.opacity = clamp_opacity(layer.opacity);
        }

        if self.pipeline.clip_to_background != clip_to_background {
            self.pipeline.clip_to_background = clip_to_background;
            edits += 1;
        }
        if edits > 0 {
            debug!(
                "blend pipeline changed with {edits} edit(s), {} input(s)",
                self.pipeline.entries.len()
            );
        }
        edits > 0
    }

    /// Selects the foreground operation for a compositing mode. Returns true
    /// if the mode changed.
    pub fn update_add_sub_operation(&mut self, mode: CompositingMode) -> bool {
        if self.pipeline.mode == mode {
            return false;
        }
        self.pipeline.mode = mode;
        self.pipeline.operation = match mode {
            CompositingMode::AlphaBlend => ForegroundOperation::Over,
            CompositingMode::Add => ForegroundOperation::Arithmetic(add),
            CompositingMode::Subtract => ForegroundOperation::Arithmetic(subtract),
            CompositingMode::Checkerboard => ForegroundOperation::Checkerboard,
        };
        true
    }

    /// Recomputes the background clip mask when the background stage's
    /// input or geometry changed.
    fn update_clip_mask(&mut self, layers: &LayerPipeline) {
        let background = self
            .pipeline
            .entries
            .first()
            .filter(|entry| entry.kind == LayerKind::Background)
            .map(|entry| entry.port);
        let Some(port) = background.filter(|_| self.pipeline.clip_to_background) else {
            self.pipeline.clip = None;
            return;
        };
        let Some(generation) = layers.stage_generation(port) else {
            self.pipeline.clip = None;
            return;
        };
        if let Some(clip) = &self.pipeline.clip
            && clip.port == port
            && clip.generation == generation
        {
            return;
        }
        match layers.coverage(port) {
            Some(coverage) => {
                self.pipeline.clip = Some(ClipMask {
                    port,
                    generation,
                    mask: coverage.clone(),
                });
                self.pipeline.clip_rebuilds += 1;
                trace!("recomputed background clip mask");
            }
            // stage has not executed yet; retry on the next rebuild
            None => self.pipeline.clip = None,
        }
    }

    /// Combines the layer images of the blend pipeline. Returns `None` when
    /// no layer is present.
    pub fn render_composite(&mut self, layers: &LayerPipeline) -> Option<&RgbaImage> {
        if self.pipeline.clip.is_none() {
            self.update_clip_mask(layers);
        }
        let inputs: Vec<(BlendEntry, &Rgba32FImage)> = self
            .pipeline
            .entries
            .iter()
            .filter_map(|entry| match layers.image(entry.port) {
                Some(image) => Some((*entry, image)),
                None => {
                    warn!("{:?} layer has no image yet", entry.kind);
                    None
                }
            })
            .collect();

        let Some(((_, base), rest)) = inputs.split_first() else {
            self.output = None;
            return None;
        };

        if rest.is_empty() {
            self.output = Some(to_rgba8(base.as_raw(), base.width(), base.height()));
            return self.output.as_ref();
        }

        let (width, height) = base.dimensions();
        let mask = self
            .pipeline
            .clip
            .as_ref()
            .map(|clip| &clip.mask)
            .filter(|mask| mask.dim() == (height as usize, width as usize));

        // the base layer is the canvas, its own opacity never dims it
        let mut out = vec![[0.0f32; 4]; (width * height) as usize];
        blend_over(&mut out, base.as_raw(), 1.0, None);

        for (entry, image) in rest {
            if image.dimensions() != (width, height) {
                warn!("{:?} layer size differs from the base layer", entry.kind);
                continue;
            }
            let opacity = entry.opacity as f32;
            let operation = match entry.kind {
                LayerKind::Foreground => self.pipeline.operation,
                _ => ForegroundOperation::Over,
            };
            match operation {
                ForegroundOperation::Over => blend_over(&mut out, image.as_raw(), opacity, mask),
                ForegroundOperation::Arithmetic(op) => {
                    blend_arithmetic(&mut out, image.as_raw(), opacity, mask, op)
                }
                ForegroundOperation::Checkerboard => {
                    let tile = self.checkerboard_tile_size as usize;
                    blend_checkerboard(&mut out, image.as_raw(), width as usize, tile, mask)
                }
            }
        }

        let flat: &[f32] = bytemuck::cast_slice(&out[..]);
        self.output = Some(to_rgba8(flat, width, height));
        self.output.as_ref()
    }
}

#[inline]
fn masked(mask: Option<&Array2<bool>>, index: usize) -> bool {
    match mask {
        Some(mask) => mask.as_slice().is_none_or(|m| m[index]),
        None => true,
    }
}

fn blend_over(out: &mut [[f32; 4]], layer: &[f32], opacity: f32, mask: Option<&Array2<bool>>) {
    out.par_iter_mut()
        .zip(layer.par_chunks_exact(4))
        .enumerate()
        .for_each(|(index, (dst, src))| {
            if !masked(mask, index) {
                return;
            }
            let weight = src[3] * opacity;
            let below = dst[3] * (1.0 - weight);
            let alpha = weight + below;
            if alpha > 0.0 {
                for c in 0..3 {
                    dst[c] = src[c].mul_add(weight, dst[c] * below) / alpha;
                }
            }
            dst[3] = alpha;
        });
}

fn blend_arithmetic(
    out: &mut [[f32; 4]],
    layer: &[f32],
    fraction: f32,
    mask: Option<&Array2<bool>>,
    op: Arithmetic,
) {
    out.par_iter_mut()
        .zip(layer.par_chunks_exact(4))
        .enumerate()
        .for_each(|(index, (dst, src))| {
            if !masked(mask, index) {
                return;
            }
            let weight = src[3] * fraction;
            for c in 0..3 {
                dst[c] = op(dst[c], src[c] * weight).clamp(0.0, 1.0);
            }
            dst[3] = dst[3].max(src[3]);
        });
}

fn blend_checkerboard(
    out: &mut [[f32; 4]],
    layer: &[f32],
    width: usize,
    tile: usize,
    mask: Option<&Array2<bool>>,
) {
    out.par_iter_mut()
        .zip(layer.par_chunks_exact(4))
        .enumerate()
        .for_each(|(index, (dst, src))| {
            let (x, y) = (index % width, index / width);
            if (x / tile + y / tile) % 2 == 1 && masked(mask, index) {
                dst.copy_from_slice(src);
            }
        });
}

#[inline]
fn normalize_to_u8(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn to_rgba8(pixels: &[f32], width: u32, height: u32) -> RgbaImage {
    let pixel_data: Vec<u8> = pixels.par_iter().map(|&v| normalize_to_u8(v)).collect();
    RgbaImage::from_raw(width, height, pixel_data).unwrap_or_else(|| RgbaImage::new(width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WindowLevelConfig;
    use crate::geometry::SliceGeometry;
    use crate::registry::VolumeRegistry;
    use crate::volume::Volume;
    use approx::assert_relative_eq;
    use ndarray::Array3;

    /// Layers filled with constant gray values in 0..=255, 8x8 pixels,
    /// windowed so that the gray value maps straight to the display.
    fn layers(values: &[(LayerKind, u8)]) -> (VolumeRegistry, LayerPipeline) {
        let mut registry = VolumeRegistry::new();
        let mut layers = LayerPipeline::new(&WindowLevelConfig::default());
        for &(kind, value) in values {
            let data = Array3::from_elem((1, 8, 8), value);
            let id = registry.insert(Volume::new(data, (1.0, 1.0, 1.0)).unwrap());
            layers.set_source_volume(kind, registry.get(id));
            layers.set_window_level(kind, 255.0, 127.5);
        }
        let geometry = SliceGeometry::axial(8, 8, 8.0);
        // shift so that every pixel lands inside the 8x8 volume
        let centered = geometry.with_slice_to_world(
            glam::DMat4::from_translation(glam::DVec3::new(3.0, 4.0, 0.0))
                * geometry.slice_to_world(),
        );
        layers.update_for_geometry(&centered);
        layers.update();
        (registry, layers)
    }

    fn engine() -> CompositingEngine {
        CompositingEngine::new(&CompositingConfig {
            checkerboard_tile_size: 2,
            ..CompositingConfig::default()
        })
    }

    fn pixel(engine: &CompositingEngine, x: u32, y: u32) -> [u8; 4] {
        engine.output().unwrap().get_pixel(x, y).0
    }

    #[test]
    fn opacities_are_clamped() {
        let params = CompositeParameters::default()
            .with_foreground_opacity(1.7)
            .with_label_opacity(-0.2);
        assert_eq!(params.foreground_opacity(), 1.0);
        assert_eq!(params.label_opacity(), 0.0);
        assert_eq!(params.with_foreground_opacity(f64::NAN).foreground_opacity(), 0.0);
    }

    #[test]
    fn single_layer_passes_through_unchanged() {
        let (_registry, layers) = layers(&[(LayerKind::Background, 200)]);
        let mut engine = engine();
        engine.rebuild_blend_pipeline(&layers, &CompositeParameters::default());
        let output = engine.render_composite(&layers).unwrap().clone();

        let port = layers.output_port(LayerKind::Background).unwrap();
        let source = layers.image(port).unwrap();
        for (out, src) in output.pixels().zip(source.pixels()) {
            for c in 0..4 {
                assert_eq!(out.0[c], normalize_to_u8(src.0[c]));
            }
        }
    }

    #[test]
    fn alpha_blend_weights_foreground_by_opacity() {
        let (_registry, layers) =
            layers(&[(LayerKind::Background, 200), (LayerKind::Foreground, 50)]);
        let mut engine = engine();
        let params = CompositeParameters::default().with_foreground_opacity(0.3);
        engine.rebuild_blend_pipeline(&layers, &params);
        engine.render_composite(&layers);

        let expected = (0.7 * 200.0 + 0.3 * 50.0_f64).round() as i32;
        let [r, g, b, a] = pixel(&engine, 4, 4);
        for channel in [r, g, b] {
            assert!((channel as i32 - expected).abs() <= 1, "{channel} vs {expected}");
        }
        assert_eq!(a, 255);
    }

    #[test]
    fn add_and_subtract_clamp_to_output_range() {
        let (_registry, layers) =
            layers(&[(LayerKind::Background, 255), (LayerKind::Foreground, 255)]);
        let mut engine = engine();
        let params = CompositeParameters::default()
            .with_mode(CompositingMode::Add)
            .with_foreground_opacity(1.0);
        engine.rebuild_blend_pipeline(&layers, &params);
        engine.render_composite(&layers);
        assert_eq!(pixel(&engine, 3, 3)[0], 255);

        engine.rebuild_blend_pipeline(&layers, &params.with_mode(CompositingMode::Subtract));
        engine.render_composite(&layers);
        assert_eq!(pixel(&engine, 3, 3)[0], 0);
    }

    #[test]
    fn add_uses_fractional_opacity() {
        let (_registry, layers) =
            layers(&[(LayerKind::Background, 100), (LayerKind::Foreground, 100)]);
        let mut engine = engine();
        let params = CompositeParameters::default()
            .with_mode(CompositingMode::Add)
            .with_foreground_opacity(0.5);
        engine.rebuild_blend_pipeline(&layers, &params);
        engine.render_composite(&layers);
        assert!((pixel(&engine, 2, 2)[1] as i32 - 150).abs() <= 1);
    }

    #[test]
    fn checkerboard_selects_whole_pixels() {
        let (_registry, layers) =
            layers(&[(LayerKind::Background, 40), (LayerKind::Foreground, 220)]);
        let mut engine = engine();
        let params = CompositeParameters::default()
            .with_mode(CompositingMode::Checkerboard)
            .with_foreground_opacity(0.1);
        engine.rebuild_blend_pipeline(&layers, &params);
        engine.render_composite(&layers);

        assert_eq!(pixel(&engine, 0, 0)[0], 40);
        assert_eq!(pixel(&engine, 2, 0)[0], 220);
        assert_eq!(pixel(&engine, 2, 2)[0], 40);
        for p in engine.output().unwrap().pixels() {
            assert!(p.0[0] == 40 || p.0[0] == 220);
        }
    }

    #[test]
    fn label_overlays_only_nonzero_pixels() {
        let mut registry = VolumeRegistry::new();
        let mut layers = LayerPipeline::new(&WindowLevelConfig::default());
        let gray = Array3::from_elem((1, 8, 8), 100u8);
        let background = registry.insert(Volume::new(gray, (1.0, 1.0, 1.0)).unwrap());
        let labels = Array3::from_shape_fn((1, 8, 8), |(_, _, i)| if i < 4 { 0u8 } else { 1u8 });
        let label = registry.insert(Volume::new(labels, (1.0, 1.0, 1.0)).unwrap());
        layers.set_source_volume(LayerKind::Background, registry.get(background));
        layers.set_window_level(LayerKind::Background, 255.0, 127.5);
        layers.set_source_volume(LayerKind::Label, registry.get(label));
        // pixel x maps to voxel i = x
        let geometry = SliceGeometry::from_axes(
            glam::DVec3::X,
            glam::DVec3::Y,
            glam::DVec3::Z,
            glam::DVec3::new(4.0, 4.0, 0.0),
            8,
            8,
            8.0,
        );
        layers.update_for_geometry(&geometry);
        layers.update();

        let mut engine = engine();
        engine.rebuild_blend_pipeline(&layers, &CompositeParameters::default());
        engine.render_composite(&layers);
        assert_eq!(pixel(&engine, 1, 3), [100, 100, 100, 255]);
        assert_ne!(pixel(&engine, 6, 3)[..3], [100, 100, 100]);
    }

    #[test]
    fn opacity_changes_are_not_topology_changes() {
        let (_registry, layers) =
            layers(&[(LayerKind::Background, 200), (LayerKind::Foreground, 50)]);
        let mut engine = engine();
        let params = CompositeParameters::default().with_foreground_opacity(0.3);
        assert!(engine.rebuild_blend_pipeline(&layers, &params));
        assert!(!engine.rebuild_blend_pipeline(&layers, &params));

        engine.render_composite(&layers);
        let before = pixel(&engine, 4, 4);
        assert!(!engine.rebuild_blend_pipeline(&layers, &params.with_foreground_opacity(0.9)));
        engine.render_composite(&layers);
        assert_ne!(pixel(&engine, 4, 4), before);
        assert_eq!(engine.pipeline().entries()[1].opacity, 0.9);
    }

    #[test]
    fn entries_are_edited_minimally() {
        let (_registry, layers) = layers(&[
            (LayerKind::Background, 10),
            (LayerKind::Foreground, 20),
            (LayerKind::Label, 1),
        ]);
        let bg = layers.output_port(LayerKind::Background).unwrap();
        let fg = layers.output_port(LayerKind::Foreground).unwrap();
        let label = layers.output_port(LayerKind::Label).unwrap();
        let info = |kind, port| BlendLayerInfo { kind, port, opacity: 1.0 };

        let mut engine = engine();
        assert!(engine.update_blend_layers(
            &[info(LayerKind::Background, bg), info(LayerKind::Label, label)],
            false
        ));
        assert!(engine.update_blend_layers(
            &[
                info(LayerKind::Background, bg),
                info(LayerKind::Foreground, fg),
                info(LayerKind::Label, label)
            ],
            false
        ));
        let ports: Vec<_> = engine.pipeline().entries().iter().map(|e| e.port).collect();
        assert_eq!(ports, vec![bg, fg, label]);

        assert!(!engine.update_blend_layers(
            &[
                info(LayerKind::Background, bg),
                info(LayerKind::Foreground, fg),
                info(LayerKind::Label, label)
            ],
            false
        ));
        assert!(engine.update_blend_layers(&[info(LayerKind::Foreground, fg)], false));
        assert_eq!(engine.pipeline().entries().len(), 1);
        assert!(engine.update_blend_layers(&[info(LayerKind::Foreground, fg)], true));
    }

    #[test]
    fn clip_mask_ignores_opacity_changes() {
        let (_registry, layers) =
            layers(&[(LayerKind::Background, 200), (LayerKind::Foreground, 50)]);
        let mut engine = engine();
        let params = CompositeParameters::default()
            .with_foreground_opacity(0.3)
            .with_clip_to_background_volume(true);
        engine.rebuild_blend_pipeline(&layers, &params);
        assert_eq!(engine.pipeline().clip_mask_rebuilds(), 1);
        engine.rebuild_blend_pipeline(&layers, &params.with_foreground_opacity(0.6));
        engine.render_composite(&layers);
        assert_eq!(engine.pipeline().clip_mask_rebuilds(), 1);
    }

    #[test]
    fn empty_label_leaves_foreground_base_untouched() {
        let (_registry, alone) = layers(&[(LayerKind::Foreground, 200)]);
        let mut engine = engine();
        engine.rebuild_blend_pipeline(&alone, &CompositeParameters::default());
        engine.render_composite(&alone);
        let expected = pixel(&engine, 4, 4);
        assert_eq!(expected, [200, 200, 200, 255]);

        let (_registry, with_label) =
            layers(&[(LayerKind::Foreground, 200), (LayerKind::Label, 0)]);
        let params = CompositeParameters::default().with_label_opacity(0.5);
        engine.rebuild_blend_pipeline(&with_label, &params);
        engine.render_composite(&with_label);
        assert_eq!(engine.pipeline().entries().len(), 2);
        assert_eq!(pixel(&engine, 4, 4), expected);
    }

    #[test]
    fn over_keeps_straight_color_on_transparent_canvas() {
        let mut out = vec![[0.0f32; 4]];
        blend_over(&mut out, &[0.8, 0.4, 0.2, 1.0], 0.5, None);
        assert_relative_eq!(out[0][0], 0.8, epsilon = 1e-6);
        assert_relative_eq!(out[0][1], 0.4, epsilon = 1e-6);
        assert_relative_eq!(out[0][2], 0.2, epsilon = 1e-6);
        assert_relative_eq!(out[0][3], 0.5, epsilon = 1e-6);

        blend_over(&mut out, &[0.0, 0.0, 0.0, 1.0], 0.5, None);
        assert_relative_eq!(out[0][0], 0.8 / 3.0, epsilon = 1e-6);
        assert_relative_eq!(out[0][3], 0.75, epsilon = 1e-6);
    }

    #[test]
    fn empty_pipeline_renders_nothing() {
        let layers = LayerPipeline::new(&WindowLevelConfig::default());
        let mut engine = engine();
        engine.rebuild_blend_pipeline(&layers, &CompositeParameters::default());
        assert!(engine.pipeline().is_empty());
        assert!(engine.render_composite(&layers).is_none());
    }
}
