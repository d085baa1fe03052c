use log::info;
use mpr_compositor::{
    CompositingMode, EngineConfig, LayerKind, SliceView, Volume, VolumeRegistry,
    enums::SortBy,
    volume_loader::{SliceBuffer, VolumeLoader},
};
use ndarray::{Array2, Array3};

const SIZE: usize = 128;
const SLICES: usize = 48;

/// Phantom of nested spheres, stacked from individual slices.
fn phantom_slices() -> Vec<SliceBuffer<u16>> {
    let center = SIZE as f64 / 2.0;
    (0..SLICES)
        .map(|k| {
            let z = (k as f64 - SLICES as f64 / 2.0) * 2.5;
            let pixels = Array2::from_shape_fn((SIZE, SIZE), |(j, i)| {
                let (x, y) = (i as f64 - center, j as f64 - center);
                let r = (x.powi(2) + y.powi(2) + z.powi(2)).sqrt();
                match r {
                    r if r < 20.0 => 900,
                    r if r < 45.0 => 400,
                    r if r < 60.0 => 100,
                    _ => 0,
                }
            });
            SliceBuffer {
                position: k as f64 * 2.5,
                pixels,
            }
        })
        .collect()
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = EngineConfig::load().expect("should have loaded configuration");
    let mut registry = VolumeRegistry::new();

    let background =
        VolumeLoader::load_from_slices(phantom_slices(), (1.0, 1.0), 2.5, SortBy::Position)
            .expect("should have stacked phantom slices");
    let background = registry.insert(background);

    let gradient = Array3::from_shape_fn((SLICES, SIZE, SIZE), |(_, j, i)| {
        (i + j) as f32 / (2 * SIZE) as f32
    });
    let gradient = Volume::new(gradient, (1.0, 1.0, 2.5)).expect("should have built gradient");
    let foreground = registry.insert(gradient);

    let labels = Array3::from_shape_fn((SLICES, SIZE, SIZE), |(_, j, i)| {
        if (40..60).contains(&i) && (50..90).contains(&j) { 1u8 } else { 0 }
    });
    let labels = Volume::new(labels, (1.0, 1.0, 2.5)).expect("should have built labels");
    let label = registry.insert(labels);

    let mut view = SliceView::axial("Red", 512, 512, &config);
    view.set_layer_volume(LayerKind::Background, Some(background));
    view.set_layer_volume(LayerKind::Foreground, Some(foreground));
    view.set_layer_volume(LayerKind::Label, Some(label));
    view.fit_slice_to_background(&registry);
    view.snap_slice_offset_to_ijk(&registry);
    view.set_foreground_opacity(0.3);
    view.set_label_opacity(0.6);
    view.process(&registry);
    info!("slice index {:?}", view.lowest_layer_slice_index(&registry));

    for (mode, path) in [
        (CompositingMode::AlphaBlend, "blend.png"),
        (CompositingMode::Checkerboard, "checkerboard.png"),
    ] {
        view.set_compositing_mode(mode);
        view.process(&registry);
        if let Some(image) = view.output() {
            image.save(path).expect("should have written composite");
            info!("wrote {path}");
        }
    }
}
