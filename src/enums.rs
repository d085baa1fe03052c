use serde::{Deserialize, Serialize};

/// Logical slot of a layer in a slice view, ordered back to front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LayerKind {
    Background,
    Foreground,
    Label,
}

impl LayerKind {
    /// All layers in compositing order.
    pub const ALL: [LayerKind; 3] = [
        LayerKind::Background,
        LayerKind::Foreground,
        LayerKind::Label,
    ];

    pub fn ordinal(self) -> usize {
        match self {
            LayerKind::Background => 0,
            LayerKind::Foreground => 1,
            LayerKind::Label => 2,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    #[default]
    Linear,
    Nearest,
}

/// Rule used to combine the background and foreground layers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositingMode {
    #[default]
    AlphaBlend,
    Add,
    Subtract,
    Checkerboard,
}

/// Reduction applied to the samples of a thick slab along the slice normal.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlabMode {
    /// Maximum intensity projection
    #[default]
    Max,
    Min,
    Mean,
    Sum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    U8,
    U16,
    I16,
    F16,
    F32,
}

impl ScalarType {
    /// Representable range of the type, used to clamp resampled values.
    pub fn range(self) -> (f64, f64) {
        match self {
            ScalarType::U8 => (u8::MIN as f64, u8::MAX as f64),
            ScalarType::U16 => (u16::MIN as f64, u16::MAX as f64),
            ScalarType::I16 => (i16::MIN as f64, i16::MAX as f64),
            ScalarType::F16 => (-65504.0, 65504.0),
            ScalarType::F32 => (f32::MIN as f64, f32::MAX as f64),
        }
    }
}

#[derive(Default)]
pub enum SortBy {
    /// Sort slices by their position along the stacking axis.
    #[default]
    Position,
    None,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_ordinals_follow_compositing_order() {
        let ordinals: Vec<usize> = LayerKind::ALL.iter().map(|kind| kind.ordinal()).collect();
        assert_eq!(ordinals, vec![0, 1, 2]);
    }

    #[test]
    fn scalar_ranges_match_the_storage_type() {
        assert_eq!(ScalarType::U8.range(), (0.0, 255.0));
        assert_eq!(ScalarType::I16.range(), (-32768.0, 32767.0));
        assert_eq!(ScalarType::F16.range().1, half::f16::MAX.to_f64());
    }
}
