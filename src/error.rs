use thiserror::Error;

#[derive(Debug, Error)]
pub enum SliceViewError {
    #[error("Volume has an empty extent {0:?}")]
    EmptyVolume((usize, usize, usize)),

    #[error("Invalid voxel spacing {0:?}")]
    InvalidSpacing((f64, f64, f64)),

    #[error("Voxel-to-world orientation is not invertible")]
    SingularOrientation,

    #[error("No slices to stack into a volume")]
    NoSlices,

    #[error("Inconsistent slice dimensions")]
    InconsistentDimensions,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Figment(#[from] Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Figment(Box::new(err))
    }
}
