use crate::{
    chunk_grid::{MAX_CHUNKS_PER_DIM, MIN_CHUNKS_PER_DIM},
    enums::InterpolationMethod,
};

use thiserror::Error;

/// Default low-res cache budget, one megabyte.
pub const DEFAULT_LOW_LOD_BUDGET: u64 = 1 << 20;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("interpolation scale must be finite and greater than zero, got {0}")]
    InvalidScale(f32),

    #[error("chunk grid must have between 2 and 128 chunks per side, got {0}")]
    InvalidChunkGrid(usize),
}

/// Slicing settings that are independent of the volume itself.
#[derive(Clone, Debug, PartialEq)]
pub struct SlicerConfig {
    pub interpolation: InterpolationMethod,
    /// Finest sampling density the refinement chain works towards; 1 is full
    /// resolution.
    pub interpolation_scale: f32,
    /// Memory allowed for the low-res cache, in bytes.
    pub low_lod_budget: u64,
    /// Chunks per side of the slice plane. Derived from the volume when unset.
    pub chunks_per_dim: Option<usize>,
}

impl Default for SlicerConfig {
    fn default() -> Self {
        Self {
            interpolation: InterpolationMethod::default(),
            interpolation_scale: 1.0,
            low_lod_budget: DEFAULT_LOW_LOD_BUDGET,
            chunks_per_dim: None,
        }
    }
}

impl SlicerConfig {
    pub fn with_interpolation(mut self, interpolation: InterpolationMethod) -> Self {
        self.interpolation = interpolation;
        self
    }

    pub fn with_interpolation_scale(mut self, scale: f32) -> Self {
        self.interpolation_scale = scale;
        self
    }

    pub fn with_low_lod_budget(mut self, bytes: u64) -> Self {
        self.low_lod_budget = bytes;
        self
    }

    pub fn with_chunks_per_dim(mut self, chunks_per_dim: usize) -> Self {
        self.chunks_per_dim = Some(chunks_per_dim);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_scale(self.interpolation_scale)?;
        if let Some(n) = self.chunks_per_dim
            && !(MIN_CHUNKS_PER_DIM..=MAX_CHUNKS_PER_DIM).contains(&n)
        {
            return Err(ConfigError::InvalidChunkGrid(n));
        }
        Ok(())
    }
}

pub(crate) fn validate_scale(scale: f32) -> Result<(), ConfigError> {
    if scale.is_finite() && scale > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidScale(scale))
    }
}
