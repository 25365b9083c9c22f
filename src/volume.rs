use crate::enums::ByteOrder;

use glam::Vec3;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Sample widths the sampler knows how to decode and pack.
pub const SUPPORTED_BYTE_SIZES: [usize; 3] = [1, 2, 4];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("volume dimensions must be non-zero, got {width}x{height}x{depth}")]
    EmptyVolume {
        width: usize,
        height: usize,
        depth: usize,
    },

    #[error("unsupported sample size of {0} bytes, expected 1, 2 or 4")]
    UnsupportedByteSize(usize),
}

/// Voxel counts along x, y and z.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VolumeShape {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
}

impl VolumeShape {
    pub fn new(width: usize, height: usize, depth: usize) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }

    pub fn voxel_count(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.depth as u64
    }

    /// Half of each dimension, the bounds of the volume around its centre.
    pub fn half_extents(&self) -> Vec3 {
        Vec3::new(
            self.width as f32 / 2.0,
            self.height as f32 / 2.0,
            self.depth as f32 / 2.0,
        )
    }

    /// Largest valid index on each axis.
    pub fn max_index(&self) -> Vec3 {
        Vec3::new(
            self.width.saturating_sub(1) as f32,
            self.height.saturating_sub(1) as f32,
            self.depth.saturating_sub(1) as f32,
        )
    }

    pub fn diagonal(&self) -> f32 {
        let (w, h, d) = (self.width as f32, self.height as f32, self.depth as f32);
        (w * w + h * h + d * d).sqrt()
    }

    /// Side of the square slice plane: the diagonal rounded up to a power of two.
    pub fn max_dist(&self) -> usize {
        (self.diagonal().ceil() as usize).max(1).next_power_of_two()
    }

    /// Shape of the volume resampled by `scale`, truncating each axis and
    /// keeping at least one voxel.
    pub fn scaled(&self, scale: f32) -> VolumeShape {
        let axis = |n: usize| ((n as f32 * scale) as usize).max(1);
        VolumeShape::new(axis(self.width), axis(self.height), axis(self.depth))
    }
}

/// Where the voxels of a volume come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// Packed voxels, row-major with x varying fastest.
    Raw(PathBuf),
    /// One image per z-slice, selected by a filename prefix.
    ImageSequence { directory: PathBuf, template: String },
    /// Multi-page TIFF, page z holding slice z.
    Tiff3D(PathBuf),
}

impl SourceKind {
    pub fn path(&self) -> &Path {
        match self {
            SourceKind::Raw(path) | SourceKind::Tiff3D(path) => path,
            SourceKind::ImageSequence { directory, .. } => directory,
        }
    }

    pub fn with_path(&self, path: PathBuf) -> SourceKind {
        match self {
            SourceKind::Raw(_) => SourceKind::Raw(path),
            SourceKind::Tiff3D(_) => SourceKind::Tiff3D(path),
            SourceKind::ImageSequence { template, .. } => SourceKind::ImageSequence {
                directory: path,
                template: template.clone(),
            },
        }
    }
}

/// Shape and storage format of a volume. Replacing any field invalidates
/// everything derived from it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeDescriptor {
    pub shape: VolumeShape,
    pub byte_size: usize,
    pub byte_order: ByteOrder,
    pub source: SourceKind,
}

impl VolumeDescriptor {
    pub fn raw(path: impl Into<PathBuf>, shape: VolumeShape, byte_size: usize) -> Self {
        Self {
            shape,
            byte_size,
            byte_order: ByteOrder::default(),
            source: SourceKind::Raw(path.into()),
        }
    }

    pub fn image_sequence(
        directory: impl Into<PathBuf>,
        template: impl Into<String>,
        shape: VolumeShape,
        byte_size: usize,
    ) -> Self {
        Self {
            shape,
            byte_size,
            byte_order: ByteOrder::default(),
            source: SourceKind::ImageSequence {
                directory: directory.into(),
                template: template.into(),
            },
        }
    }

    pub fn tiff_stack(path: impl Into<PathBuf>, shape: VolumeShape, byte_size: usize) -> Self {
        Self {
            shape,
            byte_size,
            byte_order: ByteOrder::default(),
            source: SourceKind::Tiff3D(path.into()),
        }
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    pub fn validate(&self) -> Result<(), DescriptorError> {
        let VolumeShape {
            width,
            height,
            depth,
        } = self.shape;
        if width == 0 || height == 0 || depth == 0 {
            return Err(DescriptorError::EmptyVolume {
                width,
                height,
                depth,
            });
        }
        if !SUPPORTED_BYTE_SIZES.contains(&self.byte_size) {
            return Err(DescriptorError::UnsupportedByteSize(self.byte_size));
        }
        Ok(())
    }

    /// Size of the full-resolution volume in bytes.
    pub fn total_bytes(&self) -> u64 {
        self.shape.voxel_count() * self.byte_size as u64
    }
}

/// Smallest power of two that is `>= value`, never below one.
pub(crate) fn next_power_of_two(value: f32) -> f32 {
    if value <= 1.0 {
        return 1.0;
    }
    (value.ceil() as u64).next_power_of_two() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_dist_rounds_diagonal_up() {
        // 64^3 has a diagonal of ~110.9
        assert_eq!(VolumeShape::new(64, 64, 64).max_dist(), 128);
        assert_eq!(VolumeShape::new(1, 1, 1).max_dist(), 2);
    }

    #[test]
    fn scaled_shape_keeps_one_voxel() {
        let shape = VolumeShape::new(100, 3, 64).scaled(0.25);
        assert_eq!(shape, VolumeShape::new(25, 1, 16));
    }

    #[test]
    fn validate_rejects_bad_descriptors() {
        let shape = VolumeShape::new(4, 4, 4);
        assert_eq!(
            VolumeDescriptor::raw("a.raw", shape, 3).validate(),
            Err(DescriptorError::UnsupportedByteSize(3))
        );
        assert!(matches!(
            VolumeDescriptor::raw("a.raw", VolumeShape::new(4, 0, 4), 1).validate(),
            Err(DescriptorError::EmptyVolume { .. })
        ));
        assert!(VolumeDescriptor::raw("a.raw", shape, 2).validate().is_ok());
    }

    #[test]
    fn next_power_of_two_of_fractions() {
        assert_eq!(next_power_of_two(0.3), 1.0);
        assert_eq!(next_power_of_two(3.3), 4.0);
        assert_eq!(next_power_of_two(4.0), 4.0);
    }
}
