use crate::{
    cancel::{CancelToken, PassError},
    enums::InterpolationMethod,
    interpolator::Interpolator,
    volume::{VolumeDescriptor, VolumeShape, next_power_of_two},
    volume_loader::SourceOpener,
};

use glam::Vec3;
use log::info;
use ndarray::{Array4, ArrayView1, Axis, s};
use rayon::prelude::*;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use web_time::Instant;

/// Fully resident, uniformly down-sampled copy of a volume.
///
/// The scale is a power-of-two reciprocal so that full-resolution coordinates
/// map onto it with a plain multiply.
pub struct LowResVolume {
    descriptor: Arc<VolumeDescriptor>,
    scale: f32,
    shape: VolumeShape,
    // [z, y, x, byte], samples little-endian
    data: Array4<u8>,
}

impl LowResVolume {
    /// Largest power-of-two-reciprocal scale (at most 1) whose cache fits in
    /// `budget_bytes`.
    pub fn scale_for_budget(descriptor: &VolumeDescriptor, budget_bytes: u64) -> f32 {
        let ratio = budget_bytes as f64 / descriptor.total_bytes() as f64;
        if ratio >= 1.0 {
            return 1.0;
        }
        let shape = descriptor.shape;
        // below 1 / longest axis every axis is a single voxel anyway
        let longest = shape.width.max(shape.height).max(shape.depth) as f32;
        let reciprocal = (1.0 / ratio.cbrt() as f32).min(longest);
        (1.0 / next_power_of_two(reciprocal)).min(1.0)
    }

    /// Build the cache by nearest-neighbour sampling the full-resolution
    /// source, one rayon task per destination z-plane.
    ///
    /// `progress` receives the fraction of destination rows done.
    ///
    /// # Errors
    ///
    /// [`PassError::Cancelled`] once `cancel` fires (checked every row), or the
    /// first source error. Nothing is kept from a failed build.
    pub fn build(
        descriptor: Arc<VolumeDescriptor>,
        budget_bytes: u64,
        opener: &SourceOpener,
        cancel: &CancelToken,
        progress: &(dyn Fn(f32) + Sync),
    ) -> Result<Self, PassError> {
        let started = Instant::now();
        let scale = Self::scale_for_budget(&descriptor, budget_bytes);
        let shape = descriptor.shape.scaled(scale);
        let byte_size = descriptor.byte_size;
        let unit_size = 1.0 / scale;
        let max = descriptor.shape.max_index();
        let total_rows = shape.height * shape.depth;
        let rows_done = AtomicUsize::new(0);

        let mut data = Array4::<u8>::zeros((shape.depth, shape.height, shape.width, byte_size));
        data.axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .try_for_each(|(z, mut plane)| -> Result<(), PassError> {
                let mut source = opener(descriptor.as_ref())?;
                let mut sample = [0u8; 4];
                let sample = &mut sample[..byte_size];
                let source_z = (z as f32 * unit_size).min(max.z);

                for (y, mut row) in plane.outer_iter_mut().enumerate() {
                    if cancel.is_cancelled() {
                        return Err(PassError::Cancelled);
                    }
                    let source_y = (y as f32 * unit_size).min(max.y);
                    for (x, mut voxel) in row.outer_iter_mut().enumerate() {
                        let position =
                            Vec3::new((x as f32 * unit_size).min(max.x), source_y, source_z);
                        Interpolator::sample(
                            source.as_mut(),
                            position,
                            InterpolationMethod::NearestNeighbor,
                            sample,
                        )?;
                        voxel
                            .iter_mut()
                            .zip(sample.iter())
                            .for_each(|(dst, src)| *dst = *src);
                    }
                    let done = rows_done.fetch_add(1, Ordering::Relaxed) + 1;
                    progress(done as f32 / total_rows as f32);
                }
                Ok(())
            })?;

        info!(
            "built low-res model at scale {scale} ({}x{}x{}, {} bytes) in {:?}",
            shape.width,
            shape.height,
            shape.depth,
            data.len(),
            started.elapsed()
        );

        Ok(Self {
            descriptor,
            scale,
            shape,
            data,
        })
    }

    pub fn descriptor(&self) -> &Arc<VolumeDescriptor> {
        &self.descriptor
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Distance between neighbouring cache voxels in full-resolution voxels.
    pub fn unit_size(&self) -> f32 {
        1.0 / self.scale
    }

    pub fn shape(&self) -> VolumeShape {
        self.shape
    }

    pub fn byte_size(&self) -> usize {
        self.descriptor.byte_size
    }

    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }

    /// Sample bytes of cache voxel `(x, y, z)`.
    pub fn voxel(&self, x: usize, y: usize, z: usize) -> ArrayView1<'_, u8> {
        self.data.slice(s![z, y, x, ..])
    }

    /// Copy the cache voxel nearest to a full-resolution index-space position.
    pub(crate) fn copy_nearest(&self, position: Vec3, out: &mut [u8]) {
        let max = self.shape.max_index();
        let index = |coordinate: f32, max: f32| {
            Interpolator::round_half_up(coordinate * self.scale).min(max as usize)
        };
        let voxel = self.voxel(
            index(position.x, max.x),
            index(position.y, max.y),
            index(position.z, max.z),
        );
        out.iter_mut()
            .zip(voxel.iter())
            .for_each(|(dst, src)| *dst = *src);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        enums::ByteOrder,
        volume_loader::{MemoryVolume, SourceError, VoxelSource},
    };
    use std::sync::Mutex;

    fn ramp_descriptor(side: usize) -> (Arc<VolumeDescriptor>, MemoryVolume) {
        let shape = VolumeShape::new(side, side, side);
        let data: Vec<u8> = (0..shape.voxel_count() as usize)
            .map(|index| (index % side) as u8)
            .collect();
        let volume = MemoryVolume::new(data, shape, 1, ByteOrder::LittleEndian)
            .expect("buffer should match shape");
        (Arc::new(VolumeDescriptor::raw("ramp.raw", shape, 1)), volume)
    }

    #[test]
    fn scale_stays_within_budget() {
        let small = VolumeDescriptor::raw("a.raw", VolumeShape::new(64, 64, 64), 1);
        assert_eq!(LowResVolume::scale_for_budget(&small, 1 << 20), 1.0);

        let large = VolumeDescriptor::raw("b.raw", VolumeShape::new(256, 256, 256), 1);
        assert_eq!(LowResVolume::scale_for_budget(&large, 1 << 20), 0.25);

        let wide = VolumeDescriptor::raw("c.raw", VolumeShape::new(128, 128, 128), 2);
        let scale = LowResVolume::scale_for_budget(&wide, 1 << 20);
        assert_eq!(scale, 0.5);
        assert!((scale as f64).powi(3) * wide.total_bytes() as f64 <= (1 << 20) as f64);

        let starved = LowResVolume::scale_for_budget(&large, 0);
        assert_eq!(starved, 1.0 / 256.0);
        assert_eq!(large.shape.scaled(starved), VolumeShape::new(1, 1, 1));
    }

    #[test]
    fn build_downsamples_by_nearest_neighbour() {
        let (descriptor, volume) = ramp_descriptor(16);
        let opener = move |_: &VolumeDescriptor| -> Result<Box<dyn VoxelSource>, SourceError> {
            Ok(Box::new(volume.clone()))
        };
        let last_progress = Mutex::new(0f32);
        let progress = |fraction: f32| {
            let mut last = last_progress.lock().expect("progress lock");
            *last = last.max(fraction);
        };

        // 16^3 bytes with a budget just over an eighth: every other voxel
        let lowres = LowResVolume::build(descriptor, 600, &opener, &CancelToken::new(), &progress)
            .expect("should have built model");
        assert_eq!(lowres.scale(), 0.5);
        assert_eq!(lowres.shape(), VolumeShape::new(8, 8, 8));
        assert_eq!(lowres.size_bytes(), 512);
        for x in 0..8 {
            assert_eq!(lowres.voxel(x, 3, 5)[0], (2 * x) as u8);
        }
        assert_eq!(*last_progress.lock().expect("progress lock"), 1.0);

        let mut out = [0u8; 1];
        lowres.copy_nearest(Vec3::new(9.0, 0.0, 15.0), &mut out);
        assert_eq!(out, [10]);
    }

    #[test]
    fn cancelled_build_returns_nothing() {
        let (descriptor, volume) = ramp_descriptor(8);
        let opener = move |_: &VolumeDescriptor| -> Result<Box<dyn VoxelSource>, SourceError> {
            Ok(Box::new(volume.clone()))
        };
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = LowResVolume::build(descriptor, 1 << 20, &opener, &cancel, &|_: f32| {});
        assert!(matches!(result, Err(PassError::Cancelled)));
    }

    #[test]
    fn source_errors_fail_the_build() {
        let (descriptor, _) = ramp_descriptor(8);
        let opener = |_: &VolumeDescriptor| -> Result<Box<dyn VoxelSource>, SourceError> {
            Err(SourceError::OutOfBounds { x: 0, y: 0, z: 0 })
        };

        let result =
            LowResVolume::build(descriptor, 1 << 20, &opener, &CancelToken::new(), &|_: f32| {});
        assert!(matches!(result, Err(PassError::Source(_))));
    }
}
