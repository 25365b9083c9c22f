use crate::{
    cancel::{CancelToken, PassError},
    chunk_grid::{ChunkLayout, SliceBuffer, SliceSnapshot, empty_chunk},
    enums::InterpolationMethod,
    interpolator::Interpolator,
    lowres::LowResVolume,
    progress::{Progress, ProgressCell, refinement_fraction},
    volume::VolumeDescriptor,
    volume_loader::{SourceOpener, VoxelSource},
};

use glam::{Quat, Vec3};
use log::{debug, info, warn};
use rayon::prelude::*;
use std::sync::Arc;
use web_time::Instant;

/// Everything one epoch needs to fill the slice, captured when the epoch
/// starts. Later setter calls never change a request in flight.
#[derive(Clone, Debug)]
pub struct SliceRequest {
    pub epoch: u64,
    pub descriptor: Arc<VolumeDescriptor>,
    pub rotation: Quat,
    /// Offset of the plane from the volume centre along the view axis.
    pub depth: f32,
    pub method: InterpolationMethod,
    pub target_scale: f32,
    pub chunks_per_dim: usize,
    pub visibility: Arc<[bool]>,
}

impl SliceRequest {
    pub fn is_visible(&self, index: usize) -> bool {
        self.visibility.get(index).copied().unwrap_or(false)
    }

    pub fn visible_chunks(&self) -> usize {
        self.visibility.iter().filter(|visible| **visible).count()
    }

    pub fn layout(&self, scale: f32) -> ChunkLayout {
        ChunkLayout::for_scale(&self.descriptor.shape, self.chunks_per_dim, scale)
    }

    /// Voxel index-space position of a point on the unrotated slice plane, or
    /// `None` when the rotated point lies outside the volume.
    ///
    /// The volume is centred on the origin: `x = w/2 + X`, `y = h/2 - Y`,
    /// `z = d/2 + Z`, clamped to the last index of each axis.
    pub fn source_position(&self, plane: Vec3) -> Option<Vec3> {
        let shape = self.descriptor.shape;
        let half = shape.half_extents();
        let position = self.rotation * plane;
        if position.abs().cmpgt(half).any() {
            return None;
        }
        let index = Vec3::new(half.x + position.x, half.y - position.y, half.z + position.z);
        Some(index.clamp(Vec3::ZERO, shape.max_index()))
    }
}

/// Fill every visible chunk from the low-res cache, one rayon task per chunk.
pub fn low_res_fill(request: &SliceRequest, lowres: &LowResVolume) -> SliceSnapshot {
    let layout = request.layout(lowres.scale());
    let byte_size = request.descriptor.byte_size;
    let chunk_count = request.chunks_per_dim * request.chunks_per_dim;

    let chunks = (0..chunk_count)
        .into_par_iter()
        .map(|index| {
            if !request.is_visible(index) {
                return empty_chunk();
            }
            let mut chunk = vec![0u8; layout.texels_per_chunk() * byte_size];
            for (texel, out) in chunk.chunks_exact_mut(byte_size).enumerate() {
                let row = texel / layout.chunk_size;
                let column = texel % layout.chunk_size;
                let plane = layout.plane_position(index, column, row, request.depth);
                if let Some(position) = request.source_position(plane) {
                    lowres.copy_nearest(position, out);
                }
            }
            Arc::from(chunk)
        })
        .collect();

    SliceSnapshot::new(request.epoch, &layout, byte_size, chunks)
}

/// One full-resolution pass at `scale`, sampling `source` with the request's
/// interpolation method. `chunk_done` is called after each visible chunk.
///
/// # Errors
///
/// [`PassError::Cancelled`] as soon as `cancel` fires (checked every texel),
/// or the first source error. Either way nothing is returned to publish.
pub fn refine_pass(
    request: &SliceRequest,
    scale: f32,
    source: &mut dyn VoxelSource,
    cancel: &CancelToken,
    mut chunk_done: impl FnMut(usize),
) -> Result<SliceSnapshot, PassError> {
    let layout = request.layout(scale);
    let byte_size = request.descriptor.byte_size;
    let chunk_count = request.chunks_per_dim * request.chunks_per_dim;
    let mut chunks = Vec::with_capacity(chunk_count);
    let mut done = 0;

    for index in 0..chunk_count {
        if !request.is_visible(index) {
            chunks.push(empty_chunk());
            continue;
        }
        let mut chunk = vec![0u8; layout.texels_per_chunk() * byte_size];
        for (texel, out) in chunk.chunks_exact_mut(byte_size).enumerate() {
            if cancel.is_cancelled() {
                return Err(PassError::Cancelled);
            }
            let row = texel / layout.chunk_size;
            let column = texel % layout.chunk_size;
            let plane = layout.plane_position(index, column, row, request.depth);
            if let Some(position) = request.source_position(plane) {
                Interpolator::sample(source, position, request.method, out)?;
            }
        }
        chunks.push(Arc::from(chunk));
        done += 1;
        chunk_done(done);
    }

    Ok(SliceSnapshot::new(request.epoch, &layout, byte_size, chunks))
}

/// The asynchronous part of an epoch: passes at increasing scales, each
/// published only when it finished and the epoch is still current.
pub struct RefinementJob {
    request: Arc<SliceRequest>,
    scales: Vec<f32>,
    cancel: CancelToken,
}

impl RefinementJob {
    pub fn new(request: Arc<SliceRequest>, scales: Vec<f32>, cancel: CancelToken) -> Self {
        Self {
            request,
            scales,
            cancel,
        }
    }

    pub fn scales(&self) -> &[f32] {
        &self.scales
    }

    /// Run all passes in order. Failures end the chain and are reported
    /// through `progress`; cancellation ends it silently.
    pub fn run(self, opener: &SourceOpener, buffer: &SliceBuffer, progress: &ProgressCell) {
        let started = Instant::now();
        let epoch = self.request.epoch;
        let visible = self.request.visible_chunks();
        let Some(final_iteration) = self.scales.len().checked_sub(1) else {
            return;
        };

        for (iteration, &scale) in self.scales.iter().enumerate() {
            if self.cancel.is_cancelled() {
                debug!("epoch {epoch} cancelled before pass {iteration}");
                return;
            }
            let is_final = iteration == final_iteration;
            debug!("epoch {epoch}: pass {iteration} at scale {scale}");

            let result = opener(self.request.descriptor.as_ref())
                .map_err(PassError::from)
                .and_then(|mut source| {
                    refine_pass(&self.request, scale, source.as_mut(), &self.cancel, |done| {
                        // 100% is only reached by publishing the last pass
                        if !(is_final && done == visible) {
                            let fraction =
                                refinement_fraction(iteration, done, visible, final_iteration);
                            progress.update(epoch, Progress::LoadingSlice { fraction });
                        }
                    })
                });

            match result {
                Ok(snapshot) => {
                    if !buffer.publish_unless_cancelled(snapshot, &self.cancel) {
                        debug!("epoch {epoch} superseded, pass {iteration} dropped");
                        return;
                    }
                    debug!("epoch {epoch}: published pass {iteration}");
                    if !is_final {
                        let fraction =
                            refinement_fraction(iteration + 1, 0, visible, final_iteration);
                        progress.update(epoch, Progress::LoadingSlice { fraction });
                    }
                }
                Err(PassError::Cancelled) => {
                    debug!("epoch {epoch} cancelled during pass {iteration}");
                    return;
                }
                Err(PassError::Source(error)) => {
                    warn!("epoch {epoch}: pass {iteration} failed: {error}");
                    progress.update(
                        epoch,
                        Progress::Failed {
                            message: error.to_string(),
                        },
                    );
                    return;
                }
            }
        }

        let elapsed = started.elapsed();
        info!("epoch {epoch} refined to scale {} in {elapsed:?}", self.request.target_scale);
        progress.update(
            epoch,
            Progress::Completed {
                elapsed: Some(elapsed),
            },
        );
    }
}
