use crate::{
    cancel::{CancelToken, PassError},
    chunk_grid::{ChunkGrid, ChunkLayout, SliceBuffer, SliceSnapshot, empty_chunk},
    config::{ConfigError, SlicerConfig, validate_scale},
    enums::{ByteOrder, InterpolationMethod},
    lowres::LowResVolume,
    progress::{Progress, ProgressCell, pass_scales},
    scheduler::{RefinementJob, SliceRequest, low_res_fill},
    volume::{DescriptorError, SourceKind, VolumeDescriptor, VolumeShape},
    volume_loader::{SourceError, SourceOpener, VolumeLoader},
};

use glam::Quat;
use log::{debug, info, warn};
use std::{path::PathBuf, sync::Arc};
use thiserror::Error;
use tokio::{runtime::Runtime, task::JoinHandle};

#[derive(Debug, Error)]
pub enum SlicerError {
    #[error("no volume has been configured")]
    NotConfigured,

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("model build was cancelled")]
    BuildCancelled,

    #[error("could not start refinement runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

struct Refinement {
    cancel: CancelToken,
    handle: JoinHandle<()>,
}

/// Progressive, out-of-core slicing of one volume.
///
/// Every change to the volume, the view or the sampling settings starts a new
/// epoch: the slice is refilled from the low-res cache on the calling thread,
/// then refined in the background towards the configured interpolation
/// scale. Renderers read the result with [`VolumeSlicer::chunk`] or through
/// [`VolumeSlicer::buffer`].
pub struct VolumeSlicer {
    config: SlicerConfig,
    /// Latest requested volume, which may differ from the one the cache was
    /// built from if its build failed.
    descriptor: Option<Arc<VolumeDescriptor>>,
    lowres: Option<Arc<LowResVolume>>,
    grid: ChunkGrid,
    rotation: Quat,
    depth: f32,
    epoch: u64,
    buffer: Arc<SliceBuffer>,
    progress: Arc<ProgressCell>,
    opener: Arc<SourceOpener>,
    model_cancel: CancelToken,
    refinement: Option<Refinement>,
    runtime: Runtime,
}

impl VolumeSlicer {
    /// Slicer reading volumes from disk.
    pub fn new(config: SlicerConfig) -> Result<Self, SlicerError> {
        Self::with_opener(config, Arc::new(VolumeLoader::open))
    }

    /// Slicer reading volumes through `opener`, for sources that are not
    /// files on disk.
    pub fn with_opener(
        config: SlicerConfig,
        opener: Arc<SourceOpener>,
    ) -> Result<Self, SlicerError> {
        config.validate()?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .thread_name("volume-slicer-refinement")
            .build()
            .map_err(SlicerError::Runtime)?;
        let grid = ChunkGrid::new(config.chunks_per_dim.unwrap_or_default());

        Ok(Self {
            config,
            descriptor: None,
            lowres: None,
            grid,
            rotation: Quat::IDENTITY,
            depth: 0.0,
            epoch: 0,
            buffer: Arc::new(SliceBuffer::new(SliceSnapshot::empty(0, 1))),
            progress: Arc::new(ProgressCell::default()),
            opener,
            model_cancel: CancelToken::new(),
            refinement: None,
            runtime,
        })
    }

    /// Set the volume to slice and build its low-res cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor is invalid or the cache could not be
    /// built. The previous cache, if any, stays in use.
    pub fn configure(&mut self, descriptor: VolumeDescriptor) -> Result<(), SlicerError> {
        descriptor.validate()?;
        self.descriptor = Some(Arc::new(descriptor));
        self.rebuild_model()
    }

    pub fn set_interpolation_method(&mut self, method: InterpolationMethod) {
        self.config.interpolation = method;
        self.start_epoch();
    }

    pub fn set_interpolation_scale(&mut self, scale: f32) -> Result<(), SlicerError> {
        validate_scale(scale)?;
        self.config.interpolation_scale = scale;
        self.start_epoch();
        Ok(())
    }

    pub fn set_low_lod_budget(&mut self, bytes: u64) -> Result<(), SlicerError> {
        self.config.low_lod_budget = bytes;
        self.rebuild_model()
    }

    pub fn set_endianness(&mut self, big_endian: bool) -> Result<(), SlicerError> {
        self.update_descriptor(|descriptor| {
            descriptor.byte_order = ByteOrder::from_big_endian(big_endian);
        })
    }

    /// Change the filename prefix of an image sequence. Ignored for other
    /// source kinds.
    pub fn set_file_template(&mut self, template: &str) -> Result<(), SlicerError> {
        let is_sequence = matches!(
            self.descriptor.as_deref(),
            Some(VolumeDescriptor {
                source: SourceKind::ImageSequence { .. },
                ..
            })
        );
        if !is_sequence {
            warn!("ignoring file template {template:?}: source is not an image sequence");
            return Ok(());
        }
        self.update_descriptor(|descriptor| {
            if let SourceKind::ImageSequence { template: current, .. } = &mut descriptor.source {
                *current = template.to_owned();
            }
        })
    }

    /// Point the current source kind at another file or directory.
    pub fn set_file_path(&mut self, path: impl Into<PathBuf>) -> Result<(), SlicerError> {
        let path = path.into();
        self.update_descriptor(|descriptor| {
            descriptor.source = descriptor.source.with_path(path);
        })
    }

    pub fn set_byte_size(&mut self, byte_size: usize) -> Result<(), SlicerError> {
        self.update_descriptor(|descriptor| descriptor.byte_size = byte_size)
    }

    pub fn set_source(&mut self, source: SourceKind) -> Result<(), SlicerError> {
        self.update_descriptor(|descriptor| descriptor.source = source)
    }

    pub fn change_slice_depth(&mut self, depth: f32) {
        self.depth = depth;
        self.start_epoch();
    }

    pub fn change_slice_rotation(&mut self, rotation: Quat) {
        self.rotation = rotation.normalize();
        self.start_epoch();
    }

    /// Takes effect with the next epoch.
    pub fn set_chunk_visibility(&mut self, index: usize, visible: bool) {
        self.grid.set_visible(index, visible);
    }

    /// Mark visible exactly the chunks that can intersect the volume under the
    /// current view. Takes effect with the next epoch.
    pub fn update_chunk_visibility(&mut self) {
        if let Some(descriptor) = self.active_descriptor().cloned() {
            self.grid
                .cull_to_volume(&descriptor, self.rotation, self.depth);
        }
    }

    /// Bytes of chunk `index` in the published slice; empty for invisible or
    /// unknown chunks.
    pub fn chunk(&self, index: usize) -> Arc<[u8]> {
        self.buffer.chunk(index).unwrap_or_else(empty_chunk)
    }

    pub fn chunk_texel_dimension(&self, index: usize) -> usize {
        self.buffer.chunk_texel_dimension(index)
    }

    pub fn buffer(&self) -> Arc<SliceBuffer> {
        self.buffer.clone()
    }

    pub fn progress(&self) -> Progress {
        self.progress.get()
    }

    pub fn status(&self) -> String {
        self.progress.get().to_string()
    }

    /// Whether a low-res cache exists, which slice interaction depends on.
    pub fn is_low_res_ready(&self) -> bool {
        self.lowres.is_some()
    }

    pub fn is_refining(&self) -> bool {
        self.refinement
            .as_ref()
            .is_some_and(|refinement| !refinement.handle.is_finished())
    }

    /// Block until the current refinement chain has finished, was cancelled
    /// or failed.
    pub fn wait_for_refinement(&mut self) {
        if let Some(refinement) = self.refinement.take()
            && let Err(error) = self.runtime.block_on(refinement.handle)
        {
            warn!("refinement task ended abnormally: {error}");
        }
    }

    /// Token that aborts the next or in-flight low-res build. Builds run on
    /// the caller's thread, so fetch the token before starting one.
    pub fn model_build_canceller(&self) -> CancelToken {
        self.model_cancel.clone()
    }

    pub fn config(&self) -> &SlicerConfig {
        &self.config
    }

    /// The volume slices are taken from: the one the cache was built from.
    pub fn active_descriptor(&self) -> Option<&Arc<VolumeDescriptor>> {
        self.lowres
            .as_ref()
            .map(|lowres| lowres.descriptor())
            .or(self.descriptor.as_ref())
    }

    pub fn low_res_scale(&self) -> Option<f32> {
        self.lowres.as_ref().map(|lowres| lowres.scale())
    }

    pub fn chunks_per_dim(&self) -> usize {
        self.grid.chunks_per_dim()
    }

    /// Side of the square slice plane in full-resolution voxels.
    pub fn max_dist(&self) -> usize {
        self.active_descriptor()
            .map_or(0, |descriptor| descriptor.shape.max_dist())
    }

    /// Half the diagonal of one full-resolution chunk.
    pub fn chunk_dist(&self) -> f32 {
        self.active_descriptor().map_or(0.0, |descriptor| {
            ChunkLayout::for_scale(&descriptor.shape, self.grid.chunks_per_dim(), 1.0)
                .chunk_dist()
        })
    }

    pub fn byte_size(&self) -> usize {
        self.active_descriptor()
            .map_or(0, |descriptor| descriptor.byte_size)
    }

    fn update_descriptor(
        &mut self,
        change: impl FnOnce(&mut VolumeDescriptor),
    ) -> Result<(), SlicerError> {
        let mut descriptor = self
            .descriptor
            .as_deref()
            .cloned()
            .ok_or(SlicerError::NotConfigured)?;
        change(&mut descriptor);
        self.configure(descriptor)
    }

    /// Resize the grid for the volume being sliced; visibility survives when
    /// the size stays the same.
    fn fit_grid(&mut self, shape: &VolumeShape) {
        let n = self
            .config
            .chunks_per_dim
            .unwrap_or_else(|| ChunkGrid::chunks_per_dim_for(shape));
        if n != self.grid.chunks_per_dim() {
            debug!("slice plane split into {n}x{n} chunks");
            self.grid = ChunkGrid::new(n);
        }
    }

    fn rebuild_model(&mut self) -> Result<(), SlicerError> {
        let Some(descriptor) = self.descriptor.clone() else {
            return Ok(());
        };
        if let Some(refinement) = &self.refinement {
            refinement.cancel.cancel();
        }

        self.epoch += 1;
        let epoch = self.epoch;
        self.progress
            .begin(epoch, Progress::CreatingModel { fraction: 0.0 });
        let progress = self.progress.clone();
        let report = move |fraction: f32| {
            progress.update(epoch, Progress::CreatingModel { fraction });
        };

        let cancel = std::mem::take(&mut self.model_cancel);
        match LowResVolume::build(
            descriptor,
            self.config.low_lod_budget,
            self.opener.as_ref(),
            &cancel,
            &report,
        ) {
            Ok(lowres) => {
                self.fit_grid(&lowres.descriptor().shape);
                self.lowres = Some(Arc::new(lowres));
                self.start_epoch();
                Ok(())
            }
            Err(PassError::Cancelled) => {
                info!("low-res model build cancelled");
                if self.lowres.is_some() {
                    self.start_epoch();
                } else {
                    self.progress.begin(epoch, Progress::Idle);
                }
                Err(SlicerError::BuildCancelled)
            }
            Err(PassError::Source(error)) => {
                warn!("low-res model build failed: {error}");
                self.progress.update(
                    epoch,
                    Progress::Failed {
                        message: error.to_string(),
                    },
                );
                Err(error.into())
            }
        }
    }

    /// Refill the slice from the cache and launch refinement for the current
    /// settings. Does nothing until a cache exists.
    fn start_epoch(&mut self) {
        let Some(lowres) = self.lowres.clone() else {
            debug!("no low-res model yet, slice request ignored");
            return;
        };
        // stop sampling for the old epoch while the new fill runs
        if let Some(refinement) = &self.refinement {
            refinement.cancel.cancel();
        }

        self.epoch += 1;
        let epoch = self.epoch;
        let request = Arc::new(SliceRequest {
            epoch,
            descriptor: lowres.descriptor().clone(),
            rotation: self.rotation,
            depth: self.depth,
            method: self.config.interpolation,
            target_scale: self.config.interpolation_scale,
            chunks_per_dim: self.grid.chunks_per_dim(),
            visibility: self.grid.visibility(),
        });
        let snapshot = low_res_fill(&request, &lowres);
        let scales = pass_scales(lowres.scale(), request.target_scale);

        let previous = self.refinement.take();
        let initial = if scales.is_empty() {
            Progress::Completed { elapsed: None }
        } else {
            Progress::LoadingSlice { fraction: 0.0 }
        };
        self.buffer.publish_after(snapshot, || {
            if let Some(previous) = &previous {
                previous.cancel.cancel();
            }
            self.progress.begin(epoch, initial);
        });
        debug!(
            "epoch {epoch}: low-res fill at scale {} published, {} refinement passes",
            lowres.scale(),
            scales.len()
        );

        if scales.is_empty() {
            return;
        }
        let cancel = CancelToken::new();
        let job = RefinementJob::new(request, scales, cancel.clone());
        let opener = self.opener.clone();
        let buffer = self.buffer.clone();
        let progress = self.progress.clone();
        let handle = self
            .runtime
            .spawn_blocking(move || job.run(opener.as_ref(), &buffer, &progress));
        self.refinement = Some(Refinement { cancel, handle });
    }
}

impl Drop for VolumeSlicer {
    fn drop(&mut self) {
        if let Some(refinement) = &self.refinement {
            refinement.cancel.cancel();
        }
    }
}
