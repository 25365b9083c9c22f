use crate::{
    cancel::CancelToken,
    volume::{VolumeDescriptor, VolumeShape},
};

use glam::{Quat, Vec3};
use log::warn;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub const MIN_CHUNKS_PER_DIM: usize = 2;
pub const MAX_CHUNKS_PER_DIM: usize = 128;

/// Full-resolution chunk side the derived grid aims for.
const TARGET_CHUNK_TEXELS: usize = 64;

/// Square partition of the slice plane into `N x N` chunks, indexed row by
/// row from the top-left chunk, with a visibility flag per chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkGrid {
    chunks_per_dim: usize,
    visibility: Vec<bool>,
}

impl ChunkGrid {
    /// A grid with every chunk visible.
    pub fn new(chunks_per_dim: usize) -> Self {
        let chunks_per_dim = chunks_per_dim.clamp(MIN_CHUNKS_PER_DIM, MAX_CHUNKS_PER_DIM);
        Self {
            chunks_per_dim,
            visibility: vec![true; chunks_per_dim * chunks_per_dim],
        }
    }

    /// Chunks per side derived from the volume diagonal.
    pub fn chunks_per_dim_for(shape: &VolumeShape) -> usize {
        (shape.max_dist() / TARGET_CHUNK_TEXELS).clamp(MIN_CHUNKS_PER_DIM, MAX_CHUNKS_PER_DIM)
    }

    pub fn chunks_per_dim(&self) -> usize {
        self.chunks_per_dim
    }

    pub fn len(&self) -> usize {
        self.visibility.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visibility.is_empty()
    }

    pub fn is_visible(&self, index: usize) -> bool {
        self.visibility.get(index).copied().unwrap_or(false)
    }

    /// Returns false when `index` is outside the grid.
    pub fn set_visible(&mut self, index: usize, visible: bool) -> bool {
        match self.visibility.get_mut(index) {
            Some(flag) => {
                *flag = visible;
                true
            }
            None => {
                warn!(
                    "chunk index {index} is outside a grid of {} chunks",
                    self.visibility.len()
                );
                false
            }
        }
    }

    pub fn visible_count(&self) -> usize {
        self.visibility.iter().filter(|visible| **visible).count()
    }

    pub fn visibility(&self) -> Arc<[bool]> {
        self.visibility.as_slice().into()
    }

    /// Mark chunks visible when their centre, rotated into the volume, lies
    /// within the half-extents grown by the chunk's half diagonal.
    pub fn cull_to_volume(&mut self, descriptor: &VolumeDescriptor, rotation: Quat, depth: f32) {
        let layout = ChunkLayout::for_scale(&descriptor.shape, self.chunks_per_dim, 1.0);
        let reach = descriptor.shape.half_extents() + Vec3::splat(layout.chunk_dist());
        let half_chunk = layout.chunk_size as f32 / 2.0;

        for (index, visible) in self.visibility.iter_mut().enumerate() {
            let corner = layout.plane_position(index, 0, 0, depth);
            let centre = corner + Vec3::new(half_chunk, half_chunk, 0.0);
            let position = rotation * centre;
            *visible = !position.abs().cmpgt(reach).any();
        }
    }
}

/// Chunk geometry of one resolution level.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChunkLayout {
    pub scale: f32,
    /// Distance between texels in full-resolution voxels.
    pub unit_size: f32,
    /// Chunk side in texels.
    pub chunk_size: usize,
    pub chunks_per_dim: usize,
}

impl ChunkLayout {
    pub fn for_scale(shape: &VolumeShape, chunks_per_dim: usize, scale: f32) -> Self {
        let max_dist = shape.scaled(scale).max_dist();
        Self {
            scale,
            unit_size: 1.0 / scale,
            chunk_size: (max_dist / chunks_per_dim).max(1),
            chunks_per_dim,
        }
    }

    pub fn texels_per_chunk(&self) -> usize {
        self.chunk_size * self.chunk_size
    }

    /// Half the diagonal of one chunk, in full-resolution voxels.
    pub fn chunk_dist(&self) -> f32 {
        let side = self.chunk_size as f32 * self.unit_size;
        (2.0 * side * side).sqrt() / 2.0
    }

    /// Position of texel `(column, row)` of chunk `index` on the slice plane,
    /// before rotation. The plane is centred on the origin; texel rows run
    /// towards +y so row 0 is the bottom of the chunk.
    pub fn plane_position(&self, index: usize, column: usize, row: usize, depth: f32) -> Vec3 {
        let n = self.chunks_per_dim;
        let chunk_row = (index / n) as f32;
        let chunk_column = (index % n) as f32;
        let half = n as f32 / 2.0;
        let span = self.chunk_size as f32 * self.unit_size;
        Vec3::new(
            (chunk_column - half) * span + column as f32 * self.unit_size,
            (half - chunk_row - 1.0) * span + row as f32 * self.unit_size,
            depth,
        )
    }
}

/// One complete, immutable set of chunk images.
#[derive(Debug)]
pub struct SliceSnapshot {
    /// Epoch that produced the snapshot.
    pub epoch: u64,
    pub scale: f32,
    pub chunk_size: usize,
    pub byte_size: usize,
    chunks: Vec<Arc<[u8]>>,
}

impl SliceSnapshot {
    pub fn new(
        epoch: u64,
        layout: &ChunkLayout,
        byte_size: usize,
        chunks: Vec<Arc<[u8]>>,
    ) -> Self {
        Self {
            epoch,
            scale: layout.scale,
            chunk_size: layout.chunk_size,
            byte_size,
            chunks,
        }
    }

    /// A snapshot where every chunk is empty.
    pub fn empty(chunk_count: usize, byte_size: usize) -> Self {
        Self {
            epoch: 0,
            scale: 0.0,
            chunk_size: 0,
            byte_size,
            chunks: vec![empty_chunk(); chunk_count],
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunk(&self, index: usize) -> Option<&Arc<[u8]>> {
        self.chunks.get(index)
    }

    /// Side length of chunk `index` in texels, 0 for empty chunks.
    pub fn texel_dimension(&self, index: usize) -> usize {
        match self.chunks.get(index) {
            Some(chunk) if !chunk.is_empty() => self.chunk_size,
            _ => 0,
        }
    }
}

pub(crate) fn empty_chunk() -> Arc<[u8]> {
    Arc::from(Vec::new())
}

/// The published slice. Readers get the current snapshot; writers swap in a
/// complete new one under the same lock, so a half-written pass is never
/// visible.
#[derive(Debug)]
pub struct SliceBuffer {
    active: Mutex<Arc<SliceSnapshot>>,
}

impl SliceBuffer {
    pub fn new(initial: SliceSnapshot) -> Self {
        Self {
            active: Mutex::new(Arc::new(initial)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Arc<SliceSnapshot>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> Arc<SliceSnapshot> {
        self.lock().clone()
    }

    /// Bytes of chunk `index` in the published snapshot.
    pub fn chunk(&self, index: usize) -> Option<Arc<[u8]>> {
        self.lock().chunk(index).cloned()
    }

    pub fn chunk_texel_dimension(&self, index: usize) -> usize {
        self.lock().texel_dimension(index)
    }

    /// Publish `snapshot` after running `before_swap` under the lock.
    pub(crate) fn publish_after(&self, snapshot: SliceSnapshot, before_swap: impl FnOnce()) {
        let mut active = self.lock();
        before_swap();
        *active = Arc::new(snapshot);
    }

    /// Publish `snapshot` unless `cancel` has fired; the check happens under
    /// the lock.
    pub(crate) fn publish_unless_cancelled(
        &self,
        snapshot: SliceSnapshot,
        cancel: &CancelToken,
    ) -> bool {
        let mut active = self.lock();
        if cancel.is_cancelled() {
            return false;
        }
        *active = Arc::new(snapshot);
        true
    }
}
