//! # Volume slicer
//!
//! This crate cuts arbitrarily oriented 2-D slices out of 3-D scalar volumes
//! that are too large to keep in memory. The volume is read from a raw file,
//! an image sequence or a multi-page TIFF, and the slice plane is split into
//! square chunks that a renderer can draw as independent textures.
//!
//! Slicing is progressive. A down-sampled copy of the volume sized to a
//! memory budget is kept resident, so every change of view is answered
//! immediately from it. A background task then re-samples the visible chunks
//! from the full-resolution source, doubling the sampling density with each
//! pass until the requested scale is reached. Passes are published whole and
//! any new request cancels the work of the previous one.
//!
//! Samples can be taken with three kernels:
//!  - Nearest neighbour
//!  - Trilinear
//!  - Tricubic (Catmull-Rom), falling back to trilinear at the border
//!
//! Samples are 1, 2 or 4 bytes wide (unsigned byte, unsigned 16-bit and
//! 32-bit float) and raw files may be big-endian. Chunk bytes are always
//! little-endian.
//!
//! # Examples
//!
//! ## Slicing a raw volume
//!
//! Open a 512³ volume of 16-bit samples, turn the view and wait for the
//! slice to be refined to full resolution.
//!
//! ```no_run
//! # use volume_slicer::{SlicerConfig, VolumeDescriptor, VolumeShape, VolumeSlicer};
//! # use glam::Quat;
//! let mut slicer = VolumeSlicer::new(SlicerConfig::default())
//!     .expect("should have created slicer");
//! slicer
//!     .configure(VolumeDescriptor::raw("ct.raw", VolumeShape::new(512, 512, 512), 2))
//!     .expect("should have built low-res model");
//! slicer.change_slice_rotation(Quat::from_rotation_y(0.5));
//! slicer.wait_for_refinement();
//! println!("{}", slicer.status());
//! let first_chunk = slicer.chunk(0);
//! ```

pub mod cancel;
pub mod chunk_grid;
pub mod config;
pub mod enums;
mod interpolator;
pub mod lowres;
pub mod progress;
pub mod scheduler;
pub mod slicer;
pub mod volume;
pub mod volume_loader;

pub use cancel::CancelToken;
pub use chunk_grid::{ChunkGrid, ChunkLayout, SliceBuffer, SliceSnapshot};
pub use config::SlicerConfig;
pub use enums::{ByteOrder, InterpolationMethod};
pub use progress::Progress;
pub use slicer::{SlicerError, VolumeSlicer};
pub use volume::{SourceKind, VolumeDescriptor, VolumeShape};
pub use volume_loader::{MemoryVolume, SourceError, VolumeLoader, VoxelSource};
