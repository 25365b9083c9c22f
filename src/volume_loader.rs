use crate::{
    enums::ByteOrder,
    volume::{DescriptorError, SourceKind, VolumeDescriptor, VolumeShape},
};

use image::GenericImageView;
use std::{
    fs::{self, File},
    io::{BufReader, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tiff::decoder::{Decoder, DecodingResult};

/// Decoded planes kept per source, enough for one tricubic neighbourhood.
const PLANE_CACHE_SIZE: usize = 4;

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "bmp", "tif", "tiff"];

/// Directory listings in error messages are cut after this many entries.
const LISTING_LIMIT: usize = 16;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("invalid volume descriptor: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error("raw file {} holds {actual} bytes, the volume needs {expected}", .path.display())]
    TruncatedRaw {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("voxel buffer holds {actual} bytes, the volume needs {expected}")]
    BufferTooSmall { expected: u64, actual: u64 },

    #[error("cannot list image directory {}: {source}", .directory.display())]
    UnreadableDirectory {
        directory: PathBuf,
        source: std::io::Error,
    },

    #[error("no image files starting with {template:?} in {}, directory contains: [{listing}]", .directory.display())]
    NoMatchingImages {
        directory: PathBuf,
        template: String,
        listing: String,
    },

    #[error("image sequence in {} has {found} frames but the volume depth is {depth}, matching files: [{listing}]", .directory.display())]
    MissingFrames {
        directory: PathBuf,
        found: usize,
        depth: usize,
        listing: String,
    },

    #[error("slice {index} is {actual_width}x{actual_height}, expected {width}x{height}")]
    InconsistentDimensions {
        index: usize,
        width: usize,
        height: usize,
        actual_width: usize,
        actual_height: usize,
    },

    #[error("voxel ({x}, {y}, {z}) is outside the volume")]
    OutOfBounds { x: usize, y: usize, z: usize },

    #[error("unsupported sample format in TIFF page {0}")]
    UnsupportedTiffFormat(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),
}

/// Random access to the samples of a full-resolution volume.
///
/// Implementations hand out raw sample bytes in [`VoxelSource::byte_order`];
/// decoding and byte swapping is left to the sampler.
pub trait VoxelSource: Send {
    fn shape(&self) -> VolumeShape;

    fn byte_size(&self) -> usize;

    fn byte_order(&self) -> ByteOrder;

    /// Copies `out.len() / byte_size` consecutive samples along x, starting at
    /// `(x, y, z)`. The run never crosses the end of a row.
    fn read_run(&mut self, x: usize, y: usize, z: usize, out: &mut [u8])
    -> Result<(), SourceError>;
}

/// Opens a fresh source for a descriptor. Every refinement pass and every
/// low-res build task opens its own handle.
pub type SourceOpener =
    dyn Fn(&VolumeDescriptor) -> Result<Box<dyn VoxelSource>, SourceError> + Send + Sync;

/// Byte offset of voxel `(x, y, z)` in a packed, x-fastest volume.
pub fn linear_index(shape: &VolumeShape, x: usize, y: usize, z: usize, byte_size: usize) -> u64 {
    let width = shape.width as u64;
    let height = shape.height as u64;
    (x as u64 + y as u64 * width + z as u64 * width * height) * byte_size as u64
}

pub struct VolumeLoader;

impl VolumeLoader {
    /// Open the source described by `descriptor`.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor is invalid, the raw file is too
    /// short, or the image sequence does not have enough matching frames.
    pub fn open(descriptor: &VolumeDescriptor) -> Result<Box<dyn VoxelSource>, SourceError> {
        descriptor.validate()?;
        let shape = descriptor.shape;
        let byte_size = descriptor.byte_size;

        match &descriptor.source {
            SourceKind::Raw(path) => Ok(Box::new(Self::open_raw(
                path,
                shape,
                byte_size,
                descriptor.byte_order,
            )?)),
            SourceKind::ImageSequence {
                directory,
                template,
            } => {
                let files = Self::list_image_sequence(directory, template)?;
                if files.len() < shape.depth {
                    return Err(SourceError::MissingFrames {
                        directory: directory.clone(),
                        found: files.len(),
                        depth: shape.depth,
                        listing: Self::listing(&files),
                    });
                }
                let reader = ImageSequenceReader {
                    files,
                    shape,
                    byte_size,
                };
                Ok(Box::new(PlaneVolume::new(reader, shape, byte_size)))
            }
            SourceKind::Tiff3D(path) => {
                let decoder = Decoder::new(BufReader::new(File::open(path)?))?;
                let reader = TiffStackReader {
                    decoder,
                    shape,
                    byte_size,
                };
                Ok(Box::new(PlaneVolume::new(reader, shape, byte_size)))
            }
        }
    }

    /// Open a raw volume file for random access.
    pub fn open_raw(
        path: impl AsRef<Path>,
        shape: VolumeShape,
        byte_size: usize,
        byte_order: ByteOrder,
    ) -> Result<RawVolume, SourceError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let expected = shape.voxel_count() * byte_size as u64;
        let actual = file.metadata()?.len();
        if actual < expected {
            return Err(SourceError::TruncatedRaw {
                path: path.to_owned(),
                expected,
                actual,
            });
        }

        Ok(RawVolume {
            file,
            shape,
            byte_size,
            byte_order,
        })
    }

    /// Image files in `directory` whose name starts with `template`, in
    /// natural order of their numeric suffix.
    pub fn list_image_sequence(
        directory: impl AsRef<Path>,
        template: &str,
    ) -> Result<Vec<PathBuf>, SourceError> {
        let directory = directory.as_ref();
        let entries: Vec<PathBuf> = fs::read_dir(directory)
            .map_err(|source| SourceError::UnreadableDirectory {
                directory: directory.to_owned(),
                source,
            })?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .collect();

        let mut frames: Vec<PathBuf> = entries
            .iter()
            .filter(|path| Self::is_image(path) && Self::file_name(path).starts_with(template))
            .cloned()
            .collect();

        if frames.is_empty() {
            return Err(SourceError::NoMatchingImages {
                directory: directory.to_owned(),
                template: template.to_owned(),
                listing: Self::listing(&entries),
            });
        }

        frames.sort_by(|a, b| {
            Self::numeric_suffix(a)
                .cmp(&Self::numeric_suffix(b))
                .then_with(|| a.cmp(b))
        });
        Ok(frames)
    }

    /// Decode slice `z` of an image sequence as a little-endian luma plane.
    pub fn read_image_plane(
        directory: impl AsRef<Path>,
        template: &str,
        z: usize,
        shape: VolumeShape,
        byte_size: usize,
    ) -> Result<Vec<u8>, SourceError> {
        let files = Self::list_image_sequence(directory, template)?;
        let path = files.get(z).ok_or(SourceError::OutOfBounds { x: 0, y: 0, z })?;
        Self::decode_image(path, z, shape, byte_size)
    }

    fn decode_image(
        path: &Path,
        index: usize,
        shape: VolumeShape,
        byte_size: usize,
    ) -> Result<Vec<u8>, SourceError> {
        let image = image::open(path)?;
        let (width, height) = image.dimensions();
        check_plane_dimensions(index, shape, width as usize, height as usize)?;

        let bytes = match byte_size {
            1 => image.to_luma8().into_raw(),
            2 => image
                .to_luma16()
                .into_raw()
                .into_iter()
                .flat_map(u16::to_le_bytes)
                .collect(),
            _ => image
                .to_luma32f()
                .into_raw()
                .into_iter()
                .flat_map(f32::to_le_bytes)
                .collect(),
        };
        Ok(bytes)
    }

    fn is_image(path: &Path) -> bool {
        path.extension()
            .and_then(|s| s.to_str())
            .is_some_and(|ext| {
                IMAGE_EXTENSIONS
                    .iter()
                    .any(|known| ext.eq_ignore_ascii_case(known))
            })
    }

    fn file_name(path: &Path) -> &str {
        path.file_name().and_then(|s| s.to_str()).unwrap_or_default()
    }

    /// Trailing digits of the file stem, 1 when there are none.
    fn numeric_suffix(path: &Path) -> u64 {
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        let prefix_len = stem.trim_end_matches(|c: char| c.is_ascii_digit()).len();
        stem[prefix_len..].parse().unwrap_or(1)
    }

    fn listing(paths: &[PathBuf]) -> String {
        let mut names: Vec<&str> = paths.iter().map(|path| Self::file_name(path)).collect();
        names.sort_unstable();
        let mut listing = names
            .iter()
            .take(LISTING_LIMIT)
            .copied()
            .collect::<Vec<_>>()
            .join(", ");
        if names.len() > LISTING_LIMIT {
            listing.push_str(&format!(", ... ({} more)", names.len() - LISTING_LIMIT));
        }
        listing
    }
}

fn check_plane_dimensions(
    index: usize,
    shape: VolumeShape,
    actual_width: usize,
    actual_height: usize,
) -> Result<(), SourceError> {
    if actual_width != shape.width || actual_height != shape.height {
        return Err(SourceError::InconsistentDimensions {
            index,
            width: shape.width,
            height: shape.height,
            actual_width,
            actual_height,
        });
    }
    Ok(())
}

/// Seekable raw volume file.
pub struct RawVolume {
    file: File,
    shape: VolumeShape,
    byte_size: usize,
    byte_order: ByteOrder,
}

impl VoxelSource for RawVolume {
    fn shape(&self) -> VolumeShape {
        self.shape
    }

    fn byte_size(&self) -> usize {
        self.byte_size
    }

    fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    fn read_run(
        &mut self,
        x: usize,
        y: usize,
        z: usize,
        out: &mut [u8],
    ) -> Result<(), SourceError> {
        let offset = linear_index(&self.shape, x, y, z, self.byte_size);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(out)?;
        Ok(())
    }
}

/// Volume whose voxels are already in memory, laid out like a raw file.
#[derive(Clone)]
pub struct MemoryVolume {
    data: Arc<[u8]>,
    shape: VolumeShape,
    byte_size: usize,
    byte_order: ByteOrder,
}

impl MemoryVolume {
    pub fn new(
        data: impl Into<Arc<[u8]>>,
        shape: VolumeShape,
        byte_size: usize,
        byte_order: ByteOrder,
    ) -> Result<Self, SourceError> {
        let data = data.into();
        let expected = shape.voxel_count() * byte_size as u64;
        if (data.len() as u64) < expected {
            return Err(SourceError::BufferTooSmall {
                expected,
                actual: data.len() as u64,
            });
        }
        Ok(Self {
            data,
            shape,
            byte_size,
            byte_order,
        })
    }
}

impl VoxelSource for MemoryVolume {
    fn shape(&self) -> VolumeShape {
        self.shape
    }

    fn byte_size(&self) -> usize {
        self.byte_size
    }

    fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    fn read_run(
        &mut self,
        x: usize,
        y: usize,
        z: usize,
        out: &mut [u8],
    ) -> Result<(), SourceError> {
        let start = linear_index(&self.shape, x, y, z, self.byte_size) as usize;
        let run = self
            .data
            .get(start..start + out.len())
            .ok_or(SourceError::OutOfBounds { x, y, z })?;
        out.copy_from_slice(run);
        Ok(())
    }
}

/// Decodes whole z-planes of a volume stored as 2-D images.
trait PlaneReader: Send {
    fn read_plane(&mut self, z: usize) -> Result<Vec<u8>, SourceError>;
}

struct ImageSequenceReader {
    files: Vec<PathBuf>,
    shape: VolumeShape,
    byte_size: usize,
}

impl PlaneReader for ImageSequenceReader {
    fn read_plane(&mut self, z: usize) -> Result<Vec<u8>, SourceError> {
        let path = self
            .files
            .get(z)
            .ok_or(SourceError::OutOfBounds { x: 0, y: 0, z })?;
        VolumeLoader::decode_image(path, z, self.shape, self.byte_size)
    }
}

struct TiffStackReader {
    decoder: Decoder<BufReader<File>>,
    shape: VolumeShape,
    byte_size: usize,
}

impl PlaneReader for TiffStackReader {
    fn read_plane(&mut self, z: usize) -> Result<Vec<u8>, SourceError> {
        self.decoder.seek_to_image(z)?;
        let (width, height) = self.decoder.dimensions()?;
        check_plane_dimensions(z, self.shape, width as usize, height as usize)?;

        let bytes: Vec<u8> = match self.decoder.read_image()? {
            DecodingResult::U8(data) => data,
            DecodingResult::U16(data) => data.into_iter().flat_map(u16::to_le_bytes).collect(),
            DecodingResult::F32(data) => data.into_iter().flat_map(f32::to_le_bytes).collect(),
            _ => return Err(SourceError::UnsupportedTiffFormat(z)),
        };
        if bytes.len() != self.shape.width * self.shape.height * self.byte_size {
            return Err(SourceError::UnsupportedTiffFormat(z));
        }
        Ok(bytes)
    }
}

/// Adapts a [`PlaneReader`] to voxel access, keeping recently decoded
/// planes around. Decoded planes are always little-endian.
struct PlaneVolume<R> {
    reader: R,
    shape: VolumeShape,
    byte_size: usize,
    // most recently used first
    planes: Vec<(usize, Vec<u8>)>,
}

impl<R: PlaneReader> PlaneVolume<R> {
    fn new(reader: R, shape: VolumeShape, byte_size: usize) -> Self {
        Self {
            reader,
            shape,
            byte_size,
            planes: Vec::with_capacity(PLANE_CACHE_SIZE),
        }
    }

    fn plane(&mut self, z: usize) -> Result<&[u8], SourceError> {
        match self.planes.iter().position(|(index, _)| *index == z) {
            Some(0) => {}
            Some(position) => {
                let entry = self.planes.remove(position);
                self.planes.insert(0, entry);
            }
            None => {
                let plane = self.reader.read_plane(z)?;
                self.planes.insert(0, (z, plane));
                self.planes.truncate(PLANE_CACHE_SIZE);
            }
        }
        Ok(&self.planes[0].1)
    }
}

impl<R: PlaneReader> VoxelSource for PlaneVolume<R> {
    fn shape(&self) -> VolumeShape {
        self.shape
    }

    fn byte_size(&self) -> usize {
        self.byte_size
    }

    fn byte_order(&self) -> ByteOrder {
        ByteOrder::LittleEndian
    }

    fn read_run(
        &mut self,
        x: usize,
        y: usize,
        z: usize,
        out: &mut [u8],
    ) -> Result<(), SourceError> {
        let start = (y * self.shape.width + x) * self.byte_size;
        let plane = self.plane(z)?;
        let run = plane
            .get(start..start + out.len())
            .ok_or(SourceError::OutOfBounds { x, y, z })?;
        out.copy_from_slice(run);
        Ok(())
    }
}
