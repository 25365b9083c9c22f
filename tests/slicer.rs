use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::Duration,
};

use image::GrayImage;
use volume_slicer::{
    ByteOrder, ChunkLayout, InterpolationMethod, MemoryVolume, Progress, SlicerConfig,
    SlicerError, SourceError, VolumeDescriptor, VolumeShape, VolumeSlicer, VoxelSource,
    progress::pass_scales,
};

const SIDE: usize = 64;

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "volume-slicer-it-{name}-{}",
        std::process::id()
    ));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).expect("should have created scratch directory");
    dir
}

/// 64^3 volume where every voxel holds its x coordinate.
fn x_ramp_bytes() -> Vec<u8> {
    (0..SIDE * SIDE * SIDE)
        .map(|index| (index % SIDE) as u8)
        .collect()
}

fn ramp_shape() -> VolumeShape {
    VolumeShape::new(SIDE, SIDE, SIDE)
}

fn write_ramp(dir: &Path) -> PathBuf {
    let path = dir.join("ramp.raw");
    fs::write(&path, x_ramp_bytes()).expect("should have written raw volume");
    path
}

fn memory_slicer(config: SlicerConfig) -> VolumeSlicer {
    let volume = MemoryVolume::new(x_ramp_bytes(), ramp_shape(), 1, ByteOrder::LittleEndian)
        .expect("buffer should match shape");
    let opener = move |_: &VolumeDescriptor| -> Result<Box<dyn VoxelSource>, SourceError> {
        Ok(Box::new(volume.clone()))
    };
    VolumeSlicer::with_opener(config, Arc::new(opener)).expect("should have created slicer")
}

#[test]
fn small_volume_needs_no_refinement() {
    let dir = scratch_dir("small");
    let mut slicer = VolumeSlicer::new(SlicerConfig::default()).expect("should create slicer");
    assert!(!slicer.is_low_res_ready());

    slicer
        .configure(VolumeDescriptor::raw(write_ramp(&dir), ramp_shape(), 1))
        .expect("should have built model");

    assert!(slicer.is_low_res_ready());
    assert_eq!(slicer.low_res_scale(), Some(1.0));
    assert_eq!(slicer.status(), "Loading slice: Completed");
    assert!(!slicer.is_refining());
    assert_eq!(slicer.chunks_per_dim(), 2);
    assert_eq!(slicer.max_dist(), 128);
    assert_eq!(slicer.byte_size(), 1);

    // chunk 1 is the top-right quarter; its left edge is the volume centre
    let chunk = slicer.chunk(1);
    assert_eq!(slicer.chunk_texel_dimension(1), 64);
    assert_eq!(chunk[5 * 64 + 10], 42);
    assert_eq!(chunk[5 * 64 + 40], 0);
    fs::remove_dir_all(dir).ok();
}

#[test]
fn invisible_chunks_are_emptied() {
    let mut slicer = memory_slicer(SlicerConfig::default());
    slicer
        .configure(VolumeDescriptor::raw("ramp.raw", ramp_shape(), 1))
        .expect("should have built model");
    assert_eq!(slicer.chunk_texel_dimension(3), 64);

    slicer.set_chunk_visibility(3, false);
    // visibility is picked up by the next epoch
    assert_eq!(slicer.chunk_texel_dimension(3), 64);
    slicer.change_slice_depth(0.0);

    assert!(slicer.chunk(3).is_empty());
    assert_eq!(slicer.chunk_texel_dimension(3), 0);
    assert_eq!(slicer.chunk_texel_dimension(0), 64);
    assert!(slicer.chunk(99).is_empty());
}

#[test]
fn refinement_reaches_full_resolution() {
    let mut slicer = memory_slicer(SlicerConfig::default().with_low_lod_budget(4096));
    slicer
        .configure(VolumeDescriptor::raw("ramp.raw", ramp_shape(), 1))
        .expect("should have built model");
    assert_eq!(slicer.low_res_scale(), Some(0.25));

    let mut last = 0.0;
    while slicer.is_refining() {
        let progress = slicer.progress();
        assert!(progress.fraction() >= last, "{progress:?} went backwards");
        last = progress.fraction();
        thread::sleep(Duration::from_millis(1));
    }
    slicer.wait_for_refinement();

    let status = slicer.status();
    assert!(status.starts_with("Loading slice: Completed in "), "{status}");
    let snapshot = slicer.buffer().snapshot();
    assert_eq!(snapshot.scale, 1.0);
    assert_eq!(slicer.chunk_texel_dimension(1), 64);
    assert_eq!(slicer.chunk(1)[5 * 64 + 10], 42);
}

#[test]
fn passes_refine_the_texel_spacing() {
    let mut slicer = memory_slicer(SlicerConfig::default().with_low_lod_budget(512));
    slicer
        .configure(VolumeDescriptor::raw("ramp.raw", ramp_shape(), 1))
        .expect("should have built model");
    let lowres = slicer.low_res_scale().expect("model is built");

    let mut unit_size = 1.0 / lowres;
    for scale in pass_scales(lowres, 1.0) {
        let layout = ChunkLayout::for_scale(&ramp_shape(), slicer.chunks_per_dim(), scale);
        assert!(layout.unit_size < unit_size);
        unit_size = layout.unit_size;
    }
    assert_eq!(unit_size, 1.0);
    slicer.wait_for_refinement();
}

#[test]
fn new_epochs_supersede_refinement() {
    let mut slicer = memory_slicer(
        SlicerConfig::default()
            .with_low_lod_budget(4096)
            .with_interpolation(InterpolationMethod::Trilinear),
    );
    slicer
        .configure(VolumeDescriptor::raw("ramp.raw", ramp_shape(), 1))
        .expect("should have built model");

    for step in 0..5 {
        slicer.change_slice_depth(step as f32);
    }
    slicer.wait_for_refinement();

    let snapshot = slicer.buffer().snapshot();
    assert_eq!(snapshot.scale, 1.0);
    assert!(matches!(
        slicer.progress(),
        Progress::Completed { elapsed: Some(_) }
    ));
}

#[test]
fn endianness_swaps_multi_byte_samples() {
    let dir = scratch_dir("endian");
    let path = dir.join("words.raw");
    let shape = VolumeShape::new(4, 4, 4);
    let bytes: Vec<u8> = (0..shape.voxel_count())
        .flat_map(|_| 0x1234u16.to_le_bytes())
        .collect();
    fs::write(&path, bytes).expect("should have written raw volume");

    let mut slicer = VolumeSlicer::new(SlicerConfig::default()).expect("should create slicer");
    slicer
        .configure(VolumeDescriptor::raw(&path, shape, 2))
        .expect("should have built model");
    // chunk 3, texel (0, 3) lies just below the volume centre
    let offset = (3 * 4) * 2;
    assert_eq!(&slicer.chunk(3)[offset..offset + 2], &[0x34, 0x12]);

    slicer.set_endianness(true).expect("should have rebuilt model");
    assert_eq!(&slicer.chunk(3)[offset..offset + 2], &[0x12, 0x34]);
    fs::remove_dir_all(dir).ok();
}

#[test]
fn failed_configuration_keeps_previous_model() {
    let dir = scratch_dir("failed");
    let mut slicer = VolumeSlicer::new(SlicerConfig::default()).expect("should create slicer");

    let missing = VolumeDescriptor::raw(dir.join("missing.raw"), ramp_shape(), 1);
    let result = slicer.configure(missing);
    assert!(matches!(result, Err(SlicerError::Source(SourceError::Io(_)))));
    assert!(slicer.status().starts_with("Encountered error:"));
    assert!(!slicer.is_low_res_ready());

    slicer
        .configure(VolumeDescriptor::raw(write_ramp(&dir), ramp_shape(), 1))
        .expect("should have built model");
    let truncated = dir.join("truncated.raw");
    fs::write(&truncated, [0u8; 100]).expect("should have written raw volume");
    let result = slicer.set_file_path(&truncated);
    assert!(matches!(
        result,
        Err(SlicerError::Source(SourceError::TruncatedRaw { .. }))
    ));
    assert!(slicer.status().starts_with("Encountered error:"));

    // slicing continues on the last good model
    assert!(slicer.is_low_res_ready());
    slicer.change_slice_depth(0.0);
    assert_eq!(slicer.status(), "Loading slice: Completed");
    assert_eq!(slicer.chunk(1)[5 * 64 + 10], 42);

    assert!(matches!(
        slicer.set_byte_size(3),
        Err(SlicerError::Descriptor(_))
    ));
    fs::remove_dir_all(dir).ok();
}

#[test]
fn failed_rebuild_keeps_the_chunk_grid() {
    let volume = MemoryVolume::new(x_ramp_bytes(), ramp_shape(), 1, ByteOrder::LittleEndian)
        .expect("buffer should match shape");
    // only the 64^3 ramp can be opened
    let opener = move |descriptor: &VolumeDescriptor| -> Result<Box<dyn VoxelSource>, SourceError> {
        if descriptor.shape == ramp_shape() {
            Ok(Box::new(volume.clone()))
        } else {
            Err(std::io::Error::other("volume is offline").into())
        }
    };
    let mut slicer = VolumeSlicer::with_opener(SlicerConfig::default(), Arc::new(opener))
        .expect("should have created slicer");
    slicer
        .configure(VolumeDescriptor::raw("ramp.raw", ramp_shape(), 1))
        .expect("should have built model");
    slicer.set_chunk_visibility(3, false);
    slicer.change_slice_depth(0.0);
    assert_eq!(slicer.chunks_per_dim(), 2);

    // a 1024^3 volume would split the plane into 32x32 chunks
    let large = VolumeDescriptor::raw("large.raw", VolumeShape::new(1024, 1024, 1024), 1);
    assert!(matches!(
        slicer.configure(large),
        Err(SlicerError::Source(SourceError::Io(_)))
    ));

    assert_eq!(slicer.chunks_per_dim(), 2);
    assert_eq!(slicer.max_dist(), 128);
    slicer.change_slice_depth(0.0);
    assert_eq!(slicer.chunk_texel_dimension(3), 0);
    assert_eq!(slicer.chunk_texel_dimension(0), 64);
    assert_eq!(slicer.status(), "Loading slice: Completed");
}

#[test]
fn image_sequences_follow_numeric_order() {
    let dir = scratch_dir("sequence");
    for n in [1u8, 2, 3, 10] {
        GrayImage::from_pixel(8, 8, image::Luma([n]))
            .save(dir.join(format!("slice{n}.png")))
            .expect("should have written frame");
    }
    fs::write(dir.join("notes.txt"), "not a frame").expect("should have written file");

    let mut slicer = VolumeSlicer::new(SlicerConfig::default()).expect("should create slicer");
    slicer
        .configure(VolumeDescriptor::image_sequence(
            &dir,
            "slice",
            VolumeShape::new(8, 8, 4),
            1,
        ))
        .expect("should have built model");

    // plane depth 1 lands on the last frame
    slicer.change_slice_depth(1.0);
    assert_eq!(slicer.chunk_texel_dimension(3), 8);
    assert_eq!(slicer.chunk(3)[7 * 8], 10);

    let result = slicer.set_file_template("frame");
    assert!(matches!(
        result,
        Err(SlicerError::Source(SourceError::NoMatchingImages { .. }))
    ));
    let status = slicer.status();
    assert!(status.contains("slice10.png"), "{status}");
    fs::remove_dir_all(dir).ok();
}

#[test]
fn bounds_culling_hides_chunks_past_the_volume() {
    let mut slicer = memory_slicer(SlicerConfig::default().with_chunks_per_dim(8));
    slicer
        .configure(VolumeDescriptor::raw("ramp.raw", ramp_shape(), 1))
        .expect("should have built model");
    assert_eq!(slicer.chunks_per_dim(), 8);
    assert!((slicer.chunk_dist() - 8.0 * 2f32.sqrt()).abs() < 1e-4);

    slicer.update_chunk_visibility();
    slicer.change_slice_depth(0.0);
    assert_eq!(slicer.chunk_texel_dimension(0), 0);
    assert_eq!(slicer.chunk_texel_dimension(9), 16);

    slicer.change_slice_depth(100.0);
    slicer.update_chunk_visibility();
    slicer.change_slice_depth(100.0);
    assert!((0..64).all(|index| slicer.chunk(index).is_empty()));
}

#[test]
fn cancelled_model_build_is_reported() {
    let mut slicer = memory_slicer(SlicerConfig::default());
    slicer.model_build_canceller().cancel();

    let result = slicer.configure(VolumeDescriptor::raw("ramp.raw", ramp_shape(), 1));
    assert!(matches!(result, Err(SlicerError::BuildCancelled)));
    assert!(!slicer.is_low_res_ready());

    // the next build gets a fresh token
    slicer
        .configure(VolumeDescriptor::raw("ramp.raw", ramp_shape(), 1))
        .expect("should have built model");
    assert!(slicer.is_low_res_ready());
}
