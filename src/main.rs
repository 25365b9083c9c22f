use std::{error::Error, path::PathBuf};

use clap::Parser;
use glam::{EulerRot, Quat};
use log::info;
use volume_slicer::{
    ByteOrder, InterpolationMethod, SlicerConfig, VolumeDescriptor, VolumeShape, VolumeSlicer,
};

#[derive(Debug, clap::ValueEnum, Clone, Copy)]
enum ArgSourceKind {
    Raw,
    ImageSequence,
    Tiff,
}

#[derive(Debug, clap::ValueEnum, Clone, Copy)]
enum ArgInterpolation {
    Nearest,
    Trilinear,
    Tricubic,
}

impl From<ArgInterpolation> for InterpolationMethod {
    fn from(value: ArgInterpolation) -> Self {
        match value {
            ArgInterpolation::Nearest => InterpolationMethod::NearestNeighbor,
            ArgInterpolation::Trilinear => InterpolationMethod::Trilinear,
            ArgInterpolation::Tricubic => InterpolationMethod::Tricubic,
        }
    }
}

/// Slice a volume once and report how the slice was filled.
#[derive(Parser, Debug)]
struct Args {
    /// Raw or TIFF file, or the directory of an image sequence.
    path: PathBuf,
    #[arg(long)]
    width: usize,
    #[arg(long)]
    height: usize,
    #[arg(long)]
    depth: usize,
    /// Bytes per sample: 1, 2 or 4.
    #[arg(long, default_value_t = 1)]
    byte_size: usize,
    /// Raw samples are stored big-endian.
    #[arg(long)]
    big_endian: bool,
    #[arg(long, value_enum, default_value = "raw")]
    kind: ArgSourceKind,
    /// Filename prefix of the image sequence.
    #[arg(long, default_value = "")]
    template: String,
    #[arg(long, value_enum, default_value = "nearest")]
    interpolation: ArgInterpolation,
    /// Target sampling density, 1 being full resolution.
    #[arg(long, default_value_t = 1.0)]
    scale: f32,
    /// Memory for the low-res model in megabytes.
    #[arg(long, default_value_t = 1)]
    budget_mb: u64,
    /// Offset of the slice from the volume centre.
    #[arg(long, default_value_t = 0.0)]
    slice_depth: f32,
    /// View rotation in degrees.
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    yaw: f32,
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    pitch: f32,
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    roll: f32,
}

fn main() -> Result<(), Box<dyn Error>> {
    let env = env_logger::Env::default().filter_or("RUST_LOG", "info");
    env_logger::init_from_env(env);

    let args = Args::parse();

    let shape = VolumeShape::new(args.width, args.height, args.depth);
    let descriptor = match args.kind {
        ArgSourceKind::Raw => VolumeDescriptor::raw(&args.path, shape, args.byte_size)
            .with_byte_order(ByteOrder::from_big_endian(args.big_endian)),
        ArgSourceKind::ImageSequence => {
            VolumeDescriptor::image_sequence(&args.path, &args.template, shape, args.byte_size)
        }
        ArgSourceKind::Tiff => VolumeDescriptor::tiff_stack(&args.path, shape, args.byte_size),
    };
    let config = SlicerConfig::default()
        .with_interpolation(args.interpolation.into())
        .with_interpolation_scale(args.scale)
        .with_low_lod_budget(args.budget_mb << 20);

    let mut slicer = VolumeSlicer::new(config)?;
    slicer.configure(descriptor)?;
    let plane = slicer.max_dist();
    let chunks = slicer.chunks_per_dim();
    info!(
        "low-res model ready at scale {:?}, slice plane {plane}x{plane} voxels in {chunks}x{chunks} chunks",
        slicer.low_res_scale()
    );

    slicer.change_slice_depth(args.slice_depth);
    slicer.change_slice_rotation(Quat::from_euler(
        EulerRot::YXZ,
        args.yaw.to_radians(),
        args.pitch.to_radians(),
        args.roll.to_radians(),
    ));
    slicer.update_chunk_visibility();
    // refill with the culled grid
    slicer.change_slice_depth(args.slice_depth);
    slicer.wait_for_refinement();

    let chunk_count = slicer.chunks_per_dim() * slicer.chunks_per_dim();
    let filled = (0..chunk_count)
        .filter(|index| slicer.chunk_texel_dimension(*index) > 0)
        .count();
    let texels = (0..chunk_count)
        .map(|index| slicer.chunk_texel_dimension(index))
        .max()
        .unwrap_or_default();
    info!("{filled} of {chunk_count} chunks filled with {texels}x{texels} texels");
    info!("{}", slicer.status());

    Ok(())
}
