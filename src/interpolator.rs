use crate::{
    enums::{ByteOrder, InterpolationMethod},
    volume_loader::{SourceError, VoxelSource},
};

use byteorder::{BigEndian, ByteOrder as _, LittleEndian};
use glam::Vec3;

pub(crate) struct Interpolator;

impl Interpolator {
    /// Sample `source` at `position`, given in voxel index space and already
    /// clamped to `[0, dim - 1]` on every axis. The result is written to `out`
    /// (`byte_size` bytes, little-endian).
    pub(crate) fn sample(
        source: &mut dyn VoxelSource,
        position: Vec3,
        method: InterpolationMethod,
        out: &mut [u8],
    ) -> Result<(), SourceError> {
        match method {
            InterpolationMethod::NearestNeighbor => Self::nearest(source, position, out),
            InterpolationMethod::Trilinear => Self::trilinear(source, position, out),
            InterpolationMethod::Tricubic if Self::near_border(source, position) => {
                Self::trilinear(source, position, out)
            }
            InterpolationMethod::Tricubic => Self::tricubic(source, position, out),
        }
    }

    /// Round to the nearest index, halves going up.
    #[inline]
    pub(crate) fn round_half_up(value: f32) -> usize {
        (value + 0.5).floor().max(0.0) as usize
    }

    fn nearest(
        source: &mut dyn VoxelSource,
        position: Vec3,
        out: &mut [u8],
    ) -> Result<(), SourceError> {
        let max = source.shape().max_index();
        let x = Self::round_half_up(position.x).min(max.x as usize);
        let y = Self::round_half_up(position.y).min(max.y as usize);
        let z = Self::round_half_up(position.z).min(max.z as usize);
        source.read_run(x, y, z, out)?;
        if source.byte_order().is_big_endian() {
            out.reverse();
        }
        Ok(())
    }

    fn trilinear(
        source: &mut dyn VoxelSource,
        position: Vec3,
        out: &mut [u8],
    ) -> Result<(), SourceError> {
        let byte_size = source.byte_size();
        let byte_order = source.byte_order();
        let max = source.shape().max_index();

        let x0 = position.x.floor();
        let y0 = position.y.floor();
        let z0 = position.z.floor();
        let dx = position.x - x0;
        let dy = position.y - y0;
        let dz = position.z - z0;
        let one_minus_dx = 1.0 - dx;
        let one_minus_dy = 1.0 - dy;
        let one_minus_dz = 1.0 - dz;

        let x0 = x0 as usize;
        let run_len = if (x0 as f32) < max.x { 2 } else { 1 };
        let ys = [y0 as usize, (y0 + 1.0).min(max.y) as usize];
        let zs = [z0 as usize, (z0 + 1.0).min(max.z) as usize];

        // corners[z][y] holds the values at x0 and x0 + 1
        let mut corners = [[[0f32; 2]; 2]; 2];
        let mut run = [0u8; 8];
        let run = &mut run[..run_len * byte_size];
        for (zi, &z) in zs.iter().enumerate() {
            for (yi, &y) in ys.iter().enumerate() {
                source.read_run(x0, y, z, run)?;
                let c0 = Self::decode(&run[..byte_size], byte_order);
                let c1 = if run_len == 2 {
                    Self::decode(&run[byte_size..], byte_order)
                } else {
                    c0
                };
                corners[zi][yi] = [c0, c1];
            }
        }

        let lerp_x = |[c0, c1]: [f32; 2]| c0.mul_add(one_minus_dx, c1 * dx);
        let c00 = lerp_x(corners[0][0]);
        let c10 = lerp_x(corners[0][1]);
        let c01 = lerp_x(corners[1][0]);
        let c11 = lerp_x(corners[1][1]);

        let c0 = c00.mul_add(one_minus_dy, c10 * dy);
        let c1 = c01.mul_add(one_minus_dy, c11 * dy);

        Self::pack(c0.mul_add(one_minus_dz, c1 * dz), out);
        Ok(())
    }

    /// Catmull-Rom cubic convolution over the 4x4x4 neighbourhood.
    fn tricubic(
        source: &mut dyn VoxelSource,
        position: Vec3,
        out: &mut [u8],
    ) -> Result<(), SourceError> {
        let byte_size = source.byte_size();
        let byte_order = source.byte_order();

        let x0 = position.x.floor();
        let y0 = position.y.floor();
        let z0 = position.z.floor();
        let u = Self::catmull_rom_weights(position.x - x0);
        let v = Self::catmull_rom_weights(position.y - y0);
        let w = Self::catmull_rom_weights(position.z - z0);
        let (x0, y0, z0) = (x0 as usize - 1, y0 as usize - 1, z0 as usize - 1);

        let mut run = [0u8; 16];
        let run = &mut run[..4 * byte_size];
        let mut value = 0f32;
        let mut all_zero = true;
        for (k, w_k) in w.iter().enumerate() {
            let mut q = 0f32;
            for (j, v_j) in v.iter().enumerate() {
                source.read_run(x0, y0 + j, z0 + k, run)?;
                let mut r = 0f32;
                for (i, u_i) in u.iter().enumerate() {
                    let sample = Self::decode(&run[i * byte_size..(i + 1) * byte_size], byte_order);
                    all_zero &= sample == 0.0;
                    r = u_i.mul_add(sample, r);
                }
                q = v_j.mul_add(r, q);
            }
            value = w_k.mul_add(q, value);
        }

        Self::pack(if all_zero { 0.0 } else { value }, out);
        Ok(())
    }

    /// True when the 4x4x4 neighbourhood of `position` would leave the volume.
    fn near_border(source: &dyn VoxelSource, position: Vec3) -> bool {
        let shape = source.shape();
        let outside = |coordinate: f32, dim: usize| {
            coordinate < 1.0 || coordinate + 2.0 >= dim as f32
        };
        outside(position.x, shape.width)
            || outside(position.y, shape.height)
            || outside(position.z, shape.depth)
    }

    #[inline]
    fn catmull_rom_weights(t: f32) -> [f32; 4] {
        let t2 = t * t;
        let t3 = t2 * t;
        [
            -0.5 * t3 + t2 - 0.5 * t,
            1.5 * t3 - 2.5 * t2 + 1.0,
            -1.5 * t3 + 2.0 * t2 + 0.5 * t,
            0.5 * t3 - 0.5 * t2,
        ]
    }

    #[inline]
    fn decode(bytes: &[u8], byte_order: ByteOrder) -> f32 {
        match (bytes.len(), byte_order) {
            (1, _) => bytes[0] as f32,
            (2, ByteOrder::LittleEndian) => LittleEndian::read_u16(bytes) as f32,
            (2, ByteOrder::BigEndian) => BigEndian::read_u16(bytes) as f32,
            (_, ByteOrder::LittleEndian) => LittleEndian::read_f32(bytes),
            (_, ByteOrder::BigEndian) => BigEndian::read_f32(bytes),
        }
    }

    /// Clamp an interpolated value to the range of the sample width and store
    /// it little-endian. One-byte samples keep the low byte of the truncated
    /// value.
    #[inline]
    fn pack(value: f32, out: &mut [u8]) {
        let max = 256f64.powi(out.len() as i32) - 1.0;
        let value = (value as f64).clamp(0.0, max);
        match out.len() {
            1 => out[0] = value as u8,
            2 => LittleEndian::write_u16(out, value as u16),
            _ => LittleEndian::write_f32(out, value as f32),
        }
    }
}
