/// Kernel used to reconstruct a sample between lattice points.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InterpolationMethod {
    #[default]
    NearestNeighbor,
    Trilinear,
    /// Catmull-Rom cubic convolution over a 4x4x4 neighbourhood.
    Tricubic,
}

/// Byte order of multi-byte samples in a raw volume file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ByteOrder {
    #[default]
    LittleEndian,
    BigEndian,
}

impl ByteOrder {
    pub fn from_big_endian(big_endian: bool) -> Self {
        if big_endian {
            ByteOrder::BigEndian
        } else {
            ByteOrder::LittleEndian
        }
    }

    pub fn is_big_endian(self) -> bool {
        matches!(self, ByteOrder::BigEndian)
    }
}
