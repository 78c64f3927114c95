//! Host-side memory layout packing.
//!
//! A [`Block`] turns a sequence of typed fields plus scalar data into one
//! correctly aligned byte buffer, following the GPU's standard uniform/storage
//! block packing rules (std140-like): every field sits at an offset aligned to
//! its natural alignment, and every whole record is padded up to a 16-byte
//! boundary. A block lives only long enough to seed a buffer upload.

use derive_more::Display;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("unknown value type `{0}`")]
    UnknownType(String),
    #[error("data of {len} scalars does not divide into records of {lanes} lanes")]
    Mismatch { len: usize, lanes: usize },
    #[error("{records} records of {record} bytes exceed addressable size")]
    TooLarge { records: u64, record: usize },
}

/// A scalar, vector or matrix field type of a packed record.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    U32,
    F32,
    Vec2,
    Vec3,
    Vec4,
    Mat4,
}

impl ValueType {
    /// Size of the field in bytes.
    pub const fn size(self) -> usize {
        match self {
            Self::U32 | Self::F32 => 4,
            Self::Vec2 => 8,
            Self::Vec3 => 12,
            Self::Vec4 => 16,
            Self::Mat4 => 64,
        }
    }

    /// Natural alignment of the field in bytes.
    pub const fn alignment(self) -> usize {
        match self {
            Self::U32 | Self::F32 => 4,
            Self::Vec2 => 8,
            Self::Vec3 | Self::Vec4 | Self::Mat4 => 16,
        }
    }

    /// Number of 32-bit lanes the field consumes from the data array.
    pub const fn lanes(self) -> usize {
        match self {
            Self::U32 | Self::F32 => 1,
            Self::Vec2 => 2,
            Self::Vec3 => 3,
            Self::Vec4 => 4,
            Self::Mat4 => 16,
        }
    }

    pub fn parse(name: &str) -> Result<Self, LayoutError> {
        match name {
            "U32" => Ok(Self::U32),
            "F32" => Ok(Self::F32),
            "Vec2" => Ok(Self::Vec2),
            "Vec3" => Ok(Self::Vec3),
            "Vec4" => Ok(Self::Vec4),
            "Mat4" => Ok(Self::Mat4),
            _ => Err(LayoutError::UnknownType(name.into())),
        }
    }
}

const fn align_to(offset: usize, alignment: usize) -> usize {
    (offset + alignment - 1) & !(alignment - 1)
}

/// Byte size of one record of the given type list, fields aligned in order
/// and the whole record padded up to 16 bytes.
pub fn record_size(types: &[ValueType]) -> usize {
    let size = types.iter().fold(0, |offset, ty| {
        align_to(offset, ty.alignment()) + ty.size()
    });
    align_to(size, 16)
}

/// An ephemeral, host-side byte buffer holding one or more fixed-layout
/// records packed back to back. Owns its storage exclusively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    data: Vec<u8>,
}

impl Block {
    /// Packs a literal data array into records of the given type list.
    ///
    /// The array length must be an exact multiple of the type list's total
    /// lane count. `U32` lanes are truncated from the source numbers; all
    /// other lanes are written as `f32`. Little-endian throughout.
    pub fn from_values(types: &[ValueType], values: &[f64]) -> Result<Self, LayoutError> {
        let lanes: usize = types.iter().map(|ty| ty.lanes()).sum();
        if lanes == 0 || values.len() % lanes != 0 {
            return Err(LayoutError::Mismatch {
                len: values.len(),
                lanes,
            });
        }

        let records = values.len() / lanes;
        let mut data = vec![0u8; record_size(types) * records];
        let mut index = 0;
        let mut offset = 0;
        for _ in 0..records {
            for ty in types {
                offset = align_to(offset, ty.alignment());
                for _ in 0..ty.lanes() {
                    let lane = match ty {
                        ValueType::U32 => values[index] as u32,
                        _ => (values[index] as f32).to_bits(),
                    };
                    data[offset..offset + 4].copy_from_slice(&lane.to_le_bytes());
                    index += 1;
                    offset += 4;
                }
            }
            offset = align_to(offset, 16);
        }
        Ok(Self { data })
    }

    /// A zero-filled block of `records` records. No fill pass is performed;
    /// this backs buffers the GPU writes before any host read. Fails when
    /// the total size does not fit in host memory addressing.
    pub fn zeroed(types: &[ValueType], records: u64) -> Result<Self, LayoutError> {
        let record = record_size(types);
        let size = usize::try_from(records)
            .ok()
            .and_then(|records| record.checked_mul(records))
            .ok_or(LayoutError::TooLarge { records, record })?;
        Ok(Self {
            data: vec![0u8; size],
        })
    }

    /// Total packed size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}
