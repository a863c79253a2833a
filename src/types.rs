//! Core data types for ESDM

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

/// Element types a dataset can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum DataType {
    /// Unsigned 8-bit integer
    U8 = 1,
    /// Unsigned 16-bit integer
    U16 = 2,
    /// Unsigned 32-bit integer
    U32 = 3,
    /// Unsigned 64-bit integer
    U64 = 4,
    /// Signed 8-bit integer
    I8 = 5,
    /// Signed 16-bit integer
    I16 = 6,
    /// Signed 32-bit integer
    I32 = 7,
    /// Signed 64-bit integer
    I64 = 8,
    /// 32-bit floating point
    F32 = 9,
    /// 64-bit floating point
    F64 = 10,
}

impl DataType {
    /// Size in bytes of one element
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::U8 | DataType::I8 => 1,
            DataType::U16 | DataType::I16 => 2,
            DataType::U32 | DataType::I32 | DataType::F32 => 4,
            DataType::U64 | DataType::I64 | DataType::F64 => 8,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::U8 => "uint8",
            DataType::U16 => "uint16",
            DataType::U32 => "uint32",
            DataType::U64 => "uint64",
            DataType::I8 => "int8",
            DataType::I16 => "int16",
            DataType::I32 => "int32",
            DataType::I64 => "int64",
            DataType::F32 => "float",
            DataType::F64 => "double",
        };
        f.write_str(name)
    }
}

/// A primitive that can be stored in a dataset.
///
/// Values are laid out in native byte order, the same way a C caller
/// would hand a raw buffer to the engine.
pub trait Element: Copy + Default + Send + Sync + 'static {
    /// The dataset element type matching `Self`
    const DATA_TYPE: DataType;

    /// Write `self` into the first `size_of::<Self>()` bytes of `out`
    fn write_ne(self, out: &mut [u8]);

    /// Read a value from the first `size_of::<Self>()` bytes of `bytes`
    fn read_ne(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($($ty:ty => $dt:expr),* $(,)?) => {
        $(
            impl Element for $ty {
                const DATA_TYPE: DataType = $dt;

                fn write_ne(self, out: &mut [u8]) {
                    out[..std::mem::size_of::<$ty>()].copy_from_slice(&self.to_ne_bytes());
                }

                fn read_ne(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..std::mem::size_of::<$ty>()]);
                    <$ty>::from_ne_bytes(raw)
                }
            }
        )*
    };
}

impl_element! {
    u8 => DataType::U8,
    u16 => DataType::U16,
    u32 => DataType::U32,
    u64 => DataType::U64,
    i8 => DataType::I8,
    i16 => DataType::I16,
    i32 => DataType::I32,
    i64 => DataType::I64,
    f32 => DataType::F32,
    f64 => DataType::F64,
}

/// Which nodes can reach a backend's storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Accessibility {
    /// Shared by every node (parallel filesystem, object store)
    #[default]
    Global,
    /// Private to the local node (node-local SSD, tmpfs)
    NodeLocal,
}

/// Flags controlling `mkfs`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FormatFlags(u8);

impl FormatFlags {
    /// Remove an existing backend root
    pub const DELETE: Self = Self(1);
    /// Create the backend root and its layout
    pub const CREATE: Self = Self(2);
    /// Log per-backend failures instead of aborting
    pub const IGNORE_ERRORS: Self = Self(4);
    /// Delete, recreate, and keep going on errors
    pub const PURGE_RECREATE: Self = Self(7);

    pub fn from_bits(bits: u8) -> Self {
        Self(bits & 7)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for FormatFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_sizes() {
        assert_eq!(DataType::U8.size_in_bytes(), 1);
        assert_eq!(DataType::I16.size_in_bytes(), 2);
        assert_eq!(DataType::F32.size_in_bytes(), 4);
        assert_eq!(DataType::U64.size_in_bytes(), 8);
    }

    #[test]
    fn test_element_round_trip() {
        let mut raw = [0u8; 8];
        (-42i64).write_ne(&mut raw);
        assert_eq!(i64::read_ne(&raw), -42);

        1.5f32.write_ne(&mut raw);
        assert_eq!(f32::read_ne(&raw), 1.5);
        assert_eq!(<f64 as Element>::DATA_TYPE, DataType::F64);
    }

    #[test]
    fn test_format_flags() {
        let flags = FormatFlags::DELETE | FormatFlags::CREATE;
        assert!(flags.contains(FormatFlags::DELETE));
        assert!(flags.contains(FormatFlags::CREATE));
        assert!(!flags.contains(FormatFlags::IGNORE_ERRORS));

        let purge = FormatFlags::PURGE_RECREATE;
        assert!(purge.contains(flags | FormatFlags::IGNORE_ERRORS));
        assert_eq!(FormatFlags::from_bits(0xff).bits(), 7);
    }

    #[test]
    fn test_data_type_display() {
        assert_eq!(DataType::U64.to_string(), "uint64");
        assert_eq!(DataType::F64.to_string(), "double");
    }
}
