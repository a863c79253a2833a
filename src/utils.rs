//! Utility functions

use crate::error::{EsdmError, Result};
use crate::types::Element;
use std::mem;

/// Convert raw native-order bytes to typed elements
pub fn bytes_to_elements<T: Element>(bytes: &[u8]) -> Result<Vec<T>> {
    let width = mem::size_of::<T>();
    if bytes.len() % width != 0 {
        return Err(EsdmError::InvalidArgument(format!(
            "{} bytes is not a whole number of {}-byte elements",
            bytes.len(),
            width
        )));
    }

    Ok(bytes.chunks_exact(width).map(T::read_ne).collect())
}

/// Convert typed elements to raw native-order bytes
pub fn elements_to_bytes<T: Element>(data: &[T]) -> Vec<u8> {
    let width = mem::size_of::<T>();
    let mut bytes = vec![0u8; data.len() * width];
    for (value, out) in data.iter().zip(bytes.chunks_exact_mut(width)) {
        value.write_ne(out);
    }
    bytes
}

/// CRC-32 (IEEE) of a fragment payload
pub fn calculate_checksum(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;

    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }

    !crc
}

/// Format byte size in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Reject names that would escape a backend's directory layout
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(EsdmError::InvalidArgument(format!("{} name must not be empty", kind)));
    }
    if name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return Err(EsdmError::InvalidArgument(format!(
            "{} name '{}' contains a path separator or is reserved",
            kind, name
        )));
    }
    Ok(())
}
