//! Fragment payload framing and compression
//!
//! Data backends store each fragment as a self-checking frame:
//!
//! ```text
//! magic "ESDF" | version u8 | method u8 | reserved u16 | raw length u64 | crc32 u32 | payload
//! ```
//!
//! Integers are little-endian. The checksum covers the uncompressed bytes,
//! so corruption is caught regardless of codec.

use crate::error::{EsdmError, Result};
use crate::utils::calculate_checksum;
use flate2::read::{DeflateDecoder, DeflateEncoder};
use flate2::Compression as FlateCompression;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Magic number opening every fragment frame
pub const FRAME_MAGIC: &[u8; 4] = b"ESDF";

const FRAME_VERSION: u8 = 1;
const HEADER_LEN: usize = 20;

/// Compression methods a data backend can apply to fragment payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CompressionMethod {
    #[default]
    None = 0,
    /// Deflate/ZIP compression
    Deflate = 1,
    /// Zstandard compression
    Zstd = 3,
}

impl CompressionMethod {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CompressionMethod::None),
            1 => Some(CompressionMethod::Deflate),
            3 => Some(CompressionMethod::Zstd),
            _ => None,
        }
    }

    fn default_level(&self) -> u8 {
        match self {
            CompressionMethod::None => 0,
            CompressionMethod::Deflate => 6,
            CompressionMethod::Zstd => 3,
        }
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub method: CompressionMethod,
    pub raw_len: u64,
    pub checksum: u32,
}

/// Compression method plus level, as configured on a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Codec {
    method: CompressionMethod,
    level: u8,
}

impl Codec {
    pub fn new(method: CompressionMethod, level: Option<u8>) -> Self {
        let level = level.unwrap_or_else(|| method.default_level());
        Self { method, level }
    }

    pub fn method(&self) -> CompressionMethod {
        self.method
    }

    /// Compress `data` and wrap it in a frame
    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let payload = match self.method {
            CompressionMethod::None => data.to_vec(),
            CompressionMethod::Deflate => {
                let level = FlateCompression::new(u32::from(self.level.min(9)));
                let mut encoder = DeflateEncoder::new(data, level);
                let mut compressed = Vec::new();
                encoder
                    .read_to_end(&mut compressed)
                    .map_err(|e| EsdmError::Compression(e.to_string()))?;
                compressed
            }
            CompressionMethod::Zstd => zstd::encode_all(data, i32::from(self.level))
                .map_err(|e| EsdmError::Compression(e.to_string()))?,
        };

        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.extend_from_slice(FRAME_MAGIC);
        frame.push(FRAME_VERSION);
        frame.push(self.method as u8);
        frame.extend_from_slice(&[0, 0]);
        frame.extend_from_slice(&(data.len() as u64).to_le_bytes());
        frame.extend_from_slice(&calculate_checksum(data).to_le_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(CompressionMethod::None, None)
    }
}

/// Parse and validate a frame header without touching the payload
pub fn read_header(frame: &[u8]) -> Result<FrameHeader> {
    if frame.len() < HEADER_LEN {
        return Err(EsdmError::Corrupt(format!(
            "frame of {} bytes is shorter than its header",
            frame.len()
        )));
    }
    if &frame[..4] != FRAME_MAGIC {
        return Err(EsdmError::Corrupt("bad frame magic".to_string()));
    }
    if frame[4] != FRAME_VERSION {
        return Err(EsdmError::Corrupt(format!("unsupported frame version {}", frame[4])));
    }
    let method = CompressionMethod::from_u8(frame[5])
        .ok_or_else(|| EsdmError::Corrupt(format!("unknown compression method {}", frame[5])))?;

    let mut raw_len = [0u8; 8];
    raw_len.copy_from_slice(&frame[8..16]);
    let mut checksum = [0u8; 4];
    checksum.copy_from_slice(&frame[16..20]);

    Ok(FrameHeader {
        method,
        raw_len: u64::from_le_bytes(raw_len),
        checksum: u32::from_le_bytes(checksum),
    })
}

/// Unwrap a frame, decompress it, and verify length and checksum
pub fn decode(frame: &[u8]) -> Result<Vec<u8>> {
    let header = read_header(frame)?;
    let payload = &frame[HEADER_LEN..];

    let data = match header.method {
        CompressionMethod::None => payload.to_vec(),
        CompressionMethod::Deflate => {
            let mut decoder = DeflateDecoder::new(payload);
            let mut decompressed = Vec::with_capacity(header.raw_len as usize);
            decoder
                .read_to_end(&mut decompressed)
                .map_err(|e| EsdmError::Decompression(e.to_string()))?;
            decompressed
        }
        CompressionMethod::Zstd => {
            zstd::decode_all(payload).map_err(|e| EsdmError::Decompression(e.to_string()))?
        }
    };

    if data.len() as u64 != header.raw_len {
        return Err(EsdmError::Corrupt(format!(
            "frame declares {} bytes but holds {}",
            header.raw_len,
            data.len()
        )));
    }
    if calculate_checksum(&data) != header.checksum {
        return Err(EsdmError::Corrupt("payload checksum mismatch".to_string()));
    }
    Ok(data)
}
