//! Compression codecs for efficient storage
//!
//! Compressed payloads carry a 4-byte header identifying the codec and
//! format version, so decompression never needs out-of-band information.
//!
//! # Examples
//!
//! ```
//! use bramble_core::storage::compression::{compress_with, decompress, Codec};
//!
//! let data = b"some index bytes".repeat(100);
//! let (compressed, stats) = compress_with(&data, Codec::Gzip).unwrap();
//! assert!(stats.compressed_size < stats.original_size);
//!
//! let restored = decompress(&compressed).unwrap();
//! assert_eq!(data.as_slice(), restored.as_slice());
//! ```

use std::io::{self, Write};
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Compression codec identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Codec {
    /// No compression (passthrough)
    None,
    /// Gzip compression via flate2
    Gzip,
}

impl Codec {
    fn id(&self) -> u8 {
        match self {
            Codec::None => 0,
            Codec::Gzip => 1,
        }
    }

    fn from_id(id: u8) -> Result<Self, CompressionError> {
        match id {
            0 => Ok(Codec::None),
            1 => Ok(Codec::Gzip),
            _ => Err(CompressionError::InvalidHeader(format!(
                "Unknown codec ID: {}",
                id
            ))),
        }
    }

    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Codec::None => "None",
            Codec::Gzip => "Gzip",
        }
    }
}

/// Statistics about a compression operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionStats {
    /// Original uncompressed size in bytes
    pub original_size: usize,
    /// Compressed size in bytes (including header)
    pub compressed_size: usize,
    /// Compression ratio (original / compressed)
    pub ratio: f64,
    /// Codec used for compression
    pub codec: Codec,
    /// Compression duration in milliseconds
    pub duration_ms: f64,
}

impl CompressionStats {
    /// Calculate space saved in bytes
    pub fn space_saved(&self) -> i64 {
        self.original_size as i64 - self.compressed_size as i64
    }
}

/// Error types for compression operations
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),
}

/// Header layout: [codec_id, version, reserved, reserved]
const HEADER_SIZE: usize = 4;
const VERSION: u8 = 1;

fn create_header(codec: Codec) -> [u8; HEADER_SIZE] {
    [codec.id(), VERSION, 0, 0]
}

fn parse_header(data: &[u8]) -> Result<(Codec, usize), CompressionError> {
    if data.len() < HEADER_SIZE {
        return Err(CompressionError::InvalidHeader(format!(
            "Data too small: {} bytes",
            data.len()
        )));
    }

    let codec = Codec::from_id(data[0])?;
    let version = data[1];

    if version != VERSION {
        return Err(CompressionError::InvalidHeader(format!(
            "Unsupported version: {}",
            version
        )));
    }

    Ok((codec, HEADER_SIZE))
}

/// Compress data using a specific codec
///
/// # Examples
///
/// ```
/// use bramble_core::storage::compression::{compress_with, Codec};
///
/// let data = b"Hello, World!".repeat(100);
/// let (compressed, stats) = compress_with(&data, Codec::Gzip).unwrap();
/// assert_eq!(stats.codec, Codec::Gzip);
/// ```
pub fn compress_with(
    data: &[u8],
    codec: Codec,
) -> Result<(Vec<u8>, CompressionStats), CompressionError> {
    let start = Instant::now();
    let original_size = data.len();

    let mut compressed = Vec::with_capacity(HEADER_SIZE + data.len());
    compressed.extend_from_slice(&create_header(codec));

    match codec {
        Codec::None => {
            compressed.extend_from_slice(data);
        }
        Codec::Gzip => {
            compress_gzip(data, &mut compressed)?;
        }
    }

    let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
    let compressed_size = compressed.len();
    let ratio = if compressed_size > 0 {
        original_size as f64 / compressed_size as f64
    } else {
        0.0
    };

    let stats = CompressionStats {
        original_size,
        compressed_size,
        ratio,
        codec,
        duration_ms,
    };

    Ok((compressed, stats))
}

/// Decompress data (codec detected automatically from header)
///
/// # Examples
///
/// ```
/// use bramble_core::storage::compression::{compress_with, decompress, Codec};
///
/// let original = b"Hello, World!".repeat(100);
/// let (compressed, _) = compress_with(&original, Codec::None).unwrap();
/// let decompressed = decompress(&compressed).unwrap();
/// assert_eq!(original.as_slice(), decompressed.as_slice());
/// ```
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let (codec, offset) = parse_header(data)?;
    let payload = &data[offset..];

    match codec {
        Codec::None => Ok(payload.to_vec()),
        Codec::Gzip => decompress_gzip(payload),
    }
}

fn compress_gzip(data: &[u8], output: &mut Vec<u8>) -> Result<(), CompressionError> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut encoder = GzEncoder::new(output, Compression::default());
    encoder.write_all(data)?;
    encoder.finish()?;
    Ok(())
}

fn decompress_gzip(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    use flate2::read::GzDecoder;
    use std::io::Read;

    let mut decoder = GzDecoder::new(data);
    let mut result = Vec::new();
    decoder
        .read_to_end(&mut result)
        .map_err(|e| CompressionError::DecompressionFailed(e.to_string()))?;
    Ok(result)
}
