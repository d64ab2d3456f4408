//! Index persistence
//!
//! This module provides on-disk storage for built indexes:
//!
//! - [`compression`]: self-describing compression codecs (gzip, passthrough)
//! - [`file`]: named index storage with atomic writes and metadata sidecars
//!
//! The structural byte format of the tree itself lives with the index
//! (`KMeansTree::save` / `KMeansTree::load`); this module wraps it with
//! compression and filesystem management.

pub mod compression;
pub mod file;

pub use compression::{compress_with, decompress, Codec, CompressionStats};
pub use file::{FileStorage, StorageMetadata};
