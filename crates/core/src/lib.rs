//! Bramble - Core library
//!
//! Hierarchical k-means tree indexing for approximate nearest-neighbor search
//! over dense vector datasets.

pub mod matrix;
pub mod vector;
pub mod index;
pub mod storage;

use thiserror::Error;

/// Result type for index operations
pub type Result<T> = std::result::Result<T, AnnError>;

/// Error types for index operations
#[derive(Debug, Error)]
pub enum AnnError {
    #[error("Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Index error: {0}")]
    IndexError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Compression error: {0}")]
    CompressionError(#[from] storage::compression::CompressionError),
}

// Re-export commonly used items
pub use index::{
    CentersInit, Checks, KMeansTree, KMeansTreeConfig, KnnResultSet, ResultSet, SearchParams,
};
pub use matrix::Matrix;
pub use vector::{Distance, Manhattan, SquaredEuclidean};
