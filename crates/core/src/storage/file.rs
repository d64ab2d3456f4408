//! File-based index storage
//!
//! Persists built indexes under stable names with compression, atomic
//! writes, and metadata management.
//!
//! # Features
//!
//! - **Atomic Writes**: write to temporary files and rename to prevent
//!   corruption
//! - **Compression**: configurable codec for the index payload
//! - **Metadata Tracking**: creation/update time, distance name, and
//!   compression stats in a sidecar per index
//!
//! The dataset itself is not persisted: an index dump only covers the tree
//! structure and parameters, and loading requires the original dataset.
//!
//! # Examples
//!
//! ```no_run
//! use bramble_core::storage::file::FileStorage;
//! use bramble_core::storage::compression::Codec;
//! use bramble_core::{KMeansTree, KMeansTreeConfig, Matrix};
//!
//! # fn main() -> bramble_core::Result<()> {
//! let storage = FileStorage::with_codec("/tmp/ann_storage", Codec::Gzip)?;
//!
//! let data = vec![0.0; 1024];
//! let dataset = Matrix::from_slice(&data, 256, 4)?;
//! let mut index = KMeansTree::new(dataset.clone(), KMeansTreeConfig::default());
//! index.build()?;
//!
//! let stats = storage.save_index("grid", &index)?;
//! println!("Compression ratio: {:.2}", stats.ratio);
//!
//! let loaded = storage.load_index("grid", dataset, bramble_core::SquaredEuclidean)?;
//! assert_eq!(loaded.size(), 256);
//! # Ok(())
//! # }
//! ```

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::index::KMeansTree;
use crate::matrix::Matrix;
use crate::storage::compression::{self, Codec, CompressionStats};
use crate::vector::Distance;
use crate::{AnnError, Result};

const STORAGE_VERSION: u32 = 1;
const DATA_EXTENSION: &str = "data";
const META_EXTENSION: &str = "meta";
const TMP_EXTENSION: &str = "tmp";

/// Metadata sidecar for a stored index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageMetadata {
    /// Storage format version
    pub version: u32,
    /// Unix timestamp when the item was created
    pub created_at: u64,
    /// Unix timestamp when the item was last updated
    pub updated_at: u64,
    /// Distance functor the index was built with
    pub distance: String,
    /// Compression codec used
    pub compression: Codec,
    /// Original size before compression (bytes)
    pub original_size: usize,
    /// Compressed size after compression (bytes)
    pub compressed_size: usize,
}

impl StorageMetadata {
    fn new(distance: String, stats: &CompressionStats) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();

        Self {
            version: STORAGE_VERSION,
            created_at: now,
            updated_at: now,
            distance,
            compression: stats.codec,
            original_size: stats.original_size,
            compressed_size: stats.compressed_size,
        }
    }

    fn touch(&mut self) {
        self.updated_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
    }
}

/// File-based storage manager for indexes
///
/// # Directory Structure
///
/// ```text
/// base_path/
/// ├── grid.data       # Compressed structural index dump
/// ├── grid.meta       # Metadata sidecar
/// └── ...
/// ```
#[derive(Debug)]
pub struct FileStorage {
    base_path: PathBuf,
    codec: Codec,
}

impl FileStorage {
    /// Create new storage at the specified path, without compression
    ///
    /// Creates the directory if it doesn't exist.
    ///
    /// # Errors
    /// Returns `AnnError::StorageError` if directory creation fails or the
    /// path is not a directory.
    pub fn new(base_path: impl AsRef<Path>) -> Result<Self> {
        Self::with_codec(base_path, Codec::None)
    }

    /// Create storage with a specific compression codec
    ///
    /// # Errors
    /// Returns `AnnError::StorageError` if directory creation fails or the
    /// path is not a directory.
    pub fn with_codec(base_path: impl AsRef<Path>, codec: Codec) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();

        if !base_path.exists() {
            fs::create_dir_all(&base_path).map_err(|e| {
                AnnError::StorageError(format!("Failed to create storage directory: {}", e))
            })?;
        }

        if !base_path.is_dir() {
            return Err(AnnError::StorageError(format!(
                "Storage path is not a directory: {}",
                base_path.display()
            )));
        }

        Ok(Self { base_path, codec })
    }

    /// Save an index under `name`
    ///
    /// # Errors
    /// Returns an error if the index is not built or writing fails.
    pub fn save_index<D: Distance>(
        &self,
        name: &str,
        index: &KMeansTree<'_, D>,
    ) -> Result<CompressionStats> {
        let mut serialized = Vec::new();
        index.save(&mut serialized)?;

        let (compressed, stats) = compression::compress_with(&serialized, self.codec)?;

        let metadata = if self.exists(name) {
            let mut meta = self.metadata(name)?;
            meta.touch();
            meta.distance = index.distance_name().to_string();
            meta.compression = stats.codec;
            meta.original_size = stats.original_size;
            meta.compressed_size = stats.compressed_size;
            meta
        } else {
            StorageMetadata::new(index.distance_name().to_string(), &stats)
        };

        self.write_atomic(&self.item_path(name), &compressed)?;

        let meta_bytes = bincode::serialize(&metadata)?;
        self.write_atomic(&self.metadata_path(name), &meta_bytes)?;

        Ok(stats)
    }

    /// Load the index stored under `name`
    ///
    /// `dataset` must be the dataset the index was built over; its shape is
    /// validated against the stored dump.
    ///
    /// # Errors
    /// Returns an error if the index doesn't exist, the payload is corrupt,
    /// or the dataset shape disagrees with the dump.
    pub fn load_index<'d, D: Distance>(
        &self,
        name: &str,
        dataset: Matrix<'d>,
        distance: D,
    ) -> Result<KMeansTree<'d, D>> {
        if !self.exists(name) {
            return Err(AnnError::StorageError(format!("Index not found: {}", name)));
        }

        let metadata = self.metadata(name)?;
        if metadata.version != STORAGE_VERSION {
            return Err(AnnError::StorageError(format!(
                "Incompatible storage version: expected {}, got {}",
                STORAGE_VERSION, metadata.version
            )));
        }

        let mut file = File::open(self.item_path(name))?;
        let mut compressed = Vec::new();
        file.read_to_end(&mut compressed)?;

        if compressed.len() != metadata.compressed_size {
            return Err(AnnError::StorageError(format!(
                "Data corruption detected: size mismatch for {}",
                name
            )));
        }

        let serialized = compression::decompress(&compressed)?;
        KMeansTree::load(dataset, distance, &mut serialized.as_slice())
    }

    /// True if an index is stored under `name`
    pub fn exists(&self, name: &str) -> bool {
        self.item_path(name).exists() && self.metadata_path(name).exists()
    }

    /// Delete the index stored under `name`
    ///
    /// Removes both the data and metadata files. Does not error if the item
    /// doesn't exist.
    pub fn delete(&self, name: &str) -> Result<()> {
        for path in [self.item_path(name), self.metadata_path(name)] {
            if path.exists() {
                fs::remove_file(&path).map_err(|e| {
                    AnnError::StorageError(format!("Failed to delete {}: {}", path.display(), e))
                })?;
            }
        }
        Ok(())
    }

    /// List the names of all stored indexes, sorted
    ///
    /// # Errors
    /// Returns `AnnError::StorageError` if the directory can't be read.
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.base_path).map_err(|e| {
            AnnError::StorageError(format!("Failed to read storage directory: {}", e))
        })?;

        let mut names = std::collections::HashSet::new();
        for entry in entries {
            let entry = entry
                .map_err(|e| AnnError::StorageError(format!("Failed to read entry: {}", e)))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(ext) = path.extension() else {
                continue;
            };
            if ext == DATA_EXTENSION || ext == META_EXTENSION {
                if let Some(name) = path.file_stem().and_then(|s| s.to_str()) {
                    names.insert(name.to_string());
                }
            }
        }

        let mut result: Vec<String> = names.into_iter().collect();
        result.sort();
        Ok(result)
    }

    /// Read the metadata sidecar of `name`
    ///
    /// # Errors
    /// Returns `AnnError::StorageError` if the sidecar is missing or
    /// unreadable.
    pub fn metadata(&self, name: &str) -> Result<StorageMetadata> {
        let meta_path = self.metadata_path(name);
        if !meta_path.exists() {
            return Err(AnnError::StorageError(format!(
                "Metadata not found for item: {}",
                name
            )));
        }

        let mut file = File::open(&meta_path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    fn item_path(&self, name: &str) -> PathBuf {
        self.base_path.join(format!("{}.{}", name, DATA_EXTENSION))
    }

    fn metadata_path(&self, name: &str) -> PathBuf {
        self.base_path.join(format!("{}.{}", name, META_EXTENSION))
    }

    /// Write to a temporary file in the same directory and rename into place
    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        let tmp_path = path.with_extension(TMP_EXTENSION);
        fs::write(&tmp_path, data)
            .map_err(|e| AnnError::StorageError(format!("Failed to write temp file: {}", e)))?;
        fs::rename(&tmp_path, path)
            .map_err(|e| AnnError::StorageError(format!("Failed to rename temp file: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{KMeansTreeConfig, SearchParams};
    use crate::vector::SquaredEuclidean;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::tempdir;

    fn test_dataset() -> Matrix<'static> {
        let mut rng = StdRng::seed_from_u64(77);
        let data: Vec<f32> = (0..200 * 4).map(|_| rng.gen::<f32>() * 10.0).collect();
        Matrix::from_vec(data, 200, 4).unwrap()
    }

    fn built_index(dataset: Matrix<'static>) -> KMeansTree<'static> {
        let config = KMeansTreeConfig::default().with_branching(4).with_seed(77);
        let mut index = KMeansTree::new(dataset, config);
        index.build().unwrap();
        index
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();

        let dataset = test_dataset();
        let index = built_index(dataset.clone());

        let stats = storage.save_index("test", &index).unwrap();
        assert_eq!(stats.codec, Codec::None);
        assert!(storage.exists("test"));

        let loaded = storage
            .load_index("test", dataset, SquaredEuclidean)
            .unwrap();
        assert_eq!(loaded.size(), index.size());

        let query = vec![5.0; 4];
        let a = index.search(&query, 5, &SearchParams::unlimited()).unwrap();
        let b = loaded.search(&query, 5, &SearchParams::unlimited()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_save_load_with_gzip() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::with_codec(dir.path(), Codec::Gzip).unwrap();

        let dataset = test_dataset();
        let index = built_index(dataset.clone());

        let stats = storage.save_index("test", &index).unwrap();
        assert_eq!(stats.codec, Codec::Gzip);

        let loaded = storage
            .load_index("test", dataset, SquaredEuclidean)
            .unwrap();

        let mut dump_a = Vec::new();
        index.save(&mut dump_a).unwrap();
        let mut dump_b = Vec::new();
        loaded.save(&mut dump_b).unwrap();
        assert_eq!(dump_a, dump_b);
    }

    #[test]
    fn test_metadata_records_distance_and_sizes() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::with_codec(dir.path(), Codec::Gzip).unwrap();

        let index = built_index(test_dataset());
        let stats = storage.save_index("meta_test", &index).unwrap();

        let meta = storage.metadata("meta_test").unwrap();
        assert_eq!(meta.version, STORAGE_VERSION);
        assert_eq!(meta.distance, "squared_euclidean");
        assert_eq!(meta.original_size, stats.original_size);
        assert_eq!(meta.compressed_size, stats.compressed_size);
        assert!(meta.created_at > 0);
        assert_eq!(meta.created_at, meta.updated_at);
    }

    #[test]
    fn test_resave_preserves_created_at() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();

        let index = built_index(test_dataset());
        storage.save_index("twice", &index).unwrap();
        let first = storage.metadata("twice").unwrap();

        storage.save_index("twice", &index).unwrap();
        let second = storage.metadata("twice").unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert!(second.updated_at >= first.updated_at);
    }

    #[test]
    fn test_list_and_delete() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();

        let index = built_index(test_dataset());
        storage.save_index("alpha", &index).unwrap();
        storage.save_index("beta", &index).unwrap();

        assert_eq!(storage.list().unwrap(), vec!["alpha", "beta"]);

        storage.delete("alpha").unwrap();
        assert!(!storage.exists("alpha"));
        assert_eq!(storage.list().unwrap(), vec!["beta"]);

        // Deleting a missing item is not an error
        storage.delete("alpha").unwrap();
    }

    #[test]
    fn test_load_missing_index() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();

        let err = storage.load_index("nope", test_dataset(), SquaredEuclidean);
        assert!(matches!(err, Err(AnnError::StorageError(_))));
    }

    #[test]
    fn test_corrupt_payload_detected() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();

        let dataset = test_dataset();
        let index = built_index(dataset.clone());
        storage.save_index("corrupt", &index).unwrap();

        // Truncate the data file behind the storage manager's back
        let data_path = dir.path().join("corrupt.data");
        let bytes = fs::read(&data_path).unwrap();
        fs::write(&data_path, &bytes[..bytes.len() / 2]).unwrap();

        let err = storage.load_index("corrupt", dataset, SquaredEuclidean);
        assert!(matches!(err, Err(AnnError::StorageError(_))));
    }

    #[test]
    fn test_rejects_file_as_base_path() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("a_file");
        fs::write(&file_path, b"x").unwrap();

        assert!(matches!(
            FileStorage::new(&file_path),
            Err(AnnError::StorageError(_))
        ));
    }
}
