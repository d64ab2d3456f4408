//! Hierarchical k-means tree index
//!
//! This module provides approximate nearest-neighbor search over a tree of
//! cluster centroids:
//!
//! - [`KMeansTree`]: the index itself: recursive balanced k-means partitioning,
//!   best-bin-first search under a bounded `checks` budget, incremental
//!   insertion, and minimum-variance cluster extraction
//! - [`seeding`]: the three initial-center strategies (random, Gonzales
//!   farthest-point, k-means++)
//! - [`KnnResultSet`]: the default k-NN result collector
//!
//! # Accuracy vs. work
//!
//! A query's `checks` budget bounds how many dataset points the search may
//! score. `Checks::Unlimited` walks the whole tree and returns the exact
//! k-NN; a bounded budget trades recall for speed. The `cb_index` weight
//! biases branch ordering toward large-variance clusters (0 = pure centroid
//! distance).

pub mod kmeans_tree;
pub mod result;
pub mod seeding;

pub use kmeans_tree::{Checks, KMeansTree, KMeansTreeConfig, SearchParams};
pub use result::{KnnResultSet, ResultSet};
pub use seeding::CentersInit;
