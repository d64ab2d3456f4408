//! Hierarchical k-means tree index implementation
//!
//! Based on the priority-search k-means tree described in "Fast Approximate
//! Nearest Neighbors with Automatic Algorithm Configuration" by Muja & Lowe
//! (2009).
//!
//! The tree is built by recursive balanced k-means clustering:
//! - Every internal node holds exactly `branching` children, one per cluster
//!   of a Lloyd refinement of the node's members
//! - Every node carries its centroid (pivot), the maximum pivot-to-member
//!   distance (radius) and the mean pivot-to-member distance (variance)
//! - Recursion stops when a node holds fewer than `branching` points, or when
//!   seeding cannot produce `branching` distinct centers
//!
//! Queries run in one of two modes selected by the `checks` budget: an exact
//! depth-first walk over the whole tree, or best-bin-first search that
//! descends to the closest child at every node while parking the siblings in
//! a priority queue, resuming from the most promising parked branch until the
//! budget is spent.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::{Read, Write};

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::index::result::{KnnResultSet, ResultSet};
use crate::index::seeding::CentersInit;
use crate::matrix::Matrix;
use crate::vector::{Distance, SquaredEuclidean};
use crate::{AnnError, Result};

const INDEX_MAGIC: u32 = 0x424B_4D54; // "BKMT"
const INDEX_FORMAT_VERSION: u32 = 1;

/// Configuration for the k-means tree index
#[derive(Debug, Clone)]
pub struct KMeansTreeConfig {
    /// Tree fan-out; also the cluster count of every Lloyd refinement.
    /// Must be at least 2.
    pub branching: usize,

    /// Maximum Lloyd iterations per refinement. Negative means iterate until
    /// convergence.
    pub iterations: i32,

    /// Strategy for choosing the initial cluster centers
    pub centers_init: CentersInit,

    /// Cluster-boundary weight applied to child variance when ordering
    /// deferred branches during search. 0 orders branches purely by centroid
    /// distance; larger values favor exploring high-variance clusters.
    pub cb_index: f32,

    /// Copy the dataset into an index-owned buffer at construction
    pub copy_dataset: bool,

    /// RNG seed for seeding draws. `None` seeds from entropy; fixing it makes
    /// builds reproducible.
    pub seed: Option<u64>,
}

impl Default for KMeansTreeConfig {
    fn default() -> Self {
        Self {
            branching: 32,
            iterations: 11,
            centers_init: CentersInit::Random,
            cb_index: 0.4,
            copy_dataset: false,
            seed: None,
        }
    }
}

impl KMeansTreeConfig {
    /// Set the branching factor
    pub fn with_branching(mut self, branching: usize) -> Self {
        self.branching = branching;
        self
    }

    /// Set the Lloyd iteration cap (negative = until convergence)
    pub fn with_iterations(mut self, iterations: i32) -> Self {
        self.iterations = iterations;
        self
    }

    /// Set the center seeding strategy
    pub fn with_centers_init(mut self, centers_init: CentersInit) -> Self {
        self.centers_init = centers_init;
        self
    }

    /// Set the cluster-boundary weight
    pub fn with_cb_index(mut self, cb_index: f32) -> Self {
        self.cb_index = cb_index;
        self
    }

    /// Copy the dataset into an index-owned buffer
    pub fn with_copy_dataset(mut self, copy: bool) -> Self {
        self.copy_dataset = copy;
        self
    }

    /// Fix the RNG seed for reproducible builds
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// Per-query work budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checks {
    /// Walk the whole tree; returns the exact nearest neighbors
    Unlimited,
    /// Best-bin-first search scoring at most this many dataset points
    Bounded(usize),
}

/// Parameters that influence a single search call
#[derive(Debug, Clone, Copy)]
pub struct SearchParams {
    /// Work budget for this query
    pub checks: Checks,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            checks: Checks::Bounded(32),
        }
    }
}

impl SearchParams {
    /// Exact-search parameters
    pub fn unlimited() -> Self {
        Self {
            checks: Checks::Unlimited,
        }
    }

    /// Best-bin-first parameters with the given point budget
    pub fn bounded(max_checks: usize) -> Self {
        Self {
            checks: Checks::Bounded(max_checks),
        }
    }
}

/// Node in the hierarchical k-means tree
///
/// `children` is empty exactly for leaves; leaves keep their member dataset
/// indices sorted ascending.
#[derive(Debug, Clone, Default)]
struct Node {
    /// Cluster center, in distance-result precision
    pivot: Vec<f32>,
    /// Maximum distance from the pivot to any member point
    radius: f32,
    /// Mean distance from the pivot to the member points
    variance: f32,
    /// Number of points in the subtree
    size: usize,
    /// Depth from the root (root = 0)
    level: usize,
    /// Child nodes (internal nodes only)
    children: Vec<Node>,
    /// Member dataset indices (leaves only), sorted
    indices: Vec<usize>,
}

impl Node {
    #[inline]
    fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Deferred branch in the best-bin-first queue, min-ordered on its key
/// (child distance less the variance bonus)
struct Branch<'t> {
    key: f32,
    node: &'t Node,
}

impl PartialEq for Branch<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Branch<'_> {}

impl PartialOrd for Branch<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.key.partial_cmp(&other.key)
    }
}

impl Ord for Branch<'_> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.partial_cmp(other).unwrap_or(std::cmp::Ordering::Equal)
    }
}

/// Hierarchical k-means tree index
///
/// # Examples
/// ```
/// use bramble_core::{KMeansTree, KMeansTreeConfig, Matrix, SearchParams};
///
/// let data = vec![0.0, 0.0, 0.0, 1.0, 10.0, 10.0, 10.0, 11.0];
/// let dataset = Matrix::from_slice(&data, 4, 2).unwrap();
///
/// let config = KMeansTreeConfig::default().with_branching(2).with_seed(42);
/// let mut index = KMeansTree::new(dataset, config);
/// index.build().unwrap();
///
/// let neighbors = index.search(&[0.0, 0.5], 1, &SearchParams::unlimited()).unwrap();
/// assert!(neighbors[0].1 == 0 || neighbors[0].1 == 1);
/// ```
pub struct KMeansTree<'a, D: Distance = SquaredEuclidean> {
    /// The indexed dataset (borrowed unless copied in or grown)
    dataset: Matrix<'a>,
    /// Index parameters
    config: KMeansTreeConfig,
    /// Distance functor
    distance: D,
    /// Tree root; `None` until `build` runs
    root: Option<Node>,
    /// Feature length
    veclen: usize,
    /// Number of indexed points
    size: usize,
    /// Dataset size when the tree was last built, for the rebuild heuristic
    size_at_build: usize,
    /// Bytes pinned by node pivots
    memory_counter: usize,
}

impl<'a> KMeansTree<'a, SquaredEuclidean> {
    /// Create an index over `dataset` using squared Euclidean distance
    pub fn new(dataset: Matrix<'a>, config: KMeansTreeConfig) -> Self {
        Self::with_distance(dataset, config, SquaredEuclidean)
    }
}

impl<'a, D: Distance> KMeansTree<'a, D> {
    /// Create an index over `dataset` with a custom distance functor
    ///
    /// The tree is not built yet; call [`build`](Self::build). When
    /// `copy_dataset` is set the data is copied into an index-owned buffer,
    /// otherwise the index borrows the caller's buffer.
    pub fn with_distance(dataset: Matrix<'a>, config: KMeansTreeConfig, distance: D) -> Self {
        let dataset = if config.copy_dataset {
            dataset.into_owned()
        } else {
            dataset
        };
        let veclen = dataset.cols();
        let size = dataset.rows();
        Self {
            dataset,
            config,
            distance,
            root: None,
            veclen,
            size,
            size_at_build: 0,
            memory_counter: 0,
        }
    }

    /// Number of indexed points
    pub fn size(&self) -> usize {
        self.size
    }

    /// Feature length of the indexed points
    pub fn veclen(&self) -> usize {
        self.veclen
    }

    /// Bytes used by index bookkeeping (node pivots)
    pub fn used_memory(&self) -> usize {
        self.memory_counter
    }

    /// Index parameters
    pub fn parameters(&self) -> &KMeansTreeConfig {
        &self.config
    }

    /// True once `build` (or `load`) has produced a tree
    pub fn is_built(&self) -> bool {
        self.root.is_some()
    }

    /// Name of the distance functor the index was created with
    pub fn distance_name(&self) -> &'static str {
        self.distance.name()
    }

    /// Dataset size at the time of the last build
    pub fn size_at_build(&self) -> usize {
        self.size_at_build
    }

    /// Adjust the cluster-boundary weight used by subsequent searches
    pub fn set_cb_index(&mut self, cb_index: f32) {
        self.config.cb_index = cb_index;
    }

    fn max_iterations(&self) -> usize {
        if self.config.iterations < 0 {
            usize::MAX
        } else {
            self.config.iterations as usize
        }
    }

    fn make_rng(&self) -> StdRng {
        match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    /// Build the tree
    ///
    /// Rebuilding an already built index frees the previous tree first.
    ///
    /// # Errors
    /// Returns `AnnError::InvalidParameter` if `branching < 2` or the dataset
    /// is empty.
    pub fn build(&mut self) -> Result<()> {
        if self.config.branching < 2 {
            return Err(AnnError::InvalidParameter(
                "branching factor must be at least 2".to_string(),
            ));
        }
        if self.dataset.is_empty() {
            return Err(AnnError::InvalidParameter(
                "cannot build an index over an empty dataset".to_string(),
            ));
        }

        self.root = None;
        self.memory_counter = 0;

        let mut rng = self.make_rng();
        let mut indices: Vec<usize> = (0..self.size).collect();

        let mut root = Node::default();
        self.compute_node_statistics(&mut root, &indices);
        self.compute_clustering(&mut root, &mut indices, 0, &mut rng);

        self.root = Some(root);
        self.size_at_build = self.size;
        Ok(())
    }

    /// Append points to the dataset and fold them into the tree
    ///
    /// The dataset is copied into a fresh index-owned buffer covering old and
    /// new rows. If the index has grown past
    /// `size_at_build * rebuild_threshold` (for thresholds above 1) the whole
    /// tree is rebuilt from scratch; otherwise each point descends to its
    /// closest leaf, updating node statistics on the way down. A leaf that
    /// reaches `branching` points is re-clustered in place.
    ///
    /// # Errors
    /// Returns `AnnError::DimensionMismatch` if `points.cols()` differs from
    /// the index feature length, or `AnnError::IndexError` if the tree has
    /// not been built.
    pub fn add_points(&mut self, points: &Matrix<'_>, rebuild_threshold: f32) -> Result<()> {
        if points.cols() != self.veclen {
            return Err(AnnError::DimensionMismatch {
                expected: self.veclen,
                actual: points.cols(),
            });
        }
        let Some(mut root) = self.root.take() else {
            return Err(AnnError::IndexError(
                "index has not been built".to_string(),
            ));
        };

        let old_size = self.size;
        let new_size = old_size + points.rows();

        let mut data = Vec::with_capacity(new_size * self.veclen);
        data.extend_from_slice(self.dataset.as_slice());
        data.extend_from_slice(points.as_slice());
        self.dataset = Matrix::from_vec(data, new_size, self.veclen)?;
        self.size = new_size;

        if rebuild_threshold > 1.0
            && self.size_at_build as f32 * rebuild_threshold < self.size as f32
        {
            self.build()?;
        } else {
            let mut rng = self.make_rng();
            for i in 0..points.rows() {
                let index = old_size + i;
                let dist = self
                    .distance
                    .distance(&root.pivot, self.dataset.row(index));
                self.add_point_to_tree(&mut root, index, dist, &mut rng);
            }
            self.root = Some(root);
        }
        Ok(())
    }

    /// Find the nearest neighbors of `query`, feeding them into `result`
    ///
    /// `Checks::Unlimited` performs an exact tree walk; a bounded budget runs
    /// best-bin-first search with a query-local priority queue.
    ///
    /// # Errors
    /// Returns `AnnError::DimensionMismatch` for a query of the wrong length,
    /// or `AnnError::IndexError` if the tree has not been built.
    pub fn find_neighbors<R: ResultSet>(
        &self,
        result: &mut R,
        query: &[f32],
        params: &SearchParams,
    ) -> Result<()> {
        if query.len() != self.veclen {
            return Err(AnnError::DimensionMismatch {
                expected: self.veclen,
                actual: query.len(),
            });
        }
        let root = self
            .root
            .as_ref()
            .ok_or_else(|| AnnError::IndexError("index has not been built".to_string()))?;

        match params.checks {
            Checks::Unlimited => self.find_exact(root, result, query),
            Checks::Bounded(max_checks) => {
                // Priority queue storing branches deferred by the descent
                let mut heap: BinaryHeap<Reverse<Branch<'_>>> =
                    BinaryHeap::with_capacity(self.config.branching * 8);

                let mut checks = 0usize;
                self.find_nn(root, result, query, &mut checks, max_checks, &mut heap);

                while let Some(Reverse(branch)) = heap.pop() {
                    if checks >= max_checks && result.is_full() {
                        break;
                    }
                    self.find_nn(branch.node, result, query, &mut checks, max_checks, &mut heap);
                }
            }
        }
        Ok(())
    }

    /// Convenience wrapper: the `k` nearest `(distance, index)` pairs
    ///
    /// # Errors
    /// Same conditions as [`find_neighbors`](Self::find_neighbors).
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        params: &SearchParams,
    ) -> Result<Vec<(f32, usize)>> {
        let mut result = KnnResultSet::new(k);
        self.find_neighbors(&mut result, query, params)?;
        Ok(result.entries().to_vec())
    }

    /// Extract a clustering of up to `num_clusters` centers from the tree
    ///
    /// Takes the cut of the tree that minimizes total variance: starting from
    /// the root, the node whose split reduces the weighted variance sum the
    /// most is replaced by its children, until the budget is reached or no
    /// internal node remains. Returns the cut's pivots as an owned matrix and
    /// the clustering's mean variance.
    ///
    /// # Errors
    /// Returns `AnnError::InvalidParameter` if `num_clusters < 1`, or
    /// `AnnError::IndexError` if the tree has not been built.
    pub fn cluster_centers(&self, num_clusters: usize) -> Result<(Matrix<'static>, f32)> {
        if num_clusters < 1 {
            return Err(AnnError::InvalidParameter(
                "number of clusters must be at least 1".to_string(),
            ));
        }
        let root = self
            .root
            .as_ref()
            .ok_or_else(|| AnnError::IndexError("index has not been built".to_string()))?;

        let (clusters, variance) = self.min_variance_clusters(root, num_clusters);

        let mut data = Vec::with_capacity(clusters.len() * self.veclen);
        for node in &clusters {
            data.extend_from_slice(&node.pivot);
        }
        let centers = Matrix::from_vec(data, clusters.len(), self.veclen)?;
        Ok((centers, variance))
    }

    // ------------------------------------------------------------------
    // Build internals
    // ------------------------------------------------------------------

    /// Compute a node's pivot, radius and variance from its member indices
    fn compute_node_statistics(&mut self, node: &mut Node, indices: &[usize]) {
        let size = indices.len();
        let veclen = self.veclen;

        let mut mean = vec![0.0f32; veclen];
        for &i in indices {
            for (m, v) in mean.iter_mut().zip(self.dataset.row(i)) {
                *m += v;
            }
        }
        for m in &mut mean {
            *m /= size as f32;
        }

        let mut radius = 0.0f32;
        let mut variance = 0.0f32;
        for &i in indices {
            let dist = self.distance.distance(&mean, self.dataset.row(i));
            if dist > radius {
                radius = dist;
            }
            variance += dist;
        }
        variance /= size as f32;

        if node.pivot.is_empty() {
            self.memory_counter += veclen * std::mem::size_of::<f32>();
        }
        node.pivot = mean;
        node.radius = radius;
        node.variance = variance;
    }

    /// Recursive hierarchical clustering of `indices` under `node`
    ///
    /// The node's pivot, radius and variance are expected to be set by the
    /// caller; this fills in size, level and either children or the leaf
    /// index list. `indices` is reordered in place so that each child's
    /// members form a contiguous run.
    fn compute_clustering(
        &mut self,
        node: &mut Node,
        indices: &mut [usize],
        level: usize,
        rng: &mut StdRng,
    ) {
        let n = indices.len();
        node.size = n;
        node.level = level;

        let branching = self.config.branching;
        if n < branching {
            Self::make_leaf(node, indices);
            return;
        }

        let centers_idx =
            self.config
                .centers_init
                .choose(branching, indices, &self.dataset, &self.distance, rng);
        if centers_idx.len() < branching {
            // Degenerate seeding: not enough distinct centers
            Self::make_leaf(node, indices);
            return;
        }

        let veclen = self.veclen;

        // Working centroids accumulate in f64; an f32 mirror feeds the
        // distance functor and becomes the materialized pivots.
        let mut dcenters = vec![0.0f64; branching * veclen];
        let mut centers = vec![0.0f32; branching * veclen];
        for (c, &idx) in centers_idx.iter().enumerate() {
            let row = self.dataset.row(idx);
            for (k, &v) in row.iter().enumerate() {
                dcenters[c * veclen + k] = v as f64;
                centers[c * veclen + k] = v;
            }
        }

        // Initial assignment
        let mut count = vec![0usize; branching];
        let mut belongs_to = vec![0usize; n];
        for i in 0..n {
            let point = self.dataset.row(indices[i]);
            let mut best = 0;
            let mut best_dist = self.distance.distance(point, &centers[0..veclen]);
            for j in 1..branching {
                let dist = self
                    .distance
                    .distance(point, &centers[j * veclen..(j + 1) * veclen]);
                if dist < best_dist {
                    best = j;
                    best_dist = dist;
                }
            }
            belongs_to[i] = best;
            count[best] += 1;
        }

        let max_iterations = self.max_iterations();
        let mut converged = false;
        let mut iteration = 0;
        while !converged && iteration < max_iterations {
            converged = true;
            iteration += 1;

            // Recompute cluster centers from the current assignment
            for c in dcenters.iter_mut() {
                *c = 0.0;
            }
            for i in 0..n {
                let row = self.dataset.row(indices[i]);
                let center = &mut dcenters[belongs_to[i] * veclen..(belongs_to[i] + 1) * veclen];
                for (k, &v) in row.iter().enumerate() {
                    center[k] += v as f64;
                }
            }
            for j in 0..branching {
                if count[j] > 0 {
                    let inv = 1.0 / count[j] as f64;
                    for k in 0..veclen {
                        dcenters[j * veclen + k] *= inv;
                    }
                }
            }
            for (dst, &src) in centers.iter_mut().zip(dcenters.iter()) {
                *dst = src as f32;
            }

            // Reassign points to clusters; strictly-closer wins, so ties keep
            // the lower cluster index
            for i in 0..n {
                let point = self.dataset.row(indices[i]);
                let mut new_centroid = 0;
                let mut best_dist = self.distance.distance(point, &centers[0..veclen]);
                for j in 1..branching {
                    let dist = self
                        .distance
                        .distance(point, &centers[j * veclen..(j + 1) * veclen]);
                    if dist < best_dist {
                        new_centroid = j;
                        best_dist = dist;
                    }
                }
                if new_centroid != belongs_to[i] {
                    count[belongs_to[i]] -= 1;
                    count[new_centroid] += 1;
                    belongs_to[i] = new_centroid;
                    converged = false;
                }
            }

            // Refill any cluster that converged to empty from a donor with
            // more than one member. The donor scan is bounded; while
            // n >= branching a donor always exists.
            for i in 0..branching {
                if count[i] > 0 {
                    continue;
                }
                let mut donor = None;
                for step in 1..branching {
                    let j = (i + step) % branching;
                    if count[j] > 1 {
                        donor = Some(j);
                        break;
                    }
                }
                let Some(j) = donor else {
                    continue;
                };
                if let Some(member) = belongs_to.iter().position(|&b| b == j) {
                    belongs_to[member] = i;
                    count[j] -= 1;
                    count[i] += 1;
                    converged = false;
                }
            }
        }

        if count.iter().any(|&c| c == 0) {
            // No donor could fill a cluster; fall back to a leaf
            Self::make_leaf(node, indices);
            return;
        }

        // Materialize the final centroids as child pivots
        self.memory_counter += branching * veclen * std::mem::size_of::<f32>();

        // Partition members in place, one contiguous run per cluster, and
        // compute each child's radius and variance against its pivot
        let mut children = Vec::with_capacity(branching);
        let mut start = 0;
        let mut end = 0;
        for c in 0..branching {
            let s = count[c];
            let center = &centers[c * veclen..(c + 1) * veclen];

            let mut radius = 0.0f32;
            let mut variance = 0.0f32;
            for i in end..n {
                if belongs_to[i] == c {
                    let dist = self.distance.distance(center, self.dataset.row(indices[i]));
                    variance += dist;
                    if dist > radius {
                        radius = dist;
                    }
                    indices.swap(i, end);
                    belongs_to.swap(i, end);
                    end += 1;
                }
            }
            variance /= s as f32;

            let mut child = Node {
                pivot: center.to_vec(),
                radius,
                variance,
                ..Node::default()
            };
            self.compute_clustering(&mut child, &mut indices[start..end], level + 1, rng);
            children.push(child);
            start = end;
        }

        node.children = children;
        node.indices = Vec::new();
    }

    fn make_leaf(node: &mut Node, indices: &[usize]) {
        node.indices = indices.to_vec();
        node.indices.sort_unstable();
        node.children = Vec::new();
    }

    /// Fold one new point into the subtree under `node`
    ///
    /// `dist_to_pivot` is the distance from the node's pivot to the point.
    /// Radius grows monotonically; variance becomes a running-mean
    /// approximation until the next statistics recompute.
    fn add_point_to_tree(
        &mut self,
        node: &mut Node,
        index: usize,
        dist_to_pivot: f32,
        rng: &mut StdRng,
    ) {
        if dist_to_pivot > node.radius {
            node.radius = dist_to_pivot;
        }
        node.variance =
            (node.size as f32 * node.variance + dist_to_pivot) / (node.size as f32 + 1.0);
        node.size += 1;

        if node.is_leaf() {
            node.indices.push(index);

            let indices = std::mem::take(&mut node.indices);
            self.compute_node_statistics(node, &indices);
            node.indices = indices;

            if node.indices.len() >= self.config.branching {
                let mut indices = std::mem::take(&mut node.indices);
                let level = node.level;
                self.compute_clustering(node, &mut indices, level, rng);
            }
        } else {
            let mut closest = 0;
            let mut best_dist = self
                .distance
                .distance(&node.children[0].pivot, self.dataset.row(index));
            for (i, child) in node.children.iter().enumerate().skip(1) {
                let dist = self.distance.distance(&child.pivot, self.dataset.row(index));
                if dist < best_dist {
                    best_dist = dist;
                    closest = i;
                }
            }
            self.add_point_to_tree(&mut node.children[closest], index, best_dist, rng);
        }
    }

    // ------------------------------------------------------------------
    // Search internals
    // ------------------------------------------------------------------

    /// Conservative two-term branch rejection test
    ///
    /// Rejects a node when the query provably cannot contain a point closer
    /// than the current worst result. The second term keeps the bound valid
    /// for distance functors where the linear term alone is unsafe.
    #[inline]
    fn prune(&self, node: &Node, query: &[f32], worst_dist: f32) -> bool {
        let bsq = self.distance.distance(query, &node.pivot);
        let rsq = node.radius;
        let wsq = worst_dist;

        let val = bsq - rsq - wsq;
        if val > 0.0 {
            let val2 = val * val - 4.0 * rsq * wsq;
            if val2 > 0.0 {
                return true;
            }
        }
        false
    }

    /// One best-bin-first descent; siblings along the way are parked in the
    /// priority queue for later resumption
    fn find_nn<'t, R: ResultSet>(
        &'t self,
        node: &'t Node,
        result: &mut R,
        query: &[f32],
        checks: &mut usize,
        max_checks: usize,
        heap: &mut BinaryHeap<Reverse<Branch<'t>>>,
    ) {
        if self.prune(node, query, result.worst_dist()) {
            return;
        }

        if node.is_leaf() {
            if *checks >= max_checks && result.is_full() {
                return;
            }
            *checks += node.size;
            for &index in &node.indices {
                let dist = self.distance.distance(self.dataset.row(index), query);
                result.add_point(dist, index);
            }
        } else {
            let closest = self.explore_node_branches(node, query, heap);
            self.find_nn(
                &node.children[closest],
                result,
                query,
                checks,
                max_checks,
                heap,
            );
        }
    }

    /// Score the children of `node` against the query; the closest child's
    /// position is returned, the rest are pushed onto the queue keyed by
    /// distance less the variance bonus
    fn explore_node_branches<'t>(
        &self,
        node: &'t Node,
        query: &[f32],
        heap: &mut BinaryHeap<Reverse<Branch<'t>>>,
    ) -> usize {
        let domain_distances: Vec<f32> = node
            .children
            .iter()
            .map(|child| self.distance.distance(query, &child.pivot))
            .collect();

        let mut best_index = 0;
        for i in 1..domain_distances.len() {
            if domain_distances[i] < domain_distances[best_index] {
                best_index = i;
            }
        }

        for (i, child) in node.children.iter().enumerate() {
            if i != best_index {
                let key = domain_distances[i] - self.config.cb_index * child.variance;
                heap.push(Reverse(Branch { key, node: child }));
            }
        }

        best_index
    }

    /// Exact nearest-neighbor search by full traversal, children visited in
    /// ascending distance order
    fn find_exact<R: ResultSet>(&self, node: &Node, result: &mut R, query: &[f32]) {
        if self.prune(node, query, result.worst_dist()) {
            return;
        }

        if node.is_leaf() {
            for &index in &node.indices {
                let dist = self.distance.distance(self.dataset.row(index), query);
                result.add_point(dist, index);
            }
        } else {
            let order = self.center_ordering(node, query);
            for &i in &order {
                self.find_exact(&node.children[i], result, query);
            }
        }
    }

    /// Child visit order by ascending distance to the query (insertion sort;
    /// branching factors are small)
    fn center_ordering(&self, node: &Node, query: &[f32]) -> Vec<usize> {
        let b = node.children.len();
        let mut domain_distances = vec![0.0f32; b];
        let mut sort_indices = vec![0usize; b];

        for i in 0..b {
            let dist = self.distance.distance(query, &node.children[i].pivot);
            let mut j = 0;
            while j < i && domain_distances[j] < dist {
                j += 1;
            }
            for k in (j + 1..=i).rev() {
                domain_distances[k] = domain_distances[k - 1];
                sort_indices[k] = sort_indices[k - 1];
            }
            domain_distances[j] = dist;
            sort_indices[j] = i;
        }

        sort_indices
    }

    // ------------------------------------------------------------------
    // Variance-cut extraction
    // ------------------------------------------------------------------

    /// Grow a cut of the tree by repeatedly splitting the node whose split
    /// minimizes the resulting weighted variance total
    fn min_variance_clusters<'t>(
        &'t self,
        root: &'t Node,
        clusters_length: usize,
    ) -> (Vec<&'t Node>, f32) {
        let mut clusters: Vec<&Node> = vec![root];
        let mut mean_variance = root.variance * root.size as f32;

        while clusters.len() < clusters_length {
            let mut min_variance = f32::MAX;
            let mut split_index = None;

            for (i, cluster) in clusters.iter().enumerate() {
                if cluster.is_leaf() {
                    continue;
                }
                let mut variance = mean_variance - cluster.variance * cluster.size as f32;
                for child in &cluster.children {
                    variance += child.variance * child.size as f32;
                }
                if variance < min_variance {
                    min_variance = variance;
                    split_index = Some(i);
                }
            }

            let Some(i) = split_index else {
                break;
            };
            if self.config.branching + clusters.len() - 1 > clusters_length {
                break;
            }

            mean_variance = min_variance;

            let to_split = clusters[i];
            clusters[i] = &to_split.children[0];
            for child in &to_split.children[1..] {
                clusters.push(child);
            }
        }

        (clusters, mean_variance / root.size as f32)
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Dump the index structure to a byte sink
    ///
    /// Writes a header (magic, format version, scalar parameters, dataset
    /// shape) followed by the pre-order tree dump. The dataset itself is not
    /// persisted; [`load`](Self::load) expects it from the caller.
    ///
    /// # Errors
    /// Returns `AnnError::IndexError` if the tree has not been built; I/O
    /// failures propagate as `AnnError::IoError`.
    pub fn save<W: Write>(&self, writer: &mut W) -> Result<()> {
        let root = self
            .root
            .as_ref()
            .ok_or_else(|| AnnError::IndexError("index has not been built".to_string()))?;

        write_u32(writer, INDEX_MAGIC)?;
        write_u32(writer, INDEX_FORMAT_VERSION)?;
        write_u64(writer, self.config.branching as u64)?;
        write_i64(writer, self.config.iterations as i64)?;
        write_u64(writer, self.memory_counter as u64)?;
        write_f32(writer, self.config.cb_index)?;
        write_u64(writer, self.veclen as u64)?;
        write_u64(writer, self.size as u64)?;

        self.save_tree(writer, root)
    }

    fn save_tree<W: Write>(&self, writer: &mut W, node: &Node) -> Result<()> {
        for &v in &node.pivot {
            write_f32(writer, v)?;
        }
        write_f32(writer, node.radius)?;
        write_f32(writer, node.variance)?;
        write_u64(writer, node.size as u64)?;
        write_u64(writer, node.level as u64)?;
        write_u64(writer, node.children.len() as u64)?;

        if node.children.is_empty() {
            for &index in &node.indices {
                write_u64(writer, index as u64)?;
            }
        } else {
            for child in &node.children {
                self.save_tree(writer, child)?;
            }
        }
        Ok(())
    }

    /// Reconstruct an index from a structural dump and its dataset
    ///
    /// The dataset must be the one the index was built over; its shape is
    /// validated against the stored header.
    ///
    /// # Errors
    /// Returns `AnnError::StorageError` for an unrecognized or incompatible
    /// dump, `AnnError::DimensionMismatch` when the dataset shape disagrees
    /// with the header, and `AnnError::IoError` for stream failures.
    pub fn load<R: Read>(dataset: Matrix<'a>, distance: D, reader: &mut R) -> Result<Self> {
        let magic = read_u32(reader)?;
        if magic != INDEX_MAGIC {
            return Err(AnnError::StorageError(
                "not a k-means tree index dump".to_string(),
            ));
        }
        let version = read_u32(reader)?;
        if version != INDEX_FORMAT_VERSION {
            return Err(AnnError::StorageError(format!(
                "incompatible index format version: expected {}, got {}",
                INDEX_FORMAT_VERSION, version
            )));
        }

        let branching = read_u64(reader)? as usize;
        let iterations = read_i64(reader)? as i32;
        let memory_counter = read_u64(reader)? as usize;
        let cb_index = read_f32(reader)?;
        let veclen = read_u64(reader)? as usize;
        let size = read_u64(reader)? as usize;

        if dataset.cols() != veclen {
            return Err(AnnError::DimensionMismatch {
                expected: veclen,
                actual: dataset.cols(),
            });
        }
        if dataset.rows() != size {
            return Err(AnnError::StorageError(format!(
                "dataset has {} rows but the stored index covers {}",
                dataset.rows(),
                size
            )));
        }

        let root = Self::load_tree(reader, veclen)?;

        let config = KMeansTreeConfig {
            branching,
            iterations,
            cb_index,
            ..KMeansTreeConfig::default()
        };

        Ok(Self {
            dataset,
            config,
            distance,
            root: Some(root),
            veclen,
            size,
            size_at_build: size,
            memory_counter,
        })
    }

    fn load_tree<R: Read>(reader: &mut R, veclen: usize) -> Result<Node> {
        let mut pivot = vec![0.0f32; veclen];
        for v in &mut pivot {
            *v = read_f32(reader)?;
        }
        let radius = read_f32(reader)?;
        let variance = read_f32(reader)?;
        let size = read_u64(reader)? as usize;
        let level = read_u64(reader)? as usize;
        let child_count = read_u64(reader)? as usize;

        let mut children = Vec::new();
        let mut indices = Vec::new();
        if child_count == 0 {
            indices.reserve(size);
            for _ in 0..size {
                indices.push(read_u64(reader)? as usize);
            }
        } else {
            children.reserve(child_count);
            for _ in 0..child_count {
                children.push(Self::load_tree(reader, veclen)?);
            }
        }

        Ok(Node {
            pivot,
            radius,
            variance,
            size,
            level,
            children,
            indices,
        })
    }
}

fn write_u32<W: Write>(writer: &mut W, v: u32) -> Result<()> {
    writer.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_u64<W: Write>(writer: &mut W, v: u64) -> Result<()> {
    writer.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_i64<W: Write>(writer: &mut W, v: i64) -> Result<()> {
    writer.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_f32<W: Write>(writer: &mut W, v: f32) -> Result<()> {
    writer.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_i64<R: Read>(reader: &mut R) -> Result<i64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

fn read_f32<R: Read>(reader: &mut R) -> Result<f32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(f32::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn random_dataset(n: usize, d: usize, seed: u64) -> Matrix<'static> {
        let mut rng = StdRng::seed_from_u64(seed);
        let data: Vec<f32> = (0..n * d).map(|_| rng.gen::<f32>() * 10.0).collect();
        Matrix::from_vec(data, n, d).unwrap()
    }

    fn grid_dataset() -> Matrix<'static> {
        // 100 points on a 10x10 unit grid
        let mut data = Vec::with_capacity(200);
        for y in 0..10 {
            for x in 0..10 {
                data.push(x as f32);
                data.push(y as f32);
            }
        }
        Matrix::from_vec(data, 100, 2).unwrap()
    }

    fn brute_force_knn(dataset: &Matrix<'_>, query: &[f32], k: usize) -> Vec<(f32, usize)> {
        let mut result = KnnResultSet::new(k);
        for i in 0..dataset.rows() {
            let dist = SquaredEuclidean.distance(dataset.row(i), query);
            result.add_point(dist, i);
        }
        result.entries().to_vec()
    }

    fn gather_leaf_indices(node: &Node, out: &mut Vec<usize>) {
        if node.is_leaf() {
            out.extend_from_slice(&node.indices);
        } else {
            for child in &node.children {
                gather_leaf_indices(child, out);
            }
        }
    }

    /// Walk the tree checking the structural invariants: exactly-branching
    /// children with consistent sizes, sorted under-capacity leaves, and the
    /// radius upper bound.
    fn check_invariants(tree: &KMeansTree<'_>, node: &Node, branching: usize) {
        if node.is_leaf() {
            assert_eq!(node.size, node.indices.len());
            assert!(node.indices.len() < branching, "leaf over capacity");
            for w in node.indices.windows(2) {
                assert!(w[0] < w[1], "leaf indices not sorted");
            }
        } else {
            assert_eq!(node.children.len(), branching);
            let child_total: usize = node.children.iter().map(|c| c.size).sum();
            assert_eq!(node.size, child_total);
            for child in &node.children {
                assert_eq!(child.level, node.level + 1);
                check_invariants(tree, child, branching);
            }
        }

        let mut members = Vec::new();
        gather_leaf_indices(node, &mut members);
        assert_eq!(members.len(), node.size);
        for &i in &members {
            let dist = SquaredEuclidean.distance(&node.pivot, tree.dataset.row(i));
            assert!(
                dist <= node.radius * (1.0 + 1e-5) + 1e-6,
                "member {} at distance {} outside radius {}",
                i,
                dist,
                node.radius
            );
        }
    }

    #[test]
    fn test_build_two_well_separated_pairs() {
        let data = vec![0.0, 0.0, 0.0, 1.0, 10.0, 10.0, 10.0, 11.0];
        let dataset = Matrix::from_vec(data, 4, 2).unwrap();
        let config = KMeansTreeConfig::default().with_branching(2).with_seed(7);
        let mut index = KMeansTree::new(dataset, config);
        index.build().unwrap();

        let root = index.root.as_ref().unwrap();
        assert_eq!(root.size, 4);
        assert_eq!(root.children.len(), 2);

        let mut subtrees: Vec<Vec<usize>> = root
            .children
            .iter()
            .map(|child| {
                let mut indices = Vec::new();
                gather_leaf_indices(child, &mut indices);
                indices.sort_unstable();
                indices
            })
            .collect();
        subtrees.sort();
        assert_eq!(subtrees, vec![vec![0, 1], vec![2, 3]]);
    }

    #[test]
    fn test_exact_query_on_small_dataset() {
        let data = vec![0.0, 0.0, 0.0, 1.0, 10.0, 10.0, 10.0, 11.0];
        let dataset = Matrix::from_vec(data, 4, 2).unwrap();
        let config = KMeansTreeConfig::default().with_branching(2).with_seed(7);
        let mut index = KMeansTree::new(dataset, config);
        index.build().unwrap();

        let neighbors = index
            .search(&[0.0, 0.5], 1, &SearchParams::unlimited())
            .unwrap();
        assert_eq!(neighbors.len(), 1);
        let (dist, idx) = neighbors[0];
        assert!(idx == 0 || idx == 1);
        assert!((dist - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_identical_points_demote_root_to_leaf() {
        let dataset = Matrix::from_vec(vec![3.0, 4.0].repeat(5), 5, 2).unwrap();
        let config = KMeansTreeConfig::default().with_branching(3).with_seed(1);
        let mut index = KMeansTree::new(dataset, config);
        index.build().unwrap();

        let root = index.root.as_ref().unwrap();
        assert!(root.is_leaf());
        assert_eq!(root.size, 5);
        assert_eq!(root.indices, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_tree_invariants_random_data() {
        for init in [CentersInit::Random, CentersInit::Gonzales, CentersInit::KMeansPp] {
            let dataset = random_dataset(300, 8, 17);
            let config = KMeansTreeConfig::default()
                .with_branching(4)
                .with_centers_init(init)
                .with_seed(17);
            let mut index = KMeansTree::new(dataset, config);
            index.build().unwrap();

            let root = index.root.as_ref().unwrap();
            assert_eq!(root.size, 300);
            assert_eq!(root.level, 0);
            check_invariants(&index, root, 4);

            // Leaves partition the full point set
            let mut all = Vec::new();
            gather_leaf_indices(root, &mut all);
            all.sort_unstable();
            assert_eq!(all, (0..300).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_exact_search_matches_brute_force() {
        let dataset = random_dataset(200, 8, 23);
        let config = KMeansTreeConfig::default().with_branching(4).with_seed(23);
        let mut index = KMeansTree::new(dataset.clone(), config);
        index.build().unwrap();

        let mut rng = StdRng::seed_from_u64(99);
        for _ in 0..10 {
            let query: Vec<f32> = (0..8).map(|_| rng.gen::<f32>() * 10.0).collect();
            let expected = brute_force_knn(&dataset, &query, 10);
            let got = index
                .search(&query, 10, &SearchParams::unlimited())
                .unwrap();
            assert_eq!(got.len(), 10);
            let got_indices: Vec<usize> = got.iter().map(|&(_, i)| i).collect();
            let expected_indices: Vec<usize> = expected.iter().map(|&(_, i)| i).collect();
            assert_eq!(got_indices, expected_indices);
        }
    }

    #[test]
    fn test_bbf_returns_k_and_respects_budget_shape() {
        let dataset = random_dataset(500, 8, 31);
        let config = KMeansTreeConfig::default().with_branching(8).with_seed(31);
        let mut index = KMeansTree::new(dataset, config);
        index.build().unwrap();

        let query = vec![5.0; 8];
        let got = index.search(&query, 10, &SearchParams::bounded(64)).unwrap();
        assert_eq!(got.len(), 10);
        for w in got.windows(2) {
            assert!(w[0].0 <= w[1].0);
        }
    }

    #[test]
    fn test_bbf_monotone_in_checks() {
        let dataset = random_dataset(500, 8, 37);
        let config = KMeansTreeConfig::default().with_branching(8).with_seed(37);
        let mut index = KMeansTree::new(dataset, config);
        index.build().unwrap();

        let mut rng = StdRng::seed_from_u64(4);
        for _ in 0..5 {
            let query: Vec<f32> = (0..8).map(|_| rng.gen::<f32>() * 10.0).collect();
            let mut prev: Option<Vec<(f32, usize)>> = None;
            for budget in [16, 32, 64, 128, 256] {
                let got = index
                    .search(&query, 10, &SearchParams::bounded(budget))
                    .unwrap();
                if let Some(prev) = &prev {
                    for (old, new) in prev.iter().zip(got.iter()) {
                        assert!(
                            new.0 <= old.0,
                            "budget {} worsened a neighbor: {} -> {}",
                            budget,
                            old.0,
                            new.0
                        );
                    }
                }
                prev = Some(got);
            }
        }
    }

    #[test]
    fn test_bbf_larger_budget_finds_exact_result() {
        let dataset = random_dataset(200, 4, 41);
        let config = KMeansTreeConfig::default().with_branching(4).with_seed(41);
        let mut index = KMeansTree::new(dataset.clone(), config);
        index.build().unwrap();

        // A budget covering the whole dataset degenerates to exact search
        let query = vec![3.0, 3.0, 3.0, 3.0];
        let exact = brute_force_knn(&dataset, &query, 5);
        let got = index.search(&query, 5, &SearchParams::bounded(200)).unwrap();
        let got_indices: Vec<usize> = got.iter().map(|&(_, i)| i).collect();
        let exact_indices: Vec<usize> = exact.iter().map(|&(_, i)| i).collect();
        assert_eq!(got_indices, exact_indices);
    }

    #[test]
    fn test_deterministic_build_with_seed() {
        let dataset = random_dataset(150, 4, 53);
        for init in [CentersInit::Random, CentersInit::Gonzales, CentersInit::KMeansPp] {
            let config = KMeansTreeConfig::default()
                .with_branching(4)
                .with_centers_init(init)
                .with_seed(1234);

            let mut a = KMeansTree::new(dataset.clone(), config.clone());
            a.build().unwrap();
            let mut b = KMeansTree::new(dataset.clone(), config);
            b.build().unwrap();

            let mut dump_a = Vec::new();
            a.save(&mut dump_a).unwrap();
            let mut dump_b = Vec::new();
            b.save(&mut dump_b).unwrap();
            assert_eq!(dump_a, dump_b, "{:?} build not deterministic", init);
        }
    }

    #[test]
    fn test_add_points_without_rebuild() {
        let base = random_dataset(300, 4, 61);
        let extra = random_dataset(30, 4, 62);

        let config = KMeansTreeConfig::default().with_branching(4).with_seed(61);
        let mut index = KMeansTree::new(base.clone(), config);
        index.build().unwrap();
        assert_eq!(index.size_at_build(), 300);

        index.add_points(&extra, 2.0).unwrap();
        assert_eq!(index.size(), 330);
        // 330 < 300 * 2.0: the rebuild heuristic must not fire
        assert_eq!(index.size_at_build(), 300);
        assert!(index.dataset.is_owned());

        // Exact search stays exact after incremental inserts
        let mut all = Vec::with_capacity(330 * 4);
        all.extend_from_slice(base.as_slice());
        all.extend_from_slice(extra.as_slice());
        let full = Matrix::from_vec(all, 330, 4).unwrap();

        let mut rng = StdRng::seed_from_u64(8);
        for _ in 0..5 {
            let query: Vec<f32> = (0..4).map(|_| rng.gen::<f32>() * 10.0).collect();
            let expected = brute_force_knn(&full, &query, 10);
            let got = index
                .search(&query, 10, &SearchParams::unlimited())
                .unwrap();
            let got_indices: Vec<usize> = got.iter().map(|&(_, i)| i).collect();
            let expected_indices: Vec<usize> = expected.iter().map(|&(_, i)| i).collect();
            assert_eq!(got_indices, expected_indices);
        }
    }

    #[test]
    fn test_add_points_rebuild_matches_fresh_build() {
        let base = random_dataset(100, 4, 71);
        let extra = random_dataset(200, 4, 72);

        let config = KMeansTreeConfig::default().with_branching(4).with_seed(71);

        let mut incremental = KMeansTree::new(base.clone(), config.clone());
        incremental.build().unwrap();
        // 300 > 100 * 1.5: forces a full rebuild over the merged dataset
        incremental.add_points(&extra, 1.5).unwrap();
        assert_eq!(incremental.size_at_build(), 300);

        let mut all = Vec::with_capacity(300 * 4);
        all.extend_from_slice(base.as_slice());
        all.extend_from_slice(extra.as_slice());
        let full = Matrix::from_vec(all, 300, 4).unwrap();
        let mut fresh = KMeansTree::new(full, config);
        fresh.build().unwrap();

        let mut dump_incremental = Vec::new();
        incremental.save(&mut dump_incremental).unwrap();
        let mut dump_fresh = Vec::new();
        fresh.save(&mut dump_fresh).unwrap();
        assert_eq!(dump_incremental, dump_fresh);
    }

    #[test]
    fn test_grown_leaf_reclusters_in_place() {
        let base = random_dataset(40, 2, 81);
        let config = KMeansTreeConfig::default().with_branching(4).with_seed(81);
        let mut index = KMeansTree::new(base, config);
        index.build().unwrap();

        // Doubling the point count overflows leaves and triggers in-place
        // re-clustering on the insert path
        let extra = random_dataset(40, 2, 82);
        index.add_points(&extra, 0.0).unwrap();
        assert_eq!(index.size(), 80);

        let root = index.root.as_ref().unwrap();
        let mut all = Vec::new();
        gather_leaf_indices(root, &mut all);
        all.sort_unstable();
        assert_eq!(all, (0..80).collect::<Vec<_>>());
    }

    #[test]
    fn test_cluster_centers_single_cluster_is_root() {
        let dataset = grid_dataset();
        let config = KMeansTreeConfig::default()
            .with_branching(4)
            .with_centers_init(CentersInit::KMeansPp)
            .with_iterations(20)
            .with_seed(5);
        let mut index = KMeansTree::new(dataset.clone(), config);
        index.build().unwrap();

        let (centers, variance) = index.cluster_centers(1).unwrap();
        assert_eq!(centers.rows(), 1);
        // Root pivot is the grid mean
        assert!((centers.row(0)[0] - 4.5).abs() < 1e-5);
        assert!((centers.row(0)[1] - 4.5).abs() < 1e-5);

        // The reported variance is the mean distance from the root pivot
        let expected: f32 = (0..100)
            .map(|i| SquaredEuclidean.distance(centers.row(0), dataset.row(i)))
            .sum::<f32>()
            / 100.0;
        assert!((variance - expected).abs() < 1e-4);
    }

    #[test]
    fn test_cluster_centers_cut_variance_is_consistent() {
        let dataset = grid_dataset();
        let config = KMeansTreeConfig::default()
            .with_branching(4)
            .with_centers_init(CentersInit::KMeansPp)
            .with_iterations(20)
            .with_seed(5);
        let mut index = KMeansTree::new(dataset.clone(), config);
        index.build().unwrap();

        let (centers, variance) = index.cluster_centers(4).unwrap();
        assert_eq!(centers.rows(), 4);
        for i in 0..4 {
            for &v in centers.row(i) {
                assert!((0.0..=9.0).contains(&v));
            }
        }

        // Recompute the cut's weighted variance from the tree membership
        let root = index.root.as_ref().unwrap();
        let (clusters, _) = index.min_variance_clusters(root, 4);
        let mut total = 0.0f32;
        for node in &clusters {
            let mut members = Vec::new();
            gather_leaf_indices(node, &mut members);
            for &m in &members {
                total += SquaredEuclidean.distance(&node.pivot, dataset.row(m));
            }
        }
        assert!((variance - total / 100.0).abs() < 1e-3);
    }

    #[test]
    fn test_cluster_centers_budget_stops_before_overshoot() {
        let dataset = grid_dataset();
        let config = KMeansTreeConfig::default().with_branching(4).with_seed(5);
        let mut index = KMeansTree::new(dataset, config);
        index.build().unwrap();

        // Splitting past 1 cluster needs room for branching more; a budget of
        // 3 cannot fit a 4-way split, so only the root comes back
        let (centers, _) = index.cluster_centers(3).unwrap();
        assert_eq!(centers.rows(), 1);

        // A budget of 7 fits exactly two 4-way splits (1 -> 4 -> 7)
        let (centers, _) = index.cluster_centers(7).unwrap();
        assert_eq!(centers.rows(), 7);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dataset = random_dataset(120, 6, 91);
        let config = KMeansTreeConfig::default().with_branching(4).with_seed(91);
        let mut index = KMeansTree::new(dataset.clone(), config);
        index.build().unwrap();

        let mut dump = Vec::new();
        index.save(&mut dump).unwrap();

        let loaded =
            KMeansTree::load(dataset.clone(), SquaredEuclidean, &mut dump.as_slice()).unwrap();
        assert_eq!(loaded.size(), 120);
        assert_eq!(loaded.veclen(), 6);
        assert_eq!(loaded.parameters().branching, 4);
        assert_eq!(loaded.used_memory(), index.used_memory());

        // Structural identity: a re-dump is byte-identical
        let mut dump2 = Vec::new();
        loaded.save(&mut dump2).unwrap();
        assert_eq!(dump, dump2);

        // Queries agree exactly
        let query = vec![1.0; 6];
        let a = index.search(&query, 5, &SearchParams::unlimited()).unwrap();
        let b = loaded.search(&query, 5, &SearchParams::unlimited()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_save_load_cluster_centers_bit_identical() {
        let dataset = grid_dataset();
        let config = KMeansTreeConfig::default()
            .with_branching(4)
            .with_centers_init(CentersInit::KMeansPp)
            .with_iterations(20)
            .with_seed(5);
        let mut index = KMeansTree::new(dataset.clone(), config);
        index.build().unwrap();

        let mut dump = Vec::new();
        index.save(&mut dump).unwrap();
        let loaded =
            KMeansTree::load(dataset, SquaredEuclidean, &mut dump.as_slice()).unwrap();

        let (before, var_before) = index.cluster_centers(4).unwrap();
        let (after, var_after) = loaded.cluster_centers(4).unwrap();
        assert_eq!(before.as_slice(), after.as_slice());
        assert_eq!(var_before.to_bits(), var_after.to_bits());
    }

    #[test]
    fn test_load_rejects_bad_magic() {
        let dataset = random_dataset(10, 2, 1);
        let garbage = vec![0u8; 64];
        let err = KMeansTree::load(dataset, SquaredEuclidean, &mut garbage.as_slice());
        assert!(matches!(err, Err(AnnError::StorageError(_))));
    }

    #[test]
    fn test_load_rejects_wrong_dataset_shape() {
        let dataset = random_dataset(50, 4, 2);
        let config = KMeansTreeConfig::default().with_branching(4).with_seed(2);
        let mut index = KMeansTree::new(dataset, config);
        index.build().unwrap();

        let mut dump = Vec::new();
        index.save(&mut dump).unwrap();

        let wrong_cols = random_dataset(50, 3, 3);
        assert!(matches!(
            KMeansTree::load(wrong_cols, SquaredEuclidean, &mut dump.as_slice()),
            Err(AnnError::DimensionMismatch { .. })
        ));

        let wrong_rows = random_dataset(49, 4, 3);
        assert!(matches!(
            KMeansTree::load(wrong_rows, SquaredEuclidean, &mut dump.as_slice()),
            Err(AnnError::StorageError(_))
        ));
    }

    #[test]
    fn test_build_rejects_branching_below_two() {
        let dataset = random_dataset(10, 2, 1);
        let config = KMeansTreeConfig::default().with_branching(1);
        let mut index = KMeansTree::new(dataset, config);
        assert!(matches!(
            index.build(),
            Err(AnnError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_build_rejects_empty_dataset() {
        let dataset = Matrix::from_vec(Vec::new(), 0, 4).unwrap();
        let mut index = KMeansTree::new(dataset, KMeansTreeConfig::default());
        assert!(matches!(
            index.build(),
            Err(AnnError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_operations_require_built_tree() {
        let dataset = random_dataset(10, 2, 1);
        let index = KMeansTree::new(dataset.clone(), KMeansTreeConfig::default());

        assert!(matches!(
            index.search(&[0.0, 0.0], 1, &SearchParams::default()),
            Err(AnnError::IndexError(_))
        ));
        assert!(matches!(
            index.cluster_centers(2),
            Err(AnnError::IndexError(_))
        ));
        let mut sink = Vec::new();
        assert!(matches!(index.save(&mut sink), Err(AnnError::IndexError(_))));

        let mut unbuilt = KMeansTree::new(dataset.clone(), KMeansTreeConfig::default());
        assert!(matches!(
            unbuilt.add_points(&dataset, 2.0),
            Err(AnnError::IndexError(_))
        ));
    }

    #[test]
    fn test_shape_errors() {
        let dataset = random_dataset(50, 4, 1);
        let config = KMeansTreeConfig::default().with_branching(4).with_seed(1);
        let mut index = KMeansTree::new(dataset, config);
        index.build().unwrap();

        assert!(matches!(
            index.search(&[0.0; 3], 1, &SearchParams::default()),
            Err(AnnError::DimensionMismatch { .. })
        ));

        let wrong = random_dataset(5, 3, 2);
        assert!(matches!(
            index.add_points(&wrong, 2.0),
            Err(AnnError::DimensionMismatch { .. })
        ));

        assert!(matches!(
            index.cluster_centers(0),
            Err(AnnError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_accessors_and_memory_accounting() {
        let dataset = random_dataset(100, 8, 13);
        let config = KMeansTreeConfig::default()
            .with_branching(4)
            .with_seed(13)
            .with_copy_dataset(true);
        let mut index = KMeansTree::new(dataset, config);
        assert!(index.dataset.is_owned());
        assert!(!index.is_built());
        assert_eq!(index.used_memory(), 0);

        index.build().unwrap();
        assert!(index.is_built());
        assert_eq!(index.size(), 100);
        assert_eq!(index.veclen(), 8);
        // At least the root pivot is pinned
        assert!(index.used_memory() >= 8 * std::mem::size_of::<f32>());
        assert_eq!(index.parameters().branching, 4);
    }

    #[test]
    fn test_set_cb_index_changes_search_ordering_only() {
        let dataset = random_dataset(300, 4, 19);
        let config = KMeansTreeConfig::default().with_branching(8).with_seed(19);
        let mut index = KMeansTree::new(dataset.clone(), config);
        index.build().unwrap();

        index.set_cb_index(0.0);
        assert_eq!(index.parameters().cb_index, 0.0);

        // Exact search is unaffected by the boundary weight
        let query = vec![5.0; 4];
        let expected = brute_force_knn(&dataset, &query, 5);
        let got = index.search(&query, 5, &SearchParams::unlimited()).unwrap();
        let got_indices: Vec<usize> = got.iter().map(|&(_, i)| i).collect();
        let expected_indices: Vec<usize> = expected.iter().map(|&(_, i)| i).collect();
        assert_eq!(got_indices, expected_indices);
    }

    #[test]
    fn test_manhattan_distance_index() {
        use crate::vector::Manhattan;

        let dataset = random_dataset(100, 4, 29);
        let config = KMeansTreeConfig::default().with_branching(4).with_seed(29);
        let mut index = KMeansTree::with_distance(dataset.clone(), config, Manhattan);
        index.build().unwrap();

        let query = vec![5.0; 4];
        let got = index.search(&query, 5, &SearchParams::unlimited()).unwrap();

        let mut expected = KnnResultSet::new(5);
        for i in 0..dataset.rows() {
            expected.add_point(Manhattan.distance(dataset.row(i), &query), i);
        }
        assert_eq!(got, expected.entries().to_vec());
    }
}
