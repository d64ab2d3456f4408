//! Initial-center seeding strategies
//!
//! Every internal node of the k-means tree starts a Lloyd refinement from
//! `branching` seed points drawn from the node's members. Three strategies
//! are available; all of them may return fewer than the requested number of
//! seeds when the candidates are exhausted (e.g. duplicate-heavy data), and
//! the clustering kernel treats a short return as the signal to make the
//! node a leaf instead.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::matrix::Matrix;
use crate::vector::Distance;

/// Candidates closer than this (in distance-functor units) to an already
/// chosen center count as duplicates for random seeding.
const DUPLICATE_THRESHOLD: f32 = 1e-16;

/// Strategy for choosing the initial cluster centers of one Lloyd refinement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CentersInit {
    /// Uniform draw without replacement, rejecting near-duplicate points
    Random,
    /// Gonzales' farthest-point heuristic: each seed maximizes its distance
    /// to the closest already-chosen seed
    Gonzales,
    /// k-means++ (Arthur & Vassilvitskii): seeds drawn with probability
    /// proportional to squared distance from the chosen set
    KMeansPp,
}

impl Default for CentersInit {
    fn default() -> Self {
        CentersInit::Random
    }
}

impl CentersInit {
    /// Choose up to `k` seed indices from `indices`
    ///
    /// Returns dataset indices (a subset of `indices`); the result is shorter
    /// than `k` when the strategy runs out of usable candidates.
    pub(crate) fn choose<D: Distance, R: Rng>(
        self,
        k: usize,
        indices: &[usize],
        dataset: &Matrix<'_>,
        distance: &D,
        rng: &mut R,
    ) -> Vec<usize> {
        match self {
            CentersInit::Random => choose_random(k, indices, dataset, distance, rng),
            CentersInit::Gonzales => choose_gonzales(k, indices, dataset, distance, rng),
            CentersInit::KMeansPp => choose_kmeanspp(k, indices, dataset, distance, rng),
        }
    }
}

/// Random seeding with duplicate rejection
///
/// Walks a permutation of the candidates, skipping any point within
/// [`DUPLICATE_THRESHOLD`] of an already-chosen seed. Stops when `k` seeds
/// are found or the permutation is exhausted.
fn choose_random<D: Distance, R: Rng>(
    k: usize,
    indices: &[usize],
    dataset: &Matrix<'_>,
    distance: &D,
    rng: &mut R,
) -> Vec<usize> {
    let mut order: Vec<usize> = (0..indices.len()).collect();
    order.shuffle(rng);

    let mut centers = Vec::with_capacity(k);
    for &pos in &order {
        if centers.len() == k {
            break;
        }
        let candidate = indices[pos];
        let duplicate = centers.iter().any(|&c: &usize| {
            distance.distance(dataset.row(candidate), dataset.row(c)) < DUPLICATE_THRESHOLD
        });
        if !duplicate {
            centers.push(candidate);
        }
    }
    centers
}

/// Gonzales farthest-point seeding
///
/// Seed 0 is uniform; each following seed is the candidate whose distance to
/// its closest chosen seed is maximal. Stops early once that maximum is 0
/// (all remaining candidates coincide with a seed).
fn choose_gonzales<D: Distance, R: Rng>(
    k: usize,
    indices: &[usize],
    dataset: &Matrix<'_>,
    distance: &D,
    rng: &mut R,
) -> Vec<usize> {
    let n = indices.len();
    let mut centers = Vec::with_capacity(k);
    centers.push(indices[rng.gen_range(0..n)]);

    for _ in 1..k {
        let mut best_index = None;
        let mut best_val = 0.0f32;
        for &candidate in indices {
            let mut dist = distance.distance(dataset.row(centers[0]), dataset.row(candidate));
            for &center in &centers[1..] {
                let tmp = distance.distance(dataset.row(center), dataset.row(candidate));
                if tmp < dist {
                    dist = tmp;
                }
            }
            if dist > best_val {
                best_val = dist;
                best_index = Some(candidate);
            }
        }
        match best_index {
            Some(c) => centers.push(c),
            None => break,
        }
    }
    centers
}

/// k-means++ seeding
///
/// Maintains each candidate's distance to its nearest chosen seed and the
/// running sum (`current_pot`); each new seed is drawn by walking the prefix
/// sums against a uniform draw in `[0, current_pot)`. One local trial per
/// seed. The walk is capped at index `n - 2` so rounding in the prefix sum
/// can never run past the end.
fn choose_kmeanspp<D: Distance, R: Rng>(
    k: usize,
    indices: &[usize],
    dataset: &Matrix<'_>,
    distance: &D,
    rng: &mut R,
) -> Vec<usize> {
    let n = indices.len();
    let first = rng.gen_range(0..n);

    let mut centers = Vec::with_capacity(k);
    centers.push(indices[first]);

    let mut closest_dist_sq: Vec<f32> = indices
        .iter()
        .map(|&i| distance.distance(dataset.row(i), dataset.row(indices[first])))
        .collect();
    let mut current_pot: f64 = closest_dist_sq.iter().map(|&d| d as f64).sum();

    const NUM_LOCAL_TRIES: usize = 1;

    while centers.len() < k {
        let mut best_new_pot = -1.0f64;
        let mut best_new_index = 0usize;

        for _ in 0..NUM_LOCAL_TRIES {
            let mut rand_val = rng.gen::<f64>() * current_pot;
            let mut index = 0;
            while index < n - 1 {
                if rand_val <= closest_dist_sq[index] as f64 {
                    break;
                }
                rand_val -= closest_dist_sq[index] as f64;
                index += 1;
            }

            let new_pot: f64 = indices
                .iter()
                .enumerate()
                .map(|(i, &idx)| {
                    distance
                        .distance(dataset.row(idx), dataset.row(indices[index]))
                        .min(closest_dist_sq[i]) as f64
                })
                .sum();

            if best_new_pot < 0.0 || new_pot < best_new_pot {
                best_new_pot = new_pot;
                best_new_index = index;
            }
        }

        centers.push(indices[best_new_index]);
        current_pot = best_new_pot;
        for (i, &idx) in indices.iter().enumerate() {
            let d = distance.distance(dataset.row(idx), dataset.row(indices[best_new_index]));
            if d < closest_dist_sq[i] {
                closest_dist_sq[i] = d;
            }
        }
    }
    centers
}
