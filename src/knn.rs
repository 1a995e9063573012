//! K-nearest neighbor search over a sampled point set.
//!
//! Two strategies produce the same output shape: one list per point holding up
//! to `k` [`NearestEntry`] values, ascending by distance, never containing the
//! point itself.
//!
//! - [`find_knn`] runs on the CPU. It visits every unordered pair once and
//!   offers the distance to both endpoints, passing the looser of the two
//!   current bounds to the distance function so it can stop early.
//! - [`find_knn_accelerated`] computes block-by-N similarity matrices through
//!   a [`DistanceKernel`] and folds each row into a top-K structure. If the
//!   kernel is unavailable or fails at any point, the partial result is thrown
//!   away and the whole call is answered by [`find_knn`] instead.
//!
//! The accelerated search measures [`cos_dist_norm_with_limit`], half the
//! squared Euclidean distance, recovered from dot products as
//! `(|a|² + |b|² - 2a·b) / 2`. For unit vectors this is `1 - a·b`; an
//! all-zero vector sits at `|b|² / 2` from every other point on both paths.
//!
//! Both are O(N²); callers bound N by sampling.

use crate::heap::BoundedTopK;
use crate::vector::{cos_dist_norm_with_limit, dot};
use ndarray::parallel::prelude::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};
use ndarray::{s, Array2, ArrayView2, Axis};
use std::ops::Range;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

/// One neighbor of a point.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NearestEntry {
    /// Position of the neighbor in the searched collection
    pub index: usize,
    /// Distance to the neighbor
    pub dist: f32,
}

/// Failures of a [`DistanceKernel`]. These never reach callers of
/// [`find_knn_accelerated`]; they trigger the CPU fallback.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum KernelError {
    /// The kernel cannot run in this environment
    #[error("Distance kernel is unavailable")]
    Unavailable,

    /// The kernel failed while computing
    #[error("Distance kernel failed: {0}")]
    ComputeFailure(String),

    /// The kernel returned a block of the wrong shape
    #[error("Distance kernel returned shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        /// Rows in the block by points in the data
        expected: [usize; 2],
        /// Shape actually returned
        actual: [usize; 2],
    },
}

/// Batched similarity computation backing the accelerated strategy.
///
/// Implementations may run on any hardware; the only contract is that
/// `similarities` returns the dot products of `data[rows]` against every row
/// of `data`, or an error.
pub trait DistanceKernel: Send + Sync {
    /// Whether the kernel can run in this environment.
    fn is_available(&self) -> bool {
        true
    }

    /// Returns a `rows.len() × data.nrows()` matrix of row dot products.
    ///
    /// # Errors
    /// * Any `KernelError`; the caller falls back to the CPU strategy
    fn similarities(
        &self,
        data: ArrayView2<f32>,
        rows: Range<usize>,
    ) -> Result<Array2<f32>, KernelError>;
}

/// Dense matrix-multiplication kernel built on ndarray.
///
/// Uses BLAS when the crate is built with one of its BLAS features.
#[derive(Clone, Copy, Debug, Default)]
pub struct MatmulKernel;

impl DistanceKernel for MatmulKernel {
    fn similarities(
        &self,
        data: ArrayView2<f32>,
        rows: Range<usize>,
    ) -> Result<Array2<f32>, KernelError> {
        if rows.end > data.nrows() || rows.start > rows.end {
            return Err(KernelError::ComputeFailure(format!(
                "row range {rows:?} outside {} rows",
                data.nrows()
            )));
        }
        let block = data.slice(s![rows, ..]);
        Ok(block.dot(&data.t()))
    }
}

/// Which neighbor search a dataset uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KnnStrategy {
    /// Exact pairwise search on the CPU
    Cpu,
    /// Batched search through a [`DistanceKernel`]
    Accelerated,
}

impl KnnStrategy {
    /// Prefers the accelerated strategy when it is enabled and the kernel
    /// reports itself available.
    pub fn select(kernel: &dyn DistanceKernel, accelerated_enabled: bool) -> Self {
        if accelerated_enabled && kernel.is_available() {
            KnnStrategy::Accelerated
        } else {
            KnnStrategy::Cpu
        }
    }
}

/// Finds the `k` nearest neighbors of every item on the CPU.
///
/// `dist_fn(a, b, limit)` returns the distance between `a` and `b`, or `None`
/// once it can prove the distance exceeds `limit`. A `None` limit means no
/// bound has been established yet and the full distance is required.
///
/// # Arguments
/// * `items` - Points to search
/// * `k` - Neighbors per point, capped at `items.len() - 1`
/// * `accessor` - Returns an item's vector
/// * `dist_fn` - Distance with optional early exit
pub fn find_knn<T, A, D>(
    items: &[T],
    k: usize,
    accessor: A,
    dist_fn: D,
) -> Vec<Vec<NearestEntry>>
where
    A: Fn(&T) -> &[f32],
    D: Fn(&[f32], &[f32], Option<f32>) -> Option<f32>,
{
    let start_time = Instant::now();
    let n = items.len();
    let k = k.min(n.saturating_sub(1));
    let mut tops: Vec<BoundedTopK<NearestEntry>> = (0..n).map(|_| BoundedTopK::new(k)).collect();

    if k > 0 {
        for i in 0..n {
            let a = accessor(&items[i]);
            for j in (i + 1)..n {
                let limit = match (tops[i].largest_key(), tops[j].largest_key()) {
                    (Some(limit_i), Some(limit_j)) => Some(limit_i.max(limit_j)),
                    _ => None,
                };

                let Some(dist) = dist_fn(a, accessor(&items[j]), limit) else {
                    continue;
                };

                tops[i].offer(dist, NearestEntry { index: j, dist });
                tops[j].offer(dist, NearestEntry { index: i, dist });
            }
        }
    }

    debug!(
        "CPU nearest neighbors for {n} points (k={k}) in {:.2?}",
        start_time.elapsed()
    );
    tops.into_iter().map(BoundedTopK::into_sorted_vec).collect()
}

/// Finds the `k` nearest neighbors of every item by cosine distance, using
/// `kernel` for the similarity matrix.
///
/// Vectors are expected to be unit length (or all-zero). Distances are those
/// of [`cos_dist_norm_with_limit`]. The rows are processed in blocks of
/// `block_size` to bound the size of each score matrix; `on_progress`
/// receives the completed fraction after every block.
///
/// Any kernel failure discards the partial result and recomputes everything
/// with [`find_knn`] and [`cos_dist_norm_with_limit`].
pub fn find_knn_accelerated<T, A, K, P>(
    items: &[T],
    k: usize,
    accessor: A,
    kernel: &K,
    block_size: usize,
    on_progress: P,
) -> Vec<Vec<NearestEntry>>
where
    A: Fn(&T) -> &[f32],
    K: DistanceKernel + ?Sized,
    P: FnMut(f32),
{
    match try_find_knn_accelerated(items, k, &accessor, kernel, block_size, on_progress) {
        Ok(neighbors) => neighbors,
        Err(err) => {
            warn!("Accelerated nearest neighbor search failed, falling back to CPU: {err}");
            find_knn(items, k, accessor, cos_dist_norm_with_limit)
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn try_find_knn_accelerated<T, A, K, P>(
    items: &[T],
    k: usize,
    accessor: &A,
    kernel: &K,
    block_size: usize,
    mut on_progress: P,
) -> Result<Vec<Vec<NearestEntry>>, KernelError>
where
    A: Fn(&T) -> &[f32],
    K: DistanceKernel + ?Sized,
    P: FnMut(f32),
{
    if !kernel.is_available() {
        return Err(KernelError::Unavailable);
    }

    let start_time = Instant::now();
    let n = items.len();
    if n == 0 {
        return Ok(Vec::new());
    }

    let k = k.min(n - 1);
    let dim = accessor(&items[0]).len();
    let mut flat = Vec::with_capacity(n * dim);
    for item in items {
        flat.extend_from_slice(accessor(item));
    }
    let data = Array2::from_shape_vec((n, dim), flat)
        .map_err(|err| KernelError::ComputeFailure(err.to_string()))?;
    let squared_norms: Vec<f32> = items
        .iter()
        .map(|item| {
            let v = accessor(item);
            dot(v, v)
        })
        .collect();

    let block_size = block_size.max(1);
    let mut neighbors = Vec::with_capacity(n);

    for start in (0..n).step_by(block_size) {
        let end = (start + block_size).min(n);
        let scores = kernel.similarities(data.view(), start..end)?;
        if scores.dim() != (end - start, n) {
            return Err(KernelError::ShapeMismatch {
                expected: [end - start, n],
                actual: [scores.nrows(), scores.ncols()],
            });
        }

        let block: Vec<Vec<NearestEntry>> = scores
            .axis_iter(Axis(0))
            .into_par_iter()
            .enumerate()
            .map(|(row, similarities)| {
                let i = start + row;
                let mut top = BoundedTopK::new(k);
                for (j, &similarity) in similarities.iter().enumerate() {
                    if j != i {
                        let dist =
                            ((squared_norms[i] + squared_norms[j] - 2.0 * similarity) / 2.0)
                                .max(0.0);
                        top.offer(dist, NearestEntry { index: j, dist });
                    }
                }
                top.into_sorted_vec()
            })
            .collect();

        neighbors.extend(block);
        on_progress(end as f32 / n as f32);
    }

    debug!(
        "Accelerated nearest neighbors for {n} points (k={k}) in {:.2?}",
        start_time.elapsed()
    );
    Ok(neighbors)
}

/// Finds the `k` nearest neighbors of a single item, excluding itself.
pub fn find_knn_of_point<T, A, D>(
    items: &[T],
    index: usize,
    k: usize,
    accessor: A,
    dist_fn: D,
) -> Vec<NearestEntry>
where
    A: Fn(&T) -> &[f32],
    D: Fn(&[f32], &[f32]) -> f32,
{
    let Some(item) = items.get(index) else {
        return Vec::new();
    };
    let a = accessor(item);
    let mut top = BoundedTopK::new(k);

    for (j, other) in items.iter().enumerate() {
        if j == index {
            continue;
        }
        let dist = dist_fn(a, accessor(other));
        top.offer(dist, NearestEntry { index: j, dist });
    }

    top.into_sorted_vec()
}
