//! Dense vector primitives used by the neighbor search and projections.
//!
//! The reductions (`dot`, `dist2`) process eight lanes at a time with
//! [`wide::f32x8`] and finish the remainder sequentially. Callers must pass
//! vectors of equal length; this is checked in debug builds only.

use crate::ProjectorError;
use wide::f32x8;

/// Component-wise `a - b`.
pub fn sub(a: &[f32], b: &[f32]) -> Vec<f32> {
    debug_assert_eq!(a.len(), b.len(), "Vectors must have the same length");
    a.iter().zip(b).map(|(x, y)| x - y).collect()
}

/// Dot product of two vectors.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vectors must have the same length");

    let a_chunks = a.chunks_exact(8);
    let a_remainder = a_chunks.remainder();

    let b_chunks = b.chunks_exact(8);
    let b_remainder = b_chunks.remainder();

    let mut acc = f32x8::splat(0.0);
    for (a_chunk, b_chunk) in a_chunks.zip(b_chunks) {
        acc += f32x8::from(a_chunk) * f32x8::from(b_chunk);
    }

    let mut total: f32 = acc.as_array_ref().iter().sum();
    for (a, b) in a_remainder.iter().zip(b_remainder) {
        total += a * b;
    }

    total
}

/// Euclidean (L2) norm.
pub fn norm2(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}

/// Scales `v` to unit length in place.
///
/// An all-zero vector is left unchanged.
pub fn unit(v: &mut [f32]) {
    let norm = norm2(v);
    if norm == 0.0 {
        return;
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
}

/// Coordinate of `v` along `direction`.
pub fn project(v: &[f32], direction: &[f32]) -> f32 {
    dot(v, direction)
}

/// Mean vector of `items`, reading each item's vector through `accessor`.
///
/// # Errors
/// * `ProjectorError::EmptyInput` if `items` is empty
#[allow(clippy::cast_precision_loss)]
pub fn centroid<T, A>(items: &[T], accessor: A) -> Result<Vec<f32>, ProjectorError>
where
    A: Fn(&T) -> &[f32],
{
    let first = items.first().ok_or(ProjectorError::EmptyInput)?;
    let mut sum = vec![0.0f32; accessor(first).len()];

    for item in items {
        for (acc, x) in sum.iter_mut().zip(accessor(item)) {
            *acc += x;
        }
    }

    let n = items.len() as f32;
    sum.iter_mut().for_each(|x| *x /= n);
    Ok(sum)
}

/// Squared Euclidean distance.
pub fn dist2(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vectors must have the same length");

    let a_chunks = a.chunks_exact(8);
    let a_remainder = a_chunks.remainder();

    let b_chunks = b.chunks_exact(8);
    let b_remainder = b_chunks.remainder();

    let mut sum_sq = f32x8::splat(0.0);
    for (a_chunk, b_chunk) in a_chunks.zip(b_chunks) {
        let diff = f32x8::from(a_chunk) - f32x8::from(b_chunk);
        sum_sq += diff * diff;
    }

    let mut total_sum_sq: f32 = sum_sq.as_array_ref().iter().sum();
    for (a, b) in a_remainder.iter().zip(b_remainder) {
        let diff = a - b;
        total_sum_sq += diff * diff;
    }

    total_sum_sq
}

/// Euclidean distance.
pub fn dist(a: &[f32], b: &[f32]) -> f32 {
    dist2(a, b).sqrt()
}

/// Squared Euclidean distance that gives up once it exceeds `limit`.
///
/// Returns `None` when the partial sum proves the true distance is larger
/// than `limit`. With no limit the full distance is always returned.
pub fn dist2_with_limit(a: &[f32], b: &[f32], limit: Option<f32>) -> Option<f32> {
    debug_assert_eq!(a.len(), b.len(), "Vectors must have the same length");

    let Some(limit) = limit else {
        return Some(dist2(a, b));
    };

    let mut total = 0.0f32;
    for (a_chunk, b_chunk) in a.chunks(8).zip(b.chunks(8)) {
        for (x, y) in a_chunk.iter().zip(b_chunk) {
            let diff = x - y;
            total += diff * diff;
        }
        if total > limit {
            return None;
        }
    }

    Some(total)
}

/// Cosine distance `1 - cos(a, b)` for vectors of any length.
///
/// If either vector has zero norm the vectors are treated as orthogonal and
/// the distance is `1.0`.
pub fn cos_dist(a: &[f32], b: &[f32]) -> f32 {
    let norms = norm2(a) * norm2(b);
    if norms == 0.0 {
        return 1.0;
    }
    1.0 - dot(a, b) / norms
}

/// Cosine distance for vectors already scaled to unit length.
///
/// Skips renormalization; results are meaningless for non-unit inputs.
pub fn cos_dist_norm(a: &[f32], b: &[f32]) -> f32 {
    1.0 - dot(a, b)
}

/// [`cos_dist_norm`] with the early exit of [`dist2_with_limit`].
///
/// For unit vectors `|a - b|² = 2 · cos_dist`, so the squared distance is
/// bounded by twice the limit and halved on return.
pub fn cos_dist_norm_with_limit(a: &[f32], b: &[f32], limit: Option<f32>) -> Option<f32> {
    dist2_with_limit(a, b, limit.map(|limit| 2.0 * limit)).map(|d| d / 2.0)
}
