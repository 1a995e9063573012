//! Pairwise layout gradient for the bundled optimizer engine.
//!
//! Neighbor pairs pull their endpoints together with a saturating attraction;
//! sampled far pairs push theirs apart. Supervision labels rescale each pair:
//! matching labels strengthen attraction and weaken repulsion, differing
//! labels do the opposite.

use ndarray::{Array2, ArrayView2};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

/// Pairs per parallel work item.
const CHUNK_SIZE: usize = 1024;

/// A neighbor pair with its affinity weight.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AttractivePair {
    pub i: u32,
    pub j: u32,
    pub weight: f32,
}

/// Label id of points that take no part in supervision.
pub const UNLABELED: u32 = u32::MAX;

/// Label-driven reweighting of pairs.
#[derive(Clone, Copy, Debug)]
pub struct Supervision<'a> {
    /// Label id per point, [`UNLABELED`] for points without a label
    pub labels: &'a [u32],
    /// Blend weight in `[0, 1]`
    pub factor: f32,
}

impl Supervision<'_> {
    fn scale(&self, i: usize, j: usize, attractive: bool) -> f32 {
        let (label_i, label_j) = (self.labels[i], self.labels[j]);
        if label_i == UNLABELED || label_j == UNLABELED {
            return 1.0;
        }
        let same = label_i == label_j;
        if same == attractive {
            1.0 + self.factor
        } else {
            (1.0 - self.factor).max(0.0)
        }
    }
}

/// Computes the layout gradient and loss.
///
/// # Arguments
/// * `y` - Current layout, one row per point
/// * `attract` - Neighbor pairs with affinity weights
/// * `repel` - Far pairs
/// * `attraction_scale` - Multiplier on every attraction (early exaggeration)
/// * `supervision` - Optional label reweighting
///
/// # Returns
/// The gradient with the same shape as `y`, and the total loss
pub fn layout_gradient(
    y: ArrayView2<f32>,
    attract: &[AttractivePair],
    repel: &[[u32; 2]],
    attraction_scale: f32,
    supervision: Option<Supervision<'_>>,
) -> (Array2<f32>, f32) {
    let (n, dim) = y.dim();

    let work: Vec<Chunk<'_>> = attract
        .chunks(CHUNK_SIZE)
        .map(Chunk::Attract)
        .chain(repel.chunks(CHUNK_SIZE).map(Chunk::Repel))
        .collect();

    work.par_iter()
        .map(|chunk| match chunk {
            Chunk::Attract(pairs) => attract_pairs(y, pairs, attraction_scale, supervision),
            Chunk::Repel(pairs) => repel_pairs(y, pairs, supervision),
        })
        .reduce(
            || (Array2::zeros((n, dim)), 0.0),
            |(mut grad1, loss1), (grad2, loss2)| {
                grad1 += &grad2;
                (grad1, loss1 + loss2)
            },
        )
}

enum Chunk<'a> {
    Attract(&'a [AttractivePair]),
    Repel(&'a [[u32; 2]]),
}

fn attract_pairs(
    y: ArrayView2<f32>,
    pairs: &[AttractivePair],
    scale: f32,
    supervision: Option<Supervision<'_>>,
) -> (Array2<f32>, f32) {
    let dim = y.ncols();
    let mut grad = Array2::zeros(y.dim());
    let mut loss = 0.0;
    let mut y_ij = vec![0.0; dim];

    for pair in pairs {
        let (i, j) = (pair.i as usize, pair.j as usize);
        if i == j {
            continue;
        }

        let mut d_ij = 1.0f32;
        for d in 0..dim {
            y_ij[d] = y[[i, d]] - y[[j, d]];
            d_ij += y_ij[d].powi(2);
        }

        let w = pair.weight * scale * supervision.map_or(1.0, |s| s.scale(i, j, true));
        loss += w * (d_ij / (10.0 + d_ij));
        let w1 = w * (20.0 / (10.0 + d_ij).powi(2));

        for d in 0..dim {
            let grad_update = w1 * y_ij[d];
            grad[[i, d]] += grad_update;
            grad[[j, d]] -= grad_update;
        }
    }

    (grad, loss)
}

fn repel_pairs(
    y: ArrayView2<f32>,
    pairs: &[[u32; 2]],
    supervision: Option<Supervision<'_>>,
) -> (Array2<f32>, f32) {
    let dim = y.ncols();
    let mut grad = Array2::zeros(y.dim());
    let mut loss = 0.0;
    let mut y_ij = vec![0.0; dim];

    for &[i, j] in pairs {
        let (i, j) = (i as usize, j as usize);
        if i == j {
            continue;
        }

        let mut d_ij = 1.0f32;
        for d in 0..dim {
            y_ij[d] = y[[i, d]] - y[[j, d]];
            d_ij += y_ij[d].powi(2);
        }

        let w = supervision.map_or(1.0, |s| s.scale(i, j, false));
        loss += w * (1.0 / (1.0 + d_ij));
        let w1 = w * (2.0 / (1.0 + d_ij).powi(2));

        for d in 0..dim {
            let grad_update = w1 * y_ij[d];
            grad[[i, d]] -= grad_update;
            grad[[j, d]] += grad_update;
        }
    }

    (grad, loss)
}
