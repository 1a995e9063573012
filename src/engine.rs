//! Optimizer engines that turn neighbor lists into a low-dimensional layout.
//!
//! The driver only talks to an engine through [`OptimizerEngine`]: it hands
//! over neighbor lists once, then repeatedly steps and reads back the flat
//! solution buffer. [`PairwiseEngine`] is the bundled implementation.
//!
//! # `PairwiseEngine`
//!
//! 1. Each point's neighbor distances are turned into affinities with a
//!    Gaussian whose bandwidth is found by binary search so the entropy of the
//!    distribution matches `ln(perplexity)`.
//! 2. Every step, neighbor pairs attract with their affinity weight and a
//!    fresh batch of random far pairs repels.
//! 3. For the first `exaggeration_iters` steps attraction is multiplied by
//!    `exaggeration` so clusters form before they spread.
//! 4. Coordinates move with Adam.

use crate::adam::AdamState;
use crate::gradient::{layout_gradient, AttractivePair, Supervision, UNLABELED};
use crate::knn::NearestEntry;
use crate::ProjectorError;
use bon::Builder;
use ndarray::Array2;
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::iter::{IndexedParallelIterator, IntoParallelRefIterator, ParallelIterator};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, warn};

/// Binary search steps when calibrating a point's bandwidth.
const MAX_CALIBRATION_STEPS: usize = 64;

/// Entropy tolerance for bandwidth calibration.
const CALIBRATION_TOLERANCE: f32 = 1e-4;

/// Noise added by [`OptimizerEngine::perturb`], relative to the layout spread.
const PERTURB_SCALE: f32 = 0.05;

/// Capability interface of a layout solver.
///
/// The driver calls [`init`](Self::init) once per run, then
/// [`step`](Self::step) once per tick. Between steps it may call
/// [`perturb`](Self::perturb) or change supervision.
pub trait OptimizerEngine: Send {
    /// Prepares the solver for the points described by `neighbors`.
    ///
    /// `neighbors[i]` lists the nearest neighbors of point `i`, ascending by
    /// distance.
    ///
    /// # Errors
    /// * If the neighbor lists reference points outside the set
    fn init(&mut self, neighbors: &[Vec<NearestEntry>]) -> Result<(), ProjectorError>;

    /// Advances the solver by one iteration.
    fn step(&mut self);

    /// Current layout, row-major with [`dimensionality`](Self::dimensionality)
    /// components per point.
    fn solution(&self) -> &[f32];

    /// Applies one out-of-band random adjustment to the layout.
    fn perturb(&mut self);

    /// Components per point in [`solution`](Self::solution).
    fn dimensionality(&self) -> usize;

    /// Sets one label per point, or clears supervision with `None`.
    ///
    /// `auxiliary` names a label that marks a point as unlabeled.
    fn set_supervision(&mut self, labels: Option<&[String]>, auxiliary: &str);

    /// Sets how strongly labels reweight pairs, in `[0, 1]`.
    fn set_supervise_factor(&mut self, factor: f32);
}

/// Parameters of the bundled [`PairwiseEngine`].
#[derive(Builder, Clone, Debug)]
pub struct EngineConfiguration {
    /// Output dimensionality, 2 or 3
    #[builder(default = 2)]
    pub dimensions: usize,

    /// Effective number of neighbors each point is calibrated to
    #[builder(default = 30.0)]
    pub perplexity: f32,

    /// Adam learning rate
    #[builder(default = 1.0)]
    pub learning_rate: f32,

    /// Optional seed for initialization, pair sampling and perturbation
    pub seed: Option<u64>,

    /// Far pairs sampled per point, as a fraction of its neighbor count
    #[builder(default = 0.5)]
    pub far_pair_ratio: f32,

    /// Attraction multiplier during early iterations
    #[builder(default = 4.0)]
    pub exaggeration: f32,

    /// Iterations with exaggerated attraction
    #[builder(default = 100)]
    pub exaggeration_iters: usize,
}

impl Default for EngineConfiguration {
    fn default() -> Self {
        Self {
            dimensions: 2,
            perplexity: 30.0,
            learning_rate: 1.0,
            seed: None,
            far_pair_ratio: 0.5,
            exaggeration: 4.0,
            exaggeration_iters: 100,
        }
    }
}

/// Neighbor-affinity layout solver with sampled repulsion.
#[derive(Debug)]
pub struct PairwiseEngine {
    config: EngineConfiguration,
    rng: SmallRng,
    normal: Normal<f32>,
    y: Array2<f32>,
    adam: AdamState,
    attract: Vec<AttractivePair>,
    repel: Vec<[u32; 2]>,
    far_pairs_per_point: usize,
    labels: Option<Vec<u32>>,
    supervise_factor: f32,
    iteration: usize,
}

impl PairwiseEngine {
    /// Creates an engine with no points; call [`OptimizerEngine::init`]
    /// before stepping.
    ///
    /// # Errors
    /// * `ProjectorError::InvalidEmbeddingDimensions` unless `dimensions` is
    ///   2 or 3
    pub fn new(config: EngineConfiguration) -> Result<Self, ProjectorError> {
        if !(2..=3).contains(&config.dimensions) {
            return Err(ProjectorError::InvalidEmbeddingDimensions(
                config.dimensions,
            ));
        }

        let rng = match config.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };

        Ok(Self {
            normal: Normal::new(0.0, 1.0)?,
            y: Array2::zeros((0, config.dimensions)),
            adam: AdamState::new((0, config.dimensions)),
            config,
            rng,
            attract: Vec::new(),
            repel: Vec::new(),
            far_pairs_per_point: 0,
            labels: None,
            supervise_factor: 0.0,
            iteration: 0,
        })
    }

    /// Iterations completed since [`OptimizerEngine::init`].
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    fn sample_far_pairs(&mut self) {
        let n = self.y.nrows();
        self.repel.clear();
        if n < 2 {
            return;
        }

        for i in 0..n {
            for _ in 0..self.far_pairs_per_point {
                let mut j = self.rng.gen_range(0..n);
                while j == i {
                    j = self.rng.gen_range(0..n);
                }
                self.repel.push([i as u32, j as u32]);
            }
        }
    }
}

impl OptimizerEngine for PairwiseEngine {
    #[allow(clippy::cast_precision_loss)]
    fn init(&mut self, neighbors: &[Vec<NearestEntry>]) -> Result<(), ProjectorError> {
        let start_time = Instant::now();
        let n = neighbors.len();

        for (i, list) in neighbors.iter().enumerate() {
            if let Some(entry) = list.iter().find(|entry| entry.index >= n || entry.index == i) {
                return Err(ProjectorError::InvalidNeighbors(format!(
                    "point {i} lists neighbor {} among {n} points",
                    entry.index
                )));
            }
        }

        let perplexity = self.config.perplexity;
        let affinities: Vec<Vec<f32>> = neighbors
            .par_iter()
            .map(|list| {
                let dists: Vec<f32> = list.iter().map(|entry| entry.dist).collect();
                calibrate_affinities(&dists, perplexity)
            })
            .collect();

        self.attract = neighbors
            .par_iter()
            .zip(affinities.par_iter())
            .enumerate()
            .flat_map_iter(|(i, (list, probs))| {
                let k = list.len() as f32;
                list.iter().zip(probs).map(move |(entry, &p)| AttractivePair {
                    i: i as u32,
                    j: entry.index as u32,
                    weight: p * k,
                })
            })
            .collect();

        let k = neighbors.iter().map(Vec::len).max().unwrap_or(0);
        self.far_pairs_per_point = ((k as f32 * self.config.far_pair_ratio).ceil() as usize).max(1);

        let dim = self.config.dimensions;
        self.y = Array2::random_using((n, dim), self.normal, &mut self.rng);
        self.adam = AdamState::new((n, dim));
        self.iteration = 0;
        if self.labels.as_ref().is_some_and(|labels| labels.len() != n) {
            self.labels = None;
        }

        debug!(
            "Initialized engine with {n} points and {} neighbor pairs in {:.2?}",
            self.attract.len(),
            start_time.elapsed()
        );
        Ok(())
    }

    fn step(&mut self) {
        self.sample_far_pairs();

        let scale = if self.iteration < self.config.exaggeration_iters {
            self.config.exaggeration
        } else {
            1.0
        };
        let supervision = self.labels.as_deref().map(|labels| Supervision {
            labels,
            factor: self.supervise_factor,
        });

        let (grad, loss) =
            layout_gradient(self.y.view(), &self.attract, &self.repel, scale, supervision);
        self.adam
            .update(self.y.view_mut(), grad.view(), self.config.learning_rate);
        self.iteration += 1;

        if self.iteration % 100 == 0 {
            debug!("Iteration: {:4}, Loss: {}", self.iteration, loss);
        }
    }

    fn solution(&self) -> &[f32] {
        self.y.as_slice().unwrap_or(&[])
    }

    #[allow(clippy::cast_precision_loss)]
    fn perturb(&mut self) {
        let len = self.y.len();
        if len == 0 {
            return;
        }

        let mean_sq = self.y.iter().map(|x| x * x).sum::<f32>() / len as f32;
        let spread = if mean_sq > 0.0 { mean_sq.sqrt() } else { 1.0 };
        let noise = Array2::random_using(self.y.dim(), self.normal, &mut self.rng);
        self.y.scaled_add(PERTURB_SCALE * spread, &noise);
        self.adam.reset();
    }

    fn dimensionality(&self) -> usize {
        self.config.dimensions
    }

    fn set_supervision(&mut self, labels: Option<&[String]>, auxiliary: &str) {
        let Some(labels) = labels else {
            self.labels = None;
            return;
        };

        if labels.len() != self.y.nrows() {
            warn!(
                "Ignoring {} supervision labels for {} points",
                labels.len(),
                self.y.nrows()
            );
            self.labels = None;
            return;
        }

        let mut ids: HashMap<&str, u32> = HashMap::new();
        let encoded = labels
            .iter()
            .map(|label| {
                if label == auxiliary {
                    return UNLABELED;
                }
                let next_id = ids.len() as u32;
                *ids.entry(label.as_str()).or_insert(next_id)
            })
            .collect();

        debug!("Supervising with {} distinct labels", ids.len());
        self.labels = Some(encoded);
    }

    fn set_supervise_factor(&mut self, factor: f32) {
        self.supervise_factor = factor.clamp(0.0, 1.0);
    }
}

/// Converts ascending neighbor distances into probabilities whose entropy
/// matches `ln(perplexity)`.
///
/// The perplexity is capped at the number of neighbors. Distances are shifted
/// by the smallest one, so the first term is always `exp(0)` and the
/// normalizer never vanishes.
#[allow(clippy::cast_precision_loss)]
fn calibrate_affinities(dists: &[f32], perplexity: f32) -> Vec<f32> {
    let Some(&d_min) = dists.iter().min_by(|a, b| a.total_cmp(b)) else {
        return Vec::new();
    };

    let target = perplexity.clamp(1.0, dists.len() as f32).ln();
    let mut beta = 1.0f32;
    let mut lo = 0.0f32;
    let mut hi = f32::INFINITY;
    let mut probs = vec![0.0; dists.len()];

    for _ in 0..MAX_CALIBRATION_STEPS {
        let mut sum = 0.0;
        for (p, &d) in probs.iter_mut().zip(dists) {
            *p = (-(d - d_min) * beta).exp();
            sum += *p;
        }

        let mut entropy = 0.0;
        for p in &mut probs {
            *p /= sum;
            if *p > 1e-12 {
                entropy -= *p * p.ln();
            }
        }

        if (entropy - target).abs() < CALIBRATION_TOLERANCE {
            break;
        }
        if entropy > target {
            lo = beta;
            beta = if hi.is_finite() { (beta + hi) / 2.0 } else { beta * 2.0 };
        } else {
            hi = beta;
            beta = (beta + lo) / 2.0;
        }
    }

    probs
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn ring_neighbors(n: usize, k: usize) -> Vec<Vec<NearestEntry>> {
        (0..n)
            .map(|i| {
                (1..=k)
                    .map(|offset| NearestEntry {
                        index: (i + offset) % n,
                        dist: offset as f32,
                    })
                    .collect()
            })
            .collect()
    }

    fn seeded(dimensions: usize) -> PairwiseEngine {
        let config = EngineConfiguration::builder()
            .dimensions(dimensions)
            .perplexity(2.0)
            .seed(7)
            .build();
        PairwiseEngine::new(config).unwrap()
    }

    #[test]
    fn test_rejects_bad_dimensions() {
        let config = EngineConfiguration::builder().dimensions(4).build();
        assert!(matches!(
            PairwiseEngine::new(config),
            Err(ProjectorError::InvalidEmbeddingDimensions(4))
        ));
    }

    #[test]
    fn test_rejects_self_neighbor() {
        let mut engine = seeded(2);
        let neighbors = vec![
            vec![NearestEntry { index: 0, dist: 0.0 }],
            vec![NearestEntry { index: 0, dist: 1.0 }],
        ];
        assert!(matches!(
            engine.init(&neighbors),
            Err(ProjectorError::InvalidNeighbors(_))
        ));
    }

    #[test]
    fn test_calibration_matches_perplexity() {
        let dists = [0.1, 0.4, 0.5, 0.9, 1.3, 2.0, 2.2, 3.1];
        let probs = calibrate_affinities(&dists, 3.0);

        assert_abs_diff_eq!(probs.iter().sum::<f32>(), 1.0, epsilon = 1e-5);
        let entropy: f32 = probs.iter().map(|p| -p * p.ln()).sum();
        assert_abs_diff_eq!(entropy, 3.0f32.ln(), epsilon = 1e-3);
        assert!(probs.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn test_calibration_with_equal_distances() {
        let probs = calibrate_affinities(&[1.0; 4], 30.0);
        for p in probs {
            assert_abs_diff_eq!(p, 0.25, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_steps_keep_layout_finite() {
        let mut engine = seeded(3);
        engine.init(&ring_neighbors(20, 4)).unwrap();
        assert_eq!(engine.solution().len(), 20 * 3);

        for _ in 0..150 {
            engine.step();
        }
        assert_eq!(engine.iteration(), 150);
        assert!(engine.solution().iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_seeded_runs_are_reproducible() {
        let run = || {
            let mut engine = seeded(2);
            engine.init(&ring_neighbors(12, 3)).unwrap();
            for _ in 0..10 {
                engine.step();
            }
            engine.solution().to_vec()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_perturb_moves_layout() {
        let mut engine = seeded(2);
        engine.init(&ring_neighbors(10, 3)).unwrap();
        let before = engine.solution().to_vec();
        engine.perturb();
        assert_ne!(before, engine.solution());
        assert_eq!(before.len(), engine.solution().len());
    }

    #[test]
    fn test_supervision_labels() {
        let mut engine = seeded(2);
        engine.init(&ring_neighbors(4, 2)).unwrap();

        let labels: Vec<String> = ["a", "b", "", "a"].iter().map(|s| (*s).to_owned()).collect();
        engine.set_supervision(Some(labels.as_slice()), "");
        assert_eq!(engine.labels, Some(vec![0, 1, UNLABELED, 0]));

        engine.set_supervision(Some(&labels[..2]), "");
        assert_eq!(engine.labels, None);

        engine.set_supervise_factor(3.0);
        assert_abs_diff_eq!(engine.supervise_factor, 1.0);
    }
}
