//! Point collections and everything done to them.
//!
//! A [`Dataset`] owns its points exclusively. Subsets are deep copies, since
//! normalization and projection writes mutate points in place. Besides the
//! points it keeps:
//!
//! - a shuffled permutation of point positions, fixed at construction, from
//!   which optimization and PCA samples are drawn
//! - the neighbor table of the last run together with the `k` it was built
//!   for; a new run reuses it only when `k` matches exactly
//! - the active optimization run, if any (see [`crate::driver`])
//! - sequences reconstructed from the `__seq_next__` / `__next__` metadata
//!   links

use crate::config::{check_sprite_size, DriverConfiguration, SpriteMetadata};
use crate::driver::{
    EmbeddingRun, RunControl, RunParameters, RunState, StepCallback, TickOutcome,
    TSNE_PROJECTION,
};
use crate::engine::{EngineConfiguration, OptimizerEngine, PairwiseEngine};
use crate::knn::{
    find_knn, find_knn_accelerated, find_knn_of_point, DistanceKernel, KnnStrategy, MatmulKernel,
    NearestEntry,
};
use crate::stats::ColumnStats;
use crate::vector::{self, cos_dist, cos_dist_norm_with_limit, dist};
use crate::ProjectorError;
use ndarray::Array2;
use petal_decomposition::Pca;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;
use regex::RegexBuilder;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Metadata key linking a point to the next point of its sequence.
pub const SEQUENCE_NEXT_KEY: &str = "__seq_next__";

/// Older spelling of [`SEQUENCE_NEXT_KEY`].
pub const LEGACY_NEXT_KEY: &str = "__next__";

/// Projection family written by [`Dataset::project_pca`].
pub const PCA_PROJECTION: &str = "pca";

/// A single metadata field.
#[derive(Clone, Debug, PartialEq)]
pub enum MetadataValue {
    /// The field was empty or absent
    Missing,
    /// The field parsed as a finite number
    Number(f64),
    /// Any other text
    Text(String),
}

impl MetadataValue {
    /// Classifies a raw field.
    pub fn parse(raw: &str) -> Self {
        if raw.is_empty() {
            return MetadataValue::Missing;
        }
        match raw.parse::<f64>() {
            Ok(number) if number.is_finite() => MetadataValue::Number(number),
            _ => MetadataValue::Text(raw.to_owned()),
        }
    }

    /// Whether the field holds no value.
    pub fn is_missing(&self) -> bool {
        matches!(self, MetadataValue::Missing)
    }

    /// Reads the value as a point index.
    #[allow(clippy::cast_precision_loss)]
    pub fn as_index(&self) -> Option<usize> {
        match self {
            MetadataValue::Number(n) if *n >= 0.0 && n.fract() == 0.0 && *n < usize::MAX as f64 => {
                Some(*n as usize)
            }
            MetadataValue::Text(text) => text.trim().parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::Missing => Ok(()),
            MetadataValue::Number(number) => write!(f, "{number}"),
            MetadataValue::Text(text) => f.write_str(text),
        }
    }
}

/// Metadata of one point, keyed by column name.
pub type PointMetadata = HashMap<String, MetadataValue>;

/// One input vector and what is known about it.
#[derive(Clone, Debug, PartialEq)]
pub struct Point {
    /// Position in the original input
    pub index: usize,
    /// Input vector
    pub vector: Vec<f32>,
    /// Metadata fields
    pub metadata: PointMetadata,
    /// Sequence the point belongs to, as an index into
    /// [`Dataset::sequences`]
    pub sequence_index: Option<usize>,
    /// Projection coordinates keyed by name, e.g. `"tsne-0"` or `"pca-1"`
    pub projections: HashMap<String, f32>,
}

impl Point {
    /// Creates a point with no metadata or projections.
    pub fn new(index: usize, vector: Vec<f32>) -> Self {
        Self {
            index,
            vector,
            metadata: PointMetadata::new(),
            sequence_index: None,
            projections: HashMap::new(),
        }
    }

    /// Writes one projection coordinate.
    pub fn set_projection(&mut self, key: &str, value: f32) {
        match self.projections.get_mut(key) {
            Some(slot) => *slot = value,
            None => {
                self.projections.insert(key.to_owned(), value);
            }
        }
    }

    /// Original index of the next point in this point's sequence.
    pub fn next_link(&self) -> Option<usize> {
        self.metadata
            .get(SEQUENCE_NEXT_KEY)
            .or_else(|| self.metadata.get(LEGACY_NEXT_KEY))
            .and_then(MetadataValue::as_index)
    }
}

/// Ordered chain of dataset positions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sequence {
    /// Positions in [`Dataset::points`], in link order
    pub point_indices: Vec<usize>,
}

/// Parsed metadata file plus the optional sprite sheet.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SpriteAndMetadataInfo {
    /// One entry per column
    pub stats: Vec<ColumnStats>,
    /// One record per metadata row
    pub points_info: Vec<PointMetadata>,
    /// Sprite sheet description, if one was accepted
    pub sprite_metadata: Option<SpriteMetadata>,
    /// Width and height of the accepted sprite image
    pub sprite_image_size: Option<[u32; 2]>,
}

impl SpriteAndMetadataInfo {
    /// Attaches a sprite sheet if its image fits the texture limit.
    ///
    /// Oversized images are logged and dropped; the metadata stays usable.
    /// Returns whether the sprite was attached.
    pub fn attach_sprite(&mut self, sprite: SpriteMetadata, width: u32, height: u32) -> bool {
        if let Err(err) = check_sprite_size(width, height) {
            warn!("{err}; continuing without sprites");
            self.sprite_metadata = None;
            self.sprite_image_size = None;
            return false;
        }
        self.sprite_metadata = Some(sprite);
        self.sprite_image_size = Some([width, height]);
        true
    }
}

/// What to do with metadata whose record count does not match the points.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MergePolicy {
    /// Reject every mismatch
    #[default]
    Strict,
    /// Map records by position despite unexplained count differences, with a
    /// warning; header-shaped mismatches are still rejected
    Lenient,
}

/// Likely cause of a metadata record count mismatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MismatchKind {
    /// Single-column metadata has one extra record, probably a header
    SingleColumnHeader,
    /// Multi-column metadata has one record too few, probably a missing
    /// header
    MissingHeader,
    /// No known explanation
    Count,
}

impl MismatchKind {
    fn classify(columns: usize, points: usize, records: usize) -> Self {
        if columns == 1 && records == points + 1 {
            MismatchKind::SingleColumnHeader
        } else if columns > 1 && records + 1 == points {
            MismatchKind::MissingHeader
        } else {
            MismatchKind::Count
        }
    }

    /// Advice appended to the mismatch message.
    pub fn hint(&self) -> &'static str {
        match self {
            MismatchKind::SingleColumnHeader => {
                " Single column metadata should not have a header row."
            }
            MismatchKind::MissingHeader => {
                " Multi-column metadata should have a header row with column labels."
            }
            MismatchKind::Count => "",
        }
    }
}

/// Distance used by [`Dataset::find_neighbors`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Metric {
    /// `1 - cos(a, b)`
    #[default]
    Cosine,
    /// `|a - b|`
    Euclidean,
}

/// A point collection with its projections and optimization run.
pub struct Dataset {
    points: Vec<Point>,
    dim: usize,
    config: DriverConfiguration,
    kernel: Arc<dyn DistanceKernel>,
    sequences: Vec<Sequence>,
    shuffled_indices: Vec<usize>,
    nearest: Option<Vec<Vec<NearestEntry>>>,
    nearest_k: usize,
    sprite_and_metadata_info: Option<SpriteAndMetadataInfo>,
    valid_projections: HashSet<String>,
    fraction_variance_explained: Option<Vec<f32>>,
    run: Option<EmbeddingRun>,
    control: RunControl,
    stopped: bool,
    supervise_column: Option<String>,
    supervise_auxiliary: String,
    supervise_factor: Option<f32>,
}

impl Dataset {
    /// Creates a dataset with the default [`DriverConfiguration`].
    ///
    /// # Errors
    /// See [`Dataset::with_config`]
    pub fn new(points: Vec<Point>) -> Result<Self, ProjectorError> {
        Self::with_config(points, DriverConfiguration::default())
    }

    /// Creates a dataset, fixing its dimension from the first point.
    ///
    /// # Errors
    /// * `ProjectorError::EmptyInput` if `points` is empty
    /// * `ProjectorError::DegenerateVector` if vectors have fewer than two
    ///   components
    /// * `ProjectorError::DimensionMismatch` if any point differs in length
    pub fn with_config(
        mut points: Vec<Point>,
        config: DriverConfiguration,
    ) -> Result<Self, ProjectorError> {
        let dim = points.first().ok_or(ProjectorError::EmptyInput)?.vector.len();
        if dim <= 1 {
            return Err(ProjectorError::DegenerateVector { dim });
        }
        if let Some((position, point)) = points
            .iter()
            .enumerate()
            .find(|(_, point)| point.vector.len() != dim)
        {
            return Err(ProjectorError::DimensionMismatch {
                expected: dim,
                actual: point.vector.len(),
                line: position + 1,
            });
        }

        let mut shuffled_indices: Vec<usize> = (0..points.len()).collect();
        shuffled_indices.shuffle(&mut seeded_rng(config.seed));
        let sequences = assign_sequences(&mut points);

        debug!(
            "Created dataset with {} points of dimension {dim} and {} sequences",
            points.len(),
            sequences.len()
        );

        Ok(Self {
            points,
            dim,
            config,
            kernel: Arc::new(MatmulKernel),
            sequences,
            shuffled_indices,
            nearest: None,
            nearest_k: 0,
            sprite_and_metadata_info: None,
            valid_projections: HashSet::new(),
            fraction_variance_explained: None,
            run: None,
            control: RunControl::default(),
            stopped: false,
            supervise_column: None,
            supervise_auxiliary: String::new(),
            supervise_factor: None,
        })
    }

    /// Replaces the kernel used by the accelerated neighbor search.
    #[must_use]
    pub fn with_kernel(mut self, kernel: Arc<dyn DistanceKernel>) -> Self {
        self.kernel = kernel;
        self
    }

    /// Vector dimension shared by all points.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the dataset has no points. Always false for a constructed
    /// dataset.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// The points, in input order.
    pub fn points(&self) -> &[Point] {
        &self.points
    }

    /// Tuning constants in effect.
    pub fn config(&self) -> &DriverConfiguration {
        &self.config
    }

    /// Sequences reconstructed from metadata links.
    pub fn sequences(&self) -> &[Sequence] {
        &self.sequences
    }

    /// Metadata merged with [`Dataset::merge_metadata`].
    pub fn sprite_and_metadata_info(&self) -> Option<&SpriteAndMetadataInfo> {
        self.sprite_and_metadata_info.as_ref()
    }

    /// Cached neighbor table and the `k` it was computed for.
    pub fn nearest(&self) -> Option<(&[Vec<NearestEntry>], usize)> {
        self.nearest
            .as_deref()
            .map(|nearest| (nearest, self.nearest_k))
    }

    /// Deep copy of the points at `positions`.
    ///
    /// Copies keep their original `index` and metadata but no projections.
    ///
    /// # Errors
    /// * `ProjectorError::IndexOutOfRange` for a position outside the dataset
    /// * Any error of [`Dataset::with_config`]
    pub fn subset(&self, positions: &[usize]) -> Result<Dataset, ProjectorError> {
        let points = positions
            .iter()
            .map(|&position| {
                let point = self.points.get(position).ok_or(ProjectorError::IndexOutOfRange {
                    index: position,
                    len: self.points.len(),
                })?;
                let mut copy = Point::new(point.index, point.vector.clone());
                copy.metadata = point.metadata.clone();
                Ok(copy)
            })
            .collect::<Result<Vec<_>, ProjectorError>>()?;

        let mut subset = Dataset::with_config(points, self.config.clone())?;
        subset.kernel = Arc::clone(&self.kernel);
        subset.sprite_and_metadata_info = self.sprite_and_metadata_info.clone();
        Ok(subset)
    }

    /// Centers the vectors on their centroid and scales each to unit length.
    ///
    /// Vectors equal to the centroid stay all-zero. The neighbor cache is
    /// dropped.
    ///
    /// # Errors
    /// * `ProjectorError::EmptyInput` if the dataset has no points
    pub fn normalize(&mut self) -> Result<(), ProjectorError> {
        let centroid = vector::centroid(&self.points, |point| point.vector.as_slice())?;
        for point in &mut self.points {
            for (x, c) in point.vector.iter_mut().zip(&centroid) {
                *x -= c;
            }
            vector::unit(&mut point.vector);
        }
        self.nearest = None;
        self.nearest_k = 0;
        Ok(())
    }

    /// Maps metadata records onto points by position.
    ///
    /// A record count different from the point count is rejected unless the
    /// policy is [`MergePolicy::Lenient`] and the mismatch has no header-row
    /// explanation. Rejection leaves the current metadata untouched.
    /// Sequences are rebuilt from the new metadata.
    ///
    /// # Errors
    /// * `ProjectorError::MetadataShapeMismatch` on a rejected mismatch
    pub fn merge_metadata(&mut self, info: SpriteAndMetadataInfo) -> Result<(), ProjectorError> {
        let points = self.points.len();
        let records = info.points_info.len();

        if records != points {
            let kind = MismatchKind::classify(info.stats.len(), points, records);
            if kind != MismatchKind::Count || self.config.metadata_merge == MergePolicy::Strict {
                return Err(ProjectorError::MetadataShapeMismatch {
                    kind,
                    points,
                    records,
                });
            }
            warn!(
                "Number of tensors ({points}) does not match the number of metadata records \
                 ({records}); merging by position"
            );
        }

        for (point, metadata) in self.points.iter_mut().zip(&info.points_info) {
            point.metadata = metadata.clone();
        }
        self.sprite_and_metadata_info = Some(info);
        self.sequences = assign_sequences(&mut self.points);
        Ok(())
    }

    /// Writes the coordinate of every point along `direction` into the
    /// projection `id`.
    ///
    /// # Errors
    /// * `ProjectorError::ProjectionDimension` if `direction` has the wrong
    ///   length
    pub fn project_linear(&mut self, direction: &[f32], id: &str) -> Result<(), ProjectorError> {
        if direction.len() != self.dim {
            return Err(ProjectorError::ProjectionDimension {
                expected: self.dim,
                actual: direction.len(),
            });
        }
        for point in &mut self.points {
            let value = vector::project(&point.vector, direction);
            point.set_projection(id, value);
        }
        self.valid_projections.insert(id.to_owned());
        Ok(())
    }

    /// Computes principal components and writes `pca-0 … pca-{n-1}` into
    /// every point.
    ///
    /// PCA is fitted on up to `pca_sample_size` sampled points. Vectors
    /// wider than `pca_sample_dim` are first reduced to a random subset of
    /// that many columns. Does nothing once computed.
    ///
    /// # Errors
    /// * `ProjectorError::EmptyInput` if no component can be computed
    /// * `ProjectorError::Pca` if the decomposition fails
    pub fn project_pca(&mut self) -> Result<(), ProjectorError> {
        if self.has_projection(PCA_PROJECTION) {
            return Ok(());
        }
        let start_time = Instant::now();

        let columns = (self.dim > self.config.pca_sample_dim).then(|| {
            let mut rng = seeded_rng(self.config.seed);
            let mut columns =
                rand::seq::index::sample(&mut rng, self.dim, self.config.pca_sample_dim).into_vec();
            columns.sort_unstable();
            columns
        });
        let width = columns.as_ref().map_or(self.dim, Vec::len);

        let sample: Vec<usize> = self
            .shuffled_indices
            .iter()
            .take(self.config.pca_sample_size)
            .copied()
            .collect();
        let n_components = self.config.pca_components.min(width).min(sample.len());
        if n_components == 0 {
            return Err(ProjectorError::EmptyInput);
        }

        let mut pca = Pca::new(n_components);
        pca.fit(&self.matrix(&sample, columns.as_deref()))?;

        let all: Vec<usize> = (0..self.points.len()).collect();
        let projected = pca.transform(&self.matrix(&all, columns.as_deref()))?;
        let keys: Vec<String> = (0..n_components).map(|c| format!("pca-{c}")).collect();
        for (point, row) in self.points.iter_mut().zip(projected.rows()) {
            for (key, &value) in keys.iter().zip(row) {
                point.set_projection(key, value);
            }
        }

        self.fraction_variance_explained = Some(pca.explained_variance_ratio().to_vec());
        self.valid_projections.insert(PCA_PROJECTION.to_owned());
        debug!(
            "Computed {n_components} principal components from {} points in {:.2?}",
            sample.len(),
            start_time.elapsed()
        );
        Ok(())
    }

    /// Fraction of variance captured by each principal component, once
    /// [`Dataset::project_pca`] has run.
    pub fn fraction_variance_explained(&self) -> Option<&[f32]> {
        self.fraction_variance_explained.as_deref()
    }

    /// Whether projection `name` (`"tsne"`, `"pca"` or a custom id) holds
    /// current values.
    pub fn has_projection(&self, name: &str) -> bool {
        self.valid_projections.contains(name)
    }

    /// The `k` points nearest to the point at `position`, excluding itself.
    ///
    /// # Errors
    /// * `ProjectorError::IndexOutOfRange` if `position` is outside the
    ///   dataset
    pub fn find_neighbors(
        &self,
        position: usize,
        k: usize,
        metric: Metric,
    ) -> Result<Vec<NearestEntry>, ProjectorError> {
        if position >= self.points.len() {
            return Err(ProjectorError::IndexOutOfRange {
                index: position,
                len: self.points.len(),
            });
        }
        let dist_fn: fn(&[f32], &[f32]) -> f32 = match metric {
            Metric::Cosine => cos_dist,
            Metric::Euclidean => dist,
        };
        Ok(find_knn_of_point(
            &self.points,
            position,
            k,
            |point| point.vector.as_slice(),
            dist_fn,
        ))
    }

    /// Positions of points whose `field` matches `text`.
    ///
    /// Matching is case-insensitive; `text` is a substring unless
    /// `regex_mode` is set. Missing values never match.
    ///
    /// # Errors
    /// * `ProjectorError::Query` if `text` is not a valid regular expression
    pub fn query(
        &self,
        text: &str,
        regex_mode: bool,
        field: &str,
    ) -> Result<Vec<usize>, ProjectorError> {
        let pattern = if regex_mode {
            text.to_owned()
        } else {
            regex::escape(text)
        };
        let re = RegexBuilder::new(&pattern).case_insensitive(true).build()?;

        Ok(self
            .points
            .iter()
            .enumerate()
            .filter(|(_, point)| {
                point
                    .metadata
                    .get(field)
                    .is_some_and(|value| !value.is_missing() && re.is_match(&value.to_string()))
            })
            .map(|(position, _)| position)
            .collect())
    }

    /// Starts an optimization run with the bundled [`PairwiseEngine`].
    ///
    /// # Errors
    /// See [`Dataset::start_run_with_engine`]
    pub fn start_run(
        &mut self,
        params: RunParameters,
        on_step: StepCallback,
    ) -> Result<(), ProjectorError> {
        let config = EngineConfiguration::builder()
            .dimensions(params.dimensions)
            .perplexity(params.perplexity)
            .learning_rate(params.learning_rate)
            .maybe_seed(self.config.seed)
            .build();
        let engine = PairwiseEngine::new(config)?;
        self.start_run_with_engine(params, Box::new(engine), on_step)
    }

    /// Starts an optimization run driving `engine`.
    ///
    /// Any active run is stopped first. Up to `sample_size` points are taken
    /// from the shuffled order; their neighbor table is reused from the last
    /// run when `k = floor(3 * perplexity)` is unchanged, otherwise
    /// recomputed. The run starts in [`RunState::Running`] at iteration 0.
    ///
    /// # Errors
    /// * `ProjectorError::InvalidEmbeddingDimensions` unless `dimensions` is
    ///   2 or 3 and equal to the engine's dimensionality
    /// * Any error from the engine's `init`
    pub fn start_run_with_engine(
        &mut self,
        params: RunParameters,
        mut engine: Box<dyn OptimizerEngine>,
        on_step: StepCallback,
    ) -> Result<(), ProjectorError> {
        if !(2..=3).contains(&params.dimensions) {
            return Err(ProjectorError::InvalidEmbeddingDimensions(
                params.dimensions,
            ));
        }
        if engine.dimensionality() != params.dimensions {
            return Err(ProjectorError::InvalidEmbeddingDimensions(
                engine.dimensionality(),
            ));
        }
        self.finish_run();

        let k = params.neighbor_count();
        let sample: Vec<usize> = self
            .shuffled_indices
            .iter()
            .take(self.config.sample_size)
            .copied()
            .collect();
        self.ensure_neighbors(&sample, k);
        engine.init(self.nearest.as_deref().unwrap_or_default())?;

        let control = RunControl::default();
        let mut run = EmbeddingRun::new(engine, sample, on_step, control.clone());
        supervise(
            &mut run,
            &self.points,
            self.supervise_column.as_deref(),
            &self.supervise_auxiliary,
        );
        if let Some(factor) = self.supervise_factor {
            run.engine_mut().set_supervise_factor(factor);
        }

        info!(
            "Started run over {} points (k={k}, perplexity={})",
            run.sample().len(),
            params.perplexity
        );
        self.run = Some(run);
        self.control = control;
        self.stopped = false;
        self.valid_projections.insert(TSNE_PROJECTION.to_owned());
        Ok(())
    }

    /// Performs one scheduled unit of work.
    ///
    /// A stop request tears the run down and reports
    /// [`TickOutcome::Stopped`]; a paused run does nothing; otherwise the
    /// engine steps once and the sampled points' projections are updated.
    pub fn tick(&mut self) -> TickOutcome {
        let Some(run) = self.run.as_mut() else {
            return if self.stopped {
                TickOutcome::Stopped
            } else {
                TickOutcome::Idle
            };
        };

        match run.state() {
            RunState::Stopped => {
                self.finish_run();
                TickOutcome::Stopped
            }
            RunState::Paused => TickOutcome::Paused,
            RunState::Running | RunState::Idle => TickOutcome::Stepped(run.step(&mut self.points)),
        }
    }

    /// Skips steps until [`Dataset::resume`].
    pub fn pause(&self) {
        self.control.pause();
    }

    /// Continues a paused run.
    pub fn resume(&self) {
        self.control.resume();
    }

    /// Stops the active run.
    ///
    /// The engine is discarded and the step callback receives `None`.
    /// Projections already written stay in the points, but `"tsne"` is no
    /// longer reported as current.
    pub fn stop(&mut self) {
        self.control.stop();
        self.finish_run();
    }

    /// Asks the engine for one out-of-band adjustment and republishes the
    /// layout. Does nothing without an active run.
    pub fn perturb(&mut self) {
        if let Some(run) = self.run.as_mut() {
            if !run.control().is_stopped() {
                run.perturb(&mut self.points);
            }
        }
    }

    /// Supervises the run with labels from metadata `column`, or clears
    /// supervision with `None`.
    ///
    /// Points without a value in the column are labelled `Unknown #<index>`.
    /// `auxiliary` is passed through to the engine. The setting also applies
    /// to later runs.
    pub fn set_supervision(&mut self, column: Option<&str>, auxiliary: &str) {
        self.supervise_column = column.map(str::to_owned);
        auxiliary.clone_into(&mut self.supervise_auxiliary);
        if let Some(run) = self.run.as_mut() {
            supervise(run, &self.points, column, auxiliary);
        }
    }

    /// Sets the supervision weight for the active and later runs.
    pub fn set_supervise_factor(&mut self, factor: f32) {
        self.supervise_factor = Some(factor);
        if let Some(run) = self.run.as_mut() {
            run.engine_mut().set_supervise_factor(factor);
        }
    }

    /// Current run state.
    pub fn run_state(&self) -> RunState {
        match &self.run {
            Some(run) => run.state(),
            None if self.stopped => RunState::Stopped,
            None => RunState::Idle,
        }
    }

    /// Iterations completed by the active run, 0 without one.
    pub fn iteration(&self) -> usize {
        self.run.as_ref().map_or(0, EmbeddingRun::iteration)
    }

    /// Whether a run is active and not stopping.
    pub fn has_run(&self) -> bool {
        self.run
            .as_ref()
            .is_some_and(|run| !run.control().is_stopped())
    }

    /// Pause and stop handle for the active run.
    pub fn control(&self) -> RunControl {
        self.control.clone()
    }

    fn finish_run(&mut self) {
        if let Some(run) = self.run.take() {
            run.finish();
            self.valid_projections.remove(TSNE_PROJECTION);
            self.stopped = true;
        }
    }

    /// Fills the neighbor cache for `sample` unless it already holds `k`
    /// neighbors per point.
    fn ensure_neighbors(&mut self, sample: &[usize], k: usize) {
        if let Some(nearest) = &self.nearest {
            if self.nearest_k == k && nearest.len() == sample.len() {
                debug!("Reusing nearest neighbors (k={k})");
                return;
            }
        }

        let vectors: Vec<Vec<f32>> = sample
            .iter()
            .map(|&position| {
                let mut v = self.points[position].vector.clone();
                vector::unit(&mut v);
                v
            })
            .collect();

        let nearest = match KnnStrategy::select(self.kernel.as_ref(), self.config.accelerated_knn) {
            KnnStrategy::Accelerated => find_knn_accelerated(
                &vectors,
                k,
                Vec::as_slice,
                self.kernel.as_ref(),
                self.config.knn_block_size,
                |progress| debug!("Nearest neighbors {:.0}% done", progress * 100.0),
            ),
            KnnStrategy::Cpu => find_knn(&vectors, k, Vec::as_slice, cos_dist_norm_with_limit),
        };
        self.nearest = Some(nearest);
        self.nearest_k = k;
    }

    /// Rows of the vectors at `positions`, optionally restricted to
    /// `columns`.
    fn matrix(&self, positions: &[usize], columns: Option<&[usize]>) -> Array2<f32> {
        let width = columns.map_or(self.dim, <[usize]>::len);
        Array2::from_shape_fn((positions.len(), width), |(row, col)| {
            let v = &self.points[positions[row]].vector;
            columns.map_or(v[col], |columns| v[columns[col]])
        })
    }
}

fn seeded_rng(seed: Option<u64>) -> Pcg64Mcg {
    match seed {
        Some(seed) => Pcg64Mcg::seed_from_u64(seed),
        None => Pcg64Mcg::from_entropy(),
    }
}

/// Forwards labels from `column` for the run's sampled points to its engine.
fn supervise(run: &mut EmbeddingRun, points: &[Point], column: Option<&str>, auxiliary: &str) {
    let Some(column) = column else {
        run.engine_mut().set_supervision(None, auxiliary);
        return;
    };

    let labels: Vec<String> = run
        .sample()
        .iter()
        .map(|&position| {
            let point = &points[position];
            match point.metadata.get(column) {
                Some(value) if !value.is_missing() => value.to_string(),
                _ => format!("Unknown #{}", point.index),
            }
        })
        .collect();
    run.engine_mut().set_supervision(Some(labels.as_slice()), auxiliary);
}

/// Rebuilds sequences from metadata links and records each point's sequence.
///
/// Chains are followed from every point not yet in a sequence. A chain ends
/// at a point without a link, a link to an unknown index, or a point already
/// claimed. If that point is the head of an earlier sequence, the new chain is
/// prepended to it. Chains of a single point are dropped.
fn assign_sequences(points: &mut [Point]) -> Vec<Sequence> {
    let positions: HashMap<usize, usize> = points
        .iter()
        .enumerate()
        .map(|(position, point)| (point.index, position))
        .collect();
    let next_of = |position: usize| -> Option<usize> {
        points[position]
            .next_link()
            .and_then(|index| positions.get(&index).copied())
    };

    let mut sequence_of: Vec<Option<usize>> = vec![None; points.len()];
    let mut sequences: Vec<Sequence> = Vec::new();

    for start in 0..points.len() {
        if sequence_of[start].is_some() {
            continue;
        }
        let Some(mut next) = next_of(start) else {
            continue;
        };

        let id = sequences.len();
        let mut chain = vec![start];
        sequence_of[start] = Some(id);
        let mut joined = None;

        loop {
            if let Some(existing) = sequence_of[next] {
                if existing != id && sequences[existing].point_indices.first() == Some(&next) {
                    joined = Some(existing);
                }
                break;
            }
            sequence_of[next] = Some(id);
            chain.push(next);
            match next_of(next) {
                Some(after) => next = after,
                None => break,
            }
        }

        match joined {
            Some(existing) => {
                for &position in &chain {
                    sequence_of[position] = Some(existing);
                }
                let mut tail = std::mem::take(&mut sequences[existing].point_indices);
                chain.append(&mut tail);
                sequences[existing].point_indices = chain;
            }
            None if chain.len() > 1 => sequences.push(Sequence {
                point_indices: chain,
            }),
            None => sequence_of[start] = None,
        }
    }

    for (point, sequence) in points.iter_mut().zip(sequence_of) {
        point.sequence_index = sequence;
    }
    sequences
}
