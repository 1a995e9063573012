#![allow(clippy::multiple_crate_versions)]

//! # `projector`: interactive projection of high-dimensional point clouds
//!
//! This crate is the numeric core of an embedding projector. It turns a large
//! in-memory vector dataset into a continuously updating 2D or 3D layout that
//! a renderer can draw frame by frame.
//!
//! ## Key Features
//!
//! - Streaming ingestion of delimiter-separated tensor and metadata files with
//!   bounded memory, plus binary `f32` tensors
//! - Per-column metadata statistics (numeric range, categorical cardinality)
//! - Two interchangeable k-nearest-neighbor strategies: an exact CPU search
//!   that prunes with symmetric early-exit bounds, and a batched
//!   matrix-multiplication search that falls back to the CPU transparently
//! - A cooperative optimization driver with pause, stop, perturb and
//!   supervision controls over a pluggable [`OptimizerEngine`]
//! - Sequence reconstruction from `__seq_next__` / `__next__` metadata links
//! - PCA and custom linear projections, neighbor lookup and metadata search
//!
//! ## Examples
//!
//! Loading a tensor file and running an embedding:
//! ```rust,no_run
//! use projector::{parse_tensors, Dataset, ParseOptions, RunParameters, TickOutcome};
//!
//! let file = std::fs::File::open("vectors.tsv")?;
//! let points = parse_tensors(std::io::BufReader::new(file), &ParseOptions::default())?;
//! let mut dataset = Dataset::new(points)?;
//! dataset.normalize()?;
//!
//! let params = RunParameters::builder().perplexity(30.0).build();
//! dataset.start_run(params, Box::new(|iteration| println!("{iteration:?}")))?;
//! while let TickOutcome::Stepped(iteration) = dataset.tick() {
//!     if iteration == 500 {
//!         dataset.stop();
//!     }
//! }
//! # Ok::<(), projector::ProjectorError>(())
//! ```
//!
//! Nearest neighbors without a dataset:
//! ```rust
//! use projector::knn::find_knn;
//! use projector::vector::dist2_with_limit;
//!
//! let points = vec![vec![0.0, 0.0], vec![1.0, 0.0], vec![5.0, 5.0]];
//! let neighbors = find_knn(&points, 1, Vec::as_slice, dist2_with_limit);
//! assert_eq!(neighbors[0][0].index, 1);
//! ```
//!
//! ## Configuration
//!
//! [`DriverConfiguration`] carries the tunable constants: the optimization
//! sample cap (10,000), PCA sampling, the accelerated search block size (256),
//! the unique-value threshold for metadata statistics (50), the streaming
//! chunk size and the metadata merge policy.
//!
//! ## Implementation Notes
//!
//! - Dense matrices use ndarray; batch work is parallelized with rayon
//! - Vector reductions use SIMD via `wide`
//! - Errors are reported through [`ProjectorError`]; only accelerated
//!   neighbor-search failures are recovered silently
//! - Logging goes through `tracing`; no subscriber is installed

mod adam;
pub mod config;
pub mod dataset;
pub mod driver;
pub mod engine;
mod gradient;
pub mod heap;
pub mod knn;
pub mod parse;
pub mod provider;
pub mod stats;
pub mod stream;
pub mod vector;

#[cfg(test)]
mod tests;

use ndarray_rand::rand_distr::NormalError;
use petal_decomposition::DecompositionError;
use std::path::PathBuf;
use thiserror::Error;

pub use crate::config::{DriverConfiguration, EmbeddingInfo, ProjectorConfig, SpriteMetadata};
pub use crate::dataset::{
    Dataset, MergePolicy, MetadataValue, Metric, MismatchKind, Point, PointMetadata, Sequence,
    SpriteAndMetadataInfo,
};
pub use crate::driver::{RunControl, RunParameters, RunState, StepCallback, TickOutcome};
pub use crate::engine::{EngineConfiguration, OptimizerEngine, PairwiseEngine};
pub use crate::heap::BoundedTopK;
pub use crate::knn::{DistanceKernel, KernelError, KnnStrategy, MatmulKernel, NearestEntry};
pub use crate::parse::{parse_metadata, parse_tensors, parse_tensors_from_f32_bytes};
pub use crate::provider::{DataProvider, FileDataProvider, State};
pub use crate::stats::{ColumnStats, UniqueEntry};
pub use crate::stream::{stream_records, ParseOptions};

/// Errors that can occur while loading, projecting or embedding a dataset.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProjectorError {
    /// Tensor rows or points disagree on vector length
    #[error("Vector dimensions do not match: expected {expected}, found {actual} at row {line}")]
    DimensionMismatch {
        /// Dimension established by the first row
        expected: usize,
        /// Dimension of the offending row
        actual: usize,
        /// 1-based row number
        line: usize,
    },

    /// A projection direction does not match the dataset dimension
    #[error("Projection direction has {actual} components, dataset vectors have {expected}")]
    ProjectionDimension {
        /// Dataset dimension
        expected: usize,
        /// Length of the direction
        actual: usize,
    },

    /// Vectors have one or zero components
    #[error("Found vectors with only {dim} dimension(s); at least two are required")]
    DegenerateVector {
        /// Resolved dimensionality
        dim: usize,
    },

    /// A statistic or centroid was requested over zero points
    #[error("Cannot compute over an empty set of points")]
    EmptyInput,

    /// A tensor component is not a number
    #[error("Could not parse {value:?} as a number at row {line}")]
    InvalidNumber {
        /// 1-based row number
        line: usize,
        /// Offending field
        value: String,
    },

    /// A binary tensor's length disagrees with its declared shape
    #[error("Tensor of shape {shape:?} needs {expected_bytes} bytes, found {actual_bytes}")]
    TensorShapeMismatch {
        /// Declared `[points, dimension]`
        shape: [usize; 2],
        /// Byte length implied by the shape
        expected_bytes: usize,
        /// Byte length of the file
        actual_bytes: usize,
    },

    /// Metadata record count disagrees with the point count
    #[error("Number of tensors ({points}) does not match the number of metadata records ({records}).{}", .kind.hint())]
    MetadataShapeMismatch {
        /// Likely cause of the mismatch
        kind: MismatchKind,
        /// Points in the dataset
        points: usize,
        /// Records in the metadata
        records: usize,
    },

    /// A sprite image exceeds the maximum texture size
    #[error("Sprite image of size {width}x{height} exceeds the maximum of {max}x{max}")]
    OversizedSpriteImage {
        /// Image width in pixels
        width: u32,
        /// Image height in pixels
        height: u32,
        /// Maximum allowed size in either dimension
        max: u32,
    },

    /// Embedding dimensionality other than 2 or 3 was requested, or the
    /// engine's dimensionality differs from the run's
    #[error("Embeddings must have 2 or 3 dimensions matching the engine, got {0}")]
    InvalidEmbeddingDimensions(usize),

    /// A record or value delimiter is outside ASCII
    #[error("Delimiter byte {0:#04x} is not ASCII")]
    InvalidDelimiter(u8),

    /// Neighbor lists handed to an engine do not describe its points
    #[error("Invalid neighbor lists: {0}")]
    InvalidNeighbors(String),

    /// A point index is outside the dataset
    #[error("Point index {index} out of range for {len} points")]
    IndexOutOfRange {
        /// Requested index
        index: usize,
        /// Number of points
        len: usize,
    },

    /// A search pattern failed to compile
    #[error(transparent)]
    Query(#[from] regex::Error),

    /// A run directory has no projector configuration
    #[error("Unknown run {0:?}")]
    UnknownRun(String),

    /// The configuration names no such embedding
    #[error("Run {run:?} has no embedding named {name:?}")]
    UnknownTensor {
        /// Run name
        run: String,
        /// Requested tensor name
        name: String,
    },

    /// An embedding has no tensor file to load
    #[error("Embedding {0:?} has no tensor path")]
    MissingTensorPath(String),

    /// A binary tensor has no declared shape
    #[error("Binary tensor {0:?} has no tensor shape")]
    MissingTensorShape(String),

    /// A file could not be read
    #[error("Failed to read {}: {source}", .path.display())]
    File {
        /// File being read
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// Reading from a stream failed
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A record was not valid UTF-8
    #[error("Record {record} is not valid UTF-8: {source}")]
    Utf8 {
        /// 0-based record number
        record: usize,
        /// Underlying error
        source: std::str::Utf8Error,
    },

    /// A configuration or bookmark file is malformed
    #[error(transparent)]
    Config(#[from] serde_json::Error),

    /// PCA decomposition failed
    #[error(transparent)]
    Pca(#[from] DecompositionError),

    /// Normal distribution creation failed
    #[error(transparent)]
    Normal(#[from] NormalError),
}
