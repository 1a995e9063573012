//! Driver tuning and the projector configuration file format.
//!
//! [`DriverConfiguration`] holds the constants that bound the work a
//! [`Dataset`](crate::Dataset) does: sampling caps, the accelerated search
//! block size and parsing parameters. [`ProjectorConfig`] is the JSON document
//! describing which tensors, metadata and sprites make up a run.

use crate::dataset::MergePolicy;
use crate::stats::TOO_MANY_UNIQUE_VALUES;
use crate::stream::DEFAULT_CHUNK_SIZE;
use crate::ProjectorError;
use bon::Builder;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Maximum points handed to the optimizer in one run.
pub const SAMPLE_SIZE: usize = 10_000;

/// Maximum points used to fit PCA.
pub const PCA_SAMPLE_SIZE: usize = 50_000;

/// Vectors wider than this are randomly projected before PCA.
pub const PCA_SAMPLE_DIM: usize = 200;

/// Number of principal components computed.
pub const NUM_PCA_COMPONENTS: usize = 10;

/// Rows per score-matrix block in the accelerated neighbor search.
pub const KNN_BLOCK_SIZE: usize = 256;

/// Largest sprite image accepted in either dimension, in pixels.
pub const MAX_SPRITE_IMAGE_SIZE_PX: u32 = 8192;

/// Tunable constants for dataset operations.
#[derive(Builder, Clone, Debug)]
pub struct DriverConfiguration {
    /// Maximum points sampled for an optimization run
    #[builder(default = SAMPLE_SIZE)]
    pub sample_size: usize,

    /// Maximum points sampled to fit PCA
    #[builder(default = PCA_SAMPLE_SIZE)]
    pub pca_sample_size: usize,

    /// Dimension above which vectors are randomly projected before PCA
    #[builder(default = PCA_SAMPLE_DIM)]
    pub pca_sample_dim: usize,

    /// Number of principal components to compute
    #[builder(default = NUM_PCA_COMPONENTS)]
    pub pca_components: usize,

    /// Rows per block in the accelerated neighbor search
    #[builder(default = KNN_BLOCK_SIZE)]
    pub knn_block_size: usize,

    /// Distinct values above which metadata columns stop tracking counts
    #[builder(default = TOO_MANY_UNIQUE_VALUES)]
    pub too_many_unique_values: usize,

    /// Bytes read per chunk when streaming files
    #[builder(default = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Prefer the accelerated neighbor search when the kernel is available
    #[builder(default = true)]
    pub accelerated_knn: bool,

    /// How metadata with a mismatched record count is handled
    #[builder(default)]
    pub metadata_merge: MergePolicy,

    /// Optional seed for the sampling shuffle and random projections
    pub seed: Option<u64>,
}

impl Default for DriverConfiguration {
    fn default() -> Self {
        Self {
            sample_size: SAMPLE_SIZE,
            pca_sample_size: PCA_SAMPLE_SIZE,
            pca_sample_dim: PCA_SAMPLE_DIM,
            pca_components: NUM_PCA_COMPONENTS,
            knn_block_size: KNN_BLOCK_SIZE,
            too_many_unique_values: TOO_MANY_UNIQUE_VALUES,
            chunk_size: DEFAULT_CHUNK_SIZE,
            accelerated_knn: true,
            metadata_merge: MergePolicy::default(),
            seed: None,
        }
    }
}

/// Sprite sheet description for an embedding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpriteMetadata {
    /// Path of the composite image
    pub image_path: PathBuf,
    /// Width and height of a single cell in pixels
    pub single_image_dim: [u32; 2],
}

/// One embedding within a projector configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingInfo {
    /// Display name of the tensor
    pub tensor_name: String,
    /// `[points, dimension]`
    #[serde(default)]
    pub tensor_shape: Option<[usize; 2]>,
    /// Tensor file, either delimited text or raw `f32` with a `.bytes`
    /// extension
    #[serde(default)]
    pub tensor_path: Option<PathBuf>,
    /// Metadata file
    #[serde(default)]
    pub metadata_path: Option<PathBuf>,
    /// Bookmarks file
    #[serde(default)]
    pub bookmarks_path: Option<PathBuf>,
    /// Sprite sheet
    #[serde(default)]
    pub sprite: Option<SpriteMetadata>,
}

/// Configuration of a projector run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectorConfig {
    /// Embeddings available in the run
    #[serde(default)]
    pub embeddings: Vec<EmbeddingInfo>,
    /// Checkpoint the embeddings were exported from
    #[serde(default)]
    pub model_checkpoint_path: Option<PathBuf>,
}

impl ProjectorConfig {
    /// Parses a configuration from JSON.
    ///
    /// # Errors
    /// * `ProjectorError::Config` if the JSON is malformed
    pub fn from_json(json: &str) -> Result<Self, ProjectorError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Looks up an embedding by tensor name.
    pub fn embedding(&self, tensor_name: &str) -> Option<&EmbeddingInfo> {
        self.embeddings
            .iter()
            .find(|embedding| embedding.tensor_name == tensor_name)
    }
}

/// Checks a sprite image against [`MAX_SPRITE_IMAGE_SIZE_PX`].
///
/// # Errors
/// * `ProjectorError::OversizedSpriteImage` if either side is too large
pub fn check_sprite_size(width: u32, height: u32) -> Result<(), ProjectorError> {
    if width > MAX_SPRITE_IMAGE_SIZE_PX || height > MAX_SPRITE_IMAGE_SIZE_PX {
        return Err(ProjectorError::OversizedSpriteImage {
            width,
            height,
            max: MAX_SPRITE_IMAGE_SIZE_PX,
        });
    }
    Ok(())
}
