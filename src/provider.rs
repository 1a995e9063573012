//! Loading runs from storage.
//!
//! A [`DataProvider`] hands the core its inputs: run configurations, parsed
//! tensors, metadata and bookmarks. [`FileDataProvider`] serves them from a
//! directory tree laid out as
//!
//! ```text
//! <root>/<run>/projector_config.json
//! <root>/<run>/<paths named by the configuration>
//! ```
//!
//! Relative paths in a configuration resolve against the run directory.
//! Tensor files ending in `.bytes` are raw little-endian `f32` and need a
//! `tensorShape`; anything else is parsed as delimited text.

use crate::config::{DriverConfiguration, EmbeddingInfo, ProjectorConfig, SpriteMetadata};
use crate::dataset::{Dataset, SpriteAndMetadataInfo};
use crate::parse::{parse_metadata, parse_tensors, parse_tensors_from_f32_bytes};
use crate::stream::ParseOptions;
use crate::ProjectorError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// File name of a run's configuration.
pub const PROJECTOR_CONFIG_FILE: &str = "projector_config.json";

/// Extension marking binary `f32` tensors.
pub const BINARY_TENSOR_EXTENSION: &str = "bytes";

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

/// A saved view of the projector.
///
/// Only the data shape is defined here; restoring a view is up to the host.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct State {
    /// Display name
    pub label: String,
    /// Whether the view was the active one when saved
    pub is_selected: bool,
    /// Projection family shown, e.g. `"tsne"` or `"pca"`
    pub selected_projection: Option<String>,
    /// `[points, dimension]` of the dataset the view was saved against
    pub data_set_dimensions: Option<[usize; 2]>,
    /// Optimization iteration at save time
    #[serde(rename = "tSNEIteration")]
    pub tsne_iteration: usize,
    /// Projection values per point, keyed like [`Point::projections`](crate::Point)
    pub projections: Vec<HashMap<String, f32>>,
    /// Dataset positions of the selected points
    pub selected_points: Vec<usize>,
    /// Metadata column used for coloring
    pub selected_color_option_name: Option<String>,
    /// Metadata column used for labels
    pub selected_label_option: Option<String>,
}

/// Source of run configurations, tensors, metadata and bookmarks.
pub trait DataProvider {
    /// Names of the available runs, sorted.
    ///
    /// # Errors
    /// * Any storage error
    fn list_runs(&self) -> Result<Vec<String>, ProjectorError>;

    /// Configuration of `run`.
    ///
    /// # Errors
    /// * `ProjectorError::UnknownRun` if the run does not exist
    /// * `ProjectorError::Config` if the configuration is malformed
    fn get_config(&self, run: &str) -> Result<ProjectorConfig, ProjectorError>;

    /// Parsed tensor `tensor_name` of `run`.
    ///
    /// # Errors
    /// * `ProjectorError::UnknownTensor` if the configuration has no such
    ///   embedding
    /// * Any parse or dataset construction error
    fn get_tensor(&self, run: &str, tensor_name: &str) -> Result<Dataset, ProjectorError>;

    /// Metadata and sprite sheet of tensor `tensor_name`.
    ///
    /// An embedding without metadata yields an empty info.
    ///
    /// # Errors
    /// * `ProjectorError::UnknownTensor` if the configuration has no such
    ///   embedding
    /// * Any read or parse error
    fn get_sprite_and_metadata(
        &self,
        run: &str,
        tensor_name: &str,
    ) -> Result<SpriteAndMetadataInfo, ProjectorError>;

    /// Saved views of tensor `tensor_name`, empty if it has none.
    ///
    /// # Errors
    /// * `ProjectorError::UnknownTensor` if the configuration has no such
    ///   embedding
    /// * `ProjectorError::Config` if the bookmarks file is malformed
    fn get_bookmarks(&self, run: &str, tensor_name: &str) -> Result<Vec<State>, ProjectorError>;
}

/// Serves runs from subdirectories of a root directory.
#[derive(Clone, Debug)]
pub struct FileDataProvider {
    root: PathBuf,
    config: DriverConfiguration,
}

impl FileDataProvider {
    /// Serves the runs under `root` with the default
    /// [`DriverConfiguration`].
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            config: DriverConfiguration::default(),
        }
    }

    /// Replaces the configuration given to loaded datasets.
    #[must_use]
    pub fn with_config(mut self, config: DriverConfiguration) -> Self {
        self.config = config;
        self
    }

    /// Directory of `run`, rejecting names that would leave the root.
    fn run_dir(&self, run: &str) -> Result<PathBuf, ProjectorError> {
        let mut components = Path::new(run).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.root.join(run)),
            _ => Err(ProjectorError::UnknownRun(run.to_owned())),
        }
    }

    fn embedding(&self, run: &str, tensor_name: &str) -> Result<EmbeddingInfo, ProjectorError> {
        self.get_config(run)?
            .embedding(tensor_name)
            .cloned()
            .ok_or_else(|| ProjectorError::UnknownTensor {
                run: run.to_owned(),
                name: tensor_name.to_owned(),
            })
    }

    fn parse_options(&self) -> ParseOptions {
        ParseOptions::builder()
            .chunk_size(self.config.chunk_size)
            .build()
    }

    /// Reads the sprite image header and attaches the sprite if it fits.
    fn attach_sprite(info: &mut SpriteAndMetadataInfo, sprite: SpriteMetadata) {
        let mut header = [0u8; 24];
        let size = File::open(&sprite.image_path)
            .and_then(|mut file| file.read_exact(&mut header))
            .ok()
            .and_then(|()| png_dimensions(&header));

        match size {
            Some([width, height]) => {
                info.attach_sprite(sprite, width, height);
            }
            None => warn!(
                "Could not read the size of sprite image {}; continuing without sprites",
                sprite.image_path.display()
            ),
        }
    }
}

impl DataProvider for FileDataProvider {
    fn list_runs(&self) -> Result<Vec<String>, ProjectorError> {
        let entries = fs::read_dir(&self.root).map_err(|source| ProjectorError::File {
            path: self.root.clone(),
            source,
        })?;

        let mut runs = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.join(PROJECTOR_CONFIG_FILE).is_file() {
                if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
                    runs.push(name.to_owned());
                }
            }
        }
        runs.sort();
        debug!("Found {} runs under {}", runs.len(), self.root.display());
        Ok(runs)
    }

    fn get_config(&self, run: &str) -> Result<ProjectorConfig, ProjectorError> {
        let path = self.run_dir(run)?.join(PROJECTOR_CONFIG_FILE);
        if !path.is_file() {
            return Err(ProjectorError::UnknownRun(run.to_owned()));
        }
        ProjectorConfig::from_json(&read_to_string(&path)?)
    }

    fn get_tensor(&self, run: &str, tensor_name: &str) -> Result<Dataset, ProjectorError> {
        let embedding = self.embedding(run, tensor_name)?;
        let relative = embedding
            .tensor_path
            .as_ref()
            .ok_or_else(|| ProjectorError::MissingTensorPath(tensor_name.to_owned()))?;
        let path = self.run_dir(run)?.join(relative);

        let binary = path
            .extension()
            .is_some_and(|extension| extension == BINARY_TENSOR_EXTENSION);
        let points = if binary {
            let shape = embedding
                .tensor_shape
                .ok_or_else(|| ProjectorError::MissingTensorShape(tensor_name.to_owned()))?;
            let bytes = fs::read(&path).map_err(|source| ProjectorError::File {
                path: path.clone(),
                source,
            })?;
            parse_tensors_from_f32_bytes(&bytes, shape)?
        } else {
            parse_tensors(open(&path)?, &self.parse_options())?
        };

        debug!(
            "Loaded tensor {tensor_name:?} of run {run:?} with {} points",
            points.len()
        );
        Dataset::with_config(points, self.config.clone())
    }

    fn get_sprite_and_metadata(
        &self,
        run: &str,
        tensor_name: &str,
    ) -> Result<SpriteAndMetadataInfo, ProjectorError> {
        let embedding = self.embedding(run, tensor_name)?;
        let run_dir = self.run_dir(run)?;

        let mut info = match &embedding.metadata_path {
            Some(relative) => parse_metadata(
                open(&run_dir.join(relative))?,
                &self.parse_options(),
                self.config.too_many_unique_values,
            )?,
            None => SpriteAndMetadataInfo::default(),
        };

        if let Some(sprite) = embedding.sprite {
            let sprite = SpriteMetadata {
                image_path: run_dir.join(&sprite.image_path),
                ..sprite
            };
            Self::attach_sprite(&mut info, sprite);
        }
        Ok(info)
    }

    fn get_bookmarks(&self, run: &str, tensor_name: &str) -> Result<Vec<State>, ProjectorError> {
        let embedding = self.embedding(run, tensor_name)?;
        let Some(relative) = &embedding.bookmarks_path else {
            return Ok(Vec::new());
        };
        let path = self.run_dir(run)?.join(relative);
        Ok(serde_json::from_str(&read_to_string(&path)?)?)
    }
}

fn open(path: &Path) -> Result<File, ProjectorError> {
    File::open(path).map_err(|source| ProjectorError::File {
        path: path.to_path_buf(),
        source,
    })
}

fn read_to_string(path: &Path) -> Result<String, ProjectorError> {
    fs::read_to_string(path).map_err(|source| ProjectorError::File {
        path: path.to_path_buf(),
        source,
    })
}

/// Width and height from the IHDR chunk of a PNG header.
fn png_dimensions(header: &[u8; 24]) -> Option<[u32; 2]> {
    if header[..8] != PNG_SIGNATURE || &header[12..16] != b"IHDR" {
        return None;
    }
    let width = u32::from_be_bytes([header[16], header[17], header[18], header[19]]);
    let height = u32::from_be_bytes([header[20], header[21], header[22], header[23]]);
    Some([width, height])
}
