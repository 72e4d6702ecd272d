//! Configuration for stitching and extraction runs.
//!
//! Every key is optional; a missing key keeps its default.
//!
//! ```toml
//! [calibration]
//! stage_unit = "meter"
//!
//! [stitch]
//! move_into_subfolder = true
//! png_export = true
//!
//! [stitch.fusion]
//! compute_overlap = true
//! invert_x = true
//!
//! [extraction]
//! coordinator_threads = 4
//! ```

use crate::{calibration::Calibration, stitch::FusionParams};

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub calibration: Calibration,
    pub stitch: StitchOptions,
    pub extraction: ExtractionOptions,
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct StitchOptions {
    /// Move each source file into a folder named after it before stitching.
    pub move_into_subfolder: bool,
    /// Also write an RGB `_stitched.png` next to the fused TIFF.
    pub png_export: bool,
    /// Projection pool size; `None` uses all available cores.
    pub projection_threads: Option<usize>,
    pub keep_scratch_on_failure: bool,
    pub fusion: FusionParams,
}

impl Default for StitchOptions {
    fn default() -> Self {
        Self {
            move_into_subfolder: false,
            png_export: false,
            projection_threads: None,
            keep_scratch_on_failure: false,
            fusion: FusionParams::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExtractionOptions {
    /// Worker threads coordinating extraction tasks; they do no heavy I/O.
    pub coordinator_threads: usize,
    /// Extension of the original multi-series files, used to find them from a stitched image.
    pub source_extension: String,
    /// Name of the output folder created next to the stitched image.
    pub output_dir_name: String,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self {
            coordinator_threads: 8,
            source_extension: "lif".to_string(),
            output_dir_name: "zstacks".to_string(),
        }
    }
}
