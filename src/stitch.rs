//! Boundary to the external registration and fusion algorithm.

use crate::{enums::FusionMethod, roi::RoiSet};

use ndarray::Array3;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StitchError {
    #[error("Stitching failed: {0}")]
    Failed(String),

    #[error("Cannot save ROI set: {0}")]
    RoiSave(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct FusionParams {
    pub fusion_method: FusionMethod,
    pub regression_threshold: f64,
    pub max_avg_displacement_threshold: f64,
    pub absolute_displacement_threshold: f64,
    /// Refine positions by cross-correlating overlaps instead of trusting the stage.
    pub compute_overlap: bool,
    pub invert_x: bool,
    pub invert_y: bool,
    pub subpixel_accuracy: bool,
    pub add_tiles_as_rois: bool,
}

impl Default for FusionParams {
    fn default() -> Self {
        Self {
            fusion_method: FusionMethod::LinearBlending,
            regression_threshold: 0.30,
            max_avg_displacement_threshold: 2.50,
            absolute_displacement_threshold: 3.50,
            compute_overlap: false,
            invert_x: false,
            invert_y: false,
            subpixel_accuracy: true,
            add_tiles_as_rois: true,
        }
    }
}

pub struct StitchRequest<'a> {
    /// Directory holding the projections named in the tile config.
    pub image_directory: &'a Path,
    pub tile_config: &'a Path,
    pub fusion: &'a FusionParams,
}

/// Fused mosaic as `(channel, y, x)`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FusedImage {
    pub data: Array3<u16>,
}

impl FusedImage {
    pub fn new(data: Array3<u16>) -> Self {
        Self { data }
    }

    /// Get the dimensions of the mosaic (channels, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }
}

pub struct StitchOutput {
    pub fused: FusedImage,
    /// One boundary ROI per declared tile, placeholders for unmatched tiles included.
    pub rois: RoiSet,
}

pub trait StitchAlgorithm: Send + Sync {
    fn stitch(&self, request: &StitchRequest<'_>) -> Result<StitchOutput, StitchError>;

    /// Persist an ROI set in the stitcher's own archive format.
    fn save_roi_set(&self, rois: &RoiSet, path: &Path) -> Result<(), StitchError>;
}
