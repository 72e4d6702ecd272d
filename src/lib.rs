//! # Tile-scan stitching library
//!
//! This crate orchestrates the stitching of multi-tile, multi-channel
//! microscopy acquisitions and the extraction of full-resolution z-stacks
//! for tiles picked on the stitched mosaic.
//!
//! Decoding of the vendor file format and the registration/fusion algorithm
//! itself are provided by the host through the [`ImageBackend`] and
//! [`StitchAlgorithm`] traits. The crate takes care of everything around
//! them:
//!  - Enumerating the series of a file and converting stage positions to
//!    pixel coordinates
//!  - Computing maximum-intensity projections of every tile in parallel
//!    using rayon
//!  - Writing the tile configuration consumed by the stitcher
//!  - Cleaning up and persisting the stitched image and its ROI set
//!  - Re-reading single tiles on ROI selection and writing one multi-page
//!    TIFF per channel, without blocking the caller
//!
//! Everything is logged through `tracing`; installing a subscriber is up to
//! the host.
//!
//! # Examples
//!
//! ## Stitching every tile group of a file
//!
//! ```no_run
//! # use tilescan_stitch::{Config, ImageBackend, StitchAlgorithm, Stitcher};
//! # use std::sync::Arc;
//! # fn run(backend: Arc<dyn ImageBackend>, algorithm: &dyn StitchAlgorithm) {
//! let config = Config::load("stitch.toml").expect("should have read config");
//! let mut stitcher = Stitcher::new(backend, config);
//! stitcher.open_sources(&["data/experiment.lif"]);
//!
//! for outcome in stitcher.run(algorithm, |_| true).expect("should have started pool") {
//!     match outcome.result {
//!         Ok(report) => println!("{}: {}", outcome.group, report.fused.display()),
//!         Err(err) => eprintln!("{}: {err}", outcome.group),
//!     }
//! }
//! # }
//! ```
//!
//! ## Extracting the z-stack behind a selected ROI
//!
//! ```no_run
//! # use tilescan_stitch::{Calibration, ExtractionOptions, ExtractionPipeline, ImageBackend, ImageSource, SelectedRoi};
//! # use std::sync::Arc;
//! # fn run(backend: Arc<dyn ImageBackend>) {
//! let source = ImageSource::open(backend, "data/experiment.lif", false, &Calibration::default())
//!     .expect("should have opened file");
//! let pipeline = ExtractionPipeline::new(Arc::new(source), "data/zstacks", &ExtractionOptions::default())
//!     .expect("should have started workers");
//!
//! pipeline.on_selection(&[SelectedRoi::new("0, 0 file=TileScan_1_mp_3.tif", 4)]);
//! for outcome in pipeline.wait_idle() {
//!     println!("ROI {}: {:?}", outcome.task.roi_ordinal, outcome.result.map(|r| r.written));
//! }
//! # }
//! ```

pub mod backend;
pub mod calibration;
pub mod companion;
pub mod config;
pub mod enums;
pub mod extraction;
pub mod image_source;
pub mod job;
pub mod projection;
pub mod roi;
pub mod stitch;
pub mod tile_config;
pub mod tile_stack;
pub mod writer;

#[cfg(test)]
mod testing;

pub use backend::{BackendError, ImageBackend, ImageReader, PhysicalLength, StackDims};
pub use calibration::Calibration;
pub use config::{Config, ExtractionOptions, StitchOptions};
pub use extraction::{ExtractionOutcome, ExtractionPipeline, ExtractionState, ExtractionTask, SelectedRoi};
pub use image_source::{ImageSource, Tile};
pub use job::{JobError, StitchReport, Stitcher, StitchingJob};
pub use stitch::{FusedImage, FusionParams, StitchAlgorithm, StitchOutput, StitchRequest};
