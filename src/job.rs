use crate::{
    backend::ImageBackend,
    config::{Config, StitchOptions},
    enums::ChannelColor,
    image_source::ImageSource,
    projection::{ProjectionError, ProjectionScheduler},
    roi,
    stitch::{StitchAlgorithm, StitchError, StitchOutput, StitchRequest},
    tile_config::{self, TileConfigError},
    writer::{self, WriteError},
};

use std::{
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use web_time::Instant;

pub const SCRATCH_DIR_NAME: &str = ".max_projections";

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Cannot create scratch directory {path}: {source}")]
    Scratch {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Projection(#[from] ProjectionError),

    #[error(transparent)]
    TileConfig(#[from] TileConfigError),

    #[error(transparent)]
    Stitch(#[from] StitchError),

    #[error("Cannot save {path}: {source}")]
    Save {
        path: PathBuf,
        #[source]
        source: WriteError,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct StitchReport {
    pub group: String,
    pub tiles: usize,
    pub removed_rois: usize,
    pub roi_set: PathBuf,
    pub fused: PathBuf,
    pub png: Option<PathBuf>,
}

/// Stitching of one tile group of one source file.
pub struct StitchingJob {
    source: Arc<ImageSource>,
    group: String,
    scratch_dir: PathBuf,
    tile_config: PathBuf,
    channels: Vec<Option<ChannelColor>>,
}

impl StitchingJob {
    pub fn new(source: Arc<ImageSource>, group: impl Into<String>) -> Self {
        let group = group.into();
        let scratch_dir = source.directory().join(SCRATCH_DIR_NAME);
        let tile_config = scratch_dir.join(format!("tileconfig_{group}.txt"));
        let channels = source
            .channels_for_group(&group)
            .map(<[_]>::to_vec)
            .unwrap_or_default();
        Self {
            source,
            group,
            scratch_dir,
            tile_config,
            channels,
        }
    }

    pub fn source(&self) -> &ImageSource {
        &self.source
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    pub fn tile_config_path(&self) -> &Path {
        &self.tile_config
    }

    /// `<source dir>/<source basename>_<group>`; outputs append their suffix to it.
    pub fn output_base(&self) -> PathBuf {
        self.source
            .directory()
            .join(format!("{}_{}", self.source.base_name(), self.group))
    }

    pub fn run(
        &self,
        algorithm: &dyn StitchAlgorithm,
        options: &StitchOptions,
    ) -> Result<StitchReport, JobError> {
        let scheduler = ProjectionScheduler::new(options.projection_threads)?;
        self.run_with(&scheduler, algorithm, options)
    }

    /// Run the job on an existing projection pool. The scratch directory is
    /// removed afterwards, on failure too unless `keep_scratch_on_failure`.
    pub fn run_with(
        &self,
        scheduler: &ProjectionScheduler,
        algorithm: &dyn StitchAlgorithm,
        options: &StitchOptions,
    ) -> Result<StitchReport, JobError> {
        let start = Instant::now();
        info!(
            source = %self.source.path().display(),
            group = %self.group,
            scratch = %self.scratch_dir.display(),
            "launching stitching job"
        );

        let result = self.execute(scheduler, algorithm, options);
        match &result {
            Ok(report) => {
                info!(
                    group = %self.group,
                    tiles = report.tiles,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "stitching job done"
                );
                self.remove_scratch();
            }
            Err(err) => {
                error!(
                    source = %self.source.base_name(),
                    group = %self.group,
                    error = %err,
                    "stitching job failed"
                );
                if options.keep_scratch_on_failure {
                    warn!(scratch = %self.scratch_dir.display(), "keeping scratch directory");
                } else {
                    self.remove_scratch();
                }
            }
        }
        result
    }

    fn execute(
        &self,
        scheduler: &ProjectionScheduler,
        algorithm: &dyn StitchAlgorithm,
        options: &StitchOptions,
    ) -> Result<StitchReport, JobError> {
        fs::create_dir_all(&self.scratch_dir).map_err(|source| JobError::Scratch {
            path: self.scratch_dir.clone(),
            source,
        })?;

        let entries = scheduler.run(&self.source, &self.group, &self.scratch_dir)?;

        debug!(path = %self.tile_config.display(), entries = entries.len(), "writing tile config");
        tile_config::write(&self.tile_config, &entries)?;

        let StitchOutput { fused, mut rois } = algorithm.stitch(&StitchRequest {
            image_directory: &self.scratch_dir,
            tile_config: &self.tile_config,
            fusion: &options.fusion,
        })?;

        let removed_rois = roi::remove_unknown_tiles(&mut rois);

        let base = self.output_base();
        let roi_set = with_suffix(&base, "_ROIset.zip");
        debug!(path = %roi_set.display(), rois = rois.len(), "saving ROI set");
        algorithm.save_roi_set(&rois, &roi_set)?;

        let fused_path = with_suffix(&base, "_stitch.tif");
        replace_output(&fused_path, |path| {
            writer::write_channel_pages(path, &fused.data).map(|_| ())
        })?;

        let png = if options.png_export {
            let path = with_suffix(&base, "_stitched.png");
            debug!(path = %path.display(), "writing PNG export");
            writer::write_png_composite(&path, &fused.data, &self.channels).map_err(|source| {
                JobError::Save {
                    path: path.clone(),
                    source,
                }
            })?;
            Some(path)
        } else {
            None
        };

        Ok(StitchReport {
            group: self.group.clone(),
            tiles: entries.len(),
            removed_rois,
            roi_set,
            fused: fused_path,
            png,
        })
    }

    fn remove_scratch(&self) {
        debug!(path = %self.scratch_dir.display(), "deleting scratch directory");
        if let Ok(entries) = fs::read_dir(&self.scratch_dir) {
            for entry in entries.filter_map(Result::ok) {
                let path = entry.path();
                match fs::remove_file(&path) {
                    Ok(()) => debug!(path = %path.display(), "deleted"),
                    Err(err) => error!(path = %path.display(), error = %err, "unable to delete file"),
                }
            }
        }
        if let Err(err) = fs::remove_dir(&self.scratch_dir) {
            if err.kind() != io::ErrorKind::NotFound {
                error!(path = %self.scratch_dir.display(), error = %err, "error deleting scratch directory");
            }
        }
    }
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut path = OsString::from(base.as_os_str());
    path.push(suffix);
    PathBuf::from(path)
}

/// Stitch outputs are regenerated on every run, so an older file is replaced.
fn replace_output(
    path: &Path,
    write: impl FnOnce(&Path) -> Result<(), WriteError>,
) -> Result<(), JobError> {
    let save_error = |source| JobError::Save {
        path: path.to_path_buf(),
        source,
    };
    if path.exists() {
        info!(path = %path.display(), "replacing previous output");
        fs::remove_file(path).map_err(|err| save_error(WriteError::Io(err)))?;
    }
    write(path).map_err(save_error)
}

pub struct JobOutcome {
    pub source: PathBuf,
    pub group: String,
    pub result: Result<StitchReport, JobError>,
}

/// Stitches tile groups across several source files.
pub struct Stitcher {
    backend: Arc<dyn ImageBackend>,
    config: Config,
    sources: Vec<Arc<ImageSource>>,
}

impl Stitcher {
    pub fn new(backend: Arc<dyn ImageBackend>, config: Config) -> Self {
        Self {
            backend,
            config,
            sources: Vec::new(),
        }
    }

    /// Open every file that the backend can read. Unreadable files are
    /// logged and skipped. Returns the number of files opened.
    pub fn open_sources(&mut self, paths: &[impl AsRef<Path>]) -> usize {
        let mut opened = 0;
        for path in paths {
            let path = path.as_ref();
            debug!(path = %path.display(), "starting read of image file");
            match ImageSource::open(
                self.backend.clone(),
                path,
                self.config.stitch.move_into_subfolder,
                &self.config.calibration,
            ) {
                Ok(source) => {
                    self.sources.push(Arc::new(source));
                    opened += 1;
                }
                Err(err) => error!(path = %path.display(), error = %err, "failed reading image file"),
            }
        }
        opened
    }

    pub fn sources(&self) -> &[Arc<ImageSource>] {
        &self.sources
    }

    /// One candidate job per tile group of every opened source.
    pub fn jobs(&self) -> Vec<StitchingJob> {
        self.sources
            .iter()
            .flat_map(|source| {
                source
                    .unique_tile_group_names()
                    .into_iter()
                    .map(|group| StitchingJob::new(source.clone(), group))
            })
            .collect()
    }

    /// Run the jobs accepted by `select`, one after another. A failing job
    /// is logged and does not stop the remaining ones.
    pub fn run(
        &self,
        algorithm: &dyn StitchAlgorithm,
        mut select: impl FnMut(&StitchingJob) -> bool,
    ) -> Result<Vec<JobOutcome>, ProjectionError> {
        let scheduler = ProjectionScheduler::new(self.config.stitch.projection_threads)?;
        let outcomes = self
            .jobs()
            .into_iter()
            .filter(|job| select(job))
            .map(|job| JobOutcome {
                source: job.source().path().to_path_buf(),
                group: job.group().to_string(),
                result: job.run_with(&scheduler, algorithm, &self.config.stitch),
            })
            .collect();
        Ok(outcomes)
    }
}
