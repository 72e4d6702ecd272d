use crate::{
    backend::BackendError,
    enums::StackMode,
    image_source::{ImageSource, SourceError, Tile},
    tile_config::TileConfigEntry,
    writer::{self, WriteError},
};

use rayon::{ThreadPool, ThreadPoolBuilder, prelude::*};
use std::{fs, num::NonZeroUsize, path::Path};
use thiserror::Error;
use tracing::{debug, error, info};
use web_time::Instant;

#[derive(Debug, Error)]
pub enum TileJobError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Plane(#[from] BackendError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("Projection of tile {tile} (series {index}) failed: {source}")]
    Job {
        tile: String,
        index: usize,
        #[source]
        source: TileJobError,
    },

    #[error("Tile group `{0}` has no tiles")]
    EmptyGroup(String),

    #[error("Cannot start projection pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// Computes maximum-intensity projections of a tile group on a bounded pool.
pub struct ProjectionScheduler {
    pool: ThreadPool,
}

impl ProjectionScheduler {
    /// `threads` defaults to the available parallelism of the host.
    pub fn new(threads: Option<usize>) -> Result<Self, ProjectionError> {
        let threads = threads.filter(|&n| n > 0).unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1)
        });
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("projection-{i}"))
            .build()?;
        Ok(Self { pool })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Project every tile of `group` into `scratch_dir`.
    ///
    /// Returns the tile config entries only if every tile succeeded; the
    /// first failure is returned with the failing tile's identity. Files
    /// already written by sibling jobs stay in `scratch_dir`.
    pub fn run(
        &self,
        source: &ImageSource,
        group: &str,
        scratch_dir: &Path,
    ) -> Result<Vec<TileConfigEntry>, ProjectionError> {
        let tiles: Vec<&Tile> = source.tiles_in_group(group).collect();
        if tiles.is_empty() {
            return Err(ProjectionError::EmptyGroup(group.to_string()));
        }

        let start = Instant::now();
        debug!(group, tiles = tiles.len(), threads = self.threads(), "submitting projection jobs");
        let entries = self.pool.install(|| {
            tiles
                .par_iter()
                .map(|tile| {
                    Self::project_tile(source, tile, scratch_dir).map_err(|err| {
                        error!(tile = %tile.projection_filename, error = %err, "projection job failed");
                        ProjectionError::Job {
                            tile: tile.projection_filename.clone(),
                            index: tile.index,
                            source: err,
                        }
                    })
                })
                .collect::<Result<Vec<_>, _>>()
        })?;

        info!(
            group,
            tiles = entries.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "projections done"
        );
        Ok(entries)
    }

    fn project_tile(
        source: &ImageSource,
        tile: &Tile,
        scratch_dir: &Path,
    ) -> Result<TileConfigEntry, TileJobError> {
        debug!(tile = %tile.projection_filename, "max projection started");
        let stack = source.re_open_tile(tile.index, StackMode::Loaded)?;
        let projection = stack.max_projection()?;
        drop(stack);

        // Scratch files from an earlier aborted run are ours to replace.
        let path = scratch_dir.join(&tile.projection_filename);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        writer::write_channel_pages(&path, &projection)?;

        debug!(tile = %tile.projection_filename, "max projection written");
        let (x, y) = tile.stage_position_px;
        Ok(TileConfigEntry::new(tile.projection_filename.clone(), x, y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        calibration::Calibration,
        testing::{read_pages, tile_scan_backend},
    };
    use std::sync::Arc;

    fn open_scan(dir: &Path) -> (Arc<crate::testing::MemoryBackend>, ImageSource) {
        let (backend, path) = tile_scan_backend(dir, "scan.lif");
        let source = ImageSource::open(backend.clone(), &path, false, &Calibration::default()).unwrap();
        (backend, source)
    }

    #[test]
    fn projects_every_tile_of_the_group() {
        let dir = tempfile::tempdir().unwrap();
        let (_, source) = open_scan(dir.path());
        let scratch = dir.path().join(".max_projections");
        fs::create_dir(&scratch).unwrap();

        let scheduler = ProjectionScheduler::new(Some(3)).unwrap();
        assert_eq!(scheduler.threads(), 3);
        let mut entries = scheduler.run(&source, "TileScan1", &scratch).unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["TileScan1_mp_0.tif", "TileScan1_mp_1.tif", "TileScan1_mp_2.tif", "TileScan1_mp_3.tif"]
        );
        assert!((entries[3].x - 153846.153846).abs() < 1e-5);

        // Deepest plane of series 1 holds z * (index + 1) = 2 in channel 0.
        let pages = read_pages(&scratch.join("TileScan1_mp_1.tif"));
        assert_eq!(pages.len(), 3);
        assert!(pages[0].1.iter().all(|&v| v == 2));
        assert!(!scratch.join("Overview_mp_4.tif").exists());
    }

    #[test]
    fn replaces_stale_scratch_files() {
        let dir = tempfile::tempdir().unwrap();
        let (_, source) = open_scan(dir.path());
        let scratch = dir.path().join(".max_projections");
        fs::create_dir(&scratch).unwrap();
        fs::write(scratch.join("Overview_mp_4.tif"), b"stale").unwrap();

        let scheduler = ProjectionScheduler::new(None).unwrap();
        assert!(scheduler.threads() >= 1);
        scheduler.run(&source, "Overview", &scratch).unwrap();
        assert_eq!(read_pages(&scratch.join("Overview_mp_4.tif")).len(), 1);
    }

    #[test]
    fn one_failing_tile_fails_the_group() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, source) = open_scan(dir.path());
        backend.fail_reads_of("scan.lif", 2);
        let scratch = dir.path().join(".max_projections");
        fs::create_dir(&scratch).unwrap();

        let result = ProjectionScheduler::new(Some(2))
            .unwrap()
            .run(&source, "TileScan1", &scratch);
        match result {
            Err(ProjectionError::Job { tile, index, .. }) => {
                assert_eq!(tile, "TileScan1_mp_2.tif");
                assert_eq!(index, 2);
            }
            other => panic!("expected job failure, got {other:?}"),
        }
        assert!(!scratch.join("TileScan1_mp_2.tif").exists());
    }

    #[test]
    fn empty_group_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (_, source) = open_scan(dir.path());
        let result = ProjectionScheduler::new(Some(1))
            .unwrap()
            .run(&source, "NoSuchScan", dir.path());
        assert!(matches!(result, Err(ProjectionError::EmptyGroup(_))));
    }
}
