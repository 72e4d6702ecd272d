use crate::{
    backend::{BackendError, ImageBackend, ImageReader, ReaderGuard},
    calibration::Calibration,
    enums::{ChannelColor, StackMode},
    tile_stack::TileStack,
};

use regex::Regex;
use std::{
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, LazyLock},
};
use thiserror::Error;
use tracing::{debug, info, warn};

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("static pattern compiles"));

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Cannot create subdirectory {0}: a file with the same name exists")]
    SubfolderConflict(PathBuf),

    #[error("Not a file path: {0}")]
    InvalidPath(PathBuf),

    #[error("Series {0} does not exist in this file")]
    SeriesOutOfRange(usize),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

/// One acquisition series of a tile scan.
#[derive(Clone, Debug, PartialEq)]
pub struct Tile {
    pub name: String,
    pub index: usize,
    pub stage_position_px: (f64, f64),
    /// Palette colour per acquired channel; `None` when the colour is not in the palette.
    pub channels: Vec<Option<ChannelColor>>,
    pub projection_filename: String,
}

impl Tile {
    pub fn new(
        raw_name: &str,
        index: usize,
        stage_position_px: (f64, f64),
        channels: Vec<Option<ChannelColor>>,
    ) -> Self {
        let name = sanitize_name(raw_name);
        let projection_filename = projection_filename(&name, index);
        Self {
            name,
            index,
            stage_position_px,
            channels,
            projection_filename,
        }
    }
}

/// Replace path separators and whitespace runs so the name is usable as a filename fragment.
pub fn sanitize_name(raw: &str) -> String {
    let name = raw.replace(['/', '\\'], "-");
    WHITESPACE.replace_all(&name, "_").into_owned()
}

pub fn projection_filename(name: &str, index: usize) -> String {
    format!("{name}_mp_{index}.tif")
}

/// File name without its last extension; a leading dot does not count.
pub(crate) fn remove_extension(name: &str) -> &str {
    match name.rfind('.') {
        Some(last) if last >= 1 => &name[..last],
        _ => name,
    }
}

/// A multi-series image file and the tiles it contains.
pub struct ImageSource {
    path: PathBuf,
    base_name: String,
    tiles: Vec<Tile>,
    backend: Arc<dyn ImageBackend>,
}

impl std::fmt::Debug for ImageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageSource")
            .field("path", &self.path)
            .field("tiles", &self.tiles.len())
            .finish()
    }
}

impl ImageSource {
    /// Open an image file and read the metadata of every series.
    ///
    /// # Arguments
    ///
    /// * `backend` - Decoder used for this and every later re-open
    /// * `path` - Path of the multi-series file
    /// * `move_into_subfolder` - Relocate the file (and its sidecar) into
    ///   `<dir>/<basename>/` before opening
    /// * `calibration` - Stage to pixel conversion
    ///
    /// # Errors
    ///
    /// Returns error if relocation fails or the backend cannot open the file.
    /// A series without a stage position does not fail the open.
    pub fn open(
        backend: Arc<dyn ImageBackend>,
        path: impl AsRef<Path>,
        move_into_subfolder: bool,
        calibration: &Calibration,
    ) -> Result<Self, SourceError> {
        let path = if move_into_subfolder {
            Self::move_into_subfolder(path.as_ref())?
        } else {
            path.as_ref().to_path_buf()
        };
        let base_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| remove_extension(name).to_string())
            .ok_or_else(|| SourceError::InvalidPath(path.clone()))?;

        debug!(path = %path.display(), "reading image file metadata");
        let mut reader = ReaderGuard::new(backend.open(&path)?);
        let series_count = reader.series_count();
        let tiles = (0..series_count)
            .map(|index| Self::read_tile(&mut reader, index, calibration))
            .collect::<Result<Vec<_>, _>>()?;
        drop(reader);

        info!(
            path = %path.display(),
            series = tiles.len(),
            "opened image file"
        );

        Ok(Self {
            path,
            base_name,
            tiles,
            backend,
        })
    }

    fn read_tile(
        reader: &mut ReaderGuard,
        index: usize,
        calibration: &Calibration,
    ) -> Result<Tile, SourceError> {
        reader.set_series(index)?;

        let raw_position = match reader.plane_position(index) {
            Ok(position) => position,
            Err(err) => {
                warn!(series = index, error = %err, "stage position unavailable, using origin");
                (0.0, 0.0)
            }
        };
        let position = calibration.calibrate_xy(
            raw_position,
            reader.physical_pixel_size_x(index),
            reader.physical_pixel_size_y(index),
            &reader.dimension_order(),
        );

        let channels = Self::read_channels(&**reader, index);
        Ok(Tile::new(&reader.image_name(index), index, position, channels))
    }

    fn read_channels(reader: &dyn ImageReader, index: usize) -> Vec<Option<ChannelColor>> {
        (0..reader.channel_count(index))
            .map(|c| {
                let rgb = reader.channel_color(index, c);
                let color = ChannelColor::from_rgb(rgb);
                match color {
                    Some(color) => debug!(series = index, channel = c, color = color.name(), "channel colour"),
                    None => warn!(series = index, channel = c, ?rgb, "channel colour not in palette"),
                }
                color
            })
            .collect()
    }

    /// Move `path` into `<dir>/<basename>/`, together with a `<path>ext`
    /// sidecar if one exists. Safe to repeat once the move has happened.
    fn move_into_subfolder(path: &Path) -> Result<PathBuf, SourceError> {
        let file_name = path
            .file_name()
            .ok_or_else(|| SourceError::InvalidPath(path.to_path_buf()))?;
        let stem = remove_extension(&file_name.to_string_lossy()).to_string();
        let working_dir = path.parent().unwrap_or(Path::new("")).join(stem);

        if working_dir.is_file() {
            return Err(SourceError::SubfolderConflict(working_dir));
        }
        fs::create_dir_all(&working_dir)?;

        let target = working_dir.join(file_name);
        let moved = relocate(path, &target, true)?;

        if let Err(err) = relocate(&sidecar_path(path), &sidecar_path(&target), false) {
            if moved {
                if let Err(undo) = fs::rename(&target, path) {
                    warn!(path = %target.display(), error = %undo, "could not undo file move");
                }
            }
            return Err(err.into());
        }

        debug!(from = %path.display(), to = %target.display(), "moved image file into subfolder");
        Ok(target)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory that holds the (possibly relocated) file.
    pub fn directory(&self) -> &Path {
        self.path.parent().unwrap_or(Path::new(""))
    }

    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    pub fn tile(&self, series_index: usize) -> Option<&Tile> {
        self.tiles.get(series_index)
    }

    /// Distinct tile-group names, in the order they first appear.
    pub fn unique_tile_group_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for tile in &self.tiles {
            if !names.contains(&tile.name.as_str()) {
                names.push(&tile.name);
            }
        }
        names
    }

    pub fn tiles_in_group<'a>(&'a self, group: &'a str) -> impl Iterator<Item = &'a Tile> {
        self.tiles.iter().filter(move |tile| tile.name == group)
    }

    /// Channels of the first tile of a group. Tiles of one group are
    /// assumed to share their channel layout.
    pub fn channels_for_group(&self, group: &str) -> Option<&[Option<ChannelColor>]> {
        self.tiles
            .iter()
            .find(|tile| tile.name == group)
            .map(|tile| tile.channels.as_slice())
    }

    /// Decode a single series with a reader of its own.
    pub fn re_open_tile(&self, series_index: usize, mode: StackMode) -> Result<TileStack, SourceError> {
        let tile = self
            .tile(series_index)
            .ok_or(SourceError::SeriesOutOfRange(series_index))?;
        let mut reader = ReaderGuard::new(self.backend.open(&self.path)?);
        reader.set_series(tile.index)?;

        let stack = match mode {
            StackMode::Loaded => TileStack::load(tile.index, reader)?,
            StackMode::Virtual => TileStack::lazy(tile.index, reader),
        };
        Ok(stack)
    }
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut sidecar = OsString::from(path.as_os_str());
    sidecar.push("ext");
    PathBuf::from(sidecar)
}

/// Rename `from` to `to`. Returns whether a rename happened; a destination
/// that already holds the file counts as moved.
fn relocate(from: &Path, to: &Path, required: bool) -> io::Result<bool> {
    if to.exists() {
        if from.exists() {
            warn!(
                from = %from.display(),
                to = %to.display(),
                "destination already exists, leaving source in place"
            );
        }
        return Ok(false);
    }
    if !from.exists() {
        return if required {
            Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} does not exist", from.display()),
            ))
        } else {
            Ok(false)
        };
    }
    fs::rename(from, to)?;
    Ok(true)
}
