//! Tile position file read by the external stitching algorithm.
//!
//! ```text
//! dim = 2
//! TileScan1_mp_0.tif;;(0.000000, 0.000000)
//! TileScan1_mp_1.tif;;(153846.153846, 0.000000)
//! ```
//!
//! Coordinates are written with six decimals and a `.` separator, which is
//! what Rust's float formatting produces regardless of the host locale.

use std::{
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

const HEADER: &str = "dim = 2";

#[derive(Debug, Error)]
pub enum TileConfigError {
    #[error("Tile config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Missing `dim = 2` header")]
    MissingHeader,

    #[error("Unsupported dimensionality `{0}`")]
    UnsupportedDimension(String),

    #[error("Malformed entry on line {line}: {content}")]
    Malformed { line: usize, content: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct TileConfigEntry {
    pub name: String,
    pub x: f64,
    pub y: f64,
}

impl TileConfigEntry {
    pub fn new(name: impl Into<String>, x: f64, y: f64) -> Self {
        Self {
            name: name.into(),
            x,
            y,
        }
    }
}

pub fn render(entries: &[TileConfigEntry]) -> String {
    let mut text = String::with_capacity(32 * (entries.len() + 1));
    text.push_str(HEADER);
    text.push('\n');
    for entry in entries {
        // Writing into a String cannot fail.
        let _ = writeln!(text, "{};;({:.6}, {:.6})", entry.name, entry.x, entry.y);
    }
    text
}

pub fn write(path: impl AsRef<Path>, entries: &[TileConfigEntry]) -> Result<(), TileConfigError> {
    let path = path.as_ref();
    fs::write(path, render(entries)).map_err(|source| TileConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

pub fn parse(text: &str) -> Result<Vec<TileConfigEntry>, TileConfigError> {
    let mut lines = text
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'));

    let (_, header) = lines.next().ok_or(TileConfigError::MissingHeader)?;
    let dim = header
        .strip_prefix("dim")
        .and_then(|rest| rest.trim_start().strip_prefix('='))
        .map(str::trim)
        .ok_or(TileConfigError::MissingHeader)?;
    if dim != "2" {
        return Err(TileConfigError::UnsupportedDimension(dim.to_string()));
    }

    lines
        .map(|(line, content)| {
            parse_entry(content).ok_or_else(|| TileConfigError::Malformed {
                line,
                content: content.to_string(),
            })
        })
        .collect()
}

pub fn read(path: impl AsRef<Path>) -> Result<Vec<TileConfigEntry>, TileConfigError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|source| TileConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&text)
}

fn parse_entry(line: &str) -> Option<TileConfigEntry> {
    let mut fields = line.splitn(3, ';');
    let name = fields.next()?.trim();
    // The middle field (z-stack index) is unused for 2-D layouts.
    let _ = fields.next()?;
    let coordinates = fields.next()?.trim();
    let (x, y) = coordinates
        .strip_prefix('(')?
        .strip_suffix(')')?
        .split_once(',')?;
    if name.is_empty() {
        return None;
    }
    Some(TileConfigEntry::new(
        name,
        x.trim().parse().ok()?,
        y.trim().parse().ok()?,
    ))
}
