//! Locating the files that belong together around a stitched mosaic.
//!
//! A stitching run leaves `<base>_<group>_stitch.tif` and
//! `<base>_<group>_ROIset.zip` next to `<base>.<ext>`. Given either end,
//! the other files can usually be found by name alone.

use crate::{config::ExtractionOptions, image_source::remove_extension};

use regex::Regex;
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CompanionError {
    #[error("Not a file path: {0}")]
    InvalidPath(PathBuf),

    #[error("Cannot list {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Files found for an extraction session. Anything not found stays `None`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Companions {
    pub source: Option<PathBuf>,
    pub stitched: Option<PathBuf>,
    pub roi_set: Option<PathBuf>,
    pub output_dir: PathBuf,
}

/// Start from a stitched image.
///
/// The source file is found by cutting the file name at each `_` in turn
/// and probing `<prefix>.<source_extension>`; the shortest existing prefix
/// wins. The ROI set is the stitched name with `_stitch.tif` replaced by
/// `_ROIset.zip`, if that file exists.
pub fn from_stitched(stitched: &Path, options: &ExtractionOptions) -> Result<Companions, CompanionError> {
    let name = stitched
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| CompanionError::InvalidPath(stitched.to_path_buf()))?;
    let dir = stitched.parent().unwrap_or(Path::new(""));

    let source = name
        .match_indices('_')
        .filter(|&(at, _)| at > 0)
        .map(|(at, _)| dir.join(format!("{}.{}", &name[..at], options.source_extension)))
        .find(|candidate| candidate.is_file());

    let roi_set = Some(name.replace("_stitch.tif", "_ROIset.zip"))
        .filter(|roi_name| roi_name != name)
        .map(|roi_name| dir.join(roi_name))
        .filter(|path| path.is_file());

    debug!(stitched = %stitched.display(), ?source, ?roi_set, "resolved companions of stitched image");
    Ok(Companions {
        source,
        stitched: Some(stitched.to_path_buf()),
        roi_set,
        output_dir: dir.join(&options.output_dir_name),
    })
}

/// Start from the original multi-series file. A stitched image or ROI set
/// is only filled in when exactly one candidate exists in the directory.
pub fn from_source(source: &Path, options: &ExtractionOptions) -> Result<Companions, CompanionError> {
    let name = source
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| CompanionError::InvalidPath(source.to_path_buf()))?;
    let dir = source.parent().unwrap_or(Path::new(""));
    let base = regex::escape(remove_extension(name));

    let listing = if dir.as_os_str().is_empty() { Path::new(".") } else { dir };
    let names: Vec<String> = fs::read_dir(listing)
        .map_err(|source| CompanionError::Io {
            path: listing.to_path_buf(),
            source,
        })?
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_file())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();

    let unique = |suffix: &str| -> Option<PathBuf> {
        let pattern = Regex::new(&format!("^{base}_.*_{suffix}$")).ok()?;
        let mut matches = names.iter().filter(|name| pattern.is_match(name));
        match (matches.next(), matches.next()) {
            (Some(only), None) => Some(dir.join(only)),
            _ => None,
        }
    };

    Ok(Companions {
        source: Some(source.to_path_buf()),
        stitched: unique(r"stitch\.tif"),
        roi_set: unique(r"ROIset\.zip"),
        output_dir: dir.join(&options.output_dir_name),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"").unwrap();
        path
    }

    #[test]
    fn stitched_image_finds_source_and_roi_set() {
        let dir = tempfile::tempdir().unwrap();
        let source = touch(dir.path(), "exp_1.lif");
        let stitched = touch(dir.path(), "exp_1_TileScan_2_stitch.tif");
        let rois = touch(dir.path(), "exp_1_TileScan_2_ROIset.zip");
        touch(dir.path(), "exp.txt");

        let found = from_stitched(&stitched, &ExtractionOptions::default()).unwrap();
        assert_eq!(found.source, Some(source));
        assert_eq!(found.roi_set, Some(rois));
        assert_eq!(found.output_dir, dir.path().join("zstacks"));
    }

    #[test]
    fn stitched_image_without_companions() {
        let dir = tempfile::tempdir().unwrap();
        let stitched = touch(dir.path(), "scan_A_stitch.tif");
        let options = ExtractionOptions {
            source_extension: "czi".to_string(),
            output_dir_name: "stacks".to_string(),
            ..ExtractionOptions::default()
        };
        touch(dir.path(), "scan.lif");

        let found = from_stitched(&stitched, &options).unwrap();
        assert_eq!(found.source, None);
        assert_eq!(found.roi_set, None);
        assert_eq!(found.stitched, Some(stitched));
        assert_eq!(found.output_dir, dir.path().join("stacks"));
    }

    #[test]
    fn source_fills_only_unique_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let source = touch(dir.path(), "scan.lif");
        let stitched = touch(dir.path(), "scan_TileScan1_stitch.tif");
        touch(dir.path(), "scan_TileScan1_ROIset.zip");
        touch(dir.path(), "scan_TileScan2_ROIset.zip");
        touch(dir.path(), "other_TileScan1_stitch.tif");

        let found = from_source(&source, &ExtractionOptions::default()).unwrap();
        assert_eq!(found.stitched, Some(stitched));
        assert_eq!(found.roi_set, None);
        assert_eq!(found.output_dir, dir.path().join("zstacks"));
    }

    #[test]
    fn base_name_is_matched_literally() {
        let dir = tempfile::tempdir().unwrap();
        let source = touch(dir.path(), "a.b.lif");
        touch(dir.path(), "aXb_T_stitch.tif");
        let rois = touch(dir.path(), "a.b_T_ROIset.zip");

        let found = from_source(&source, &ExtractionOptions::default()).unwrap();
        assert_eq!(found.stitched, None);
        assert_eq!(found.roi_set, Some(rois));
    }
}
