//! Regions of interest returned by the stitcher and the clean-up applied
//! before they are saved.

use regex::Regex;
use std::{collections::BTreeSet, sync::LazyLock};
use tracing::debug;

/// Label the stitcher gives a tile it could not match to a projection file.
static UNKNOWN_TILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^.*file=unknown file \d+$").expect("static pattern compiles"));

/// Series index embedded in a projection filename, `<name>_mp_<index>.tif`.
static SERIES_INDEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_mp_(\d+)\.tif").expect("static pattern compiles"));

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Bounds {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Roi {
    pub label: String,
    pub bounds: Bounds,
}

impl Roi {
    pub fn new(label: impl Into<String>, bounds: Bounds) -> Self {
        Self {
            label: label.into(),
            bounds,
        }
    }

    pub fn is_unknown_tile(&self) -> bool {
        UNKNOWN_TILE.is_match(&self.label)
    }

    /// Series index of the tile this ROI outlines, if the label names a projection.
    pub fn series_index(&self) -> Option<usize> {
        series_index_from_label(&self.label)
    }
}

pub fn series_index_from_label(label: &str) -> Option<usize> {
    SERIES_INDEX
        .captures(label)
        .and_then(|caps| caps.get(1))
        .and_then(|index| index.as_str().parse().ok())
}

/// Ordered ROI collection with a selection, as kept by an ROI manager.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RoiSet {
    rois: Vec<Roi>,
    selected: BTreeSet<usize>,
}

impl RoiSet {
    pub fn new(rois: Vec<Roi>) -> Self {
        Self {
            rois,
            selected: BTreeSet::new(),
        }
    }

    pub fn rois(&self) -> &[Roi] {
        &self.rois
    }

    pub fn len(&self) -> usize {
        self.rois.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rois.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Roi> {
        self.rois.get(index)
    }

    /// Replace the selection; out of range indexes are ignored.
    pub fn select(&mut self, indexes: impl IntoIterator<Item = usize>) {
        let len = self.rois.len();
        self.selected = indexes.into_iter().filter(|&i| i < len).collect();
    }

    pub fn select_all(&mut self) {
        self.selected = (0..self.rois.len()).collect();
    }

    pub fn clear_selection(&mut self) {
        self.selected.clear();
    }

    pub fn selected_indexes(&self) -> Vec<usize> {
        self.selected.iter().copied().collect()
    }

    /// Delete every selected ROI in one pass. Returns how many were removed.
    pub fn delete_selected(&mut self) -> usize {
        let selected = std::mem::take(&mut self.selected);
        let before = self.rois.len();
        let mut index = 0;
        self.rois.retain(|_| {
            let keep = !selected.contains(&index);
            index += 1;
            keep
        });
        before - self.rois.len()
    }
}

/// Drop placeholder ROIs for tiles the stitcher could not resolve.
///
/// Matching ROIs are selected and deleted as one batch, then the selection
/// is cleared. A set without placeholders is left untouched.
pub fn remove_unknown_tiles(rois: &mut RoiSet) -> usize {
    let unknown: Vec<usize> = rois
        .rois()
        .iter()
        .enumerate()
        .filter(|(_, roi)| roi.is_unknown_tile())
        .map(|(index, _)| index)
        .collect();
    if unknown.is_empty() {
        return 0;
    }

    rois.select(unknown);
    let removed = rois.delete_selected();
    rois.clear_selection();
    debug!(removed, remaining = rois.len(), "removed ROIs without a source tile");
    removed
}
