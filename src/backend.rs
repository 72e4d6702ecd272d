//! Decoder capability consumed by the crate.
//!
//! The actual multi-series file decoder lives outside this crate. An
//! implementation opens a file, reports per-series metadata (name, stage
//! position, pixel calibration, channel colours) and decodes individual
//! `(channel, z)` planes on request.

use crate::enums::LengthUnit;

use ndarray::Array2;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Unrecognized or corrupt file: {0}")]
    Format(String),

    #[error("No stage position recorded for series {0}")]
    PositionUnavailable(usize),

    #[error("Series {0} does not exist")]
    NoSuchSeries(usize),

    #[error("Plane (c={channel}, z={z}) out of range")]
    NoSuchPlane { channel: usize, z: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// A length together with the unit it was reported in.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PhysicalLength {
    pub value: f64,
    pub unit: LengthUnit,
}

impl PhysicalLength {
    pub fn new(value: f64, unit: LengthUnit) -> Self {
        Self { value, unit }
    }

    pub fn micrometers(value: f64) -> Self {
        Self::new(value, LengthUnit::Micrometer)
    }
}

/// Extent of one series as `(channels, depth, height, width)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StackDims {
    pub channels: usize,
    pub depth: usize,
    pub height: usize,
    pub width: usize,
}

impl StackDims {
    pub fn new(channels: usize, depth: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            depth,
            height,
            width,
        }
    }

    pub fn as_tuple(&self) -> (usize, usize, usize, usize) {
        (self.channels, self.depth, self.height, self.width)
    }
}

pub trait ImageBackend: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn ImageReader>, BackendError>;
}

/// An open file handle. Series-indexed metadata accessors take the series
/// explicitly; pixel access applies to the series chosen by `set_series`.
pub trait ImageReader: Send {
    fn series_count(&self) -> usize;

    fn set_series(&mut self, series: usize) -> Result<(), BackendError>;

    fn image_name(&self, series: usize) -> String;

    /// Dimension order of the current series, e.g. `"XYCZT"`.
    fn dimension_order(&self) -> String;

    fn physical_pixel_size_x(&self, series: usize) -> Option<PhysicalLength>;

    fn physical_pixel_size_y(&self, series: usize) -> Option<PhysicalLength>;

    /// Raw stage position of the first plane, in the stage's base unit.
    fn plane_position(&self, series: usize) -> Result<(f64, f64), BackendError>;

    fn channel_count(&self, series: usize) -> usize;

    fn channel_color(&self, series: usize, channel: usize) -> [u8; 3];

    fn stack_dims(&self) -> StackDims;

    fn read_plane(&mut self, channel: usize, z: usize) -> Result<Array2<u16>, BackendError>;

    fn close(&mut self) {}
}

/// Owns a reader and closes it when dropped, on success and error paths alike.
pub(crate) struct ReaderGuard(Box<dyn ImageReader>);

impl ReaderGuard {
    pub(crate) fn new(reader: Box<dyn ImageReader>) -> Self {
        Self(reader)
    }
}

impl std::ops::Deref for ReaderGuard {
    type Target = dyn ImageReader;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl std::ops::DerefMut for ReaderGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.as_mut()
    }
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.0.close();
    }
}
