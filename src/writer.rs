use crate::{backend::BackendError, enums::ChannelColor};

use image::{ImageBuffer, Rgb, RgbImage};
use ndarray::{Array2, Array3, ArrayView2, Axis};
use rayon::prelude::*;
use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tiff::encoder::{TiffEncoder, colortype};
use tracing::warn;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("Refusing to overwrite existing file {0}")]
    AlreadyExists(PathBuf),

    #[error("No pages to write to {0}")]
    NoPages(PathBuf),

    #[error("Plane size {found:?} differs from {expected:?}")]
    PlaneSize {
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Cannot read plane: {0}")]
    Plane(#[from] BackendError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

fn create_new(path: &Path) -> Result<File, WriteError> {
    if path.exists() {
        return Err(WriteError::AlreadyExists(path.to_path_buf()));
    }
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|err| match err.kind() {
            io::ErrorKind::AlreadyExists => WriteError::AlreadyExists(path.to_path_buf()),
            _ => WriteError::Io(err),
        })
}

/// Write 16-bit greyscale planes as consecutive pages of a new TIFF file.
///
/// The target must not exist. A file left half-written by a failing page,
/// or without any page at all, is removed again.
pub fn write_tiff_pages<I>(path: &Path, pages: I) -> Result<usize, WriteError>
where
    I: IntoIterator<Item = Result<Array2<u16>, BackendError>>,
{
    let file = create_new(path)?;
    let result = match encode_pages(file, pages) {
        Ok(0) => Err(WriteError::NoPages(path.to_path_buf())),
        other => other,
    };
    if result.is_err() {
        if let Err(err) = fs::remove_file(path) {
            warn!(path = %path.display(), error = %err, "could not remove partial file");
        }
    }
    result
}

fn encode_pages<I>(file: File, pages: I) -> Result<usize, WriteError>
where
    I: IntoIterator<Item = Result<Array2<u16>, BackendError>>,
{
    let mut out = BufWriter::new(file);
    let mut written = 0;
    let mut expected = None;
    {
        let mut encoder = TiffEncoder::new(&mut out)?;
        for page in pages {
            let page = page?;
            let dim = page.dim();
            if *expected.get_or_insert(dim) != dim {
                return Err(WriteError::PlaneSize {
                    expected: expected.unwrap_or(dim),
                    found: dim,
                });
            }
            let (height, width) = dim;
            let data: Vec<u16> = page.iter().copied().collect();
            encoder.write_image::<colortype::Gray16>(width as u32, height as u32, &data)?;
            written += 1;
        }
    }
    out.flush()?;
    Ok(written)
}

/// One page per channel of a `(channel, y, x)` image.
pub fn write_channel_pages(path: &Path, image: &Array3<u16>) -> Result<usize, WriteError> {
    write_tiff_pages(
        path,
        image.axis_iter(Axis(0)).map(|plane| Ok(plane.to_owned())),
    )
}

/// `value` stretched from `min..=max` to `0.0..=1.0`.
#[inline]
fn normalized_level(value: u16, min: u16, max: u16) -> f32 {
    if max <= min {
        return if value > 0 { 1.0 } else { 0.0 };
    }
    (value.saturating_sub(min) as f32 / (max - min) as f32).clamp(0.0, 1.0)
}

fn min_max(plane: &ArrayView2<'_, u16>) -> (u16, u16) {
    plane
        .iter()
        .fold((u16::MAX, u16::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)))
}

/// Flatten a `(channel, y, x)` image to RGB, tinting every channel with its
/// palette colour. Each channel is stretched to its own min/max; channels
/// without a palette colour are left out.
pub fn composite_rgb(image: &Array3<u16>, colors: &[Option<ChannelColor>]) -> Option<RgbImage> {
    let (_, height, width) = image.dim();
    let layers: Vec<(ArrayView2<'_, u16>, (u16, u16), [u8; 3])> = image
        .axis_iter(Axis(0))
        .zip(colors)
        .filter_map(|(plane, color)| {
            let rgb = color.as_ref()?.rgb();
            let range = min_max(&plane);
            Some((plane, range, rgb))
        })
        .collect();

    let pixel_data: Vec<u8> = (0..height * width)
        .into_par_iter()
        .flat_map_iter(|i| {
            let (y, x) = (i / width, i % width);
            let mut acc = [0.0f32; 3];
            for (plane, (min, max), rgb) in &layers {
                let level = normalized_level(plane[[y, x]], *min, *max);
                for (sum, &component) in acc.iter_mut().zip(rgb) {
                    *sum += level * component as f32;
                }
            }
            acc.map(|v| v.clamp(0.0, 255.0) as u8)
        })
        .collect();

    ImageBuffer::<Rgb<u8>, _>::from_raw(width as u32, height as u32, pixel_data)
}

pub fn write_png_composite(
    path: &Path,
    image: &Array3<u16>,
    colors: &[Option<ChannelColor>],
) -> Result<(), WriteError> {
    let (_, height, width) = image.dim();
    let rgb = composite_rgb(image, colors).ok_or(WriteError::PlaneSize {
        expected: (height, width),
        found: (0, 0),
    })?;
    rgb.save_with_format(path, image::ImageFormat::Png)?;
    Ok(())
}
