use crate::backend::{BackendError, ReaderGuard, StackDims};

use ndarray::{Array2, Array3, Array4, Axis, Zip, s};
use std::sync::Mutex;

enum Planes {
    Loaded(Array4<u16>),
    Virtual(Mutex<ReaderGuard>),
}

/// Pixel data of one re-opened tile, laid out as `(channel, z, y, x)`.
pub struct TileStack {
    series: usize,
    dims: StackDims,
    planes: Planes,
}

impl TileStack {
    pub fn from_array(series: usize, data: Array4<u16>) -> Self {
        let (channels, depth, height, width) = data.dim();
        Self {
            series,
            dims: StackDims::new(channels, depth, height, width),
            planes: Planes::Loaded(data),
        }
    }

    /// Decode every plane of the reader's current series into memory.
    pub(crate) fn load(series: usize, mut reader: ReaderGuard) -> Result<Self, BackendError> {
        let dims = reader.stack_dims();
        let mut data = Array4::<u16>::zeros(dims.as_tuple());

        for c in 0..dims.channels {
            for z in 0..dims.depth {
                let plane = reader.read_plane(c, z)?;
                if plane.dim() != (dims.height, dims.width) {
                    return Err(BackendError::Format(format!(
                        "plane (c={c}, z={z}) of series {series} is {:?}, expected {:?}",
                        plane.dim(),
                        (dims.height, dims.width)
                    )));
                }
                data.slice_mut(s![c, z, .., ..]).assign(&plane);
            }
        }

        Ok(Self {
            series,
            dims,
            planes: Planes::Loaded(data),
        })
    }

    pub(crate) fn lazy(series: usize, reader: ReaderGuard) -> Self {
        let dims = reader.stack_dims();
        Self {
            series,
            dims,
            planes: Planes::Virtual(Mutex::new(reader)),
        }
    }

    pub fn series(&self) -> usize {
        self.series
    }

    /// Get the dimensions of the stack (channels, depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize, usize) {
        self.dims.as_tuple()
    }

    pub fn channel_count(&self) -> usize {
        self.dims.channels
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self.planes, Planes::Virtual(_))
    }

    /// In-memory data, `None` for a virtual stack.
    pub fn data(&self) -> Option<&Array4<u16>> {
        match &self.planes {
            Planes::Loaded(data) => Some(data),
            Planes::Virtual(_) => None,
        }
    }

    pub fn plane(&self, channel: usize, z: usize) -> Result<Array2<u16>, BackendError> {
        if channel >= self.dims.channels || z >= self.dims.depth {
            return Err(BackendError::NoSuchPlane { channel, z });
        }
        match &self.planes {
            Planes::Loaded(data) => Ok(data.slice(s![channel, z, .., ..]).to_owned()),
            Planes::Virtual(reader) => reader
                .lock()
                .map_err(|_| BackendError::Other("reader lock poisoned".to_string()))?
                .read_plane(channel, z),
        }
    }

    /// All Z planes of one channel, decoded lazily in order.
    pub fn channel_planes(
        &self,
        channel: usize,
    ) -> impl Iterator<Item = Result<Array2<u16>, BackendError>> + '_ {
        (0..self.dims.depth).map(move |z| self.plane(channel, z))
    }

    /// Maximum-intensity projection along Z, giving `(channel, y, x)`.
    pub fn max_projection(&self) -> Result<Array3<u16>, BackendError> {
        let StackDims {
            channels,
            height,
            width,
            ..
        } = self.dims;
        let mut projection = Array3::<u16>::zeros((channels, height, width));

        match &self.planes {
            Planes::Loaded(data) => {
                Zip::from(&mut projection)
                    .and(data.lanes(Axis(1)))
                    .par_for_each(|out, lane| *out = lane.fold(0, |acc, &v| acc.max(v)));
            }
            Planes::Virtual(_) => {
                for c in 0..channels {
                    let mut target = projection.slice_mut(s![c, .., ..]);
                    for plane in self.channel_planes(c) {
                        let plane = plane?;
                        Zip::from(&mut target)
                            .and(&plane)
                            .par_for_each(|out, &v| *out = (*out).max(v));
                    }
                }
            }
        }

        Ok(projection)
    }
}
