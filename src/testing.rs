//! In-memory decoder and stitcher used by the unit tests.

use crate::{
    backend::{BackendError, ImageBackend, ImageReader, PhysicalLength, StackDims},
    roi::{Bounds, Roi, RoiSet},
    stitch::{FusedImage, FusionParams, StitchAlgorithm, StitchError, StitchOutput, StitchRequest},
    tile_config::{self, TileConfigEntry},
};

use ndarray::{Array2, Array3, Array4, s};
use std::{
    collections::HashMap,
    fs::{self, File},
    io::{self, BufReader},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};
use tiff::decoder::{Decoder, DecodingResult};
use tracing::Level;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Run `f` with a subscriber local to the current thread and return what
/// it logged at debug level and above.
pub fn capture_logs<T>(f: impl FnOnce() -> T) -> (T, String) {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(Level::DEBUG)
        .finish();
    let value = tracing::subscriber::with_default(subscriber, f);
    let logs = String::from_utf8_lossy(&buffer.0.lock().unwrap()).into_owned();
    (value, logs)
}

/// Every page of a TIFF file as `((width, height), samples)`.
pub fn read_pages(path: &Path) -> Vec<((u32, u32), Vec<u16>)> {
    let file = File::open(path).unwrap();
    let mut decoder = Decoder::new(BufReader::new(file)).unwrap();
    let mut pages = Vec::new();
    loop {
        let dims = decoder.dimensions().unwrap();
        match decoder.read_image().unwrap() {
            DecodingResult::U16(data) => pages.push((dims, data)),
            _ => panic!("expected 16-bit pages in {}", path.display()),
        }
        if !decoder.more_images() {
            break;
        }
        decoder.next_image().unwrap();
    }
    pages
}

/// One series as the fake decoder reports it. `data` is `(c, z, y, x)`.
#[derive(Clone, Debug)]
pub struct SeriesSpec {
    pub name: String,
    pub data: Array4<u16>,
    pub position: Option<(f64, f64)>,
    pub pixel_size: Option<PhysicalLength>,
    pub colors: Vec<[u8; 3]>,
    pub dimension_order: String,
}

impl SeriesSpec {
    pub fn new(name: &str, data: Array4<u16>) -> Self {
        let channels = data.dim().0;
        Self {
            name: name.to_string(),
            data,
            position: Some((0.0, 0.0)),
            pixel_size: Some(PhysicalLength::micrometers(1.0)),
            colors: vec![[255, 255, 255]; channels],
            dimension_order: "XYCZT".to_string(),
        }
    }

    pub fn with_position(mut self, x: f64, y: f64) -> Self {
        self.position = Some((x, y));
        self
    }

    pub fn without_position(mut self) -> Self {
        self.position = None;
        self
    }

    pub fn with_pixel_size(mut self, size: Option<PhysicalLength>) -> Self {
        self.pixel_size = size;
        self
    }

    pub fn with_colors(mut self, colors: Vec<[u8; 3]>) -> Self {
        self.colors = colors;
        self
    }
}

#[derive(Default)]
struct Counters {
    opens: AtomicUsize,
    closes: AtomicUsize,
    reads_by_thread: Mutex<HashMap<String, usize>>,
}

/// How plane reads of a series misbehave.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReadFault {
    Error,
    Panic,
}

pub struct MemoryReader {
    series: Arc<Vec<SeriesSpec>>,
    series_count: usize,
    current: usize,
    faults: HashMap<usize, ReadFault>,
    counters: Arc<Counters>,
}

impl MemoryReader {
    pub fn new(series: Vec<SeriesSpec>) -> Self {
        Self {
            series_count: series.len(),
            series: Arc::new(series),
            current: 0,
            faults: HashMap::new(),
            counters: Arc::default(),
        }
    }

    fn spec(&self, series: usize) -> &SeriesSpec {
        &self.series[series]
    }
}

impl ImageReader for MemoryReader {
    fn series_count(&self) -> usize {
        self.series_count
    }

    fn set_series(&mut self, series: usize) -> Result<(), BackendError> {
        if series >= self.series.len() {
            return Err(BackendError::NoSuchSeries(series));
        }
        self.current = series;
        Ok(())
    }

    fn image_name(&self, series: usize) -> String {
        self.spec(series).name.clone()
    }

    fn dimension_order(&self) -> String {
        self.spec(self.current).dimension_order.clone()
    }

    fn physical_pixel_size_x(&self, series: usize) -> Option<PhysicalLength> {
        self.spec(series).pixel_size
    }

    fn physical_pixel_size_y(&self, series: usize) -> Option<PhysicalLength> {
        self.spec(series).pixel_size
    }

    fn plane_position(&self, series: usize) -> Result<(f64, f64), BackendError> {
        self.spec(series)
            .position
            .ok_or(BackendError::PositionUnavailable(series))
    }

    fn channel_count(&self, series: usize) -> usize {
        self.spec(series).data.dim().0
    }

    fn channel_color(&self, series: usize, channel: usize) -> [u8; 3] {
        self.spec(series)
            .colors
            .get(channel)
            .copied()
            .unwrap_or([255, 255, 255])
    }

    fn stack_dims(&self) -> StackDims {
        let (c, z, y, x) = self.spec(self.current).data.dim();
        StackDims::new(c, z, y, x)
    }

    fn read_plane(&mut self, channel: usize, z: usize) -> Result<Array2<u16>, BackendError> {
        let thread_name = thread::current().name().unwrap_or("unnamed").to_string();
        *self
            .counters
            .reads_by_thread
            .lock()
            .unwrap()
            .entry(thread_name)
            .or_default() += 1;

        match self.faults.get(&self.current) {
            Some(ReadFault::Error) => {
                return Err(BackendError::Other(format!(
                    "simulated read failure in series {}",
                    self.current
                )));
            }
            Some(ReadFault::Panic) => panic!("decoder crashed in series {}", self.current),
            None => {}
        }

        let data = &self.spec(self.current).data;
        let (channels, depth, _, _) = data.dim();
        if channel >= channels || z >= depth {
            return Err(BackendError::NoSuchPlane { channel, z });
        }
        Ok(data.slice(s![channel, z, .., ..]).to_owned())
    }

    fn close(&mut self) {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
    }
}

struct MemoryFile {
    series: Arc<Vec<SeriesSpec>>,
    series_count: Option<usize>,
}

/// Serves files by name. The file must also exist on disk so that moves
/// and missing paths behave as with a real decoder.
#[derive(Default)]
pub struct MemoryBackend {
    files: HashMap<String, MemoryFile>,
    faults: Mutex<HashMap<String, HashMap<usize, ReadFault>>>,
    counters: Arc<Counters>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, name: &str, series: Vec<SeriesSpec>) -> Self {
        self.files.insert(
            name.to_string(),
            MemoryFile {
                series: Arc::new(series),
                series_count: None,
            },
        );
        self
    }

    /// Report more series than the file holds.
    pub fn with_series_count_override(mut self, name: &str, count: usize) -> Self {
        if let Some(file) = self.files.get_mut(name) {
            file.series_count = Some(count);
        }
        self
    }

    fn inject(&self, name: &str, series: usize, fault: ReadFault) {
        self.faults
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .insert(series, fault);
    }

    /// Plane reads of `series` fail for readers opened from now on.
    pub fn fail_reads_of(&self, name: &str, series: usize) {
        self.inject(name, series, ReadFault::Error);
    }

    /// Plane reads of `series` panic for readers opened from now on.
    pub fn panic_on_reads_of(&self, name: &str, series: usize) {
        self.inject(name, series, ReadFault::Panic);
    }

    pub fn open_count(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }

    /// Plane reads so far, keyed by the name of the thread that did them.
    pub fn plane_reads_by_thread(&self) -> HashMap<String, usize> {
        self.counters.reads_by_thread.lock().unwrap().clone()
    }
}

impl ImageBackend for MemoryBackend {
    fn open(&self, path: &Path) -> Result<Box<dyn ImageReader>, BackendError> {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default();
        let file = self
            .files
            .get(name)
            .ok_or_else(|| BackendError::Format(path.display().to_string()))?;
        fs::metadata(path)?;

        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        let faults = self
            .faults
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default();
        Ok(Box::new(MemoryReader {
            series: file.series.clone(),
            series_count: file.series_count.unwrap_or(file.series.len()),
            current: 0,
            faults,
            counters: self.counters.clone(),
        }))
    }
}

/// Tile `index` of the four-tile group: 3 channels, 2 planes of 4x4 pixels,
/// every sample equal to `z * (index + 1) + c * 10`.
fn tile_data(index: usize) -> Array4<u16> {
    Array4::from_shape_fn((3, 2, 4, 4), |(c, z, _, _)| (z * (index + 1) + c * 10) as u16)
}

/// A 2x2 tile scan with stages 0.1 m apart and 0.65 µm pixels, followed by
/// a single-plane overview series. Creates the (empty) file in `dir`.
pub fn tile_scan_backend(dir: &Path, file_name: &str) -> (Arc<MemoryBackend>, PathBuf) {
    let pixel = Some(PhysicalLength::micrometers(0.65));
    let colors = vec![[255, 0, 0], [0, 255, 0], [10, 20, 30]];
    let mut series: Vec<SeriesSpec> = [(0.0, 0.0), (0.1, 0.0), (0.0, 0.1), (0.1, 0.1)]
        .into_iter()
        .enumerate()
        .map(|(index, (x, y))| {
            SeriesSpec::new("TileScan1", tile_data(index))
                .with_position(x, y)
                .with_pixel_size(pixel)
                .with_colors(colors.clone())
        })
        .collect();
    series.push(
        SeriesSpec::new("Overview", Array4::from_elem((1, 1, 4, 4), 9))
            .with_pixel_size(pixel),
    );

    let path = dir.join(file_name);
    fs::write(&path, b"").unwrap();
    (Arc::new(MemoryBackend::new().with_file(file_name, series)), path)
}

#[derive(Clone, Debug)]
pub struct StitchCall {
    pub image_directory: PathBuf,
    pub entries: Vec<TileConfigEntry>,
    pub projections_present: bool,
    pub fusion: FusionParams,
}

/// Records its requests and answers with a synthetic mosaic, one ROI per
/// tile plus one placeholder for an unmatched tile.
#[derive(Default)]
pub struct FakeStitcher {
    fail: bool,
    calls: Mutex<Vec<StitchCall>>,
}

impl FakeStitcher {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<StitchCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl StitchAlgorithm for FakeStitcher {
    fn stitch(&self, request: &StitchRequest<'_>) -> Result<StitchOutput, StitchError> {
        let entries = tile_config::read(request.tile_config)
            .map_err(|err| StitchError::Failed(err.to_string()))?;
        let projections_present = entries
            .iter()
            .all(|entry| request.image_directory.join(&entry.name).is_file());
        self.calls.lock().unwrap().push(StitchCall {
            image_directory: request.image_directory.to_path_buf(),
            entries: entries.clone(),
            projections_present,
            fusion: request.fusion.clone(),
        });

        if self.fail {
            return Err(StitchError::Failed("no overlap between tiles".to_string()));
        }

        let channels = entries
            .first()
            .map(|entry| read_pages(&request.image_directory.join(&entry.name)).len())
            .unwrap_or(1);
        let fused = Array3::from_shape_fn((channels, 8, 8), |(c, y, x)| (c * 64 + y * 8 + x) as u16);

        let mut rois: Vec<Roi> = entries
            .iter()
            .map(|entry| {
                let bounds = Bounds {
                    x: entry.x,
                    y: entry.y,
                    width: 4.0,
                    height: 4.0,
                };
                Roi::new(format!("{:.0}, {:.0} file={}", entry.x, entry.y, entry.name), bounds)
            })
            .collect();
        rois.push(Roi::new(
            format!("0, 0 file=unknown file {}", entries.len()),
            Bounds::default(),
        ));

        Ok(StitchOutput {
            fused: FusedImage::new(fused),
            rois: RoiSet::new(rois),
        })
    }

    fn save_roi_set(&self, rois: &RoiSet, path: &Path) -> Result<(), StitchError> {
        let labels: String = rois
            .rois()
            .iter()
            .map(|roi| format!("{}\n", roi.label))
            .collect();
        fs::write(path, labels)?;
        Ok(())
    }
}
