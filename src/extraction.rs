//! Extraction of full-resolution z-stacks for ROIs picked on a stitched mosaic.
//!
//! Selecting exactly one tile ROI queues an [`ExtractionTask`]. Tasks are
//! coordinated on a small async runtime while the heavy work runs in a
//! two-stage pipeline with one worker per stage:
//!
//! ```text
//!                          ┌─▶ read queue ──▶ [read worker] ──┐
//! on_selection ─▶ coordinator ◀──────────── planes ◀──────────┘
//!                          ├─▶ write queue ─▶ [write worker] ─┐
//!                          ◀──────────── report ◀─────────────┘
//! ```
//!
//! The read worker re-opens the tile and decodes every plane; the write
//! worker only encodes. Only one tile is being decoded and one written at
//! any time, while the read of the next ROI overlaps the write of the
//! previous one. A job that panics fails its own task and leaves the
//! worker running.

use crate::{
    backend::BackendError,
    config::ExtractionOptions,
    enums::StackMode,
    image_source::{ImageSource, SourceError},
    roi::{self, RoiSet},
    writer::{self, WriteError},
};

use futures::channel::oneshot;
use ndarray::Array2;
use std::{
    collections::HashMap,
    ffi::OsString,
    fs, io,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    thread,
};
use thiserror::Error;
use tokio::{
    runtime::{Builder, Runtime},
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use web_time::Instant;

pub type TaskId = u64;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Unable to create directory {path}: {source}")]
    DirectoryCreate {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot read tile: {0}")]
    Read(#[source] SourceError),

    #[error("{0} already exists, not overwriting")]
    ChannelWriteConflict(PathBuf),

    #[error("Error saving to {path}: {source}")]
    ChannelWrite {
        path: PathBuf,
        #[source]
        source: WriteError,
    },

    #[error("Interrupted while waiting for the {0} stage")]
    InterruptedWait(&'static str),

    #[error("Cannot start extraction workers: {0}")]
    Startup(#[source] io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtractionState {
    Queued,
    Reading,
    Writing,
    Done,
    Failed,
}

impl ExtractionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExtractionState::Done | ExtractionState::Failed)
    }

    pub fn can_advance_to(self, next: ExtractionState) -> bool {
        use ExtractionState::*;
        match (self, next) {
            (Queued, Reading) | (Reading, Writing) | (Writing, Done) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// An ROI as delivered by the selection: its label and 1-based position in its set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectedRoi {
    pub label: String,
    pub ordinal: usize,
}

impl SelectedRoi {
    pub fn new(label: impl Into<String>, ordinal: usize) -> Self {
        Self {
            label: label.into(),
            ordinal,
        }
    }

    pub fn from_set(rois: &RoiSet, index: usize) -> Option<Self> {
        rois.get(index)
            .map(|roi| Self::new(roi.label.clone(), index + 1))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtractionTask {
    pub id: TaskId,
    pub series_index: usize,
    pub roi_ordinal: usize,
    /// `<output_dir>/<base>_zstack_<ordinal>/<base>_zstack_<ordinal>`
    pub output_base_path: PathBuf,
}

impl ExtractionTask {
    pub fn output_dir(&self) -> &Path {
        self.output_base_path.parent().unwrap_or(Path::new(""))
    }

    pub fn channel_path(&self, channel: usize) -> PathBuf {
        let mut path = OsString::from(self.output_base_path.as_os_str());
        path.push(format!("_channel_{channel}.tif"));
        PathBuf::from(path)
    }
}

#[derive(Debug)]
pub struct ChannelFailure {
    pub channel: usize,
    pub error: ExtractionError,
}

#[derive(Debug, Default)]
pub struct ExtractionReport {
    pub written: Vec<PathBuf>,
    pub failures: Vec<ChannelFailure>,
}

#[derive(Debug)]
pub struct ExtractionOutcome {
    pub task: ExtractionTask,
    pub result: Result<ExtractionReport, ExtractionError>,
}

/// Z planes of every channel of one tile, in channel order. A channel that
/// could not be decoded keeps its error.
type ChannelPlanes = Vec<Result<Vec<Array2<u16>>, BackendError>>;

struct ReadJob {
    task: ExtractionTask,
    reply: oneshot::Sender<Result<ChannelPlanes, SourceError>>,
}

struct WriteJob {
    task: ExtractionTask,
    channels: ChannelPlanes,
    reply: oneshot::Sender<ExtractionReport>,
}

#[derive(Clone)]
struct StageQueues {
    read: mpsc::UnboundedSender<ReadJob>,
    write: mpsc::UnboundedSender<WriteJob>,
}

#[derive(Default)]
struct TaskStates(Mutex<HashMap<TaskId, ExtractionState>>);

impl TaskStates {
    fn insert(&self, id: TaskId) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, ExtractionState::Queued);
    }

    fn get(&self, id: TaskId) -> Option<ExtractionState> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .copied()
    }

    fn advance(&self, id: TaskId, next: ExtractionState) -> bool {
        let mut states = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        match states.get_mut(&id) {
            Some(state) if state.can_advance_to(next) => {
                *state = next;
                true
            }
            current => {
                warn!(task = id, ?current, ?next, "rejected extraction state change");
                false
            }
        }
    }
}

pub struct ExtractionPipeline {
    source: Arc<ImageSource>,
    output_dir: PathBuf,
    runtime: Option<Runtime>,
    queues: Option<StageQueues>,
    stages: Vec<thread::JoinHandle<()>>,
    states: Arc<TaskStates>,
    pending: Mutex<Vec<JoinHandle<ExtractionOutcome>>>,
    next_id: AtomicU64,
}

impl ExtractionPipeline {
    /// Start the coordinator runtime and the read and write workers.
    ///
    /// # Errors
    ///
    /// Returns error if `output_dir` cannot be created or a worker cannot be started.
    pub fn new(
        source: Arc<ImageSource>,
        output_dir: impl Into<PathBuf>,
        options: &ExtractionOptions,
    ) -> Result<Self, ExtractionError> {
        let output_dir = output_dir.into();
        if !output_dir.is_dir() {
            debug!(path = %output_dir.display(), "creating output directory");
            fs::create_dir_all(&output_dir).map_err(|source| ExtractionError::DirectoryCreate {
                path: output_dir.clone(),
                source,
            })?;
        }

        let runtime = Builder::new_multi_thread()
            .worker_threads(options.coordinator_threads.max(1))
            .thread_name("extraction-task")
            .build()
            .map_err(ExtractionError::Startup)?;

        let states = Arc::new(TaskStates::default());
        let (read_tx, read_rx) = mpsc::unbounded_channel();
        let (write_tx, write_rx) = mpsc::unbounded_channel();

        let read_stage = {
            let source = source.clone();
            let states = states.clone();
            thread::Builder::new()
                .name("extraction-read".to_string())
                .spawn(move || read_stage(source, states, read_rx))
                .map_err(ExtractionError::Startup)?
        };
        let write_stage = {
            let states = states.clone();
            thread::Builder::new()
                .name("extraction-write".to_string())
                .spawn(move || write_stage(states, write_rx))
                .map_err(ExtractionError::Startup)?
        };

        Ok(Self {
            source,
            output_dir,
            runtime: Some(runtime),
            queues: Some(StageQueues {
                read: read_tx,
                write: write_tx,
            }),
            stages: vec![read_stage, write_stage],
            states,
            pending: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Handle a selection change. Returns immediately.
    ///
    /// Only a selection of exactly one ROI whose label names a projection
    /// queues a task; anything else, including an empty selection, is ignored.
    pub fn on_selection(&self, selected: &[SelectedRoi]) -> Option<ExtractionTask> {
        let [roi] = selected else {
            return None;
        };
        let series_index = roi::series_index_from_label(&roi.label)?;
        let (runtime, queues) = self.runtime.as_ref().zip(self.queues.as_ref())?;

        let task = self.task_for(series_index, roi.ordinal);
        self.states.insert(task.id);
        info!(roi = task.roi_ordinal, series = series_index, "queued extraction of ROI");

        let handle = runtime.spawn(coordinate(task.clone(), queues.clone(), self.states.clone()));
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        Some(task)
    }

    fn task_for(&self, series_index: usize, roi_ordinal: usize) -> ExtractionTask {
        let name = format!("{}_zstack_{roi_ordinal}", self.source.base_name());
        ExtractionTask {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            series_index,
            roi_ordinal,
            output_base_path: self.output_dir.join(&name).join(&name),
        }
    }

    pub fn state(&self, id: TaskId) -> Option<ExtractionState> {
        self.states.get(id)
    }

    /// Number of tasks submitted so far.
    pub fn queued(&self) -> usize {
        self.next_id.load(Ordering::Relaxed) as usize
    }

    /// Block until every task submitted so far has finished and return
    /// their outcomes in submission order. Must not be called from async code.
    pub fn wait_idle(&self) -> Vec<ExtractionOutcome> {
        let handles = std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner));
        let Some(runtime) = self.runtime.as_ref() else {
            return Vec::new();
        };
        runtime
            .block_on(futures::future::join_all(handles))
            .into_iter()
            .filter_map(|joined| match joined {
                Ok(outcome) => Some(outcome),
                Err(err) => {
                    error!(error = %err, "extraction task did not complete");
                    None
                }
            })
            .collect()
    }
}

impl Drop for ExtractionPipeline {
    fn drop(&mut self) {
        // Dropping the runtime drops every coordinator and its queue handle,
        // so the stages see a closed queue once the last sender is gone.
        drop(self.runtime.take());
        drop(self.queues.take());
        for stage in self.stages.drain(..) {
            if stage.join().is_err() {
                error!("extraction worker panicked");
            }
        }
    }
}

async fn coordinate(
    task: ExtractionTask,
    queues: StageQueues,
    states: Arc<TaskStates>,
) -> ExtractionOutcome {
    let start = Instant::now();
    let result = extract(&task, queues).await;
    match &result {
        Ok(report) => {
            states.advance(task.id, ExtractionState::Done);
            info!(
                roi = task.roi_ordinal,
                channels = report.written.len(),
                failed = report.failures.len(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "done writing ROI"
            );
        }
        Err(err) => {
            states.advance(task.id, ExtractionState::Failed);
            error!(roi = task.roi_ordinal, error = %err, "extraction failed");
        }
    }
    ExtractionOutcome { task, result }
}

/// Read strictly precedes write; the coordinator only waits on its own jobs.
async fn extract(task: &ExtractionTask, queues: StageQueues) -> Result<ExtractionReport, ExtractionError> {
    let dir = task.output_dir();
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| ExtractionError::DirectoryCreate {
            path: dir.to_path_buf(),
            source,
        })?;

    let (reply, decoded) = oneshot::channel();
    queues
        .read
        .send(ReadJob {
            task: task.clone(),
            reply,
        })
        .map_err(|_| ExtractionError::InterruptedWait("read"))?;
    let channels = decoded
        .await
        .map_err(|_| ExtractionError::InterruptedWait("read"))?
        .map_err(ExtractionError::Read)?;

    let (reply, report) = oneshot::channel();
    queues
        .write
        .send(WriteJob {
            task: task.clone(),
            channels,
            reply,
        })
        .map_err(|_| ExtractionError::InterruptedWait("write"))?;
    report
        .await
        .map_err(|_| ExtractionError::InterruptedWait("write"))
}

/// Run one stage job, turning a panic into a dropped reply.
fn isolated<T>(stage: &'static str, task: &ExtractionTask, job: impl FnOnce() -> T) -> Option<T> {
    match panic::catch_unwind(AssertUnwindSafe(job)) {
        Ok(value) => Some(value),
        Err(_) => {
            error!(stage, roi = task.roi_ordinal, series = task.series_index, "extraction job panicked");
            None
        }
    }
}

fn read_stage(
    source: Arc<ImageSource>,
    states: Arc<TaskStates>,
    mut jobs: mpsc::UnboundedReceiver<ReadJob>,
) {
    while let Some(ReadJob { task, reply }) = jobs.blocking_recv() {
        if reply.is_canceled() {
            continue;
        }
        states.advance(task.id, ExtractionState::Reading);
        debug!(roi = task.roi_ordinal, series = task.series_index, "reading tile");

        let Some(decoded) = isolated("read", &task, || decode_channels(&source, &task)) else {
            continue;
        };
        if reply.send(decoded).is_err() {
            warn!(roi = task.roi_ordinal, "coordinator stopped waiting for tile");
        }
    }
    debug!("extraction read stage stopped");
}

/// Re-open the tile lazily and decode each channel's planes. The reader is
/// closed before returning.
fn decode_channels(source: &ImageSource, task: &ExtractionTask) -> Result<ChannelPlanes, SourceError> {
    let stack = source.re_open_tile(task.series_index, StackMode::Virtual)?;
    let channels = (0..stack.channel_count())
        .map(|channel| stack.channel_planes(channel).collect())
        .collect();
    Ok(channels)
}

fn write_stage(states: Arc<TaskStates>, mut jobs: mpsc::UnboundedReceiver<WriteJob>) {
    while let Some(WriteJob { task, channels, reply }) = jobs.blocking_recv() {
        if reply.is_canceled() {
            continue;
        }
        states.advance(task.id, ExtractionState::Writing);
        let Some(report) = isolated("write", &task, || write_channels(&task, channels)) else {
            continue;
        };
        if reply.send(report).is_err() {
            warn!(roi = task.roi_ordinal, "coordinator stopped waiting for report");
        }
    }
    debug!("extraction write stage stopped");
}

/// Write each channel to its own multi-page file. Existing files are never
/// replaced; a failing channel does not stop the others.
fn write_channels(task: &ExtractionTask, channels: ChannelPlanes) -> ExtractionReport {
    let mut report = ExtractionReport::default();

    for (channel, planes) in channels.into_iter().enumerate() {
        let path = task.channel_path(channel);
        let result = match planes {
            _ if path.exists() => Err(ExtractionError::ChannelWriteConflict(path.clone())),
            Ok(planes) => writer::write_tiff_pages(&path, planes.into_iter().map(Ok)).map_err(|err| match err {
                WriteError::AlreadyExists(path) => ExtractionError::ChannelWriteConflict(path),
                source => ExtractionError::ChannelWrite {
                    path: path.clone(),
                    source,
                },
            }),
            Err(err) => Err(ExtractionError::ChannelWrite {
                path: path.clone(),
                source: WriteError::Plane(err),
            }),
        };

        match result {
            Ok(pages) => {
                debug!(path = %path.display(), pages, "channel written");
                report.written.push(path);
            }
            Err(error) => {
                error!(roi = task.roi_ordinal, channel, error = %error, "channel not written");
                report.failures.push(ChannelFailure { channel, error });
            }
        }
    }
    report
}
