#![warn(missing_docs)]
//! # bgremove-pipeline
//!
//! ## Purpose
//! Wires the frame source, worker pool, and result assembler into the
//! concurrent video background-removal pipeline: the core of this crate
//! family.
//!
//! ## Responsibilities
//! - [`FrameBuffer`]: bounded, index-addressed, condition-variable-backed
//!   handoff between the frame source thread and worker threads.
//! - [`SlotTable`]: single-writer-per-key result handoff between workers and
//!   the assembler.
//! - [`run`]: spawns the frame source thread and `worker_count` worker
//!   threads, then drives the assembler on the calling thread until either
//!   `total_frames` bytes have reached the encoder or a worker dies.
//!
//! ## Data flow
//! `Source thread → FrameBuffer → Worker threads → SlotTable → Assembler (this
//! thread) → EncoderSink`. See [`bgremove_core::worker_batch_indices`] and
//! [`bgremove_core::worker_slot_sequence`] for the static scheduling math.
//!
//! ## Ownership and lifetimes
//! [`FrameBuffer`] and [`SlotTable`] are shared via `Arc` across threads; each
//! index/slot has exactly one writer, so no transactional discipline beyond a
//! `Mutex` + `Condvar` pair is required.
//!
//! ## Error model
//! [`PipelineError`] aggregates every subsystem error kind, plus
//! [`PipelineError::WorkerDied`] for the bounded-wait failure detection this
//! crate itself implements.

use std::collections::HashMap;
use std::io::Write;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bgremove_core::{
    total_slot_count, worker_batch_indices, worker_slot_sequence, CoreError, Device, Frame,
    FrameRate, Mask, ModelVariant, VideoMetadata, PIPELINE_HEIGHT,
};
use bgremove_engine::{Engine, EngineError};
use bgremove_source::{FrameDecoder, SourceError};
use serde::Serialize;
use thiserror::Error;

/// How long the assembler waits for a single missing slot before declaring
/// the owning worker dead.
pub const WORKER_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

/// Validated, immutable run configuration for one pipeline invocation.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Segmentation model to run.
    pub model_variant: ModelVariant,
    /// Compute device the engine is bound to.
    pub device: Device,
    /// Number of parallel worker threads (`N`).
    pub worker_count: u64,
    /// Frames per inference batch (`B`).
    pub gpu_batchsize: u64,
    /// Buffer depth in batches; buffer capacity is `prefetched_batches * gpu_batchsize`.
    pub prefetched_batches: u64,
    /// Optional override for the encoder's `-r` argument; `None` uses the
    /// probed frame rate.
    pub frame_rate_override: Option<FrameRate>,
}

impl PipelineConfig {
    /// Validates and constructs a pipeline configuration.
    ///
    /// # Errors
    /// Returns [`PipelineConfigError`] when `worker_count`, `gpu_batchsize`,
    /// or `prefetched_batches` is zero.
    pub fn new(
        model_variant: ModelVariant,
        device: Device,
        worker_count: u64,
        gpu_batchsize: u64,
        prefetched_batches: u64,
        frame_rate_override: Option<FrameRate>,
    ) -> Result<Self, PipelineConfigError> {
        if worker_count == 0 {
            return Err(PipelineConfigError::ZeroWorkerCount);
        }
        if gpu_batchsize == 0 {
            return Err(PipelineConfigError::ZeroBatchSize);
        }
        if prefetched_batches == 0 {
            return Err(PipelineConfigError::ZeroPrefetchDepth);
        }
        if worker_count > 4 {
            tracing::warn!(
                worker_count,
                "worker counts above 4 substantially increase failure probability on shared-memory-constrained hosts"
            );
        }
        Ok(Self {
            model_variant,
            device,
            worker_count,
            gpu_batchsize,
            prefetched_batches,
            frame_rate_override,
        })
    }

    /// Buffer capacity in frames: `prefetched_batches * gpu_batchsize`.
    pub fn buffer_capacity(&self) -> u64 {
        self.prefetched_batches * self.gpu_batchsize
    }
}

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum PipelineConfigError {
    /// `worker_count` was zero.
    #[error("worker count must be at least 1")]
    ZeroWorkerCount,
    /// `gpu_batchsize` was zero.
    #[error("gpu batch size must be at least 1")]
    ZeroBatchSize,
    /// `prefetched_batches` was zero.
    #[error("prefetched batch depth must be at least 1")]
    ZeroPrefetchDepth,
}

/// Bounded, index-addressed frame store shared by the source thread and the
/// worker pool.
pub struct FrameBuffer {
    state: Mutex<FrameBufferState>,
    condvar: Condvar,
    capacity: u64,
}

struct FrameBufferState {
    frames: HashMap<u64, Frame>,
    shutdown: bool,
}

impl FrameBuffer {
    /// Creates an empty buffer bounded at `capacity` unclaimed frames.
    pub fn new(capacity: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FrameBufferState {
                frames: HashMap::new(),
                shutdown: false,
            }),
            condvar: Condvar::new(),
            capacity,
        })
    }

    /// Inserts `frame`, blocking while the buffer already holds `capacity`
    /// unclaimed frames. Returns `false` if shutdown was signalled while
    /// waiting, in which case the frame was not inserted.
    pub fn push(&self, frame: Frame) -> bool {
        let mut state = self.state.lock().expect("frame buffer mutex poisoned");
        while state.frames.len() as u64 >= self.capacity && !state.shutdown {
            state = self.condvar.wait(state).expect("frame buffer mutex poisoned");
        }
        if state.shutdown {
            return false;
        }
        state.frames.insert(frame.index, frame);
        self.condvar.notify_all();
        true
    }

    /// Blocks until `index` is present, then returns a clone of it without
    /// removing it. Returns `None` if shutdown was signalled first.
    pub fn wait_for(&self, index: u64) -> Option<Frame> {
        let mut state = self.state.lock().expect("frame buffer mutex poisoned");
        while !state.frames.contains_key(&index) && !state.shutdown {
            state = self.condvar.wait(state).expect("frame buffer mutex poisoned");
        }
        let frame = state.frames.get(&index).cloned();
        frame
    }

    /// Removes `index`, the sole mechanism by which a frame's memory is
    /// reclaimed.
    pub fn remove(&self, index: u64) {
        let mut state = self.state.lock().expect("frame buffer mutex poisoned");
        state.frames.remove(&index);
        self.condvar.notify_all();
    }

    /// Current count of unclaimed frames.
    pub fn len(&self) -> usize {
        self.state.lock().expect("frame buffer mutex poisoned").frames.len()
    }

    /// Signals shutdown, waking every blocked reader and writer.
    pub fn shutdown(&self) {
        self.state.lock().expect("frame buffer mutex poisoned").shutdown = true;
        self.condvar.notify_all();
    }
}

/// Single-writer-per-key result handoff between workers and the assembler.
pub struct SlotTable {
    state: Mutex<HashMap<u64, Vec<Mask>>>,
    condvar: Condvar,
}

impl SlotTable {
    /// Creates an empty slot table.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HashMap::new()),
            condvar: Condvar::new(),
        })
    }

    /// Publishes `masks` at `slot`. A slot is written exactly once.
    pub fn publish(&self, slot: u64, masks: Vec<Mask>) {
        let mut state = self.state.lock().expect("slot table mutex poisoned");
        state.insert(slot, masks);
        self.condvar.notify_all();
    }

    /// Blocks up to `timeout` for `slot` to appear, then removes and returns
    /// it. Returns `None` on timeout, signalling a dead worker.
    pub fn take_with_timeout(&self, slot: u64, timeout: Duration) -> Option<Vec<Mask>> {
        let mut state = self.state.lock().expect("slot table mutex poisoned");
        let deadline = Instant::now() + timeout;
        while !state.contains_key(&slot) {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (next_state, timeout_result) = self
                .condvar
                .wait_timeout(state, deadline - now)
                .expect("slot table mutex poisoned");
            state = next_state;
            if timeout_result.timed_out() && !state.contains_key(&slot) {
                return None;
            }
        }
        state.remove(&slot)
    }
}

impl Default for SlotTable {
    fn default() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            condvar: Condvar::new(),
        }
    }
}

/// Lazily-constructed external encoder process.
///
/// The process is spawned on the first call to [`EncoderSink::write_mask`],
/// once the runtime frame width is known; it is never pre-spawned.
pub struct EncoderSink {
    frame_rate: FrameRate,
    output_path: std::path::PathBuf,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
}

impl EncoderSink {
    /// Creates a sink that will spawn `ffmpeg` lazily.
    pub fn new(frame_rate: FrameRate, output_path: std::path::PathBuf) -> Self {
        Self {
            frame_rate,
            output_path,
            child: None,
            stdin: None,
        }
    }

    /// Writes one mask's raw grayscale bytes to the encoder's stdin,
    /// spawning the encoder first if this is the first frame.
    ///
    /// # Errors
    /// Returns [`EncoderError::Spawn`] if `ffmpeg` cannot be started, or
    /// [`EncoderError::Write`] if the stdin write fails.
    pub fn write_mask(&mut self, mask: &Mask) -> Result<(), EncoderError> {
        if self.stdin.is_none() {
            self.spawn(mask.width)?;
        }
        let stdin = self.stdin.as_mut().expect("stdin set by spawn");
        stdin.write_all(&mask.gray).map_err(EncoderError::Write)
    }

    fn spawn(&mut self, width: u32) -> Result<(), EncoderError> {
        let size_arg = format!("{width}x{PIPELINE_HEIGHT}");
        let rate_arg = self.frame_rate.as_arg_string();
        let mut child = Command::new("ffmpeg")
            .args(["-y", "-f", "rawvideo", "-vcodec", "rawvideo", "-s"])
            .arg(&size_arg)
            .args(["-pix_fmt", "gray", "-r"])
            .arg(&rate_arg)
            .args(["-i", "-", "-an", "-vcodec", "mpeg4", "-b:v", "2000k"])
            .arg(&self.output_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(EncoderError::Spawn)?;
        self.stdin = child.stdin.take();
        self.child = Some(child);
        Ok(())
    }

    /// Closes stdin and waits for the encoder to exit.
    ///
    /// # Errors
    /// Returns [`EncoderError::NonZeroExit`] if the encoder reports failure.
    /// If no frame was ever written, this is a no-op success.
    pub fn finish(mut self) -> Result<(), EncoderError> {
        drop(self.stdin.take());
        if let Some(mut child) = self.child.take() {
            let status = child.wait().map_err(EncoderError::Wait)?;
            if !status.success() {
                return Err(EncoderError::NonZeroExit(status.code()));
            }
        }
        Ok(())
    }
}

/// Error type for encoder sink failures.
#[derive(Debug, Error)]
pub enum EncoderError {
    /// The encoder process could not be spawned.
    #[error("failed to spawn encoder: {0}")]
    Spawn(#[source] std::io::Error),
    /// Writing to the encoder's stdin failed.
    #[error("failed writing frame to encoder stdin: {0}")]
    Write(#[source] std::io::Error),
    /// Waiting for the encoder to exit failed.
    #[error("failed waiting for encoder: {0}")]
    Wait(#[source] std::io::Error),
    /// The encoder exited with a non-zero status.
    #[error("encoder exited with non-zero status: {0:?}")]
    NonZeroExit(Option<i32>),
}

/// Drives one complete pipeline run: probes `input_path`, spawns the frame
/// source and worker threads, and assembles ordered masks into `output_path`
/// via the external encoder.
///
/// # Errors
/// Returns any subsystem error, aggregated as [`PipelineError`].
pub fn run(
    input_path: &str,
    output_path: std::path::PathBuf,
    config: &PipelineConfig,
    engine: Arc<Engine>,
    frame_limit: Option<u64>,
) -> Result<VideoMetadata, PipelineError> {
    let metadata = bgremove_source::probe(input_path, frame_limit)?;
    let frame_rate = config.frame_rate_override.unwrap_or(metadata.frame_rate);

    let buffer = FrameBuffer::new(config.buffer_capacity());
    let slots = SlotTable::new();
    let shutdown = Arc::new(AtomicBool::new(false));

    let source_handle = spawn_source_thread(
        input_path.to_string(),
        metadata,
        Arc::clone(&buffer),
        Arc::clone(&shutdown),
    );

    let worker_handles: Vec<JoinHandle<Result<(), PipelineError>>> = (0..config.worker_count)
        .map(|worker| {
            spawn_worker_thread(
                worker,
                config.worker_count,
                config.gpu_batchsize,
                metadata.total_frames,
                Arc::clone(&buffer),
                Arc::clone(&slots),
                Arc::clone(&engine),
                Arc::clone(&shutdown),
            )
        })
        .collect();

    let assemble_result = assemble(&slots, metadata.total_frames, config.gpu_batchsize, frame_rate, output_path);

    shutdown.store(true, Ordering::SeqCst);
    buffer.shutdown();

    let _ = source_handle.join();
    for handle in worker_handles {
        let _ = handle.join();
    }

    assemble_result?;
    let result = VideoMetadata {
        total_frames: metadata.total_frames,
        frame_rate,
        width: metadata.width,
    };

    let summary = RunSummary {
        model_variant: config.model_variant.name(),
        device: config.device.to_string(),
        worker_count: config.worker_count,
        gpu_batchsize: config.gpu_batchsize,
        total_frames: result.total_frames,
        frame_rate: result.frame_rate.as_arg_string(),
        width: result.width,
    };
    match serde_json::to_string(&summary) {
        Ok(json) => tracing::info!(summary = %json, "pipeline run complete"),
        Err(error) => tracing::warn!(%error, "failed to serialize pipeline run summary"),
    }

    Ok(result)
}

/// JSON-serializable summary of one completed pipeline run, logged at info
/// level for operational visibility.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Segmentation model used.
    pub model_variant: &'static str,
    /// Compute device used.
    pub device: String,
    /// Worker thread count.
    pub worker_count: u64,
    /// Frames per inference batch.
    pub gpu_batchsize: u64,
    /// Total frames emitted.
    pub total_frames: u64,
    /// Frame rate as a `"num/den"` string.
    pub frame_rate: String,
    /// Frame width after rescaling.
    pub width: u32,
}

fn spawn_source_thread(
    input_path: String,
    metadata: VideoMetadata,
    buffer: Arc<FrameBuffer>,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<Result<(), PipelineError>> {
    std::thread::spawn(move || -> Result<(), PipelineError> {
        let mut decoder = FrameDecoder::spawn(&input_path, &metadata)?;
        while let Some(frame) = decoder.next_frame()? {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            if !buffer.push(frame) {
                break;
            }
        }
        Ok(())
    })
}

#[allow(clippy::too_many_arguments)]
fn spawn_worker_thread(
    worker: u64,
    worker_count: u64,
    batch_size: u64,
    total_frames: u64,
    buffer: Arc<FrameBuffer>,
    slots: Arc<SlotTable>,
    engine: Arc<Engine>,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<Result<(), PipelineError>> {
    std::thread::spawn(move || -> Result<(), PipelineError> {
        let batches = worker_batch_indices(worker, worker_count, batch_size, total_frames);
        let mut slot_sequence = worker_slot_sequence(worker, worker_count);

        for batch_indices in batches {
            if shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }

            let mut frames = Vec::with_capacity(batch_indices.len());
            for &index in &batch_indices {
                match buffer.wait_for(index) {
                    Some(frame) => frames.push(frame),
                    None => return Ok(()),
                }
            }

            let masks = engine.infer(&frames)?;

            for &index in &batch_indices {
                buffer.remove(index);
            }

            let slot = slot_sequence.next().expect("slot sequence is infinite");
            slots.publish(slot, masks);
        }
        Ok(())
    })
}

fn assemble(
    slots: &SlotTable,
    total_frames: u64,
    batch_size: u64,
    frame_rate: FrameRate,
    output_path: std::path::PathBuf,
) -> Result<(), PipelineError> {
    let mut encoder = EncoderSink::new(frame_rate, output_path);
    let mut frame_counter = 0u64;
    let slot_count = total_slot_count(total_frames, batch_size);

    // Collect the loop's outcome without returning early, so the encoder is
    // always closed and waited on below regardless of how the loop exits.
    let outcome: Result<(), PipelineError> = (|| {
        for slot in 1..=slot_count {
            let masks = slots
                .take_with_timeout(slot, WORKER_HEARTBEAT_TIMEOUT)
                .ok_or(PipelineError::WorkerDied { slot })?;
            for mask in &masks {
                encoder.write_mask(mask)?;
                frame_counter += 1;
                if frame_counter >= total_frames {
                    return Ok(());
                }
            }
        }
        Ok(())
    })();

    let finish_result = encoder.finish();
    match outcome {
        Err(error) => {
            if let Err(finish_error) = finish_result {
                tracing::warn!(%finish_error, "encoder cleanup after pipeline failure also failed");
            }
            Err(error)
        }
        Ok(()) => finish_result.map_err(PipelineError::from),
    }
}

/// Aggregated pipeline error type.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A configuration value was invalid.
    #[error("pipeline configuration error: {0}")]
    Config(#[from] PipelineConfigError),
    /// A frame-source/demux failure.
    #[error("frame source error: {0}")]
    Source(#[from] SourceError),
    /// A segmentation engine failure.
    #[error("segmentation engine error: {0}")]
    Engine(#[from] EngineError),
    /// The encoder subprocess failed.
    #[error("encoder error: {0}")]
    Encoder(#[from] EncoderError),
    /// A core data-model validation failure.
    #[error("core error: {0}")]
    Core(#[from] CoreError),
    /// A worker failed to produce its slot within the heartbeat timeout.
    #[error("worker died before producing slot {slot}")]
    WorkerDied {
        /// The slot index that never arrived.
        slot: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use bgremove_core::FrameRate;
    use bgremove_engine::{Engine, SyntheticInferenceBackend};
    use bgremove_core::{Device, ModelVariant};

    fn flat_frame(index: u64, width: u32, value: u8) -> Frame {
        Frame::new(index, width, vec![value; width as usize * PIPELINE_HEIGHT as usize * 3])
            .expect("frame should be valid")
    }

    #[test]
    fn run_summary_serializes_to_json_object() {
        let summary = RunSummary {
            model_variant: "u2netp",
            device: "cpu".to_string(),
            worker_count: 2,
            gpu_batchsize: 4,
            total_frames: 100,
            frame_rate: "30000/1001".to_string(),
            width: 640,
        };
        let json = serde_json::to_value(&summary).expect("summary should serialize");
        assert_eq!(json["model_variant"], "u2netp");
        assert_eq!(json["total_frames"], 100);
    }

    #[test]
    fn pipeline_config_rejects_zero_workers() {
        let error = PipelineConfig::new(ModelVariant::U2NetP, Device::Cpu, 0, 1, 1, None).unwrap_err();
        assert!(matches!(error, PipelineConfigError::ZeroWorkerCount));
    }

    #[test]
    fn buffer_capacity_multiplies_prefetch_and_batch() {
        let config = PipelineConfig::new(ModelVariant::U2NetP, Device::Cpu, 2, 4, 3, None).unwrap();
        assert_eq!(config.buffer_capacity(), 12);
    }

    #[test]
    fn frame_buffer_respects_backpressure() {
        let buffer = FrameBuffer::new(2);
        assert!(buffer.push(flat_frame(0, 4, 1)));
        assert!(buffer.push(flat_frame(1, 4, 1)));
        assert_eq!(buffer.len(), 2);

        let buffer_clone = Arc::clone(&buffer);
        let handle = std::thread::spawn(move || buffer_clone.push(flat_frame(2, 4, 1)));

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(buffer.len(), 2, "third push should block while at capacity");

        buffer.remove(0);
        assert!(handle.join().expect("thread should not panic"));
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn slot_table_take_times_out_when_never_published() {
        let slots = SlotTable::new();
        let result = slots.take_with_timeout(1, Duration::from_millis(20));
        assert!(result.is_none());
    }

    #[test]
    fn slot_table_round_trips_published_value() {
        let slots = SlotTable::new();
        slots.publish(1, vec![]);
        let result = slots.take_with_timeout(1, Duration::from_millis(20));
        assert_eq!(result, Some(vec![]));
    }

    #[test]
    fn worker_thread_publishes_expected_slots() {
        let buffer = FrameBuffer::new(16);
        let slots = SlotTable::new();
        let engine = Arc::new(Engine::new_with_backend(
            ModelVariant::U2NetP,
            Device::Cpu,
            Box::new(SyntheticInferenceBackend),
        ));
        let shutdown = Arc::new(AtomicBool::new(false));

        for index in 0..4u64 {
            buffer.push(flat_frame(index, 8, 50));
        }

        let handle = spawn_worker_thread(
            0,
            1,
            2,
            4,
            Arc::clone(&buffer),
            Arc::clone(&slots),
            engine,
            shutdown,
        );
        handle.join().expect("worker should not panic").expect("worker should succeed");

        assert!(slots.take_with_timeout(1, Duration::from_millis(100)).is_some());
        assert!(slots.take_with_timeout(2, Duration::from_millis(100)).is_some());
    }

    #[test]
    fn frame_rate_override_is_honoured_in_config() {
        let rate = FrameRate::parse("24/1").unwrap();
        let config = PipelineConfig::new(ModelVariant::U2Net, Device::Cpu, 1, 1, 1, Some(rate)).unwrap();
        assert_eq!(config.frame_rate_override, Some(rate));
    }
}
