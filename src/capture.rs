//! Capture engine: turns the OS capture session's two sample streams into
//! canonical s16le mono frames with meeting-relative PTS, gates them until
//! the MEETING_START handshake, and forwards them to the worker.
//!
//! The OS capture layer itself (ScreenCaptureKit, WASAPI, PipeWire, …) lives
//! outside this crate behind [`CaptureBackend`]; callbacks arrive on
//! OS-provided serial queues, one per stream, and must not block.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::CaptureError;
use crate::frame::{Frame, StreamId};
use crate::pcm::{extract_mono_s16, rms_level, SampleBuffer};

/// Cap on audio chunks held back before MEETING_START. Oldest drop first.
pub const PENDING_AUDIO_CAP: usize = 200;

/// Deadline for per-stream format detection during start.
pub const FORMAT_DETECT_TIMEOUT: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// External collaborator traits
// ---------------------------------------------------------------------------

/// Selects what the OS capture session records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentFilter {
    Display(u32),
    Window(u32),
}

/// A still image grabbed from the capture source.
#[derive(Debug, Clone)]
pub struct StillFrame {
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGBA8.
    pub rgba: Vec<u8>,
    /// Host-clock PTS in microseconds, same clock as audio buffers.
    pub pts_us: i64,
}

/// Receives sample buffers from the OS capture session. Implemented by the
/// engine; called on the per-stream dispatch queues.
pub trait StreamDelegate: Send + Sync {
    fn on_audio(&self, stream: StreamId, buffer: SampleBuffer);
    fn on_stream_error(&self, stream: StreamId, error: CaptureError);
}

/// A running OS capture session.
pub trait CaptureSessionHandle: Send + Sync {
    fn capture_still(&self) -> Result<StillFrame, CaptureError>;
    fn stop(&self) -> Result<(), CaptureError>;
}

/// Starts OS capture sessions. Production backends live outside this crate.
pub trait CaptureBackend: Send + Sync + 'static {
    fn start(
        &self,
        filter: ContentFilter,
        delegate: Arc<dyn StreamDelegate>,
    ) -> Result<Box<dyn CaptureSessionHandle>, CaptureError>;
}

/// Where the engine hands finished audio frames. The worker's frame writer
/// implements this; tests substitute a recorder.
pub trait FrameSink: Send + Sync {
    /// Non-blocking, best-effort. Called from capture dispatch queues.
    fn send_frame(&self, frame: Frame);
}

impl FrameSink for crate::worker::FrameWriter {
    fn send_frame(&self, frame: Frame) {
        self.send_audio(frame);
    }
}

/// Observer for UI level meters; invoked per emitted chunk with an RMS level
/// in [0, 1]. Must not block.
pub type LevelObserver = Arc<dyn Fn(StreamId, f32) + Send + Sync>;

// ---------------------------------------------------------------------------
// Formats
// ---------------------------------------------------------------------------

/// Detected stream format; unknown until the first sample buffer arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectedFormats {
    pub system: Option<StreamFormat>,
    pub mic: Option<StreamFormat>,
}

impl DetectedFormats {
    pub fn get(&self, stream: StreamId) -> Option<StreamFormat> {
        match stream {
            StreamId::System => self.system,
            StreamId::Mic => self.mic,
        }
    }

    fn set(&mut self, stream: StreamId, format: StreamFormat) {
        match stream {
            StreamId::System => self.system = Some(format),
            StreamId::Mic => self.mic = Some(format),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.system.is_some() && self.mic.is_some()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Idle,
    /// Session is up, waiting for the first sample buffer.
    Starting,
    Running,
    Stopped,
}

/// Per-stream debug counters, surfaced without interrupting capture.
#[derive(Debug, Clone, Default)]
pub struct CaptureStats {
    pub system_errors: u64,
    pub mic_errors: u64,
    pub last_system_error: Option<String>,
    pub last_mic_error: Option<String>,
    pub pending_len: usize,
    pub pending_dropped: u64,
}

/// Mutex-guarded audio state. Critical sections are O(1): mutate a flag,
/// push or pop one frame. No I/O happens under this lock.
struct AudioState {
    phase: EnginePhase,
    enabled: bool,
    start_pts_us: Option<i64>,
    formats: DetectedFormats,
    pending: VecDeque<Frame>,
    pending_dropped: u64,
    sink: Option<Arc<dyn FrameSink>>,
}

struct AudioShared {
    state: StdMutex<AudioState>,
    formats_tx: watch::Sender<DetectedFormats>,
    level_observer: StdMutex<Option<LevelObserver>>,
    error_counts: [AtomicU64; 2],
    last_errors: [StdMutex<Option<String>>; 2],
    /// Raw s16le debug dumps, one per stream; independent of the audio-state
    /// mutex so file writes never stall a callback that only needs state.
    record: [StdMutex<Option<BufWriter<File>>>; 2],
}

impl AudioShared {
    fn record_error(&self, stream: StreamId, message: String) {
        self.error_counts[stream as usize].fetch_add(1, Ordering::Relaxed);
        *self.last_errors[stream as usize].lock().expect("last_errors lock") = Some(message);
    }
}

pub struct CaptureEngine {
    backend: Arc<dyn CaptureBackend>,
    audio: Arc<AudioShared>,
    formats_rx: watch::Receiver<DetectedFormats>,
    session: StdMutex<Option<Arc<dyn CaptureSessionHandle>>>,
}

impl CaptureEngine {
    pub fn new(backend: Arc<dyn CaptureBackend>) -> Self {
        let (formats_tx, formats_rx) = watch::channel(DetectedFormats::default());
        let audio = Arc::new(AudioShared {
            state: StdMutex::new(AudioState {
                phase: EnginePhase::Idle,
                enabled: false,
                start_pts_us: None,
                formats: DetectedFormats::default(),
                pending: VecDeque::new(),
                pending_dropped: 0,
                sink: None,
            }),
            formats_tx,
            level_observer: StdMutex::new(None),
            error_counts: [AtomicU64::new(0), AtomicU64::new(0)],
            last_errors: [StdMutex::new(None), StdMutex::new(None)],
            record: [StdMutex::new(None), StdMutex::new(None)],
        });
        Self {
            backend,
            audio,
            formats_rx,
            session: StdMutex::new(None),
        }
    }

    pub fn set_level_observer(&self, observer: LevelObserver) {
        *self.audio.level_observer.lock().expect("observer lock") = Some(observer);
    }

    /// Configure and start the OS capture session. The first sample buffer
    /// on either stream defines t = 0 and moves the engine to `Running`.
    pub fn start(
        &self,
        filter: ContentFilter,
        sink: Arc<dyn FrameSink>,
        record_path: Option<PathBuf>,
    ) -> Result<(), CaptureError> {
        {
            let mut session = self.session.lock().expect("session lock");
            if session.is_some() {
                return Err(CaptureError::AlreadyRunning);
            }

            {
                let mut state = self.audio.state.lock().expect("audio state lock");
                state.phase = EnginePhase::Starting;
                state.enabled = false;
                state.start_pts_us = None;
                state.formats = DetectedFormats::default();
                state.pending.clear();
                state.pending_dropped = 0;
                state.sink = Some(sink);
            }
            let _ = self.audio.formats_tx.send(DetectedFormats::default());

            if let Some(dir) = record_path {
                std::fs::create_dir_all(&dir)?;
                for stream in [StreamId::System, StreamId::Mic] {
                    let file = File::create(dir.join(format!("{}.s16le", stream.label())))?;
                    *self.audio.record[stream as usize]
                        .lock()
                        .expect("record lock") = Some(BufWriter::new(file));
                }
            }

            let delegate: Arc<dyn StreamDelegate> = Arc::new(EngineDelegate {
                audio: Arc::clone(&self.audio),
            });
            match self.backend.start(filter, delegate) {
                Ok(handle) => {
                    *session = Some(Arc::from(handle));
                }
                Err(e) => {
                    self.audio.state.lock().expect("audio state lock").phase = EnginePhase::Idle;
                    return Err(e);
                }
            }
        }
        tracing::info!("capture session started");
        Ok(())
    }

    /// Stop the OS session and close debug dumps. Tolerates not running, so
    /// teardown paths can call it unconditionally.
    pub fn stop(&self) -> Result<(), CaptureError> {
        let handle = self.session.lock().expect("session lock").take();
        let result = match handle {
            Some(handle) => handle.stop(),
            None => Ok(()),
        };
        {
            let mut state = self.audio.state.lock().expect("audio state lock");
            state.phase = EnginePhase::Idle;
            state.enabled = false;
            state.sink = None;
        }
        for slot in &self.audio.record {
            if let Some(mut writer) = slot.lock().expect("record lock").take() {
                let _ = writer.flush();
            }
        }
        tracing::info!("capture session stopped");
        result
    }

    /// Wait up to `timeout` for per-stream format detection. Partial results
    /// are allowed; whatever has been seen by the deadline is returned.
    pub async fn wait_for_formats(&self, timeout: Duration) -> DetectedFormats {
        let mut rx = self.formats_rx.clone();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let current = *rx.borrow_and_update();
            if current.is_complete() {
                return current;
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                // Sender gone or deadline hit: return what we have.
                Ok(Err(_)) | Err(_) => return *rx.borrow(),
            }
        }
    }

    /// Open the gate. MEETING_START must already be on the wire: queued
    /// pre-handshake audio drains to the sink in arrival order, and
    /// subsequent callbacks emit directly.
    pub fn enable_audio_output(&self, enabled: bool) {
        let mut state = self.audio.state.lock().expect("audio state lock");
        state.enabled = enabled;
        if !enabled {
            return;
        }
        if let Some(sink) = state.sink.clone() {
            while let Some(frame) = state.pending.pop_front() {
                sink.send_frame(frame);
            }
        }
    }

    /// The live session handle, e.g. for still-frame capture. `None` when
    /// not running.
    pub fn session_handle(&self) -> Option<Arc<dyn CaptureSessionHandle>> {
        self.session.lock().expect("session lock").clone()
    }

    /// PTS of the first observed sample buffer; `None` until `Running`.
    pub fn start_pts_us(&self) -> Option<i64> {
        self.audio.state.lock().expect("audio state lock").start_pts_us
    }

    /// Closure form of [`start_pts_us`], handed to the screenshot scheduler.
    pub fn start_pts_fn(&self) -> impl Fn() -> Option<i64> + Send + Sync + 'static {
        let audio = Arc::clone(&self.audio);
        move || audio.state.lock().expect("audio state lock").start_pts_us
    }

    pub fn phase(&self) -> EnginePhase {
        self.audio.state.lock().expect("audio state lock").phase
    }

    pub fn formats(&self) -> DetectedFormats {
        self.audio.state.lock().expect("audio state lock").formats
    }

    pub fn debug_stats(&self) -> CaptureStats {
        let state = self.audio.state.lock().expect("audio state lock");
        CaptureStats {
            system_errors: self.audio.error_counts[0].load(Ordering::Relaxed),
            mic_errors: self.audio.error_counts[1].load(Ordering::Relaxed),
            last_system_error: self.audio.last_errors[0]
                .lock()
                .expect("last_errors lock")
                .clone(),
            last_mic_error: self.audio.last_errors[1]
                .lock()
                .expect("last_errors lock")
                .clone(),
            pending_len: state.pending.len(),
            pending_dropped: state.pending_dropped,
        }
    }
}

// ---------------------------------------------------------------------------
// Delegate
// ---------------------------------------------------------------------------

struct EngineDelegate {
    audio: Arc<AudioShared>,
}

impl StreamDelegate for EngineDelegate {
    fn on_audio(&self, stream: StreamId, buffer: SampleBuffer) {
        // Extraction and metering happen before the state lock; the critical
        // section below only touches flags and the pending queue.
        let chunk = match extract_mono_s16(&buffer) {
            Ok(chunk) => chunk,
            Err(e) => {
                self.audio.record_error(stream, e.to_string());
                return;
            }
        };

        let level = rms_level(&chunk.samples);
        if let Some(observer) = self
            .audio
            .level_observer
            .lock()
            .expect("observer lock")
            .clone()
        {
            observer(stream, level);
        }

        let format = buffer.format.map(|f| StreamFormat {
            sample_rate: f.sample_rate,
            channels: f.channels,
        });

        let pcm = chunk.into_bytes();
        if let Some(writer) = self.audio.record[stream as usize]
            .lock()
            .expect("record lock")
            .as_mut()
        {
            let _ = writer.write_all(&pcm);
        }

        let host_pts = buffer.pts_us;
        let mut detected = None;
        let emit = {
            let mut state = self.audio.state.lock().expect("audio state lock");
            let start = *state.start_pts_us.get_or_insert(host_pts);
            if state.phase == EnginePhase::Starting {
                state.phase = EnginePhase::Running;
            }
            if let (Some(format), None) = (format, state.formats.get(stream)) {
                state.formats.set(stream, format);
                detected = Some(state.formats);
            }

            let frame = Frame::audio(stream, host_pts - start, pcm);
            if state.enabled {
                state.sink.clone().map(|sink| (sink, frame))
            } else {
                if state.pending.len() >= PENDING_AUDIO_CAP {
                    state.pending.pop_front();
                    state.pending_dropped += 1;
                }
                state.pending.push_back(frame);
                None
            }
        };

        if let Some(formats) = detected {
            let _ = self.audio.formats_tx.send(formats);
        }
        if let Some((sink, frame)) = emit {
            sink.send_frame(frame);
        }
    }

    fn on_stream_error(&self, stream: StreamId, error: CaptureError) {
        tracing::error!(stream = stream.label(), "capture stream failed: {error}");
        self.audio.record_error(stream, error.to_string());
        self.audio.state.lock().expect("audio state lock").phase = EnginePhase::Stopped;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameType;
    use crate::pcm::PcmFormat;

    struct FakeSession;

    impl CaptureSessionHandle for FakeSession {
        fn capture_still(&self) -> Result<StillFrame, CaptureError> {
            Ok(StillFrame {
                width: 2,
                height: 2,
                rgba: vec![0u8; 16],
                pts_us: 0,
            })
        }

        fn stop(&self) -> Result<(), CaptureError> {
            Ok(())
        }
    }

    /// Backend that hands the delegate back to the test for direct driving.
    #[derive(Default)]
    struct FakeBackend {
        delegate: StdMutex<Option<Arc<dyn StreamDelegate>>>,
    }

    impl CaptureBackend for FakeBackend {
        fn start(
            &self,
            _filter: ContentFilter,
            delegate: Arc<dyn StreamDelegate>,
        ) -> Result<Box<dyn CaptureSessionHandle>, CaptureError> {
            *self.delegate.lock().unwrap() = Some(delegate);
            Ok(Box::new(FakeSession))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        frames: StdMutex<Vec<Frame>>,
    }

    impl FrameSink for RecordingSink {
        fn send_frame(&self, frame: Frame) {
            self.frames.lock().unwrap().push(frame);
        }
    }

    fn i16_buffer(rate: u32, channels: u16, samples: &[i16], pts_us: i64) -> SampleBuffer {
        SampleBuffer {
            format: Some(PcmFormat {
                is_float: false,
                bits_per_channel: 16,
                channels,
                interleaved: true,
                sample_rate: rate,
            }),
            buffers: vec![samples.iter().flat_map(|s| s.to_le_bytes()).collect()],
            frames: samples.len() / channels as usize,
            pts_us,
        }
    }

    fn engine_with_backend() -> (CaptureEngine, Arc<FakeBackend>) {
        let backend = Arc::new(FakeBackend::default());
        let engine = CaptureEngine::new(backend.clone());
        (engine, backend)
    }

    #[tokio::test]
    async fn test_gating_queues_until_enabled_and_preserves_order() {
        let (engine, backend) = engine_with_backend();
        let sink = Arc::new(RecordingSink::default());
        engine
            .start(ContentFilter::Display(1), sink.clone(), None)
            .unwrap();
        let delegate = backend.delegate.lock().unwrap().clone().unwrap();

        delegate.on_audio(StreamId::System, i16_buffer(48_000, 1, &[1], 1_000_000));
        delegate.on_audio(StreamId::System, i16_buffer(48_000, 1, &[2], 1_020_000));
        delegate.on_audio(StreamId::Mic, i16_buffer(16_000, 1, &[3], 1_050_000));
        assert!(sink.frames.lock().unwrap().is_empty());

        engine.enable_audio_output(true);
        delegate.on_audio(StreamId::System, i16_buffer(48_000, 1, &[4], 1_040_000));

        let frames = sink.frames.lock().unwrap();
        assert_eq!(frames.len(), 4);
        // Arrival order is preserved and PTS is meeting-relative.
        assert_eq!(frames[0].pts_us, 0);
        assert_eq!(frames[1].pts_us, 20_000);
        assert_eq!(frames[2].pts_us, 50_000);
        assert_eq!(frames[3].pts_us, 40_000);
        assert!(frames.iter().all(|f| f.frame_type == FrameType::Audio));
        engine.stop().unwrap();
    }

    #[tokio::test]
    async fn test_pending_overflow_drops_oldest() {
        let (engine, backend) = engine_with_backend();
        let sink = Arc::new(RecordingSink::default());
        engine
            .start(ContentFilter::Display(1), sink.clone(), None)
            .unwrap();
        let delegate = backend.delegate.lock().unwrap().clone().unwrap();

        for i in 0..(PENDING_AUDIO_CAP + 5) {
            let pts = 1_000_000 + (i as i64) * 10_000;
            delegate.on_audio(StreamId::System, i16_buffer(48_000, 1, &[i as i16], pts));
        }
        assert_eq!(engine.debug_stats().pending_dropped, 5);

        engine.enable_audio_output(true);
        let frames = sink.frames.lock().unwrap();
        assert_eq!(frames.len(), PENDING_AUDIO_CAP);
        // The five oldest chunks were discarded.
        assert_eq!(frames[0].pts_us, 50_000);
        engine.stop().unwrap();
    }

    #[tokio::test]
    async fn test_format_detection_is_first_buffer_wins() {
        let (engine, backend) = engine_with_backend();
        let sink = Arc::new(RecordingSink::default());
        engine
            .start(ContentFilter::Display(1), sink, None)
            .unwrap();
        let delegate = backend.delegate.lock().unwrap().clone().unwrap();

        delegate.on_audio(StreamId::System, i16_buffer(48_000, 1, &[0], 0));
        delegate.on_audio(StreamId::Mic, i16_buffer(16_000, 1, &[0], 50_000));
        delegate.on_audio(StreamId::System, i16_buffer(44_100, 2, &[0, 0], 100_000));

        let formats = engine.wait_for_formats(Duration::from_secs(1)).await;
        assert_eq!(
            formats.system,
            Some(StreamFormat { sample_rate: 48_000, channels: 1 })
        );
        assert_eq!(
            formats.mic,
            Some(StreamFormat { sample_rate: 16_000, channels: 1 })
        );
        engine.stop().unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_formats_returns_partial_on_deadline() {
        let (engine, backend) = engine_with_backend();
        let sink = Arc::new(RecordingSink::default());
        engine
            .start(ContentFilter::Display(1), sink, None)
            .unwrap();
        let delegate = backend.delegate.lock().unwrap().clone().unwrap();

        delegate.on_audio(StreamId::System, i16_buffer(48_000, 1, &[0], 0));

        let formats = engine.wait_for_formats(Duration::from_millis(50)).await;
        assert!(formats.system.is_some());
        assert!(formats.mic.is_none());
        engine.stop().unwrap();
    }

    #[tokio::test]
    async fn test_extraction_errors_are_counted_not_fatal() {
        let (engine, backend) = engine_with_backend();
        let sink = Arc::new(RecordingSink::default());
        engine
            .start(ContentFilter::Display(1), sink.clone(), None)
            .unwrap();
        let delegate = backend.delegate.lock().unwrap().clone().unwrap();
        engine.enable_audio_output(true);

        let bad = SampleBuffer {
            format: None,
            buffers: vec![vec![0, 0]],
            frames: 1,
            pts_us: 0,
        };
        delegate.on_audio(StreamId::Mic, bad);
        delegate.on_audio(StreamId::Mic, i16_buffer(16_000, 1, &[7], 10));

        let stats = engine.debug_stats();
        assert_eq!(stats.mic_errors, 1);
        assert!(stats.last_mic_error.is_some());
        assert_eq!(sink.frames.lock().unwrap().len(), 1);
        assert_eq!(engine.phase(), EnginePhase::Running);
        engine.stop().unwrap();
    }

    #[tokio::test]
    async fn test_level_observer_sees_rms() {
        let (engine, backend) = engine_with_backend();
        let sink = Arc::new(RecordingSink::default());
        let levels: Arc<StdMutex<Vec<(StreamId, f32)>>> = Arc::default();
        let levels_cb = Arc::clone(&levels);
        engine.set_level_observer(Arc::new(move |stream, level| {
            levels_cb.lock().unwrap().push((stream, level));
        }));
        engine
            .start(ContentFilter::Display(1), sink, None)
            .unwrap();
        let delegate = backend.delegate.lock().unwrap().clone().unwrap();

        delegate.on_audio(StreamId::System, i16_buffer(48_000, 1, &[16384, -16384], 0));

        let levels = levels.lock().unwrap();
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0].0, StreamId::System);
        assert!((levels[0].1 - 0.5).abs() < 0.01);
        engine.stop().unwrap();
    }

    #[tokio::test]
    async fn test_start_twice_fails_stop_is_tolerant() {
        let (engine, _backend) = engine_with_backend();
        let sink = Arc::new(RecordingSink::default());
        engine
            .start(ContentFilter::Window(7), sink.clone(), None)
            .unwrap();
        assert!(matches!(
            engine.start(ContentFilter::Window(7), sink, None),
            Err(CaptureError::AlreadyRunning)
        ));
        engine.stop().unwrap();
        engine.stop().unwrap();
        assert_eq!(engine.phase(), EnginePhase::Idle);
    }

    #[tokio::test]
    async fn test_record_path_writes_raw_pcm() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, backend) = engine_with_backend();
        let sink = Arc::new(RecordingSink::default());
        engine
            .start(
                ContentFilter::Display(1),
                sink,
                Some(dir.path().to_path_buf()),
            )
            .unwrap();
        let delegate = backend.delegate.lock().unwrap().clone().unwrap();
        delegate.on_audio(StreamId::System, i16_buffer(48_000, 1, &[1, -2], 0));
        engine.stop().unwrap();

        let raw = std::fs::read(dir.path().join("system.s16le")).unwrap();
        assert_eq!(raw, vec![0x01, 0x00, 0xfe, 0xff]);
        assert!(dir.path().join("mic.s16le").exists());
    }
}
