//! Session controller: owns the meeting lifecycle from source selection
//! through capture start, worker start, event routing, orderly stop with
//! drain, and resume.
//!
//! The controller is a single-writer actor: one operation (start / stop /
//! resume) is in flight at a time, serialised on the active-recording lock.
//! All ingestor mutation happens on the event-routing task; observers read
//! immutable snapshots from a watch channel.

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch, Mutex as TokioMutex};
use tokio_util::sync::CancellationToken;

use crate::backend_log::BackendLog;
use crate::capture::{
    CaptureBackend, CaptureEngine, ContentFilter, DetectedFormats, FrameSink, LevelObserver,
    FORMAT_DETECT_TIMEOUT,
};
use crate::error::ControllerError;
use crate::events::{parse_event, ReprocessResult, ReprocessStage, WorkerEvent};
use crate::frame::{EventLine, Frame};
use crate::ingest::{TranscriptIngestor, TranscriptSnapshot};
use crate::reprocess::{BatchRediarizer, ReprocessStreams};
use crate::screenshot::{ScreenshotScheduler, SCREENSHOT_INTERVAL};
use crate::store::{
    Meeting, MeetingStore, SessionMeta, SessionStreams, BACKEND_LOG_FILE, EVENTS_FILE,
    SCREENSHOTS_DIR,
};
use crate::worker::{WorkerCommand, WorkerHooks, WorkerSupervisor, GRACEFUL_EXIT_TIMEOUT};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Worker invocation; index 0 is the executable. The controller appends
    /// the module selector and the session's audio folder.
    pub worker_argv: Vec<String>,
    pub worker_env: Vec<(String, String)>,
    pub store_base: PathBuf,
    /// Default requested sample rate, advertised in MEETING_START and used
    /// as the fallback for streams whose format was not detected in time.
    pub default_sample_rate: u32,
    pub default_channels: u16,
    pub video_mode: bool,
    pub screenshot_interval: Duration,
    pub echo_suppression: bool,
    /// When set, raw s16le per-stream dumps land in the session audio folder.
    pub record_raw_pcm: bool,
}

impl ControllerConfig {
    pub fn new(worker_argv: Vec<String>, store_base: impl Into<PathBuf>) -> Self {
        Self {
            worker_argv,
            worker_env: Vec::new(),
            store_base: store_base.into(),
            default_sample_rate: 16_000,
            default_channels: 1,
            video_mode: false,
            screenshot_interval: SCREENSHOT_INTERVAL,
            echo_suppression: true,
            record_raw_pcm: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

struct ActiveRecording {
    folder: String,
    started_at: DateTime<Utc>,
    supervisor: WorkerSupervisor,
    engine: Arc<CaptureEngine>,
    scheduler: ScreenshotScheduler,
    ingestor: Arc<StdMutex<TranscriptIngestor>>,
    router: tokio::task::JoinHandle<()>,
    backend_log: Arc<BackendLog>,
}

pub struct SessionController {
    config: ControllerConfig,
    backend: Arc<dyn CaptureBackend>,
    store: MeetingStore,
    rediarizer: BatchRediarizer,
    active: TokioMutex<Option<ActiveRecording>>,
    snapshot_tx: watch::Sender<TranscriptSnapshot>,
    level_observer: StdMutex<Option<LevelObserver>>,
}

impl SessionController {
    pub fn new(config: ControllerConfig, backend: Arc<dyn CaptureBackend>) -> Self {
        crate::install_sigpipe_ignore();
        let store = MeetingStore::new(config.store_base.clone());
        let (snapshot_tx, _) = watch::channel(TranscriptSnapshot::default());
        Self {
            config,
            backend,
            store,
            rediarizer: BatchRediarizer::new(),
            active: TokioMutex::new(None),
            snapshot_tx,
            level_observer: StdMutex::new(None),
        }
    }

    pub fn store(&self) -> &MeetingStore {
        &self.store
    }

    /// Live transcript snapshots, refreshed on every ingested event.
    pub fn subscribe_transcript(&self) -> watch::Receiver<TranscriptSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn set_level_observer(&self, observer: LevelObserver) {
        *self.level_observer.lock().expect("observer lock") = Some(observer);
    }

    pub async fn active_folder(&self) -> Option<String> {
        self.active.lock().await.as_ref().map(|r| r.folder.clone())
    }

    pub async fn is_recording(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Tail of the active recording's backend log.
    pub async fn backend_log_tail(&self) -> Vec<String> {
        match self.active.lock().await.as_ref() {
            Some(rec) => rec.backend_log.tail(),
            None => Vec::new(),
        }
    }

    // -- Start / resume ----------------------------------------------------

    /// Start a fresh meeting. Returns the meeting folder name.
    pub async fn start(
        &self,
        title: &str,
        filter: ContentFilter,
    ) -> Result<String, ControllerError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(ControllerError::AlreadyRecording);
        }
        self.validate_config()?;

        let started_at = Utc::now();
        let (folder, meeting) = self.store.create(title, started_at)?;
        match self
            .bring_up(&folder, &meeting, 0.0, filter, started_at, 1)
            .await
        {
            Ok(rec) => {
                *active = Some(rec);
                Ok(folder)
            }
            Err(e) => {
                // A failed fresh start leaves no half-created meeting behind.
                let _ = std::fs::remove_dir_all(self.store.meeting_path(&folder));
                Err(e)
            }
        }
    }

    /// Resume an existing meeting with a new session; new events land after
    /// the previous `last_timestamp`.
    pub async fn resume(
        &self,
        folder: &str,
        filter: ContentFilter,
    ) -> Result<(), ControllerError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(ControllerError::AlreadyRecording);
        }
        self.validate_config()?;

        let meeting = self.store.read(folder)?;
        let started_at = Utc::now();
        let session_id = meeting.next_session_id();
        let session = SessionMeta {
            session_id,
            started_at,
            ended_at: None,
            audio_folder: Meeting::audio_folder_name(session_id),
            streams: SessionStreams::default(),
        };
        let meeting = self.store.append_session(folder, session)?;

        match self
            .bring_up(
                folder,
                &meeting,
                meeting.last_timestamp,
                filter,
                started_at,
                session_id,
            )
            .await
        {
            Ok(rec) => {
                *active = Some(rec);
                Ok(())
            }
            Err(e) => {
                let _ = self.store.abort_open_session(folder);
                Err(e)
            }
        }
    }

    /// Full start sequence; tears everything down again on any failure so
    /// there is no partial running state.
    async fn bring_up(
        &self,
        folder: &str,
        meeting: &Meeting,
        timestamp_offset: f64,
        filter: ContentFilter,
        started_at: DateTime<Utc>,
        session_id: u32,
    ) -> Result<ActiveRecording, ControllerError> {
        let meeting_path = self.store.meeting_path(folder);
        let audio_dir = meeting_path.join(Meeting::audio_folder_name(session_id));

        let mut ingestor = TranscriptIngestor::new();
        ingestor.set_timestamp_offset(timestamp_offset);
        ingestor.set_echo_suppression(self.config.echo_suppression);
        ingestor.set_speaker_names(meeting.speaker_names.clone());
        if session_id > 1 {
            // Carry the transcript across the resume; new events land after
            // the offset, previous finals stay unchanged.
            match self.store.read_transcript(folder) {
                Ok(previous) => ingestor.seed(previous),
                Err(e) => tracing::warn!("previous transcript not loaded: {e}"),
            }
        }
        let ingestor = Arc::new(StdMutex::new(ingestor));
        self.snapshot_tx.send_replace(TranscriptSnapshot::default());

        let backend_log = Arc::new(BackendLog::open(&meeting_path.join(BACKEND_LOG_FILE))?);

        let mut argv = self.config.worker_argv.clone();
        argv.push("live".to_string());
        argv.push("--audio-dir".to_string());
        argv.push(audio_dir.to_string_lossy().to_string());

        let stderr_log = Arc::clone(&backend_log);
        let write_error_log = Arc::clone(&backend_log);
        let hooks = WorkerHooks {
            on_event_line: None,
            on_stderr_line: Some(Arc::new(move |line: &str| {
                stderr_log.append(&format!("[stderr] {line}"));
            })),
            on_write_error: Some(Box::new(move |e| {
                write_error_log.append(&format!("[error] worker stdin write failed: {e}"));
            })),
        };

        let mut supervisor = WorkerSupervisor::start(
            WorkerCommand {
                argv,
                cwd: meeting_path.clone(),
                env: self.config.worker_env.clone(),
            },
            hooks,
        )
        .await?;

        let router = tokio::spawn(route_events(
            supervisor.subscribe(),
            meeting_path.join(EVENTS_FILE),
            Arc::clone(&backend_log),
            Arc::clone(&ingestor),
            self.snapshot_tx.clone(),
        ));

        let engine = Arc::new(CaptureEngine::new(Arc::clone(&self.backend)));
        if let Some(observer) = self.level_observer.lock().expect("observer lock").clone() {
            engine.set_level_observer(observer);
        }
        let sink: Arc<dyn FrameSink> = supervisor.writer();
        let record_path = self.config.record_raw_pcm.then(|| audio_dir.clone());

        let scheduler = ScreenshotScheduler::new();
        let up: Result<(), ControllerError> = async {
            engine.start(filter, Arc::clone(&sink), record_path)?;
            let formats = engine.wait_for_formats(FORMAT_DETECT_TIMEOUT).await;
            self.store.update_open_session_streams(
                folder,
                SessionStreams {
                    system: formats.system,
                    mic: formats.mic,
                },
            )?;

            let payload = meeting_start_payload(&meeting.title, started_at, &self.config, formats);
            supervisor.send_control(Frame::meeting_start(payload)).await?;
            engine.enable_audio_output(true);

            if self.config.video_mode {
                let shots_dir = meeting_path.join(SCREENSHOTS_DIR);
                std::fs::create_dir_all(&shots_dir)?;
                if let Some(session) = engine.session_handle() {
                    scheduler.start(
                        session,
                        shots_dir,
                        SCREENSHOTS_DIR.to_string(),
                        Arc::clone(&sink),
                        engine.start_pts_fn(),
                        self.config.screenshot_interval,
                    );
                }
            }
            Ok(())
        }
        .await;

        if let Err(e) = up {
            tracing::error!(folder = %folder, "start sequence failed, tearing down: {e}");
            scheduler.stop();
            let _ = engine.stop();
            supervisor.terminate().await;
            supervisor.cleanup().await;
            router.abort();
            backend_log.close();
            return Err(e);
        }

        tracing::info!(folder = %folder, session_id, "recording started");
        Ok(ActiveRecording {
            folder: folder.to_string(),
            started_at,
            supervisor,
            engine,
            scheduler,
            ingestor,
            router,
            backend_log,
        })
    }

    // -- Stop --------------------------------------------------------------

    /// Orderly, loss-free stop. Every event line the worker managed to emit
    /// before exiting ends up in the transcript artefacts.
    pub async fn stop(&self) -> Result<Meeting, ControllerError> {
        // The guard is held for the whole stop: the controller is a
        // single-writer actor and no start/resume may overlap the drain.
        let mut active = self.active.lock().await;
        let rec = active.take().ok_or(ControllerError::NotRecording)?;

        let ActiveRecording {
            folder,
            started_at,
            mut supervisor,
            engine,
            scheduler,
            ingestor,
            router,
            backend_log,
        } = rec;

        scheduler.stop();
        if let Err(e) = engine.stop() {
            tracing::error!("capture stop failed: {e}");
        }

        let stop_pts_us = (Utc::now() - started_at).num_microseconds().unwrap_or(0);
        if let Err(e) = supervisor
            .send_control(Frame::meeting_stop(stop_pts_us))
            .await
        {
            tracing::warn!("MEETING_STOP not delivered: {e}");
        }
        supervisor.request_stop().await;

        let exit = supervisor.wait_for_exit(GRACEFUL_EXIT_TIMEOUT).await;
        match exit {
            Some(0) => {}
            Some(code) => tracing::warn!(code, "worker exited with non-zero status"),
            None => {
                tracing::warn!("worker did not exit within the grace period; terminating");
                supervisor.terminate().await;
            }
        }
        supervisor.cleanup().await;
        // Dropping the supervisor closes the event stream; the router drains
        // whatever is buffered, then finishes.
        drop(supervisor);
        if let Err(e) = router.await {
            tracing::warn!("event router ended abnormally: {e}");
        }

        let (finals, names) = {
            let ing = ingestor.lock().expect("ingestor lock");
            (ing.finals(), ing.speaker_names().clone())
        };

        if let Err(e) = self.store.write_transcripts(&folder, &finals, &names) {
            tracing::error!("transcript export failed (retry via export): {e}");
        }
        match tempfile::Builder::new().prefix("confab-export-").tempdir() {
            Ok(tmp) => {
                let export_dir = tmp.into_path();
                match crate::store::write_transcript_files(&export_dir, &finals, &names) {
                    Ok(()) => {
                        tracing::info!(dir = %export_dir.display(), "secondary transcript copy written")
                    }
                    Err(e) => tracing::error!("secondary transcript copy failed: {e}"),
                }
            }
            Err(e) => tracing::error!("could not create export folder: {e}"),
        }

        let finalised = self.store.finalise(&folder, &finals);
        if finalised.is_ok() {
            if let Err(e) = self.store.persist_speaker_names(&folder, &names) {
                tracing::error!("speaker name persistence failed: {e}");
            }
        }
        backend_log.close();

        let meeting = finalised?;
        tracing::info!(folder = %folder, segments = meeting.segment_count, "recording stopped");
        Ok(meeting)
    }

    // -- Maintenance -------------------------------------------------------

    /// Move a meeting to the OS trash. Refused while it is being recorded.
    pub async fn delete(&self, folder: &str) -> Result<(), ControllerError> {
        let active = self.active.lock().await;
        if active.as_ref().map(|r| r.folder == folder).unwrap_or(false) {
            return Err(ControllerError::DeleteActive);
        }
        self.store.trash(folder)?;
        Ok(())
    }

    /// Rename a speaker for the active recording and persist the mapping.
    pub async fn rename_speaker(
        &self,
        speaker_id: &str,
        name: &str,
    ) -> Result<(), ControllerError> {
        let active = self.active.lock().await;
        let rec = active.as_ref().ok_or(ControllerError::NotRecording)?;
        let names = {
            let mut ing = rec.ingestor.lock().expect("ingestor lock");
            let mut names = ing.speaker_names().clone();
            names.insert(speaker_id.to_string(), name.to_string());
            ing.set_speaker_names(names.clone());
            self.snapshot_tx.send_replace(ing.snapshot());
            names
        };
        self.store.persist_speaker_names(&rec.folder, &names)?;
        Ok(())
    }

    /// Launch a batch re-diarisation of an existing meeting folder.
    pub async fn reprocess(
        &self,
        folder: &str,
        streams: ReprocessStreams,
        cancel: &CancellationToken,
        on_stage: impl FnMut(ReprocessStage) + Send,
    ) -> anyhow::Result<ReprocessResult> {
        let path = self.store.meeting_path(folder);
        if !path.is_dir() {
            anyhow::bail!("meeting folder not found: {}", path.display());
        }
        let command = WorkerCommand {
            argv: self.config.worker_argv.clone(),
            cwd: path.clone(),
            env: self.config.worker_env.clone(),
        };
        self.rediarizer
            .run(&command, &path, streams, cancel, on_stage)
            .await
    }

    fn validate_config(&self) -> Result<(), ControllerError> {
        let exe = self
            .config
            .worker_argv
            .first()
            .ok_or_else(|| ControllerError::Config("worker argv is empty".into()))?;
        if !std::path::Path::new(exe).exists() {
            return Err(ControllerError::Config(format!(
                "worker executable not found: {exe}"
            )));
        }
        std::fs::create_dir_all(self.store.meetings_dir()).map_err(|e| {
            ControllerError::Config(format!("meetings directory is not writable: {e}"))
        })?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Event routing
// ---------------------------------------------------------------------------

/// The UI-affinity task: the only place ingestor state is mutated. Each line
/// is appended raw to `transcript_events.jsonl`, status/error chatter goes
/// to the backend log tail, and every event is offered to the ingestor.
async fn route_events(
    mut rx: broadcast::Receiver<EventLine>,
    events_path: PathBuf,
    backend_log: Arc<BackendLog>,
    ingestor: Arc<StdMutex<TranscriptIngestor>>,
    snapshot_tx: watch::Sender<TranscriptSnapshot>,
) {
    use std::io::Write;

    let mut events_file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&events_path)
    {
        Ok(file) => Some(std::io::BufWriter::new(file)),
        Err(e) => {
            tracing::error!(path = %events_path.display(), "cannot open events file: {e}");
            None
        }
    };

    loop {
        let line = match rx.recv().await {
            Ok(line) => line,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "event stream lagged; oldest lines lost");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        if let Some(file) = events_file.as_mut() {
            let _ = writeln!(file, "{}", line.text);
            let _ = file.flush();
        }

        match parse_event(&line.text) {
            Ok(event) => {
                match &event {
                    WorkerEvent::Status(status) => {
                        backend_log.append(&format!("[status] {}", status.message));
                    }
                    WorkerEvent::Error { message } => {
                        backend_log.append(&format!("[error] {message}"));
                    }
                    _ => {}
                }
                let mut ing = ingestor.lock().expect("ingestor lock");
                ing.apply(&event);
                snapshot_tx.send_replace(ing.snapshot());
            }
            Err(e) => {
                // Discarded by the ingestor, but the raw line is already in
                // the events file.
                tracing::debug!("unparseable worker line: {e}");
            }
        }
    }

    if let Some(mut file) = events_file.take() {
        let _ = file.flush();
    }
    tracing::debug!("event router finished");
}

fn meeting_start_payload(
    title: &str,
    started_at: DateTime<Utc>,
    config: &ControllerConfig,
    formats: DetectedFormats,
) -> Vec<u8> {
    let system = formats.system;
    let mic = formats.mic;
    serde_json::json!({
        "protocol_version": 1,
        "sample_format": "s16le",
        "title": title,
        "start_wall_time": started_at.to_rfc3339(),
        "sample_rate": config.default_sample_rate,
        "channels": config.default_channels,
        "system_sample_rate": system.map(|f| f.sample_rate).unwrap_or(config.default_sample_rate),
        "system_channels": system.map(|f| f.channels).unwrap_or(config.default_channels),
        "mic_sample_rate": mic.map(|f| f.sample_rate).unwrap_or(config.default_sample_rate),
        "mic_channels": mic.map(|f| f.channels).unwrap_or(config.default_channels),
    })
    .to_string()
    .into_bytes()
}
