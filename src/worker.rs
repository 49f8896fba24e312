//! Worker supervisor: spawns the external ASR/diarisation process, owns its
//! three pipes, frames outbound traffic, and fans stdout event lines out to
//! the ingest side.
//!
//! Outbound frames all traverse one writer mutex so a header and its payload
//! can never interleave. Audio frames take a non-blocking path through a
//! bounded in-flight channel drained by a forwarder task; control frames are
//! written directly under the mutex after the in-flight buffer has drained.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex as TokioMutex};

use crate::error::WorkerError;
use crate::frame::{EventLine, EventLineBuffer, Frame};

/// Bound on audio frames waiting for the forwarder. Overflow drops the
/// newest frame and bumps a counter; the pending-audio queue upstream is the
/// primary buffer.
const AUDIO_IN_FLIGHT: usize = 256;

/// Bound on the stdout event stream. Lagging readers lose the oldest lines.
const EVENT_STREAM_CAPACITY: usize = 500;

/// How long a worker may flush final events after MEETING_STOP.
pub const GRACEFUL_EXIT_TIMEOUT: Duration = Duration::from_secs(120);

// ---------------------------------------------------------------------------
// Command description
// ---------------------------------------------------------------------------

/// Argv, working directory and environment for one worker invocation.
/// Index 0 is the executable path; the rest is opaque to the core.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

/// Callbacks wired in by the controller before spawn.
#[derive(Default)]
pub struct WorkerHooks {
    /// Invoked for every complete stdout line, before it enters the
    /// broadcast stream.
    pub on_event_line: Option<Arc<dyn Fn(&EventLine) + Send + Sync>>,
    /// Invoked for every stderr line, including lines arriving after exit.
    pub on_stderr_line: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    /// Invoked once, on the first stdin write failure.
    pub on_write_error: Option<Box<dyn FnOnce(&std::io::Error) + Send>>,
}

// ---------------------------------------------------------------------------
// Frame writer
// ---------------------------------------------------------------------------

struct StdinSlot {
    stdin: Option<ChildStdin>,
    failed: bool,
    on_write_error: Option<Box<dyn FnOnce(&std::io::Error) + Send>>,
}

enum WriteJob {
    Frame(Frame),
    Flush(oneshot::Sender<()>),
}

/// The writer mutex and its latch. Shared between the public writer handle
/// and the audio forwarder task.
struct WriterShared {
    slot: TokioMutex<StdinSlot>,
    failed: AtomicBool,
}

impl WriterShared {
    /// Header and payload are written back-to-back under the lock; the pair
    /// is atomic with respect to every other frame.
    async fn write_locked(&self, frame: &Frame) -> Result<(), WorkerError> {
        let header = frame.header_bytes()?;
        let mut slot = self.slot.lock().await;
        if slot.failed {
            return Ok(());
        }
        let Some(stdin) = slot.stdin.as_mut() else {
            return Ok(());
        };
        let result = async {
            stdin.write_all(&header).await?;
            if !frame.payload.is_empty() {
                stdin.write_all(&frame.payload).await?;
            }
            stdin.flush().await
        }
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                slot.failed = true;
                self.failed.store(true, Ordering::Relaxed);
                if let Some(cb) = slot.on_write_error.take() {
                    cb(&e);
                }
                tracing::error!("worker stdin write failed: {e}");
                Err(WorkerError::Write(e))
            }
        }
    }
}

/// Serialises every outbound frame through one mutex around stdin.
pub struct FrameWriter {
    shared: Arc<WriterShared>,
    audio_tx: mpsc::Sender<WriteJob>,
    dropped_audio: AtomicU64,
}

impl FrameWriter {
    /// Non-blocking audio path: enqueue for the forwarder. Safe to call from
    /// capture dispatch queues. Overflow and post-failure sends are dropped.
    pub fn send_audio(&self, frame: Frame) {
        if self.shared.failed.load(Ordering::Relaxed) {
            return;
        }
        match self.audio_tx.try_send(WriteJob::Frame(frame)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let n = self.dropped_audio.fetch_add(1, Ordering::Relaxed) + 1;
                if n == 1 || n % 100 == 0 {
                    tracing::warn!(dropped = n, "audio writer in-flight buffer full, dropping frame");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Blocking control path: waits for all in-flight audio to reach stdin,
    /// then writes the frame under the writer mutex. Returns the first write
    /// error; later failures no-op silently.
    pub async fn send_control(&self, frame: Frame) -> Result<(), WorkerError> {
        self.drain().await;
        self.write_locked(&frame).await
    }

    /// Await the forwarder having written everything enqueued before now.
    pub async fn drain(&self) {
        let (tx, rx) = oneshot::channel();
        if self.audio_tx.send(WriteJob::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Close stdin after draining buffered frames. Signals end-of-input to
    /// the worker; subsequent sends no-op.
    pub async fn close(&self) {
        self.drain().await;
        let mut slot = self.shared.slot.lock().await;
        if let Some(mut stdin) = slot.stdin.take() {
            let _ = stdin.shutdown().await;
        }
    }

    pub fn dropped_audio_frames(&self) -> u64 {
        self.dropped_audio.load(Ordering::Relaxed)
    }

    pub fn write_failed(&self) -> bool {
        self.shared.failed.load(Ordering::Relaxed)
    }

    async fn write_locked(&self, frame: &Frame) -> Result<(), WorkerError> {
        self.shared.write_locked(frame).await
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

pub struct WorkerSupervisor {
    child: TokioMutex<Option<Child>>,
    exit_code: StdMutex<Option<i32>>,
    writer: Arc<FrameWriter>,
    events_tx: broadcast::Sender<EventLine>,
    /// Receiver created before the stdout reader starts, so the first
    /// subscriber sees every line from the very beginning.
    initial_rx: StdMutex<Option<broadcast::Receiver<EventLine>>>,
    reader_tasks: Vec<tokio::task::JoinHandle<()>>,
    forwarder: Option<tokio::task::JoinHandle<()>>,
    pid: Option<u32>,
}

impl WorkerSupervisor {
    /// Spawn the worker and start the stdout/stderr reader tasks and the
    /// audio forwarder. The child is killed on drop, so a cancelled owner
    /// can never leak a zombie.
    pub async fn start(command: WorkerCommand, hooks: WorkerHooks) -> Result<Self, WorkerError> {
        let program = command.argv.first().ok_or(WorkerError::EmptyArgv)?.clone();

        let mut cmd = Command::new(&program);
        cmd.args(&command.argv[1..])
            .current_dir(&command.cwd)
            .envs(command.env.iter().cloned())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| WorkerError::Spawn {
            path: PathBuf::from(&program),
            source,
        })?;
        let stdin = child.stdin.take().ok_or(WorkerError::StdioMissing("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(WorkerError::StdioMissing("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(WorkerError::StdioMissing("stderr"))?;
        let pid = child.id();

        tracing::info!(?pid, program = %program, "worker spawned");

        let (audio_tx, audio_rx) = mpsc::channel::<WriteJob>(AUDIO_IN_FLIGHT);
        let shared = Arc::new(WriterShared {
            slot: TokioMutex::new(StdinSlot {
                stdin: Some(stdin),
                failed: false,
                on_write_error: hooks.on_write_error,
            }),
            failed: AtomicBool::new(false),
        });
        let writer = Arc::new(FrameWriter {
            shared: Arc::clone(&shared),
            audio_tx,
            dropped_audio: AtomicU64::new(0),
        });

        let forwarder = tokio::spawn(forward_audio(shared, audio_rx));

        let mut reader_tasks = Vec::with_capacity(2);
        let (events_tx, events_rx) = broadcast::channel::<EventLine>(EVENT_STREAM_CAPACITY);
        reader_tasks.push(tokio::spawn(read_stdout(
            stdout,
            hooks.on_event_line,
            events_tx.clone(),
        )));

        // Drain stderr so the worker can't block, and surface each line.
        let on_stderr = hooks.on_stderr_line;
        reader_tasks.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!("[worker stderr] {line}");
                if let Some(cb) = on_stderr.as_ref() {
                    cb(&line);
                }
            }
        }));

        Ok(Self {
            child: TokioMutex::new(Some(child)),
            exit_code: StdMutex::new(None),
            writer,
            events_tx,
            initial_rx: StdMutex::new(Some(events_rx)),
            reader_tasks,
            forwarder: Some(forwarder),
            pid,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn writer(&self) -> Arc<FrameWriter> {
        Arc::clone(&self.writer)
    }

    /// Bounded async stream of stdout event lines. A receiver that falls
    /// more than the capacity behind loses the oldest lines first. The first
    /// call returns a receiver that predates the reader task and therefore
    /// misses nothing.
    pub fn subscribe(&self) -> broadcast::Receiver<EventLine> {
        self.initial_rx
            .lock()
            .expect("initial_rx lock")
            .take()
            .unwrap_or_else(|| self.events_tx.subscribe())
    }

    pub fn send_audio(&self, frame: Frame) {
        self.writer.send_audio(frame);
    }

    pub async fn send_control(&self, frame: Frame) -> Result<(), WorkerError> {
        self.writer.send_control(frame).await
    }

    /// Drain buffered frames and close stdin, letting the worker run to a
    /// graceful exit.
    pub async fn request_stop(&self) {
        self.writer.close().await;
    }

    /// Wait up to `timeout` for the worker to exit. Returns the exit code,
    /// or `None` on timeout. The stdout reader keeps running throughout.
    pub async fn wait_for_exit(&self, timeout: Duration) -> Option<i32> {
        if let Some(code) = *self.exit_code.lock().expect("exit_code lock") {
            return Some(code);
        }
        let mut guard = self.child.lock().await;
        let Some(child) = guard.as_mut() else {
            return *self.exit_code.lock().expect("exit_code lock");
        };
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                let code = status.code().unwrap_or(-1);
                *self.exit_code.lock().expect("exit_code lock") = Some(code);
                tracing::info!(code, "worker exited");
                Some(code)
            }
            Ok(Err(e)) => {
                tracing::error!("worker wait failed: {e}");
                None
            }
            Err(_) => None,
        }
    }

    /// Force-kill the worker. Idempotent: terminating an already-dead child
    /// is a no-op.
    pub async fn terminate(&self) {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            if let Err(e) = child.start_kill() {
                tracing::debug!("terminate: {e}");
            }
            if let Ok(status) = child.wait().await {
                *self.exit_code.lock().expect("exit_code lock") =
                    Some(status.code().unwrap_or(-1));
            }
        }
    }

    /// Release pipes and reader tasks. Call after exit has been observed.
    /// The readers are given time to drain to EOF first so event lines the
    /// worker flushed on the way out are never lost.
    pub async fn cleanup(&mut self) {
        self.writer.close().await;
        for task in self.reader_tasks.drain(..) {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                tracing::warn!("worker pipe reader did not reach EOF in time");
            }
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        *self.child.lock().await = None;
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock().expect("exit_code lock")
    }
}

async fn forward_audio(shared: Arc<WriterShared>, mut rx: mpsc::Receiver<WriteJob>) {
    while let Some(job) = rx.recv().await {
        match job {
            WriteJob::Frame(frame) => {
                let _ = shared.write_locked(&frame).await;
            }
            WriteJob::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

async fn read_stdout(
    stdout: tokio::process::ChildStdout,
    on_line: Option<Arc<dyn Fn(&EventLine) + Send + Sync>>,
    events_tx: broadcast::Sender<EventLine>,
) {
    let mut reader = BufReader::new(stdout);
    let mut splitter = EventLineBuffer::new();
    let mut chunk = [0u8; 8192];

    let mut deliver = |result: Result<EventLine, crate::error::CodecError>| match result {
        Ok(line) => {
            if line.truncated {
                tracing::error!(len = line.text.len(), "worker event line truncated at cap");
            }
            if let Some(cb) = on_line.as_ref() {
                cb(&line);
            }
            let _ = events_tx.send(line);
        }
        Err(e) => {
            tracing::error!("worker event line dropped: {e}");
        }
    };

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                for line in splitter.push(&chunk[..n]) {
                    deliver(line);
                }
            }
            Err(e) => {
                tracing::error!("worker stdout read failed: {e}");
                break;
            }
        }
    }
    if let Some(tail) = splitter.finish() {
        deliver(tail);
    }
    tracing::debug!("worker stdout closed");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
