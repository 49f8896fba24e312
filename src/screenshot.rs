//! Screenshot scheduler: periodically grabs a still frame from the active
//! capture session, persists it as a PNG named by meeting-relative seconds,
//! and tells the worker about it with a SCREENSHOT_EVENT frame.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use crate::capture::{CaptureSessionHandle, FrameSink, StillFrame};
use crate::frame::Frame;

/// Default capture cadence.
pub const SCREENSHOT_INTERVAL: Duration = Duration::from_secs(5);

pub struct ScreenshotScheduler {
    task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
    busy: Arc<AtomicBool>,
}

impl Default for ScreenshotScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl ScreenshotScheduler {
    pub fn new() -> Self {
        Self {
            task: StdMutex::new(None),
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start ticking. Idempotent: a second start while running is a no-op.
    ///
    /// `dir` is the absolute screenshots folder; `rel_dir` is the folder name
    /// as it appears in event payload paths. `start_pts` supplies the meeting
    /// start PTS; ticks before the first audio buffer are skipped.
    pub fn start(
        &self,
        session: Arc<dyn CaptureSessionHandle>,
        dir: PathBuf,
        rel_dir: String,
        sink: Arc<dyn FrameSink>,
        start_pts: impl Fn() -> Option<i64> + Send + Sync + 'static,
        interval: Duration,
    ) {
        let mut task = self.task.lock().expect("scheduler task lock");
        if task.is_some() {
            return;
        }
        let busy = Arc::clone(&self.busy);
        busy.store(false, Ordering::SeqCst);

        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // Swallow the immediate first tick so captures land on the cadence.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                // A tick that fires while a prior capture is outstanding is
                // skipped rather than queued.
                if busy.swap(true, Ordering::SeqCst) {
                    continue;
                }
                let Some(meeting_start) = start_pts() else {
                    busy.store(false, Ordering::SeqCst);
                    continue;
                };

                let session = Arc::clone(&session);
                let dir = dir.clone();
                let rel_dir = rel_dir.clone();
                let sink = Arc::clone(&sink);
                let busy_done = Arc::clone(&busy);
                let capture = tokio::task::spawn_blocking(move || {
                    let result = capture_one(&*session, &dir, &rel_dir, meeting_start, &*sink);
                    busy_done.store(false, Ordering::SeqCst);
                    result
                });
                match capture.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!("screenshot tick failed: {e}"),
                    Err(e) => tracing::warn!("screenshot task join failed: {e}"),
                }
            }
        }));
    }

    /// Stop ticking. Idempotent.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().expect("scheduler task lock").take() {
            task.abort();
        }
        self.busy.store(false, Ordering::SeqCst);
    }
}

impl Drop for ScreenshotScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_one(
    session: &dyn CaptureSessionHandle,
    dir: &std::path::Path,
    rel_dir: &str,
    meeting_start_pts: i64,
    sink: &dyn FrameSink,
) -> anyhow::Result<()> {
    let still = session.capture_still()?;
    let t_seconds = (still.pts_us - meeting_start_pts) as f64 / 1_000_000.0;
    if t_seconds < 0.0 {
        return Ok(());
    }

    let name = screenshot_file_name(t_seconds);
    let path = dir.join(&name);
    write_png(&still, &path)?;

    let rel_path = format!("{rel_dir}/{name}");
    let payload = serde_json::json!({ "t": t_seconds, "path": rel_path });
    let pts_us = still.pts_us - meeting_start_pts;
    sink.send_frame(Frame::screenshot_event(pts_us, payload.to_string().into_bytes()));
    tracing::debug!(t = t_seconds, path = %path.display(), "screenshot captured");
    Ok(())
}

/// `t+%010.3f.png`, e.g. `t+000012.500.png`.
pub(crate) fn screenshot_file_name(t_seconds: f64) -> String {
    format!("t+{:010.3}.png", t_seconds)
}

fn write_png(still: &StillFrame, path: &std::path::Path) -> anyhow::Result<()> {
    let image = image::RgbaImage::from_raw(still.width, still.height, still.rgba.clone())
        .ok_or_else(|| anyhow::anyhow!("still frame size mismatch"))?;
    image.save(path)?;
    Ok(())
}
