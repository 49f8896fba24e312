//! Post-hoc batch re-diarisation: a separate worker invocation run against
//! an existing meeting folder.
//!
//! The live recording pipeline is untouched; this module only owns the
//! child process and the §6.2-grammar stdout stream of the reprocess run.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex as TokioMutex;
use tokio_util::sync::CancellationToken;

use crate::events::{parse_event, ReprocessResult, ReprocessStage, WorkerEvent};
use crate::worker::WorkerCommand;

/// Ceiling on a whole reprocess invocation.
pub const BATCH_REPROCESS_TIMEOUT: Duration = Duration::from_secs(3600);

/// Which stream(s) to re-diarise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReprocessStreams {
    System,
    Mic,
    Both,
}

impl ReprocessStreams {
    pub fn as_arg(self) -> &'static str {
        match self {
            ReprocessStreams::System => "system",
            ReprocessStreams::Mic => "mic",
            ReprocessStreams::Both => "both",
        }
    }
}

/// Runs at most one reprocess child at a time. The child handle lives in a
/// mutex-guarded `Option` so a cancellation handler can take it and kill it
/// regardless of where the reader loop is suspended.
#[derive(Default)]
pub struct BatchRediarizer {
    child: TokioMutex<Option<Child>>,
}

impl BatchRediarizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Launch the reprocess invocation and read events until a terminal
    /// `result` or `error`. Stage updates are forwarded to `on_stage`.
    ///
    /// Cancellation via `cancel` terminates the child and releases its pipes
    /// before this returns; the same holds for the 3600 s ceiling.
    pub async fn run(
        &self,
        worker: &WorkerCommand,
        meeting_folder: &Path,
        streams: ReprocessStreams,
        cancel: &CancellationToken,
        mut on_stage: impl FnMut(ReprocessStage) + Send,
    ) -> Result<ReprocessResult> {
        let program = worker
            .argv
            .first()
            .context("reprocess worker argv is empty")?;

        {
            let guard = self.child.lock().await;
            if guard.is_some() {
                bail!("a reprocess invocation is already running");
            }
        }

        let mut cmd = Command::new(program);
        cmd.args(&worker.argv[1..])
            .arg("reprocess")
            .arg("--stream")
            .arg(streams.as_arg())
            .arg(meeting_folder)
            .current_dir(&worker.cwd)
            .envs(worker.env.iter().cloned())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().context("failed to spawn reprocess worker")?;
        let stdout = child.stdout.take().context("missing reprocess stdout")?;
        let stderr = child.stderr.take().context("missing reprocess stderr")?;
        tracing::info!(folder = %meeting_folder.display(), stream = streams.as_arg(), "reprocess started");

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!("[reprocess stderr] {line}");
            }
        });

        *self.child.lock().await = Some(child);

        let read_result = async {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await.context("reprocess stdout read")? {
                let event = match parse_event(&line) {
                    Ok(ev) => ev,
                    Err(e) => {
                        tracing::warn!("reprocess line ignored: {e}");
                        continue;
                    }
                };
                match event {
                    WorkerEvent::Status(status) => {
                        if let Some(stage) = status.stage {
                            on_stage(stage);
                        } else if !status.message.is_empty() {
                            tracing::info!("reprocess: {}", status.message);
                        }
                    }
                    WorkerEvent::Result(result) => return Ok(result),
                    WorkerEvent::Error { message } => {
                        bail!("reprocess worker reported an error: {message}")
                    }
                    _ => {}
                }
            }
            bail!("reprocess worker exited without a result")
        };

        let outcome = tokio::select! {
            result = read_result => result,
            _ = cancel.cancelled() => {
                self.kill_active().await;
                bail!("reprocess cancelled")
            }
            _ = tokio::time::sleep(BATCH_REPROCESS_TIMEOUT) => {
                self.kill_active().await;
                bail!("reprocess timed out")
            }
        };

        // Reap the child whether the grammar ended in result or error.
        self.kill_active().await;
        outcome
    }

    pub async fn is_running(&self) -> bool {
        self.child.lock().await.is_some()
    }

    /// Take the child, terminate it and reap it. Idempotent.
    async fn kill_active(&self) {
        let taken = self.child.lock().await.take();
        if let Some(mut child) = taken {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }

    /// External cancellation entry point, for callers that hold only the
    /// rediarizer and not the token.
    pub async fn cancel_active(&self) {
        self.kill_active().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh_worker(script: &str) -> WorkerCommand {
        // The scripted worker swallows the appended reprocess argv.
        WorkerCommand {
            argv: vec!["/bin/sh".into(), "-c".into(), script.into(), "sh".into()],
            cwd: std::env::temp_dir(),
            env: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_run_collects_stages_and_result() {
        let script = concat!(
            "printf '{\"type\":\"status\",\"stage\":\"preparing\"}\\n';",
            "printf '{\"type\":\"status\",\"stage\":\"complete\"}\\n';",
            "printf '{\"type\":\"result\",\"turns\":[{\"speaker_id\":\"SPK0\",\"stream\":\"system\",\"t0\":0.5,\"t1\":2.0,\"text\":\"hello\"}],\"speakers\":[\"SPK0\"],\"duration\":12.0}\\n'",
        );
        let rediarizer = BatchRediarizer::new();
        let cancel = CancellationToken::new();
        let mut stages = Vec::new();

        let result = rediarizer
            .run(
                &sh_worker(script),
                Path::new("/tmp"),
                ReprocessStreams::Both,
                &cancel,
                |stage| stages.push(stage),
            )
            .await
            .expect("reprocess result");

        assert_eq!(
            stages,
            vec![ReprocessStage::Preparing, ReprocessStage::Complete]
        );
        assert_eq!(result.turns.len(), 1);
        assert_eq!(result.duration, 12.0);
        assert!(!rediarizer.is_running().await);
    }

    #[tokio::test]
    async fn test_worker_error_event_fails_the_run() {
        let rediarizer = BatchRediarizer::new();
        let cancel = CancellationToken::new();
        let err = rediarizer
            .run(
                &sh_worker("printf '{\"type\":\"error\",\"message\":\"no audio\"}\\n'"),
                Path::new("/tmp"),
                ReprocessStreams::Mic,
                &cancel,
                |_| {},
            )
            .await
            .expect_err("error event should fail");
        assert!(err.to_string().contains("no audio"));
    }

    #[tokio::test]
    async fn test_cancellation_kills_the_child() {
        let rediarizer = BatchRediarizer::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = rediarizer
            .run(
                &sh_worker("sleep 30"),
                Path::new("/tmp"),
                ReprocessStreams::System,
                &cancel,
                |_| {},
            )
            .await
            .expect_err("cancelled run should fail");
        assert!(err.to_string().contains("cancelled"));
        assert!(!rediarizer.is_running().await);
    }

    #[tokio::test]
    async fn test_exit_without_result_is_an_error() {
        let rediarizer = BatchRediarizer::new();
        let cancel = CancellationToken::new();
        let err = rediarizer
            .run(
                &sh_worker("printf '{\"type\":\"status\",\"message\":\"bye\"}\\n'"),
                Path::new("/tmp"),
                ReprocessStreams::Both,
                &cancel,
                |_| {},
            )
            .await
            .expect_err("missing result should fail");
        assert!(err.to_string().contains("without a result"));
    }
}
