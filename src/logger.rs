//! Process-wide tracing setup.
//!
//! One daily-rotated file under `<data dir>/confab/logs/` (seven days kept)
//! plus stdout. Per-meeting diagnostics live elsewhere; see `backend_log`.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_RETENTION_DAYS: usize = 7;

/// Keeps the non-blocking file writer alive; hold it until shutdown.
pub struct LogGuard {
    _worker: WorkerGuard,
}

/// Install the global subscriber. `RUST_LOG` overrides the `info` default.
pub fn init_logging() -> Result<LogGuard, Box<dyn std::error::Error>> {
    let dir = crate::store::MeetingStore::default_base().join("logs");
    std::fs::create_dir_all(&dir)?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("confab")
        .filename_suffix("log")
        .max_log_files(LOG_RETENTION_DAYS)
        .build(&dir)?;
    let (file_writer, worker) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stdout))
        .init();

    tracing::info!(dir = %dir.display(), "logging ready");
    Ok(LogGuard { _worker: worker })
}
