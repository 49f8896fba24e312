//! Meeting capture core.
//!
//! Captures two audio streams (system audio and microphone) from an OS
//! capture session, frames them over a worker process's stdin, ingests the
//! worker's structured transcript events, and persists meetings on disk
//! across multiple recording sessions.
//!
//! The OS capture layer, the ASR/diarisation worker binary, and UI rendering
//! are external collaborators; see [`capture::CaptureBackend`] and
//! [`worker::WorkerCommand`] for the seams.

pub mod backend_log;
pub mod capture;
pub mod controller;
pub mod error;
pub mod events;
pub mod frame;
pub mod ingest;
pub mod logger;
pub mod naming;
pub mod pcm;
pub mod reprocess;
pub mod screenshot;
pub mod store;
pub mod worker;

pub use capture::{CaptureBackend, CaptureEngine, ContentFilter, StreamFormat};
pub use controller::{ControllerConfig, SessionController};
pub use error::{
    CaptureError, CodecError, ControllerError, ExtractError, StoreError, WorkerError,
};
pub use events::{TranscriptStream, WorkerEvent};
pub use frame::{Frame, FrameType, StreamId};
pub use ingest::{TranscriptIngestor, TranscriptSegment, TranscriptSnapshot};
pub use store::{Meeting, MeetingStore, MeetingStatus};
pub use worker::{WorkerCommand, WorkerSupervisor};

/// Ignore SIGPIPE for the whole process, once. A worker that dies mid-write
/// must surface as an `EPIPE` write error, not terminate the host.
pub fn install_sigpipe_ignore() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        #[cfg(unix)]
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }
    });
}
