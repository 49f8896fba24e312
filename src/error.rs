//! Error taxonomy for the capture core.
//!
//! Steady-state capture callbacks never propagate errors across thread
//! boundaries; they record and continue. Everything that can fail a
//! start/stop/resume surfaces as one of the structured types below.

use std::path::PathBuf;

/// Binary frame and event-line codec failures.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The input ended inside a header or payload.
    #[error("frame truncated")]
    FrameTruncated,

    /// Declared payload length exceeds the hard cap.
    #[error("payload of {0} bytes exceeds cap")]
    PayloadTooLarge(usize),

    /// Header carried a type byte outside the known range.
    #[error("unknown frame type {0}")]
    UnknownFrameType(u8),

    /// Header carried a stream byte outside the known range.
    #[error("unknown stream id {0}")]
    UnknownStreamId(u8),

    /// An event line was not valid UTF-8. Applies to lines only, never to
    /// frame payloads.
    #[error("event line is not valid UTF-8")]
    NonUtf8,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Sample-buffer extraction failures.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("sample buffer carries no format description")]
    MissingFormat,

    #[error("unsupported PCM layout: float={is_float} bits={bits}")]
    UnsupportedFormat { is_float: bool, bits: u16 },

    #[error("buffer list error: {0}")]
    BufferListError(String),
}

/// Capture session failures, raised by backends and by the engine itself.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("screen capture permission denied")]
    PermissionDenied,

    #[error("invalid content filter: {0}")]
    InvalidFilter(String),

    #[error("capture backend failure: {0}")]
    Backend(String),

    #[error("capture engine is not running")]
    NotRunning,

    #[error("capture engine is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Worker process lifecycle failures.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker argv is empty")]
    EmptyArgv,

    #[error("failed to spawn worker {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("worker stdio pipe missing: {0}")]
    StdioMissing(&'static str),

    #[error("worker stdin write failed: {0}")]
    Write(#[source] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// On-disk meeting store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("meeting folder not found: {0}")]
    NotFound(PathBuf),

    #[error("meeting metadata is invalid: {0}")]
    InvalidMetadata(#[source] serde_json::Error),

    #[error("failed to move meeting to trash: {0}")]
    Trash(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Session controller failures. A failed start tears down everything it
/// already brought up; there is no partial running state.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("a recording is already in progress")]
    AlreadyRecording,

    #[error("no recording is in progress")]
    NotRecording,

    #[error("meeting is currently recording and cannot be deleted")]
    DeleteActive,

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
