//! Worker → host event grammar.
//!
//! The worker emits one JSON object per stdout line. Recognised `type`
//! values are parsed into [`WorkerEvent`]; everything else is carried as
//! [`WorkerEvent::Other`] so callers can still stream the raw line to
//! `transcript_events.jsonl`.

use serde::{Deserialize, Serialize};

/// Stream attribution of a transcript segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptStream {
    System,
    Mic,
    #[default]
    Unknown,
}

impl TranscriptStream {
    /// Tag rendered in `transcript.txt`, omitted for unknown streams.
    pub fn tag(self) -> Option<&'static str> {
        match self {
            TranscriptStream::System => Some("system"),
            TranscriptStream::Mic => Some("mic"),
            TranscriptStream::Unknown => None,
        }
    }
}

impl std::fmt::Display for TranscriptStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranscriptStream::System => write!(f, "system"),
            TranscriptStream::Mic => write!(f, "mic"),
            TranscriptStream::Unknown => write!(f, "unknown"),
        }
    }
}

/// Fields shared by `segment` and `partial` events.
#[derive(Debug, Clone, Deserialize)]
pub struct SegmentEvent {
    #[serde(default)]
    pub speaker_id: String,
    #[serde(default)]
    pub stream: TranscriptStream,
    pub t0: f64,
    #[serde(default)]
    pub t1: Option<f64>,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpeakerEntry {
    pub speaker_id: String,
    pub name: String,
}

/// Progress stages of a batch reprocess invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReprocessStage {
    Preparing,
    Transcribing,
    Diarizing,
    Merging,
    Complete,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusEvent {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub stream: Option<String>,
    #[serde(default)]
    pub turns: Option<u64>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub stage: Option<ReprocessStage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReprocessTurn {
    #[serde(default)]
    pub speaker_id: String,
    #[serde(default)]
    pub stream: TranscriptStream,
    pub t0: f64,
    #[serde(default)]
    pub t1: Option<f64>,
    #[serde(default)]
    pub text: String,
}

/// Final payload of a batch reprocess invocation.
#[derive(Debug, Clone, Deserialize)]
pub struct ReprocessResult {
    pub turns: Vec<ReprocessTurn>,
    #[serde(default)]
    pub speakers: Vec<String>,
    #[serde(default)]
    pub duration: f64,
}

#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Segment(SegmentEvent),
    Partial(SegmentEvent),
    Speakers(Vec<SpeakerEntry>),
    Status(StatusEvent),
    Error { message: String },
    /// Level-meter chatter; ignored by the ingestor but logged.
    Meter,
    /// Terminal payload of a reprocess invocation.
    Result(ReprocessResult),
    /// A well-formed object with an unrecognised `type`.
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum EventParseError {
    #[error("malformed event JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("event object has no string `type` field")]
    MissingType,
}

/// Parse one stdout line into a [`WorkerEvent`].
pub fn parse_event(line: &str) -> Result<WorkerEvent, EventParseError> {
    let value: serde_json::Value = serde_json::from_str(line)?;
    let ty = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(EventParseError::MissingType)?
        .to_string();

    let event = match ty.as_str() {
        "segment" => WorkerEvent::Segment(serde_json::from_value(value)?),
        "partial" => {
            let mut seg: SegmentEvent = serde_json::from_value(value)?;
            // Partials carry no end timestamp.
            seg.t1 = None;
            WorkerEvent::Partial(seg)
        }
        "speakers" => {
            #[derive(Deserialize)]
            struct Known {
                #[serde(default)]
                known: Vec<SpeakerEntry>,
            }
            let known: Known = serde_json::from_value(value)?;
            WorkerEvent::Speakers(known.known)
        }
        "status" => WorkerEvent::Status(serde_json::from_value(value)?),
        "error" => {
            let message = value
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or_default()
                .to_string();
            WorkerEvent::Error { message }
        }
        "meter" => WorkerEvent::Meter,
        "result" => WorkerEvent::Result(serde_json::from_value(value)?),
        _ => WorkerEvent::Other(ty),
    };
    Ok(event)
}
