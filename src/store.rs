//! Durable on-disk meeting model.
//!
//! Layout under `<base>/Meetings/<folder>/`:
//!
//! ```text
//! meeting.json
//! audio/                    session 1
//! audio-session-N/          session N >= 2
//! screenshots/              when video mode was on
//! backend.log
//! transcript_events.jsonl   append-only stream of raw worker events
//! transcript.jsonl          finals only, written at stop
//! transcript.txt            human-readable, written at stop
//! ```
//!
//! Metadata writes are atomic (temp file + rename) and the store never holds
//! a file handle beyond one write.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::capture::StreamFormat;
use crate::error::StoreError;
use crate::ingest::TranscriptSegment;

pub const MEETING_FILE: &str = "meeting.json";
pub const EVENTS_FILE: &str = "transcript_events.jsonl";
pub const TRANSCRIPT_JSONL: &str = "transcript.jsonl";
pub const TRANSCRIPT_TXT: &str = "transcript.txt";
pub const BACKEND_LOG_FILE: &str = "backend.log";
pub const SCREENSHOTS_DIR: &str = "screenshots";

const SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeetingStatus {
    Recording,
    Completed,
}

/// Per-stream format record for one session; `None` until detected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStreams {
    pub system: Option<StreamFormat>,
    pub mic: Option<StreamFormat>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub session_id: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub audio_folder: String,
    pub streams: SessionStreams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meeting {
    pub version: u32,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub last_timestamp: f64,
    pub status: MeetingStatus,
    pub sessions: Vec<SessionMeta>,
    pub segment_count: usize,
    pub speaker_names: BTreeMap<String, String>,
}

impl Meeting {
    pub fn next_session_id(&self) -> u32 {
        self.sessions.iter().map(|s| s.session_id).max().unwrap_or(0) + 1
    }

    /// `audio` for the first session, `audio-session-N` for resumes.
    pub fn audio_folder_name(session_id: u32) -> String {
        if session_id <= 1 {
            "audio".to_string()
        } else {
            format!("audio-session-{session_id}")
        }
    }

    pub fn is_recording(&self) -> bool {
        self.status == MeetingStatus::Recording
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct MeetingStore {
    base: PathBuf,
}

impl MeetingStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// `<data dir>/confab`, falling back to the current directory.
    pub fn default_base() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("confab")
    }

    pub fn meetings_dir(&self) -> PathBuf {
        self.base.join("Meetings")
    }

    pub fn meeting_path(&self, folder: &str) -> PathBuf {
        self.meetings_dir().join(folder)
    }

    /// Create a new meeting folder with its first session. The folder name
    /// is the sanitised title, suffixed `-01`, `-02`, … on collision.
    pub fn create(
        &self,
        title: &str,
        started_at: DateTime<Utc>,
    ) -> Result<(String, Meeting), StoreError> {
        let folder = self.unique_folder_name(title)?;
        let path = self.meeting_path(&folder);
        std::fs::create_dir_all(path.join(Meeting::audio_folder_name(1)))?;

        let meeting = Meeting {
            version: SCHEMA_VERSION,
            title: title.to_string(),
            created_at: started_at,
            updated_at: started_at,
            duration_seconds: 0.0,
            last_timestamp: 0.0,
            status: MeetingStatus::Recording,
            sessions: vec![SessionMeta {
                session_id: 1,
                started_at,
                ended_at: None,
                audio_folder: Meeting::audio_folder_name(1),
                streams: SessionStreams::default(),
            }],
            segment_count: 0,
            speaker_names: BTreeMap::new(),
        };
        self.write(&folder, &meeting)?;
        tracing::info!(folder = %folder, "meeting created");
        Ok((folder, meeting))
    }

    pub fn read(&self, folder: &str) -> Result<Meeting, StoreError> {
        let path = self.meeting_path(folder);
        let file = path.join(MEETING_FILE);
        if !file.exists() {
            return Err(StoreError::NotFound(path));
        }
        let data = std::fs::read_to_string(file)?;
        serde_json::from_str(&data).map_err(StoreError::InvalidMetadata)
    }

    /// Atomic metadata write with sorted object keys.
    pub fn write(&self, folder: &str, meeting: &Meeting) -> Result<(), StoreError> {
        let path = self.meeting_path(folder);
        std::fs::create_dir_all(&path)?;
        // Round-tripping through Value sorts the keys for stable diffs.
        let value = serde_json::to_value(meeting).map_err(StoreError::InvalidMetadata)?;
        let rendered = serde_json::to_string_pretty(&value).map_err(StoreError::InvalidMetadata)?;
        write_atomic(&path, MEETING_FILE, rendered.as_bytes())?;
        Ok(())
    }

    /// Append a session for a resume: creates the session's audio folder and
    /// flips the meeting back to `recording`.
    pub fn append_session(
        &self,
        folder: &str,
        session: SessionMeta,
    ) -> Result<Meeting, StoreError> {
        let mut meeting = self.read(folder)?;
        std::fs::create_dir_all(self.meeting_path(folder).join(&session.audio_folder))?;
        meeting.updated_at = session.started_at;
        meeting.status = MeetingStatus::Recording;
        meeting.sessions.push(session);
        self.write(folder, &meeting)?;
        Ok(meeting)
    }

    /// Record detected formats against the open session.
    pub fn update_open_session_streams(
        &self,
        folder: &str,
        streams: SessionStreams,
    ) -> Result<(), StoreError> {
        let mut meeting = self.read(folder)?;
        if let Some(session) = meeting.sessions.iter_mut().find(|s| s.ended_at.is_none()) {
            session.streams = streams;
        }
        self.write(folder, &meeting)
    }

    /// Close the open session, roll up durations and counts, and mark the
    /// meeting completed.
    pub fn finalise(
        &self,
        folder: &str,
        finals: &[TranscriptSegment],
    ) -> Result<Meeting, StoreError> {
        let mut meeting = self.read(folder)?;
        let now = Utc::now();

        let last_timestamp = finals
            .iter()
            .map(|s| s.t1.unwrap_or(s.t0))
            .fold(meeting.last_timestamp, f64::max);

        if let Some(session) = meeting.sessions.iter_mut().find(|s| s.ended_at.is_none()) {
            session.ended_at = Some(now);
        }
        let wall_seconds: f64 = meeting
            .sessions
            .iter()
            .filter_map(|s| s.ended_at.map(|end| (end - s.started_at).num_milliseconds()))
            .map(|ms| ms.max(0) as f64 / 1000.0)
            .sum();

        meeting.updated_at = now;
        meeting.status = MeetingStatus::Completed;
        meeting.last_timestamp = last_timestamp;
        meeting.duration_seconds = wall_seconds.max(last_timestamp);
        meeting.segment_count = finals.len();
        self.write(folder, &meeting)?;
        tracing::info!(folder = %folder, segments = finals.len(), "meeting finalised");
        Ok(meeting)
    }

    /// Close the open session without touching durations or counters. Used
    /// when a start sequence fails after the session was appended.
    pub fn abort_open_session(&self, folder: &str) -> Result<(), StoreError> {
        let mut meeting = self.read(folder)?;
        let now = Utc::now();
        if let Some(session) = meeting.sessions.iter_mut().find(|s| s.ended_at.is_none()) {
            session.ended_at = Some(now);
        }
        meeting.status = MeetingStatus::Completed;
        meeting.updated_at = now;
        self.write(folder, &meeting)
    }

    /// Update the display title. The folder name is stable.
    pub fn rename(&self, folder: &str, title: &str) -> Result<(), StoreError> {
        let mut meeting = self.read(folder)?;
        meeting.title = title.to_string();
        meeting.updated_at = Utc::now();
        self.write(folder, &meeting)
    }

    pub fn persist_speaker_names(
        &self,
        folder: &str,
        names: &BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let mut meeting = self.read(folder)?;
        meeting.speaker_names = names.clone();
        meeting.updated_at = Utc::now();
        self.write(folder, &meeting)
    }

    /// Move the whole meeting folder to the OS trash, recoverably.
    pub fn trash(&self, folder: &str) -> Result<(), StoreError> {
        let path = self.meeting_path(folder);
        if !path.exists() {
            return Err(StoreError::NotFound(path));
        }
        trash::delete(&path).map_err(|e| StoreError::Trash(e.to_string()))?;
        tracing::info!(folder = %folder, "meeting moved to trash");
        Ok(())
    }

    /// All meetings, newest first. Folders predating `meeting.json` are
    /// migrated in place before listing.
    pub fn list(&self) -> Result<Vec<(String, Meeting)>, StoreError> {
        let dir = self.meetings_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut meetings = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let folder = entry.file_name().to_string_lossy().to_string();
            let meeting = match self.read(&folder) {
                Ok(meeting) => meeting,
                Err(StoreError::NotFound(_)) => match self.migrate_legacy(&folder) {
                    Ok(meeting) => meeting,
                    Err(e) => {
                        tracing::warn!(folder = %folder, "skipping unreadable meeting: {e}");
                        continue;
                    }
                },
                Err(e) => {
                    tracing::warn!(folder = %folder, "skipping unreadable meeting: {e}");
                    continue;
                }
            };
            meetings.push((folder, meeting));
        }
        meetings.sort_by(|a, b| b.1.created_at.cmp(&a.1.created_at));
        Ok(meetings)
    }

    /// Synthesise `meeting.json` for a folder recorded before the schema
    /// existed.
    pub fn migrate_legacy(&self, folder: &str) -> Result<Meeting, StoreError> {
        let path = self.meeting_path(folder);
        if !path.is_dir() {
            return Err(StoreError::NotFound(path));
        }

        let title = read_legacy_title(&path).unwrap_or_else(|| folder.to_string());
        let created_at = folder_created_at(&path);
        let updated_at = newest_artifact_mtime(&path).unwrap_or(created_at);
        let (segment_count, last_timestamp) = legacy_segment_stats(&path);

        let meeting = Meeting {
            version: SCHEMA_VERSION,
            title,
            created_at,
            updated_at,
            duration_seconds: last_timestamp,
            last_timestamp,
            status: MeetingStatus::Completed,
            sessions: vec![SessionMeta {
                session_id: 1,
                started_at: created_at,
                ended_at: Some(updated_at),
                audio_folder: Meeting::audio_folder_name(1),
                streams: SessionStreams::default(),
            }],
            segment_count,
            speaker_names: BTreeMap::new(),
        };
        self.write(folder, &meeting)?;
        tracing::info!(folder = %folder, "legacy meeting folder migrated");
        Ok(meeting)
    }

    /// Read back the finals of `transcript.jsonl`, e.g. to carry the
    /// transcript across a resume. Missing file yields an empty list.
    pub fn read_transcript(&self, folder: &str) -> Result<Vec<TranscriptSegment>, StoreError> {
        let path = self.meeting_path(folder).join(TRANSCRIPT_JSONL);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(path)?;
        let mut finals = Vec::new();
        for line in data.lines() {
            let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
                continue;
            };
            let stream = value
                .get("stream")
                .cloned()
                .and_then(|s| serde_json::from_value(s).ok())
                .unwrap_or_default();
            finals.push(TranscriptSegment {
                speaker_id: value
                    .get("speaker_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                stream,
                t0: value.get("t0").and_then(|v| v.as_f64()).unwrap_or(0.0),
                t1: value.get("t1").and_then(|v| v.as_f64()),
                text: value
                    .get("text")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                partial: false,
            });
        }
        Ok(finals)
    }

    /// Write `transcript.jsonl` and `transcript.txt` into the meeting folder.
    pub fn write_transcripts(
        &self,
        folder: &str,
        finals: &[TranscriptSegment],
        names: &BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        write_transcript_files(&self.meeting_path(folder), finals, names)
    }

    fn unique_folder_name(&self, title: &str) -> Result<String, StoreError> {
        let stem = sanitize_title(title);
        let dir = self.meetings_dir();
        std::fs::create_dir_all(&dir)?;
        if !dir.join(&stem).exists() {
            return Ok(stem);
        }
        for i in 1..1000 {
            let candidate = format!("{stem}-{i:02}");
            if !dir.join(&candidate).exists() {
                return Ok(candidate);
            }
        }
        Err(StoreError::Io(std::io::Error::other(
            "could not find a unique meeting folder name",
        )))
    }
}

// ---------------------------------------------------------------------------
// Transcript files
// ---------------------------------------------------------------------------

/// Write both transcript artefacts into `dir`. Also used for the secondary
/// copy placed in a fresh temp folder at stop.
pub fn write_transcript_files(
    dir: &Path,
    finals: &[TranscriptSegment],
    names: &BTreeMap<String, String>,
) -> Result<(), StoreError> {
    std::fs::create_dir_all(dir)?;

    let mut jsonl = String::new();
    for seg in finals {
        let obj = serde_json::json!({
            "speaker_id": seg.speaker_id,
            "stream": seg.stream,
            "t0": seg.t0,
            "t1": seg.t1,
            "text": seg.text,
        });
        jsonl.push_str(&obj.to_string());
        jsonl.push('\n');
    }
    write_atomic(dir, TRANSCRIPT_JSONL, jsonl.as_bytes())?;

    let mut txt = String::new();
    for seg in finals {
        let name = names
            .get(&seg.speaker_id)
            .map(String::as_str)
            .unwrap_or(&seg.speaker_id);
        match seg.stream.tag() {
            Some(tag) => {
                txt.push_str(&format!("[{tag}] t={:.2}s {name}: {}\n", seg.t0, seg.text))
            }
            None => txt.push_str(&format!("t={:.2}s {name}: {}\n", seg.t0, seg.text)),
        }
    }
    write_atomic(dir, TRANSCRIPT_TXT, txt.as_bytes())?;
    Ok(())
}

fn write_atomic(dir: &Path, file_name: &str, data: &[u8]) -> Result<(), StoreError> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.persist(dir.join(file_name))
        .map_err(|e| StoreError::Io(e.error))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Folder naming and legacy helpers
// ---------------------------------------------------------------------------

/// Keep letters, digits, spaces, dots, dashes and underscores; everything
/// else becomes a dash. An empty result falls back to "Meeting".
pub fn sanitize_title(title: &str) -> String {
    let cleaned: String = title
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, ' ' | '.' | '-' | '_') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let cleaned = cleaned.trim().trim_matches('.').to_string();
    if cleaned.is_empty() {
        "Meeting".to_string()
    } else {
        cleaned
    }
}

fn read_legacy_title(path: &Path) -> Option<String> {
    let data = std::fs::read_to_string(path.join("meta.json")).ok()?;
    let value: serde_json::Value = serde_json::from_str(&data).ok()?;
    value
        .get("title")
        .and_then(|t| t.as_str())
        .filter(|t| !t.trim().is_empty())
        .map(|t| t.to_string())
}

fn folder_created_at(path: &Path) -> DateTime<Utc> {
    std::fs::metadata(path)
        .ok()
        .and_then(|m| m.created().or_else(|_| m.modified()).ok())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(Utc::now)
}

fn newest_artifact_mtime(path: &Path) -> Option<DateTime<Utc>> {
    let mut newest: Option<std::time::SystemTime> = None;
    let entries = std::fs::read_dir(path).ok()?;
    for entry in entries.flatten() {
        if let Ok(meta) = entry.metadata() {
            if let Ok(modified) = meta.modified() {
                newest = Some(newest.map_or(modified, |n| n.max(modified)));
            }
        }
    }
    newest.map(DateTime::<Utc>::from)
}

/// Count finals and find the last end timestamp from `transcript.jsonl`, or
/// from `transcript_events.jsonl` filtered to segment events.
fn legacy_segment_stats(path: &Path) -> (usize, f64) {
    let from_file = |file: &str, require_segment_type: bool| -> Option<(usize, f64)> {
        let data = std::fs::read_to_string(path.join(file)).ok()?;
        let mut count = 0usize;
        let mut last = 0.0f64;
        for line in data.lines() {
            let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
                continue;
            };
            if require_segment_type
                && value.get("type").and_then(|t| t.as_str()) != Some("segment")
            {
                continue;
            }
            count += 1;
            let end = value
                .get("t1")
                .and_then(|v| v.as_f64())
                .or_else(|| value.get("t0").and_then(|v| v.as_f64()))
                .unwrap_or(0.0);
            last = last.max(end);
        }
        Some((count, last))
    };

    from_file(TRANSCRIPT_JSONL, false)
        .or_else(|| from_file(EVENTS_FILE, true))
        .unwrap_or((0, 0.0))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
