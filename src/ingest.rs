//! Transcript ingestor: builds the live transcript from worker events.
//!
//! Maintains the ordered segment list with partial/final reconciliation,
//! deduplicates overlapping finals of the same stream, suppresses mic echoes
//! of system output in both arrival orders, and applies a timestamp offset
//! when a meeting is resumed.
//!
//! The ingestor persists nothing and is mutated from a single task; the
//! owning controller publishes immutable snapshots for the UI.

use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

use serde::Serialize;

use crate::events::{EventParseError, SegmentEvent, TranscriptStream, WorkerEvent};

/// Tolerance for "covers within ε" comparisons.
const MERGE_EPS: f64 = 0.05;

/// Two finals of one stream starting within this window collapse to the
/// newer one.
const CLOSE_START: f64 = 0.12;

/// Fractional overlap (against the shorter duration) that collapses finals.
const OVERLAP_RATIO: f64 = 0.8;

/// Echo candidates must start within this window of each other.
const ECHO_WINDOW: f64 = 1.0;

/// Word-overlap ratio at or above which two texts count as echoes.
const ECHO_WORD_OVERLAP: f64 = 0.7;

// ---------------------------------------------------------------------------
// Segments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptSegment {
    pub speaker_id: String,
    pub stream: TranscriptStream,
    pub t0: f64,
    pub t1: Option<f64>,
    pub text: String,
    pub partial: bool,
}

impl TranscriptSegment {
    /// Identity used by the UI and for deduplication.
    pub fn key(&self) -> (TranscriptStream, i64) {
        (self.stream, (self.t0 * 1000.0).round() as i64)
    }

    fn end(&self) -> f64 {
        self.t1.unwrap_or(self.t0)
    }

    fn duration(&self) -> f64 {
        (self.end() - self.t0).max(0.0)
    }

    /// Whether `self` spans `other` within `eps` on both edges.
    fn covers(&self, other: &TranscriptSegment, eps: f64) -> bool {
        self.t0 - eps <= other.t0 && self.end() + eps >= other.end()
    }
}

fn temporal_overlap(a: &TranscriptSegment, b: &TranscriptSegment) -> f64 {
    a.end().min(b.end()) - a.t0.max(b.t0)
}

fn overlap_ratio(a: &TranscriptSegment, b: &TranscriptSegment) -> f64 {
    let overlap = temporal_overlap(a, b);
    if overlap <= 0.0 {
        return 0.0;
    }
    let shorter = a.duration().min(b.duration());
    if shorter <= 0.0 {
        return 0.0;
    }
    overlap / shorter
}

/// Text similarity for echo decisions: containment of a string of length
/// ≥ 5, or word overlap of at least 0.7 against the smaller word set.
/// Empty strings are never echoes.
pub fn is_echo_of(a: &str, b: &str) -> bool {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if (a.len() >= 5 && b.contains(&a)) || (b.len() >= 5 && a.contains(&b)) {
        return true;
    }
    let words_a: HashSet<&str> = a.split_whitespace().collect();
    let words_b: HashSet<&str> = b.split_whitespace().collect();
    let smaller = words_a.len().min(words_b.len());
    if smaller == 0 {
        return false;
    }
    let intersection = words_a.intersection(&words_b).count();
    intersection as f64 / smaller as f64 >= ECHO_WORD_OVERLAP
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Immutable view published to UI observers.
#[derive(Debug, Clone, Default)]
pub struct TranscriptSnapshot {
    pub segments: Vec<TranscriptSegment>,
    pub speaker_names: BTreeMap<String, String>,
    pub last_text: String,
    pub final_count: usize,
}

// ---------------------------------------------------------------------------
// Ingestor
// ---------------------------------------------------------------------------

pub struct TranscriptIngestor {
    segments: Vec<TranscriptSegment>,
    speaker_names: BTreeMap<String, String>,
    timestamp_offset: f64,
    last_text: String,
    last_ingest: Option<Instant>,
    echo_suppression: bool,
    max_final_t0: f64,
}

impl Default for TranscriptIngestor {
    fn default() -> Self {
        Self::new()
    }
}

impl TranscriptIngestor {
    pub fn new() -> Self {
        Self {
            segments: Vec::new(),
            speaker_names: BTreeMap::new(),
            timestamp_offset: 0.0,
            last_text: String::new(),
            last_ingest: None,
            echo_suppression: true,
            max_final_t0: f64::NEG_INFINITY,
        }
    }

    /// Drop all transcript state. Speaker names survive a reset so a resumed
    /// meeting keeps its renames; call [`clear_speaker_names`] for a fresh
    /// meeting.
    pub fn reset(&mut self) {
        self.segments.clear();
        self.last_text.clear();
        self.last_ingest = None;
        self.timestamp_offset = 0.0;
        self.max_final_t0 = f64::NEG_INFINITY;
    }

    pub fn clear_speaker_names(&mut self) {
        self.speaker_names.clear();
    }

    /// Offset added to every subsequently ingested timestamp; set to the
    /// meeting's `last_timestamp` on resume.
    pub fn set_timestamp_offset(&mut self, offset: f64) {
        self.timestamp_offset = offset;
    }

    pub fn set_echo_suppression(&mut self, enabled: bool) {
        self.echo_suppression = enabled;
    }

    pub fn set_speaker_names(&mut self, names: BTreeMap<String, String>) {
        self.speaker_names = names;
    }

    /// Preload previously finalised segments, e.g. on resume. Segments are
    /// taken as already merged and ordered; they are not re-run through the
    /// merge or echo rules.
    pub fn seed(&mut self, finals: Vec<TranscriptSegment>) {
        for seg in finals {
            if seg.partial {
                continue;
            }
            self.max_final_t0 = self.max_final_t0.max(seg.t0);
            self.segments.push(seg);
        }
        self.sort_segments();
    }

    /// Parse and apply one stdout line.
    pub fn ingest(&mut self, line: &str) -> Result<(), EventParseError> {
        let event = crate::events::parse_event(line)?;
        self.apply(&event);
        Ok(())
    }

    /// Apply an already-parsed event. Unknown types are discarded.
    pub fn apply(&mut self, event: &WorkerEvent) {
        self.last_ingest = Some(Instant::now());
        match event {
            WorkerEvent::Segment(seg) => self.apply_final(seg),
            WorkerEvent::Partial(seg) => self.apply_partial(seg),
            WorkerEvent::Speakers(known) => {
                for entry in known {
                    self.speaker_names
                        .insert(entry.speaker_id.clone(), entry.name.clone());
                }
            }
            WorkerEvent::Status(_) | WorkerEvent::Error { .. } => {}
            WorkerEvent::Meter => {
                tracing::trace!("meter event ignored");
            }
            WorkerEvent::Result(_) | WorkerEvent::Other(_) => {}
        }
    }

    fn apply_final(&mut self, ev: &SegmentEvent) {
        let seg = TranscriptSegment {
            speaker_id: ev.speaker_id.clone(),
            stream: ev.stream,
            t0: ev.t0 + self.timestamp_offset,
            t1: ev.t1.map(|t1| t1 + self.timestamp_offset),
            text: ev.text.clone(),
            partial: false,
        };

        if self.echo_suppression {
            // A mic segment echoing a nearby finalised system segment is
            // presumed speaker leakage and dropped.
            if seg.stream == TranscriptStream::Mic {
                let echoed = self.segments.iter().any(|e| {
                    !e.partial
                        && e.stream == TranscriptStream::System
                        && (e.t0 - seg.t0).abs() < ECHO_WINDOW
                        && is_echo_of(&e.text, &seg.text)
                });
                if echoed {
                    tracing::debug!(t0 = seg.t0, "mic segment dropped as system echo");
                    return;
                }
            } else if seg.stream == TranscriptStream::System {
                // The system side wins in either arrival order.
                self.segments.retain(|e| {
                    let echo = !e.partial
                        && e.stream == TranscriptStream::Mic
                        && (e.t0 - seg.t0).abs() < ECHO_WINDOW
                        && is_echo_of(&e.text, &seg.text);
                    !echo
                });
            }
        }

        // Derived-key identity: a final re-announcing an existing
        // `(stream, round(t0 × 1000))` key is a duplicate, not an update.
        // The overlap-gated merge below cannot catch this for zero-duration
        // finals, whose temporal overlap with their twin is zero.
        if self
            .segments
            .iter()
            .any(|e| !e.partial && e.key() == seg.key())
        {
            return;
        }

        if !self.merge_into_finals(&seg) {
            return;
        }

        // The final supersedes any same-stream partial it covers.
        self.segments.retain(|e| {
            !(e.partial && e.stream == seg.stream && e.t0 <= seg.end() + MERGE_EPS)
        });

        if !seg.text.trim().is_empty() {
            self.last_text = seg.text.clone();
        }

        let in_order = seg.t0 >= self.max_final_t0;
        self.max_final_t0 = self.max_final_t0.max(seg.t0);
        self.segments.push(seg);
        if !in_order {
            self.sort_segments();
        }
    }

    /// Run the same-stream merge rule. Returns false when the incoming
    /// segment loses to an existing, longer final.
    fn merge_into_finals(&mut self, seg: &TranscriptSegment) -> bool {
        let mut keep_incoming = true;
        self.segments.retain(|e| {
            if !keep_incoming || e.partial || e.stream != seg.stream {
                return true;
            }
            if temporal_overlap(e, seg) <= 0.0 {
                return true;
            }
            let existing_wins = e.duration() > seg.duration() + 0.1
                && e.text.len() >= seg.text.len()
                && e.covers(seg, MERGE_EPS);
            if existing_wins {
                keep_incoming = false;
                return true;
            }
            let replace = seg.covers(e, MERGE_EPS)
                || (e.t0 - seg.t0).abs() <= CLOSE_START
                || overlap_ratio(e, seg) >= OVERLAP_RATIO;
            !replace
        });
        keep_incoming
    }

    fn apply_partial(&mut self, ev: &SegmentEvent) {
        let seg = TranscriptSegment {
            speaker_id: ev.speaker_id.clone(),
            stream: ev.stream,
            t0: ev.t0 + self.timestamp_offset,
            t1: None,
            text: ev.text.clone(),
            partial: true,
        };

        // At most one partial per stream: replace it if present.
        self.segments
            .retain(|e| !(e.partial && e.stream == seg.stream));

        if !seg.text.trim().is_empty() {
            self.last_text = seg.text.clone();
        }

        let in_order = self
            .segments
            .last()
            .map(|last| seg.t0 >= last.t0)
            .unwrap_or(true);
        self.segments.push(seg);
        if !in_order {
            self.sort_segments();
        }
    }

    fn sort_segments(&mut self) {
        self.segments
            .sort_by(|a, b| a.t0.partial_cmp(&b.t0).unwrap_or(std::cmp::Ordering::Equal));
    }

    // -- Accessors ---------------------------------------------------------

    pub fn segments(&self) -> &[TranscriptSegment] {
        &self.segments
    }

    pub fn finals(&self) -> Vec<TranscriptSegment> {
        self.segments
            .iter()
            .filter(|s| !s.partial)
            .cloned()
            .collect()
    }

    pub fn final_count(&self) -> usize {
        self.segments.iter().filter(|s| !s.partial).count()
    }

    pub fn speaker_names(&self) -> &BTreeMap<String, String> {
        &self.speaker_names
    }

    /// Display name for a speaker id, falling back to the raw id. Names are
    /// applied at render time; they are never baked into segments.
    pub fn display_name<'a>(&'a self, speaker_id: &'a str) -> &'a str {
        self.speaker_names
            .get(speaker_id)
            .map(String::as_str)
            .unwrap_or(speaker_id)
    }

    pub fn last_text(&self) -> &str {
        &self.last_text
    }

    pub fn last_ingest(&self) -> Option<Instant> {
        self.last_ingest
    }

    /// Largest end timestamp over finals, for meeting metadata.
    pub fn max_final_end(&self) -> f64 {
        self.segments
            .iter()
            .filter(|s| !s.partial)
            .map(|s| s.end())
            .fold(0.0, f64::max)
    }

    pub fn snapshot(&self) -> TranscriptSnapshot {
        TranscriptSnapshot {
            segments: self.segments.clone(),
            speaker_names: self.speaker_names.clone(),
            last_text: self.last_text.clone(),
            final_count: self.final_count(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
