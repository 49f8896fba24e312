//! Binary frame codec for the host → worker stdin stream, plus the
//! line splitter for the worker → host stdout stream.
//!
//! Wire header is exactly 14 bytes, little-endian:
//! `u8 type, u8 stream, i64 pts_us, u32 payload_len`, followed by exactly
//! `payload_len` payload bytes. Payloads are opaque except for the
//! MEETING_START payload and event lines, which are UTF-8 JSON.

use crate::error::CodecError;

pub const HEADER_LEN: usize = 14;

/// Hard cap on a single frame payload.
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Event lines longer than this are truncated and flagged.
pub const MAX_EVENT_LINE_LEN: usize = 1024 * 1024;

// ---------------------------------------------------------------------------
// Wire enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Audio = 1,
    ScreenshotEvent = 2,
    MeetingStart = 3,
    MeetingStop = 4,
}

impl TryFrom<u8> for FrameType {
    type Error = CodecError;

    fn try_from(v: u8) -> Result<Self, CodecError> {
        match v {
            1 => Ok(FrameType::Audio),
            2 => Ok(FrameType::ScreenshotEvent),
            3 => Ok(FrameType::MeetingStart),
            4 => Ok(FrameType::MeetingStop),
            other => Err(CodecError::UnknownFrameType(other)),
        }
    }
}

/// Wire stream id. Control frames use `System` by convention; the worker
/// ignores the stream byte for non-AUDIO types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StreamId {
    System = 0,
    Mic = 1,
}

impl StreamId {
    pub fn label(self) -> &'static str {
        match self {
            StreamId::System => "system",
            StreamId::Mic => "mic",
        }
    }
}

impl TryFrom<u8> for StreamId {
    type Error = CodecError;

    fn try_from(v: u8) -> Result<Self, CodecError> {
        match v {
            0 => Ok(StreamId::System),
            1 => Ok(StreamId::Mic),
            other => Err(CodecError::UnknownStreamId(other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// One host → worker message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub stream: StreamId,
    /// Presentation timestamp in microseconds, relative to meeting start.
    pub pts_us: i64,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn audio(stream: StreamId, pts_us: i64, pcm_s16le: Vec<u8>) -> Self {
        Frame {
            frame_type: FrameType::Audio,
            stream,
            pts_us,
            payload: pcm_s16le,
        }
    }

    pub fn screenshot_event(pts_us: i64, json: Vec<u8>) -> Self {
        Frame {
            frame_type: FrameType::ScreenshotEvent,
            stream: StreamId::System,
            pts_us,
            payload: json,
        }
    }

    pub fn meeting_start(json: Vec<u8>) -> Self {
        Frame {
            frame_type: FrameType::MeetingStart,
            stream: StreamId::System,
            pts_us: 0,
            payload: json,
        }
    }

    /// MEETING_STOP carries an empty payload. It is the final frame on
    /// stdin; the pipe is closed after it.
    pub fn meeting_stop(pts_us: i64) -> Self {
        Frame {
            frame_type: FrameType::MeetingStop,
            stream: StreamId::System,
            pts_us,
            payload: Vec::new(),
        }
    }

    /// Serialize the 14-byte header. Fails if the payload exceeds the cap.
    pub fn header_bytes(&self) -> Result<[u8; HEADER_LEN], CodecError> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(CodecError::PayloadTooLarge(self.payload.len()));
        }
        let mut hdr = [0u8; HEADER_LEN];
        hdr[0] = self.frame_type as u8;
        hdr[1] = self.stream as u8;
        hdr[2..10].copy_from_slice(&self.pts_us.to_le_bytes());
        hdr[10..14].copy_from_slice(&(self.payload.len() as u32).to_le_bytes());
        Ok(hdr)
    }

    /// Serialize header + payload into one buffer.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let hdr = self.header_bytes()?;
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&hdr);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Decode one frame from the front of `buf`, returning the frame and the
    /// number of bytes consumed. Short input is fatal per the protocol.
    pub fn decode(buf: &[u8]) -> Result<(Frame, usize), CodecError> {
        if buf.len() < HEADER_LEN {
            return Err(CodecError::FrameTruncated);
        }
        let frame_type = FrameType::try_from(buf[0])?;
        let stream = StreamId::try_from(buf[1])?;
        let pts_us = i64::from_le_bytes(buf[2..10].try_into().expect("8 header bytes"));
        let payload_len = u32::from_le_bytes(buf[10..14].try_into().expect("4 header bytes")) as usize;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(CodecError::PayloadTooLarge(payload_len));
        }
        let end = HEADER_LEN + payload_len;
        if buf.len() < end {
            return Err(CodecError::FrameTruncated);
        }
        Ok((
            Frame {
                frame_type,
                stream,
                pts_us,
                payload: buf[HEADER_LEN..end].to_vec(),
            },
            end,
        ))
    }

    /// Read exactly one frame from a blocking reader. Used by tests and by
    /// tooling that replays a captured stdin stream.
    pub fn read_from<R: std::io::Read>(r: &mut R) -> Result<Frame, CodecError> {
        let mut hdr = [0u8; HEADER_LEN];
        read_exact_or_truncated(r, &mut hdr)?;
        let frame_type = FrameType::try_from(hdr[0])?;
        let stream = StreamId::try_from(hdr[1])?;
        let pts_us = i64::from_le_bytes(hdr[2..10].try_into().expect("8 header bytes"));
        let payload_len = u32::from_le_bytes(hdr[10..14].try_into().expect("4 header bytes")) as usize;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(CodecError::PayloadTooLarge(payload_len));
        }
        let mut payload = vec![0u8; payload_len];
        read_exact_or_truncated(r, &mut payload)?;
        Ok(Frame {
            frame_type,
            stream,
            pts_us,
            payload,
        })
    }
}

fn read_exact_or_truncated<R: std::io::Read>(r: &mut R, buf: &mut [u8]) -> Result<(), CodecError> {
    r.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            CodecError::FrameTruncated
        } else {
            CodecError::Io(e)
        }
    })
}

// ---------------------------------------------------------------------------
// Event line splitting
// ---------------------------------------------------------------------------

/// One complete worker stdout line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLine {
    pub text: String,
    /// True when the original line exceeded [`MAX_EVENT_LINE_LEN`] and was
    /// cut at the cap. Callers log an error entry for truncated lines.
    pub truncated: bool,
}

/// Accumulates raw stdout bytes and splits them on `\n` (0x0A).
///
/// Lines longer than the cap are truncated; the excess is discarded up to
/// the next newline. Invalid UTF-8 yields [`CodecError::NonUtf8`] for that
/// line only.
#[derive(Debug, Default)]
pub struct EventLineBuffer {
    buf: Vec<u8>,
    discarding: bool,
}

impl EventLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning every line completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<EventLine, CodecError>> {
        let mut out = Vec::new();
        for &b in chunk {
            if b == b'\n' {
                let truncated = self.discarding;
                self.discarding = false;
                let raw = std::mem::take(&mut self.buf);
                out.push(finish_line(raw, truncated));
                continue;
            }
            if self.discarding {
                continue;
            }
            self.buf.push(b);
            if self.buf.len() >= MAX_EVENT_LINE_LEN {
                self.discarding = true;
            }
        }
        out
    }

    /// Flush any unterminated tail, e.g. on worker exit.
    pub fn finish(&mut self) -> Option<Result<EventLine, CodecError>> {
        if self.buf.is_empty() && !self.discarding {
            return None;
        }
        let truncated = self.discarding;
        self.discarding = false;
        Some(finish_line(std::mem::take(&mut self.buf), truncated))
    }
}

fn finish_line(mut raw: Vec<u8>, truncated: bool) -> Result<EventLine, CodecError> {
    if raw.last() == Some(&b'\r') {
        raw.pop();
    }
    match String::from_utf8(raw) {
        Ok(text) => Ok(EventLine { text, truncated }),
        Err(_) => Err(CodecError::NonUtf8),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
