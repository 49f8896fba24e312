//! End-to-end session flow: a scripted capture backend feeds sample buffers
//! while a `/bin/sh` stand-in worker records the binary frame stream it
//! receives and flushes transcript events after stdin closes.

use std::sync::Arc;
use std::time::Duration;

use confab_core::capture::{
    CaptureBackend, CaptureSessionHandle, ContentFilter, StillFrame, StreamDelegate,
};
use confab_core::controller::{ControllerConfig, SessionController};
use confab_core::error::{CaptureError, ControllerError};
use confab_core::events::TranscriptStream;
use confab_core::frame::{Frame, FrameType, StreamId};
use confab_core::pcm::{PcmFormat, SampleBuffer};
use confab_core::store::MeetingStatus;

// ---------------------------------------------------------------------------
// Scripted collaborators
// ---------------------------------------------------------------------------

struct NoopSession;

impl CaptureSessionHandle for NoopSession {
    fn capture_still(&self) -> Result<StillFrame, CaptureError> {
        Ok(StillFrame {
            width: 2,
            height: 2,
            rgba: vec![0u8; 16],
            pts_us: 2_000_000,
        })
    }

    fn stop(&self) -> Result<(), CaptureError> {
        Ok(())
    }
}

/// Delivers a fixed list of sample buffers from a background thread as soon
/// as the session starts.
struct ScriptedBackend {
    buffers: Vec<(StreamId, SampleBuffer)>,
}

impl CaptureBackend for ScriptedBackend {
    fn start(
        &self,
        _filter: ContentFilter,
        delegate: Arc<dyn StreamDelegate>,
    ) -> Result<Box<dyn CaptureSessionHandle>, CaptureError> {
        let buffers = self.buffers.clone();
        std::thread::spawn(move || {
            for (stream, buffer) in buffers {
                delegate.on_audio(stream, buffer);
                std::thread::sleep(Duration::from_millis(5));
            }
        });
        Ok(Box::new(NoopSession))
    }
}

fn f32_buffer(rate: u32, samples: &[f32], pts_us: i64) -> SampleBuffer {
    SampleBuffer {
        format: Some(PcmFormat {
            is_float: true,
            bits_per_channel: 32,
            channels: 1,
            interleaved: true,
            sample_rate: rate,
        }),
        buffers: vec![samples.iter().flat_map(|s| s.to_le_bytes()).collect()],
        frames: samples.len(),
        pts_us,
    }
}

fn i16_buffer(rate: u32, samples: &[i16], pts_us: i64) -> SampleBuffer {
    SampleBuffer {
        format: Some(PcmFormat {
            is_float: false,
            bits_per_channel: 16,
            channels: 1,
            interleaved: true,
            sample_rate: rate,
        }),
        buffers: vec![samples.iter().flat_map(|s| s.to_le_bytes()).collect()],
        frames: samples.len(),
        pts_us,
    }
}

/// Emits one status line, copies the whole binary stdin stream to
/// `$FRAME_DUMP`, then flushes `$REPLY_FILE` as late transcript events.
const WORKER_SCRIPT: &str =
    "printf '{\"type\":\"status\",\"message\":\"ready\"}\\n'; cat > \"$FRAME_DUMP\"; cat \"$REPLY_FILE\"";

fn decode_frames(path: &std::path::Path) -> Vec<Frame> {
    let bytes = std::fs::read(path).expect("frame dump");
    let mut frames = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let (frame, consumed) = Frame::decode(&bytes[offset..]).expect("frame decode");
        frames.push(frame);
        offset += consumed;
    }
    frames
}

fn scripted_controller(
    base: &std::path::Path,
    frame_dump: &std::path::Path,
    reply_file: &std::path::Path,
) -> SessionController {
    let backend = Arc::new(ScriptedBackend {
        buffers: vec![
            (StreamId::System, f32_buffer(48_000, &[0.25; 480], 1_000_000)),
            (StreamId::Mic, i16_buffer(16_000, &[100; 160], 1_050_000)),
        ],
    });
    let mut config = ControllerConfig::new(
        vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            WORKER_SCRIPT.to_string(),
            "worker".to_string(),
        ],
        base.join("data"),
    );
    config.worker_env = vec![
        ("FRAME_DUMP".into(), frame_dump.to_string_lossy().into_owned()),
        ("REPLY_FILE".into(), reply_file.to_string_lossy().into_owned()),
    ];
    SessionController::new(config, backend)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn full_session_flow_with_resume() {
    let base = tempfile::tempdir().unwrap();
    let frame_dump = base.path().join("frames.bin");
    let reply_file = base.path().join("reply.jsonl");

    std::fs::write(
        &reply_file,
        concat!(
            r#"{"type":"segment","speaker_id":"system:SPK0","stream":"system","t0":1.0,"t1":2.0,"text":"hello there"}"#,
            "\n",
            r#"{"type":"segment","speaker_id":"system:SPK0","stream":"system","t0":100.0,"t1":120.5,"text":"closing remarks"}"#,
            "\n",
        ),
    )
    .unwrap();

    let controller = scripted_controller(base.path(), &frame_dump, &reply_file);

    // -- Session 1 --------------------------------------------------------
    let folder = controller
        .start("Weekly Sync", ContentFilter::Display(1))
        .await
        .expect("start");
    assert!(controller.is_recording().await);
    assert_eq!(controller.active_folder().await.as_deref(), Some(folder.as_str()));

    // Starting again while recording is refused.
    assert!(matches!(
        controller.start("Other", ContentFilter::Display(1)).await,
        Err(ControllerError::AlreadyRecording)
    ));
    // So is deleting the meeting being recorded.
    assert!(matches!(
        controller.delete(&folder).await,
        Err(ControllerError::DeleteActive)
    ));

    tokio::time::sleep(Duration::from_millis(150)).await;

    let meeting = controller.stop().await.expect("stop");
    assert!(!controller.is_recording().await);
    assert_eq!(meeting.status, MeetingStatus::Completed);
    // Both late finals, emitted after MEETING_STOP, made it in.
    assert_eq!(meeting.segment_count, 2);
    assert_eq!(meeting.last_timestamp, 120.5);
    assert!(meeting.duration_seconds >= meeting.last_timestamp);
    assert!(meeting.sessions[0].ended_at.is_some());
    assert_eq!(
        meeting.sessions[0].streams.system.map(|f| f.sample_rate),
        Some(48_000)
    );
    assert_eq!(
        meeting.sessions[0].streams.mic.map(|f| f.sample_rate),
        Some(16_000)
    );

    // -- Wire order (what the worker actually saw on stdin) ----------------
    let frames = decode_frames(&frame_dump);
    assert!(frames.len() >= 4);
    assert_eq!(frames[0].frame_type, FrameType::MeetingStart);
    let start: serde_json::Value = serde_json::from_slice(&frames[0].payload).unwrap();
    assert_eq!(start["protocol_version"], 1);
    assert_eq!(start["sample_format"], "s16le");
    assert_eq!(start["title"], "Weekly Sync");
    assert_eq!(start["system_sample_rate"], 48_000);
    assert_eq!(start["system_channels"], 1);
    assert_eq!(start["mic_sample_rate"], 16_000);
    assert_eq!(start["mic_channels"], 1);

    assert_eq!(frames.last().unwrap().frame_type, FrameType::MeetingStop);
    assert!(frames.last().unwrap().payload.is_empty());

    let audio: Vec<&Frame> = frames
        .iter()
        .filter(|f| f.frame_type == FrameType::Audio)
        .collect();
    assert_eq!(audio.len(), 2);
    // First audio frame defines t = 0 on the system stream.
    assert_eq!(audio[0].stream, StreamId::System);
    assert_eq!(audio[0].pts_us, 0);
    assert_eq!(audio[1].stream, StreamId::Mic);
    assert_eq!(audio[1].pts_us, 50_000);
    for stream in [StreamId::System, StreamId::Mic] {
        let pts: Vec<i64> = audio
            .iter()
            .filter(|f| f.stream == stream)
            .map(|f| f.pts_us)
            .collect();
        assert!(pts.windows(2).all(|w| w[0] <= w[1]));
    }

    // -- Artefacts ---------------------------------------------------------
    let meeting_path = controller.store().meeting_path(&folder);
    let transcript = std::fs::read_to_string(meeting_path.join("transcript.jsonl")).unwrap();
    assert_eq!(transcript.lines().count(), 2);
    let events = std::fs::read_to_string(meeting_path.join("transcript_events.jsonl")).unwrap();
    assert!(events.lines().count() >= 3, "status + two segments streamed");
    assert!(events.contains("\"ready\""));
    let backend_log = std::fs::read_to_string(meeting_path.join("backend.log")).unwrap();
    assert!(backend_log.contains("[status] ready"));
    let txt = std::fs::read_to_string(meeting_path.join("transcript.txt")).unwrap();
    assert!(txt.contains("[system] t=1.00s system:SPK0: hello there"));

    // -- Session 2: resume with offset ------------------------------------
    std::fs::write(
        &reply_file,
        concat!(
            r#"{"type":"segment","speaker_id":"mic:SPK1","stream":"mic","t0":3.2,"t1":4.0,"text":"resumed point"}"#,
            "\n",
        ),
    )
    .unwrap();

    controller
        .resume(&folder, ContentFilter::Display(1))
        .await
        .expect("resume");
    tokio::time::sleep(Duration::from_millis(150)).await;
    let meeting = controller.stop().await.expect("stop after resume");

    assert_eq!(meeting.sessions.len(), 2);
    assert_eq!(meeting.sessions[1].session_id, 2);
    assert_eq!(meeting.sessions[1].audio_folder, "audio-session-2");
    assert!(meeting_path.join("audio-session-2").is_dir());
    assert_eq!(meeting.segment_count, 3);
    assert!((meeting.last_timestamp - 124.5).abs() < 1e-9);

    let transcript =
        std::fs::read_to_string(meeting_path.join("transcript.jsonl")).unwrap();
    let lines: Vec<serde_json::Value> = transcript
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 3);
    // Previous finals preserved unchanged; the new one is offset by 120.5.
    assert_eq!(lines[0]["t0"], 1.0);
    assert_eq!(lines[1]["t1"], 120.5);
    assert!((lines[2]["t0"].as_f64().unwrap() - 123.7).abs() < 1e-9);
    assert!((lines[2]["t1"].as_f64().unwrap() - 124.5).abs() < 1e-9);
    assert_eq!(lines[2]["stream"], "mic");
}

#[tokio::test]
async fn failed_start_leaves_no_state() {
    let base = tempfile::tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend { buffers: Vec::new() });
    let config = ControllerConfig::new(
        vec!["/nonexistent/worker-binary".to_string()],
        base.path().join("data"),
    );
    let controller = SessionController::new(config, backend);

    let err = controller
        .start("Doomed", ContentFilter::Display(1))
        .await
        .expect_err("missing worker must fail the start");
    assert!(matches!(err, ControllerError::Config(_)));
    assert!(!controller.is_recording().await);
    assert!(controller.store().list().unwrap().is_empty());
}

#[tokio::test]
async fn live_transcript_snapshots_are_published() {
    let base = tempfile::tempdir().unwrap();
    let frame_dump = base.path().join("frames.bin");
    let reply_file = base.path().join("reply.jsonl");
    std::fs::write(
        &reply_file,
        concat!(
            r#"{"type":"segment","speaker_id":"system:SPK0","stream":"system","t0":0.5,"t1":1.5,"text":"snapshot me"}"#,
            "\n",
        ),
    )
    .unwrap();

    let controller = scripted_controller(base.path(), &frame_dump, &reply_file);
    let mut snapshots = controller.subscribe_transcript();

    let _folder = controller
        .start("Snapshots", ContentFilter::Display(1))
        .await
        .expect("start");
    tokio::time::sleep(Duration::from_millis(100)).await;
    controller.stop().await.expect("stop");

    // After stop the watch holds the final state of the session.
    snapshots.mark_changed();
    snapshots.changed().await.expect("snapshot update");
    let snapshot = snapshots.borrow().clone();
    assert_eq!(snapshot.final_count, 1);
    assert_eq!(snapshot.segments[0].stream, TranscriptStream::System);
    assert_eq!(snapshot.last_text, "snapshot me");
}
