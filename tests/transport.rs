use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use docent::config::TransportConfig;
use docent::transport::{
    ChunkedTransport, Frame, FrameAssembler, FrameSink, JsonLinesSink, VecSink, TRUNCATION_MARKER,
};
use docent::{ErrorKind, RagError};

fn config(max_frame_bytes: usize) -> TransportConfig {
    TransportConfig {
        max_frame_bytes,
        frame_delay_ms: 0,
        ..TransportConfig::default()
    }
}

fn reassemble(frames: Vec<Frame>) -> String {
    let mut assembler = FrameAssembler::new();
    let mut done = None;
    for frame in frames {
        if let Some(message) = assembler.push(frame).unwrap() {
            done = Some(message);
        }
    }
    done.expect("message incomplete")
}

fn concat(frames: &[Frame]) -> String {
    frames.iter().map(|f| f.payload.as_str()).collect()
}

#[tokio::test]
async fn test_large_answer_split_into_bounded_frames() {
    let payload: String = "abcdefghij".repeat(10_000);
    assert_eq!(payload.len(), 100_000);

    let transport = ChunkedTransport::new(VecSink::new(), config(950));
    let report = transport.send("msg-1", &payload).await.unwrap();

    let frames = transport.sink().frames();
    assert_eq!(frames.len(), 106);
    assert_eq!(report.frames, 106);
    assert_eq!(report.attempts, 1);
    assert!(!report.truncated);

    assert_eq!(frames.iter().filter(|f| f.is_final).count(), 1);
    assert!(frames.last().unwrap().is_final);
    for (i, frame) in frames.iter().enumerate() {
        assert_eq!(frame.sequence_index, i as u32);
        assert_eq!(frame.message_id, "msg-1");
        assert!(frame.payload.len() <= 950);
    }
    assert_eq!(concat(&frames), payload);
}

#[tokio::test]
async fn test_multibyte_text_reconstructed_in_any_order() {
    // Tamil, Arabic, CJK and emoji, sized so naive byte splits land mid-character.
    let payload = "வணக்கம் உலகம் مرحبا بالعالم 你好，世界 🚀🌍 ".repeat(40);

    for max in [128usize, 129, 130, 131, 200] {
        let transport = ChunkedTransport::new(VecSink::new(), config(max));
        transport.send("m", &payload).await.unwrap();

        let mut frames = transport.sink().take_frames();
        assert!(frames.iter().all(|f| f.payload.len() <= max));
        frames.reverse();
        assert_eq!(reassemble(frames), payload, "max_frame_bytes = {}", max);
    }
}

#[tokio::test]
async fn test_empty_answer_is_one_final_frame() {
    let transport = ChunkedTransport::new(VecSink::new(), config(950));
    let report = transport.send("m", "").await.unwrap();

    let frames = transport.sink().frames();
    assert_eq!(report.frames, 1);
    assert_eq!(frames.len(), 1);
    assert!(frames[0].is_final);
    assert_eq!(frames[0].sequence_index, 0);
    assert_eq!(reassemble(frames), "");
}

#[tokio::test]
async fn test_oversized_answer_truncated_with_marker() {
    let cfg = TransportConfig {
        max_answer_bytes: 4_096,
        ..config(950)
    };
    let payload = "é".repeat(5_000);

    let transport = ChunkedTransport::new(VecSink::new(), cfg);
    let report = transport.send("m", &payload).await.unwrap();
    assert!(report.truncated);

    let delivered = concat(&transport.sink().frames());
    assert!(delivered.len() <= 4_096);
    assert!(delivered.ends_with(TRUNCATION_MARKER));
    assert!(payload.starts_with(delivered.trim_end_matches(TRUNCATION_MARKER)));
}

/// Rejects the frame with `reject_at` index on the first `failures` messages.
struct RejectingSink {
    inner: VecSink,
    reject_at: u32,
    failures: usize,
    seen_failures: AtomicUsize,
    ids: Mutex<Vec<String>>,
}

impl RejectingSink {
    fn new(reject_at: u32, failures: usize) -> Self {
        Self {
            inner: VecSink::new(),
            reject_at,
            failures,
            seen_failures: AtomicUsize::new(0),
            ids: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl FrameSink for RejectingSink {
    async fn send_frame(&self, frame: &Frame) -> docent::Result<()> {
        {
            let mut ids = self.ids.lock().unwrap();
            if ids.last() != Some(&frame.message_id) {
                ids.push(frame.message_id.clone());
            }
        }
        if frame.sequence_index == self.reject_at
            && self.seen_failures.load(Ordering::SeqCst) < self.failures
        {
            self.seen_failures.fetch_add(1, Ordering::SeqCst);
            return Err(RagError::Internal("channel rejected frame".to_string()));
        }
        self.inner.send_frame(frame).await
    }
}

#[tokio::test]
async fn test_rejected_frame_resends_whole_message_with_new_id() {
    let payload = "x".repeat(1_000);
    let transport = ChunkedTransport::new(RejectingSink::new(2, 1), config(200));

    let report = transport.send("original", &payload).await.unwrap();
    assert_eq!(report.attempts, 2);
    assert_ne!(report.message_id, "original");

    let ids = transport.sink().ids.lock().unwrap().clone();
    assert_eq!(ids, vec!["original".to_string(), report.message_id.clone()]);

    // Frames 0 and 1 of the first attempt arrived, then the full retry.
    let frames = transport.sink().inner.frames();
    let retry: Vec<Frame> = frames
        .into_iter()
        .filter(|f| f.message_id == report.message_id)
        .collect();
    assert_eq!(retry.len(), 5);
    assert_eq!(retry[0].sequence_index, 0);
    assert_eq!(reassemble(retry), payload);
}

#[tokio::test]
async fn test_repeated_rejection_is_transport_error() {
    let transport = ChunkedTransport::new(RejectingSink::new(0, usize::MAX), config(200));

    let err = transport.send("m", "hello").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert!(matches!(err, RagError::Transport { attempts: 2, .. }));
    assert_eq!(transport.sink().ids.lock().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_frames_are_paced() {
    let cfg = TransportConfig {
        frame_delay_ms: 20,
        ..config(128)
    };
    let transport = ChunkedTransport::new(VecSink::new(), cfg);

    let started = tokio::time::Instant::now();
    let report = transport.send("m", &"y".repeat(128 * 4)).await.unwrap();

    assert_eq!(report.frames, 4);
    let elapsed = started.elapsed();
    assert!(elapsed >= std::time::Duration::from_millis(60), "{:?}", elapsed);
    assert!(elapsed < std::time::Duration::from_millis(80), "{:?}", elapsed);
}

#[tokio::test]
async fn test_concurrent_sends_do_not_interleave() {
    let transport = ChunkedTransport::new(VecSink::new(), config(128));
    let a = "a".repeat(1_000);
    let b = "b".repeat(1_000);

    let (ra, rb) = tokio::join!(transport.send("a", &a), transport.send("b", &b));
    ra.unwrap();
    rb.unwrap();

    let frames = transport.sink().frames();
    let first_id = frames[0].message_id.clone();
    let switch = frames
        .iter()
        .position(|f| f.message_id != first_id)
        .unwrap();
    assert!(frames[..switch].last().unwrap().is_final);
    assert!(frames[switch..].iter().all(|f| f.message_id != first_id));
}

#[tokio::test]
async fn test_json_lines_respect_frame_limit() {
    let payload = "Line one.\n\"Quoted\" text\twith tabs and \\ slashes; ünïcödé ✓\n".repeat(60);
    let transport = ChunkedTransport::new(JsonLinesSink::new(Vec::<u8>::new()), config(256));
    let report = transport.send("5f0c0b7e-3e25-4c7a-9d55-0f2f5b7f1d11", &payload).await.unwrap();

    let text = String::from_utf8(transport.into_sink().into_inner()).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), report.frames);

    let mut frames = Vec::new();
    for line in lines {
        assert!(line.len() <= 256, "line of {} bytes", line.len());
        frames.push(serde_json::from_str::<Frame>(line).unwrap());
    }
    assert_eq!(reassemble(frames), payload);
}
