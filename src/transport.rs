//! Bounded, ordered delivery of answers over a size-limited channel.
//!
//! The downstream channel rejects any message over a fixed byte ceiling, so
//! [`ChunkedTransport`] splits each payload into [`Frame`]s whose serialized
//! size, envelope included, never exceeds `max_frame_bytes`. Frames carry a
//! whole number of code points and are sent in sequence order with a fixed
//! delay between them. A receiver rebuilds the message with
//! [`FrameAssembler`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::TransportConfig;
use crate::error::{RagError, Result};

/// Appended to payloads cut at `max_answer_bytes`.
pub const TRUNCATION_MARKER: &str = "\n\n[Answer truncated: the full response exceeded the delivery limit.]";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub message_id: String,
    pub sequence_index: u32,
    pub is_final: bool,
    pub payload: String,
}

/// The ordered channel frames are written to.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_frame(&self, frame: &Frame) -> Result<()>;

    /// Bytes the sink adds around a payload for frames of `message_id`.
    /// Must be an upper bound across sequence indices and the final flag.
    fn envelope_overhead(&self, _message_id: &str) -> usize {
        0
    }

    /// Bytes `ch` occupies once encoded by the sink.
    fn payload_cost(&self, ch: char) -> usize {
        ch.len_utf8()
    }
}

/// Outcome of a successful [`ChunkedTransport::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    /// Id the delivered frames carry; differs from the requested id after a retry.
    pub message_id: String,
    pub frames: usize,
    pub attempts: u32,
    pub truncated: bool,
}

pub struct ChunkedTransport<S> {
    sink: S,
    config: TransportConfig,
    send_lock: Mutex<()>,
}

impl<S: FrameSink> ChunkedTransport<S> {
    pub fn new(sink: S, config: TransportConfig) -> Self {
        Self {
            sink,
            config,
            send_lock: Mutex::new(()),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Delivers `payload` as a sequence of frames.
    ///
    /// If the sink rejects a frame the whole message is resent from frame 0
    /// under a fresh message id, up to `max_send_attempts` attempts in total.
    /// Concurrent sends are serialized.
    pub async fn send(&self, message_id: &str, payload: &str) -> Result<SendReport> {
        let _guard = self.send_lock.lock().await;

        let (payload, truncated) = truncate_payload(payload, self.config.max_answer_bytes);
        if truncated {
            warn!(
                message_id,
                limit = self.config.max_answer_bytes,
                "answer truncated for delivery"
            );
        }

        let max_attempts = self.config.max_send_attempts.max(1);
        let delay = Duration::from_millis(self.config.frame_delay_ms);
        let mut id = message_id.to_string();
        let mut last_err = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                id = uuid::Uuid::new_v4().to_string();
            }
            let frames = split_frames(
                &id,
                &payload,
                self.config.max_frame_bytes,
                self.sink.envelope_overhead(&id),
                |ch| self.sink.payload_cost(ch),
            )?;

            match self.deliver(&frames, delay).await {
                Ok(()) => {
                    debug!(message_id = %id, frames = frames.len(), attempt, "message delivered");
                    return Ok(SendReport {
                        message_id: id,
                        frames: frames.len(),
                        attempts: attempt,
                        truncated,
                    });
                }
                Err(e) => {
                    warn!(message_id = %id, attempt, error = %e, "frame rejected; resending message");
                    last_err = Some(e);
                }
            }
        }

        Err(RagError::Transport {
            attempts: max_attempts,
            message: last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempts made".to_string()),
        })
    }

    async fn deliver(&self, frames: &[Frame], delay: Duration) -> Result<()> {
        for (i, frame) in frames.iter().enumerate() {
            if i > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.sink.send_frame(frame).await?;
        }
        Ok(())
    }
}

/// Cuts `payload` to at most `max_bytes` bytes, marker included, at a
/// code-point boundary.
pub fn truncate_payload(payload: &str, max_bytes: usize) -> (String, bool) {
    if payload.len() <= max_bytes {
        return (payload.to_string(), false);
    }
    if max_bytes < TRUNCATION_MARKER.len() {
        // The marker is ASCII, so any byte offset is a boundary.
        return (TRUNCATION_MARKER[..max_bytes].to_string(), true);
    }
    let mut cut = max_bytes.saturating_sub(TRUNCATION_MARKER.len());
    while !payload.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = String::with_capacity(cut + TRUNCATION_MARKER.len());
    out.push_str(&payload[..cut]);
    out.push_str(TRUNCATION_MARKER);
    (out, true)
}

/// Splits `payload` into frames of at most `max_frame_bytes`, counting
/// `overhead` per frame and `cost(ch)` per character.
///
/// An empty payload yields one empty final frame.
pub fn split_frames(
    message_id: &str,
    payload: &str,
    max_frame_bytes: usize,
    overhead: usize,
    cost: impl Fn(char) -> usize,
) -> Result<Vec<Frame>> {
    let budget = max_frame_bytes.saturating_sub(overhead);
    let mut pieces: Vec<&str> = Vec::new();
    let mut start = 0;
    let mut used = 0;

    for (pos, ch) in payload.char_indices() {
        let c = cost(ch);
        if c > budget {
            return Err(RagError::input(format!(
                "max_frame_bytes {} leaves {} byte(s) after the {}-byte envelope; \
                 a single character needs {}",
                max_frame_bytes, budget, overhead, c
            )));
        }
        if used + c > budget {
            pieces.push(&payload[start..pos]);
            start = pos;
            used = 0;
        }
        used += c;
    }
    if start < payload.len() || pieces.is_empty() {
        pieces.push(&payload[start..]);
    }

    let last = pieces.len() - 1;
    Ok(pieces
        .into_iter()
        .enumerate()
        .map(|(i, piece)| Frame {
            message_id: message_id.to_string(),
            sequence_index: i as u32,
            is_final: i == last,
            payload: piece.to_string(),
        })
        .collect())
}

/// Rebuilds messages from frames arriving in any order.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    partial: HashMap<String, Partial>,
}

#[derive(Debug, Default)]
struct Partial {
    frames: BTreeMap<u32, String>,
    final_index: Option<u32>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts one frame; returns the full payload once every frame of its
    /// message has arrived.
    pub fn push(&mut self, frame: Frame) -> Result<Option<String>> {
        let partial = self.partial.entry(frame.message_id.clone()).or_default();

        if frame.is_final {
            match partial.final_index {
                Some(existing) if existing != frame.sequence_index => {
                    return Err(RagError::input(format!(
                        "message {} has two final frames ({} and {})",
                        frame.message_id, existing, frame.sequence_index
                    )));
                }
                _ => partial.final_index = Some(frame.sequence_index),
            }
        }
        if let Some(last) = partial.final_index {
            let beyond = last
                .checked_add(1)
                .and_then(|next| partial.frames.range(next..).next().map(|(&i, _)| i));
            if let Some(beyond) = beyond {
                return Err(RagError::input(format!(
                    "message {} has frame {} after its final frame {}",
                    frame.message_id, beyond, last
                )));
            }
            if frame.sequence_index > last {
                return Err(RagError::input(format!(
                    "message {} has frame {} after its final frame {}",
                    frame.message_id, frame.sequence_index, last
                )));
            }
        }
        if let Some(existing) = partial.frames.get(&frame.sequence_index) {
            if *existing != frame.payload {
                return Err(RagError::input(format!(
                    "message {} frame {} delivered twice with different payloads",
                    frame.message_id, frame.sequence_index
                )));
            }
        }
        partial.frames.insert(frame.sequence_index, frame.payload);

        let complete = partial
            .final_index
            .is_some_and(|last| partial.frames.len() as u64 == u64::from(last) + 1);
        if !complete {
            return Ok(None);
        }

        let done = self.partial.remove(&frame.message_id).unwrap_or_default();
        Ok(Some(done.frames.into_values().collect()))
    }

    /// Messages with frames still outstanding.
    pub fn pending(&self) -> usize {
        self.partial.len()
    }
}

/// Collects frames in memory.
///
/// By default a frame costs exactly its payload bytes. With
/// [`json_envelope`](Self::json_envelope) frames are sized as the JSON
/// objects they become when returned over HTTP.
#[derive(Debug, Default)]
pub struct VecSink {
    frames: StdMutex<Vec<Frame>>,
    json: bool,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn json_envelope() -> Self {
        Self {
            frames: StdMutex::new(Vec::new()),
            json: true,
        }
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn take_frames(&self) -> Vec<Frame> {
        std::mem::take(&mut *self.frames.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl FrameSink for VecSink {
    async fn send_frame(&self, frame: &Frame) -> Result<()> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame.clone());
        Ok(())
    }

    fn envelope_overhead(&self, message_id: &str) -> usize {
        if self.json {
            json_envelope_overhead(message_id)
        } else {
            0
        }
    }

    fn payload_cost(&self, ch: char) -> usize {
        if self.json {
            json_char_cost(ch)
        } else {
            ch.len_utf8()
        }
    }
}

/// Writes each frame as one line of JSON (NDJSON).
///
/// The line, newline excluded, is what counts against `max_frame_bytes`.
pub struct JsonLinesSink<W> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameSink for JsonLinesSink<W> {
    async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let mut line = serde_json::to_vec(frame)
            .map_err(|e| RagError::Internal(format!("frame serialization failed: {}", e)))?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(&line)
            .await
            .map_err(|e| RagError::Internal(format!("frame write failed: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| RagError::Internal(format!("frame flush failed: {}", e)))
    }

    fn envelope_overhead(&self, message_id: &str) -> usize {
        json_envelope_overhead(message_id)
    }

    fn payload_cost(&self, ch: char) -> usize {
        json_char_cost(ch)
    }
}

/// Size of a serialized [`Frame`] with an empty payload, at its widest:
/// a ten-digit index and `"is_final":false`.
pub fn json_envelope_overhead(message_id: &str) -> usize {
    let widest = Frame {
        message_id: message_id.to_string(),
        sequence_index: u32::MAX,
        is_final: false,
        payload: String::new(),
    };
    serde_json::to_vec(&widest).map(|v| v.len()).unwrap_or(usize::MAX)
}

/// Encoded size of `ch` inside a JSON string, as written by `serde_json`.
pub fn json_char_cost(ch: char) -> usize {
    match ch {
        '"' | '\\' | '\n' | '\r' | '\t' | '\u{08}' | '\u{0c}' => 2,
        c if (c as u32) < 0x20 => 6,
        c => c.len_utf8(),
    }
}
