//! Sentence-level segmentation and the per-segment readiness slot.
//!
//! Segmentation is the only text-shaping step in the pipeline: cache keys
//! are derived from the exact segment text emitted here, so the rules are
//! deliberately small and deterministic. A segment ends at a maximal run
//! of sentence terminators (`。．！？.!?`), with the run kept on the
//! segment that precedes it. Internal whitespace collapses to single
//! spaces.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

use crate::fingerprint::VoiceRequest;

/// Upper bound on a readiness re-check when the notify edge is missed.
const POLL_FALLBACK: Duration = Duration::from_millis(50);

fn is_terminator(c: char) -> bool {
    matches!(c, '。' | '．' | '！' | '？' | '.' | '!' | '?')
}

/// Split `text` into ordered, trimmed, non-empty segments.
///
/// Text with no terminator becomes a single segment; blank-only input
/// yields an empty list.
pub fn split_segments(text: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        if is_terminator(c) {
            while let Some(&next) = chars.peek() {
                if !is_terminator(next) {
                    break;
                }
                current.push(next);
                chars.next();
            }
            push_collapsed(&mut segments, &current);
            current.clear();
        }
    }
    push_collapsed(&mut segments, &current);
    segments
}

/// Collapse runs of whitespace to single spaces, trim, and keep if non-empty.
fn push_collapsed(out: &mut Vec<String>, raw: &str) {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if !collapsed.is_empty() {
        out.push(collapsed);
    }
}

// ── Segments ───────────────────────────────────────────

/// One sentence-level unit of an utterance: the granularity of caching
/// and scheduling. Created at orchestration start, dropped when the
/// utterance completes.
#[derive(Clone)]
pub struct Segment {
    pub index: usize,
    pub text: String,
    pub key: String,
    pub slot: Arc<SegmentSlot>,
}

impl Segment {
    pub fn build(index: usize, text: String, voice: &VoiceRequest) -> Self {
        let key = voice.with_text(text.as_str()).cache_key();
        Self {
            index,
            text,
            key,
            slot: Arc::new(SegmentSlot::new()),
        }
    }
}

/// Outcome of a segment's resolution, as seen by the player.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Ready(Vec<u8>),
    Failed,
}

#[derive(Debug)]
enum SlotState {
    Pending,
    Ready(Vec<u8>),
    Failed,
}

/// Single-writer / single-reader publication point between the producer
/// and the player. The mutex release on `mark_ready` is the
/// happens-before edge that publishes the audio bytes; `Notify` wakes
/// the waiting player without sleep-polling.
pub struct SegmentSlot {
    state: Mutex<SlotState>,
    notify: Notify,
}

impl SegmentSlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Pending),
            notify: Notify::new(),
        }
    }

    /// Attach audio and flip the segment to ready. Empty audio violates
    /// the ready-implies-audio invariant and is recorded as a failure.
    pub fn mark_ready(&self, audio: Vec<u8>) {
        let next = if audio.is_empty() {
            SlotState::Failed
        } else {
            SlotState::Ready(audio)
        };
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
        self.notify.notify_waiters();
    }

    pub fn mark_failed(&self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = SlotState::Failed;
        self.notify.notify_waiters();
    }

    /// Non-blocking readiness check. `None` means still pending.
    pub fn poll(&self) -> Option<Resolution> {
        match &*self.state.lock().unwrap_or_else(PoisonError::into_inner) {
            SlotState::Pending => None,
            SlotState::Ready(audio) => Some(Resolution::Ready(audio.clone())),
            SlotState::Failed => Some(Resolution::Failed),
        }
    }

    /// Wait until the producer resolves this segment one way or the other.
    pub async fn wait_resolved(&self) -> Resolution {
        loop {
            if let Some(resolution) = self.poll() {
                return resolution;
            }
            // A publish between poll() and notified() would be missed;
            // the timeout bounds that window.
            let _ = tokio::time::timeout(POLL_FALLBACK, self.notify.notified()).await;
        }
    }

    /// Bounded wait: `None` when the segment is still pending after
    /// `limit`.
    pub async fn wait_resolved_timeout(&self, limit: Duration) -> Option<Resolution> {
        tokio::time::timeout(limit, self.wait_resolved()).await.ok()
    }
}

impl Default for SegmentSlot {
    fn default() -> Self {
        Self::new()
    }
}
