//! Content fingerprinting for cached audio.
//!
//! A cache key is the SHA-256 of `text|speaker|speed|pitch|volume`, with
//! every numeric rendered to exactly two fractional digits. `{:.2}` always
//! uses a period separator regardless of host locale, so keys are stable
//! across platforms. SHA-256 is used instead of `DefaultHasher` so keys
//! stay stable across toolchain versions too.

use sha2::{Digest, Sha256};

/// One immutable synthesis intent: the text plus the voice parameters
/// that shape its audio.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceRequest {
    pub text: String,
    pub speaker: u32,
    pub speed: f32,
    pub pitch: f32,
    pub volume: f32,
}

impl VoiceRequest {
    pub fn new(text: impl Into<String>, speaker: u32) -> Self {
        Self {
            text: text.into(),
            speaker,
            speed: 1.0,
            pitch: 0.0,
            volume: 1.0,
        }
    }

    /// Same voice parameters, different text. Used per segment and for
    /// filler synthesis.
    pub fn with_text(&self, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..self.clone()
        }
    }

    /// The canonical string this request hashes to.
    pub fn canonical(&self) -> String {
        format!(
            "{}|{}|{:.2}|{:.2}|{:.2}",
            self.text, self.speaker, self.speed, self.pitch, self.volume
        )
    }

    /// 64-char lowercase hex digest, used verbatim as the filename stem.
    pub fn cache_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}
