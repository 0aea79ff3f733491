//! HTTP client for the VOICEVOX engine.
//!
//! The engine is non-reentrant: it must never see two in-flight requests.
//! A single client-wide mutex is therefore held across every call,
//! including the whole `audio_query` → edit → `synthesis` sequence, so
//! racing callers are strictly serialized. This is a correctness
//! requirement of the backend, not a throughput optimization.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::fingerprint::VoiceRequest;

/// Any failure talking to the engine: transport, timeout, bad status, or
/// a response that does not have the expected shape. Retrying is the
/// caller's concern.
#[derive(Debug, Error)]
pub enum SynthError {
    #[error("engine request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("engine returned {status} for {endpoint}")]
    Status {
        endpoint: &'static str,
        status: reqwest::StatusCode,
    },
    #[error("engine response malformed: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakerStyle {
    pub name: String,
    pub id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Speaker {
    pub name: String,
    pub speaker_uuid: String,
    pub version: String,
    pub styles: Vec<SpeakerStyle>,
}

pub struct SynthClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
    /// Guards the "at most one in-flight HTTP call" invariant.
    serial: Mutex<()>,
    /// Speakers already primed this process; priming is paid once per id.
    primed: Mutex<HashSet<u32>>,
}

impl SynthClient {
    pub fn new(base_url: &str, timeout_secs: u64) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(timeout_secs),
            serial: Mutex::new(()),
            primed: Mutex::new(HashSet::new()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET /version` within `timeout`. Any non-2xx status or network
    /// error means not-ready.
    pub async fn probe(&self, timeout: Duration) -> bool {
        let _guard = self.serial.lock().await;
        match self
            .http
            .get(format!("{}/version", self.base_url))
            .timeout(timeout)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// `GET /speakers` — the engine's voice catalog.
    pub async fn speakers(&self) -> Result<Vec<Speaker>, SynthError> {
        let _guard = self.serial.lock().await;
        let response = self
            .http
            .get(format!("{}/speakers", self.base_url))
            .timeout(self.timeout)
            .send()
            .await?;
        let response = check("/speakers", response)?;
        Ok(response.json().await?)
    }

    /// Synthesize one request to raw WAV bytes. Primes the speaker on its
    /// first use this process, then runs the query/synthesis pair, all
    /// under the serialization guard.
    pub async fn synthesize(&self, request: &VoiceRequest) -> Result<Vec<u8>, SynthError> {
        let _guard = self.serial.lock().await;

        {
            let mut primed = self.primed.lock().await;
            if !primed.contains(&request.speaker) {
                debug!("initializing speaker {}", request.speaker);
                let response = self
                    .http
                    .post(format!("{}/initialize_speaker", self.base_url))
                    .query(&[("speaker", request.speaker.to_string())])
                    .timeout(self.timeout)
                    .send()
                    .await?;
                check("/initialize_speaker", response)?;
                primed.insert(request.speaker);
            }
        }

        let speaker = request.speaker.to_string();
        let response = self
            .http
            .post(format!("{}/audio_query", self.base_url))
            .query(&[("text", request.text.as_str()), ("speaker", speaker.as_str())])
            .timeout(self.timeout)
            .send()
            .await?;
        let response = check("/audio_query", response)?;
        let mut query: serde_json::Value = response.json().await?;

        let scales = query
            .as_object_mut()
            .ok_or_else(|| SynthError::Protocol("audio_query did not return an object".into()))?;
        scales.insert("speedScale".into(), json!(round2(request.speed)));
        scales.insert("pitchScale".into(), json!(round2(request.pitch)));
        scales.insert("volumeScale".into(), json!(round2(request.volume)));

        let response = self
            .http
            .post(format!("{}/synthesis", self.base_url))
            .query(&[("speaker", speaker.as_str())])
            .json(&query)
            .timeout(self.timeout)
            .send()
            .await?;
        let response = check("/synthesis", response)?;
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(SynthError::Protocol("synthesis returned no audio".into()));
        }
        Ok(bytes.to_vec())
    }
}

fn check(
    endpoint: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response, SynthError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(SynthError::Status {
            endpoint,
            status: response.status(),
        })
    }
}

/// Scale values travel with the same two-decimal resolution the cache
/// key uses, so identical requests produce identical query documents.
fn round2(value: f32) -> f64 {
    (f64::from(value) * 100.0).round() / 100.0
}
