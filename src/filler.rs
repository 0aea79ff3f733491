//! Pre-synthesized filler utterances for gap coverage.
//!
//! Fillers live in their own directory so the utterance cache's size
//! policy never evicts them. They are produced by `--init` with the
//! configured default voice; at runtime the bank hands out a uniformly
//! random entry, or nothing when it was never initialized (the caller
//! then waits silently).

use std::path::PathBuf;

use rand::seq::SliceRandom;
use tracing::{info, warn};

use crate::cache::CacheStore;
use crate::config::FillerConfig;
use crate::engine::client::SynthClient;
use crate::error::AppError;
use crate::fingerprint::VoiceRequest;

pub struct FillerBank {
    store: CacheStore,
    texts: Vec<String>,
    enabled: bool,
}

impl FillerBank {
    pub fn open(
        config: &FillerConfig,
        dir: PathBuf,
        expiration_days: i64,
    ) -> Result<Self, AppError> {
        Ok(Self {
            store: CacheStore::unbounded(dir, expiration_days)?,
            texts: config.filler_texts.clone(),
            enabled: config.enabled,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Synthesize every configured filler that is not already on disk.
    /// Running this twice leaves the directory unchanged: entries that
    /// hit are skipped. Returns the number of fillers available after
    /// the pass.
    pub async fn init(&self, client: &SynthClient, voice: &VoiceRequest) -> Result<usize, AppError> {
        let mut available = 0usize;
        for text in &self.texts {
            let request = voice.with_text(text.as_str());
            let key = request.cache_key();
            if self.store.get(&key, text).await.is_some() {
                available += 1;
                continue;
            }
            match client.synthesize(&request).await {
                Ok(wav) => {
                    self.store.put(&key, &wav, &request).await;
                    available += 1;
                    info!("filler ready: {}", text);
                }
                Err(e) => warn!("filler synthesis for {:?} failed: {}", text, e),
            }
        }
        Ok(available)
    }

    /// A random filler's bytes, uniform over the valid entries on disk.
    pub async fn pick(&self) -> Option<Vec<u8>> {
        if !self.enabled {
            return None;
        }
        let keys = self.store.valid_keys().await;
        let key = keys.choose(&mut rand::thread_rng())?;
        self.store.read_any(key).await
    }

    /// Remove every filler entry. Used by `--clear`.
    pub async fn clear_all(&self) -> Result<usize, AppError> {
        self.store.clear_all().await
    }
}
