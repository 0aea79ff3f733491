//! Content-addressed audio cache.
//!
//! Every entry is a pair of files sharing one stem: `<key>.mp3` (payload)
//! and `<key>.meta.json` (sidecar). Both files exist or the entry is
//! invalid; a payload without a readable sidecar is corrupt and gets
//! evicted on the next lookup. Writes go to a temp file first and are
//! renamed into place, so a concurrent reader never sees a half-written
//! payload. The store assumes a single process; no cross-process locking.
//!
//! Caching is best-effort: `put` and `sweep` log failures and swallow
//! them, `get` downgrades every failure to a miss.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::codec::{self, AudioKind};
use crate::error::AppError;
use crate::fingerprint::VoiceRequest;

/// Sidecar document stored next to each payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Sidecar {
    pub created_at: DateTime<Utc>,
    pub text: String,
    pub speaker_id: u32,
    pub speed: f32,
    pub pitch: f32,
    pub volume: f32,
}

impl Sidecar {
    fn for_request(request: &VoiceRequest) -> Self {
        Self {
            created_at: Utc::now(),
            text: request.text.clone(),
            speaker_id: request.speaker,
            speed: request.speed,
            pitch: request.pitch,
            volume: request.volume,
        }
    }
}

pub struct CacheStore {
    dir: PathBuf,
    expiration_days: i64,
    max_size_bytes: u64,
}

impl CacheStore {
    /// Open a size-capped store rooted at `dir`, creating it if needed.
    pub fn open(dir: PathBuf, expiration_days: i64, max_size_gb: f64) -> Result<Self, AppError> {
        let max_size_bytes = (max_size_gb * 1024.0 * 1024.0 * 1024.0) as u64;
        Self::with_capacity_bytes(dir, expiration_days, max_size_bytes)
    }

    /// Open a store with no size cap. Used for the filler bank, which is
    /// exempt from the utterance cache's eviction policy.
    pub fn unbounded(dir: PathBuf, expiration_days: i64) -> Result<Self, AppError> {
        Self::with_capacity_bytes(dir, expiration_days, u64::MAX)
    }

    pub fn with_capacity_bytes(
        dir: PathBuf,
        expiration_days: i64,
        max_size_bytes: u64,
    ) -> Result<Self, AppError> {
        std::fs::create_dir_all(&dir)
            .map_err(|e| AppError::io(format!("creating cache directory {}", dir.display()), e))?;
        Ok(Self {
            dir,
            expiration_days,
            max_size_bytes,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // ── Lookup ─────────────────────────────────────────

    /// Payload bytes for `key`, or a miss. The sidecar must parse, be
    /// younger than the expiration window, and carry exactly the text
    /// being looked up; on any failure both files are removed.
    pub async fn get(&self, key: &str, expected_text: &str) -> Option<Vec<u8>> {
        self.read_validated(key, Some(expected_text)).await
    }

    /// Like [`get`](Self::get) but without the text comparison. Used by
    /// the filler bank, where the caller does not know the entry's text
    /// in advance.
    pub async fn read_any(&self, key: &str) -> Option<Vec<u8>> {
        self.read_validated(key, None).await
    }

    async fn read_validated(&self, key: &str, expected_text: Option<&str>) -> Option<Vec<u8>> {
        let sidecar_path = self.sidecar_path(key);
        let payload_path = match self.existing_payload_path(key).await {
            Some(path) => path,
            None => {
                // A sidecar may be lingering without its payload.
                if tokio::fs::metadata(&sidecar_path).await.is_ok() {
                    self.evict_pair(key).await;
                }
                return None;
            }
        };

        let sidecar: Sidecar = match tokio::fs::read_to_string(&sidecar_path).await {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(sidecar) => sidecar,
                Err(e) => {
                    warn!("sidecar for {} is corrupt ({}), evicting", key, e);
                    self.evict_pair(key).await;
                    return None;
                }
            },
            Err(_) => {
                // Payload without a readable sidecar: corrupt pair.
                self.evict_pair(key).await;
                return None;
            }
        };

        if self.is_expired(&sidecar.created_at) {
            debug!("cache entry {} expired, evicting", key);
            self.evict_pair(key).await;
            return None;
        }

        if let Some(expected) = expected_text {
            if sidecar.text != expected {
                warn!("sidecar text mismatch for {}, evicting", key);
                self.evict_pair(key).await;
                return None;
            }
        }

        match tokio::fs::read(&payload_path).await {
            Ok(bytes) if !bytes.is_empty() => Some(bytes),
            _ => {
                self.evict_pair(key).await;
                None
            }
        }
    }

    // ── Insert ─────────────────────────────────────────

    /// Persist audio for `key`. WAV input is transcoded to MP3 before
    /// hitting disk; if the encoder rejects the layout, the WAV bytes are
    /// stored under a `.wav` extension so content and extension agree.
    /// Failures are logged and swallowed, then a sweep runs.
    pub async fn put(&self, key: &str, audio: &[u8], request: &VoiceRequest) {
        if let Err(e) = self.try_put(key, audio, request).await {
            warn!("cache write for {} failed: {}", key, e);
        }
        self.sweep().await;
    }

    async fn try_put(&self, key: &str, audio: &[u8], request: &VoiceRequest) -> Result<(), AppError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| AppError::io("creating cache directory", e))?;

        let (bytes, extension) = match codec::sniff(audio) {
            AudioKind::Wav => match codec::wav_to_mp3(audio) {
                Ok(mp3) => (mp3, "mp3"),
                Err(e) => {
                    warn!("transcode for {} failed ({}), storing wav", key, e);
                    (audio.to_vec(), "wav")
                }
            },
            AudioKind::Mp3 => (audio.to_vec(), "mp3"),
            AudioKind::Unknown => {
                warn!("payload for {} has an unrecognized header, storing as-is", key);
                (audio.to_vec(), "mp3")
            }
        };

        // Payload first, sidecar second: a crash in between leaves a
        // payload without sidecar, which the next get() evicts.
        self.write_atomic(&self.dir.join(format!("{key}.{extension}")), &bytes)
            .await?;
        // Drop the alternate-extension payload from any earlier run.
        let alternate = if extension == "mp3" { "wav" } else { "mp3" };
        let _ = tokio::fs::remove_file(self.dir.join(format!("{key}.{alternate}"))).await;

        let sidecar = Sidecar::for_request(request);
        let json = serde_json::to_string_pretty(&sidecar)
            .map_err(|e| AppError::Config(format!("sidecar serialization: {e}")))?;
        self.write_atomic(&self.sidecar_path(key), json.as_bytes())
            .await?;
        Ok(())
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), AppError> {
        let tmp = path.with_extension(match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{ext}.tmp"),
            None => "tmp".to_string(),
        });
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| AppError::io(format!("writing {}", tmp.display()), e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| AppError::io(format!("renaming into {}", path.display()), e))?;
        Ok(())
    }

    // ── Maintenance ────────────────────────────────────

    /// Remove every payload and sidecar in the store.
    pub async fn clear_all(&self) -> Result<usize, AppError> {
        let mut removed = 0usize;
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| AppError::io(format!("reading {}", self.dir.display()), e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AppError::io("walking cache directory", e))?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(".mp3")
                || name.ends_with(".wav")
                || name.ends_with(".meta.json")
                || name.ends_with(".tmp")
            {
                if tokio::fs::remove_file(entry.path()).await.is_ok() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Expire old entries, drop orphaned halves, then evict oldest-first
    /// until the payload total fits the size cap.
    pub async fn sweep(&self) {
        if let Err(e) = self.try_sweep().await {
            warn!("cache sweep failed: {}", e);
        }
    }

    async fn try_sweep(&self) -> std::io::Result<()> {
        struct Walked {
            stem: String,
            payload: Option<(PathBuf, u64)>,
            sidecar: Option<PathBuf>,
        }

        let mut by_stem: std::collections::HashMap<String, Walked> =
            std::collections::HashMap::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy().into_owned();
            if name.ends_with(".tmp") {
                let _ = tokio::fs::remove_file(entry.path()).await;
                continue;
            }
            let (stem, is_sidecar) = if let Some(stem) = name.strip_suffix(".meta.json") {
                (stem.to_string(), true)
            } else if let Some(stem) = name
                .strip_suffix(".mp3")
                .or_else(|| name.strip_suffix(".wav"))
            {
                (stem.to_string(), false)
            } else {
                continue;
            };

            let walked = by_stem.entry(stem.clone()).or_insert(Walked {
                stem,
                payload: None,
                sidecar: None,
            });
            if is_sidecar {
                walked.sidecar = Some(entry.path());
            } else {
                let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
                walked.payload = Some((entry.path(), size));
            }
        }

        // Live entries, oldest first, after dropping orphans and expired pairs.
        let mut live: Vec<(DateTime<Utc>, String, u64)> = Vec::new();
        for walked in by_stem.into_values() {
            let (payload, sidecar) = match (&walked.payload, &walked.sidecar) {
                (Some(payload), Some(sidecar)) => (payload, sidecar),
                _ => {
                    self.evict_pair(&walked.stem).await;
                    continue;
                }
            };
            let parsed: Option<Sidecar> = tokio::fs::read_to_string(sidecar)
                .await
                .ok()
                .and_then(|content| serde_json::from_str(&content).ok());
            match parsed {
                Some(meta) if !self.is_expired(&meta.created_at) => {
                    live.push((meta.created_at, walked.stem, payload.1));
                }
                _ => self.evict_pair(&walked.stem).await,
            }
        }

        let mut total: u64 = live.iter().map(|(_, _, size)| size).sum();
        if total <= self.max_size_bytes {
            return Ok(());
        }
        live.sort_by_key(|(created_at, _, _)| *created_at);
        for (_, stem, size) in live {
            if total <= self.max_size_bytes {
                break;
            }
            debug!("evicting {} to satisfy the size cap", stem);
            self.evict_pair(&stem).await;
            total = total.saturating_sub(size);
        }
        Ok(())
    }

    /// Total bytes of payload files currently on disk.
    pub async fn total_payload_bytes(&self) -> u64 {
        let mut total = 0u64;
        let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await else {
            return 0;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(".mp3") || name.ends_with(".wav") {
                total += entry.metadata().await.map(|m| m.len()).unwrap_or(0);
            }
        }
        total
    }

    /// Stems of entries whose sidecar parses, is unexpired, and whose
    /// payload exists. Used by the filler bank to enumerate candidates.
    pub async fn valid_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await else {
            return keys;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy().into_owned();
            let Some(stem) = name.strip_suffix(".meta.json") else {
                continue;
            };
            let parsed: Option<Sidecar> = tokio::fs::read_to_string(entry.path())
                .await
                .ok()
                .and_then(|content| serde_json::from_str(&content).ok());
            if let Some(meta) = parsed {
                if !self.is_expired(&meta.created_at)
                    && self.existing_payload_path(stem).await.is_some()
                {
                    keys.push(stem.to_string());
                }
            }
        }
        keys.sort();
        keys
    }

    // ── Internals ──────────────────────────────────────

    fn is_expired(&self, created_at: &DateTime<Utc>) -> bool {
        Utc::now() - *created_at > Duration::days(self.expiration_days)
    }

    fn sidecar_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.meta.json"))
    }

    async fn existing_payload_path(&self, key: &str) -> Option<PathBuf> {
        for extension in ["mp3", "wav"] {
            let path = self.dir.join(format!("{key}.{extension}"));
            if tokio::fs::metadata(&path).await.is_ok() {
                return Some(path);
            }
        }
        None
    }

    async fn evict_pair(&self, key: &str) {
        for extension in ["mp3", "wav", "meta.json"] {
            let _ = tokio::fs::remove_file(self.dir.join(format!("{key}.{extension}"))).await;
        }
    }
}
