//! Configuration loading and validation.
//!
//! Settings live in a `vvsay.json` next to the executable or in the
//! working directory, organized in PascalCase sections (`VoiceVox`,
//! `Cache`, `Audio`, `Filler`). A missing or unparsable file falls back
//! to full defaults; individual missing fields fall back per-field
//! through their `#[serde(default = "...")]` functions, so a partially
//! written section keeps the curated defaults for the keys it omits.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::AppError;

pub const CONFIG_FILE_NAME: &str = "vvsay.json";

// ── Engine section ─────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VoiceVoxConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_speaker_id")]
    pub default_speaker: u32,
    /// Per-HTTP-call timeout in seconds.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    #[serde(default = "default_true")]
    pub auto_start_engine: bool,
    #[serde(default)]
    pub engine_path: Option<PathBuf>,
    #[serde(default)]
    pub engine_arguments: Vec<String>,
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_seconds: u64,
    #[serde(default = "default_true")]
    pub keep_engine_running: bool,
}

impl Default for VoiceVoxConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            default_speaker: default_speaker_id(),
            connection_timeout: default_connection_timeout(),
            auto_start_engine: true,
            engine_path: None,
            engine_arguments: Vec::new(),
            startup_timeout_seconds: default_startup_timeout(),
            keep_engine_running: true,
        }
    }
}

fn default_base_url() -> String {
    // 127.0.0.1 rather than localhost to keep DNS out of the path.
    "http://127.0.0.1:50021".to_string()
}
fn default_speaker_id() -> u32 {
    1
}
fn default_connection_timeout() -> u64 {
    30
}
fn default_startup_timeout() -> u64 {
    60
}
fn default_true() -> bool {
    true
}

// ── Cache section ──────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CacheConfig {
    #[serde(default = "default_cache_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_expiration_days")]
    pub expiration_days: i64,
    #[serde(rename = "MaxSizeGB", default = "default_max_size_gb")]
    pub max_size_gb: f64,
    #[serde(default)]
    pub use_executable_base_directory: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: default_cache_directory(),
            expiration_days: default_expiration_days(),
            max_size_gb: default_max_size_gb(),
            use_executable_base_directory: false,
        }
    }
}

fn default_cache_directory() -> PathBuf {
    PathBuf::from("cache/audio")
}
fn default_expiration_days() -> i64 {
    30
}
fn default_max_size_gb() -> f64 {
    1.0
}

// ── Audio section ──────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AudioConfig {
    /// Output device index; -1 selects the system default.
    #[serde(default = "default_output_device")]
    pub output_device: i32,
    #[serde(default = "default_audio_volume")]
    pub volume: f32,
    #[serde(default)]
    pub prepare_device: bool,
    #[serde(default = "default_preparation_duration_ms")]
    pub preparation_duration_ms: u64,
    #[serde(default = "default_preparation_volume")]
    pub preparation_volume: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            output_device: default_output_device(),
            volume: default_audio_volume(),
            prepare_device: false,
            preparation_duration_ms: default_preparation_duration_ms(),
            preparation_volume: default_preparation_volume(),
        }
    }
}

fn default_output_device() -> i32 {
    -1
}
fn default_audio_volume() -> f32 {
    1.0
}
fn default_preparation_duration_ms() -> u64 {
    300
}
fn default_preparation_volume() -> f32 {
    0.01
}

// ── Filler section ─────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FillerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_filler_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_filler_texts")]
    pub filler_texts: Vec<String>,
}

impl Default for FillerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: default_filler_directory(),
            filler_texts: default_filler_texts(),
        }
    }
}

fn default_filler_directory() -> PathBuf {
    PathBuf::from("cache/filler")
}
fn default_filler_texts() -> Vec<String> {
    vec![
        "えーと。".to_string(),
        "あのー。".to_string(),
        "そうですね。".to_string(),
        "ええと、少々お待ちください。".to_string(),
        "はい。".to_string(),
        "うーん。".to_string(),
    ]
}

// ── Top level ──────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AppConfig {
    #[serde(default)]
    pub voice_vox: VoiceVoxConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub filler: FillerConfig,
}

impl AppConfig {
    /// Load configuration, falling back to defaults when no file is
    /// found or the file does not parse.
    pub fn load() -> Self {
        for candidate in Self::candidate_paths() {
            match std::fs::read_to_string(&candidate) {
                Ok(content) => match serde_json::from_str::<Self>(&content) {
                    Ok(config) => {
                        debug!("loaded config from {}", candidate.display());
                        return config;
                    }
                    Err(e) => {
                        warn!(
                            "config {} did not parse ({}), using defaults",
                            candidate.display(),
                            e
                        );
                        return Self::default();
                    }
                },
                Err(_) => continue,
            }
        }
        debug!("no config file found, using defaults");
        Self::default()
    }

    fn candidate_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(dir) = executable_dir() {
            paths.push(dir.join(CONFIG_FILE_NAME));
        }
        paths.push(PathBuf::from(CONFIG_FILE_NAME));
        paths
    }

    /// Reject configurations that cannot produce a working run. Called
    /// once at startup, before any other work.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.voice_vox.connection_timeout == 0 {
            return Err(AppError::Config(
                "VoiceVox.ConnectionTimeout must be at least 1 second".into(),
            ));
        }
        if self.voice_vox.startup_timeout_seconds == 0 {
            return Err(AppError::Config(
                "VoiceVox.StartupTimeoutSeconds must be at least 1 second".into(),
            ));
        }
        if self.cache.expiration_days < 0 {
            return Err(AppError::Config(
                "Cache.ExpirationDays must not be negative".into(),
            ));
        }
        if self.cache.max_size_gb <= 0.0 {
            return Err(AppError::Config("Cache.MaxSizeGB must be positive".into()));
        }
        if !(0.0..=2.0).contains(&self.audio.volume) {
            return Err(AppError::Config(
                "Audio.Volume must be between 0.0 and 2.0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.audio.preparation_volume) {
            return Err(AppError::Config(
                "Audio.PreparationVolume must be between 0.0 and 1.0".into(),
            ));
        }
        Ok(())
    }

    /// Cache directory with `Cache.UseExecutableBaseDirectory` applied.
    pub fn cache_dir(&self) -> PathBuf {
        self.resolve_dir(&self.cache.directory)
    }

    /// Filler directory, resolved the same way as the cache directory.
    pub fn filler_dir(&self) -> PathBuf {
        self.resolve_dir(&self.filler.directory)
    }

    fn resolve_dir(&self, dir: &Path) -> PathBuf {
        if dir.is_absolute() {
            return dir.to_path_buf();
        }
        if self.cache.use_executable_base_directory {
            if let Some(base) = executable_dir() {
                return base.join(dir);
            }
        }
        dir.to_path_buf()
    }
}

fn executable_dir() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
}
