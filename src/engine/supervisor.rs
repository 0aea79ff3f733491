//! Engine process lifecycle: probe, optionally spawn, await readiness.
//!
//! The supervisor runs once at startup of any command that needs the
//! engine. A pre-existing engine is never terminated; a child this
//! process spawned is terminated at exit only when `KeepEngineRunning`
//! is false.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::VoiceVoxConfig;
use crate::engine::client::SynthClient;
use crate::error::AppError;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Engine reachability, held process-wide for one command.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub running: bool,
    pub last_checked: DateTime<Utc>,
    /// True when this process started the engine itself.
    pub spawned: bool,
}

struct SupervisorState {
    status: Option<EngineStatus>,
    child: Option<Child>,
}

pub struct EngineSupervisor {
    client: Arc<SynthClient>,
    config: VoiceVoxConfig,
    state: Mutex<SupervisorState>,
}

impl EngineSupervisor {
    pub fn new(client: Arc<SynthClient>, config: VoiceVoxConfig) -> Self {
        Self {
            client,
            config,
            state: Mutex::new(SupervisorState {
                status: None,
                child: None,
            }),
        }
    }

    /// Make sure the engine answers `/version`, spawning it if allowed.
    /// Idempotent: once the engine has been seen running, later calls
    /// return immediately.
    pub async fn ensure_ready(&self) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        if state.status.as_ref().is_some_and(|s| s.running) {
            return Ok(());
        }

        if self.client.probe(PROBE_TIMEOUT).await {
            debug!("engine already running at {}", self.client.base_url());
            state.status = Some(EngineStatus {
                running: true,
                last_checked: Utc::now(),
                spawned: false,
            });
            return Ok(());
        }

        if !self.config.auto_start_engine {
            return Err(AppError::EngineUnavailable(format!(
                "no engine at {} and auto-start is disabled",
                self.client.base_url()
            )));
        }

        let path = match self.config.engine_path.clone().or_else(locate_engine) {
            Some(path) => path,
            None => {
                return Err(AppError::EngineUnavailable(
                    "engine executable not found in any known location; set VoiceVox.EnginePath"
                        .into(),
                ))
            }
        };

        info!("starting engine: {}", path.display());
        let child = Command::new(&path)
            .args(&self.config.engine_arguments)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                AppError::EngineUnavailable(format!("failed to start {}: {}", path.display(), e))
            })?;
        state.child = Some(child);

        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.startup_timeout_seconds);
        loop {
            if self.client.probe(PROBE_TIMEOUT).await {
                info!("engine is ready");
                state.status = Some(EngineStatus {
                    running: true,
                    last_checked: Utc::now(),
                    spawned: true,
                });
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AppError::EngineUnavailable(format!(
                    "engine did not become ready within {} seconds",
                    self.config.startup_timeout_seconds
                )));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    pub async fn status(&self) -> Option<EngineStatus> {
        self.state.lock().await.status.clone()
    }

    /// Called once at command end. Terminates the engine only when this
    /// process spawned it and `KeepEngineRunning` is false.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        let Some(mut child) = state.child.take() else {
            return;
        };
        if self.config.keep_engine_running {
            debug!("leaving spawned engine running");
            return;
        }
        match child.kill().await {
            Ok(()) => info!("stopped the engine this process started"),
            Err(e) => warn!("failed to stop engine child: {}", e),
        }
    }
}

/// Closed list of well-known install locations, per platform. Only used
/// when `VoiceVox.EnginePath` is not configured.
fn locate_engine() -> Option<PathBuf> {
    for candidate in engine_candidates() {
        if candidate.is_file() {
            debug!("found engine at {}", candidate.display());
            return Some(candidate);
        }
    }
    None
}

#[cfg(target_os = "windows")]
fn engine_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Ok(local) = std::env::var("LOCALAPPDATA") {
        candidates.push(PathBuf::from(local).join("Programs/VOICEVOX/vv-engine/run.exe"));
    }
    if let Ok(programs) = std::env::var("ProgramFiles") {
        candidates.push(PathBuf::from(programs).join("VOICEVOX/vv-engine/run.exe"));
    }
    candidates
}

#[cfg(target_os = "macos")]
fn engine_candidates() -> Vec<PathBuf> {
    let mut candidates = vec![PathBuf::from(
        "/Applications/VOICEVOX.app/Contents/Resources/vv-engine/run",
    )];
    if let Ok(home) = std::env::var("HOME") {
        candidates.push(
            PathBuf::from(home).join("Applications/VOICEVOX.app/Contents/Resources/vv-engine/run"),
        );
    }
    candidates
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn engine_candidates() -> Vec<PathBuf> {
    let mut candidates = vec![PathBuf::from("/opt/voicevox/vv-engine/run")];
    if let Ok(home) = std::env::var("HOME") {
        let home = PathBuf::from(home);
        candidates.push(home.join(".voicevox/vv-engine/run"));
        candidates.push(home.join(".local/share/voicevox/vv-engine/run"));
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(auto_start: bool) -> VoiceVoxConfig {
        VoiceVoxConfig {
            auto_start_engine: auto_start,
            startup_timeout_seconds: 1,
            ..VoiceVoxConfig::default()
        }
    }

    #[tokio::test]
    async fn running_engine_is_detected_and_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/version"))
            .respond_with(ResponseTemplate::new(200).set_body_string("\"0.14.0\""))
            .expect(1)
            .mount(&server)
            .await;

        let client = Arc::new(SynthClient::new(&server.uri(), 5));
        let supervisor = EngineSupervisor::new(client, config(false));

        supervisor.ensure_ready().await.unwrap();
        // Second call answers from the cached status, not a re-probe.
        supervisor.ensure_ready().await.unwrap();

        let status = supervisor.status().await.unwrap();
        assert!(status.running);
        assert!(!status.spawned);
    }

    #[tokio::test]
    async fn unreachable_engine_without_auto_start_is_fatal() {
        let client = Arc::new(SynthClient::new("http://127.0.0.1:1", 5));
        let supervisor = EngineSupervisor::new(client, config(false));
        let err = supervisor.ensure_ready().await.unwrap_err();
        assert!(matches!(err, AppError::EngineUnavailable(_)));
    }

    #[tokio::test]
    async fn missing_engine_executable_is_fatal() {
        let client = Arc::new(SynthClient::new("http://127.0.0.1:1", 5));
        let mut config = config(true);
        config.engine_path = Some(PathBuf::from("/nonexistent/voicevox/run"));
        let supervisor = EngineSupervisor::new(client, config);
        let err = supervisor.ensure_ready().await.unwrap_err();
        assert!(matches!(err, AppError::EngineUnavailable(_)));
    }

    #[tokio::test]
    async fn shutdown_without_child_is_a_no_op() {
        let client = Arc::new(SynthClient::new("http://127.0.0.1:1", 5));
        let supervisor = EngineSupervisor::new(client, config(false));
        supervisor.shutdown().await;
    }
}
