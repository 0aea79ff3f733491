//! The utterance pipeline: segment, resolve, synthesize in the
//! background, and stream playback in input order with filler masking.
//!
//! One background producer walks the pending segments in order while the
//! player consumes the segment list front to back. The producer may
//! finish segments the player has not reached yet, but playback order is
//! always input order. The engine is only contacted when at least one
//! segment actually needs synthesis, so fully-cached runs stay off the
//! network entirely.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::codec;
use crate::engine::client::SynthClient;
use crate::engine::supervisor::EngineSupervisor;
use crate::error::AppError;
use crate::filler::FillerBank;
use crate::fingerprint::VoiceRequest;
use crate::player::AudioOutput;
use crate::segment::{split_segments, Resolution, Segment};

/// How long to wait for outstanding write-throughs after the last
/// segment has played.
const PRODUCER_GRACE: Duration = Duration::from_secs(10);

/// Soft bound on an inter-segment transition. Past this the gap counts
/// as audible and a filler is requested if the bank has one.
const TRANSITION_SOFT_BOUND: Duration = Duration::from_millis(200);

/// Mode flags for one utterance, straight from the command line.
#[derive(Debug, Clone, Default)]
pub struct SpeakOptions {
    pub no_cache: bool,
    pub cache_only: bool,
    pub out_path: Option<std::path::PathBuf>,
    pub no_play: bool,
}

/// Process-wide cancellation signal, shared by every task of a command.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Orchestrator {
    client: Arc<SynthClient>,
    supervisor: Arc<EngineSupervisor>,
    cache: Arc<CacheStore>,
    filler: Arc<FillerBank>,
    cancel: CancelFlag,
}

impl Orchestrator {
    pub fn new(
        client: Arc<SynthClient>,
        supervisor: Arc<EngineSupervisor>,
        cache: Arc<CacheStore>,
        filler: Arc<FillerBank>,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            client,
            supervisor,
            cache,
            filler,
            cancel,
        }
    }

    /// Run one utterance to completion: playback, cache write-throughs,
    /// and the optional `--out` artifact.
    pub async fn speak(
        &self,
        voice: &VoiceRequest,
        options: &SpeakOptions,
        output: Option<&mut dyn AudioOutput>,
    ) -> Result<(), AppError> {
        let texts = split_segments(&voice.text);
        if texts.is_empty() {
            warn!("input contains no speakable text");
            return Ok(());
        }

        if options.no_cache {
            return self.speak_uncached(voice, options, output).await;
        }

        let segments: Vec<Segment> = texts
            .into_iter()
            .enumerate()
            .map(|(index, text)| Segment::build(index, text, voice))
            .collect();

        let mut pending = Vec::new();
        for segment in &segments {
            match self.cache.get(&segment.key, &segment.text).await {
                Some(bytes) => segment.slot.mark_ready(bytes),
                None => pending.push(segment.clone()),
            }
        }
        debug!(
            "{} of {} segments resolved from cache",
            segments.len() - pending.len(),
            segments.len()
        );

        if options.cache_only && !pending.is_empty() {
            return Err(AppError::CacheMiss(format!(
                "{} of {} segments are not cached",
                pending.len(),
                segments.len()
            )));
        }

        let producer = if pending.is_empty() {
            None
        } else {
            self.supervisor.ensure_ready().await?;
            Some(self.spawn_producer(voice, pending))
        };

        let play_result = if options.no_play {
            Ok(())
        } else if let Some(out) = output {
            self.drive_playback(&segments, out).await
        } else {
            Err(AppError::Playback("no audio output available".into()))
        };

        if play_result.is_err() {
            // Stop the producer cooperatively; it finishes its current
            // HTTP call and observes the flag before the next one.
            self.cancel.trigger();
        }
        if let Some(handle) = producer {
            if options.no_play {
                // Only the artifact step runs from here; write-throughs
                // finish in the background while it does.
                debug!("leaving background synthesis to finish on its own");
            } else {
                // Even on a playback error or cancellation the producer
                // keeps its current HTTP call: it observes the cancel
                // flag between segments and stops on its own. Hard-abort
                // only past the grace bound.
                let abort = handle.abort_handle();
                if tokio::time::timeout(PRODUCER_GRACE, handle).await.is_err() {
                    warn!("background synthesis did not finish within the grace period");
                    abort.abort();
                }
            }
        }
        play_result?;

        if let Some(path) = &options.out_path {
            self.write_artifact(voice, path).await?;
        }
        Ok(())
    }

    /// `--no-cache`: one whole-text synthesis call, played and/or written
    /// directly. A synthesis failure here is fatal.
    async fn speak_uncached(
        &self,
        voice: &VoiceRequest,
        options: &SpeakOptions,
        output: Option<&mut dyn AudioOutput>,
    ) -> Result<(), AppError> {
        if self.cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        self.supervisor.ensure_ready().await?;
        let wav = self.client.synthesize(voice).await?;

        if !options.no_play {
            match output {
                Some(out) => out.play(&wav).await?,
                None => return Err(AppError::Playback("no audio output available".into())),
            }
        }
        if let Some(path) = &options.out_path {
            self.write_artifact_bytes(path, &wav).await?;
        }
        Ok(())
    }

    /// Walk the pending segments in order: synthesize, attach, flip
    /// ready, then write through to the cache. A failing segment is
    /// marked unresolvable and the walk continues.
    fn spawn_producer(&self, voice: &VoiceRequest, pending: Vec<Segment>) -> JoinHandle<()> {
        let client = self.client.clone();
        let cache = self.cache.clone();
        let cancel = self.cancel.clone();
        let voice = voice.clone();
        tokio::spawn(async move {
            for segment in pending {
                if cancel.is_cancelled() {
                    segment.slot.mark_failed();
                    continue;
                }
                let request = voice.with_text(segment.text.as_str());
                match client.synthesize(&request).await {
                    Ok(wav) => {
                        segment.slot.mark_ready(wav.clone());
                        // Write-through strictly after the bytes are
                        // attached, so a later cache hit sees the same
                        // payload the player did.
                        cache.put(&segment.key, &wav, &request).await;
                    }
                    Err(e) => {
                        warn!("synthesis for segment {} failed: {}", segment.index, e);
                        segment.slot.mark_failed();
                    }
                }
            }
        })
    }

    /// Play segments in input order. While the next segment is still
    /// being produced, keep playing fillers (when the bank has any);
    /// otherwise wait silently on the readiness signal.
    async fn drive_playback(
        &self,
        segments: &[Segment],
        output: &mut dyn AudioOutput,
    ) -> Result<(), AppError> {
        for segment in segments {
            if self.cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }

            let resolution = loop {
                if let Some(resolution) = segment.slot.poll() {
                    break resolution;
                }
                // Give the producer a short window before the gap counts
                // as audible.
                if let Some(resolution) =
                    segment.slot.wait_resolved_timeout(TRANSITION_SOFT_BOUND).await
                {
                    break resolution;
                }
                if let Some(filler) = self.filler.pick().await {
                    debug!("masking wait for segment {} with filler", segment.index);
                    output.play(&filler).await?;
                    continue;
                }
                break segment.slot.wait_resolved().await;
            };

            if self.cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }
            match resolution {
                Resolution::Ready(audio) => {
                    debug!("playing segment {} ({} bytes)", segment.index, audio.len());
                    output.play(&audio).await?;
                }
                Resolution::Failed => {
                    warn!("segment {} is unresolvable, skipping", segment.index);
                }
            }
        }
        Ok(())
    }

    /// `--out`: synthesize the whole text once, independent of the
    /// per-segment bytes, and write a single coherent artifact.
    async fn write_artifact(&self, voice: &VoiceRequest, path: &Path) -> Result<(), AppError> {
        self.supervisor.ensure_ready().await?;
        let wav = self.client.synthesize(voice).await?;
        self.write_artifact_bytes(path, &wav).await
    }

    async fn write_artifact_bytes(&self, path: &Path, wav: &[u8]) -> Result<(), AppError> {
        let wants_mp3 = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("mp3"));
        let bytes = if wants_mp3 {
            codec::wav_to_mp3(wav)?
        } else {
            wav.to_vec()
        };
        tokio::fs::write(path, &bytes)
            .await
            .map_err(|e| AppError::io(format!("writing {}", path.display()), e))?;
        info!("wrote {} bytes to {}", bytes.len(), path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Sidecar;
    use crate::config::{FillerConfig, VoiceVoxConfig};
    use crate::testutil::{audio_query_body, make_wav_bytes, mount_engine};
    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{body_partial_json, method, path as urlpath, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Records every blob the orchestrator plays, in order.
    #[derive(Default)]
    struct RecordingOutput {
        played: Vec<Vec<u8>>,
    }

    #[async_trait]
    impl AudioOutput for RecordingOutput {
        async fn play(&mut self, audio: &[u8]) -> Result<(), AppError> {
            self.played.push(audio.to_vec());
            Ok(())
        }
    }

    struct Fixture {
        _cache_dir: TempDir,
        _filler_dir: TempDir,
        orchestrator: Orchestrator,
    }

    /// Wire an orchestrator against a mock engine and existing cache and
    /// filler directories.
    fn build_at(server_uri: &str, cache_path: &Path, filler_path: &Path) -> Orchestrator {
        build_at_with_cancel(server_uri, cache_path, filler_path, CancelFlag::new())
    }

    fn build_at_with_cancel(
        server_uri: &str,
        cache_path: &Path,
        filler_path: &Path,
        cancel: CancelFlag,
    ) -> Orchestrator {
        let client = Arc::new(SynthClient::new(server_uri, 5));
        let supervisor = Arc::new(EngineSupervisor::new(
            client.clone(),
            VoiceVoxConfig {
                auto_start_engine: false,
                ..VoiceVoxConfig::default()
            },
        ));
        let cache = Arc::new(CacheStore::open(cache_path.to_path_buf(), 30, 1.0).unwrap());
        let filler = Arc::new(
            FillerBank::open(&FillerConfig::default(), filler_path.to_path_buf(), 30).unwrap(),
        );
        Orchestrator::new(client, supervisor, cache, filler, cancel)
    }

    fn build(server_uri: &str, cache_dir: TempDir, filler_dir: TempDir) -> Fixture {
        Fixture {
            orchestrator: build_at(server_uri, cache_dir.path(), filler_dir.path()),
            _cache_dir: cache_dir,
            _filler_dir: filler_dir,
        }
    }

    fn fixture(server_uri: &str) -> Fixture {
        build(
            server_uri,
            TempDir::new().unwrap(),
            TempDir::new().unwrap(),
        )
    }

    /// Mount an engine whose synthesis output differs per input text, so
    /// tests can verify playback order end to end.
    async fn mount_marked_engine(server: &MockServer, texts: &[&str]) -> Vec<Vec<u8>> {
        Mock::given(method("GET"))
            .and(urlpath("/version"))
            .respond_with(ResponseTemplate::new(200).set_body_string("\"0.14.0\""))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(urlpath("/initialize_speaker"))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;

        let mut outputs = Vec::new();
        for (marker, text) in texts.iter().enumerate() {
            let mut query = audio_query_body();
            query["marker"] = json!(marker);
            Mock::given(method("POST"))
                .and(urlpath("/audio_query"))
                .and(query_param("text", *text))
                .respond_with(ResponseTemplate::new(200).set_body_json(query))
                .mount(server)
                .await;

            let wav = make_wav_bytes(20 + 20 * marker as u32);
            Mock::given(method("POST"))
                .and(urlpath("/synthesis"))
                .and(body_partial_json(json!({ "marker": marker })))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(wav.clone()))
                .mount(server)
                .await;
            outputs.push(wav);
        }
        outputs
    }

    /// Write a valid payload + sidecar pair directly into a store
    /// directory.
    fn seed_entry(dir: &Path, key: &str, text: &str, payload: &[u8]) {
        let sidecar = Sidecar {
            created_at: chrono::Utc::now(),
            text: text.to_string(),
            speaker_id: 1,
            speed: 1.0,
            pitch: 0.0,
            volume: 1.0,
        };
        std::fs::write(dir.join(format!("{key}.mp3")), payload).unwrap();
        std::fs::write(
            dir.join(format!("{key}.meta.json")),
            serde_json::to_string(&sidecar).unwrap(),
        )
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn plays_segments_in_input_order() {
        let server = MockServer::start().await;
        let expected =
            mount_marked_engine(&server, &["一。", "二。", "三。"]).await;
        let fx = fixture(&server.uri());

        let mut out = RecordingOutput::default();
        fx.orchestrator
            .speak(
                &VoiceRequest::new("一。二。三。", 1),
                &SpeakOptions::default(),
                Some(&mut out),
            )
            .await
            .unwrap();

        assert_eq!(out.played, expected);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_run_plays_from_cache_with_no_http() {
        let cache_dir = TempDir::new().unwrap();
        let filler_dir = TempDir::new().unwrap();
        let voice = VoiceRequest::new("こんにちは、世界！", 1);

        // First run populates the cache through a live mock engine.
        {
            let server = MockServer::start().await;
            mount_engine(&server).await;
            let orchestrator = build_at(&server.uri(), cache_dir.path(), filler_dir.path());
            let mut out = RecordingOutput::default();
            orchestrator
                .speak(&voice, &SpeakOptions::default(), Some(&mut out))
                .await
                .unwrap();
            assert_eq!(out.played.len(), 1);
        }

        // Second run against a silent server: every endpoint, including
        // /version, must stay untouched.
        let silent = MockServer::start().await;
        Mock::given(method("GET"))
            .and(urlpath("/version"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&silent)
            .await;
        Mock::given(method("POST"))
            .and(urlpath("/audio_query"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&silent)
            .await;

        let orchestrator = build_at(&silent.uri(), cache_dir.path(), filler_dir.path());
        let mut out = RecordingOutput::default();
        orchestrator
            .speak(&voice, &SpeakOptions::default(), Some(&mut out))
            .await
            .unwrap();
        assert_eq!(out.played.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn edited_text_reuses_the_shared_prefix() {
        let cache_dir = TempDir::new().unwrap();
        let filler_dir = TempDir::new().unwrap();

        {
            let server = MockServer::start().await;
            mount_engine(&server).await;
            let orchestrator = build_at(&server.uri(), cache_dir.path(), filler_dir.path());
            let mut out = RecordingOutput::default();
            orchestrator
                .speak(
                    &VoiceRequest::new("おはようございます。今日は良い天気ですね。", 1),
                    &SpeakOptions::default(),
                    Some(&mut out),
                )
                .await
                .unwrap();
        }

        // Second sentence edited: exactly one query/synthesis pair may
        // run; the first segment must come from the cache.
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(urlpath("/version"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(urlpath("/initialize_speaker"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(urlpath("/audio_query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(audio_query_body()))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(urlpath("/synthesis"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(make_wav_bytes(20)))
            .expect(1)
            .mount(&server)
            .await;

        let orchestrator = build_at(&server.uri(), cache_dir.path(), filler_dir.path());
        let mut out = RecordingOutput::default();
        orchestrator
            .speak(
                &VoiceRequest::new("おはようございます。今日は雨が降っています。", 1),
                &SpeakOptions::default(),
                Some(&mut out),
            )
            .await
            .unwrap();
        assert_eq!(out.played.len(), 2);
    }

    #[tokio::test]
    async fn cache_only_with_cold_cache_fails_before_any_http() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(urlpath("/version"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(urlpath("/audio_query"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let fx = fixture(&server.uri());

        let mut out = RecordingOutput::default();
        let err = fx
            .orchestrator
            .speak(
                &VoiceRequest::new("テスト", 1),
                &SpeakOptions {
                    cache_only: true,
                    ..SpeakOptions::default()
                },
                Some(&mut out),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::CacheMiss(_)));
        assert!(out.played.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn different_speakers_get_distinct_entries() {
        let server = MockServer::start().await;
        mount_engine(&server).await;
        let fx = fixture(&server.uri());

        for speaker in [2u32, 3u32] {
            let mut out = RecordingOutput::default();
            fx.orchestrator
                .speak(
                    &VoiceRequest::new("テスト", speaker),
                    &SpeakOptions::default(),
                    Some(&mut out),
                )
                .await
                .unwrap();
        }

        let payloads = std::fs::read_dir(fx._cache_dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".mp3")
            })
            .count();
        assert_eq!(payloads, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn out_with_no_play_writes_artifact_and_warms_cache() {
        let server = MockServer::start().await;
        mount_engine(&server).await;
        let fx = fixture(&server.uri());
        let out_dir = TempDir::new().unwrap();
        let out_path = out_dir.path().join("x.mp3");

        fx.orchestrator
            .speak(
                &VoiceRequest::new("テスト。", 1),
                &SpeakOptions {
                    no_play: true,
                    out_path: Some(out_path.clone()),
                    ..SpeakOptions::default()
                },
                None,
            )
            .await
            .unwrap();

        let artifact = std::fs::read(&out_path).unwrap();
        assert_eq!(codec::sniff(&artifact), codec::AudioKind::Mp3);

        // Under --no-play the producer is not awaited, so its
        // write-through may land just after speak() returns. Give it a
        // bounded window.
        let count_payloads = || {
            std::fs::read_dir(fx._cache_dir.path())
                .unwrap()
                .filter(|e| {
                    e.as_ref()
                        .unwrap()
                        .file_name()
                        .to_string_lossy()
                        .ends_with(".mp3")
                })
                .count()
        };
        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while count_payloads() < 1 {
            assert!(
                std::time::Instant::now() < deadline,
                "segment write-through never landed"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test]
    async fn blank_input_is_a_no_op_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(urlpath("/version"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let fx = fixture(&server.uri());

        let mut out = RecordingOutput::default();
        fx.orchestrator
            .speak(
                &VoiceRequest::new("   ", 1),
                &SpeakOptions::default(),
                Some(&mut out),
            )
            .await
            .unwrap();
        assert!(out.played.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_segment_is_skipped_not_fatal() {
        let server = MockServer::start().await;
        mount_engine(&server).await;
        // The middle sentence's query fails; the mock takes precedence
        // over the catch-all mounted by mount_engine.
        Mock::given(method("POST"))
            .and(urlpath("/audio_query"))
            .and(query_param("text", "二。"))
            .respond_with(ResponseTemplate::new(500))
            .with_priority(1)
            .mount(&server)
            .await;
        let fx = fixture(&server.uri());

        let mut out = RecordingOutput::default();
        fx.orchestrator
            .speak(
                &VoiceRequest::new("一。二。三。", 1),
                &SpeakOptions::default(),
                Some(&mut out),
            )
            .await
            .unwrap();

        assert_eq!(out.played.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn no_cache_synthesizes_the_whole_text_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(urlpath("/version"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(urlpath("/initialize_speaker"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(urlpath("/audio_query"))
            .and(query_param("text", "一。二。"))
            .respond_with(ResponseTemplate::new(200).set_body_json(audio_query_body()))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(urlpath("/synthesis"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(make_wav_bytes(20)))
            .expect(1)
            .mount(&server)
            .await;
        let fx = fixture(&server.uri());

        let mut out = RecordingOutput::default();
        fx.orchestrator
            .speak(
                &VoiceRequest::new("一。二。", 1),
                &SpeakOptions {
                    no_cache: true,
                    ..SpeakOptions::default()
                },
                Some(&mut out),
            )
            .await
            .unwrap();

        assert_eq!(out.played.len(), 1);
        // The cache path was skipped entirely.
        let cached = std::fs::read_dir(fx._cache_dir.path()).unwrap().count();
        assert_eq!(cached, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn filler_masks_a_slow_segment() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(urlpath("/version"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(urlpath("/initialize_speaker"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(urlpath("/audio_query"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(audio_query_body())
                    .set_delay(Duration::from_millis(400)),
            )
            .mount(&server)
            .await;
        let wav = make_wav_bytes(20);
        Mock::given(method("POST"))
            .and(urlpath("/synthesis"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(wav.clone()))
            .mount(&server)
            .await;

        let cache_dir = TempDir::new().unwrap();
        let filler_dir = TempDir::new().unwrap();
        let filler_bytes = vec![0xFF, 0xFB, 0x01, 0x02, 0x03];
        seed_entry(filler_dir.path(), &"a".repeat(64), "えーと。", &filler_bytes);
        let fx = build(&server.uri(), cache_dir, filler_dir);

        let mut out = RecordingOutput::default();
        fx.orchestrator
            .speak(
                &VoiceRequest::new("遅い文。", 1),
                &SpeakOptions::default(),
                Some(&mut out),
            )
            .await
            .unwrap();

        // At least one filler played before the real segment, and the
        // real segment came last.
        assert!(out.played.len() >= 2);
        assert_eq!(out.played[0], filler_bytes);
        assert_eq!(out.played.last().unwrap(), &wav);
    }

    /// Plays one blob, then raises the cancellation flag shortly after,
    /// the way a Ctrl-C mid-utterance would.
    struct CancellingOutput {
        cancel: CancelFlag,
        played: usize,
    }

    #[async_trait]
    impl AudioOutput for CancellingOutput {
        async fn play(&mut self, _audio: &[u8]) -> Result<(), AppError> {
            self.played += 1;
            // Small delay so the producer is inside its HTTP call when
            // the flag flips.
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.cancel.trigger();
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancellation_spares_the_in_flight_synthesis() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(urlpath("/version"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(urlpath("/initialize_speaker"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(urlpath("/audio_query"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(audio_query_body())
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(urlpath("/synthesis"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(make_wav_bytes(20)))
            .mount(&server)
            .await;

        let cache_dir = TempDir::new().unwrap();
        let filler_dir = TempDir::new().unwrap();
        let voice = VoiceRequest::new("一。二。", 1);

        // First segment pre-cached: the producer's only job is the
        // second, whose query is still in flight when the flag flips.
        let first_key = voice.with_text("一。").cache_key();
        seed_entry(cache_dir.path(), &first_key, "一。", &[0xFF, 0xFB, 0x09, 0x08]);

        let cancel = CancelFlag::new();
        let orchestrator = build_at_with_cancel(
            &server.uri(),
            cache_dir.path(),
            filler_dir.path(),
            cancel.clone(),
        );

        let mut out = CancellingOutput { cancel, played: 0 };
        let err = orchestrator
            .speak(&voice, &SpeakOptions::default(), Some(&mut out))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Cancelled));
        assert_eq!(out.played, 1);
        // The producer finished its current call cooperatively and the
        // write-through landed: it was not aborted mid-request.
        let second_key = voice.with_text("二。").cache_key();
        assert!(cache_dir.path().join(format!("{second_key}.mp3")).exists());
    }
}
