//! Audio playback.
//!
//! rodio's `OutputStream` is `!Send`, so the device lives on a dedicated
//! OS thread that owns the stream and sink for the whole utterance; the
//! async side talks to it over a command channel. Opening the device once
//! and reusing the sink across segments is what keeps inter-segment
//! latency low.

use std::io::Cursor;
use std::time::Duration;

use async_trait::async_trait;
use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
use tokio::sync::oneshot;
use tracing::debug;

use crate::codec::{self, AudioKind};
use crate::config::AudioConfig;
use crate::error::AppError;

/// The seam between the orchestrator and the audio device. Production
/// uses [`RodioPlayer`]; tests substitute a recorder.
#[async_trait]
pub trait AudioOutput: Send {
    /// Play one blob to completion.
    async fn play(&mut self, audio: &[u8]) -> Result<(), AppError>;
}

enum PlayCmd {
    Play(Vec<u8>, oneshot::Sender<Result<(), String>>),
    Close,
}

pub struct RodioPlayer {
    cmd_tx: std::sync::mpsc::Sender<PlayCmd>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl RodioPlayer {
    /// Open the configured output device, optionally pre-warming it with
    /// near-silence so aggressive power-saving devices do not clip the
    /// first segment.
    pub async fn open(config: &AudioConfig) -> Result<Self, AppError> {
        let (cmd_tx, cmd_rx) = std::sync::mpsc::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let config = config.clone();
        let thread = std::thread::Builder::new()
            .name("vvsay-playback".into())
            .spawn(move || playback_thread(config, cmd_rx, ready_tx))
            .map_err(|e| AppError::Playback(format!("failed to spawn playback thread: {e}")))?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(Self {
                cmd_tx,
                thread: Some(thread),
            }),
            Ok(Err(message)) => {
                let _ = thread.join();
                Err(AppError::Playback(message))
            }
            Err(_) => {
                let _ = thread.join();
                Err(AppError::Playback("playback thread exited during startup".into()))
            }
        }
    }
}

#[async_trait]
impl AudioOutput for RodioPlayer {
    async fn play(&mut self, audio: &[u8]) -> Result<(), AppError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.cmd_tx
            .send(PlayCmd::Play(audio.to_vec(), done_tx))
            .map_err(|_| AppError::Playback("playback thread is gone".into()))?;
        match done_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(AppError::Playback(message)),
            Err(_) => Err(AppError::Playback("playback thread dropped the request".into())),
        }
    }
}

impl Drop for RodioPlayer {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(PlayCmd::Close);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn playback_thread(
    config: AudioConfig,
    cmd_rx: std::sync::mpsc::Receiver<PlayCmd>,
    ready_tx: oneshot::Sender<Result<(), String>>,
) {
    let (stream, handle) = match open_stream(&config) {
        Ok(pair) => pair,
        Err(message) => {
            let _ = ready_tx.send(Err(message));
            return;
        }
    };
    // Held for the lifetime of the thread; dropping it closes the device.
    let _stream = stream;

    let sink = match Sink::try_new(&handle) {
        Ok(sink) => sink,
        Err(e) => {
            let _ = ready_tx.send(Err(format!("failed to create audio sink: {e}")));
            return;
        }
    };
    sink.set_volume(config.volume);

    if config.prepare_device {
        debug!(
            "pre-warming output device for {} ms",
            config.preparation_duration_ms
        );
        let warmup = rodio::source::SineWave::new(100.0)
            .take_duration(Duration::from_millis(config.preparation_duration_ms))
            .amplify(config.preparation_volume);
        sink.append(warmup);
        sink.sleep_until_end();
    }

    let _ = ready_tx.send(Ok(()));

    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            PlayCmd::Play(bytes, done) => {
                let result = append_blob(&sink, bytes);
                if result.is_ok() {
                    sink.sleep_until_end();
                }
                let _ = done.send(result);
            }
            PlayCmd::Close => break,
        }
    }

    // Drain whatever is still buffered before releasing the device.
    sink.sleep_until_end();
}

fn open_stream(config: &AudioConfig) -> Result<(OutputStream, OutputStreamHandle), String> {
    if config.output_device < 0 {
        return OutputStream::try_default()
            .map_err(|e| format!("failed to open default output device: {e}"));
    }
    use rodio::cpal::traits::HostTrait;
    let host = rodio::cpal::default_host();
    let device = host
        .output_devices()
        .map_err(|e| format!("device enumeration failed: {e}"))?
        .nth(config.output_device as usize)
        .ok_or_else(|| format!("no output device at index {}", config.output_device))?;
    OutputStream::try_from_device(&device)
        .map_err(|e| format!("failed to open output device {}: {e}", config.output_device))
}

fn append_blob(sink: &Sink, bytes: Vec<u8>) -> Result<(), String> {
    let kind = codec::sniff(&bytes);
    let cursor = Cursor::new(bytes);
    let decoder = match kind {
        AudioKind::Wav => rodio::Decoder::new_wav(cursor),
        // The probing decoder tries MP3 first via symphonia and falls
        // back to WAV for anything the sniff missed.
        AudioKind::Mp3 | AudioKind::Unknown => rodio::Decoder::new(cursor),
    }
    .map_err(|e| format!("could not decode audio: {e}"))?;
    sink.append(decoder);
    Ok(())
}
