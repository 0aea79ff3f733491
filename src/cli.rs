//! Command-line surface and top-level dispatch.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::warn;

use crate::cache::CacheStore;
use crate::config::AppConfig;
use crate::devices;
use crate::engine::client::SynthClient;
use crate::engine::supervisor::EngineSupervisor;
use crate::error::AppError;
use crate::filler::FillerBank;
use crate::fingerprint::VoiceRequest;
use crate::orchestrator::{CancelFlag, Orchestrator, SpeakOptions};
use crate::player::RodioPlayer;

#[derive(Parser, Debug)]
#[command(
    name = "vvsay",
    version,
    about = "Speak Japanese text through a local VOICEVOX engine, with cached instant playback",
    subcommand_negates_reqs = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Text to speak
    #[arg(value_name = "TEXT", required_unless_present_any = ["init", "clear"])]
    pub text: Option<String>,

    /// Speaker style id (defaults to VoiceVox.DefaultSpeaker)
    #[arg(long)]
    pub speaker: Option<u32>,

    /// Speech speed scale
    #[arg(long, default_value_t = 1.0)]
    pub speed: f32,

    /// Pitch scale
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    pub pitch: f32,

    /// Synthesis volume scale
    #[arg(long, default_value_t = 1.0)]
    pub volume: f32,

    /// Bypass the cache: synthesize the whole text in one call
    #[arg(long, conflicts_with = "cache_only")]
    pub no_cache: bool,

    /// Fail instead of synthesizing when any segment is uncached
    #[arg(long)]
    pub cache_only: bool,

    /// Write the utterance to a file (.mp3 transcodes, .wav writes raw)
    #[arg(long, value_name = "PATH")]
    pub out: Option<PathBuf>,

    /// Skip playback
    #[arg(long)]
    pub no_play: bool,

    /// Pre-synthesize the filler bank
    #[arg(long)]
    pub init: bool,

    /// Remove every entry in both cache directories
    #[arg(long)]
    pub clear: bool,

    /// Debug-level logging
    #[arg(long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the engine's speakers and styles (requires the engine)
    Speakers,
    /// List audio output devices
    Devices {
        /// Include each device's default stream configuration
        #[arg(long)]
        full: bool,
        /// Emit a JSON array instead of text
        #[arg(long)]
        json: bool,
    },
}

/// Execute one invocation end to end. Every declared failure maps to
/// exit code 1 in `main`.
pub async fn run(cli: Cli) -> Result<(), AppError> {
    let config = AppConfig::load();
    config.validate()?;

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping");
                cancel.trigger();
            }
        });
    }

    let client = Arc::new(SynthClient::new(
        &config.voice_vox.base_url,
        config.voice_vox.connection_timeout,
    ));
    let supervisor = Arc::new(EngineSupervisor::new(
        client.clone(),
        config.voice_vox.clone(),
    ));

    let result = dispatch(&cli, &config, client, supervisor.clone(), cancel).await;
    // The engine child outlives the command only when configured to.
    supervisor.shutdown().await;
    result
}

async fn dispatch(
    cli: &Cli,
    config: &AppConfig,
    client: Arc<SynthClient>,
    supervisor: Arc<EngineSupervisor>,
    cancel: CancelFlag,
) -> Result<(), AppError> {
    match &cli.command {
        Some(Command::Devices { full, json }) => {
            let listing = devices::list_output_devices(*full)?;
            print!("{}", devices::render_devices(&listing, *json));
            return Ok(());
        }
        Some(Command::Speakers) => {
            supervisor.ensure_ready().await?;
            for speaker in client.speakers().await? {
                println!("{}  (v{})", speaker.name, speaker.version);
                for style in speaker.styles {
                    println!("  {:>4}  {}", style.id, style.name);
                }
            }
            return Ok(());
        }
        None => {}
    }

    let cache = Arc::new(CacheStore::open(
        config.cache_dir(),
        config.cache.expiration_days,
        config.cache.max_size_gb,
    )?);
    let filler = Arc::new(FillerBank::open(
        &config.filler,
        config.filler_dir(),
        config.cache.expiration_days,
    )?);

    if cli.clear {
        let removed = cache.clear_all().await? + filler.clear_all().await?;
        println!("removed {removed} cache files");
    }

    if cli.init {
        supervisor.ensure_ready().await?;
        let base = VoiceRequest::new("", config.voice_vox.default_speaker);
        let available = filler.init(&client, &base).await?;
        println!("{available} filler entries ready");
    }

    let Some(text) = &cli.text else {
        return Ok(());
    };

    let voice = VoiceRequest {
        text: text.clone(),
        speaker: cli.speaker.unwrap_or(config.voice_vox.default_speaker),
        speed: cli.speed,
        pitch: cli.pitch,
        volume: cli.volume,
    };
    validate_voice(&voice)?;

    let options = SpeakOptions {
        no_cache: cli.no_cache,
        cache_only: cli.cache_only,
        out_path: cli.out.clone(),
        no_play: cli.no_play,
    };
    let orchestrator = Orchestrator::new(client, supervisor, cache, filler, cancel);

    if options.no_play {
        orchestrator.speak(&voice, &options, None).await
    } else {
        let mut player = RodioPlayer::open(&config.audio).await?;
        orchestrator.speak(&voice, &options, Some(&mut player)).await
    }
}

fn validate_voice(voice: &VoiceRequest) -> Result<(), AppError> {
    if voice.speed <= 0.0 {
        return Err(AppError::Config("--speed must be positive".into()));
    }
    if !(0.0..=2.0).contains(&voice.volume) {
        return Err(AppError::Config("--volume must be between 0.0 and 2.0".into()));
    }
    Ok(())
}
