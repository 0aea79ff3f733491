use thiserror::Error;

use crate::engine::client::SynthError;

/// Fatal error kinds surfaced to the command line.
///
/// Every variant maps to exit code 1 with a single-line message.
/// Cache corruption never appears here — the cache downgrades it to a miss.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error(transparent)]
    Synth(#[from] SynthError),

    #[error("not cached: {0}")]
    CacheMiss(String),

    #[error("playback failed: {0}")]
    Playback(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cancelled")]
    Cancelled,

    #[error("audio conversion failed: {0}")]
    Codec(#[from] crate::codec::CodecError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl AppError {
    /// Wrap an I/O error with a short human-readable context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}
