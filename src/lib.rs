//! Cached text-to-speech playback for local VOICEVOX engines.
//!
//! The pipeline: input text is split into sentence segments, each segment
//! resolves against a content-addressed on-disk cache, misses are
//! synthesized by a background producer through the serialized engine
//! client, and playback streams the segments in input order, masking
//! still-cooking segments with pre-synthesized fillers.

pub mod cache;
pub mod cli;
pub mod codec;
pub mod config;
pub mod devices;
pub mod engine;
pub mod error;
pub mod filler;
pub mod fingerprint;
pub mod orchestrator;
pub mod player;
pub mod segment;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::AppConfig;
pub use error::AppError;
pub use fingerprint::VoiceRequest;
