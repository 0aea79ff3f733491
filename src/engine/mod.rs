pub mod client;
pub mod supervisor;

pub use client::{Speaker, SpeakerStyle, SynthClient, SynthError};
pub use supervisor::{EngineStatus, EngineSupervisor};
