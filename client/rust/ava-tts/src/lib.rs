mod error;

pub mod audio;
pub mod config;
pub mod engine;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod speaker;
pub mod streamer;
pub mod tag_speaker;
pub mod tags;
pub mod timing;
pub mod ws;

#[cfg(test)]
mod testing;

pub use config::{Config, EngineConfig};
pub use engine::{Engine, SessionHints, SessionState, VolcEngine};
pub use error::{Result, TtsError};
pub use queue::PlaybackQueue;
pub use registry::SpeakerRegistry;
pub use speaker::{Progress, SayRequest, Speaker};
pub use streamer::Streamer;
pub use tag_speaker::TagAwareSpeaker;
pub use tags::{TagCallbacks, TagParser};
pub use timing::{SentenceTiming, WordTiming};
