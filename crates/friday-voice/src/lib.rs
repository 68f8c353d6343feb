//! Speech and language collaborators for the Friday voice bridge.
//!
//! Each collaborator is a fallback chain: a primary local binary driven as
//! a subprocess, then a remote HTTP service where one is configured. All
//! temporary audio files live under the OS temp directory with fresh unique
//! names and are unlinked after use, including on error paths. Every
//! invocation is bounded by a timeout; a timeout is a recoverable failure
//! that steps the chain.

pub mod config;
pub mod decode;
pub mod error;
pub mod llm;
pub mod probe;
pub mod stt;
pub mod tts;

pub use config::VoiceConfig;
pub use decode::MediaDecoder;
pub use error::VoiceError;
pub use llm::LlmClient;
pub use probe::verify_tools;
pub use stt::SttService;
pub use tts::{SynthesizedAudio, TtsService};
