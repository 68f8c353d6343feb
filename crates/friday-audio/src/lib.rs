//! Audio primitives for the Friday voice bridge.
//!
//! Three concerns live here, all engine-agnostic:
//!
//! - [`pcm`]: WAV/PCM-16 mono packaging, multi-channel downmix, frame
//!   concatenation, and RMS level computation.
//! - [`vad`]: the dual-threshold voice-activity detector that segments an
//!   inbound frame stream into finalised utterances.
//! - [`pacer`]: the outbound playback pacer that meters fixed-duration PCM
//!   frames into an audio sink at a steady wall-clock cadence.

pub mod pacer;
pub mod pcm;
pub mod vad;

pub use pacer::{Pacer, PlaybackSink, SinkClosed, PLAYBACK_SAMPLE_RATE, SAMPLES_PER_FRAME};
pub use pcm::AudioError;
pub use vad::{TurnSegmenter, Utterance, VadConfig};
