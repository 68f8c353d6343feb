//! Voice-activity detection and turn segmentation.
//!
//! The segmenter consumes inbound PCM frames from one session and emits
//! finalised utterances. Detection is dual-threshold RMS: a higher start
//! threshold opens an utterance, a lower hold threshold keeps it open
//! (hysteresis against dropouts), and a silence hangover closes it. A
//! pre-roll ring of recent frames is prepended to each utterance so word
//! onsets are not clipped.
//!
//! The segmenter is a pure state machine: callers feed frames together with
//! a monotonic `now`, so tests can drive it without a clock.

use std::collections::VecDeque;
use std::time::Instant;

use crate::pcm::{concat_frames, downmix_to_mono, rms_level};

/// Segmentation parameters.
///
/// The pre-roll bound is expressed in frames; with the 10 ms frames the
/// loopback engine delivers it spans roughly 220 ms.
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// RMS (normalised) at or above which speech starts.
    pub start_threshold: f32,
    /// RMS at or above which in-progress speech is held open.
    pub hold_threshold: f32,
    /// Silence duration that finalises an utterance.
    pub silence_hangover_ms: u64,
    /// Utterances with less speech than this are dropped.
    pub min_utterance_ms: u64,
    /// Hard cap on utterance duration.
    pub max_utterance_ms: u64,
    /// Number of recent frames retained for the pre-roll.
    pub pre_roll_frames: usize,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            start_threshold: 0.015,
            hold_threshold: 0.008,
            silence_hangover_ms: 2_000,
            min_utterance_ms: 500,
            max_utterance_ms: 18_000,
            pre_roll_frames: 22,
        }
    }
}

/// A finalised utterance: contiguous PCM-16 mono at the offered rate.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl Utterance {
    /// Duration in milliseconds at the utterance sample rate.
    pub fn duration_ms(&self) -> u64 {
        self.samples.len() as u64 * 1000 / self.sample_rate as u64
    }
}

/// Per-session VAD state machine.
pub struct TurnSegmenter {
    config: VadConfig,
    in_speech: bool,
    last_voice_at: Option<Instant>,
    utterance_started_at: Option<Instant>,
    utterance_sample_rate: u32,
    utterance_samples: usize,
    utterance_frames: Vec<Vec<i16>>,
    pre_roll: VecDeque<Vec<i16>>,
}

impl TurnSegmenter {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            in_speech: false,
            last_voice_at: None,
            utterance_started_at: None,
            utterance_sample_rate: 0,
            utterance_samples: 0,
            utterance_frames: Vec::new(),
            pre_roll: VecDeque::new(),
        }
    }

    /// Feeds one captured frame; returns a finalised utterance when the
    /// frame closed a turn.
    ///
    /// Frames with a sample rate outside [8000, 96000] Hz are rejected.
    /// The mono frame is copied into the ring and the utterance buffer;
    /// audio sinks reuse their PCM buffers, so borrowing is not safe here.
    pub fn push_frame(
        &mut self,
        samples: &[i16],
        sample_rate: u32,
        channels: u16,
        now: Instant,
    ) -> Option<Utterance> {
        if !(8_000..=96_000).contains(&sample_rate) {
            return None;
        }

        let mono = downmix_to_mono(samples, channels);
        let level = rms_level(&mono);

        self.pre_roll.push_back(mono.clone());
        while self.pre_roll.len() > self.config.pre_roll_frames {
            self.pre_roll.pop_front();
        }

        if !self.in_speech {
            if level < self.config.start_threshold {
                return None;
            }
            self.in_speech = true;
            self.utterance_frames = self.pre_roll.iter().cloned().collect();
            self.utterance_samples = self.utterance_frames.iter().map(Vec::len).sum();
            self.utterance_sample_rate = sample_rate;
            self.utterance_started_at = Some(now);
            self.last_voice_at = Some(now);
        } else {
            self.utterance_samples += mono.len();
            self.utterance_frames.push(mono);
            if level >= self.config.hold_threshold {
                self.last_voice_at = Some(now);
            }
        }

        self.evaluate_finalisation(now)
    }

    /// Clears all speech state. The pre-roll ring survives so a follow-up
    /// utterance still gets its onset frames.
    pub fn reset(&mut self) {
        self.in_speech = false;
        self.last_voice_at = None;
        self.utterance_started_at = None;
        self.utterance_sample_rate = 0;
        self.utterance_samples = 0;
        self.utterance_frames.clear();
    }

    pub fn in_speech(&self) -> bool {
        self.in_speech
    }

    fn evaluate_finalisation(&mut self, now: Instant) -> Option<Utterance> {
        let utterance_ms =
            self.utterance_samples as u64 * 1000 / self.utterance_sample_rate.max(1) as u64;
        let silence_ms = self
            .last_voice_at
            .map(|t| now.duration_since(t).as_millis() as u64)
            .unwrap_or(0);

        if utterance_ms >= self.config.max_utterance_ms {
            return Some(self.finalise());
        }
        if silence_ms >= self.config.silence_hangover_ms {
            // The buffer includes the hangover tail; the minimum applies to
            // the speech content ahead of it.
            let speech_ms = utterance_ms.saturating_sub(silence_ms);
            if speech_ms >= self.config.min_utterance_ms {
                return Some(self.finalise());
            }
            self.reset();
        }
        None
    }

    fn finalise(&mut self) -> Utterance {
        let utterance = Utterance {
            samples: concat_frames(&self.utterance_frames),
            sample_rate: self.utterance_sample_rate,
        };
        self.reset();
        utterance
    }
}
