//! Collaborator configuration.

use serde::Deserialize;
use std::fmt;

fn default_stt_binary() -> String {
    "whisper-cli".to_string()
}

fn default_tts_binary() -> String {
    "piper".to_string()
}

fn default_decoder_binary() -> String {
    "ffmpeg".to_string()
}

fn default_llm_url() -> String {
    "https://api.openai.com/v1/responses".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_stt_api_url() -> String {
    "https://api.openai.com/v1/audio/transcriptions".to_string()
}

fn default_stt_models() -> Vec<String> {
    vec!["whisper-1".to_string()]
}

fn default_tts_api_url() -> String {
    "https://api.openai.com/v1/audio/speech".to_string()
}

fn default_tts_model() -> String {
    "tts-1".to_string()
}

fn default_tts_voice() -> String {
    "alloy".to_string()
}

fn default_tts_format() -> String {
    "ogg".to_string()
}

/// Collaborator endpoints, binaries, and credentials.
///
/// Remote fallbacks are considered configured only when `llm_api_key` is
/// non-empty; the tool probe uses the same rule.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Local transcription binary; takes the path to a container file and
    /// prints the transcript on stdout.
    pub stt_binary: String,
    /// Local synthesis binary; takes text and an output path and writes a
    /// container file.
    pub tts_binary: String,
    /// Media decoder binary (ffmpeg-compatible argument surface).
    pub decoder_binary: String,

    /// LLM endpoint URL.
    pub llm_url: String,
    /// Bearer key for the remote services.
    pub llm_api_key: String,
    /// LLM model id.
    pub llm_model: String,

    /// Remote transcription endpoint (multipart upload, returns `{text}`).
    pub stt_api_url: String,
    /// Remote transcription models, tried in order until one yields text.
    pub stt_models: Vec<String>,

    /// Remote synthesis endpoint (JSON request, raw audio response).
    pub tts_api_url: String,
    pub tts_model: String,
    pub tts_voice: String,
    /// Container format tag of synthesised audio.
    pub tts_format: String,

    /// Opaque gateway token forwarded with LLM requests.
    pub gateway_token: String,
    /// Opaque session key forwarded with LLM requests.
    pub session_key: String,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            stt_binary: default_stt_binary(),
            tts_binary: default_tts_binary(),
            decoder_binary: default_decoder_binary(),
            llm_url: default_llm_url(),
            llm_api_key: String::new(),
            llm_model: default_llm_model(),
            stt_api_url: default_stt_api_url(),
            stt_models: default_stt_models(),
            tts_api_url: default_tts_api_url(),
            tts_model: default_tts_model(),
            tts_voice: default_tts_voice(),
            tts_format: default_tts_format(),
            gateway_token: String::new(),
            session_key: String::new(),
        }
    }
}

impl fmt::Debug for VoiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoiceConfig")
            .field("stt_binary", &self.stt_binary)
            .field("tts_binary", &self.tts_binary)
            .field("decoder_binary", &self.decoder_binary)
            .field("llm_url", &self.llm_url)
            .field("llm_api_key", &"[REDACTED]")
            .field("llm_model", &self.llm_model)
            .field("stt_api_url", &self.stt_api_url)
            .field("stt_models", &self.stt_models)
            .field("tts_api_url", &self.tts_api_url)
            .field("tts_model", &self.tts_model)
            .field("tts_voice", &self.tts_voice)
            .field("tts_format", &self.tts_format)
            .field("gateway_token", &"[REDACTED]")
            .field("session_key", &"[REDACTED]")
            .finish()
    }
}

impl VoiceConfig {
    /// True when a remote-service key is configured; the fallback chains
    /// and the tool probe both key off this.
    pub fn remote_configured(&self) -> bool {
        !self.llm_api_key.is_empty()
    }

    /// Applies `FRIDAY_*` environment overrides in place.
    pub fn apply_env_overrides(&mut self) {
        let overrides: &mut [(&str, &mut String)] = &mut [
            ("FRIDAY_STT_BINARY", &mut self.stt_binary),
            ("FRIDAY_TTS_BINARY", &mut self.tts_binary),
            ("FRIDAY_DECODER_BINARY", &mut self.decoder_binary),
            ("FRIDAY_LLM_URL", &mut self.llm_url),
            ("FRIDAY_LLM_API_KEY", &mut self.llm_api_key),
            ("FRIDAY_LLM_MODEL", &mut self.llm_model),
            ("FRIDAY_TTS_MODEL", &mut self.tts_model),
            ("FRIDAY_TTS_VOICE", &mut self.tts_voice),
            ("FRIDAY_TTS_FORMAT", &mut self.tts_format),
            ("FRIDAY_GATEWAY_TOKEN", &mut self.gateway_token),
            ("FRIDAY_SESSION_KEY", &mut self.session_key),
        ];
        for (var, slot) in overrides.iter_mut() {
            if let Ok(value) = std::env::var(var) {
                **slot = value;
            }
        }
        // Comma-separated list so one variable can set the whole chain.
        if let Ok(models) = std::env::var("FRIDAY_STT_MODEL") {
            let models: Vec<String> = models
                .split(',')
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .collect();
            if !models.is_empty() {
                self.stt_models = models;
            }
        }
    }
}
