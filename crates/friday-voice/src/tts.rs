//! Text-to-speech collaborator chain.

use crate::config::VoiceConfig;
use crate::error::VoiceError;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::warn;

/// Maximum text input size for TTS (64 KiB). Prevents resource exhaustion
/// from oversized synthesis requests.
const MAX_TTS_INPUT_BYTES: usize = 64 * 1024;

/// Timeout for one local TTS invocation.
const TTS_LOCAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for one remote synthesis round-trip.
const TTS_REMOTE_TIMEOUT: Duration = Duration::from_secs(30);

/// A synthesised audio blob and its container format tag.
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    pub bytes: Vec<u8>,
    pub format: String,
}

impl SynthesizedAudio {
    /// MIME type for the container format.
    pub fn mime_type(&self) -> String {
        match self.format.as_str() {
            "mp3" => "audio/mpeg".to_string(),
            "wav" => "audio/wav".to_string(),
            "flac" => "audio/flac".to_string(),
            "opus" | "ogg" => "audio/ogg".to_string(),
            other => format!("audio/{other}"),
        }
    }
}

/// Synthesis service: local binary first, then the remote service.
#[derive(Debug, Clone)]
pub struct TtsService {
    config: Arc<VoiceConfig>,
    http: reqwest::Client,
}

impl TtsService {
    pub fn new(config: Arc<VoiceConfig>) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    /// Synthesises speech for `text`, returning the compressed audio blob
    /// and its format tag.
    pub async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio, VoiceError> {
        if text.len() > MAX_TTS_INPUT_BYTES {
            return Err(VoiceError::Tts(format!(
                "text exceeds maximum size: {} bytes (limit: {} bytes)",
                text.len(),
                MAX_TTS_INPUT_BYTES
            )));
        }
        if text.trim().is_empty() {
            return Err(VoiceError::Tts("nothing to synthesise".to_string()));
        }

        match self.synthesize_local(text).await {
            Ok(audio) => return Ok(audio),
            Err(e) => {
                if !self.config.remote_configured() {
                    return Err(e);
                }
                warn!(error = %e, "local TTS failed, trying remote");
            }
        }

        self.synthesize_remote(text).await
    }

    async fn synthesize_local(&self, text: &str) -> Result<SynthesizedAudio, VoiceError> {
        // Fresh unique output path, unlinked on drop even on error paths.
        let output_file = tempfile::Builder::new()
            .prefix("friday-tts-")
            .suffix(&format!(".{}", self.config.tts_format))
            .tempfile()
            .map_err(|e| VoiceError::Tts(format!("failed to create temp file: {e}")))?;

        let child = Command::new(&self.config.tts_binary)
            .arg(text)
            .arg(output_file.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| VoiceError::Tts(format!("failed to spawn TTS binary: {e}")))?;

        let output = tokio::time::timeout(TTS_LOCAL_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| {
                VoiceError::Tts(format!(
                    "TTS process timed out after {} seconds",
                    TTS_LOCAL_TIMEOUT.as_secs()
                ))
            })?
            .map_err(|e| VoiceError::Tts(format!("failed to wait for TTS binary: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VoiceError::Tts(format!("TTS binary failed: {stderr}")));
        }

        let bytes = tokio::fs::read(output_file.path())
            .await
            .map_err(|e| VoiceError::Tts(format!("failed to read TTS output: {e}")))?;
        if bytes.is_empty() {
            return Err(VoiceError::Tts("TTS binary wrote no audio".to_string()));
        }

        Ok(SynthesizedAudio {
            bytes,
            format: self.config.tts_format.clone(),
        })
    }

    async fn synthesize_remote(&self, text: &str) -> Result<SynthesizedAudio, VoiceError> {
        let response = self
            .http
            .post(&self.config.tts_api_url)
            .bearer_auth(&self.config.llm_api_key)
            .json(&serde_json::json!({
                "model": self.config.tts_model,
                "voice": self.config.tts_voice,
                "input": text,
                "response_format": self.config.tts_format,
            }))
            .timeout(TTS_REMOTE_TIMEOUT)
            .send()
            .await
            .map_err(|e| VoiceError::Tts(format!("remote TTS request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(VoiceError::Tts(format!(
                "remote TTS returned {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| VoiceError::Tts(format!("failed to read remote TTS body: {e}")))?;
        if bytes.is_empty() {
            return Err(VoiceError::Tts("remote TTS returned no audio".to_string()));
        }

        Ok(SynthesizedAudio {
            bytes: bytes.to_vec(),
            format: self.config.tts_format.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    async fn write_script(dir: &std::path::Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        tokio::fs::write(&path, body).await.unwrap();
        let mut perms = tokio::fs::metadata(&path).await.unwrap().permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(&path, perms).await.unwrap();
        path
    }

    fn config_with_tts(binary: &std::path::Path) -> Arc<VoiceConfig> {
        Arc::new(VoiceConfig {
            tts_binary: binary.to_string_lossy().into_owned(),
            ..VoiceConfig::default()
        })
    }

    #[tokio::test]
    async fn local_binary_output_is_returned_with_format_tag() {
        let dir = tempfile::tempdir().unwrap();
        // The output path is the second argument.
        let script =
            write_script(dir.path(), "mock_tts.sh", "#!/bin/sh\nprintf 'OggS....' > \"$2\"\n")
                .await;

        let service = TtsService::new(config_with_tts(&script));
        let audio = service.synthesize("hello").await.unwrap();
        assert_eq!(audio.bytes, b"OggS....");
        assert_eq!(audio.format, "ogg");
        assert_eq!(audio.mime_type(), "audio/ogg");
    }

    #[tokio::test]
    async fn empty_text_is_rejected() {
        let service = TtsService::new(Arc::new(VoiceConfig::default()));
        assert!(matches!(
            service.synthesize("   ").await,
            Err(VoiceError::Tts(_))
        ));
    }

    #[tokio::test]
    async fn failing_binary_without_remote_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "mock_tts.sh", "#!/bin/sh\nexit 1").await;

        let service = TtsService::new(config_with_tts(&script));
        assert!(matches!(
            service.synthesize("hello").await,
            Err(VoiceError::Tts(_))
        ));
    }

    #[tokio::test]
    async fn binary_writing_nothing_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "mock_tts.sh", "#!/bin/sh\nexit 0").await;

        let service = TtsService::new(config_with_tts(&script));
        assert!(matches!(
            service.synthesize("hello").await,
            Err(VoiceError::Tts(_))
        ));
    }
}
