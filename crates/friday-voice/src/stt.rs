//! Speech-to-text collaborator chain.

use crate::config::VoiceConfig;
use crate::error::VoiceError;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Maximum audio input size for STT (10 MiB). Prevents OOM from oversized
/// payloads.
const MAX_STT_INPUT_BYTES: usize = 10 * 1024 * 1024;

/// Timeout for one local STT invocation.
const STT_LOCAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for one remote transcription round-trip.
const STT_REMOTE_TIMEOUT: Duration = Duration::from_secs(30);

/// Transcription service: local binary first, then the remote service
/// trying each configured model in turn until one yields non-empty text.
#[derive(Debug, Clone)]
pub struct SttService {
    config: Arc<VoiceConfig>,
    http: reqwest::Client,
}

impl SttService {
    pub fn new(config: Arc<VoiceConfig>) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    /// Transcribes a WAV container. Returns an empty string when every
    /// attempt ran but produced no text; errors only when no attempt could
    /// run at all.
    pub async fn transcribe(&self, wav_data: &[u8]) -> Result<String, VoiceError> {
        if wav_data.len() > MAX_STT_INPUT_BYTES {
            return Err(VoiceError::Stt(format!(
                "audio data exceeds maximum size: {} bytes (limit: {} bytes)",
                wav_data.len(),
                MAX_STT_INPUT_BYTES
            )));
        }

        let mut last_error: Option<VoiceError> = None;

        match self.transcribe_local(wav_data).await {
            Ok(text) if !text.is_empty() => return Ok(text),
            Ok(_) => debug!("local STT produced no text"),
            Err(e) => {
                warn!(error = %e, "local STT failed, trying remote");
                last_error = Some(e);
            }
        }

        if self.config.remote_configured() {
            for model in &self.config.stt_models {
                match self.transcribe_remote(wav_data, model).await {
                    Ok(text) if !text.is_empty() => return Ok(text),
                    Ok(_) => debug!(%model, "remote STT produced no text"),
                    Err(e) => {
                        warn!(%model, error = %e, "remote STT attempt failed");
                        last_error = Some(e);
                    }
                }
            }
            // At least one attempt completed; an empty transcript is the
            // caller's signal, not an error.
            return Ok(String::new());
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(String::new()),
        }
    }

    async fn transcribe_local(&self, wav_data: &[u8]) -> Result<String, VoiceError> {
        // Fresh unique temp file, unlinked on drop even on error paths.
        let input = tempfile::Builder::new()
            .prefix("friday-stt-")
            .suffix(".wav")
            .tempfile()
            .map_err(|e| VoiceError::Stt(format!("failed to create temp file: {e}")))?;
        tokio::fs::write(input.path(), wav_data)
            .await
            .map_err(|e| VoiceError::Stt(format!("failed to write temp file: {e}")))?;

        let child = Command::new(&self.config.stt_binary)
            .arg(input.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| VoiceError::Stt(format!("failed to spawn STT binary: {e}")))?;

        let output = tokio::time::timeout(STT_LOCAL_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| {
                VoiceError::Stt(format!(
                    "STT process timed out after {} seconds",
                    STT_LOCAL_TIMEOUT.as_secs()
                ))
            })?
            .map_err(|e| VoiceError::Stt(format!("failed to read STT output: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VoiceError::Stt(format!("STT binary failed: {stderr}")));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn transcribe_remote(&self, wav_data: &[u8], model: &str) -> Result<String, VoiceError> {
        let part = reqwest::multipart::Part::bytes(wav_data.to_vec())
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::Stt(format!("invalid multipart payload: {e}")))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", model.to_string());

        let response = self
            .http
            .post(&self.config.stt_api_url)
            .bearer_auth(&self.config.llm_api_key)
            .multipart(form)
            .timeout(STT_REMOTE_TIMEOUT)
            .send()
            .await
            .map_err(|e| VoiceError::Stt(format!("remote STT request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(VoiceError::Stt(format!(
                "remote STT returned {}",
                response.status()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| VoiceError::Stt(format!("remote STT returned invalid JSON: {e}")))?;
        Ok(body
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .trim()
            .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn config_with_stt(binary: &std::path::Path) -> Arc<VoiceConfig> {
        Arc::new(VoiceConfig {
            stt_binary: binary.to_string_lossy().into_owned(),
            ..VoiceConfig::default()
        })
    }

    async fn write_script(dir: &std::path::Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        tokio::fs::write(&path, body).await.unwrap();
        let mut perms = tokio::fs::metadata(&path).await.unwrap().permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(&path, perms).await.unwrap();
        path
    }

    #[tokio::test]
    async fn local_binary_transcript_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "mock_stt.sh", "#!/bin/sh\necho ' hello there '")
            .await;

        let service = SttService::new(config_with_stt(&script));
        let text = service.transcribe(b"RIFF....WAVE").await.unwrap();
        assert_eq!(text, "hello there");
    }

    #[tokio::test]
    async fn failing_binary_without_remote_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "mock_stt.sh", "#!/bin/sh\nexit 3").await;

        let service = SttService::new(config_with_stt(&script));
        assert!(matches!(
            service.transcribe(b"RIFF....WAVE").await,
            Err(VoiceError::Stt(_))
        ));
    }

    #[tokio::test]
    async fn oversized_input_is_rejected() {
        let service = SttService::new(Arc::new(VoiceConfig::default()));
        let big = vec![0u8; MAX_STT_INPUT_BYTES + 1];
        assert!(matches!(
            service.transcribe(&big).await,
            Err(VoiceError::Stt(_))
        ));
    }

    #[tokio::test]
    async fn silent_binary_yields_empty_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "mock_stt.sh", "#!/bin/sh\nexit 0").await;

        let service = SttService::new(config_with_stt(&script));
        let text = service.transcribe(b"RIFF....WAVE").await.unwrap();
        assert!(text.is_empty());
    }
}
