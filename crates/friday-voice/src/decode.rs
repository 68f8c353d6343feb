//! Media decoding to the playback format.
//!
//! Synthesised audio arrives as a compressed container; the playback pacer
//! wants raw PCM-16 mono at 48 kHz. Decoding shells out to an
//! ffmpeg-compatible binary.

use crate::config::VoiceConfig;
use crate::error::VoiceError;
use friday_audio::PLAYBACK_SAMPLE_RATE;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

/// Timeout for one decode run.
const DECODE_TIMEOUT: Duration = Duration::from_secs(25);

/// Decoder collaborator: container file in, raw s16le 48 kHz mono out.
#[derive(Debug, Clone)]
pub struct MediaDecoder {
    config: Arc<VoiceConfig>,
}

impl MediaDecoder {
    pub fn new(config: Arc<VoiceConfig>) -> Self {
        Self { config }
    }

    /// Decodes an audio container to PCM-16 mono samples at 48 kHz.
    pub async fn decode_to_playback(
        &self,
        audio: &[u8],
        format: &str,
    ) -> Result<Vec<i16>, VoiceError> {
        // Fresh unique temp files, unlinked on drop even on error paths.
        let input = tempfile::Builder::new()
            .prefix("friday-decode-in-")
            .suffix(&format!(".{format}"))
            .tempfile()
            .map_err(|e| VoiceError::Decode(format!("failed to create temp file: {e}")))?;
        tokio::fs::write(input.path(), audio)
            .await
            .map_err(|e| VoiceError::Decode(format!("failed to write temp file: {e}")))?;

        let output_file = tempfile::Builder::new()
            .prefix("friday-decode-out-")
            .suffix(".pcm")
            .tempfile()
            .map_err(|e| VoiceError::Decode(format!("failed to create temp file: {e}")))?;

        let child = Command::new(&self.config.decoder_binary)
            .arg("-y")
            .arg("-i")
            .arg(input.path())
            .arg("-f")
            .arg("s16le")
            .arg("-acodec")
            .arg("pcm_s16le")
            .arg("-ac")
            .arg("1")
            .arg("-ar")
            .arg(PLAYBACK_SAMPLE_RATE.to_string())
            .arg(output_file.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| VoiceError::Decode(format!("failed to spawn decoder: {e}")))?;

        let output = tokio::time::timeout(DECODE_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| {
                VoiceError::Decode(format!(
                    "decoder timed out after {} seconds",
                    DECODE_TIMEOUT.as_secs()
                ))
            })?
            .map_err(|e| VoiceError::Decode(format!("failed to wait for decoder: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VoiceError::Decode(format!("decoder failed: {stderr}")));
        }

        let raw = tokio::fs::read(output_file.path())
            .await
            .map_err(|e| VoiceError::Decode(format!("failed to read decoder output: {e}")))?;
        if raw.is_empty() {
            return Err(VoiceError::Decode("decoder wrote no audio".to_string()));
        }

        Ok(raw
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect())
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

    fn config_with_decoder(binary: &std::path::Path) -> Arc<VoiceConfig> {
        Arc::new(VoiceConfig {
            decoder_binary: binary.to_string_lossy().into_owned(),
            ..VoiceConfig::default()
        })
    }

    #[tokio::test]
    async fn decoder_output_becomes_samples() {
        let dir = tempfile::tempdir().unwrap();
        // Writes four s16le samples [1, 2, 3, 4] to the last argument.
        let script = write_script(
            dir.path(),
            "mock_decoder.sh",
            "#!/bin/sh\nfor out in \"$@\"; do :; done\nprintf '\\001\\000\\002\\000\\003\\000\\004\\000' > \"$out\"\n",
        )
        .await;

        let decoder = MediaDecoder::new(config_with_decoder(&script));
        let samples = decoder.decode_to_playback(b"OggS", "ogg").await.unwrap();
        assert_eq!(samples, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn failing_decoder_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "mock_decoder.sh", "#!/bin/sh\nexit 1").await;

        let decoder = MediaDecoder::new(config_with_decoder(&script));
        assert!(matches!(
            decoder.decode_to_playback(b"OggS", "ogg").await,
            Err(VoiceError::Decode(_))
        ));
    }
}
