//! Availability probe for the collaborator binaries.
//!
//! Run once per session creation, off the signaling path. A binary counts
//! as present when it is an explicit path to an existing file, or when a
//! bare name is found on `PATH`. Absence only matters when no remote key
//! is configured to fall back on.

use crate::config::VoiceConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Time limit for the whole probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// A collaborator binary the probe could not find.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingTool {
    Stt,
    Tts,
    Decoder,
}

/// Checks the STT, TTS, and decoder binaries and reports the missing ones.
///
/// Returns an empty list when a remote-service key is configured; remote
/// fallbacks cover for absent binaries in that case.
pub async fn verify_tools(config: &VoiceConfig) -> Vec<MissingTool> {
    if config.remote_configured() {
        return Vec::new();
    }

    let stt = config.stt_binary.clone();
    let tts = config.tts_binary.clone();
    let decoder = config.decoder_binary.clone();

    // PATH scanning is filesystem I/O; keep it off the async workers and
    // inside the probe deadline.
    let scan = tokio::task::spawn_blocking(move || {
        let mut missing = Vec::new();
        if resolve_binary(&stt).is_none() {
            missing.push(MissingTool::Stt);
        }
        if resolve_binary(&tts).is_none() {
            missing.push(MissingTool::Tts);
        }
        if resolve_binary(&decoder).is_none() {
            missing.push(MissingTool::Decoder);
        }
        missing
    });

    match tokio::time::timeout(PROBE_TIMEOUT, scan).await {
        Ok(Ok(missing)) => missing,
        Ok(Err(e)) => {
            debug!(error = %e, "tool probe task failed");
            Vec::new()
        }
        Err(_) => {
            debug!("tool probe timed out");
            Vec::new()
        }
    }
}

/// Resolves a binary: explicit paths must exist as files, bare names are
/// searched on `PATH`.
fn resolve_binary(bin: &str) -> Option<PathBuf> {
    if bin.is_empty() {
        return None;
    }
    if bin.contains(std::path::MAIN_SEPARATOR) {
        let p = Path::new(bin);
        return p.is_file().then(|| p.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let p = dir.join(bin);
        if p.is_file() {
            return Some(p);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_binaries_are_reported_without_remote_key() {
        let config = VoiceConfig {
            stt_binary: "friday-definitely-not-a-binary".to_string(),
            tts_binary: "/nonexistent/path/to/tts".to_string(),
            decoder_binary: "sh".to_string(), // present on any test host
            ..VoiceConfig::default()
        };
        let missing = verify_tools(&config).await;
        assert!(missing.contains(&MissingTool::Stt));
        assert!(missing.contains(&MissingTool::Tts));
        assert!(!missing.contains(&MissingTool::Decoder));
    }

    #[tokio::test]
    async fn remote_key_suppresses_reports() {
        let config = VoiceConfig {
            stt_binary: "friday-definitely-not-a-binary".to_string(),
            llm_api_key: "key".to_string(),
            ..VoiceConfig::default()
        };
        assert!(verify_tools(&config).await.is_empty());
    }
}
