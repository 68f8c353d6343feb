//! Shared types and constants for the Friday voice bridge.
//!
//! This crate provides the wire-level vocabulary used across all Friday
//! crates: signaling events, chat entries, the shape-checked WebRTC payload
//! views, and the system notice codes. No crate in the workspace depends on
//! anything *except* `friday-types` for cross-cutting type definitions,
//! which keeps the dependency graph clean.

pub mod chat;
pub mod signal;

pub use chat::{ChatEntry, ChatRole};
pub use signal::{IceCandidate, PayloadError, SdpType, SessionDescription, SignalEvent, SignalKind};

/// Peer-id prefix that marks a peer as the in-process server bot.
///
/// Signals addressed to a peer with this prefix are dispatched to the
/// session manager instead of being fanned out to subscribers.
pub const BOT_PEER_PREFIX: &str = "friday-voice-bot-";

/// Room used when a client does not specify one.
pub const DEFAULT_ROOM_ID: &str = "friday-default-room";

/// System notice codes carried in `system` event payloads as
/// `{"message": <code>}`.
pub mod notice {
    /// Emitted on the event stream immediately after `ready`.
    pub const SIGNALING_CONNECTED: &str = "signaling_connected";
    /// Peer connection entered `disconnected`; the session is kept.
    pub const CONNECTION_DISCONNECTED: &str = "connection_disconnected";
    /// Offer payload failed the shape check.
    pub const INVALID_OFFER_PAYLOAD: &str = "invalid_offer_payload";
    /// Offer negotiation failed after session creation.
    pub const OFFER_HANDLING_FAILED: &str = "offer_handling_failed";
    /// No WebRTC engine could be resolved at startup.
    pub const WRTC_UNAVAILABLE: &str = "wrtc_unavailable";
    /// Local transcription binary absent and no remote key configured.
    pub const STT_BINARY_MISSING: &str = "stt_binary_missing";
    /// Local synthesis binary absent and no remote key configured.
    pub const TTS_BINARY_MISSING: &str = "tts_binary_missing";
    /// Media decoder binary absent and no remote key configured.
    pub const FFMPEG_MISSING: &str = "ffmpeg_missing";
    /// The VAD finalised an utterance and queued it for the pipeline.
    pub const VOICE_TURN_DETECTED: &str = "voice_turn_detected";
    /// Every transcription attempt came back empty for a turn.
    pub const TRANSCRIPTION_EMPTY: &str = "transcription_empty";
}

/// Returns true when `peer_id` names the in-process server bot.
pub fn is_bot_peer(peer_id: &str) -> bool {
    peer_id.starts_with(BOT_PEER_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bot_peer_prefix_is_recognised() {
        assert!(is_bot_peer("friday-voice-bot-default"));
        assert!(!is_bot_peer("alice"));
        assert!(!is_bot_peer("voice-bot-default"));
    }
}
