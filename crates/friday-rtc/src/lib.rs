//! Capability interface over the WebRTC engine.
//!
//! The underlying engine (ICE, DTLS-SRTP, SDP negotiation, jitter buffer)
//! is an external library; this crate defines the seam the rest of the
//! bridge talks to. Implementations are resolved once at startup via
//! [`resolve_engine`]; when none is available, session creation reports the
//! condition and refuses offers instead of failing at call sites.
//!
//! The shapes mirror the engine's own vocabulary: peers are created with a
//! callback set, inbound audio arrives on an engine-owned capture thread
//! through a track's sink handler, and outbound audio is pushed into an
//! [`AudioSource`].

pub mod loopback;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use friday_types::{IceCandidate, SessionDescription};

/// Errors surfaced by the engine seam.
#[derive(Debug, Error)]
pub enum RtcError {
    #[error("no WebRTC engine is available in this build")]
    EngineUnavailable,

    #[error("peer connection is closed")]
    ConnectionClosed,

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("candidate rejected: {0}")]
    Candidate(String),

    #[error("audio source rejected data")]
    SourceClosed,
}

/// Peer connection lifecycle states, as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Handler invoked on the engine's capture thread for every inbound frame:
/// `(interleaved PCM-16 samples, sample rate, channel count)`.
pub type FrameHandler = Box<dyn Fn(&[i16], u32, u16) + Send + Sync>;

/// An inbound audio track. At most one sink is attached at a time;
/// attaching replaces the previous handler.
pub trait AudioTrack: Send + Sync {
    fn attach_sink(&self, handler: FrameHandler);
    fn detach_sink(&self);
}

/// Outbound audio: the bridge pushes synthesised PCM frames here.
pub trait AudioSource: Send + Sync {
    fn write_frame(&self, samples: &[i16], sample_rate: u32) -> Result<(), RtcError>;
    fn stop(&self);
}

/// Callbacks registered at peer creation. All run on engine-owned threads
/// and must not block.
pub struct PeerCallbacks {
    pub on_ice_candidate: Box<dyn Fn(IceCandidate) + Send + Sync>,
    pub on_connection_state: Box<dyn Fn(ConnectionState) + Send + Sync>,
    pub on_track: Box<dyn Fn(Arc<dyn AudioTrack>) + Send + Sync>,
    pub on_track_ended: Box<dyn Fn() + Send + Sync>,
}

/// One peer connection.
#[async_trait]
pub trait PeerHandle: Send + Sync {
    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), RtcError>;

    /// Creates an answer to the applied remote offer and installs it as the
    /// local description.
    async fn create_answer(&self) -> Result<SessionDescription, RtcError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), RtcError>;

    fn connection_state(&self) -> ConnectionState;

    /// The outbound audio source backing this peer's sendonly track.
    fn audio_source(&self) -> Arc<dyn AudioSource>;

    /// Releases the connection. Idempotent.
    async fn close(&self);
}

/// Factory for peer connections.
#[async_trait]
pub trait RtcEngine: Send + Sync {
    async fn create_peer(&self, callbacks: PeerCallbacks) -> Result<Arc<dyn PeerHandle>, RtcError>;
}

/// Which engine implementation to resolve at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// The native engine of this build. None is linked in, so resolution
    /// fails and offers are answered with an unavailability notice.
    #[default]
    Auto,
    /// In-process loopback engine for development and tests.
    Loopback,
}

/// Resolves the engine implementation once at startup.
pub fn resolve_engine(kind: EngineKind) -> Result<Arc<dyn RtcEngine>, RtcError> {
    match kind {
        EngineKind::Auto => Err(RtcError::EngineUnavailable),
        EngineKind::Loopback => Ok(Arc::new(loopback::LoopbackEngine::new())),
    }
}
