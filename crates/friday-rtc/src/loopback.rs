//! In-process loopback engine.
//!
//! Stands in for the native WebRTC stack where it cannot be linked: offers
//! are answered with a synthetic SDP, negotiation immediately reports a
//! connected peer with one inbound audio track, and outbound frames are
//! retained for inspection. Development builds and the test-suite drive
//! sessions through it; captured "microphone" audio is injected with
//! [`LoopbackPeer::push_captured_frame`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use friday_types::{IceCandidate, SdpType, SessionDescription};

use crate::{
    AudioSource, AudioTrack, ConnectionState, FrameHandler, PeerCallbacks, PeerHandle, RtcError,
    RtcEngine,
};

/// Engine factory that records the peers it creates so tests can reach the
/// concrete handles behind the trait objects.
#[derive(Default)]
pub struct LoopbackEngine {
    peers: Mutex<Vec<Arc<LoopbackPeer>>>,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently created peer, if any.
    pub fn last_peer(&self) -> Option<Arc<LoopbackPeer>> {
        self.peers.lock().expect("loopback peers lock").last().cloned()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().expect("loopback peers lock").len()
    }
}

#[async_trait]
impl RtcEngine for LoopbackEngine {
    async fn create_peer(&self, callbacks: PeerCallbacks) -> Result<Arc<dyn PeerHandle>, RtcError> {
        let peer = Arc::new(LoopbackPeer {
            negotiation: Mutex::new(Negotiation::default()),
            state: Mutex::new(ConnectionState::New),
            callbacks,
            source: Arc::new(LoopbackSource::default()),
            track: Arc::new(LoopbackTrack::default()),
        });
        self.peers.lock().expect("loopback peers lock").push(Arc::clone(&peer));
        Ok(peer)
    }
}

#[derive(Default)]
struct Negotiation {
    remote: Option<SessionDescription>,
    local: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
}

/// A loopback peer connection.
pub struct LoopbackPeer {
    negotiation: Mutex<Negotiation>,
    state: Mutex<ConnectionState>,
    callbacks: PeerCallbacks,
    source: Arc<LoopbackSource>,
    track: Arc<LoopbackTrack>,
}

impl LoopbackPeer {
    /// Injects a captured frame as if the remote microphone produced it.
    /// Runs the attached sink handler on the caller's thread, mirroring the
    /// engine-owned capture thread of a real stack.
    pub fn push_captured_frame(&self, samples: &[i16], sample_rate: u32, channels: u16) {
        self.track.deliver(samples, sample_rate, channels);
    }

    /// Drives a connection-state transition and fires the callback, as the
    /// engine would on network events.
    pub fn drive_connection_state(&self, state: ConnectionState) {
        *self.state.lock().expect("loopback state lock") = state;
        (self.callbacks.on_connection_state)(state);
    }

    /// Signals the end of the inbound track.
    pub fn end_track(&self) {
        (self.callbacks.on_track_ended)();
    }

    /// Outbound frames pushed into the source so far.
    pub fn source_frames(&self) -> Vec<Vec<i16>> {
        self.source.frames.lock().expect("loopback source lock").clone()
    }

    /// Makes every further source write fail, as a dead transport would.
    pub fn break_source(&self) {
        self.source.broken.store(true, Ordering::Release);
    }

    /// Candidates applied to this peer.
    pub fn candidate_count(&self) -> usize {
        self.negotiation.lock().expect("loopback negotiation lock").candidates.len()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.negotiation.lock().expect("loopback negotiation lock").remote.clone()
    }

    fn closed(&self) -> bool {
        *self.state.lock().expect("loopback state lock") == ConnectionState::Closed
    }
}

#[async_trait]
impl PeerHandle for LoopbackPeer {
    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), RtcError> {
        if self.closed() {
            return Err(RtcError::ConnectionClosed);
        }
        if desc.sdp.trim().is_empty() {
            return Err(RtcError::Negotiation("empty sdp".to_string()));
        }
        self.negotiation
            .lock()
            .expect("loopback negotiation lock")
            .remote = Some(desc.clone());
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription, RtcError> {
        if self.closed() {
            return Err(RtcError::ConnectionClosed);
        }
        {
            let negotiation = self.negotiation.lock().expect("loopback negotiation lock");
            if negotiation.remote.is_none() {
                return Err(RtcError::Negotiation("no remote description".to_string()));
            }
        }

        let answer = SessionDescription {
            sdp_type: SdpType::Answer,
            sdp: "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=friday-loopback\r\nt=0 0\r\n\
                  m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=sendrecv\r\n"
                .to_string(),
        };
        self.negotiation
            .lock()
            .expect("loopback negotiation lock")
            .local = Some(answer.clone());

        // Negotiation done: surface a host candidate, report the peer
        // connected, and deliver the inbound audio track.
        (self.callbacks.on_ice_candidate)(IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 127.0.0.1 9 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        });
        self.drive_connection_state(ConnectionState::Connected);
        (self.callbacks.on_track)(Arc::clone(&self.track) as Arc<dyn AudioTrack>);

        Ok(answer)
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), RtcError> {
        if self.closed() {
            return Err(RtcError::ConnectionClosed);
        }
        if candidate.candidate.trim().is_empty() {
            return Err(RtcError::Candidate("empty candidate".to_string()));
        }
        self.negotiation
            .lock()
            .expect("loopback negotiation lock")
            .candidates
            .push(candidate.clone());
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.lock().expect("loopback state lock")
    }

    fn audio_source(&self) -> Arc<dyn AudioSource> {
        Arc::clone(&self.source) as Arc<dyn AudioSource>
    }

    async fn close(&self) {
        let mut state = self.state.lock().expect("loopback state lock");
        if *state != ConnectionState::Closed {
            debug!("closing loopback peer");
            *state = ConnectionState::Closed;
        }
    }
}

/// Inbound track whose sink is invoked synchronously by the test driver.
#[derive(Default)]
pub struct LoopbackTrack {
    sink: Mutex<Option<FrameHandler>>,
}

impl LoopbackTrack {
    fn deliver(&self, samples: &[i16], sample_rate: u32, channels: u16) {
        if let Some(handler) = self.sink.lock().expect("loopback sink lock").as_ref() {
            handler(samples, sample_rate, channels);
        }
    }
}

impl AudioTrack for LoopbackTrack {
    fn attach_sink(&self, handler: FrameHandler) {
        *self.sink.lock().expect("loopback sink lock") = Some(handler);
    }

    fn detach_sink(&self) {
        *self.sink.lock().expect("loopback sink lock") = None;
    }
}

/// Outbound source that retains frames for inspection.
#[derive(Default)]
pub struct LoopbackSource {
    frames: Mutex<Vec<Vec<i16>>>,
    broken: AtomicBool,
    stopped: AtomicBool,
}

impl AudioSource for LoopbackSource {
    fn write_frame(&self, samples: &[i16], _sample_rate: u32) -> Result<(), RtcError> {
        if self.broken.load(Ordering::Acquire) || self.stopped.load(Ordering::Acquire) {
            return Err(RtcError::SourceClosed);
        }
        self.frames.lock().expect("loopback source lock").push(samples.to_vec());
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}
