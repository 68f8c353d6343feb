//! Server-bot call sessions.
//!
//! One [`CallSession`] exists per `(room_id, user_peer_id)`. The manager
//! owns the table exclusively; everything else works on a borrowed
//! reference for the duration of one call. The per-key state machine:
//!
//! ```text
//!  NONE ──offer──▶ NEGOTIATING ──answer-sent──▶ ACTIVE ──bye/failed/closed──▶ NONE
//!                     │                           │
//!                     └─offer(again)──▶ teardown & restart
//!                     candidate: buffered if NONE; else applied
//! ```
//!
//! Teardown is best-effort and idempotent: every resource release is
//! independent, so partial failure cannot leave later steps undone.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use tracing::{debug, warn};

use friday_audio::{Pacer, PlaybackSink, SinkClosed, TurnSegmenter, Utterance, VadConfig,
    PLAYBACK_SAMPLE_RATE};
use friday_rtc::{AudioSource, AudioTrack, ConnectionState, PeerCallbacks, PeerHandle, RtcEngine};
use friday_types::{notice, IceCandidate, SessionDescription, SignalEvent, SignalKind};
use friday_voice::probe::MissingTool;

use crate::VoiceCore;

/// Pending ICE candidates kept per key until the offer arrives.
const MAX_PENDING_CANDIDATES: usize = 80;

/// Finalised utterances awaiting the pipeline; oldest evicted.
const MAX_QUEUED_TURNS: usize = 3;

type SessionKey = (String, String);

/// Creates, stores, and tears down call sessions.
pub struct SessionManager {
    core: Arc<VoiceCore>,
    engine: Option<Arc<dyn RtcEngine>>,
    sessions: Mutex<HashMap<SessionKey, Arc<CallSession>>>,
    pending_candidates: Mutex<HashMap<SessionKey, VecDeque<IceCandidate>>>,
}

impl SessionManager {
    pub fn new(core: Arc<VoiceCore>, engine: Option<Arc<dyn RtcEngine>>) -> Arc<Self> {
        Arc::new(Self {
            core,
            engine,
            sessions: Mutex::new(HashMap::new()),
            pending_candidates: Mutex::new(HashMap::new()),
        })
    }

    /// Entry point for signals whose `to` is a server-bot peer.
    pub async fn handle_bot_signal(self: &Arc<Self>, event: SignalEvent) {
        match event.kind {
            SignalKind::Offer => self.handle_offer(event).await,
            SignalKind::Candidate => self.handle_candidate(event).await,
            SignalKind::Bye => self.close_session(&event.room_id, &event.from).await,
            other => debug!(kind = other.as_str(), "ignoring bot-addressed signal"),
        }
    }

    /// The live session for a key, if any.
    pub fn session(&self, room_id: &str, user_peer_id: &str) -> Option<Arc<CallSession>> {
        self.sessions
            .lock()
            .expect("session table lock")
            .get(&(room_id.to_string(), user_peer_id.to_string()))
            .cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().expect("session table lock").len()
    }

    /// Buffered candidate count for a key (tests and diagnostics).
    pub fn pending_candidate_count(&self, room_id: &str, user_peer_id: &str) -> usize {
        self.pending_candidates
            .lock()
            .expect("pending candidate lock")
            .get(&(room_id.to_string(), user_peer_id.to_string()))
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Closes and forgets the session for `(room_id, peer_id)`, dropping
    /// candidates buffered for it. Safe to call when none exists; pending
    /// candidates survive a no-op close so an offer still drains them.
    pub async fn close_session(&self, room_id: &str, peer_id: &str) {
        let key = (room_id.to_string(), peer_id.to_string());
        let session = self.sessions.lock().expect("session table lock").remove(&key);
        if let Some(session) = session {
            self.pending_candidates
                .lock()
                .expect("pending candidate lock")
                .remove(&key);
            debug!(%room_id, %peer_id, "closing call session");
            session.teardown().await;
        }
    }

    async fn handle_offer(self: &Arc<Self>, event: SignalEvent) {
        let user_peer = event.from.clone();
        let bot_peer = event.to.clone().unwrap_or_default();
        let room_id = event.room_id.clone();

        let offer = match SessionDescription::offer_from_payload(&event.payload) {
            Ok(offer) => offer,
            Err(e) => {
                warn!(%room_id, %user_peer, error = %e, "rejecting malformed offer payload");
                self.core.hub.fan_out(&SignalEvent::system(
                    &bot_peer,
                    &user_peer,
                    &room_id,
                    notice::INVALID_OFFER_PAYLOAD,
                ));
                return;
            }
        };

        // A repeat offer restarts the call from scratch.
        self.close_session(&room_id, &user_peer).await;

        let Some(engine) = self.engine.as_ref() else {
            self.core.hub.fan_out(&SignalEvent::system(
                &bot_peer,
                &user_peer,
                &room_id,
                notice::WRTC_UNAVAILABLE,
            ));
            return;
        };

        // Callbacks outlive this scope and run on engine threads; they
        // reach the session through the cell once it is constructed.
        let cell: Arc<OnceLock<Arc<CallSession>>> = Arc::new(OnceLock::new());
        let callbacks = self.peer_callbacks(&cell, &room_id, &user_peer, &bot_peer);

        let peer = match engine.create_peer(callbacks).await {
            Ok(peer) => peer,
            Err(e) => {
                warn!(%room_id, %user_peer, error = %e, "engine failed to create peer");
                self.core.hub.fan_out(&SignalEvent::system(
                    &bot_peer,
                    &user_peer,
                    &room_id,
                    notice::WRTC_UNAVAILABLE,
                ));
                return;
            }
        };

        let source = peer.audio_source();
        let session = Arc::new(CallSession::new(
            Arc::clone(&self.core),
            room_id.clone(),
            user_peer.clone(),
            bot_peer.clone(),
            Arc::clone(&peer),
            source,
            self.close_hook(&room_id, &user_peer),
        ));
        let _ = cell.set(Arc::clone(&session));

        let key = (room_id.clone(), user_peer.clone());
        let replaced = self
            .sessions
            .lock()
            .expect("session table lock")
            .insert(key.clone(), Arc::clone(&session));
        if let Some(old) = replaced {
            old.teardown().await;
        }

        self.spawn_tool_probe(Arc::clone(&session));

        if let Err(e) = peer.set_remote_description(&offer).await {
            warn!(%room_id, %user_peer, error = %e, "failed to apply remote offer");
            self.fail_offer(&room_id, &user_peer, &bot_peer).await;
            return;
        }

        // The session is past remote-description-set: consume any
        // candidates that raced ahead of the offer. Per-candidate errors
        // are swallowed.
        let buffered = self
            .pending_candidates
            .lock()
            .expect("pending candidate lock")
            .remove(&key);
        if let Some(candidates) = buffered {
            for candidate in candidates {
                if let Err(e) = peer.add_ice_candidate(&candidate).await {
                    debug!(%room_id, %user_peer, error = %e, "buffered candidate rejected");
                }
            }
        }

        match peer.create_answer().await {
            Ok(answer) => {
                let payload = serde_json::to_value(&answer).unwrap_or_default();
                self.core.hub.fan_out(&SignalEvent::new(
                    SignalKind::Answer,
                    &bot_peer,
                    Some(&user_peer),
                    &room_id,
                    payload,
                ));
            }
            Err(e) => {
                warn!(%room_id, %user_peer, error = %e, "failed to create answer");
                self.fail_offer(&room_id, &user_peer, &bot_peer).await;
            }
        }
    }

    async fn fail_offer(&self, room_id: &str, user_peer: &str, bot_peer: &str) {
        self.core.hub.fan_out(&SignalEvent::system(
            bot_peer,
            user_peer,
            room_id,
            notice::OFFER_HANDLING_FAILED,
        ));
        self.close_session(room_id, user_peer).await;
    }

    async fn handle_candidate(&self, event: SignalEvent) {
        let candidate = match IceCandidate::from_payload(&event.payload) {
            Ok(candidate) => candidate,
            Err(e) => {
                debug!(error = %e, "ignoring malformed candidate payload");
                return;
            }
        };

        let key = (event.room_id.clone(), event.from.clone());
        let session = self
            .sessions
            .lock()
            .expect("session table lock")
            .get(&key)
            .cloned();
        match session {
            Some(session) => {
                if let Err(e) = session.peer.add_ice_candidate(&candidate).await {
                    warn!(room_id = %event.room_id, user_peer = %event.from, error = %e,
                        "failed to add ICE candidate");
                }
            }
            None => {
                let mut pending = self
                    .pending_candidates
                    .lock()
                    .expect("pending candidate lock");
                let buffer = pending.entry(key).or_default();
                buffer.push_back(candidate);
                while buffer.len() > MAX_PENDING_CANDIDATES {
                    buffer.pop_front();
                }
            }
        }
    }

    fn peer_callbacks(
        self: &Arc<Self>,
        cell: &Arc<OnceLock<Arc<CallSession>>>,
        room_id: &str,
        user_peer: &str,
        bot_peer: &str,
    ) -> PeerCallbacks {
        let on_ice_candidate = {
            let core = Arc::clone(&self.core);
            let cell = Arc::clone(cell);
            let (room_id, user_peer, bot_peer) =
                (room_id.to_string(), user_peer.to_string(), bot_peer.to_string());
            Box::new(move |candidate: IceCandidate| {
                let Some(session) = cell.get() else { return };
                if session.is_closed() {
                    return;
                }
                let payload = serde_json::to_value(&candidate).unwrap_or_default();
                core.hub.fan_out(&SignalEvent::new(
                    SignalKind::Candidate,
                    &bot_peer,
                    Some(&user_peer),
                    &room_id,
                    payload,
                ));
            })
        };

        let on_connection_state = {
            let manager = Arc::downgrade(self);
            let cell = Arc::clone(cell);
            let runtime = tokio::runtime::Handle::current();
            let (room_id, user_peer) = (room_id.to_string(), user_peer.to_string());
            Box::new(move |state: ConnectionState| match state {
                ConnectionState::Failed | ConnectionState::Closed => {
                    let Some(manager) = manager.upgrade() else { return };
                    let (room_id, user_peer) = (room_id.clone(), user_peer.clone());
                    runtime.spawn(async move {
                        manager.close_session(&room_id, &user_peer).await;
                    });
                }
                ConnectionState::Disconnected => {
                    // Recovery is the client's job; the session is kept.
                    if let Some(session) = cell.get() {
                        session.emit_system(notice::CONNECTION_DISCONNECTED);
                    }
                }
                _ => {}
            })
        };

        let on_track = {
            let cell = Arc::clone(cell);
            Box::new(move |track: Arc<dyn AudioTrack>| {
                if let Some(session) = cell.get() {
                    session.attach_track(track);
                }
            })
        };

        let on_track_ended = {
            let cell = Arc::clone(cell);
            Box::new(move || {
                if let Some(session) = cell.get() {
                    session.clear_track();
                }
            })
        };

        PeerCallbacks {
            on_ice_candidate,
            on_connection_state,
            on_track,
            on_track_ended,
        }
    }

    /// Hook run by the pacer when the outbound source rejects data.
    fn close_hook(self: &Arc<Self>, room_id: &str, user_peer: &str) -> Box<dyn Fn() + Send + Sync> {
        let manager = Arc::downgrade(self);
        let runtime = tokio::runtime::Handle::current();
        let (room_id, user_peer) = (room_id.to_string(), user_peer.to_string());
        Box::new(move || {
            let Some(manager) = manager.upgrade() else { return };
            let (room_id, user_peer) = (room_id.clone(), user_peer.clone());
            runtime.spawn(async move {
                manager.close_session(&room_id, &user_peer).await;
            });
        })
    }

    /// Probes collaborator binaries without blocking signaling.
    fn spawn_tool_probe(&self, session: Arc<CallSession>) {
        let config = Arc::clone(&self.core.voice_config);
        tokio::spawn(async move {
            for tool in friday_voice::verify_tools(&config).await {
                let code = match tool {
                    MissingTool::Stt => notice::STT_BINARY_MISSING,
                    MissingTool::Tts => notice::TTS_BINARY_MISSING,
                    MissingTool::Decoder => notice::FFMPEG_MISSING,
                };
                session.emit_system(code);
            }
        });
    }
}

pub(crate) struct LastTranscript {
    pub(crate) text: String,
    pub(crate) at: Option<Instant>,
}

/// Adapts the peer's outbound audio source to the pacer's sink seam.
struct SourceSink {
    source: Arc<dyn AudioSource>,
}

impl PlaybackSink for SourceSink {
    fn push_frame(&self, samples: &[i16]) -> Result<(), SinkClosed> {
        self.source
            .write_frame(samples, PLAYBACK_SAMPLE_RATE)
            .map_err(|_| SinkClosed)
    }
}

/// One active call between a user peer and the server bot.
pub struct CallSession {
    pub(crate) core: Arc<VoiceCore>,
    pub(crate) room_id: String,
    pub(crate) user_peer_id: String,
    pub(crate) bot_peer_id: String,
    pub(crate) peer: Arc<dyn PeerHandle>,
    source: Arc<dyn AudioSource>,
    track: Mutex<Option<Arc<dyn AudioTrack>>>,
    vad: Mutex<TurnSegmenter>,
    pub(crate) turns: Mutex<VecDeque<Utterance>>,
    pub(crate) processing_turn: AtomicBool,
    pub(crate) last_transcript: Mutex<LastTranscript>,
    pub(crate) pacer: Pacer,
    closed: AtomicBool,
    runtime: tokio::runtime::Handle,
}

impl CallSession {
    fn new(
        core: Arc<VoiceCore>,
        room_id: String,
        user_peer_id: String,
        bot_peer_id: String,
        peer: Arc<dyn PeerHandle>,
        source: Arc<dyn AudioSource>,
        on_playback_failure: Box<dyn Fn() + Send + Sync>,
    ) -> Self {
        let pacer = Pacer::new(
            Arc::new(SourceSink {
                source: Arc::clone(&source),
            }),
            on_playback_failure,
        );
        Self {
            core,
            room_id,
            user_peer_id,
            bot_peer_id,
            peer,
            source,
            track: Mutex::new(None),
            vad: Mutex::new(TurnSegmenter::new(VadConfig::default())),
            turns: Mutex::new(VecDeque::new()),
            processing_turn: AtomicBool::new(false),
            last_transcript: Mutex::new(LastTranscript {
                text: String::new(),
                at: None,
            }),
            pacer,
            closed: AtomicBool::new(false),
            runtime: tokio::runtime::Handle::current(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Outbound playback queue for this session.
    pub fn playback(&self) -> &Pacer {
        &self.pacer
    }

    /// Emits a `system{code}` notice to the user peer, unless closed.
    pub(crate) fn emit_system(&self, code: &str) {
        if self.is_closed() {
            return;
        }
        self.core.hub.fan_out(&SignalEvent::system(
            &self.bot_peer_id,
            &self.user_peer_id,
            &self.room_id,
            code,
        ));
    }

    /// Installs the inbound audio track, replacing any previous sink.
    fn attach_track(self: &Arc<Self>, track: Arc<dyn AudioTrack>) {
        if let Some(previous) = self.track.lock().expect("track lock").take() {
            previous.detach_sink();
        }
        let weak = Arc::downgrade(self);
        track.attach_sink(Box::new(move |samples, sample_rate, channels| {
            if let Some(session) = weak.upgrade() {
                session.handle_frame(samples, sample_rate, channels);
            }
        }));
        *self.track.lock().expect("track lock") = Some(track);
    }

    fn clear_track(&self) {
        if let Some(track) = self.track.lock().expect("track lock").take() {
            track.detach_sink();
        }
    }

    /// Runs on the engine's capture thread for every inbound frame. Only
    /// VAD work happens here; anything heavier is handed to the worker.
    fn handle_frame(self: &Arc<Self>, samples: &[i16], sample_rate: u32, channels: u16) {
        if self.is_closed() {
            return;
        }
        let finalised = self
            .vad
            .lock()
            .expect("vad lock")
            .push_frame(samples, sample_rate, channels, Instant::now());
        if let Some(turn) = finalised {
            self.enqueue_turn(turn);
        }
    }

    /// Queues a finalised utterance (bound 3, oldest evicted), announces
    /// it, and makes sure a worker is draining the queue.
    pub(crate) fn enqueue_turn(self: &Arc<Self>, turn: Utterance) {
        {
            let mut turns = self.turns.lock().expect("turn queue lock");
            turns.push_back(turn);
            while turns.len() > MAX_QUEUED_TURNS {
                turns.pop_front();
            }
        }
        self.emit_system(notice::VOICE_TURN_DETECTED);
        self.kick_worker();
    }

    /// Starts the pipeline worker unless one is already in flight; turns
    /// enqueued meanwhile are picked up by the running loop.
    pub(crate) fn kick_worker(self: &Arc<Self>) {
        if !self.processing_turn.swap(true, Ordering::AcqRel) {
            let session = Arc::clone(self);
            self.runtime.spawn(crate::pipeline::run_worker(session));
        }
    }

    /// Releases every session resource. Idempotent; each step is
    /// independent so partial failure cannot block the rest.
    pub(crate) async fn teardown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.clear_track();
        self.pacer.stop();
        self.vad.lock().expect("vad lock").reset();
        self.turns.lock().expect("turn queue lock").clear();
        self.source.stop();
        self.peer.close().await;
    }
}
