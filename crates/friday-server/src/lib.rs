//! Friday server library logic.

pub mod api;
pub mod chat;
pub mod config;
pub mod pipeline;
pub mod session;
pub mod signaling;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Extension, Json, Router,
};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use chat::ChatLog;
use session::SessionManager;
use signaling::SignalHub;

/// Collaborators and registries shared by the signaling hub, the session
/// manager, and the turn pipeline.
pub struct VoiceCore {
    pub hub: Arc<SignalHub>,
    pub chat: Arc<ChatLog>,
    pub stt: friday_voice::SttService,
    pub llm: friday_voice::LlmClient,
    pub tts: friday_voice::TtsService,
    pub decoder: friday_voice::MediaDecoder,
    pub voice_config: Arc<friday_voice::VoiceConfig>,
}

impl VoiceCore {
    pub fn new(voice_config: Arc<friday_voice::VoiceConfig>) -> Self {
        Self {
            hub: Arc::new(SignalHub::new()),
            chat: Arc::new(ChatLog::new()),
            stt: friday_voice::SttService::new(Arc::clone(&voice_config)),
            llm: friday_voice::LlmClient::new(Arc::clone(&voice_config)),
            tts: friday_voice::TtsService::new(Arc::clone(&voice_config)),
            decoder: friday_voice::MediaDecoder::new(Arc::clone(&voice_config)),
            voice_config,
        }
    }
}

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub core: Arc<VoiceCore>,
    pub sessions: Arc<SessionManager>,
}

impl AppState {
    /// Builds the state from configuration, resolving the WebRTC engine
    /// once. Resolution failure is not fatal: offers are then answered
    /// with an unavailability notice.
    pub fn from_config(config: &config::Config) -> Self {
        let engine = match friday_rtc::resolve_engine(config.rtc.engine) {
            Ok(engine) => Some(engine),
            Err(e) => {
                tracing::warn!(error = %e, "no WebRTC engine available, offers will be refused");
                None
            }
        };
        let core = Arc::new(VoiceCore::new(Arc::new(config.voice.clone())));
        let sessions = SessionManager::new(Arc::clone(&core), engine);
        Self { core, sessions }
    }

    /// State over an explicit engine; tests use this with the loopback.
    pub fn with_engine(
        voice_config: Arc<friday_voice::VoiceConfig>,
        engine: Option<Arc<dyn friday_rtc::RtcEngine>>,
    ) -> Self {
        let core = Arc::new(VoiceCore::new(voice_config));
        let sessions = SessionManager::new(Arc::clone(&core), engine);
        Self { core, sessions }
    }
}

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/webrtc/events", get(api::events_handler))
        .route("/api/webrtc/signal", post(api::signal_handler))
        .route(
            "/api/webrtc/chat",
            get(api::chat_history_handler).post(api::chat_post_handler),
        )
        .route("/api/webrtc/assistant", post(api::assistant_handler))
        .layer(CorsLayer::permissive())
        .layer(Extension(Arc::new(state)))
}
