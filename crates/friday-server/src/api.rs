//! HTTP and SSE handlers for the voice bridge surface.
//!
//! Four endpoints under `/api/webrtc`: the event stream, the signal relay,
//! the room chat log, and the one-shot assistant pipeline. Timestamps are
//! ISO-8601 UTC; malformed requests get a 400 with `{ok: false, error}`.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use base64::Engine as _;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use friday_types::{notice, ChatEntry, ChatRole, SignalEvent, SignalKind, DEFAULT_ROOM_ID};

use crate::pipeline::FALLBACK_REPLY;
use crate::{signaling, AppState};

fn bad_request(error: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "ok": false, "error": error })),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// GET /api/webrtc/events
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsQuery {
    peer_id: Option<String>,
    room_id: Option<String>,
}

/// Opens the per-peer event stream: an initial `ready` frame, a synthetic
/// connected notice, then relayed signal events as `data:` frames.
pub async fn events_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Response {
    let Some(peer_id) = query.peer_id.filter(|p| !p.is_empty()) else {
        return bad_request("peerId is required");
    };
    let room_id = query
        .room_id
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| DEFAULT_ROOM_ID.to_string());

    let (guard, rx) = state.core.hub.open_stream(&room_id, &peer_id);
    debug!(%room_id, %peer_id, "event stream opened");

    let ready = Event::default()
        .event("ready")
        .json_data(json!({ "peerId": peer_id, "roomId": room_id }))
        .unwrap_or_else(|_| Event::default().event("ready"));
    let connected = event_frame(&SignalEvent::system(
        "server",
        &peer_id,
        &room_id,
        notice::SIGNALING_CONNECTED,
    ));

    let head = futures_util::stream::iter([Ok::<_, Infallible>(ready), Ok(connected)]);
    // The guard rides inside the closure: dropping the stream (client
    // cancel) deregisters the subscriber.
    let tail = UnboundedReceiverStream::new(rx).map(move |ev| {
        let _registered = &guard;
        Ok::<_, Infallible>(event_frame(&ev))
    });

    Sse::new(head.chain(tail))
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn event_frame(event: &SignalEvent) -> Event {
    match serde_json::to_string(event) {
        Ok(data) => Event::default().data(data),
        Err(e) => {
            debug!(error = %e, "failed to serialise signal event");
            Event::default().data("{}")
        }
    }
}

// ---------------------------------------------------------------------------
// POST /api/webrtc/signal
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalRequest {
    #[serde(rename = "type")]
    kind: Option<String>,
    from: Option<String>,
    to: Option<String>,
    room_id: Option<String>,
    #[serde(default)]
    payload: Value,
}

/// Accepts a client signal and applies the relay policy.
pub async fn signal_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<SignalRequest>,
) -> Response {
    let kind = match request.kind.as_deref() {
        Some("offer") => SignalKind::Offer,
        Some("answer") => SignalKind::Answer,
        Some("candidate") => SignalKind::Candidate,
        Some("bye") => SignalKind::Bye,
        Some(other) => return bad_request(&format!("unsupported signal type: {other}")),
        None => return bad_request("type is required"),
    };
    let Some(from) = request.from.filter(|f| !f.is_empty()) else {
        return bad_request("from is required");
    };
    let room_id = request
        .room_id
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| DEFAULT_ROOM_ID.to_string());

    let event = SignalEvent::new(
        kind,
        &from,
        request.to.as_deref().filter(|t| !t.is_empty()),
        &room_id,
        request.payload,
    );
    signaling::relay_signal(&state, event).await;

    Json(json!({ "ok": true })).into_response()
}

// ---------------------------------------------------------------------------
// GET + POST /api/webrtc/chat
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatQuery {
    room_id: Option<String>,
}

pub async fn chat_history_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<ChatQuery>,
) -> Response {
    let room_id = query
        .room_id
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| DEFAULT_ROOM_ID.to_string());
    Json(json!({ "history": state.core.chat.history(&room_id) })).into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPostRequest {
    room_id: Option<String>,
    role: Option<String>,
    message: Option<String>,
}

pub async fn chat_post_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<ChatPostRequest>,
) -> Response {
    let role = match request.role.as_deref() {
        Some("user") | None => ChatRole::User,
        Some("assistant") => ChatRole::Assistant,
        Some("system") => ChatRole::System,
        Some(other) => return bad_request(&format!("unsupported role: {other}")),
    };
    let Some(entry) = request
        .message
        .as_deref()
        .and_then(|m| ChatEntry::new(role, m))
    else {
        return bad_request("message must be non-empty");
    };
    let room_id = request
        .room_id
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| DEFAULT_ROOM_ID.to_string());

    state.core.chat.append(&room_id, entry.clone());
    Json(json!({ "ok": true, "entry": entry })).into_response()
}

// ---------------------------------------------------------------------------
// POST /api/webrtc/assistant
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantRequest {
    room_id: Option<String>,
    transcript: Option<String>,
    fallback_transcript: Option<String>,
    input_audio_base64: Option<String>,
    #[allow(dead_code)]
    input_audio_mime_type: Option<String>,
}

/// One-shot pipeline over HTTP: STT (when audio is given) → LLM → TTS.
///
/// Unlike the media-track path, the synthesised audio is returned inline
/// as base64 here; there is no track to carry it.
pub async fn assistant_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<AssistantRequest>,
) -> Response {
    let room_id = request
        .room_id
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| DEFAULT_ROOM_ID.to_string());

    let mut transcript = request
        .transcript
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());

    if transcript.is_none() {
        if let Some(encoded) = request.input_audio_base64.as_deref() {
            match base64::engine::general_purpose::STANDARD.decode(encoded) {
                Ok(audio) => match state.core.stt.transcribe(&audio).await {
                    Ok(text) if !text.trim().is_empty() => {
                        transcript = Some(text.trim().to_string());
                    }
                    Ok(_) => debug!("assistant request audio transcribed to nothing"),
                    Err(e) => debug!(error = %e, "assistant request transcription failed"),
                },
                Err(e) => debug!(error = %e, "assistant request carried invalid base64 audio"),
            }
        }
    }

    let transcript = match transcript.or_else(|| {
        request
            .fallback_transcript
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }) {
        Some(t) => t,
        None => return bad_request("no usable transcript"),
    };

    let Some(user_entry) = ChatEntry::new(ChatRole::User, &transcript) else {
        return bad_request("no usable transcript");
    };
    state.core.chat.append(&room_id, user_entry);

    let reply = match state.core.llm.complete(&transcript).await {
        Ok(reply) => reply,
        Err(e) => {
            debug!(error = %e, "LLM failed, using fallback reply");
            FALLBACK_REPLY.to_string()
        }
    };
    let reply_entry = ChatEntry::new(ChatRole::Assistant, &reply).expect("reply is non-empty");
    state.core.chat.append(&room_id, reply_entry.clone());

    let (audio_base64, audio_mime_type) = match state.core.tts.synthesize(&reply).await {
        Ok(audio) => (
            Some(base64::engine::general_purpose::STANDARD.encode(&audio.bytes)),
            Some(audio.mime_type()),
        ),
        Err(e) => {
            debug!(error = %e, "synthesis failed, returning reply without audio");
            (None, None)
        }
    };

    Json(json!({
        "ok": true,
        "transcript": transcript,
        "reply": reply_entry,
        "audioBase64": audio_base64,
        "audioMimeType": audio_mime_type,
    }))
    .into_response()
}
