//! End-to-end tests for the voice bridge: signaling, call sessions, and the
//! turn pipeline driven through the loopback engine with mock collaborator
//! binaries.

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use friday_rtc::loopback::LoopbackEngine;
use friday_rtc::{ConnectionState, PeerHandle, RtcEngine};
use friday_server::{app, signaling, AppState};
use friday_types::{SignalEvent, SignalKind};
use friday_voice::VoiceConfig;

const ROOM: &str = "ops-room";
const USER: &str = "alice";
const BOT: &str = "friday-voice-bot-default";
const FALLBACK_REPLY: &str = "Comms degraded. Retry in a moment.";

async fn write_script(dir: &std::path::Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    tokio::fs::write(&path, body).await.unwrap();
    let mut perms = tokio::fs::metadata(&path).await.unwrap().permissions();
    perms.set_mode(0o755);
    tokio::fs::set_permissions(&path, perms).await.unwrap();
    path.to_string_lossy().into_owned()
}

async fn mock_voice_config(dir: &std::path::Path, transcript: &str) -> Arc<VoiceConfig> {
    let stt = write_script(
        dir,
        "mock_stt.sh",
        &format!("#!/bin/sh\necho '{transcript}'"),
    )
    .await;
    let tts = write_script(dir, "mock_tts.sh", "#!/bin/sh\nprintf 'OggS....' > \"$2\"\n").await;
    // Writes 200 ms of s16le audio to the last argument.
    let decoder = write_script(
        dir,
        "mock_decoder.sh",
        "#!/bin/sh\nfor out in \"$@\"; do :; done\ndd if=/dev/zero of=\"$out\" bs=19200 count=1 2>/dev/null\n",
    )
    .await;
    Arc::new(VoiceConfig {
        stt_binary: stt,
        tts_binary: tts,
        decoder_binary: decoder,
        ..VoiceConfig::default()
    })
}

async fn setup(dir: &std::path::Path, transcript: &str) -> (Arc<AppState>, Arc<LoopbackEngine>) {
    let engine = Arc::new(LoopbackEngine::new());
    let state = AppState::with_engine(
        mock_voice_config(dir, transcript).await,
        Some(Arc::clone(&engine) as Arc<dyn RtcEngine>),
    );
    (Arc::new(state), engine)
}

fn offer_event() -> SignalEvent {
    SignalEvent::new(
        SignalKind::Offer,
        USER,
        Some(BOT),
        ROOM,
        json!({"type": "offer", "sdp": "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n"}),
    )
}

fn candidate_event(n: u32) -> SignalEvent {
    SignalEvent::new(
        SignalKind::Candidate,
        USER,
        Some(BOT),
        ROOM,
        json!({"candidate": format!("candidate:{n} 1 udp 1 192.0.2.1 3478 typ host"), "sdpMid": "0"}),
    )
}

/// Receives events until `pred` matches or the timeout elapses.
async fn wait_for(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<SignalEvent>,
    timeout: Duration,
    pred: impl Fn(&SignalEvent) -> bool,
) -> Option<SignalEvent> {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        let now = std::time::Instant::now();
        if now >= deadline {
            return None;
        }
        match tokio::time::timeout(deadline - now, rx.recv()).await {
            Ok(Some(ev)) if pred(&ev) => return Some(ev),
            Ok(Some(_)) => continue,
            _ => return None,
        }
    }
}

fn is_system(ev: &SignalEvent, code: &str) -> bool {
    ev.kind == SignalKind::System
        && ev.payload.get("message").and_then(|m| m.as_str()) == Some(code)
}

#[tokio::test]
async fn offer_yields_answer_and_active_session() {
    let dir = tempfile::tempdir().unwrap();
    let (state, engine) = setup(dir.path(), "hello").await;
    let (_guard, mut rx) = state.core.hub.open_stream(ROOM, USER);

    signaling::relay_signal(&state, offer_event()).await;

    let answer = wait_for(&mut rx, Duration::from_secs(2), |ev| {
        ev.kind == SignalKind::Answer
    })
    .await
    .expect("answer event");
    assert_eq!(answer.from, BOT);
    assert_eq!(answer.to.as_deref(), Some(USER));
    assert_eq!(
        answer.payload.get("type").and_then(|t| t.as_str()),
        Some("answer")
    );

    assert_eq!(state.sessions.session_count(), 1);
    let peer = engine.last_peer().unwrap();
    assert_eq!(peer.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn malformed_offer_payload_is_rejected_with_notice() {
    let dir = tempfile::tempdir().unwrap();
    let (state, engine) = setup(dir.path(), "hello").await;
    let (_guard, mut rx) = state.core.hub.open_stream(ROOM, USER);

    let bad = SignalEvent::new(
        SignalKind::Offer,
        USER,
        Some(BOT),
        ROOM,
        json!({"type": "answer", "sdp": "v=0"}),
    );
    signaling::relay_signal(&state, bad).await;

    assert!(wait_for(&mut rx, Duration::from_secs(1), |ev| is_system(
        ev,
        "invalid_offer_payload"
    ))
    .await
    .is_some());
    assert_eq!(state.sessions.session_count(), 0);
    assert_eq!(engine.peer_count(), 0);
}

#[tokio::test]
async fn missing_engine_reports_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(AppState::with_engine(
        mock_voice_config(dir.path(), "hello").await,
        None,
    ));
    let (_guard, mut rx) = state.core.hub.open_stream(ROOM, USER);

    signaling::relay_signal(&state, offer_event()).await;

    assert!(
        wait_for(&mut rx, Duration::from_secs(1), |ev| is_system(
            ev,
            "wrtc_unavailable"
        ))
        .await
        .is_some()
    );
    assert_eq!(state.sessions.session_count(), 0);
}

#[tokio::test]
async fn second_offer_restarts_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let (state, engine) = setup(dir.path(), "hello").await;
    let (_guard, mut rx) = state.core.hub.open_stream(ROOM, USER);

    signaling::relay_signal(&state, offer_event()).await;
    wait_for(&mut rx, Duration::from_secs(2), |ev| {
        ev.kind == SignalKind::Answer
    })
    .await
    .expect("first answer");
    let first_peer = engine.last_peer().unwrap();

    signaling::relay_signal(&state, offer_event()).await;
    wait_for(&mut rx, Duration::from_secs(2), |ev| {
        ev.kind == SignalKind::Answer
    })
    .await
    .expect("second answer");

    // Fresh session, fresh peer; the old one is fully released.
    assert_eq!(state.sessions.session_count(), 1);
    assert_eq!(engine.peer_count(), 2);
    assert_eq!(first_peer.connection_state(), ConnectionState::Closed);

    // The replaced session's inbound path is dead: frames are discarded
    // and no further events can originate from it.
    while rx.try_recv().is_ok() {}
    first_peer.push_captured_frame(&[655i16; 480], 48_000, 1);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn candidates_are_buffered_until_the_offer_arrives() {
    let dir = tempfile::tempdir().unwrap();
    let (state, engine) = setup(dir.path(), "hello").await;
    let (_guard, mut rx) = state.core.hub.open_stream(ROOM, USER);

    // Early candidates: buffered, bounded at 80 with oldest evicted.
    for n in 0..85 {
        signaling::relay_signal(&state, candidate_event(n)).await;
    }
    assert_eq!(state.sessions.pending_candidate_count(ROOM, USER), 80);

    signaling::relay_signal(&state, offer_event()).await;
    wait_for(&mut rx, Duration::from_secs(2), |ev| {
        ev.kind == SignalKind::Answer
    })
    .await
    .expect("answer");

    // The buffer was drained into the connection and deleted.
    let peer = engine.last_peer().unwrap();
    assert_eq!(peer.candidate_count(), 80);
    assert_eq!(state.sessions.pending_candidate_count(ROOM, USER), 0);

    // A late candidate is applied directly.
    signaling::relay_signal(&state, candidate_event(99)).await;
    assert_eq!(peer.candidate_count(), 81);
    assert_eq!(state.sessions.pending_candidate_count(ROOM, USER), 0);
}

#[tokio::test]
async fn bye_closes_the_session_idempotently() {
    let dir = tempfile::tempdir().unwrap();
    let (state, engine) = setup(dir.path(), "hello").await;
    let (_guard, mut rx) = state.core.hub.open_stream(ROOM, USER);

    signaling::relay_signal(&state, offer_event()).await;
    wait_for(&mut rx, Duration::from_secs(2), |ev| {
        ev.kind == SignalKind::Answer
    })
    .await
    .expect("answer");
    let peer = engine.last_peer().unwrap();

    let bye = SignalEvent::new(SignalKind::Bye, USER, Some(BOT), ROOM, Value::Null);
    signaling::relay_signal(&state, bye.clone()).await;
    signaling::relay_signal(&state, bye).await; // close twice, same effect

    assert_eq!(state.sessions.session_count(), 0);
    assert_eq!(peer.connection_state(), ConnectionState::Closed);

    // No events ever come out of the closed session again.
    while rx.try_recv().is_ok() {}
    peer.push_captured_frame(&[655i16; 480], 48_000, 1);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn disconnected_peer_keeps_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let (state, engine) = setup(dir.path(), "hello").await;
    let (_guard, mut rx) = state.core.hub.open_stream(ROOM, USER);

    signaling::relay_signal(&state, offer_event()).await;
    wait_for(&mut rx, Duration::from_secs(2), |ev| {
        ev.kind == SignalKind::Answer
    })
    .await
    .expect("answer");
    let peer = engine.last_peer().unwrap();

    peer.drive_connection_state(ConnectionState::Disconnected);
    assert!(wait_for(&mut rx, Duration::from_secs(1), |ev| is_system(
        ev,
        "connection_disconnected"
    ))
    .await
    .is_some());
    // Recovery is the client's job; the session survives.
    assert_eq!(state.sessions.session_count(), 1);

    peer.drive_connection_state(ConnectionState::Failed);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(state.sessions.session_count(), 0);
}

#[tokio::test]
async fn absent_tools_are_notified_once_per_session() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(LoopbackEngine::new());
    let config = Arc::new(VoiceConfig {
        stt_binary: "/nonexistent/friday/stt".to_string(),
        tts_binary: "/nonexistent/friday/tts".to_string(),
        decoder_binary: "/nonexistent/friday/ffmpeg".to_string(),
        ..VoiceConfig::default()
    });
    let state = Arc::new(AppState::with_engine(
        config,
        Some(Arc::clone(&engine) as Arc<dyn RtcEngine>),
    ));
    let (_guard, mut rx) = state.core.hub.open_stream(ROOM, USER);

    signaling::relay_signal(&state, offer_event()).await;

    for code in ["stt_binary_missing", "tts_binary_missing", "ffmpeg_missing"] {
        assert!(
            wait_for(&mut rx, Duration::from_secs(2), |ev| is_system(ev, code))
                .await
                .is_some(),
            "expected {code} notice"
        );
    }
}

#[tokio::test]
async fn spoken_turn_flows_to_transcript_reply_and_playback() {
    let dir = tempfile::tempdir().unwrap();
    let (state, engine) = setup(dir.path(), "hello from the bridge").await;
    let (_guard, mut rx) = state.core.hub.open_stream(ROOM, USER);

    signaling::relay_signal(&state, offer_event()).await;
    wait_for(&mut rx, Duration::from_secs(2), |ev| {
        ev.kind == SignalKind::Answer
    })
    .await
    .expect("answer");
    let peer = engine.last_peer().unwrap();

    // 800 ms of speech, then silence past the 2 s hangover. The hangover
    // is wall-clock, so the quiet frames are spread over real time (thick
    // enough that buffered audio stays ahead of the clock on slow hosts).
    for _ in 0..80 {
        peer.push_captured_frame(&[655i16; 480], 48_000, 1);
    }
    for _ in 0..50 {
        for _ in 0..20 {
            peer.push_captured_frame(&[0i16; 480], 48_000, 1);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let detected = wait_for(&mut rx, Duration::from_secs(3), |ev| {
        is_system(ev, "voice_turn_detected")
    })
    .await;
    assert!(detected.is_some(), "VAD never finalised the utterance");

    let assistant = wait_for(&mut rx, Duration::from_secs(5), |ev| {
        ev.kind == SignalKind::Assistant
    })
    .await
    .expect("assistant event");
    let user_message = assistant
        .payload
        .pointer("/userEntry/message")
        .and_then(|m| m.as_str());
    assert_eq!(user_message, Some("hello from the bridge"));
    assert_eq!(
        assistant.payload.pointer("/reply/message").and_then(|m| m.as_str()),
        Some(FALLBACK_REPLY)
    );
    // Audio rides the media track, not the event.
    assert!(assistant.payload["audioBase64"].is_null());
    assert!(assistant.payload["audioMimeType"].is_null());

    let history = state.core.chat.history(ROOM);
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].message, "hello from the bridge");
    assert_eq!(history[1].message, FALLBACK_REPLY);

    // The paced reply reaches the outbound source as 480-sample frames.
    let mut frames = Vec::new();
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        frames = peer.source_frames();
        if !frames.is_empty() {
            break;
        }
    }
    assert!(!frames.is_empty(), "no playback reached the source");
    assert!(frames.iter().all(|f| f.len() == 480));
}

#[tokio::test]
async fn broken_source_tears_the_session_down() {
    let dir = tempfile::tempdir().unwrap();
    let (state, engine) = setup(dir.path(), "hello").await;
    let (_guard, mut rx) = state.core.hub.open_stream(ROOM, USER);

    signaling::relay_signal(&state, offer_event()).await;
    wait_for(&mut rx, Duration::from_secs(2), |ev| {
        ev.kind == SignalKind::Answer
    })
    .await
    .expect("answer");
    let peer = engine.last_peer().unwrap();
    peer.break_source();

    let session = state.sessions.session(ROOM, USER).unwrap();
    // Any queued playback now fails on the first tick and closes the call.
    session.playback().enqueue(vec![1i16; 4_800]);

    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if state.sessions.session_count() == 0 {
            break;
        }
    }
    assert_eq!(state.sessions.session_count(), 0);
}

// ---------------------------------------------------------------------------
// HTTP surface
// ---------------------------------------------------------------------------

async fn response_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn health_check_returns_ok() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _engine) = setup(dir.path(), "hello").await;
    let app = app((*state).clone());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = response_json(response).await;
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn event_stream_requires_peer_id() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _engine) = setup(dir.path(), "hello").await;

    let response = app((*state).clone())
        .oneshot(
            Request::builder()
                .uri("/api/webrtc/events")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app((*state).clone())
        .oneshot(
            Request::builder()
                .uri("/api/webrtc/events?peerId=alice")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));
}

#[tokio::test]
async fn signal_endpoint_validates_and_relays() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _engine) = setup(dir.path(), "hello").await;

    // A candidate for a peer with no open stream: accepted, no delivery,
    // no crash.
    let response = app((*state).clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/webrtc/signal")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({
                        "type": "candidate",
                        "from": "alice",
                        "to": "nobody-listening",
                        "roomId": ROOM,
                        "payload": {"candidate": "candidate:1 1 udp 1 192.0.2.1 9 typ host"}
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await["ok"], true);

    // The server stays healthy for later subscribers.
    let (_guard, mut rx) = state.core.hub.open_stream(ROOM, "late-joiner");
    let chat = SignalEvent::new(SignalKind::Chat, "alice", Some("late-joiner"), ROOM, json!({}));
    state.core.hub.fan_out(&chat);
    assert!(rx.try_recv().is_ok());

    // Unsupported type and missing fields are malformed.
    for body in [
        json!({"type": "chat", "from": "alice", "roomId": ROOM}),
        json!({"type": "offer", "roomId": ROOM}),
        json!({"from": "alice", "roomId": ROOM}),
    ] {
        let response = app((*state).clone())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/webrtc/signal")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response_json(response).await["ok"], false);
    }
}

#[tokio::test]
async fn chat_endpoints_append_and_read() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _engine) = setup(dir.path(), "hello").await;

    let response = app((*state).clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/webrtc/chat")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({"roomId": ROOM, "role": "user", "message": "good morning"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let posted = response_json(response).await;
    assert_eq!(posted["ok"], true);
    assert_eq!(posted["entry"]["message"], "good morning");

    let response = app((*state).clone())
        .oneshot(
            Request::builder()
                .uri(format!("/api/webrtc/chat?roomId={ROOM}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let history = response_json(response).await;
    assert_eq!(history["history"][0]["message"], "good morning");

    // Empty messages are malformed.
    let response = app((*state).clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/webrtc/chat")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({"roomId": ROOM, "role": "user", "message": "  "}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn assistant_endpoint_returns_reply_with_inline_audio() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _engine) = setup(dir.path(), "hello").await;

    let response = app((*state).clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/webrtc/assistant")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({"roomId": ROOM, "transcript": "status report"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = response_json(response).await;
    assert_eq!(json["ok"], true);
    assert_eq!(json["transcript"], "status report");
    assert_eq!(json["reply"]["message"], FALLBACK_REPLY);
    // This surface does return inline audio, unlike the media-track path.
    assert_eq!(json["audioMimeType"], "audio/ogg");
    assert!(json["audioBase64"].as_str().is_some());

    let history = state.core.chat.history(ROOM);
    assert_eq!(history.len(), 2);

    // No transcript, no audio, no fallback: malformed.
    let response = app((*state).clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/webrtc/assistant")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({"roomId": ROOM}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
