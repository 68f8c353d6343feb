//! The per-session voice turn pipeline.
//!
//! A single worker drains a session's turn queue sequentially:
//! WAV packaging → STT chain → de-duplication → chat log → LLM → chat log
//! → TTS chain → decode → playback. Transcripts are always published even
//! when synthesis or decoding fails; only playback is skipped. Within a
//! session the assistant event for a turn strictly follows that turn's
//! detection notice because the worker is single-flight.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{debug, warn};

use friday_audio::pcm::pcm_to_wav;
use friday_audio::Utterance;
use friday_types::{notice, ChatEntry, ChatRole, SignalEvent, SignalKind};

use crate::session::CallSession;

/// Reply used when the LLM collaborator fails.
pub(crate) const FALLBACK_REPLY: &str = "Comms degraded. Retry in a moment.";

/// Identical consecutive transcripts inside this window are dropped; they
/// are almost always echo of the previous turn.
const DEDUP_WINDOW: Duration = Duration::from_millis(2500);

/// Drains the session's turn queue, then clears the single-flight guard.
pub(crate) async fn run_worker(session: Arc<CallSession>) {
    loop {
        let turn = {
            let mut turns = session.turns.lock().expect("turn queue lock");
            match turns.pop_front() {
                Some(turn) => turn,
                None => {
                    session.processing_turn.store(false, Ordering::Release);
                    return;
                }
            }
        };
        if session.is_closed() {
            session.processing_turn.store(false, Ordering::Release);
            return;
        }
        process_turn(&session, turn).await;
    }
}

async fn process_turn(session: &Arc<CallSession>, turn: Utterance) {
    let core = &session.core;
    let wav = pcm_to_wav(&turn.samples, turn.sample_rate);

    let transcript = match core.stt.transcribe(&wav).await {
        Ok(text) => text,
        Err(e) => {
            warn!(room_id = %session.room_id, error = %e, "transcription failed");
            String::new()
        }
    };
    let transcript = transcript.trim().to_string();
    if transcript.is_empty() {
        session.emit_system(notice::TRANSCRIPTION_EMPTY);
        return;
    }

    if is_duplicate(session, &transcript) {
        debug!(room_id = %session.room_id, "dropping duplicate transcript");
        return;
    }

    let Some(user_entry) = ChatEntry::new(ChatRole::User, &transcript) else {
        return;
    };
    core.chat.append(&session.room_id, user_entry.clone());

    let reply = match core.llm.complete(&transcript).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!(room_id = %session.room_id, error = %e, "LLM failed, using fallback reply");
            FALLBACK_REPLY.to_string()
        }
    };
    let assistant_entry =
        ChatEntry::new(ChatRole::Assistant, &reply).expect("reply text is non-empty");
    core.chat.append(&session.room_id, assistant_entry.clone());

    // Audio is best-effort: a synthesis or decode failure skips playback,
    // the transcript still goes out below.
    match core.tts.synthesize(&reply).await {
        Ok(audio) => match core.decoder.decode_to_playback(&audio.bytes, &audio.format).await {
            Ok(samples) => session.pacer.enqueue(samples),
            Err(e) => warn!(room_id = %session.room_id, error = %e, "decode failed, skipping playback"),
        },
        Err(e) => warn!(room_id = %session.room_id, error = %e, "synthesis failed, skipping playback"),
    }

    if session.is_closed() {
        return;
    }
    // Reply audio rides the media track; the event is metadata only.
    let payload = json!({
        "turnId": uuid::Uuid::new_v4().to_string(),
        "userEntry": user_entry,
        "reply": assistant_entry,
        "audioBase64": null,
        "audioMimeType": null,
    });
    core.hub.fan_out(&SignalEvent::new(
        SignalKind::Assistant,
        &session.bot_peer_id,
        Some(&session.user_peer_id),
        &session.room_id,
        payload,
    ));
}

fn is_duplicate(session: &CallSession, transcript: &str) -> bool {
    let mut last = session.last_transcript.lock().expect("last transcript lock");
    if let Some(at) = last.at {
        if last.text == transcript && at.elapsed() < DEDUP_WINDOW {
            return true;
        }
    }
    last.text = transcript.to_string();
    last.at = Some(Instant::now());
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AppState;
    use friday_rtc::loopback::LoopbackEngine;
    use friday_types::SignalKind;
    use friday_voice::VoiceConfig;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::atomic::Ordering;

    async fn write_script(dir: &std::path::Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        tokio::fs::write(&path, body).await.unwrap();
        let mut perms = tokio::fs::metadata(&path).await.unwrap().permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(&path, perms).await.unwrap();
        path.to_string_lossy().into_owned()
    }

    async fn state_with_mocks(dir: &std::path::Path, transcript: &str) -> AppState {
        let stt = write_script(
            dir,
            "mock_stt.sh",
            &format!("#!/bin/sh\necho '{transcript}'"),
        )
        .await;
        let tts =
            write_script(dir, "mock_tts.sh", "#!/bin/sh\nprintf 'OggS....' > \"$2\"\n").await;
        let decoder = write_script(
            dir,
            "mock_decoder.sh",
            "#!/bin/sh\nfor out in \"$@\"; do :; done\nprintf '\\001\\000\\002\\000' > \"$out\"\n",
        )
        .await;
        let config = Arc::new(VoiceConfig {
            stt_binary: stt,
            tts_binary: tts,
            decoder_binary: decoder,
            ..VoiceConfig::default()
        });
        AppState::with_engine(config, Some(Arc::new(LoopbackEngine::new())))
    }

    async fn open_session(state: &AppState) -> Arc<CallSession> {
        let offer = SignalEvent::new(
            SignalKind::Offer,
            "alice",
            Some("friday-voice-bot-default"),
            "room",
            json!({"type": "offer", "sdp": "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n"}),
        );
        state.sessions.handle_bot_signal(offer).await;
        state
            .sessions
            .session("room", "alice")
            .expect("session should exist after offer")
    }

    fn turn() -> Utterance {
        Utterance {
            samples: vec![655; 48_000],
            sample_rate: 48_000,
        }
    }

    async fn collect_assistant_events(
        rx: &mut tokio::sync::mpsc::UnboundedReceiver<SignalEvent>,
    ) -> Vec<SignalEvent> {
        let mut events = Vec::new();
        while let Ok(Some(ev)) =
            tokio::time::timeout(Duration::from_millis(1_500), rx.recv()).await
        {
            if ev.kind == SignalKind::Assistant {
                events.push(ev);
            }
        }
        events
    }

    #[tokio::test]
    async fn duplicate_transcripts_inside_window_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with_mocks(dir.path(), "repeat after me").await;
        let (_guard, mut rx) = state.core.hub.open_stream("room", "alice");

        let session = open_session(&state).await;
        session.enqueue_turn(turn());
        session.enqueue_turn(turn());

        let assistant = collect_assistant_events(&mut rx).await;
        assert_eq!(assistant.len(), 1, "second identical turn must be dropped");

        // Only one user/assistant pair reached the transcript.
        let history = state.core.chat.history("room");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].message, "repeat after me");
        assert_eq!(history[1].message, FALLBACK_REPLY);
    }

    #[tokio::test]
    async fn turn_queue_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with_mocks(dir.path(), "hello").await;
        let session = open_session(&state).await;

        // Park the worker so enqueues accumulate.
        session.processing_turn.store(true, Ordering::Release);
        for _ in 0..5 {
            session.enqueue_turn(turn());
        }
        assert_eq!(session.turns.lock().unwrap().len(), 3);
        session.processing_turn.store(false, Ordering::Release);
    }

    #[tokio::test]
    async fn empty_transcript_emits_notice_and_skips_llm() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with_mocks(dir.path(), "").await;
        let (_guard, mut rx) = state.core.hub.open_stream("room", "alice");

        let session = open_session(&state).await;
        session.enqueue_turn(turn());

        let mut saw_empty_notice = false;
        while let Ok(Some(ev)) =
            tokio::time::timeout(Duration::from_millis(1_500), rx.recv()).await
        {
            if ev.kind == SignalKind::System
                && ev.payload.get("message").and_then(|m| m.as_str())
                    == Some(notice::TRANSCRIPTION_EMPTY)
            {
                saw_empty_notice = true;
                break;
            }
            assert_ne!(ev.kind, SignalKind::Assistant);
        }
        assert!(saw_empty_notice);
        assert!(state.core.chat.history("room").is_empty());
    }

    #[tokio::test]
    async fn decoded_reply_audio_reaches_the_playback_source() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with_mocks(dir.path(), "play me something").await;
        let engine = LoopbackEngine::new();
        // Rebuild state around an engine handle we keep.
        let engine = Arc::new(engine);
        let state = AppState::with_engine(
            Arc::clone(&state.core.voice_config),
            Some(Arc::clone(&engine) as Arc<dyn friday_rtc::RtcEngine>),
        );

        let session = open_session(&state).await;
        let peer = engine.last_peer().expect("loopback peer");
        session.enqueue_turn(turn());

        // The pacer needs a few real ticks to push the decoded frame.
        let mut frames = Vec::new();
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            frames = peer.source_frames();
            if !frames.is_empty() {
                break;
            }
        }
        assert!(!frames.is_empty(), "pacer never reached the audio source");
        assert_eq!(frames[0].len(), friday_audio::SAMPLES_PER_FRAME);
        // Decoded samples [1, 2] lead the zero-padded frame.
        assert_eq!(frames[0][0], 1);
        assert_eq!(frames[0][1], 2);
        assert_eq!(frames[0][2], 0);
    }
}
