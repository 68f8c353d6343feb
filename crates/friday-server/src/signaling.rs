//! Signaling hub: SSE subscriber registry and the relay policy.
//!
//! Streams are keyed by `(room_id, peer_id)`; one peer may hold several
//! live streams. Fan-out never lets a dead subscriber kill its siblings:
//! failed sends just prune that handle. Events without a target are
//! dropped, never broadcast.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::debug;

use friday_types::{is_bot_peer, SignalEvent, SignalKind};

use crate::AppState;

struct StreamHandle {
    id: u64,
    tx: mpsc::UnboundedSender<SignalEvent>,
}

/// Subscriber registry for the event streams.
pub struct SignalHub {
    subscribers: Mutex<HashMap<(String, String), Vec<StreamHandle>>>,
    next_id: AtomicU64,
}

impl SignalHub {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Registers a stream under `(room_id, peer_id)`. Dropping the guard
    /// deregisters it.
    pub fn open_stream(
        self: &Arc<Self>,
        room_id: &str,
        peer_id: &str,
    ) -> (StreamGuard, mpsc::UnboundedReceiver<SignalEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let key = (room_id.to_string(), peer_id.to_string());
        self.subscribers
            .lock()
            .expect("subscriber table lock")
            .entry(key.clone())
            .or_default()
            .push(StreamHandle { id, tx });
        (
            StreamGuard {
                hub: Arc::clone(self),
                key,
                id,
            },
            rx,
        )
    }

    /// Enqueues `event` to every live subscriber of `(room_id, event.to)`.
    /// Dead subscribers are silently pruned.
    pub fn fan_out(&self, event: &SignalEvent) {
        let Some(to) = event.to.as_deref() else {
            return;
        };
        let key = (event.room_id.clone(), to.to_string());
        let mut subscribers = self.subscribers.lock().expect("subscriber table lock");
        if let Some(handles) = subscribers.get_mut(&key) {
            handles.retain(|h| h.tx.send(event.clone()).is_ok());
            if handles.is_empty() {
                subscribers.remove(&key);
            }
        }
    }

    /// Live stream count for `(room_id, peer_id)` (tests and diagnostics).
    pub fn subscriber_count(&self, room_id: &str, peer_id: &str) -> usize {
        self.subscribers
            .lock()
            .expect("subscriber table lock")
            .get(&(room_id.to_string(), peer_id.to_string()))
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn deregister(&self, key: &(String, String), id: u64) {
        let mut subscribers = self.subscribers.lock().expect("subscriber table lock");
        if let Some(handles) = subscribers.get_mut(key) {
            handles.retain(|h| h.id != id);
            if handles.is_empty() {
                subscribers.remove(key);
            }
        }
    }
}

impl Default for SignalHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Deregisters its stream on drop (SSE cancel).
pub struct StreamGuard {
    hub: Arc<SignalHub>,
    key: (String, String),
    id: u64,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.hub.deregister(&self.key, self.id);
    }
}

/// Applies the relay policy to an inbound signal.
///
/// - `bye` closes the sender's session (and the target's, when set), then
///   falls through so the remote side still observes the bye.
/// - Signals addressed to a server-bot peer go to the session manager.
/// - Other targeted signals fan out to the target's subscribers.
/// - Untargeted signals are dropped.
pub async fn relay_signal(state: &Arc<AppState>, event: SignalEvent) {
    if event.kind == SignalKind::Bye {
        state
            .sessions
            .close_session(&event.room_id, &event.from)
            .await;
        if let Some(to) = event.to.clone() {
            state.sessions.close_session(&event.room_id, &to).await;
        }
    }

    match event.to.as_deref() {
        Some(to) if is_bot_peer(to) => state.sessions.handle_bot_signal(event).await,
        Some(_) => state.core.hub.fan_out(&event),
        None => debug!(kind = event.kind.as_str(), "dropping untargeted signal"),
    }
}
