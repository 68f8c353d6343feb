//! Bounded in-memory room transcripts.

use std::collections::HashMap;
use std::sync::Mutex;

use friday_types::ChatEntry;

/// Maximum entries retained per room; oldest are evicted first.
const MAX_ENTRIES_PER_ROOM: usize = 250;

/// Per-room append log of chat entries.
///
/// The mutex is held only for the map update; callers get snapshots and
/// must not expect later mutations to be visible in them.
pub struct ChatLog {
    rooms: Mutex<HashMap<String, Vec<ChatEntry>>>,
}

impl ChatLog {
    pub fn new() -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
        }
    }

    /// Appends an entry, truncating the room to the newest 250.
    pub fn append(&self, room_id: &str, entry: ChatEntry) {
        let mut rooms = self.rooms.lock().expect("chat log lock");
        let log = rooms.entry(room_id.to_string()).or_default();
        log.push(entry);
        if log.len() > MAX_ENTRIES_PER_ROOM {
            let excess = log.len() - MAX_ENTRIES_PER_ROOM;
            log.drain(..excess);
        }
    }

    /// Snapshot of a room's transcript in append order.
    pub fn history(&self, room_id: &str) -> Vec<ChatEntry> {
        self.rooms
            .lock()
            .expect("chat log lock")
            .get(room_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for ChatLog {
    fn default() -> Self {
        Self::new()
    }
}
