//! Chat transcript entry types.

use serde::{Deserialize, Serialize};

use crate::signal::now_iso8601;

/// Author role of a chat entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

/// One line of a room transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub role: ChatRole,
    /// Non-empty message text.
    pub message: String,
    /// ISO-8601 UTC timestamp.
    pub timestamp: String,
}

impl ChatEntry {
    /// Creates an entry stamped with the current UTC time.
    ///
    /// Returns `None` when `message` is empty or whitespace-only; callers
    /// treat that as malformed input.
    pub fn new(role: ChatRole, message: &str) -> Option<Self> {
        let message = message.trim();
        if message.is_empty() {
            return None;
        }
        Some(Self {
            role,
            message: message.to_string(),
            timestamp: now_iso8601(),
        })
    }
}
