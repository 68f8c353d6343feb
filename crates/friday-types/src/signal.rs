//! Signaling event types and the shape-checked WebRTC payload views.
//!
//! Inbound payloads are opaque `serde_json::Value`s until a shape check
//! validates them against a fixed schema. [`SessionDescription`] and
//! [`IceCandidate`] are the only accepted shapes; anything else is rejected
//! with a [`PayloadError`].

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Kinds of message carried on the signaling bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    Bye,
    Chat,
    System,
    Assistant,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Candidate => "candidate",
            Self::Bye => "bye",
            Self::Chat => "chat",
            Self::System => "system",
            Self::Assistant => "assistant",
        }
    }
}

/// A message on the signaling bus.
///
/// Invariant: every event addressed to a specific peer sets `to`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEvent {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    /// Originating peer id.
    pub from: String,
    /// Target peer id; absent events are never fanned out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub room_id: String,
    /// Type-dependent payload, opaque until shape-checked.
    #[serde(default)]
    pub payload: Value,
    /// ISO-8601 UTC timestamp.
    pub at: String,
}

impl SignalEvent {
    /// Creates an event stamped with the current UTC time.
    pub fn new(kind: SignalKind, from: &str, to: Option<&str>, room_id: &str, payload: Value) -> Self {
        Self {
            kind,
            from: from.to_string(),
            to: to.map(str::to_string),
            room_id: room_id.to_string(),
            payload,
            at: now_iso8601(),
        }
    }

    /// Builds a `system` event with payload `{"message": <code>}`.
    pub fn system(from: &str, to: &str, room_id: &str, code: &str) -> Self {
        Self::new(
            SignalKind::System,
            from,
            Some(to),
            room_id,
            serde_json::json!({ "message": code }),
        )
    }
}

/// Current time as an ISO-8601 UTC string with millisecond precision.
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// SDP description types accepted from clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
}

/// Shape-checked view of an SDP payload: `{type, sdp}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

/// Shape-checked view of an ICE candidate payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u32>,
}

/// A payload failed its shape check.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload does not match the expected shape: {0}")]
    Shape(#[from] serde_json::Error),

    #[error("expected an offer description, got {0:?}")]
    NotAnOffer(SdpType),
}

impl SessionDescription {
    /// Validates an opaque payload as a session description.
    pub fn from_payload(payload: &Value) -> Result<Self, PayloadError> {
        Ok(serde_json::from_value(payload.clone())?)
    }

    /// Validates an opaque payload and requires it to be an offer.
    pub fn offer_from_payload(payload: &Value) -> Result<Self, PayloadError> {
        let desc = Self::from_payload(payload)?;
        if desc.sdp_type != SdpType::Offer {
            return Err(PayloadError::NotAnOffer(desc.sdp_type));
        }
        Ok(desc)
    }
}

impl IceCandidate {
    /// Validates an opaque payload as an ICE candidate.
    pub fn from_payload(payload: &Value) -> Result<Self, PayloadError> {
        Ok(serde_json::from_value(payload.clone())?)
    }
}
