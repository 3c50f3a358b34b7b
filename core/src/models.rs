//! Data models for CoachCall

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Identity
// ============================================================================

/// Booking identifier that correlates every signaling message of one call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Which side of the call this participant is on. Fixed for the call's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Initiator,
    Receiver,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Receiver => "receiver",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The authenticated local user, supplied by the identity system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalUser {
    pub user_id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

impl LocalUser {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            avatar_url: None,
        }
    }
}

/// The other party of the call as known to the local client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteParty {
    pub user_id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

impl RemoteParty {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            avatar_url: None,
        }
    }
}

// ============================================================================
// Call state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Idle,
    Connecting,
    Ringing,
    Active,
    Ended,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Ended)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    Rejected,
    MediaUnavailable,
    RelayUnavailable,
    RelayLost,
    ConnectionFailed,
    Timeout,
}

/// Last status the peer reported about itself. Stale until the first update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStatus {
    pub is_muted: bool,
    pub is_video_on: bool,
    pub is_connected: bool,
    pub has_left: bool,
}

impl Default for RemoteStatus {
    fn default() -> Self {
        Self {
            is_muted: false,
            is_video_on: true,
            is_connected: false,
            has_left: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingOutcome {
    NotRecorded,
    Uploading,
    Uploaded { file_name: String, size: usize },
    Empty,
    Failed { reason: String },
}

/// Observable view of one call, published after every processed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSnapshot {
    pub session_id: SessionId,
    pub role: Role,
    pub state: CallState,
    pub is_ringing: bool,
    pub is_muted: bool,
    pub is_video_enabled: bool,
    pub has_local_stream: bool,
    pub remote_track_count: usize,
    pub remote_status: RemoteStatus,
    pub end_reason: Option<EndReason>,
    pub recording: RecordingOutcome,
}

impl CallSnapshot {
    pub fn new(session_id: SessionId, role: Role) -> Self {
        Self {
            session_id,
            role,
            state: CallState::Idle,
            is_ringing: false,
            is_muted: false,
            is_video_enabled: true,
            has_local_stream: false,
            remote_track_count: 0,
            remote_status: RemoteStatus::default(),
            end_reason: None,
            recording: RecordingOutcome::NotRecorded,
        }
    }
}
