//! Signaling wire contract between clients and the relay.
//!
//! Every frame is a JSON object `{ "event": <name>, "data": <payload> }`.
//! Client and relay directions are separate closed enums so a handler that
//! matches on them is checked for exhaustiveness.

use crate::models::{RemoteParty, Role, SessionId};
use serde::{Deserialize, Serialize};

// ============================================================================
// Payloads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSession {
    pub session_id: SessionId,
    pub user_id: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRef {
    pub session_id: SessionId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct OptionalSessionRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// An SDP blob in the same JSON shape browsers use for `RTCSessionDescription`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SdpPayload {
    pub sdp: SessionDescription,
    pub session_id: SessionId,
}

/// A trickled ICE candidate (`RTCIceCandidateInit` JSON shape).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IcePayload {
    pub candidate: IceCandidate,
    pub session_id: SessionId,
}

/// Partial status update; absent flags leave the receiver's mirror unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatusUpdate {
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_muted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_video_on: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_connected: Option<bool>,
}

impl UserStatusUpdate {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            is_muted: None,
            is_video_on: None,
            is_connected: None,
        }
    }
}

/// Invitation delivered once to the callee's notification listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallInvitation {
    #[serde(default)]
    pub session_id: SessionId,
    pub caller_id: String,
    pub caller_role: Role,
    #[serde(default)]
    pub caller_display_name: String,
    #[serde(default)]
    pub caller_avatar_url: Option<String>,
}

impl CallInvitation {
    /// The caller, as the other party of the call.
    pub fn caller(&self) -> RemoteParty {
        RemoteParty {
            user_id: self.caller_id.clone(),
            display_name: self.caller_display_name.clone(),
            avatar_url: self.caller_avatar_url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallUser {
    pub callee_id: String,
    pub invitation: CallInvitation,
}

// ============================================================================
// Events
// ============================================================================

/// Frames a client sends to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "registerUserSocket")]
    RegisterUserSocket(String),

    #[serde(rename = "joinSession")]
    JoinSession(JoinSession),

    #[serde(rename = "call-user")]
    CallUser(CallUser),

    #[serde(rename = "accept-call")]
    AcceptCall(SessionRef),

    #[serde(rename = "reject-call")]
    RejectCall(SessionRef),

    #[serde(rename = "offer")]
    Offer(SdpPayload),

    #[serde(rename = "answer")]
    Answer(SdpPayload),

    #[serde(rename = "ice-candidate")]
    IceCandidate(IcePayload),

    #[serde(rename = "user-status")]
    UserStatus(UserStatusUpdate),

    #[serde(rename = "user-left")]
    UserLeft(SessionRef),

    #[serde(rename = "endCall")]
    EndCall(SessionRef),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::RegisterUserSocket(_) => "registerUserSocket",
            ClientEvent::JoinSession(_) => "joinSession",
            ClientEvent::CallUser(_) => "call-user",
            ClientEvent::AcceptCall(_) => "accept-call",
            ClientEvent::RejectCall(_) => "reject-call",
            ClientEvent::Offer(_) => "offer",
            ClientEvent::Answer(_) => "answer",
            ClientEvent::IceCandidate(_) => "ice-candidate",
            ClientEvent::UserStatus(_) => "user-status",
            ClientEvent::UserLeft(_) => "user-left",
            ClientEvent::EndCall(_) => "endCall",
        }
    }

    /// Session the event belongs to, if it is session-scoped.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            ClientEvent::RegisterUserSocket(_) => None,
            ClientEvent::JoinSession(j) => Some(&j.session_id),
            ClientEvent::CallUser(c) => Some(&c.invitation.session_id),
            ClientEvent::AcceptCall(s)
            | ClientEvent::RejectCall(s)
            | ClientEvent::UserLeft(s)
            | ClientEvent::EndCall(s) => Some(&s.session_id),
            ClientEvent::Offer(p) | ClientEvent::Answer(p) => Some(&p.session_id),
            ClientEvent::IceCandidate(p) => Some(&p.session_id),
            ClientEvent::UserStatus(u) => Some(&u.session_id),
        }
    }

    /// The frame the relay hands to the other party, if this event is relayed.
    ///
    /// `registerUserSocket` and `joinSession` only update relay bookkeeping.
    pub fn forwarded(&self) -> Option<ServerEvent> {
        match self {
            ClientEvent::RegisterUserSocket(_) | ClientEvent::JoinSession(_) => None,
            ClientEvent::CallUser(c) => Some(ServerEvent::IncomingCall(c.invitation.clone())),
            ClientEvent::AcceptCall(s) => Some(ServerEvent::CallAccepted(OptionalSessionRef {
                session_id: Some(s.session_id.clone()),
            })),
            ClientEvent::RejectCall(s) => Some(ServerEvent::CallRejected(OptionalSessionRef {
                session_id: Some(s.session_id.clone()),
            })),
            ClientEvent::Offer(p) => Some(ServerEvent::Offer(p.clone())),
            ClientEvent::Answer(p) => Some(ServerEvent::Answer(p.clone())),
            ClientEvent::IceCandidate(p) => Some(ServerEvent::IceCandidate(p.clone())),
            ClientEvent::UserStatus(u) => Some(ServerEvent::UserStatus(u.clone())),
            ClientEvent::UserLeft(s) => Some(ServerEvent::UserLeft(s.clone())),
            ClientEvent::EndCall(s) => Some(ServerEvent::CallEnded(s.clone())),
        }
    }
}

/// Frames the relay delivers to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "incoming-call")]
    IncomingCall(CallInvitation),

    #[serde(rename = "call-accepted")]
    CallAccepted(OptionalSessionRef),

    #[serde(rename = "call-rejected")]
    CallRejected(OptionalSessionRef),

    #[serde(rename = "offer")]
    Offer(SdpPayload),

    #[serde(rename = "answer")]
    Answer(SdpPayload),

    #[serde(rename = "ice-candidate")]
    IceCandidate(IcePayload),

    #[serde(rename = "user-status")]
    UserStatus(UserStatusUpdate),

    #[serde(rename = "user-left")]
    UserLeft(SessionRef),

    #[serde(rename = "callEnded")]
    CallEnded(SessionRef),

    #[serde(rename = "error")]
    Error { code: String, message: String },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::IncomingCall(_) => "incoming-call",
            ServerEvent::CallAccepted(_) => "call-accepted",
            ServerEvent::CallRejected(_) => "call-rejected",
            ServerEvent::Offer(_) => "offer",
            ServerEvent::Answer(_) => "answer",
            ServerEvent::IceCandidate(_) => "ice-candidate",
            ServerEvent::UserStatus(_) => "user-status",
            ServerEvent::UserLeft(_) => "user-left",
            ServerEvent::CallEnded(_) => "callEnded",
            ServerEvent::Error { .. } => "error",
        }
    }

    /// Session the event belongs to. `None` for session-less frames.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            ServerEvent::IncomingCall(inv) => Some(&inv.session_id),
            ServerEvent::CallAccepted(s) | ServerEvent::CallRejected(s) => s.session_id.as_ref(),
            ServerEvent::Offer(p) | ServerEvent::Answer(p) => Some(&p.session_id),
            ServerEvent::IceCandidate(p) => Some(&p.session_id),
            ServerEvent::UserStatus(u) => Some(&u.session_id),
            ServerEvent::UserLeft(s) | ServerEvent::CallEnded(s) => Some(&s.session_id),
            ServerEvent::Error { .. } => None,
        }
    }
}
