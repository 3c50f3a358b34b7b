//! Signaling relay: connection registry, user sockets and session rooms

use coachcall_core::signaling::{ClientEvent, ServerEvent, SessionRef};
use coachcall_core::SessionId;
use dashmap::DashMap;
use std::collections::VecDeque;
use tokio::sync::mpsc;
use uuid::Uuid;

pub type ConnectionId = Uuid;

/// An open WebSocket connection
struct Connection {
    user_id: Option<String>,
    sessions: Vec<SessionId>,
    sender: mpsc::UnboundedSender<ServerEvent>,
}

/// Participants of one booking, plus frames sent while nobody else was there
#[derive(Default)]
struct Room {
    members: Vec<ConnectionId>,
    backlog: VecDeque<ServerEvent>,
}

impl Room {
    /// Queue a frame for the next joiner. A full backlog gives up its oldest
    /// candidate or status frame first; descriptions and call control stay.
    /// Returns the frame that did not fit, if any.
    fn queue(&mut self, event: ServerEvent, limit: usize) -> Option<ServerEvent> {
        if self.backlog.len() < limit {
            self.backlog.push_back(event);
            return None;
        }

        let evict = match self.backlog.iter().position(is_expendable) {
            Some(at) => at,
            None if is_expendable(&event) || self.backlog.is_empty() => return Some(event),
            None => 0,
        };
        let dropped = self.backlog.remove(evict);
        self.backlog.push_back(event);
        dropped
    }
}

/// Frames a late joiner can do without; newer ones supersede them.
fn is_expendable(event: &ServerEvent) -> bool {
    matches!(event, ServerEvent::IceCandidate(_) | ServerEvent::UserStatus(_))
}

/// Routes signaling frames between the two sides of each session
pub struct SignalingRelay {
    /// connection_id -> connection
    connections: DashMap<ConnectionId, Connection>,
    /// user_id -> connections registered for that user
    users: DashMap<String, Vec<ConnectionId>>,
    /// session_id -> room
    rooms: DashMap<SessionId, Room>,
    backlog_limit: usize,
}

impl SignalingRelay {
    pub fn new(backlog_limit: usize) -> Self {
        Self {
            connections: DashMap::new(),
            users: DashMap::new(),
            rooms: DashMap::new(),
            backlog_limit,
        }
    }

    /// Track a new connection
    pub fn connect(&self, sender: mpsc::UnboundedSender<ServerEvent>) -> ConnectionId {
        let id = Uuid::new_v4();
        self.connections.insert(
            id,
            Connection {
                user_id: None,
                sessions: Vec::new(),
                sender,
            },
        );
        tracing::debug!("Connection opened: {}", id);
        id
    }

    /// Forget a connection and tell its rooms it left
    pub fn disconnect(&self, id: ConnectionId) {
        let Some((_, connection)) = self.connections.remove(&id) else {
            return;
        };

        if let Some(ref user_id) = connection.user_id {
            self.unregister_user(user_id, id);
        }

        for session_id in connection.sessions {
            let remaining = match self.rooms.get_mut(&session_id) {
                Some(mut room) => {
                    room.members.retain(|m| *m != id);
                    room.members.clone()
                }
                None => continue,
            };

            if remaining.is_empty() {
                self.rooms.remove(&session_id);
                tracing::debug!("Session {} closed", session_id);
                continue;
            }

            let left = ServerEvent::UserLeft(SessionRef {
                session_id: session_id.clone(),
            });
            for member in remaining {
                self.send_to(member, left.clone());
            }
        }

        tracing::info!(
            "Connection closed: {} (user={})",
            id,
            connection.user_id.as_deref().unwrap_or("-")
        );
    }

    /// Apply one client frame
    pub fn handle(&self, from: ConnectionId, event: ClientEvent) {
        match event {
            ClientEvent::RegisterUserSocket(user_id) => self.register_user(from, user_id),
            ClientEvent::JoinSession(join) => {
                if join.session_id.is_empty() {
                    self.send_error(from, "INVALID_SESSION", "joinSession requires a sessionId");
                    return;
                }
                self.join(from, join.session_id, &join.user_id);
            }
            ClientEvent::CallUser(call) => {
                if call.invitation.session_id.is_empty() {
                    self.send_error(from, "INVALID_SESSION", "call-user requires a sessionId");
                    return;
                }
                let delivered = self.send_to_user(&call.callee_id, ServerEvent::IncomingCall(call.invitation));
                if delivered == 0 {
                    tracing::info!("Callee {} is offline", call.callee_id);
                    self.send_error(from, "USER_OFFLINE", &format!("{} is not connected", call.callee_id));
                }
            }
            other => {
                let (Some(session_id), Some(forwarded)) = (other.session_id().cloned(), other.forwarded()) else {
                    return;
                };
                self.send_to_room(&session_id, from, forwarded);
            }
        }
    }

    fn register_user(&self, id: ConnectionId, user_id: String) {
        let previous = match self.connections.get_mut(&id) {
            Some(mut connection) => connection.user_id.replace(user_id.clone()),
            None => return,
        };
        if let Some(previous) = previous {
            if previous == user_id {
                return;
            }
            self.unregister_user(&previous, id);
        }

        self.users.entry(user_id.clone()).or_default().push(id);
        tracing::info!("User socket registered: user={}, connection={}", user_id, id);
    }

    fn unregister_user(&self, user_id: &str, id: ConnectionId) {
        let now_empty = match self.users.get_mut(user_id) {
            Some(mut ids) => {
                ids.retain(|c| *c != id);
                ids.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.users.remove_if(user_id, |_, ids| ids.is_empty());
        }
    }

    fn join(&self, id: ConnectionId, session_id: SessionId, user_id: &str) {
        match self.connections.get_mut(&id) {
            Some(mut connection) => {
                if !connection.sessions.contains(&session_id) {
                    connection.sessions.push(session_id.clone());
                }
            }
            None => return,
        }

        let backlog = {
            let mut room = self.rooms.entry(session_id.clone()).or_default();
            if !room.members.contains(&id) {
                room.members.push(id);
            }
            std::mem::take(&mut room.backlog)
        };

        tracing::info!("User {} joined session {} ({} queued)", user_id, session_id, backlog.len());
        for event in backlog {
            self.send_to(id, event);
        }
    }

    /// Deliver to every other member of the room, or queue for the next joiner
    fn send_to_room(&self, session_id: &SessionId, from: ConnectionId, event: ServerEvent) -> usize {
        let targets: Vec<ConnectionId> = match self.rooms.get_mut(session_id) {
            Some(mut room) => {
                let targets: Vec<ConnectionId> = room.members.iter().copied().filter(|m| *m != from).collect();
                if targets.is_empty() {
                    if let Some(dropped) = room.queue(event, self.backlog_limit) {
                        tracing::warn!("Backlog full for session {}, dropped {}", session_id, dropped.name());
                    }
                    return 0;
                }
                targets
            }
            None => {
                tracing::debug!("Dropping {} for unknown session {}", event.name(), session_id);
                return 0;
            }
        };

        for target in &targets {
            self.send_to(*target, event.clone());
        }
        targets.len()
    }

    /// Send to every connection registered for `user_id`
    pub fn send_to_user(&self, user_id: &str, event: ServerEvent) -> usize {
        let targets: Vec<ConnectionId> = self
            .users
            .get(user_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();

        targets
            .into_iter()
            .filter(|target| self.send_to(*target, event.clone()))
            .count()
    }

    fn send_to(&self, id: ConnectionId, event: ServerEvent) -> bool {
        let Some(connection) = self.connections.get(&id) else {
            return false;
        };
        if let Err(e) = connection.sender.send(event) {
            tracing::warn!("Failed to send to connection {}: {}", id, e);
            return false;
        }
        true
    }

    fn send_error(&self, id: ConnectionId, code: &str, message: &str) {
        self.send_to(
            id,
            ServerEvent::Error {
                code: code.to_string(),
                message: message.to_string(),
            },
        );
    }

    pub fn is_user_online(&self, user_id: &str) -> bool {
        self.users.get(user_id).map(|ids| !ids.is_empty()).unwrap_or(false)
    }

    pub fn online_user_count(&self) -> usize {
        self.users.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn active_session_count(&self) -> usize {
        self.rooms.len()
    }
}

impl Default for SignalingRelay {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coachcall_core::signaling::{
        CallInvitation, CallUser, IceCandidate, IcePayload, JoinSession, OptionalSessionRef, SdpPayload,
        SessionDescription,
    };
    use coachcall_core::Role;

    fn open(relay: &SignalingRelay) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (relay.connect(tx), rx)
    }

    fn join(relay: &SignalingRelay, id: ConnectionId, user: &str, role: Role) {
        relay.handle(id, ClientEvent::RegisterUserSocket(user.to_string()));
        relay.handle(
            id,
            ClientEvent::JoinSession(JoinSession {
                session_id: "S1".into(),
                user_id: user.to_string(),
                role,
            }),
        );
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn ice() -> ClientEvent {
        ClientEvent::IceCandidate(IcePayload {
            candidate: IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 9 typ host"),
            session_id: "S1".into(),
        })
    }

    #[test]
    fn test_user_registration() {
        let relay = SignalingRelay::default();
        let (a, _rx_a) = open(&relay);
        let (b, _rx_b) = open(&relay);

        relay.handle(a, ClientEvent::RegisterUserSocket("user1".into()));
        relay.handle(b, ClientEvent::RegisterUserSocket("user1".into()));
        assert!(relay.is_user_online("user1"));
        assert_eq!(relay.online_user_count(), 1);

        relay.disconnect(a);
        assert!(relay.is_user_online("user1"));

        relay.disconnect(b);
        assert!(!relay.is_user_online("user1"));
        assert_eq!(relay.connection_count(), 0);
    }

    #[test]
    fn test_call_user_reaches_every_callee_socket() {
        let relay = SignalingRelay::default();
        let (caller, mut caller_rx) = open(&relay);
        let (callee, mut callee_rx) = open(&relay);
        relay.handle(callee, ClientEvent::RegisterUserSocket("trainee".into()));

        let invitation = CallInvitation {
            session_id: "S1".into(),
            caller_id: "trainer".into(),
            caller_role: Role::Initiator,
            caller_display_name: "Tess".into(),
            caller_avatar_url: None,
        };
        relay.handle(
            caller,
            ClientEvent::CallUser(CallUser {
                callee_id: "trainee".into(),
                invitation: invitation.clone(),
            }),
        );
        assert_eq!(drain(&mut callee_rx), vec![ServerEvent::IncomingCall(invitation.clone())]);

        relay.handle(
            caller,
            ClientEvent::CallUser(CallUser {
                callee_id: "nobody".into(),
                invitation,
            }),
        );
        match drain(&mut caller_rx).as_slice() {
            [ServerEvent::Error { code, .. }] => assert_eq!(code, "USER_OFFLINE"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_room_forwarding_skips_sender() {
        let relay = SignalingRelay::default();
        let (a, mut rx_a) = open(&relay);
        let (b, mut rx_b) = open(&relay);
        join(&relay, a, "trainer", Role::Initiator);
        join(&relay, b, "trainee", Role::Receiver);

        relay.handle(a, ice());
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(drain(&mut rx_b).len(), 1);

        relay.handle(b, ClientEvent::EndCall(SessionRef { session_id: "S1".into() }));
        assert_eq!(
            drain(&mut rx_a),
            vec![ServerEvent::CallEnded(SessionRef { session_id: "S1".into() })]
        );
    }

    #[test]
    fn test_accept_from_listener_socket_reaches_room() {
        let relay = SignalingRelay::default();
        let (trainer, mut trainer_rx) = open(&relay);
        let (listener, _listener_rx) = open(&relay);
        join(&relay, trainer, "trainer", Role::Initiator);
        relay.handle(listener, ClientEvent::RegisterUserSocket("trainee".into()));

        relay.handle(listener, ClientEvent::AcceptCall(SessionRef { session_id: "S1".into() }));
        assert_eq!(
            drain(&mut trainer_rx),
            vec![ServerEvent::CallAccepted(OptionalSessionRef {
                session_id: Some("S1".into())
            })]
        );
    }

    #[test]
    fn test_frames_wait_for_the_other_party() {
        let relay = SignalingRelay::new(2);
        let (a, _rx_a) = open(&relay);
        join(&relay, a, "trainer", Role::Initiator);

        relay.handle(a, ice());
        relay.handle(a, ice());
        relay.handle(a, ice());

        let (b, mut rx_b) = open(&relay);
        join(&relay, b, "trainee", Role::Receiver);
        let queued = drain(&mut rx_b);
        assert_eq!(queued.len(), 2);
        assert!(queued.iter().all(|e| matches!(e, ServerEvent::IceCandidate(_))));
    }

    #[test]
    fn test_full_backlog_keeps_the_offer() {
        let relay = SignalingRelay::new(2);
        let (a, _rx_a) = open(&relay);
        join(&relay, a, "trainer", Role::Initiator);

        let offer = SessionDescription::offer("v=0 trainer-offer");
        relay.handle(
            a,
            ClientEvent::Offer(SdpPayload {
                sdp: offer.clone(),
                session_id: "S1".into(),
            }),
        );
        relay.handle(a, ice());
        relay.handle(
            a,
            ClientEvent::IceCandidate(IcePayload {
                candidate: IceCandidate::new("candidate:2 1 udp 1 10.0.0.2 9 typ host"),
                session_id: "S1".into(),
            }),
        );

        let (b, mut rx_b) = open(&relay);
        join(&relay, b, "trainee", Role::Receiver);
        match drain(&mut rx_b).as_slice() {
            [ServerEvent::Offer(first), ServerEvent::IceCandidate(last)] => {
                assert_eq!(first.sdp, offer);
                assert!(last.candidate.candidate.starts_with("candidate:2"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_backlog_of_descriptions_drops_late_candidates() {
        let relay = SignalingRelay::new(1);
        let (a, _rx_a) = open(&relay);
        join(&relay, a, "trainer", Role::Initiator);

        relay.handle(
            a,
            ClientEvent::Offer(SdpPayload {
                sdp: SessionDescription::offer("v=0 trainer-offer"),
                session_id: "S1".into(),
            }),
        );
        relay.handle(a, ice());

        let (b, mut rx_b) = open(&relay);
        join(&relay, b, "trainee", Role::Receiver);
        match drain(&mut rx_b).as_slice() {
            [ServerEvent::Offer(_)] => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_disconnect_notifies_room_and_closes_empty_rooms() {
        let relay = SignalingRelay::default();
        let (a, _rx_a) = open(&relay);
        let (b, mut rx_b) = open(&relay);
        join(&relay, a, "trainer", Role::Initiator);
        join(&relay, b, "trainee", Role::Receiver);
        assert_eq!(relay.active_session_count(), 1);

        relay.disconnect(a);
        assert_eq!(
            drain(&mut rx_b),
            vec![ServerEvent::UserLeft(SessionRef { session_id: "S1".into() })]
        );

        relay.disconnect(b);
        assert_eq!(relay.active_session_count(), 0);
    }

    #[test]
    fn test_join_without_session_is_rejected() {
        let relay = SignalingRelay::default();
        let (a, mut rx_a) = open(&relay);
        relay.handle(
            a,
            ClientEvent::JoinSession(JoinSession {
                session_id: "".into(),
                user_id: "trainer".into(),
                role: Role::Initiator,
            }),
        );
        assert!(matches!(drain(&mut rx_a).as_slice(), [ServerEvent::Error { .. }]));
        assert_eq!(relay.active_session_count(), 0);
    }
}
