//! Call notification listener.
//!
//! Keeps a relay connection open for a signed-in user, surfaces the latest
//! incoming call, and sends the user's accept or reject decision back.

use crate::error::{Error, Result};
use crate::models::{LocalUser, SessionId};
use crate::network::{RelayConnection, RelayConnector, RelayInbox, RelayNotice};
use crate::signaling::{CallInvitation, ClientEvent, ServerEvent, SessionRef};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    /// The relay knows this socket belongs to the user.
    Registered,
    /// A call is waiting for the user's decision. Replaces any earlier prompt.
    IncomingCall(CallInvitation),
    /// The connection is gone; no further events follow.
    Stopped,
}

pub struct CallNotificationListener {
    user: LocalUser,
    relay: Arc<Mutex<RelayConnection>>,
    pending: Arc<Mutex<Option<CallInvitation>>>,
    task: Option<JoinHandle<()>>,
}

impl CallNotificationListener {
    /// Connect and start listening for `user`.
    pub async fn start(
        connector: &dyn RelayConnector,
        user: LocalUser,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ListenerEvent>)> {
        let (relay, inbox) = connector.connect().await?;
        let relay = Arc::new(Mutex::new(relay));
        let pending = Arc::new(Mutex::new(None));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(listen(
            user.user_id.clone(),
            inbox,
            relay.clone(),
            pending.clone(),
            events_tx,
        ));

        info!("Listening for calls to {}", user.user_id);

        Ok((
            Self {
                user,
                relay,
                pending,
                task: Some(task),
            },
            events_rx,
        ))
    }

    pub fn user(&self) -> &LocalUser {
        &self.user
    }

    /// The invitation currently awaiting a decision.
    pub fn pending(&self) -> Option<CallInvitation> {
        self.pending.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.relay.lock().is_connected()
    }

    fn take_pending(&self, session_id: &SessionId) -> Result<CallInvitation> {
        let mut pending = self.pending.lock();
        let matches = pending
            .as_ref()
            .map_or(false, |invitation| invitation.session_id == *session_id);
        if !matches {
            return Err(Error::InvalidState(format!(
                "no pending call for session {}",
                session_id
            )));
        }
        pending
            .take()
            .ok_or_else(|| Error::InvalidState("no pending call".to_string()))
    }

    /// Accept the pending call. The returned invitation carries what the
    /// receiver's call session needs.
    pub fn accept(&self, session_id: &SessionId) -> Result<CallInvitation> {
        let invitation = self.take_pending(session_id)?;
        self.relay.lock().emit(ClientEvent::AcceptCall(SessionRef {
            session_id: invitation.session_id.clone(),
        }));
        info!("Accepted call {} from {}", invitation.session_id, invitation.caller_id);
        Ok(invitation)
    }

    pub fn reject(&self, session_id: &SessionId) -> Result<()> {
        let invitation = self.take_pending(session_id)?;
        self.relay.lock().emit(ClientEvent::RejectCall(SessionRef {
            session_id: invitation.session_id.clone(),
        }));
        info!("Rejected call {} from {}", invitation.session_id, invitation.caller_id);
        Ok(())
    }

    /// Disconnect. Idempotent; also runs on drop.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.relay.lock().disconnect();
        self.pending.lock().take();
    }
}

impl Drop for CallNotificationListener {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn listen(
    user_id: String,
    mut inbox: RelayInbox,
    relay: Arc<Mutex<RelayConnection>>,
    pending: Arc<Mutex<Option<CallInvitation>>>,
    events: mpsc::UnboundedSender<ListenerEvent>,
) {
    while let Some(notice) = inbox.recv().await {
        match notice {
            RelayNotice::Connected => {
                relay.lock().emit(ClientEvent::RegisterUserSocket(user_id.clone()));
                let _ = events.send(ListenerEvent::Registered);
            }
            RelayNotice::Event(ServerEvent::IncomingCall(invitation)) => {
                if invitation.session_id.is_empty() {
                    debug!("Ignoring incoming call from {} without a session", invitation.caller_id);
                    continue;
                }
                info!("Incoming call {} from {}", invitation.session_id, invitation.caller_id);
                *pending.lock() = Some(invitation.clone());
                let _ = events.send(ListenerEvent::IncomingCall(invitation));
            }
            RelayNotice::Event(ServerEvent::Error { code, message }) => {
                warn!("Relay error: {} {}", code, message);
            }
            RelayNotice::Event(other) => {
                debug!("Listener ignoring {}", other.name());
            }
            RelayNotice::Disconnected => break,
        }
    }

    pending.lock().take();
    let _ = events.send(ListenerEvent::Stopped);
    debug!("Call listener for {} stopped", user_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::network::RelayEndpoint;
    use crate::testing::ScriptedConnector;
    use std::time::Duration;

    fn invitation(session_id: &str) -> CallInvitation {
        CallInvitation {
            session_id: session_id.into(),
            caller_id: "trainer-1".to_string(),
            caller_role: Role::Initiator,
            caller_display_name: "Tess".to_string(),
            caller_avatar_url: Some("https://cdn.example.com/tess.png".to_string()),
        }
    }

    async fn started() -> (
        CallNotificationListener,
        mpsc::UnboundedReceiver<ListenerEvent>,
        RelayEndpoint,
    ) {
        let (connector, mut endpoints) = ScriptedConnector::new();
        let (listener, mut events) = CallNotificationListener::start(
            connector.as_ref(),
            LocalUser::new("trainee-1", "Tom"),
        )
        .await
        .unwrap();
        let relay = endpoints.recv().await.unwrap();

        assert_eq!(next(&mut events).await, ListenerEvent::Registered);
        (listener, events, relay)
    }

    async fn next(events: &mut mpsc::UnboundedReceiver<ListenerEvent>) -> ListenerEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no listener event")
            .expect("listener closed")
    }

    #[tokio::test]
    async fn test_registers_user_socket_on_connect() {
        let (_listener, _events, mut relay) = started().await;
        assert_eq!(
            relay.next_event().await,
            Some(ClientEvent::RegisterUserSocket("trainee-1".to_string()))
        );
    }

    #[tokio::test]
    async fn test_incoming_call_without_session_is_ignored() {
        let (listener, mut events, relay) = started().await;

        relay.deliver(ServerEvent::IncomingCall(invitation("")));
        relay.deliver(ServerEvent::IncomingCall(invitation("S1")));

        match next(&mut events).await {
            ListenerEvent::IncomingCall(inv) => assert_eq!(inv.session_id.as_str(), "S1"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(listener.pending().unwrap().session_id.as_str(), "S1");
    }

    #[tokio::test]
    async fn test_newer_invitation_replaces_prompt() {
        let (listener, mut events, relay) = started().await;

        relay.deliver(ServerEvent::IncomingCall(invitation("S1")));
        relay.deliver(ServerEvent::IncomingCall(invitation("S2")));
        next(&mut events).await;
        next(&mut events).await;

        assert_eq!(listener.pending().unwrap().session_id.as_str(), "S2");
        assert!(listener.accept(&"S1".into()).is_err());
    }

    #[tokio::test]
    async fn test_accept_emits_and_clears_prompt() {
        let (listener, mut events, mut relay) = started().await;
        relay.deliver(ServerEvent::IncomingCall(invitation("S1")));
        next(&mut events).await;
        relay.drain();

        let accepted = listener.accept(&"S1".into()).unwrap();
        assert_eq!(accepted.caller().display_name, "Tess");
        assert!(listener.pending().is_none());
        assert_eq!(
            relay.drain(),
            vec![ClientEvent::AcceptCall(SessionRef { session_id: "S1".into() })]
        );

        // A decision is sent once.
        assert!(listener.accept(&"S1".into()).is_err());
        assert!(listener.reject(&"S1".into()).is_err());
    }

    #[tokio::test]
    async fn test_reject_emits_reject_call() {
        let (listener, mut events, mut relay) = started().await;
        relay.deliver(ServerEvent::IncomingCall(invitation("S1")));
        next(&mut events).await;
        relay.drain();

        listener.reject(&"S1".into()).unwrap();
        assert_eq!(
            relay.drain(),
            vec![ClientEvent::RejectCall(SessionRef { session_id: "S1".into() })]
        );
    }

    #[tokio::test]
    async fn test_relay_drop_stops_listener() {
        let (listener, mut events, relay) = started().await;
        relay.deliver(ServerEvent::IncomingCall(invitation("S1")));
        next(&mut events).await;

        relay.drop_connection();
        assert_eq!(next(&mut events).await, ListenerEvent::Stopped);
        assert!(listener.pending().is_none());
        assert!(!listener.is_connected());
    }

    #[tokio::test]
    async fn test_drop_disconnects() {
        let (listener, _events, relay) = started().await;
        assert!(relay.client_connected());

        drop(listener);
        assert!(!relay.client_connected());
    }

    #[tokio::test]
    async fn test_unreachable_relay_fails_to_start() {
        let connector = ScriptedConnector::unreachable();
        let result = CallNotificationListener::start(connector.as_ref(), LocalUser::new("u", "U")).await;
        assert!(result.is_err());
    }
}
