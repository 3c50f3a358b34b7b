//! CoachCall Core Library
//!
//! Trainer/trainee video calls: signaling over a WebSocket relay, a WebRTC
//! peer connection per call, local capture, and a per-call recording that is
//! uploaded when the call ends.

pub mod config;
pub mod error;
pub mod listener;
pub mod media;
pub mod models;
pub mod network;
pub mod peer;
pub mod recorder;
pub mod session;
pub mod signaling;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::sync::Arc;

pub use config::*;
pub use error::*;
pub use listener::{CallNotificationListener, ListenerEvent};
pub use media::{LocalStream, MediaDevices, MediaSink, NullSink, RemoteStream, SyntheticDevices};
pub use models::*;
pub use network::{ApiClient, RelayConnector, UploadReceipt, WsConnector};
pub use recorder::{HttpUploader, RecordingUploader};
pub use session::{CallCommand, CallDeps, CallParams, CallSession};
pub use signaling::{CallInvitation, ClientEvent, ServerEvent};

/// Entry point for an application embedding calls for one signed-in user.
pub struct CoachCallClient {
    config: Arc<CallConfig>,
    deps: CallDeps,
    user: LocalUser,
}

impl CoachCallClient {
    /// Client wired to the relay and upload endpoint in `config`.
    pub fn new(config: CallConfig, user: LocalUser, media: Arc<dyn MediaDevices>) -> Result<Self> {
        config.ice.validate()?;
        let deps = CallDeps::from_config(&config, media)?;
        Ok(Self::with_deps(config, user, deps))
    }

    pub fn with_deps(config: CallConfig, user: LocalUser, deps: CallDeps) -> Self {
        Self {
            config: Arc::new(config),
            deps,
            user,
        }
    }

    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    pub fn user(&self) -> &LocalUser {
        &self.user
    }

    /// Start listening for incoming calls.
    pub async fn listen(
        &self,
    ) -> Result<(CallNotificationListener, tokio::sync::mpsc::UnboundedReceiver<ListenerEvent>)> {
        CallNotificationListener::start(self.deps.relay.as_ref(), self.user.clone()).await
    }

    /// Call `remote` about `session_id`. The call starts ringing once the
    /// relay connection is up.
    pub fn place_call(&self, session_id: SessionId, remote: RemoteParty) -> Result<CallSession> {
        if session_id.is_empty() {
            return Err(Error::InvalidState("a call needs a session id".to_string()));
        }

        Ok(CallSession::spawn(
            CallParams {
                session_id,
                role: Role::Initiator,
                local: self.user.clone(),
                remote,
            },
            self.config.clone(),
            self.deps.clone(),
        ))
    }

    /// Accept the listener's pending call and mount the receiving side.
    pub fn answer(&self, listener: &CallNotificationListener, session_id: &SessionId) -> Result<CallSession> {
        let invitation = listener.accept(session_id)?;

        Ok(CallSession::spawn(
            CallParams {
                session_id: invitation.session_id.clone(),
                role: Role::Receiver,
                local: self.user.clone(),
                remote: invitation.caller(),
            },
            self.config.clone(),
            self.deps.clone(),
        ))
    }

    /// Decline the listener's pending call.
    pub fn decline(&self, listener: &CallNotificationListener, session_id: &SessionId) -> Result<()> {
        listener.reject(session_id)
    }
}
