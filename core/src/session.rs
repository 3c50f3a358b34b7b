//! Call session controller.
//!
//! Each call attempt is driven by one task that owns the relay connection,
//! the peer connection, the local stream and the recorder, and handles one
//! input at a time. Media acquisition and SDP work run in spawned tasks that
//! report back through the same queue, so relay and peer events keep flowing
//! while they are in progress.

use crate::config::CallConfig;
use crate::error::{MediaError, Result};
use crate::media::{LocalStream, MediaDevices, MediaSink, NullSink, RemoteStream};
use crate::models::{
    CallSnapshot, CallState, EndReason, LocalUser, RecordingOutcome, RemoteParty, RemoteStatus, Role,
    SessionId,
};
use crate::network::{RelayConnection, RelayConnector, RelayInbox, RelayNotice, WsConnector};
use crate::peer::{PeerConnection, PeerEvent, PeerEventSender, PeerFactory, PeerState, RtcPeerFactory};
use crate::recorder::{upload_artifact, HttpUploader, RecordingUploader, SessionRecorder};
use crate::signaling::{
    CallInvitation, CallUser, ClientEvent, IceCandidate, IcePayload, JoinSession, SdpPayload,
    ServerEvent, SessionDescription, SessionRef, UserStatusUpdate,
};
use std::sync::Arc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Who is calling whom, about which booking.
#[derive(Debug, Clone)]
pub struct CallParams {
    pub session_id: SessionId,
    pub role: Role,
    pub local: LocalUser,
    pub remote: RemoteParty,
}

/// External collaborators of a call session.
#[derive(Clone)]
pub struct CallDeps {
    pub relay: Arc<dyn RelayConnector>,
    pub peers: Arc<dyn PeerFactory>,
    pub media: Arc<dyn MediaDevices>,
    pub uploader: Arc<dyn RecordingUploader>,
    pub sink: Arc<dyn MediaSink>,
}

impl CallDeps {
    /// WebSocket relay, webrtc-rs peers and HTTP upload for `config`.
    pub fn from_config(config: &CallConfig, media: Arc<dyn MediaDevices>) -> Result<Self> {
        Ok(Self {
            relay: Arc::new(WsConnector::from_config(&config.server)),
            peers: Arc::new(RtcPeerFactory),
            media,
            uploader: Arc::new(HttpUploader::new(config)?),
            sink: Arc::new(NullSink),
        })
    }

    pub fn with_sink(mut self, sink: Arc<dyn MediaSink>) -> Self {
        self.sink = sink;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallCommand {
    StartCall,
    EndCall,
    SetMuted(bool),
    SetVideo(bool),
}

/// Results of work the controller spawned.
enum Completion {
    Media(std::result::Result<LocalStream, MediaError>),
    OfferReady(Result<SessionDescription>),
    RemoteApplied(Result<()>),
    AnswerReady(Result<SessionDescription>),
}

enum Input {
    Command(CallCommand),
    Relay(RelayNotice),
    Peer(PeerEvent),
    Done(Completion),
    SetupTimeout,
}

// ============================================================================
// Handle
// ============================================================================

/// Handle to a running call. Dropping it hangs up.
pub struct CallSession {
    session_id: SessionId,
    role: Role,
    commands: mpsc::UnboundedSender<CallCommand>,
    snapshot: watch::Receiver<CallSnapshot>,
    task: JoinHandle<CallSnapshot>,
}

impl CallSession {
    /// Mount a controller for one call. Must be called inside a Tokio runtime.
    pub fn spawn(params: CallParams, config: Arc<CallConfig>, deps: CallDeps) -> Self {
        let session_id = params.session_id.clone();
        let role = params.role;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot::new(session_id.clone(), role));

        let (controller, completions) = Controller::new(params, config, deps, snapshot_tx);
        let task = tokio::spawn(controller.run(commands_rx, completions));

        Self {
            session_id,
            role,
            commands: commands_tx,
            snapshot: snapshot_rx,
            task,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    fn send(&self, command: CallCommand) {
        if self.commands.send(command).is_err() {
            debug!("Call {} already finished, ignoring {:?}", self.session_id, command);
        }
    }

    /// Acquire local media and begin negotiating. A repeated call is a no-op.
    pub fn start_call(&self) {
        self.send(CallCommand::StartCall);
    }

    /// Hang up. Safe to call any number of times.
    pub fn end_call(&self) {
        self.send(CallCommand::EndCall);
    }

    /// Mute or unmute the microphone. Setting the current value is a no-op.
    pub fn toggle_mute(&self, muted: bool) {
        self.send(CallCommand::SetMuted(muted));
    }

    /// Turn the camera on or off. Setting the current value is a no-op.
    pub fn toggle_video(&self, video_on: bool) {
        self.send(CallCommand::SetVideo(video_on));
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    /// Wait until the published snapshot satisfies `condition`, or the call
    /// task has finished, and return the latest snapshot.
    pub async fn wait_for(&self, condition: impl FnMut(&CallSnapshot) -> bool) -> CallSnapshot {
        let mut rx = self.snapshot.clone();
        let result = rx.wait_for(condition).await.map(|s| s.clone());
        match result {
            Ok(snapshot) => snapshot,
            Err(_) => rx.borrow().clone(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for teardown and the recording upload to complete.
    pub async fn join(self) -> CallSnapshot {
        match self.task.await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Call {} task failed: {}", self.session_id, e);
                self.snapshot.borrow().clone()
            }
        }
    }
}

// ============================================================================
// Controller
// ============================================================================

struct Controller {
    params: CallParams,
    config: Arc<CallConfig>,
    deps: CallDeps,
    snapshot: watch::Sender<CallSnapshot>,
    completions: mpsc::UnboundedSender<Completion>,

    state: CallState,
    ringing: bool,
    muted: bool,
    video_enabled: bool,

    relay: Option<RelayConnection>,
    joined: bool,
    peer: Option<Arc<dyn PeerConnection>>,

    media_requested: bool,
    local_stream: Option<LocalStream>,
    remote_stream: Option<RemoteStream>,
    remote_status: RemoteStatus,

    remote_description_requested: bool,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    pending_offer: Option<SessionDescription>,

    recorder: Option<SessionRecorder>,
    upload: Option<JoinHandle<RecordingOutcome>>,
    recording: RecordingOutcome,

    end_reason: Option<EndReason>,
    torn_down: bool,
}

async fn next_notice(inbox: &mut Option<RelayInbox>) -> RelayNotice {
    match inbox {
        Some(rx) => rx.recv().await.unwrap_or(RelayNotice::Disconnected),
        None => std::future::pending().await,
    }
}

impl Controller {
    fn new(
        params: CallParams,
        config: Arc<CallConfig>,
        deps: CallDeps,
        snapshot: watch::Sender<CallSnapshot>,
    ) -> (Self, mpsc::UnboundedReceiver<Completion>) {
        let (completions, completions_rx) = mpsc::unbounded_channel();
        let controller = Self {
            params,
            config,
            deps,
            snapshot,
            completions,
            state: CallState::Idle,
            ringing: false,
            muted: false,
            video_enabled: true,
            relay: None,
            joined: false,
            peer: None,
            media_requested: false,
            local_stream: None,
            remote_stream: None,
            remote_status: RemoteStatus::default(),
            remote_description_requested: false,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            pending_offer: None,
            recorder: None,
            upload: None,
            recording: RecordingOutcome::NotRecorded,
            end_reason: None,
            torn_down: false,
        };
        (controller, completions_rx)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<CallCommand>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) -> CallSnapshot {
        // A timeout too large to represent never fires.
        let deadline = self
            .config
            .setup_timeout()
            .and_then(|timeout| Instant::now().checked_add(timeout));

        let (peer_tx, mut peer_events) = mpsc::unbounded_channel();
        let mut inbox = self.mount(&mut commands, deadline, peer_tx).await;
        self.publish();

        while !self.state.is_terminal() {
            let awaiting_setup = deadline.is_some() && self.state != CallState::Active;

            let input = tokio::select! {
                biased;
                // A dropped handle hangs up.
                command = commands.recv() => Input::Command(command.unwrap_or(CallCommand::EndCall)),
                notice = next_notice(&mut inbox) => Input::Relay(notice),
                Some(event) = peer_events.recv() => Input::Peer(event),
                Some(done) = completions.recv() => Input::Done(done),
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if awaiting_setup => {
                    Input::SetupTimeout
                }
            };

            // Commands queued while the input was selected still go first.
            if !matches!(input, Input::Command(_)) {
                self.drain_commands(&mut commands).await;
                if self.state.is_terminal() {
                    self.publish();
                    break;
                }
            }

            self.handle(input).await;
            self.publish();
        }

        if let Some(upload) = self.upload.take() {
            self.recording = match upload.await {
                Ok(outcome) => outcome,
                Err(e) => RecordingOutcome::Failed { reason: e.to_string() },
            };
            self.publish();
        }

        info!("Call {} finished: {:?}", self.params.session_id, self.end_reason);
        self.current_snapshot()
    }

    async fn drain_commands(&mut self, commands: &mut mpsc::UnboundedReceiver<CallCommand>) {
        while !self.state.is_terminal() {
            match commands.try_recv() {
                Ok(command) => self.on_command(command).await,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => self.on_command(CallCommand::EndCall).await,
            }
        }
    }

    /// Connect to the relay and create the peer connection. A hangup or the
    /// setup deadline abandons a relay connection still in progress; other
    /// commands wait until the call is mounted.
    async fn mount(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<CallCommand>,
        deadline: Option<Instant>,
        peer_events: PeerEventSender,
    ) -> Option<RelayInbox> {
        info!(
            "Mounting call {} as {} with {}",
            self.params.session_id, self.params.role, self.params.remote.user_id
        );
        self.set_state(CallState::Connecting);
        self.publish();

        let connector = self.deps.relay.clone();
        let mut connect = connector.connect();
        let mut deferred = Vec::new();

        let connected = loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command.unwrap_or(CallCommand::EndCall) {
                    CallCommand::EndCall => break Err(EndReason::LocalHangup),
                    command => deferred.push(command),
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    break Err(EndReason::Timeout);
                }
                result = &mut connect => break Ok(result),
            }
        };
        drop(connect);

        let inbox = match connected {
            Ok(Ok((relay, inbox))) => {
                self.relay = Some(relay);
                inbox
            }
            Ok(Err(e)) => {
                warn!("Relay unavailable for call {}: {}", self.params.session_id, e);
                self.teardown(EndReason::RelayUnavailable).await;
                return None;
            }
            Err(reason) => {
                info!("Call {} ended before the relay connected", self.params.session_id);
                self.teardown(reason).await;
                return None;
            }
        };

        match self.deps.peers.create(&self.config.ice, peer_events).await {
            Ok(peer) => self.peer = Some(peer),
            Err(e) => {
                warn!("Peer connection setup failed for call {}: {}", self.params.session_id, e);
                self.teardown(EndReason::ConnectionFailed).await;
                return None;
            }
        }

        if self.params.role == Role::Receiver && self.config.auto_start_receiver {
            self.start_call();
        }

        for command in deferred {
            self.on_command(command).await;
        }

        Some(inbox)
    }

    async fn handle(&mut self, input: Input) {
        match input {
            Input::Command(command) => self.on_command(command).await,
            Input::Relay(RelayNotice::Connected) => self.on_relay_connected(),
            Input::Relay(RelayNotice::Event(event)) => self.on_server_event(event).await,
            Input::Relay(RelayNotice::Disconnected) => {
                warn!("Relay connection lost during call {}", self.params.session_id);
                self.teardown(EndReason::RelayLost).await;
            }
            Input::Peer(event) => self.on_peer_event(event).await,
            Input::Done(done) => self.on_completion(done).await,
            Input::SetupTimeout => {
                if self.state != CallState::Active {
                    warn!("Call {} did not connect in time", self.params.session_id);
                    self.teardown(EndReason::Timeout).await;
                }
            }
        }
    }

    async fn on_command(&mut self, command: CallCommand) {
        match command {
            CallCommand::StartCall => self.start_call(),
            CallCommand::EndCall => self.teardown(EndReason::LocalHangup).await,
            CallCommand::SetMuted(muted) => self.set_muted(muted),
            CallCommand::SetVideo(video_on) => self.set_video(video_on),
        }
    }

    // ------------------------------------------------------------------------
    // Relay
    // ------------------------------------------------------------------------

    fn emit(&self, event: ClientEvent) {
        match self.relay {
            Some(ref relay) => {
                relay.emit(event);
            }
            None => debug!("No relay for call {}, dropping {}", self.params.session_id, event.name()),
        }
    }

    fn session_ref(&self) -> SessionRef {
        SessionRef {
            session_id: self.params.session_id.clone(),
        }
    }

    fn on_relay_connected(&mut self) {
        if self.joined {
            return;
        }
        self.joined = true;

        let user_id = self.params.local.user_id.clone();
        self.emit(ClientEvent::RegisterUserSocket(user_id.clone()));
        self.emit(ClientEvent::JoinSession(JoinSession {
            session_id: self.params.session_id.clone(),
            user_id,
            role: self.params.role,
        }));

        if self.params.role == Role::Initiator {
            self.ringing = true;
            self.set_state(CallState::Ringing);
            self.emit(ClientEvent::CallUser(CallUser {
                callee_id: self.params.remote.user_id.clone(),
                invitation: CallInvitation {
                    session_id: self.params.session_id.clone(),
                    caller_id: self.params.local.user_id.clone(),
                    caller_role: self.params.role,
                    caller_display_name: self.params.local.display_name.clone(),
                    caller_avatar_url: self.params.local.avatar_url.clone(),
                },
            }));
        }
    }

    async fn on_server_event(&mut self, event: ServerEvent) {
        if let Some(session_id) = event.session_id() {
            if *session_id != self.params.session_id {
                debug!("Ignoring {} for session {}", event.name(), session_id);
                return;
            }
        }

        match event {
            ServerEvent::CallAccepted(_) => {
                if self.params.role != Role::Initiator || !self.ringing {
                    debug!("Unexpected call-accepted for {}", self.params.session_id);
                    return;
                }
                info!("Call {} accepted", self.params.session_id);
                self.ringing = false;
                self.set_state(CallState::Connecting);
                self.start_call();
            }
            ServerEvent::CallRejected(_) => {
                if self.params.role != Role::Initiator {
                    return;
                }
                info!("Call {} rejected", self.params.session_id);
                self.teardown(EndReason::Rejected).await;
            }
            ServerEvent::Offer(payload) => self.on_remote_offer(payload.sdp),
            ServerEvent::Answer(payload) => self.on_remote_answer(payload.sdp),
            ServerEvent::IceCandidate(payload) => self.on_remote_candidate(payload.candidate),
            ServerEvent::UserStatus(update) => {
                if let Some(muted) = update.is_muted {
                    self.remote_status.is_muted = muted;
                }
                if let Some(video_on) = update.is_video_on {
                    self.remote_status.is_video_on = video_on;
                }
                if let Some(connected) = update.is_connected {
                    self.remote_status.is_connected = connected;
                }
            }
            ServerEvent::UserLeft(_) | ServerEvent::CallEnded(_) => {
                info!("Remote party left call {}", self.params.session_id);
                self.remote_status.has_left = true;
                self.teardown(EndReason::RemoteHangup).await;
            }
            ServerEvent::IncomingCall(_) => {
                debug!("Ignoring incoming-call inside call {}", self.params.session_id);
            }
            ServerEvent::Error { code, message } => {
                warn!("Relay error in call {}: {} {}", self.params.session_id, code, message);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Negotiation
    // ------------------------------------------------------------------------

    fn start_call(&mut self) {
        if self.torn_down || self.media_requested {
            debug!("start_call ignored for {}", self.params.session_id);
            return;
        }
        self.media_requested = true;

        let media = self.deps.media.clone();
        let constraints = self.config.media;
        let done = self.completions.clone();
        tokio::spawn(async move {
            let result = media.acquire(&constraints).await;
            // A send error means the call is gone; the stream stops on drop.
            let _ = done.send(Completion::Media(result));
        });
    }

    async fn on_local_media(&mut self, stream: LocalStream) {
        stream.set_muted(self.muted);
        stream.set_video_enabled(self.video_enabled);

        if let Some(ref peer) = self.peer {
            for track in stream.tracks() {
                if let Err(e) = peer.add_local_track(track).await {
                    warn!("Failed to attach {} track: {}", track.kind().as_str(), e);
                }
            }
        }

        self.deps.sink.show_local(&stream, true);

        if self.config.recording.enabled {
            let mut recorder = SessionRecorder::new(
                self.params.session_id.clone(),
                self.params.role,
                self.config.recording.clone(),
            );
            match recorder.start(&stream) {
                Ok(()) => self.recorder = Some(recorder),
                Err(e) => warn!("Recorder did not start: {}", e),
            }
        }

        self.local_stream = Some(stream);

        match self.params.role {
            Role::Initiator => self.create_offer(),
            Role::Receiver => {
                if let Some(offer) = self.pending_offer.take() {
                    self.answer(offer);
                }
            }
        }
    }

    fn create_offer(&mut self) {
        let Some(peer) = self.peer.clone() else { return };
        let done = self.completions.clone();
        tokio::spawn(async move {
            let result: Result<SessionDescription> = async {
                let offer = peer.create_offer().await?;
                peer.set_local_description(offer.clone()).await?;
                Ok(offer)
            }
            .await;
            let _ = done.send(Completion::OfferReady(result));
        });
    }

    fn on_remote_offer(&mut self, offer: SessionDescription) {
        if self.params.role == Role::Initiator {
            warn!("Initiator received an offer for {}, ignoring", self.params.session_id);
            return;
        }
        if self.remote_description_requested {
            debug!("Duplicate offer for {} ignored", self.params.session_id);
            return;
        }
        if self.local_stream.is_none() {
            debug!("Holding offer for {} until local media is ready", self.params.session_id);
            self.pending_offer = Some(offer);
            return;
        }
        self.answer(offer);
    }

    fn answer(&mut self, offer: SessionDescription) {
        let Some(peer) = self.peer.clone() else { return };
        self.remote_description_requested = true;

        let done = self.completions.clone();
        tokio::spawn(async move {
            let applied = peer.set_remote_description(offer).await;
            let failed = applied.is_err();
            let _ = done.send(Completion::RemoteApplied(applied));
            if failed {
                return;
            }

            let result: Result<SessionDescription> = async {
                let answer = peer.create_answer().await?;
                peer.set_local_description(answer.clone()).await?;
                Ok(answer)
            }
            .await;
            let _ = done.send(Completion::AnswerReady(result));
        });
    }

    fn on_remote_answer(&mut self, answer: SessionDescription) {
        if self.params.role == Role::Receiver {
            warn!("Receiver received an answer for {}, ignoring", self.params.session_id);
            return;
        }
        if self.remote_description_requested {
            debug!("Duplicate answer for {} ignored", self.params.session_id);
            return;
        }
        let Some(peer) = self.peer.clone() else { return };
        self.remote_description_requested = true;

        let done = self.completions.clone();
        tokio::spawn(async move {
            let applied = peer.set_remote_description(answer).await;
            let _ = done.send(Completion::RemoteApplied(applied));
        });
    }

    fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        if !self.remote_description_set {
            self.pending_candidates.push(candidate);
            debug!(
                "Buffered ICE candidate for {} ({} pending)",
                self.params.session_id,
                self.pending_candidates.len()
            );
            return;
        }
        self.add_candidate(candidate);
    }

    fn add_candidate(&self, candidate: IceCandidate) {
        let Some(peer) = self.peer.clone() else { return };
        let session_id = self.params.session_id.clone();
        tokio::spawn(async move {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                warn!("Failed to add ICE candidate for {}: {}", session_id, e);
            }
        });
    }

    async fn on_completion(&mut self, done: Completion) {
        match done {
            Completion::Media(Ok(stream)) => self.on_local_media(stream).await,
            Completion::Media(Err(e)) => {
                warn!("Local media unavailable for {}: {}", self.params.session_id, e);
                self.teardown(EndReason::MediaUnavailable).await;
            }
            Completion::OfferReady(Ok(offer)) => {
                self.emit(ClientEvent::Offer(SdpPayload {
                    sdp: offer,
                    session_id: self.params.session_id.clone(),
                }));
            }
            Completion::AnswerReady(Ok(answer)) => {
                self.emit(ClientEvent::Answer(SdpPayload {
                    sdp: answer,
                    session_id: self.params.session_id.clone(),
                }));
            }
            Completion::RemoteApplied(Ok(())) => {
                self.remote_description_set = true;
                for candidate in std::mem::take(&mut self.pending_candidates) {
                    self.add_candidate(candidate);
                }
            }
            Completion::OfferReady(Err(e))
            | Completion::AnswerReady(Err(e))
            | Completion::RemoteApplied(Err(e)) => {
                warn!("Negotiation failed for {}: {}", self.params.session_id, e);
                self.teardown(EndReason::ConnectionFailed).await;
            }
        }
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                self.emit(ClientEvent::IceCandidate(IcePayload {
                    candidate,
                    session_id: self.params.session_id.clone(),
                }));
            }
            PeerEvent::RemoteTrack(track) => {
                let accepted = match self.remote_stream {
                    Some(ref mut stream) => stream.accept(track),
                    None => {
                        self.remote_stream = Some(RemoteStream::new(track));
                        true
                    }
                };
                if let (true, Some(stream)) = (accepted, self.remote_stream.as_ref()) {
                    self.remote_status.is_connected = true;
                    self.deps.sink.show_remote(stream);
                }
            }
            PeerEvent::StateChanged(PeerState::Connected) => {
                if self.state == CallState::Active {
                    return;
                }
                info!("Call {} connected", self.params.session_id);
                self.ringing = false;
                self.set_state(CallState::Active);

                let mut update = UserStatusUpdate::new(self.params.session_id.clone());
                update.is_connected = Some(true);
                self.emit(ClientEvent::UserStatus(update));
            }
            PeerEvent::StateChanged(PeerState::Failed) => {
                warn!("Peer connection failed for {}", self.params.session_id);
                self.teardown(EndReason::ConnectionFailed).await;
            }
            PeerEvent::StateChanged(state) => {
                debug!("Peer state for {}: {:?}", self.params.session_id, state);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Local controls
    // ------------------------------------------------------------------------

    fn set_muted(&mut self, muted: bool) {
        if self.muted == muted {
            return;
        }
        self.muted = muted;
        if let Some(ref stream) = self.local_stream {
            stream.set_muted(self.muted);
        }

        let mut update = UserStatusUpdate::new(self.params.session_id.clone());
        update.is_muted = Some(self.muted);
        self.emit(ClientEvent::UserStatus(update));
    }

    fn set_video(&mut self, video_on: bool) {
        if self.video_enabled == video_on {
            return;
        }
        self.video_enabled = video_on;
        if let Some(ref stream) = self.local_stream {
            stream.set_video_enabled(self.video_enabled);
        }

        let mut update = UserStatusUpdate::new(self.params.session_id.clone());
        update.is_video_on = Some(self.video_enabled);
        self.emit(ClientEvent::UserStatus(update));
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Release everything the call holds. Runs at most once per call.
    async fn teardown(&mut self, reason: EndReason) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        info!("Ending call {}: {:?}", self.params.session_id, reason);

        // Capture stops while the stream is still live so no chunk is lost.
        let artifact = match self.recorder.take() {
            Some(mut recorder) => recorder.stop().await,
            None => None,
        };

        if let Some(stream) = self.local_stream.take() {
            stream.stop();
        }

        if let Some(peer) = self.peer.take() {
            if let Err(e) = peer.detach_senders().await {
                debug!("Detaching senders failed: {}", e);
            }
            if let Err(e) = peer.close().await {
                debug!("Closing peer connection failed: {}", e);
            }
        }

        self.remote_stream = None;
        self.pending_candidates.clear();
        self.pending_offer = None;
        self.deps.sink.clear();

        self.emit(ClientEvent::UserLeft(self.session_ref()));
        self.emit(ClientEvent::EndCall(self.session_ref()));

        if let Some(artifact) = artifact {
            let uploader = self.deps.uploader.clone();
            self.recording = RecordingOutcome::Uploading;
            self.upload = Some(tokio::spawn(async move {
                upload_artifact(uploader.as_ref(), artifact).await
            }));
        }

        if let Some(mut relay) = self.relay.take() {
            relay.disconnect();
        }

        self.ringing = false;
        self.end_reason = Some(reason);
        self.set_state(CallState::Ended);
    }

    // ------------------------------------------------------------------------
    // Snapshot
    // ------------------------------------------------------------------------

    fn set_state(&mut self, state: CallState) {
        if self.state != state {
            debug!("Call {}: {:?} -> {:?}", self.params.session_id, self.state, state);
            self.state = state;
        }
    }

    fn current_snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            session_id: self.params.session_id.clone(),
            role: self.params.role,
            state: self.state,
            is_ringing: self.ringing,
            is_muted: self.muted,
            is_video_enabled: self.video_enabled,
            has_local_stream: self.local_stream.is_some(),
            remote_track_count: self.remote_stream.as_ref().map_or(0, |s| s.tracks().len()),
            remote_status: self.remote_status,
            end_reason: self.end_reason,
            recording: self.recording.clone(),
        }
    }

    fn publish(&self) {
        let next = self.current_snapshot();
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaKind;
    use crate::network::RelayEndpoint;
    use crate::signaling::OptionalSessionRef;
    use crate::testing::{
        bridge, FakeDevices, FakePeerFactory, MemoryUploader, PeerOp, RecordingSink, ScriptedConnector,
        SinkCall, BAD_CANDIDATE_MARKER,
    };
    use crate::signaling::SdpType;
    use bytes::Bytes;
    use std::time::Duration;

    const SESSION: &str = "S1";

    struct Harness {
        session: CallSession,
        relay: RelayEndpoint,
        peers: Arc<FakePeerFactory>,
        devices: Arc<FakeDevices>,
        uploader: Arc<MemoryUploader>,
        sink: Arc<RecordingSink>,
    }

    fn test_config() -> CallConfig {
        CallConfig {
            setup_timeout_secs: None,
            ..CallConfig::default()
        }
    }

    fn params(role: Role) -> CallParams {
        let (local, remote) = match role {
            Role::Initiator => (LocalUser::new("trainer-1", "Tess"), RemoteParty::new("trainee-1", "Tom")),
            Role::Receiver => (LocalUser::new("trainee-1", "Tom"), RemoteParty::new("trainer-1", "Tess")),
        };
        CallParams {
            session_id: SESSION.into(),
            role,
            local,
            remote,
        }
    }

    async fn harness_with(role: Role, devices: Arc<FakeDevices>, config: CallConfig) -> Harness {
        let (connector, mut endpoints) = ScriptedConnector::new();
        let peers = FakePeerFactory::new();
        let uploader = Arc::new(MemoryUploader::new());
        let sink = RecordingSink::new();
        let deps = CallDeps {
            relay: connector,
            peers: peers.clone(),
            media: devices.clone(),
            uploader: uploader.clone(),
            sink: sink.clone(),
        };

        let session = CallSession::spawn(params(role), Arc::new(config), deps);
        let relay = endpoints.recv().await.unwrap();

        Harness {
            session,
            relay,
            peers,
            devices,
            uploader,
            sink,
        }
    }

    async fn harness(role: Role) -> Harness {
        harness_with(role, FakeDevices::new(), test_config()).await
    }

    async fn expect_event(relay: &mut RelayEndpoint, name: &str) -> ClientEvent {
        let wait = async {
            loop {
                let event = relay.next_event().await.expect("relay closed");
                if event.name() == name {
                    return event;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .unwrap_or_else(|_| panic!("no {} event", name))
    }

    async fn wait_state(session: &CallSession, state: CallState) -> CallSnapshot {
        tokio::time::timeout(Duration::from_secs(5), session.wait_for(|s| s.state == state))
            .await
            .unwrap_or_else(|_| panic!("call never reached {:?}", state))
    }

    fn offer() -> ServerEvent {
        ServerEvent::Offer(SdpPayload {
            sdp: SessionDescription::offer("v=0 remote-offer"),
            session_id: SESSION.into(),
        })
    }

    fn answer() -> ServerEvent {
        ServerEvent::Answer(SdpPayload {
            sdp: SessionDescription::answer("v=0 remote-answer"),
            session_id: SESSION.into(),
        })
    }

    fn candidate(n: u8) -> ServerEvent {
        ServerEvent::IceCandidate(IcePayload {
            candidate: IceCandidate::new(format!("candidate:{} 1 udp 2122260223 192.168.1.{} 40000 typ host", n, n)),
            session_id: SESSION.into(),
        })
    }

    fn accepted() -> ServerEvent {
        ServerEvent::CallAccepted(OptionalSessionRef {
            session_id: Some(SESSION.into()),
        })
    }

    fn count(events: &[ClientEvent], name: &str) -> usize {
        events.iter().filter(|e| e.name() == name).count()
    }

    /// Initiator through to an active call.
    async fn active_initiator() -> Harness {
        let mut h = harness(Role::Initiator).await;
        expect_event(&mut h.relay, "call-user").await;
        h.relay.deliver(accepted());
        expect_event(&mut h.relay, "offer").await;
        h.relay.deliver(answer());
        h.relay.deliver(candidate(1));
        wait_state(&h.session, CallState::Active).await;
        h
    }

    #[tokio::test]
    async fn test_initiator_joins_and_rings_callee() {
        let mut h = harness(Role::Initiator).await;

        let register = expect_event(&mut h.relay, "registerUserSocket").await;
        assert_eq!(register, ClientEvent::RegisterUserSocket("trainer-1".into()));

        match expect_event(&mut h.relay, "joinSession").await {
            ClientEvent::JoinSession(join) => {
                assert_eq!(join.session_id.as_str(), SESSION);
                assert_eq!(join.role, Role::Initiator);
            }
            other => panic!("unexpected {:?}", other),
        }

        match expect_event(&mut h.relay, "call-user").await {
            ClientEvent::CallUser(call) => {
                assert_eq!(call.callee_id, "trainee-1");
                assert_eq!(call.invitation.caller_display_name, "Tess");
                assert_eq!(call.invitation.session_id.as_str(), SESSION);
            }
            other => panic!("unexpected {:?}", other),
        }

        let snapshot = wait_state(&h.session, CallState::Ringing).await;
        assert!(snapshot.is_ringing);
        assert!(!snapshot.has_local_stream);
    }

    #[tokio::test]
    async fn test_rejection_ends_call_without_acquiring_media() {
        let mut h = harness(Role::Initiator).await;
        expect_event(&mut h.relay, "call-user").await;

        h.relay.deliver(ServerEvent::CallRejected(OptionalSessionRef::default()));
        let snapshot = h.session.join().await;

        assert_eq!(snapshot.state, CallState::Ended);
        assert_eq!(snapshot.end_reason, Some(EndReason::Rejected));
        assert!(!snapshot.is_ringing);
        assert_eq!(h.devices.acquisitions(), 0);

        let peer = h.peers.last().unwrap();
        assert_eq!(peer.count(&PeerOp::CreateOffer), 0);
        assert!(peer.is_closed());

        let events = h.relay.drain();
        assert_eq!(count(&events, "user-left"), 1);
        assert_eq!(count(&events, "endCall"), 1);
    }

    #[tokio::test]
    async fn test_initiator_offers_after_acceptance_and_connects() {
        let h = active_initiator().await;
        let snapshot = h.session.snapshot();

        assert!(!snapshot.is_ringing);
        assert!(snapshot.has_local_stream);
        assert_eq!(snapshot.remote_track_count, 2);

        let peer = h.peers.last().unwrap();
        let ops = peer.ops();
        assert!(ops.contains(&PeerOp::CreateOffer));
        assert!(ops.contains(&PeerOp::SetLocal(SdpType::Offer)));
        assert!(ops.contains(&PeerOp::SetRemote(SdpType::Answer)));
        assert_eq!(peer.count(&PeerOp::CreateAnswer), 0);

        let calls = h.sink.calls();
        assert!(calls
            .iter()
            .any(|c| matches!(c, SinkCall::Local { muted_playback: true, .. })));
        assert!(calls.iter().any(|c| matches!(c, SinkCall::Remote { tracks: 2, .. })));
    }

    #[tokio::test]
    async fn test_receiver_answers_and_never_offers() {
        let mut h = harness(Role::Receiver).await;
        h.session.wait_for(|s| s.has_local_stream).await;

        h.relay.deliver(offer());
        match expect_event(&mut h.relay, "answer").await {
            ClientEvent::Answer(payload) => assert_eq!(payload.sdp.sdp_type, SdpType::Answer),
            other => panic!("unexpected {:?}", other),
        }

        let peer = h.peers.last().unwrap();
        assert_eq!(peer.count(&PeerOp::CreateOffer), 0);
        assert_eq!(peer.count(&PeerOp::CreateAnswer), 1);

        // The receiver never rings and never invites.
        let snapshot = h.session.snapshot();
        assert!(!snapshot.is_ringing);
        assert_eq!(count(&h.relay.drain(), "call-user"), 0);
    }

    #[tokio::test]
    async fn test_start_call_twice_acquires_media_once() {
        let h = harness(Role::Receiver).await;
        h.session.start_call();
        h.session.start_call();
        h.session.wait_for(|s| s.has_local_stream).await;

        assert_eq!(h.devices.acquisitions(), 1);
        assert_eq!(h.peers.last().unwrap().count(&PeerOp::AddTrack(MediaKind::Video)), 1);
    }

    #[tokio::test]
    async fn test_receiver_connects_for_every_signaling_order() {
        let orders: [[usize; 3]; 6] = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];

        for order in orders {
            let h = harness(Role::Receiver).await;
            let events = [offer(), candidate(1), candidate(2)];
            for i in order {
                h.relay.deliver(events[i].clone());
            }

            wait_state(&h.session, CallState::Active).await;

            // No candidate reaches the peer before its remote description.
            let ops = h.peers.last().unwrap().ops();
            let remote_at = ops
                .iter()
                .position(|op| *op == PeerOp::SetRemote(SdpType::Offer))
                .unwrap();
            let first_candidate = ops
                .iter()
                .position(|op| matches!(op, PeerOp::AddCandidate(_)))
                .unwrap();
            assert!(remote_at < first_candidate, "order {:?}: {:?}", order, ops);
        }
    }

    #[tokio::test]
    async fn test_initiator_connects_for_every_signaling_order() {
        let orders: [[usize; 3]; 6] = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];

        for order in orders {
            let mut h = harness(Role::Initiator).await;
            expect_event(&mut h.relay, "call-user").await;
            h.relay.deliver(accepted());
            expect_event(&mut h.relay, "offer").await;

            let events = [answer(), candidate(1), candidate(2)];
            for i in order {
                h.relay.deliver(events[i].clone());
            }

            wait_state(&h.session, CallState::Active).await;
            assert!(!h.peers.last().unwrap().added_candidates().is_empty());
        }
    }

    #[tokio::test]
    async fn test_rejected_candidate_does_not_end_call() {
        let h = harness(Role::Receiver).await;
        h.relay.deliver(offer());
        h.relay.deliver(ServerEvent::IceCandidate(IcePayload {
            candidate: IceCandidate::new(format!("candidate:9 1 udp 1 {} 9 typ host", BAD_CANDIDATE_MARKER)),
            session_id: SESSION.into(),
        }));
        h.relay.deliver(candidate(1));

        let snapshot = wait_state(&h.session, CallState::Active).await;
        assert_eq!(snapshot.end_reason, None);
    }

    #[tokio::test]
    async fn test_offer_waits_for_local_media() {
        let mut h = harness_with(
            Role::Receiver,
            FakeDevices::slow(Duration::from_millis(100)),
            test_config(),
        )
        .await;

        h.relay.deliver(offer());
        expect_event(&mut h.relay, "answer").await;

        let ops = h.peers.last().unwrap().ops();
        let track_at = ops
            .iter()
            .position(|op| matches!(op, PeerOp::AddTrack(_)))
            .unwrap();
        let remote_at = ops
            .iter()
            .position(|op| *op == PeerOp::SetRemote(SdpType::Offer))
            .unwrap();
        assert!(track_at < remote_at, "{:?}", ops);
    }

    #[tokio::test]
    async fn test_events_for_other_sessions_are_ignored() {
        let mut h = harness(Role::Initiator).await;
        expect_event(&mut h.relay, "call-user").await;

        h.relay.deliver(ServerEvent::CallRejected(OptionalSessionRef {
            session_id: Some("S2".into()),
        }));
        h.relay.deliver(ServerEvent::CallEnded(SessionRef { session_id: "S2".into() }));
        h.relay.deliver(accepted());

        expect_event(&mut h.relay, "offer").await;
        assert_eq!(h.session.snapshot().end_reason, None);
    }

    #[tokio::test]
    async fn test_toggles_mirror_to_relay_and_tracks() {
        let mut h = active_initiator().await;

        h.session.toggle_mute(true);
        match expect_event(&mut h.relay, "user-status").await {
            ClientEvent::UserStatus(update) if update.is_connected.is_some() => {
                // Connection report from reaching Active; the mute follows.
                match expect_event(&mut h.relay, "user-status").await {
                    ClientEvent::UserStatus(update) => assert_eq!(update.is_muted, Some(true)),
                    other => panic!("unexpected {:?}", other),
                }
            }
            ClientEvent::UserStatus(update) => assert_eq!(update.is_muted, Some(true)),
            other => panic!("unexpected {:?}", other),
        }

        let snapshot = h.session.wait_for(|s| s.is_muted).await;
        assert!(snapshot.is_video_enabled);

        let tracks = h.devices.tracks();
        assert!(tracks
            .iter()
            .filter(|t| t.kind() == MediaKind::Audio)
            .all(|t| !t.is_enabled()));

        h.session.toggle_video(false);
        h.session.wait_for(|s| !s.is_video_enabled).await;
        assert!(tracks
            .iter()
            .filter(|t| t.kind() == MediaKind::Video)
            .all(|t| !t.is_enabled()));
    }

    #[tokio::test]
    async fn test_setting_current_value_is_a_no_op() {
        let mut h = active_initiator().await;

        h.session.toggle_mute(true);
        h.session.toggle_mute(true);
        h.session.toggle_video(true);
        h.session.wait_for(|s| s.is_muted).await;

        h.session.end_call();
        let snapshot = h.session.join().await;
        assert!(snapshot.is_muted);
        assert!(snapshot.is_video_enabled);

        let updates: Vec<UserStatusUpdate> = h
            .relay
            .drain()
            .into_iter()
            .filter_map(|event| match event {
                ClientEvent::UserStatus(update) => Some(update),
                _ => None,
            })
            .collect();
        assert_eq!(updates.iter().filter(|u| u.is_muted.is_some()).count(), 1);
        assert!(updates.iter().all(|u| u.is_video_on.is_none()));
    }

    #[tokio::test]
    async fn test_remote_status_updates_merge() {
        let h = harness(Role::Receiver).await;

        let mut update = UserStatusUpdate::new(SESSION.into());
        update.is_muted = Some(true);
        h.relay.deliver(ServerEvent::UserStatus(update));

        let snapshot = h.session.wait_for(|s| s.remote_status.is_muted).await;
        // Absent flags keep their last known value.
        assert!(snapshot.remote_status.is_video_on);

        let mut update = UserStatusUpdate::new(SESSION.into());
        update.is_video_on = Some(false);
        h.relay.deliver(ServerEvent::UserStatus(update));

        let snapshot = h.session.wait_for(|s| !s.remote_status.is_video_on).await;
        assert!(snapshot.remote_status.is_muted);
    }

    #[tokio::test]
    async fn test_teardown_runs_once() {
        let mut h = active_initiator().await;

        h.session.end_call();
        h.session.end_call();
        h.relay.deliver(ServerEvent::CallEnded(SessionRef { session_id: SESSION.into() }));
        let snapshot = h.session.join().await;

        assert_eq!(snapshot.end_reason, Some(EndReason::LocalHangup));
        assert!(!snapshot.has_local_stream);
        assert_eq!(snapshot.remote_track_count, 0);

        let events = h.relay.drain();
        assert_eq!(count(&events, "user-left"), 1);
        assert_eq!(count(&events, "endCall"), 1);
        assert!(!h.relay.client_connected());

        let peer = h.peers.last().unwrap();
        assert_eq!(peer.count(&PeerOp::DetachSenders), 1);
        assert_eq!(peer.count(&PeerOp::Close), 1);
        let ops = peer.ops();
        let detach_at = ops.iter().position(|op| *op == PeerOp::DetachSenders).unwrap();
        let close_at = ops.iter().position(|op| *op == PeerOp::Close).unwrap();
        assert!(detach_at < close_at);

        assert!(h.devices.all_stopped());
        assert_eq!(h.sink.calls().iter().filter(|c| **c == SinkCall::Clear).count(), 1);
    }

    #[tokio::test]
    async fn test_recorder_releases_stream_before_peer_closes() {
        let h = active_initiator().await;
        let video = h
            .devices
            .tracks()
            .into_iter()
            .find(|t| t.kind() == MediaKind::Video)
            .unwrap();
        assert_eq!(video.chunk_subscribers(), 1);

        h.session.end_call();
        h.session.join().await;

        let peer = h.peers.last().unwrap();
        assert_eq!(peer.chunk_listeners_at_close(), Some(0));
        let ops = peer.ops();
        assert_eq!(&ops[ops.len() - 2..], &[PeerOp::DetachSenders, PeerOp::Close]);
    }

    #[tokio::test]
    async fn test_dropping_handle_hangs_up() {
        let mut h = active_initiator().await;
        drop(h.session);

        let left = expect_event(&mut h.relay, "user-left").await;
        assert_eq!(left.session_id().map(|s| s.as_str()), Some(SESSION));
        expect_event(&mut h.relay, "endCall").await;
    }

    #[tokio::test]
    async fn test_remote_hangup() {
        let h = active_initiator().await;
        h.relay.deliver(ServerEvent::CallEnded(SessionRef { session_id: SESSION.into() }));

        let snapshot = h.session.join().await;
        assert_eq!(snapshot.end_reason, Some(EndReason::RemoteHangup));
        assert!(snapshot.remote_status.has_left);
        assert!(h.devices.all_stopped());
    }

    #[tokio::test]
    async fn test_media_failure_aborts_call() {
        let mut h = harness_with(Role::Receiver, FakeDevices::denied(), test_config()).await;
        let snapshot = h.session.join().await;

        assert_eq!(snapshot.end_reason, Some(EndReason::MediaUnavailable));
        assert!(h.peers.last().unwrap().is_closed());
        let events = h.relay.drain();
        assert_eq!(count(&events, "user-left"), 1);
        assert_eq!(count(&events, "endCall"), 1);
    }

    #[tokio::test]
    async fn test_peer_failure_ends_call() {
        let h = active_initiator().await;
        h.peers
            .last()
            .unwrap()
            .emit(PeerEvent::StateChanged(PeerState::Failed));

        let snapshot = h.session.join().await;
        assert_eq!(snapshot.end_reason, Some(EndReason::ConnectionFailed));
    }

    #[tokio::test]
    async fn test_relay_loss_ends_call() {
        let h = harness(Role::Receiver).await;
        h.session.wait_for(|s| s.has_local_stream).await;
        h.relay.drop_connection();

        let snapshot = h.session.join().await;
        assert_eq!(snapshot.end_reason, Some(EndReason::RelayLost));
        assert!(h.devices.all_stopped());
        assert!(h.peers.last().unwrap().is_closed());
    }

    fn bare_deps(relay: Arc<dyn RelayConnector>, peers: Arc<FakePeerFactory>, devices: Arc<FakeDevices>) -> CallDeps {
        CallDeps {
            relay,
            peers,
            media: devices,
            uploader: Arc::new(MemoryUploader::new()),
            sink: Arc::new(NullSink),
        }
    }

    #[tokio::test]
    async fn test_unreachable_relay() {
        let connector = ScriptedConnector::unreachable();
        let devices = FakeDevices::new();
        let deps = bare_deps(connector.clone(), FakePeerFactory::new(), devices.clone());
        let session = CallSession::spawn(params(Role::Receiver), Arc::new(test_config()), deps);

        let snapshot = session.join().await;
        assert_eq!(snapshot.end_reason, Some(EndReason::RelayUnavailable));
        assert_eq!(devices.acquisitions(), 0);
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn test_peer_setup_failure_ends_call() {
        let (connector, mut endpoints) = ScriptedConnector::new();
        let devices = FakeDevices::new();
        let deps = bare_deps(connector.clone(), FakePeerFactory::failing(), devices.clone());
        let session = CallSession::spawn(params(Role::Initiator), Arc::new(test_config()), deps);

        let snapshot = session.join().await;
        assert_eq!(snapshot.end_reason, Some(EndReason::ConnectionFailed));
        assert_eq!(devices.acquisitions(), 0);
        assert_eq!(connector.connects(), 1);

        let mut relay = endpoints.recv().await.unwrap();
        assert!(!relay.client_connected());
        assert_eq!(count(&relay.drain(), "call-user"), 0);
    }

    #[tokio::test]
    async fn test_hangup_before_relay_connects_never_rings() {
        for _ in 0..40 {
            let (connector, mut endpoints) = ScriptedConnector::new();
            let devices = FakeDevices::new();
            let deps = bare_deps(connector, FakePeerFactory::new(), devices.clone());
            let session = CallSession::spawn(params(Role::Initiator), Arc::new(test_config()), deps);
            session.end_call();

            let snapshot = session.join().await;
            assert_eq!(snapshot.end_reason, Some(EndReason::LocalHangup));
            assert!(!snapshot.is_ringing);
            assert_eq!(devices.acquisitions(), 0);

            while let Ok(mut relay) = endpoints.try_recv() {
                let events = relay.drain();
                assert_eq!(count(&events, "call-user"), 0, "{:?}", events);
                assert_eq!(count(&events, "joinSession"), 0, "{:?}", events);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hangup_while_relay_is_connecting() {
        let (connector, mut endpoints) = ScriptedConnector::slow(Duration::from_secs(60));
        let devices = FakeDevices::new();
        let deps = bare_deps(connector.clone(), FakePeerFactory::new(), devices.clone());
        let session = CallSession::spawn(params(Role::Initiator), Arc::new(test_config()), deps);
        wait_state(&session, CallState::Connecting).await;

        session.toggle_mute(true);
        session.end_call();
        let snapshot = session.join().await;

        assert_eq!(snapshot.end_reason, Some(EndReason::LocalHangup));
        assert_eq!(connector.connects(), 1);
        assert!(endpoints.try_recv().is_err());
        assert_eq!(devices.acquisitions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_connect_counts_against_setup_timeout() {
        let (connector, mut endpoints) = ScriptedConnector::slow(Duration::from_secs(300));
        let config = CallConfig {
            setup_timeout_secs: Some(30),
            ..CallConfig::default()
        };
        let deps = bare_deps(connector.clone(), FakePeerFactory::new(), FakeDevices::new());
        let session = CallSession::spawn(params(Role::Receiver), Arc::new(config), deps);

        let started = Instant::now();
        let snapshot = session.join().await;
        assert_eq!(snapshot.end_reason, Some(EndReason::Timeout));
        assert!(started.elapsed() < Duration::from_secs(300));
        assert_eq!(connector.connects(), 1);
        assert!(endpoints.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unrepresentable_setup_timeout_is_ignored() {
        let config = CallConfig {
            setup_timeout_secs: Some(u64::MAX),
            ..CallConfig::default()
        };
        let mut h = harness_with(Role::Initiator, FakeDevices::new(), config).await;

        expect_event(&mut h.relay, "call-user").await;
        let snapshot = wait_state(&h.session, CallState::Ringing).await;
        assert_eq!(snapshot.end_reason, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_call_times_out() {
        let config = CallConfig {
            setup_timeout_secs: Some(30),
            ..CallConfig::default()
        };
        let h = harness_with(Role::Initiator, FakeDevices::new(), config).await;

        let snapshot = h.session.join().await;
        assert_eq!(snapshot.end_reason, Some(EndReason::Timeout));
        assert_eq!(h.devices.acquisitions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_media_arriving_after_hangup_is_released() {
        let h = harness_with(
            Role::Receiver,
            FakeDevices::slow(Duration::from_secs(10)),
            test_config(),
        )
        .await;

        h.session.end_call();
        let snapshot = h.session.join().await;
        assert_eq!(snapshot.end_reason, Some(EndReason::LocalHangup));
        assert!(!snapshot.has_local_stream);

        tokio::time::sleep(Duration::from_secs(11)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert!(!h.devices.tracks().is_empty());
        assert!(h.devices.all_stopped());
    }

    #[tokio::test]
    async fn test_recording_uploaded_after_hangup() {
        let h = active_initiator().await;

        let video = h
            .devices
            .tracks()
            .into_iter()
            .find(|t| t.kind() == MediaKind::Video)
            .unwrap();
        video
            .write_sample(Bytes::from_static(b"frame-1"), Duration::from_millis(33))
            .await
            .unwrap();
        video
            .write_sample(Bytes::from_static(b"frame-2"), Duration::from_millis(33))
            .await
            .unwrap();

        h.session.end_call();
        let snapshot = h.session.join().await;

        assert_eq!(
            snapshot.recording,
            RecordingOutcome::Uploaded {
                file_name: h.uploader.uploads()[0].file_name.clone(),
                size: 14,
            }
        );
        let upload = &h.uploader.uploads()[0];
        assert!(upload.file_name.starts_with("initiator_S1_"));
        assert_eq!(upload.data, b"frame-1frame-2".to_vec());
        assert_eq!(h.uploader.attempts(), 1);
    }

    #[tokio::test]
    async fn test_recording_disabled_uploads_nothing() {
        let mut config = test_config();
        config.recording.enabled = false;
        let h = harness_with(Role::Receiver, FakeDevices::new(), config).await;
        h.session.wait_for(|s| s.has_local_stream).await;

        h.session.end_call();
        let snapshot = h.session.join().await;
        assert_eq!(snapshot.recording, RecordingOutcome::NotRecorded);
        assert_eq!(h.uploader.attempts(), 0);
    }

    #[tokio::test]
    async fn test_two_parties_connect_and_hang_up() {
        let mut trainer = harness(Role::Initiator).await;
        let trainee = harness(Role::Receiver).await;

        expect_event(&mut trainer.relay, "call-user").await;
        trainer.relay.deliver(accepted());
        let _link = bridge(trainer.relay, trainee.relay);

        wait_state(&trainer.session, CallState::Active).await;
        wait_state(&trainee.session, CallState::Active).await;
        trainer
            .session
            .wait_for(|s| s.remote_status.is_connected && s.remote_track_count == 2)
            .await;

        trainer.session.toggle_mute(true);
        trainee.session.wait_for(|s| s.remote_status.is_muted).await;

        trainer.session.end_call();
        let trainer_end = trainer.session.join().await;
        let trainee_end = trainee.session.join().await;

        assert_eq!(trainer_end.end_reason, Some(EndReason::LocalHangup));
        assert_eq!(trainee_end.end_reason, Some(EndReason::RemoteHangup));
        assert!(trainer.devices.all_stopped());
        assert!(trainee.devices.all_stopped());
    }
}
