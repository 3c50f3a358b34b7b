//! In-process stand-ins for the relay, peer connections, capture devices and
//! the upload endpoint. Used by this crate's tests and, behind the `testing`
//! feature, by downstream integration tests.

use crate::config::{IceConfig, MediaConstraints};
use crate::error::{Error, MediaError, Result};
use crate::media::{LocalStream, LocalTrack, MediaDevices, MediaKind, MediaSink, RemoteStream, RemoteTrack};
use crate::network::{RelayConnection, RelayConnector, RelayEndpoint, RelayInbox, UploadReceipt};
use crate::peer::{PeerConnection, PeerEvent, PeerEventSender, PeerFactory, PeerState};
use crate::recorder::{RecordingArtifact, RecordingUploader};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Candidates containing this marker are refused by [`FakePeer`].
pub const BAD_CANDIDATE_MARKER: &str = "unreachable";

// ============================================================================
// Relay
// ============================================================================

/// Hands out in-memory relay connections; the test drives the relay side.
pub struct ScriptedConnector {
    endpoints: mpsc::UnboundedSender<RelayEndpoint>,
    refuse: bool,
    delay: Option<Duration>,
    connects: AtomicUsize,
}

impl ScriptedConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<RelayEndpoint>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            endpoints: tx,
            refuse: false,
            delay: None,
            connects: AtomicUsize::new(0),
        });
        (connector, rx)
    }

    /// A relay that takes `delay` to accept each connection.
    pub fn slow(delay: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<RelayEndpoint>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            endpoints: tx,
            refuse: false,
            delay: Some(delay),
            connects: AtomicUsize::new(0),
        });
        (connector, rx)
    }

    /// A relay that can never be reached.
    pub fn unreachable() -> Arc<Self> {
        let (tx, _) = mpsc::unbounded_channel();
        Arc::new(Self {
            endpoints: tx,
            refuse: true,
            delay: None,
            connects: AtomicUsize::new(0),
        })
    }

    /// Connection attempts started so far.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelayConnector for ScriptedConnector {
    async fn connect(&self) -> Result<(RelayConnection, RelayInbox)> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.refuse {
            return Err(Error::Network("connection refused".to_string()));
        }

        let (conn, inbox, endpoint) = RelayConnection::in_memory();
        let _ = self.endpoints.send(endpoint);
        Ok((conn, inbox))
    }
}

/// Relay two in-memory endpoints to each other until either side goes away.
pub fn bridge(a: RelayEndpoint, b: RelayEndpoint) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (mut a, mut b) = (a, b);
        loop {
            tokio::select! {
                event = a.next_event() => match event {
                    Some(event) => {
                        if let Some(forwarded) = event.forwarded() {
                            b.deliver(forwarded);
                        }
                    }
                    None => break,
                },
                event = b.next_event() => match event {
                    Some(event) => {
                        if let Some(forwarded) = event.forwarded() {
                            a.deliver(forwarded);
                        }
                    }
                    None => break,
                },
            }
        }
    })
}

// ============================================================================
// Peers
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerOp {
    AddTrack(MediaKind),
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(SdpType),
    AddCandidate(String),
    DetachSenders,
    Close,
}

#[derive(Default)]
struct FakePeerState {
    ops: Vec<PeerOp>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    connected: bool,
    closed: bool,
    tracks: Vec<LocalTrack>,
    chunk_listeners_at_close: Option<usize>,
}

/// Peer connection that negotiates instantly.
///
/// It gathers one local candidate when its local description is set, refuses
/// remote candidates before a remote description exists, and reports
/// `Connected` (plus one audio and one video remote track) once both
/// descriptions and at least one remote candidate are in place.
pub struct FakePeer {
    id: usize,
    events: PeerEventSender,
    state: Mutex<FakePeerState>,
}

impl FakePeer {
    fn new(id: usize, events: PeerEventSender) -> Self {
        Self {
            id,
            events,
            state: Mutex::new(FakePeerState::default()),
        }
    }

    pub fn ops(&self) -> Vec<PeerOp> {
        self.state.lock().ops.clone()
    }

    pub fn count(&self, op: &PeerOp) -> usize {
        self.state.lock().ops.iter().filter(|o| *o == op).count()
    }

    pub fn added_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().candidates.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Chunk receivers still attached to the sent tracks when the peer was
    /// closed. `None` until closed.
    pub fn chunk_listeners_at_close(&self) -> Option<usize> {
        self.state.lock().chunk_listeners_at_close
    }

    /// Raise a peer event as if the ICE/DTLS stack produced it.
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    fn record(&self, op: PeerOp) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::PeerConnection("peer connection is closed".to_string()));
        }
        state.ops.push(op);
        Ok(())
    }

    fn maybe_connect(&self) {
        let mut state = self.state.lock();
        let ready = state.local.is_some() && state.remote.is_some() && !state.candidates.is_empty();
        if !ready || state.connected || state.closed {
            return;
        }
        state.connected = true;
        drop(state);

        let stream_id = format!("remote-stream-{}", self.id);
        self.emit(PeerEvent::StateChanged(PeerState::Connected));
        for kind in [MediaKind::Audio, MediaKind::Video] {
            self.emit(PeerEvent::RemoteTrack(RemoteTrack {
                id: format!("{}-{}", kind.as_str(), self.id),
                stream_id: stream_id.clone(),
                kind,
            }));
        }
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_local_track(&self, track: &LocalTrack) -> Result<()> {
        self.record(PeerOp::AddTrack(track.kind()))?;
        self.state.lock().tracks.push(track.clone());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.record(PeerOp::CreateOffer)?;
        Ok(SessionDescription::offer(format!("v=0 fake-offer-{}", self.id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.record(PeerOp::CreateAnswer)?;
        let has_offer = matches!(
            self.state.lock().remote,
            Some(SessionDescription { sdp_type: SdpType::Offer, .. })
        );
        if !has_offer {
            return Err(Error::PeerConnection("no remote offer to answer".to_string()));
        }
        Ok(SessionDescription::answer(format!("v=0 fake-answer-{}", self.id)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.record(PeerOp::SetLocal(desc.sdp_type))?;
        self.state.lock().local = Some(desc);

        self.emit(PeerEvent::LocalCandidate(IceCandidate::new(format!(
            "candidate:{} 1 udp 2122260223 10.0.0.{} 50000 typ host",
            self.id,
            self.id % 250 + 1
        ))));
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.record(PeerOp::SetRemote(desc.sdp_type))?;
        self.state.lock().remote = Some(desc);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.record(PeerOp::AddCandidate(candidate.candidate.clone()))?;
        if self.state.lock().remote.is_none() {
            return Err(Error::PeerConnection(
                "remote description not set".to_string(),
            ));
        }
        if candidate.candidate.contains(BAD_CANDIDATE_MARKER) {
            return Err(Error::PeerConnection(format!(
                "candidate rejected: {}",
                candidate.candidate
            )));
        }
        self.state.lock().candidates.push(candidate);
        self.maybe_connect();
        Ok(())
    }

    async fn detach_senders(&self) -> Result<()> {
        self.record(PeerOp::DetachSenders)
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.ops.push(PeerOp::Close);
        state.closed = true;
        let listeners = state.tracks.iter().map(|t| t.chunk_subscribers()).max().unwrap_or(0);
        state.chunk_listeners_at_close = Some(listeners);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePeerFactory {
    peers: Mutex<Vec<Arc<FakePeer>>>,
    fail: bool,
}

impl FakePeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            peers: Mutex::new(Vec::new()),
            fail: true,
        })
    }

    pub fn peers(&self) -> Vec<Arc<FakePeer>> {
        self.peers.lock().clone()
    }

    /// The most recently created peer.
    pub fn last(&self) -> Option<Arc<FakePeer>> {
        self.peers.lock().last().cloned()
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create(&self, _ice: &IceConfig, events: PeerEventSender) -> Result<Arc<dyn PeerConnection>> {
        if self.fail {
            return Err(Error::PeerConnection("no ICE transport available".to_string()));
        }
        let mut peers = self.peers.lock();
        let peer = Arc::new(FakePeer::new(peers.len() + 1, events));
        peers.push(peer.clone());
        Ok(peer)
    }
}

// ============================================================================
// Capture devices
// ============================================================================

/// Capture devices that hand out silent streams, optionally slowly or never.
pub struct FakeDevices {
    failure: Option<MediaError>,
    delay: Option<Duration>,
    acquisitions: AtomicUsize,
    tracks: Mutex<Vec<LocalTrack>>,
}

impl FakeDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            failure: None,
            delay: None,
            acquisitions: AtomicUsize::new(0),
            tracks: Mutex::new(Vec::new()),
        })
    }

    pub fn denied() -> Arc<Self> {
        Arc::new(Self {
            failure: Some(MediaError::PermissionDenied),
            delay: None,
            acquisitions: AtomicUsize::new(0),
            tracks: Mutex::new(Vec::new()),
        })
    }

    /// Devices that take `delay` before producing a stream.
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            failure: None,
            delay: Some(delay),
            acquisitions: AtomicUsize::new(0),
            tracks: Mutex::new(Vec::new()),
        })
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// Every track handed out so far.
    pub fn tracks(&self) -> Vec<LocalTrack> {
        self.tracks.lock().clone()
    }

    pub fn all_stopped(&self) -> bool {
        self.tracks.lock().iter().all(|t| t.is_stopped())
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn acquire(&self, constraints: &MediaConstraints) -> std::result::Result<LocalStream, MediaError> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(ref failure) = self.failure {
            return Err(failure.clone());
        }

        let stream = LocalStream::new(constraints);
        self.tracks.lock().extend(stream.tracks().iter().cloned());
        Ok(stream)
    }
}

// ============================================================================
// Upload
// ============================================================================

/// Keeps uploaded artifacts in memory.
pub struct MemoryUploader {
    fail: bool,
    attempts: AtomicUsize,
    uploads: Mutex<Vec<RecordingArtifact>>,
}

impl MemoryUploader {
    pub fn new() -> Self {
        Self {
            fail: false,
            attempts: AtomicUsize::new(0),
            uploads: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn uploads(&self) -> Vec<RecordingArtifact> {
        self.uploads.lock().clone()
    }
}

impl Default for MemoryUploader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordingUploader for MemoryUploader {
    async fn upload(&self, artifact: RecordingArtifact) -> Result<UploadReceipt> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail {
            return Err(Error::Upload("server responded 503 Service Unavailable".to_string()));
        }

        let receipt = UploadReceipt {
            recording_id: format!("rec-{}", attempt),
            file_name: artifact.file_name.clone(),
            size: artifact.data.len() as u64,
        };
        self.uploads.lock().push(artifact);
        Ok(receipt)
    }
}

// ============================================================================
// Rendering
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkCall {
    Local { stream_id: String, muted_playback: bool },
    Remote { stream_id: String, tracks: usize },
    Clear,
}

/// Media sink that remembers what it was asked to render.
#[derive(Default)]
pub struct RecordingSink {
    calls: Mutex<Vec<SinkCall>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().clone()
    }
}

impl MediaSink for RecordingSink {
    fn show_local(&self, stream: &LocalStream, muted_playback: bool) {
        self.calls.lock().push(SinkCall::Local {
            stream_id: stream.id().to_string(),
            muted_playback,
        });
    }

    fn show_remote(&self, stream: &RemoteStream) {
        self.calls.lock().push(SinkCall::Remote {
            stream_id: stream.id().to_string(),
            tracks: stream.tracks().len(),
        });
    }

    fn clear(&self) {
        self.calls.lock().push(SinkCall::Clear);
    }
}
