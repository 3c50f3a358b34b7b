//! Media pipeline: local capture streams, remote stream bookkeeping and the
//! rendering seam.

use crate::config::MediaConstraints;
use crate::error::{Error, MediaError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

const CHUNK_CHANNEL_CAPACITY: usize = 1024;
const MAX_SYNTHETIC_FRAME_RATE: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

/// One encoded unit produced by a local track.
#[derive(Debug, Clone)]
pub struct MediaChunk {
    pub kind: MediaKind,
    pub data: Bytes,
    pub captured_at: DateTime<Utc>,
}

// ============================================================================
// Local media
// ============================================================================

struct TrackInner {
    id: String,
    kind: MediaKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
    rtc: Arc<TrackLocalStaticSample>,
    chunks: broadcast::Sender<MediaChunk>,
}

/// A captured camera or microphone track. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

impl LocalTrack {
    fn new(kind: MediaKind, stream_id: &str, chunks: broadcast::Sender<MediaChunk>) -> Self {
        let id = format!("{}-{}", kind.as_str(), uuid::Uuid::new_v4());
        let codec = match kind {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        let rtc = Arc::new(TrackLocalStaticSample::new(
            codec,
            id.clone(),
            stream_id.to_string(),
        ));

        Self {
            inner: Arc::new(TrackInner {
                id,
                kind,
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
                rtc,
                chunks,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Stop capture for good. Returns false if the track was already stopped.
    pub fn stop(&self) -> bool {
        !self.inner.stopped.swap(true, Ordering::SeqCst)
    }

    /// Receivers currently listening for this track's chunks.
    pub fn chunk_subscribers(&self) -> usize {
        self.inner.chunks.receiver_count()
    }

    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        self.inner.rtc.clone()
    }

    /// Push one encoded sample from the capture backend. Disabled tracks drop it.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::InvalidState(format!("track {} is stopped", self.id())));
        }
        if !self.is_enabled() {
            return Ok(());
        }

        // No subscribers simply means nobody is recording.
        let _ = self.inner.chunks.send(MediaChunk {
            kind: self.kind(),
            data: data.clone(),
            captured_at: Utc::now(),
        });

        self.inner
            .rtc
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;

        Ok(())
    }
}

/// Camera + microphone stream owned by exactly one call controller.
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
    chunks: broadcast::Sender<MediaChunk>,
}

impl LocalStream {
    pub fn new(constraints: &MediaConstraints) -> Self {
        let id = format!("local-{}", uuid::Uuid::new_v4());
        let (chunks, _) = broadcast::channel(CHUNK_CHANNEL_CAPACITY);

        let mut tracks = Vec::with_capacity(2);
        if constraints.audio {
            tracks.push(LocalTrack::new(MediaKind::Audio, &id, chunks.clone()));
        }
        tracks.push(LocalTrack::new(MediaKind::Video, &id, chunks.clone()));

        Self { id, tracks, chunks }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: MediaKind) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    /// Encoded chunks of every track, in production order.
    pub fn subscribe(&self) -> broadcast::Receiver<MediaChunk> {
        self.chunks.subscribe()
    }

    pub fn set_muted(&self, muted: bool) {
        for track in self.tracks_of(MediaKind::Audio) {
            track.set_enabled(!muted);
        }
    }

    pub fn set_video_enabled(&self, on: bool) {
        for track in self.tracks_of(MediaKind::Video) {
            track.set_enabled(on);
        }
    }

    /// Stop every track. Returns how many were still live.
    pub fn stop(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }

    pub fn is_stopped(&self) -> bool {
        self.tracks.iter().all(|t| t.is_stopped())
    }
}

impl Drop for LocalStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Access to the local camera and microphone.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, constraints: &MediaConstraints) -> std::result::Result<LocalStream, MediaError>;
}

/// Capture source that feeds blank frames at the configured rate.
///
/// Stands in for a platform camera/microphone backend on headless hosts.
pub struct SyntheticDevices {
    video_frame_size: usize,
    audio_frame_size: usize,
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self {
            video_frame_size: 1200,
            audio_frame_size: 160,
        }
    }

    fn spawn_feeder(track: LocalTrack, frame: Bytes, interval: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if track.write_sample(frame.clone(), interval).await.is_err() {
                    break;
                }
            }
        });
    }
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn acquire(&self, constraints: &MediaConstraints) -> std::result::Result<LocalStream, MediaError> {
        let frame_rate = constraints.video.frame_rate;
        if frame_rate == 0 || frame_rate > MAX_SYNTHETIC_FRAME_RATE {
            return Err(MediaError::Other(format!(
                "video frame rate must be between 1 and {}, got {}",
                MAX_SYNTHETIC_FRAME_RATE, frame_rate
            )));
        }

        let stream = LocalStream::new(constraints);
        let video_interval = Duration::from_millis(1000 / u64::from(frame_rate));

        for track in stream.tracks() {
            let (frame, interval) = match track.kind() {
                MediaKind::Video => (vec![0u8; self.video_frame_size], video_interval),
                MediaKind::Audio => (vec![0u8; self.audio_frame_size], Duration::from_millis(20)),
            };
            Self::spawn_feeder(track.clone(), Bytes::from(frame), interval);
        }

        Ok(stream)
    }
}

// ============================================================================
// Remote media
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
}

/// Tracks of the first remote stream that arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    id: String,
    tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    pub fn new(first: RemoteTrack) -> Self {
        Self {
            id: first.stream_id.clone(),
            tracks: vec![first],
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[RemoteTrack] {
        &self.tracks
    }

    /// Add a track if it belongs to this stream and is not known yet.
    pub fn accept(&mut self, track: RemoteTrack) -> bool {
        if track.stream_id != self.id || self.tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        self.tracks.push(track);
        true
    }
}

// ============================================================================
// Rendering
// ============================================================================

/// Where the application renders call media. Layout is the application's concern.
pub trait MediaSink: Send + Sync {
    /// Local preview; `muted_playback` is always true to avoid audio feedback.
    fn show_local(&self, stream: &LocalStream, muted_playback: bool);
    fn show_remote(&self, stream: &RemoteStream);
    fn clear(&self);
}

pub struct NullSink;

impl MediaSink for NullSink {
    fn show_local(&self, _stream: &LocalStream, _muted_playback: bool) {}
    fn show_remote(&self, _stream: &RemoteStream) {}
    fn clear(&self) {}
}
