//! Session recorder: buffers the local stream for the length of a call and
//! uploads it once when the call ends.

use crate::config::{CallConfig, RecordingConfig};
use crate::error::{Error, Result};
use crate::media::{LocalStream, MediaChunk};
use crate::models::{RecordingOutcome, Role, SessionId};
use crate::network::{ApiClient, UploadReceipt};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The single blob produced by one call.
#[derive(Debug, Clone)]
pub struct RecordingArtifact {
    pub session_id: SessionId,
    pub role: Role,
    pub file_name: String,
    pub field_name: String,
    pub mime_type: String,
    pub chunk_count: usize,
    pub data: Vec<u8>,
}

/// `<role>_<sessionId>_<unix millis>.<ext>`
pub fn recording_file_name(role: Role, session_id: &SessionId, at: DateTime<Utc>, extension: &str) -> String {
    format!(
        "{}_{}_{}.{}",
        role.as_str(),
        session_id,
        at.timestamp_millis(),
        extension
    )
}

#[async_trait]
pub trait RecordingUploader: Send + Sync {
    async fn upload(&self, artifact: RecordingArtifact) -> Result<UploadReceipt>;
}

/// Multipart upload to the recordings endpoint.
pub struct HttpUploader {
    api: ApiClient,
    path: String,
}

impl HttpUploader {
    pub fn new(config: &CallConfig) -> Result<Self> {
        Ok(Self {
            api: ApiClient::new(&config.server)?,
            path: config.recording.upload_path.clone(),
        })
    }
}

#[async_trait]
impl RecordingUploader for HttpUploader {
    async fn upload(&self, artifact: RecordingArtifact) -> Result<UploadReceipt> {
        self.api
            .upload_recording(
                &self.path,
                &artifact.field_name,
                &artifact.file_name,
                &artifact.mime_type,
                artifact.data,
            )
            .await
    }
}

enum RecorderState {
    Idle,
    Recording {
        stop: oneshot::Sender<()>,
        capture: JoinHandle<Vec<Bytes>>,
    },
    Stopped,
}

pub struct SessionRecorder {
    session_id: SessionId,
    role: Role,
    config: RecordingConfig,
    state: RecorderState,
}

impl SessionRecorder {
    pub fn new(session_id: SessionId, role: Role, config: RecordingConfig) -> Self {
        Self {
            session_id,
            role,
            config,
            state: RecorderState::Idle,
        }
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.state, RecorderState::Recording { .. })
    }

    /// Begin buffering `stream`. A recorder records at most once.
    pub fn start(&mut self, stream: &LocalStream) -> Result<()> {
        if !matches!(self.state, RecorderState::Idle) {
            return Err(Error::InvalidState("recorder already used for this call".to_string()));
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let capture = tokio::spawn(capture(stream.subscribe(), stop_rx));
        self.state = RecorderState::Recording {
            stop: stop_tx,
            capture,
        };

        info!(session_id = %self.session_id, "Recording started");
        Ok(())
    }

    /// Stop capture and package the buffer. `None` if nothing was recording.
    pub async fn stop(&mut self) -> Option<RecordingArtifact> {
        if !self.is_recording() {
            return None;
        }
        let RecorderState::Recording { stop, capture } =
            std::mem::replace(&mut self.state, RecorderState::Stopped)
        else {
            return None;
        };

        let _ = stop.send(());
        let chunks = match capture.await {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!(session_id = %self.session_id, "Recorder capture task failed: {}", e);
                Vec::new()
            }
        };

        let size = chunks.iter().map(|c| c.len()).sum();
        let mut data = Vec::with_capacity(size);
        for chunk in &chunks {
            data.extend_from_slice(chunk);
        }

        debug!(session_id = %self.session_id, chunks = chunks.len(), bytes = size, "Recording stopped");

        Some(RecordingArtifact {
            session_id: self.session_id.clone(),
            role: self.role,
            file_name: recording_file_name(self.role, &self.session_id, Utc::now(), &self.config.file_extension),
            field_name: self.config.field_name.clone(),
            mime_type: self.config.mime_type.clone(),
            chunk_count: chunks.len(),
            data,
        })
    }

    pub async fn stop_and_upload(&mut self, uploader: &dyn RecordingUploader) -> RecordingOutcome {
        match self.stop().await {
            Some(artifact) => upload_artifact(uploader, artifact).await,
            None => RecordingOutcome::NotRecorded,
        }
    }
}

/// Upload once; the artifact is consumed whether or not it succeeds.
pub async fn upload_artifact(uploader: &dyn RecordingUploader, artifact: RecordingArtifact) -> RecordingOutcome {
    if artifact.data.is_empty() {
        debug!(session_id = %artifact.session_id, "Recording is empty, nothing to upload");
        return RecordingOutcome::Empty;
    }

    let file_name = artifact.file_name.clone();
    let size = artifact.data.len();
    let session_id = artifact.session_id.clone();

    match uploader.upload(artifact).await {
        Ok(receipt) => {
            info!(session_id = %session_id, recording_id = %receipt.recording_id, size, "Recording uploaded");
            RecordingOutcome::Uploaded { file_name, size }
        }
        Err(e) => {
            warn!(session_id = %session_id, "Recording upload failed, discarding {} bytes: {}", size, e);
            RecordingOutcome::Failed { reason: e.to_string() }
        }
    }
}

async fn capture(mut chunks: broadcast::Receiver<MediaChunk>, mut stop: oneshot::Receiver<()>) -> Vec<Bytes> {
    let mut buffer = Vec::new();

    loop {
        tokio::select! {
            _ = &mut stop => break,
            received = chunks.recv() => match received {
                Ok(chunk) => {
                    if !chunk.data.is_empty() {
                        buffer.push(chunk.data);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Recorder fell behind, {} chunks lost", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    // Keep whatever was produced before the stop signal.
    while let Ok(chunk) = chunks.try_recv() {
        if !chunk.data.is_empty() {
            buffer.push(chunk.data);
        }
    }

    buffer
}
