//! Recording upload handler

use axum::{
    extract::{Multipart, State},
    Json,
};
use serde::Serialize;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::{
    error::{AppError, Result},
    AppState,
};

/// Multipart field carrying the recording blob
pub const RECORDING_FIELD: &str = "video";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingUploadResponse {
    pub recording_id: String,
    pub file_name: String,
    pub size: u64,
}

/// Store one call recording
pub async fn upload_recording(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<RecordingUploadResponse>> {
    let max_size = state.config.limits.max_recording_bytes();
    let recordings_path = PathBuf::from(&state.config.storage.recordings_path);

    let mut upload: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        AppError::BadRequest(format!("Failed to read multipart: {}", e))
    })? {
        if field.name() != Some(RECORDING_FIELD) {
            continue;
        }

        let file_name = field.file_name().unwrap_or("recording.webm").to_string();
        let data = field.bytes().await.map_err(|e| {
            AppError::BadRequest(format!("Failed to read recording: {}", e))
        })?;

        if data.len() > max_size {
            return Err(AppError::RecordingTooLarge);
        }

        upload = Some((file_name, data.to_vec()));
    }

    let (original_name, data) =
        upload.ok_or(AppError::BadRequest("No recording provided".to_string()))?;
    if data.is_empty() {
        return Err(AppError::BadRequest("Recording is empty".to_string()));
    }

    fs::create_dir_all(&recordings_path).await?;

    let recording_id = Uuid::new_v4().to_string();
    let file_name = format!("{}_{}", recording_id, sanitize_file_name(&original_name));

    let mut file = fs::File::create(recordings_path.join(&file_name)).await?;
    file.write_all(&data).await?;
    file.flush().await?;

    tracing::info!(
        "Recording uploaded: id={}, name={}, size={}",
        recording_id,
        file_name,
        data.len()
    );

    Ok(Json(RecordingUploadResponse {
        recording_id,
        file_name,
        size: data.len() as u64,
    }))
}

/// Keep names flat and portable: no separators, no leading dots
fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');

    if cleaned.is_empty() {
        "recording.webm".to_string()
    } else {
        cleaned.to_string()
    }
}
