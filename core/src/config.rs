//! Client configuration: relay/upload endpoints, ICE servers, media
//! constraints and recording policy.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub server_host: String,
    pub server_port: u16,
    pub use_tls: bool,
}

impl ClientConfig {
    pub fn new(host: &str, port: u16, use_tls: bool) -> Self {
        Self {
            server_host: host.to_string(),
            server_port: port,
            use_tls,
        }
    }

    pub fn http_url(&self) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.server_host, self.server_port)
    }

    pub fn ws_url(&self) -> String {
        let scheme = if self.use_tls { "wss" } else { "ws" };
        format!("{}://{}:{}/ws", scheme, self.server_host, self.server_port)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("localhost", 9443, false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// Static ICE configuration; never renegotiated mid-call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceConfig {
    pub candidate_pool_size: u8,
    pub servers: Vec<IceServer>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            servers: vec![IceServer {
                urls: vec![
                    "stun:stun.l.google.com:19302".to_string(),
                    "stun:stun1.l.google.com:19302".to_string(),
                ],
                username: None,
                credential: None,
            }],
            candidate_pool_size: 10,
        }
    }
}

impl IceConfig {
    pub fn validate(&self) -> Result<()> {
        for server in &self.servers {
            if server.urls.is_empty() {
                return Err(Error::Config("ICE server entry without urls".to_string()));
            }
            for url in &server.urls {
                let is_turn = url.starts_with("turn:") || url.starts_with("turns:");
                if !(is_turn || url.starts_with("stun:") || url.starts_with("stuns:")) {
                    return Err(Error::Config(format!("unsupported ICE url scheme: {}", url)));
                }
                if is_turn && (server.username.is_none() || server.credential.is_none()) {
                    return Err(Error::Config(format!(
                        "TURN server {} requires username and credential",
                        url
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConstraints {
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub frame_rate: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: VideoConstraints,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: VideoConstraints {
                ideal_width: 1280,
                ideal_height: 720,
                frame_rate: 30,
            },
            audio: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingConfig {
    pub enabled: bool,
    pub upload_path: String,
    pub field_name: String,
    pub mime_type: String,
    pub file_extension: String,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            upload_path: "/api/v1/recordings/upload".to_string(),
            field_name: "video".to_string(),
            mime_type: "video/webm".to_string(),
            file_extension: "webm".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// A call that is not active within this many seconds is ended.
    pub setup_timeout_secs: Option<u64>,
    /// The callee starts its media as soon as the controller is created.
    pub auto_start_receiver: bool,
    pub server: ClientConfig,
    pub ice: IceConfig,
    pub media: MediaConstraints,
    pub recording: RecordingConfig,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            setup_timeout_secs: Some(60),
            auto_start_receiver: true,
            server: ClientConfig::default(),
            ice: IceConfig::default(),
            media: MediaConstraints::default(),
            recording: RecordingConfig::default(),
        }
    }
}

impl CallConfig {
    /// Load from a TOML file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No call config file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: CallConfig = toml::from_str(&content)?;
        config.ice.validate()?;
        Ok(config)
    }

    pub fn setup_timeout(&self) -> Option<Duration> {
        self.setup_timeout_secs.map(Duration::from_secs)
    }

    pub fn upload_url(&self) -> String {
        format!("{}{}", self.server.http_url(), self.recording.upload_path)
    }
}
