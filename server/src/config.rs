//! Configuration management for the CoachCall server

use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub recordings_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub max_recording_size_mb: u64,
    /// Frames kept for a session whose other party has not joined yet
    pub session_backlog: usize,
}

/// Multipart framing allowed on top of the recording itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

impl LimitsConfig {
    /// Saturates at `usize::MAX` for limits the platform cannot represent.
    pub fn max_recording_bytes(&self) -> usize {
        let bytes = self.max_recording_size_mb.saturating_mul(1024 * 1024);
        usize::try_from(bytes).unwrap_or(usize::MAX)
    }

    pub fn upload_body_limit(&self) -> usize {
        self.max_recording_bytes().saturating_add(MULTIPART_OVERHEAD)
    }
}

impl Config {
    pub async fn load(path: &str) -> anyhow::Result<Self> {
        if Path::new(path).exists() {
            let content = fs::read_to_string(path).await?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.write(path).await?;
            tracing::info!("Created default config at {}", path);
            Ok(config)
        }
    }

    pub async fn write(&self, path: &str) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).await?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 9443,
            },
            storage: StorageConfig {
                recordings_path: "./data/recordings".to_string(),
            },
            limits: LimitsConfig {
                max_recording_size_mb: 512,
                session_backlog: 64,
            },
        }
    }
}
