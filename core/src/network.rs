//! Network layer for CoachCall - relay connection and HTTP API client

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::signaling::{ClientEvent, ServerEvent};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};

// ============================================================================
// Relay connection
// ============================================================================

/// What the owner of a relay connection observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayNotice {
    Connected,
    Event(ServerEvent),
    Disconnected,
}

pub type RelayInbox = mpsc::UnboundedReceiver<RelayNotice>;

/// One owned, bidirectional connection to the signaling relay.
///
/// Outgoing events go through [`RelayConnection::emit`], which is a no-op once
/// the connection is gone. Incoming traffic is delivered on the [`RelayInbox`]
/// returned alongside the connection. Dropping the connection disconnects it.
pub struct RelayConnection {
    sender: Option<mpsc::UnboundedSender<ClientEvent>>,
    connected: Arc<Mutex<bool>>,
    reader: Option<JoinHandle<()>>,
}

impl RelayConnection {
    /// Open a WebSocket connection to the relay at `url`.
    pub async fn connect(url: &str) -> Result<(Self, RelayInbox)> {
        let url = url::Url::parse(url)?;
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<ClientEvent>();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel::<RelayNotice>();
        let connected = Arc::new(Mutex::new(true));

        info!("Relay connected: {}", url);
        let _ = inbox_tx.send(RelayNotice::Connected);

        // Receive task
        let connected_clone = connected.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            if inbox_tx.send(RelayNotice::Event(event)).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Dropping unrecognized relay frame: {}", e),
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Err(e) => {
                        debug!("Relay read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            *connected_clone.lock() = false;
            let _ = inbox_tx.send(RelayNotice::Disconnected);
        });

        // Send task; drains everything queued before the sender was dropped.
        let connected_clone = connected.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode {} event: {}", event.name(), e);
                        continue;
                    }
                };
                if write.send(WsMessage::Text(text)).await.is_err() {
                    *connected_clone.lock() = false;
                    break;
                }
            }
            let _ = write.close().await;
        });

        Ok((
            Self {
                sender: Some(tx),
                connected,
                reader: Some(reader),
            },
            inbox_rx,
        ))
    }

    /// In-process connection: the returned [`RelayEndpoint`] plays the relay.
    pub fn in_memory() -> (Self, RelayInbox, RelayEndpoint) {
        let (tx, rx) = mpsc::unbounded_channel::<ClientEvent>();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel::<RelayNotice>();
        let connected = Arc::new(Mutex::new(true));
        let _ = inbox_tx.send(RelayNotice::Connected);

        let endpoint = RelayEndpoint {
            outgoing: rx,
            incoming: inbox_tx,
            connected: connected.clone(),
        };

        (
            Self {
                sender: Some(tx),
                connected,
                reader: None,
            },
            inbox_rx,
            endpoint,
        )
    }

    pub fn is_connected(&self) -> bool {
        self.sender.is_some() && *self.connected.lock()
    }

    /// Send an event if the relay is reachable. Returns whether it was queued.
    pub fn emit(&self, event: ClientEvent) -> bool {
        if !self.is_connected() {
            debug!(event = event.name(), "Relay not connected, dropping event");
            return false;
        }

        match self.sender {
            Some(ref sender) => sender.send(event).is_ok(),
            None => false,
        }
    }

    /// Release the connection. Events already queued are still flushed.
    pub fn disconnect(&mut self) {
        if self.sender.take().is_none() {
            return;
        }
        *self.connected.lock() = false;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        debug!("Relay connection released");
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Relay side of an in-memory [`RelayConnection`].
pub struct RelayEndpoint {
    outgoing: mpsc::UnboundedReceiver<ClientEvent>,
    incoming: mpsc::UnboundedSender<RelayNotice>,
    connected: Arc<Mutex<bool>>,
}

impl RelayEndpoint {
    /// Deliver a relay event to the client.
    pub fn deliver(&self, event: ServerEvent) {
        let _ = self.incoming.send(RelayNotice::Event(event));
    }

    pub fn notify(&self, notice: RelayNotice) {
        let _ = self.incoming.send(notice);
    }

    /// Simulate the relay dropping the connection.
    pub fn drop_connection(&self) {
        *self.connected.lock() = false;
        let _ = self.incoming.send(RelayNotice::Disconnected);
    }

    /// Events the client has emitted so far.
    pub fn drain(&mut self) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.outgoing.try_recv() {
            events.push(event);
        }
        events
    }

    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.outgoing.recv().await
    }

    pub fn client_connected(&self) -> bool {
        *self.connected.lock()
    }
}

/// Opens relay connections on behalf of listeners and call sessions.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self) -> Result<(RelayConnection, RelayInbox)>;
}

pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.ws_url())
    }
}

#[async_trait]
impl RelayConnector for WsConnector {
    async fn connect(&self) -> Result<(RelayConnection, RelayInbox)> {
        RelayConnection::connect(&self.url).await
    }
}

// ============================================================================
// HTTP API Client
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReceipt {
    pub recording_id: String,
    pub file_name: String,
    pub size: u64,
}

pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            base_url: config.http_url(),
        })
    }

    pub async fn upload_recording(
        &self,
        path: &str,
        field_name: &str,
        file_name: &str,
        mime_type: &str,
        data: Vec<u8>,
    ) -> Result<UploadReceipt> {
        let part = reqwest::multipart::Part::bytes(data)
            .file_name(file_name.to_string())
            .mime_str(mime_type)
            .map_err(|e| Error::Network(e.to_string()))?;

        let form = reqwest::multipart::Form::new().part(field_name.to_string(), part);

        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .multipart(form)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Error::Upload(format!("server responded {}", resp.status())));
        }

        let receipt: UploadReceipt = resp.json().await?;
        Ok(receipt)
    }

    pub async fn check_health(&self) -> Result<bool> {
        let resp = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await;

        match resp {
            Ok(r) => Ok(r.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}
