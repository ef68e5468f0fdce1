use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::UserId,
    protocol::{ClientSignal, ServerEvent},
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc, RwLock},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};
use url::Url;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("signaling connection is not open")]
    NotConnected,
    #[error("failed to encode signal: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Live signaling link to the relay, injected into the call controller.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn is_connected(&self) -> bool;
    async fn send(&self, signal: ClientSignal) -> Result<(), TransportError>;
    fn subscribe(&self) -> broadcast::Receiver<ServerEvent>;
}

/// One websocket to `/ws`. Inbound events go to the supplied broadcast sender.
pub struct WsSignalingConnection {
    outbound: mpsc::UnboundedSender<Message>,
    connected: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl WsSignalingConnection {
    pub async fn connect(
        server_url: &str,
        user_id: UserId,
        events: broadcast::Sender<ServerEvent>,
    ) -> Result<Self> {
        let ws_url = signaling_url(server_url, user_id)?;
        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let connected = Arc::new(AtomicBool::new(true));

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let writer_connected = Arc::clone(&connected);
        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if let Err(err) = ws_writer.send(msg).await {
                    warn!(%err, "signaling: websocket write failed");
                    break;
                }
            }
            writer_connected.store(false, Ordering::SeqCst);
            let _ = ws_writer.close().await;
        });

        let reader_connected = Arc::clone(&connected);
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            let _ = events.send(event);
                        }
                        Err(err) => warn!(%err, "signaling: invalid server event"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(%err, "signaling: websocket read failed");
                        break;
                    }
                }
            }
            reader_connected.store(false, Ordering::SeqCst);
        });

        info!(user_id = user_id.0, url = %ws_url, "signaling: connected");
        Ok(Self {
            outbound,
            connected,
            reader,
            writer,
        })
    }

    pub fn is_open(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }

    pub fn send(&self, signal: &ClientSignal) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        let text = serde_json::to_string(signal)?;
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| TransportError::NotConnected)
    }

    pub fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.outbound.send(Message::Close(None));
        self.reader.abort();
    }
}

impl Drop for WsSignalingConnection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Owns the current websocket and keeps subscribers across reconnects.
pub struct ConnectionManager {
    server_url: String,
    user_id: UserId,
    current: RwLock<Option<WsSignalingConnection>>,
    events: broadcast::Sender<ServerEvent>,
}

impl ConnectionManager {
    pub fn new(server_url: impl Into<String>, user_id: UserId) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            server_url: server_url.into(),
            user_id,
            current: RwLock::new(None),
            events,
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Opens a websocket unless a live one exists.
    pub async fn connect(&self) -> Result<()> {
        let mut current = self.current.write().await;
        if current.as_ref().is_some_and(WsSignalingConnection::is_open) {
            return Ok(());
        }
        let connection =
            WsSignalingConnection::connect(&self.server_url, self.user_id, self.events.clone())
                .await?;
        if let Some(stale) = current.replace(connection) {
            stale.close();
        }
        Ok(())
    }

    pub async fn disconnect(&self) {
        if let Some(connection) = self.current.write().await.take() {
            connection.close();
            info!(user_id = self.user_id.0, "signaling: disconnected");
        }
    }
}

#[async_trait]
impl SignalingTransport for ConnectionManager {
    async fn is_connected(&self) -> bool {
        self.current
            .read()
            .await
            .as_ref()
            .is_some_and(WsSignalingConnection::is_open)
    }

    async fn send(&self, signal: ClientSignal) -> Result<(), TransportError> {
        match self.current.read().await.as_ref() {
            Some(connection) => connection.send(&signal),
            None => Err(TransportError::NotConnected),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }
}

/// `http(s)://host[:port]` to `ws(s)://host[:port]/ws?user_id=..`.
pub fn signaling_url(server_url: &str, user_id: UserId) -> Result<Url> {
    let mut url =
        Url::parse(server_url).with_context(|| format!("invalid server url: {server_url}"))?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        "ws" | "wss" => "",
        other => return Err(anyhow!("unsupported server url scheme '{other}'")),
    };
    if !scheme.is_empty() {
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("cannot switch {server_url} to {scheme}"))?;
    }
    url.set_path("/ws");
    url.query_pairs_mut()
        .clear()
        .append_pair("user_id", &user_id.0.to_string());
    Ok(url)
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
