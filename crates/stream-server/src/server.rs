//! WebSocket notification server
//!
//! Every accepted connection becomes a session that subscribes to the
//! update publisher and forwards each event as a text frame. Sessions are
//! independent: a slow or broken client only loses its own events.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use fx_core::{Notification, StreamSettings, UPDATE_EVENT_NAME};
use fx_rate_stream::{Subscription, UpdatePublisher};

/// Server configuration
#[derive(Debug, Clone)]
pub struct NotifyServerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub handshake_timeout: Duration,
}

impl Default for NotifyServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            max_connections: 1000,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl NotifyServerConfig {
    pub fn from_settings(settings: &StreamSettings) -> Self {
        Self {
            host: settings.notify_host.clone(),
            port: settings.notify_port,
            ..Default::default()
        }
    }
}

/// Why a session ended abnormally
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("websocket handshake timed out")]
    HandshakeTimeout,

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("failed to encode update: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Decrements the live session count when a session task ends
struct SessionGuard(Arc<AtomicUsize>);

impl SessionGuard {
    fn new(active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self(active)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// WebSocket push server
pub struct NotifyServer {
    config: NotifyServerConfig,
    publisher: Arc<UpdatePublisher>,
    active: Arc<AtomicUsize>,
}

impl NotifyServer {
    pub fn new(config: NotifyServerConfig, publisher: Arc<UpdatePublisher>) -> Self {
        Self {
            config,
            publisher,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn publisher(&self) -> Arc<UpdatePublisher> {
        Arc::clone(&self.publisher)
    }

    /// Get server address
    pub fn address(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    /// Sessions currently open
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Bind the listening socket
    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        let addr: SocketAddr = self.address().parse()?;
        let listener = TcpListener::bind(addr).await?;
        Ok(listener)
    }

    /// Bind and serve until shutdown
    pub async fn start_with_shutdown(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Accept sessions on `listener` until shutdown
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Notification server listening");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let accepted = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                accepted = listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            if self.active_sessions() >= self.config.max_connections {
                warn!(%peer, max = self.config.max_connections, "Connection limit reached, rejecting");
                continue;
            }

            let guard = SessionGuard::new(Arc::clone(&self.active));
            let publisher = Arc::clone(&self.publisher);
            let shutdown = shutdown.clone();
            let handshake_timeout = self.config.handshake_timeout;

            tokio::spawn(async move {
                let _guard = guard;
                let session_id = Uuid::new_v4();
                debug!(%session_id, %peer, "Session opened");

                match run_session(stream, publisher, shutdown, handshake_timeout).await {
                    Ok(sent) => info!(%session_id, %peer, sent, "Session closed"),
                    Err(e) => warn!(%session_id, %peer, error = %e, "Session ended with error"),
                }
            });
        }

        info!("Notification server stopped");
        Ok(())
    }
}

/// Handshake, then forward updates until the client leaves or shutdown.
/// Returns the number of frames sent.
async fn run_session(
    stream: TcpStream,
    publisher: Arc<UpdatePublisher>,
    mut shutdown: watch::Receiver<bool>,
    handshake_timeout: Duration,
) -> Result<u64, SessionError> {
    let ws = tokio::time::timeout(handshake_timeout, accept_async(stream))
        .await
        .map_err(|_| SessionError::HandshakeTimeout)??;

    let mut subscription = publisher.subscribe();
    let result = forward(ws, &mut subscription, &mut shutdown).await;
    publisher.unsubscribe(subscription.id());

    if subscription.dropped() > 0 {
        debug!(dropped = subscription.dropped(), "Session fell behind");
    }
    result
}

async fn forward(
    ws: WebSocketStream<TcpStream>,
    subscription: &mut Subscription,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<u64, SessionError> {
    let (mut sink, mut source) = ws.split();
    let mut sent = 0u64;

    loop {
        if *shutdown.borrow() {
            let _ = sink.send(Message::Close(None)).await;
            return Ok(sent);
        }

        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(sent);
                }
            }
            incoming = source.next() => match incoming {
                None | Some(Ok(Message::Close(_))) => return Ok(sent),
                // pings are answered by tungstenite on the next write
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },
            event = subscription.recv() => match event {
                Some(event) => {
                    let frame = Notification::new(UPDATE_EVENT_NAME, &*event).to_json()?;
                    sink.send(Message::Text(frame)).await?;
                    sent += 1;
                }
                None => return Ok(sent),
            },
        }
    }
}

/// Builder for server configuration
pub struct NotifyServerBuilder {
    config: NotifyServerConfig,
    publisher: Option<Arc<UpdatePublisher>>,
}

impl NotifyServerBuilder {
    pub fn new() -> Self {
        Self {
            config: NotifyServerConfig::default(),
            publisher: None,
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    pub fn publisher(mut self, publisher: Arc<UpdatePublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn build(self) -> NotifyServer {
        let publisher = self
            .publisher
            .unwrap_or_else(|| Arc::new(UpdatePublisher::default()));
        NotifyServer::new(self.config, publisher)
    }
}

impl Default for NotifyServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
