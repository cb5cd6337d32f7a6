//! WebSocket sync server with per-user session routing.
//!
//! Architecture:
//! ```text
//! Laptop ──┐                                  ┌── DashboardStore
//!           ├── SyncSession ── SyncEngine ────┤
//! Phone  ──┘        │                         └── DeviceRegistry
//!                   │
//!                   └── Broadcaster ── BroadcastGroup (user_id)
//!                                         │
//!                              ┌──────────┼──────────┐
//!                              ▼          ▼          ▼
//!                           Laptop      Phone     Tablet
//! ```
//!
//! The bearer token on the upgrade request establishes the user. A
//! connection without a valid token is still upgraded, but its session
//! stays unauthenticated.

use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::auth::{bearer_token, Authenticator, StaticTokenAuthenticator};
use crate::broadcast::{BroadcastStats, Broadcaster};
use crate::engine::SyncEngine;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::{Outbound, SyncSession};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per user group
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub malformed_messages: u64,
    /// Live fan-out groups, read when the stats are taken
    pub broadcast: BroadcastStats,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    engine: Arc<SyncEngine>,
    broadcaster: Arc<Broadcaster>,
    authenticator: Arc<dyn Authenticator>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(
        config: ServerConfig,
        engine: Arc<SyncEngine>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        let broadcaster = Arc::new(Broadcaster::new(config.broadcast_capacity));
        Self {
            config,
            engine,
            broadcaster,
            authenticator,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// In-memory engine, no known tokens.
    pub fn with_defaults() -> Self {
        Self::new(
            ServerConfig::default(),
            Arc::new(SyncEngine::in_memory()),
            Arc::new(StaticTokenAuthenticator::new()),
        )
    }

    /// Bind the configured address and serve until an accept error.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Sync server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let engine = self.engine.clone();
            let broadcaster = self.broadcaster.clone();
            let authenticator = self.authenticator.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, engine, broadcaster, authenticator, stats)
                        .await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        engine: Arc<SyncEngine>,
        broadcaster: Arc<Broadcaster>,
        authenticator: Arc<dyn Authenticator>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), BoxError> {
        let mut token: Option<String> = None;
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                token = req
                    .headers()
                    .get(AUTHORIZATION)
                    .and_then(|value| value.to_str().ok())
                    .and_then(bearer_token)
                    .map(str::to_string);
                Ok(resp)
            },
        )
        .await?;

        let user_id = token.as_deref().and_then(|t| authenticator.verify(t));
        match &user_id {
            Some(user) => log::info!("WebSocket connection from {addr} for {user}"),
            None => log::info!("WebSocket connection from {addr} without valid credentials"),
        }

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut session = SyncSession::new(user_id, engine, broadcaster);
        let result = Self::pump(ws_stream, addr, &mut session, &stats).await;

        // Any handler that started has completed, so its writes are
        // already acked or broadcast.
        session.close().await;
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("Connection closed from {addr}");

        result
    }

    /// Move frames between the socket and the session until either side ends.
    async fn pump(
        ws_stream: WebSocketStream<TcpStream>,
        addr: SocketAddr,
        session: &mut SyncSession,
        stats: &RwLock<ServerStats>,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }

                            let replies = match ClientMessage::decode(&data) {
                                Ok(client_msg) => {
                                    log::debug!(
                                        "{:?} from {addr} (session {})",
                                        client_msg.msg_type(),
                                        session.session_id()
                                    );
                                    session.handle(client_msg).await
                                }
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    stats.write().await.malformed_messages += 1;
                                    vec![ServerMessage::SyncError {
                                        message: format!("Malformed message: {e}"),
                                    }]
                                }
                            };

                            for reply in replies {
                                ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => break,

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing broadcast message
                out = session.next_outbound() => {
                    match out {
                        Outbound::Frame(frame) => {
                            ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
                        }
                        Outbound::Lagged(n) => {
                            log::warn!("Session {} lagged by {n} messages", session.session_id());
                        }
                        Outbound::Closed => break,
                    }
                }
            }
        }

        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.broadcast = self.broadcaster.stats().await;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Broadcaster shared with the request surface.
    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }
}
