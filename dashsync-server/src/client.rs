//! WebSocket sync client for a single device.
//!
//! Provides:
//! - Connection lifecycle (connect with bearer token, authenticate, disconnect)
//! - Version tracking against the last acknowledged server version
//! - Last-write retention: while not authenticated only the newest unsent
//!   update is kept, and it goes out right after the next `authenticated`

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use dashsync_core::{ConflictReport, DashboardData, Resolution, ResolutionData};

use crate::protocol::{ClientMessage, DashboardSyncedBody, ProtocolError, ServerMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Socket open, `authenticate` sent but not answered
    Connected,
    Authenticated,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Handshake accepted
    Authenticated { current_version: u64 },
    /// Our update was applied
    Synced { version: u64, synced_at: u64 },
    /// Another device (or a resolution) changed the dashboard
    RemoteUpdate(DashboardSyncedBody),
    /// Our update was rejected; the user has to pick a resolution
    Conflict(ConflictReport),
    /// `auth_error` or `sync_error` from the server
    Error(String),
    /// Connection lost
    Disconnected,
}

/// An update waiting for the next authenticated connection.
#[derive(Debug, Clone)]
struct PendingUpdate {
    data: DashboardData,
    /// Version the edit was made against; 0 when nothing was known yet
    base_version: u64,
}

/// State shared with the reader task.
#[derive(Clone)]
struct Shared {
    device_id: String,
    state: Arc<RwLock<ConnectionState>>,
    /// Bumped by every connect and disconnect. A reader task only touches
    /// `state` while its own generation is the current one.
    generation: Arc<AtomicU64>,
    known_version: Arc<RwLock<u64>>,
    pending: Arc<Mutex<Option<PendingUpdate>>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

/// The sync client.
pub struct SyncClient {
    device_name: Option<String>,
    token: String,
    server_url: String,
    shared: Shared,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
}

impl SyncClient {
    pub fn new(
        device_id: impl Into<String>,
        token: impl Into<String>,
        server_url: impl Into<String>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            device_name: None,
            token: token.into(),
            server_url: server_url.into(),
            shared: Shared {
                device_id: device_id.into(),
                state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
                generation: Arc::new(AtomicU64::new(0)),
                known_version: Arc::new(RwLock::new(0)),
                pending: Arc::new(Mutex::new(None)),
                event_tx,
            },
            outgoing_tx: None,
            event_rx: Some(event_rx),
        }
    }

    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = Some(name.into());
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Open the socket and send `authenticate`.
    ///
    /// Spawns a writer task and a reader task. Authentication completes
    /// asynchronously and is reported as [`SyncEvent::Authenticated`].
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        let (generation, _) = self.shared.begin(ConnectionState::Connecting).await;

        let ws_stream = match self.open().await {
            Ok(ws) => ws,
            Err(e) => {
                *self.shared.state.write().await = ConnectionState::Disconnected;
                return Err(e);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            // Every sender dropped: close politely
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        let hello = ClientMessage::Authenticate {
            device_id: self.shared.device_id.clone(),
            device_name: self.device_name.clone(),
        }
        .encode(&self.shared.device_id)?;
        out_tx
            .send(hello)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        *self.shared.state.write().await = ConnectionState::Connected;
        let out_weak = out_tx.downgrade();
        self.outgoing_tx = Some(out_tx);

        // Reader task: turn server frames into events. It only holds a weak
        // handle so that `disconnect` can shut the writer down.
        let shared = self.shared.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                if !shared.is_current(generation) {
                    break;
                }
                match msg {
                    Ok(Message::Binary(data)) => match ServerMessage::decode(&data) {
                        Ok(server_msg) => {
                            let Some(out_tx) = out_weak.upgrade() else {
                                break;
                            };
                            shared.on_message(server_msg, &out_tx).await;
                        }
                        Err(e) => log::warn!("Undecodable frame from server: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            shared.connection_lost(generation).await;
        });

        Ok(())
    }

    async fn open(
        &self,
    ) -> Result<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        ProtocolError,
    > {
        let mut request = self
            .server_url
            .as_str()
            .into_client_request()
            .map_err(|e| ProtocolError::Handshake(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|e| ProtocolError::Handshake(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ProtocolError::Handshake(e.to_string()))?;
        Ok(ws_stream)
    }

    /// Submit new content against the last known version.
    ///
    /// When the session is not authenticated the update replaces any
    /// earlier unsent one.
    pub async fn submit_update(&self, data: DashboardData) -> Result<(), ProtocolError> {
        let base_version = *self.shared.known_version.read().await;
        let authenticated = *self.shared.state.read().await == ConnectionState::Authenticated;

        if authenticated {
            if let Some(tx) = &self.outgoing_tx {
                let frame = ClientMessage::DashboardUpdate {
                    data: data.clone(),
                    version: base_version,
                }
                .encode(&self.shared.device_id)?;
                if tx.send(frame).await.is_ok() {
                    return Ok(());
                }
            }
        }

        *self.shared.pending.lock().await = Some(PendingUpdate { data, base_version });
        Ok(())
    }

    /// Answer a [`SyncEvent::Conflict`].
    pub async fn resolve_conflict(
        &self,
        resolution: Resolution,
        data: ResolutionData,
    ) -> Result<(), ProtocolError> {
        if *self.shared.state.read().await != ConnectionState::Authenticated {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.send(ClientMessage::ResolveConflict { resolution, data })
            .await
    }

    /// Send a ping to the server.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Ping).await
    }

    async fn send(&self, msg: ClientMessage) -> Result<(), ProtocolError> {
        let frame = msg.encode(&self.shared.device_id)?;
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(frame)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Drop the outgoing channel; the writer task then sends a close frame.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        let (_, previous) = self.shared.begin(ConnectionState::Disconnected).await;
        if previous != ConnectionState::Disconnected {
            let _ = self.shared.event_tx.send(SyncEvent::Disconnected).await;
        }
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    /// Last version the server acknowledged or announced.
    pub async fn known_version(&self) -> u64 {
        *self.shared.known_version.read().await
    }

    /// Whether an update is waiting for the next authentication.
    pub async fn has_pending(&self) -> bool {
        self.shared.pending.lock().await.is_some()
    }

    pub fn device_id(&self) -> &str {
        &self.shared.device_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

impl Shared {
    /// Start a new generation in `state`. Returns the generation and the
    /// state it replaced.
    async fn begin(&self, state: ConnectionState) -> (u64, ConnectionState) {
        let mut current = self.state.write().await;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = std::mem::replace(&mut *current, state);
        (generation, previous)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// The socket of `generation` closed. Returns false, and changes
    /// nothing, when a newer connect or a disconnect already took over.
    async fn connection_lost(&self, generation: u64) -> bool {
        {
            let mut state = self.state.write().await;
            if !self.is_current(generation) {
                log::debug!("Ignoring close of superseded connection {generation}");
                return false;
            }
            *state = ConnectionState::Disconnected;
        }
        let _ = self.event_tx.send(SyncEvent::Disconnected).await;
        true
    }

    async fn on_message(&self, msg: ServerMessage, out_tx: &mpsc::Sender<Vec<u8>>) {
        let event = match msg {
            ServerMessage::Authenticated { current_version } => {
                *self.known_version.write().await = current_version;
                *self.state.write().await = ConnectionState::Authenticated;
                self.flush_pending(current_version, out_tx).await;
                SyncEvent::Authenticated { current_version }
            }
            ServerMessage::SyncSuccess { version, synced_at } => {
                *self.known_version.write().await = version;
                SyncEvent::Synced { version, synced_at }
            }
            ServerMessage::DashboardSynced(body) => {
                *self.known_version.write().await = body.version;
                SyncEvent::RemoteUpdate(body)
            }
            ServerMessage::SyncConflict(report) => SyncEvent::Conflict(report),
            ServerMessage::AuthError { message } | ServerMessage::SyncError { message } => {
                SyncEvent::Error(message)
            }
            ServerMessage::Pong => return,
        };
        let _ = self.event_tx.send(event).await;
    }

    async fn flush_pending(&self, current_version: u64, out_tx: &mpsc::Sender<Vec<u8>>) {
        let Some(pending) = self.pending.lock().await.take() else {
            return;
        };
        let version = if pending.base_version == 0 {
            current_version
        } else {
            pending.base_version
        };
        log::info!("Sending retained update for {} at v{version}", self.device_id);

        let msg = ClientMessage::DashboardUpdate {
            data: pending.data,
            version,
        };
        match msg.encode(&self.device_id) {
            Ok(frame) => {
                let _ = out_tx.send(frame).await;
            }
            Err(e) => log::error!("Failed to encode retained update: {e}"),
        }
    }
}
