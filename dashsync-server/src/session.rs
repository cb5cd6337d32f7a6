//! Per-connection session state machine.
//!
//! ```text
//!                 authenticate ok
//! Unauthenticated ───────────────► Authenticated ──┐
//!      │  ▲                              │         │ authenticate (rebind)
//!      │  └── auth_error                 │ ◄───────┘
//!      │                                 │
//!      └──────────── close ──────────────┴──────► Closed
//! ```
//!
//! The user id comes from the connection handshake. `authenticate` only
//! binds a device to it. A session holds no dashboard state of its own.

use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use dashsync_core::{DashboardData, Resolution, ResolutionData, SyncError};

use crate::broadcast::{Broadcaster, Delivery, Recipients, SessionPeer};
use crate::engine::{SyncEngine, UpdateOutcome};
use crate::protocol::{ClientMessage, DashboardSyncedBody, ServerMessage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated {
        device_id: String,
        device_name: Option<String>,
    },
    Closed,
}

/// What the session's broadcast receiver produced.
#[derive(Debug)]
pub enum Outbound {
    /// Encoded frame addressed to this session
    Frame(Arc<Vec<u8>>),
    /// Receiver fell behind and skipped this many deliveries
    Lagged(u64),
    /// The group's channel is gone
    Closed,
}

pub struct SyncSession {
    session_id: Uuid,
    /// Identity established by the handshake
    user_id: Option<String>,
    state: SessionState,
    engine: Arc<SyncEngine>,
    broadcaster: Arc<Broadcaster>,
    receiver: Option<broadcast::Receiver<Arc<Delivery>>>,
}

impl SyncSession {
    pub fn new(
        user_id: Option<String>,
        engine: Arc<SyncEngine>,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            user_id,
            state: SessionState::Unauthenticated,
            engine,
            broadcaster,
            receiver: None,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.state, SessionState::Authenticated { .. })
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Handle one client message and return the replies for this session.
    ///
    /// Events for other sessions go through the broadcaster.
    pub async fn handle(&mut self, msg: ClientMessage) -> Vec<ServerMessage> {
        if self.is_closed() {
            log::debug!("Session {} closed, ignoring {:?}", self.session_id, msg.msg_type());
            return Vec::new();
        }

        match msg {
            ClientMessage::Authenticate {
                device_id,
                device_name,
            } => vec![self.authenticate(device_id, device_name).await],
            ClientMessage::Ping => vec![ServerMessage::Pong],
            ClientMessage::DashboardUpdate { data, version } => {
                match self.dashboard_update(data, version).await {
                    Ok(reply) => vec![reply],
                    Err(e) => vec![sync_error(&e)],
                }
            }
            ClientMessage::ResolveConflict { resolution, data } => {
                match self.resolve_conflict(resolution, &data).await {
                    // The submitter hears about it through its own receiver
                    Ok(()) => Vec::new(),
                    Err(e) => vec![sync_error(&e)],
                }
            }
        }
    }

    async fn authenticate(&mut self, device_id: String, device_name: Option<String>) -> ServerMessage {
        let Some(user_id) = self.user_id.clone() else {
            log::debug!("Session {} tried to authenticate without identity", self.session_id);
            return ServerMessage::AuthError {
                message: "Authentication required".into(),
            };
        };

        // Subscribe before loading so no accepted write falls between the
        // version reported here and the first delivery.
        let was_authenticated = self.is_authenticated();
        let rx = self
            .broadcaster
            .join(
                &user_id,
                SessionPeer {
                    session_id: self.session_id,
                    device_id: device_id.clone(),
                    device_name: device_name.clone(),
                },
            )
            .await;

        let dashboard = match self
            .engine
            .authenticate(&user_id, &device_id, device_name.as_deref())
            .await
        {
            Ok(dashboard) => dashboard,
            Err(e) => {
                if !was_authenticated {
                    self.broadcaster.leave(&user_id, &self.session_id).await;
                }
                return ServerMessage::AuthError {
                    message: e.to_string(),
                };
            }
        };

        self.receiver = Some(rx);
        self.state = SessionState::Authenticated {
            device_id,
            device_name,
        };

        ServerMessage::Authenticated {
            current_version: dashboard.version,
        }
    }

    async fn dashboard_update(
        &mut self,
        data: DashboardData,
        version: u64,
    ) -> Result<ServerMessage, SyncError> {
        let (user_id, device_id, device_name) = self.bound()?;

        let outcome = self
            .engine
            .submit_update(&user_id, &device_id, device_name.as_deref(), data, version)
            .await?;

        match outcome {
            UpdateOutcome::Accepted {
                version,
                synced_at,
                data,
            } => {
                let synced = ServerMessage::DashboardSynced(DashboardSyncedBody {
                    data,
                    version,
                    updated_by: Some(device_id),
                    conflict_resolved: false,
                });
                self.notify(&user_id, Recipients::AllExcept(self.session_id), &synced)
                    .await;
                Ok(ServerMessage::SyncSuccess { version, synced_at })
            }
            UpdateOutcome::Conflict(report) => Ok(ServerMessage::SyncConflict(report)),
        }
    }

    async fn resolve_conflict(
        &mut self,
        resolution: Resolution,
        data: &ResolutionData,
    ) -> Result<(), SyncError> {
        let (user_id, device_id, device_name) = self.bound()?;

        let dashboard = self
            .engine
            .resolve_conflict(&user_id, &device_id, device_name.as_deref(), resolution, data)
            .await?;

        let synced = ServerMessage::DashboardSynced(DashboardSyncedBody {
            data: dashboard.data(),
            version: dashboard.version,
            updated_by: Some(device_id),
            conflict_resolved: true,
        });
        self.notify(&user_id, Recipients::All, &synced).await;
        Ok(())
    }

    /// Identity and device binding, if authenticated.
    fn bound(&self) -> Result<(String, String, Option<String>), SyncError> {
        match (&self.state, &self.user_id) {
            (
                SessionState::Authenticated {
                    device_id,
                    device_name,
                },
                Some(user_id),
            ) => Ok((user_id.clone(), device_id.clone(), device_name.clone())),
            _ => Err(SyncError::Unauthorized("Not authenticated".into())),
        }
    }

    async fn notify(&self, user_id: &str, recipients: Recipients, msg: &ServerMessage) {
        if let Err(e) = self.broadcaster.notify(user_id, recipients, msg).await {
            log::warn!("Broadcast to {user_id} failed: {e}");
        }
    }

    /// Wait for the next frame addressed to this session.
    ///
    /// Never resolves before the session has authenticated.
    pub async fn next_outbound(&mut self) -> Outbound {
        let session_id = self.session_id;
        let Some(rx) = self.receiver.as_mut() else {
            return std::future::pending().await;
        };

        loop {
            match rx.recv().await {
                Ok(delivery) => {
                    if let Some(frame) = delivery.frame_for(session_id) {
                        return Outbound::Frame(frame);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => return Outbound::Lagged(n),
                Err(broadcast::error::RecvError::Closed) => return Outbound::Closed,
            }
        }
    }

    /// Leave the broadcast group. The device record is kept.
    pub async fn close(&mut self) {
        if self.is_closed() {
            return;
        }

        if let (SessionState::Authenticated { device_id, .. }, Some(user_id)) =
            (&self.state, &self.user_id)
        {
            self.broadcaster.leave(user_id, &self.session_id).await;
            log::info!("Device {device_id} of {user_id} disconnected");
        }

        self.receiver = None;
        self.state = SessionState::Closed;
    }
}

fn sync_error(e: &SyncError) -> ServerMessage {
    ServerMessage::SyncError {
        message: e.to_string(),
    }
}
