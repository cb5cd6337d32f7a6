//! Wire protocol for device sessions.
//!
//! Every WebSocket binary frame carries one bincode-encoded envelope:
//! ```text
//! ┌──────────┬────────────────┬───────────────────────────┐
//! │ msg_type │ device_id      │ payload                   │
//! │ 1 byte   │ len-prefixed   │ len-prefixed JSON body    │
//! └──────────┴────────────────┴───────────────────────────┘
//! ```
//!
//! Bodies are camelCase JSON because widget payloads are schemaless and
//! bincode cannot decode self-describing values.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use dashsync_core::{ConflictReport, DashboardData, Resolution, ResolutionData};

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Device binds the session to a device id
    Authenticate = 1,
    /// Handshake accepted, carries the current version
    Authenticated = 2,
    /// Handshake refused
    AuthError = 3,
    /// Device submits new content against a version
    DashboardUpdate = 4,
    /// Update accepted (to the submitter)
    SyncSuccess = 5,
    /// New authoritative content (to siblings, or everyone after a resolution)
    DashboardSynced = 6,
    /// Update rejected, both versions attached
    SyncConflict = 7,
    /// Device adjudicates a conflict
    ResolveConflict = 8,
    /// Request failed without changing anything
    SyncError = 9,
    /// Heartbeat ping
    Ping = 10,
    /// Heartbeat pong
    Pong = 11,
}

/// Top-level frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Sending device; empty for server frames
    pub device_id: String,
    /// JSON body (varies by msg_type)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    /// Build a frame with a JSON-encoded body.
    pub fn with_body<T: Serialize>(
        msg_type: MessageType,
        device_id: impl Into<String>,
        body: &T,
    ) -> Result<Self, ProtocolError> {
        let payload =
            serde_json::to_vec(body).map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            msg_type,
            device_id: device_id.into(),
            payload,
        })
    }

    /// Build a frame with no body.
    pub fn empty(msg_type: MessageType, device_id: impl Into<String>) -> Self {
        Self {
            msg_type,
            device_id: device_id.into(),
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the JSON body.
    pub fn body<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateBody {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatedBody {
    pub success: bool,
    pub current_version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardUpdateBody {
    #[serde(flatten)]
    pub data: DashboardData,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSuccessBody {
    pub version: u64,
    pub synced_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSyncedBody {
    #[serde(flatten)]
    pub data: DashboardData,
    pub version: u64,
    /// Device whose update produced this state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
    #[serde(default)]
    pub conflict_resolved: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveConflictBody {
    pub resolution: Resolution,
    #[serde(default)]
    pub data: ResolutionData,
}

/// Messages a device sends.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Authenticate {
        device_id: String,
        device_name: Option<String>,
    },
    DashboardUpdate {
        data: DashboardData,
        version: u64,
    },
    ResolveConflict {
        resolution: Resolution,
        data: ResolutionData,
    },
    Ping,
}

impl ClientMessage {
    pub fn msg_type(&self) -> MessageType {
        match self {
            ClientMessage::Authenticate { .. } => MessageType::Authenticate,
            ClientMessage::DashboardUpdate { .. } => MessageType::DashboardUpdate,
            ClientMessage::ResolveConflict { .. } => MessageType::ResolveConflict,
            ClientMessage::Ping => MessageType::Ping,
        }
    }

    /// Wrap into a frame sent by `device_id`.
    pub fn to_message(&self, device_id: &str) -> Result<SyncMessage, ProtocolError> {
        match self {
            ClientMessage::Authenticate {
                device_id: id,
                device_name,
            } => SyncMessage::with_body(
                MessageType::Authenticate,
                device_id,
                &AuthenticateBody {
                    device_id: id.clone(),
                    device_name: device_name.clone(),
                },
            ),
            ClientMessage::DashboardUpdate { data, version } => SyncMessage::with_body(
                MessageType::DashboardUpdate,
                device_id,
                &DashboardUpdateBody {
                    data: data.clone(),
                    version: *version,
                },
            ),
            ClientMessage::ResolveConflict { resolution, data } => SyncMessage::with_body(
                MessageType::ResolveConflict,
                device_id,
                &ResolveConflictBody {
                    resolution: *resolution,
                    data: data.clone(),
                },
            ),
            ClientMessage::Ping => Ok(SyncMessage::empty(MessageType::Ping, device_id)),
        }
    }

    pub fn encode(&self, device_id: &str) -> Result<Vec<u8>, ProtocolError> {
        self.to_message(device_id)?.encode()
    }

    /// Interpret a frame received from a device.
    pub fn from_message(msg: &SyncMessage) -> Result<Self, ProtocolError> {
        match msg.msg_type {
            MessageType::Authenticate => {
                let body: AuthenticateBody = msg.body()?;
                Ok(ClientMessage::Authenticate {
                    device_id: body.device_id,
                    device_name: body.device_name,
                })
            }
            MessageType::DashboardUpdate => {
                let body: DashboardUpdateBody = msg.body()?;
                Ok(ClientMessage::DashboardUpdate {
                    data: body.data,
                    version: body.version,
                })
            }
            MessageType::ResolveConflict => {
                let body: ResolveConflictBody = msg.body()?;
                Ok(ClientMessage::ResolveConflict {
                    resolution: body.resolution,
                    data: body.data,
                })
            }
            MessageType::Ping => Ok(ClientMessage::Ping),
            other => Err(ProtocolError::UnexpectedMessage(other)),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Self::from_message(&SyncMessage::decode(bytes)?)
    }
}

/// Messages the server sends.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Authenticated { current_version: u64 },
    AuthError { message: String },
    SyncSuccess { version: u64, synced_at: u64 },
    DashboardSynced(DashboardSyncedBody),
    SyncConflict(ConflictReport),
    SyncError { message: String },
    Pong,
}

impl ServerMessage {
    pub fn msg_type(&self) -> MessageType {
        match self {
            ServerMessage::Authenticated { .. } => MessageType::Authenticated,
            ServerMessage::AuthError { .. } => MessageType::AuthError,
            ServerMessage::SyncSuccess { .. } => MessageType::SyncSuccess,
            ServerMessage::DashboardSynced(_) => MessageType::DashboardSynced,
            ServerMessage::SyncConflict(_) => MessageType::SyncConflict,
            ServerMessage::SyncError { .. } => MessageType::SyncError,
            ServerMessage::Pong => MessageType::Pong,
        }
    }

    pub fn to_message(&self) -> Result<SyncMessage, ProtocolError> {
        let msg_type = self.msg_type();
        match self {
            ServerMessage::Authenticated { current_version } => SyncMessage::with_body(
                msg_type,
                "",
                &AuthenticatedBody {
                    success: true,
                    current_version: *current_version,
                },
            ),
            ServerMessage::AuthError { message } | ServerMessage::SyncError { message } => {
                SyncMessage::with_body(
                    msg_type,
                    "",
                    &ErrorBody {
                        message: message.clone(),
                    },
                )
            }
            ServerMessage::SyncSuccess { version, synced_at } => SyncMessage::with_body(
                msg_type,
                "",
                &SyncSuccessBody {
                    version: *version,
                    synced_at: *synced_at,
                },
            ),
            ServerMessage::DashboardSynced(body) => SyncMessage::with_body(msg_type, "", body),
            ServerMessage::SyncConflict(report) => SyncMessage::with_body(msg_type, "", report),
            ServerMessage::Pong => Ok(SyncMessage::empty(msg_type, "")),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        self.to_message()?.encode()
    }

    pub fn from_message(msg: &SyncMessage) -> Result<Self, ProtocolError> {
        match msg.msg_type {
            MessageType::Authenticated => {
                let body: AuthenticatedBody = msg.body()?;
                Ok(ServerMessage::Authenticated {
                    current_version: body.current_version,
                })
            }
            MessageType::AuthError => {
                let body: ErrorBody = msg.body()?;
                Ok(ServerMessage::AuthError {
                    message: body.message,
                })
            }
            MessageType::SyncSuccess => {
                let body: SyncSuccessBody = msg.body()?;
                Ok(ServerMessage::SyncSuccess {
                    version: body.version,
                    synced_at: body.synced_at,
                })
            }
            MessageType::DashboardSynced => Ok(ServerMessage::DashboardSynced(msg.body()?)),
            MessageType::SyncConflict => Ok(ServerMessage::SyncConflict(msg.body()?)),
            MessageType::SyncError => {
                let body: ErrorBody = msg.body()?;
                Ok(ServerMessage::SyncError {
                    message: body.message,
                })
            }
            MessageType::Pong => Ok(ServerMessage::Pong),
            other => Err(ProtocolError::UnexpectedMessage(other)),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Self::from_message(&SyncMessage::decode(bytes)?)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    /// A well-formed frame of a type the receiver never accepts
    UnexpectedMessage(MessageType),
    ConnectionClosed,
    Handshake(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::UnexpectedMessage(t) => write!(f, "Unexpected message type: {t:?}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Handshake(e) => write!(f, "Handshake failed: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
