//! # dashsync-server - Multi-device dashboard sync over WebSocket
//!
//! Keeps one authoritative dashboard per user and lets any number of
//! devices edit it with optimistic concurrency.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per device)│     Binary Proto    │ (central)   │
//! └─────────────┘                     └──────┬──────┘
//!                                            │ SyncSession per connection
//!                                            ▼
//!                    ┌────────────────┐   ┌─────────────┐   ┌────────────────┐
//!                    │DashboardService│ ─►│ SyncEngine  │ ─►│ DashboardStore │
//!                    │ (request API)  │   │ (arbiter,   │   │ DeviceRegistry │
//!                    └───────┬────────┘   │  backups)   │   └────────────────┘
//!                            │            └─────────────┘
//!                            ▼
//!                    ┌────────────────┐
//!                    │  Broadcaster   │ one group per user
//!                    └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Binary wire protocol (bincode envelope, JSON bodies)
//! - [`storage`] - Versioned store and device registry (memory, RocksDB)
//! - [`engine`] - Arbitration, backup cadence and per-user serialization
//! - [`broadcast`] - Per-user fan-out with session exclusion
//! - [`session`] - Per-connection state machine
//! - [`server`] - WebSocket sync server
//! - [`service`] - Request/response operations
//! - [`client`] - Device-side sync client
//! - [`auth`] - Bearer tokens and public profiles

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod engine;
pub mod protocol;
pub mod server;
pub mod service;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use auth::{
    bearer_token, Authenticator, StaticTokenAuthenticator, StaticUserDirectory, UserDirectory,
    UserProfile,
};
pub use broadcast::{BroadcastGroup, BroadcastStats, Broadcaster, Recipients, SessionPeer};
pub use client::{ConnectionState, SyncClient, SyncEvent};
pub use engine::{EngineConfig, SyncEngine, UpdateOutcome};
pub use protocol::{ClientMessage, MessageType, ProtocolError, ServerMessage, SyncMessage};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use service::{DashboardService, DeviceListing, PublicDashboard, DEFAULT_BACKUP_LIMIT};
pub use session::{Outbound, SessionState, SyncSession};
pub use storage::{
    CasResult, DashboardStore, DeviceRegistry, MemoryStore, RocksStore, StoreConfig, StoreError,
};
