//! Fan-out of dashboard events to the live sessions of one user.
//!
//! Every user gets one tokio broadcast channel. A delivery carries the
//! pre-encoded frame plus a recipient rule, and each session's receiver
//! drops deliveries the rule excludes it from. Delivery is best-effort: a
//! lagging receiver skips events and catches up on its next authenticate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, ServerMessage};

/// Which sessions of a group receive a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipients {
    All,
    /// Everyone but the originating session
    AllExcept(Uuid),
}

impl Recipients {
    pub fn includes(&self, session_id: Uuid) -> bool {
        match self {
            Recipients::All => true,
            Recipients::AllExcept(excluded) => *excluded != session_id,
        }
    }
}

/// One encoded frame in flight to a group.
#[derive(Debug)]
pub struct Delivery {
    pub recipients: Recipients,
    pub frame: Arc<Vec<u8>>,
}

impl Delivery {
    /// The frame for `session_id`, if the recipient rule includes it.
    pub fn frame_for(&self, session_id: Uuid) -> Option<Arc<Vec<u8>>> {
        self.recipients
            .includes(session_id)
            .then(|| self.frame.clone())
    }
}

/// A session registered in a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPeer {
    pub session_id: Uuid,
    pub device_id: String,
    pub device_name: Option<String>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    /// Users with at least one live session
    pub active_groups: usize,
    pub active_peers: usize,
    /// Notifications that found a group, since startup
    pub messages_sent: u64,
}

/// The broadcast group of a single user.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Delivery>>,
    peers: RwLock<HashMap<Uuid, SessionPeer>>,
}

impl BroadcastGroup {
    /// `capacity` is how many deliveries a receiver may fall behind before
    /// it starts skipping.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a session and return its receiver.
    ///
    /// Registering an already present session replaces its device binding.
    pub async fn add_peer(&self, peer: SessionPeer) -> broadcast::Receiver<Arc<Delivery>> {
        let mut peers = self.peers.write().await;
        peers.insert(peer.session_id, peer);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, session_id: &Uuid) -> Option<SessionPeer> {
        self.peers.write().await.remove(session_id)
    }

    /// Encode once and send to every receiver. Returns how many receivers
    /// the delivery reached, before recipient filtering.
    pub fn broadcast(
        &self,
        recipients: Recipients,
        msg: &ServerMessage,
    ) -> Result<usize, ProtocolError> {
        let frame = Arc::new(msg.encode()?);
        Ok(self.broadcast_raw(recipients, frame))
    }

    /// Send a pre-encoded frame.
    pub fn broadcast_raw(&self, recipients: Recipients, frame: Arc<Vec<u8>>) -> usize {
        let delivery = Arc::new(Delivery { recipients, frame });
        self.sender.send(delivery).unwrap_or(0)
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }
}

/// Maps user ids to their broadcast groups.
///
/// Groups are created on first join and dropped once empty. Joining and
/// leaving both run under the map's write lock, so a group is never
/// dropped between a lookup and the peer registration that follows it.
pub struct Broadcaster {
    groups: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    default_capacity: usize,
    messages_sent: AtomicU64,
}

impl Broadcaster {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            default_capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Register `peer` in the user's group, creating the group if needed.
    pub async fn join(
        &self,
        user_id: &str,
        peer: SessionPeer,
    ) -> broadcast::Receiver<Arc<Delivery>> {
        let mut groups = self.groups.write().await;
        let group = groups
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)))
            .clone();
        group.add_peer(peer).await
    }

    /// Remove a session from the user's group and drop the group once it
    /// is empty. Returns whether the session was registered.
    pub async fn leave(&self, user_id: &str, session_id: &Uuid) -> bool {
        let mut groups = self.groups.write().await;
        let Some(group) = groups.get(user_id).cloned() else {
            return false;
        };

        let removed = group.remove_peer(session_id).await.is_some();
        if group.peer_count().await == 0 {
            groups.remove(user_id);
        }
        removed
    }

    pub async fn group(&self, user_id: &str) -> Option<Arc<BroadcastGroup>> {
        self.groups.read().await.get(user_id).cloned()
    }

    /// Send `msg` to the user's live sessions. A user with no live session
    /// is a no-op.
    pub async fn notify(
        &self,
        user_id: &str,
        recipients: Recipients,
        msg: &ServerMessage,
    ) -> Result<usize, ProtocolError> {
        match self.group(user_id).await {
            Some(group) => {
                let reached = group.broadcast(recipients, msg)?;
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                Ok(reached)
            }
            None => Ok(0),
        }
    }

    pub async fn group_count(&self) -> usize {
        self.groups.read().await.len()
    }

    pub async fn stats(&self) -> BroadcastStats {
        let groups = self.groups.read().await;
        let mut active_peers = 0;
        for group in groups.values() {
            active_peers += group.peer_count().await;
        }
        BroadcastStats {
            active_groups: groups.len(),
            active_peers,
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
        }
    }
}
