use parking_lot::RwLock;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::peer::{PeerId, PeerIdentity, PeerState, PeerStatus, Point};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryEvent {
    Added(PeerId),
    Updated(PeerId),
    Removed(PeerId),
}

/// Live view of every nearby peer, shared between the session loop (the
/// only writer) and any number of readers.
///
/// A peer that becomes `Disconnected` is purged together with its position;
/// rediscovery starts over with a fresh `Discovering` entry.
#[derive(Clone)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<PeerId, PeerState>>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Returns `true` if the peer was not known before.
    pub fn upsert_peer(&self, identity: PeerIdentity) -> bool {
        let id = identity.id;
        let inserted = match self.peers.write().entry(id) {
            Entry::Vacant(entry) => {
                entry.insert(PeerState::new(identity));
                true
            }
            Entry::Occupied(_) => false,
        };

        if inserted {
            self.notify(RegistryEvent::Added(id));
        }
        inserted
    }

    pub fn set_status(&self, id: &PeerId, status: PeerStatus) -> bool {
        if status == PeerStatus::Disconnected {
            return self.remove(id).is_some();
        }

        let changed = match self.peers.write().get_mut(id) {
            Some(peer) if peer.status != status => {
                peer.status = status;
                if status != PeerStatus::Connected {
                    peer.position = None;
                }
                true
            }
            _ => false,
        };

        if changed {
            self.notify(RegistryEvent::Updated(*id));
        }
        changed
    }

    /// Ignored unless the peer is known and connected: late updates racing a
    /// disconnect are expected and harmless.
    pub fn set_position(&self, id: &PeerId, point: Point) -> bool {
        let applied = match self.peers.write().get_mut(id) {
            Some(peer) if peer.is_connected() => {
                peer.position = Some(point);
                true
            }
            _ => false,
        };

        if applied {
            self.notify(RegistryEvent::Updated(*id));
        }
        applied
    }

    pub fn set_name(&self, id: &PeerId, name: impl Into<String>) -> bool {
        let name = name.into();
        let changed = match self.peers.write().get_mut(id) {
            Some(peer) if peer.identity.display_name != name => {
                peer.identity.display_name = name;
                true
            }
            _ => false,
        };

        if changed {
            self.notify(RegistryEvent::Updated(*id));
        }
        changed
    }

    pub fn remove(&self, id: &PeerId) -> Option<PeerState> {
        let removed = self.peers.write().remove(id);
        if removed.is_some() {
            self.notify(RegistryEvent::Removed(*id));
        }
        removed
    }

    pub fn get(&self, id: &PeerId) -> Option<PeerState> {
        self.peers.read().get(id).cloned()
    }

    pub fn status(&self, id: &PeerId) -> Option<PeerStatus> {
        self.peers.read().get(id).map(|p| p.status)
    }

    /// Consistent copy of all peers, ordered by display name.
    pub fn snapshot(&self) -> Vec<PeerState> {
        let mut peers: Vec<PeerState> = self.peers.read().values().cloned().collect();
        peers.sort_by(|a, b| {
            a.identity
                .display_name
                .cmp(&b.identity.display_name)
                .then_with(|| a.identity.id.cmp(&b.identity.id))
        });
        peers
    }

    /// The fanout set for broadcasts.
    pub fn connected_ids(&self) -> Vec<PeerId> {
        self.peers
            .read()
            .values()
            .filter(|p| p.is_connected())
            .map(|p| p.identity.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: RegistryEvent) {
        let _ = self.events.send(event);
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

struct LocalState {
    identity: PeerIdentity,
    position: Option<Point>,
}

/// This device's own identity and last computed position.
#[derive(Clone)]
pub struct LocalPresence {
    inner: Arc<RwLock<LocalState>>,
}

impl LocalPresence {
    pub fn new(identity: PeerIdentity) -> Self {
        Self {
            inner: Arc::new(RwLock::new(LocalState {
                identity,
                position: None,
            })),
        }
    }

    pub fn id(&self) -> PeerId {
        self.inner.read().identity.id
    }

    pub fn name(&self) -> String {
        self.inner.read().identity.display_name.clone()
    }

    pub fn identity(&self) -> PeerIdentity {
        self.inner.read().identity.clone()
    }

    /// Returns the previous name.
    pub fn rename(&self, name: impl Into<String>) -> String {
        std::mem::replace(&mut self.inner.write().identity.display_name, name.into())
    }

    pub fn position(&self) -> Option<Point> {
        self.inner.read().position
    }

    pub fn set_position(&self, point: Point) {
        self.inner.write().position = Some(point);
    }

    /// The local rock as a renderable entry, always considered connected.
    pub fn as_peer_state(&self) -> PeerState {
        let inner = self.inner.read();
        PeerState {
            identity: inner.identity.clone(),
            position: inner.position,
            status: PeerStatus::Connected,
        }
    }
}
