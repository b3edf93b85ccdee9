use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{PresenceError, Result};
use crate::link::{Connectivity, DiscoveryInfo, LinkEvent, LinkEvents, LinkState};
use crate::peer::PeerId;

struct Node {
    events: mpsc::UnboundedSender<LinkEvent>,
    advertising: Option<DiscoveryInfo>,
    browsing: bool,
    responsive: bool,
}

#[derive(Default)]
struct MediumState {
    nodes: HashMap<PeerId, Node>,
    // (inviter, invitee)
    pending: HashSet<(PeerId, PeerId)>,
    links: HashSet<(PeerId, PeerId)>,
}

impl MediumState {
    fn emit(&self, to: &PeerId, event: LinkEvent) {
        if let Some(node) = self.nodes.get(to) {
            let _ = node.events.send(event);
        }
    }

    fn node(&self, id: &PeerId) -> Result<&Node> {
        self.nodes.get(id).ok_or(PresenceError::PeerNotFound(*id))
    }

    fn node_mut(&mut self, id: &PeerId) -> Result<&mut Node> {
        self.nodes.get_mut(id).ok_or(PresenceError::PeerNotFound(*id))
    }

    fn browsers_except(&self, id: &PeerId) -> Vec<PeerId> {
        self.nodes
            .iter()
            .filter(|(other, node)| *other != id && node.browsing)
            .map(|(other, _)| *other)
            .collect()
    }
}

fn link_key(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// In-process radio medium. Every node that joins gets a `MemoryLink`;
/// advertisements, invitations and data travel between them instantly.
///
/// Used by tests and the local demo. Nodes can be made unresponsive (their
/// invitations vanish) or dropped (every link to them breaks).
#[derive(Clone, Default)]
pub struct MemoryMedium {
    state: Arc<Mutex<MediumState>>,
}

impl MemoryMedium {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, id: PeerId) -> (MemoryLink, LinkEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().nodes.insert(
            id,
            Node {
                events: tx,
                advertising: None,
                browsing: false,
                responsive: true,
            },
        );
        (
            MemoryLink {
                id,
                medium: self.clone(),
            },
            rx,
        )
    }

    /// Unresponsive nodes never see invitations addressed to them.
    pub fn set_responsive(&self, id: &PeerId, responsive: bool) {
        if let Some(node) = self.state.lock().nodes.get_mut(id) {
            node.responsive = responsive;
        }
    }

    /// Remove a node as if it walked out of range.
    pub fn drop_node(&self, id: &PeerId) {
        let mut state = self.state.lock();
        let Some(node) = state.nodes.remove(id) else {
            return;
        };

        let broken: Vec<(PeerId, PeerId)> = state
            .links
            .iter()
            .filter(|(a, b)| a == id || b == id)
            .copied()
            .collect();
        for key in broken {
            state.links.remove(&key);
            let other = if key.0 == *id { key.1 } else { key.0 };
            state.emit(
                &other,
                LinkEvent::StateChanged {
                    peer: *id,
                    state: LinkState::NotConnected,
                },
            );
        }
        state.pending.retain(|(a, b)| a != id && b != id);

        if node.advertising.is_some() {
            for browser in state.browsers_except(id) {
                state.emit(&browser, LinkEvent::PeerLost { peer: *id });
            }
        }
        debug!("memory medium: node {} dropped", id);
    }

    pub fn is_linked(&self, a: &PeerId, b: &PeerId) -> bool {
        self.state.lock().links.contains(&link_key(*a, *b))
    }

    pub fn advertised_info(&self, id: &PeerId) -> Option<DiscoveryInfo> {
        self.state
            .lock()
            .nodes
            .get(id)
            .and_then(|n| n.advertising.clone())
    }
}

pub struct MemoryLink {
    id: PeerId,
    medium: MemoryMedium,
}

impl MemoryLink {
    pub fn medium(&self) -> &MemoryMedium {
        &self.medium
    }
}

#[async_trait]
impl Connectivity for MemoryLink {
    fn local_id(&self) -> PeerId {
        self.id
    }

    async fn start_advertising(&self, info: DiscoveryInfo) -> Result<()> {
        let mut state = self.medium.state.lock();
        state.node_mut(&self.id)?.advertising = Some(info.clone());

        for browser in state.browsers_except(&self.id) {
            state.emit(
                &browser,
                LinkEvent::PeerFound {
                    peer: self.id,
                    info: info.clone(),
                },
            );
        }
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<()> {
        let mut state = self.medium.state.lock();
        if state.node_mut(&self.id)?.advertising.take().is_some() {
            for browser in state.browsers_except(&self.id) {
                state.emit(&browser, LinkEvent::PeerLost { peer: self.id });
            }
        }
        Ok(())
    }

    async fn start_browsing(&self) -> Result<()> {
        let mut state = self.medium.state.lock();
        state.node_mut(&self.id)?.browsing = true;

        let found: Vec<(PeerId, DiscoveryInfo)> = state
            .nodes
            .iter()
            .filter(|(id, _)| **id != self.id)
            .filter_map(|(id, node)| node.advertising.clone().map(|info| (*id, info)))
            .collect();
        for (peer, info) in found {
            state.emit(&self.id, LinkEvent::PeerFound { peer, info });
        }
        Ok(())
    }

    async fn stop_browsing(&self) -> Result<()> {
        let mut state = self.medium.state.lock();
        state.node_mut(&self.id)?.browsing = false;
        Ok(())
    }

    async fn invite(&self, peer: PeerId) -> Result<()> {
        let mut state = self.medium.state.lock();
        let inviter_info = state.node(&self.id)?.advertising.clone().unwrap_or_default();
        let target = state.node(&peer)?;
        if target.advertising.is_none() {
            return Err(PresenceError::PeerNotFound(peer));
        }
        let responsive = target.responsive;

        if state.links.contains(&link_key(self.id, peer)) {
            return Ok(());
        }
        state.pending.insert((self.id, peer));
        state.emit(
            &self.id,
            LinkEvent::StateChanged {
                peer,
                state: LinkState::Connecting,
            },
        );

        if responsive {
            state.emit(
                &peer,
                LinkEvent::InvitationReceived {
                    peer: self.id,
                    info: inviter_info,
                },
            );
        } else {
            debug!("memory medium: invitation to {} lost", peer);
        }
        Ok(())
    }

    async fn respond_to_invitation(&self, peer: PeerId, accept: bool) -> Result<()> {
        let mut state = self.medium.state.lock();
        if !state.pending.remove(&(peer, self.id)) {
            // Crossed invitations: the other side already accepted ours.
            if accept && state.links.contains(&link_key(self.id, peer)) {
                return Ok(());
            }
            return Err(PresenceError::Link(format!(
                "no pending invitation from {}",
                peer
            )));
        }

        if !accept {
            state.emit(
                &peer,
                LinkEvent::StateChanged {
                    peer: self.id,
                    state: LinkState::NotConnected,
                },
            );
            return Ok(());
        }

        state.pending.remove(&(self.id, peer));
        if state.links.insert(link_key(self.id, peer)) {
            for (to, other) in [(self.id, peer), (peer, self.id)] {
                state.emit(
                    &to,
                    LinkEvent::StateChanged {
                        peer: other,
                        state: LinkState::Connected,
                    },
                );
            }
        }
        Ok(())
    }

    async fn send(&self, peer: PeerId, bytes: Bytes) -> Result<()> {
        let state = self.medium.state.lock();
        if !state.links.contains(&link_key(self.id, peer)) {
            return Err(PresenceError::NotConnected(peer));
        }
        state.emit(
            &peer,
            LinkEvent::Data {
                peer: self.id,
                bytes,
            },
        );
        Ok(())
    }

    async fn disconnect(&self, peer: PeerId) -> Result<()> {
        let mut state = self.medium.state.lock();
        if state.links.remove(&link_key(self.id, peer)) {
            for (to, other) in [(self.id, peer), (peer, self.id)] {
                state.emit(
                    &to,
                    LinkEvent::StateChanged {
                        peer: other,
                        state: LinkState::NotConnected,
                    },
                );
            }
        }
        Ok(())
    }
}
