use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::peer::PeerId;

/// Advertisement key carrying the display name.
pub const NAME_KEY: &str = "rockName";

/// Key/value metadata announced while advertising. Fixed for the lifetime of
/// one advertisement; changing it means stopping and starting again.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryInfo(BTreeMap<String, String>);

impl DiscoveryInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        let mut info = Self::new();
        info.insert(NAME_KEY, name);
        info
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn name(&self) -> Option<&str> {
        self.get(NAME_KEY)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    NotConnected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    PeerFound { peer: PeerId, info: DiscoveryInfo },
    PeerLost { peer: PeerId },
    InvitationReceived { peer: PeerId, info: DiscoveryInfo },
    StateChanged { peer: PeerId, state: LinkState },
    Data { peer: PeerId, bytes: Bytes },
}

pub type LinkEvents = mpsc::UnboundedReceiver<LinkEvent>;

/// Reliable, ordered peer-to-peer connectivity with advertise/browse
/// discovery. Implementations report everything that happens on the link
/// through the `LinkEvents` stream they hand out on construction.
#[async_trait]
pub trait Connectivity: Send + Sync {
    fn local_id(&self) -> PeerId;

    async fn start_advertising(&self, info: DiscoveryInfo) -> Result<()>;
    async fn stop_advertising(&self) -> Result<()>;

    async fn start_browsing(&self) -> Result<()>;
    async fn stop_browsing(&self) -> Result<()>;

    async fn invite(&self, peer: PeerId) -> Result<()>;
    async fn respond_to_invitation(&self, peer: PeerId, accept: bool) -> Result<()>;

    async fn send(&self, peer: PeerId, bytes: Bytes) -> Result<()>;
    async fn disconnect(&self, peer: PeerId) -> Result<()>;
}
