//! Nearby-rock presence: discovery and connection of peers, a small wire
//! protocol for names, positions and ranging tokens, and a registry the UI
//! renders from.

pub mod config;
pub mod error;
pub mod lan;
pub mod link;
pub mod memory;
pub mod peer;
pub mod registry;
pub mod resolver;
pub mod session;
pub mod wire;

pub use config::PresenceConfig;
pub use error::{PresenceError, Result};
pub use lan::LanConnectivity;
pub use link::{Connectivity, DiscoveryInfo, LinkEvent, LinkEvents, LinkState};
pub use memory::{MemoryLink, MemoryMedium};
pub use peer::{PeerId, PeerIdentity, PeerState, PeerStatus, Point};
pub use registry::{LocalPresence, PeerRegistry, RegistryEvent};
pub use resolver::{Bounds, PositionResolver, PositioningMode};
pub use session::{SessionHandle, TransportSession};
pub use wire::{DecodeError, EncodeError, Message, WIRE_VERSION};
