use thiserror::Error;

use crate::peer::PeerId;
use crate::wire::{DecodeError, EncodeError};

/// Errors raised by the presence subsystem.
///
/// None of these are fatal: the session logs them and degrades locally
/// (a message is dropped, a peer reverts to discovering, a position stops
/// updating).
#[derive(Error, Debug)]
pub enum PresenceError {
    /// Inbound bytes were not a valid wire message
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Outbound message could not be encoded
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    /// Invitation was not answered within the configured timeout
    #[error("connection to {0} timed out")]
    ConnectTimeout(PeerId),

    /// Delivery to a single peer failed
    #[error("send to {peer} failed: {reason}")]
    SendFailure { peer: PeerId, reason: String },

    /// Geolocation or ranging is denied or absent on this device
    #[error("sensing unavailable: {0}")]
    SensingUnavailable(String),

    /// Peer is not known to the link layer
    #[error("peer not found: {0}")]
    PeerNotFound(PeerId),

    /// Peer is known but has no live link
    #[error("peer not connected: {0}")]
    NotConnected(PeerId),

    /// Link layer protocol violation or unexpected state
    #[error("link error: {0}")]
    Link(String),

    /// Invalid configuration value
    #[error("config error: {0}")]
    Config(String),

    /// Session or link event channel was closed
    #[error("channel closed")]
    ChannelClosed,

    /// Failed to serialize or deserialize link framing
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// I/O operation failed
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type for presence operations
pub type Result<T> = std::result::Result<T, PresenceError>;
