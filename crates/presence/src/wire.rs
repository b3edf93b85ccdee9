use bincode::Options;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::peer::Point;

pub const WIRE_VERSION: u8 = 1;
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TOKEN_LEN: usize = 4096;

/// Version byte, variant tag and the shortest possible body (an empty name
/// or token length prefix).
pub const MIN_MESSAGE_LEN: usize = 3;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,

    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),

    #[error("frame of {0} bytes exceeds limit")]
    TooLarge(usize),

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("invalid field: {0}")]
    InvalidField(&'static str),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("invalid field: {0}")]
    InvalidField(&'static str),

    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Messages exchanged between connected peers.
///
/// Frames are `[WIRE_VERSION][bincode body]`; the body starts with the
/// variant index, so the type is always explicit on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    NameUpdate(String),
    PositionUpdate(Point),
    RangingToken(Vec<u8>),
}

fn body_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_MESSAGE_SIZE as u64)
        .reject_trailing_bytes()
}

impl Message {
    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        self.validate().map_err(EncodeError::InvalidField)?;

        let body = body_options()
            .serialize(self)
            .map_err(|e| EncodeError::Serialization(e.to_string()))?;

        let mut frame = BytesMut::with_capacity(1 + body.len());
        frame.put_u8(WIRE_VERSION);
        frame.extend_from_slice(&body);
        Ok(frame.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let (&version, body) = data.split_first().ok_or(DecodeError::Empty)?;
        if version != WIRE_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(DecodeError::TooLarge(data.len()));
        }

        let message: Message = body_options()
            .deserialize(body)
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;
        message.validate().map_err(DecodeError::InvalidField)?;
        Ok(message)
    }

    pub fn message_type(&self) -> u8 {
        match self {
            Message::NameUpdate(_) => 0x01,
            Message::PositionUpdate(_) => 0x02,
            Message::RangingToken(_) => 0x03,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::NameUpdate(_) => "name",
            Message::PositionUpdate(_) => "position",
            Message::RangingToken(_) => "ranging-token",
        }
    }

    fn validate(&self) -> Result<(), &'static str> {
        match self {
            Message::NameUpdate(name) if name.len() > MAX_NAME_LEN => Err("name too long"),
            Message::PositionUpdate(point) if !point.is_finite() => Err("non-finite coordinate"),
            Message::RangingToken(token) if token.len() > MAX_TOKEN_LEN => Err("token too long"),
            _ => Ok(()),
        }
    }
}
