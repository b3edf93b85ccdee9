use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SensorError;

pub type GeoStream = BoxStream<'static, GeoSample>;
pub type RangingStream = BoxStream<'static, RangingEvent>;

/// A raw geographic coordinate in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoSample {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoSample {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Distance (meters) and direction (unit vector) to one peer. Either part may
/// be missing when the hardware cannot resolve it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangingUpdate {
    pub peer: Uuid,
    pub distance: Option<f32>,
    pub direction: Option<[f32; 2]>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RangingEvent {
    Update(RangingUpdate),
    Suspended,
    SuspensionEnded,
    Invalidated(String),
}

/// Opaque credential a peer needs to range against this device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiscoveryToken(Bytes);

impl DiscoveryToken {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
        Self(Bytes::copy_from_slice(&bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[async_trait]
pub trait GeolocationProvider: Send + Sync {
    async fn start(&self) -> Result<(), SensorError>;
    async fn stop(&self) -> Result<(), SensorError>;

    fn subscribe(&self) -> GeoStream;
}

#[async_trait]
pub trait RangingProvider: Send + Sync {
    /// Token to hand to peers; `None` while ranging is unavailable.
    fn discovery_token(&self) -> Option<DiscoveryToken>;

    async fn run(&self, peer: Uuid, token: DiscoveryToken) -> Result<(), SensorError>;
    async fn stop(&self, peer: Uuid) -> Result<(), SensorError>;

    /// Tear down and recreate the underlying session. Every peer has to be
    /// run again afterwards and the local token may change.
    async fn restart(&self) -> Result<(), SensorError>;

    fn subscribe(&self) -> RangingStream;
}
