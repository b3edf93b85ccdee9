//! Sensing collaborators for rockmesh: raw geolocation samples and per-peer
//! ranging (distance and direction) driven by exchanged discovery tokens.

pub mod error;
pub mod mock;
pub mod traits;

pub use error::{Result, SensorError};
pub use mock::{MockGeolocation, MockRanging};
pub use traits::{
    DiscoveryToken, GeoSample, GeoStream, GeolocationProvider, RangingEvent, RangingProvider,
    RangingStream, RangingUpdate,
};
