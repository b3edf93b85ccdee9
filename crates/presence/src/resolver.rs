use parking_lot::Mutex;
use rockmesh_sensor::{DiscoveryToken, GeoSample, RangingProvider, RangingStream, RangingUpdate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{PresenceError, Result};
use crate::peer::{PeerId, Point};
use crate::registry::{LocalPresence, PeerRegistry};
use crate::wire::Message;

/// Screen points per meter of ranged distance.
pub const RANGING_SCALE: f64 = 200.0;

/// Fixed rendering plane, `[0, width] x [0, height]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub width: f64,
    pub height: f64,
}

impl Bounds {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    pub fn center(&self) -> Point {
        Point::new(self.width / 2.0, self.height / 2.0)
    }

    /// Negative or NaN extents collapse to zero, as do NaN coordinates.
    pub fn clamp(&self, point: Point) -> Point {
        Point::new(
            point.x.max(0.0).min(self.width.max(0.0)),
            point.y.max(0.0).min(self.height.max(0.0)),
        )
    }

    pub fn contains(&self, point: &Point) -> bool {
        (0.0..=self.width).contains(&point.x) && (0.0..=self.height).contains(&point.y)
    }
}

impl Default for Bounds {
    fn default() -> Self {
        Self::new(390.0, 844.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositioningMode {
    /// Broadcast a projected geographic position to every peer.
    #[default]
    Geolocation,
    /// Exchange discovery tokens and place peers by local ranging.
    Ranging,
}

impl std::str::FromStr for PositioningMode {
    type Err = PresenceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "geolocation" | "geo" => Ok(PositioningMode::Geolocation),
            "ranging" => Ok(PositioningMode::Ranging),
            other => Err(PresenceError::Config(format!(
                "unknown positioning mode: {}",
                other
            ))),
        }
    }
}

/// Equirectangular projection of the whole globe onto the bounds.
pub fn project_geolocation(bounds: &Bounds, sample: &GeoSample) -> Option<Point> {
    if !sample.latitude.is_finite() || !sample.longitude.is_finite() {
        return None;
    }

    let normalized_lat = (sample.latitude + 90.0) / 180.0;
    let normalized_lon = (sample.longitude + 180.0) / 360.0;

    let x = normalized_lon * bounds.width;
    let y = (1.0 - normalized_lat) * bounds.height;
    Some(bounds.clamp(Point::new(x, y)))
}

/// Offset from the screen center along the ranged direction. Returns `None`
/// when either distance or direction is missing.
pub fn project_ranging(bounds: &Bounds, scale: f64, update: &RangingUpdate) -> Option<Point> {
    let distance = f64::from(update.distance?);
    let [dx, dy] = update.direction?;
    let (dx, dy) = (f64::from(dx), f64::from(dy));
    if !distance.is_finite() || !dx.is_finite() || !dy.is_finite() {
        return None;
    }

    let center = bounds.center();
    let point = Point::new(
        center.x + dx * distance * scale,
        center.y + dy * distance * scale,
    );
    Some(bounds.clamp(point))
}

/// Turns raw sensing into screen coordinates: the local position (broadcast
/// to peers) in geolocation mode, and per-peer positions in ranging mode.
#[derive(Clone)]
pub struct PositionResolver {
    bounds: Bounds,
    scale: f64,
    local: LocalPresence,
    ranging: Option<Arc<dyn RangingProvider>>,
    tokens: Arc<Mutex<HashMap<PeerId, DiscoveryToken>>>,
}

impl PositionResolver {
    pub fn new(bounds: Bounds, scale: f64, local: LocalPresence) -> Self {
        Self {
            bounds,
            scale,
            local,
            ranging: None,
            tokens: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_ranging(mut self, provider: Arc<dyn RangingProvider>) -> Self {
        self.ranging = Some(provider);
        self
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    pub fn has_ranging(&self) -> bool {
        self.ranging.is_some()
    }

    /// Stores the projected point locally and returns the update to broadcast.
    pub fn on_geolocation(&self, sample: GeoSample) -> Option<Message> {
        let Some(point) = project_geolocation(&self.bounds, &sample) else {
            warn!(
                "Skipping unusable geolocation sample ({}, {})",
                sample.latitude, sample.longitude
            );
            return None;
        };

        self.local.set_position(point);
        debug!("Local position resolved to {}", point);
        Some(Message::PositionUpdate(point))
    }

    /// Places a ranged peer on screen. Local only, nothing is transmitted.
    pub fn on_ranging_update(&self, registry: &PeerRegistry, update: RangingUpdate) -> Option<Point> {
        let peer = PeerId::from(update.peer);
        let Some(point) = project_ranging(&self.bounds, self.scale, &update) else {
            debug!("Missing distance or direction for {}", peer);
            return None;
        };

        if registry.set_position(&peer, point) {
            Some(point)
        } else {
            debug!("Ranging update for unknown peer {}", peer);
            None
        }
    }

    pub fn ranging_events(&self) -> Option<RangingStream> {
        self.ranging.as_ref().map(|r| r.subscribe())
    }

    pub fn local_token(&self) -> Option<DiscoveryToken> {
        self.ranging.as_ref().and_then(|r| r.discovery_token())
    }

    pub async fn start_ranging(&self, peer: PeerId, token: DiscoveryToken) -> Result<()> {
        let Some(ranging) = &self.ranging else {
            debug!("Ignoring ranging token from {}: ranging disabled", peer);
            return Ok(());
        };

        self.tokens.lock().insert(peer, token.clone());
        ranging
            .run(*peer.as_uuid(), token)
            .await
            .map_err(|e| PresenceError::SensingUnavailable(e.to_string()))?;
        info!("Ranging started with {}", peer);
        Ok(())
    }

    pub async fn forget(&self, peer: &PeerId) {
        if self.tokens.lock().remove(peer).is_none() {
            return;
        }
        if let Some(ranging) = &self.ranging {
            if let Err(e) = ranging.stop(*peer.as_uuid()).await {
                debug!("Stopping ranging for {}: {}", peer, e);
            }
        }
    }

    /// Recreates the ranging session after a suspension and runs every known
    /// peer again. Returns the new local token when it changed, so it can be
    /// handed to peers.
    pub async fn resume(&self) -> Result<Option<DiscoveryToken>> {
        let Some(ranging) = &self.ranging else {
            return Ok(None);
        };

        let previous = ranging.discovery_token();
        ranging
            .restart()
            .await
            .map_err(|e| PresenceError::SensingUnavailable(e.to_string()))?;

        let peers: Vec<(PeerId, DiscoveryToken)> = self
            .tokens
            .lock()
            .iter()
            .map(|(peer, token)| (*peer, token.clone()))
            .collect();
        for (peer, token) in peers {
            if let Err(e) = ranging.run(*peer.as_uuid(), token).await {
                warn!("Failed to re-establish ranging with {}: {}", peer, e);
            }
        }

        let current = ranging.discovery_token();
        info!("Ranging session restarted");
        Ok(if current != previous { current } else { None })
    }

    pub fn ranging_peers(&self) -> Vec<PeerId> {
        self.tokens.lock().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{PeerIdentity, PeerStatus};
    use rockmesh_sensor::MockRanging;
    use uuid::Uuid;

    fn resolver() -> (PositionResolver, LocalPresence) {
        let local = LocalPresence::new(PeerIdentity::new(PeerId::random(), "Rocky"));
        let resolver = PositionResolver::new(Bounds::new(1000.0, 1000.0), RANGING_SCALE, local.clone());
        (resolver, local)
    }

    #[test]
    fn test_origin_maps_to_center() {
        let bounds = Bounds::new(1000.0, 1000.0);
        let point = project_geolocation(&bounds, &GeoSample::new(0.0, 0.0)).unwrap();
        assert_eq!(point, Point::new(500.0, 500.0));
    }

    #[test]
    fn test_geolocation_corners() {
        let bounds = Bounds::new(1000.0, 500.0);
        assert_eq!(
            project_geolocation(&bounds, &GeoSample::new(90.0, -180.0)),
            Some(Point::new(0.0, 0.0))
        );
        assert_eq!(
            project_geolocation(&bounds, &GeoSample::new(-90.0, 180.0)),
            Some(Point::new(1000.0, 500.0))
        );
    }

    #[test]
    fn test_geolocation_always_clamped() {
        let bounds = Bounds::new(390.0, 844.0);
        let samples = [
            (1000.0, 1000.0),
            (-1000.0, -1000.0),
            (f64::MAX, f64::MIN),
            (45.0, 720.0),
            (-91.0, 0.0),
        ];
        for (lat, lon) in samples {
            let point = project_geolocation(&bounds, &GeoSample::new(lat, lon)).unwrap();
            assert!(bounds.contains(&point), "{:?} escaped bounds", point);
        }
    }

    #[test]
    fn test_degenerate_bounds_do_not_panic() {
        let sample = GeoSample::new(10.0, 20.0);
        for bounds in [
            Bounds::new(-100.0, 50.0),
            Bounds::new(f64::NAN, f64::NAN),
            Bounds::new(0.0, 0.0),
        ] {
            let point = project_geolocation(&bounds, &sample);
            assert_eq!(point.map(|p| p.x), Some(0.0));
        }
        assert_eq!(
            Bounds::new(-1.0, 10.0).clamp(Point::new(5.0, 5.0)),
            Point::new(0.0, 5.0)
        );
    }

    #[test]
    fn test_geolocation_rejects_nan() {
        let bounds = Bounds::default();
        assert!(project_geolocation(&bounds, &GeoSample::new(f64::NAN, 0.0)).is_none());
        assert!(project_geolocation(&bounds, &GeoSample::new(0.0, f64::INFINITY)).is_none());
    }

    #[test]
    fn test_ranging_projection() {
        let bounds = Bounds::new(1000.0, 1000.0);
        let update = RangingUpdate {
            peer: Uuid::new_v4(),
            distance: Some(1.0),
            direction: Some([0.5, -0.5]),
        };
        let point = project_ranging(&bounds, RANGING_SCALE, &update).unwrap();
        assert_eq!(point, Point::new(600.0, 400.0));
    }

    #[test]
    fn test_ranging_projection_clamped_and_partial() {
        let bounds = Bounds::new(1000.0, 1000.0);
        let far = RangingUpdate {
            peer: Uuid::new_v4(),
            distance: Some(50.0),
            direction: Some([1.0, 0.0]),
        };
        assert_eq!(
            project_ranging(&bounds, RANGING_SCALE, &far),
            Some(Point::new(1000.0, 500.0))
        );

        let no_distance = RangingUpdate {
            distance: None,
            ..far
        };
        let no_direction = RangingUpdate {
            direction: None,
            ..far
        };
        assert!(project_ranging(&bounds, RANGING_SCALE, &no_distance).is_none());
        assert!(project_ranging(&bounds, RANGING_SCALE, &no_direction).is_none());
    }

    #[test]
    fn test_on_geolocation_updates_local() {
        let (resolver, local) = resolver();
        let message = resolver.on_geolocation(GeoSample::new(0.0, 0.0)).unwrap();

        assert_eq!(message, Message::PositionUpdate(Point::new(500.0, 500.0)));
        assert_eq!(local.position(), Some(Point::new(500.0, 500.0)));
        assert!(resolver.on_geolocation(GeoSample::new(f64::NAN, 0.0)).is_none());
        assert_eq!(local.position(), Some(Point::new(500.0, 500.0)));
    }

    #[test]
    fn test_ranging_update_skips_missing_data() {
        let (resolver, _local) = resolver();
        let registry = PeerRegistry::new();
        let peer = PeerId::random();
        registry.upsert_peer(PeerIdentity::new(peer, "Pebbles"));
        registry.set_status(&peer, PeerStatus::Connected);

        let missing = RangingUpdate {
            peer: *peer.as_uuid(),
            distance: None,
            direction: Some([1.0, 0.0]),
        };
        assert!(resolver.on_ranging_update(&registry, missing).is_none());
        assert!(registry.get(&peer).unwrap().position.is_none());

        let full = RangingUpdate {
            distance: Some(0.5),
            ..missing
        };
        assert_eq!(
            resolver.on_ranging_update(&registry, full),
            Some(Point::new(600.0, 500.0))
        );
        assert_eq!(
            registry.get(&peer).unwrap().position,
            Some(Point::new(600.0, 500.0))
        );
    }

    #[tokio::test]
    async fn test_resume_reruns_known_peers() {
        let (resolver, _local) = resolver();
        let ranging = Arc::new(MockRanging::new());
        let resolver = resolver.with_ranging(ranging.clone());
        let peer = PeerId::random();
        let token = DiscoveryToken::random();

        resolver.start_ranging(peer, token.clone()).await.unwrap();
        assert_eq!(ranging.ranged_peers(), vec![*peer.as_uuid()]);

        let refreshed = resolver.resume().await.unwrap();
        assert!(refreshed.is_some());
        assert_eq!(ranging.restart_count(), 1);
        assert_eq!(ranging.peer_token(peer.as_uuid()), Some(token));

        resolver.forget(&peer).await;
        assert!(ranging.ranged_peers().is_empty());
        assert!(resolver.ranging_peers().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_ranging_reports_error() {
        let (resolver, _local) = resolver();
        let resolver = resolver.with_ranging(Arc::new(MockRanging::unavailable()));

        assert!(resolver.local_token().is_none());
        let result = resolver.start_ranging(PeerId::random(), DiscoveryToken::random()).await;
        assert!(matches!(result, Err(PresenceError::SensingUnavailable(_))));
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("ranging".parse::<PositioningMode>().unwrap(), PositioningMode::Ranging);
        assert_eq!("geo".parse::<PositioningMode>().unwrap(), PositioningMode::Geolocation);
        assert!("sonar".parse::<PositioningMode>().is_err());
    }
}
