use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::SensorError;
use crate::traits::{
    DiscoveryToken, GeoSample, GeoStream, GeolocationProvider, RangingEvent, RangingProvider,
    RangingStream, RangingUpdate,
};

/// Geolocation source that random-walks around an origin while running.
/// Samples can also be injected directly.
pub struct MockGeolocation {
    id: String,
    origin: GeoSample,
    interval: Duration,
    running: Arc<AtomicBool>,
    tx: broadcast::Sender<GeoSample>,
}

impl MockGeolocation {
    pub fn new(id: impl Into<String>, origin: GeoSample, interval: Duration) -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            id: id.into(),
            origin,
            interval,
            running: Arc::new(AtomicBool::new(false)),
            tx,
        }
    }

    pub fn inject(&self, sample: GeoSample) {
        let _ = self.tx.send(sample);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GeolocationProvider for MockGeolocation {
    async fn start(&self) -> Result<(), SensorError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SensorError::AlreadyRunning);
        }

        let running = self.running.clone();
        let tx = self.tx.clone();
        let interval = self.interval;
        let mut current = self.origin;

        tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                let _ = tx.send(current);
                {
                    use rand::Rng;
                    let mut rng = rand::thread_rng();
                    current.latitude =
                        (current.latitude + rng.gen_range(-0.0005..0.0005)).clamp(-90.0, 90.0);
                    current.longitude =
                        (current.longitude + rng.gen_range(-0.0005..0.0005)).clamp(-180.0, 180.0);
                }
                tokio::time::sleep(interval).await;
            }
        });

        tracing::info!("MockGeolocation {} started", self.id);
        Ok(())
    }

    async fn stop(&self) -> Result<(), SensorError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(SensorError::NotRunning);
        }
        tracing::info!("MockGeolocation {} stopped", self.id);
        Ok(())
    }

    fn subscribe(&self) -> GeoStream {
        let mut rx = self.tx.subscribe();
        Box::pin(async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(sample) => yield sample,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

/// Ranging source driven entirely by the caller: updates and suspension
/// events are injected, and every `run`/`restart` call is recorded.
pub struct MockRanging {
    available: bool,
    token: Mutex<DiscoveryToken>,
    sessions: Mutex<HashMap<Uuid, DiscoveryToken>>,
    restarts: AtomicUsize,
    tx: broadcast::Sender<RangingEvent>,
}

impl MockRanging {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            available: true,
            token: Mutex::new(DiscoveryToken::random()),
            sessions: Mutex::new(HashMap::new()),
            restarts: AtomicUsize::new(0),
            tx,
        }
    }

    /// A provider on a device without ranging hardware or permission.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    /// Deliver an update for `peer`. Dropped unless a session runs for it.
    pub fn inject_update(
        &self,
        peer: Uuid,
        distance: Option<f32>,
        direction: Option<[f32; 2]>,
    ) -> bool {
        if !self.sessions.lock().contains_key(&peer) {
            return false;
        }
        let _ = self.tx.send(RangingEvent::Update(RangingUpdate {
            peer,
            distance,
            direction,
        }));
        true
    }

    pub fn suspend(&self) {
        let _ = self.tx.send(RangingEvent::Suspended);
    }

    pub fn resume(&self) {
        let _ = self.tx.send(RangingEvent::SuspensionEnded);
    }

    pub fn invalidate(&self, reason: impl Into<String>) {
        let _ = self.tx.send(RangingEvent::Invalidated(reason.into()));
    }

    pub fn ranged_peers(&self) -> Vec<Uuid> {
        self.sessions.lock().keys().copied().collect()
    }

    pub fn peer_token(&self, peer: &Uuid) -> Option<DiscoveryToken> {
        self.sessions.lock().get(peer).cloned()
    }

    pub fn restart_count(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }
}

impl Default for MockRanging {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RangingProvider for MockRanging {
    fn discovery_token(&self) -> Option<DiscoveryToken> {
        self.available.then(|| self.token.lock().clone())
    }

    async fn run(&self, peer: Uuid, token: DiscoveryToken) -> Result<(), SensorError> {
        if !self.available {
            return Err(SensorError::PermissionDenied(
                "nearby interaction not authorized".to_string(),
            ));
        }
        self.sessions.lock().insert(peer, token);
        tracing::debug!("MockRanging: running session for {}", peer);
        Ok(())
    }

    async fn stop(&self, peer: Uuid) -> Result<(), SensorError> {
        self.sessions
            .lock()
            .remove(&peer)
            .map(|_| ())
            .ok_or_else(|| SensorError::UnknownPeer(peer.to_string()))
    }

    async fn restart(&self) -> Result<(), SensorError> {
        if !self.available {
            return Err(SensorError::Unavailable("no ranging hardware".to_string()));
        }
        self.sessions.lock().clear();
        *self.token.lock() = DiscoveryToken::random();
        self.restarts.fetch_add(1, Ordering::SeqCst);
        tracing::info!("MockRanging: session restarted");
        Ok(())
    }

    fn subscribe(&self) -> RangingStream {
        let mut rx = self.tx.subscribe();
        Box::pin(async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
