use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use rockmesh_presence::{
    Bounds, Connectivity, DiscoveryInfo, LinkEvent, LocalPresence, MemoryLink, MemoryMedium,
    Message, PeerId, PeerIdentity, PeerStatus, Point, PositioningMode, PresenceConfig,
    PresenceError, SessionHandle, TransportSession,
};
use rockmesh_sensor::{GeoSample, MockGeolocation, MockRanging, RangingProvider};

fn config() -> PresenceConfig {
    PresenceConfig::default()
        .with_invite_timeout(Duration::from_millis(100))
        .with_bounds(Bounds::new(1000.0, 1000.0))
}

fn session(medium: &MemoryMedium, name: &str, config: PresenceConfig) -> (PeerId, TransportSession) {
    let id = PeerId::random();
    let (link, events) = medium.join(id);
    let local = LocalPresence::new(PeerIdentity::new(id, name));
    (id, TransportSession::new(config, local, Arc::new(link), events))
}

fn start(session: TransportSession) -> SessionHandle {
    let handle = session.handle();
    tokio::spawn(session.run());
    handle
}

fn is_connected(handle: &SessionHandle, peer: &PeerId) -> bool {
    handle.registry().status(peer) == Some(PeerStatus::Connected)
}

async fn wait_until(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn connected_pair(medium: &MemoryMedium) -> (PeerId, SessionHandle, PeerId, SessionHandle) {
    let (a, rocky) = session(medium, "Rocky", config());
    let (b, pebbles) = session(medium, "Pebbles", config());
    let rocky = start(rocky);
    let pebbles = start(pebbles);

    wait_until("both sides connected", || {
        is_connected(&rocky, &b) && is_connected(&pebbles, &a)
    })
    .await;
    (a, rocky, b, pebbles)
}

/// Position sent by one rock shows up in the other's snapshot
#[tokio::test]
async fn test_position_update_reaches_peer() {
    let medium = MemoryMedium::new();
    let (a, rocky, _b, pebbles) = connected_pair(&medium).await;

    rocky
        .broadcast(Message::PositionUpdate(Point::new(12.0, 34.0)))
        .unwrap();

    wait_until("position at Pebbles", || {
        pebbles.registry().get(&a).and_then(|p| p.position) == Some(Point::new(12.0, 34.0))
    })
    .await;

    let snapshot = pebbles.registry().snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].name(), "Rocky");
    assert_eq!(snapshot[0].position, Some(Point::new(12.0, 34.0)));
}

/// Rename restarts advertising and tells connected peers
#[tokio::test]
async fn test_rename_propagates() {
    let medium = MemoryMedium::new();
    let (a, rocky, _b, pebbles) = connected_pair(&medium).await;

    let (observer, mut observed) = medium.join(PeerId::random());
    observer.start_browsing().await.unwrap();
    while observed.try_recv().is_ok() {}

    rocky.rename("Boulder").unwrap();
    assert_eq!(rocky.local().name(), "Boulder");

    wait_until("new name at Pebbles", || {
        pebbles.registry().get(&a).map(|p| p.name().to_string()) == Some("Boulder".to_string())
    })
    .await;
    wait_until("new advertisement", || {
        medium
            .advertised_info(&a)
            .and_then(|info| info.name().map(str::to_string))
            == Some("Boulder".to_string())
    })
    .await;

    let mut seen = Vec::new();
    while let Ok(event) = observed.try_recv() {
        match event {
            LinkEvent::PeerLost { peer } if peer == a => seen.push("lost".to_string()),
            LinkEvent::PeerFound { peer, info } if peer == a => {
                seen.push(info.name().unwrap_or_default().to_string())
            }
            _ => {}
        }
    }
    assert_eq!(seen, vec!["lost".to_string(), "Boulder".to_string()]);
    assert!(is_connected(&pebbles, &a));
}

/// An invitation nobody answers falls back to discovering after the timeout
#[tokio::test]
async fn test_unanswered_invitation_reverts_to_discovering() {
    let medium = MemoryMedium::new();
    let silent = PeerId::random();
    let (silent_link, _silent_events) = medium.join(silent);
    medium.set_responsive(&silent, false);
    silent_link
        .start_advertising(DiscoveryInfo::with_name("Pebbles"))
        .await
        .unwrap();

    let (_a, rocky) = session(&medium, "Rocky", config());
    let rocky = start(rocky);

    wait_until("invitation attempt", || rocky.registry().get(&silent).is_some()).await;
    wait_until("timeout", || {
        rocky.registry().status(&silent) == Some(PeerStatus::Discovering)
    })
    .await;

    let state = rocky.registry().get(&silent).unwrap();
    assert_eq!(state.name(), "Pebbles");
    assert!(state.position.is_none());
    assert!(!medium.is_linked(&rocky.local().id(), &silent));
}

/// A peer that walks away is purged along with its position
#[tokio::test]
async fn test_lost_link_purges_peer() {
    let medium = MemoryMedium::new();
    let (a, rocky, b, pebbles) = connected_pair(&medium).await;

    rocky
        .broadcast(Message::PositionUpdate(Point::new(1.0, 2.0)))
        .unwrap();
    wait_until("position", || {
        pebbles.registry().get(&a).and_then(|p| p.position).is_some()
    })
    .await;

    medium.drop_node(&a);

    wait_until("purge", || pebbles.registry().get(&a).is_none()).await;
    assert!(pebbles.registry().connected_ids().is_empty());
    assert!(rocky.registry().get(&b).is_some());
}

/// Garbage from a connected peer is dropped and the session keeps going
#[tokio::test]
async fn test_malformed_data_is_dropped() {
    let medium = MemoryMedium::new();
    let raw = PeerId::random();
    let (raw_link, mut raw_events) = medium.join(raw);
    raw_link
        .start_advertising(DiscoveryInfo::with_name("Gravel"))
        .await
        .unwrap();

    let (a, rocky) = session(&medium, "Rocky", config());
    let rocky = start(rocky);

    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), raw_events.recv())
            .await
            .expect("no invitation")
            .expect("medium closed");
        if let LinkEvent::InvitationReceived { peer, info } = event {
            assert_eq!(peer, a);
            assert_eq!(info.name(), Some("Rocky"));
            break;
        }
    }
    raw_link.respond_to_invitation(a, true).await.unwrap();
    wait_until("connected", || is_connected(&rocky, &raw)).await;

    raw_link
        .send(a, Bytes::from_static(&[0x07, 0xde, 0xad]))
        .await
        .unwrap();
    raw_link.send(a, Bytes::new()).await.unwrap();
    raw_link
        .send(a, Message::NameUpdate("Cobble".into()).encode().unwrap())
        .await
        .unwrap();

    wait_until("valid update after garbage", || {
        rocky.registry().get(&raw).map(|p| p.name().to_string()) == Some("Cobble".to_string())
    })
    .await;
    assert!(is_connected(&rocky, &raw));
}

/// Geolocation at the origin lands in the middle of the peer's screen
#[tokio::test]
async fn test_geolocation_shared_with_peer() {
    let medium = MemoryMedium::new();
    let geo = Arc::new(MockGeolocation::new(
        "geo-rocky",
        GeoSample::new(0.0, 0.0),
        Duration::from_secs(3600),
    ));

    let (a, rocky) = session(&medium, "Rocky", config());
    let rocky = start(rocky.with_geolocation(geo.clone()));
    let (_b, pebbles) = session(&medium, "Pebbles", config());
    let pebbles = start(pebbles);

    wait_until("position at Pebbles", || {
        pebbles.registry().get(&a).and_then(|p| p.position) == Some(Point::new(500.0, 500.0))
    })
    .await;
    assert_eq!(rocky.local().position(), Some(Point::new(500.0, 500.0)));
    assert!(geo.is_running());
}

/// Tokens are exchanged on connect, ranging places the peer locally, and a
/// resumed session hands out its fresh token
#[tokio::test]
async fn test_ranging_token_exchange_and_resume() {
    let medium = MemoryMedium::new();
    let ranging_a = Arc::new(MockRanging::new());
    let ranging_b = Arc::new(MockRanging::new());
    let ranging_config = config().with_mode(PositioningMode::Ranging);

    let (a, rocky) = session(&medium, "Rocky", ranging_config.clone());
    let (b, pebbles) = session(&medium, "Pebbles", ranging_config);
    let rocky = start(rocky.with_ranging(ranging_a.clone()));
    let _pebbles = start(pebbles.with_ranging(ranging_b.clone()));

    wait_until("token exchange", || {
        ranging_b.peer_token(a.as_uuid()) == ranging_a.discovery_token()
            && ranging_a.peer_token(b.as_uuid()) == ranging_b.discovery_token()
    })
    .await;

    assert!(ranging_a.inject_update(*b.as_uuid(), Some(1.0), Some([1.0, 0.0])));
    wait_until("ranged position", || {
        rocky.registry().get(&b).and_then(|p| p.position) == Some(Point::new(700.0, 500.0))
    })
    .await;

    let old_token = ranging_a.discovery_token();
    ranging_a.resume();
    wait_until("fresh token at Pebbles", || {
        ranging_a.restart_count() == 1
            && ranging_a.discovery_token() != old_token
            && ranging_b.peer_token(a.as_uuid()) == ranging_a.discovery_token()
    })
    .await;
    assert!(ranging_a.ranged_peers().contains(b.as_uuid()));
}

/// Shutting down one rock disconnects it from everyone
#[tokio::test]
async fn test_shutdown_disconnects_peers() {
    let medium = MemoryMedium::new();
    let (a, rocky, b, pebbles) = connected_pair(&medium).await;

    rocky.shutdown().unwrap();

    wait_until("purge at Pebbles", || pebbles.registry().get(&a).is_none()).await;
    assert!(!medium.is_linked(&a, &b));
}

/// A peer that vanishes mid-invitation does not linger in the registry
#[tokio::test]
async fn test_peer_lost_while_connecting_is_removed() {
    let medium = MemoryMedium::new();
    let ghost = PeerId::random();
    let (ghost_link, _ghost_events) = medium.join(ghost);
    medium.set_responsive(&ghost, false);
    ghost_link
        .start_advertising(DiscoveryInfo::with_name("Ghost"))
        .await
        .unwrap();

    let (_a, rocky) = session(&medium, "Rocky", config());
    let rocky = start(rocky);

    wait_until("invitation attempt", || {
        rocky.registry().status(&ghost) == Some(PeerStatus::Connecting)
    })
    .await;
    medium.drop_node(&ghost);

    wait_until("ghost removed", || rocky.registry().get(&ghost).is_none()).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(rocky.registry().snapshot().is_empty());
}

/// Every send to `refuse` fails as if its link had broken underneath.
struct RefusingLink {
    inner: MemoryLink,
    refuse: PeerId,
}

#[async_trait]
impl Connectivity for RefusingLink {
    fn local_id(&self) -> PeerId {
        self.inner.local_id()
    }
    async fn start_advertising(&self, info: DiscoveryInfo) -> rockmesh_presence::Result<()> {
        self.inner.start_advertising(info).await
    }
    async fn stop_advertising(&self) -> rockmesh_presence::Result<()> {
        self.inner.stop_advertising().await
    }
    async fn start_browsing(&self) -> rockmesh_presence::Result<()> {
        self.inner.start_browsing().await
    }
    async fn stop_browsing(&self) -> rockmesh_presence::Result<()> {
        self.inner.stop_browsing().await
    }
    async fn invite(&self, peer: PeerId) -> rockmesh_presence::Result<()> {
        self.inner.invite(peer).await
    }
    async fn respond_to_invitation(&self, peer: PeerId, accept: bool) -> rockmesh_presence::Result<()> {
        self.inner.respond_to_invitation(peer, accept).await
    }
    async fn send(&self, peer: PeerId, bytes: Bytes) -> rockmesh_presence::Result<()> {
        if peer == self.refuse {
            return Err(PresenceError::NotConnected(peer));
        }
        self.inner.send(peer, bytes).await
    }
    async fn disconnect(&self, peer: PeerId) -> rockmesh_presence::Result<()> {
        self.inner.disconnect(peer).await
    }
}

/// One broken link does not keep a broadcast from the other peers
#[tokio::test]
async fn test_broadcast_survives_failing_peer() {
    let medium = MemoryMedium::new();
    let a = PeerId::random();
    let (b, pebbles) = session(&medium, "Pebbles", config());
    let (c, gravel) = session(&medium, "Gravel", config());

    let (link, events) = medium.join(a);
    let local = LocalPresence::new(PeerIdentity::new(a, "Rocky"));
    let rocky = TransportSession::new(
        config(),
        local,
        Arc::new(RefusingLink {
            inner: link,
            refuse: c,
        }),
        events,
    );

    let rocky = start(rocky);
    let pebbles = start(pebbles);
    let gravel = start(gravel);
    wait_until("all connected to Rocky", || {
        is_connected(&rocky, &b)
            && is_connected(&rocky, &c)
            && is_connected(&pebbles, &a)
            && is_connected(&gravel, &a)
    })
    .await;

    rocky
        .broadcast(Message::PositionUpdate(Point::new(12.0, 34.0)))
        .unwrap();

    wait_until("position at Pebbles", || {
        pebbles.registry().get(&a).and_then(|p| p.position) == Some(Point::new(12.0, 34.0))
    })
    .await;
    assert!(gravel.registry().get(&a).unwrap().position.is_none());
    assert!(is_connected(&rocky, &c));
}

/// A purged peer that shows up again starts over as a new, unplaced entry
#[tokio::test]
async fn test_rediscovered_peer_starts_fresh() {
    let medium = MemoryMedium::new();
    let raw = PeerId::random();
    let (raw_link, mut raw_events) = medium.join(raw);
    raw_link
        .start_advertising(DiscoveryInfo::with_name("Gravel"))
        .await
        .unwrap();

    let (a, rocky) = session(&medium, "Rocky", config());
    let rocky = start(rocky);

    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), raw_events.recv())
            .await
            .expect("no invitation")
            .expect("medium closed");
        if matches!(event, LinkEvent::InvitationReceived { .. }) {
            break;
        }
    }
    raw_link.respond_to_invitation(a, true).await.unwrap();
    wait_until("connected", || is_connected(&rocky, &raw)).await;

    raw_link
        .send(a, Message::PositionUpdate(Point::new(5.0, 6.0)).encode().unwrap())
        .await
        .unwrap();
    wait_until("position", || {
        rocky.registry().get(&raw).and_then(|p| p.position).is_some()
    })
    .await;

    raw_link.disconnect(a).await.unwrap();
    wait_until("purge", || rocky.registry().get(&raw).is_none()).await;

    medium.set_responsive(&raw, false);
    raw_link.stop_advertising().await.unwrap();
    raw_link
        .start_advertising(DiscoveryInfo::with_name("Gravel"))
        .await
        .unwrap();

    wait_until("rediscovered and timed out", || {
        rocky.registry().status(&raw) == Some(PeerStatus::Discovering)
    })
    .await;
    let state = rocky.registry().get(&raw).unwrap();
    assert_eq!(state.name(), "Gravel");
    assert!(state.position.is_none());
}
