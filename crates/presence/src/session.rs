use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use rockmesh_sensor::{
    DiscoveryToken, GeoSample, GeoStream, GeolocationProvider, RangingEvent, RangingProvider,
    SensorError,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::PresenceConfig;
use crate::error::{PresenceError, Result};
use crate::link::{Connectivity, DiscoveryInfo, LinkEvent, LinkEvents, LinkState};
use crate::peer::{PeerId, PeerIdentity, PeerStatus};
use crate::registry::{LocalPresence, PeerRegistry};
use crate::resolver::{PositionResolver, PositioningMode};
use crate::wire::Message;

enum Command {
    Rename(String),
    Broadcast(Message),
    SendTo { peer: PeerId, message: Message },
    InviteTimedOut { peer: PeerId, attempt: u64 },
    Shutdown,
}

/// Link operations, executed one at a time and in order by the link worker.
enum LinkJob {
    Send {
        peers: Vec<PeerId>,
        bytes: Bytes,
        kind: &'static str,
    },
    Invite(PeerId),
    Respond {
        peer: PeerId,
        accept: bool,
    },
    Readvertise(DiscoveryInfo),
}

/// Cloneable control surface for a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    registry: PeerRegistry,
    local: LocalPresence,
}

impl SessionHandle {
    /// Rename the local rock: advertising restarts with the new name and every
    /// connected peer receives a name update.
    pub fn rename(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.local.rename(name.clone());
        self.send(Command::Rename(name))
    }

    /// Fan a message out to every connected peer.
    pub fn broadcast(&self, message: Message) -> Result<()> {
        self.send(Command::Broadcast(message))
    }

    pub fn send_to(&self, peer: PeerId, message: Message) -> Result<()> {
        self.send(Command::SendTo { peer, message })
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn local(&self) -> &LocalPresence {
        &self.local
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| PresenceError::ChannelClosed)
    }
}

/// Owns discovery, connection lifecycle and message routing for one device.
///
/// Link events, sensing updates, timers and handle commands all funnel into
/// a single loop, which is the only writer of the peer registry. Link I/O is
/// handed to a separate worker so the loop never waits on the network.
pub struct TransportSession {
    config: PresenceConfig,
    link: Arc<dyn Connectivity>,
    events: Option<LinkEvents>,
    registry: PeerRegistry,
    local: LocalPresence,
    resolver: PositionResolver,
    geolocation: Option<Arc<dyn GeolocationProvider>>,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: Option<mpsc::UnboundedReceiver<Command>>,
    jobs_tx: mpsc::UnboundedSender<LinkJob>,
    jobs_rx: Option<mpsc::UnboundedReceiver<LinkJob>>,
    attempts: HashMap<PeerId, u64>,
    next_attempt: u64,
}

impl TransportSession {
    pub fn new(
        config: PresenceConfig,
        local: LocalPresence,
        link: Arc<dyn Connectivity>,
        events: LinkEvents,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let resolver = PositionResolver::new(config.bounds, config.ranging_scale, local.clone());

        Self {
            config,
            link,
            events: Some(events),
            registry: PeerRegistry::new(),
            local,
            resolver,
            geolocation: None,
            commands_tx,
            commands_rx: Some(commands_rx),
            jobs_tx,
            jobs_rx: Some(jobs_rx),
            attempts: HashMap::new(),
            next_attempt: 0,
        }
    }

    pub fn with_ranging(mut self, provider: Arc<dyn RangingProvider>) -> Self {
        self.resolver = self.resolver.with_ranging(provider);
        self
    }

    pub fn with_geolocation(mut self, provider: Arc<dyn GeolocationProvider>) -> Self {
        self.geolocation = Some(provider);
        self
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            commands: self.commands_tx.clone(),
            registry: self.registry.clone(),
            local: self.local.clone(),
        }
    }

    pub fn registry(&self) -> PeerRegistry {
        self.registry.clone()
    }

    pub async fn run(mut self) -> Result<()> {
        self.config.validate()?;

        let mut events = self.events.take().ok_or(PresenceError::ChannelClosed)?;
        let mut commands = self
            .commands_rx
            .take()
            .ok_or(PresenceError::ChannelClosed)?;
        let jobs = self.jobs_rx.take().ok_or(PresenceError::ChannelClosed)?;
        tokio::spawn(run_link_worker(Arc::clone(&self.link), jobs));

        self.link
            .start_advertising(DiscoveryInfo::with_name(self.local.name()))
            .await?;
        self.link.start_browsing().await?;
        info!(
            "Presence session started as {} ({}) on service {}",
            self.local.name(),
            self.local.id(),
            self.config.service_type
        );

        let mut geo_stream = self.start_geolocation().await;
        let mut ranging_stream = match self.config.mode {
            PositioningMode::Ranging => self.resolver.ranging_events(),
            PositioningMode::Geolocation => None,
        };

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_link_event(event),
                    None => {
                        info!("Link event stream closed");
                        break;
                    }
                },
                Some(command) = commands.recv() => {
                    if !self.handle_command(command) {
                        break;
                    }
                }
                sample = next_item(&mut geo_stream) => match sample {
                    Some(sample) => self.handle_geolocation(sample),
                    None => geo_stream = None,
                },
                event = next_item(&mut ranging_stream) => match event {
                    Some(event) => self.handle_ranging_event(event),
                    None => ranging_stream = None,
                },
            }
        }

        self.teardown().await;
        Ok(())
    }

    async fn start_geolocation(&self) -> Option<GeoStream> {
        if self.config.mode != PositioningMode::Geolocation {
            return None;
        }
        let provider = self.geolocation.as_ref()?;
        let stream = provider.subscribe();

        match provider.start().await {
            Ok(()) | Err(SensorError::AlreadyRunning) => Some(stream),
            Err(e) => {
                warn!("{}", PresenceError::SensingUnavailable(e.to_string()));
                None
            }
        }
    }

    async fn teardown(&self) {
        for peer in self.registry.connected_ids() {
            if let Err(e) = self.link.disconnect(peer).await {
                debug!("Disconnecting {}: {}", peer, e);
            }
        }
        if let Err(e) = self.link.stop_browsing().await {
            debug!("Stopping browsing: {}", e);
        }
        if let Err(e) = self.link.stop_advertising().await {
            debug!("Stopping advertising: {}", e);
        }
        if let Some(provider) = &self.geolocation {
            let _ = provider.stop().await;
        }
        info!("Presence session stopped");
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::PeerFound { peer, info } => self.on_peer_found(peer, info),
            LinkEvent::PeerLost { peer } => self.on_peer_lost(peer),
            LinkEvent::InvitationReceived { peer, info } => self.on_invitation(peer, info),
            LinkEvent::StateChanged { peer, state } => self.on_state_changed(peer, state),
            LinkEvent::Data { peer, bytes } => self.on_data(peer, bytes),
        }
    }

    /// Returns `false` when the loop should stop.
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Rename(name) => {
                info!("Renamed to {}, restarting advertising", name);
                self.enqueue(LinkJob::Readvertise(DiscoveryInfo::with_name(name.clone())));
                self.broadcast(Message::NameUpdate(name));
            }
            Command::Broadcast(message) => self.broadcast(message),
            Command::SendTo { peer, message } => {
                if self.registry.status(&peer) == Some(PeerStatus::Connected) {
                    self.send_to(vec![peer], &message);
                } else {
                    warn!("{}", PresenceError::NotConnected(peer));
                }
            }
            Command::InviteTimedOut { peer, attempt } => self.on_invite_timeout(peer, attempt),
            Command::Shutdown => return false,
        }
        true
    }

    fn on_peer_found(&mut self, peer: PeerId, info: DiscoveryInfo) {
        if peer == self.local.id() {
            return;
        }
        let name = advertised_name(peer, &info);

        match self.registry.status(&peer) {
            None => {
                info!("Found peer {} ({})", name, peer);
                self.registry.upsert_peer(PeerIdentity::new(peer, name));
            }
            Some(PeerStatus::Discovering) => {
                self.registry.set_name(&peer, name);
            }
            Some(status) => {
                debug!("Peer {} rediscovered while {}", peer, status);
                return;
            }
        }

        self.begin_attempt(peer);
        self.enqueue(LinkJob::Invite(peer));
    }

    /// Peers that never connected are dropped, along with any pending
    /// invitation timer. Connected peers stay until their link goes down.
    fn on_peer_lost(&mut self, peer: PeerId) {
        match self.registry.status(&peer) {
            Some(PeerStatus::Discovering) | Some(PeerStatus::Connecting) => {
                info!("Lost peer {}", peer);
                self.attempts.remove(&peer);
                self.registry.remove(&peer);
            }
            _ => debug!("Peer {} stopped advertising", peer),
        }
    }

    fn on_invitation(&mut self, peer: PeerId, info: DiscoveryInfo) {
        if peer == self.local.id() {
            return;
        }
        info!("Accepting invitation from {}", peer);

        self.registry
            .upsert_peer(PeerIdentity::new(peer, advertised_name(peer, &info)));
        if self.registry.status(&peer) == Some(PeerStatus::Discovering) {
            self.begin_attempt(peer);
        }
        self.enqueue(LinkJob::Respond { peer, accept: true });
    }

    fn on_state_changed(&mut self, peer: PeerId, state: LinkState) {
        match state {
            LinkState::Connecting => {
                self.registry
                    .upsert_peer(PeerIdentity::new(peer, peer.short_id()));
                if self.registry.status(&peer) == Some(PeerStatus::Discovering) {
                    self.begin_attempt(peer);
                }
            }
            LinkState::Connected => {
                self.attempts.remove(&peer);
                self.registry
                    .upsert_peer(PeerIdentity::new(peer, peer.short_id()));
                if !self.registry.set_status(&peer, PeerStatus::Connected) {
                    return;
                }
                info!("Connected to {}", peer);
                self.greet(peer);
            }
            LinkState::NotConnected => {
                self.attempts.remove(&peer);
                if self.registry.set_status(&peer, PeerStatus::Disconnected) {
                    info!("Disconnected from {}", peer);
                }
                let resolver = self.resolver.clone();
                tokio::spawn(async move { resolver.forget(&peer).await });
            }
        }
    }

    fn on_data(&mut self, peer: PeerId, bytes: Bytes) {
        let message = match Message::decode(&bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed message from {}: {}", peer, e);
                return;
            }
        };
        debug!("Received {} from {}", message.kind(), peer);

        match message {
            Message::NameUpdate(name) => {
                if !self.registry.set_name(&peer, name) {
                    debug!("Name update from {} changed nothing", peer);
                }
            }
            Message::PositionUpdate(point) => {
                if !self.registry.set_position(&peer, point) {
                    debug!("Ignoring late position from {}", peer);
                }
            }
            Message::RangingToken(token) => {
                if self.registry.status(&peer) != Some(PeerStatus::Connected) {
                    debug!("Ignoring ranging token from unconnected {}", peer);
                    return;
                }
                let resolver = self.resolver.clone();
                tokio::spawn(async move {
                    if let Err(e) = resolver
                        .start_ranging(peer, DiscoveryToken::new(token))
                        .await
                    {
                        warn!("Cannot range with {}: {}", peer, e);
                    }
                });
            }
        }
    }

    fn handle_geolocation(&mut self, sample: GeoSample) {
        if let Some(message) = self.resolver.on_geolocation(sample) {
            self.broadcast(message);
        }
    }

    fn handle_ranging_event(&mut self, event: RangingEvent) {
        match event {
            RangingEvent::Update(update) => {
                self.resolver.on_ranging_update(&self.registry, update);
            }
            RangingEvent::Suspended => info!("Ranging session suspended"),
            RangingEvent::SuspensionEnded | RangingEvent::Invalidated(_) => {
                if let RangingEvent::Invalidated(reason) = &event {
                    warn!("Ranging session invalidated: {}", reason);
                }
                let resolver = self.resolver.clone();
                let commands = self.commands_tx.clone();
                tokio::spawn(async move {
                    match resolver.resume().await {
                        Ok(Some(token)) => {
                            let message = Message::RangingToken(token.as_bytes().to_vec());
                            let _ = commands.send(Command::Broadcast(message));
                        }
                        Ok(None) => {}
                        Err(e) => warn!("Failed to resume ranging: {}", e),
                    }
                });
            }
        }
    }

    fn on_invite_timeout(&mut self, peer: PeerId, attempt: u64) {
        if self.attempts.get(&peer) != Some(&attempt) {
            return;
        }
        self.attempts.remove(&peer);

        if self.registry.status(&peer) == Some(PeerStatus::Connecting) {
            warn!("{}", PresenceError::ConnectTimeout(peer));
            self.registry.set_status(&peer, PeerStatus::Discovering);
        }
    }

    fn begin_attempt(&mut self, peer: PeerId) {
        self.registry.set_status(&peer, PeerStatus::Connecting);

        self.next_attempt += 1;
        let attempt = self.next_attempt;
        self.attempts.insert(peer, attempt);

        let commands = self.commands_tx.clone();
        let timeout = self.config.invite_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = commands.send(Command::InviteTimedOut { peer, attempt });
        });
    }

    /// Name first, then whatever the new peer needs to place us.
    fn greet(&self, peer: PeerId) {
        let mut messages = vec![Message::NameUpdate(self.local.name())];

        match self.config.mode {
            PositioningMode::Ranging => match self.resolver.local_token() {
                Some(token) => messages.push(Message::RangingToken(token.as_bytes().to_vec())),
                None => warn!(
                    "{}",
                    PresenceError::SensingUnavailable("no local discovery token".to_string())
                ),
            },
            PositioningMode::Geolocation => {
                if let Some(point) = self.local.position() {
                    messages.push(Message::PositionUpdate(point));
                }
            }
        }

        for message in messages {
            self.send_to(vec![peer], &message);
        }
    }

    fn broadcast(&self, message: Message) {
        let peers = self.registry.connected_ids();
        if peers.is_empty() {
            debug!("No connected peers for {}", message.kind());
            return;
        }
        self.send_to(peers, &message);
    }

    fn send_to(&self, peers: Vec<PeerId>, message: &Message) {
        match message.encode() {
            Ok(bytes) => self.enqueue(LinkJob::Send {
                peers,
                bytes,
                kind: message.kind(),
            }),
            Err(e) => warn!("Not sending {}: {}", message.kind(), e),
        }
    }

    fn enqueue(&self, job: LinkJob) {
        if self.jobs_tx.send(job).is_err() {
            warn!("Link worker is gone");
        }
    }
}

async fn run_link_worker(link: Arc<dyn Connectivity>, mut jobs: mpsc::UnboundedReceiver<LinkJob>) {
    while let Some(job) = jobs.recv().await {
        match job {
            LinkJob::Send { peers, bytes, kind } => {
                for peer in peers {
                    match link.send(peer, bytes.clone()).await {
                        Ok(()) => debug!("Sent {} to {}", kind, peer),
                        Err(e) => {
                            let failure = PresenceError::SendFailure {
                                peer,
                                reason: e.to_string(),
                            };
                            warn!("{}", failure);
                        }
                    }
                }
            }
            LinkJob::Invite(peer) => {
                if let Err(e) = link.invite(peer).await {
                    warn!("Invitation to {} failed: {}", peer, e);
                }
            }
            LinkJob::Respond { peer, accept } => {
                if let Err(e) = link.respond_to_invitation(peer, accept).await {
                    warn!("Answering invitation from {} failed: {}", peer, e);
                }
            }
            LinkJob::Readvertise(info) => {
                if let Err(e) = link.stop_advertising().await {
                    warn!("Failed to stop advertising: {}", e);
                }
                if let Err(e) = link.start_advertising(info).await {
                    warn!("Failed to restart advertising: {}", e);
                }
            }
        }
    }
}

fn advertised_name(peer: PeerId, info: &DiscoveryInfo) -> String {
    info.name()
        .map(str::to_string)
        .unwrap_or_else(|| peer.short_id())
}

async fn next_item<S>(stream: &mut Option<S>) -> Option<S::Item>
where
    S: Stream + Unpin,
{
    match stream.as_mut() {
        Some(stream) => stream.next().await,
        None => futures::future::pending().await,
    }
}
