use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{PresenceError, Result};
use crate::link::{Connectivity, DiscoveryInfo, LinkEvent, LinkEvents, LinkState};
use crate::peer::PeerId;

const MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 82, 77);
const MULTICAST_PORT: u16 = 7078;
const ANNOUNCE_MAGIC: &[u8] = b"ROCKS";
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(2);
const PEER_EXPIRY: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const ANSWER_TIMEOUT: Duration = Duration::from_secs(30);
const SEND_QUEUE: usize = 256;

pub const MAX_FRAME_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Announcement {
    peer_id: PeerId,
    tcp_port: u16,
    info: DiscoveryInfo,
    leaving: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum LinkFrame {
    Hello { peer_id: PeerId, info: DiscoveryInfo },
    Accept,
    Decline,
    Data(Vec<u8>),
}

fn encode_announcement(announcement: &Announcement) -> Result<Vec<u8>> {
    let mut packet = ANNOUNCE_MAGIC.to_vec();
    packet.extend_from_slice(&bincode::serialize(announcement)?);
    Ok(packet)
}

fn parse_announcement(data: &[u8]) -> Option<Announcement> {
    let body = data.strip_prefix(ANNOUNCE_MAGIC)?;
    bincode::deserialize(body).ok()
}

async fn write_frame<W>(writer: &mut W, frame: &LinkFrame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = bincode::serialize(frame)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(PresenceError::Link(format!(
            "frame of {} bytes exceeds limit",
            body.len()
        )));
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// `Ok(None)` on a clean end of stream.
async fn read_frame<R>(reader: &mut R) -> Result<Option<LinkFrame>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_SIZE {
        return Err(PresenceError::Link(format!(
            "frame of {} bytes exceeds limit",
            len
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(bincode::deserialize(&body)?))
}

fn multicast_socket() -> Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, MULTICAST_PORT)).into())?;
    socket.join_multicast_v4(&MULTICAST_ADDR, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

struct Seen {
    addr: SocketAddr,
    last_seen: Instant,
}

struct Link {
    conn_id: u64,
    writer: mpsc::Sender<LinkFrame>,
}

#[derive(Default)]
struct LanState {
    advertising: Option<DiscoveryInfo>,
    browsing: bool,
    seen: HashMap<PeerId, Seen>,
    dialing: HashSet<PeerId>,
    pending_inbound: HashMap<PeerId, TcpStream>,
    /// Inbound invitations taken out of `pending_inbound` whose answer is
    /// still being written.
    answering: HashSet<PeerId>,
    links: HashMap<PeerId, Link>,
    next_conn: u64,
}

impl LanState {
    /// True when `peer` is linked, or its own invitation to us is still
    /// open, so a declined dial is not the end of the attempt.
    fn has_other_connection(&self, peer: &PeerId) -> bool {
        self.links.contains_key(peer)
            || self.pending_inbound.contains_key(peer)
            || self.answering.contains(peer)
    }
}

struct Shared {
    id: PeerId,
    tcp_port: u16,
    socket: UdpSocket,
    state: Mutex<LanState>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl Shared {
    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    fn emit_state(&self, peer: PeerId, state: LinkState) {
        self.emit(LinkEvent::StateChanged { peer, state });
    }

    async fn announce(&self, info: DiscoveryInfo, leaving: bool) -> Result<()> {
        let packet = encode_announcement(&Announcement {
            peer_id: self.id,
            tcp_port: self.tcp_port,
            info,
            leaving,
        })?;
        self.socket
            .send_to(&packet, SocketAddr::from((MULTICAST_ADDR, MULTICAST_PORT)))
            .await?;
        Ok(())
    }

    fn on_announcement(&self, announcement: Announcement, src: SocketAddr) {
        let peer = announcement.peer_id;
        let mut state = self.state.lock();

        if announcement.leaving {
            if state.seen.remove(&peer).is_some() && state.browsing {
                self.emit(LinkEvent::PeerLost { peer });
            }
            return;
        }

        let addr = SocketAddr::new(src.ip(), announcement.tcp_port);
        if state
            .seen
            .insert(
                peer,
                Seen {
                    addr,
                    last_seen: Instant::now(),
                },
            )
            .is_none()
        {
            debug!("Heard announcement from {} at {}", peer, addr);
        }

        if state.browsing && !state.links.contains_key(&peer) {
            self.emit(LinkEvent::PeerFound {
                peer,
                info: announcement.info,
            });
        }
    }

    fn expire_peers(&self) {
        let mut state = self.state.lock();
        let expired: Vec<PeerId> = state
            .seen
            .iter()
            .filter(|(_, seen)| seen.last_seen.elapsed() > PEER_EXPIRY)
            .map(|(peer, _)| *peer)
            .collect();

        for peer in expired {
            state.seen.remove(&peer);
            debug!("Announcements from {} expired", peer);
            if state.browsing {
                self.emit(LinkEvent::PeerLost { peer });
            }
        }
    }

    /// Registers a handshaken stream as the link to `peer` and starts its
    /// reader and writer. A second link to the same peer is discarded.
    fn establish(self: &Arc<Self>, peer: PeerId, stream: TcpStream) {
        let (read_half, write_half) = stream.into_split();
        let (writer_tx, writer_rx) = mpsc::channel(SEND_QUEUE);

        let conn_id = {
            let mut state = self.state.lock();
            if state.links.contains_key(&peer) {
                debug!("Discarding duplicate link to {}", peer);
                return;
            }
            state.next_conn += 1;
            let conn_id = state.next_conn;
            state.links.insert(
                peer,
                Link {
                    conn_id,
                    writer: writer_tx,
                },
            );
            conn_id
        };

        tokio::spawn(run_writer(peer, write_half, writer_rx));
        tokio::spawn(run_reader(Arc::clone(self), peer, conn_id, read_half));
        info!("Link to {} established", peer);
        self.emit_state(peer, LinkState::Connected);
    }
}

async fn run_announcer(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(ANNOUNCE_INTERVAL);
    loop {
        ticker.tick().await;

        let info = shared.state.lock().advertising.clone();
        let Some(info) = info else {
            continue;
        };
        if let Err(e) = shared.announce(info, false).await {
            warn!("Failed to send multicast announcement: {}", e);
        }
    }
}

async fn run_listener(shared: Arc<Shared>) {
    let mut buf = vec![0u8; 2048];
    let mut sweep = tokio::time::interval(ANNOUNCE_INTERVAL);

    loop {
        tokio::select! {
            received = shared.socket.recv_from(&mut buf) => match received {
                Ok((len, src)) => {
                    let Some(announcement) = parse_announcement(&buf[..len]) else {
                        debug!("Ignoring foreign datagram from {}", src);
                        continue;
                    };
                    if announcement.peer_id != shared.id {
                        shared.on_announcement(announcement, src);
                    }
                }
                Err(e) => {
                    warn!("UDP recv error: {}", e);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            },
            _ = sweep.tick() => shared.expire_peers(),
        }
    }
}

async fn run_acceptor(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tokio::spawn(receive_hello(Arc::clone(&shared), stream, addr));
            }
            Err(e) => {
                warn!("TCP accept error: {}", e);
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
    }
}

async fn receive_hello(shared: Arc<Shared>, mut stream: TcpStream, addr: SocketAddr) {
    let (peer, info) = match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut stream)).await
    {
        Ok(Ok(Some(LinkFrame::Hello { peer_id, info }))) => (peer_id, info),
        Ok(Ok(_)) => {
            debug!("Unexpected opening frame from {}", addr);
            return;
        }
        Ok(Err(e)) => {
            debug!("Handshake with {} failed: {}", addr, e);
            return;
        }
        Err(_) => {
            debug!("Handshake with {} timed out", addr);
            return;
        }
    };

    // Crossed dials: the lower id keeps its outbound attempt.
    let redundant = {
        let state = shared.state.lock();
        state.links.contains_key(&peer) || (state.dialing.contains(&peer) && shared.id < peer)
    };
    if redundant {
        debug!("Declining redundant connection from {}", peer);
        let _ = write_frame(&mut stream, &LinkFrame::Decline).await;
        return;
    }

    shared.state.lock().pending_inbound.insert(peer, stream);
    shared.emit(LinkEvent::InvitationReceived { peer, info });
}

async fn dial(shared: Arc<Shared>, peer: PeerId, addr: SocketAddr, info: DiscoveryInfo) -> Result<()> {
    let mut stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| PresenceError::ConnectTimeout(peer))??;
    stream.set_nodelay(true)?;

    write_frame(
        &mut stream,
        &LinkFrame::Hello {
            peer_id: shared.id,
            info,
        },
    )
    .await?;

    let reply = tokio::time::timeout(ANSWER_TIMEOUT, read_frame(&mut stream))
        .await
        .map_err(|_| PresenceError::ConnectTimeout(peer))??;
    match reply {
        Some(LinkFrame::Accept) => {
            shared.establish(peer, stream);
            Ok(())
        }
        Some(LinkFrame::Decline) => {
            debug!("{} declined our invitation", peer);
            if !shared.state.lock().has_other_connection(&peer) {
                shared.emit_state(peer, LinkState::NotConnected);
            }
            Ok(())
        }
        Some(_) => Err(PresenceError::Link("unexpected handshake reply".to_string())),
        None => Err(PresenceError::Link("connection closed during handshake".to_string())),
    }
}

async fn run_writer(peer: PeerId, mut writer: OwnedWriteHalf, mut frames: mpsc::Receiver<LinkFrame>) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            debug!("Writing to {} failed: {}", peer, e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn run_reader(shared: Arc<Shared>, peer: PeerId, conn_id: u64, mut reader: OwnedReadHalf) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(LinkFrame::Data(bytes))) => shared.emit(LinkEvent::Data {
                peer,
                bytes: Bytes::from(bytes),
            }),
            Ok(Some(_)) => debug!("Ignoring control frame from {}", peer),
            Ok(None) => break,
            Err(e) => {
                debug!("Link to {} failed: {}", peer, e);
                break;
            }
        }
    }

    let mut state = shared.state.lock();
    if state.links.get(&peer).map(|link| link.conn_id) == Some(conn_id) {
        state.links.remove(&peer);
        drop(state);
        info!("Link to {} closed", peer);
        shared.emit_state(peer, LinkState::NotConnected);
    }
}

/// Local-network connectivity: presence is announced over UDP multicast and
/// each accepted invitation becomes a TCP connection carrying length-prefixed
/// frames.
pub struct LanConnectivity {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl LanConnectivity {
    /// Binds the multicast socket and a TCP listener on `tcp_port` (0 picks
    /// any free port).
    pub async fn bind(id: PeerId, tcp_port: u16) -> Result<(Self, LinkEvents)> {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, tcp_port))).await?;
        let tcp_port = listener.local_addr()?.port();
        let socket = UdpSocket::from_std(multicast_socket()?)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            id,
            tcp_port,
            socket,
            state: Mutex::new(LanState::default()),
            events: events_tx,
        });

        let tasks = vec![
            tokio::spawn(run_announcer(Arc::clone(&shared))),
            tokio::spawn(run_listener(Arc::clone(&shared))),
            tokio::spawn(run_acceptor(Arc::clone(&shared), listener)),
        ];

        info!(
            "LAN connectivity on tcp/{} with announcements on {}:{}",
            tcp_port, MULTICAST_ADDR, MULTICAST_PORT
        );
        Ok((Self { shared, tasks }, events_rx))
    }

    pub fn tcp_port(&self) -> u16 {
        self.shared.tcp_port
    }
}

impl Drop for LanConnectivity {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        let mut state = self.shared.state.lock();
        state.links.clear();
        state.pending_inbound.clear();
        state.answering.clear();
    }
}

#[async_trait]
impl Connectivity for LanConnectivity {
    fn local_id(&self) -> PeerId {
        self.shared.id
    }

    async fn start_advertising(&self, info: DiscoveryInfo) -> Result<()> {
        self.shared.state.lock().advertising = Some(info.clone());
        self.shared.announce(info, false).await?;
        info!("Advertising as {}", self.shared.id);
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<()> {
        let previous = self.shared.state.lock().advertising.take();
        if let Some(info) = previous {
            self.shared.announce(info, true).await?;
            info!("Stopped advertising");
        }
        Ok(())
    }

    async fn start_browsing(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.browsing = true;
        info!("Browsing for peers ({} already heard)", state.seen.len());
        Ok(())
    }

    async fn stop_browsing(&self) -> Result<()> {
        self.shared.state.lock().browsing = false;
        Ok(())
    }

    async fn invite(&self, peer: PeerId) -> Result<()> {
        let (addr, info) = {
            let mut state = self.shared.state.lock();
            if state.links.contains_key(&peer) || state.dialing.contains(&peer) {
                return Ok(());
            }
            let addr = state
                .seen
                .get(&peer)
                .map(|seen| seen.addr)
                .ok_or(PresenceError::PeerNotFound(peer))?;
            state.dialing.insert(peer);
            (addr, state.advertising.clone().unwrap_or_default())
        };

        self.shared.emit_state(peer, LinkState::Connecting);
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            if let Err(e) = dial(Arc::clone(&shared), peer, addr, info).await {
                warn!("Connecting to {} at {} failed: {}", peer, addr, e);
            }
            shared.state.lock().dialing.remove(&peer);
        });
        Ok(())
    }

    async fn respond_to_invitation(&self, peer: PeerId, accept: bool) -> Result<()> {
        let mut stream = {
            let mut state = self.shared.state.lock();
            let stream = state
                .pending_inbound
                .remove(&peer)
                .ok_or_else(|| PresenceError::Link(format!("no pending invitation from {}", peer)))?;
            state.answering.insert(peer);
            stream
        };

        let result = async {
            if !accept {
                return write_frame(&mut stream, &LinkFrame::Decline).await;
            }
            stream.set_nodelay(true)?;
            write_frame(&mut stream, &LinkFrame::Accept).await?;
            self.shared.establish(peer, stream);
            Ok(())
        }
        .await;

        self.shared.state.lock().answering.remove(&peer);
        result
    }

    async fn send(&self, peer: PeerId, bytes: Bytes) -> Result<()> {
        let writer = self
            .shared
            .state
            .lock()
            .links
            .get(&peer)
            .map(|link| link.writer.clone())
            .ok_or(PresenceError::NotConnected(peer))?;

        writer
            .try_send(LinkFrame::Data(bytes.to_vec()))
            .map_err(|e| PresenceError::Link(format!("send queue to {}: {}", peer, e)))
    }

    async fn disconnect(&self, peer: PeerId) -> Result<()> {
        let removed = self.shared.state.lock().links.remove(&peer);
        if removed.is_some() {
            info!("Disconnected from {}", peer);
            self.shared.emit_state(peer, LinkState::NotConnected);
        }
        Ok(())
    }
}
