//! The DPT UDP server (§4.7): request/response correlation by message hash,
//! a short-lived dedup cache, and dispatch of incoming packets to peers or
//! to the higher-level routing table.

use super::error::DiscoveryError;
use super::packet::{self, FindNeighboursMessage, Message, NeighboursMessage, Node, PingMessage, PongMessage};
use crate::types::{Endpoint, NodeId, Peer, RoutingTable};
use k256::ecdsa::SigningKey;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

const DEDUP_CACHE_CAPACITY: usize = 1000;
const DEDUP_TTL: Duration = Duration::from_secs(1);
const ADOPT_DELAY: Duration = Duration::from_millis(100);
const MESSAGE_TTL_SECS: u64 = 60;
const MAX_DATAGRAM: usize = 1280;

/// A cloneable stand-in for the two `ping` failure modes that must fan out to
/// every deduped caller via a broadcast channel; `DiscoveryError` itself isn't
/// `Clone` because it wraps `std::io::Error`.
#[derive(Debug, Clone)]
enum PingFailure {
    Timeout(String),
    Destroyed,
}

impl From<PingFailure> for DiscoveryError {
    fn from(failure: PingFailure) -> Self {
        match failure {
            PingFailure::Timeout(key) => DiscoveryError::Timeout(key),
            PingFailure::Destroyed => DiscoveryError::Destroyed,
        }
    }
}

type PingOutcome = Result<Peer, PingFailure>;

pub struct ServerConfig {
    pub endpoint: Endpoint,
    pub timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::new("0.0.0.0".parse().unwrap(), None, None),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ServerEvent {
    Listening,
    Close,
    Error(String),
    Peers(Vec<Endpoint>),
}

struct PendingRequest {
    peer: Peer,
    rckey: String,
    sender: broadcast::Sender<PingOutcome>,
}

/// `resolved` is filled in once the request that created this entry settles
/// (pong or timeout), so a caller arriving after that point reads the cached
/// outcome directly instead of subscribing to a channel nothing will ever
/// send on again.
struct DedupEntry {
    sender: broadcast::Sender<PingOutcome>,
    inserted_at: Instant,
    resolved: Option<PingOutcome>,
}

/// What `ping` found in the dedup cache for an in-flight request.
enum DedupHit {
    Resolved(PingOutcome),
    Pending(broadcast::Receiver<PingOutcome>),
}

#[derive(Default)]
struct Inner {
    pending: HashMap<[u8; 32], PendingRequest>,
    dedup: HashMap<String, DedupEntry>,
    destroyed: bool,
}

impl Inner {
    fn prune_dedup(&mut self) {
        self.dedup.retain(|_, entry| entry.inserted_at.elapsed() < DEDUP_TTL);
        if self.dedup.len() >= DEDUP_CACHE_CAPACITY {
            if let Some(oldest_key) = self
                .dedup
                .iter()
                .min_by_key(|(_, entry)| entry.inserted_at)
                .map(|(key, _)| key.clone())
            {
                self.dedup.remove(&oldest_key);
            }
        }
    }
}

fn expiration() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
        + MESSAGE_TTL_SECS
}

/// The DPT server. Cheap to clone: internal state is behind `Arc`.
#[derive(Clone)]
pub struct Server {
    socket: Arc<UdpSocket>,
    inner: Arc<Mutex<Inner>>,
    signing_key: Arc<SigningKey>,
    local_id: NodeId,
    local_endpoint: Endpoint,
    routing_table: Arc<dyn RoutingTable>,
    events: mpsc::UnboundedSender<ServerEvent>,
    timeout: Duration,
}

impl Server {
    /// Opens the UDP socket, spawns the read loop, and emits `Listening`.
    pub async fn bind(
        config: ServerConfig,
        signing_key: SigningKey,
        routing_table: Arc<dyn RoutingTable>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerEvent>), DiscoveryError> {
        let bind_addr = SocketAddr::new(config.endpoint.address, config.endpoint.udp_port.unwrap_or(0));
        let socket = UdpSocket::bind(bind_addr).await?;
        let local_id = crate::rlpx::utils::pubkey2id(&signing_key.verifying_key().into());

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let server = Server {
            socket: Arc::new(socket),
            inner: Arc::new(Mutex::new(Inner::default())),
            signing_key: Arc::new(signing_key),
            local_id,
            local_endpoint: config.endpoint,
            routing_table,
            events: events_tx,
            timeout: config.timeout,
        };

        let read_loop_server = server.clone();
        tokio::spawn(async move { read_loop_server.run().await });

        let _ = server.events.send(ServerEvent::Listening);
        info!(node_id = ?local_id, "discovery server listening");
        Ok((server, events_rx))
    }

    pub fn local_node_id(&self) -> NodeId {
        self.local_id
    }

    /// Closes the server. After this every operation fails.
    pub async fn destroy(&self) {
        let mut inner = self.inner.lock().await;
        if inner.destroyed {
            return;
        }
        inner.destroyed = true;
        for (_, pending) in inner.pending.drain() {
            let _ = pending.sender.send(Err(PingFailure::Destroyed));
        }
        inner.dedup.clear();
        drop(inner);
        let _ = self.events.send(ServerEvent::Close);
    }

    /// Sends a ping, deduping concurrent callers for the same endpoint. Resolves
    /// with a peer descriptor on pong, rejects on timeout.
    pub async fn ping(&self, peer: Peer) -> Result<Peer, DiscoveryError> {
        let rckey = peer.endpoint.dedup_key();

        let existing = {
            let mut inner = self.inner.lock().await;
            if inner.destroyed {
                return Err(DiscoveryError::Destroyed);
            }
            inner.prune_dedup();
            inner
                .dedup
                .get(&rckey)
                .filter(|entry| entry.inserted_at.elapsed() < DEDUP_TTL)
                .map(|entry| match &entry.resolved {
                    Some(outcome) => DedupHit::Resolved(outcome.clone()),
                    None => DedupHit::Pending(entry.sender.subscribe()),
                })
        };

        let mut receiver = match existing {
            Some(DedupHit::Resolved(outcome)) => return outcome.map_err(DiscoveryError::from),
            Some(DedupHit::Pending(receiver)) => receiver,
            None => self.send_ping(peer, rckey).await?,
        };

        match receiver.recv().await {
            Ok(outcome) => outcome.map_err(DiscoveryError::from),
            Err(_) => Err(DiscoveryError::Destroyed),
        }
    }

    async fn send_ping(
        &self,
        peer: Peer,
        rckey: String,
    ) -> Result<broadcast::Receiver<PingOutcome>, DiscoveryError> {
        let ping = Message::Ping(PingMessage {
            version: 0x04,
            from: self.local_endpoint,
            to: peer.endpoint,
            expiration: expiration(),
        });
        let encoded = packet::encode_with_header(&ping, &self.signing_key)?;
        let hash: [u8; 32] = encoded[..32].try_into().unwrap();
        let addr = SocketAddr::new(
            peer.endpoint.address,
            peer.endpoint.udp_port.ok_or(DiscoveryError::PacketTooShort)?,
        );

        let (tx, rx) = broadcast::channel(1);
        {
            let mut inner = self.inner.lock().await;
            inner.pending.insert(
                hash,
                PendingRequest {
                    peer,
                    rckey: rckey.clone(),
                    sender: tx.clone(),
                },
            );
            inner.dedup.insert(
                rckey.clone(),
                DedupEntry {
                    sender: tx.clone(),
                    inserted_at: Instant::now(),
                    resolved: None,
                },
            );
        }

        self.socket.send_to(&encoded, addr).await?;

        let inner = self.inner.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut inner = inner.lock().await;
            if let Some(pending) = inner.pending.remove(&hash) {
                let outcome: PingOutcome = Err(PingFailure::Timeout(rckey.clone()));
                if let Some(dedup) = inner.dedup.get_mut(&rckey) {
                    dedup.resolved = Some(outcome.clone());
                }
                let _ = pending.sender.send(outcome);
            }
        });

        Ok(rx)
    }

    /// Fire-and-forget: neighbours arrive asynchronously as a `Peers` event.
    pub async fn find_neighbours(&self, peer: Peer, target: NodeId) -> Result<(), DiscoveryError> {
        if self.inner.lock().await.destroyed {
            return Err(DiscoveryError::Destroyed);
        }
        let message = Message::FindNeighbours(FindNeighboursMessage {
            target,
            expiration: expiration(),
        });
        let encoded = packet::encode_with_header(&message, &self.signing_key)?;
        let addr = SocketAddr::new(
            peer.endpoint.address,
            peer.endpoint.udp_port.ok_or(DiscoveryError::PacketTooShort)?,
        );
        self.socket.send_to(&encoded, addr).await?;
        Ok(())
    }

    async fn run(self) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            if self.inner.lock().await.destroyed {
                return;
            }
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(result) => result,
                Err(err) => {
                    let _ = self.events.send(ServerEvent::Error(err.to_string()));
                    continue;
                }
            };
            let decoded = match packet::decode(&buf[..len]) {
                Ok(decoded) => decoded,
                Err(err) => {
                    debug!(%err, %from, "dropping malformed discovery packet");
                    continue;
                }
            };
            self.dispatch(decoded.message, decoded.public_key, decoded.hash, from).await;
        }
    }

    async fn dispatch(
        &self,
        message: Message,
        sender_id: NodeId,
        hash: [u8; 32],
        from: SocketAddr,
    ) {
        match message {
            Message::Ping(ping) => self.handle_ping(ping, sender_id, hash, from).await,
            Message::Pong(pong) => self.handle_pong(pong, sender_id).await,
            Message::FindNeighbours(find) => self.handle_find_neighbours(find, from).await,
            Message::Neighbours(neighbours) => self.handle_neighbours(neighbours),
        }
    }

    async fn handle_ping(&self, ping: PingMessage, sender_id: NodeId, hash: [u8; 32], from: SocketAddr) {
        let pong = Message::Pong(PongMessage {
            to: Endpoint::new(from.ip(), Some(from.port()), ping.from.tcp_port),
            ping_hash: hash,
            expiration: expiration(),
        });
        match packet::encode_with_header(&pong, &self.signing_key) {
            Ok(encoded) => {
                if let Err(err) = self.socket.send_to(&encoded, from).await {
                    warn!(%err, "failed to send pong");
                }
            }
            Err(err) => warn!(%err, "failed to encode pong"),
        }

        if self.routing_table.get_peer(&sender_id).is_none() {
            if let Some(udp_port) = ping.from.udp_port {
                let endpoint = Endpoint::new(from.ip(), Some(udp_port), ping.from.tcp_port);
                let events = self.events.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(ADOPT_DELAY).await;
                    let _ = events.send(ServerEvent::Peers(vec![endpoint]));
                });
            }
        }
    }

    async fn handle_pong(&self, pong: PongMessage, sender_id: NodeId) {
        let mut inner = self.inner.lock().await;
        if let Some(pending) = inner.pending.remove(&pong.ping_hash) {
            let peer = Peer::new(sender_id, pending.peer.endpoint);
            let outcome: PingOutcome = Ok(peer);
            if let Some(dedup) = inner.dedup.get_mut(&pending.rckey) {
                dedup.resolved = Some(outcome.clone());
            }
            drop(inner);
            let _ = pending.sender.send(outcome);
        }
    }

    async fn handle_find_neighbours(&self, find: FindNeighboursMessage, from: SocketAddr) {
        let nodes: Vec<Node> = self
            .routing_table
            .get_closest_peers(&find.target)
            .into_iter()
            .map(|peer| Node {
                endpoint: peer.endpoint,
                node_id: peer.id,
            })
            .collect();
        let neighbours = Message::Neighbours(NeighboursMessage {
            nodes,
            expiration: expiration(),
        });
        match packet::encode_with_header(&neighbours, &self.signing_key) {
            Ok(encoded) => {
                if let Err(err) = self.socket.send_to(&encoded, from).await {
                    warn!(%err, "failed to send neighbours");
                }
            }
            Err(err) => warn!(%err, "failed to encode neighbours"),
        }
    }

    fn handle_neighbours(&self, neighbours: NeighboursMessage) {
        let endpoints = neighbours.nodes.into_iter().map(|node| node.endpoint).collect();
        let _ = self.events.send(ServerEvent::Peers(endpoints));
    }
}
