use ethereum_types::H512;
use std::net::IpAddr;

/// 64-byte uncompressed secp256k1 public key with the leading `0x04` byte stripped.
pub type NodeId = H512;

/// A reachable host. `udp_port`/`tcp_port` are `None` when that port is unknown
/// or the host is not reachable over that transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub address: IpAddr,
    pub udp_port: Option<u16>,
    pub tcp_port: Option<u16>,
}

impl Endpoint {
    pub fn new(address: IpAddr, udp_port: Option<u16>, tcp_port: Option<u16>) -> Self {
        Self {
            address,
            udp_port,
            tcp_port,
        }
    }

    /// Key used by the dedup cache and the pending-request map: `"address:udp_port"`.
    /// Panics is avoided by falling back to `0` when the port is unknown, since an
    /// endpoint without a UDP port can never be the target of a `ping`.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.address, self.udp_port.unwrap_or(0))
    }
}

/// Opaque to the core; supplied by the external routing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub id: NodeId,
    pub endpoint: Endpoint,
}

impl Peer {
    pub fn new(id: NodeId, endpoint: Endpoint) -> Self {
        Self { id, endpoint }
    }
}

/// External collaborator (§4.8): supplies known peers to the discovery server.
/// The crate ships no policy-bearing implementation of this trait; peer-table
/// maintenance is explicitly out of scope.
pub trait RoutingTable: Send + Sync {
    fn get_peer(&self, node_id: &NodeId) -> Option<Peer>;
    fn get_closest_peers(&self, target: &NodeId) -> Vec<Peer>;
}
