pub mod discv4;
pub mod rlpx;
pub mod types;

pub use types::{Endpoint, NodeId, Peer};
