use devp2p_rlp::error::RLPDecodeError;
use thiserror::Error;

/// Errors arising from the DPT discovery server and its packet codec. Per
/// §7, timeouts are not fatal to the server; unknown packet types are
/// ignored rather than surfaced.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("ping to {0} timed out")]
    Timeout(String),
    #[error("server was destroyed")]
    Destroyed,
    #[error("malformed discovery packet: {0}")]
    Decode(#[from] RLPDecodeError),
    #[error("packet too short to contain hash, signature, and type")]
    PacketTooShort,
    #[error("packet hash does not match its contents")]
    HashMismatch,
    #[error("invalid or unrecoverable signature")]
    InvalidSignature,
    #[error("unknown discovery packet type {0:#04x}")]
    UnknownPacketType(u8),
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}
