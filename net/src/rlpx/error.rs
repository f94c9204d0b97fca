use devp2p_rlp::error::{RLPDecodeError, RLPEncodeError};
use thiserror::Error;

/// Errors arising from the ECIES handshake and the post-handshake frame codec.
/// All variants here are fatal for the connection: per §7, cryptographic and
/// protocol errors on TCP are unrecoverable and close the session.
#[derive(Debug, Error)]
pub enum RLPxError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("RLP decode error: {0}")]
    Decode(#[from] RLPDecodeError),
    #[error("RLP encode error: {0}")]
    Encode(#[from] RLPEncodeError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("body read attempted without a preceding header read")]
    NoPendingHeader,
}
