pub mod ecies;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod mac;
pub mod utils;

pub use error::RLPxError;
pub use frame::FrameState;
pub use handshake::{Initiator, ReceivedAuth, Receiver};
