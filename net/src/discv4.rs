pub mod error;
pub mod packet;
pub mod server;

pub use error::DiscoveryError;
pub use server::{Server, ServerConfig, ServerEvent};
