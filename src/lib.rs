pub mod config;
pub mod error;
pub mod file_io;
pub mod options;
pub mod server;
pub mod session;
pub mod tftp_protocol;

pub use crate::config::ServerConfig;
pub use crate::error::{ErrorCode, TransferError};
pub use crate::server::Server;
pub use crate::tftp_protocol::Packet;
