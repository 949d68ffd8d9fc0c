use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Well-known TFTP port (RFC 1350).
pub const TFTP_PORT: u16 = 69;

/// How long to wait for an ACK / DATA before retransmitting.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1500);

/// Maximum retransmission attempts before giving up.
pub const DEFAULT_MAX_RETRIES: u32 = 10;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("root directory {} does not exist or is not a directory", .0.display())]
    MissingRoot(PathBuf),

    #[error("timeout must be greater than zero")]
    ZeroTimeout,
}

/// Server-wide settings. Built once at startup and shared read-only by the
/// listener and every transfer.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Directory files are served from and uploaded into.
    pub root_dir: PathBuf,
    pub allow_upload: bool,
    /// Per-receive timeout inside a transfer.
    pub timeout: Duration,
    pub max_retries: u32,
    /// Announce the transfer port with an `ACK(port)` from the listener and
    /// learn the client's TID from its first datagram on that port. When
    /// off, transfers follow plain RFC 1350 and reply straight from the new
    /// port.
    pub port_handoff: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), TFTP_PORT),
            root_dir: PathBuf::from("."),
            allow_upload: false,
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            port_handoff: true,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.root_dir.is_dir() {
            return Err(ConfigError::MissingRoot(self.root_dir.clone()));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }
}
