use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::ErrorCode;
use crate::options;
use crate::session::{Request, Session, TransferEndpoint};
use crate::tftp_protocol::{BLOCK_SIZE, MAX_PACKET, Packet};

/// Upper bound for per-transfer socket buffers.
const MAX_SOCKET_BUFFER: usize = 4 * 1024 * 1024;

/// Socket buffer size for one transfer: room for a whole window of
/// packets (at least two), capped at `MAX_SOCKET_BUFFER`.
pub fn transfer_buffer_size(blksize: usize, windowsize: u16) -> usize {
    let packets = usize::from(windowsize).max(2);
    ((4 + blksize) * packets).min(MAX_SOCKET_BUFFER)
}

/// Create an ephemeral UDP socket with send/receive buffers sized for the
/// negotiated block and window size.  The OS default buffer (~9 KB on macOS) is too
/// small for blksize values above ~8 KB and causes "No buffer space
/// available" (ENOBUFS / os error 55).
///
/// The socket binds the listener's IP with an OS-assigned port and stays
/// unconnected so datagrams from other TIDs can be answered.
pub fn bind_transfer_socket(
    local_ip: SocketAddr,
    blksize: usize,
    windowsize: u16,
) -> std::io::Result<UdpSocket> {
    let domain = if local_ip.is_ipv6() {
        socket2::Domain::IPV6
    } else {
        socket2::Domain::IPV4
    };
    let raw = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;

    let buf_size = transfer_buffer_size(blksize, windowsize);
    let _ = raw.set_send_buffer_size(buf_size);
    let _ = raw.set_recv_buffer_size(buf_size);

    let bind_addr = SocketAddr::new(local_ip.ip(), 0);
    raw.bind(&bind_addr.into())?;
    raw.set_nonblocking(true)?;

    // Convert: socket2 -> std -> tokio.
    let std_sock: std::net::UdpSocket = raw.into();
    UdpSocket::from_std(std_sock)
}

/// The listener on the well-known port.
pub struct Server {
    config: Arc<ServerConfig>,
    socket: UdpSocket,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let socket = UdpSocket::bind(config.bind_addr)
            .await
            .with_context(|| format!("cannot bind {}", config.bind_addr))?;
        Ok(Self {
            config: Arc::new(config),
            socket,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Run the dispatch loop until `shutdown` flips. Returns when
    /// the shutdown flag changes; running transfers finish on their own.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let local = self.local_addr()?;
        info!(
            "Starting TFTP server, listening on {local}, root {}, uploads {}",
            self.config.root_dir.display(),
            if self.config.allow_upload {
                "enabled"
            } else {
                "disabled"
            }
        );

        // One spare byte so an oversized datagram fails to decode.
        let mut buf = vec![0u8; MAX_PACKET + 1];
        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    let (n, peer) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            // ICMP errors from earlier sends surface here on some
                            // platforms; they must not stop the listener.
                            warn!("receive failed on listener: {e}");
                            continue;
                        }
                    };
                    self.dispatch(&buf[..n], peer, local).await;
                }
                _ = shutdown.changed() => {
                    info!("Shutting down");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Decode the first datagram of a prospective transfer and hand it to a
    /// new worker on its own port.
    async fn dispatch(&self, datagram: &[u8], peer: SocketAddr, local: SocketAddr) {
        let pkt = match Packet::from_bytes(datagram) {
            Ok(p) => p,
            Err(e) => {
                warn!("{peer}: bad packet: {e}");
                return;
            }
        };

        let request = match Request::from_packet(pkt) {
            Ok(r) => r,
            Err(other) => {
                warn!("{peer}: unexpected {} on listener", other.kind());
                let reply = Packet::error(ErrorCode::IllegalOperation).to_bytes();
                let _ = self.socket.send_to(&reply, peer).await;
                return;
            }
        };

        // Out-of-range options are rejected by the session; size for defaults.
        let (blksize_hint, windowsize_hint) = options::negotiate(&request.options)
            .map(|n| (n.blksize, n.windowsize))
            .unwrap_or((BLOCK_SIZE, options::DEFAULT_WINDOWSIZE));
        let socket = match bind_transfer_socket(local, blksize_hint, windowsize_hint) {
            Ok(s) => s,
            Err(e) => {
                error!("{peer}: cannot bind transfer socket: {e}");
                let reply = Packet::error(ErrorCode::Unknown).to_bytes();
                let _ = self.socket.send_to(&reply, peer).await;
                return;
            }
        };
        let transfer_addr = match socket.local_addr() {
            Ok(a) => a,
            Err(e) => {
                error!("{peer}: cannot read transfer socket address: {e}");
                return;
            }
        };
        info!(
            "Incoming {:?} request from {peer} for \"{}\", binding at {transfer_addr}",
            request.direction, request.filename
        );

        if self.config.port_handoff {
            // Tell the client where the transfer lives: an ACK-shaped frame
            // carrying the new port.
            let handoff = Packet::ACK {
                block_num: transfer_addr.port(),
            };
            if let Err(e) = self.socket.send_to(&handoff.to_bytes(), peer).await {
                warn!("{peer}: cannot send port handoff: {e}");
                return;
            }
            debug!("{peer}: announced transfer port {}", transfer_addr.port());
        }

        let endpoint = TransferEndpoint::new(socket, peer, !self.config.port_handoff);
        let session = Session::new(Arc::clone(&self.config), endpoint, request);
        tokio::spawn(async move {
            // Outcome is logged by the session itself.
            let _ = session.run().await;
        });
    }
}
