//! One transfer, from the request on its dedicated port to the final ACK.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::{ErrorCode, TransferError};
use crate::file_io::{BlockReader, BlockWriter, FileStore};
use crate::options::{self, Negotiated, TftpOption};
use crate::tftp_protocol::{BLOCK_SIZE, MAX_PACKET, Packet, encode_data};

/// The only transfer mode the server accepts.
pub const OCTET_MODE: &str = "octet";

/// Direction of a transfer, seen from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,  // RRQ  (client is downloading from us)
    Write, // WRQ  (client is uploading to us)
}

/// A decoded RRQ or WRQ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub direction: Direction,
    pub filename: String,
    pub mode: String,
    pub options: Vec<TftpOption>,
}

impl Request {
    /// Accept RRQ / WRQ packets; anything else is handed back.
    pub fn from_packet(pkt: Packet) -> Result<Self, Packet> {
        match pkt {
            Packet::RRQ {
                filename,
                mode,
                options,
            } => Ok(Request {
                direction: Direction::Read,
                filename,
                mode,
                options,
            }),
            Packet::WRQ {
                filename,
                mode,
                options,
            } => Ok(Request {
                direction: Direction::Write,
                filename,
                mode,
                options,
            }),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingRequest,
    Negotiating,
    Transferring,
    Completed,
    Terminated,
}

/// What a finished transfer moved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    pub direction: Direction,
    pub filename: String,
    pub bytes: u64,
    pub blksize: usize,
    pub windowsize: u16,
}

// ---------------------------------------------------------------------------
// Dedicated endpoint
// ---------------------------------------------------------------------------

/// The UDP socket owned by one transfer, plus the peer TID it talks to.
///
/// Until the TID is locked the first datagram to arrive fixes it. After
/// that, datagrams from any other address get an `Unknown transfer ID`
/// error and are otherwise ignored.
pub struct TransferEndpoint {
    socket: UdpSocket,
    peer: SocketAddr,
    peer_locked: bool,
    last_sent: Vec<u8>,
    recv_buf: Vec<u8>,
}

impl TransferEndpoint {
    pub fn new(socket: UdpSocket, peer: SocketAddr, peer_locked: bool) -> Self {
        Self {
            socket,
            peer,
            peer_locked,
            last_sent: Vec::new(),
            // One spare byte so an oversized datagram shows up as such.
            recv_buf: vec![0u8; MAX_PACKET + 1],
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_peer_locked(&self) -> bool {
        self.peer_locked
    }

    /// Send a frame to the peer and keep it for retransmission.
    pub async fn send(&mut self, frame: Vec<u8>) -> io::Result<()> {
        self.socket.send_to(&frame, self.peer).await?;
        self.last_sent = frame;
        Ok(())
    }

    /// Send a frame without replacing the retained one.
    pub async fn send_unretained(&self, frame: &[u8]) -> io::Result<()> {
        self.socket.send_to(frame, self.peer).await?;
        Ok(())
    }

    pub async fn resend_last(&self) -> io::Result<()> {
        if self.last_sent.is_empty() {
            return Ok(());
        }
        self.socket.send_to(&self.last_sent, self.peer).await?;
        Ok(())
    }

    /// Best-effort ERROR to the peer. Not retried, not tracked.
    pub async fn send_error(&self, code: ErrorCode) {
        let frame = Packet::error(code).to_bytes();
        if let Err(e) = self.socket.send_to(&frame, self.peer).await {
            debug!("{}: cannot send ERROR {}: {e}", self.peer, u16::from(code));
        }
    }

    /// Wait up to `timeout` for the first datagram and lock the TID to its
    /// sender. Returns false if nothing arrived.
    pub async fn await_peer(&mut self, timeout: Duration) -> io::Result<bool> {
        let deadline = Instant::now() + timeout;
        match timeout_at(deadline, self.socket.recv_from(&mut self.recv_buf)).await {
            Ok(res) => {
                let (_, from) = res?;
                self.lock_peer(from);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    /// Wait until `deadline` for a packet from the peer. `None` on timeout.
    ///
    /// The deadline is fixed by the caller, so packets it chooses to ignore
    /// do not extend the wait. A peer ERROR packet is surfaced as
    /// `TransferError::PeerError`.
    pub async fn recv_packet(
        &mut self,
        deadline: Instant,
    ) -> Result<Option<Packet>, TransferError> {
        loop {
            let (n, from) =
                match timeout_at(deadline, self.socket.recv_from(&mut self.recv_buf)).await {
                    Ok(res) => res?,
                    Err(_) => return Ok(None),
                };

            if !self.peer_locked {
                self.lock_peer(from);
            } else if from != self.peer {
                self.reject_stranger(from).await;
                continue;
            }

            return match Packet::from_bytes(&self.recv_buf[..n])? {
                Packet::ERROR { code, msg } => Err(TransferError::PeerError { code, msg }),
                pkt => Ok(Some(pkt)),
            };
        }
    }

    fn lock_peer(&mut self, from: SocketAddr) {
        debug!("transfer ID locked to {from}");
        self.peer = from;
        self.peer_locked = true;
    }

    async fn reject_stranger(&self, from: SocketAddr) {
        let err = TransferError::UnknownTransferId(from);
        warn!("{err} (expected {})", self.peer);
        let frame = Packet::error(err.error_code()).to_bytes();
        if let Err(e) = self.socket.send_to(&frame, from).await {
            debug!("{from}: cannot send ERROR: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Window arithmetic
// ---------------------------------------------------------------------------

/// How many outstanding blocks an ACK covers.
///
/// `origin` is the last acknowledged block id and `outstanding` the number
/// of blocks sent after it. Returns `Some(n)` with `1 <= n <= outstanding`
/// when `ack` falls inside the window, taking 16-bit wraparound into
/// account.
pub fn acked_in_window(origin: u16, ack: u16, outstanding: usize) -> Option<usize> {
    let advanced = ack.wrapping_sub(origin) as usize;
    (advanced >= 1 && advanced <= outstanding).then_some(advanced)
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Per-client state machine driving one read or write transfer.
pub struct Session {
    config: Arc<ServerConfig>,
    store: FileStore,
    endpoint: TransferEndpoint,
    request: Request,
    state: SessionState,
    blksize: usize,
    windowsize: u16,
    /// Last block id acknowledged (reads) or accepted (writes).
    last_block: u16,
    retries: u32,
}

impl Session {
    pub fn new(config: Arc<ServerConfig>, endpoint: TransferEndpoint, request: Request) -> Self {
        let store = FileStore::new(config.root_dir.clone(), config.allow_upload);
        Self {
            config,
            store,
            endpoint,
            request,
            state: SessionState::AwaitingRequest,
            blksize: BLOCK_SIZE,
            windowsize: options::DEFAULT_WINDOWSIZE,
            last_block: 0,
            retries: 0,
        }
    }

    /// Drive the transfer to completion or termination. The socket is
    /// released when the session is dropped.
    pub async fn run(mut self) -> Result<TransferSummary, TransferError> {
        let result = self.drive().await;
        let peer = self.endpoint.peer();

        match &result {
            Ok(summary) => {
                self.transition(SessionState::Completed);
                info!(
                    "{peer}: {} \"{}\" complete ({} bytes, blksize={}, windowsize={})",
                    request_kind(summary.direction),
                    summary.filename,
                    summary.bytes,
                    summary.blksize,
                    summary.windowsize
                );
            }
            Err(e) => {
                self.transition(SessionState::Terminated);
                if e.notifies_peer() {
                    self.endpoint.send_error(e.error_code()).await;
                }
                match e {
                    TransferError::RetryExhausted(_) => {
                        warn!("{peer}: timeout, no more retries ({e})")
                    }
                    TransferError::PeerError { code, .. } => {
                        warn!("{peer}: {e} ({})", ErrorCode::from_u16(*code))
                    }
                    _ => error!(
                        "{peer}: terminated with error {}: {}; cause: {e}",
                        u16::from(e.error_code()),
                        e.error_code()
                    ),
                }
            }
        }
        result
    }

    async fn drive(&mut self) -> Result<TransferSummary, TransferError> {
        if !self.endpoint.is_peer_locked() {
            self.await_handoff_ack().await?;
        }
        self.transition(SessionState::Negotiating);

        if self.request.mode != OCTET_MODE {
            return Err(TransferError::UnsupportedMode(self.request.mode.clone()));
        }
        let negotiated = options::negotiate(&self.request.options)?;
        self.blksize = negotiated.blksize;
        self.windowsize = negotiated.windowsize;

        let bytes = match self.request.direction {
            Direction::Read => self.handle_read(&negotiated).await?,
            Direction::Write => self.handle_write(&negotiated).await?,
        };

        Ok(TransferSummary {
            direction: self.request.direction,
            filename: self.request.filename.clone(),
            bytes,
            blksize: self.blksize,
            windowsize: self.windowsize,
        })
    }

    fn transition(&mut self, next: SessionState) {
        debug!("{}: {:?} -> {:?}", self.endpoint.peer(), self.state, next);
        self.state = next;
    }

    fn negotiated_suffix(&self) -> String {
        let mut suffix = String::new();
        if self.blksize != BLOCK_SIZE {
            suffix.push_str(&format!(" blksize={}", self.blksize));
        }
        if self.windowsize != options::DEFAULT_WINDOWSIZE {
            suffix.push_str(&format!(" windowsize={}", self.windowsize));
        }
        suffix
    }

    /// Count one timeout against the retry budget.
    fn count_timeout(&mut self) -> Result<(), TransferError> {
        self.retries += 1;
        if self.retries > self.config.max_retries {
            return Err(TransferError::RetryExhausted(self.config.max_retries));
        }
        debug!(
            "{}: timeout, retrying... ({}/{})",
            self.endpoint.peer(),
            self.retries,
            self.config.max_retries
        );
        Ok(())
    }

    /// With port handoff the client's first datagram on the new port tells
    /// us which TID it will use.
    async fn await_handoff_ack(&mut self) -> Result<(), TransferError> {
        while !self.endpoint.await_peer(self.config.timeout).await? {
            self.count_timeout()?;
        }
        self.retries = 0;
        Ok(())
    }

    /// Send the OACK and wait for the client's ACK(0), retransmitting the
    /// OACK on timeout.
    async fn send_oack(&mut self, negotiated: &Negotiated) -> Result<(), TransferError> {
        let oack = Packet::OACK {
            options: negotiated.oack.clone(),
        };
        self.endpoint.send(oack.to_bytes()).await?;
        let mut deadline = Instant::now() + self.config.timeout;

        loop {
            match self.endpoint.recv_packet(deadline).await? {
                Some(Packet::ACK { block_num: 0 }) => {
                    self.retries = 0;
                    return Ok(());
                }
                Some(Packet::ACK { block_num }) => {
                    debug!("{}: ignoring ACK {block_num} before ACK 0", self.endpoint.peer());
                }
                Some(other) => {
                    return Err(TransferError::IllegalOperation(format!(
                        "expected ACK 0 after OACK, got {}",
                        other.kind()
                    )));
                }
                None => {
                    self.count_timeout()?;
                    self.endpoint.resend_last().await?;
                    deadline = Instant::now() + self.config.timeout;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // RRQ  (client downloads a file from us)
    // -----------------------------------------------------------------------

    async fn handle_read(&mut self, negotiated: &Negotiated) -> Result<u64, TransferError> {
        let reader = self.store.open_for_read(&self.request.filename).await?;
        info!(
            "{}: RRQ \"{}\" ({} bytes){}",
            self.endpoint.peer(),
            self.request.filename,
            reader.len(),
            self.negotiated_suffix()
        );
        if reader.is_empty() {
            debug!("{}: empty file, a single empty block follows", self.endpoint.peer());
        }

        if negotiated.needs_oack() {
            self.send_oack(negotiated).await?;
        }
        self.transition(SessionState::Transferring);
        self.send_file(reader).await
    }

    /// Windowed send loop. The unacknowledged window is kept as encoded
    /// frames so a timeout can resend it without touching the file again.
    async fn send_file(&mut self, mut reader: BlockReader) -> Result<u64, TransferError> {
        let windowsize = usize::from(self.windowsize);
        let mut window: VecDeque<Vec<u8>> = VecDeque::with_capacity(windowsize);
        let mut block_buf = vec![0u8; self.blksize];
        let mut next_block = self.last_block.wrapping_add(1);
        let mut read_bytes: u64 = 0;
        let mut eof = false;

        loop {
            while !eof && window.len() < windowsize {
                let n = reader.read_block(&mut block_buf).await?;
                window.push_back(encode_data(next_block, &block_buf[..n]));
                next_block = next_block.wrapping_add(1);
                read_bytes += n as u64;
                // A block shorter than blksize signals end-of-transfer.
                eof = n < self.blksize;
            }

            if window.is_empty() {
                return Ok(read_bytes);
            }

            self.send_window(&window).await?;
            let mut deadline = Instant::now() + self.config.timeout;

            loop {
                match self.endpoint.recv_packet(deadline).await? {
                    Some(Packet::ACK { block_num }) => {
                        if let Some(acked) =
                            acked_in_window(self.last_block, block_num, window.len())
                        {
                            window.drain(..acked);
                            self.last_block = block_num;
                            self.retries = 0;
                            break;
                        }
                        if block_num == self.last_block && windowsize > 1 {
                            // The client saw a gap right after the origin.
                            debug!(
                                "{}: ACK {block_num} repeats window origin, resending",
                                self.endpoint.peer()
                            );
                            break;
                        }
                        debug!(
                            "{}: ignoring ACK {block_num} outside window",
                            self.endpoint.peer()
                        );
                    }
                    Some(other) => {
                        return Err(TransferError::IllegalOperation(format!(
                            "expected ACK, got {}",
                            other.kind()
                        )));
                    }
                    None => {
                        self.count_timeout()?;
                        self.send_window(&window).await?;
                        deadline = Instant::now() + self.config.timeout;
                    }
                }
            }
        }
    }

    async fn send_window(&self, window: &VecDeque<Vec<u8>>) -> Result<(), TransferError> {
        for frame in window {
            self.endpoint.send_unretained(frame).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // WRQ  (client uploads a file to us)
    // -----------------------------------------------------------------------

    async fn handle_write(&mut self, negotiated: &Negotiated) -> Result<u64, TransferError> {
        let mut writer = self.store.open_for_write(&self.request.filename).await?;
        info!(
            "{}: WRQ \"{}\" -> {}{}",
            self.endpoint.peer(),
            self.request.filename,
            writer.path().display(),
            self.negotiated_suffix()
        );

        let outcome = match self.receive_upload(&mut writer, negotiated).await {
            Ok(()) => writer.finish().await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(bytes) => {
                let ack = Packet::ACK {
                    block_num: self.last_block,
                };
                self.endpoint.send(ack.to_bytes()).await?;
                Ok(bytes)
            }
            Err(e) => {
                writer.discard().await;
                Err(e)
            }
        }
    }

    async fn receive_upload(
        &mut self,
        writer: &mut BlockWriter,
        negotiated: &Negotiated,
    ) -> Result<(), TransferError> {
        if negotiated.needs_oack() {
            self.send_oack(negotiated).await?;
        }

        // Send ACK 0 to acknowledge the WRQ.
        self.endpoint
            .send(Packet::ACK { block_num: 0 }.to_bytes())
            .await?;
        self.transition(SessionState::Transferring);
        self.receive_file(writer).await
    }

    /// Receive rounds of up to `windowsize` DATA packets, acknowledging the
    /// highest in-order block after each round. Returns once the final
    /// (short) block has been written; the caller sends its ACK.
    async fn receive_file(&mut self, writer: &mut BlockWriter) -> Result<(), TransferError> {
        loop {
            let round_start = self.last_block;
            let deadline = Instant::now() + self.config.timeout;

            for _ in 0..self.windowsize {
                match self.endpoint.recv_packet(deadline).await? {
                    Some(Packet::DATA { block_num, data }) => {
                        if data.len() > self.blksize {
                            return Err(TransferError::IllegalOperation(format!(
                                "DATA block {block_num} carries {} bytes, blksize is {}",
                                data.len(),
                                self.blksize
                            )));
                        }
                        if block_num != self.last_block.wrapping_add(1) {
                            debug!(
                                "{}: ignoring DATA {block_num}, expected {}",
                                self.endpoint.peer(),
                                self.last_block.wrapping_add(1)
                            );
                            continue;
                        }

                        writer.write_block(&data).await?;
                        self.last_block = block_num;

                        if data.len() < self.blksize {
                            return Ok(());
                        }
                    }
                    Some(other) => {
                        return Err(TransferError::IllegalOperation(format!(
                            "expected DATA, got {}",
                            other.kind()
                        )));
                    }
                    None => break,
                }
            }

            if self.last_block == round_start {
                self.count_timeout()?;
            } else {
                self.retries = 0;
            }

            let ack = Packet::ACK {
                block_num: self.last_block,
            };
            self.endpoint.send(ack.to_bytes()).await?;
        }
    }
}

fn request_kind(direction: Direction) -> &'static str {
    match direction {
        Direction::Read => "RRQ",
        Direction::Write => "WRQ",
    }
}
