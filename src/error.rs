use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::tftp_protocol::DecodeError;

/// TFTP error codes as carried in ERROR packets (RFC 1350 + RFC 2347).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    Unknown = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
    InvalidOptions = 8,
}

impl ErrorCode {
    /// Canonical message sent in ERROR packets and written to the log.
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::Unknown => "Unknown error",
            ErrorCode::FileNotFound => "File not found",
            ErrorCode::AccessViolation => "Access violation",
            ErrorCode::DiskFull => "Disk full or allocation exceeded",
            ErrorCode::IllegalOperation => "Illegal TFTP operation",
            ErrorCode::UnknownTransferId => "Unknown transfer ID",
            ErrorCode::FileAlreadyExists => "File already exists",
            ErrorCode::NoSuchUser => "No such user",
            ErrorCode::InvalidOptions => "Invalid options specified",
        }
    }

    /// Map a wire value back to a code. Values outside the catalog read as `Unknown`.
    pub fn from_u16(code: u16) -> Self {
        match code {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::UnknownTransferId,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            8 => ErrorCode::InvalidOptions,
            _ => ErrorCode::Unknown,
        }
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> u16 {
        code as u16
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// Everything that can end a transfer session.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("malformed packet: {0}")]
    MalformedFrame(#[from] DecodeError),

    #[error("unsupported transfer mode {0:?}, only octet is supported")]
    UnsupportedMode(String),

    #[error("option {name}={value} is out of range")]
    OptionOutOfRange { name: String, value: String },

    #[error("illegal operation: {0}")]
    IllegalOperation(String),

    #[error("packet from unknown transfer ID {0}")]
    UnknownTransferId(SocketAddr),

    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("access violation: {0}")]
    AccessViolation(String),

    #[error("file already exists: {}", .0.display())]
    FileAlreadyExists(PathBuf),

    #[error("disk full while writing {}", .0.display())]
    DiskFull(PathBuf),

    #[error("timed out after {0} retries")]
    RetryExhausted(u32),

    #[error("peer sent error {code}: {msg}")]
    PeerError { code: u16, msg: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// The code sent to the peer in the terminating ERROR packet.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            TransferError::MalformedFrame(_)
            | TransferError::UnsupportedMode(_)
            | TransferError::OptionOutOfRange { .. }
            | TransferError::IllegalOperation(_) => ErrorCode::IllegalOperation,
            TransferError::UnknownTransferId(_) => ErrorCode::UnknownTransferId,
            TransferError::FileNotFound(_) => ErrorCode::FileNotFound,
            TransferError::AccessViolation(_) => ErrorCode::AccessViolation,
            TransferError::FileAlreadyExists(_) => ErrorCode::FileAlreadyExists,
            TransferError::DiskFull(_) => ErrorCode::DiskFull,
            TransferError::RetryExhausted(_)
            | TransferError::PeerError { .. }
            | TransferError::Io(_) => ErrorCode::Unknown,
        }
    }

    /// Whether terminating with this error should send an ERROR packet.
    /// A silent peer or one that already sent ERROR gets nothing back.
    pub fn notifies_peer(&self) -> bool {
        !matches!(
            self,
            TransferError::RetryExhausted(_) | TransferError::PeerError { .. }
        )
    }
}
