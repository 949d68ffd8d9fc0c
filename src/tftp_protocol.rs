use thiserror::Error;

use crate::error::ErrorCode;
use crate::options::{TftpOption, parse_options, split_cstr};

/// TFTP opcodes per RFC 1350 + RFC 2347.
const OPCODE_RRQ: u16 = 1;
const OPCODE_WRQ: u16 = 2;
const OPCODE_DATA: u16 = 3;
const OPCODE_ACK: u16 = 4;
const OPCODE_ERROR: u16 = 5;
const OPCODE_OACK: u16 = 6;

/// Default data payload per DATA packet (RFC 1350).
pub const BLOCK_SIZE: usize = 512;

/// Smallest negotiable blksize (RFC 2348).
pub const MIN_BLKSIZE: usize = 8;

/// Maximum negotiable blksize (largest payload that fits in a UDP datagram
/// with standard IP + UDP headers: 65535 - 20 - 8 - 4 = 65503, but the
/// common convention is 65464).
pub const MAX_BLKSIZE: usize = 65464;

/// Largest datagram the server ever needs to receive.
pub const MAX_PACKET: usize = 4 + MAX_BLKSIZE;

/// Why a datagram could not be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{kind} packet too short ({len} bytes)")]
    TooShort { kind: &'static str, len: usize },

    #[error("datagram of {0} bytes exceeds the largest TFTP packet")]
    TooLong(usize),

    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),

    #[error("missing NUL terminator after {0}")]
    MissingTerminator(&'static str),

    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),

    #[error("empty filename")]
    EmptyFilename,
}

/// A fully parsed TFTP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
pub enum Packet {
    RRQ {
        filename: String,
        mode: String,
        options: Vec<TftpOption>,
    },
    WRQ {
        filename: String,
        mode: String,
        options: Vec<TftpOption>,
    },
    DATA {
        block_num: u16,
        data: Vec<u8>,
    },
    ACK {
        block_num: u16,
    },
    ERROR {
        code: u16,
        msg: String,
    },
    /// Option Acknowledgment (RFC 2347).
    OACK {
        options: Vec<TftpOption>,
    },
}

impl Packet {
    /// Parse raw bytes into a `Packet`.
    ///
    /// Every length is checked against `buf`; truncated input is an error.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < 2 {
            return Err(DecodeError::TooShort {
                kind: "TFTP",
                len: buf.len(),
            });
        }
        if buf.len() > MAX_PACKET {
            return Err(DecodeError::TooLong(buf.len()));
        }
        let opcode = u16::from_be_bytes([buf[0], buf[1]]);
        match opcode {
            OPCODE_RRQ => parse_request(buf, true),
            OPCODE_WRQ => parse_request(buf, false),
            OPCODE_DATA => parse_data(buf),
            OPCODE_ACK => parse_ack(buf),
            OPCODE_ERROR => parse_error(buf),
            OPCODE_OACK => Ok(Packet::OACK {
                options: parse_options(&buf[2..])?,
            }),
            _ => Err(DecodeError::UnknownOpcode(opcode)),
        }
    }

    /// Serialize the packet to bytes for transmission.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Packet::RRQ {
                filename,
                mode,
                options,
            } => encode_request(OPCODE_RRQ, filename, mode, options),
            Packet::WRQ {
                filename,
                mode,
                options,
            } => encode_request(OPCODE_WRQ, filename, mode, options),
            Packet::DATA { block_num, data } => encode_data(*block_num, data),
            Packet::ACK { block_num } => {
                let mut buf = Vec::with_capacity(4);
                buf.extend_from_slice(&OPCODE_ACK.to_be_bytes());
                buf.extend_from_slice(&block_num.to_be_bytes());
                buf
            }
            Packet::ERROR { code, msg } => {
                let mut buf = Vec::with_capacity(5 + msg.len());
                buf.extend_from_slice(&OPCODE_ERROR.to_be_bytes());
                buf.extend_from_slice(&code.to_be_bytes());
                buf.extend_from_slice(msg.as_bytes());
                buf.push(0);
                buf
            }
            Packet::OACK { options } => {
                let mut buf = Vec::new();
                buf.extend_from_slice(&OPCODE_OACK.to_be_bytes());
                encode_options(&mut buf, options);
                buf
            }
        }
    }

    /// Build an ERROR packet carrying the catalog message for `code`.
    pub fn error(code: ErrorCode) -> Self {
        Packet::ERROR {
            code: code.into(),
            msg: code.message().to_string(),
        }
    }

    /// Short name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::RRQ { .. } => "RRQ",
            Packet::WRQ { .. } => "WRQ",
            Packet::DATA { .. } => "DATA",
            Packet::ACK { .. } => "ACK",
            Packet::ERROR { .. } => "ERROR",
            Packet::OACK { .. } => "OACK",
        }
    }
}

/// Encode a DATA packet straight from a payload slice, without building a
/// `Packet` first.
pub fn encode_data(block_num: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&OPCODE_DATA.to_be_bytes());
    buf.extend_from_slice(&block_num.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

// ---------------------------------------------------------------------------
// Internal parsing helpers
// ---------------------------------------------------------------------------

/// Parse RRQ / WRQ: 2‑byte opcode | filename\0 | mode\0 [| option\0 | value\0 ]*
fn parse_request(buf: &[u8], is_rrq: bool) -> Result<Packet, DecodeError> {
    let (filename, rest) = split_cstr(&buf[2..], "filename")?;
    let (mode, rest) = split_cstr(rest, "mode")?;

    if filename.is_empty() {
        return Err(DecodeError::EmptyFilename);
    }

    // Mode is passed through untouched; the session decides what it accepts.
    let options = parse_options(rest)?;

    if is_rrq {
        Ok(Packet::RRQ {
            filename,
            mode,
            options,
        })
    } else {
        Ok(Packet::WRQ {
            filename,
            mode,
            options,
        })
    }
}

/// Parse DATA: 2‑byte opcode | 2‑byte block# | 0‥N bytes
fn parse_data(buf: &[u8]) -> Result<Packet, DecodeError> {
    if buf.len() < 4 {
        return Err(DecodeError::TooShort {
            kind: "DATA",
            len: buf.len(),
        });
    }
    let block_num = u16::from_be_bytes([buf[2], buf[3]]);
    let data = buf[4..].to_vec();
    Ok(Packet::DATA { block_num, data })
}

/// Parse ACK: 2‑byte opcode | 2‑byte block#
fn parse_ack(buf: &[u8]) -> Result<Packet, DecodeError> {
    if buf.len() < 4 {
        return Err(DecodeError::TooShort {
            kind: "ACK",
            len: buf.len(),
        });
    }
    let block_num = u16::from_be_bytes([buf[2], buf[3]]);
    Ok(Packet::ACK { block_num })
}

/// Parse ERROR: 2‑byte opcode | 2‑byte code | msg\0
fn parse_error(buf: &[u8]) -> Result<Packet, DecodeError> {
    if buf.len() < 5 {
        return Err(DecodeError::TooShort {
            kind: "ERROR",
            len: buf.len(),
        });
    }
    let code = u16::from_be_bytes([buf[2], buf[3]]);
    let msg_bytes = &buf[4..];
    let end = msg_bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or(DecodeError::MissingTerminator("error message"))?;
    let msg = String::from_utf8_lossy(&msg_bytes[..end]).to_string();
    Ok(Packet::ERROR { code, msg })
}

fn encode_request(opcode: u16, filename: &str, mode: &str, options: &[TftpOption]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + filename.len() + mode.len());
    buf.extend_from_slice(&opcode.to_be_bytes());
    buf.extend_from_slice(filename.as_bytes());
    buf.push(0);
    buf.extend_from_slice(mode.as_bytes());
    buf.push(0);
    encode_options(&mut buf, options);
    buf
}

fn encode_options(buf: &mut Vec<u8>, options: &[TftpOption]) {
    for opt in options {
        buf.extend_from_slice(opt.name.as_bytes());
        buf.push(0);
        buf.extend_from_slice(opt.value.as_bytes());
        buf.push(0);
    }
}
