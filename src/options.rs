//! RFC 2347 option handling: the name/value list that may follow the mode in
//! a request, and the values the server agrees to in its OACK.

use std::ops::RangeInclusive;

use crate::error::TransferError;
use crate::tftp_protocol::{BLOCK_SIZE, DecodeError, MAX_BLKSIZE, MIN_BLKSIZE};

/// Window size used when the client does not ask for one (RFC 7440).
pub const DEFAULT_WINDOWSIZE: u16 = 1;

/// Largest window the server will negotiate.
pub const MAX_WINDOWSIZE: u16 = 255;

const BLKSIZE_RANGE: RangeInclusive<u32> = MIN_BLKSIZE as u32..=MAX_BLKSIZE as u32;
const WINDOWSIZE_RANGE: RangeInclusive<u32> = 1..=MAX_WINDOWSIZE as u32;

/// One `name\0value\0` pair, kept in the order the client sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TftpOption {
    pub name: String,
    pub value: String,
}

impl TftpOption {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Outcome of negotiating a request's options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub blksize: usize,
    pub windowsize: u16,
    /// Options to echo back in the OACK. Empty means no OACK is sent.
    pub oack: Vec<TftpOption>,
}

impl Default for Negotiated {
    fn default() -> Self {
        Self {
            blksize: BLOCK_SIZE,
            windowsize: DEFAULT_WINDOWSIZE,
            oack: Vec::new(),
        }
    }
}

impl Negotiated {
    pub fn needs_oack(&self) -> bool {
        !self.oack.is_empty()
    }
}

/// Scan `name\0value\0` pairs until the region is exhausted.
///
/// An empty name ends the scan, so trailing NUL padding some clients append
/// is tolerated. A name without a value is malformed.
pub fn parse_options(buf: &[u8]) -> Result<Vec<TftpOption>, DecodeError> {
    let mut options = Vec::new();
    let mut rest = buf;

    while !rest.is_empty() {
        let (name, after_name) = split_cstr(rest, "option name")?;
        if name.is_empty() {
            break;
        }
        let (value, after_value) = split_cstr(after_name, "option value")?;
        options.push(TftpOption { name, value });
        rest = after_value;
    }

    Ok(options)
}

/// Split one NUL-terminated UTF-8 string off the front of `buf`.
pub(crate) fn split_cstr<'a>(
    buf: &'a [u8],
    field: &'static str,
) -> Result<(String, &'a [u8]), DecodeError> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(DecodeError::MissingTerminator(field))?;
    let s = std::str::from_utf8(&buf[..end])
        .map_err(|_| DecodeError::InvalidUtf8(field))?
        .to_string();
    Ok((s, &buf[end + 1..]))
}

/// Apply the recognized options and build the OACK echo.
///
/// `blksize` and `windowsize` are validated against their ranges; anything
/// outside them ends the session. Unrecognized names are echoed unchanged
/// and have no effect.
pub fn negotiate(options: &[TftpOption]) -> Result<Negotiated, TransferError> {
    let mut negotiated = Negotiated::default();

    for opt in options {
        if opt.name.eq_ignore_ascii_case("blksize") {
            let blksize = parse_in_range(opt, &BLKSIZE_RANGE)?;
            negotiated.blksize = blksize as usize;
            negotiated
                .oack
                .push(TftpOption::new(opt.name.clone(), blksize.to_string()));
        } else if opt.name.eq_ignore_ascii_case("windowsize") {
            let windowsize = parse_in_range(opt, &WINDOWSIZE_RANGE)?;
            negotiated.windowsize = windowsize as u16;
            negotiated
                .oack
                .push(TftpOption::new(opt.name.clone(), windowsize.to_string()));
        } else {
            negotiated.oack.push(opt.clone());
        }
    }

    Ok(negotiated)
}

fn parse_in_range(opt: &TftpOption, range: &RangeInclusive<u32>) -> Result<u32, TransferError> {
    opt.value
        .trim()
        .parse::<u32>()
        .ok()
        .filter(|v| range.contains(v))
        .ok_or_else(|| TransferError::OptionOutOfRange {
            name: opt.name.clone(),
            value: opt.value.clone(),
        })
}
