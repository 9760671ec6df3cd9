//! Length-prefixed framing over byte views.
//!
//! Wire layout: `[u32 big-endian payload length][payload bytes]`.
//! The transport itself is an opaque byte stream; this helper is the one
//! concession to structure, for callers that want message boundaries.
//!
//! Payload length is bounded by a configurable cap (default 16 MiB,
//! absolute maximum `i32::MAX - 4`). Anything negative or over the cap
//! is a protocol defect, not a retryable condition.

use crate::error::{WireError, WireResult};

/// Byte length of the frame header.
pub const HEADER_LEN: usize = 4;

/// Default payload cap: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Absolute payload cap; total frame must stay addressable by i32.
pub const ABSOLUTE_MAX_PAYLOAD: usize = (i32::MAX as usize) - HEADER_LEN;

/// Outcome of a deframe attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deframed {
    /// A complete frame was decoded; payload of this many bytes was
    /// copied into the destination.
    Payload(usize),
    /// The source does not yet hold `4 + len` bytes. Destination
    /// contents are unspecified.
    Incomplete,
}

/// Stateless framer with a payload cap.
#[derive(Debug, Clone, Copy)]
pub struct Framer {
    max_payload: usize,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl Framer {
    /// Cap is clamped to the absolute maximum.
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload: max_payload.min(ABSOLUTE_MAX_PAYLOAD),
        }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Write `src` as one frame into `dst`. Returns the total frame
    /// length (`4 + src.len()`).
    pub fn frame(&self, src: &[u8], dst: &mut [u8]) -> WireResult<usize> {
        if src.len() > self.max_payload {
            return Err(WireError::FrameTooLarge {
                len: src.len() as u64,
                cap: self.max_payload,
            });
        }
        let total = HEADER_LEN + src.len();
        if dst.len() < total {
            return Err(WireError::InvalidConfig(format!(
                "frame needs {} bytes, destination holds {}",
                total,
                dst.len()
            )));
        }
        dst[..HEADER_LEN].copy_from_slice(&(src.len() as u32).to_be_bytes());
        dst[HEADER_LEN..total].copy_from_slice(src);
        Ok(total)
    }

    /// Decode one frame from the start of `src` into `dst`.
    ///
    /// `Incomplete` when fewer than `4 + len` bytes are available.
    /// A prefix with the sign bit set or beyond the cap fails as a
    /// protocol error.
    pub fn deframe(&self, src: &[u8], dst: &mut [u8]) -> WireResult<Deframed> {
        if src.len() < HEADER_LEN {
            return Ok(Deframed::Incomplete);
        }
        let raw = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if raw & 0x8000_0000 != 0 {
            // Negative as an i32 — peer defect.
            return Err(WireError::InvalidFrame);
        }
        let len = raw as usize;
        if len > self.max_payload {
            return Err(WireError::FrameTooLarge {
                len: len as u64,
                cap: self.max_payload,
            });
        }
        if src.len() < HEADER_LEN + len {
            return Ok(Deframed::Incomplete);
        }
        if dst.len() < len {
            return Err(WireError::InvalidConfig(format!(
                "payload of {} bytes, destination holds {}",
                len,
                dst.len()
            )));
        }
        dst[..len].copy_from_slice(&src[HEADER_LEN..HEADER_LEN + len]);
        Ok(Deframed::Payload(len))
    }
}
