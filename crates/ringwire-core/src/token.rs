//! Operation tokens.
//!
//! Every submission carries a 64-bit token in the kernel's `user_data`
//! field; the kernel hands it back unchanged in the completion entry.
//! The backend never interprets tokens — layout is a contract between
//! the submitter and its completion handler.
//!
//! The server dispatch loop packs three fields:
//!
//! ```text
//! 63            48 47                            16 15             0
//! ┌───────────────┬────────────────────────────────┬───────────────┐
//! │ op (16 bits)  │ connection id (32 bits)        │ req id (16)   │
//! └───────────────┴────────────────────────────────┴───────────────┘
//! ```
//!
//! Token 0 (op ACCEPT, conn 0, req 0) is reserved for the listener's
//! accept operation.

/// Operation discriminants stored in the top 16 bits.
pub mod op {
    pub const ACCEPT: u16 = 0;
    pub const RECV: u16 = 1;
    pub const SEND: u16 = 2;
    pub const CONNECT: u16 = 3;
    pub const CLOSE: u16 = 4;
    /// Sentinel for cancel submissions; completions with this op are
    /// internal and never reach user handlers.
    pub const CANCEL: u16 = 0xFFFF;
}

/// A packed operation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct OpToken(pub u64);

impl OpToken {
    /// The reserved accept token.
    pub const ACCEPT: Self = Self(0);

    #[inline]
    pub const fn encode(op: u16, conn: u32, req: u16) -> Self {
        Self(((op as u64) << 48) | ((conn as u64) << 16) | req as u64)
    }

    #[inline]
    pub const fn op(self) -> u16 {
        (self.0 >> 48) as u16
    }

    #[inline]
    pub const fn conn(self) -> u32 {
        (self.0 >> 16) as u32
    }

    #[inline]
    pub const fn req(self) -> u16 {
        self.0 as u16
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_accept(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for OpToken {
    #[inline]
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<OpToken> for u64 {
    #[inline]
    fn from(t: OpToken) -> u64 {
        t.0
    }
}
