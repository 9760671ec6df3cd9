//! Transport error types and the classification registry.
//!
//! Every failure belongs to exactly one [`ErrorCategory`]; the retry
//! policy consults the category, never the concrete error. Kernel errors
//! travel as negated errno inside completion results and are only lifted
//! into [`WireError::Os`] at the API boundary.

use std::error::Error;
use std::fmt;

/// Closed classification set. PROTOCOL and FATAL are never retried;
/// the retry policy decides the rest per its opt-in flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCategory {
    /// Timeouts, interruptions, EAGAIN-style busy conditions.
    Transient = 0,
    /// Peer-side failures: refused, reset, broken pipe, unreachable.
    Network = 1,
    /// Programming or peer protocol defects. Never retried.
    Protocol = 2,
    /// Exhaustion: pools, fds, submission queues.
    Resource = 3,
    /// Unrecoverable: missing kernel support, closed arenas, OOM. Never retried.
    Fatal = 4,
    /// Unclassified; the retry policy decides.
    Unknown = 5,
}

impl ErrorCategory {
    /// Categories the policy may retry at all.
    #[inline]
    pub const fn is_retriable(self) -> bool {
        !matches!(self, ErrorCategory::Protocol | ErrorCategory::Fatal)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transient => "TRANSIENT",
            Self::Network => "NETWORK",
            Self::Protocol => "PROTOCOL",
            Self::Resource => "RESOURCE",
            Self::Fatal => "FATAL",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Transport error.
#[derive(Debug)]
pub enum WireError {
    /// Ring setup failed (io_uring unavailable or rejected the config).
    RingSetup(i32),
    /// The submit syscall failed.
    RingSubmit(i32),
    /// Submission queue stayed full after force-submit retries.
    RingFull,
    /// Buffer pool has no free buffers.
    PoolExhausted,
    /// Operation on a closed pool.
    PoolClosed,
    /// A buffer was released to a pool that does not own it.
    ForeignBuffer,
    /// Release of an already-free buffer on the lock-free pool.
    DoubleFree(u32),
    /// Access to memory carved from a closed arena.
    ArenaClosed,
    /// Frame prefix negative or not decodable.
    InvalidFrame,
    /// Frame length prefix exceeds the configured cap.
    FrameTooLarge { len: u64, cap: usize },
    /// Operation before `initialize` or on a consumed backend.
    NotInitialized,
    /// Feature not offered by this backend (e.g. zero-copy on the selector).
    Unsupported(&'static str),
    /// Bad construction parameters.
    InvalidConfig(String),
    /// New work rejected because shutdown has begun.
    ShuttingDown,
    /// Raw OS error.
    Os(i32),
}

impl WireError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::RingSetup(_) => ErrorCategory::Fatal,
            Self::RingSubmit(e) => classify_errno(*e),
            Self::RingFull => ErrorCategory::Resource,
            Self::PoolExhausted => ErrorCategory::Resource,
            Self::PoolClosed => ErrorCategory::Fatal,
            Self::ForeignBuffer => ErrorCategory::Protocol,
            Self::DoubleFree(_) => ErrorCategory::Protocol,
            Self::ArenaClosed => ErrorCategory::Fatal,
            Self::InvalidFrame => ErrorCategory::Protocol,
            Self::FrameTooLarge { .. } => ErrorCategory::Protocol,
            Self::NotInitialized => ErrorCategory::Protocol,
            Self::Unsupported(_) => ErrorCategory::Protocol,
            Self::InvalidConfig(_) => ErrorCategory::Protocol,
            Self::ShuttingDown => ErrorCategory::Transient,
            Self::Os(e) => classify_errno(*e),
        }
    }

    /// The underlying errno, when there is one.
    pub fn os_error(&self) -> Option<i32> {
        match self {
            Self::RingSetup(e) | Self::RingSubmit(e) | Self::Os(e) => Some(*e),
            _ => None,
        }
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RingSetup(e) => write!(f, "ring setup: errno {}", e),
            Self::RingSubmit(e) => write!(f, "ring submit: errno {}", e),
            Self::RingFull => write!(f, "submission queue full"),
            Self::PoolExhausted => write!(f, "buffer pool exhausted"),
            Self::PoolClosed => write!(f, "buffer pool closed"),
            Self::ForeignBuffer => write!(f, "buffer does not belong to this pool"),
            Self::DoubleFree(idx) => write!(f, "double free of buffer {}", idx),
            Self::ArenaClosed => write!(f, "arena closed"),
            Self::InvalidFrame => write!(f, "invalid frame"),
            Self::FrameTooLarge { len, cap } => {
                write!(f, "frame length {} exceeds cap {}", len, cap)
            }
            Self::NotInitialized => write!(f, "backend not initialized"),
            Self::Unsupported(what) => write!(f, "unsupported: {}", what),
            Self::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
            Self::ShuttingDown => write!(f, "shutting down"),
            Self::Os(e) => write!(f, "OS error: errno {}", e),
        }
    }
}

impl Error for WireError {}

pub type WireResult<T> = std::result::Result<T, WireError>;

// ── Classification ───────────────────────────────────────────────────

// Linux errno values, spelled out so this crate stays libc-free.
const EAGAIN: i32 = 11;
const EINTR: i32 = 4;
const ETIMEDOUT: i32 = 110;
const EINPROGRESS: i32 = 115;
const ECONNRESET: i32 = 104;
const ECONNREFUSED: i32 = 111;
const ECONNABORTED: i32 = 103;
const EPIPE: i32 = 32;
const EHOSTUNREACH: i32 = 113;
const ENETUNREACH: i32 = 101;
const ENOTCONN: i32 = 107;
const ENOBUFS: i32 = 105;
const ENOMEM: i32 = 12;
const EMFILE: i32 = 24;
const ENFILE: i32 = 23;
const EINVAL: i32 = 22;
const EPROTO: i32 = 71;
const EBADF: i32 = 9;
const ENOSYS: i32 = 38;

/// Map an errno (positive or negated) to a category.
pub fn classify_errno(errno: i32) -> ErrorCategory {
    match errno.abs() {
        EAGAIN | EINTR | ETIMEDOUT | EINPROGRESS => ErrorCategory::Transient,
        ECONNRESET | ECONNREFUSED | ECONNABORTED | EPIPE | EHOSTUNREACH | ENETUNREACH
        | ENOTCONN => ErrorCategory::Network,
        ENOBUFS | ENOMEM | EMFILE | ENFILE => ErrorCategory::Resource,
        EINVAL | EPROTO | EBADF => ErrorCategory::Protocol,
        ENOSYS => ErrorCategory::Fatal,
        _ => ErrorCategory::Unknown,
    }
}

/// Substring registry over error messages. First match wins; the table
/// is ordered most-specific first.
const MESSAGE_RULES: &[(&str, ErrorCategory)] = &[
    ("too many open files", ErrorCategory::Resource),
    ("out of memory", ErrorCategory::Fatal),
    ("invalid frame", ErrorCategory::Protocol),
    ("malformed", ErrorCategory::Protocol),
    ("connection reset", ErrorCategory::Network),
    ("broken pipe", ErrorCategory::Network),
    ("refused", ErrorCategory::Network),
    ("unreachable", ErrorCategory::Network),
    ("unknown host", ErrorCategory::Network),
    ("channel closed", ErrorCategory::Network),
    ("timed out", ErrorCategory::Transient),
    ("timeout", ErrorCategory::Transient),
    ("interrupted", ErrorCategory::Transient),
    ("busy", ErrorCategory::Transient),
    ("exhausted", ErrorCategory::Resource),
    ("queue full", ErrorCategory::Resource),
];

pub fn classify_message(msg: &str) -> Option<ErrorCategory> {
    let lower = msg.to_ascii_lowercase();
    MESSAGE_RULES
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, cat)| *cat)
}

/// Classify an arbitrary error by walking its cause chain.
///
/// WireError is matched by type; everything else by message substrings.
/// The first classified link decides; an unmatched chain is UNKNOWN.
pub fn classify(err: &(dyn Error + 'static)) -> ErrorCategory {
    let mut cur: Option<&(dyn Error + 'static)> = Some(err);
    while let Some(e) = cur {
        if let Some(wire) = e.downcast_ref::<WireError>() {
            return wire.category();
        }
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if let Some(errno) = io.raw_os_error() {
                return classify_errno(errno);
            }
        }
        if let Some(cat) = classify_message(&e.to_string()) {
            return cat;
        }
        cur = e.source();
    }
    ErrorCategory::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_classification() {
        assert_eq!(classify_errno(EAGAIN), ErrorCategory::Transient);
        assert_eq!(classify_errno(-ECONNRESET), ErrorCategory::Network);
        assert_eq!(classify_errno(EPIPE), ErrorCategory::Network);
        assert_eq!(classify_errno(ENOBUFS), ErrorCategory::Resource);
        assert_eq!(classify_errno(EINVAL), ErrorCategory::Protocol);
        assert_eq!(classify_errno(ENOSYS), ErrorCategory::Fatal);
        assert_eq!(classify_errno(9999), ErrorCategory::Unknown);
    }

    #[test]
    fn message_classification() {
        assert_eq!(
            classify_message("Connection reset by peer"),
            Some(ErrorCategory::Network)
        );
        assert_eq!(
            classify_message("read timed out after 5s"),
            Some(ErrorCategory::Transient)
        );
        assert_eq!(
            classify_message("too many open files"),
            Some(ErrorCategory::Resource)
        );
        assert_eq!(classify_message("all is well"), None);
    }

    #[test]
    fn fixed_variant_categories() {
        assert_eq!(WireError::RingFull.category(), ErrorCategory::Resource);
        assert_eq!(WireError::PoolClosed.category(), ErrorCategory::Fatal);
        assert_eq!(WireError::InvalidFrame.category(), ErrorCategory::Protocol);
        assert_eq!(WireError::DoubleFree(3).category(), ErrorCategory::Protocol);
        assert_eq!(WireError::ArenaClosed.category(), ErrorCategory::Fatal);
        assert!(!WireError::InvalidFrame.category().is_retriable());
        assert!(WireError::RingFull.category().is_retriable());
    }

    #[test]
    fn chain_walk_finds_deep_cause() {
        #[derive(Debug)]
        struct Outer(std::io::Error);
        impl fmt::Display for Outer {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "request failed")
            }
        }
        impl Error for Outer {
            fn source(&self) -> Option<&(dyn Error + 'static)> {
                Some(&self.0)
            }
        }

        let inner = std::io::Error::from_raw_os_error(ECONNREFUSED);
        let outer = Outer(inner);
        assert_eq!(classify(&outer), ErrorCategory::Network);
    }

    #[test]
    fn unmatched_chain_is_unknown() {
        let e = std::io::Error::new(std::io::ErrorKind::Other, "strange state");
        assert_eq!(classify(&e), ErrorCategory::Unknown);
    }

    #[test]
    fn wire_error_in_chain_matched_by_type() {
        let e = WireError::PoolExhausted;
        assert_eq!(classify(&e), ErrorCategory::Resource);
    }
}
