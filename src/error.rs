//! The surface-level error/return-code set shared by every component.
//!
//! Mirrors the integer-valued error kinds the public API returns
//! (`Success(0), Init(-1), Memory(-2), Network(-3), Timeout(-4),
//! NotFound(-5), Invalid(-6), Busy(-7), Permission(-8)`). `Success` is
//! never constructed here — callers that succeed return `Ok(())`/`Ok(T)`.

use std::fmt;

pub type Result<T> = std::result::Result<T, DsmError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Init,
    Memory,
    Network,
    Timeout,
    NotFound,
    Invalid,
    Busy,
    Permission,
}

impl ErrorKind {
    /// Integer code as surfaced by the public API (§6).
    pub const fn code(self) -> i32 {
        match self {
            ErrorKind::Init => -1,
            ErrorKind::Memory => -2,
            ErrorKind::Network => -3,
            ErrorKind::Timeout => -4,
            ErrorKind::NotFound => -5,
            ErrorKind::Invalid => -6,
            ErrorKind::Busy => -7,
            ErrorKind::Permission => -8,
        }
    }

    /// Transient errors are the ones the migration engine retries with
    /// backoff (§7): timeouts, network hiccups, and a stale-owner
    /// `Invalid` reply.
    pub const fn is_transient(self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::Network | ErrorKind::Invalid | ErrorKind::Busy)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Init => "init",
            ErrorKind::Memory => "memory",
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Invalid => "invalid",
            ErrorKind::Busy => "busy",
            ErrorKind::Permission => "permission",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DsmError {
    #[error("init: {0}")]
    Init(String),
    #[error("memory: {0}")]
    Memory(String),
    #[error("network: {0}")]
    Network(String),
    #[error("timeout waiting on {what} after {millis}ms")]
    Timeout { what: &'static str, millis: u64 },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("busy: {0}")]
    Busy(String),
    #[error("permission: {0}")]
    Permission(String),
}

impl DsmError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            DsmError::Init(_) => ErrorKind::Init,
            DsmError::Memory(_) => ErrorKind::Memory,
            DsmError::Network(_) => ErrorKind::Network,
            DsmError::Timeout { .. } => ErrorKind::Timeout,
            DsmError::NotFound(_) => ErrorKind::NotFound,
            DsmError::Invalid(_) => ErrorKind::Invalid,
            DsmError::Busy(_) => ErrorKind::Busy,
            DsmError::Permission(_) => ErrorKind::Permission,
        }
    }

    pub fn timeout(what: &'static str, millis: u64) -> Self {
        DsmError::Timeout { what, millis }
    }
}

impl From<ErrorKind> for DsmError {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Init => DsmError::Init("remote error".into()),
            ErrorKind::Memory => DsmError::Memory("remote error".into()),
            ErrorKind::Network => DsmError::Network("remote error".into()),
            ErrorKind::Timeout => DsmError::Timeout { what: "remote", millis: 0 },
            ErrorKind::NotFound => DsmError::NotFound("remote error".into()),
            ErrorKind::Invalid => DsmError::Invalid("remote error".into()),
            ErrorKind::Busy => DsmError::Busy("remote error".into()),
            ErrorKind::Permission => DsmError::Permission("remote error".into()),
        }
    }
}

impl From<std::io::Error> for DsmError {
    fn from(e: std::io::Error) -> Self {
        DsmError::Network(e.to_string())
    }
}
