use std::io;

use thiserror::Error;

/// Error kinds shared by the transport, device and parser layers.
///
/// Transport-level kinds (`Io`, `Timeout`) and `Protocol` are retried inside
/// the packet functions up to the family's retry bound. `MalformedData` and
/// `Unsupported` are surfaced immediately. `Cancelled` aborts the whole
/// iteration.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid arguments")]
    InvalidArgs,

    #[error("out of memory")]
    NoMemory,

    #[error("no device found")]
    NoDevice,

    #[error("access denied")]
    NoAccess,

    #[error("input/output error: {0}")]
    Io(#[from] io::Error),

    #[error("timeout")]
    Timeout,

    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    #[error("malformed device data: {0}")]
    MalformedData(&'static str),

    #[error("operation not supported")]
    Unsupported,

    #[error("cancelled")]
    Cancelled,

    #[error("try again")]
    Again,
}

impl Error {
    /// Whether a packet function may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Timeout | Error::Protocol(_) | Error::Again
        )
    }

    /// Stable process exit code for the CLI, one per kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InvalidArgs => 1,
            Error::NoMemory => 2,
            Error::NoDevice => 3,
            Error::NoAccess => 4,
            Error::Io(_) => 5,
            Error::Timeout => 6,
            Error::Protocol(_) => 7,
            Error::MalformedData(_) => 8,
            Error::Unsupported => 9,
            Error::Cancelled => 10,
            Error::Again => 11,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
