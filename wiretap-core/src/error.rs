//! Error taxonomy.
//!
//! Every failure the core surfaces belongs to one of these kinds. Propagation policy
//! lives with the callers: `StoreContention` and idle-stream EOF are recovered locally,
//! everything else is surfaced to the connection's task group and ends the handler.

use std::io;

/// The shared error type returned by every codec, engine and matcher in this workspace.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed length prefix, bad frame, truncated packet. Fatal to the connection.
    #[error("framing error: {0}")]
    Framing(String),

    /// A peer violated the protocol in a way that has a well-defined response
    /// (e.g. an even client stream id, a PING on a non-zero stream).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Replay found no matching recorded interaction for a completed request.
    #[error("no mock for {0}")]
    NoMock(String),

    /// A `claim`/`update` compare-and-swap against the mock store lost a race.
    /// Recovered locally by retrying the matcher cascade from the top.
    #[error("store contention, retry")]
    StoreContention,

    /// The connection's cancel signal fired.
    #[error("cancelled")]
    Cancelled,

    /// Record mode failed to classify or match and fell back to byte-copy passthrough;
    /// not itself fatal, but no mock is produced for the exchange.
    #[error("passthrough: {0}")]
    Passthrough(String),

    /// Lower-level I/O failure on the underlying socket.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn framing(msg: impl Into<String>) -> Self {
        Error::Framing(msg.into())
    }

    pub fn protocol_violation(msg: impl Into<String>) -> Self {
        Error::ProtocolViolation(msg.into())
    }

    pub fn no_mock(what: impl Into<String>) -> Self {
        Error::NoMock(what.into())
    }

    /// `true` for the two kinds that can be recovered without tearing down
    /// the connection handler.
    pub fn is_locally_recoverable(&self) -> bool {
        matches!(self, Error::StoreContention)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Shorthand for building a [`Error::Framing`] with `format!` semantics, mirroring
/// `sqlx_core::err_protocol!`.
#[macro_export]
macro_rules! err_framing {
    ($($fmt:tt)*) => {
        $crate::error::Error::framing(format!($($fmt)*))
    };
}

#[macro_export]
macro_rules! err_protocol {
    ($($fmt:tt)*) => {
        $crate::error::Error::protocol_violation(format!($($fmt)*))
    };
}
