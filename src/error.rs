//! Error taxonomy for the qconn client.
//!
//! Every failure is surfaced to the caller; nothing is retried or recovered
//! inside the library. [`Error::is_timeout`] lets callers decide whether a
//! fresh connection is worth trying.

use std::time::Duration;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced while talking to a qconn broker.
#[derive(Error, Debug)]
pub enum Error {
    /// Handshake failure: transport connect, banner mismatch, or a read that
    /// timed out or hit EOF before the greeting completed.
    #[error("could not connect to qconn broker on {addr}: {source}")]
    Connection {
        /// `host:port` that was dialled.
        addr: String,
        /// What went wrong.
        #[source]
        source: Box<Error>,
    },

    /// The broker refused (or never acknowledged) `service <name>`.
    #[error("could not activate service {service}: {reason}")]
    ServiceActivation {
        /// Service name that was requested.
        service: String,
        /// Response line or wrapped failure description.
        reason: String,
    },

    /// A framer read did not complete before its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The peer closed the stream while a frame was still incomplete.
    #[error("connection closed by peer")]
    Closed,

    /// The service has been disconnected.
    #[error("not connected")]
    NotConnected,

    /// Response shape does not match what the issued command expects.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The broker answered with an explicit `e:<message>` line.
    #[error("{context}: {message}")]
    Remote {
        /// Operation that failed, e.g. `unable to delete /tmp/x`.
        context: String,
        /// Message reported by the broker.
        message: String,
    },

    /// Data was lost or mis-framed: short write, payload not a whole number
    /// of records.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// The request was rejected locally before anything was sent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Transport I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns `true` if this error (or the error it wraps) is a timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Connection { source, .. } => source.is_timeout(),
            Self::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }
}
