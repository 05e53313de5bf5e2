//! Error taxonomy for the multiplexor.
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use thiserror::Error;

/// Result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by a [`Session`](crate::Session) or [`MuxStream`](crate::MuxStream).
#[derive(Debug, Error)]
pub enum Error {
    /// An operation was attempted on a `Session` that is dying or already closed.
    #[error("broken pipe")]
    BrokenPipe,
    /// The local stream id space is exhausted; no more streams may be opened.
    #[error("go away: stream id space exhausted")]
    GoAway,
    /// A decoded frame carried a protocol version this Session does not speak.
    #[error("invalid protocol version {0:#x}")]
    InvalidProtocol(u8),
    /// An `Accept` deadline elapsed before a stream arrived.
    #[error("timeout")]
    Timeout,
    /// The underlying transport failed to read or write.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    /// A decoded frame carried a command byte outside the known set.
    #[error("unknown command {0:#x}")]
    UnknownCommand(u8),
}

impl Error {
    /// Whether this error is fatal to the owning Session (protocol/transport errors are;
    /// application-level errors such as [`Error::GoAway`] and [`Error::Timeout`] are not).
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidProtocol(_) | Self::Transport(_) | Self::UnknownCommand(_)
        )
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Transport(e) => e,
            Error::BrokenPipe => std::io::Error::new(std::io::ErrorKind::BrokenPipe, e),
            Error::Timeout => std::io::Error::new(std::io::ErrorKind::TimedOut, e),
            other => std::io::Error::other(other),
        }
    }
}
