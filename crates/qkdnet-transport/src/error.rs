//! Server-side transport errors.

use thiserror::Error;

/// Errors raised while binding or running a [`crate::QuicServer`].
#[derive(Error, Debug)]
pub enum ServerError {
    /// Configuration error (invalid bind address, unreadable TLS files).
    ///
    /// Fatal at startup. Fix configuration and restart.
    #[error("configuration error: {0}")]
    Config(String),

    /// Endpoint or connection failure.
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
