//! Error types for gangway-core.

use thiserror::Error;

/// Main error type for gangway operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Missing or malformed configuration value.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Transport-level bind failure.
    #[error("bind error: {message}")]
    Bind { message: String },

    /// Malformed private key material or passphrase.
    #[error("key material error: {message}")]
    KeyMaterial { message: String },

    /// No host key has been set in the keystore.
    #[error("no host key set")]
    NoHostKey,

    /// The presented public key algorithm is not accepted.
    #[error("key type not supported: {algorithm}")]
    KeyTypeNotSupported { algorithm: String },

    /// Authentication failed. Deliberately generic: the internal reason is
    /// logged at the point of failure and never carried toward the peer.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Transport layer error.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// Channel-level protocol error.
    #[error("channel error: {message}")]
    Channel { message: String },

    /// Connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The worker pool has no free capacity.
    #[error("worker pool saturated")]
    PoolSaturated,

    /// The worker pool has been stopped.
    #[error("worker pool closed")]
    PoolClosed,
}

impl Error {
    /// Returns true if this is the generic authentication failure.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Error::AuthenticationFailed)
    }

    /// Returns true if this error is transient for the unit of work that hit
    /// it: the surrounding loop may log it and continue.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. } | Error::ConnectionClosed | Error::PoolSaturated
        )
    }

    /// Shorthand for a transport error with a formatted message.
    pub fn transport(message: impl Into<String>) -> Self {
        Error::Transport {
            message: message.into(),
        }
    }

    /// Shorthand for a channel error with a formatted message.
    pub fn channel(message: impl Into<String>) -> Self {
        Error::Channel {
            message: message.into(),
        }
    }
}

/// Convenience result type for gangway operations.
pub type Result<T> = std::result::Result<T, Error>;
