//! Error taxonomy surfaced across the crate boundary.
//!
//! One variant per failure kind in spec §7, with `From` conversions at the
//! boundaries (codec, signer, transport) that mint the right variant at the
//! point where context (channel name, socket id, ...) is available, per the
//! propagation policy in §7.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// A failure kind the client façade can surface to callers.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Transport could not be opened, closed unexpectedly during handshake,
    /// or reconnection was exhausted.
    #[error("connection error: {0}")]
    Connection(String),

    /// The broker rejected the admission token for a restricted channel.
    #[error("authentication error on channel {channel}: {message}")]
    Authentication {
        /// Channel the subscribe request was for.
        channel: String,
        /// Server-provided rejection message, if any.
        message: String,
    },

    /// The broker rejected a subscribe request for a non-auth reason.
    #[error("subscription error on channel {channel}: {message}")]
    Subscription {
        /// Channel the subscribe request was for.
        channel: String,
        /// Server-provided rejection message, if any.
        message: String,
    },

    /// A malformed envelope, unexpected first envelope, or an out-of-context
    /// `pusher:error` from the server.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A subscribe waiter or handshake deadline elapsed.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The caller violated an API contract (trigger on an unsubscribed
    /// channel, client event without the `client-` prefix convention,
    /// presence channel without user data).
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// Required configuration was missing before `connect`.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Build a [`Error::Authentication`] for the given channel.
    pub fn authentication(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Authentication {
            channel: channel.into(),
            message: message.into(),
        }
    }

    /// Build a [`Error::Subscription`] for the given channel.
    pub fn subscription(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Subscription {
            channel: channel.into(),
            message: message.into(),
        }
    }

    /// True if this error kind indicates the connection was lost and a
    /// reconnect attempt is (or will be) underway.
    #[must_use]
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}
