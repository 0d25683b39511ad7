//! Realtime service errors

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used across the crate.
pub type Result<T> = anyhow::Result<T, Error>;

/// Domain level error type shared by the presence crates.
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Error {
    /// Configuration is incomplete or contradictory.
    #[error("code: invalid_config, description: {0}")]
    InvalidConfig(String),

    /// The bus refused or failed the connection handshake.
    #[error("code: handshake_failed, description: {0}")]
    Handshake(String),

    /// An established connection failed or was closed by the peer.
    #[error("code: connection_lost, description: {0}")]
    Connection(String),

    /// A topic subscription could not be issued.
    #[error("code: subscription_failed, description: {0}")]
    Subscription(String),

    /// A message or frame could not be decoded.
    #[error("code: invalid_format, description: {0}")]
    InvalidFormat(String),

    /// A non recoverable internal error occurred.
    #[error("code: internal, description: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the stable error code associated with the variant.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig(_) => "invalid_config",
            Self::Handshake(_) => "handshake_failed",
            Self::Connection(_) => "connection_lost",
            Self::Subscription(_) => "subscription_failed",
            Self::InvalidFormat(_) => "invalid_format",
            Self::Internal(_) => "internal",
        }
    }

    /// Returns the error description.
    #[must_use]
    pub fn description(&self) -> String {
        self.to_string()
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        let chain = err.chain().map(ToString::to_string).collect::<Vec<_>>().join(" -> ");

        // if type is Error, return it with the newly added context
        if let Some(inner) = err.downcast_ref::<Self>() {
            tracing::debug!("Error: {err}, caused by: {inner}");

            return match inner {
                Self::InvalidConfig(_) => Self::InvalidConfig(chain),
                Self::Handshake(_) => Self::Handshake(chain),
                Self::Connection(_) => Self::Connection(chain),
                Self::Subscription(_) => Self::Subscription(chain),
                Self::InvalidFormat(_) => Self::InvalidFormat(chain),
                Self::Internal(_) => Self::Internal(chain),
            };
        }

        // otherwise, return an Internal error
        Self::Internal(chain)
    }
}

#[macro_export]
macro_rules! invalid_config {
    ($fmt:expr, $($arg:tt)*) => {
        $crate::Error::InvalidConfig(format!($fmt, $($arg)*))
    };
     ($err:expr $(,)?) => {
        $crate::Error::InvalidConfig(format!($err))
    };
}

#[macro_export]
macro_rules! handshake_error {
    ($fmt:expr, $($arg:tt)*) => {
        $crate::Error::Handshake(format!($fmt, $($arg)*))
    };
     ($err:expr $(,)?) => {
        $crate::Error::Handshake(format!($err))
    };
}

#[macro_export]
macro_rules! connection_error {
    ($fmt:expr, $($arg:tt)*) => {
        $crate::Error::Connection(format!($fmt, $($arg)*))
    };
     ($err:expr $(,)?) => {
        $crate::Error::Connection(format!($err))
    };
}
