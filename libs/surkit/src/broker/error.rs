use std::time::Duration;
use surkit_bootstrap::ConfigError;
use thiserror::Error;

/// Failures of the broker server and of clients talking to it.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("broker did not become ready for connections within {0:?}")]
    StartupTimeout(Duration),

    #[error("failed to bind broker listener on {addr}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to connect to broker at {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    #[error("no responders available for subject '{0}'")]
    NoResponders(String),

    #[error("invalid subject '{0}'")]
    InvalidSubject(String),

    #[error("broker connection closed")]
    ConnectionClosed,

    #[error("broker transport error: {0}")]
    Transport(String),
}

impl BrokerError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, BrokerError::RequestTimeout(_))
    }
}
