use std::time::Duration;
use surkit::BrokerError;
use thiserror::Error;

/// Why a bridged request did not produce a reply.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("missing topic")]
    MissingTopic,

    #[error("invalid topic '{topic}'")]
    InvalidTopic { topic: String },

    #[error("unreadable request body: {message}")]
    UnreadableBody { message: String },

    #[error("request body is not valid JSON: {source}")]
    InvalidJson {
        #[source]
        source: serde_json::Error,
    },

    #[error("no reply on '{topic}' within {timeout:?}")]
    Timeout { topic: String, timeout: Duration },

    #[error("broker request on '{topic}' failed")]
    Broker {
        topic: String,
        #[source]
        source: BrokerError,
    },
}

impl DomainError {
    /// Short outcome label for logs.
    pub fn outcome(&self) -> &'static str {
        match self {
            DomainError::MissingTopic
            | DomainError::InvalidTopic { .. }
            | DomainError::UnreadableBody { .. }
            | DomainError::InvalidJson { .. } => "rejected",
            DomainError::Timeout { .. } => "timeout",
            DomainError::Broker { .. } => "broker_error",
        }
    }

    pub(crate) fn from_broker(topic: &str, err: BrokerError) -> Self {
        match err {
            BrokerError::RequestTimeout(timeout) => DomainError::Timeout {
                topic: topic.to_string(),
                timeout,
            },
            source => DomainError::Broker {
                topic: topic.to_string(),
                source,
            },
        }
    }
}
