use bytes::Bytes;
use serde::de::IgnoredAny;
use std::time::Duration;
use surkit::broker::subject;
use surkit::SharedPublisher;
use tracing::debug;

use crate::config::BridgeConfig;
use crate::domain::error::DomainError;

/// Forwards one validated JSON payload to the broker as a request and
/// returns the reply payload untouched.
pub struct BridgeService {
    publisher: SharedPublisher,
    request_timeout: Duration,
    max_body_bytes: usize,
}

impl BridgeService {
    pub fn new(publisher: SharedPublisher, config: &BridgeConfig) -> Self {
        Self {
            publisher,
            request_timeout: config.request_timeout(),
            max_body_bytes: config.max_body_bytes,
        }
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// The topic must be a concrete publish subject.
    pub fn validate_topic<'a>(&self, topic: Option<&'a str>) -> Result<&'a str, DomainError> {
        let topic = topic
            .filter(|t| !t.is_empty())
            .ok_or(DomainError::MissingTopic)?;
        if !subject::is_valid_subject(topic) {
            return Err(DomainError::InvalidTopic {
                topic: topic.to_string(),
            });
        }
        Ok(topic)
    }

    /// Validate the payload as JSON and perform exactly one broker request.
    pub async fn forward(&self, topic: &str, payload: Bytes) -> Result<Bytes, DomainError> {
        serde_json::from_slice::<IgnoredAny>(&payload)
            .map_err(|source| DomainError::InvalidJson { source })?;

        debug!(topic, payload_size = payload.len(), "forwarding to broker");
        self.publisher
            .request(topic, payload, self.request_timeout)
            .await
            .map_err(|e| DomainError::from_broker(topic, e))
    }
}
