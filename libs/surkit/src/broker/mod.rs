//! Message broker: an embeddable subject-based server, the client connection
//! modules publish through, and the start/connect/shutdown lifecycle.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

pub mod client;
mod error;
pub mod lifecycle;
mod protocol;
pub mod server;
pub mod subject;

pub use client::{BrokerConnection, MessageStream};
pub use error::BrokerError;
pub use lifecycle::{connect_embedded, connect_external, start_embedded, BrokerHandle};
pub use server::{EmbeddedServer, ServerOptions};

/// Header block carried by a "no responders" status reply.
pub(crate) const NO_RESPONDERS_HEADERS: &[u8] = b"NATS/1.0 503\r\n\r\n";

/// A message as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    /// Where a reply should be published, for request messages.
    pub reply: Option<String>,
    /// Raw header block (`NATS/1.0 ...`), if any.
    pub headers: Option<Bytes>,
    pub payload: Bytes,
}

impl Message {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            headers: None,
            payload: payload.into(),
        }
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    pub(crate) fn no_responders(reply: String) -> Self {
        Self {
            subject: reply,
            reply: None,
            headers: Some(Bytes::from_static(NO_RESPONDERS_HEADERS)),
            payload: Bytes::new(),
        }
    }

    /// Status code from the header block, e.g. `503` in `NATS/1.0 503`.
    pub fn status(&self) -> Option<u16> {
        let headers = self.headers.as_ref()?;
        let line = headers.split(|b| *b == b'\r').next()?;
        let line = std::str::from_utf8(line).ok()?;
        line.strip_prefix("NATS/1.0")?
            .split_whitespace()
            .next()?
            .parse()
            .ok()
    }

    pub fn is_no_responders(&self) -> bool {
        self.payload.is_empty() && self.status() == Some(503)
    }
}

/// What modules use to talk to the broker.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish `payload` to `subject` and wait up to `timeout` for one reply.
    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, BrokerError>;

    /// Fire-and-forget publish.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BrokerError>;
}

pub type SharedPublisher = Arc<dyn Publisher>;
