//! Client side: a broker connection that is either attached in-process to an
//! embedded server or dialed over the network with `async-nats`.

use super::server::{Delivery, EmbeddedServer, ServerCore};
use super::{subject, BrokerError, Message, Publisher};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{BoxStream, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Stream of messages for one subscription. Dropping it unsubscribes.
pub type MessageStream = BoxStream<'static, Message>;

type PendingReplies = DashMap<String, oneshot::Sender<Message>>;

/// A connection to the broker. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct BrokerConnection {
    name: Arc<str>,
    transport: Arc<Transport>,
}

enum Transport {
    InProcess(LocalClient),
    Nats(async_nats::Client),
}

impl std::fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .finish()
    }
}

impl BrokerConnection {
    /// Attach to an embedded server without any network hop.
    pub fn in_process(name: impl Into<String>, server: &EmbeddedServer) -> Result<Self, BrokerError> {
        let local = LocalClient::attach(server.core().clone())?;
        Ok(Self {
            name: Arc::from(name.into()),
            transport: Arc::new(Transport::InProcess(local)),
        })
    }

    /// Dial a broker at `url` (`nats://host:port`).
    pub async fn connect(name: impl Into<String>, url: &str) -> Result<Self, BrokerError> {
        let name = name.into();
        let client = async_nats::ConnectOptions::new()
            .name(name.clone())
            // Request deadlines are enforced per call.
            .request_timeout(None)
            .connect(url)
            .await
            .map_err(|e| BrokerError::Connect {
                address: url.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            name: Arc::from(name),
            transport: Arc::new(Transport::Nats(client)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &'static str {
        match &*self.transport {
            Transport::InProcess(_) => "in-process",
            Transport::Nats(_) => "nats",
        }
    }

    /// Requests still waiting for a reply. Always zero for network connections.
    pub fn pending_requests(&self) -> usize {
        match &*self.transport {
            Transport::InProcess(local) => local.pending.len(),
            Transport::Nats(_) => 0,
        }
    }

    /// Subscribe to a subject pattern (`*` and `>` wildcards allowed).
    pub async fn subscribe(&self, pattern: &str) -> Result<MessageStream, BrokerError> {
        if !subject::is_valid_pattern(pattern) {
            return Err(BrokerError::InvalidSubject(pattern.to_string()));
        }
        match &*self.transport {
            Transport::InProcess(local) => local.subscribe(pattern),
            Transport::Nats(client) => {
                let subscriber = client
                    .subscribe(pattern.to_string())
                    .await
                    .map_err(|e| BrokerError::Transport(e.to_string()))?;
                Ok(subscriber
                    .map(|m| Message {
                        subject: m.subject.to_string(),
                        reply: m.reply.map(|r| r.to_string()),
                        headers: None,
                        payload: m.payload,
                    })
                    .boxed())
            }
        }
    }

    /// Flush outstanding work and close the connection for new traffic.
    pub async fn drain(&self) -> Result<(), BrokerError> {
        match &*self.transport {
            Transport::InProcess(local) => {
                local.close();
                Ok(())
            }
            Transport::Nats(client) => client
                .flush()
                .await
                .map_err(|e| BrokerError::Transport(e.to_string())),
        }
    }
}

#[async_trait]
impl Publisher for BrokerConnection {
    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, BrokerError> {
        if !subject::is_valid_subject(subject) {
            return Err(BrokerError::InvalidSubject(subject.to_string()));
        }
        match &*self.transport {
            Transport::InProcess(local) => local.request(subject, payload, timeout).await,
            Transport::Nats(client) => {
                use async_nats::RequestErrorKind;

                let fut = client.request(subject.to_string(), payload);
                match tokio::time::timeout(timeout, fut).await {
                    Err(_) => Err(BrokerError::RequestTimeout(timeout)),
                    Ok(Ok(msg)) => Ok(msg.payload),
                    Ok(Err(e)) => Err(match e.kind() {
                        RequestErrorKind::TimedOut => BrokerError::RequestTimeout(timeout),
                        RequestErrorKind::NoResponders => {
                            BrokerError::NoResponders(subject.to_string())
                        }
                        _ => BrokerError::Transport(e.to_string()),
                    }),
                }
            }
        }
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BrokerError> {
        if !subject::is_valid_subject(subject) {
            return Err(BrokerError::InvalidSubject(subject.to_string()));
        }
        match &*self.transport {
            Transport::InProcess(local) => local.publish(Message::new(subject, payload)),
            Transport::Nats(client) => client
                .publish(subject.to_string(), payload)
                .await
                .map_err(|e| BrokerError::Transport(e.to_string())),
        }
    }
}

/// In-process client. Replies arrive on a per-client inbox subscription
/// (`_INBOX.<id>.*`) and are dispatched to the waiting request by token.
struct LocalClient {
    core: Arc<ServerCore>,
    client_id: u64,
    inbox_prefix: String,
    pending: Arc<PendingReplies>,
    next_sid: AtomicU64,
    next_token: AtomicU64,
    closed: AtomicBool,
}

impl LocalClient {
    fn attach(core: Arc<ServerCore>) -> Result<Self, BrokerError> {
        if !core.is_running() {
            return Err(BrokerError::ConnectionClosed);
        }
        let client_id = core.next_client_id();
        let inbox_prefix = format!("_INBOX.{}", uuid::Uuid::new_v4().simple());
        let pending: Arc<PendingReplies> = Arc::new(DashMap::new());

        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        core.subscribe(
            client_id,
            Arc::from("0"),
            &format!("{inbox_prefix}.*"),
            None,
            tx,
        )?;

        let waiting = pending.clone();
        core.tasks.spawn(async move {
            while let Some(delivery) = rx.recv().await {
                let Some(token) = delivery.message.subject.rsplit('.').next() else {
                    continue;
                };
                if let Some((_, reply_tx)) = waiting.remove(token) {
                    let _ = reply_tx.send(delivery.message);
                }
            }
        });

        Ok(Self {
            core,
            client_id,
            inbox_prefix,
            pending,
            next_sid: AtomicU64::new(1),
            next_token: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) || !self.core.is_running() {
            return Err(BrokerError::ConnectionClosed);
        }
        Ok(())
    }

    fn subscribe(&self, pattern: &str) -> Result<MessageStream, BrokerError> {
        self.ensure_open()?;
        let sid = self.next_sid.fetch_add(1, Ordering::Relaxed).to_string();
        let (tx, rx) = mpsc::unbounded_channel::<Delivery>();
        self.core
            .subscribe(self.client_id, Arc::from(sid), pattern, None, tx)?;
        Ok(UnboundedReceiverStream::new(rx).map(|d| d.message).boxed())
    }

    fn publish(&self, message: Message) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.core.route(message);
        Ok(())
    }

    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, BrokerError> {
        self.ensure_open()?;
        let token = self.next_token.fetch_add(1, Ordering::Relaxed).to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(token.clone(), reply_tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            token: &token,
        };

        let reply_to = format!("{}.{}", self.inbox_prefix, token);
        let delivered = self
            .core
            .route(Message::new(subject, payload).with_reply(reply_to));
        if delivered == 0 {
            return Err(BrokerError::NoResponders(subject.to_string()));
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) if reply.is_no_responders() => {
                Err(BrokerError::NoResponders(subject.to_string()))
            }
            Ok(Ok(reply)) => Ok(reply.payload),
            Ok(Err(_)) => Err(BrokerError::ConnectionClosed),
            Err(_) => Err(BrokerError::RequestTimeout(timeout)),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.core.remove_owner(self.client_id);
        self.pending.clear();
    }
}

/// Removes a pending reply slot however the request ends.
struct PendingGuard<'a> {
    pending: &'a PendingReplies,
    token: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.token);
    }
}
