//! The embedded broker: a subject table routing published messages to
//! subscribers, with an optional network listener speaking the NATS core
//! text protocol.

use super::{protocol, subject, BrokerError, Message};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// How long `start` waits for the server to accept connections.
pub const READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest payload accepted from network clients.
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub server_name: String,
    pub host: String,
    pub port: u16,
    /// Do not open a network listener; only in-process clients can attach.
    pub dont_listen: bool,
    /// Advertised to clients; persistent streams themselves are not provided.
    pub streams_enabled: bool,
    pub stream_domain: String,
    /// Debug-level tracing of connections, subscriptions and protocol errors.
    pub logging: bool,
    pub max_payload: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            server_name: "surserver-server".to_string(),
            host: "127.0.0.1".to_string(),
            port: 4222,
            dont_listen: true,
            streams_enabled: true,
            stream_domain: "surserver".to_string(),
            logging: false,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

/// A routed message tagged with the subscription id it matched.
#[derive(Debug)]
pub(crate) struct Delivery {
    pub sid: Arc<str>,
    pub message: Message,
}

pub(crate) type DeliverySink = mpsc::UnboundedSender<Delivery>;

struct SubEntry {
    owner: u64,
    sid: Arc<str>,
    pattern: String,
    queue: Option<String>,
    max: Option<u64>,
    delivered: u64,
    sink: DeliverySink,
}

impl SubEntry {
    fn exhausted(&self) -> bool {
        self.max.is_some_and(|max| self.delivered >= max)
    }
}

/// Shared state of a running server.
pub(crate) struct ServerCore {
    pub(crate) options: ServerOptions,
    pub(crate) server_id: String,
    subs: Mutex<Vec<SubEntry>>,
    next_client: AtomicU64,
    queue_cursor: AtomicUsize,
    pub(crate) cancel: CancellationToken,
    pub(crate) tasks: TaskTracker,
}

impl ServerCore {
    fn new(options: ServerOptions) -> Self {
        Self {
            options,
            server_id: uuid::Uuid::new_v4().simple().to_string().to_uppercase(),
            subs: Mutex::new(Vec::new()),
            next_client: AtomicU64::new(1),
            queue_cursor: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    pub(crate) fn next_client_id(&self) -> u64 {
        self.next_client.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn subscribe(
        &self,
        owner: u64,
        sid: Arc<str>,
        pattern: &str,
        queue: Option<String>,
        sink: DeliverySink,
    ) -> Result<(), BrokerError> {
        if !self.is_running() {
            return Err(BrokerError::ConnectionClosed);
        }
        if !subject::is_valid_pattern(pattern) {
            return Err(BrokerError::InvalidSubject(pattern.to_string()));
        }
        if self.options.logging {
            tracing::debug!(client = owner, sid = %sid, pattern, ?queue, "subscription added");
        }
        self.subs.lock().push(SubEntry {
            owner,
            sid,
            pattern: pattern.to_string(),
            queue,
            max: None,
            delivered: 0,
            sink,
        });
        Ok(())
    }

    /// Remove a subscription now, or once it has delivered `max` messages.
    pub(crate) fn unsubscribe(&self, owner: u64, sid: &str, max: Option<u64>) {
        let mut subs = self.subs.lock();
        match max {
            Some(max) => {
                if let Some(entry) = subs
                    .iter_mut()
                    .find(|e| e.owner == owner && &*e.sid == sid)
                {
                    entry.max = Some(max);
                }
                subs.retain(|e| !e.exhausted());
            }
            None => subs.retain(|e| !(e.owner == owner && &*e.sid == sid)),
        }
        if self.options.logging {
            tracing::debug!(client = owner, sid, ?max, "subscription removed");
        }
    }

    /// Drop every subscription held by a client.
    pub(crate) fn remove_owner(&self, owner: u64) {
        self.subs.lock().retain(|e| e.owner != owner);
    }

    pub(crate) fn subscription_count(&self) -> usize {
        self.subs.lock().len()
    }

    /// Deliver `message` to every matching subscription, at most one member
    /// per queue group. Returns the number of deliveries made.
    pub(crate) fn route(&self, message: Message) -> usize {
        let mut subs = self.subs.lock();
        subs.retain(|e| !e.sink.is_closed());

        let mut targets: Vec<usize> = Vec::new();
        let mut groups: Vec<(&str, Vec<usize>)> = Vec::new();
        for (idx, entry) in subs.iter().enumerate() {
            if !subject::matches(&entry.pattern, &message.subject) {
                continue;
            }
            match entry.queue.as_deref() {
                None => targets.push(idx),
                Some(queue) => match groups.iter_mut().find(|(name, _)| *name == queue) {
                    Some((_, members)) => members.push(idx),
                    None => groups.push((queue, vec![idx])),
                },
            }
        }
        for (_, members) in &groups {
            let pick = self.queue_cursor.fetch_add(1, Ordering::Relaxed) % members.len();
            targets.push(members[pick]);
        }

        let mut delivered = 0;
        for idx in targets {
            let entry = &mut subs[idx];
            let delivery = Delivery {
                sid: entry.sid.clone(),
                message: message.clone(),
            };
            if entry.sink.send(delivery).is_ok() {
                entry.delivered += 1;
                delivered += 1;
            }
        }
        subs.retain(|e| !e.exhausted());
        delivered
    }

    fn clear(&self) {
        self.subs.lock().clear();
    }
}

/// Handle to a running embedded broker. Clones share the same server.
#[derive(Clone)]
pub struct EmbeddedServer {
    core: Arc<ServerCore>,
    listen_addr: Option<SocketAddr>,
}

impl std::fmt::Debug for EmbeddedServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddedServer")
            .field("server_name", &self.core.options.server_name)
            .field("listen_addr", &self.listen_addr)
            .field("running", &self.core.is_running())
            .finish()
    }
}

impl EmbeddedServer {
    /// Start the server and wait until it accepts connections.
    pub async fn start(options: ServerOptions) -> Result<Self, BrokerError> {
        Self::start_with_timeout(options, READY_TIMEOUT).await
    }

    pub async fn start_with_timeout(
        options: ServerOptions,
        ready_timeout: Duration,
    ) -> Result<Self, BrokerError> {
        let core = Arc::new(ServerCore::new(options));
        let (ready_tx, ready_rx) = oneshot::channel();

        if core.options.dont_listen {
            let _ = ready_tx.send(Ok(None));
        } else {
            let addr = format_bind_addr(&core.options.host, core.options.port);
            let listener_core = core.clone();
            core.tasks.spawn(async move {
                match TcpListener::bind(&addr).await {
                    Ok(listener) => {
                        let local = listener.local_addr();
                        let ready = local.map(Some).map_err(|source| BrokerError::Bind {
                            addr: addr.clone(),
                            source,
                        });
                        let ok = ready.is_ok();
                        if ready_tx.send(ready).is_ok() && ok {
                            protocol::accept_loop(listener_core, listener).await;
                        }
                    }
                    Err(source) => {
                        let _ = ready_tx.send(Err(BrokerError::Bind { addr, source }));
                    }
                }
            });
        }

        let listen_addr = match tokio::time::timeout(ready_timeout, ready_rx).await {
            Ok(Ok(Ok(addr))) => addr,
            Ok(Ok(Err(e))) => {
                core.cancel.cancel();
                return Err(e);
            }
            Ok(Err(_)) | Err(_) => {
                core.cancel.cancel();
                return Err(BrokerError::StartupTimeout(ready_timeout));
            }
        };

        tracing::info!(
            server_name = %core.options.server_name,
            domain = %core.options.stream_domain,
            private = core.options.dont_listen,
            listen = ?listen_addr,
            "embedded broker ready"
        );
        Ok(Self { core, listen_addr })
    }

    pub fn options(&self) -> &ServerOptions {
        &self.core.options
    }

    pub fn server_id(&self) -> &str {
        &self.core.server_id
    }

    /// Actual listen address; `None` for a private server.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    /// URL a network client can dial, if the server listens.
    pub fn client_url(&self) -> Option<String> {
        self.listen_addr.map(|addr| format!("nats://{addr}"))
    }

    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    pub fn subscription_count(&self) -> usize {
        self.core.subscription_count()
    }

    pub(crate) fn core(&self) -> &Arc<ServerCore> {
        &self.core
    }

    /// Stop accepting connections, drop all subscriptions and wait for
    /// connection tasks to finish. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.core.cancel.is_cancelled() && self.core.tasks.is_closed() {
            self.core.tasks.wait().await;
            return;
        }
        self.core.cancel.cancel();
        self.core.clear();
        self.core.tasks.close();
        self.core.tasks.wait().await;
        tracing::info!(server_name = %self.core.options.server_name, "embedded broker stopped");
    }
}

fn format_bind_addr(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
