//! Application host: owns the broker, the registered modules and the HTTP
//! listener, and drives them through
//! broker → init → subscriptions → routes → listen → (wait) → drain.

use crate::broker::{BrokerHandle, MessageStream};
use crate::context::ModuleContextBuilder;
use crate::contracts::{HttpHandler, Module, MsgHandler, MsgHandlerFn};
use crate::registry::{ModuleEntry, ModuleRegistry};
use crate::runtime::{HostError, RouteInfo, RouterBuilder};
use futures::StreamExt;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use surkit_bootstrap::{AppConfig, AppConfigProvider};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Lifecycle state of an [`AppHost`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStatus {
    Uninitialized,
    Starting,
    Initialized,
    Running,
    Draining,
    Stopped,
}

impl std::fmt::Display for HostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HostStatus::Uninitialized => "uninitialized",
            HostStatus::Starting => "starting",
            HostStatus::Initialized => "initialized",
            HostStatus::Running => "running",
            HostStatus::Draining => "draining",
            HostStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Everything that exists only while the host runs.
struct Running {
    broker: BrokerHandle,
    local_addr: SocketAddr,
    routes: Vec<RouteInfo>,
    subscriptions: Vec<String>,
    http_cancel: CancellationToken,
    http_task: JoinHandle<std::io::Result<()>>,
    handler_cancel: CancellationToken,
    handler_tasks: TaskTracker,
}

/// Live message subscriptions while the host is still coming up.
struct Dispatchers {
    cancel: CancellationToken,
    tasks: TaskTracker,
    subjects: Vec<String>,
}

impl Dispatchers {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            tasks: TaskTracker::new(),
            subjects: Vec::new(),
        }
    }

    /// Forward every message of `stream` to `handler`, one task per message.
    fn spawn(
        &mut self,
        module: &'static str,
        subject: String,
        mut stream: MessageStream,
        handler: MsgHandlerFn,
    ) {
        let cancel = self.cancel.clone();
        let tasks = self.tasks.clone();
        let label = subject.clone();
        self.tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = stream.next() => match next {
                        Some(msg) => {
                            let handler = handler.clone();
                            tasks.spawn(async move { handler(msg).await });
                        }
                        None => break,
                    }
                }
            }
            tracing::debug!(module, subject = %label, "subscription closed");
        });
        self.subjects.push(subject);
    }

    async fn abort(self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

/// Outcome of the one real stop, shared with callers that arrive late.
type StopResult = Result<(), Arc<str>>;

pub struct AppHost {
    config: Arc<AppConfig>,
    app_name: Arc<str>,
    registry: Mutex<ModuleRegistry>,
    status: Mutex<HostStatus>,
    running: Mutex<Option<Running>>,
    stop_result: watch::Sender<Option<StopResult>>,
    stop_app: CancellationToken,
    modules_cancel: CancellationToken,
}

impl AppHost {
    pub fn new(config: AppConfig) -> Self {
        let app_name: Arc<str> = Arc::from(config.broker.app_name());
        Self {
            config: Arc::new(config),
            app_name,
            registry: Mutex::new(ModuleRegistry::default()),
            status: Mutex::new(HostStatus::Uninitialized),
            running: Mutex::new(None),
            stop_result: watch::channel(None).0,
            stop_app: CancellationToken::new(),
            modules_cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn status(&self) -> HostStatus {
        *self.status.lock()
    }

    /// Register a module. Only allowed before `start`.
    pub fn add_module<M: Module>(&self, module: M) -> Result<(), HostError> {
        self.add_shared_module(Arc::new(module))
    }

    pub fn add_shared_module(&self, module: Arc<dyn Module>) -> Result<(), HostError> {
        let status = self.status.lock();
        if *status != HostStatus::Uninitialized {
            return Err(HostError::InvalidState(*status));
        }
        let name = module.name();
        self.registry.lock().register(module)?;
        tracing::debug!(module = name, "module registered");
        Ok(())
    }

    pub fn module_names(&self) -> Vec<&'static str> {
        self.registry.lock().names()
    }

    /// Address the HTTP listener is bound to, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    pub fn registered_routes(&self) -> Vec<RouteInfo> {
        self.running
            .lock()
            .as_ref()
            .map(|r| r.routes.clone())
            .unwrap_or_default()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.running
            .lock()
            .as_ref()
            .map(|r| r.subscriptions.clone())
            .unwrap_or_default()
    }

    /// Ask whoever waits on [`AppHost::stop_requested`] to stop the host.
    pub fn request_stop(&self) {
        self.stop_app.cancel();
    }

    /// Resolves once a stop has been requested.
    pub async fn stop_requested(&self) {
        self.stop_app.cancelled().await;
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.stop_app.clone()
    }

    fn set_status(&self, status: HostStatus) {
        *self.status.lock() = status;
    }

    /// Bring the host up. On any failure everything already started is torn
    /// down and the host ends in `Stopped`.
    pub async fn start(&self) -> Result<(), HostError> {
        {
            let mut status = self.status.lock();
            if *status != HostStatus::Uninitialized {
                return Err(HostError::InvalidState(*status));
            }
            *status = HostStatus::Starting;
        }

        match self.bring_up().await {
            Ok(running) => {
                tracing::info!(
                    app = %self.app_name,
                    addr = %running.local_addr,
                    routes = running.routes.len(),
                    subscriptions = running.subscriptions.len(),
                    "host running"
                );
                *self.running.lock() = Some(running);
                self.set_status(HostStatus::Running);
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "host startup failed");
                self.modules_cancel.cancel();
                self.set_status(HostStatus::Stopped);
                Err(e)
            }
        }
    }

    async fn bring_up(&self) -> Result<Running, HostError> {
        tracing::info!("Phase: broker");
        let broker = BrokerHandle::open(&self.app_name, &self.config.broker)
            .await
            .map_err(HostError::from_broker_start)?;

        match self.wire(&broker).await {
            Ok(parts) => Ok(parts.into_running(broker)),
            Err(e) => {
                if let Err(se) = broker.shutdown().await {
                    tracing::warn!(error = %se, "broker teardown after failed start");
                }
                Err(e)
            }
        }
    }

    async fn wire(&self, broker: &BrokerHandle) -> Result<Wired, HostError> {
        let modules: Vec<ModuleEntry> = self.registry.lock().modules().to_vec();

        tracing::info!("Phase: init");
        let ctx_builder = ModuleContextBuilder::new(
            Arc::new(AppConfigProvider::from_arc(self.config.clone())),
            self.app_name.clone(),
            self.modules_cancel.clone(),
        );
        for entry in &modules {
            let ctx = ctx_builder.for_module(entry.name);
            entry
                .module
                .init(&ctx)
                .await
                .map_err(|source| HostError::ModuleInit {
                    module: entry.name,
                    source,
                })?;
            tracing::debug!(module = entry.name, "module initialized");
        }
        self.set_status(HostStatus::Initialized);

        let publisher = broker.publisher();
        let bindings: Vec<(&'static str, Vec<HttpHandler>, Vec<MsgHandler>)> = modules
            .iter()
            .map(|e| {
                (
                    e.name,
                    e.module.http_handlers(publisher.clone()),
                    e.module.msg_handlers(publisher.clone()),
                )
            })
            .collect();

        tracing::info!("Phase: subscriptions");
        let mut dispatchers = Dispatchers::new(CancellationToken::new());
        for (module, _, msg_handlers) in &bindings {
            let module: &'static str = module;
            for binding in msg_handlers {
                match broker.connection().subscribe(&binding.subject).await {
                    Ok(stream) => {
                        tracing::info!(module, subject = %binding.subject, "subscribed");
                        dispatchers.spawn(
                            module,
                            binding.subject.clone(),
                            stream,
                            binding.handler.clone(),
                        );
                    }
                    Err(source) => {
                        dispatchers.abort().await;
                        return Err(HostError::Subscribe {
                            module,
                            subject: binding.subject.clone(),
                            source,
                        });
                    }
                }
            }
        }

        tracing::info!("Phase: routes");
        let mut router = RouterBuilder::new();
        for (module, http_handlers, _) in bindings {
            for binding in http_handlers {
                if let Err(e) = router.add(module, binding) {
                    dispatchers.abort().await;
                    return Err(e);
                }
            }
        }
        let (router, routes) = router.build();

        tracing::info!("Phase: listen");
        let addr = self.config.server.bind_addr();
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(source) => {
                dispatchers.abort().await;
                return Err(HostError::HttpBind { addr, source });
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(a) => a,
            Err(source) => {
                dispatchers.abort().await;
                return Err(HostError::HttpBind { addr, source });
            }
        };
        tracing::info!(%local_addr, "HTTP server bound");

        let http_cancel = CancellationToken::new();
        let shutdown = {
            let cancel = http_cancel.clone();
            async move {
                cancel.cancelled().await;
                tracing::info!("HTTP server shutting down gracefully");
            }
        };
        let http_task = tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown)
            .await
        });

        Ok(Wired {
            local_addr,
            routes,
            dispatchers,
            http_cancel,
            http_task,
        })
    }

    /// Stop the host: HTTP first, then message handlers, then the broker.
    ///
    /// Safe to call repeatedly and concurrently; only the first caller does
    /// the work, later callers wait for it and get the same outcome. A host
    /// that never started stops trivially.
    pub async fn stop(&self) -> Result<(), HostError> {
        let follower = {
            let mut status = self.status.lock();
            match *status {
                HostStatus::Uninitialized => {
                    *status = HostStatus::Stopped;
                    return Ok(());
                }
                HostStatus::Running => {
                    *status = HostStatus::Draining;
                    None
                }
                HostStatus::Draining => Some(self.stop_result.subscribe()),
                HostStatus::Stopped => return self.recorded_stop(),
                HostStatus::Starting | HostStatus::Initialized => {
                    return Err(HostError::InvalidState(*status));
                }
            }
        };
        if let Some(mut done) = follower {
            tracing::debug!("stop already in progress; waiting for it to finish");
            // The sender lives in `self`, so this only returns once a result is recorded.
            let _ = done.wait_for(Option::is_some).await;
            return self.recorded_stop();
        }

        tracing::info!(app = %self.app_name, "Phase: drain");
        self.stop_app.cancel();
        self.modules_cancel.cancel();

        let running = self.running.lock().take();
        let result = match running {
            Some(running) => self.tear_down(running).await,
            None => Ok(()),
        };
        self.stop_result.send_replace(Some(
            result
                .as_ref()
                .map(|_| ())
                .map_err(|e| Arc::from(e.to_string())),
        ));
        self.set_status(HostStatus::Stopped);
        match &result {
            Ok(()) => tracing::info!("host stopped"),
            Err(e) => tracing::error!(error = %e, "host stopped with errors"),
        }
        result
    }

    fn recorded_stop(&self) -> Result<(), HostError> {
        match &*self.stop_result.borrow() {
            Some(Err(reason)) => Err(HostError::StopFailed(reason.clone())),
            _ => Ok(()),
        }
    }

    async fn tear_down(&self, running: Running) -> Result<(), HostError> {
        let timeout = Duration::from_secs(self.config.server.shutdown_timeout_sec);
        let mut first_err: Option<HostError> = None;
        let mut record = |e: HostError| {
            tracing::error!(error = %e, "shutdown step failed");
            first_err.get_or_insert(e);
        };

        let Running {
            broker,
            http_cancel,
            mut http_task,
            handler_cancel,
            handler_tasks,
            ..
        } = running;

        http_cancel.cancel();
        match tokio::time::timeout(timeout, &mut http_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => record(HostError::HttpServe(e)),
            Ok(Err(join)) => record(HostError::HttpServe(std::io::Error::other(join))),
            Err(_) => {
                http_task.abort();
                record(HostError::ShutdownTimeout {
                    phase: "HTTP drain",
                    timeout,
                });
            }
        }

        handler_cancel.cancel();
        handler_tasks.close();
        if tokio::time::timeout(timeout, handler_tasks.wait())
            .await
            .is_err()
        {
            record(HostError::ShutdownTimeout {
                phase: "message handler drain",
                timeout,
            });
        }

        if let Err(e) = broker.shutdown().await {
            record(HostError::BrokerShutdown(e));
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Output of a successful wiring pass, before the broker is attached.
struct Wired {
    local_addr: SocketAddr,
    routes: Vec<RouteInfo>,
    dispatchers: Dispatchers,
    http_cancel: CancellationToken,
    http_task: JoinHandle<std::io::Result<()>>,
}

impl Wired {
    fn into_running(self, broker: BrokerHandle) -> Running {
        Running {
            broker,
            local_addr: self.local_addr,
            routes: self.routes,
            subscriptions: self.dispatchers.subjects,
            http_cancel: self.http_cancel,
            http_task: self.http_task,
            handler_cancel: self.dispatchers.cancel,
            handler_tasks: self.dispatchers.tasks,
        }
    }
}
