use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::Method;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use surkit::broker::Message;
use surkit::{
    AppHost, HostError, HostStatus, HttpHandler, Module, ModuleCtx, MsgHandler, SharedPublisher,
    ShutdownCoordinator, ShutdownOptions, ShutdownOutcome,
};
use surkit_bootstrap::AppConfig;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.server.port = 0;
    config.server.shutdown_timeout_sec = 5;
    config.broker.private = true;
    config.logging = None;
    config
}

/// Echoes HTTP bodies, forwards `events.*` messages to a channel and keeps
/// the publisher it was handed.
struct EchoModule {
    name: &'static str,
    init_calls: Arc<AtomicUsize>,
    events: mpsc::UnboundedSender<Message>,
    publisher: Arc<Mutex<Option<SharedPublisher>>>,
}

impl EchoModule {
    fn new(name: &'static str) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                name,
                init_calls: Arc::new(AtomicUsize::new(0)),
                events: tx,
                publisher: Arc::new(Mutex::new(None)),
            },
            rx,
        )
    }
}

async fn echo(req: Request) -> Response {
    match axum::body::to_bytes(req.into_body(), 1024).await {
        Ok(body) => body.into_response(),
        Err(_) => http::StatusCode::BAD_REQUEST.into_response(),
    }
}

async fn slow(_req: Request) -> Response {
    tokio::time::sleep(Duration::from_millis(300)).await;
    "done".into_response()
}

#[async_trait::async_trait]
impl Module for EchoModule {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn init(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn http_handlers(&self, publisher: SharedPublisher) -> Vec<HttpHandler> {
        *self.publisher.lock() = Some(publisher);
        vec![
            HttpHandler::new(Method::POST, "/echo", echo),
            HttpHandler::new(Method::GET, "/slow", slow),
        ]
    }

    fn msg_handlers(&self, _publisher: SharedPublisher) -> Vec<MsgHandler> {
        let events = self.events.clone();
        vec![MsgHandler::new("events.*", move |msg: Message| {
            let events = events.clone();
            async move {
                let _ = events.send(msg);
            }
        })]
    }
}

struct BrokenModule;

#[async_trait::async_trait]
impl Module for BrokenModule {
    fn name(&self) -> &'static str {
        "broken"
    }

    async fn init(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
        anyhow::bail!("missing dependency")
    }
}

/// Claims the same route as `EchoModule`.
struct ClashingModule;

#[async_trait::async_trait]
impl Module for ClashingModule {
    fn name(&self) -> &'static str {
        "clash"
    }

    async fn init(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
        Ok(())
    }

    fn http_handlers(&self, _publisher: SharedPublisher) -> Vec<HttpHandler> {
        vec![HttpHandler::new(Method::POST, "/echo", echo)]
    }
}

#[tokio::test]
async fn start_serves_routes_and_subscriptions() {
    let host = AppHost::new(test_config());
    let (module, mut events) = EchoModule::new("echo");
    let init_calls = module.init_calls.clone();
    let publisher = module.publisher.clone();
    host.add_module(module).unwrap();

    host.start().await.unwrap();
    assert_eq!(host.status(), HostStatus::Running);
    assert_eq!(init_calls.load(Ordering::SeqCst), 1);
    assert_eq!(host.app_name(), "surserver");
    assert_eq!(host.subscriptions(), vec!["events.*".to_string()]);
    let routes = host.registered_routes();
    assert!(routes
        .iter()
        .any(|r| r.module == "echo" && r.method == Method::POST && r.path == "/echo"));

    let addr = host.local_addr().unwrap();
    let res = reqwest::Client::new()
        .post(format!("http://{addr}/echo"))
        .body("{\"hello\":1}")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert!(res.headers().contains_key("x-request-id"));
    assert_eq!(res.text().await.unwrap(), "{\"hello\":1}");

    let publisher = publisher.lock().clone().unwrap();
    publisher
        .publish("events.signup", Bytes::from_static(b"{\"id\":1}"))
        .await
        .unwrap();
    let msg = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.subject, "events.signup");

    host.stop().await.unwrap();
    assert_eq!(host.status(), HostStatus::Stopped);
    assert!(host.local_addr().is_none());

    // The listener is gone.
    let err = reqwest::Client::new()
        .post(format!("http://{addr}/echo"))
        .body("{}")
        .send()
        .await;
    assert!(err.is_err());

    // Repeated stop is a no-op.
    host.stop().await.unwrap();
}

#[tokio::test]
async fn failing_init_aborts_start() {
    let host = AppHost::new(test_config());
    let (module, _events) = EchoModule::new("echo");
    host.add_module(module).unwrap();
    host.add_module(BrokenModule).unwrap();

    let err = host.start().await.unwrap_err();
    match err {
        HostError::ModuleInit { module, source } => {
            assert_eq!(module, "broken");
            assert!(source.to_string().contains("missing dependency"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(host.status(), HostStatus::Stopped);
    assert!(host.local_addr().is_none());
    host.stop().await.unwrap();
}

#[tokio::test]
async fn duplicate_routes_abort_start() {
    let host = AppHost::new(test_config());
    let (module, _events) = EchoModule::new("echo");
    host.add_module(module).unwrap();
    host.add_module(ClashingModule).unwrap();

    let err = host.start().await.unwrap_err();
    assert!(
        matches!(err, HostError::DuplicateRoute { first: "echo", second: "clash", .. }),
        "{err:?}"
    );
    assert_eq!(host.status(), HostStatus::Stopped);
}

#[tokio::test]
async fn malformed_broker_address_is_a_config_error() {
    let mut config = test_config();
    config.broker.address = "not-a-url".to_string();
    let host = AppHost::new(config);

    let err = host.start().await.unwrap_err();
    assert!(matches!(err, HostError::Config(_)), "{err:?}");
}

#[tokio::test]
async fn registration_is_closed_after_start() {
    let host = AppHost::new(test_config());
    let (first, _e1) = EchoModule::new("echo");
    host.add_module(first).unwrap();

    let (dup, _e2) = EchoModule::new("echo");
    assert!(matches!(
        host.add_module(dup).unwrap_err(),
        HostError::Registry(_)
    ));

    host.start().await.unwrap();
    let (late, _e3) = EchoModule::new("late");
    assert!(matches!(
        host.add_module(late).unwrap_err(),
        HostError::InvalidState(HostStatus::Running)
    ));
    assert!(matches!(
        host.start().await.unwrap_err(),
        HostError::InvalidState(HostStatus::Running)
    ));
    host.stop().await.unwrap();
}

#[tokio::test]
async fn stop_without_start_is_harmless() {
    let host = AppHost::new(test_config());
    host.stop().await.unwrap();
    assert_eq!(host.status(), HostStatus::Stopped);
    host.stop().await.unwrap();
}

#[tokio::test]
async fn concurrent_stops_both_succeed() {
    let host = Arc::new(AppHost::new(test_config()));
    let (module, _events) = EchoModule::new("echo");
    host.add_module(module).unwrap();
    host.start().await.unwrap();

    let (a, b) = tokio::join!(host.stop(), host.stop());
    a.unwrap();
    b.unwrap();
    assert_eq!(host.status(), HostStatus::Stopped);
}

#[tokio::test]
async fn in_flight_request_completes_during_stop() {
    let host = Arc::new(AppHost::new(test_config()));
    let (module, _events) = EchoModule::new("echo");
    host.add_module(module).unwrap();
    host.start().await.unwrap();
    let addr = host.local_addr().unwrap();

    let request = tokio::spawn(async move {
        reqwest::Client::new()
            .get(format!("http://{addr}/slow"))
            .send()
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    host.stop().await.unwrap();
    let res = request.await.unwrap().unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "done");
}

#[tokio::test]
async fn coordinator_stops_once_on_token() {
    let host = Arc::new(AppHost::new(test_config()));
    let (module, _events) = EchoModule::new("echo");
    host.add_module(module).unwrap();
    host.start().await.unwrap();

    let coordinator = ShutdownCoordinator::new(host.clone());
    let token = CancellationToken::new();
    let run = {
        let coordinator = coordinator.clone();
        let token = token.clone();
        tokio::spawn(async move { coordinator.run(ShutdownOptions::Token(token)).await })
    };

    token.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, ShutdownOutcome::Clean));
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(host.status(), HostStatus::Stopped);

    // A second trigger is ignored.
    assert!(matches!(
        coordinator.shutdown().await,
        ShutdownOutcome::AlreadyInProgress
    ));
}

#[tokio::test]
async fn coordinator_honours_request_stop() {
    let host = Arc::new(AppHost::new(test_config()));
    host.start().await.unwrap();

    let coordinator = ShutdownCoordinator::new(host.clone());
    let run = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .run(ShutdownOptions::Future(Box::pin(std::future::pending::<()>())))
                .await
        })
    };

    host.request_stop();
    let outcome = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap();
    assert!(outcome.is_clean());
    assert_eq!(host.status(), HostStatus::Stopped);
}

#[tokio::test]
async fn module_receives_context_and_config() {
    struct ConfiguredModule(Arc<Mutex<Option<(String, serde_json::Value)>>>);

    #[async_trait::async_trait]
    impl Module for ConfiguredModule {
        fn name(&self) -> &'static str {
            "configured"
        }

        async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
            let raw = ctx.raw_config().cloned().unwrap_or_default();
            *self.0.lock() = Some((ctx.app_name().to_string(), raw));
            Ok(())
        }
    }

    let mut config = test_config();
    config.broker.domain = "surroundhome".to_string();
    config
        .modules
        .insert("configured".into(), serde_json::json!({"answer": 42}));
    let host = AppHost::new(config);
    let seen = Arc::new(Mutex::new(None));
    host.add_module(ConfiguredModule(seen.clone())).unwrap();

    host.start().await.unwrap();
    let (app, raw) = seen.lock().clone().unwrap();
    assert_eq!(app, "surroundhome");
    assert_eq!(raw["answer"], 42);
    host.stop().await.unwrap();
}

#[tokio::test]
async fn late_stop_waits_for_drain_to_finish() {
    let host = Arc::new(AppHost::new(test_config()));
    let (module, _events) = EchoModule::new("echo");
    host.add_module(module).unwrap();
    host.start().await.unwrap();
    let addr = host.local_addr().unwrap();

    let request = tokio::spawn(async move {
        reqwest::Client::new()
            .get(format!("http://{addr}/slow"))
            .send()
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let first = {
        let host = host.clone();
        tokio::spawn(async move { host.stop().await })
    };
    tokio::time::timeout(Duration::from_secs(2), async {
        while host.status() != HostStatus::Draining {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // The slow request is still in flight; a second stop must not report
    // success before the drain is over.
    let outcome = ShutdownCoordinator::new(host.clone()).shutdown().await;
    assert!(outcome.is_clean());
    assert_eq!(host.status(), HostStatus::Stopped);

    first.await.unwrap().unwrap();
    let res = request.await.unwrap().unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "done");
}
