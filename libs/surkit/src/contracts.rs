use crate::broker::{Message, SharedPublisher};
use crate::context::ModuleCtx;
use async_trait::async_trait;
use axum::extract::Request;
use axum::response::Response;
use futures::future::BoxFuture;
use http::Method;
use std::future::Future;
use std::sync::Arc;

pub type HttpHandlerFn = Arc<dyn Fn(Request) -> BoxFuture<'static, Response> + Send + Sync>;
pub type MsgHandlerFn = Arc<dyn Fn(Message) -> BoxFuture<'static, ()> + Send + Sync>;

/// An HTTP route contributed by a module.
///
/// `path` uses `{name}` placeholders for path parameters, e.g. `/{topic}`.
#[derive(Clone)]
pub struct HttpHandler {
    pub method: Method,
    pub path: String,
    pub handler: HttpHandlerFn,
}

impl HttpHandler {
    pub fn new<F, Fut>(method: Method, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        Self {
            method,
            path: path.into(),
            handler: Arc::new(move |req: Request| -> BoxFuture<'static, Response> {
                Box::pin(handler(req))
            }),
        }
    }
}

impl std::fmt::Debug for HttpHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpHandler")
            .field("method", &self.method)
            .field("path", &self.path)
            .finish()
    }
}

/// A subscription contributed by a module. The handler runs once per message.
#[derive(Clone)]
pub struct MsgHandler {
    pub subject: String,
    pub handler: MsgHandlerFn,
}

impl MsgHandler {
    pub fn new<F, Fut>(subject: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            subject: subject.into(),
            handler: Arc::new(move |msg: Message| -> BoxFuture<'static, ()> {
                Box::pin(handler(msg))
            }),
        }
    }
}

impl std::fmt::Debug for MsgHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgHandler")
            .field("subject", &self.subject)
            .finish()
    }
}

/// A pluggable unit of functionality hosted by the runtime.
///
/// Lifecycle: `init` once, then the host asks for handlers, binds them, and
/// serves until stopped. Handler lists are collected after every module has
/// been initialized.
#[async_trait]
pub trait Module: Send + Sync + 'static {
    /// Unique name; also the key of the module's configuration section.
    fn name(&self) -> &'static str;

    async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()>;

    fn http_handlers(&self, _publisher: SharedPublisher) -> Vec<HttpHandler> {
        Vec::new()
    }

    fn msg_handlers(&self, _publisher: SharedPublisher) -> Vec<MsgHandler> {
        Vec::new()
    }
}
