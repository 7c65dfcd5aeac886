use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use surkit::{HttpHandler, Module, ModuleCtx, MsgHandler, SharedPublisher};
use tracing::{debug, info};

use crate::api::{events, rest};
use crate::config::BridgeConfig;
use crate::domain::service::BridgeService;

pub const MODULE_NAME: &str = "bridge";

/// Exposes `POST /{topic}` and relays each call to the broker as a
/// request/reply exchange.
#[derive(Default)]
pub struct RestBridgeModule {
    config: ArcSwapOption<BridgeConfig>,
}

impl RestBridgeModule {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_config(&self) -> Arc<BridgeConfig> {
        self.config.load_full().unwrap_or_default()
    }
}

#[async_trait]
impl Module for RestBridgeModule {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        info!("Initializing bridge module");

        let cfg: BridgeConfig = ctx.config()?;
        cfg.validate()?;
        debug!(
            "Loaded bridge config: request_timeout_sec={}, max_body_bytes={}",
            cfg.request_timeout_sec, cfg.max_body_bytes
        );

        self.config.store(Some(Arc::new(cfg)));
        Ok(())
    }

    fn http_handlers(&self, publisher: SharedPublisher) -> Vec<HttpHandler> {
        let service = Arc::new(BridgeService::new(publisher, &self.current_config()));
        rest::routes::http_handlers(service)
    }

    fn msg_handlers(&self, _publisher: SharedPublisher) -> Vec<MsgHandler> {
        events::msg_handlers()
    }
}
