use crate::broker::BrokerError;
use crate::registry::RegistryError;
use crate::runtime::HostStatus;
use http::Method;
use std::sync::Arc;
use std::time::Duration;
use surkit_bootstrap::ConfigError;
use thiserror::Error;

/// Errors surfaced by the application host.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("invalid configuration")]
    Config(#[from] ConfigError),

    #[error("broker startup failed")]
    BrokerStart(#[source] BrokerError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("initialization failed for module '{module}'")]
    ModuleInit {
        module: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("module '{module}' failed to subscribe to '{subject}'")]
    Subscribe {
        module: &'static str,
        subject: String,
        #[source]
        source: BrokerError,
    },

    #[error("invalid route '{method} {path}' from module '{module}': {reason}")]
    InvalidRoute {
        module: &'static str,
        method: Method,
        path: String,
        reason: String,
    },

    #[error("route '{method} {path}' registered by both '{first}' and '{second}'")]
    DuplicateRoute {
        method: Method,
        path: String,
        first: &'static str,
        second: &'static str,
    },

    #[error("failed to bind HTTP listener on {addr}")]
    HttpBind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP server failed")]
    HttpServe(#[source] std::io::Error),

    #[error("{phase} did not finish within {timeout:?}")]
    ShutdownTimeout {
        phase: &'static str,
        timeout: Duration,
    },

    #[error("broker shutdown failed")]
    BrokerShutdown(#[source] BrokerError),

    /// Reported to callers that waited on a stop another caller ran.
    #[error("host stop failed: {0}")]
    StopFailed(Arc<str>),

    #[error("operation not allowed while the host is {0}")]
    InvalidState(HostStatus),
}

impl HostError {
    /// Malformed broker settings are reported as configuration errors.
    pub(crate) fn from_broker_start(err: BrokerError) -> Self {
        match err {
            BrokerError::Config(e) => HostError::Config(e),
            other => HostError::BrokerStart(other),
        }
    }
}
