//! # SurKit - module host for broker-backed services
//!
//! A host owns an embedded (or external) subject-based message broker, an
//! HTTP listener, and a set of modules. Modules contribute HTTP routes and
//! message subscriptions; both receive a [`broker::Publisher`] so HTTP
//! traffic can be forwarded to the broker as request/reply.
//!
//! ```rust,ignore
//! let host = Arc::new(AppHost::new(config));
//! host.add_module(MyModule::default())?;
//! host.start().await?;
//! let outcome = ShutdownCoordinator::new(host).run(ShutdownOptions::Signals).await;
//! ```

pub use anyhow::Result;
pub use async_trait::async_trait;

pub mod broker;
pub mod context;
pub mod contracts;
pub mod registry;
pub mod runtime;

pub use broker::{BrokerError, Message, Publisher, SharedPublisher};
pub use context::{ModuleContextBuilder, ModuleCtx};
pub use contracts::{HttpHandler, Module, MsgHandler};
pub use registry::{ModuleRegistry, RegistryError};
pub use runtime::{
    AppHost, HostError, HostStatus, RouteInfo, RouterBuilder, ShutdownCoordinator,
    ShutdownOptions, ShutdownOutcome,
};
