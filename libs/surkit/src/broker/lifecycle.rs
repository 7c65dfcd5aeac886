//! Starting the embedded broker, connecting to it (or to an external one),
//! and tearing both down.

use super::server::DEFAULT_MAX_PAYLOAD;
use super::{BrokerConnection, BrokerError, EmbeddedServer, ServerOptions, SharedPublisher};
use std::sync::Arc;
use surkit_bootstrap::{BrokerConfig, BrokerMode};

/// Start an embedded broker labelled after `app_name`.
///
/// A private config opens no network listener. The address is validated
/// either way so a malformed value never reaches startup silently.
pub async fn start_embedded(
    app_name: &str,
    config: &BrokerConfig,
) -> Result<EmbeddedServer, BrokerError> {
    let (host, port) = config.host_port()?;
    let options = ServerOptions {
        server_name: format!("{app_name}-server"),
        host,
        port,
        dont_listen: config.private,
        streams_enabled: true,
        stream_domain: app_name.to_string(),
        logging: config.logging,
        max_payload: DEFAULT_MAX_PAYLOAD,
    };
    EmbeddedServer::start(options).await
}

/// Connect a client named `<app_name>-client` to an embedded broker:
/// in-process when private, otherwise through its network listener.
pub async fn connect_embedded(
    app_name: &str,
    server: &EmbeddedServer,
    config: &BrokerConfig,
) -> Result<BrokerConnection, BrokerError> {
    let name = format!("{app_name}-client");
    if config.private {
        return BrokerConnection::in_process(name, server);
    }
    let url = server.client_url().ok_or_else(|| BrokerError::Connect {
        address: config.address.clone(),
        reason: "embedded broker has no network listener".to_string(),
    })?;
    BrokerConnection::connect(name, &url).await
}

/// Dial an already running broker at `config.address`.
pub async fn connect_external(config: &BrokerConfig) -> Result<BrokerConnection, BrokerError> {
    config.host_port()?;
    let name = format!("{}-client", config.app_name());
    BrokerConnection::connect(name, &config.address).await
}

/// The broker as owned by the host: an optional embedded server plus the
/// connection modules publish through.
#[derive(Debug)]
pub struct BrokerHandle {
    mode: BrokerMode,
    server: Option<EmbeddedServer>,
    connection: BrokerConnection,
}

impl BrokerHandle {
    pub async fn open(app_name: &str, config: &BrokerConfig) -> Result<Self, BrokerError> {
        match config.mode {
            BrokerMode::Embedded => {
                let server = start_embedded(app_name, config).await?;
                match connect_embedded(app_name, &server, config).await {
                    Ok(connection) => Ok(Self {
                        mode: BrokerMode::Embedded,
                        server: Some(server),
                        connection,
                    }),
                    Err(e) => {
                        server.shutdown().await;
                        Err(e)
                    }
                }
            }
            BrokerMode::External => {
                let connection = connect_external(config).await?;
                tracing::info!(address = %config.address, "connected to external broker");
                Ok(Self {
                    mode: BrokerMode::External,
                    server: None,
                    connection,
                })
            }
        }
    }

    pub fn mode(&self) -> BrokerMode {
        self.mode
    }

    pub fn server(&self) -> Option<&EmbeddedServer> {
        self.server.as_ref()
    }

    pub fn connection(&self) -> &BrokerConnection {
        &self.connection
    }

    pub fn publisher(&self) -> SharedPublisher {
        Arc::new(self.connection.clone())
    }

    /// Drain the connection, then stop the embedded server (if any).
    /// The server is stopped even when draining fails.
    pub async fn shutdown(self) -> Result<(), BrokerError> {
        let drained = self.connection.drain().await;
        if let Err(e) = &drained {
            tracing::warn!(error = %e, "broker connection drain failed");
        }
        if let Some(server) = self.server {
            server.shutdown().await;
        }
        drained
    }
}
