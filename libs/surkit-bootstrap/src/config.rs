use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::{Host, Url};

/// Environment prefix for layered overrides, e.g. `SURSERVER__BROKER__PRIVATE=false`.
pub const ENV_PREFIX: &str = "SURSERVER__";

/// Configuration file the binary reads when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "config/surserver.yaml";

/// Name used for the broker server/client when `broker.domain` is empty.
pub const DEFAULT_APP_NAME: &str = "surserver";

/// Errors produced while loading or interpreting configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {}", path.display())]
    Missing { path: PathBuf },
    #[error("failed to parse configuration")]
    Parse {
        #[source]
        source: Box<figment::Error>,
    },
    #[error("invalid broker address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("missing configuration section for module '{module}'")]
    MissingSection { module: String },
    #[error("invalid configuration for module '{module}'")]
    Module {
        module: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize configuration to YAML")]
    Serialize(#[from] serde_yaml::Error),
}

/// Main application configuration with strongly-typed global sections
/// and a flexible per-module configuration bag.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// HTTP listener configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Message broker configuration.
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Logging configuration (optional, uses defaults if None).
    pub logging: Option<LoggingConfig>,
    /// Per-module configuration bag: module_name → arbitrary JSON/YAML value.
    #[serde(default)]
    pub modules: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Upper bound for each shutdown step (HTTP drain, handler drain).
    #[serde(default = "default_shutdown_timeout_sec")]
    pub shutdown_timeout_sec: u64,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            shutdown_timeout_sec: default_shutdown_timeout_sec(),
        }
    }
}

fn default_shutdown_timeout_sec() -> u64 {
    30
}

/// How the host obtains its broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerMode {
    /// Run the broker inside this process.
    #[default]
    Embedded,
    /// Dial an already running broker at `address`.
    External,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerConfig {
    /// Broker URL, `scheme://host:port`.
    pub address: String,
    /// Embedded broker opens no network listener; clients attach in-process.
    #[serde(default)]
    pub private: bool,
    /// Broker domain / application name. Empty means [`DEFAULT_APP_NAME`].
    #[serde(default)]
    pub domain: String,
    /// Verbose broker-side logging of connections and subscriptions.
    #[serde(default)]
    pub logging: bool,
    #[serde(default)]
    pub mode: BrokerMode,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: "nats://127.0.0.1:4222".to_string(),
            private: true,
            domain: String::new(),
            logging: false,
            mode: BrokerMode::Embedded,
        }
    }
}

impl BrokerConfig {
    /// Application name used to label the broker server, its domain and the client.
    pub fn app_name(&self) -> &str {
        let domain = self.domain.trim();
        if domain.is_empty() {
            DEFAULT_APP_NAME
        } else {
            domain
        }
    }

    /// Split `address` into a bindable host and port.
    ///
    /// Only well-formed `scheme://host:port` strings are accepted; the port must be explicit.
    pub fn host_port(&self) -> Result<(String, u16), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidAddress {
            address: self.address.clone(),
            reason: reason.to_string(),
        };

        if !self.address.contains("://") {
            return Err(invalid("expected scheme://host:port"));
        }
        let url = Url::parse(&self.address).map_err(|e| invalid(&e.to_string()))?;

        let host = match url.host() {
            Some(Host::Domain(d)) if !d.is_empty() => d.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            _ => return Err(invalid("missing host")),
        };
        let port = url.port().ok_or_else(|| invalid("missing port"))?;

        if !matches!(url.path(), "" | "/") || url.query().is_some() {
            return Err(invalid("unexpected path or query"));
        }

        Ok((host, port))
    }
}

/// Logging configuration - maps subsystem names to their logging settings.
/// Key "default" is the catch-all for logs that don't match explicit subsystems.
pub type LoggingConfig = HashMap<String, Section>;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Section {
    pub console_level: String, // "info", "debug", "error", "off"
    #[serde(default)]
    pub file: String, // "logs/surserver.log"
    #[serde(default)]
    pub file_level: String,
    #[serde(default)]
    pub max_age_days: Option<u32>,
    #[serde(default)]
    pub max_backups: Option<usize>,
    #[serde(default)]
    pub max_size_mb: Option<u64>,
}

/// Create a default logging configuration.
pub fn default_logging_config() -> LoggingConfig {
    let mut logging = HashMap::new();
    logging.insert(
        "default".to_string(),
        Section {
            console_level: "info".to_string(),
            file: "logs/surserver.log".to_string(),
            file_level: "debug".to_string(),
            max_age_days: Some(7),
            max_backups: Some(3),
            max_size_mb: Some(100),
        },
    );
    logging
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            broker: BrokerConfig::default(),
            logging: Some(default_logging_config()),
            modules: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration with layered loading: defaults → YAML file → environment variables.
    pub fn load_layered<P: AsRef<Path>>(config_path: P) -> Result<Self, ConfigError> {
        use figment::{
            providers::{Env, Format, Serialized, Yaml},
            Figment,
        };

        let path = config_path.as_ref();
        // Figment silently skips missing files; a missing file is an error here.
        if !path.is_file() {
            return Err(ConfigError::Missing {
                path: path.to_path_buf(),
            });
        }

        // Optional sections stay None unless YAML/ENV provide them.
        let base = AppConfig {
            logging: None,
            ..AppConfig::default()
        };

        Figment::new()
            .merge(Serialized::defaults(base))
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::Parse {
                source: Box::new(e),
            })
    }

    /// Load configuration from file or fall back to defaults.
    pub fn load_or_default<P: AsRef<Path>>(config_path: Option<P>) -> Result<Self, ConfigError> {
        match config_path {
            Some(path) => Self::load_layered(path),
            None => Ok(Self::default()),
        }
    }

    /// Check the parts of the configuration that are only interpreted at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.host_port()?;
        Ok(())
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Apply overrides from command line arguments.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(port) = args.port {
            self.server.port = port;
        }

        let logging = self.logging.get_or_insert_with(default_logging_config);
        if let Some(default_section) = logging.get_mut("default") {
            default_section.console_level = match args.verbose {
                0 => default_section.console_level.clone(),
                1 => "debug".to_string(),
                _ => "trace".to_string(),
            };
        }
    }
}

/// Command line arguments structure.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub port: Option<u16>,
    pub verbose: u8,
}
