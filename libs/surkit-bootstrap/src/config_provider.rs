use crate::config::AppConfig;
use std::sync::Arc;

/// Read-only view of the loaded configuration handed to modules.
pub trait ConfigProvider: Send + Sync {
    /// Raw configuration section of a module, keyed by module name.
    fn get_module_config(&self, module_name: &str) -> Option<&serde_json::Value>;

    /// A global section ("server", "broker", "logging") as JSON.
    fn get_config_raw(&self, key: &str) -> Option<serde_json::Value>;
}

/// `ConfigProvider` backed by an [`AppConfig`].
#[derive(Clone)]
pub struct AppConfigProvider(Arc<AppConfig>);

impl AppConfigProvider {
    pub fn new(config: AppConfig) -> Self {
        Self(Arc::new(config))
    }

    pub fn from_arc(config: Arc<AppConfig>) -> Self {
        Self(config)
    }

    pub fn inner(&self) -> &AppConfig {
        &self.0
    }
}

impl ConfigProvider for AppConfigProvider {
    fn get_module_config(&self, module_name: &str) -> Option<&serde_json::Value> {
        self.0.modules.get(module_name)
    }

    fn get_config_raw(&self, key: &str) -> Option<serde_json::Value> {
        match key {
            "server" => serde_json::to_value(&self.0.server).ok(),
            "broker" => serde_json::to_value(&self.0.broker).ok(),
            "logging" => self
                .0
                .logging
                .as_ref()
                .and_then(|v| serde_json::to_value(v).ok()),
            _ => None,
        }
    }
}
