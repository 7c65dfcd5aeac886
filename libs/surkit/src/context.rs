use serde::de::DeserializeOwned;
use std::sync::Arc;
use surkit_bootstrap::{ConfigError, ConfigProvider};
use tokio_util::sync::CancellationToken;

/// Per-module view of the runtime handed to `Module::init`.
#[derive(Clone)]
pub struct ModuleCtx {
    module: &'static str,
    app_name: Arc<str>,
    raw_config: Option<serde_json::Value>,
    cancel: CancellationToken,
}

impl ModuleCtx {
    pub fn new(
        module: &'static str,
        app_name: impl Into<Arc<str>>,
        raw_config: Option<serde_json::Value>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            module,
            app_name: app_name.into(),
            raw_config: raw_config.filter(|v| !v.is_null()),
            cancel,
        }
    }

    pub fn module_name(&self) -> &'static str {
        self.module
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn raw_config(&self) -> Option<&serde_json::Value> {
        self.raw_config.as_ref()
    }

    /// Typed module configuration; an absent section yields `T::default()`.
    pub fn config<T: DeserializeOwned + Default>(&self) -> Result<T, ConfigError> {
        match &self.raw_config {
            None => Ok(T::default()),
            Some(_) => self.config_required(),
        }
    }

    /// Typed module configuration that must be present.
    pub fn config_required<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        let raw = self
            .raw_config
            .clone()
            .ok_or_else(|| ConfigError::MissingSection {
                module: self.module.to_string(),
            })?;
        serde_json::from_value(raw).map_err(|source| ConfigError::Module {
            module: self.module.to_string(),
            source,
        })
    }

    /// Cancelled once the host begins stopping.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Produces scoped `ModuleCtx` values from the shared configuration.
#[derive(Clone)]
pub struct ModuleContextBuilder {
    provider: Arc<dyn ConfigProvider>,
    app_name: Arc<str>,
    cancel: CancellationToken,
}

impl ModuleContextBuilder {
    pub fn new(
        provider: Arc<dyn ConfigProvider>,
        app_name: impl Into<Arc<str>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            provider,
            app_name: app_name.into(),
            cancel,
        }
    }

    pub fn for_module(&self, module: &'static str) -> ModuleCtx {
        ModuleCtx::new(
            module,
            self.app_name.clone(),
            self.provider.get_module_config(module).cloned(),
            self.cancel.child_token(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use surkit_bootstrap::{AppConfig, AppConfigProvider};

    #[derive(Debug, Default, Deserialize, PartialEq)]
    #[serde(deny_unknown_fields)]
    struct Settings {
        #[serde(default)]
        retries: u32,
    }

    fn builder(modules: serde_json::Value) -> ModuleContextBuilder {
        let mut config = AppConfig::default();
        config.modules = serde_json::from_value(modules).unwrap();
        ModuleContextBuilder::new(
            Arc::new(AppConfigProvider::new(config)),
            "surserver",
            CancellationToken::new(),
        )
    }

    #[test]
    fn typed_config_from_section() {
        let ctx = builder(serde_json::json!({"demo": {"retries": 3}})).for_module("demo");
        assert_eq!(ctx.module_name(), "demo");
        assert_eq!(ctx.app_name(), "surserver");
        assert_eq!(ctx.config::<Settings>().unwrap(), Settings { retries: 3 });
    }

    #[test]
    fn missing_or_null_section_uses_defaults() {
        let b = builder(serde_json::json!({"demo": null}));
        assert_eq!(b.for_module("demo").config::<Settings>().unwrap(), Settings::default());
        assert_eq!(b.for_module("other").config::<Settings>().unwrap(), Settings::default());

        let err = b.for_module("other").config_required::<Settings>().unwrap_err();
        assert!(matches!(err, ConfigError::MissingSection { module } if module == "other"));
    }

    #[test]
    fn malformed_section_names_the_module() {
        let ctx = builder(serde_json::json!({"demo": {"retries": "many"}})).for_module("demo");
        let err = ctx.config::<Settings>().unwrap_err();
        assert!(matches!(err, ConfigError::Module { module, .. } if module == "demo"));
    }

    #[test]
    fn child_tokens_follow_parent() {
        let parent = CancellationToken::new();
        let b = ModuleContextBuilder::new(
            Arc::new(AppConfigProvider::new(AppConfig::default())),
            "app",
            parent.clone(),
        );
        let ctx = b.for_module("demo");
        assert!(!ctx.cancellation_token().is_cancelled());
        parent.cancel();
        assert!(ctx.cancellation_token().is_cancelled());
    }
}
