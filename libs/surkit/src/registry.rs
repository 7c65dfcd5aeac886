use std::sync::Arc;

use thiserror::Error;

use crate::contracts::Module;

#[derive(Clone)]
pub struct ModuleEntry {
    pub name: &'static str,
    pub module: Arc<dyn Module>,
}

impl std::fmt::Debug for ModuleEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleEntry")
            .field("name", &self.name)
            .finish()
    }
}

/// Modules in registration order. Names are unique.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: Vec<ModuleEntry>,
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.names())
            .finish()
    }
}

impl ModuleRegistry {
    pub fn register(&mut self, module: Arc<dyn Module>) -> Result<(), RegistryError> {
        let name = module.name();
        if name.trim().is_empty() {
            return Err(RegistryError::InvalidName(name.to_string()));
        }
        if self.modules.iter().any(|e| e.name == name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        self.modules.push(ModuleEntry { name, module });
        Ok(())
    }

    pub fn modules(&self) -> &[ModuleEntry] {
        &self.modules
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.modules.iter().map(|e| e.name).collect()
    }

    pub fn get_module(&self, name: &str) -> Option<Arc<dyn Module>> {
        self.modules
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.module.clone())
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("module '{0}' is already registered")]
    Duplicate(String),
    #[error("invalid module name '{0}'")]
    InvalidName(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ModuleCtx;

    struct DummyCore(&'static str);

    #[async_trait::async_trait]
    impl Module for DummyCore {
        fn name(&self) -> &'static str {
            self.0
        }

        async fn init(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn keeps_registration_order() {
        let mut reg = ModuleRegistry::default();
        for name in ["bridge", "alpha", "zeta"] {
            reg.register(Arc::new(DummyCore(name))).unwrap();
        }
        assert_eq!(reg.names(), vec!["bridge", "alpha", "zeta"]);
        assert_eq!(reg.len(), 3);
        assert!(reg.get_module("alpha").is_some());
        assert!(reg.get_module("missing").is_none());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut reg = ModuleRegistry::default();
        reg.register(Arc::new(DummyCore("bridge"))).unwrap();
        let err = reg.register(Arc::new(DummyCore("bridge"))).unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(name) if name == "bridge"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn blank_names_are_rejected() {
        let mut reg = ModuleRegistry::default();
        let err = reg.register(Arc::new(DummyCore(" "))).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidName(_)));
        assert!(reg.is_empty());
    }
}
