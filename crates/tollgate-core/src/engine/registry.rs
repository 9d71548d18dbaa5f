//! BackendRegistry - 推論バックエンドの登録と管理
//!
//! Name → `Arc<dyn InferenceBackend>`. Registering a name twice is an error
//! so a misconfigured build fails at startup instead of silently replacing
//! a backend.

use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::GatewayError;
use crate::ports::InferenceBackend;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("backend '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("backend '{0}' is not registered")]
    Unknown(String),
}

impl From<RegistryError> for GatewayError {
    fn from(err: RegistryError) -> Self {
        GatewayError::Config(err.to_string())
    }
}

#[derive(Default, Clone)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn InferenceBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        backend: Arc<dyn InferenceBackend>,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if self.backends.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        self.backends.insert(name, backend);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn InferenceBackend>> {
        self.backends.get(name).cloned()
    }

    pub fn require(&self, name: &str) -> Result<Arc<dyn InferenceBackend>, RegistryError> {
        self.get(name)
            .ok_or_else(|| RegistryError::Unknown(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    /// Sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }
}
