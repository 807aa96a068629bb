//! ResourceRegistry - model 名 → ResourceProvider
//!
//! # 使用例
//! ```ignore
//! let mut registry = ResourceRegistry::new();
//! registry.register(ImportProvider::new())?;
//!
//! let payload = registry.load(&ResourceRef::new("sale.import", 7));
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::ResourceRef;
use crate::ports::{ResourceProvider, Runnable};

/// RegistryError は ResourceRegistry の操作エラー
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Provider for model '{0}' is already registered")]
    AlreadyRegistered(String),
}

#[derive(Default, Clone)]
pub struct ResourceRegistry {
    providers: HashMap<String, Arc<dyn ResourceProvider>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: ResourceProvider + 'static>(
        &mut self,
        provider: P,
    ) -> Result<(), RegistryError> {
        self.register_arc(Arc::new(provider))
    }

    pub fn register_arc(&mut self, provider: Arc<dyn ResourceProvider>) -> Result<(), RegistryError> {
        let model = provider.model().to_string();
        if self.providers.contains_key(&model) {
            return Err(RegistryError::AlreadyRegistered(model));
        }
        self.providers.insert(model, provider);
        Ok(())
    }

    pub fn get(&self, model: &str) -> Option<Arc<dyn ResourceProvider>> {
        self.providers.get(model).cloned()
    }

    /// Payload behind a resource reference.
    pub fn load(&self, resource: &ResourceRef) -> Option<Arc<dyn Runnable>> {
        self.providers.get(&resource.model)?.load(resource.id)
    }

    /// Display label behind a resource reference; `None` when the model or
    /// record is unknown.
    pub fn display_name(&self, resource: &ResourceRef) -> Option<String> {
        self.providers.get(&resource.model)?.display_name(resource.id)
    }

    pub fn registered_models(&self) -> Vec<String> {
        let mut models: Vec<String> = self.providers.keys().cloned().collect();
        models.sort();
        models
    }
}
