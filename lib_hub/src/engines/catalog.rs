//! Selects an adapter's factory from the `adapter` field of a config blob.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::config::FeedConfig;
use super::{DistributionEngine, EngineError, EngineFactory, EngineSink};

/// # Adapter Catalog
///
/// An [`EngineFactory`] that delegates to the factory registered under the
/// config's `adapter` name. The hub is handed one catalog and never needs to
/// know which protocols exist.
#[derive(Default, Clone)]
pub struct AdapterCatalog {
    adapters: HashMap<String, Arc<dyn EngineFactory>>,
}

impl AdapterCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with every adapter compiled into this build.
    pub fn with_builtin_adapters() -> Self {
        #[allow(unused_mut)]
        let mut catalog = Self::new();
        #[cfg(feature = "mock")]
        catalog.register("mock", Arc::new(super::mock::MockFeedFactory::new()));
        catalog
    }

    pub fn register(&mut self, name: &str, factory: Arc<dyn EngineFactory>) {
        self.adapters.insert(name.to_string(), factory);
    }

    pub fn adapter_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl EngineFactory for AdapterCatalog {
    async fn create(
        &self,
        provider_id: &str,
        config: &Value,
        sink: EngineSink,
    ) -> Result<Arc<dyn DistributionEngine>, EngineError> {
        let feed = FeedConfig::from_value(config)?;
        let factory = self
            .adapters
            .get(&feed.adapter)
            .cloned()
            .ok_or_else(|| EngineError::UnknownAdapter(feed.adapter.clone()))?;
        factory.create(provider_id, config, sink).await
    }
}
