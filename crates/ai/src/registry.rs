use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use paperlab_core::{OwnerId, ProviderId};

use crate::provider::AnalysisProvider;

/// Resolves an owner's provider capability (credentials, configuration).
///
/// "No key configured" is not an error: `resolve` returns `None` and the job
/// carries on with the capabilities that did resolve.
#[async_trait]
pub trait CapabilityResolver: Send + Sync + 'static {
    /// Whether `provider` names a capability this deployment knows about.
    fn is_known(&self, provider: &ProviderId) -> bool;

    async fn resolve(&self, owner: &OwnerId, provider: &ProviderId) -> Option<Arc<dyn AnalysisProvider>>;
}

/// Builds a provider capability for an owner, or `None` when the owner has
/// nothing configured for it.
pub type ProviderFactory = Box<dyn Fn(&OwnerId) -> Option<Arc<dyn AnalysisProvider>> + Send + Sync>;

/// In-process capability set: provider id -> factory.
#[derive(Default)]
pub struct ProviderRegistry {
    factories: BTreeMap<ProviderId, ProviderFactory>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for a provider id (replaces any previous one).
    pub fn register<F>(&mut self, provider: ProviderId, factory: F)
    where
        F: Fn(&OwnerId) -> Option<Arc<dyn AnalysisProvider>> + Send + Sync + 'static,
    {
        self.factories.insert(provider, Box::new(factory));
    }

    /// Register a provider available to every owner.
    pub fn register_shared(&mut self, provider: Arc<dyn AnalysisProvider>) {
        let id = provider.id().clone();
        self.register(id, move |_owner| Some(provider.clone()));
    }

    /// Known provider ids, in sorted order.
    pub fn provider_ids(&self) -> Vec<ProviderId> {
        self.factories.keys().cloned().collect()
    }
}

impl core::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl CapabilityResolver for ProviderRegistry {
    fn is_known(&self, provider: &ProviderId) -> bool {
        self.factories.contains_key(provider)
    }

    async fn resolve(&self, owner: &OwnerId, provider: &ProviderId) -> Option<Arc<dyn AnalysisProvider>> {
        self.factories.get(provider).and_then(|factory| factory(owner))
    }
}
