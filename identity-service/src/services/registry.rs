use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{IdentityProvider, ProviderConfigError};
use crate::store::{IdentityProviderStore, IdentityStore, StoreError};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    InvalidConfiguration(#[from] ProviderConfigError),
}

/// Read-mostly cache of parsed identity provider configurations.
///
/// Configuration blobs are parsed once per load; entries expire after the
/// TTL so administrative edits are picked up without a restart.
#[derive(Clone)]
pub struct ProviderRegistry {
    store: Arc<dyn IdentityStore>,
    cache: Arc<DashMap<Uuid, (Instant, Arc<IdentityProvider>)>>,
    ttl: Duration,
}

impl ProviderRegistry {
    pub fn new(store: Arc<dyn IdentityStore>, ttl: Duration) -> Self {
        Self {
            store,
            cache: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Arc<IdentityProvider>>, RegistryError> {
        if let Some(entry) = self.cache.get(&id) {
            let (loaded_at, provider) = entry.value();
            if loaded_at.elapsed() < self.ttl {
                return Ok(Some(Arc::clone(provider)));
            }
        }

        let Some(record) = self.store.find_identity_provider(id).await? else {
            self.cache.remove(&id);
            return Ok(None);
        };

        let provider = match IdentityProvider::from_record(&record) {
            Ok(provider) => Arc::new(provider),
            Err(e) => {
                tracing::error!(idp_id = %id, error = %e, "Identity provider configuration is invalid");
                self.cache.remove(&id);
                return Err(e.into());
            }
        };

        self.cache
            .insert(id, (Instant::now(), Arc::clone(&provider)));
        Ok(Some(provider))
    }

    pub fn invalidate(&self, id: Uuid) {
        self.cache.remove(&id);
    }
}
