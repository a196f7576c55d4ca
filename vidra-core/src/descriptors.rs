//! Descriptor lookup with an LRU cache in front of the remote catalog.
//!
//! Negative responses are cached too, so a work the catalog does not know
//! is not re-queried on every read. Cached-only reads fail with a distinct
//! not-cached signal rather than a generic I/O error.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use lru::LruCache;
use tracing::debug;
use vidra_model::{WorkDescriptor, WorkId};

use crate::config::DescriptorCacheConfig;
use crate::error::{PipelineError, Result};

/// Remote descriptor catalog.
#[async_trait]
pub trait QueryService: Send + Sync {
    /// Look up one work. `Ok(None)` means the catalog has no such work.
    async fn find(&self, id: &WorkId) -> Result<Option<WorkDescriptor>>;
}

/// Whether a lookup may reach past the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Serve from cache, falling back to the remote catalog on a miss.
    CacheOrRemote,
    /// Serve from cache only; a miss is a `NotCached` error.
    CachedOnly,
}

/// LRU-cached front for a [`QueryService`].
pub struct DescriptorCache {
    service: Arc<dyn QueryService>,
    cache: StdMutex<LruCache<WorkId, Option<WorkDescriptor>>>,
}

impl fmt::Debug for DescriptorCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorCache").finish()
    }
}

impl DescriptorCache {
    pub fn new(config: &DescriptorCacheConfig, service: Arc<dyn QueryService>) -> Self {
        let capacity =
            NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            service,
            cache: StdMutex::new(LruCache::new(capacity)),
        }
    }

    /// Look up a descriptor under the given cache mode.
    pub async fn find(
        &self,
        id: &WorkId,
        mode: CacheMode,
    ) -> Result<Option<WorkDescriptor>> {
        {
            let mut cache = self.cache.lock().expect("descriptor cache poisoned");
            if let Some(hit) = cache.get(id) {
                return Ok(hit.clone());
            }
        }
        match mode {
            CacheMode::CachedOnly => Err(PipelineError::NotCached(id.clone())),
            CacheMode::CacheOrRemote => {
                let response = self.service.find(id).await?;
                debug!(work = %id, found = response.is_some(), "descriptor fetched");
                self.cache
                    .lock()
                    .expect("descriptor cache poisoned")
                    .put(id.clone(), response.clone());
                Ok(response)
            }
        }
    }

    /// Drop one cached response, forcing the next read back to the catalog.
    pub fn invalidate(&self, id: &WorkId) {
        self.cache
            .lock()
            .expect("descriptor cache poisoned")
            .pop(id);
    }

    pub fn len(&self) -> usize {
        self.cache.lock().expect("descriptor cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
