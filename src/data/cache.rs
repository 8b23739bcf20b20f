//! In-memory actor cache
//!
//! Volatile, cleared on restart. Keyed by `name@instance`.

use moka::future::Cache;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::federation::Actor;
use crate::metrics::{CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL};

const CACHE_NAME: &str = "actor";

/// Remote actor documents, keyed by `name@instance`
///
/// Concurrent lookups for the same key share a single resolution.
/// Failed resolutions and actors without an id are never stored.
pub struct ActorCache {
    actors: Cache<String, Arc<Actor>>,
}

impl ActorCache {
    /// Create new actor cache
    ///
    /// # Arguments
    /// * `max_capacity` - Maximum number of actors kept
    pub fn new(max_capacity: u64) -> Self {
        let actors = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(Duration::from_secs(3600 * 24)) // 1 day TTL
            .build();

        Self { actors }
    }

    pub async fn get(&self, key: &str) -> Option<Arc<Actor>> {
        let result = self.actors.get(key).await;

        if result.is_some() {
            CACHE_HITS_TOTAL.with_label_values(&[CACHE_NAME]).inc();
        } else {
            CACHE_MISSES_TOTAL.with_label_values(&[CACHE_NAME]).inc();
        }

        result
    }

    pub async fn put(&self, key: impl Into<String>, actor: Actor) {
        if actor.id.is_empty() {
            return;
        }
        self.actors.insert(key.into(), Arc::new(actor)).await;
    }

    pub async fn invalidate(&self, key: &str) {
        self.actors.invalidate(key).await;
    }

    /// Cached actor for `key`, or the result of `resolve` stored under it
    pub async fn get_or_resolve<F, Fut>(&self, key: &str, resolve: F) -> Result<Arc<Actor>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Actor>>,
    {
        if let Some(actor) = self.get(key).await {
            return Ok(actor);
        }

        let owned_key = key.to_string();
        self.actors
            .try_get_with(key.to_string(), async move {
                let actor = resolve().await?;
                if actor.id.is_empty() {
                    return Err(AppError::ActorNotFound(owned_key));
                }
                Ok(Arc::new(actor))
            })
            .await
            .map_err(|err: Arc<AppError>| match err.as_ref() {
                AppError::ActorNotFound(key) => AppError::ActorNotFound(key.clone()),
                other => AppError::Federation(other.to_string()),
            })
    }

    pub fn entry_count(&self) -> u64 {
        self.actors.entry_count()
    }
}
