//! Three-way merge patch updater (C4).
//!
//! Computes a JSON Patch between `original` (the snapshot taken at the start of
//! reconciliation) and `modified` (this writer's in-memory mutation). Because the
//! patch only lists paths where `modified` differs from `original`, applying it
//! server-side leaves any field another actor changed on the live object alone —
//! the same three-way semantics as
//! `jsonmergepatch.CreateThreeWayJSONMergePatch(originalData, modifiedData, currentData)`
//! in `original_source/controller.go::updateCluster`, without needing to read
//! `current` up front: the live object the server patches against plays that role.

use crate::cache::IndexedCache;
use crate::error::{Error, Result};
use crate::util::MANAGER_NAME;
use async_trait::async_trait;
use kube::api::{Patch, PatchParams};
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::time::{Duration, Instant};

/// Abstracts "persist `modified` as a three-way patch against `original`, named
/// `name`" so callers (C7, C8) don't have to hold a live `kube::Api` to be
/// testable. [`KubePersister`] is the production implementation; tests use a
/// bare in-memory store.
#[async_trait]
pub trait Persister<K>: Send + Sync {
    async fn update(&self, name: &str, original: &K, modified: &K) -> Result<K>;
}

pub struct KubePersister<K> {
    pub api: Api<K>,
    pub cache: IndexedCache<K>,
    pub poll_timeout: Duration,
}

#[async_trait]
impl<K> Persister<K> for KubePersister<K>
where
    K: Resource<DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    async fn update(&self, name: &str, original: &K, modified: &K) -> Result<K> {
        Ok(update(&self.api, &self.cache, name, original, modified, self.poll_timeout)
            .await?
            .unwrap_or_else(|| modified.clone()))
    }
}

/// `Update(original, modified)`: diffs, short-circuits on no-op, applies, then
/// waits for C1 to observe the post-patch version (or the object's absence).
/// Returns `None` when no I/O was needed.
pub async fn update<K>(
    api: &Api<K>,
    cache: &IndexedCache<K>,
    name: &str,
    original: &K,
    modified: &K,
    poll_timeout: Duration,
) -> Result<Option<K>>
where
    K: Resource<DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    let original_value = serde_json::to_value(original)?;
    let modified_value = serde_json::to_value(modified)?;
    let ops = json_patch::diff(&original_value, &modified_value);
    if ops.0.is_empty() {
        return Ok(None);
    }

    let updated = api
        .patch(name, &PatchParams::apply(MANAGER_NAME), &Patch::Json::<K>(ops))
        .await?;
    let target_version = updated.resource_version();
    wait_for_cache(cache, name, target_version.as_deref(), poll_timeout).await?;
    Ok(Some(updated))
}

async fn wait_for_cache<K>(
    cache: &IndexedCache<K>,
    name: &str,
    target_version: Option<&str>,
    timeout: Duration,
) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
{
    let deadline = Instant::now() + timeout;
    loop {
        match cache.get(name) {
            None => return Ok(()),
            Some(obj) if obj.resource_version().as_deref() == target_version => return Ok(()),
            Some(_) => {}
        }
        if Instant::now() >= deadline {
            return Err(Error::CacheStale);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// An in-memory [`Persister`] that just records the latest value per key,
/// ignoring `original` entirely. Used by the integration suite to exercise C7's
/// pipeline and C8's bootstrap/cleanup scripts without a live API server.
pub mod test_support {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct InMemoryPersister<K> {
        pub store: Mutex<HashMap<String, K>>,
    }

    impl<K> InMemoryPersister<K> {
        pub fn new() -> Self {
            Self {
                store: Mutex::new(HashMap::new()),
            }
        }
    }

    impl<K: Clone> InMemoryPersister<K> {
        pub async fn get(&self, name: &str) -> Option<K> {
            self.store.lock().await.get(name).cloned()
        }
    }

    #[async_trait]
    impl<K: Clone + Send + Sync> Persister<K> for InMemoryPersister<K> {
        async fn update(&self, name: &str, _original: &K, modified: &K) -> Result<K> {
            self.store
                .lock()
                .await
                .insert(name.to_string(), modified.clone());
            Ok(modified.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    #[test]
    fn identical_original_and_modified_produce_an_empty_patch() {
        let original = json!({"a": 1, "b": 2});
        let modified = original.clone();
        let ops = json_patch::diff(&original, &modified);
        assert!(ops.0.is_empty());
    }

    #[test]
    fn patch_only_touches_paths_this_writer_actually_changed() {
        let original = json!({"a": 1, "b": 2});
        let modified = json!({"a": 1, "b": 3});
        let ops = json_patch::diff(&original, &modified);
        assert_eq!(ops.0.len(), 1);

        // Concurrent edit preservation: another actor added `extra` on the live
        // object between our read and our write. Applying the diff must leave it.
        let mut current = json!({"a": 1, "b": 2, "extra": 1});
        json_patch::patch(&mut current, &ops).unwrap();
        assert_eq!(current, json!({"a": 1, "b": 3, "extra": 1}));
    }
}
