//! Indexed cache & watch set (C1).
//!
//! Built on `kube::runtime`'s `watcher`/`reflector::store` primitives rather than a
//! hand-rolled informer. `kube-rs` never redelivers a tombstone on delete (it always
//! hands back the last-known full object), so [`Deleted`] exists purely so the rest of
//! this crate can be written, and tested, against both shapes client-go's
//! `cache.DeletedFinalStateUnknown` distinguishes.

use futures::StreamExt;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{reflector, watcher};
use kube::{Api, Resource};
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A deletion observation: either the full last-known object, or an opaque
/// tombstone carrying only the key and (if available) the last object this
/// process had cached for it.
#[derive(Debug, Clone)]
pub enum Deleted<T> {
    Final(Arc<T>),
    Tombstone {
        key: String,
        last_known: Option<Arc<T>>,
    },
}

impl<T> Deleted<T> {
    pub fn object(&self) -> Option<&Arc<T>> {
        match self {
            Deleted::Final(obj) => Some(obj),
            Deleted::Tombstone { last_known, .. } => last_known.as_ref(),
        }
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            Deleted::Final(_) => None,
            Deleted::Tombstone { key, .. } => Some(key),
        }
    }
}

/// One index over a single watched kind: lookup-by-name, list-all, and a
/// `has_synced` predicate that flips true once the initial bulk list lands.
#[derive(Clone)]
pub struct IndexedCache<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static,
{
    store: Store<K>,
    synced: Arc<AtomicBool>,
}

impl<K> IndexedCache<K>
where
    K: Resource<DynamicType = ()>
        + Clone
        + Debug
        + Send
        + Sync
        + serde::de::DeserializeOwned
        + 'static,
{
    /// Starts the watch feed in the background and returns the cache handle
    /// immediately; `has_synced` becomes true once the first bulk list completes.
    pub fn spawn(api: Api<K>, cfg: watcher::Config) -> (Self, tokio::task::JoinHandle<()>) {
        let (store, mut writer) = reflector::store();
        let synced = Arc::new(AtomicBool::new(false));
        let synced_task = synced.clone();
        let handle = tokio::spawn(async move {
            let mut stream = watcher(api, cfg).boxed();
            while let Some(event) = stream.next().await {
                match event {
                    Ok(event) => {
                        if matches!(event, watcher::Event::InitDone) {
                            synced_task.store(true, Ordering::SeqCst);
                        }
                        writer.apply_watcher_event(&event);
                    }
                    Err(err) => eprintln!("watch error: {err}"),
                }
            }
        });
        (Self { store, synced }, handle)
    }

    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    pub fn get(&self, name: &str) -> Option<Arc<K>> {
        self.store.get(&ObjectRef::new(name))
    }

    pub fn list(&self) -> Vec<Arc<K>> {
        self.store.state()
    }

    pub fn list_matching(&self, mut predicate: impl FnMut(&K) -> bool) -> Vec<Arc<K>> {
        self.store
            .state()
            .into_iter()
            .filter(|obj| predicate(obj))
            .collect()
    }
}

/// Builds an [`IndexedCache`] pre-loaded with a fixed object set and no
/// background watch task, for exercising C3/C7/C8 logic without a live
/// `kube::Client`. `reflector::store()`/`Writer::apply_watcher_event` are
/// ordinary library calls, not network I/O, so this is a real cache, just fed
/// synthetically instead of from a live watch.
pub mod test_support {
    use super::*;

    pub fn seeded<K>(objects: Vec<K>) -> IndexedCache<K>
    where
        K: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static,
    {
        let (store, mut writer) = reflector::store();
        for obj in objects {
            writer.apply_watcher_event(&watcher::Event::InitApply(obj));
        }
        writer.apply_watcher_event(&watcher::Event::InitDone);
        IndexedCache {
            store,
            synced: Arc::new(AtomicBool::new(true)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tombstone_falls_back_to_last_known_object() {
        let t: Deleted<u32> = Deleted::Tombstone {
            key: "ns/name".into(),
            last_known: Some(Arc::new(7)),
        };
        assert_eq!(**t.object().unwrap(), 7);
    }

    #[test]
    fn tombstone_without_last_known_yields_none() {
        let t: Deleted<u32> = Deleted::Tombstone {
            key: "ns/name".into(),
            last_known: None,
        };
        assert!(t.object().is_none());
    }

    #[test]
    fn final_deletion_always_has_an_object() {
        let d: Deleted<u32> = Deleted::Final(Arc::new(9));
        assert_eq!(**d.object().unwrap(), 9);
        assert!(d.key().is_none());
    }
}
