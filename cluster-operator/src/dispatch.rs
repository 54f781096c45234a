//! Event demultiplexer (C3).
//!
//! Primary-kind events enqueue the object's own name directly. Child-kind events
//! resolve the controller-owner reference and enqueue the owner's name instead;
//! children with no controller owner, or whose owner's `apiVersion`/`kind` don't
//! match the `Cluster` CRD, are ignored (not ours). A controller-owned child whose
//! owner is missing from C1 is orphaned: logged via the console logger and dropped,
//! never enqueued, matching `original_source/controller.go::handleChildObject`'s
//! `runtime.HandleError("orphaned child obj found")` path.

use crate::cache::{Deleted, IndexedCache};
use crate::queue::WorkQueue;
use crate::util::colors::FG2;
use cluster_operator_types::Cluster;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;
use kube::runtime::watcher;
use kube::{Api, Resource, ResourceExt};
use owo_colors::OwoColorize;
use std::fmt::Debug;
use std::sync::Arc;

/// Returns the name of the `Cluster` this object's controller owner reference
/// points at, or `None` if there is no controller owner or it isn't a `Cluster`.
pub fn controller_owner_name(meta: &ObjectMeta) -> Option<String> {
    let owners = meta.owner_references.as_ref()?;
    let owner = owner_reference_of::<Cluster>(owners)?;
    Some(owner.name.clone())
}

fn owner_reference_of<K: Resource<DynamicType = ()>>(
    owners: &[OwnerReference],
) -> Option<&OwnerReference> {
    let group_version = K::api_version(&());
    let kind = K::kind(&());
    owners.iter().find(|o| {
        o.controller.unwrap_or(false)
            && o.api_version == group_version.as_ref()
            && o.kind == kind.as_ref()
    })
}

/// Enqueues the primary-kind key directly.
pub async fn dispatch_primary(queue: &Arc<WorkQueue>, name: impl Into<String>) {
    queue.add(name.into()).await;
}

/// Resolves a child object's owning cluster and enqueues it, logging and dropping
/// orphans. `meta` is the child's own metadata; `clusters` is C1's `Cluster` index,
/// used to confirm the owner still exists before enqueueing.
pub async fn dispatch_child(
    queue: &Arc<WorkQueue>,
    clusters: &IndexedCache<Cluster>,
    meta: &ObjectMeta,
) {
    let Some(owner_name) = controller_owner_name(meta) else {
        return;
    };
    if clusters.get(&owner_name).is_none() {
        eprintln!(
            "{}",
            format!(
                "orphaned child object found: owner {owner_name:?} not present in cache"
            )
            .color(FG2)
        );
        return;
    }
    queue.add(owner_name).await;
}

/// Resolves a child deletion event, unwrapping a tombstone if necessary, before
/// delegating to the same owner-resolution/orphan logic as [`dispatch_child`].
pub async fn dispatch_child_deleted<K>(
    queue: &Arc<WorkQueue>,
    clusters: &IndexedCache<Cluster>,
    event: &Deleted<K>,
) where
    K: Resource<DynamicType = ()>,
{
    let Some(obj) = event.object() else {
        eprintln!(
            "{}",
            "tombstone delivered with no last-known object; dropping".color(FG2)
        );
        return;
    };
    dispatch_child(queue, clusters, obj.meta()).await;
}

/// Spawns a dedicated watch feed over the primary kind, dispatching every
/// event (create/update/delete) straight to its own name. Runs alongside C1's
/// own watch on the same kind; a second independent watch is the price of
/// [`IndexedCache`] not exposing per-event hooks to its caller.
pub fn spawn_primary_watch(api: Api<Cluster>, queue: Arc<WorkQueue>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut stream = watcher(api, watcher::Config::default()).boxed();
        while let Some(event) = stream.next().await {
            match event {
                Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => {
                    dispatch_primary(&queue, obj.name_any()).await;
                }
                Ok(watcher::Event::Delete(obj)) => {
                    dispatch_primary(&queue, obj.name_any()).await;
                }
                Ok(_) => {}
                Err(err) => eprintln!("{}", format!("primary watch error: {err}").color(FG2)),
            }
        }
    })
}

/// Spawns a watch feed over one child kind; every event resolves to its owning
/// cluster and is routed through [`dispatch_child`]/[`dispatch_child_deleted`].
pub fn spawn_child_watch<K>(
    api: Api<K>,
    clusters: IndexedCache<Cluster>,
    queue: Arc<WorkQueue>,
) -> tokio::task::JoinHandle<()>
where
    K: Resource<DynamicType = ()> + Clone + Debug + serde::de::DeserializeOwned + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut stream = watcher(api, watcher::Config::default()).boxed();
        while let Some(event) = stream.next().await {
            match event {
                Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => {
                    dispatch_child(&queue, &clusters, obj.meta()).await;
                }
                Ok(watcher::Event::Delete(obj)) => {
                    let deleted: Deleted<K> = Deleted::Final(Arc::new(obj));
                    dispatch_child_deleted(&queue, &clusters, &deleted).await;
                }
                Ok(_) => {}
                Err(err) => eprintln!("{}", format!("child watch error: {err}").color(FG2)),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn owner_ref(api_version: &str, kind: &str, name: &str, controller: bool) -> OwnerReference {
        OwnerReference {
            api_version: api_version.into(),
            kind: kind.into(),
            name: name.into(),
            uid: "uid".into(),
            controller: Some(controller),
            ..Default::default()
        }
    }

    #[test]
    fn matching_controller_owner_resolves_to_its_name() {
        let meta = ObjectMeta {
            owner_references: Some(vec![owner_ref("kubermatic.io/v1", "Cluster", "c1", true)]),
            ..Default::default()
        };
        assert_eq!(controller_owner_name(&meta).as_deref(), Some("c1"));
    }

    #[test]
    fn non_controller_owner_is_ignored() {
        let meta = ObjectMeta {
            owner_references: Some(vec![owner_ref("kubermatic.io/v1", "Cluster", "c1", false)]),
            ..Default::default()
        };
        assert_eq!(controller_owner_name(&meta), None);
    }

    #[test]
    fn owner_of_a_different_kind_is_ignored() {
        let meta = ObjectMeta {
            owner_references: Some(vec![owner_ref("v1", "ConfigMap", "c1", true)]),
            ..Default::default()
        };
        assert_eq!(controller_owner_name(&meta), None);
    }

    #[test]
    fn no_owner_references_yields_none() {
        let meta = ObjectMeta::default();
        assert_eq!(controller_owner_name(&meta), None);
    }
}
