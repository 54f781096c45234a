//! The reconciler pipeline (C7): `syncCluster` plus the worker loop that drains
//! C2 and retries or gives up on failure. Mirrors
//! `original_source/controller.go::syncClusterNamespacedKey` step for step; the
//! division into `Engine::sync_cluster` (the pipeline) and `run_worker` (the
//! retry policy around it) matches that file's split between `syncHandler` and
//! `processNextWorkItem`.

use crate::cache::IndexedCache;
use crate::children::ChildClients;
use crate::cloud::openstack::{bootstrap, cleanup, OpenstackApi};
use crate::error::{Error, Result};
use crate::patch::Persister;
use crate::queue::{WorkQueue, MAX_RETRIES};
use crate::util::colors::{FG1, FG2};
use async_trait::async_trait;
use cluster_operator_types::{ClusterPhase, ClusterStatusError, DatacenterCatalog, WORKER_NAME_LABEL};
use cluster_operator_types::Cluster;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use owo_colors::OwoColorize;
use std::sync::Arc;

/// Abstracts child-resource reconciliation so the pipeline can be driven in
/// tests without a live `kube::Client`. [`children::ChildClients`] is the
/// production implementation.
#[async_trait]
pub trait ChildrenReconciler: Send + Sync {
    /// Ensures every child exists/matches; returns whether all were already
    /// steady before this call (the signal for Launching -> Running).
    async fn reconcile(&self, cluster: &Cluster) -> Result<bool>;
}

#[async_trait]
impl ChildrenReconciler for ChildClients {
    async fn reconcile(&self, cluster: &Cluster) -> Result<bool> {
        crate::children::reconcile_children(self, cluster).await
    }
}

/// Rejects configuration a cluster can never be launched with. Grounded on
/// `original_source/api/pkg/validation/cluster.go`'s field checks; schema
/// validation beyond presence/non-emptiness is out of scope.
pub fn validate_cluster(cluster: &Cluster, datacenters: &DatacenterCatalog) -> std::result::Result<(), String> {
    let spec = &cluster.spec;
    if spec.human_readable_name.trim().is_empty() {
        return Err("spec.humanReadableName must not be empty".into());
    }
    if spec.version.trim().is_empty() {
        return Err("spec.version must not be empty".into());
    }
    if spec.cloud.datacenter_name.trim().is_empty() {
        return Err("spec.cloud.datacenterName must not be empty".into());
    }
    if !datacenters.contains_key(&spec.cloud.datacenter_name) {
        return Err(format!(
            "unknown datacenter {:?}",
            spec.cloud.datacenter_name
        ));
    }
    if spec.cloud.openstack.is_none() {
        return Err("spec.cloud.openstack must be set; no other provider is supported".into());
    }
    Ok(())
}

/// Observability hook for phase transitions and the dead-letter path, kept
/// separate from `prometheus` so the pipeline itself has no feature-flag
/// dependency. [`metrics::PrometheusMetrics`](crate::metrics::PrometheusMetrics)
/// is the production implementation.
pub trait ReconcileMetrics: Send + Sync {
    fn observe_phase(&self, phase: ClusterPhase);
    fn observe_unhandled_error(&self);
}

pub struct NoopMetrics;
impl ReconcileMetrics for NoopMetrics {
    fn observe_phase(&self, _phase: ClusterPhase) {}
    fn observe_unhandled_error(&self) {}
}

/// Everything `sync_cluster` needs to run one pass of the pipeline for a
/// single key. Every collaborator is a trait object so the whole engine is
/// constructible without a live API server.
pub struct Engine {
    pub clusters: IndexedCache<Cluster>,
    pub persister: Arc<dyn Persister<Cluster>>,
    pub cloud_api: Arc<dyn OpenstackApi>,
    pub children: Arc<dyn ChildrenReconciler>,
    pub datacenters: DatacenterCatalog,
    pub worker_name: String,
    pub metrics: Arc<dyn ReconcileMetrics>,
}

impl Engine {
    /// Steps 1-11 of the pipeline. `name` is the work-queue key (the cluster's
    /// own name; this CRD is cluster-scoped).
    pub async fn sync_cluster(&self, name: &str) -> Result<()> {
        // 1. Lookup via C1. A key with nothing left to look up was deleted
        // between enqueue and dequeue: nothing to do.
        let Some(original) = self.clusters.get(name) else {
            return Ok(());
        };
        // 2. Snapshot for C4's three-way diff.
        let original: Cluster = (*original).clone();
        let mut current = original.clone();

        // 3. Pause: respected unconditionally, even mid-deletion.
        if current.spec.pause {
            return Ok(());
        }

        // 4. Worker-sharding: a label-based filter. If the cluster's
        // workerName label doesn't match this process's own, it belongs to a
        // different worker and is left alone.
        let cluster_worker_name = current
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(WORKER_NAME_LABEL))
            .map(String::as_str)
            .unwrap_or("");
        if cluster_worker_name != self.worker_name {
            return Ok(());
        }

        self.metrics.observe_phase(current.status.phase);

        // 6. Deletion branch.
        if current.metadata.deletion_timestamp.is_some() {
            let dc = self.datacenter_of(&current)?;
            current = cleanup(self.cloud_api.as_ref(), &dc, self.persister.as_ref(), &current).await?;
            current.status.phase = ClusterPhase::Deleting;
            self.persist_status(&original, &current).await?;
            return Ok(());
        }

        // 7. None -> Validating.
        if current.status.phase == ClusterPhase::None {
            current.status.phase = ClusterPhase::Validating;
            current = self.persist_status(&original, &current).await?;
        }

        // 8. Validate.
        if let Err(msg) = validate_cluster(&current, &self.datacenters) {
            current.status.error_reason = Some(ClusterStatusError::InvalidConfiguration);
            current.status.error_message = Some(msg.clone());
            self.persist_status(&original, &current).await?;
            eprintln!("{}", format!("cluster {name} failed validation: {msg}").color(FG2));
            return Err(Error::InvalidConfiguration(msg));
        }

        // 9. Validating -> Launching.
        if current.status.phase == ClusterPhase::Validating {
            current.status.phase = ClusterPhase::Launching;
            current = self.persist_status(&original, &current).await?;
        }

        // 10. Reconcile: cloud bootstrap, then children.
        let reconcile_result = self.reconcile_cluster(&current).await;
        match reconcile_result {
            Ok((bootstrapped, children_steady)) => {
                current = bootstrapped;
                current.status.error_reason = None;
                current.status.error_message = None;
                if current.status.phase == ClusterPhase::Launching && children_steady {
                    current.status.phase = ClusterPhase::Running;
                }
                current.status.namespace_name = Some(crate::children::namespace_name(&current));
                // 11. Final update, clearing any previously recorded error.
                self.persist_status(&original, &current).await?;
                eprintln!("{}", format!("cluster {name} synced, phase={}", current.status.phase).color(FG1));
                Ok(())
            }
            Err(err) => {
                current.status.error_reason = Some(ClusterStatusError::Reconcile);
                current.status.error_message = Some(err.to_string());
                self.persist_status(&original, &current).await?;
                Err(err)
            }
        }
    }

    async fn reconcile_cluster(&self, current: &Cluster) -> Result<(Cluster, bool)> {
        let dc = self.datacenter_of(current)?;
        let bootstrapped = bootstrap(self.cloud_api.as_ref(), &dc, self.persister.as_ref(), current).await?;
        let steady = self.children.reconcile(&bootstrapped).await?;
        Ok((bootstrapped, steady))
    }

    fn datacenter_of(&self, cluster: &Cluster) -> Result<cluster_operator_types::DatacenterMeta> {
        self.datacenters
            .get(&cluster.spec.cloud.datacenter_name)
            .cloned()
            .ok_or_else(|| {
                Error::InvalidConfiguration(format!(
                    "unknown datacenter {:?}",
                    cluster.spec.cloud.datacenter_name
                ))
            })
    }

    async fn persist_status(&self, original: &Cluster, modified: &Cluster) -> Result<Cluster> {
        let mut modified = modified.clone();
        modified.status.last_updated = Some(Time(chrono_now()));
        let name = modified.metadata.name.clone().unwrap_or_default();
        self.persister.update(&name, original, &modified).await
    }
}

/// Isolated so the rest of the file never calls `chrono::Utc::now()` directly;
/// keeps the one wall-clock read easy to find.
fn chrono_now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}

/// Drains C2 forever, applying the retry policy in §4.7/§7: under
/// [`MAX_RETRIES`] requeues go back on with backoff, at the cap the key is
/// forgotten and `on_error` is invoked instead of panicking the worker.
pub async fn run_worker(
    engine: Arc<Engine>,
    queue: Arc<WorkQueue>,
    on_error: Arc<dyn Fn(&str, &Error) + Send + Sync>,
) {
    while let Some(name) = queue.get().await {
        match engine.sync_cluster(&name).await {
            Ok(()) => {
                queue.forget(&name).await;
            }
            Err(err) => {
                if queue.num_requeues(&name).await < MAX_RETRIES {
                    queue.add_rate_limited(name.clone());
                } else {
                    queue.forget(&name).await;
                    engine.metrics.observe_unhandled_error();
                    on_error(&name, &err);
                }
            }
        }
        queue.done(&name).await;
    }
}
