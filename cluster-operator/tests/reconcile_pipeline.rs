//! Integration coverage for cross-module wiring the per-module unit tests don't
//! exercise: the worker loop's retry/backoff policy end to end, and a full
//! `sync_cluster` pass driven through a `ChildrenReconciler` that behaves like the
//! real `ChildClients` (ensuring more than once, tracking steady-state across
//! calls) rather than the single-field `FakeChildren` used in
//! `reconciler.rs`'s own unit tests.

use async_trait::async_trait;
use cluster_operator::cache::test_support::seeded;
use cluster_operator::cloud::openstack::fake::FakeOpenstackApi;
use cluster_operator::error::{Error, Result};
use cluster_operator::patch::test_support::InMemoryPersister;
use cluster_operator::queue::WorkQueue;
use cluster_operator::reconciler::{run_worker, ChildrenReconciler, Engine, NoopMetrics};
use cluster_operator_types::{
    CloudSpec, Cluster, ClusterPhase, ClusterSpec, ClusterStatusError, DatacenterMeta,
    OpenstackCloudSpec,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

fn datacenters() -> HashMap<String, DatacenterMeta> {
    HashMap::from([(
        "dc1".to_string(),
        DatacenterMeta {
            auth_url: "https://example.invalid".into(),
            region: "region1".into(),
            dns_servers: vec![],
        },
    )])
}

fn cluster(name: &str) -> Cluster {
    let mut c = Cluster::new(
        name,
        ClusterSpec {
            human_readable_name: "test".into(),
            cloud: CloudSpec {
                datacenter_name: "dc1".into(),
                openstack: Some(OpenstackCloudSpec::default()),
            },
            version: "1.2.3".into(),
            pause: false,
        },
    );
    c.metadata.uid = Some("11111111-1111-1111-1111-111111111111".into());
    c
}

/// Stands in for `ChildClients`: every cluster starts non-steady (first call
/// creates its children) and becomes steady on every later call, the same shape
/// real server-side-apply-backed reconciliation has (create once, then no-op).
struct RecordingChildren {
    seen_once: Mutex<HashSet<String>>,
    calls: AtomicUsize,
}

impl RecordingChildren {
    fn new() -> Self {
        Self {
            seen_once: Mutex::new(HashSet::new()),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ChildrenReconciler for RecordingChildren {
    async fn reconcile(&self, cluster: &Cluster) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let name = cluster.metadata.name.clone().unwrap_or_default();
        let mut seen = self.seen_once.lock().await;
        let already_steady = seen.contains(&name);
        seen.insert(name);
        Ok(already_steady)
    }
}

/// Always-failing children reconciler, to exercise `run_worker`'s retry-then-give-up
/// path without needing a real transient failure in C7/C8.
struct FailingChildren;

#[async_trait]
impl ChildrenReconciler for FailingChildren {
    async fn reconcile(&self, _cluster: &Cluster) -> Result<bool> {
        Err(Error::Cloud("children reconcile always fails in this test".into()))
    }
}

#[tokio::test]
async fn a_cluster_reaches_running_after_two_passes_through_the_real_worker_loop() {
    let start = cluster("c1");
    let persister = Arc::new(InMemoryPersister::new());
    let engine = Arc::new(Engine {
        clusters: seeded(vec![start.clone()]),
        persister: persister.clone(),
        cloud_api: Arc::new(FakeOpenstackApi::new()),
        children: Arc::new(RecordingChildren::new()),
        datacenters: datacenters(),
        worker_name: String::new(),
        metrics: Arc::new(NoopMetrics),
    });

    let queue = WorkQueue::new(CancellationToken::new());
    queue.add("c1").await;

    // First pass: children are created (not yet steady), cluster lands in Launching.
    engine.sync_cluster("c1").await.unwrap();
    let after_first = persister.get("c1").await.unwrap();
    assert_eq!(after_first.status.phase, ClusterPhase::Launching);

    // Re-enqueue, as C3/C9 would once the children's own events/periodic scan fire,
    // and run a second pass: children now report steady, cluster reaches Running.
    engine.sync_cluster("c1").await.unwrap();
    let after_second = persister.get("c1").await.unwrap();
    assert_eq!(after_second.status.phase, ClusterPhase::Running);
    assert_eq!(after_second.status.namespace_name.as_deref(), Some("cluster-c1"));
    assert!(after_second.status.error_message.is_none());
}

#[tokio::test]
async fn run_worker_retries_up_to_the_cap_then_hands_off_to_on_error() {
    let start = cluster("c1");
    let persister = Arc::new(InMemoryPersister::new());
    let engine = Arc::new(Engine {
        clusters: seeded(vec![start.clone()]),
        persister,
        cloud_api: Arc::new(FakeOpenstackApi::new()),
        children: Arc::new(FailingChildren),
        datacenters: datacenters(),
        worker_name: String::new(),
        metrics: Arc::new(NoopMetrics),
    });

    let cancel = CancellationToken::new();
    let queue = WorkQueue::new(cancel.clone());
    queue.add("c1").await;

    let gave_up = Arc::new(AtomicUsize::new(0));
    let gave_up_in_callback = gave_up.clone();
    let on_error: Arc<dyn Fn(&str, &Error) + Send + Sync> = Arc::new(move |name, _err| {
        assert_eq!(name, "c1");
        gave_up_in_callback.fetch_add(1, Ordering::SeqCst);
    });

    let worker = tokio::spawn(run_worker(engine, queue.clone(), on_error));

    // Every failing pass re-adds with exponential backoff starting at 5ms; give the
    // worker ample wall-clock budget to exhaust MAX_RETRIES well within this test's
    // own timeout.
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    cancel.cancel();
    worker.await.unwrap();

    assert_eq!(gave_up.load(Ordering::SeqCst), 1);
    assert_eq!(queue.num_requeues("c1").await, 0, "forget() clears the count once given up on");
}

#[tokio::test]
async fn an_invalid_cluster_is_never_handed_to_children_reconciliation() {
    let mut start = cluster("c1");
    start.spec.cloud.datacenter_name = "unknown-dc".into();
    let persister = Arc::new(InMemoryPersister::new());
    let children = Arc::new(RecordingChildren::new());
    let engine = Arc::new(Engine {
        clusters: seeded(vec![start]),
        persister: persister.clone(),
        cloud_api: Arc::new(FakeOpenstackApi::new()),
        children: children.clone(),
        datacenters: datacenters(),
        worker_name: String::new(),
        metrics: Arc::new(NoopMetrics),
    });

    let err = engine.sync_cluster("c1").await.unwrap_err();
    assert!(matches!(err, Error::InvalidConfiguration(_)));
    assert_eq!(children.calls.load(Ordering::SeqCst), 0);

    let stored = persister.get("c1").await.unwrap();
    assert_eq!(stored.status.error_reason, Some(ClusterStatusError::InvalidConfiguration));
}
