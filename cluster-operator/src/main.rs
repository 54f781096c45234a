//! Binary entrypoint: wires C1 watch feeds, C2/C3, the reconcile worker pool,
//! C9's scanners, and the leader-election loop around a single
//! `CancellationToken` shared by every background task. Modelled on
//! `storage-operator/src/clusters/reconcile.rs::run`'s
//! acquire-or-renew-every-tick leadership loop.

use clap::Parser;
use cluster_operator::cache::IndexedCache;
use cluster_operator::children::{ChildClients, EtcdCluster};
use cluster_operator::cloud::openstack::ReqwestOpenstackApi;
use cluster_operator::config::{load_datacenter_catalog, Config};
use cluster_operator::dispatch::{spawn_child_watch, spawn_primary_watch};
use cluster_operator::patch::KubePersister;
use cluster_operator::queue::WorkQueue;
use cluster_operator::reconciler::{run_worker, Engine};
use cluster_operator::util::colors::{FG1, FG2};
use cluster_operator::util::shutdown::shutdown_signal;

use cluster_operator_types::{Cluster, DatacenterCatalog};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{
    ConfigMap, Namespace, PersistentVolumeClaim, Secret, Service, ServiceAccount,
};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, Role, RoleBinding};
use kube::runtime::watcher;
use kube::{Api, Client};
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use owo_colors::OwoColorize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    let client = Client::try_default().await?;

    let datacenters: DatacenterCatalog = match &config.datacenters_file {
        Some(path) => load_datacenter_catalog(path)?,
        None => Default::default(),
    };
    // Validate once at startup so a misconfigured node-port range fails fast
    // rather than surfacing as a per-cluster reconcile error later.
    config.node_port_bounds()?;

    let cancel = CancellationToken::new();
    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_cancel.cancel();
    });

    #[cfg(feature = "metrics")]
    {
        let metrics_cancel = cancel.clone();
        let port = config.metrics_port;
        tokio::spawn(async move {
            if let Err(err) = cluster_operator::metrics::serve(port, metrics_cancel).await {
                eprintln!("metrics server exited: {err}");
            }
        });
    }

    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("cluster-operator-{}", uuid::Uuid::new_v4()));
    let leadership = LeaseLock::new(
        client.clone(),
        &config.lease_namespace,
        LeaseLockParams {
            holder_id,
            lease_name: config.lease_name.clone(),
            lease_ttl: Duration::from_secs(15),
        },
    );

    println!("{}", "cluster-operator starting".color(FG1));
    let mut engine_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut tick = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                if let Some(task) = engine_task.take() {
                    task.abort();
                }
                break;
            }
            _ = tick.tick() => {}
        }

        let lease = match leadership.try_acquire_or_renew().await {
            Ok(l) => l,
            Err(err) => {
                eprintln!("{}", format!("leader election renew/acquire failed: {err}").color(FG2));
                if let Some(task) = engine_task.take() {
                    task.abort();
                }
                continue;
            }
        };

        if matches!(lease, LeaseLockResult::Acquired(_)) {
            if engine_task.is_none() {
                println!("{}", "acquired leadership; starting engine".color(FG1));
                let client = client.clone();
                let config = config.clone();
                let datacenters = datacenters.clone();
                let cancel = cancel.clone();
                engine_task = Some(tokio::spawn(async move {
                    if let Err(err) = run_engine(client, config, datacenters, cancel).await {
                        eprintln!("{}", format!("engine exited with error: {err}").color(FG2));
                    }
                }));
            }
        } else if let Some(task) = engine_task.take() {
            eprintln!("{}", "lost leadership; stopping engine".color(FG2));
            task.abort();
        }
    }

    Ok(())
}

/// Spawns C1 for every watched kind, the C3 watch-dispatch feeds, the worker
/// pool, and C9's scanners; runs until `cancel` fires.
async fn run_engine(
    client: Client,
    config: Config,
    datacenters: DatacenterCatalog,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let (clusters, clusters_handle) =
        IndexedCache::<Cluster>::spawn(Api::all(client.clone()), watcher::Config::default());
    let (namespaces, _h1) = IndexedCache::<Namespace>::spawn(Api::all(client.clone()), watcher::Config::default());
    let (secrets, _h2) = IndexedCache::<Secret>::spawn(Api::all(client.clone()), watcher::Config::default());
    let (config_maps, _h3) = IndexedCache::<ConfigMap>::spawn(Api::all(client.clone()), watcher::Config::default());
    let (service_accounts, _h4) =
        IndexedCache::<ServiceAccount>::spawn(Api::all(client.clone()), watcher::Config::default());
    let (services, _h5) = IndexedCache::<Service>::spawn(Api::all(client.clone()), watcher::Config::default());
    let (persistent_volume_claims, _h5b) =
        IndexedCache::<PersistentVolumeClaim>::spawn(Api::all(client.clone()), watcher::Config::default());
    let (deployments, _h6) = IndexedCache::<Deployment>::spawn(Api::all(client.clone()), watcher::Config::default());
    let (stateful_sets, _h7) =
        IndexedCache::<StatefulSet>::spawn(Api::all(client.clone()), watcher::Config::default());
    let (ingresses, _h8) = IndexedCache::<Ingress>::spawn(Api::all(client.clone()), watcher::Config::default());
    let (roles, _h9) = IndexedCache::<Role>::spawn(Api::all(client.clone()), watcher::Config::default());
    let (role_bindings, _h10) =
        IndexedCache::<RoleBinding>::spawn(Api::all(client.clone()), watcher::Config::default());
    let (cluster_role_bindings, _h11) =
        IndexedCache::<ClusterRoleBinding>::spawn(Api::all(client.clone()), watcher::Config::default());
    let (etcd_clusters, _h12) =
        IndexedCache::<EtcdCluster>::spawn(Api::all(client.clone()), watcher::Config::default());

    while !clusters.has_synced() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let queue = WorkQueue::new(cancel.clone());

    let children = Arc::new(ChildClients {
        namespaces: (Api::all(client.clone()), namespaces.clone()),
        secrets: (Api::all(client.clone()), secrets.clone()),
        config_maps: (Api::all(client.clone()), config_maps.clone()),
        service_accounts: (Api::all(client.clone()), service_accounts.clone()),
        services: (Api::all(client.clone()), services.clone()),
        persistent_volume_claims: (Api::all(client.clone()), persistent_volume_claims.clone()),
        deployments: (Api::all(client.clone()), deployments.clone()),
        stateful_sets: (Api::all(client.clone()), stateful_sets.clone()),
        ingresses: (Api::all(client.clone()), ingresses.clone()),
        roles: (Api::all(client.clone()), roles.clone()),
        role_bindings: (Api::all(client.clone()), role_bindings.clone()),
        cluster_role_bindings: (Api::all(client.clone()), cluster_role_bindings.clone()),
        etcd_clusters: (Api::all(client.clone()), etcd_clusters.clone()),
    });

    #[cfg(feature = "metrics")]
    let metrics: Arc<dyn cluster_operator::reconciler::ReconcileMetrics> =
        Arc::new(cluster_operator::metrics::PrometheusMetrics::new(config.worker_count));
    #[cfg(not(feature = "metrics"))]
    let metrics: Arc<dyn cluster_operator::reconciler::ReconcileMetrics> =
        Arc::new(cluster_operator::reconciler::NoopMetrics);

    let engine = Arc::new(Engine {
        clusters: clusters.clone(),
        persister: Arc::new(KubePersister {
            api: Api::<Cluster>::all(client.clone()),
            cache: clusters.clone(),
            poll_timeout: config.cache_poll_timeout,
        }),
        cloud_api: Arc::new(ReqwestOpenstackApi::new()),
        children,
        datacenters,
        worker_name: config.worker_name.clone(),
        metrics,
    });

    #[cfg(feature = "metrics")]
    let phase_observer: Arc<dyn cluster_operator::scanner::PhaseObserver> =
        Arc::new(cluster_operator::metrics::PrometheusMetrics::new(config.worker_count));
    #[cfg(not(feature = "metrics"))]
    let phase_observer: Arc<dyn cluster_operator::scanner::PhaseObserver> =
        Arc::new(cluster_operator::scanner::NoopPhaseObserver);

    let on_error: Arc<dyn Fn(&str, &cluster_operator::error::Error) + Send + Sync> =
        Arc::new(|name: &str, err: &cluster_operator::error::Error| {
            eprintln!("{}", format!("giving up on cluster {name} after max retries: {err}").color(FG2));
        });

    let mut workers = Vec::new();
    for _ in 0..config.worker_count {
        let engine = engine.clone();
        let queue = queue.clone();
        let on_error = on_error.clone();
        workers.push(tokio::spawn(run_worker(engine, queue, on_error)));
    }

    let scanners = cluster_operator::scanner::spawn_all(
        clusters.clone(),
        queue.clone(),
        phase_observer,
        cancel.clone(),
    );

    let mut watches = vec![spawn_primary_watch(Api::all(client.clone()), queue.clone())];
    watches.push(spawn_child_watch(Api::<Namespace>::all(client.clone()), clusters.clone(), queue.clone()));
    watches.push(spawn_child_watch(Api::<Secret>::all(client.clone()), clusters.clone(), queue.clone()));
    watches.push(spawn_child_watch(Api::<ConfigMap>::all(client.clone()), clusters.clone(), queue.clone()));
    watches.push(spawn_child_watch(Api::<ServiceAccount>::all(client.clone()), clusters.clone(), queue.clone()));
    watches.push(spawn_child_watch(Api::<Service>::all(client.clone()), clusters.clone(), queue.clone()));
    watches.push(spawn_child_watch(
        Api::<PersistentVolumeClaim>::all(client.clone()),
        clusters.clone(),
        queue.clone(),
    ));
    watches.push(spawn_child_watch(Api::<Deployment>::all(client.clone()), clusters.clone(), queue.clone()));
    watches.push(spawn_child_watch(Api::<StatefulSet>::all(client.clone()), clusters.clone(), queue.clone()));
    watches.push(spawn_child_watch(Api::<Ingress>::all(client.clone()), clusters.clone(), queue.clone()));
    watches.push(spawn_child_watch(Api::<Role>::all(client.clone()), clusters.clone(), queue.clone()));
    watches.push(spawn_child_watch(Api::<RoleBinding>::all(client.clone()), clusters.clone(), queue.clone()));
    watches.push(spawn_child_watch(Api::<ClusterRoleBinding>::all(client.clone()), clusters.clone(), queue.clone()));
    watches.push(spawn_child_watch(Api::<EtcdCluster>::all(client.clone()), clusters.clone(), queue.clone()));

    cancel.cancelled().await;
    clusters_handle.abort();
    for w in watches {
        w.abort();
    }
    for w in workers {
        w.await.ok();
    }
    for s in scanners {
        s.await.ok();
    }
    Ok(())
}
