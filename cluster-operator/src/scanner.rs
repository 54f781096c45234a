//! Periodic phase scanner (C9).
//!
//! Complements the watch-driven C3 dispatch: clusters that are merely sitting
//! in a phase with nothing changing (waiting on an external cloud operation,
//! say) would otherwise never get re-synced. One `tokio::time::interval` task
//! per non-`None` phase, at that phase's `ClusterPhase::sync_period`, lists C1
//! for matching clusters and enqueues every one of them. Grounded on
//! `original_source/controller.go`'s four `wait.Until(..., period, stopCh)`
//! calls registered in `Run`, one per phase.

use crate::cache::IndexedCache;
use crate::queue::WorkQueue;
use cluster_operator_types::{Cluster, ClusterPhase};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A scanner's observation of cluster counts, exposed so [`crate::metrics`] can
/// keep live gauges without this module depending on `prometheus` directly.
/// `observe_count` reports how many clusters currently sit in one phase;
/// `observe_total` reports the unfiltered count across every phase, taken from
/// the same list-all pass (`original_source/controller.go::syncInPhase` lists
/// everything, sets its `Clusters` gauge from that total, and only then filters
/// down to the phase it's enqueueing).
pub trait PhaseObserver: Send + Sync {
    fn observe_count(&self, phase: ClusterPhase, count: usize);
    fn observe_total(&self, total: usize);
}

pub struct NoopPhaseObserver;
impl PhaseObserver for NoopPhaseObserver {
    fn observe_count(&self, _phase: ClusterPhase, _count: usize) {}
    fn observe_total(&self, _total: usize) {}
}

/// Spawns one scanner task per non-`None` phase; all exit once `cancel` fires.
pub fn spawn_all(
    clusters: IndexedCache<Cluster>,
    queue: Arc<WorkQueue>,
    observer: Arc<dyn PhaseObserver>,
    cancel: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    ClusterPhase::ALL
        .iter()
        .copied()
        .map(|phase| spawn_one(phase, clusters.clone(), queue.clone(), observer.clone(), cancel.clone()))
        .collect()
}

fn spawn_one(
    phase: ClusterPhase,
    clusters: IndexedCache<Cluster>,
    queue: Arc<WorkQueue>,
    observer: Arc<dyn PhaseObserver>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let period = phase
        .sync_period()
        .expect("scanner is only spawned for phases with a sync period");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => return,
            }
            scan_once(phase, &clusters, &queue, observer.as_ref()).await;
        }
    })
}

async fn scan_once(
    phase: ClusterPhase,
    clusters: &IndexedCache<Cluster>,
    queue: &Arc<WorkQueue>,
    observer: &dyn PhaseObserver,
) {
    let all = clusters.list();
    observer.observe_total(all.len());
    let matching: Vec<_> = all.into_iter().filter(|c| c.status.phase == phase).collect();
    observer.observe_count(phase, matching.len());
    for cluster in matching {
        if let Some(name) = cluster.metadata.name.clone() {
            queue.add(name).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_operator_types::ClusterSpec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingObserver {
        phase_count: AtomicUsize,
        total: AtomicUsize,
    }
    impl CountingObserver {
        fn new() -> Self {
            Self {
                phase_count: AtomicUsize::new(0),
                total: AtomicUsize::new(0),
            }
        }
    }
    impl PhaseObserver for CountingObserver {
        fn observe_count(&self, _phase: ClusterPhase, count: usize) {
            self.phase_count.store(count, Ordering::SeqCst);
        }
        fn observe_total(&self, total: usize) {
            self.total.store(total, Ordering::SeqCst);
        }
    }

    fn cluster(name: &str, phase: ClusterPhase) -> Cluster {
        let mut c = Cluster::new(name, ClusterSpec::default());
        c.status.phase = phase;
        c
    }

    #[tokio::test]
    async fn a_scan_enqueues_every_cluster_currently_in_that_phase() {
        let clusters = crate::cache::test_support::seeded(vec![
            cluster("running-1", ClusterPhase::Running),
            cluster("running-2", ClusterPhase::Running),
            cluster("launching-1", ClusterPhase::Launching),
        ]);
        let queue = WorkQueue::new(CancellationToken::new());
        let observer = CountingObserver::new();

        scan_once(ClusterPhase::Running, &clusters, &queue, &observer).await;

        let mut seen = vec![queue.get().await.unwrap(), queue.get().await.unwrap()];
        seen.sort();
        assert_eq!(seen, vec!["running-1".to_string(), "running-2".to_string()]);
        assert_eq!(observer.phase_count.load(Ordering::SeqCst), 2);
        // The total gauge reflects every cluster in C1, not just this phase's matches.
        assert_eq!(observer.total.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn a_scan_of_an_empty_phase_enqueues_nothing_but_still_reports_the_total() {
        let clusters = crate::cache::test_support::seeded(vec![cluster("launching-1", ClusterPhase::Launching)]);
        let queue = WorkQueue::new(CancellationToken::new());
        let observer = CountingObserver::new();

        scan_once(ClusterPhase::Running, &clusters, &queue, &observer).await;

        assert_eq!(observer.phase_count.load(Ordering::SeqCst), 0);
        assert_eq!(observer.total.load(Ordering::SeqCst), 1);
    }
}
