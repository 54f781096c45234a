//! `/healthz`, `/readyz` and `/metrics` over bare `hyper`, gated behind the
//! `metrics` feature so a build that doesn't want the instrumentation surface
//! can drop `prometheus` entirely. `PrometheusMetrics` wires the reconciler's
//! and scanner's observability traits to a handful of process-global gauges.

use crate::reconciler::ReconcileMetrics;
use crate::scanner::PhaseObserver;
use bytes::Bytes;
use cluster_operator_types::ClusterPhase;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::convert::Infallible;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
    static ref CLUSTER_PHASES: IntGaugeVec = IntGaugeVec::new(
        Opts::new("cluster_operator_cluster_phases", "clusters observed per phase by the last C9 scan"),
        &["phase"]
    )
    .unwrap();
    static ref CLUSTERS: IntGauge =
        IntGauge::new("cluster_operator_clusters", "total clusters currently in C1's cache").unwrap();
    static ref WORKERS: IntGauge =
        IntGauge::new("cluster_operator_workers", "configured reconcile worker count").unwrap();
    static ref UNHANDLED_ERRORS: IntCounter = IntCounter::new(
        "cluster_operator_unhandled_errors_total",
        "sync failures that exhausted retries and were handed to on_error"
    )
    .unwrap();
}

fn register_once() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        REGISTRY.register(Box::new(CLUSTER_PHASES.clone())).unwrap();
        REGISTRY.register(Box::new(CLUSTERS.clone())).unwrap();
        REGISTRY.register(Box::new(WORKERS.clone())).unwrap();
        REGISTRY.register(Box::new(UNHANDLED_ERRORS.clone())).unwrap();
    });
}

/// `ReconcileMetrics`/`PhaseObserver` implementation backed by the process-wide
/// `prometheus::Registry` above.
pub struct PrometheusMetrics;

impl PrometheusMetrics {
    pub fn new(worker_count: usize) -> Self {
        register_once();
        WORKERS.set(worker_count as i64);
        Self
    }
}

impl ReconcileMetrics for PrometheusMetrics {
    fn observe_phase(&self, phase: ClusterPhase) {
        CLUSTER_PHASES.with_label_values(&[&phase.to_string()]).inc();
    }

    fn observe_unhandled_error(&self) {
        UNHANDLED_ERRORS.inc();
    }
}

impl PhaseObserver for PrometheusMetrics {
    fn observe_count(&self, phase: ClusterPhase, count: usize) {
        CLUSTER_PHASES.with_label_values(&[&phase.to_string()]).set(count as i64);
    }

    fn observe_total(&self, total: usize) {
        CLUSTERS.set(total as i64);
    }
}

async fn handle(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let body = match req.uri().path() {
        "/healthz" | "/readyz" => "ok".to_string(),
        "/metrics" => {
            let metric_families = REGISTRY.gather();
            let mut buf = Vec::new();
            TextEncoder::new().encode(&metric_families, &mut buf).unwrap();
            String::from_utf8(buf).unwrap()
        }
        _ => {
            return Ok(Response::builder()
                .status(404)
                .body(Full::new(Bytes::from_static(b"not found")))
                .unwrap())
        }
    };
    Ok(Response::new(Full::new(Bytes::from(body))))
}

/// Serves `/healthz`, `/readyz`, `/metrics` on `port` until `cancel` fires.
pub async fn serve(port: u16, cancel: CancellationToken) -> crate::error::Result<()> {
    register_once();
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| crate::error::Error::Other(format!("binding metrics server to :{port}: {e}")))?;
    eprintln!("metrics server listening on :{port}");
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = accepted
                    .map_err(|e| crate::error::Error::Other(format!("accepting metrics connection: {e}")))?;
                let io = TokioIo::new(stream);
                tokio::spawn(async move {
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service_fn(handle))
                        .await;
                });
            }
            _ = cancel.cancelled() => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observing_a_phase_is_reflected_in_the_registry() {
        let metrics = PrometheusMetrics::new(4);
        metrics.observe_phase(ClusterPhase::Running);
        metrics.observe_phase(ClusterPhase::Running);

        let families = REGISTRY.gather();
        let phases = families
            .iter()
            .find(|f| f.name() == "cluster_operator_cluster_phases")
            .unwrap();
        let running = phases
            .get_metric()
            .iter()
            .find(|m| m.get_label().iter().any(|l| l.value() == "Running"))
            .unwrap();
        assert!(running.get_gauge().get_value() >= 2.0);
    }

    #[test]
    fn workers_gauge_reflects_the_configured_count() {
        PrometheusMetrics::new(7);
        let families = REGISTRY.gather();
        let workers = families.iter().find(|f| f.name() == "cluster_operator_workers").unwrap();
        assert_eq!(workers.get_metric()[0].get_gauge().get_value(), 7.0);
    }
}
