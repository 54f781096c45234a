use clap::Parser;
use cluster_operator_types::DatacenterCatalog;
use std::path::PathBuf;
use std::time::Duration;

/// Process-wide configuration, parsed once at startup and handed to the engine
/// behind an `Arc`. Mirrors the teacher's `clap`-derived CLI surface, with
/// `env` fallbacks so the same binary runs unmodified under a Deployment.
#[derive(Parser, Debug, Clone)]
#[command(name = "cluster-operator", about = "Multi-tenant cluster reconciler")]
pub struct Config {
    /// Number of parallel reconcile workers consuming the work queue.
    #[arg(long, env = "WORKER_COUNT", default_value_t = 4)]
    pub worker_count: usize,

    /// Only reconcile clusters labelled with this worker name.
    #[arg(long, env = "WORKER_NAME", default_value = "")]
    pub worker_name: String,

    /// Path to a JSON file mapping datacenter name -> connection metadata.
    #[arg(long, env = "DATACENTERS_FILE")]
    pub datacenters_file: Option<PathBuf>,

    /// Path to a JSON file describing the supported/automatic version graph.
    #[arg(long, env = "VERSIONS_FILE")]
    pub versions_file: Option<PathBuf>,

    /// Whether clusters with an available update are upgraded automatically.
    #[arg(long, env = "AUTOMATIC_UPDATES", default_value_t = false)]
    pub automatic_updates: bool,

    /// Directory of master-resources templates used to render child objects.
    #[arg(long, env = "MASTER_RESOURCES_PATH")]
    pub master_resources_path: Option<PathBuf>,

    /// External URL at which the substrate's API is reachable from clusters.
    #[arg(long, env = "EXTERNAL_URL", default_value = "")]
    pub external_url: String,

    /// Container registry override for rendered child resources.
    #[arg(long, env = "OVERWRITE_REGISTRY", default_value = "")]
    pub overwrite_registry: String,

    /// Inclusive node-port range made available to rendered Services, "low-high".
    #[arg(long, env = "NODE_PORT_RANGE", default_value = "30000-32767")]
    pub node_port_range: String,

    /// Port the /healthz, /readyz and /metrics HTTP server listens on.
    #[arg(long, env = "METRICS_PORT", default_value_t = 8085)]
    pub metrics_port: u16,

    /// Cache-consistency poll cap for C4, human-readable (e.g. "30s").
    #[arg(long, env = "CACHE_POLL_TIMEOUT", value_parser = parse_duration::parse, default_value = "30s")]
    pub cache_poll_timeout: Duration,

    /// Lease name used for leader election among replicas of this process.
    #[arg(long, env = "LEASE_NAME", default_value = "cluster-operator-lock")]
    pub lease_name: String,

    /// Namespace the leader-election lease lives in.
    #[arg(long, env = "LEASE_NAMESPACE", default_value = "kube-system")]
    pub lease_namespace: String,
}

impl Config {
    pub fn node_port_bounds(&self) -> Result<(u16, u16), crate::error::Error> {
        let (low, high) = self
            .node_port_range
            .split_once('-')
            .ok_or_else(|| crate::error::Error::InvalidConfiguration(
                format!("node-port-range must be of the form LOW-HIGH, got {:?}", self.node_port_range),
            ))?;
        let low: u16 = low
            .trim()
            .parse()
            .map_err(|_| crate::error::Error::InvalidConfiguration("invalid node-port-range lower bound".into()))?;
        let high: u16 = high
            .trim()
            .parse()
            .map_err(|_| crate::error::Error::InvalidConfiguration("invalid node-port-range upper bound".into()))?;
        if low > high {
            return Err(crate::error::Error::InvalidConfiguration(
                "node-port-range lower bound exceeds upper bound".into(),
            ));
        }
        Ok((low, high))
    }
}

pub fn load_datacenter_catalog(path: &std::path::Path) -> crate::error::Result<DatacenterCatalog> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| crate::error::Error::Other(format!("reading {path:?}: {e}")))?;
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config::parse_from(["cluster-operator"])
    }

    #[test]
    fn node_port_range_parses_valid_bounds() {
        let cfg = base_config();
        assert_eq!(cfg.node_port_bounds().unwrap(), (30000, 32767));
    }

    #[test]
    fn node_port_range_rejects_inverted_bounds() {
        let mut cfg = base_config();
        cfg.node_port_range = "40000-1000".into();
        assert!(cfg.node_port_bounds().is_err());
    }

    #[test]
    fn node_port_range_rejects_malformed_input() {
        let mut cfg = base_config();
        cfg.node_port_range = "not-a-range".into();
        assert!(cfg.node_port_bounds().is_err());
    }
}
