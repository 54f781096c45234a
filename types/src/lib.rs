use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, str::FromStr};

/// Wire-compatible finalizer tokens understood by this operator.
///
/// The v2 tokens guard exactly one cloud side-effect each; the aggregate token is
/// accepted on input only, to support migrating records created by a predecessor
/// that only understood a single finalizer for all OpenStack cleanup.
pub mod finalizers {
    pub const SECURITY_GROUP: &str = "kubermatic.io/cleanup-openstack-security-group";
    pub const NETWORK: &str = "kubermatic.io/cleanup-openstack-network-v2";
    pub const SUBNET: &str = "kubermatic.io/cleanup-openstack-subnet-v2";
    pub const ROUTER: &str = "kubermatic.io/cleanup-openstack-router-v2";
    pub const ROUTER_SUBNET_LINK: &str = "kubermatic.io/cleanup-openstack-router-subnet-link-v2";
    /// Deprecated aggregate finalizer, accepted on input only.
    pub const LEGACY_AGGREGATE: &str = "kubermatic.io/cleanup-openstack-network";
}

pub const WORKER_NAME_LABEL: &str = "cluster.k8s.io/worker-name";

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum ClusterPhase {
    #[default]
    None,
    Validating,
    Launching,
    Running,
    Deleting,
}

impl ClusterPhase {
    /// The cadence at which [`crate::ClusterPhase`]-scoped periodic scans
    /// (component C9) re-enqueue members of this phase. `None` has no scan: it only
    /// appears before the first successful sync and event-driven enqueues alone
    /// move it along.
    pub fn sync_period(&self) -> Option<std::time::Duration> {
        use std::time::Duration;
        match self {
            ClusterPhase::None => None,
            ClusterPhase::Validating => Some(Duration::from_secs(15)),
            ClusterPhase::Launching => Some(Duration::from_secs(2)),
            ClusterPhase::Running => Some(Duration::from_secs(60)),
            ClusterPhase::Deleting => Some(Duration::from_secs(10)),
        }
    }

    pub const ALL: [ClusterPhase; 4] = [
        ClusterPhase::Validating,
        ClusterPhase::Launching,
        ClusterPhase::Running,
        ClusterPhase::Deleting,
    ];
}

impl fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClusterPhase::None => "None",
            ClusterPhase::Validating => "Validating",
            ClusterPhase::Launching => "Launching",
            ClusterPhase::Running => "Running",
            ClusterPhase::Deleting => "Deleting",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ClusterPhase {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "None" => Ok(ClusterPhase::None),
            "Validating" => Ok(ClusterPhase::Validating),
            "Launching" => Ok(ClusterPhase::Launching),
            "Running" => Ok(ClusterPhase::Running),
            "Deleting" => Ok(ClusterPhase::Deleting),
            _ => Err(()),
        }
    }
}

/// Mirrors `kubermaticv1.ClusterStatusError`: the coarse reason a cluster is
/// currently reporting an error, surfaced on `Status` per §7's taxonomy.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ClusterStatusError {
    InvalidConfiguration,
    Reconcile,
}

impl fmt::Display for ClusterStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterStatusError::InvalidConfiguration => write!(f, "InvalidConfiguration"),
            ClusterStatusError::Reconcile => write!(f, "Reconcile"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct OpenstackCloudSpec {
    pub username: String,
    pub password: String,
    pub domain: String,
    pub tenant: String,
    #[serde(default)]
    pub floating_ip_pool: String,
    /// Comma-joined list of security group names, matching the upstream API's
    /// representation (`strings.Split(spec.Openstack.SecurityGroups, ",")`).
    #[serde(default)]
    pub security_groups: String,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub subnet_id: String,
    #[serde(default)]
    pub router_id: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct CloudSpec {
    pub datacenter_name: String,
    pub openstack: Option<OpenstackCloudSpec>,
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "kubermatic.io",
    version = "v1",
    kind = "Cluster",
    plural = "clusters",
    derive = "PartialEq",
    status = "ClusterStatus"
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.phase\", \"name\": \"PHASE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.lastUpdated\", \"name\": \"AGE\", \"type\": \"date\" }"
)]
pub struct ClusterSpec {
    pub human_readable_name: String,
    pub cloud: CloudSpec,
    pub version: String,
    #[serde(default)]
    pub pause: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ClusterStatus {
    #[serde(default)]
    pub phase: ClusterPhase,
    pub error_reason: Option<ClusterStatusError>,
    pub error_message: Option<String>,
    pub namespace_name: Option<String>,
    #[serde(rename = "lastUpdated")]
    pub last_updated: Option<Time>,
}

/// Per-datacenter connection details for the OpenStack collaborator. Supplied at
/// startup (see §6 Configuration); not part of any cluster record.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct DatacenterMeta {
    pub auth_url: String,
    pub region: String,
    #[serde(default)]
    pub dns_servers: Vec<String>,
}

pub type DatacenterCatalog = HashMap<String, DatacenterMeta>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_round_trips_through_its_string_form() {
        for phase in [
            ClusterPhase::None,
            ClusterPhase::Validating,
            ClusterPhase::Launching,
            ClusterPhase::Running,
            ClusterPhase::Deleting,
        ] {
            assert_eq!(phase.to_string().parse::<ClusterPhase>().unwrap(), phase);
        }
    }

    #[test]
    fn only_none_phase_has_no_sync_period() {
        assert_eq!(ClusterPhase::None.sync_period(), None);
        for phase in ClusterPhase::ALL {
            assert!(phase.sync_period().is_some());
        }
    }
}
