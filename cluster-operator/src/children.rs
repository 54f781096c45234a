//! Child-resource reconciliation, step 10 of C7's pipeline.
//!
//! The schema of each child template is explicitly out of scope; what this crate
//! owns is the mechanics shared by all of them: render a desired object from the
//! cluster, compare it to what C1 has cached, and create-or-patch via server-side
//! apply so an unchanged render is a no-op. `reconcile_children` drives namespace
//! plus every child kind through that loop and reports whether all of them are
//! observed steady, which gates the Launching -> Running transition.

use crate::cache::IndexedCache;
use crate::util::MANAGER_NAME;
use cluster_operator_types::Cluster;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, Namespace, PersistentVolumeClaim, PersistentVolumeClaimSpec, ResourceRequirements, Secret,
    Service, ServiceAccount, ServiceSpec,
};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use kube::api::{Patch, PatchParams, PostParams};
use kube::core::ObjectMeta;
use kube::{Api, Resource, ResourceExt};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;

/// Minimal stand-in for the etcd operator's CRD; its schema is not this crate's
/// concern, only that the reconciler waits for it to exist and look healthy.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "etcd.database.coreos.com",
    version = "v1",
    kind = "EtcdCluster",
    plural = "etcdclusters",
    namespaced
)]
pub struct EtcdClusterSpec {
    pub size: u32,
}

pub fn namespace_name(cluster: &Cluster) -> String {
    format!("cluster-{}", cluster.name_any())
}

fn owner_reference(cluster: &Cluster) -> OwnerReference {
    OwnerReference {
        api_version: Cluster::api_version(&()).to_string(),
        kind: Cluster::kind(&()).to_string(),
        name: cluster.name_any(),
        uid: cluster.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn child_labels(cluster: &Cluster) -> BTreeMap<String, String> {
    BTreeMap::from([("cluster".to_string(), cluster.name_any())])
}

fn child_meta(cluster: &Cluster, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace_name(cluster)),
        labels: Some(child_labels(cluster)),
        owner_references: Some(vec![owner_reference(cluster)]),
        ..Default::default()
    }
}

/// Renders the desired state of one child kind from a cluster. Each
/// implementation's body is deliberately minimal: schema is out of scope.
pub trait EnsureResource<K> {
    fn desired(&self, cluster: &Cluster) -> K;
}

pub struct NamespaceTemplate;
impl EnsureResource<Namespace> for NamespaceTemplate {
    fn desired(&self, cluster: &Cluster) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(namespace_name(cluster)),
                labels: Some(child_labels(cluster)),
                owner_references: Some(vec![owner_reference(cluster)]),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

pub struct SecretTemplate;
impl EnsureResource<Secret> for SecretTemplate {
    fn desired(&self, cluster: &Cluster) -> Secret {
        Secret {
            metadata: child_meta(cluster, "cluster-credentials"),
            ..Default::default()
        }
    }
}

pub struct ConfigMapTemplate;
impl EnsureResource<ConfigMap> for ConfigMapTemplate {
    fn desired(&self, cluster: &Cluster) -> ConfigMap {
        ConfigMap {
            metadata: child_meta(cluster, "cluster-config"),
            ..Default::default()
        }
    }
}

pub struct ServiceAccountTemplate;
impl EnsureResource<ServiceAccount> for ServiceAccountTemplate {
    fn desired(&self, cluster: &Cluster) -> ServiceAccount {
        ServiceAccount {
            metadata: child_meta(cluster, "cluster-controller"),
            ..Default::default()
        }
    }
}

pub struct ApiServerServiceTemplate;
impl EnsureResource<Service> for ApiServerServiceTemplate {
    fn desired(&self, cluster: &Cluster) -> Service {
        Service {
            metadata: child_meta(cluster, "apiserver"),
            spec: Some(ServiceSpec {
                selector: Some(child_labels(cluster)),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

pub struct ApiServerDeploymentTemplate;
impl EnsureResource<Deployment> for ApiServerDeploymentTemplate {
    fn desired(&self, cluster: &Cluster) -> Deployment {
        Deployment {
            metadata: child_meta(cluster, "apiserver"),
            spec: Some(DeploymentSpec {
                selector: LabelSelector {
                    match_labels: Some(child_labels(cluster)),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

pub struct EtcdDataVolumeTemplate;
impl EnsureResource<PersistentVolumeClaim> for EtcdDataVolumeTemplate {
    fn desired(&self, cluster: &Cluster) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: child_meta(cluster, "etcd-data"),
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                resources: Some(ResourceRequirements {
                    requests: Some(BTreeMap::from([("storage".to_string(), Quantity("1Gi".to_string()))])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

pub struct EtcdStatefulSetTemplate;
impl EnsureResource<StatefulSet> for EtcdStatefulSetTemplate {
    fn desired(&self, cluster: &Cluster) -> StatefulSet {
        StatefulSet {
            metadata: child_meta(cluster, "etcd"),
            spec: Some(StatefulSetSpec {
                service_name: "etcd".to_string(),
                selector: LabelSelector {
                    match_labels: Some(child_labels(cluster)),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

pub struct IngressTemplate;
impl EnsureResource<Ingress> for IngressTemplate {
    fn desired(&self, cluster: &Cluster) -> Ingress {
        Ingress {
            metadata: child_meta(cluster, "apiserver"),
            ..Default::default()
        }
    }
}

pub struct RoleTemplate;
impl EnsureResource<Role> for RoleTemplate {
    fn desired(&self, cluster: &Cluster) -> Role {
        Role {
            metadata: child_meta(cluster, "cluster-controller"),
            rules: Some(vec![]),
        }
    }
}

pub struct RoleBindingTemplate;
impl EnsureResource<RoleBinding> for RoleBindingTemplate {
    fn desired(&self, cluster: &Cluster) -> RoleBinding {
        RoleBinding {
            metadata: child_meta(cluster, "cluster-controller"),
            role_ref: k8s_openapi::api::rbac::v1::RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "Role".to_string(),
                name: "cluster-controller".to_string(),
            },
            subjects: Some(vec![]),
        }
    }
}

pub struct ClusterRoleBindingTemplate;
impl EnsureResource<ClusterRoleBinding> for ClusterRoleBindingTemplate {
    fn desired(&self, cluster: &Cluster) -> ClusterRoleBinding {
        ClusterRoleBinding {
            metadata: child_meta(cluster, &format!("cluster-controller-{}", cluster.name_any())),
            role_ref: k8s_openapi::api::rbac::v1::RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "ClusterRole".to_string(),
                name: "cluster-controller".to_string(),
            },
            subjects: Some(vec![]),
        }
    }
}

pub struct EtcdClusterTemplate;
impl EnsureResource<EtcdCluster> for EtcdClusterTemplate {
    fn desired(&self, cluster: &Cluster) -> EtcdCluster {
        let mut obj = EtcdCluster::new("etcd", EtcdClusterSpec { size: 3 });
        obj.metadata = child_meta(cluster, "etcd");
        obj
    }
}

/// Creates `desired` if C1 has never seen it, otherwise server-side-applies it
/// (a no-op on the server if nothing actually changed).
pub async fn ensure<K>(api: &Api<K>, cache: &IndexedCache<K>, desired: K) -> crate::error::Result<K>
where
    K: Resource<DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + serde::de::DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    let name = desired.name_any();
    if cache.get(&name).is_none() {
        return Ok(api.create(&PostParams::default(), &desired).await?);
    }
    Ok(api
        .patch(
            &name,
            &PatchParams::apply(MANAGER_NAME).force(),
            &Patch::Apply(&desired),
        )
        .await?)
}

/// Handles to every child-kind `Api`/`IndexedCache` pair the pipeline needs.
pub struct ChildClients {
    pub namespaces: (Api<Namespace>, IndexedCache<Namespace>),
    pub secrets: (Api<Secret>, IndexedCache<Secret>),
    pub config_maps: (Api<ConfigMap>, IndexedCache<ConfigMap>),
    pub service_accounts: (Api<ServiceAccount>, IndexedCache<ServiceAccount>),
    pub services: (Api<Service>, IndexedCache<Service>),
    pub persistent_volume_claims: (Api<PersistentVolumeClaim>, IndexedCache<PersistentVolumeClaim>),
    pub deployments: (Api<Deployment>, IndexedCache<Deployment>),
    pub stateful_sets: (Api<StatefulSet>, IndexedCache<StatefulSet>),
    pub ingresses: (Api<Ingress>, IndexedCache<Ingress>),
    pub roles: (Api<Role>, IndexedCache<Role>),
    pub role_bindings: (Api<RoleBinding>, IndexedCache<RoleBinding>),
    pub cluster_role_bindings: (Api<ClusterRoleBinding>, IndexedCache<ClusterRoleBinding>),
    pub etcd_clusters: (Api<EtcdCluster>, IndexedCache<EtcdCluster>),
}

/// Ensures the namespace, then every templated child kind. Returns whether
/// every child was already present in C1 before this call (i.e. steady),
/// which is this crate's signal to transition Launching -> Running.
pub async fn reconcile_children(
    clients: &ChildClients,
    cluster: &Cluster,
) -> crate::error::Result<bool> {
    let mut all_steady = true;
    let ns_name = namespace_name(cluster);
    all_steady &= clients.namespaces.1.get(&ns_name).is_some();
    ensure(&clients.namespaces.0, &clients.namespaces.1, NamespaceTemplate.desired(cluster)).await?;

    macro_rules! ensure_child {
        ($field:ident, $template:expr) => {{
            let desired = $template.desired(cluster);
            all_steady &= clients.$field.1.get(&desired.name_any()).is_some();
            ensure(&clients.$field.0, &clients.$field.1, desired).await?;
        }};
    }

    ensure_child!(secrets, SecretTemplate);
    ensure_child!(config_maps, ConfigMapTemplate);
    ensure_child!(service_accounts, ServiceAccountTemplate);
    ensure_child!(services, ApiServerServiceTemplate);
    ensure_child!(persistent_volume_claims, EtcdDataVolumeTemplate);
    ensure_child!(deployments, ApiServerDeploymentTemplate);
    ensure_child!(stateful_sets, EtcdStatefulSetTemplate);
    ensure_child!(ingresses, IngressTemplate);
    ensure_child!(roles, RoleTemplate);
    ensure_child!(role_bindings, RoleBindingTemplate);
    ensure_child!(cluster_role_bindings, ClusterRoleBindingTemplate);
    ensure_child!(etcd_clusters, EtcdClusterTemplate);

    Ok(all_steady)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_operator_types::ClusterSpec;

    fn cluster(name: &str) -> Cluster {
        let mut c = Cluster::new(name, ClusterSpec::default());
        c.metadata.uid = Some("11111111-1111-1111-1111-111111111111".to_string());
        c
    }

    #[test]
    fn namespace_name_is_deterministic_per_cluster() {
        let c = cluster("c1");
        assert_eq!(namespace_name(&c), "cluster-c1");
    }

    #[test]
    fn owner_reference_points_at_the_controller_cluster() {
        let c = cluster("c1");
        let owner = owner_reference(&c);
        assert_eq!(owner.kind, "Cluster");
        assert_eq!(owner.name, "c1");
        assert_eq!(owner.controller, Some(true));
    }

    #[test]
    fn templates_place_children_in_the_cluster_namespace() {
        let c = cluster("c1");
        let secret = SecretTemplate.desired(&c);
        assert_eq!(secret.metadata.namespace.as_deref(), Some("cluster-c1"));
        let owners = secret.metadata.owner_references.unwrap();
        assert_eq!(owners[0].name, "c1");
    }
}
