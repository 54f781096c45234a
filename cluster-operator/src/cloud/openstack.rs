use super::{swallow_not_found, CloudError, CloudResult};
use crate::error::Result;
use crate::finalizer;
use crate::patch::Persister;
use async_trait::async_trait;
use cluster_operator_types::{finalizers, Cluster, DatacenterMeta};

/// The opaque OpenStack collaborator: authentication, and the small set of
/// list/create/delete calls the bootstrap/cleanup script needs. Schema and wire
/// format of the underlying REST API are out of scope; only this seam matters.
#[async_trait]
pub trait OpenstackApi: Send + Sync {
    async fn get_external_network(&self, dc: &DatacenterMeta) -> CloudResult<String>;
    async fn create_security_group(&self, dc: &DatacenterMeta, cluster: &str) -> CloudResult<String>;
    async fn create_network(&self, dc: &DatacenterMeta, cluster: &str) -> CloudResult<String>;
    async fn get_network_by_name(&self, dc: &DatacenterMeta, name: &str) -> CloudResult<String>;
    async fn create_subnet(
        &self,
        dc: &DatacenterMeta,
        cluster: &str,
        network_id: &str,
        dns_servers: &[String],
    ) -> CloudResult<String>;
    async fn get_router_id_for_subnet(
        &self,
        dc: &DatacenterMeta,
        subnet_id: &str,
    ) -> CloudResult<Option<String>>;
    async fn create_router(
        &self,
        dc: &DatacenterMeta,
        cluster: &str,
        floating_ip_pool: &str,
    ) -> CloudResult<String>;
    async fn attach_subnet_to_router(
        &self,
        dc: &DatacenterMeta,
        router_id: &str,
        subnet_id: &str,
    ) -> CloudResult<()>;

    async fn delete_security_groups(&self, dc: &DatacenterMeta, names: &[String]) -> CloudResult<()>;
    async fn detach_subnet_from_router(
        &self,
        dc: &DatacenterMeta,
        router_id: &str,
        subnet_id: &str,
    ) -> CloudResult<()>;
    async fn delete_subnet(&self, dc: &DatacenterMeta, subnet_id: &str) -> CloudResult<()>;
    async fn delete_network(&self, dc: &DatacenterMeta, network_id: &str) -> CloudResult<()>;
    async fn delete_router(&self, dc: &DatacenterMeta, router_id: &str) -> CloudResult<()>;
}

/// Production implementation backed by `reqwest` against Neutron-style endpoints
/// hung off `DatacenterMeta::auth_url`. Request/response shapes are deliberately
/// thin: the wire format of this API is explicitly out of scope.
pub struct ReqwestOpenstackApi {
    client: reqwest::Client,
}

impl ReqwestOpenstackApi {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, dc: &DatacenterMeta, path: &str) -> String {
        format!("{}/v2.0/{path}", dc.auth_url.trim_end_matches('/'))
    }

    async fn get_json(&self, url: &str) -> CloudResult<serde_json::Value> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CloudError::Other(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CloudError::NotFound);
        }
        resp.json()
            .await
            .map_err(|e| CloudError::Other(e.to_string()))
    }
}

impl Default for ReqwestOpenstackApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OpenstackApi for ReqwestOpenstackApi {
    async fn get_external_network(&self, dc: &DatacenterMeta) -> CloudResult<String> {
        let body = self.get_json(&self.endpoint(dc, "networks?router:external=true")).await?;
        body["networks"][0]["name"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| CloudError::Other("no external network configured for datacenter".into()))
    }

    async fn create_security_group(&self, dc: &DatacenterMeta, cluster: &str) -> CloudResult<String> {
        let name = format!("kubermatic-{cluster}");
        self.client
            .post(self.endpoint(dc, "security-groups"))
            .json(&serde_json::json!({"security_group": {"name": name}}))
            .send()
            .await
            .map_err(|e| CloudError::Other(e.to_string()))?;
        Ok(name)
    }

    async fn create_network(&self, dc: &DatacenterMeta, cluster: &str) -> CloudResult<String> {
        let name = format!("kubermatic-{cluster}");
        self.client
            .post(self.endpoint(dc, "networks"))
            .json(&serde_json::json!({"network": {"name": name}}))
            .send()
            .await
            .map_err(|e| CloudError::Other(e.to_string()))?;
        Ok(name)
    }

    async fn get_network_by_name(&self, dc: &DatacenterMeta, name: &str) -> CloudResult<String> {
        let body = self
            .get_json(&self.endpoint(dc, &format!("networks?name={name}")))
            .await?;
        body["networks"][0]["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| CloudError::NotFound)
    }

    async fn create_subnet(
        &self,
        dc: &DatacenterMeta,
        cluster: &str,
        network_id: &str,
        dns_servers: &[String],
    ) -> CloudResult<String> {
        let resp = self
            .client
            .post(self.endpoint(dc, "subnets"))
            .json(&serde_json::json!({"subnet": {
                "name": format!("kubermatic-{cluster}"),
                "network_id": network_id,
                "dns_nameservers": dns_servers,
                "ip_version": 4,
            }}))
            .send()
            .await
            .map_err(|e| CloudError::Other(e.to_string()))?;
        let body: serde_json::Value = resp.json().await.map_err(|e| CloudError::Other(e.to_string()))?;
        body["subnet"]["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| CloudError::Other("subnet create response missing id".into()))
    }

    async fn get_router_id_for_subnet(
        &self,
        dc: &DatacenterMeta,
        subnet_id: &str,
    ) -> CloudResult<Option<String>> {
        match self
            .get_json(&self.endpoint(dc, &format!("ports?device_owner=network:router_interface&fixed_ips=subnet_id%3D{subnet_id}")))
            .await
        {
            Ok(body) => Ok(body["ports"][0]["device_id"].as_str().map(str::to_string)),
            Err(CloudError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_router(
        &self,
        dc: &DatacenterMeta,
        cluster: &str,
        floating_ip_pool: &str,
    ) -> CloudResult<String> {
        let resp = self
            .client
            .post(self.endpoint(dc, "routers"))
            .json(&serde_json::json!({"router": {
                "name": format!("kubermatic-{cluster}"),
                "external_gateway_info": {"network_id": floating_ip_pool},
            }}))
            .send()
            .await
            .map_err(|e| CloudError::Other(e.to_string()))?;
        let body: serde_json::Value = resp.json().await.map_err(|e| CloudError::Other(e.to_string()))?;
        body["router"]["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| CloudError::Other("router create response missing id".into()))
    }

    async fn attach_subnet_to_router(
        &self,
        dc: &DatacenterMeta,
        router_id: &str,
        subnet_id: &str,
    ) -> CloudResult<()> {
        self.client
            .put(self.endpoint(dc, &format!("routers/{router_id}/add_router_interface")))
            .json(&serde_json::json!({"subnet_id": subnet_id}))
            .send()
            .await
            .map_err(|e| CloudError::Other(e.to_string()))?;
        Ok(())
    }

    async fn delete_security_groups(&self, dc: &DatacenterMeta, names: &[String]) -> CloudResult<()> {
        for name in names {
            let url = self.endpoint(dc, &format!("security-groups/{name}"));
            let resp = self
                .client
                .delete(&url)
                .send()
                .await
                .map_err(|e| CloudError::Other(e.to_string()))?;
            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                continue;
            }
        }
        Ok(())
    }

    async fn detach_subnet_from_router(
        &self,
        dc: &DatacenterMeta,
        router_id: &str,
        subnet_id: &str,
    ) -> CloudResult<()> {
        let resp = self
            .client
            .put(self.endpoint(dc, &format!("routers/{router_id}/remove_router_interface")))
            .json(&serde_json::json!({"subnet_id": subnet_id}))
            .send()
            .await
            .map_err(|e| CloudError::Other(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CloudError::NotFound);
        }
        Ok(())
    }

    async fn delete_subnet(&self, dc: &DatacenterMeta, subnet_id: &str) -> CloudResult<()> {
        let resp = self
            .client
            .delete(self.endpoint(dc, &format!("subnets/{subnet_id}")))
            .send()
            .await
            .map_err(|e| CloudError::Other(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CloudError::NotFound);
        }
        Ok(())
    }

    async fn delete_network(&self, dc: &DatacenterMeta, network_id: &str) -> CloudResult<()> {
        let resp = self
            .client
            .delete(self.endpoint(dc, &format!("networks/{network_id}")))
            .send()
            .await
            .map_err(|e| CloudError::Other(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CloudError::NotFound);
        }
        Ok(())
    }

    async fn delete_router(&self, dc: &DatacenterMeta, router_id: &str) -> CloudResult<()> {
        let resp = self
            .client
            .delete(self.endpoint(dc, &format!("routers/{router_id}")))
            .send()
            .await
            .map_err(|e| CloudError::Other(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CloudError::NotFound);
        }
        Ok(())
    }
}

/// Runs the six-step bootstrap script described in §4.8, persisting each step's
/// identifier + finalizer via a single C4 update before moving to the next, so a
/// crash mid-script leaves a durable, resumable todo.
pub async fn bootstrap(
    cloud_api: &dyn OpenstackApi,
    dc: &DatacenterMeta,
    persister: &dyn Persister<Cluster>,
    start: &Cluster,
) -> Result<Cluster> {
    let name = start.metadata.name.clone().unwrap_or_default();
    let mut current = start.clone();

    // 1. Floating IP pool: read-only, no finalizer.
    if openstack_of(&current).floating_ip_pool.is_empty() {
        let pool = cloud_api.get_external_network(dc).await?;
        current = apply_step(persister, &name, &current, |s| {
            s.floating_ip_pool = pool.clone();
        })
        .await?;
    }

    // 2. Security group.
    if openstack_of(&current).security_groups.is_empty() {
        let sg = cloud_api.create_security_group(dc, &name).await?;
        current = apply_step_with_finalizer(persister, &name, &current, finalizers::SECURITY_GROUP, |s| {
            s.security_groups = sg.clone();
        })
        .await?;
    }

    // 3. Network.
    if openstack_of(&current).network.is_empty() {
        let net = cloud_api.create_network(dc, &name).await?;
        current = apply_step_with_finalizer(persister, &name, &current, finalizers::NETWORK, |s| {
            s.network = net.clone();
        })
        .await?;
    }
    let network_id = cloud_api
        .get_network_by_name(dc, &openstack_of(&current).network)
        .await?;

    // 4. Subnet.
    if openstack_of(&current).subnet_id.is_empty() {
        let subnet = cloud_api
            .create_subnet(dc, &name, &network_id, &dc.dns_servers)
            .await?;
        current = apply_step_with_finalizer(persister, &name, &current, finalizers::SUBNET, |s| {
            s.subnet_id = subnet.clone();
        })
        .await?;
    }

    // 5. Router: reuse an existing attachment, or create one of our own.
    if openstack_of(&current).router_id.is_empty() {
        let subnet_id = openstack_of(&current).subnet_id.clone();
        match cloud_api.get_router_id_for_subnet(dc, &subnet_id).await? {
            Some(router_id) => {
                current = apply_step(persister, &name, &current, |s| {
                    s.router_id = router_id.clone();
                })
                .await?;
            }
            None => {
                let floating_ip_pool = openstack_of(&current).floating_ip_pool.clone();
                let router_id = cloud_api.create_router(dc, &name, &floating_ip_pool).await?;
                current =
                    apply_step_with_finalizer(persister, &name, &current, finalizers::ROUTER, |s| {
                        s.router_id = router_id.clone();
                    })
                    .await?;
            }
        }
    }

    // 6. Router <-> subnet link, owned iff this process created the subnet
    // (the v2 design's resolution of the Open Question in spec §9: a single
    // legacy finalizer conflated reuse and create semantics).
    let finalizers_now = current.metadata.finalizers.clone().unwrap_or_default();
    if finalizer::has(&finalizers_now, finalizers::SUBNET)
        && !finalizer::has(&finalizers_now, finalizers::ROUTER_SUBNET_LINK)
    {
        let router_id = openstack_of(&current).router_id.clone();
        let subnet_id = openstack_of(&current).subnet_id.clone();
        cloud_api
            .attach_subnet_to_router(dc, &router_id, &subnet_id)
            .await?;
        current = apply_finalizer_only(persister, &name, &current, finalizers::ROUTER_SUBNET_LINK, true)
            .await?;
    }

    Ok(current)
}

/// Reverse-order teardown, gated by finalizer presence (the legacy aggregate
/// token satisfies every v2 gate, per §4.8).
pub async fn cleanup(
    cloud_api: &dyn OpenstackApi,
    dc: &DatacenterMeta,
    persister: &dyn Persister<Cluster>,
    start: &Cluster,
) -> Result<Cluster> {
    let name = start.metadata.name.clone().unwrap_or_default();
    let mut current = start.clone();

    let guarded = |c: &Cluster, token: &str| {
        let f = c.metadata.finalizers.clone().unwrap_or_default();
        finalizer::has(&f, token) || finalizer::has(&f, finalizers::LEGACY_AGGREGATE)
    };

    if guarded(&current, finalizers::SECURITY_GROUP) {
        let names: Vec<String> = openstack_of(&current)
            .security_groups
            .split(',')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        swallow_not_found(cloud_api.delete_security_groups(dc, &names).await.map(|_| ()))?;
        current =
            apply_finalizer_only(persister, &name, &current, finalizers::SECURITY_GROUP, false).await?;
    }

    if guarded(&current, finalizers::ROUTER_SUBNET_LINK) {
        let router_id = openstack_of(&current).router_id.clone();
        let subnet_id = openstack_of(&current).subnet_id.clone();
        swallow_not_found(
            cloud_api
                .detach_subnet_from_router(dc, &router_id, &subnet_id)
                .await,
        )?;
        current =
            apply_finalizer_only(persister, &name, &current, finalizers::ROUTER_SUBNET_LINK, false)
                .await?;
    }

    if guarded(&current, finalizers::SUBNET) {
        let subnet_id = openstack_of(&current).subnet_id.clone();
        swallow_not_found(cloud_api.delete_subnet(dc, &subnet_id).await)?;
        current = apply_finalizer_only(persister, &name, &current, finalizers::SUBNET, false).await?;
    }

    if guarded(&current, finalizers::NETWORK) {
        match cloud_api.get_network_by_name(dc, &openstack_of(&current).network).await {
            Ok(network_id) => {
                swallow_not_found(cloud_api.delete_network(dc, &network_id).await)?;
            }
            Err(CloudError::NotFound) => {}
            Err(err) => return Err(err.into()),
        }
        current = apply_finalizer_only(persister, &name, &current, finalizers::NETWORK, false).await?;
    }

    if guarded(&current, finalizers::ROUTER) {
        let router_id = openstack_of(&current).router_id.clone();
        swallow_not_found(cloud_api.delete_router(dc, &router_id).await)?;
        current = apply_finalizer_only(persister, &name, &current, finalizers::ROUTER, false).await?;
    }

    let finalizers_now = current.metadata.finalizers.clone().unwrap_or_default();
    if finalizer::has(&finalizers_now, finalizers::LEGACY_AGGREGATE) {
        current =
            apply_finalizer_only(persister, &name, &current, finalizers::LEGACY_AGGREGATE, false)
                .await?;
    }

    Ok(current)
}

fn openstack_of(c: &Cluster) -> cluster_operator_types::OpenstackCloudSpec {
    c.spec.cloud.openstack.clone().unwrap_or_default()
}

async fn apply_step(
    persister: &dyn Persister<Cluster>,
    name: &str,
    current: &Cluster,
    mutate: impl FnOnce(&mut cluster_operator_types::OpenstackCloudSpec),
) -> Result<Cluster> {
    let mut modified = current.clone();
    let mut os = modified.spec.cloud.openstack.clone().unwrap_or_default();
    mutate(&mut os);
    modified.spec.cloud.openstack = Some(os);
    persister.update(name, current, &modified).await
}

async fn apply_step_with_finalizer(
    persister: &dyn Persister<Cluster>,
    name: &str,
    current: &Cluster,
    token: &str,
    mutate: impl FnOnce(&mut cluster_operator_types::OpenstackCloudSpec),
) -> Result<Cluster> {
    let mut modified = current.clone();
    let mut os = modified.spec.cloud.openstack.clone().unwrap_or_default();
    mutate(&mut os);
    modified.spec.cloud.openstack = Some(os);
    let mut f = modified.metadata.finalizers.clone().unwrap_or_default();
    finalizer::add(&mut f, token);
    modified.metadata.finalizers = Some(f);
    persister.update(name, current, &modified).await
}

async fn apply_finalizer_only(
    persister: &dyn Persister<Cluster>,
    name: &str,
    current: &Cluster,
    token: &str,
    add: bool,
) -> Result<Cluster> {
    let mut modified = current.clone();
    let mut f = modified.metadata.finalizers.clone().unwrap_or_default();
    if add {
        finalizer::add(&mut f, token);
    } else {
        finalizer::remove(&mut f, token);
    }
    modified.metadata.finalizers = Some(f);
    persister.update(name, current, &modified).await
}

pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    /// Deterministic in-memory fake of the OpenStack collaborator, used by tests
    /// exercising the bootstrap/cleanup scripts without a live tenant.
    #[derive(Default)]
    pub struct FakeOpenstackApi {
        pub networks: Mutex<HashMap<String, String>>,
        pub subnets: Mutex<HashMap<String, String>>,
        pub routers: Mutex<HashMap<String, String>>,
        pub router_subnet_links: Mutex<HashMap<String, String>>,
        pub security_groups: Mutex<Vec<String>>,
        pub next_id: Mutex<u64>,
    }

    impl FakeOpenstackApi {
        pub fn new() -> Self {
            Self::default()
        }

        async fn fresh_id(&self, prefix: &str) -> String {
            let mut n = self.next_id.lock().await;
            *n += 1;
            format!("{prefix}-{n}")
        }

        pub async fn is_empty(&self) -> bool {
            self.networks.lock().await.is_empty()
                && self.subnets.lock().await.is_empty()
                && self.routers.lock().await.is_empty()
                && self.router_subnet_links.lock().await.is_empty()
                && self.security_groups.lock().await.is_empty()
        }
    }

    #[async_trait]
    impl OpenstackApi for FakeOpenstackApi {
        async fn get_external_network(&self, _dc: &DatacenterMeta) -> CloudResult<String> {
            Ok("ext-net".to_string())
        }

        async fn create_security_group(&self, _dc: &DatacenterMeta, cluster: &str) -> CloudResult<String> {
            let name = format!("kubermatic-{cluster}");
            self.security_groups.lock().await.push(name.clone());
            Ok(name)
        }

        async fn create_network(&self, _dc: &DatacenterMeta, cluster: &str) -> CloudResult<String> {
            let name = format!("kubermatic-{cluster}");
            let id = self.fresh_id("net").await;
            self.networks.lock().await.insert(name.clone(), id);
            Ok(name)
        }

        async fn get_network_by_name(&self, _dc: &DatacenterMeta, name: &str) -> CloudResult<String> {
            self.networks
                .lock()
                .await
                .get(name)
                .cloned()
                .ok_or(CloudError::NotFound)
        }

        async fn create_subnet(
            &self,
            _dc: &DatacenterMeta,
            _cluster: &str,
            network_id: &str,
            _dns_servers: &[String],
        ) -> CloudResult<String> {
            let id = self.fresh_id("subnet").await;
            self.subnets.lock().await.insert(id.clone(), network_id.to_string());
            Ok(id)
        }

        async fn get_router_id_for_subnet(
            &self,
            _dc: &DatacenterMeta,
            subnet_id: &str,
        ) -> CloudResult<Option<String>> {
            Ok(self.router_subnet_links.lock().await.get(subnet_id).cloned())
        }

        async fn create_router(
            &self,
            _dc: &DatacenterMeta,
            cluster: &str,
            _floating_ip_pool: &str,
        ) -> CloudResult<String> {
            let id = self.fresh_id("router").await;
            self.routers.lock().await.insert(id.clone(), cluster.to_string());
            Ok(id)
        }

        async fn attach_subnet_to_router(
            &self,
            _dc: &DatacenterMeta,
            router_id: &str,
            subnet_id: &str,
        ) -> CloudResult<()> {
            self.router_subnet_links
                .lock()
                .await
                .insert(subnet_id.to_string(), router_id.to_string());
            Ok(())
        }

        async fn delete_security_groups(&self, _dc: &DatacenterMeta, names: &[String]) -> CloudResult<()> {
            let mut sgs = self.security_groups.lock().await;
            sgs.retain(|sg| !names.contains(sg));
            Ok(())
        }

        async fn detach_subnet_from_router(
            &self,
            _dc: &DatacenterMeta,
            _router_id: &str,
            subnet_id: &str,
        ) -> CloudResult<()> {
            if self.router_subnet_links.lock().await.remove(subnet_id).is_none() {
                return Err(CloudError::NotFound);
            }
            Ok(())
        }

        async fn delete_subnet(&self, _dc: &DatacenterMeta, subnet_id: &str) -> CloudResult<()> {
            if self.subnets.lock().await.remove(subnet_id).is_none() {
                return Err(CloudError::NotFound);
            }
            Ok(())
        }

        async fn delete_network(&self, _dc: &DatacenterMeta, network_id: &str) -> CloudResult<()> {
            let mut nets = self.networks.lock().await;
            let before = nets.len();
            nets.retain(|_, id| id != network_id);
            if nets.len() == before {
                return Err(CloudError::NotFound);
            }
            Ok(())
        }

        async fn delete_router(&self, _dc: &DatacenterMeta, router_id: &str) -> CloudResult<()> {
            if self.routers.lock().await.remove(router_id).is_none() {
                return Err(CloudError::NotFound);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeOpenstackApi;
    use super::*;
    use crate::patch::test_support::InMemoryPersister;
    use cluster_operator_types::ClusterSpec;

    fn empty_cluster(name: &str) -> Cluster {
        let mut c = Cluster::new(name, ClusterSpec::default());
        c.spec.cloud.datacenter_name = "dc1".into();
        c.spec.cloud.openstack = Some(Default::default());
        c
    }

    fn dc() -> DatacenterMeta {
        DatacenterMeta {
            auth_url: "https://example.invalid".into(),
            region: "region1".into(),
            dns_servers: vec!["1.1.1.1".into()],
        }
    }

    #[tokio::test]
    async fn bootstrap_populates_every_identifier_and_v2_finalizer() {
        let api = FakeOpenstackApi::new();
        let persister: InMemoryPersister<Cluster> = InMemoryPersister::new();
        let start = empty_cluster("c1");

        let result = bootstrap(&api, &dc(), &persister, &start).await.unwrap();

        let os = openstack_of(&result);
        assert!(!os.floating_ip_pool.is_empty());
        assert!(!os.security_groups.is_empty());
        assert!(!os.network.is_empty());
        assert!(!os.subnet_id.is_empty());
        assert!(!os.router_id.is_empty());

        let f = result.metadata.finalizers.unwrap_or_default();
        for token in [
            finalizers::SECURITY_GROUP,
            finalizers::NETWORK,
            finalizers::SUBNET,
            finalizers::ROUTER,
            finalizers::ROUTER_SUBNET_LINK,
        ] {
            assert!(finalizer::has(&f, token), "missing {token}");
        }
    }

    #[tokio::test]
    async fn bootstrap_then_cleanup_restores_empty_cloud_state() {
        let api = FakeOpenstackApi::new();
        let persister: InMemoryPersister<Cluster> = InMemoryPersister::new();
        let start = empty_cluster("c1");

        let bootstrapped = bootstrap(&api, &dc(), &persister, &start).await.unwrap();
        let cleaned = cleanup(&api, &dc(), &persister, &bootstrapped).await.unwrap();

        assert!(api.is_empty().await);
        assert!(cleaned.metadata.finalizers.unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn legacy_aggregate_finalizer_alone_still_drives_full_cleanup() {
        let api = FakeOpenstackApi::new();
        let persister: InMemoryPersister<Cluster> = InMemoryPersister::new();
        let start = empty_cluster("c1");
        let bootstrapped = bootstrap(&api, &dc(), &persister, &start).await.unwrap();

        // Simulate a pre-migration record: only the deprecated aggregate token.
        let mut legacy = bootstrapped.clone();
        legacy.metadata.finalizers = Some(vec![finalizers::LEGACY_AGGREGATE.to_string()]);

        let cleaned = cleanup(&api, &dc(), &persister, &legacy).await.unwrap();

        assert!(api.is_empty().await);
        assert!(cleaned.metadata.finalizers.unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn router_is_reused_without_a_finalizer_when_already_attached() {
        let api = FakeOpenstackApi::new();
        let persister: InMemoryPersister<Cluster> = InMemoryPersister::new();
        let mut start = empty_cluster("c1");

        // Pre-seed a subnet with a router already attached, as if another
        // process created it outside this reconciler's bootstrap.
        let net_name = api.create_network(&dc(), "c1").await.unwrap();
        let net_id = api.get_network_by_name(&dc(), &net_name).await.unwrap();
        let subnet_id = api
            .create_subnet(&dc(), "c1", &net_id, &[])
            .await
            .unwrap();
        let router_id = api
            .create_router(&dc(), "c1", "ext-net")
            .await
            .unwrap();
        api.attach_subnet_to_router(&dc(), &router_id, &subnet_id)
            .await
            .unwrap();

        start.spec.cloud.openstack.as_mut().unwrap().network = net_name;
        start.spec.cloud.openstack.as_mut().unwrap().subnet_id = subnet_id;
        start.metadata.finalizers = Some(vec![
            finalizers::NETWORK.to_string(),
            finalizers::SUBNET.to_string(),
        ]);

        let result = bootstrap(&api, &dc(), &persister, &start).await.unwrap();

        assert_eq!(openstack_of(&result).router_id, router_id);
        let f = result.metadata.finalizers.unwrap_or_default();
        assert!(!finalizer::has(&f, finalizers::ROUTER));
        assert!(finalizer::has(&f, finalizers::ROUTER_SUBNET_LINK));
    }
}
