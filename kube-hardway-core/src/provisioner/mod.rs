use std::{collections::BTreeMap, net::Ipv4Addr, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    error::ConfigurationError,
    node::{NodeId, NodeRecord, NodeRecordError, NodeStatus},
    retry::{retry_with_backoff, RetryExhausted, RetryPolicy},
    topology::ClusterTopology,
};

pub mod command;
pub mod plan;
pub mod resources;

pub use command::{ExternalCommandProvider, ProviderCommandConfig};
pub use plan::{
    compute_plan, ObservedResource, ObservedState, Operation, ProvisioningPlan, ResourceStatus,
};
pub use resources::{
    DesiredState, Protocol, ResourceDocument, ResourceKey, ResourceKind, ResourceSpec,
    API_SERVER_PORT,
};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider rejected '{resource}'! {message}")]
    Rejected {
        resource: ResourceKey,
        message: String,
    },
    #[error("Couldn't start provider command '{program}'! {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("Provider command timed out after {}s!", .0.as_secs())]
    Timeout(Duration),
    #[error("Provider command failed with status {status}! {stderr}")]
    CommandFailed { status: i32, stderr: String },
    #[error("Provider returned a malformed response! {}", .0)]
    MalformedResponse(#[from] serde_json::Error),
    #[error("Io error while talking to the provider! {}", .0)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("Couldn't observe the provider state! {}", .0)]
    Observe(RetryExhausted<ProviderError>),
    #[error("Couldn't {operation} '{resource}'! {source}")]
    Resource {
        operation: &'static str,
        resource: ResourceKey,
        node: Option<NodeId>,
        source: RetryExhausted<ProviderError>,
    },
    #[error("Skipped '{resource}', '{blocked_by}' couldn't be provisioned!")]
    Blocked {
        resource: ResourceKey,
        node: Option<NodeId>,
        blocked_by: ResourceKey,
    },
    #[error(transparent)]
    Record(#[from] NodeRecordError),
    #[error("Node '{}' is unknown to both the provider and the cluster state!", .0)]
    UnknownNode(NodeId),
}

impl ProvisioningError {
    /// Node affected by a per-resource failure.
    pub fn node(&self) -> Option<NodeId> {
        match self {
            ProvisioningError::Resource { node, .. } | ProvisioningError::Blocked { node, .. } => {
                *node
            }
            _ => None,
        }
    }
}

/// Cloud resource API, driven with desired-state documents.
///
/// Implementations must scope `observe` to resources of the given cluster and
/// echo back the fingerprint of the last applied document.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn observe(&self, cluster: &str) -> Result<ObservedState, ProviderError>;

    async fn apply(
        &self,
        cluster: &str,
        document: &ResourceDocument,
    ) -> Result<ObservedResource, ProviderError>;

    async fn destroy(&self, cluster: &str, resource: &ObservedResource)
        -> Result<(), ProviderError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerEndpoint {
    pub address: Option<Ipv4Addr>,
    pub dns_name: Option<String>,
    pub port: u16,
}

impl LoadBalancerEndpoint {
    fn from_observed(resource: &ObservedResource) -> Self {
        Self {
            address: resource.public_address.or(resource.private_address),
            dns_name: resource.dns_name.clone(),
            port: API_SERVER_PORT,
        }
    }

    /// Name clients should connect to, preferring DNS.
    pub fn host(&self) -> Option<String> {
        self.dns_name
            .clone()
            .or_else(|| self.address.map(|address| address.to_string()))
    }

    pub fn url(&self) -> Option<String> {
        self.host()
            .map(|host| format!("https://{host}:{}", self.port))
    }
}

#[derive(Debug, Default)]
pub struct ProvisioningOutcome {
    pub records: BTreeMap<NodeId, NodeRecord>,
    pub load_balancer: Option<LoadBalancerEndpoint>,
    /// provider calls made, failed ones included
    pub operations_executed: usize,
    pub failures: Vec<ProvisioningError>,
    pub orphans: Vec<ResourceKey>,
}

impl ProvisioningOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.records.values().all(NodeRecord::is_ready)
    }

    pub fn ready(&self) -> impl Iterator<Item = &NodeRecord> {
        self.records.values().filter(|record| record.is_ready())
    }

    pub fn not_ready(&self) -> impl Iterator<Item = &NodeRecord> {
        self.records.values().filter(|record| !record.is_ready())
    }
}

pub struct Provisioner<P> {
    provider: P,
    retry: RetryPolicy,
}

impl<P: Provider> Provisioner<P> {
    pub fn new(provider: P, retry: RetryPolicy) -> Self {
        Self { provider, retry }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub async fn observe(&self, cluster: &str) -> Result<ObservedState, ProvisioningError> {
        retry_with_backoff(&self.retry, "Observing provider state", || {
            self.provider.observe(cluster)
        })
        .await
        .map_err(ProvisioningError::Observe)
    }

    /// Computes what a reconcile would do without touching anything.
    pub async fn plan(
        &self,
        topology: &ClusterTopology,
    ) -> Result<ProvisioningPlan, ProvisioningError> {
        let desired = DesiredState::for_topology(topology)?;
        let observed = self.observe(&desired.cluster).await?;

        Ok(compute_plan(&desired, &observed))
    }

    /// Converges provider resources to the topology.
    ///
    /// A failed resource doesn't roll back its siblings; it's reported in the
    /// outcome and retried by the next reconcile. Only a failure of a
    /// foundation resource (network, subnet) skips the remaining tiers.
    pub async fn reconcile(
        &self,
        topology: &ClusterTopology,
        existing: &BTreeMap<NodeId, NodeRecord>,
    ) -> Result<ProvisioningOutcome, ProvisioningError> {
        let desired = DesiredState::for_topology(topology)?;
        let cluster = desired.cluster.as_str();

        info!("Observing '{cluster}' cluster resources...");
        let observed = self.observe(cluster).await?;
        let plan = compute_plan(&desired, &observed);

        for orphan in &plan.orphans {
            warn!("'{orphan}' isn't part of the topology anymore, decommission it explicitly to remove it!");
        }

        if plan.is_empty() {
            info!("Cluster resources are up to date");
        } else {
            info!("Executing {} provider operation(s)...", plan.operations.len());
        }

        let mut current = observed.resources;
        let mut outcome = ProvisioningOutcome {
            orphans: plan.orphans.clone(),
            ..Default::default()
        };
        let mut blocked_by = None;

        for stage in plan.stages() {
            if let Some(blocker) = &blocked_by {
                for operation in stage {
                    let resource = operation.key();
                    warn!("Skipping '{resource}', '{blocker}' couldn't be provisioned!");
                    outcome.failures.push(ProvisioningError::Blocked {
                        node: node_of(&resource),
                        resource,
                        blocked_by: ResourceKey::clone(blocker),
                    });
                }

                continue;
            }

            let results = join_all(
                stage
                    .iter()
                    .map(|operation| self.execute(cluster, operation)),
            )
            .await;
            outcome.operations_executed += stage.len();

            for (operation, result) in stage.into_iter().zip(results) {
                let resource = operation.key();

                match result {
                    Ok(Some(applied)) => {
                        current.insert(resource, applied);
                    }
                    Ok(None) => {
                        current.remove(&resource);
                    }
                    Err(source) => {
                        warn!("Couldn't {} '{resource}'! {source}", operation.verb());

                        if resource.kind.is_foundation() && !operation.is_destroy() {
                            blocked_by.get_or_insert_with(|| resource.clone());
                        }

                        outcome.failures.push(ProvisioningError::Resource {
                            operation: operation.verb(),
                            node: node_of(&resource),
                            resource,
                            source,
                        });
                    }
                }
            }
        }

        let failed_nodes = outcome
            .failures
            .iter()
            .filter_map(ProvisioningError::node)
            .collect::<Vec<_>>();

        // records of nodes the topology dropped are kept until decommissioned
        outcome.records = existing.clone();

        for spec in desired.instances() {
            let ResourceSpec::Instance {
                node,
                private_address,
                ..
            } = spec
            else {
                continue;
            };

            let mut observed_record = NodeRecord::new(*node);
            observed_record.updated_at = Utc::now();

            if let Some(resource) = current.get(&spec.key()) {
                observed_record.resource_id = Some(resource.id.clone());
                observed_record.private_address =
                    resource.private_address.or(Some(*private_address));
                observed_record.public_address = resource.public_address;
                observed_record.status = match resource.status {
                    ResourceStatus::Ready => NodeStatus::Ready,
                    ResourceStatus::Pending => NodeStatus::Pending,
                    ResourceStatus::Failed => NodeStatus::Failed,
                };
            }

            if failed_nodes.contains(node) {
                observed_record.status = NodeStatus::Failed;
            }

            outcome
                .records
                .entry(*node)
                .or_insert_with(|| NodeRecord::new(*node))
                .update_from(&observed_record)?;
        }

        outcome.load_balancer = current
            .values()
            .find(|resource| resource.key.kind == ResourceKind::LoadBalancer)
            .map(LoadBalancerEndpoint::from_observed);

        debug!(
            "Provisioning finished: {} ready, {} not ready, {} failure(s)",
            outcome.ready().count(),
            outcome.not_ready().count(),
            outcome.failures.len()
        );

        Ok(outcome)
    }

    /// Destroys a single node's instance and drops its record.
    pub async fn decommission(
        &self,
        cluster: &str,
        node: NodeId,
        records: &mut BTreeMap<NodeId, NodeRecord>,
    ) -> Result<(), ProvisioningError> {
        let key = ResourceKey::instance(&node);
        let observed = self.observe(cluster).await?;

        match observed.get(&key) {
            Some(resource) => {
                info!("Decommissioning '{node}' instance...");

                retry_with_backoff(&self.retry, &format!("Destroying '{key}'"), || {
                    self.provider.destroy(cluster, resource)
                })
                .await
                .map_err(|source| ProvisioningError::Resource {
                    operation: "destroy",
                    resource: key.clone(),
                    node: Some(node),
                    source,
                })?;
            }
            None if records.contains_key(&node) => {
                warn!("'{node}' has no instance anymore, dropping its record...");
            }
            None => return Err(ProvisioningError::UnknownNode(node)),
        }

        records.remove(&node);

        Ok(())
    }

    async fn execute(
        &self,
        cluster: &str,
        operation: &Operation,
    ) -> Result<Option<ObservedResource>, RetryExhausted<ProviderError>> {
        let name = operation.to_string();

        match operation {
            Operation::Create(spec) => {
                info!("Creating '{}'...", spec.key());
                let document = ResourceDocument::new(spec.clone(), None);

                retry_with_backoff(&self.retry, &name, || {
                    self.provider.apply(cluster, &document)
                })
                .await
                .map(Some)
            }
            Operation::Update { spec, existing_id } => {
                info!("Updating '{}'...", spec.key());
                let document = ResourceDocument::new(spec.clone(), Some(existing_id.clone()));

                retry_with_backoff(&self.retry, &name, || {
                    self.provider.apply(cluster, &document)
                })
                .await
                .map(Some)
            }
            Operation::Destroy(resource) => {
                info!("Destroying stale '{}'...", resource.key);

                retry_with_backoff(&self.retry, &name, || {
                    self.provider.destroy(cluster, resource)
                })
                .await
                .map(|_| None)
            }
        }
    }
}

fn node_of(resource: &ResourceKey) -> Option<NodeId> {
    match resource.kind {
        ResourceKind::Instance => resource.name.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, time::Duration};

    use crate::{
        node::{NodeId, NodeStatus},
        retry::RetryPolicy,
        testing::FakeProvider,
        topology::{tests::sample_topology, NodeRole},
    };

    use super::{
        Provisioner, ProvisioningError, ResourceKey, ResourceKind, API_SERVER_PORT,
    };

    fn provisioner(provider: FakeProvider) -> Provisioner<FakeProvider> {
        Provisioner::new(provider, RetryPolicy::fixed(2, Duration::from_millis(10)))
    }

    #[tokio::test(start_paused = true)]
    async fn first_reconcile_provisions_every_node() {
        let provisioner = provisioner(FakeProvider::default());

        let outcome = provisioner
            .reconcile(&sample_topology(), &BTreeMap::new())
            .await
            .unwrap();

        assert!(outcome.is_complete());
        assert_eq!(outcome.records.len(), 9);
        let worker = &outcome.records[&NodeId::new(NodeRole::Worker, 2)];
        assert_eq!(worker.private_address, Some("10.43.0.34".parse().unwrap()));
        assert!(worker.public_address.is_some());
        assert!(worker.resource_id.is_some());

        let endpoint = outcome.load_balancer.unwrap();
        assert_eq!(endpoint.port, API_SERVER_PORT);
        assert!(endpoint.url().unwrap().starts_with("https://"));
    }

    #[tokio::test(start_paused = true)]
    async fn second_reconcile_performs_no_operations() {
        let provisioner = provisioner(FakeProvider::default());
        let topology = sample_topology();

        let first = provisioner
            .reconcile(&topology, &BTreeMap::new())
            .await
            .unwrap();
        let mutations = provisioner.provider().mutations();

        let second = provisioner
            .reconcile(&topology, &first.records)
            .await
            .unwrap();

        assert!(first.operations_executed > 0);
        assert_eq!(second.operations_executed, 0);
        assert_eq!(provisioner.provider().mutations(), mutations);
        assert_eq!(
            first
                .records
                .values()
                .map(|record| (record.id, record.private_address, record.resource_id.clone()))
                .collect::<Vec<_>>(),
            second
                .records
                .values()
                .map(|record| (record.id, record.private_address, record.resource_id.clone()))
                .collect::<Vec<_>>()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_node_does_not_roll_back_siblings() {
        let provider = FakeProvider::default();
        provider.fail_apply("worker-1", u32::MAX);
        let provisioner = provisioner(provider);

        let outcome = provisioner
            .reconcile(&sample_topology(), &BTreeMap::new())
            .await
            .unwrap();

        assert!(!outcome.is_complete());
        assert_eq!(outcome.ready().count(), 8);
        assert_eq!(
            outcome.records[&NodeId::new(NodeRole::Worker, 1)].status,
            NodeStatus::Failed
        );
        assert!(matches!(
            &outcome.failures[..],
            [ProvisioningError::Resource { node: Some(node), .. }] if node.to_string() == "worker-1"
        ));
        assert!(outcome.load_balancer.is_some());

        // a retry picks up exactly the missing node
        provisioner.provider().clear_failures();
        let retried = provisioner
            .reconcile(&sample_topology(), &outcome.records)
            .await
            .unwrap();

        assert!(retried.is_complete());
        assert_eq!(retried.operations_executed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_provider_errors_are_retried() {
        let provider = FakeProvider::default();
        provider.fail_apply("controller-0", 1);
        let provisioner = provisioner(provider);

        let outcome = provisioner
            .reconcile(&sample_topology(), &BTreeMap::new())
            .await
            .unwrap();

        assert!(outcome.is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn network_failure_skips_everything_built_on_it() {
        let provider = FakeProvider::default();
        provider.fail_apply("hardway", u32::MAX);
        let provisioner = provisioner(provider);

        let outcome = provisioner
            .reconcile(&sample_topology(), &BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(outcome.operations_executed, 1);
        assert_eq!(outcome.ready().count(), 0);
        assert!(outcome
            .failures
            .iter()
            .skip(1)
            .all(|failure| matches!(failure, ProvisioningError::Blocked { blocked_by, .. }
                if *blocked_by == ResourceKey::new(ResourceKind::Network, "hardway"))));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_topology_is_rejected_before_any_provider_call() {
        let provisioner = provisioner(FakeProvider::default());
        let mut topology = sample_topology();
        topology.controller.address_range = "10.43.0.16/28".parse().unwrap();

        let result = provisioner.reconcile(&topology, &BTreeMap::new()).await;

        assert!(matches!(result, Err(ProvisioningError::Configuration(_))));
        assert_eq!(provisioner.provider().calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn decommission_destroys_instance_and_drops_record() {
        let provisioner = provisioner(FakeProvider::default());
        let mut topology = sample_topology();
        let outcome = provisioner
            .reconcile(&topology, &BTreeMap::new())
            .await
            .unwrap();
        let mut records = outcome.records;
        let node = NodeId::new(NodeRole::Worker, 2);

        topology.worker.count = 2;
        let shrunk = provisioner.reconcile(&topology, &records).await.unwrap();

        assert_eq!(
            shrunk.orphans,
            vec![ResourceKey::new(ResourceKind::Instance, "worker-2")]
        );
        assert!(shrunk.records.contains_key(&node));

        provisioner
            .decommission("hardway", node, &mut records)
            .await
            .unwrap();

        assert!(!records.contains_key(&node));
        assert!(matches!(
            provisioner
                .decommission("hardway", node, &mut records)
                .await,
            Err(ProvisioningError::UnknownNode(_))
        ));
    }
}
