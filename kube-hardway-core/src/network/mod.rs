use std::{collections::BTreeMap, net::Ipv4Addr, path::PathBuf, time::Duration};

use async_trait::async_trait;
use futures::{future::join_all, FutureExt};
use ipnet::Ipv4Net;
use itertools::{Either, Itertools};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::{
    execution::{ExecutionError, RemoteExecutor},
    installer::{
        tasks::Task,
        units::{render_cni_bridge, CNI_CONFIG_DIRECTORY},
    },
    inventory::{InventoryGroup, InventoryHost},
    node::NodeId,
    retry::duration_secs,
    topology::ClusterTopology,
};

pub mod routes;

pub use routes::{compute_masquerade, compute_routes, MasqueradeRule, PodRoute};

pub const CNI_BRIDGE_FILENAME: &str = "10-bridge.conf";

/// Pod subnet the control plane handed out to a node, if any yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSubnetAssignment {
    pub node: String,
    pub address: Option<Ipv4Addr>,
    pub pod_subnet: Option<Ipv4Net>,
}

/// Control-plane view of the per-node pod subnets.
#[async_trait]
pub trait PodSubnetSource: Send + Sync {
    async fn assignments(&self) -> anyhow::Result<Vec<PodSubnetAssignment>>;
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Pod subnets weren't assigned in time to: {}", join_nodes(.unassigned))]
    ReconciliationTimeout {
        unassigned: Vec<NodeId>,
        report: Box<NetworkReport>,
    },
    #[error("Couldn't configure pod networking on {}!", join_failures(.failures))]
    Apply {
        failures: Vec<(NodeId, ExecutionError)>,
    },
}

fn join_nodes(nodes: &[NodeId]) -> String {
    nodes.iter().join(", ")
}

fn join_failures(failures: &[(NodeId, ExecutionError)]) -> String {
    failures
        .iter()
        .map(|(node, error)| format!("'{node}' ({error})"))
        .join(", ")
}

/// Every host runs to completion, failures are reported together.
fn collect_host_results<T>(
    results: Vec<(NodeId, Result<T, ExecutionError>)>,
) -> Result<Vec<T>, NetworkError> {
    let (outputs, failures): (Vec<_>, Vec<_>) = results
        .into_iter()
        .partition_map(|(node, result)| match result {
            Ok(output) => Either::Left(output),
            Err(error) => Either::Right((node, error)),
        });

    if failures.is_empty() {
        Ok(outputs)
    } else {
        Err(NetworkError::Apply { failures })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkConfig {
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// interface masqueraded traffic leaves through
    pub external_interface: String,
    /// removes gateway routes to pod subnets that no longer exist
    pub prune_stale_routes: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(300),
            external_interface: "eth0".to_owned(),
            prune_stale_routes: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReconcilerState {
    #[default]
    AwaitingAssignments,
    RoutesInstalled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkReport {
    pub state: ReconcilerState,
    pub assignments: BTreeMap<NodeId, Ipv4Net>,
    pub unassigned: Vec<NodeId>,
    pub routes: Vec<PodRoute>,
    pub masquerade: Vec<MasqueradeRule>,
    pub pruned: Vec<(NodeId, Ipv4Net)>,
}

pub struct NetworkReconciler<'a, E: ?Sized, S: ?Sized> {
    executor: &'a E,
    source: &'a S,
    config: &'a NetworkConfig,
}

impl<'a, E, S> NetworkReconciler<'a, E, S>
where
    E: RemoteExecutor + ?Sized,
    S: PodSubnetSource + ?Sized,
{
    pub fn new(executor: &'a E, source: &'a S, config: &'a NetworkConfig) -> Self {
        Self {
            executor,
            source,
            config,
        }
    }

    /// Waits for pod subnets, then installs routes and masquerading on every worker.
    ///
    /// On timeout routes are still installed among the nodes that did get a
    /// subnet, the rest is reported as unassigned and nothing is pruned.
    pub async fn reconcile(
        &self,
        topology: &ClusterTopology,
        workers: &InventoryGroup,
    ) -> Result<NetworkReport, NetworkError> {
        let assignments = self.await_assignments(topology, workers).await;
        let unassigned = workers
            .iter()
            .filter(|host| !assignments.contains_key(&host.id))
            .map(|host| host.id)
            .collect::<Vec<_>>();

        let assigned = workers
            .iter()
            .filter_map(|host| {
                assignments
                    .get(&host.id)
                    .map(|subnet| (host.clone(), *subnet))
            })
            .collect::<Vec<_>>();

        let routes = compute_routes(&assigned);
        let masquerade = compute_masquerade(
            workers.iter(),
            topology.network_cidr,
            &self.config.external_interface,
        );

        info!(
            "Installing {} pod route(s) and {} masquerade rule(s) on {} worker(s)...",
            routes.len(),
            masquerade.len(),
            workers.len()
        );

        let configured = join_all(workers.iter().map(|host| {
            let node = host.id;
            self.configure_host(host, assignments.get(&host.id), &routes, &masquerade)
                .map(move |result| (node, result))
        }))
        .await;
        collect_host_results(configured)?;

        let mut report = NetworkReport {
            state: ReconcilerState::AwaitingAssignments,
            assignments,
            unassigned,
            routes,
            masquerade,
            pruned: Vec::new(),
        };

        if !report.unassigned.is_empty() {
            warn!(
                "{} worker(s) still don't have a pod subnet, routes were installed among the rest only!",
                report.unassigned.len()
            );

            return Err(NetworkError::ReconciliationTimeout {
                unassigned: report.unassigned.clone(),
                report: Box::new(report),
            });
        }

        if self.config.prune_stale_routes {
            let pruned = join_all(workers.iter().map(|host| {
                let node = host.id;
                self.prune_host(host, topology.pod_cidr, &report.routes)
                    .map(move |result| (node, result))
            }))
            .await;

            report.pruned = collect_host_results(pruned)?.into_iter().flatten().collect();
        }

        report.state = ReconcilerState::RoutesInstalled;
        info!("Pod network routes are installed");

        Ok(report)
    }

    async fn await_assignments(
        &self,
        topology: &ClusterTopology,
        workers: &InventoryGroup,
    ) -> BTreeMap<NodeId, Ipv4Net> {
        let started = Instant::now();
        let mut assignments = BTreeMap::new();

        loop {
            match self.source.assignments().await {
                Ok(discovered) => {
                    assignments = match_assignments(topology, workers, &discovered);
                }
                Err(error) => warn!("Couldn't list pod subnet assignments! {error:#}"),
            }

            if assignments.len() == workers.len() {
                debug!("Every worker has a pod subnet assigned");
                break;
            }

            if started.elapsed() + self.config.poll_interval > self.config.timeout {
                break;
            }

            debug!(
                "{}/{} worker(s) have a pod subnet, polling again in {}s...",
                assignments.len(),
                workers.len(),
                self.config.poll_interval.as_secs()
            );
            tokio::time::sleep(self.config.poll_interval).await;
        }

        assignments
    }

    async fn configure_host(
        &self,
        host: &InventoryHost,
        pod_subnet: Option<&Ipv4Net>,
        routes: &[PodRoute],
        masquerade: &[MasqueradeRule],
    ) -> Result<(), ExecutionError> {
        if let Some(pod_subnet) = pod_subnet {
            let bridge = Task::upload(
                PathBuf::from(CNI_CONFIG_DIRECTORY).join(CNI_BRIDGE_FILENAME),
                render_cni_bridge(*pod_subnet),
                0o644,
            );

            if !bridge.is_converged(self.executor, host).await? {
                bridge.apply(self.executor, host).await?;
            }
        }

        let commands = routes
            .iter()
            .filter(|route| route.node == host.id)
            .map(PodRoute::command)
            .chain(
                masquerade
                    .iter()
                    .filter(|rule| rule.node == host.id)
                    .map(MasqueradeRule::command),
            )
            .collect::<Vec<_>>();

        if commands.is_empty() {
            return Ok(());
        }

        debug!("Configuring pod networking on '{}'...", host.id);

        self.executor
            .run_checked(host, &format!("set -e\n{}\n", commands.join("\n")))
            .await?;

        Ok(())
    }

    async fn prune_host(
        &self,
        host: &InventoryHost,
        pod_cidr: Ipv4Net,
        routes: &[PodRoute],
    ) -> Result<Vec<(NodeId, Ipv4Net)>, ExecutionError> {
        let output = self.executor.run_checked(host, "ip -4 route show").await?;

        let stale = routes::parse_gateway_routes(&output.stdout, &pod_cidr)
            .into_iter()
            .filter(|(destination, gateway)| {
                !routes.iter().any(|route| {
                    route.node == host.id
                        && route.destination == *destination
                        && route.gateway == *gateway
                })
            })
            .map(|(destination, _)| destination)
            .collect::<Vec<_>>();

        if stale.is_empty() {
            return Ok(Vec::new());
        }

        info!(
            "Removing {} stale pod route(s) from '{}'...",
            stale.len(),
            host.id
        );

        let script = stale
            .iter()
            .map(|destination| format!("ip route del {destination}"))
            .join("\n");
        self.executor.run_checked(host, &script).await?;

        Ok(stale
            .into_iter()
            .map(|destination| (host.id, destination))
            .collect())
    }
}

/// Pairs discovered subnets with workers, by node name first and address second.
fn match_assignments(
    topology: &ClusterTopology,
    workers: &InventoryGroup,
    discovered: &[PodSubnetAssignment],
) -> BTreeMap<NodeId, Ipv4Net> {
    workers
        .iter()
        .filter_map(|host| {
            let assignment = discovered
                .iter()
                .find(|assignment| assignment.node == host.hostname())
                .or_else(|| {
                    discovered
                        .iter()
                        .find(|assignment| assignment.address == Some(host.address))
                })?;
            let pod_subnet = assignment.pod_subnet?;

            if !topology.pod_cidr.contains(&pod_subnet) {
                warn!(
                    "'{}' was assigned {pod_subnet}, which is outside of the pod CIDR {}!",
                    host.id, topology.pod_cidr
                );

                return None;
            }

            Some((host.id, pod_subnet))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use crate::{
        inventory::Inventory,
        pki::tests::ready_record,
        testing::{FakePodSubnetSource, RecordingExecutor},
        topology::{tests::sample_topology, NodeRole},
    };

    use super::{NetworkConfig, NetworkError, NetworkReconciler, ReconcilerState};

    fn inventory() -> Inventory {
        Inventory::resolve(&[
            ready_record(NodeRole::Worker, 0, 31),
            ready_record(NodeRole::Worker, 1, 32),
            ready_record(NodeRole::Worker, 2, 30),
        ])
    }

    fn config() -> NetworkConfig {
        NetworkConfig {
            poll_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(60),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn routes_are_installed_once_every_worker_has_a_subnet() {
        let executor = RecordingExecutor::default();
        let source = FakePodSubnetSource::default();
        source.assign("worker-0", "10.43.0.31", "10.200.0.0/24");
        source.assign("worker-1", "10.43.0.32", "10.200.1.0/24");
        source.assign("worker-2", "10.43.0.30", "10.200.2.0/24");
        let config = config();
        let inventory = inventory();

        let report = NetworkReconciler::new(&executor, &source, &config)
            .reconcile(&sample_topology(), inventory.group(NodeRole::Worker))
            .await
            .unwrap();

        assert_eq!(report.state, ReconcilerState::RoutesInstalled);
        assert_eq!(report.routes.len(), 6);
        assert_eq!(report.masquerade.len(), 3);
        assert_eq!(
            executor.count_scripts_containing("ip route replace 10.200.1.0/24 via 10.43.0.32"),
            2
        );
        assert_eq!(executor.count_scripts_containing("-j MASQUERADE"), 3);
        assert!(executor
            .file(
                &"worker-2".parse().unwrap(),
                "/etc/cni/net.d/10-bridge.conf"
            )
            .unwrap()
            .contains("10.200.2.0/24"));
    }

    #[tokio::test(start_paused = true)]
    async fn late_assignments_are_picked_up_by_polling() {
        let executor = RecordingExecutor::default();
        let source = FakePodSubnetSource::default();
        source.assign("worker-0", "10.43.0.31", "10.200.0.0/24");
        source.assign("worker-1", "10.43.0.32", "10.200.1.0/24");
        source.assign_after("worker-2", "10.43.0.30", "10.200.2.0/24", 2);
        let config = config();
        let inventory = inventory();
        let started = Instant::now();

        let report = NetworkReconciler::new(&executor, &source, &config)
            .reconcile(&sample_topology(), inventory.group(NodeRole::Worker))
            .await
            .unwrap();

        assert_eq!(report.routes.len(), 6);
        assert_eq!(source.polls(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_reports_unassigned_and_routes_only_the_rest() {
        let executor = RecordingExecutor::default();
        let source = FakePodSubnetSource::default();
        source.assign("worker-0", "10.43.0.31", "10.200.0.0/24");
        source.assign("worker-1", "10.43.0.32", "10.200.1.0/24");
        let config = config();
        let inventory = inventory();
        let started = Instant::now();

        let error = NetworkReconciler::new(&executor, &source, &config)
            .reconcile(&sample_topology(), inventory.group(NodeRole::Worker))
            .await
            .unwrap_err();

        let NetworkError::ReconciliationTimeout { unassigned, report } = error else {
            panic!("expected a timeout");
        };
        assert_eq!(unassigned, vec!["worker-2".parse().unwrap()]);
        assert_eq!(report.state, ReconcilerState::AwaitingAssignments);
        assert_eq!(report.routes.len(), 2);
        assert_eq!(report.masquerade.len(), 3);
        assert!(started.elapsed() <= Duration::from_secs(60));
        assert_eq!(executor.count_scripts_containing("ip route del"), 0);
        assert_eq!(executor.count_scripts_containing("ip -4 route show"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_gateway_routes_are_pruned_after_full_reconciliation() {
        let executor = RecordingExecutor::default();
        executor.respond_to(
            "ip -4 route show",
            "10.43.0.0/16 dev eth0 proto kernel scope link\n\
             10.200.1.0/24 via 10.43.0.32 dev eth0\n\
             10.200.2.0/24 via 10.43.0.30 dev eth0\n\
             10.200.9.0/24 via 10.43.0.39 dev eth0\n",
        );
        let source = FakePodSubnetSource::default();
        source.assign("worker-0", "10.43.0.31", "10.200.0.0/24");
        source.assign("worker-1", "10.43.0.32", "10.200.1.0/24");
        source.assign("worker-2", "10.43.0.30", "10.200.2.0/24");
        let config = config();
        let inventory = inventory();

        let report = NetworkReconciler::new(&executor, &source, &config)
            .reconcile(&sample_topology(), inventory.group(NodeRole::Worker))
            .await
            .unwrap();

        // every worker reports the same table, so worker-0 keeps both routes
        // while the others also lose the route to their own subnet
        assert!(report
            .pruned
            .contains(&("worker-0".parse().unwrap(), "10.200.9.0/24".parse().unwrap())));
        assert!(report
            .pruned
            .contains(&("worker-1".parse().unwrap(), "10.200.1.0/24".parse().unwrap())));
        assert_eq!(report.pruned.len(), 5);
        assert_eq!(executor.count_scripts_containing("ip route del 10.200.9.0/24"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_worker_doesnt_cut_off_the_others() {
        let executor = RecordingExecutor::default();
        // only worker-1 routes to worker-0 first and worker-2 second
        executor.fail_scripts_containing(
            "via 10.43.0.31\nip route replace 10.200.2.0/24",
            u32::MAX,
        );
        let source = FakePodSubnetSource::default();
        source.assign("worker-0", "10.43.0.31", "10.200.0.0/24");
        source.assign("worker-1", "10.43.0.32", "10.200.1.0/24");
        source.assign("worker-2", "10.43.0.30", "10.200.2.0/24");
        let config = config();
        let inventory = inventory();

        let error = NetworkReconciler::new(&executor, &source, &config)
            .reconcile(&sample_topology(), inventory.group(NodeRole::Worker))
            .await
            .unwrap_err();

        assert!(error.to_string().contains("'worker-1'"));
        let NetworkError::Apply { failures } = error else {
            panic!("expected a per-host failure");
        };
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "worker-1".parse().unwrap());

        // worker-0 and worker-2 both still got their route to worker-1
        assert_eq!(
            executor.count_scripts_containing("ip route replace 10.200.1.0/24 via 10.43.0.32"),
            2
        );
        assert_eq!(executor.count_scripts_containing("ip -4 route show"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn subnets_outside_the_pod_range_are_ignored() {
        let executor = RecordingExecutor::default();
        let source = FakePodSubnetSource::default();
        source.assign("worker-0", "10.43.0.31", "10.200.0.0/24");
        source.assign("worker-1", "10.43.0.32", "10.201.1.0/24");
        source.assign("worker-2", "10.43.0.30", "10.200.2.0/24");
        let config = NetworkConfig {
            timeout: Duration::from_secs(10),
            ..config()
        };
        let inventory = inventory();

        let error = NetworkReconciler::new(&executor, &source, &config)
            .reconcile(&sample_topology(), inventory.group(NodeRole::Worker))
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            NetworkError::ReconciliationTimeout { ref unassigned, .. } if unassigned.len() == 1
        ));
    }
}
