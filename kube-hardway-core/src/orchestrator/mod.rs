use std::{fmt::Display, net::IpAddr};

use chrono::Utc;
use itertools::Itertools;
use log::{info, warn};
use thiserror::Error;
use tokio::sync::watch;

use crate::{
    config::BootstrapConfig,
    error::ConfigurationError,
    execution::RemoteExecutor,
    helpers::write_with_mode,
    installer::{
        plan::InstallationPlan, state::RoleState, InstallContext, InstallationError,
        InstallationReport, Installer,
    },
    inventory::{ExcludedNode, Inventory},
    kubernetes::{kubeconfig, ControlPlaneConnector},
    lock::{LockError, RunLock},
    network::{NetworkError, NetworkReconciler, NetworkReport},
    node::NodeId,
    pki::{
        collect_subject_alt_names, store::BundleStore, CertificateBundle, CertificationError,
        PkiGenerator, SubjectAltName,
    },
    provisioner::{
        Provider, ProvisioningError, ProvisioningOutcome, ProvisioningPlan, Provisioner,
        API_SERVER_PORT,
    },
    state::{ClusterState, StateError, StateStore},
    topology::NodeRole,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// every step, from provisioning to pod routes
    Full,
    /// pod routes only, on top of an already installed cluster
    RoutesOnly,
}

/// Points of a run after which everything before is converged and persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Barrier {
    Provisioned,
    Inventory,
    Certified,
    Installed,
    Routed,
}

impl Barrier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Barrier::Provisioned => "provisioned",
            Barrier::Inventory => "inventory",
            Barrier::Certified => "certified",
            Barrier::Installed => "installed",
            Barrier::Routed => "routed",
        }
    }
}

impl Display for Barrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub completed: Vec<Barrier>,
    pub provisioning: Option<ProvisioningOutcome>,
    pub excluded: Vec<ExcludedNode>,
    pub certificate_generated: Option<bool>,
    pub api_endpoint: Option<String>,
    pub installation: Option<InstallationReport>,
    pub network: Option<NetworkReport>,
}

impl RunReport {
    pub fn reached(&self, barrier: Barrier) -> bool {
        self.completed.contains(&barrier)
    }
}

#[derive(Debug, Error)]
pub enum RunFailure {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),
    #[error("Provisioning didn't converge ({failures} failure(s)), not ready: {}", join_nodes(.not_ready))]
    IncompleteProvisioning {
        not_ready: Vec<NodeId>,
        failures: usize,
    },
    #[error(transparent)]
    Certification(#[from] CertificationError),
    #[error("No certificate bundle in '{}', bootstrap the cluster first!", .0.display())]
    MissingBundle(std::path::PathBuf),
    #[error("Couldn't determine the API endpoint, there's neither a load balancer nor a ready controller!")]
    NoApiEndpoint,
    #[error("Couldn't write '{}'! {source}", .path.display())]
    Artifact {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Installation(#[from] InstallationError),
    #[error("Role '{role}' is '{state}', pod routes need it verified first!")]
    RoleNotVerified { role: NodeRole, state: RoleState },
    #[error("Couldn't connect to the control plane! {:#}", .0)]
    ControlPlane(anyhow::Error),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("Run aborted after the '{}' barrier", .0)]
    Aborted(Barrier),
}

fn join_nodes(nodes: &[NodeId]) -> String {
    nodes.iter().join(", ")
}

/// First fatal failure of a run, along with everything the run got done before it.
#[derive(Debug, Error)]
#[error("{failure}")]
pub struct OrchestrationError {
    #[source]
    pub failure: RunFailure,
    pub report: Box<RunReport>,
}

pub struct Orchestrator<P, E, C> {
    config: BootstrapConfig,
    provisioner: Provisioner<P>,
    executor: E,
    connector: C,
    abort: watch::Receiver<bool>,
    api_endpoint: Option<String>,
}

impl<P, E, C> Orchestrator<P, E, C>
where
    P: Provider,
    E: RemoteExecutor,
    C: ControlPlaneConnector,
{
    pub fn new(config: BootstrapConfig, provider: P, executor: E, connector: C) -> Self {
        let provisioner = Provisioner::new(provider, config.provisioning_retry.clone());

        Self {
            config,
            provisioner,
            executor,
            connector,
            abort: watch::channel(false).1,
            api_endpoint: None,
        }
    }

    /// The run stops at the next barrier once `abort` turns `true`.
    pub fn with_abort(mut self, abort: watch::Receiver<bool>) -> Self {
        self.abort = abort;
        self
    }

    /// Overrides the endpoint derived from the load balancer or the first controller.
    pub fn with_api_endpoint(mut self, api_endpoint: Option<String>) -> Self {
        self.api_endpoint = api_endpoint;
        self
    }

    pub fn config(&self) -> &BootstrapConfig {
        &self.config
    }

    pub fn provisioner(&self) -> &Provisioner<P> {
        &self.provisioner
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub async fn run(&self, mode: RunMode) -> Result<RunReport, OrchestrationError> {
        let mut report = RunReport::default();

        match self.execute(mode, &mut report).await {
            Ok(()) => Ok(report),
            Err(failure) => Err(OrchestrationError {
                failure,
                report: Box::new(report),
            }),
        }
    }

    /// Provider operations a bootstrap would execute right now.
    pub async fn plan(&self) -> Result<ProvisioningPlan, RunFailure> {
        self.config.topology.validate()?;

        Ok(self.provisioner.plan(&self.config.topology).await?)
    }

    /// Destroys a node's instance, then rewrites the state and the inventory without it.
    pub async fn decommission(&self, node: NodeId) -> Result<Inventory, RunFailure> {
        let cluster = self.config.cluster_name();
        let _lock = RunLock::acquire(&self.config.state_directory, cluster)?;
        let store = StateStore::new(self.config.state_path());
        let mut state = store.load_or_create(cluster)?;

        self.provisioner
            .decommission(cluster, node, &mut state.nodes)
            .await?;
        store.save(&mut state)?;

        let inventory = Inventory::resolve(state.nodes.values());
        self.write_inventory(&inventory).await?;

        Ok(inventory)
    }

    /// Regenerates the inventory file from the persisted node records.
    pub async fn inventory(&self) -> Result<Inventory, RunFailure> {
        let state = self.load_state()?;
        let inventory = Inventory::resolve(state.nodes.values());
        self.write_inventory(&inventory).await?;

        Ok(inventory)
    }

    /// Renders and writes the admin kubeconfig from the stored bundle.
    pub async fn kubeconfig(&self) -> Result<String, RunFailure> {
        let state = self.load_state()?;
        let bundle = self.stored_bundle().await?;
        let api_endpoint = self.resolve_api_endpoint(&state)?;

        self.write_kubeconfig(&api_endpoint, &bundle).await
    }

    async fn execute(&self, mode: RunMode, report: &mut RunReport) -> Result<(), RunFailure> {
        let topology = &self.config.topology;
        topology.validate()?;

        let _lock = RunLock::acquire(&self.config.state_directory, &topology.name)?;
        let store = StateStore::new(self.config.state_path());
        let mut state = store.load_or_create(&topology.name)?;

        if mode == RunMode::Full {
            self.provision(&store, &mut state, report).await?;
            self.checkpoint(report, Barrier::Provisioned)?;
        }

        let inventory = Inventory::resolve(state.nodes.values());
        for excluded in inventory.excluded() {
            warn!("'{}' is left out of the inventory: {:?}", excluded.id, excluded.reason);
        }
        self.write_inventory(&inventory).await?;
        report.excluded = inventory.excluded().to_vec();
        self.checkpoint(report, Barrier::Inventory)?;

        let bundle = match mode {
            RunMode::Full => self.certify(&state, report).await?,
            RunMode::RoutesOnly => {
                let bundle = self.stored_bundle().await?;
                let workers = state.role_state(NodeRole::Worker);
                if workers != RoleState::Verified {
                    return Err(RunFailure::RoleNotVerified {
                        role: NodeRole::Worker,
                        state: workers,
                    });
                }

                bundle
            }
        };
        let api_endpoint = self.resolve_api_endpoint(&state)?;
        let kubeconfig = self.write_kubeconfig(&api_endpoint, &bundle).await?;
        report.api_endpoint = Some(api_endpoint.clone());
        self.checkpoint(report, Barrier::Certified)?;

        if mode == RunMode::Full {
            let context = InstallContext {
                topology,
                inventory: &inventory,
                bundle: &bundle,
                api_endpoint: &api_endpoint,
            };
            let mut installation = Installer::new(&self.executor, &self.config.installer)
                .install(&InstallationPlan::standard(), &context)
                .await;

            state.roles = installation.states.clone();
            store.save(&mut state)?;

            let failure = (!installation.errors.is_empty()).then(|| installation.errors.remove(0));
            report.installation = Some(installation);
            if let Some(error) = failure {
                return Err(error.into());
            }

            self.checkpoint(report, Barrier::Installed)?;
        }

        info!("Connecting to the control plane at '{api_endpoint}'...");
        let source = self
            .connector
            .connect(&kubeconfig)
            .await
            .map_err(RunFailure::ControlPlane)?;

        let reconciler = NetworkReconciler::new(&self.executor, &source, &self.config.network);
        match reconciler
            .reconcile(topology, inventory.group(NodeRole::Worker))
            .await
        {
            Ok(network) => {
                state.routes_installed_at = Some(Utc::now());
                store.save(&mut state)?;
                report.network = Some(network);
                report.completed.push(Barrier::Routed);

                info!("Cluster '{}' is bootstrapped", topology.name);

                Ok(())
            }
            Err(NetworkError::ReconciliationTimeout {
                unassigned,
                report: network,
            }) => {
                report.network = Some(network.as_ref().clone());

                Err(NetworkError::ReconciliationTimeout {
                    unassigned,
                    report: network,
                }
                .into())
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn provision(
        &self,
        store: &StateStore,
        state: &mut ClusterState,
        report: &mut RunReport,
    ) -> Result<(), RunFailure> {
        let outcome = self
            .provisioner
            .reconcile(&self.config.topology, &state.nodes)
            .await?;

        state.nodes = outcome.records.clone();
        state.load_balancer = outcome.load_balancer.clone();
        store.save(state)?;

        for failure in &outcome.failures {
            warn!("{failure}");
        }

        let complete = outcome.is_complete();
        let not_ready = outcome
            .not_ready()
            .map(|record| record.id)
            .collect::<Vec<_>>();
        let failures = outcome.failures.len();
        report.provisioning = Some(outcome);

        if complete {
            Ok(())
        } else {
            Err(RunFailure::IncompleteProvisioning {
                not_ready,
                failures,
            })
        }
    }

    async fn certify(
        &self,
        state: &ClusterState,
        report: &mut RunReport,
    ) -> Result<CertificateBundle, RunFailure> {
        let names = collect_subject_alt_names(state.nodes.values(), self.extra_names(state))?;
        let store = BundleStore::new(self.config.certificates_directory());
        let existing = store.load().await?;

        let certification =
            PkiGenerator::new(self.config.cluster_name()).certify(&names, existing)?;
        report.certificate_generated = Some(certification.is_generated());

        if certification.is_generated() {
            store.save(certification.bundle()).await?;
        } else {
            info!("Certificates already cover every cluster endpoint");
        }

        Ok(certification.into_bundle())
    }

    /// Endpoint names the server certificate covers on top of node addresses.
    fn extra_names(&self, state: &ClusterState) -> Vec<SubjectAltName> {
        let topology = &self.config.topology;
        let domain = &self.config.installer.cluster_domain;
        let mut names = vec![
            SubjectAltName::Ip(IpAddr::from([127, 0, 0, 1])),
            SubjectAltName::Dns("kubernetes".to_owned()),
            SubjectAltName::Dns("kubernetes.default".to_owned()),
            SubjectAltName::Dns("kubernetes.default.svc".to_owned()),
            SubjectAltName::Dns(format!("kubernetes.default.svc.{domain}")),
        ];

        if let Some(address) = topology.kubernetes_service_address() {
            names.push(SubjectAltName::Ip(address.into()));
        }
        if let Some(name) = &topology.cluster_dns_name {
            names.push(SubjectAltName::Dns(name.clone()));
        }
        if let Some(load_balancer) = &state.load_balancer {
            if let Some(address) = load_balancer.address {
                names.push(SubjectAltName::Ip(address.into()));
            }
            if let Some(dns_name) = &load_balancer.dns_name {
                names.push(SubjectAltName::Dns(dns_name.clone()));
            }
        }

        names.extend(self.config.extra_subject_alt_names.iter().cloned());
        names
    }

    fn resolve_api_endpoint(&self, state: &ClusterState) -> Result<String, RunFailure> {
        self.api_endpoint
            .clone()
            .or_else(|| {
                state
                    .load_balancer
                    .as_ref()
                    .and_then(|load_balancer| load_balancer.url())
            })
            .or_else(|| {
                state
                    .nodes
                    .values()
                    .filter(|record| record.role == NodeRole::Controller && record.is_ready())
                    .find_map(|record| record.private_address)
                    .map(|address| format!("https://{address}:{API_SERVER_PORT}"))
            })
            .ok_or(RunFailure::NoApiEndpoint)
    }

    fn load_state(&self) -> Result<ClusterState, RunFailure> {
        Ok(StateStore::new(self.config.state_path()).load_or_create(self.config.cluster_name())?)
    }

    async fn stored_bundle(&self) -> Result<CertificateBundle, RunFailure> {
        let directory = self.config.certificates_directory();

        BundleStore::new(&directory)
            .load()
            .await?
            .ok_or(RunFailure::MissingBundle(directory))
    }

    async fn write_inventory(&self, inventory: &Inventory) -> Result<(), RunFailure> {
        let path = self.config.inventory_path();

        inventory
            .write(&path)
            .await
            .map_err(|source| RunFailure::Artifact { path, source })
    }

    async fn write_kubeconfig(
        &self,
        api_endpoint: &str,
        bundle: &CertificateBundle,
    ) -> Result<String, RunFailure> {
        let path = self.config.kubeconfig_path();
        let admin = kubeconfig::admin(self.config.cluster_name(), api_endpoint, bundle);
        let rendered = kubeconfig::render(&admin).map_err(|error| RunFailure::Artifact {
            path: path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, error),
        })?;

        write_with_mode(&path, &rendered, 0o600)
            .await
            .map_err(|source| RunFailure::Artifact { path, source })?;

        Ok(rendered)
    }

    fn checkpoint(&self, report: &mut RunReport, barrier: Barrier) -> Result<(), RunFailure> {
        report.completed.push(barrier);

        if *self.abort.borrow() {
            warn!("Aborting after the '{barrier}' barrier, the next run picks up from here...");
            return Err(RunFailure::Aborted(barrier));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{path::Path, time::Duration};

    use tokio::sync::watch;

    use crate::{
        config::BootstrapConfig,
        error::ConfigurationError,
        execution::SshConfig,
        installer::{state::RoleState, InstallerConfig},
        lock::{LockError, RunLock},
        network::NetworkConfig,
        node::{NodeId, NodeStatus},
        provisioner::ProviderCommandConfig,
        retry::RetryPolicy,
        state::StateStore,
        testing::{FakeConnector, FakeProvider, RecordingExecutor},
        topology::{tests::sample_topology, NodeRole},
    };

    use super::{Barrier, Orchestrator, RunFailure, RunMode};

    fn config(directory: &Path) -> BootstrapConfig {
        BootstrapConfig {
            topology: sample_topology(),
            state_directory: directory.to_owned(),
            provider: ProviderCommandConfig {
                command: "hardway-provider".into(),
                args: Vec::new(),
                timeout: Duration::from_secs(60),
            },
            ssh: SshConfig::default(),
            installer: InstallerConfig::default(),
            network: NetworkConfig::default(),
            extra_subject_alt_names: Vec::new(),
            provisioning_retry: RetryPolicy::fixed(2, Duration::from_secs(1)),
        }
    }

    fn connector() -> FakeConnector {
        let connector = FakeConnector::default();
        connector.source.assign("worker-0", "10.43.0.32", "10.200.0.0/24");
        connector.source.assign("worker-1", "10.43.0.33", "10.200.1.0/24");
        connector.source.assign("worker-2", "10.43.0.34", "10.200.2.0/24");
        connector
    }

    fn orchestrator(
        directory: &Path,
        connector: FakeConnector,
    ) -> Orchestrator<FakeProvider, RecordingExecutor, FakeConnector> {
        Orchestrator::new(
            config(directory),
            FakeProvider::default(),
            RecordingExecutor::default(),
            connector,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn full_run_converges_and_reruns_as_a_no_op() {
        let directory = tempfile::tempdir().unwrap();
        let connector = connector();
        let orchestrator = orchestrator(directory.path(), connector.clone());

        let report = orchestrator.run(RunMode::Full).await.unwrap();

        assert_eq!(
            report.completed,
            vec![
                Barrier::Provisioned,
                Barrier::Inventory,
                Barrier::Certified,
                Barrier::Installed,
                Barrier::Routed
            ]
        );
        assert_eq!(report.certificate_generated, Some(true));
        assert_eq!(
            report.api_endpoint.as_deref(),
            Some("https://hardway-api.lb.example.com:6443")
        );
        assert_eq!(report.network.as_ref().unwrap().routes.len(), 6);

        let state = StateStore::new(directory.path().join("state.yaml"))
            .load_or_create("hardway")
            .unwrap();
        assert_eq!(state.nodes.len(), 9);
        assert!(state.routes_installed_at.is_some());
        for role in NodeRole::ALL {
            assert_eq!(state.role_state(role), RoleState::Verified);
        }

        let inventory = std::fs::read_to_string(directory.path().join("hosts.ini")).unwrap();
        assert!(inventory.contains("[etcd]"));
        let kubeconfig = std::fs::read_to_string(directory.path().join("admin.kubeconfig")).unwrap();
        assert!(kubeconfig.contains("server: https://hardway-api.lb.example.com:6443"));
        assert_eq!(connector.kubeconfigs.lock().unwrap().as_slice(), &[kubeconfig]);
        assert!(!directory.path().join("hardway.lock").exists());

        let mutations = orchestrator.provisioner().provider().mutations();
        let rerun = orchestrator.run(RunMode::Full).await.unwrap();

        assert_eq!(orchestrator.provisioner().provider().mutations(), mutations);
        assert_eq!(rerun.certificate_generated, Some(false));
        assert_eq!(rerun.installation.unwrap().tasks_applied, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_ranges_are_rejected_before_any_provider_call() {
        let directory = tempfile::tempdir().unwrap();
        let mut config = config(directory.path());
        config.topology.etcd.address_range = config.topology.controller.address_range;
        let orchestrator = Orchestrator::new(
            config,
            FakeProvider::default(),
            RecordingExecutor::default(),
            connector(),
        );

        let error = orchestrator.run(RunMode::Full).await.unwrap_err();

        assert!(matches!(
            error.failure,
            RunFailure::Configuration(ConfigurationError::OverlappingRoleRanges { .. })
        ));
        assert_eq!(orchestrator.provisioner().provider().calls(), 0);
        assert!(error.report.completed.is_empty());
        assert!(!directory.path().join("state.yaml").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn abort_stops_at_the_next_barrier_with_state_saved() {
        let directory = tempfile::tempdir().unwrap();
        let (abort, aborted) = watch::channel(false);
        let orchestrator = orchestrator(directory.path(), connector()).with_abort(aborted);
        abort.send_replace(true);

        let error = orchestrator.run(RunMode::Full).await.unwrap_err();

        assert!(matches!(
            error.failure,
            RunFailure::Aborted(Barrier::Provisioned)
        ));
        assert!(orchestrator.executor().log().is_empty());

        let state = StateStore::new(directory.path().join("state.yaml"))
            .load_or_create("hardway")
            .unwrap();
        assert_eq!(state.nodes.len(), 9);
        assert!(!directory.path().join("hardway.lock").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_node_blocks_everything_after_provisioning() {
        let directory = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(directory.path(), connector());
        orchestrator
            .provisioner()
            .provider()
            .fail_apply("worker-1", u32::MAX);

        let error = orchestrator.run(RunMode::Full).await.unwrap_err();

        match &error.failure {
            RunFailure::IncompleteProvisioning { not_ready, failures } => {
                assert_eq!(not_ready, &vec![NodeId::new(NodeRole::Worker, 1)]);
                assert_eq!(*failures, 1);
            }
            other => panic!("unexpected failure: {other}"),
        }
        assert!(error.report.completed.is_empty());
        assert!(orchestrator.executor().log().is_empty());
        assert!(!directory.path().join("pki").exists());

        let state = StateStore::new(directory.path().join("state.yaml"))
            .load_or_create("hardway")
            .unwrap();
        assert_eq!(
            state.nodes[&NodeId::new(NodeRole::Worker, 1)].status,
            NodeStatus::Failed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_run_of_the_same_cluster_is_refused() {
        let directory = tempfile::tempdir().unwrap();
        let _lock = RunLock::acquire(directory.path(), "hardway").unwrap();
        let orchestrator = orchestrator(directory.path(), connector());

        let error = orchestrator.run(RunMode::Full).await.unwrap_err();

        assert!(matches!(
            error.failure,
            RunFailure::Lock(LockError::AlreadyRunning { .. })
        ));
        assert_eq!(orchestrator.provisioner().provider().calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn routes_only_run_needs_a_stored_bundle() {
        let directory = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(directory.path(), connector());

        let error = orchestrator.run(RunMode::RoutesOnly).await.unwrap_err();

        assert!(matches!(error.failure, RunFailure::MissingBundle(_)));
        assert_eq!(orchestrator.provisioner().provider().calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn routes_only_run_reuses_the_installed_cluster() {
        let directory = tempfile::tempdir().unwrap();
        let connector = connector();
        let orchestrator = orchestrator(directory.path(), connector.clone())
            .with_api_endpoint(Some("https://203.0.113.7:6443".to_owned()));
        orchestrator.run(RunMode::Full).await.unwrap();
        let calls = orchestrator.provisioner().provider().calls();

        let report = orchestrator.run(RunMode::RoutesOnly).await.unwrap();

        assert_eq!(orchestrator.provisioner().provider().calls(), calls);
        assert!(report.installation.is_none());
        assert_eq!(
            report.completed,
            vec![Barrier::Inventory, Barrier::Certified, Barrier::Routed]
        );
        assert!(connector.kubeconfigs.lock().unwrap()[1].contains("server: https://203.0.113.7:6443"));
    }

    #[tokio::test(start_paused = true)]
    async fn routes_only_run_refuses_workers_that_failed_to_install() {
        let directory = tempfile::tempdir().unwrap();
        let connector = connector();
        let orchestrator = orchestrator(directory.path(), connector.clone());
        orchestrator
            .executor()
            .fail_scripts_containing("kubelet", u32::MAX);
        orchestrator.run(RunMode::Full).await.unwrap_err();
        let connections = connector.kubeconfigs.lock().unwrap().len();

        let error = orchestrator.run(RunMode::RoutesOnly).await.unwrap_err();

        assert!(matches!(
            error.failure,
            RunFailure::RoleNotVerified {
                role: NodeRole::Worker,
                state: RoleState::Failed,
            }
        ));
        assert!(!error.report.reached(Barrier::Routed));
        assert!(error.report.network.is_none());
        assert_eq!(connector.kubeconfigs.lock().unwrap().len(), connections);
        assert_eq!(
            orchestrator
                .executor()
                .count_scripts_containing("ip route replace"),
            0
        );
    }
}
