use std::{
    collections::{BTreeMap, HashMap, HashSet},
    net::Ipv4Addr,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tokio::time::Instant;

use crate::{
    execution::{CommandOutput, ExecutionError, RemoteExecutor, RemoteFile},
    installer::tasks::checksum,
    inventory::InventoryHost,
    kubernetes::ControlPlaneConnector,
    network::{PodSubnetAssignment, PodSubnetSource},
    node::NodeId,
    provisioner::{
        ObservedResource, ObservedState, Provider, ProviderError, ResourceDocument, ResourceKey,
        ResourceSpec, ResourceStatus,
    },
};

#[derive(Default)]
struct ProviderState {
    resources: BTreeMap<ResourceKey, ObservedResource>,
    failures: HashMap<String, u32>,
    calls: usize,
    mutations: usize,
    next_id: u32,
}

/// In-memory cloud scoped to a single cluster.
#[derive(Default)]
pub struct FakeProvider {
    state: Mutex<ProviderState>,
}

impl FakeProvider {
    /// Makes the next `times` applies of the named resource fail.
    pub fn fail_apply(&self, name: &str, times: u32) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(name.to_owned(), times);
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failures.clear();
    }

    /// Every provider call, reads included.
    pub fn calls(&self) -> usize {
        self.state.lock().unwrap().calls
    }

    /// Applies and destroys only.
    pub fn mutations(&self) -> usize {
        self.state.lock().unwrap().mutations
    }
}

#[async_trait]
impl Provider for FakeProvider {
    async fn observe(&self, _cluster: &str) -> Result<ObservedState, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;

        Ok(state.resources.values().cloned().collect::<Vec<_>>().into())
    }

    async fn apply(
        &self,
        _cluster: &str,
        document: &ResourceDocument,
    ) -> Result<ObservedResource, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        state.mutations += 1;

        let key = document.spec.key();
        if let Some(remaining) = state.failures.get_mut(&key.name) {
            if *remaining > 0 {
                *remaining -= 1;

                return Err(ProviderError::Rejected {
                    resource: key,
                    message: "injected failure".to_owned(),
                });
            }
        }

        let id = match &document.existing_id {
            Some(id) => id.clone(),
            None => {
                state.next_id += 1;
                format!("fake-{:04}", state.next_id)
            }
        };

        let mut observed = ObservedResource {
            key: key.clone(),
            id,
            fingerprint: document.fingerprint.clone(),
            status: ResourceStatus::Ready,
            private_address: None,
            public_address: None,
            dns_name: None,
        };

        match &document.spec {
            ResourceSpec::Instance {
                private_address,
                assign_public_address,
                ..
            } => {
                observed.private_address = Some(*private_address);
                if *assign_public_address {
                    let [_, _, _, last] = private_address.octets();
                    observed.public_address = Some(Ipv4Addr::new(198, 51, 100, last));
                }
            }
            ResourceSpec::LoadBalancer { name, .. } => {
                observed.public_address = Some(Ipv4Addr::new(198, 51, 100, 250));
                observed.dns_name = Some(format!("{name}.lb.example.com"));
            }
            _ => {}
        }

        state.resources.insert(key, observed.clone());

        Ok(observed)
    }

    async fn destroy(&self, _cluster: &str, resource: &ObservedResource) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        state.mutations += 1;
        state.resources.remove(&resource.key);

        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionEntry {
    pub node: NodeId,
    /// script, or `upload <path>` for uploads
    pub command: String,
    pub at: Instant,
}

#[derive(Default)]
struct ExecutorState {
    files: HashMap<(NodeId, PathBuf), (Vec<u8>, u32)>,
    active: HashSet<(NodeId, String)>,
    restarts: HashMap<(NodeId, String), u32>,
    failures: Vec<(String, u32)>,
    responses: Vec<(String, String)>,
    log: Vec<ExecutionEntry>,
}

/// Simulated nodes: files, unit activity and a log of everything that ran.
#[derive(Default)]
pub struct RecordingExecutor {
    state: Mutex<ExecutorState>,
}

fn unquote(value: &str) -> &str {
    value.trim().trim_matches('\'')
}

impl RecordingExecutor {
    /// Scripts containing `pattern` exit with 1 for the next `times` runs.
    pub fn fail_scripts_containing(&self, pattern: &str, times: u32) {
        self.state
            .lock()
            .unwrap()
            .failures
            .push((pattern.to_owned(), times));
    }

    /// Scripts containing `pattern` print `stdout`.
    pub fn respond_to(&self, pattern: &str, stdout: &str) {
        self.state
            .lock()
            .unwrap()
            .responses
            .push((pattern.to_owned(), stdout.to_owned()));
    }

    pub fn count_scripts_containing(&self, pattern: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .log
            .iter()
            .filter(|entry| entry.command.contains(pattern))
            .count()
    }

    pub fn restarts(&self, node: &NodeId, unit: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .restarts
            .get(&(*node, unit.to_owned()))
            .copied()
            .unwrap_or(0)
    }

    pub fn file(&self, node: &NodeId, path: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .files
            .get(&(*node, PathBuf::from(path)))
            .map(|(contents, _)| String::from_utf8_lossy(contents).into_owned())
    }

    pub fn mode(&self, node: &NodeId, path: &str) -> Option<u32> {
        self.state
            .lock()
            .unwrap()
            .files
            .get(&(*node, PathBuf::from(path)))
            .map(|(_, mode)| *mode)
    }

    /// Changes the mode of a file behind the installer's back.
    pub fn chmod(&self, node: &NodeId, path: &str, mode: u32) {
        if let Some((_, current)) = self
            .state
            .lock()
            .unwrap()
            .files
            .get_mut(&(*node, PathBuf::from(path)))
        {
            *current = mode;
        }
    }

    pub fn log(&self) -> Vec<ExecutionEntry> {
        self.state.lock().unwrap().log.clone()
    }

    fn record(state: &mut ExecutorState, node: NodeId, command: &str) -> bool {
        state.log.push(ExecutionEntry {
            node,
            command: command.to_owned(),
            at: Instant::now(),
        });

        match state
            .failures
            .iter_mut()
            .find(|(pattern, remaining)| *remaining > 0 && command.contains(pattern.as_str()))
        {
            Some((_, remaining)) => {
                *remaining -= 1;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl RemoteExecutor for RecordingExecutor {
    async fn run(&self, host: &InventoryHost, script: &str) -> Result<CommandOutput, ExecutionError> {
        let mut state = self.state.lock().unwrap();
        let output = |status: i32, stdout: String| CommandOutput {
            status,
            stdout,
            stderr: String::new(),
        };

        if Self::record(&mut state, host.id, script) {
            return Ok(CommandOutput {
                status: 1,
                stdout: String::new(),
                stderr: "injected failure".to_owned(),
            });
        }

        if let Some((_, stdout)) = state
            .responses
            .iter()
            .find(|(pattern, _)| script.contains(pattern.as_str()))
        {
            return Ok(output(0, stdout.clone()));
        }

        let script = script.trim();

        if let Some(path) = script.strip_prefix("sha256sum ") {
            let (path, with_mode) = match path.split_once(" && stat -c %a ") {
                Some((path, _)) => (unquote(path), true),
                None => (unquote(path), false),
            };

            return Ok(match state.files.get(&(host.id, PathBuf::from(path))) {
                Some((contents, mode)) if with_mode => {
                    output(0, format!("{}  {path}\n{mode:o}\n", checksum(contents)))
                }
                Some((contents, _)) => output(0, format!("{}  {path}\n", checksum(contents))),
                None => output(1, String::new()),
            });
        }

        if let Some(path) = script.strip_prefix("cat ") {
            return Ok(match state.files.get(&(host.id, PathBuf::from(unquote(path)))) {
                Some((contents, _)) => output(0, String::from_utf8_lossy(contents).into_owned()),
                None => output(1, String::new()),
            });
        }

        if let Some(unit) = script.strip_prefix("systemctl is-active ") {
            let active = state.active.contains(&(host.id, unquote(unit).to_owned()));

            return Ok(if active {
                output(0, "active\n".to_owned())
            } else {
                output(3, "inactive\n".to_owned())
            });
        }

        for line in script.lines() {
            if let Some(unit) = line.trim().strip_prefix("systemctl restart ") {
                let key = (host.id, unquote(unit).to_owned());

                *state.restarts.entry(key.clone()).or_default() += 1;
                state.active.insert(key);
            }
        }

        Ok(output(0, String::new()))
    }

    async fn upload(&self, host: &InventoryHost, file: &RemoteFile) -> Result<(), ExecutionError> {
        let mut state = self.state.lock().unwrap();

        if Self::record(&mut state, host.id, &format!("upload {}", file.path.display())) {
            return Err(ExecutionError::Failed {
                node: host.id,
                status: 1,
                stderr: "injected failure".to_owned(),
            });
        }

        state
            .files
            .insert((host.id, file.path.clone()), (file.contents.clone(), file.mode));

        Ok(())
    }
}

#[derive(Default)]
struct SubnetSourceState {
    assignments: Vec<(PodSubnetAssignment, u32)>,
    polls: u32,
}

/// Control plane handing out pod subnets, optionally only after a number of polls.
#[derive(Default, Clone)]
pub struct FakePodSubnetSource {
    state: Arc<Mutex<SubnetSourceState>>,
}

impl FakePodSubnetSource {
    pub fn assign(&self, node: &str, address: &str, pod_subnet: &str) {
        self.assign_after(node, address, pod_subnet, 0);
    }

    /// The assignment shows up from poll number `polls + 1` onwards.
    pub fn assign_after(&self, node: &str, address: &str, pod_subnet: &str, polls: u32) {
        self.state.lock().unwrap().assignments.push((
            PodSubnetAssignment {
                node: node.to_owned(),
                address: Some(address.parse().unwrap()),
                pod_subnet: Some(pod_subnet.parse().unwrap()),
            },
            polls,
        ));
    }

    pub fn polls(&self) -> u32 {
        self.state.lock().unwrap().polls
    }
}

#[async_trait]
impl PodSubnetSource for FakePodSubnetSource {
    async fn assignments(&self) -> anyhow::Result<Vec<PodSubnetAssignment>> {
        let mut state = self.state.lock().unwrap();
        let poll = state.polls;
        state.polls += 1;

        Ok(state
            .assignments
            .iter()
            .map(|(assignment, after)| {
                if poll >= *after {
                    assignment.clone()
                } else {
                    PodSubnetAssignment {
                        pod_subnet: None,
                        ..assignment.clone()
                    }
                }
            })
            .collect())
    }
}

/// Hands out the same fake source to every connection and keeps the kubeconfigs it got.
#[derive(Default, Clone)]
pub struct FakeConnector {
    pub source: FakePodSubnetSource,
    pub kubeconfigs: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ControlPlaneConnector for FakeConnector {
    type Source = FakePodSubnetSource;

    async fn connect(&self, kubeconfig: &str) -> anyhow::Result<Self::Source> {
        self.kubeconfigs.lock().unwrap().push(kubeconfig.to_owned());

        Ok(self.source.clone())
    }
}
