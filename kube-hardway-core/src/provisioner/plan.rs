use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{Display, Formatter},
    net::Ipv4Addr,
};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use super::resources::{DesiredState, ResourceKey, ResourceKind, ResourceSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    #[default]
    Pending,
    Ready,
    Failed,
}

/// Resource as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedResource {
    pub key: ResourceKey,
    pub id: String,
    /// fingerprint of the document the resource was last applied from
    pub fingerprint: String,
    #[serde(default)]
    pub status: ResourceStatus,
    #[serde(default)]
    pub private_address: Option<Ipv4Addr>,
    #[serde(default)]
    pub public_address: Option<Ipv4Addr>,
    #[serde(default)]
    pub dns_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<ObservedResource>", into = "Vec<ObservedResource>")]
pub struct ObservedState {
    pub resources: BTreeMap<ResourceKey, ObservedResource>,
}

impl ObservedState {
    pub fn get(&self, key: &ResourceKey) -> Option<&ObservedResource> {
        self.resources.get(key)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

impl From<Vec<ObservedResource>> for ObservedState {
    fn from(value: Vec<ObservedResource>) -> Self {
        Self {
            resources: value
                .into_iter()
                .map(|resource| (resource.key.clone(), resource))
                .collect(),
        }
    }
}

impl From<ObservedState> for Vec<ObservedResource> {
    fn from(value: ObservedState) -> Self {
        value.resources.into_values().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Create(ResourceSpec),
    Update {
        spec: ResourceSpec,
        existing_id: String,
    },
    Destroy(ObservedResource),
}

impl Operation {
    pub fn key(&self) -> ResourceKey {
        match self {
            Operation::Create(spec) | Operation::Update { spec, .. } => spec.key(),
            Operation::Destroy(resource) => resource.key.clone(),
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            Operation::Create(_) => "create",
            Operation::Update { .. } => "update",
            Operation::Destroy(_) => "destroy",
        }
    }

    pub fn is_destroy(&self) -> bool {
        matches!(self, Operation::Destroy(_))
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.verb(), self.key())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisioningPlan {
    pub operations: Vec<Operation>,
    /// instances the provider knows about that the topology no longer wants
    pub orphans: Vec<ResourceKey>,
}

impl ProvisioningPlan {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Operations grouped into sequential stages.
    ///
    /// Creates and updates go first, lowest tier first. Destroys follow in
    /// reverse tier order, so dependents disappear before what they sit on.
    pub fn stages(&self) -> Vec<Vec<Operation>> {
        let (destroys, applies): (Vec<_>, Vec<_>) = self
            .operations
            .iter()
            .cloned()
            .partition(Operation::is_destroy);

        let group = |operations: Vec<Operation>| {
            operations
                .into_iter()
                .into_group_map_by(|operation| operation.key().kind.tier())
                .into_iter()
                .sorted_by_key(|(tier, _)| *tier)
                .map(|(_, operations)| operations)
                .collect::<Vec<_>>()
        };

        let mut stages = group(applies);
        stages.extend(group(destroys).into_iter().rev());

        stages
    }
}

/// Computes the minimal set of operations converging `observed` to `desired`.
///
/// Resources are updated when the fingerprint they were applied from differs
/// from the desired one, or when the provider reports them as failed.
/// Instances are never destroyed here, stale ones are reported as orphans.
pub fn compute_plan(desired: &DesiredState, observed: &ObservedState) -> ProvisioningPlan {
    let mut plan = ProvisioningPlan::default();
    let mut desired_keys = BTreeSet::new();

    for spec in &desired.resources {
        let key = spec.key();

        match observed.get(&key) {
            None => plan.operations.push(Operation::Create(spec.clone())),
            Some(resource)
                if resource.status == ResourceStatus::Failed
                    || resource.fingerprint != spec.fingerprint() =>
            {
                plan.operations.push(Operation::Update {
                    spec: spec.clone(),
                    existing_id: resource.id.clone(),
                })
            }
            Some(_) => {}
        }

        desired_keys.insert(key);
    }

    for (key, resource) in &observed.resources {
        if desired_keys.contains(key) {
            continue;
        }

        if key.kind == ResourceKind::Instance {
            plan.orphans.push(key.clone());
        } else {
            plan.operations.push(Operation::Destroy(resource.clone()));
        }
    }

    plan
}
