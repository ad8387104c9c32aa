use thiserror::Error;

use crate::topology::NodeRole;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("Stage '{role}' depends on '{dependency}', which isn't part of the plan yet!")]
    UnknownDependency { role: NodeRole, dependency: NodeRole },
    #[error("Stage '{}' was added twice!", .0)]
    DuplicateStage(NodeRole),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub role: NodeRole,
    pub depends_on: Vec<NodeRole>,
}

/// Ordered installation stages.
///
/// A stage may only depend on stages added before it, so every plan is
/// acyclic and its order is a valid execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationPlan {
    stages: Vec<Stage>,
}

impl InstallationPlan {
    pub fn builder() -> InstallationPlanBuilder {
        InstallationPlanBuilder::default()
    }

    /// etcd, then the control plane, then workers.
    pub fn standard() -> Self {
        Self {
            stages: vec![
                Stage {
                    role: NodeRole::Etcd,
                    depends_on: vec![],
                },
                Stage {
                    role: NodeRole::Controller,
                    depends_on: vec![NodeRole::Etcd],
                },
                Stage {
                    role: NodeRole::Worker,
                    depends_on: vec![NodeRole::Controller],
                },
            ],
        }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage(&self, role: NodeRole) -> Option<&Stage> {
        self.stages.iter().find(|stage| stage.role == role)
    }

    /// Every role that transitively depends on `role`.
    pub fn dependents(&self, role: NodeRole) -> Vec<NodeRole> {
        let mut dependents = vec![role];

        // stages are topologically sorted, one forward pass is enough
        for stage in &self.stages {
            if stage
                .depends_on
                .iter()
                .any(|dependency| dependents.contains(dependency))
            {
                dependents.push(stage.role);
            }
        }

        dependents.remove(0);
        dependents
    }
}

#[derive(Debug, Default)]
pub struct InstallationPlanBuilder {
    stages: Vec<Stage>,
}

impl InstallationPlanBuilder {
    pub fn stage(
        &mut self,
        role: NodeRole,
        depends_on: &[NodeRole],
    ) -> Result<&mut Self, PlanError> {
        if self.stages.iter().any(|stage| stage.role == role) {
            return Err(PlanError::DuplicateStage(role));
        }

        for dependency in depends_on {
            if !self.stages.iter().any(|stage| stage.role == *dependency) {
                return Err(PlanError::UnknownDependency {
                    role,
                    dependency: *dependency,
                });
            }
        }

        self.stages.push(Stage {
            role,
            depends_on: depends_on.to_vec(),
        });

        Ok(self)
    }

    pub fn build(&self) -> InstallationPlan {
        InstallationPlan {
            stages: self.stages.clone(),
        }
    }
}
