use std::fmt::{Display, Formatter};

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::topology::NodeRole;

/// Installation progress of a single role.
///
/// ```text
/// not-started -> installing -> started -> verified
/// not-started -> started      (every task already converged)
/// installing | started -> failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoleState {
    #[default]
    NotStarted,
    Installing,
    Started,
    Verified,
    Failed,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Role '{role}' can't go from '{from}' to '{to}'!")]
pub struct InvalidTransition {
    pub role: NodeRole,
    pub from: RoleState,
    pub to: RoleState,
}

impl RoleState {
    pub fn can_transition_to(&self, next: RoleState) -> bool {
        matches!(
            (self, next),
            (RoleState::NotStarted, RoleState::Installing)
                | (RoleState::NotStarted, RoleState::Started)
                | (RoleState::Installing, RoleState::Started)
                | (RoleState::Installing, RoleState::Failed)
                | (RoleState::Started, RoleState::Verified)
                | (RoleState::Started, RoleState::Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RoleState::Verified | RoleState::Failed)
    }
}

impl Display for RoleState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RoleState::NotStarted => "not-started",
            RoleState::Installing => "installing",
            RoleState::Started => "started",
            RoleState::Verified => "verified",
            RoleState::Failed => "failed",
        })
    }
}

/// Role state that only moves along allowed transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleProgress {
    role: NodeRole,
    state: RoleState,
}

impl RoleProgress {
    pub fn new(role: NodeRole) -> Self {
        Self {
            role,
            state: RoleState::NotStarted,
        }
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn state(&self) -> RoleState {
        self.state
    }

    pub fn advance(&mut self, next: RoleState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                role: self.role,
                from: self.state,
                to: next,
            });
        }

        debug!("Role '{}': {} -> {next}", self.role, self.state);
        self.state = next;

        Ok(())
    }

    /// Marks the role as failed if it's still in flight; terminal states are kept.
    pub fn fail(&mut self) {
        if self.state.can_transition_to(RoleState::Failed) {
            self.state = RoleState::Failed;
        }
    }
}
