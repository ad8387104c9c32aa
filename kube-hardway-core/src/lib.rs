pub mod config;
pub mod error;
pub mod execution;
pub mod helpers;
pub mod installer;
pub mod inventory;
pub mod kubernetes;
pub mod lock;
pub mod network;
pub mod node;
pub mod orchestrator;
pub mod pki;
pub mod provisioner;
pub mod retry;
pub mod state;
pub mod topology;

#[cfg(test)]
pub(crate) mod testing;

pub const FIELD_MANAGER: &str = "kube-hardway";

pub const STATE_FILENAME: &str = "state.yaml";
pub const INVENTORY_FILENAME: &str = "hosts.ini";
pub const KUBECONFIG_FILENAME: &str = "admin.kubeconfig";
pub const CERTIFICATES_DIRECTORY: &str = "pki";
