pub mod bootstrap;
pub mod decommission;
pub mod inventory;
pub mod kubeconfig;
pub mod plan;
pub mod routes;
pub mod smoke;
