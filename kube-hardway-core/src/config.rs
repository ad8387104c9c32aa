use std::{
    fs::File,
    path::{Path, PathBuf},
    time::Duration,
};

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    error::ConfigurationError,
    execution::SshConfig,
    helpers::With,
    installer::InstallerConfig,
    network::NetworkConfig,
    pki::SubjectAltName,
    provisioner::ProviderCommandConfig,
    retry::RetryPolicy,
    topology::ClusterTopology,
    CERTIFICATES_DIRECTORY, INVENTORY_FILENAME, KUBECONFIG_FILENAME, STATE_FILENAME,
};

pub const DEFAULT_CONFIG_FILENAME: &str = "kube-hardway.yaml";
pub const DEFAULT_STATE_DIRECTORY: &str = ".kube-hardway";

#[derive(Debug, Error)]
pub enum BootstrapConfigError {
    #[error("Io error: {}", .0)]
    IoError(std::io::Error),
    #[error("Serialization error: {}", .0)]
    SerializationError(serde_yaml::Error),
    #[error("Deserialization error: {}", .0)]
    DeserializationError(serde_yaml::Error),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapConfig {
    pub topology: ClusterTopology,
    /// relative paths are resolved against the directory of the config file
    #[serde(default = "default_state_directory")]
    pub state_directory: PathBuf,
    pub provider: ProviderCommandConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub installer: InstallerConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    /// names added to the server certificate on top of every node address
    #[serde(default)]
    pub extra_subject_alt_names: Vec<SubjectAltName>,
    #[serde(default = "default_provisioning_retry")]
    pub provisioning_retry: RetryPolicy,
}

fn default_state_directory() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_DIRECTORY)
}

fn default_provisioning_retry() -> RetryPolicy {
    RetryPolicy::exponential(4, Duration::from_secs(2), Duration::from_secs(30))
}

impl BootstrapConfig {
    /// Loads and validates the config, failing on any topology error.
    pub fn load(path: &Path) -> Result<Self, BootstrapConfigError> {
        debug!("Used config path: {path:?}");

        let file = File::open(path).map_err(BootstrapConfigError::IoError)?;
        let config: BootstrapConfig =
            serde_yaml::from_reader(file).map_err(BootstrapConfigError::DeserializationError)?;

        config.topology.validate()?;

        let base = path.parent().unwrap_or_else(|| Path::new(""));

        Ok(config.with(|config| {
            if config.state_directory.is_relative() {
                config.state_directory = base.join(&config.state_directory);
            }
        }))
    }

    pub fn save(&self, path: &Path) -> Result<(), BootstrapConfigError> {
        let file = File::options()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(BootstrapConfigError::IoError)?;

        serde_yaml::to_writer(file, self).map_err(BootstrapConfigError::SerializationError)?;

        Ok(())
    }

    pub fn cluster_name(&self) -> &str {
        &self.topology.name
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_directory.join(STATE_FILENAME)
    }

    pub fn inventory_path(&self) -> PathBuf {
        self.state_directory.join(INVENTORY_FILENAME)
    }

    pub fn kubeconfig_path(&self) -> PathBuf {
        self.state_directory.join(KUBECONFIG_FILENAME)
    }

    pub fn certificates_directory(&self) -> PathBuf {
        self.state_directory.join(CERTIFICATES_DIRECTORY)
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Write, path::Path, time::Duration};

    use crate::{error::ConfigurationError, pki::SubjectAltName};

    use super::{BootstrapConfig, BootstrapConfigError};

    const CONFIG: &str = "
topology:
  name: hardway
  networkCidr: 10.43.0.0/16
  etcd:
    count: 3
    addressRange: 10.43.0.16/28
    firstHostOffset: 4
  controller:
    count: 3
    addressRange: 10.43.0.0/28
    firstHostOffset: 10
  worker:
    count: 3
    addressRange: 10.43.0.32/27
  allowedIngress: 203.0.113.0/24
  podCidr: 10.200.0.0/16
  serviceCidr: 10.32.0.0/24
provider:
  command: /usr/local/bin/hardway-provider
  args: [--region, eu-west-1]
installer:
  readiness:
    attempts: 10
    delay: 3
network:
  pollInterval: 2.5
extraSubjectAltNames:
  - DNS:kubernetes.default
  - IP:10.32.0.1
";

    fn write_config(directory: &Path, contents: &str) -> std::path::PathBuf {
        let path = directory.join("kube-hardway.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn config_fills_defaults_and_resolves_state_directory() {
        let directory = tempfile::tempdir().unwrap();
        let path = write_config(directory.path(), CONFIG);

        let config = BootstrapConfig::load(&path).unwrap();

        assert_eq!(config.cluster_name(), "hardway");
        assert_eq!(config.state_directory, directory.path().join(".kube-hardway"));
        assert_eq!(
            config.state_path(),
            directory.path().join(".kube-hardway/state.yaml")
        );
        assert_eq!(config.provider.timeout, Duration::from_secs(600));
        assert_eq!(config.ssh.user, "ubuntu");
        assert_eq!(config.installer.readiness.attempts, 10);
        assert_eq!(config.installer.readiness.delay, Duration::from_secs(3));
        assert_eq!(config.installer.versions.kubernetes, "1.28.2");
        assert_eq!(config.network.poll_interval, Duration::from_millis(2500));
        assert_eq!(config.network.external_interface, "eth0");
        assert_eq!(
            config.extra_subject_alt_names,
            vec![
                SubjectAltName::Dns("kubernetes.default".to_owned()),
                SubjectAltName::Ip("10.32.0.1".parse().unwrap()),
            ]
        );
    }

    #[test]
    fn invalid_topology_is_rejected_on_load() {
        let directory = tempfile::tempdir().unwrap();
        let path = write_config(
            directory.path(),
            &CONFIG.replace("addressRange: 10.43.0.0/28", "addressRange: 10.43.0.16/28"),
        );

        assert!(matches!(
            BootstrapConfig::load(&path),
            Err(BootstrapConfigError::Configuration(
                ConfigurationError::OverlappingRoleRanges { .. }
            ))
        ));
    }

    #[test]
    fn saved_config_loads_back() {
        let directory = tempfile::tempdir().unwrap();
        let config = BootstrapConfig::load(&write_config(directory.path(), CONFIG)).unwrap();
        let path = directory.path().join("saved.yaml");

        config.save(&path).unwrap();

        assert_eq!(BootstrapConfig::load(&path).unwrap(), config);
    }
}
