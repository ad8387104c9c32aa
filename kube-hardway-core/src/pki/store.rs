use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::helpers::write_with_mode;

use super::{CertificateBundle, CertificationError, SubjectAltName};

pub const CA_CERT_FILENAME: &str = "ca.pem";
pub const CA_KEY_FILENAME: &str = "ca-key.pem";
pub const SERVER_CERT_FILENAME: &str = "kubernetes.pem";
pub const SERVER_KEY_FILENAME: &str = "kubernetes-key.pem";
pub const ADMIN_CERT_FILENAME: &str = "admin.pem";
pub const ADMIN_KEY_FILENAME: &str = "admin-key.pem";
pub const METADATA_FILENAME: &str = "bundle.yaml";

const CERT_MODE: u32 = 0o644;
const KEY_MODE: u32 = 0o600;

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BundleMetadata {
    fingerprint: String,
    subject_alt_names: Vec<SubjectAltName>,
}

/// On-disk home of the certificate bundle. Private keys are only ever readable by the owner.
#[derive(Debug, Clone)]
pub struct BundleStore {
    directory: PathBuf,
}

impl BundleStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub async fn load(&self) -> Result<Option<CertificateBundle>, CertificationError> {
        let metadata = match tokio::fs::read_to_string(self.directory.join(METADATA_FILENAME)).await {
            Ok(raw) => serde_yaml::from_str::<BundleMetadata>(&raw)?,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                debug!("No certificate bundle in '{}'", self.directory.display());
                return Ok(None);
            }
            Err(error) => return Err(error.into()),
        };

        Ok(Some(CertificateBundle {
            ca_cert_pem: self.read(CA_CERT_FILENAME).await?,
            ca_key_pem: self.read(CA_KEY_FILENAME).await?,
            server_cert_pem: self.read(SERVER_CERT_FILENAME).await?,
            server_key_pem: self.read(SERVER_KEY_FILENAME).await?,
            admin_cert_pem: self.read(ADMIN_CERT_FILENAME).await?,
            admin_key_pem: self.read(ADMIN_KEY_FILENAME).await?,
            subject_alt_names: metadata.subject_alt_names,
            fingerprint: metadata.fingerprint,
        }))
    }

    pub async fn save(&self, bundle: &CertificateBundle) -> Result<(), CertificationError> {
        info!("Writing certificate bundle to '{}'...", self.directory.display());

        tokio::fs::create_dir_all(&self.directory).await?;

        self.write(CA_CERT_FILENAME, &bundle.ca_cert_pem, CERT_MODE).await?;
        self.write(CA_KEY_FILENAME, &bundle.ca_key_pem, KEY_MODE).await?;
        self.write(SERVER_CERT_FILENAME, &bundle.server_cert_pem, CERT_MODE).await?;
        self.write(SERVER_KEY_FILENAME, &bundle.server_key_pem, KEY_MODE).await?;
        self.write(ADMIN_CERT_FILENAME, &bundle.admin_cert_pem, CERT_MODE).await?;
        self.write(ADMIN_KEY_FILENAME, &bundle.admin_key_pem, KEY_MODE).await?;

        // metadata goes last, a bundle without it is treated as absent
        let metadata = serde_yaml::to_string(&BundleMetadata {
            fingerprint: bundle.fingerprint.clone(),
            subject_alt_names: bundle.subject_alt_names.clone(),
        })?;
        self.write(METADATA_FILENAME, &metadata, CERT_MODE).await?;

        Ok(())
    }

    async fn read(&self, filename: &str) -> Result<String, CertificationError> {
        Ok(tokio::fs::read_to_string(self.directory.join(filename)).await?)
    }

    async fn write(&self, filename: &str, contents: &str, mode: u32) -> Result<(), CertificationError> {
        Ok(write_with_mode(&self.directory.join(filename), contents, mode).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use crate::pki::{PkiGenerator, SubjectAltName};

    use super::{BundleStore, CA_KEY_FILENAME, SERVER_CERT_FILENAME, SERVER_KEY_FILENAME};

    #[tokio::test]
    async fn missing_bundle_loads_as_none() {
        let directory = tempfile::tempdir().unwrap();

        let store = BundleStore::new(directory.path().join("pki"));

        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn saved_bundle_loads_back_identically() {
        let directory = tempfile::tempdir().unwrap();
        let store = BundleStore::new(directory.path().join("pki"));
        let names = BTreeSet::from([SubjectAltName::from_name("10.43.0.10")]);
        let bundle = PkiGenerator::new("hardway")
            .certify(&names, None)
            .unwrap()
            .into_bundle();

        store.save(&bundle).await.unwrap();

        assert_eq!(store.load().await.unwrap(), Some(bundle));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn private_keys_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let directory = tempfile::tempdir().unwrap();
        let store = BundleStore::new(directory.path());
        let names = BTreeSet::from([SubjectAltName::from_name("10.43.0.10")]);
        let bundle = PkiGenerator::new("hardway")
            .certify(&names, None)
            .unwrap()
            .into_bundle();

        store.save(&bundle).await.unwrap();

        let mode = |filename: &str| {
            std::fs::metadata(directory.path().join(filename))
                .unwrap()
                .permissions()
                .mode()
                & 0o777
        };

        assert_eq!(mode(CA_KEY_FILENAME), 0o600);
        assert_eq!(mode(SERVER_KEY_FILENAME), 0o600);
        assert_eq!(mode(SERVER_CERT_FILENAME), 0o644);
    }
}
