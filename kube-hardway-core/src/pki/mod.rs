//! Certificate material shared by every cluster component.
//!
//! A single CA signs one server certificate, whose subject alternative names
//! cover every node address plus the API endpoint names, and one admin
//! client certificate used by the generated kubeconfig. The server request is
//! rendered into a canonical text form and fingerprinted, so re-running with
//! an unchanged address set keeps the already deployed certificates.

use std::{
    collections::BTreeSet,
    fmt::{Display, Formatter},
    net::IpAddr,
    str::FromStr,
};

use data_encoding::HEXLOWER;
use log::{debug, info};
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::node::{NodeId, NodeRecord};

pub mod store;

pub use store::BundleStore;

pub const CA_VALIDITY_DAYS: i64 = 10 * 365;
pub const CERT_VALIDITY_DAYS: i64 = 365;

pub const SERVER_COMMON_NAME: &str = "kubernetes";
pub const ADMIN_COMMON_NAME: &str = "admin";
pub const ADMIN_ORGANIZATION: &str = "system:masters";
pub const CLUSTER_ORGANIZATION: &str = "Kubernetes";

#[derive(Debug, Error)]
pub enum CertificationError {
    #[error("Node '{}' doesn't have a resolved address, the cluster can't be certified!", .0)]
    UnresolvedAddress(NodeId),
    #[error("No subject alternative names were provided!")]
    EmptySubjectAltNames,
    #[error("'{name}' is not a valid DNS name: {reason}")]
    InvalidDnsName { name: String, reason: String },
    #[error("'{}' is not a valid subject alternative name!", .0)]
    InvalidSubjectAltName(String),
    #[error("Key generation failed: {}", .0)]
    KeyGeneration(String),
    #[error("Certificate signing failed: {}", .0)]
    Signing(String),
    #[error("Couldn't parse the stored certificate material: {}", .0)]
    Parse(String),
    #[error("Io error: {}", .0)]
    Io(#[from] std::io::Error),
    #[error("Couldn't (de)serialize the bundle metadata: {}", .0)]
    Metadata(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SubjectAltName {
    Dns(String),
    Ip(IpAddr),
}

impl Display for SubjectAltName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SubjectAltName::Dns(name) => write!(f, "DNS:{name}"),
            SubjectAltName::Ip(address) => write!(f, "IP:{address}"),
        }
    }
}

impl FromStr for SubjectAltName {
    type Err = CertificationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("DNS", name)) if !name.is_empty() => Ok(SubjectAltName::Dns(name.to_owned())),
            Some(("IP", address)) => address
                .parse()
                .map(SubjectAltName::Ip)
                .map_err(|_| CertificationError::InvalidSubjectAltName(s.to_owned())),
            _ => Err(CertificationError::InvalidSubjectAltName(s.to_owned())),
        }
    }
}

impl TryFrom<String> for SubjectAltName {
    type Error = CertificationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SubjectAltName> for String {
    fn from(value: SubjectAltName) -> Self {
        value.to_string()
    }
}

impl From<IpAddr> for SubjectAltName {
    fn from(value: IpAddr) -> Self {
        SubjectAltName::Ip(value)
    }
}

impl SubjectAltName {
    /// Names given in configuration: IP literals become IP entries, anything else a DNS entry.
    pub fn from_name(name: &str) -> Self {
        match name.parse::<IpAddr>() {
            Ok(address) => SubjectAltName::Ip(address),
            Err(_) => SubjectAltName::Dns(name.to_owned()),
        }
    }

    fn to_san_type(&self) -> Result<SanType, CertificationError> {
        match self {
            SubjectAltName::Ip(address) => Ok(SanType::IpAddress(*address)),
            SubjectAltName::Dns(name) => Ia5String::try_from(name.clone())
                .map(SanType::DnsName)
                .map_err(|e| CertificationError::InvalidDnsName {
                    name: name.clone(),
                    reason: e.to_string(),
                }),
        }
    }
}

/// Collects the deduplicated union of every node address and the extra endpoint names.
///
/// Fails if any record lacks its private address, a partial topology can't be certified.
pub fn collect_subject_alt_names<'a>(
    records: impl IntoIterator<Item = &'a NodeRecord>,
    extra: impl IntoIterator<Item = SubjectAltName>,
) -> Result<BTreeSet<SubjectAltName>, CertificationError> {
    let mut names = BTreeSet::new();

    for record in records {
        let address = record
            .private_address
            .ok_or(CertificationError::UnresolvedAddress(record.id))?;

        names.insert(SubjectAltName::Ip(address.into()));

        if let Some(public_address) = record.public_address {
            names.insert(SubjectAltName::Ip(public_address.into()));
        }
    }

    names.extend(extra);

    Ok(names)
}

/// Self-signed root of the cluster's trust.
#[derive(Clone)]
pub struct CertificateAuthority {
    cert_pem: String,
    key_pem: String,
}

impl CertificateAuthority {
    pub fn new(common_name: &str) -> Result<Self, CertificationError> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name, CLUSTER_ORGANIZATION);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        (params.not_before, params.not_after) = validity(CA_VALIDITY_DAYS);

        let key_pair = generate_key("CA")?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CertificationError::Signing(format!("CA certificate: {e}")))?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, CertificationError> {
        KeyPair::from_pem(key_pem)
            .map_err(|e| CertificationError::Parse(format!("CA key: {e}")))?;

        Ok(Self {
            cert_pem: cert_pem.to_owned(),
            key_pem: key_pem.to_owned(),
        })
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    pub fn fingerprint(&self) -> String {
        HEXLOWER.encode(&Sha256::digest(self.cert_pem.as_bytes()))
    }

    /// Signs a leaf certificate, returning the certificate and its fresh private key.
    fn sign(&self, params: CertificateParams, what: &str) -> Result<(String, String), CertificationError> {
        let key_pair = generate_key(what)?;
        let ca_key = KeyPair::from_pem(&self.key_pem)
            .map_err(|e| CertificationError::Parse(format!("CA key: {e}")))?;
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &ca_key)
            .map_err(|e| CertificationError::Parse(format!("CA certificate: {e}")))?;
        let cert = params
            .signed_by(&key_pair, &issuer)
            .map_err(|e| CertificationError::Signing(format!("{what} certificate: {e}")))?;

        Ok((cert.pem(), key_pair.serialize_pem()))
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateBundle {
    pub ca_cert_pem: String,
    pub ca_key_pem: String,
    pub server_cert_pem: String,
    pub server_key_pem: String,
    pub admin_cert_pem: String,
    pub admin_key_pem: String,
    pub subject_alt_names: Vec<SubjectAltName>,
    /// digest of the rendered server request this bundle was signed from
    pub fingerprint: String,
}

impl std::fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("subject_alt_names", &self.subject_alt_names)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl CertificateBundle {
    pub fn authority(&self) -> Result<CertificateAuthority, CertificationError> {
        CertificateAuthority::from_pem(&self.ca_cert_pem, &self.ca_key_pem)
    }
}

#[derive(Debug)]
pub enum Certification {
    Generated(CertificateBundle),
    Unchanged(CertificateBundle),
}

impl Certification {
    pub fn bundle(&self) -> &CertificateBundle {
        match self {
            Certification::Generated(bundle) | Certification::Unchanged(bundle) => bundle,
        }
    }

    pub fn into_bundle(self) -> CertificateBundle {
        match self {
            Certification::Generated(bundle) | Certification::Unchanged(bundle) => bundle,
        }
    }

    pub fn is_generated(&self) -> bool {
        matches!(self, Certification::Generated(_))
    }
}

#[derive(Debug, Clone)]
pub struct PkiGenerator {
    pub cluster_name: String,
}

impl PkiGenerator {
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
        }
    }

    /// Produces a bundle whose server certificate covers exactly `names`.
    ///
    /// An existing CA is always reused. If the rendered request matches the
    /// existing bundle's fingerprint nothing is signed at all.
    pub fn certify(
        &self,
        names: &BTreeSet<SubjectAltName>,
        existing: Option<CertificateBundle>,
    ) -> Result<Certification, CertificationError> {
        if names.is_empty() {
            return Err(CertificationError::EmptySubjectAltNames);
        }

        let authority = match &existing {
            Some(bundle) => bundle.authority()?,
            None => {
                info!("Generating a new certificate authority for '{}'...", self.cluster_name);
                CertificateAuthority::new(&format!("{} CA", self.cluster_name))?
            }
        };

        let request = render_server_request(names, &authority);
        let fingerprint = HEXLOWER.encode(&Sha256::digest(request.as_bytes()));

        if let Some(bundle) = existing {
            if bundle.fingerprint == fingerprint {
                debug!("Server certificate request unchanged ({fingerprint}), skipping signing");

                return Ok(Certification::Unchanged(bundle));
            }

            info!("Server certificate request changed, re-signing with the existing CA...");
        }

        let (server_cert_pem, server_key_pem) =
            authority.sign(server_params(names)?, "server")?;
        let (admin_cert_pem, admin_key_pem) = authority.sign(admin_params(), "admin")?;

        info!(
            "Signed server certificate for {} subject alternative name(s)",
            names.len()
        );

        Ok(Certification::Generated(CertificateBundle {
            ca_cert_pem: authority.cert_pem().to_owned(),
            ca_key_pem: authority.key_pem().to_owned(),
            server_cert_pem,
            server_key_pem,
            admin_cert_pem,
            admin_key_pem,
            subject_alt_names: names.iter().cloned().collect(),
            fingerprint,
        }))
    }
}

/// Canonical text form of the server request; names come sorted out of the set.
pub fn render_server_request(
    names: &BTreeSet<SubjectAltName>,
    authority: &CertificateAuthority,
) -> String {
    let mut rendered = format!(
        "subject: CN={SERVER_COMMON_NAME},O={CLUSTER_ORGANIZATION}\nissuer: {}\n",
        authority.fingerprint()
    );

    for name in names {
        rendered.push_str("san: ");
        rendered.push_str(&name.to_string());
        rendered.push('\n');
    }

    rendered
}

fn server_params(names: &BTreeSet<SubjectAltName>) -> Result<CertificateParams, CertificationError> {
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(SERVER_COMMON_NAME, CLUSTER_ORGANIZATION);
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    // etcd peers and the API server use the same certificate on both ends
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    (params.not_before, params.not_after) = validity(CERT_VALIDITY_DAYS);
    params.subject_alt_names = names
        .iter()
        .map(SubjectAltName::to_san_type)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(params)
}

fn admin_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(ADMIN_COMMON_NAME, ADMIN_ORGANIZATION);
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    (params.not_before, params.not_after) = validity(CERT_VALIDITY_DAYS);

    params
}

fn distinguished_name(common_name: &str, organization: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_owned()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(organization.to_owned()),
    );

    dn
}

fn generate_key(what: &str) -> Result<KeyPair, CertificationError> {
    KeyPair::generate().map_err(|e| CertificationError::KeyGeneration(format!("{what} key: {e}")))
}

fn validity(days: i64) -> (time::OffsetDateTime, time::OffsetDateTime) {
    let now = time::OffsetDateTime::now_utc();

    (now, now + time::Duration::days(days))
}
