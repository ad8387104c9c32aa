use data_encoding::BASE64;
use kube::config::{AuthInfo, Cluster, Context, Kubeconfig, NamedAuthInfo, NamedCluster, NamedContext};

use crate::pki::CertificateBundle;

pub const ADMIN_USER: &str = "admin";

/// Kubeconfig authenticating as the bundle's admin client against `server`.
pub fn admin(cluster: &str, server: &str, bundle: &CertificateBundle) -> Kubeconfig {
    let context = format!("{ADMIN_USER}@{cluster}");

    Kubeconfig {
        api_version: Some("v1".to_owned()),
        kind: Some("Config".to_owned()),
        clusters: vec![NamedCluster {
            name: cluster.to_owned(),
            cluster: Some(Cluster {
                server: Some(server.to_owned()),
                certificate_authority_data: Some(BASE64.encode(bundle.ca_cert_pem.as_bytes())),
                ..Default::default()
            }),
        }],
        auth_infos: vec![NamedAuthInfo {
            name: ADMIN_USER.to_owned(),
            auth_info: Some(AuthInfo {
                client_certificate_data: Some(BASE64.encode(bundle.admin_cert_pem.as_bytes())),
                // parsing into a SecretString can't fail
                client_key_data: BASE64.encode(bundle.admin_key_pem.as_bytes()).parse().ok(),
                ..Default::default()
            }),
        }],
        contexts: vec![NamedContext {
            name: context.clone(),
            context: Some(Context {
                cluster: cluster.to_owned(),
                user: ADMIN_USER.to_owned(),
                ..Default::default()
            }),
        }],
        current_context: Some(context),
        ..Default::default()
    }
}

pub fn render(kubeconfig: &Kubeconfig) -> Result<String, serde_yaml::Error> {
    serde_yaml::to_string(kubeconfig)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use data_encoding::BASE64;
    use kube::config::Kubeconfig;

    use crate::pki::{CertificateBundle, PkiGenerator, SubjectAltName};

    use super::{admin, render};

    fn bundle() -> CertificateBundle {
        let names = BTreeSet::from([SubjectAltName::from_name("10.43.0.10")]);
        PkiGenerator::new("hardway")
            .certify(&names, None)
            .unwrap()
            .into_bundle()
    }

    #[test]
    fn admin_kubeconfig_embeds_ca_and_client_credentials() {
        let bundle = bundle();

        let rendered = render(&admin("hardway", "https://10.43.0.10:6443", &bundle)).unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();

        assert_eq!(parsed["apiVersion"], "v1");
        assert_eq!(parsed["kind"], "Config");
        assert_eq!(parsed["current-context"], "admin@hardway");
        assert_eq!(
            parsed["clusters"][0]["cluster"]["server"],
            "https://10.43.0.10:6443"
        );

        let key = parsed["users"][0]["user"]["client-key-data"].as_str().unwrap();
        assert_eq!(
            BASE64.decode(key.as_bytes()).unwrap(),
            bundle.admin_key_pem.as_bytes()
        );
    }

    #[test]
    fn rendered_kubeconfig_round_trips_through_kube() {
        let bundle = bundle();
        let rendered = render(&admin("hardway", "https://10.43.0.10:6443", &bundle)).unwrap();

        let parsed = Kubeconfig::from_yaml(&rendered).unwrap();

        assert_eq!(parsed.current_context.as_deref(), Some("admin@hardway"));
        assert_eq!(parsed.contexts[0].context.as_ref().unwrap().user, "admin");

        let cluster = parsed.clusters[0].cluster.as_ref().unwrap();
        assert_eq!(cluster.server.as_deref(), Some("https://10.43.0.10:6443"));
        assert_eq!(
            BASE64
                .decode(cluster.certificate_authority_data.as_ref().unwrap().as_bytes())
                .unwrap(),
            bundle.ca_cert_pem.as_bytes()
        );
    }
}
