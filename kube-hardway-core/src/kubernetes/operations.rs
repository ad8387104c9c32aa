use std::fmt::Debug;

use anyhow::{anyhow, Context};
use k8s_openapi::{
    api::core::v1::Namespace,
    serde::{de::DeserializeOwned, Serialize},
    Metadata, NamespaceResourceScope,
};
use kube::{
    api::{DeleteParams, Patch, PatchParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::ObjectMeta,
    Api, Client, Config, Resource,
};
use log::info;

use crate::helpers::{pretty_type_name, RequireMetadata};

/// Builds a client from an in-memory kubeconfig document.
pub async fn create_client(kubeconfig: &str) -> anyhow::Result<Client> {
    let kubeconfig =
        Kubeconfig::from_yaml(kubeconfig).context("Couldn't parse the generated kubeconfig!")?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
    let client = Client::try_from(config)?;

    Ok(client)
}

/// Server-side applies `namespace`, creating it when it's missing.
pub async fn apply_namespace(
    client: &Client,
    patch_params: &PatchParams,
    namespace: &Namespace,
) -> anyhow::Result<()> {
    let name = namespace.require_name_or_else(|| anyhow!("Namespace is missing a name!"))?;
    let namespace_api: Api<Namespace> = Api::all(client.clone());

    info!("Applying '{name}' namespace...");
    namespace_api
        .patch(name, patch_params, &Patch::Apply(namespace))
        .await
        .with_context(|| format!("Couldn't apply '{name}' namespace!"))?;

    Ok(())
}

/// Deletes a namespace with everything in it, `false` meaning it was already gone.
pub async fn delete_namespace(client: &Client, name: &str) -> anyhow::Result<bool> {
    let namespace_api: Api<Namespace> = Api::all(client.clone());

    info!("Deleting '{name}' namespace...");
    match namespace_api.delete(name, &DeleteParams::background()).await {
        Ok(_) => Ok(true),
        Err(error) if is_not_found(&error) => Ok(false),
        Err(error) => Err(error).with_context(|| format!("Couldn't delete '{name}' namespace!")),
    }
}

pub fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}

pub async fn create_resource<T>(
    client: &Client,
    resource: &T,
    patch_params: &PatchParams,
) -> anyhow::Result<()>
where
    T: Metadata<Ty = ObjectMeta>
        + Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Serialize
        + Clone
        + DeserializeOwned
        + Debug,
{
    let resource_name = resource
        .require_name_or_else(|| anyhow!("{} is missing a name!", pretty_type_name::<T>()))?;

    info!(
        "Creating '{resource_name}' {} resource on the cluster...",
        pretty_type_name::<T>()
    );

    let namespace = resource
        .metadata()
        .namespace
        .as_ref()
        .ok_or_else(|| anyhow!("'{resource_name}' is missing a namespace!"))?;
    let resource_api: Api<T> = Api::namespaced(client.clone(), namespace);
    resource_api
        .patch(resource_name, patch_params, &Patch::Apply(resource))
        .await
        .context(format!(
            "Unable to create '{resource_name}' {} resource!",
            pretty_type_name::<T>()
        ))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use kube::error::ErrorResponse;

    use super::is_not_found;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_owned(),
            message: format!("namespaces \"kube-hardway-smoke\" {reason}"),
            reason: reason.to_owned(),
            code,
        })
    }

    #[test]
    fn only_a_404_counts_as_already_gone() {
        assert!(is_not_found(&api_error(404, "NotFound")));
        assert!(!is_not_found(&api_error(409, "Conflict")));
        assert!(!is_not_found(&api_error(403, "Forbidden")));
    }
}
