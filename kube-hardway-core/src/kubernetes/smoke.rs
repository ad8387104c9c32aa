use std::collections::BTreeMap;

use anyhow::anyhow;
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{Container, ContainerPort, Namespace, Node, PodSpec, PodTemplateSpec},
    },
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use kube::{
    api::{ListParams, PatchParams},
    core::ObjectMeta,
    Api, Client,
};
use log::{info, warn};

use crate::{
    kubernetes::operations::{apply_namespace, create_resource, delete_namespace},
    retry::{retry_with_backoff, RetryPolicy},
    FIELD_MANAGER,
};

pub const SMOKE_NAMESPACE: &str = "kube-hardway-smoke";
pub const SMOKE_DEPLOYMENT_NAME: &str = "nginx";
pub const SMOKE_IMAGE: &str = "nginx:1.25";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmokeReport {
    pub ready_nodes: Vec<String>,
    pub available_replicas: i32,
}

/// Checks that nodes registered and a workload can actually be scheduled and started.
pub async fn run_smoke_test(
    client: &Client,
    policy: &RetryPolicy,
    cleanup: bool,
) -> anyhow::Result<SmokeReport> {
    let node_api: Api<Node> = Api::all(client.clone());
    let ready_nodes = node_api
        .list(&ListParams::default())
        .await?
        .into_iter()
        .filter(is_node_ready)
        .filter_map(|node| node.metadata.name)
        .collect::<Vec<_>>();

    if ready_nodes.is_empty() {
        return Err(anyhow!("There are no ready nodes in the cluster!"));
    }

    info!("{} node(s) are ready", ready_nodes.len());

    let patch_params = PatchParams::apply(FIELD_MANAGER);
    apply_namespace(client, &patch_params, &smoke_namespace()).await?;
    create_resource(client, &nginx_deployment(SMOKE_NAMESPACE), &patch_params).await?;

    let deployment_api: Api<Deployment> = Api::namespaced(client.clone(), SMOKE_NAMESPACE);
    let available_replicas = retry_with_backoff(
        policy,
        &format!("Waiting for '{SMOKE_DEPLOYMENT_NAME}' deployment"),
        || async {
            let deployment = deployment_api.get(SMOKE_DEPLOYMENT_NAME).await?;

            match available_replicas(&deployment) {
                0 => Err(anyhow!("'{SMOKE_DEPLOYMENT_NAME}' has no available replicas yet")),
                available => Ok(available),
            }
        },
    )
    .await
    .map_err(|error| anyhow!("Smoke test deployment never became available! {error}"))?;

    info!("'{SMOKE_DEPLOYMENT_NAME}' deployment is available ({available_replicas} replica(s))");

    if cleanup {
        match delete_namespace(client, SMOKE_NAMESPACE).await {
            Ok(true) => info!("Smoke test workload removed"),
            Ok(false) => warn!("'{SMOKE_NAMESPACE}' namespace was already gone"),
            Err(error) => warn!("Smoke test workload is left behind! {error:#}"),
        }
    }

    Ok(SmokeReport {
        ready_nodes,
        available_replicas,
    })
}

/// Namespace of the smoke workload, labelled as owned by this tool.
pub fn smoke_namespace() -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(SMOKE_NAMESPACE.to_owned()),
            labels: Some(BTreeMap::from([(
                "app.kubernetes.io/managed-by".to_owned(),
                FIELD_MANAGER.to_owned(),
            )])),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn nginx_deployment(namespace: &str) -> Deployment {
    let labels = BTreeMap::from([("app".to_owned(), SMOKE_DEPLOYMENT_NAME.to_owned())]);

    Deployment {
        metadata: ObjectMeta {
            name: Some(SMOKE_DEPLOYMENT_NAME.to_owned()),
            namespace: Some(namespace.to_owned()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_expressions: None,
                match_labels: Some(labels.clone()),
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: SMOKE_DEPLOYMENT_NAME.to_owned(),
                        image: Some(SMOKE_IMAGE.to_owned()),
                        image_pull_policy: Some("IfNotPresent".to_owned()),
                        ports: Some(vec![ContainerPort {
                            container_port: 80,
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == "Ready" && condition.status == "True")
        })
        .unwrap_or(false)
}

fn available_replicas(deployment: &Deployment) -> i32 {
    deployment
        .status
        .as_ref()
        .and_then(|status| status.available_replicas)
        .unwrap_or(0)
}
