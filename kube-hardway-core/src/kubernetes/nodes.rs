use std::net::Ipv4Addr;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use k8s_openapi::api::core::v1::Node;
use kube::{api::ListParams, Api, Client};
use log::debug;

use crate::network::{PodSubnetAssignment, PodSubnetSource};

const INTERNAL_IP_ADDRESS_TYPE: &str = "InternalIP";

/// Reads pod subnets allocated by the controller manager from `Node` objects.
pub struct KubePodSubnetSource {
    client: Client,
}

impl KubePodSubnetSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodSubnetSource for KubePodSubnetSource {
    async fn assignments(&self) -> anyhow::Result<Vec<PodSubnetAssignment>> {
        let node_api: Api<Node> = Api::all(self.client.clone());

        let assignments = node_api
            .list(&ListParams::default())
            .await?
            .into_iter()
            .filter_map(|node| try_get_assignment(&node))
            .collect();

        Ok(assignments)
    }
}

fn try_get_assignment(node: &Node) -> Option<PodSubnetAssignment> {
    let name = node.metadata.name.as_ref().or_else(|| {
        debug!("Skipping a node without a name!");
        None
    })?;

    let address = node
        .status
        .as_ref()
        .and_then(|status| status.addresses.as_ref())
        .and_then(|addresses| {
            addresses
                .iter()
                .find(|address| address.type_ == INTERNAL_IP_ADDRESS_TYPE)
        })
        .and_then(|address| {
            address
                .address
                .parse::<Ipv4Addr>()
                .map_err(|err| {
                    debug!("'{name}' has an invalid internal address: {err}");
                    err
                })
                .ok()
        });

    let pod_subnet = node
        .spec
        .as_ref()
        .and_then(|spec| spec.pod_cidr.as_ref())
        .or_else(|| {
            debug!("'{name}' doesn't have a pod CIDR yet");
            None
        })
        .and_then(|cidr| {
            cidr.parse::<Ipv4Net>()
                .map_err(|err| {
                    debug!("'{name}' pod CIDR is not a valid IPv4 CIDR: {err}");
                    err
                })
                .ok()
        });

    Some(PodSubnetAssignment {
        node: name.to_owned(),
        address,
        pod_subnet,
    })
}
