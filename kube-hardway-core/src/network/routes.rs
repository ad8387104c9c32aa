use std::{
    fmt::{Display, Formatter},
    net::Ipv4Addr,
};

use ipnet::Ipv4Net;
use itertools::Itertools;

use crate::{execution::shell_quote, inventory::InventoryHost, node::NodeId};

/// Route to another node's pod subnet, installed on `node`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PodRoute {
    pub node: NodeId,
    pub destination: Ipv4Net,
    pub gateway: Ipv4Addr,
}

impl PodRoute {
    pub fn command(&self) -> String {
        format!("ip route replace {} via {}", self.destination, self.gateway)
    }
}

impl Display for PodRoute {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} via {}",
            self.node, self.destination, self.gateway
        )
    }
}

/// Source NAT for traffic leaving the internal network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasqueradeRule {
    pub node: NodeId,
    /// traffic towards this range keeps its source address
    pub excluded: Ipv4Net,
    pub interface: String,
}

impl MasqueradeRule {
    fn spec(&self) -> String {
        format!(
            "POSTROUTING ! -d {} -o {} -j MASQUERADE",
            self.excluded,
            shell_quote(&self.interface)
        )
    }

    /// Appends the rule unless it's already present.
    pub fn command(&self) -> String {
        let spec = self.spec();

        format!("iptables -t nat -C {spec} 2>/dev/null || iptables -t nat -A {spec}")
    }
}

/// Every ordered pair of distinct hosts, each route leading to the other's subnet.
pub fn compute_routes(assigned: &[(InventoryHost, Ipv4Net)]) -> Vec<PodRoute> {
    assigned
        .iter()
        .permutations(2)
        .map(|pair| {
            let (local, _) = pair[0];
            let (remote, remote_subnet) = pair[1];

            PodRoute {
                node: local.id,
                destination: *remote_subnet,
                gateway: remote.address,
            }
        })
        .sorted()
        .collect()
}

pub fn compute_masquerade<'a>(
    hosts: impl IntoIterator<Item = &'a InventoryHost>,
    internal_network: Ipv4Net,
    interface: &str,
) -> Vec<MasqueradeRule> {
    hosts
        .into_iter()
        .map(|host| MasqueradeRule {
            node: host.id,
            excluded: internal_network,
            interface: interface.to_owned(),
        })
        .collect()
}

/// Gateway routes inside `pod_cidr` found in `ip -4 route show` output.
pub fn parse_gateway_routes(output: &str, pod_cidr: &Ipv4Net) -> Vec<(Ipv4Net, Ipv4Addr)> {
    output
        .lines()
        .filter_map(|line| {
            let mut words = line.split_whitespace();
            let destination = words.next()?.parse::<Ipv4Net>().ok()?;
            let gateway = words
                .skip_while(|word| *word != "via")
                .nth(1)?
                .parse::<Ipv4Addr>()
                .ok()?;

            pod_cidr
                .contains(&destination)
                .then_some((destination, gateway))
        })
        .collect()
}
