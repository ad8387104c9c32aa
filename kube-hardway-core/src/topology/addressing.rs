use std::net::Ipv4Addr;

use crate::error::ConfigurationError;

use super::{ClusterTopology, NodeRole, RoleSpec};

/// Number of node addresses a role's reserved range can hand out.
pub fn role_capacity(spec: &RoleSpec) -> u32 {
    let size = 1u64 << (32 - spec.address_range.prefix_len());

    size.saturating_sub(spec.first_host_offset as u64)
        .min(u32::MAX as u64) as u32
}

/// Static private address of the `index`-th node of `role`.
///
/// The address depends only on the role's reserved range and the index, so
/// re-running never moves an existing node and distinct roles can't collide
/// as long as their ranges don't overlap (checked by [`ClusterTopology::validate`]).
pub fn node_address(
    topology: &ClusterTopology,
    role: NodeRole,
    index: u32,
) -> Result<Ipv4Addr, ConfigurationError> {
    let spec = topology.role(role);
    let out_of_range = || ConfigurationError::NodeIndexOutOfRange { role, index };

    if index >= role_capacity(spec) {
        return Err(out_of_range());
    }

    let base = u32::from(spec.address_range.network());
    let address = base
        .checked_add(spec.first_host_offset)
        .and_then(|address| address.checked_add(index))
        .map(Ipv4Addr::from)
        .ok_or_else(out_of_range)?;

    // the network and broadcast addresses of the whole network are never assignable
    if address == topology.network_cidr.network() || address == topology.network_cidr.broadcast()
    {
        return Err(out_of_range());
    }

    Ok(address)
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, net::Ipv4Addr};

    use crate::{error::ConfigurationError, topology::tests::sample_topology};

    use super::{node_address, role_capacity, NodeRole};

    #[test]
    fn nth_node_gets_fixed_offset_within_role_range() {
        let topology = sample_topology();

        assert_eq!(
            node_address(&topology, NodeRole::Controller, 0).unwrap(),
            Ipv4Addr::new(10, 43, 0, 10)
        );
        assert_eq!(
            node_address(&topology, NodeRole::Etcd, 2).unwrap(),
            Ipv4Addr::new(10, 43, 0, 22)
        );
        assert_eq!(
            node_address(&topology, NodeRole::Worker, 1).unwrap(),
            Ipv4Addr::new(10, 43, 0, 33)
        );
    }

    #[test]
    fn addresses_are_stable_across_calls() {
        let topology = sample_topology();

        let first = node_address(&topology, NodeRole::Worker, 2).unwrap();
        let second = node_address(&topology, NodeRole::Worker, 2).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn valid_topology_never_assigns_the_same_address_twice() {
        let topology = sample_topology();
        let mut seen = HashSet::new();

        for (role, spec) in topology.roles() {
            for index in 0..spec.count {
                assert!(seen.insert(node_address(&topology, role, index).unwrap()));
            }
        }
    }

    #[test]
    fn index_past_capacity_is_rejected() {
        let topology = sample_topology();
        let capacity = role_capacity(&topology.controller);

        assert_eq!(
            node_address(&topology, NodeRole::Controller, capacity),
            Err(ConfigurationError::NodeIndexOutOfRange {
                role: NodeRole::Controller,
                index: capacity
            })
        );
    }

    #[test]
    fn network_address_is_never_assigned() {
        let mut topology = sample_topology();
        topology.controller.first_host_offset = 0;

        assert!(node_address(&topology, NodeRole::Controller, 0).is_err());
        assert_eq!(
            node_address(&topology, NodeRole::Controller, 1).unwrap(),
            Ipv4Addr::new(10, 43, 0, 1)
        );
    }
}
