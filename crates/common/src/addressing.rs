//! Address derivation: base network plus node offset

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnetwork::IpNetwork;

use crate::{Error, Result};

/// Network address of `net` advanced by `offset`.
///
/// Fails when `net` has host bits set or the result leaves the network.
pub fn offset_address(net: &IpNetwork, offset: u32) -> Result<IpAddr> {
    if net.ip() != net.network() {
        return Err(Error::config(format!("{net} has host bits set")));
    }
    let addr = match net.network() {
        IpAddr::V4(base) => u32::from(base)
            .checked_add(offset)
            .map(|n| IpAddr::V4(Ipv4Addr::from(n))),
        IpAddr::V6(base) => u128::from(base)
            .checked_add(u128::from(offset))
            .map(|n| IpAddr::V6(Ipv6Addr::from(n))),
    };
    match addr {
        Some(addr) if net.contains(addr) => Ok(addr),
        _ => Err(Error::config(format!(
            "offset {offset} does not fit into {net}"
        ))),
    }
}

/// `192.0.2.11/32` / `fd00::b/128`
pub fn host_route(net: &IpNetwork, offset: u32) -> Result<String> {
    let addr = offset_address(net, offset)?;
    let len = if addr.is_ipv4() { 32 } else { 128 };
    Ok(format!("{addr}/{len}"))
}

/// `fe80::b/64`: the derived address with the prefix length of its network
pub fn in_network(net: &IpNetwork, offset: u32) -> Result<String> {
    Ok(format!("{}/{}", offset_address(net, offset)?, net.prefix()))
}

/// Plain address without prefix
pub fn address(net: &IpNetwork, offset: u32) -> Result<String> {
    Ok(offset_address(net, offset)?.to_string())
}

/// Link-local network used for the management interface and transfer links
pub const LINK_LOCAL_NET: &str = "fe80::/64";

fn link_local_net() -> Result<IpNetwork> {
    LINK_LOCAL_NET
        .parse()
        .map_err(|e| Error::config(format!("{LINK_LOCAL_NET}: {e}")))
}

/// Link-local address of a node on the management interface (`fe80::b/64` for node 11)
pub fn mgmt_link_local(node_id: u32) -> Result<String> {
    in_network(&link_local_net()?, node_id)
}

/// Host route of a node's link-local address (`fe80::b/128`)
pub fn mgmt_allowed_ip(node_id: u32) -> Result<String> {
    host_route(&link_local_net()?, node_id)
}

/// Management address of a node as reachable through the management interface
pub fn mgmt_address(node_id: u32, interface: &str) -> Result<String> {
    Ok(format!("{}%{interface}", address(&link_local_net()?, node_id)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    #[test]
    fn test_ipv4_offset() {
        let base = net("192.0.2.0/24");
        assert_eq!(address(&base, 11).unwrap(), "192.0.2.11");
        assert_eq!(host_route(&base, 11).unwrap(), "192.0.2.11/32");
        assert_eq!(in_network(&base, 11).unwrap(), "192.0.2.11/24");
    }

    #[test]
    fn test_ipv6_offset_is_numeric() {
        let base = net("fd3e:970c:e7ec:edb5::/64");
        assert_eq!(host_route(&base, 11).unwrap(), "fd3e:970c:e7ec:edb5::b/128");
        assert_eq!(in_network(&net("fe80::/64"), 12).unwrap(), "fe80::c/64");
    }

    #[test]
    fn test_offset_out_of_network() {
        assert!(offset_address(&net("192.0.2.0/28"), 16).is_err());
        assert!(offset_address(&net("192.0.2.1/24"), 1).is_err());
    }

    #[test]
    fn test_mgmt_address() {
        assert_eq!(mgmt_address(11, "tlwg_mgmt").unwrap(), "fe80::b%tlwg_mgmt");
        assert_eq!(mgmt_link_local(11).unwrap(), "fe80::b/64");
        assert_eq!(mgmt_allowed_ip(11).unwrap(), "fe80::b/128");
    }
}
