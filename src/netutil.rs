//! Host network helpers
//!
//! Default gateway discovery reads the kernel routing tables exposed under
//! `/proc/net`. On hosts without them discovery simply yields `None`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::debug;

const IPV4_ROUTE_TABLE: &str = "/proc/net/route";
const IPV6_ROUTE_TABLE: &str = "/proc/net/ipv6_route";

/// RTF_GATEWAY
const RTF_GATEWAY: u32 = 0x2;

/// Discover the host's default IPv4 (`ipv4 = true`) or IPv6 gateway
pub fn discover_gateway(ipv4: bool) -> Option<IpAddr> {
    let path = if ipv4 { IPV4_ROUTE_TABLE } else { IPV6_ROUTE_TABLE };

    let table = match std::fs::read_to_string(path) {
        Ok(table) => table,
        Err(e) => {
            debug!("cannot read {}: {}", path, e);
            return None;
        }
    };

    let gateway = if ipv4 {
        parse_ipv4_default_gateway(&table).map(IpAddr::V4)
    } else {
        parse_ipv6_default_gateway(&table).map(IpAddr::V6)
    };
    debug!(ipv4, gateway = ?gateway, "default gateway discovery");
    gateway
}

/// Find the default route's gateway in `/proc/net/route` content
pub fn parse_ipv4_default_gateway(table: &str) -> Option<Ipv4Addr> {
    table.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            return None;
        }

        let destination = u32::from_str_radix(fields[1], 16).ok()?;
        let gateway = u32::from_str_radix(fields[2], 16).ok()?;
        let flags = u32::from_str_radix(fields[3], 16).ok()?;
        let mask = u32::from_str_radix(fields[7], 16).ok()?;

        if destination != 0 || mask != 0 || flags & RTF_GATEWAY == 0 {
            return None;
        }
        // The kernel prints addresses in host (little-endian) order
        Some(Ipv4Addr::from(gateway.swap_bytes()))
    })
}

/// Find the default route's next hop in `/proc/net/ipv6_route` content
pub fn parse_ipv6_default_gateway(table: &str) -> Option<Ipv6Addr> {
    table.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            return None;
        }

        let destination = u128::from_str_radix(fields[0], 16).ok()?;
        let prefix_len = u8::from_str_radix(fields[1], 16).ok()?;
        let next_hop = u128::from_str_radix(fields[4], 16).ok()?;

        if destination != 0 || prefix_len != 0 || next_hop == 0 {
            return None;
        }
        Some(Ipv6Addr::from(next_hop))
    })
}
