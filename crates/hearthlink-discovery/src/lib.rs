//! Hearthlink Discovery
//!
//! Maps a connecting peer's IP address to the hardware address of the device
//! behind it, and lists the devices the host currently sees on the LAN.
//! Both come from the kernel's ARP table via the `arp` tool.
//!
//! Lookups are best effort: loopback peers, peers on other subnets and hosts
//! without `arp` simply resolve to nothing.

mod arp;
mod error;

pub use arp::{
    parse_neighbor_line, parse_scan_output, ArpTable, NeighborTable, StaticNeighbors,
    RESOLVE_TIMEOUT, SCAN_TIMEOUT,
};
pub use error::{DiscoveryError, DiscoveryResult};
