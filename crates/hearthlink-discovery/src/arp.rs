//! ARP table lookups

use crate::error::{DiscoveryError, DiscoveryResult};
use async_trait::async_trait;
use hearthlink_core::protocol::LanDevice;
use hearthlink_core::MacAddress;
use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Time allowed for `arp -n <ip>`
pub const RESOLVE_TIMEOUT: Duration = Duration::from_secs(2);

/// Time allowed for `arp -a`
pub const SCAN_TIMEOUT: Duration = Duration::from_secs(5);

/// Source of IP to hardware address mappings
#[async_trait]
pub trait NeighborTable: Send + Sync {
    /// Hardware address of the device at `ip`, if known
    async fn resolve(&self, ip: &str) -> Option<MacAddress>;

    /// Every device currently in the table
    async fn scan(&self) -> Vec<LanDevice>;
}

/// Neighbor table backed by the system `arp` tool
#[derive(Debug, Clone)]
pub struct ArpTable {
    program: String,
}

impl Default for ArpTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ArpTable {
    pub fn new() -> Self {
        Self::with_program("arp")
    }

    /// Use a different executable with `arp`-compatible output
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Check if the arp tool can be run
    pub async fn is_available(&self) -> bool {
        self.run(&["-a"], SCAN_TIMEOUT).await.is_ok()
    }

    async fn lookup(&self, ip: &str) -> DiscoveryResult<Option<MacAddress>> {
        let addr: IpAddr = ip
            .parse()
            .map_err(|_| DiscoveryError::InvalidAddress(ip.to_string()))?;
        if addr.is_loopback() || addr.is_unspecified() {
            return Ok(None);
        }

        let output = self.run(&["-n", ip], RESOLVE_TIMEOUT).await?;
        Ok(output.lines().find_map(parse_neighbor_line))
    }

    async fn run(&self, args: &[&str], limit: Duration) -> DiscoveryResult<String> {
        let child = Command::new(&self.program).args(args).kill_on_drop(true).output();

        let output = tokio::time::timeout(limit, child)
            .await
            .map_err(|_| DiscoveryError::Timeout(limit))?
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => DiscoveryError::ArpNotFound,
                _ => DiscoveryError::Io(e),
            })?;

        if !output.status.success() {
            return Err(DiscoveryError::ArpCommand(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl NeighborTable for ArpTable {
    async fn resolve(&self, ip: &str) -> Option<MacAddress> {
        match self.lookup(ip).await {
            Ok(Some(mac)) => {
                debug!("ARP: {} is {}", ip, mac);
                Some(mac)
            }
            Ok(None) => {
                debug!("ARP: no entry for {}", ip);
                None
            }
            Err(e) => {
                debug!("ARP: lookup for {} failed: {}", ip, e);
                None
            }
        }
    }

    async fn scan(&self) -> Vec<LanDevice> {
        match self.run(&["-a"], SCAN_TIMEOUT).await {
            Ok(output) => {
                let devices = parse_scan_output(&output);
                debug!("ARP: found {} device(s)", devices.len());
                devices
            }
            Err(e) => {
                debug!("ARP: scan failed: {}", e);
                Vec::new()
            }
        }
    }
}

/// Fixed neighbor table, for tests and hosts without `arp`
#[derive(Debug, Clone, Default)]
pub struct StaticNeighbors {
    entries: Vec<LanDevice>,
}

impl StaticNeighbors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pattern: add an entry
    pub fn with_entry(mut self, ip: impl Into<String>, mac: MacAddress) -> Self {
        self.entries.push(LanDevice { ip: ip.into(), mac });
        self
    }
}

#[async_trait]
impl NeighborTable for StaticNeighbors {
    async fn resolve(&self, ip: &str) -> Option<MacAddress> {
        self.entries
            .iter()
            .find(|d| d.ip == ip)
            .map(|d| d.mac.clone())
    }

    async fn scan(&self) -> Vec<LanDevice> {
        self.entries.clone()
    }
}

/// First MAC-shaped token in a line of `arp -n` output
///
/// Linux prints `192.168.1.100  ether  aa:bb:cc:dd:ee:ff  C  eth0`.
pub fn parse_neighbor_line(line: &str) -> Option<MacAddress> {
    MacAddress::find_in(line)
}

/// Devices listed by `arp -a`
///
/// Lines look like `host (192.168.1.50) at aa:bb:cc:dd:ee:ff [ether] on eth0`.
/// Incomplete entries have no MAC and are skipped; an IP seen twice (one
/// entry per interface) is reported once.
pub fn parse_scan_output(output: &str) -> Vec<LanDevice> {
    let mut seen = HashSet::new();
    let mut devices = Vec::new();

    for line in output.lines() {
        let Some(ip) = parenthesized_ip(line) else {
            continue;
        };
        let Some(mac) = MacAddress::find_in(line) else {
            continue;
        };
        if seen.insert(ip.clone()) {
            devices.push(LanDevice { ip, mac });
        }
    }

    devices
}

fn parenthesized_ip(line: &str) -> Option<String> {
    let start = line.find('(')? + 1;
    let len = line[start..].find(')')?;
    let candidate = &line[start..start + len];
    candidate.parse::<IpAddr>().ok().map(|ip| ip.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(s: &str) -> MacAddress {
        MacAddress::parse(s).unwrap()
    }

    #[test]
    fn test_parse_neighbor_line() {
        let out = "Address                  HWtype  HWaddress           Flags Mask            Iface\n\
                   192.168.1.100            ether   AA:BB:CC:DD:EE:FF   C                     eth0\n";
        let found = out.lines().find_map(parse_neighbor_line);
        assert_eq!(found, Some(mac("aa:bb:cc:dd:ee:ff")));

        assert_eq!(
            parse_neighbor_line("192.168.1.7 (192.168.1.7) -- no entry"),
            None
        );
    }

    #[test]
    fn test_parse_scan_output() {
        let out = "\
router (192.168.1.1) at 11:22:33:44:55:66 [ether] on eth0
? (192.168.1.50) at aa:bb:cc:dd:ee:ff [ether] on eth0
? (192.168.1.51) at <incomplete> on eth0
? (192.168.1.50) at aa:bb:cc:dd:ee:ff [ether] on wlan0
garbage line
";
        let devices = parse_scan_output(out);
        assert_eq!(
            devices,
            vec![
                LanDevice {
                    ip: "192.168.1.1".into(),
                    mac: mac("11:22:33:44:55:66")
                },
                LanDevice {
                    ip: "192.168.1.50".into(),
                    mac: mac("aa:bb:cc:dd:ee:ff")
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_loopback_never_resolves() {
        let table = ArpTable::with_program("hearthlink-no-such-arp");
        assert_eq!(table.resolve("127.0.0.1").await, None);
        assert_eq!(table.resolve("::1").await, None);
    }

    #[tokio::test]
    async fn test_missing_tool_yields_nothing() {
        let table = ArpTable::with_program("hearthlink-no-such-arp");
        assert!(!table.is_available().await);
        assert_eq!(table.resolve("192.168.1.9").await, None);
        assert!(table.scan().await.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_non_ip_input() {
        let table = ArpTable::new();
        assert!(matches!(
            table.lookup("192.168.1.1; rm -rf /").await,
            Err(DiscoveryError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_static_neighbors() {
        let table = StaticNeighbors::new().with_entry("10.0.0.2", mac("aa:bb:cc:dd:ee:01"));
        assert_eq!(table.resolve("10.0.0.2").await, Some(mac("aa:bb:cc:dd:ee:01")));
        assert_eq!(table.resolve("10.0.0.3").await, None);
        assert_eq!(table.scan().await.len(), 1);
    }
}
