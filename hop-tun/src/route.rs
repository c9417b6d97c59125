//! Physical default route selection
//!
//! This module finds the IPv4 default route a packet would take if the tunnel
//! did not exist. The selection runs over a snapshot of the forwarding table
//! and is recomputed on every call, since the physical route can change at any
//! time (Wi-Fi/Ethernet failover).

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use ipnet::IpNet;

use crate::error::{Error, Result};

/// One forwarding-table entry as reported by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardEntry {
    /// Interface alias (friendly name, e.g. "Wi-Fi", "eth0")
    pub interface_alias: String,
    /// Destination prefix
    pub destination: IpNet,
    /// Next hop; unspecified for on-link routes
    pub next_hop: IpAddr,
    /// Effective metric (lower = higher priority)
    pub metric: u32,
}

impl ForwardEntry {
    /// Create a new forwarding entry
    pub fn new(
        interface_alias: impl Into<String>,
        destination: IpNet,
        next_hop: IpAddr,
        metric: u32,
    ) -> Self {
        Self {
            interface_alias: interface_alias.into(),
            destination,
            next_hop,
            metric,
        }
    }

    /// Add the owning interface's metric; Windows ranks routes by the sum
    pub fn with_interface_metric(mut self, interface_metric: u32) -> Self {
        self.metric = self.metric.saturating_add(interface_metric);
        self
    }

    /// Whether this entry is the IPv4 default route
    pub fn is_ipv4_default(&self) -> bool {
        matches!(self.destination, IpNet::V4(net) if net.prefix_len() == 0 && net.addr().is_unspecified())
    }

    /// The IPv4 gateway, if the next hop is a real IPv4 gateway
    fn ipv4_gateway(&self) -> Option<Ipv4Addr> {
        match self.next_hop {
            IpAddr::V4(gw) if !gw.is_unspecified() => Some(gw),
            _ => None,
        }
    }
}

impl fmt::Display for ForwardEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} via {} dev {} metric {}",
            self.destination, self.next_hop, self.interface_alias, self.metric
        )
    }
}

/// The selected physical default route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInfo {
    pub gateway: Ipv4Addr,
    pub interface_alias: String,
    pub metric: u32,
}

impl fmt::Display for RouteInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "default via {} dev {} metric {}",
            self.gateway, self.interface_alias, self.metric
        )
    }
}

/// Read-only view of the host's IPv4 forwarding table
pub trait RouteTable: Send + Sync {
    fn ipv4_forward_entries(&self) -> Result<Vec<ForwardEntry>>;
}

/// A fixed list of entries
#[derive(Debug, Clone, Default)]
pub struct StaticRouteTable {
    entries: Vec<ForwardEntry>,
}

impl StaticRouteTable {
    pub fn new(entries: Vec<ForwardEntry>) -> Self {
        Self { entries }
    }
}

impl RouteTable for StaticRouteTable {
    fn ipv4_forward_entries(&self) -> Result<Vec<ForwardEntry>> {
        Ok(self.entries.clone())
    }
}

/// The running host's forwarding table
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRouteTable;

impl RouteTable for SystemRouteTable {
    #[cfg(target_os = "windows")]
    fn ipv4_forward_entries(&self) -> Result<Vec<ForwardEntry>> {
        crate::windows::ipv4_forward_entries()
    }

    #[cfg(target_os = "linux")]
    fn ipv4_forward_entries(&self) -> Result<Vec<ForwardEntry>> {
        crate::linux::ipv4_forward_entries()
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux")))]
    fn ipv4_forward_entries(&self) -> Result<Vec<ForwardEntry>> {
        Err(Error::NotSupported(
            "forwarding table enumeration is not available on this platform".into(),
        ))
    }
}

/// Pick the preferred physical default route out of `entries`
///
/// Keeps IPv4 `0.0.0.0/0` entries, drops the excluded alias (compared
/// case-insensitively, as Windows aliases are) and entries without a real IPv4
/// next hop, then takes the lowest metric. Ties go to the first entry.
pub fn select_best_route<'a, I>(entries: I, exclude_alias: Option<&str>) -> Option<RouteInfo>
where
    I: IntoIterator<Item = &'a ForwardEntry>,
{
    let mut best: Option<(&ForwardEntry, Ipv4Addr)> = None;

    for entry in entries {
        if !entry.is_ipv4_default() {
            continue;
        }
        if exclude_alias.is_some_and(|alias| entry.interface_alias.eq_ignore_ascii_case(alias)) {
            continue;
        }
        let Some(gateway) = entry.ipv4_gateway() else {
            continue;
        };

        // Strict comparison keeps the first entry on ties
        if best.map_or(true, |(current, _)| entry.metric < current.metric) {
            best = Some((entry, gateway));
        }
    }

    best.map(|(entry, gateway)| RouteInfo {
        gateway,
        interface_alias: entry.interface_alias.clone(),
        metric: entry.metric,
    })
}

/// Queries the forwarding table for the physical default route
#[derive(Clone)]
pub struct RouteSelector {
    table: Arc<dyn RouteTable>,
}

impl Default for RouteSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RouteSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteSelector").finish_non_exhaustive()
    }
}

impl RouteSelector {
    /// Selector over the running host's forwarding table
    pub fn new() -> Self {
        Self::with_table(Arc::new(SystemRouteTable))
    }

    /// Selector over a custom table
    pub fn with_table(table: Arc<dyn RouteTable>) -> Self {
        Self { table }
    }

    /// The preferred non-tunnel IPv4 default route
    ///
    /// `exclude_alias` is normally the tunnel adapter's own name. Fails with
    /// [`Error::RouteNotFound`] when no candidate survives filtering.
    pub fn best_physical_route(&self, exclude_alias: Option<&str>) -> Result<RouteInfo> {
        let entries = self.table.ipv4_forward_entries()?;
        log::debug!("Scanning {} IPv4 forwarding entries", entries.len());

        match select_best_route(&entries, exclude_alias) {
            Some(route) => {
                log::debug!("Physical route: {}", route);
                Ok(route)
            }
            None => Err(Error::RouteNotFound(match exclude_alias {
                Some(alias) => format!("no IPv4 default route outside '{}'", alias),
                None => "no IPv4 default route".to_string(),
            })),
        }
    }

    /// Gateway of the preferred physical default route
    pub fn physical_gateway_ipv4(&self, exclude_alias: Option<&str>) -> Result<Ipv4Addr> {
        Ok(self.best_physical_route(exclude_alias)?.gateway)
    }

    /// Interface alias of the preferred physical default route
    pub fn physical_interface_name(&self, exclude_alias: Option<&str>) -> Result<String> {
        Ok(self.best_physical_route(exclude_alias)?.interface_alias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_via(alias: &str, gw: &str, metric: u32) -> ForwardEntry {
        ForwardEntry::new(alias, "0.0.0.0/0".parse().unwrap(), gw.parse().unwrap(), metric)
    }

    fn selector(entries: Vec<ForwardEntry>) -> RouteSelector {
        RouteSelector::with_table(Arc::new(StaticRouteTable::new(entries)))
    }

    #[test]
    fn test_lowest_metric_wins() {
        let selector = selector(vec![
            default_via("Ethernet", "192.168.1.1", 25),
            default_via("Wi-Fi", "10.0.0.1", 35),
        ]);
        let route = selector.best_physical_route(None).unwrap();
        assert_eq!(route.gateway, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(route.interface_alias, "Ethernet");
        assert_eq!(route.metric, 25);
    }

    #[test]
    fn test_tunnel_alias_excluded_even_with_lowest_metric() {
        let selector = selector(vec![
            default_via("ruhop", "10.66.0.1", 1),
            default_via("Ethernet", "192.168.1.1", 25),
        ]);
        let route = selector.best_physical_route(Some("ruhop")).unwrap();
        assert_eq!(route.interface_alias, "Ethernet");

        // Alias comparison ignores case
        let route = selector.best_physical_route(Some("RUHOP")).unwrap();
        assert_eq!(route.interface_alias, "Ethernet");
    }

    #[test]
    fn test_on_link_only_is_not_found() {
        let selector = selector(vec![default_via("Ethernet", "0.0.0.0", 10)]);
        let err = selector.best_physical_route(None).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_non_default_and_ipv6_entries_ignored() {
        let selector = selector(vec![
            ForwardEntry::new(
                "Ethernet",
                "192.168.1.0/24".parse().unwrap(),
                "192.168.1.254".parse().unwrap(),
                1,
            ),
            ForwardEntry::new("Ethernet", "::/0".parse().unwrap(), "fe80::1".parse().unwrap(), 1),
            ForwardEntry::new(
                "Ethernet",
                "0.0.0.0/0".parse().unwrap(),
                "fe80::1".parse().unwrap(),
                1,
            ),
            default_via("Wi-Fi", "10.0.0.1", 50),
        ]);
        let route = selector.best_physical_route(None).unwrap();
        assert_eq!(route.interface_alias, "Wi-Fi");
    }

    #[test]
    fn test_ties_go_to_first_entry() {
        let selector = selector(vec![
            default_via("Ethernet", "192.168.1.1", 25),
            default_via("Wi-Fi", "10.0.0.1", 25),
        ]);
        assert_eq!(selector.physical_interface_name(None).unwrap(), "Ethernet");
        assert_eq!(
            selector.physical_gateway_ipv4(None).unwrap(),
            Ipv4Addr::new(192, 168, 1, 1)
        );
    }

    #[test]
    fn test_interface_metric_breaks_route_metric_tie() {
        // Windows reports route metric 0 on both; the interface metric decides
        let selector = selector(vec![
            default_via("Wi-Fi", "10.0.0.1", 0).with_interface_metric(50),
            default_via("Ethernet", "192.168.1.1", 0).with_interface_metric(25),
        ]);
        let route = selector.best_physical_route(None).unwrap();
        assert_eq!(route.interface_alias, "Ethernet");
        assert_eq!(route.metric, 25);

        let saturated = default_via("Ethernet", "192.168.1.1", u32::MAX).with_interface_metric(1);
        assert_eq!(saturated.metric, u32::MAX);
    }

    #[test]
    fn test_empty_table() {
        let err = selector(Vec::new()).best_physical_route(Some("ruhop")).unwrap_err();
        assert!(matches!(err, Error::RouteNotFound(_)));
    }

    #[test]
    fn test_route_info_display() {
        let route = RouteInfo {
            gateway: Ipv4Addr::new(192, 168, 1, 1),
            interface_alias: "Ethernet".into(),
            metric: 25,
        };
        assert_eq!(route.to_string(), "default via 192.168.1.1 dev Ethernet metric 25");
    }
}
