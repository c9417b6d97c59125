//! Linux-specific route table access
//!
//! Only the physical route selector is available on Linux; the tunnel adapter
//! itself is Windows-only. Forwarding entries are read from `/proc/net/route`.

use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr};

use ipnet::{IpNet, Ipv4Net};

use crate::error::{Error, Result};
use crate::route::ForwardEntry;

const PROC_NET_ROUTE: &str = "/proc/net/route";

/// RTF_UP: route usable
const RTF_UP: u32 = 0x0001;

/// Enumerate the IPv4 forwarding table
pub fn ipv4_forward_entries() -> Result<Vec<ForwardEntry>> {
    let content = fs::read_to_string(PROC_NET_ROUTE)?;
    parse_proc_net_route(&content)
}

/// Parse the contents of `/proc/net/route`
///
/// Addresses are printed as host-order hex words. Routes without the
/// `RTF_UP` flag are skipped.
pub fn parse_proc_net_route(content: &str) -> Result<Vec<ForwardEntry>> {
    let mut entries = Vec::new();

    for (lineno, line) in content.lines().enumerate().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        if fields.len() < 8 {
            return Err(malformed(lineno, "too few columns"));
        }

        let flags = hex_word(fields[3], lineno)?;
        if flags & RTF_UP == 0 {
            continue;
        }

        let destination = hex_addr(fields[1], lineno)?;
        let gateway = hex_addr(fields[2], lineno)?;
        let metric: u32 = fields[6]
            .parse()
            .map_err(|_| malformed(lineno, "bad metric"))?;
        let mask = hex_addr(fields[7], lineno)?;

        let prefix = ipnet::ipv4_mask_to_prefix(mask)
            .map_err(|_| malformed(lineno, "non-contiguous mask"))?;
        let net = Ipv4Net::new(destination, prefix).map_err(|_| malformed(lineno, "bad prefix"))?;

        entries.push(ForwardEntry::new(
            fields[0],
            IpNet::V4(net),
            IpAddr::V4(gateway),
            metric,
        ));
    }

    Ok(entries)
}

fn hex_word(field: &str, lineno: usize) -> Result<u32> {
    u32::from_str_radix(field, 16).map_err(|_| malformed(lineno, "bad hex field"))
}

fn hex_addr(field: &str, lineno: usize) -> Result<Ipv4Addr> {
    Ok(Ipv4Addr::from(hex_word(field, lineno)?.to_ne_bytes()))
}

fn malformed(lineno: usize, what: &str) -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("{} line {}: {}", PROC_NET_ROUTE, lineno + 1, what),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::select_best_route;

    const SAMPLE: &str = "\
Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
eth0\t00000000\t0101A8C0\t0003\t0\t0\t100\t00000000\t0\t0\t0
eth0\t0001A8C0\t00000000\t0001\t0\t0\t100\t00FFFFFF\t0\t0\t0
wlan0\t00000000\t0100000A\t0003\t0\t0\t600\t00000000\t0\t0\t0
tun0\t00000000\t0100420A\t0002\t0\t0\t1\t00000000\t0\t0\t0
";

    #[cfg(target_endian = "little")]
    #[test]
    fn test_parse_proc_net_route() {
        let entries = parse_proc_net_route(SAMPLE).unwrap();
        // tun0 is not RTF_UP
        assert_eq!(entries.len(), 3);

        assert_eq!(entries[0].interface_alias, "eth0");
        assert!(entries[0].is_ipv4_default());
        assert_eq!(entries[0].next_hop, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(entries[0].metric, 100);

        assert_eq!(entries[1].destination, "192.168.1.0/24".parse::<IpNet>().unwrap());

        let best = select_best_route(&entries, None).unwrap();
        assert_eq!(best.interface_alias, "eth0");
        let best = select_best_route(&entries, Some("eth0")).unwrap();
        assert_eq!(best.gateway, Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let content = "Iface\tDestination\nbad line\n";
        assert!(parse_proc_net_route(content).is_err());
    }

    #[test]
    fn test_parse_header_only() {
        assert!(parse_proc_net_route("Iface\tDestination\tGateway\n").unwrap().is_empty());
    }
}
