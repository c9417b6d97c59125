//! Configuration types for the guard

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use hop_tun::{AdapterConfig, Ipv4Config, DEFAULT_MTU, DEFAULT_RING_CAPACITY};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Main configuration structure
///
/// # Example Configuration
///
/// ```toml
/// [common]
/// log_level = "info"
///
/// [tunnel]
/// name = "ruhop"
/// address = "10.66.0.2"
/// netmask = "255.255.255.0"
/// dns = "10.66.0.1"
///
/// [[tunnel.routes]]
/// destination = "0.0.0.0/1"
/// gateway = "10.66.0.1"
///
/// [killswitch]
/// server = "203.0.113.10"
/// lan_exclusions = ["192.168.1.0/24"]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Settings shared by every subcommand
    #[serde(default)]
    pub common: CommonConfig,

    /// Tunnel adapter settings
    pub tunnel: TunnelConfig,

    /// Kill-switch settings; no kill-switch when absent
    pub killswitch: Option<KillSwitchConfig>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.tunnel.validate()?;

        if let Some(ref killswitch) = self.killswitch {
            killswitch.validate()?;
        }

        Ok(())
    }

    /// Kill-switch settings if present and enabled
    pub fn active_killswitch(&self) -> Option<&KillSwitchConfig> {
        self.killswitch.as_ref().filter(|k| k.enabled)
    }

    /// Generate a sample configuration
    pub fn sample() -> String {
        r#"# Ruhop Guard Configuration

[common]
# Log level: "error", "warn", "info", "debug", "trace"
log_level = "info"

# Tunnel adapter
[tunnel]
# Adapter name, also the interface alias used by netsh
name = "ruhop"

# Tunnel type shown by the driver
tunnel_type = "Ruhop"

# Fixed adapter GUID (optional)
# guid = "6f2b1c9e-3a47-4d58-9e21-0c4b7a8d5f13"

# Reuse an existing adapter with the same name before creating one
open_existing = true

# Packet ring size in bytes (128 KiB to 64 MiB)
ring_capacity = 4194304

# Tunnel address and netmask
address = "10.66.0.2"
netmask = "255.255.255.0"

# DNS server for the tunnel (optional)
dns = "10.66.0.1"

# MTU (576 to 9000)
mtu = 1400

# Interface metric (optional)
metric = 5

# Timeout for each netsh invocation
command_timeout_secs = 5

# Flush the DNS cache once the tunnel is configured
flush_dns = true

# Routes sent through the tunnel
[[tunnel.routes]]
destination = "0.0.0.0/1"
gateway = "10.66.0.1"
metric = 1

[[tunnel.routes]]
destination = "128.0.0.0/1"
gateway = "10.66.0.1"
metric = 1

# Kill-switch: block everything except the VPN server and LAN exclusions
[killswitch]
enabled = true

# VPN server address and port
server = "203.0.113.10"
port = 4096

# Local networks that stay reachable (CIDR)
lan_exclusions = ["192.168.1.0/24"]

# Also permit the physical default gateway
allow_physical_gateway = false

# Permit traffic sourced from the tunnel address
permit_tunnel_address = true
"#
        .to_string()
    }
}

/// Settings shared by every subcommand
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl CommonConfig {
    /// Level to log at; an explicit override (e.g. a CLI flag) wins
    pub fn log_level_or<'a>(&'a self, override_level: Option<&'a str>) -> &'a str {
        override_level.unwrap_or(&self.log_level)
    }
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// A route sent through the tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Destination network
    pub destination: Ipv4Net,

    /// Next hop inside the tunnel
    pub gateway: Ipv4Addr,

    /// Route metric
    #[serde(default = "default_route_metric")]
    pub metric: u32,
}

/// Tunnel adapter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Adapter name
    #[serde(default = "default_adapter_name")]
    pub name: String,

    /// Tunnel type label
    #[serde(default = "default_tunnel_type")]
    pub tunnel_type: String,

    /// Fixed adapter GUID
    #[serde(default)]
    pub guid: Option<Uuid>,

    /// Try opening an existing adapter before creating one
    #[serde(default = "default_true")]
    pub open_existing: bool,

    /// Packet ring size in bytes
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: u32,

    /// Tunnel IPv4 address
    pub address: Ipv4Addr,

    /// Tunnel netmask; must be contiguous
    pub netmask: Ipv4Addr,

    /// DNS server
    #[serde(default)]
    pub dns: Option<Ipv4Addr>,

    /// MTU
    #[serde(default = "default_mtu")]
    pub mtu: u32,

    /// Interface metric
    #[serde(default)]
    pub metric: Option<u32>,

    /// Timeout for each netsh invocation, in seconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Flush the DNS cache after configuration
    #[serde(default = "default_true")]
    pub flush_dns: bool,

    /// Routes sent through the tunnel
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

impl TunnelConfig {
    /// Validate tunnel settings
    pub fn validate(&self) -> Result<()> {
        if self.command_timeout_secs == 0 {
            return Err(Error::Config("command_timeout_secs must be positive".into()));
        }
        self.adapter_config()?;
        Ok(())
    }

    /// Adapter settings in hop-tun form
    pub fn adapter_config(&self) -> Result<AdapterConfig> {
        let ipv4 = Ipv4Config::from_netmask(self.address, self.netmask)
            .map_err(|e| Error::Config(e.to_string()))?;
        let config = AdapterConfig {
            name: self.name.clone(),
            tunnel_type: self.tunnel_type.clone(),
            guid: self.guid,
            ring_capacity: self.ring_capacity,
            ipv4: Some(ipv4),
            dns: self.dns,
            mtu: self.mtu,
            metric: self.metric,
        };
        config
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(config)
    }

    /// Timeout for each netsh invocation
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Kill-switch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchConfig {
    /// Enable the kill-switch on connect
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// VPN server address
    pub server: Ipv4Addr,

    /// VPN server port
    #[serde(default = "default_server_port")]
    pub port: u16,

    /// Local networks that bypass the block, in CIDR notation
    #[serde(default)]
    pub lan_exclusions: Vec<String>,

    /// Also permit the physical default gateway
    #[serde(default)]
    pub allow_physical_gateway: bool,

    /// Permit traffic sourced from the tunnel address
    #[serde(default = "default_true")]
    pub permit_tunnel_address: bool,
}

impl KillSwitchConfig {
    /// Validate kill-switch settings
    pub fn validate(&self) -> Result<()> {
        if self.server.is_unspecified() || self.server.is_loopback() || self.server.is_broadcast() {
            return Err(Error::Config(format!(
                "killswitch server {} is not a usable address",
                self.server
            )));
        }
        self.lan_networks()?;
        Ok(())
    }

    /// Parsed LAN exclusions; malformed entries are an error
    pub fn lan_networks(&self) -> Result<Vec<Ipv4Net>> {
        hop_firewall::parse_lan_exclusions(&self.lan_exclusions)
            .map_err(|e| Error::Config(e.to_string()))
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_adapter_name() -> String {
    "ruhop".to_string()
}

fn default_tunnel_type() -> String {
    "Ruhop".to_string()
}

fn default_ring_capacity() -> u32 {
    DEFAULT_RING_CAPACITY
}

fn default_mtu() -> u32 {
    DEFAULT_MTU
}

fn default_command_timeout() -> u64 {
    5
}

fn default_route_metric() -> u32 {
    1
}

fn default_server_port() -> u16 {
    4096
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[tunnel]
address = "10.66.0.2"
netmask = "255.255.255.0"
"#;

    #[test]
    fn test_sample_parses() {
        let config = Config::from_toml(&Config::sample()).unwrap();
        assert_eq!(config.tunnel.name, "ruhop");
        assert_eq!(config.tunnel.routes.len(), 2);
        assert_eq!(config.tunnel.dns, Some(Ipv4Addr::new(10, 66, 0, 1)));

        let ks = config.active_killswitch().unwrap();
        assert_eq!(ks.server, Ipv4Addr::new(203, 0, 113, 10));
        assert_eq!(ks.lan_networks().unwrap().len(), 1);
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_toml(MINIMAL).unwrap();
        assert_eq!(config.common.log_level, "info");
        assert_eq!(config.common.log_level_or(None), "info");
        assert_eq!(config.common.log_level_or(Some("trace")), "trace");
        assert_eq!(config.tunnel.ring_capacity, DEFAULT_RING_CAPACITY);
        assert_eq!(config.tunnel.mtu, DEFAULT_MTU);
        assert_eq!(config.tunnel.command_timeout(), Duration::from_secs(5));
        assert!(config.tunnel.open_existing);
        assert!(config.tunnel.flush_dns);
        assert!(config.killswitch.is_none());
        assert!(config.active_killswitch().is_none());

        let adapter = config.tunnel.adapter_config().unwrap();
        assert_eq!(adapter.ipv4.unwrap().prefix_len, 24);
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        for extra in ["mtu = 500", "mtu = 9500", "ring_capacity = 1024", "command_timeout_secs = 0"] {
            let toml = format!("{}{}\n", MINIMAL, extra);
            let err = Config::from_toml(&toml).unwrap_err();
            assert!(err.is_config_error(), "{extra} accepted");
        }
    }

    #[test]
    fn test_rejects_non_contiguous_netmask() {
        let toml = r#"
[tunnel]
address = "10.66.0.2"
netmask = "255.0.255.0"
"#;
        assert!(Config::from_toml(toml).unwrap_err().is_config_error());
    }

    #[test]
    fn test_rejects_malformed_lan_exclusion() {
        let toml = format!(
            "{}\n[killswitch]\nserver = \"203.0.113.10\"\nlan_exclusions = [\"192.168.1.0/24\", \"lan\"]\n",
            MINIMAL
        );
        assert!(Config::from_toml(&toml).unwrap_err().is_config_error());
    }

    #[test]
    fn test_rejects_loopback_server() {
        let toml = format!("{}\n[killswitch]\nserver = \"127.0.0.1\"\n", MINIMAL);
        assert!(Config::from_toml(&toml).is_err());
    }

    #[test]
    fn test_disabled_killswitch_is_inactive() {
        let toml = format!(
            "{}\n[killswitch]\nenabled = false\nserver = \"203.0.113.10\"\n",
            MINIMAL
        );
        let config = Config::from_toml(&toml).unwrap();
        assert!(config.killswitch.is_some());
        assert!(config.active_killswitch().is_none());
    }

    #[test]
    fn test_configured_log_level_used_without_override() {
        let toml = format!("[common]\nlog_level = \"debug\"\n{}", MINIMAL);
        let config = Config::from_toml(&toml).unwrap();
        assert_eq!(config.common.log_level_or(None), "debug");
        assert_eq!(config.common.log_level_or(Some("warn")), "warn");
    }

    #[test]
    fn test_invalid_toml() {
        let err = Config::from_toml("[tunnel\naddress = ").unwrap_err();
        assert!(matches!(err, Error::ConfigParse(_)));
    }
}
