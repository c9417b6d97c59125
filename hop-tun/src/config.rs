//! Tunnel adapter configuration

use std::net::Ipv4Addr;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::{DEFAULT_MTU, DEFAULT_RING_CAPACITY, MAX_MTU, MAX_RING_CAPACITY, MIN_MTU, MIN_RING_CAPACITY};

/// IPv4 address configuration for a tunnel adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Config {
    /// The IPv4 address to assign to the interface
    pub address: Ipv4Addr,
    /// Network prefix length (e.g., 24 for /24)
    pub prefix_len: u8,
}

impl Ipv4Config {
    /// Create a new IPv4 configuration
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Self {
        Self {
            address,
            prefix_len,
        }
    }

    /// Build from a dotted netmask, rejecting non-contiguous masks
    pub fn from_netmask(address: Ipv4Addr, mask: Ipv4Addr) -> Result<Self> {
        let prefix_len = ipnet::ipv4_mask_to_prefix(mask)
            .map_err(|_| Error::InvalidArgument(format!("{} is not a contiguous netmask", mask)))?;
        Ok(Self::new(address, prefix_len))
    }

    /// Get the network mask as an Ipv4Addr
    pub fn netmask(&self) -> Ipv4Addr {
        if self.prefix_len == 0 {
            return Ipv4Addr::UNSPECIFIED;
        }
        if self.prefix_len >= 32 {
            return Ipv4Addr::BROADCAST;
        }
        Ipv4Addr::from(!((1u32 << (32 - self.prefix_len)) - 1))
    }

    /// Get the network address
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.address) & u32::from(self.netmask()))
    }
}

/// Everything needed to bring a tunnel adapter up
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Adapter name, also used as the interface alias
    pub name: String,
    /// Tunnel type label shown by the driver
    pub tunnel_type: String,
    /// Requested adapter GUID; the driver picks one when unset
    pub guid: Option<Uuid>,
    /// Packet ring size in bytes
    pub ring_capacity: u32,
    /// Static IPv4 address
    pub ipv4: Option<Ipv4Config>,
    /// DNS server pushed to the adapter
    pub dns: Option<Ipv4Addr>,
    /// Maximum transmission unit
    pub mtu: u32,
    /// Interface metric; left to the OS when unset
    pub metric: Option<u32>,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            name: "ruhop".to_string(),
            tunnel_type: "Ruhop".to_string(),
            guid: None,
            ring_capacity: DEFAULT_RING_CAPACITY,
            ipv4: None,
            dns: None,
            mtu: DEFAULT_MTU,
            metric: None,
        }
    }
}

impl AdapterConfig {
    /// Create a new configuration builder
    pub fn builder() -> AdapterConfigBuilder {
        AdapterConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidArgument("adapter name must not be empty".into()));
        }

        // The driver stores names in a fixed 128-wchar buffer
        if self.name.encode_utf16().count() >= 128 {
            return Err(Error::InvalidArgument(format!(
                "adapter name '{}' is too long",
                self.name
            )));
        }

        if !(MIN_RING_CAPACITY..=MAX_RING_CAPACITY).contains(&self.ring_capacity) {
            return Err(Error::InvalidArgument(format!(
                "ring capacity {} is outside {}..={}",
                self.ring_capacity, MIN_RING_CAPACITY, MAX_RING_CAPACITY
            )));
        }

        if let Some(ref ipv4) = self.ipv4 {
            if ipv4.prefix_len > 32 {
                return Err(Error::InvalidArgument(format!(
                    "IPv4 prefix length {} is invalid (max 32)",
                    ipv4.prefix_len
                )));
            }
        }

        if !(MIN_MTU..=MAX_MTU).contains(&self.mtu) {
            return Err(Error::InvalidArgument(format!(
                "MTU {} is outside {}..={}",
                self.mtu, MIN_MTU, MAX_MTU
            )));
        }

        Ok(())
    }
}

/// Builder for AdapterConfig
#[derive(Debug, Default)]
pub struct AdapterConfigBuilder {
    config: AdapterConfig,
}

impl AdapterConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the adapter name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the tunnel type label
    pub fn tunnel_type(mut self, tunnel_type: impl Into<String>) -> Self {
        self.config.tunnel_type = tunnel_type.into();
        self
    }

    /// Request a specific adapter GUID
    pub fn guid(mut self, guid: Uuid) -> Self {
        self.config.guid = Some(guid);
        self
    }

    /// Set the packet ring capacity in bytes
    pub fn ring_capacity(mut self, capacity: u32) -> Self {
        self.config.ring_capacity = capacity;
        self
    }

    /// Set the IPv4 address and prefix length
    pub fn ipv4(mut self, address: impl Into<Ipv4Addr>, prefix_len: u8) -> Self {
        self.config.ipv4 = Some(Ipv4Config::new(address.into(), prefix_len));
        self
    }

    /// Set the DNS server
    pub fn dns(mut self, server: Ipv4Addr) -> Self {
        self.config.dns = Some(server);
        self
    }

    /// Set the MTU
    pub fn mtu(mut self, mtu: u32) -> Self {
        self.config.mtu = mtu;
        self
    }

    /// Set the interface metric
    pub fn metric(mut self, metric: u32) -> Self {
        self.config.metric = Some(metric);
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<AdapterConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
