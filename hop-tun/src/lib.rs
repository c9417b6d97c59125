//! Tunnel adapter, packet session and physical route selection for VPN clients
//!
//! This crate owns the host-side data plane of the ruhop client: a virtual
//! network adapter that exchanges raw IP packets with user space through a
//! bounded ring, the network-configuration side channel used to give that
//! adapter an address, DNS server, routes and MTU, and the selector that finds
//! the real (non-tunnel) default route.
//!
//! # Features
//!
//! - **Tunnel Adapter**: Create or open a named adapter, start/end a packet session
//! - **Packet I/O**: Non-blocking receive, bounded send, pollable readiness wait
//! - **Interface Configuration**: Address, DNS, routes, metric and MTU via `netsh`
//! - **Route Selection**: Lowest-metric physical IPv4 default route, tunnel excluded
//!
//! # Platform Requirements
//!
//! ## Windows
//! - Administrator privileges
//! - WinTun driver installed (<https://www.wintun.net/>)
//!
//! ## Linux
//! - Route selection only (reads `/proc/net/route`)
//!
//! Every platform call sits behind a trait ([`TunDriver`], [`CommandRunner`],
//! [`RouteTable`]) and the [`mock`] module provides in-memory implementations.
//!
//! # Example
//!
//! ```ignore
//! use hop_tun::{TunnelAdapter, windows::WintunDriver};
//!
//! let driver = WintunDriver::load()?;
//! let adapter = TunnelAdapter::create(&driver, "ruhop", "Ruhop", None)?;
//! adapter.start_session(hop_tun::DEFAULT_RING_CAPACITY)?;
//! adapter.set_ip_address("10.66.0.2".parse()?, "255.255.255.0".parse()?)?;
//! adapter.set_mtu(1400)?;
//!
//! while let Some(packet) = adapter.receive_packet() {
//!     println!("{} bytes from the OS", packet.len());
//! }
//! ```

pub mod adapter;
pub mod config;
pub mod error;
pub mod mock;
pub mod netcfg;
pub mod route;

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "windows")]
pub mod windows;

pub use adapter::{
    AdapterHandle, PacketSession, TunDriver, TunnelAdapter, TunnelStats, WaitStatus,
};
pub use config::{AdapterConfig, AdapterConfigBuilder, Ipv4Config};
pub use error::{Error, Result};
pub use netcfg::{CommandOutput, CommandRunner, NetshConfigurator, SystemRunner};
pub use route::{ForwardEntry, RouteInfo, RouteSelector, RouteTable, SystemRouteTable};

/// Smallest packet ring a session accepts (128 KiB)
pub const MIN_RING_CAPACITY: u32 = 0x20000;

/// Largest packet ring a session accepts (64 MiB)
pub const MAX_RING_CAPACITY: u32 = 0x400_0000;

/// Ring capacity used when the caller has no preference (4 MiB)
pub const DEFAULT_RING_CAPACITY: u32 = 0x40_0000;

/// Maximum packet size for the tunnel adapter
pub const MAX_PACKET_SIZE: usize = 0xFFFF;

/// Lowest MTU accepted by [`TunnelAdapter::set_mtu`]
pub const MIN_MTU: u32 = 576;

/// Highest MTU accepted by [`TunnelAdapter::set_mtu`]
pub const MAX_MTU: u32 = 9000;

/// Default MTU for tunnel adapters
pub const DEFAULT_MTU: u32 = 1400;
