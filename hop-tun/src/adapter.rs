//! Tunnel adapter and packet session
//!
//! A [`TunnelAdapter`] wraps one virtual network adapter and at most one
//! active packet session. The adapter handle is owned exclusively and released
//! once when the adapter is dropped; the session can be started and ended any
//! number of times.
//!
//! # Reader loop
//!
//! The session is meant to be drained by a dedicated reader thread:
//!
//! ```rust,ignore
//! loop {
//!     match adapter.wait_readable(Some(Duration::from_secs(1)))? {
//!         WaitStatus::Ready => {
//!             while let Some(packet) = adapter.receive_packet() {
//!                 forward(packet);
//!             }
//!         }
//!         WaitStatus::TimedOut => continue,
//!         WaitStatus::Closed => break,
//!     }
//! }
//! ```
//!
//! [`TunnelAdapter::run_reader`] implements exactly this loop. Sending may
//! happen concurrently from any other thread; ending the session wakes a
//! blocked reader with [`WaitStatus::Closed`].

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::netcfg::NetshConfigurator;
use crate::{MAX_PACKET_SIZE, MAX_RING_CAPACITY, MIN_RING_CAPACITY};

/// Outcome of waiting on a session's readiness handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// At least one packet is queued
    Ready,
    /// The timeout elapsed with nothing queued
    TimedOut,
    /// The session ended (or none was active)
    Closed,
}

/// Creates and opens virtual adapters
pub trait TunDriver: Send + Sync {
    /// Adapter handle produced by this driver
    type Adapter: AdapterHandle;

    /// Create a new adapter
    fn create_adapter(
        &self,
        name: &str,
        tunnel_type: &str,
        guid: Option<Uuid>,
    ) -> Result<Self::Adapter>;

    /// Open an existing adapter by name
    fn open_adapter(&self, name: &str) -> Result<Self::Adapter>;
}

/// An open adapter; dropping it closes the native handle
pub trait AdapterHandle: Send + Sync {
    /// Packet session type for this adapter
    type Session: PacketSession;

    /// Locally unique link identifier of the adapter
    fn luid(&self) -> u64;

    /// Establish the packet ring with the given capacity in bytes
    fn start_session(&self, capacity: u32) -> Result<Self::Session>;
}

/// A bidirectional packet ring
///
/// Receive and send operate on distinct ring regions and may be used from
/// different threads at the same time.
pub trait PacketSession: Send + Sync {
    /// Take the next queued packet without blocking
    fn try_receive(&self) -> Result<Option<Vec<u8>>>;

    /// Allocate a send slot, copy the packet in and publish it
    fn send(&self, packet: &[u8]) -> Result<()>;

    /// Block until a packet is queued, the timeout elapses or the session shuts down
    fn wait_readable(&self, timeout: Option<Duration>) -> Result<WaitStatus>;

    /// Wake all waiters and stop the ring; further waits report `Closed`
    fn shutdown(&self);
}

/// Snapshot of per-adapter packet counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    /// Packets taken from the ring
    pub packets_rx: u64,
    /// Bytes taken from the ring
    pub bytes_rx: u64,
    /// Packets published to the ring
    pub packets_tx: u64,
    /// Bytes published to the ring
    pub bytes_tx: u64,
}

#[derive(Debug, Default)]
struct Counters {
    packets_rx: AtomicU64,
    bytes_rx: AtomicU64,
    packets_tx: AtomicU64,
    bytes_tx: AtomicU64,
}

impl Counters {
    fn record_rx(&self, bytes: usize) {
        self.packets_rx.fetch_add(1, Ordering::Relaxed);
        self.bytes_rx.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_tx(&self, bytes: usize) {
        self.packets_tx.fetch_add(1, Ordering::Relaxed);
        self.bytes_tx.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TunnelStats {
        TunnelStats {
            packets_rx: self.packets_rx.load(Ordering::Relaxed),
            bytes_rx: self.bytes_rx.load(Ordering::Relaxed),
            packets_tx: self.packets_tx.load(Ordering::Relaxed),
            bytes_tx: self.bytes_tx.load(Ordering::Relaxed),
        }
    }
}

/// A virtual network adapter with an optional packet session
pub struct TunnelAdapter<A: AdapterHandle> {
    handle: A,
    name: String,
    luid: u64,
    session: RwLock<Option<Arc<A::Session>>>,
    netcfg: NetshConfigurator,
    counters: Counters,
}

impl<A: AdapterHandle> TunnelAdapter<A> {
    /// Create a new adapter through `driver`
    pub fn create<D>(driver: &D, name: &str, tunnel_type: &str, guid: Option<Uuid>) -> Result<Self>
    where
        D: TunDriver<Adapter = A>,
    {
        let handle = driver.create_adapter(name, tunnel_type, guid)?;
        let adapter = Self::from_handle(handle, name);
        log::info!(
            "Created tunnel adapter {} (type {}, luid {:#x})",
            adapter.name,
            tunnel_type,
            adapter.luid
        );
        Ok(adapter)
    }

    /// Open an existing adapter through `driver`
    pub fn open<D>(driver: &D, name: &str) -> Result<Self>
    where
        D: TunDriver<Adapter = A>,
    {
        let handle = driver.open_adapter(name)?;
        let adapter = Self::from_handle(handle, name);
        log::info!("Opened tunnel adapter {} (luid {:#x})", adapter.name, adapter.luid);
        Ok(adapter)
    }

    /// Wrap an already open adapter handle
    pub fn from_handle(handle: A, name: impl Into<String>) -> Self {
        let luid = handle.luid();
        Self {
            handle,
            name: name.into(),
            luid,
            session: RwLock::new(None),
            netcfg: NetshConfigurator::new(),
            counters: Counters::default(),
        }
    }

    /// Replace the configurator used by the address/DNS/route/MTU setters
    pub fn with_configurator(mut self, netcfg: NetshConfigurator) -> Self {
        self.netcfg = netcfg;
        self
    }

    /// Adapter name (also its interface alias)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Link identifier captured when the adapter was created or opened
    pub fn luid(&self) -> u64 {
        self.luid
    }

    /// Access the native adapter handle
    pub fn handle(&self) -> &A {
        &self.handle
    }

    /// Configurator bound to this adapter
    pub fn configurator(&self) -> &NetshConfigurator {
        &self.netcfg
    }

    /// Whether a packet session is active
    pub fn is_session_active(&self) -> bool {
        self.session_slot().is_some()
    }

    /// Packet counters since the adapter was created
    pub fn stats(&self) -> TunnelStats {
        self.counters.snapshot()
    }

    /// Start a packet session with a ring of `capacity` bytes
    ///
    /// Fails if a session is already active or the capacity is outside
    /// [`MIN_RING_CAPACITY`]..=[`MAX_RING_CAPACITY`]. A failure to start the
    /// ring is recoverable; the caller may retry after a delay.
    pub fn start_session(&self, capacity: u32) -> Result<()> {
        let mut slot = self.session_slot_mut();
        if slot.is_some() {
            return Err(Error::SessionActive);
        }

        if !(MIN_RING_CAPACITY..=MAX_RING_CAPACITY).contains(&capacity) {
            return Err(Error::InvalidArgument(format!(
                "ring capacity must be between {} and {} bytes, got {}",
                MIN_RING_CAPACITY, MAX_RING_CAPACITY, capacity
            )));
        }

        let session = self.handle.start_session(capacity)?;
        *slot = Some(Arc::new(session));

        log::info!("Started packet session on {} ({} byte ring)", self.name, capacity);
        Ok(())
    }

    /// End the packet session
    ///
    /// Safe to call when no session is active. A reader blocked in
    /// [`wait_readable`](Self::wait_readable) wakes up with `Closed`.
    pub fn end_session(&self) {
        let session = self.session_slot_mut().take();
        if let Some(session) = session {
            session.shutdown();
            log::info!("Ended packet session on {}", self.name);
        }
    }

    /// Take the next queued packet, or `None` if the ring is empty or no session is active
    ///
    /// Ring errors are logged and reported as `None`; use
    /// [`try_receive_packet`](Self::try_receive_packet) to observe them.
    pub fn receive_packet(&self) -> Option<Vec<u8>> {
        match self.try_receive_packet() {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("Receive on {} failed: {}", self.name, e);
                None
            }
        }
    }

    /// Take the next queued packet, surfacing ring failures
    pub fn try_receive_packet(&self) -> Result<Option<Vec<u8>>> {
        let Some(session) = self.current_session() else {
            return Ok(None);
        };

        let packet = session.try_receive()?;
        if let Some(ref p) = packet {
            self.counters.record_rx(p.len());
        }
        Ok(packet)
    }

    /// Publish one raw IP packet to the adapter
    pub fn send_packet(&self, packet: &[u8]) -> Result<()> {
        let session = self.current_session().ok_or(Error::NoSession)?;

        if packet.len() > MAX_PACKET_SIZE {
            return Err(Error::PacketTooLarge {
                size: packet.len(),
                max: MAX_PACKET_SIZE,
            });
        }

        session.send(packet)?;
        self.counters.record_tx(packet.len());
        Ok(())
    }

    /// Wait on the session's readiness handle
    ///
    /// Returns `Closed` immediately when no session is active.
    pub fn wait_readable(&self, timeout: Option<Duration>) -> Result<WaitStatus> {
        match self.current_session() {
            Some(session) => session.wait_readable(timeout),
            None => Ok(WaitStatus::Closed),
        }
    }

    /// Run the wait → drain → wait loop until the session ends
    ///
    /// Every received packet is handed to `sink`. Returns the number of
    /// packets delivered.
    pub fn run_reader<F>(&self, poll_timeout: Duration, mut sink: F) -> Result<u64>
    where
        F: FnMut(Vec<u8>),
    {
        let mut delivered = 0u64;
        loop {
            match self.wait_readable(Some(poll_timeout))? {
                WaitStatus::Ready => {
                    while let Some(packet) = self.try_receive_packet()? {
                        sink(packet);
                        delivered += 1;
                    }
                }
                WaitStatus::TimedOut => {}
                WaitStatus::Closed => {
                    log::debug!("Reader on {} stopped after {} packets", self.name, delivered);
                    return Ok(delivered);
                }
            }
        }
    }

    /// Assign a static IPv4 address
    pub fn set_ip_address(&self, address: Ipv4Addr, mask: Ipv4Addr) -> Result<()> {
        self.netcfg.set_ip_address(&self.name, address, mask)
    }

    /// Point the adapter at a DNS server
    pub fn set_dns_server(&self, server: Ipv4Addr) -> Result<()> {
        self.netcfg.set_dns_server(&self.name, server)
    }

    /// Add a route through this adapter; an existing identical route counts as success
    pub fn add_route(
        &self,
        destination: Ipv4Addr,
        mask: Ipv4Addr,
        gateway: Ipv4Addr,
        metric: u32,
    ) -> Result<()> {
        self.netcfg
            .add_route(&self.name, destination, mask, gateway, metric)
    }

    /// Set the interface metric
    pub fn set_interface_metric(&self, metric: u32) -> Result<()> {
        self.netcfg.set_interface_metric(&self.name, metric)
    }

    /// Set the MTU; values outside [`MIN_MTU`](crate::MIN_MTU)..=[`MAX_MTU`](crate::MAX_MTU) are rejected
    pub fn set_mtu(&self, mtu: u32) -> Result<()> {
        self.netcfg.set_mtu(&self.name, mtu)
    }

    /// Flush the host resolver cache
    pub fn flush_dns(&self) -> Result<()> {
        self.netcfg.flush_dns()
    }

    fn current_session(&self) -> Option<Arc<A::Session>> {
        self.session_slot().clone()
    }

    fn session_slot(&self) -> RwLockReadGuard<'_, Option<Arc<A::Session>>> {
        self.session.read().unwrap_or_else(|e| e.into_inner())
    }

    fn session_slot_mut(&self) -> RwLockWriteGuard<'_, Option<Arc<A::Session>>> {
        self.session.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl<A: AdapterHandle> Drop for TunnelAdapter<A> {
    fn drop(&mut self) {
        self.end_session();
        log::debug!("Released tunnel adapter {}", self.name);
    }
}

impl<A: AdapterHandle> std::fmt::Debug for TunnelAdapter<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelAdapter")
            .field("name", &self.name)
            .field("luid", &self.luid)
            .field("session_active", &self.is_session_active())
            .finish()
    }
}
