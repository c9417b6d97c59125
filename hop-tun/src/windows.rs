//! Windows tunnel adapter and route table backends
//!
//! The adapter backend requires the WinTun driver. Download from:
//! https://www.wintun.net/
//!
//! Route enumeration uses the IP Helper API (`GetIpForwardTable2`) instead of
//! parsing `route print` output, which changes with locale and OS version.
//! Entries carry the effective metric: route metric plus interface metric.

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use ipnet::{IpNet, Ipv4Net};
use uuid::Uuid;

use crate::adapter::{AdapterHandle, PacketSession, TunDriver, WaitStatus};
use crate::error::{Error, Result};
use crate::route::ForwardEntry;

use windows_sys::Win32::Foundation::{
    CloseHandle, HANDLE, NO_ERROR, WAIT_FAILED, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows_sys::Win32::NetworkManagement::IpHelper::{
    ConvertInterfaceLuidToAlias, FreeMibTable, GetIpForwardTable2, GetIpInterfaceEntry,
    InitializeIpInterfaceEntry, MIB_IPFORWARD_ROW2, MIB_IPFORWARD_TABLE2, MIB_IPINTERFACE_ROW,
};
use windows_sys::Win32::Networking::WinSock::{AF_INET, SOCKADDR_INET};
use windows_sys::Win32::Security::{
    GetTokenInformation, TokenElevation, TOKEN_ELEVATION, TOKEN_QUERY,
};
use windows_sys::Win32::System::Threading::{
    CreateEventW, GetCurrentProcess, OpenProcessToken, SetEvent, WaitForMultipleObjects, INFINITE,
};

/// Interface alias buffer length in UTF-16 units (NDIS_IF_MAX_STRING_SIZE + 1)
const ALIAS_BUFFER_LEN: usize = 257;

/// Check if WinTun driver is installed
pub fn is_wintun_installed() -> bool {
    let system_path = std::path::Path::new(r"C:\Windows\System32\wintun.dll");
    let local_path = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.join("wintun.dll")));

    system_path.exists() || local_path.is_some_and(|p| p.exists())
}

/// Check if running with administrator privileges using Windows API
pub fn is_admin() -> bool {
    unsafe {
        let mut token_handle: HANDLE = std::ptr::null_mut();
        let process_handle = GetCurrentProcess();

        if OpenProcessToken(process_handle, TOKEN_QUERY, &mut token_handle) == 0 {
            return false;
        }

        let mut elevation = TOKEN_ELEVATION { TokenIsElevated: 0 };
        let mut return_length: u32 = 0;

        let result = GetTokenInformation(
            token_handle,
            TokenElevation,
            &mut elevation as *mut _ as *mut _,
            std::mem::size_of::<TOKEN_ELEVATION>() as u32,
            &mut return_length,
        );

        CloseHandle(token_handle);

        result != 0 && elevation.TokenIsElevated != 0
    }
}

/// [`TunDriver`] backed by `wintun.dll`
#[derive(Clone)]
pub struct WintunDriver {
    wintun: wintun::Wintun,
}

impl WintunDriver {
    /// Load `wintun.dll` from the default search path, then the working directory
    ///
    /// The driver's own log is forwarded into the `log` facade.
    pub fn load() -> Result<Self> {
        // SAFETY: wintun.dll is the signed driver library; loading runs its DllMain only
        let wintun = unsafe { wintun::load() }
            .or_else(|_| unsafe { wintun::load_from_path("wintun.dll") })
            .map_err(|e| Error::NotSupported(format!("failed to load wintun.dll: {}", e)))?;

        wintun::set_logger(&wintun, Some(wintun::default_logger));
        log::debug!("Loaded wintun.dll");
        Ok(Self { wintun })
    }
}

impl TunDriver for WintunDriver {
    type Adapter = WintunAdapter;

    fn create_adapter(&self, name: &str, tunnel_type: &str, guid: Option<Uuid>) -> Result<WintunAdapter> {
        let adapter = wintun::Adapter::create(&self.wintun, name, tunnel_type, guid.map(|g| g.as_u128()))
            .map_err(|e| Error::DeviceCreation(format!("{}: {}", name, e)))?;
        Ok(WintunAdapter { adapter })
    }

    fn open_adapter(&self, name: &str) -> Result<WintunAdapter> {
        let adapter = wintun::Adapter::open(&self.wintun, name)
            .map_err(|e| Error::DeviceNotFound(format!("{}: {}", name, e)))?;
        Ok(WintunAdapter { adapter })
    }
}

/// An open Wintun adapter; the native handle closes when the last reference drops
pub struct WintunAdapter {
    adapter: Arc<wintun::Adapter>,
}

impl AdapterHandle for WintunAdapter {
    type Session = WintunSession;

    fn luid(&self) -> u64 {
        // SAFETY: NET_LUID_LH is a plain 64-bit union; Value covers all of it
        unsafe { self.adapter.get_luid().Value }
    }

    fn start_session(&self, capacity: u32) -> Result<WintunSession> {
        let session = self
            .adapter
            .start_session(capacity)
            .map(Arc::new)
            .map_err(|e| Error::Session(format!("failed to start session: {}", e)))?;
        let read_event = session
            .get_read_wait_event()
            .map_err(|e| Error::Session(format!("failed to get read event: {}", e)))?;
        let shutdown = Event::new()?;

        Ok(WintunSession {
            session,
            read_event: read_event as isize as HANDLE,
            shutdown,
        })
    }
}

/// Manual-reset event owned by this crate
struct Event(HANDLE);

// SAFETY: event handles are process-wide kernel objects usable from any thread
unsafe impl Send for Event {}
unsafe impl Sync for Event {}

impl Event {
    fn new() -> Result<Self> {
        // SAFETY: null security attributes and name create an anonymous event
        let handle = unsafe { CreateEventW(std::ptr::null(), 1, 0, std::ptr::null()) };
        if handle.is_null() {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(Self(handle))
    }

    fn set(&self) {
        // SAFETY: handle is valid until Drop
        unsafe { SetEvent(self.0) };
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        // SAFETY: handle was created by CreateEventW and is closed once
        unsafe { CloseHandle(self.0) };
    }
}

/// Wintun packet ring
pub struct WintunSession {
    session: Arc<wintun::Session>,
    read_event: HANDLE,
    shutdown: Event,
}

// SAFETY: read_event is owned by the wintun session, which is itself Send + Sync
unsafe impl Send for WintunSession {}
unsafe impl Sync for WintunSession {}

impl PacketSession for WintunSession {
    fn try_receive(&self) -> Result<Option<Vec<u8>>> {
        match self.session.try_receive() {
            Ok(Some(packet)) => Ok(Some(packet.bytes().to_vec())),
            Ok(None) => Ok(None),
            Err(e) => Err(Error::AccessLost(e.to_string())),
        }
    }

    fn send(&self, packet: &[u8]) -> Result<()> {
        let size = u16::try_from(packet.len()).map_err(|_| Error::PacketTooLarge {
            size: packet.len(),
            max: crate::MAX_PACKET_SIZE,
        })?;
        let mut slot = self
            .session
            .allocate_send_packet(size)
            .map_err(|e| Error::Session(format!("send ring allocation failed: {}", e)))?;
        slot.bytes_mut().copy_from_slice(packet);
        self.session.send_packet(slot);
        Ok(())
    }

    fn wait_readable(&self, timeout: Option<Duration>) -> Result<WaitStatus> {
        // Shutdown first so it wins when both are signaled
        let handles = [self.shutdown.0, self.read_event];
        let millis = match timeout {
            Some(t) => u32::try_from(t.as_millis()).unwrap_or(INFINITE - 1),
            None => INFINITE,
        };

        // SAFETY: both handles stay valid for the lifetime of self
        let result = unsafe { WaitForMultipleObjects(2, handles.as_ptr(), 0, millis) };
        match result {
            r if r == WAIT_OBJECT_0 => Ok(WaitStatus::Closed),
            r if r == WAIT_OBJECT_0 + 1 => Ok(WaitStatus::Ready),
            WAIT_TIMEOUT => Ok(WaitStatus::TimedOut),
            WAIT_FAILED => Err(Error::Io(io::Error::last_os_error())),
            other => Err(Error::Session(format!("unexpected wait result {:#x}", other))),
        }
    }

    fn shutdown(&self) {
        self.shutdown.set();
        if let Err(e) = self.session.shutdown() {
            log::warn!("Wintun session shutdown failed: {}", e);
        }
    }
}

/// Enumerate the IPv4 forwarding table through the IP Helper API
pub fn ipv4_forward_entries() -> Result<Vec<ForwardEntry>> {
    let mut table: *mut MIB_IPFORWARD_TABLE2 = std::ptr::null_mut();

    // SAFETY: GetIpForwardTable2 allocates the table; it is released with FreeMibTable below
    let status = unsafe { GetIpForwardTable2(AF_INET, &mut table) };
    if status != NO_ERROR {
        return Err(Error::Io(io::Error::from_raw_os_error(status as i32)));
    }

    // SAFETY: on success the table holds NumEntries contiguous rows
    let rows: &[MIB_IPFORWARD_ROW2] = unsafe {
        std::slice::from_raw_parts((*table).Table.as_ptr(), (*table).NumEntries as usize)
    };

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(destination) = sockaddr_ipv4(&row.DestinationPrefix.Prefix) else {
            continue;
        };
        let Ok(net) = Ipv4Net::new(destination, row.DestinationPrefix.PrefixLength) else {
            continue;
        };
        let next_hop = sockaddr_ipv4(&row.NextHop)
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        let alias = match luid_alias(row) {
            Ok(alias) => alias,
            Err(e) => {
                log::warn!("Skipping route {} with unresolvable interface: {}", net, e);
                continue;
            }
        };
        let entry = ForwardEntry::new(alias, IpNet::V4(net), next_hop, row.Metric);
        match interface_metric(row) {
            Ok(metric) => entries.push(entry.with_interface_metric(metric)),
            Err(e) => log::warn!("Skipping route {} without interface metric: {}", net, e),
        }
    }

    // SAFETY: table came from GetIpForwardTable2 and is not used afterwards
    unsafe { FreeMibTable(table as *const _) };
    Ok(entries)
}

fn sockaddr_ipv4(addr: &SOCKADDR_INET) -> Option<Ipv4Addr> {
    // SAFETY: si_family discriminates the union; Ipv4 is only read for AF_INET
    unsafe {
        if addr.si_family != AF_INET {
            return None;
        }
        Some(Ipv4Addr::from(u32::from_be(addr.Ipv4.sin_addr.S_un.S_addr)))
    }
}

fn interface_metric(route: &MIB_IPFORWARD_ROW2) -> io::Result<u32> {
    // SAFETY: zeroed is a valid bit pattern for this plain C struct
    let mut row: MIB_IPINTERFACE_ROW = unsafe { std::mem::zeroed() };
    // SAFETY: row is a valid, writable MIB_IPINTERFACE_ROW
    unsafe { InitializeIpInterfaceEntry(&mut row) };
    row.Family = AF_INET;
    row.InterfaceLuid = route.InterfaceLuid;

    // SAFETY: Family and InterfaceLuid identify the entry to fill in
    let status = unsafe { GetIpInterfaceEntry(&mut row) };
    if status != NO_ERROR {
        return Err(io::Error::from_raw_os_error(status as i32));
    }
    Ok(row.Metric)
}

fn luid_alias(row: &MIB_IPFORWARD_ROW2) -> io::Result<String> {
    let mut buffer = [0u16; ALIAS_BUFFER_LEN];
    // SAFETY: buffer length is passed in UTF-16 units
    let status =
        unsafe { ConvertInterfaceLuidToAlias(&row.InterfaceLuid, buffer.as_mut_ptr(), buffer.len()) };
    if status != NO_ERROR {
        return Err(io::Error::from_raw_os_error(status as i32));
    }
    let len = buffer.iter().position(|&c| c == 0).unwrap_or(buffer.len());
    Ok(String::from_utf16_lossy(&buffer[..len]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wintun_check() {
        // This just verifies the function doesn't panic
        let _ = is_wintun_installed();
    }

    #[test]
    fn test_forward_table_enumerates() {
        let entries = ipv4_forward_entries().unwrap();
        assert!(entries.iter().all(|e| matches!(e.destination, IpNet::V4(_))));
    }

    #[test]
    #[ignore = "requires administrator privileges and the WinTun driver"]
    fn test_wintun_session_roundtrip() {
        let driver = WintunDriver::load().unwrap();
        let adapter = driver.create_adapter("ruhop-test", "Ruhop", None).unwrap();
        assert_ne!(adapter.luid(), 0);
        let session = adapter.start_session(crate::DEFAULT_RING_CAPACITY).unwrap();
        session.send(&[0x45; 20]).unwrap();
        session.shutdown();
        assert_eq!(session.wait_readable(None).unwrap(), WaitStatus::Closed);
    }
}
