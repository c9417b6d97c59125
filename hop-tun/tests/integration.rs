//! Integration tests for hop-tun
//!
//! # Permission Requirements
//!
//! Everything here runs against the in-memory backends from `hop_tun::mock`
//! except the `test_privileged_*` tests, which need a real WinTun adapter and
//! are marked with `#[ignore]`.
//!
//! ### Windows
//! ```powershell
//! # Run PowerShell/Terminal as Administrator
//! # Ensure WinTun driver is installed from https://www.wintun.net/
//! cargo test -p hop-tun --test integration -- --ignored
//! ```

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hop_tun::mock::{MemoryDriver, RecordingRunner};
use hop_tun::route::StaticRouteTable;
use hop_tun::{
    AdapterConfig, CommandOutput, Error, ForwardEntry, NetshConfigurator, RouteSelector,
    TunnelAdapter, WaitStatus, DEFAULT_RING_CAPACITY,
};

fn configured_adapter(
    driver: &MemoryDriver,
) -> (Arc<RecordingRunner>, TunnelAdapter<hop_tun::mock::MemoryAdapter>) {
    let runner = Arc::new(RecordingRunner::new());
    let adapter = TunnelAdapter::create(driver, "ruhop", "Ruhop", None)
        .unwrap()
        .with_configurator(NetshConfigurator::with_runner(runner.clone()));
    (runner, adapter)
}

/// Open falls back to create the way a client brings its adapter up
#[test]
fn test_open_or_create() {
    let driver = MemoryDriver::new();
    assert!(TunnelAdapter::open(&driver, "ruhop").unwrap_err().is_not_found());

    let created = TunnelAdapter::create(&driver, "ruhop", "Ruhop", None).unwrap();
    let opened = TunnelAdapter::open(&driver, "ruhop").unwrap();
    assert_eq!(opened.name(), "ruhop");
    assert_ne!(created.luid(), opened.luid());
}

#[test]
fn test_create_failure_surfaces() {
    let driver = MemoryDriver::new();
    driver.fail_create(true);
    let err = TunnelAdapter::create(&driver, "ruhop", "Ruhop", None).unwrap_err();
    assert!(matches!(err, Error::DeviceCreation(_)));
}

/// Configure an adapter from an AdapterConfig and check the netsh sequence
#[test]
fn test_configure_from_adapter_config() {
    let config = AdapterConfig::builder()
        .name("ruhop")
        .ipv4(Ipv4Addr::new(10, 66, 0, 2), 24)
        .dns(Ipv4Addr::new(10, 66, 0, 1))
        .mtu(1400)
        .metric(5)
        .build()
        .unwrap();

    let driver = MemoryDriver::new();
    let (runner, adapter) = configured_adapter(&driver);
    adapter.start_session(config.ring_capacity).unwrap();

    let ipv4 = config.ipv4.unwrap();
    adapter.set_ip_address(ipv4.address, ipv4.netmask()).unwrap();
    adapter.set_mtu(config.mtu).unwrap();
    adapter.set_interface_metric(config.metric.unwrap()).unwrap();
    adapter.set_dns_server(config.dns.unwrap()).unwrap();
    adapter
        .add_route(
            Ipv4Addr::new(0, 0, 0, 0),
            Ipv4Addr::new(128, 0, 0, 0),
            Ipv4Addr::new(10, 66, 0, 1),
            1,
        )
        .unwrap();
    adapter.flush_dns().unwrap();

    assert_eq!(
        runner.command_lines(),
        vec![
            "netsh interface ip set address name=\"ruhop\" static 10.66.0.2 255.255.255.0",
            "netsh interface ipv4 set subinterface \"ruhop\" mtu=1400 store=persistent",
            "netsh interface ipv4 set interface \"ruhop\" metric=5",
            "netsh interface ip set dns name=\"ruhop\" static 10.66.0.1",
            "netsh interface ipv4 add route 0.0.0.0/1 \"ruhop\" 10.66.0.1 metric=1",
            "ipconfig /flushdns",
        ]
    );
}

/// Re-adding the same route on reconnect must not fail
#[test]
fn test_route_readd_is_idempotent() {
    let driver = MemoryDriver::new();
    let (runner, adapter) = configured_adapter(&driver);
    runner.respond_when(
        "add route",
        CommandOutput {
            status: Some(1),
            stdout: "The object already exists.".into(),
            stderr: String::new(),
        },
    );

    for _ in 0..2 {
        adapter
            .add_route(
                Ipv4Addr::new(10, 0, 0, 0),
                Ipv4Addr::new(255, 0, 0, 0),
                Ipv4Addr::new(10, 66, 0, 1),
                5,
            )
            .unwrap();
    }
}

#[test]
fn test_configuration_timeout_surfaces() {
    let driver = MemoryDriver::new();
    let (runner, adapter) = configured_adapter(&driver);
    runner.time_out_when("set dns");
    let err = adapter.set_dns_server(Ipv4Addr::new(10, 66, 0, 1)).unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));
}

/// Full-duplex traffic: a reader thread drains while another thread sends
#[test]
fn test_concurrent_reader_and_sender() {
    let driver = MemoryDriver::new();
    let adapter = Arc::new(TunnelAdapter::create(&driver, "ruhop", "Ruhop", None).unwrap());
    adapter.start_session(DEFAULT_RING_CAPACITY).unwrap();
    let ring = adapter.handle().ring().unwrap();

    let reader = {
        let adapter = Arc::clone(&adapter);
        thread::spawn(move || {
            adapter
                .run_reader(Duration::from_millis(5), |_| {})
                .unwrap()
        })
    };
    let sender = {
        let adapter = Arc::clone(&adapter);
        thread::spawn(move || {
            for _ in 0..100 {
                adapter.send_packet(&[0x45; 64]).unwrap();
            }
        })
    };

    for _ in 0..50 {
        ring.inject(vec![0x45; 40]);
    }
    sender.join().unwrap();
    thread::sleep(Duration::from_millis(100));
    adapter.end_session();

    assert_eq!(reader.join().unwrap(), 50);
    assert_eq!(ring.take_sent().len(), 100);
    assert!(ring.is_closed());

    let stats = adapter.stats();
    assert_eq!(stats.packets_rx, 50);
    assert_eq!(stats.packets_tx, 100);
}

/// After the session ends nothing is readable and sending is refused
#[test]
fn test_ended_session_state() {
    let driver = MemoryDriver::new();
    let adapter = TunnelAdapter::create(&driver, "ruhop", "Ruhop", None).unwrap();
    adapter.start_session(DEFAULT_RING_CAPACITY).unwrap();
    adapter.end_session();

    assert_eq!(adapter.wait_readable(Some(Duration::ZERO)).unwrap(), WaitStatus::Closed);
    assert!(matches!(adapter.send_packet(&[0x45; 20]), Err(Error::NoSession)));
    assert!(adapter.receive_packet().is_none());
}

/// Route selection ignores the tunnel even when it is preferred
#[test]
fn test_selector_skips_tunnel_during_bring_up() {
    let table = StaticRouteTable::new(vec![
        ForwardEntry::new(
            "ruhop",
            "0.0.0.0/0".parse().unwrap(),
            "10.66.0.1".parse().unwrap(),
            0,
        ),
        ForwardEntry::new(
            "Wi-Fi",
            "0.0.0.0/0".parse().unwrap(),
            "192.168.50.1".parse().unwrap(),
            35,
        ),
        ForwardEntry::new(
            "Ethernet",
            "0.0.0.0/0".parse().unwrap(),
            "0.0.0.0".parse().unwrap(),
            5,
        ),
    ]);
    let selector = RouteSelector::with_table(Arc::new(table));

    let route = selector.best_physical_route(Some("ruhop")).unwrap();
    assert_eq!(route.interface_alias, "Wi-Fi");
    assert_eq!(route.gateway, Ipv4Addr::new(192, 168, 50, 1));

    // Without the exclusion the tunnel itself would be chosen
    let route = selector.best_physical_route(None).unwrap();
    assert_eq!(route.interface_alias, "ruhop");
}

/// Reading the host table must not panic; an empty result is fine
#[cfg(any(target_os = "linux", target_os = "windows"))]
#[test]
fn test_system_route_table_readable() {
    let selector = RouteSelector::new();
    match selector.best_physical_route(None) {
        Ok(route) => assert!(!route.gateway.is_unspecified()),
        Err(e) => assert!(e.is_not_found(), "unexpected error: {e}"),
    }
}

#[cfg(windows)]
#[test]
#[ignore = "requires administrator privileges and the WinTun driver"]
fn test_privileged_wintun_adapter() {
    use hop_tun::windows::WintunDriver;

    let driver = WintunDriver::load().unwrap();
    let adapter = TunnelAdapter::open(&driver, "ruhop-test")
        .or_else(|_| TunnelAdapter::create(&driver, "ruhop-test", "Ruhop", None))
        .unwrap();
    adapter.start_session(DEFAULT_RING_CAPACITY).unwrap();
    adapter
        .set_ip_address(Ipv4Addr::new(10, 250, 0, 2), Ipv4Addr::new(255, 255, 255, 0))
        .unwrap();
    adapter.set_mtu(1400).unwrap();
    adapter.end_session();
}
