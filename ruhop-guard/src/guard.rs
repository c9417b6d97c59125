//! Tunnel and kill-switch orchestration
//!
//! The ordering rules that keep the host leak-free live here: the tunnel is
//! configured before the block-all rule goes in, and the block-all rule is
//! removed before the tunnel session ends.

use std::sync::Arc;

use hop_firewall::{FilterEngine, KillSwitch};
use hop_tun::{
    AdapterHandle, CommandRunner, NetshConfigurator, RouteInfo, RouteSelector, TunDriver,
    TunnelAdapter, TunnelStats,
};
use ipnet::Ipv4Net;

use crate::config::{Config, TunnelConfig};
use crate::error::{Error, Result};
use crate::state::GuardState;

/// Name of the rule permitting traffic from the tunnel address
pub const TUNNEL_PERMIT_NAME: &str = "Permit Tunnel Address";

/// Open (or create) the adapter named in `tunnel`
///
/// netsh calls made through the adapter go to `runner` with the configured
/// timeout.
pub fn open_tunnel<D>(
    driver: &D,
    tunnel: &TunnelConfig,
    runner: Arc<dyn CommandRunner>,
) -> Result<TunnelAdapter<D::Adapter>>
where
    D: TunDriver,
{
    let adapter = if tunnel.open_existing {
        match TunnelAdapter::open(driver, &tunnel.name) {
            Ok(adapter) => adapter,
            Err(e) if e.is_not_found() => {
                log::debug!("Adapter {} not found, creating it", tunnel.name);
                TunnelAdapter::create(driver, &tunnel.name, &tunnel.tunnel_type, tunnel.guid)?
            }
            Err(e) => return Err(e.into()),
        }
    } else {
        TunnelAdapter::create(driver, &tunnel.name, &tunnel.tunnel_type, tunnel.guid)?
    };

    let netcfg = NetshConfigurator::with_runner(runner).timeout(tunnel.command_timeout());
    Ok(adapter.with_configurator(netcfg))
}

/// What a connect attempt has installed so far
#[derive(Debug, Default)]
struct Progress {
    session: bool,
    killswitch: bool,
}

/// Brings a tunnel and its kill-switch up and down in a leak-safe order
///
/// Not internally synchronized; drive it from one control thread. Reader
/// threads get their own handle through [`Guard::adapter`].
pub struct Guard<A: AdapterHandle, E: FilterEngine> {
    config: Config,
    adapter: Arc<TunnelAdapter<A>>,
    killswitch: KillSwitch<E>,
    selector: RouteSelector,
    state: GuardState,
    physical_route: Option<RouteInfo>,
}

impl<A: AdapterHandle, E: FilterEngine> Guard<A, E> {
    pub fn new(config: Config, adapter: TunnelAdapter<A>, killswitch: KillSwitch<E>) -> Self {
        Self {
            config,
            adapter: Arc::new(adapter),
            killswitch,
            selector: RouteSelector::new(),
            state: GuardState::Disconnected,
            physical_route: None,
        }
    }

    /// Replace the route selector (the system routing table by default)
    pub fn with_route_selector(mut self, selector: RouteSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> GuardState {
        self.state
    }

    /// Shared handle to the adapter for reader and sender threads
    pub fn adapter(&self) -> &Arc<TunnelAdapter<A>> {
        &self.adapter
    }

    pub fn killswitch(&self) -> &KillSwitch<E> {
        &self.killswitch
    }

    /// Physical default route seen by the last successful connect
    pub fn physical_route(&self) -> Option<&RouteInfo> {
        self.physical_route.as_ref()
    }

    pub fn stats(&self) -> TunnelStats {
        self.adapter.stats()
    }

    fn set_state(&mut self, new: GuardState) {
        if self.state != new {
            log::info!("Guard state: {} -> {}", self.state, new);
            self.state = new;
        }
    }

    /// Bring the tunnel up, then enable the kill-switch
    ///
    /// Whatever this call installed is removed again when a step fails. If
    /// that cleanup fails too, [`Error::RollbackFailed`] carries both errors
    /// and the state becomes `Error`.
    pub fn connect(&mut self) -> Result<()> {
        if !self.state.can_connect() {
            return Err(Error::InvalidState(format!("cannot connect while {}", self.state)));
        }
        if self.state == GuardState::Error {
            self.clear_leftovers()?;
        }
        self.set_state(GuardState::Connecting);

        let mut progress = Progress::default();
        match self.bring_up(&mut progress) {
            Ok(()) => {
                self.set_state(GuardState::Connected);
                Ok(())
            }
            Err(e) => {
                log::error!("Connect failed: {}", e);
                match self.roll_back(&progress) {
                    Ok(()) => {
                        self.set_state(GuardState::Disconnected);
                        Err(e)
                    }
                    Err(rollback) => {
                        log::error!("Rollback after failed connect failed: {}", rollback);
                        self.set_state(GuardState::Error);
                        Err(Error::RollbackFailed {
                            original: Box::new(e),
                            rollback: Box::new(rollback),
                        })
                    }
                }
            }
        }
    }

    fn bring_up(&mut self, progress: &mut Progress) -> Result<()> {
        let tunnel = &self.config.tunnel;
        let adapter = &self.adapter;

        adapter.start_session(tunnel.ring_capacity)?;
        progress.session = true;

        adapter.set_ip_address(tunnel.address, tunnel.netmask)?;
        adapter.set_mtu(tunnel.mtu)?;
        if let Some(metric) = tunnel.metric {
            adapter.set_interface_metric(metric)?;
        }
        if let Some(dns) = tunnel.dns {
            adapter.set_dns_server(dns)?;
        }
        for route in &tunnel.routes {
            adapter.add_route(
                route.destination.network(),
                route.destination.netmask(),
                route.gateway,
                route.metric,
            )?;
        }
        if tunnel.flush_dns {
            adapter.flush_dns()?;
        }

        let Some(ks) = self.config.active_killswitch() else {
            log::warn!("Kill-switch disabled; traffic may leave outside the tunnel");
            return Ok(());
        };
        let mut lan = ks.lan_networks()?;

        // Computed fresh on every connect; the physical route may have failed over
        match self.selector.best_physical_route(Some(adapter.name())) {
            Ok(route) => {
                log::info!("Physical route: {}", route);
                if ks.allow_physical_gateway {
                    lan.push(Ipv4Net::from(route.gateway));
                }
                self.physical_route = Some(route);
            }
            Err(e) if ks.allow_physical_gateway => return Err(e.into()),
            Err(e) => {
                log::warn!("No physical route found: {}", e);
                self.physical_route = None;
            }
        }

        self.killswitch.enable(ks.server, ks.port, &lan)?;
        progress.killswitch = true;

        if ks.permit_tunnel_address {
            self.killswitch
                .add_permit_filter_for_local_host(tunnel.address, TUNNEL_PERMIT_NAME)?;
        }
        Ok(())
    }

    /// Remove what an earlier failed connect or disconnect left installed
    ///
    /// The state stays `Error` when the kill-switch still cannot be disabled.
    fn clear_leftovers(&mut self) -> Result<()> {
        if self.killswitch.is_enabled() {
            log::info!("Removing kill-switch rules left by a failed teardown");
            self.killswitch.disable()?;
        }
        if self.adapter.is_session_active() {
            self.adapter.end_session();
        }
        self.physical_route = None;
        Ok(())
    }

    fn roll_back(&mut self, progress: &Progress) -> Result<()> {
        if progress.killswitch {
            // Keep the session if the block-all rule cannot be removed
            self.killswitch.disable()?;
        }
        if progress.session {
            self.adapter.end_session();
        }
        self.physical_route = None;
        Ok(())
    }

    /// Disable the kill-switch, then end the packet session
    ///
    /// When the kill-switch cannot be disabled the session is left running
    /// and the state becomes `Error`; call `disconnect` again or
    /// [`Guard::close`] to escalate.
    pub fn disconnect(&mut self) -> Result<()> {
        match self.state {
            GuardState::Disconnected => return Ok(()),
            GuardState::Connected | GuardState::Error => {}
            state => return Err(Error::InvalidState(format!("cannot disconnect while {}", state))),
        }
        self.set_state(GuardState::Disconnecting);

        if let Err(e) = self.killswitch.disable() {
            log::error!("Kill-switch disable failed, keeping tunnel up: {}", e);
            self.set_state(GuardState::Error);
            return Err(e.into());
        }

        self.adapter.end_session();
        self.physical_route = None;
        self.set_state(GuardState::Disconnected);
        Ok(())
    }

    /// Disconnect and close the filter engine session
    ///
    /// The engine session is closed even when disconnect fails, which drops
    /// any rules it still holds; the tunnel session then ends as well.
    pub fn close(&mut self) -> Result<()> {
        let disconnected = self.disconnect();
        let closed = self.killswitch.close();

        if self.adapter.is_session_active() && !self.killswitch.is_enabled() {
            self.adapter.end_session();
            self.physical_route = None;
            self.set_state(GuardState::Disconnected);
        }
        disconnected.and(closed.map_err(Error::from))
    }
}

impl<A: AdapterHandle, E: FilterEngine> Drop for Guard<A, E> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("Failed to close guard: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hop_firewall::mock::MemoryEngine;
    use hop_tun::mock::{MemoryAdapter, MemoryDriver, RecordingRunner};
    use hop_tun::route::StaticRouteTable;
    use hop_tun::ForwardEntry;

    const CONFIG: &str = r#"
[tunnel]
name = "ruhop"
address = "10.66.0.2"
netmask = "255.255.255.0"
flush_dns = false

[killswitch]
server = "203.0.113.10"
lan_exclusions = ["192.168.1.0/24"]
"#;

    fn guard(toml: &str) -> (MemoryEngine, Guard<MemoryAdapter, MemoryEngine>) {
        let config = Config::from_toml(toml).unwrap();
        let driver = MemoryDriver::new();
        let adapter = open_tunnel(&driver, &config.tunnel, Arc::new(RecordingRunner::new())).unwrap();
        let engine = MemoryEngine::new();
        let table = StaticRouteTable::new(vec![ForwardEntry::new(
            "Ethernet",
            "0.0.0.0/0".parse().unwrap(),
            "192.168.1.1".parse().unwrap(),
            25,
        )]);
        let guard = Guard::new(config, adapter, KillSwitch::new(engine.clone()))
            .with_route_selector(RouteSelector::with_table(Arc::new(table)));
        (engine, guard)
    }

    #[test]
    fn test_connect_twice_is_rejected() {
        let (_engine, mut guard) = guard(CONFIG);
        guard.connect().unwrap();
        let err = guard.connect().unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert_eq!(guard.state(), GuardState::Connected);
    }

    #[test]
    fn test_disconnect_when_disconnected_is_noop() {
        let (engine, mut guard) = guard(CONFIG);
        guard.disconnect().unwrap();
        assert_eq!(guard.state(), GuardState::Disconnected);
        assert!(engine.visible_rules().is_empty());
    }

    #[test]
    fn test_physical_route_recorded() {
        let (_engine, mut guard) = guard(CONFIG);
        guard.connect().unwrap();
        let route = guard.physical_route().unwrap();
        assert_eq!(route.interface_alias, "Ethernet");
        guard.disconnect().unwrap();
        assert!(guard.physical_route().is_none());
    }

    #[test]
    fn test_drop_tears_down() {
        let (engine, mut guard) = guard(CONFIG);
        guard.connect().unwrap();
        let adapter = Arc::clone(guard.adapter());
        drop(guard);

        assert!(!adapter.is_session_active());
        assert!(engine.is_closed());
        assert!(engine.visible_rules().is_empty());
    }
}
