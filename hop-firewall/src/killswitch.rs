//! Fail-closed kill-switch built on a [`FilterEngine`]
//!
//! While enabled, a dedicated sublayer holds permit rules for loopback, the
//! VPN server and the configured LAN ranges, plus one block-all rule of the
//! lowest weight. Rules are installed and removed in single transactions.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::engine::{FilterEngine, Transaction};
use crate::error::{Error, Result};
use crate::rule::{plan_rules, FirewallRule, InstalledRule, KillSwitchPolicy, SubLayer};

/// A kill-switch session owning one filter-engine handle
///
/// Calls are not internally synchronized; serialize `enable`/`disable` from a
/// single control thread.
pub struct KillSwitch<E: FilterEngine> {
    engine: Option<E>,
    sublayer: SubLayer,
    policy: Option<KillSwitchPolicy>,
    installed: Vec<InstalledRule>,
    enabled: bool,
}

impl<E: FilterEngine> KillSwitch<E> {
    /// Wrap an open engine session using the default sublayer
    pub fn new(engine: E) -> Self {
        Self::with_sublayer(engine, SubLayer::default())
    }

    pub fn with_sublayer(engine: E, sublayer: SubLayer) -> Self {
        Self {
            engine: Some(engine),
            sublayer,
            policy: None,
            installed: Vec::new(),
            enabled: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether the engine session is still open
    pub fn is_open(&self) -> bool {
        self.engine.is_some()
    }

    pub fn sublayer(&self) -> &SubLayer {
        &self.sublayer
    }

    /// Policy of the current enable, if any
    pub fn policy(&self) -> Option<&KillSwitchPolicy> {
        self.policy.as_ref()
    }

    /// Rules currently tracked, in install order
    pub fn rules(&self) -> &[InstalledRule] {
        &self.installed
    }

    /// Block all outbound IPv4 traffic except loopback, `server` and
    /// `lan_exclusions`
    ///
    /// Nothing becomes visible unless every rule was added.
    pub fn enable(&mut self, server: Ipv4Addr, port: u16, lan_exclusions: &[Ipv4Net]) -> Result<()> {
        if self.enabled {
            return Err(Error::AlreadyEnabled);
        }
        let policy = KillSwitchPolicy::new(server, port, lan_exclusions.to_vec());
        policy.validate()?;

        let rules = plan_rules(&policy, &self.sublayer);
        let engine = self.engine.as_mut().ok_or(Error::EngineClosed)?;

        let mut txn = Transaction::begin(engine)?;
        match txn.add_sublayer(&self.sublayer) {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => {
                log::debug!("Sublayer {} already present, reusing it", self.sublayer.key);
            }
            Err(e) => return Err(txn.fail(e)),
        }

        let mut installed = Vec::with_capacity(rules.len());
        for rule in rules {
            match txn.add_filter(&rule) {
                Ok(id) => {
                    log::debug!("Added filter {}: {}", id, rule);
                    installed.push(InstalledRule { id, rule });
                }
                Err(e) => {
                    log::error!("Failed to add filter '{}': {}", rule.name, e);
                    return Err(txn.fail(e));
                }
            }
        }
        txn.commit()?;

        log::info!(
            "Kill-switch enabled: server {}:{}, {} LAN exclusion(s), {} rule(s)",
            policy.server,
            policy.port,
            policy.lan_exclusions.len(),
            installed.len()
        );
        self.installed = installed;
        self.policy = Some(policy);
        self.enabled = true;
        Ok(())
    }

    /// Remove every tracked rule and the sublayer
    ///
    /// Succeeds without touching the engine when not enabled. On failure the
    /// rules stay tracked and the switch stays enabled; [`KillSwitch::close`]
    /// drops them with the engine session.
    pub fn disable(&mut self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let remaining = self.installed.len();
        self.remove_all().map_err(|source| {
            log::error!("Kill-switch disable failed, {} rule(s) still installed: {}", remaining, source);
            Error::DisableFailed {
                remaining,
                source: Box::new(source),
            }
        })?;

        log::info!("Kill-switch disabled, removed {} rule(s)", remaining);
        self.installed.clear();
        self.policy = None;
        self.enabled = false;
        Ok(())
    }

    fn remove_all(&mut self) -> Result<()> {
        let engine = self.engine.as_mut().ok_or(Error::EngineClosed)?;
        let mut txn = Transaction::begin(engine)?;

        for installed in self.installed.iter().rev() {
            match txn.delete_filter(installed.id) {
                Ok(()) => log::debug!("Deleted filter {} ({})", installed.id, installed.rule.name),
                Err(e) if e.is_not_found() => {
                    log::warn!("Filter {} was already gone", installed.id);
                }
                Err(e) => return Err(txn.fail(e)),
            }
        }
        match txn.delete_sublayer(self.sublayer.key) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => log::warn!("Sublayer {} was already gone", self.sublayer.key),
            Err(e) => return Err(txn.fail(e)),
        }
        txn.commit()
    }

    /// Permit traffic sourced from `local_ip`, above the startup permits
    ///
    /// The rule is tracked and removed by the next [`KillSwitch::disable`].
    pub fn add_permit_filter_for_local_host(&mut self, local_ip: Ipv4Addr, name: &str) -> Result<()> {
        if !self.enabled {
            return Err(Error::NotEnabled);
        }
        let rule = FirewallRule::permit_local(name, local_ip, self.sublayer.key);
        let engine = self.engine.as_mut().ok_or(Error::EngineClosed)?;

        let mut txn = Transaction::begin(engine)?;
        let id = match txn.add_filter(&rule) {
            Ok(id) => id,
            Err(e) => return Err(txn.fail(e)),
        };
        txn.commit()?;

        log::info!("Permitted local host {} as filter {} ({})", local_ip, id, name);
        self.installed.push(InstalledRule { id, rule });
        Ok(())
    }

    /// Disable if enabled, then close the engine session exactly once
    ///
    /// The engine is closed even when disable fails; its session is dynamic so
    /// closing it removes whatever is left. The disable error is returned.
    pub fn close(&mut self) -> Result<()> {
        let disabled = self.disable();
        let Some(mut engine) = self.engine.take() else {
            return disabled;
        };

        let closed = engine.close();
        if closed.is_ok() && self.enabled {
            log::warn!("Engine closed with kill-switch rules still tracked; session teardown removed them");
            self.installed.clear();
            self.policy = None;
            self.enabled = false;
        }
        disabled.and(closed)
    }
}

impl<E: FilterEngine> Drop for KillSwitch<E> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("Failed to close kill-switch: {}", e);
        }
    }
}

#[cfg(windows)]
impl KillSwitch<crate::wfp::WfpEngine> {
    /// Open a dynamic WFP session and wrap it
    pub fn open() -> Result<Self> {
        Ok(Self::new(crate::wfp::WfpEngine::open()?))
    }
}
