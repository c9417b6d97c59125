//! Transactional host firewall kill-switch for VPN clients
//!
//! Once enabled, the kill-switch blocks every outbound IPv4 connection except
//! loopback, the VPN server and configured LAN ranges. All rules live in a
//! dedicated high-priority sublayer and are installed or removed in a single
//! engine transaction, so a failure never leaves a partial rule set behind.
//!
//! # Platform Requirements
//!
//! ## Windows
//! - Administrator privileges
//! - Base Filtering Engine service running
//!
//! Other platforms get the rule model, planning and the in-memory
//! [`mock::MemoryEngine`] only.
//!
//! # Example
//!
//! ```ignore
//! use hop_firewall::KillSwitch;
//!
//! let mut ks = KillSwitch::open()?;
//! ks.enable("203.0.113.10".parse()?, 4096, &["192.168.1.0/24".parse()?])?;
//! ks.add_permit_filter_for_local_host("10.66.0.2".parse()?, "Permit Tunnel")?;
//! // ...
//! ks.disable()?;
//! ```

pub mod engine;
pub mod error;
pub mod killswitch;
pub mod mock;
pub mod rule;

#[cfg(windows)]
pub mod wfp;

pub use engine::{FilterEngine, Transaction};
pub use error::{Error, Result};
pub use killswitch::KillSwitch;
pub use rule::{
    parse_lan_exclusions, plan_rules, Action, ConditionField, FirewallRule, InstalledRule,
    KillSwitchPolicy, Layer, MatchType, RuleCondition, SubLayer, BLOCK_ALL_WEIGHT,
    LOCAL_HOST_PERMIT_WEIGHT, PERMIT_WEIGHT,
};

#[cfg(windows)]
pub use wfp::WfpEngine;
