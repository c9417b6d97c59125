//! Firewall rule model and kill-switch rule planning

use std::fmt;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Weight of the block-all rule; lowest in the sublayer
pub const BLOCK_ALL_WEIGHT: u8 = 1;

/// Weight of the loopback, server and LAN permit rules
pub const PERMIT_WEIGHT: u8 = 100;

/// Weight of the local-host permit rule added after enable
pub const LOCAL_HOST_PERMIT_WEIGHT: u8 = 110;

/// Highest sublayer weight, evaluated before the OS default sublayers
pub const MAX_SUBLAYER_WEIGHT: u16 = 0xFFFF;

const LOOPBACK: Ipv4Net = Ipv4Net::new_assert(Ipv4Addr::new(127, 0, 0, 0), 8);

/// Evaluation point of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    /// IPv4 outbound connection attempt (ALE auth connect)
    AleAuthConnectV4,
}

/// Address field a condition matches on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionField {
    RemoteAddress,
    LocalAddress,
}

/// How a condition value is compared
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    Equal,
}

/// Address-and-mask match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleCondition {
    pub field: ConditionField,
    pub match_type: MatchType,
    pub value: Ipv4Net,
}

/// What happens to matching traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Permit,
    Block,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Permit => write!(f, "PERMIT"),
            Action::Block => write!(f, "BLOCK"),
        }
    }
}

/// A named priority group of rules
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubLayer {
    pub key: Uuid,
    pub name: String,
    pub description: String,
    pub weight: u16,
}

impl SubLayer {
    /// Key of the kill-switch sublayer
    pub const DEFAULT_KEY: Uuid = Uuid::from_u128(0x5d2c7a3e_8b14_4f6a_9c21_7e0b3f4a6d18);

    pub fn new(key: Uuid, name: impl Into<String>) -> Self {
        Self {
            key,
            name: name.into(),
            description: "Sublayer for VPN kill-switch filters".to_string(),
            weight: MAX_SUBLAYER_WEIGHT,
        }
    }
}

impl Default for SubLayer {
    fn default() -> Self {
        Self::new(Self::DEFAULT_KEY, "Ruhop Kill-Switch")
    }
}

/// A rule to be installed in the filter engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    /// Rule GUID
    pub key: Uuid,
    pub name: String,
    pub description: String,
    pub layer: Layer,
    pub sublayer: Uuid,
    /// Priority within the sublayer; higher is evaluated first
    pub weight: u8,
    pub condition: Option<RuleCondition>,
    pub action: Action,
}

impl FirewallRule {
    fn new(
        name: impl Into<String>,
        sublayer: Uuid,
        weight: u8,
        condition: Option<RuleCondition>,
        action: Action,
    ) -> Self {
        let name = name.into();
        Self {
            key: Uuid::new_v4(),
            description: format!("VPN Kill-Switch: {}", name),
            name,
            layer: Layer::AleAuthConnectV4,
            sublayer,
            weight,
            condition,
            action,
        }
    }

    /// Permit connections to `network`
    pub fn permit_remote(name: impl Into<String>, network: Ipv4Net, sublayer: Uuid) -> Self {
        let condition = RuleCondition {
            field: ConditionField::RemoteAddress,
            match_type: MatchType::Equal,
            value: network.trunc(),
        };
        Self::new(name, sublayer, PERMIT_WEIGHT, Some(condition), Action::Permit)
    }

    /// Permit connections originating from `address`
    pub fn permit_local(name: impl Into<String>, address: Ipv4Addr, sublayer: Uuid) -> Self {
        let condition = RuleCondition {
            field: ConditionField::LocalAddress,
            match_type: MatchType::Equal,
            value: Ipv4Net::from(address),
        };
        Self::new(
            name,
            sublayer,
            LOCAL_HOST_PERMIT_WEIGHT,
            Some(condition),
            Action::Permit,
        )
    }

    /// Block everything not permitted by a heavier rule
    pub fn block_all(sublayer: Uuid) -> Self {
        let mut rule = Self::new("Block All", sublayer, BLOCK_ALL_WEIGHT, None, Action::Block);
        rule.description = "Blocks all outbound traffic not explicitly permitted".to_string();
        rule
    }
}

impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<5} w={:<3} ", self.action, self.weight)?;
        match &self.condition {
            Some(c) => {
                let side = match c.field {
                    ConditionField::RemoteAddress => "remote",
                    ConditionField::LocalAddress => "local",
                };
                write!(f, "{}={} ", side, c.value)?;
            }
            None => write!(f, "any ")?,
        }
        write!(f, "({})", self.name)
    }
}

/// A rule as installed, with its engine-assigned id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledRule {
    pub id: u64,
    pub rule: FirewallRule,
}

/// The allow-list a kill-switch enforces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillSwitchPolicy {
    /// VPN server; always reachable
    pub server: Ipv4Addr,
    /// VPN server port; recorded for diagnostics, rules match on address only
    pub port: u16,
    /// Local networks that bypass the block
    pub lan_exclusions: Vec<Ipv4Net>,
}

impl KillSwitchPolicy {
    pub fn new(server: Ipv4Addr, port: u16, lan_exclusions: Vec<Ipv4Net>) -> Self {
        Self {
            server,
            port,
            lan_exclusions,
        }
    }

    /// Reject server addresses that would make the allow-list meaningless
    pub fn validate(&self) -> Result<()> {
        if self.server.is_unspecified() || self.server.is_broadcast() {
            return Err(Error::InvalidPolicy(format!(
                "{} is not a usable server address",
                self.server
            )));
        }
        if let Some(net) = self.lan_exclusions.iter().find(|n| n.prefix_len() == 0) {
            return Err(Error::InvalidPolicy(format!(
                "LAN exclusion {} would permit all traffic",
                net
            )));
        }
        Ok(())
    }
}

/// Parse LAN exclusions written as CIDR strings
///
/// Malformed entries are rejected rather than skipped.
pub fn parse_lan_exclusions<S: AsRef<str>>(entries: &[S]) -> Result<Vec<Ipv4Net>> {
    entries
        .iter()
        .map(|entry| {
            let entry = entry.as_ref().trim();
            entry
                .parse::<Ipv4Net>()
                .map_err(|_| Error::InvalidPolicy(format!("'{}' is not an IPv4 CIDR", entry)))
        })
        .collect()
}

/// The ordered rules `KillSwitch::enable` installs for `policy`
///
/// Loopback, the server /32 and each LAN exclusion are permitted; the last
/// rule blocks everything else.
pub fn plan_rules(policy: &KillSwitchPolicy, sublayer: &SubLayer) -> Vec<FirewallRule> {
    let mut rules = Vec::with_capacity(policy.lan_exclusions.len() + 3);

    rules.push(FirewallRule::permit_remote("Permit Loopback", LOOPBACK, sublayer.key));
    rules.push(FirewallRule::permit_remote(
        "Permit VPN Server",
        Ipv4Net::from(policy.server),
        sublayer.key,
    ));
    for net in &policy.lan_exclusions {
        rules.push(FirewallRule::permit_remote(
            format!("Permit LAN {}", net),
            *net,
            sublayer.key,
        ));
    }
    rules.push(FirewallRule::block_all(sublayer.key));

    rules
}
