//! Host packet-filter management
//!
//! Four custom chains are owned by this operator and hooked into the kernel's
//! built-in chains. Per-cluster rules live only in the custom chains, so a
//! full teardown is a flush plus a handful of jump-rule deletions.

pub mod chains;
pub mod iptables;
pub mod rules;

use std::fmt;

use thiserror::Error;

use self::iptables::{IptablesError, IptablesOps};

pub const NAT_TABLE: &str = "nat";
pub const FILTER_TABLE: &str = "filter";

pub const POSTROUTING_CHAIN: &str = "FEDNET-POSTROUTING";
pub const PREROUTING_CHAIN: &str = "FEDNET-PREROUTING";
pub const FORWARD_CHAIN: &str = "FEDNET-FORWARD";
pub const INPUT_CHAIN: &str = "FEDNET-INPUT";

/// A custom chain and the built-in chain that jumps into it
#[derive(Debug, Clone, Copy)]
pub struct CustomChain {
    pub table: &'static str,
    pub name: &'static str,
    pub builtin: &'static str,
    /// Match arguments placed before `-j <name>` in the jump rule
    pub jump_match: &'static [&'static str],
}

impl CustomChain {
    pub fn chain(&self) -> IptablesChain {
        IptablesChain::new(self.table, self.name)
    }

    /// Rule in the built-in chain redirecting traffic into this chain
    pub fn jump_rule(&self) -> IptablesRule {
        let mut spec: Vec<&str> = self.jump_match.to_vec();
        spec.extend(["-j", self.name]);
        IptablesRule::new(self.table, self.builtin, spec)
    }
}

pub const CUSTOM_CHAINS: [CustomChain; 4] = [
    CustomChain {
        table: NAT_TABLE,
        name: POSTROUTING_CHAIN,
        builtin: "POSTROUTING",
        jump_match: &[],
    },
    CustomChain {
        table: NAT_TABLE,
        name: PREROUTING_CHAIN,
        builtin: "PREROUTING",
        jump_match: &[],
    },
    CustomChain {
        table: FILTER_TABLE,
        name: FORWARD_CHAIN,
        builtin: "FORWARD",
        jump_match: &[],
    },
    CustomChain {
        table: FILTER_TABLE,
        name: INPUT_CHAIN,
        builtin: "INPUT",
        jump_match: &["-p", "udp", "-m", "udp"],
    },
];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IptablesChain {
    pub table: String,
    pub name: String,
}

impl IptablesChain {
    pub fn new(table: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for IptablesChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.name)
    }
}

/// One rule, identified by table, chain and its exact argument list
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IptablesRule {
    pub table: String,
    pub chain: String,
    pub spec: Vec<String>,
}

impl IptablesRule {
    pub fn new<I, S>(table: impl Into<String>, chain: impl Into<String>, spec: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            table: table.into(),
            chain: chain.into(),
            spec: spec.into_iter().map(Into::into).collect(),
        }
    }

    /// Rule spec in the form accepted by [`iptables::IptablesOps`]
    pub fn rule_spec(&self) -> String {
        self.spec.join(" ")
    }
}

impl fmt::Display for IptablesRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}: {}", self.table, self.chain, self.rule_spec())
    }
}

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("iptables chain {chain} failed: {source}")]
    Chain {
        chain: IptablesChain,
        #[source]
        source: IptablesError,
    },
    #[error("iptables rule [{rule}] failed: {source}")]
    Rule {
        rule: IptablesRule,
        #[source]
        source: IptablesError,
    },
    #[error("invalid CIDR {cidr:?}: {reason}")]
    InvalidCidr { cidr: String, reason: String },
    #[error("tunnel interface for cluster {0} is not ready")]
    TunnelNotReady(String),
}

/// Append the rule unless an identical one is present; true if it was added
pub(crate) async fn append_unique(
    iptables: &dyn IptablesOps,
    rule: &IptablesRule,
) -> Result<bool, FirewallError> {
    let spec = rule.rule_spec();
    let wrap = |source| FirewallError::Rule {
        rule: rule.clone(),
        source,
    };
    if iptables
        .exists(&rule.table, &rule.chain, &spec)
        .await
        .map_err(wrap)?
    {
        return Ok(false);
    }
    iptables
        .append(&rule.table, &rule.chain, &spec)
        .await
        .map_err(wrap)?;
    Ok(true)
}

/// Insert the rule at `position` unless an identical one is present anywhere
/// in the chain; true if it was added
pub(crate) async fn insert_unique(
    iptables: &dyn IptablesOps,
    rule: &IptablesRule,
    position: i32,
) -> Result<bool, FirewallError> {
    let spec = rule.rule_spec();
    let wrap = |source| FirewallError::Rule {
        rule: rule.clone(),
        source,
    };
    if iptables
        .exists(&rule.table, &rule.chain, &spec)
        .await
        .map_err(wrap)?
    {
        return Ok(false);
    }
    iptables
        .insert(&rule.table, &rule.chain, &spec, position)
        .await
        .map_err(wrap)?;
    Ok(true)
}

/// Delete the rule; an absent rule or chain counts as deleted.
/// Returns false if there was nothing to delete.
pub(crate) async fn delete_rule(
    iptables: &dyn IptablesOps,
    rule: &IptablesRule,
) -> Result<bool, FirewallError> {
    match iptables
        .delete(&rule.table, &rule.chain, &rule.rule_spec())
        .await
    {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_exist() => Ok(false),
        Err(source) => Err(FirewallError::Rule {
            rule: rule.clone(),
            source,
        }),
    }
}
