use std::net::IpAddr;

use anyhow::{Context, Result};
use ipnet::IpNet;

/// Result of checking a peer address against the allow/block sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Admit,
    Reject,
}

/// Compiled allow/block CIDR sets.
///
/// Networks are stored pre-masked, so a match is a masked equality check on
/// the address bytes. A rule only ever matches peers of its own address
/// family.
#[derive(Debug, Clone, Default)]
pub struct Acl {
    allow: Vec<IpNet>,
    block: Vec<IpNet>,
}

impl Acl {
    /// Compile textual rules. Malformed addresses and out-of-range prefixes
    /// are startup errors.
    pub fn compile(allow: &[String], block: &[String]) -> Result<Self> {
        Ok(Self {
            allow: compile_set(allow)?,
            block: compile_set(block)?,
        })
    }

    /// Block match rejects. Otherwise a non-empty allow list must match.
    pub fn classify(&self, peer: IpAddr) -> Verdict {
        if matches(&self.block, peer) {
            return Verdict::Reject;
        }
        if !self.allow.is_empty() && !matches(&self.allow, peer) {
            return Verdict::Reject;
        }
        Verdict::Admit
    }
}

fn compile_set(rules: &[String]) -> Result<Vec<IpNet>> {
    rules.iter().map(|rule| compile_rule(rule)).collect()
}

fn compile_rule(rule: &str) -> Result<IpNet> {
    let net: IpNet = if rule.contains('/') {
        rule.parse()
            .with_context(|| format!("invalid CIDR rule: {rule}"))?
    } else {
        // A bare address is a full-length prefix.
        rule.parse::<IpAddr>()
            .map(IpNet::from)
            .with_context(|| format!("invalid address rule: {rule}"))?
    };
    Ok(net.trunc())
}

fn matches(set: &[IpNet], peer: IpAddr) -> bool {
    set.iter().any(|net| net.contains(&peer))
}
