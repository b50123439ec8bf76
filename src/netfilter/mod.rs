//! Netfilter primitives: IP sets, firewall chains, policy routing
//!
//! All kernel objects the daemon creates are identified by configured name
//! prefixes, one for iptables chains and one for IP sets, so the chain
//! cleaner can find our state across restarts while everything else in the
//! shared tables stays untouched.

mod cleaner;
mod exec;
mod ipset;
mod ipset_to_link;
mod iptables;
mod link_monitor;
mod port_remap;
mod route;

pub use ipset::IpSet;
pub use ipset_to_link::IpSetToLink;
pub use iptables::{Family, IpTables};
pub use link_monitor::{parse_monitor_line, spawn as spawn_link_monitor, LinkEvent};
pub use port_remap::PortRemap;
pub use route::{
    link_exists, list_addresses, list_links, pick_unused_mark_and_table, LinkInfo, PolicyRule,
};

use crate::error::NetfilterError;

/// Factory for netfilter primitives, carrying prefixes and per-family
/// iptables instances
///
/// Either family can be disabled by configuration; primitives skip the
/// missing one.
#[derive(Debug)]
pub struct NetfilterHelper {
    chain_prefix: String,
    ipset_prefix: String,
    ipt4: Option<IpTables>,
    ipt6: Option<IpTables>,
}

impl NetfilterHelper {
    #[must_use]
    pub fn new(
        chain_prefix: String,
        ipset_prefix: String,
        disable_ipv4: bool,
        disable_ipv6: bool,
    ) -> Self {
        Self {
            chain_prefix,
            ipset_prefix,
            ipt4: (!disable_ipv4).then(|| IpTables::new(Family::V4)),
            ipt6: (!disable_ipv6).then(|| IpTables::new(Family::V6)),
        }
    }

    #[must_use]
    pub fn chain_prefix(&self) -> &str {
        &self.chain_prefix
    }

    #[must_use]
    pub fn ipt4(&self) -> Option<IpTables> {
        self.ipt4
    }

    #[must_use]
    pub fn ipt6(&self) -> Option<IpTables> {
        self.ipt6
    }

    /// IP set pair named `<ipset-prefix><name>`
    #[must_use]
    pub fn ipset(&self, name: &str) -> IpSet {
        IpSet::new(format!("{}{name}", self.ipset_prefix))
    }

    /// Routing binding for `<chain-prefix><name>` marking packets that hit
    /// `ipset_name`
    #[must_use]
    pub fn ipset_to_link(&self, name: &str, iface_name: &str, ipset_name: &str) -> IpSetToLink {
        IpSetToLink::new(
            format!("{}{name}", self.chain_prefix),
            iface_name.to_string(),
            ipset_name.to_string(),
            self.ipt4,
            self.ipt6,
        )
    }

    /// Port remap `<chain-prefix><name>_PRR` from port `from` to `to`
    #[must_use]
    pub fn port_remap(
        &self,
        name: &str,
        from: u16,
        to: u16,
        addresses: Vec<std::net::IpAddr>,
    ) -> PortRemap {
        PortRemap::new(
            format!("{}{name}", self.chain_prefix),
            from,
            to,
            addresses,
            self.ipt4,
            self.ipt6,
        )
    }

    /// Delete every leftover prefixed chain and jump in both families
    pub async fn clean_iptables(&self) -> Result<(), NetfilterError> {
        for ipt in self.ipt4.iter().chain(self.ipt6.iter()) {
            cleaner::clean_chains(*ipt, &self.chain_prefix).await?;
        }
        Ok(())
    }
}
