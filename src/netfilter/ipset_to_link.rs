//! Binding of an IP set to an egress link via mark-based policy routing
//!
//! Enable installs, in order: a mangle chain that restores the connmark,
//! sets the freshly allocated fwmark and saves the connmark back; jumps
//! from `mangle/PREROUTING` keyed on the set; a nat MASQUERADE chain with
//! `nat/POSTROUTING` jumps; a policy rule `fwmark X lookup T`; and a
//! default route via the egress link in table T. A missing link is not an
//! error — the route is installed later by the link-update hook.
//!
//! Teardown reverses every step and joins all errors.

use tracing::{debug, trace};

use crate::error::NetfilterError;
use crate::netfilter::iptables::{Family, IpTables};
use crate::netfilter::link_monitor::LinkEvent;
use crate::netfilter::route;

/// One live routing binding
///
/// Not internally synchronized: the owning group serialises access.
#[derive(Debug)]
pub struct IpSetToLink {
    chain_name: String,
    iface_name: String,
    ipset_name: String,
    ipt4: Option<IpTables>,
    ipt6: Option<IpTables>,

    enabled: bool,
    mark: u32,
    table: u32,
    rule_installed: bool,
    route_installed: bool,
}

impl IpSetToLink {
    /// `chain_name` and `ipset_name` arrive fully prefixed
    #[must_use]
    pub fn new(
        chain_name: String,
        iface_name: String,
        ipset_name: String,
        ipt4: Option<IpTables>,
        ipt6: Option<IpTables>,
    ) -> Self {
        Self {
            chain_name,
            iface_name,
            ipset_name,
            ipt4,
            ipt6,
            enabled: false,
            mark: 0,
            table: 0,
            rule_installed: false,
            route_installed: false,
        }
    }

    fn instances(&self) -> impl Iterator<Item = IpTables> + '_ {
        self.ipt4.iter().chain(self.ipt6.iter()).copied()
    }

    /// Allocate a mark/table pair and install the full binding
    pub async fn enable(&mut self) -> Result<(), NetfilterError> {
        if self.enabled {
            return Ok(());
        }
        if let Err(e) = self.install().await {
            self.disable().await.ok();
            return Err(e);
        }
        self.enabled = true;
        Ok(())
    }

    async fn install(&mut self) -> Result<(), NetfilterError> {
        // Drop anything a previous incarnation left behind
        self.teardown().await.ok();

        let rules = route::list_policy_rules().await?;
        let tables = route::list_route_tables().await?;
        let (mark, table) = route::pick_unused_mark_and_table(&rules, &tables)?;
        self.mark = mark;
        self.table = table;
        trace!(mark, table, "allocated routing binding");

        for ipt in self.instances() {
            ipt.clear_chain("mangle", &self.chain_name).await?;
            ipt.clear_chain("nat", &self.chain_name).await?;
        }
        for ipt in self.instances() {
            self.insert_iptables_rules(ipt, "").await?;
        }

        for family in self.families() {
            route::add_policy_rule(family, self.mark, self.table).await?;
        }
        self.rule_installed = true;

        self.insert_route().await?;
        Ok(())
    }

    /// Tear down every installed step, joining all errors
    pub async fn disable(&mut self) -> Result<(), NetfilterError> {
        let result = self.teardown().await;
        self.enabled = false;
        result
    }

    async fn teardown(&mut self) -> Result<(), NetfilterError> {
        let mut errs = Vec::new();

        if self.route_installed {
            for family in self.families() {
                if let Err(e) =
                    route::del_default_route(family, &self.iface_name, self.table).await
                {
                    errs.push(e);
                }
            }
            self.route_installed = false;
        }

        if self.rule_installed {
            for family in self.families() {
                if let Err(e) = route::del_policy_rule(family, self.mark, self.table).await {
                    errs.push(e);
                }
            }
            self.rule_installed = false;
        }

        for ipt in self.instances() {
            let set_match = self.set_match(ipt.family());
            let jump: Vec<&str> = set_match
                .iter()
                .map(String::as_str)
                .chain(["-j", self.chain_name.as_str()])
                .collect();

            if let Err(e) = ipt.delete_if_exists("mangle", "PREROUTING", &jump).await {
                errs.push(e);
            }
            if let Err(e) = ipt.clear_and_delete_chain("mangle", &self.chain_name).await {
                errs.push(e);
            }
            if let Err(e) = ipt.delete_if_exists("nat", "POSTROUTING", &jump).await {
                errs.push(e);
            }
            if let Err(e) = ipt.clear_and_delete_chain("nat", &self.chain_name).await {
                errs.push(e);
            }
        }

        NetfilterError::join(errs)
    }

    fn families(&self) -> Vec<Family> {
        self.instances().map(|ipt| ipt.family()).collect()
    }

    fn set_match(&self, family: Family) -> [String; 4] {
        [
            "-m".to_string(),
            "set".to_string(),
            "--match-set".to_string(),
            format!("{}{}", self.ipset_name, family.set_suffix()),
        ]
    }

    /// Install chains and jumps for one family, optionally scoped to a
    /// single table (as reported by a netfilter.d event)
    async fn insert_iptables_rules(
        &self,
        ipt: IpTables,
        table: &str,
    ) -> Result<(), NetfilterError> {
        let mark = self.mark.to_string();
        let set_match = self.set_match(ipt.family());
        let jump: Vec<&str> = set_match
            .iter()
            .map(String::as_str)
            .chain(["-j", self.chain_name.as_str()])
            .collect();

        if table.is_empty() || table == "mangle" {
            ipt.new_chain("mangle", &self.chain_name).await?;
            for spec in [
                vec!["-j", "CONNMARK", "--restore-mark"],
                vec!["-j", "MARK", "--set-mark", mark.as_str()],
                vec!["-j", "CONNMARK", "--save-mark"],
            ] {
                ipt.append_unique("mangle", &self.chain_name, &spec).await?;
            }
            ipt.insert_unique("mangle", "PREROUTING", 1, &jump).await?;
        }

        if table.is_empty() || table == "nat" {
            ipt.new_chain("nat", &self.chain_name).await?;
            ipt.append_unique("nat", &self.chain_name, &["-j", "MASQUERADE"])
                .await?;
            ipt.append_unique("nat", "POSTROUTING", &jump).await?;
        }

        Ok(())
    }

    async fn insert_route(&mut self) -> Result<(), NetfilterError> {
        if !route::link_exists(&self.iface_name).await? {
            debug!(iface = %self.iface_name, "interface not found, route deferred");
            return Ok(());
        }
        for family in self.families() {
            route::add_default_route(family, &self.iface_name, self.table).await?;
        }
        self.route_installed = true;
        Ok(())
    }

    /// Re-assert chains and jumps after an external firewall rewrite
    ///
    /// `kind` selects the family: empty or `iptables`/`ip4tables` for v4,
    /// empty or `ip6tables` for v6. `table` narrows to one table when set.
    pub async fn netfilterd_hook(&self, kind: &str, table: &str) -> Result<(), NetfilterError> {
        if !self.enabled {
            return Ok(());
        }
        if matches!(kind, "" | "iptables" | "ip4tables") {
            if let Some(ipt) = self.ipt4 {
                self.insert_iptables_rules(ipt, table).await?;
            }
        }
        if matches!(kind, "" | "ip6tables") {
            if let Some(ipt) = self.ipt6 {
                self.insert_iptables_rules(ipt, table).await?;
            }
        }
        Ok(())
    }

    /// Install the deferred default route once the egress link appears
    pub async fn link_update_hook(&mut self, event: &LinkEvent) -> Result<(), NetfilterError> {
        if !self.enabled || !event.up || event.name != self.iface_name {
            return Ok(());
        }
        self.insert_route().await
    }
}
