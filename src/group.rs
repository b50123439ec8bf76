//! Group engine
//!
//! A group couples an ordered rule list with one IP set and one routing
//! binding toward its egress interface. Two orthogonal booleans gate every
//! mutating method: the persistent `enable` flag from the data model
//! (policy) and the runtime enabled flag (lifecycle). All operations on a
//! group are serialised by one async mutex; groups are independent of each
//! other.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, error, trace};

use crate::error::{GroupError, NetfilterError};
use crate::id::Id;
use crate::models::{GroupModel, Rule};
use crate::netfilter::{IpSet, IpSetToLink, LinkEvent, NetfilterHelper};
use crate::records::Records;

/// Kernel objects owned by an enabled group
#[derive(Default, Debug)]
struct GroupState {
    ipset: Option<Arc<IpSet>>,
    binding: Option<IpSetToLink>,
}

/// Runtime wrapper around a [`GroupModel`]
#[derive(Debug)]
pub struct Group {
    model: RwLock<GroupModel>,
    enabled: AtomicBool,
    ops: Mutex<GroupState>,
    records: Arc<Records>,
    nf: Arc<NetfilterHelper>,
}

impl Group {
    #[must_use]
    pub fn new(model: GroupModel, records: Arc<Records>, nf: Arc<NetfilterHelper>) -> Self {
        Self {
            model: RwLock::new(model),
            enabled: AtomicBool::new(false),
            ops: Mutex::new(GroupState::default()),
            records,
            nf,
        }
    }

    #[must_use]
    pub fn id(&self) -> Id {
        self.model.read().id
    }

    #[must_use]
    pub fn interface(&self) -> String {
        self.model.read().interface.clone()
    }

    /// Snapshot of the data model
    #[must_use]
    pub fn model(&self) -> GroupModel {
        self.model.read().clone()
    }

    /// Mutate the data model (rule edits from the API)
    pub fn update_model<R>(&self, f: impl FnOnce(&mut GroupModel) -> R) -> R {
        f(&mut self.model.write())
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn policy_enabled(&self) -> bool {
        self.model.read().enable
    }

    /// Provision the group's kernel objects
    ///
    /// Idempotent. When the persistent enable flag is off, only the runtime
    /// flag flips — nothing is provisioned. A provisioning failure rolls
    /// back via [`Self::disable`] and returns the original error.
    pub async fn enable(&self) -> Result<(), GroupError> {
        let mut state = self.ops.lock().await;
        if self
            .enabled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        if !self.policy_enabled() {
            return Ok(());
        }

        if let Err(e) = self.provision(&mut state).await {
            self.teardown(&mut state).await.ok();
            self.enabled.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    async fn provision(&self, state: &mut GroupState) -> Result<(), GroupError> {
        let (id, iface) = {
            let model = self.model.read();
            (model.id.to_string(), model.interface.clone())
        };

        let ipset = Arc::new(self.nf.ipset(&id));
        ipset.enable().await?;
        let ipset_name = ipset.name().to_string();
        state.ipset = Some(ipset);

        let mut binding = self.nf.ipset_to_link(&id, &iface, &ipset_name);
        binding.enable().await?;
        state.binding = Some(binding);

        self.apply_fix_protect().await?;

        debug!(group = %id, iface = %iface, "group enabled");
        Ok(())
    }

    /// Remove the group's kernel objects, joining all errors
    ///
    /// Always clears the runtime flag.
    pub async fn disable(&self) -> Result<(), GroupError> {
        let mut state = self.ops.lock().await;
        if !self.enabled.load(Ordering::SeqCst) {
            return Ok(());
        }
        let result = if self.policy_enabled() {
            self.teardown(&mut state).await
        } else {
            Ok(())
        };
        self.enabled.store(false, Ordering::SeqCst);
        result
    }

    async fn teardown(&self, state: &mut GroupState) -> Result<(), GroupError> {
        let mut errs: Vec<NetfilterError> = Vec::new();

        if let Err(GroupError::FixProtect(e) | GroupError::Netfilter(e)) =
            self.remove_fix_protect().await
        {
            errs.push(e);
        }
        if let Some(mut binding) = state.binding.take() {
            if let Err(e) = binding.disable().await {
                errs.push(e);
            }
        }
        if let Some(ipset) = state.ipset.take() {
            if let Err(e) = ipset.disable().await {
                errs.push(e);
            }
        }

        NetfilterError::join(errs).map_err(GroupError::Netfilter)
    }

    /// Insert an address into the group's IP set; no-op while disabled
    pub async fn add_ip(&self, addr: IpAddr, ttl: u32) -> Result<(), GroupError> {
        let state = self.ops.lock().await;
        if !self.enabled.load(Ordering::SeqCst) || !self.policy_enabled() {
            return Ok(());
        }
        if let Some(ipset) = &state.ipset {
            ipset.add_ip(addr, Some(ttl)).await?;
        }
        Ok(())
    }

    /// Remove an address from the group's IP set; no-op while disabled
    pub async fn del_ip(&self, addr: IpAddr) -> Result<(), GroupError> {
        let state = self.ops.lock().await;
        if !self.enabled.load(Ordering::SeqCst) || !self.policy_enabled() {
            return Ok(());
        }
        if let Some(ipset) = &state.ipset {
            ipset.del_ip(addr).await?;
        }
        Ok(())
    }

    /// Current IP set entries; empty while disabled
    pub async fn list_ips(&self) -> Result<HashMap<IpAddr, Option<u32>>, GroupError> {
        let state = self.ops.lock().await;
        if !self.enabled.load(Ordering::SeqCst) || !self.policy_enabled() {
            return Ok(HashMap::new());
        }
        match &state.ipset {
            Some(ipset) => Ok(ipset.list_ips().await?),
            None => Ok(HashMap::new()),
        }
    }

    /// Reconcile the IP set with the record store
    ///
    /// Afterwards the set contains exactly the union of A records (direct
    /// or via CNAME chain) of domains matching any enabled rule. Existing
    /// entries are only refreshed with larger timeouts.
    pub async fn sync(&self) -> Result<(), GroupError> {
        let state = self.ops.lock().await;
        if !self.enabled.load(Ordering::SeqCst) || !self.policy_enabled() {
            return Ok(());
        }
        let Some(ipset) = &state.ipset else {
            return Ok(());
        };

        let rules = self.model.read().rules.clone();
        let desired = desired_addresses(&rules, &self.records);
        let current = ipset.list_ips().await?;
        let (to_add, to_del) = sync_plan(&desired, &current);

        for (addr, ttl) in to_add {
            match ipset.add_ip(addr, Some(ttl)).await {
                Ok(()) => trace!(address = %addr, ttl, "added address"),
                Err(e) => error!(address = %addr, error = %e, "failed to add address"),
            }
        }
        for addr in to_del {
            match ipset.del_ip(addr).await {
                Ok(()) => trace!(address = %addr, "deleted address"),
                Err(e) => error!(address = %addr, error = %e, "failed to delete address"),
            }
        }
        Ok(())
    }

    /// Re-assert firewall state after an external rewrite
    pub async fn netfilterd_hook(&self, kind: &str, table: &str) -> Result<(), GroupError> {
        let state = self.ops.lock().await;
        if !self.enabled.load(Ordering::SeqCst) || !self.policy_enabled() {
            return Ok(());
        }
        if table.is_empty() || table == "filter" {
            self.apply_fix_protect().await?;
        }
        if let Some(binding) = &state.binding {
            binding.netfilterd_hook(kind, table).await?;
        }
        Ok(())
    }

    /// Install the deferred route when the egress link comes up
    pub async fn link_update_hook(&self, event: &LinkEvent) -> Result<(), GroupError> {
        let mut state = self.ops.lock().await;
        if !self.enabled.load(Ordering::SeqCst) || !self.policy_enabled() {
            return Ok(());
        }
        if let Some(binding) = &mut state.binding {
            binding.link_update_hook(event).await?;
        }
        Ok(())
    }

    /// Whitelist this group's egress traffic in the vendor protect chain
    #[cfg(feature = "router-protect")]
    async fn apply_fix_protect(&self) -> Result<(), GroupError> {
        let iface = self.interface();
        if let Some(ipt) = self.nf.ipt4() {
            ipt.append_unique(
                "filter",
                "_NDM_SL_FORWARD",
                &[
                    "-o", &iface, "-m", "state", "--state", "NEW", "-j", "_NDM_SL_PROTECT",
                ],
            )
            .await
            .map_err(GroupError::FixProtect)?;
        }
        if let Some(ipt) = self.nf.ipt6() {
            ipt.append_unique(
                "filter",
                "_NDM_SL_FORWARD",
                &["-o", &iface, "-j", "_NDM_SL_PROTECT"],
            )
            .await
            .map_err(GroupError::FixProtect)?;
        }
        Ok(())
    }

    #[cfg(not(feature = "router-protect"))]
    #[allow(clippy::unused_async)]
    async fn apply_fix_protect(&self) -> Result<(), GroupError> {
        Ok(())
    }

    #[cfg(feature = "router-protect")]
    async fn remove_fix_protect(&self) -> Result<(), GroupError> {
        let iface = self.interface();
        if let Some(ipt) = self.nf.ipt4() {
            ipt.delete_if_exists(
                "filter",
                "_NDM_SL_FORWARD",
                &[
                    "-o", &iface, "-m", "state", "--state", "NEW", "-j", "_NDM_SL_PROTECT",
                ],
            )
            .await
            .map_err(GroupError::FixProtect)?;
        }
        if let Some(ipt) = self.nf.ipt6() {
            ipt.delete_if_exists(
                "filter",
                "_NDM_SL_FORWARD",
                &["-o", &iface, "-j", "_NDM_SL_PROTECT"],
            )
            .await
            .map_err(GroupError::FixProtect)?;
        }
        Ok(())
    }

    #[cfg(not(feature = "router-protect"))]
    #[allow(clippy::unused_async)]
    async fn remove_fix_protect(&self) -> Result<(), GroupError> {
        Ok(())
    }
}

/// Addresses the group's IP set should contain, with their timeouts
///
/// For every enabled rule, every known domain matching it contributes its
/// A records (following CNAME chains); each address keeps the largest
/// remaining lifetime seen.
#[must_use]
pub fn desired_addresses(rules: &[Rule], records: &Records) -> HashMap<IpAddr, u32> {
    let now = std::time::Instant::now();
    let mut desired: HashMap<IpAddr, u32> = HashMap::new();
    let known = records.list_known_domains();

    for rule in rules {
        if !rule.is_enabled() {
            continue;
        }
        for domain in &known {
            if !rule.is_match(domain) {
                continue;
            }
            for record in records.get_a_records(domain) {
                let ttl = record.remaining_ttl(now);
                desired
                    .entry(record.address)
                    .and_modify(|t| *t = (*t).max(ttl))
                    .or_insert(ttl);
            }
        }
    }
    desired
}

/// Compute the insertions and deletions reconciling `current` with
/// `desired`
///
/// An address already present is refreshed only when the desired timeout
/// is at least the current one; entries without a readable timeout are
/// left alone.
#[must_use]
pub fn sync_plan(
    desired: &HashMap<IpAddr, u32>,
    current: &HashMap<IpAddr, Option<u32>>,
) -> (Vec<(IpAddr, u32)>, Vec<IpAddr>) {
    let mut to_add = Vec::new();
    for (addr, ttl) in desired {
        match current.get(addr) {
            None => to_add.push((*addr, *ttl)),
            Some(Some(curr)) if ttl >= curr => to_add.push((*addr, *ttl)),
            Some(_) => {}
        }
    }
    let mut to_del: Vec<IpAddr> = current
        .keys()
        .filter(|addr| !desired.contains_key(*addr))
        .copied()
        .collect();
    to_del.sort();
    to_add.sort();
    (to_add, to_del)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::models::RuleKind;

    fn rule(pattern: &str, enable: bool) -> Rule {
        Rule {
            id: Id::random(),
            name: pattern.to_string(),
            kind: RuleKind::Namespace,
            rule: pattern.to_string(),
            enable,
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_desired_addresses_matching() {
        let records = Records::new();
        records.add_a_record("foo.example.com", ip("1.2.3.4"), 60);
        records.add_a_record("other.net", ip("9.9.9.9"), 60);

        let rules = vec![rule("example.com", true)];
        let desired = desired_addresses(&rules, &records);
        assert_eq!(desired.len(), 1);
        assert!(desired.contains_key(&ip("1.2.3.4")));
    }

    #[test]
    fn test_desired_addresses_skips_disabled_rules() {
        let records = Records::new();
        records.add_a_record("site.com", ip("1.1.1.1"), 60);
        records.add_a_record("other.com", ip("2.2.2.2"), 60);

        let rules = vec![rule("site.com", false), rule("other.com", true)];
        let desired = desired_addresses(&rules, &records);
        assert_eq!(desired.len(), 1);
        assert!(desired.contains_key(&ip("2.2.2.2")));
    }

    #[test]
    fn test_desired_addresses_follows_cname() {
        let records = Records::new();
        records.add_a_record("bar.example.net", ip("9.9.9.9"), 300);
        records.add_cname_record("mirror.example.com", "bar.example.net", 60);

        let rules = vec![rule("example.com", true)];
        let desired = desired_addresses(&rules, &records);
        assert!(desired.contains_key(&ip("9.9.9.9")));
    }

    #[test]
    fn test_desired_addresses_keeps_largest_ttl() {
        let records = Records::new();
        records.add_a_record("a.example.com", ip("1.2.3.4"), 30);
        records.add_a_record("b.example.com", ip("1.2.3.4"), 600);

        let rules = vec![rule("example.com", true)];
        let desired = desired_addresses(&rules, &records);
        let ttl = desired[&ip("1.2.3.4")];
        assert!(ttl > 500, "expected the larger ttl, got {ttl}");
    }

    #[test]
    fn test_sync_plan_add_and_delete() {
        let desired = HashMap::from([(ip("1.1.1.1"), 60u32), (ip("2.2.2.2"), 30u32)]);
        let current = HashMap::from([
            (ip("2.2.2.2"), Some(300u32)),
            (ip("3.3.3.3"), Some(10u32)),
        ]);
        let (to_add, to_del) = sync_plan(&desired, &current);
        // 1.1.1.1 is new; 2.2.2.2 keeps its larger current timeout
        assert_eq!(to_add, vec![(ip("1.1.1.1"), 60)]);
        // 3.3.3.3 matches no rule anymore
        assert_eq!(to_del, vec![ip("3.3.3.3")]);
    }

    #[test]
    fn test_sync_plan_refreshes_larger_ttl() {
        let desired = HashMap::from([(ip("1.1.1.1"), 500u32)]);
        let current = HashMap::from([(ip("1.1.1.1"), Some(60u32))]);
        let (to_add, to_del) = sync_plan(&desired, &current);
        assert_eq!(to_add, vec![(ip("1.1.1.1"), 500)]);
        assert!(to_del.is_empty());
    }

    #[test]
    fn test_sync_plan_leaves_untimed_entries() {
        let desired = HashMap::from([(ip("1.1.1.1"), 500u32)]);
        let current = HashMap::from([(ip("1.1.1.1"), None)]);
        let (to_add, to_del) = sync_plan(&desired, &current);
        assert!(to_add.is_empty());
        assert!(to_del.is_empty());
    }

    #[test]
    fn test_rule_disable_then_sync_scenario() {
        // Two rules fire; the first is disabled afterwards. The plan must
        // drop addresses solely attributable to the disabled rule and keep
        // shared ones.
        let records = Records::new();
        records.add_a_record("site.com", ip("1.1.1.1"), 60);
        records.add_a_record("other.com", ip("2.2.2.2"), 60);

        let enabled_rules = vec![rule("site.com", true), rule("other.com", true)];
        let before = desired_addresses(&enabled_rules, &records);
        assert_eq!(before.len(), 2);

        let current: HashMap<IpAddr, Option<u32>> =
            before.iter().map(|(a, t)| (*a, Some(*t))).collect();

        let after_rules = vec![rule("site.com", false), rule("other.com", true)];
        let after = desired_addresses(&after_rules, &records);
        let (_, to_del) = sync_plan(&after, &current);
        assert_eq!(to_del, vec![ip("1.1.1.1")]);
    }
}
