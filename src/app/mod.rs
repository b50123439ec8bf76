//! Application core
//!
//! [`App`] owns the record store, the group list and the netfilter factory,
//! and wires the DNS proxy hooks into them. The lifecycle (startup order,
//! event loop, teardown) lives in [`start`]; DNS interception in [`dns`];
//! config import/export in [`config`].

mod config;
mod dns;
mod start;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::config::AppSettings;
use crate::error::AppError;
use crate::group::Group;
use crate::id::Id;
use crate::logging::LevelHandle;
use crate::models::GroupModel;
use crate::netfilter::{self, LinkInfo, NetfilterHelper, PortRemap};
use crate::records::Records;

/// Application core state
pub struct App {
    settings: RwLock<AppSettings>,
    records: Arc<Records>,
    nf: RwLock<Arc<NetfilterHelper>>,
    groups: RwLock<Vec<Arc<Group>>>,
    running: AtomicBool,
    dns_overrider: Mutex<Option<PortRemap>>,
    log_handle: RwLock<Option<LevelHandle>>,
}

impl App {
    #[must_use]
    pub fn new() -> Arc<Self> {
        let settings = AppSettings::default();
        let nf = Arc::new(Self::netfilter_for(&settings));
        Arc::new(Self {
            settings: RwLock::new(settings),
            records: Arc::new(Records::new()),
            nf: RwLock::new(nf),
            groups: RwLock::new(Vec::new()),
            running: AtomicBool::new(false),
            dns_overrider: Mutex::new(None),
            log_handle: RwLock::new(None),
        })
    }

    fn netfilter_for(settings: &AppSettings) -> NetfilterHelper {
        NetfilterHelper::new(
            settings.netfilter.chain_prefix.clone(),
            settings.netfilter.ipset_prefix.clone(),
            settings.netfilter.disable_ipv4,
            settings.netfilter.disable_ipv6,
        )
    }

    /// Current settings snapshot
    #[must_use]
    pub fn settings(&self) -> AppSettings {
        self.settings.read().clone()
    }

    #[must_use]
    pub fn records(&self) -> Arc<Records> {
        Arc::clone(&self.records)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn netfilter(&self) -> Arc<NetfilterHelper> {
        Arc::clone(&self.nf.read())
    }

    /// Install the logging reload handle so config imports can re-apply the
    /// level
    pub fn set_log_handle(&self, handle: LevelHandle) {
        *self.log_handle.write() = Some(handle);
    }

    fn apply_log_level(&self) {
        let level = self.settings.read().log_level.clone();
        if let Some(handle) = self.log_handle.read().as_ref() {
            handle.set(&level);
        }
    }

    /// Group list snapshot
    #[must_use]
    pub fn groups(&self) -> Vec<Arc<Group>> {
        self.groups.read().clone()
    }

    /// Look a group up by its ID
    #[must_use]
    pub fn find_group(&self, id: Id) -> Option<Arc<Group>> {
        self.groups.read().iter().find(|g| g.id() == id).cloned()
    }

    /// Register a new group
    ///
    /// Rejects duplicate group IDs and duplicate rule IDs within the group.
    /// While the daemon runs, the group is enabled and synced immediately.
    pub async fn add_group(&self, mut model: GroupModel) -> Result<Arc<Group>, AppError> {
        model.normalize_color();

        if self.find_group(model.id).is_some() {
            return Err(AppError::GroupIdConflict);
        }
        let mut seen = HashSet::new();
        for rule in &model.rules {
            if !seen.insert(rule.id) {
                return Err(AppError::RuleIdConflict);
            }
        }

        let group = Arc::new(Group::new(
            model,
            Arc::clone(&self.records),
            self.netfilter(),
        ));
        self.groups.write().push(Arc::clone(&group));
        debug!(id = %group.id(), "added group");

        if self.is_running() {
            group.enable().await?;
            group.sync().await?;
        }
        Ok(group)
    }

    /// Drop a group from the engine; the caller disables it first
    pub fn remove_group(&self, id: Id) -> Option<Arc<Group>> {
        let mut groups = self.groups.write();
        let idx = groups.iter().position(|g| g.id() == id)?;
        Some(groups.remove(idx))
    }

    /// Disable every group and clear the list
    pub async fn clear_groups(&self) {
        let drained: Vec<Arc<Group>> = std::mem::take(&mut *self.groups.write());
        for group in drained {
            if let Err(e) = group.disable().await {
                error!(id = %group.id(), error = %e, "failed to disable group");
            }
        }
    }

    /// Interfaces eligible as egress targets
    ///
    /// Point-to-point links only, unless `showAllInterfaces` is set.
    pub async fn list_interfaces(&self) -> Result<Vec<LinkInfo>, AppError> {
        let show_all = self.settings.read().show_all_interfaces;
        let links = netfilter::list_links().await?;
        Ok(links
            .into_iter()
            .filter(|l| show_all || l.is_point_to_point())
            .collect())
    }

    /// Re-assert firewall state after a `netfilter.d` notification
    ///
    /// Individual failures are logged, never fatal: the rest of the state
    /// still gets re-asserted.
    pub async fn netfilterd_hook(&self, kind: &str, table: &str) {
        debug!(kind, table, "netfilter.d event");
        {
            let mut overrider = self.dns_overrider.lock().await;
            if let Some(remap) = overrider.as_mut() {
                if let Err(e) = remap.netfilterd_hook(kind, table).await {
                    error!(error = %e, "failed to re-assert dns remap rules");
                }
            }
        }
        for group in self.groups() {
            if let Err(e) = group.netfilterd_hook(kind, table).await {
                error!(id = %group.id(), error = %e, "failed to re-assert group rules");
            }
        }
    }
}
