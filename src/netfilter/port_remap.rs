//! DNS port remap: redirect uplink port 53 to the local proxy
//!
//! A dedicated nat chain holds one TCP and one UDP rule per local uplink
//! address (IPv4 uses `REDIRECT`, IPv6 `DNAT --to-destination :port`), and
//! is jumped to from `nat/PREROUTING` at position 1.

use std::net::IpAddr;

use crate::error::NetfilterError;
use crate::netfilter::iptables::{Family, IpTables};

/// Port remap installer for one (from, to) port pair
#[derive(Debug)]
pub struct PortRemap {
    chain_name: String,
    addresses: Vec<IpAddr>,
    from: u16,
    to: u16,
    ipt4: Option<IpTables>,
    ipt6: Option<IpTables>,
    enabled: bool,
}

impl PortRemap {
    /// `chain_name` arrives fully prefixed; `_PRR` is appended here
    #[must_use]
    pub fn new(
        chain_name: String,
        from: u16,
        to: u16,
        addresses: Vec<IpAddr>,
        ipt4: Option<IpTables>,
        ipt6: Option<IpTables>,
    ) -> Self {
        Self {
            chain_name: format!("{chain_name}_PRR"),
            addresses,
            from,
            to,
            ipt4,
            ipt6,
            enabled: false,
        }
    }

    fn instances(&self) -> impl Iterator<Item = IpTables> + '_ {
        self.ipt4.iter().chain(self.ipt6.iter()).copied()
    }

    /// Install the remap chain and its PREROUTING jump
    pub async fn enable(&mut self) -> Result<(), NetfilterError> {
        if self.enabled {
            return Ok(());
        }
        for ipt in self.instances() {
            ipt.clear_chain("nat", &self.chain_name).await?;
        }
        let mut result = Ok(());
        for ipt in self.instances() {
            if let Err(e) = self.insert_rules(ipt, "").await {
                result = Err(e);
                break;
            }
        }
        if let Err(e) = result {
            self.teardown().await.ok();
            return Err(e);
        }
        self.enabled = true;
        Ok(())
    }

    /// Remove the remap chain, joining all errors
    pub async fn disable(&mut self) -> Result<(), NetfilterError> {
        let result = self.teardown().await;
        self.enabled = false;
        result
    }

    async fn teardown(&self) -> Result<(), NetfilterError> {
        let mut errs = Vec::new();
        for ipt in self.instances() {
            if let Err(e) = ipt
                .delete_if_exists("nat", "PREROUTING", &["-j", self.chain_name.as_str()])
                .await
            {
                errs.push(e);
            }
            if let Err(e) = ipt.clear_and_delete_chain("nat", &self.chain_name).await {
                errs.push(e);
            }
        }
        NetfilterError::join(errs)
    }

    /// Rules redirecting one address's port 53 to the proxy port
    fn remap_specs(&self, addr: IpAddr) -> Vec<Vec<String>> {
        let from = self.from.to_string();
        let to = self.to.to_string();
        let dest = addr.to_string();
        ["tcp", "udp"]
            .into_iter()
            .map(|proto| {
                let mut spec = vec![
                    "-p".to_string(),
                    proto.to_string(),
                    "-d".to_string(),
                    dest.clone(),
                    "--dport".to_string(),
                    from.clone(),
                ];
                match addr {
                    IpAddr::V4(_) => {
                        spec.extend(["-j".into(), "REDIRECT".into(), "--to-port".into(), to.clone()]);
                    }
                    IpAddr::V6(_) => {
                        spec.extend([
                            "-j".into(),
                            "DNAT".into(),
                            "--to-destination".into(),
                            format!(":{to}"),
                        ]);
                    }
                }
                spec
            })
            .collect()
    }

    async fn insert_rules(&self, ipt: IpTables, table: &str) -> Result<(), NetfilterError> {
        if !table.is_empty() && table != "nat" {
            return Ok(());
        }

        ipt.new_chain("nat", &self.chain_name).await?;

        for addr in &self.addresses {
            let family_matches = matches!(
                (ipt.family(), addr),
                (Family::V4, IpAddr::V4(_)) | (Family::V6, IpAddr::V6(_))
            );
            if !family_matches {
                continue;
            }
            for spec in self.remap_specs(*addr) {
                let spec_refs: Vec<&str> = spec.iter().map(String::as_str).collect();
                ipt.append_unique("nat", &self.chain_name, &spec_refs).await?;
            }
        }

        ipt.insert_unique("nat", "PREROUTING", 1, &["-j", self.chain_name.as_str()])
            .await?;
        Ok(())
    }

    /// Re-assert the remap rules after an external firewall rewrite
    pub async fn netfilterd_hook(&self, kind: &str, table: &str) -> Result<(), NetfilterError> {
        if !self.enabled {
            return Ok(());
        }
        if matches!(kind, "" | "iptables" | "ip4tables") {
            if let Some(ipt) = self.ipt4 {
                self.insert_rules(ipt, table).await?;
            }
        }
        if matches!(kind, "" | "ip6tables") {
            if let Some(ipt) = self.ipt6 {
                self.insert_rules(ipt, table).await?;
            }
        }
        Ok(())
    }
}
