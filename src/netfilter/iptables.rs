//! Thin iptables/ip6tables wrapper
//!
//! Exposes the insert-if-absent / delete-if-exists primitives the rest of
//! the engine is built on. Uniqueness checks use `-C` probes, so reasserting
//! rules after an external firewall rewrite never duplicates them.

use crate::error::NetfilterError;
use crate::netfilter::exec::{command_error, run, run_checked};

/// Address family of an iptables instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// Binary implementing this family
    #[must_use]
    pub fn bin(self) -> &'static str {
        match self {
            Self::V4 => "iptables",
            Self::V6 => "ip6tables",
        }
    }

    /// Suffix of the kernel IP set serving this family
    #[must_use]
    pub fn set_suffix(self) -> &'static str {
        match self {
            Self::V4 => "_4",
            Self::V6 => "_6",
        }
    }
}

/// One iptables instance (one address family)
#[derive(Debug, Clone, Copy)]
pub struct IpTables {
    family: Family,
}

impl IpTables {
    #[must_use]
    pub fn new(family: Family) -> Self {
        Self { family }
    }

    #[must_use]
    pub fn family(&self) -> Family {
        self.family
    }

    fn bin(&self) -> &'static str {
        self.family.bin()
    }

    /// Probe whether a rule exists (`-C`)
    pub async fn exists(
        &self,
        table: &str,
        chain: &str,
        spec: &[&str],
    ) -> Result<bool, NetfilterError> {
        let mut args = vec!["-t", table, "-C", chain];
        args.extend_from_slice(spec);
        Ok(run(self.bin(), &args).await?.success)
    }

    /// Append a rule unless an identical one is already present
    pub async fn append_unique(
        &self,
        table: &str,
        chain: &str,
        spec: &[&str],
    ) -> Result<(), NetfilterError> {
        if self.exists(table, chain, spec).await? {
            return Ok(());
        }
        let mut args = vec!["-t", table, "-A", chain];
        args.extend_from_slice(spec);
        run_checked(self.bin(), &args).await.map(|_| ())
    }

    /// Insert a rule at `position` unless an identical one is already present
    pub async fn insert_unique(
        &self,
        table: &str,
        chain: &str,
        position: u32,
        spec: &[&str],
    ) -> Result<(), NetfilterError> {
        if self.exists(table, chain, spec).await? {
            return Ok(());
        }
        let pos = position.to_string();
        let mut args = vec!["-t", table, "-I", chain, pos.as_str()];
        args.extend_from_slice(spec);
        run_checked(self.bin(), &args).await.map(|_| ())
    }

    /// Delete a rule if it is present
    pub async fn delete_if_exists(
        &self,
        table: &str,
        chain: &str,
        spec: &[&str],
    ) -> Result<(), NetfilterError> {
        if !self.exists(table, chain, spec).await? {
            return Ok(());
        }
        let mut args = vec!["-t", table, "-D", chain];
        args.extend_from_slice(spec);
        run_checked(self.bin(), &args).await.map(|_| ())
    }

    /// Create a chain; succeeds if it already exists
    pub async fn new_chain(&self, table: &str, chain: &str) -> Result<(), NetfilterError> {
        let args = ["-t", table, "-N", chain];
        let out = run(self.bin(), &args).await?;
        if out.success || out.stderr.contains("already exists") {
            Ok(())
        } else {
            Err(command_error(self.bin(), &args, &out))
        }
    }

    /// Create-or-flush a chain, leaving it empty
    pub async fn clear_chain(&self, table: &str, chain: &str) -> Result<(), NetfilterError> {
        self.new_chain(table, chain).await?;
        run_checked(self.bin(), &["-t", table, "-F", chain])
            .await
            .map(|_| ())
    }

    /// Flush and delete a chain; succeeds if it does not exist
    pub async fn clear_and_delete_chain(
        &self,
        table: &str,
        chain: &str,
    ) -> Result<(), NetfilterError> {
        let flush = ["-t", table, "-F", chain];
        let out = run(self.bin(), &flush).await?;
        if !out.success {
            if chain_missing(&out.stderr) {
                return Ok(());
            }
            return Err(command_error(self.bin(), &flush, &out));
        }
        run_checked(self.bin(), &["-t", table, "-X", chain])
            .await
            .map(|_| ())
    }

    /// List chain names in a table
    ///
    /// Parses `-S` output: built-in chains appear as `-P <name> <policy>`,
    /// user chains as `-N <name>`.
    pub async fn list_chains(&self, table: &str) -> Result<Vec<String>, NetfilterError> {
        let stdout = run_checked(self.bin(), &["-t", table, "-S"]).await?;
        Ok(stdout
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                match parts.next() {
                    Some("-P" | "-N") => parts.next().map(ToString::to_string),
                    _ => None,
                }
            })
            .collect())
    }

    /// List rules of one chain as `-S` lines (`-A <chain> ...`)
    pub async fn list_rules(
        &self,
        table: &str,
        chain: &str,
    ) -> Result<Vec<String>, NetfilterError> {
        let stdout = run_checked(self.bin(), &["-t", table, "-S", chain]).await?;
        Ok(stdout
            .lines()
            .filter(|l| l.starts_with("-A "))
            .map(ToString::to_string)
            .collect())
    }

    /// Delete a rule given its `-S` listing line
    pub async fn delete_rule_line(
        &self,
        table: &str,
        chain: &str,
        line: &str,
    ) -> Result<(), NetfilterError> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 2 || parts[0] != "-A" || parts[1] != chain {
            return Ok(());
        }
        let mut args = vec!["-t", table, "-D", chain];
        args.extend_from_slice(&parts[2..]);
        run_checked(self.bin(), &args).await.map(|_| ())
    }
}

/// Recognize the "chain does not exist" diagnostics of both families
fn chain_missing(stderr: &str) -> bool {
    stderr.contains("No chain/target/match by that name")
        || stderr.contains("does not exist")
}
