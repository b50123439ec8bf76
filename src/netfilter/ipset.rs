//! Kernel IP set management
//!
//! Every group owns a pair of `hash:net` sets, one per address family,
//! named `<prefix><group-id>_4` and `<prefix><group-id>_6`. Entries carry
//! per-entry timeouts; the set default of 300 s applies when an insertion
//! does not override it.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;

use crate::error::NetfilterError;
use crate::netfilter::exec::{command_error, run, run_checked};

/// Default per-entry timeout applied at set creation
const DEFAULT_ENTRY_TIMEOUT: u32 = 300;

/// A pair of kernel IP sets (IPv4 + IPv6) under one logical name
#[derive(Debug)]
pub struct IpSet {
    name: String,
    enabled: AtomicBool,
    locker: Mutex<()>,
}

impl IpSet {
    /// `name` is the fully prefixed set name without the family suffix
    #[must_use]
    pub fn new(name: String) -> Self {
        Self {
            name,
            enabled: AtomicBool::new(false),
            locker: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn set_name(&self, addr: IpAddr) -> String {
        match addr {
            IpAddr::V4(_) => format!("{}_4", self.name),
            IpAddr::V6(_) => format!("{}_6", self.name),
        }
    }

    /// Create both kernel sets, destroying leftovers first
    ///
    /// Idempotent: a second enable is a no-op.
    pub async fn enable(&self) -> Result<(), NetfilterError> {
        let _guard = self.locker.lock().await;
        if !compare_and_set(&self.enabled, false, true) {
            return Ok(());
        }
        if let Err(e) = self.create_sets().await {
            self.destroy_sets().await.ok();
            self.enabled.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    /// Destroy both kernel sets and clear the enabled flag
    pub async fn disable(&self) -> Result<(), NetfilterError> {
        let _guard = self.locker.lock().await;
        if !self.enabled.load(Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.destroy_sets().await;
        self.enabled.store(false, Ordering::SeqCst);
        result
    }

    /// Insert or refresh an address, optionally overriding the entry timeout
    ///
    /// No-op while disabled.
    pub async fn add_ip(&self, addr: IpAddr, timeout: Option<u32>) -> Result<(), NetfilterError> {
        let _guard = self.locker.lock().await;
        if !self.enabled.load(Ordering::SeqCst) {
            return Ok(());
        }
        let set = self.set_name(addr);
        let ip = addr.to_string();
        let mut args = vec!["-exist", "add", set.as_str(), ip.as_str()];
        let timeout_str;
        if let Some(t) = timeout {
            timeout_str = t.to_string();
            args.push("timeout");
            args.push(timeout_str.as_str());
        }
        run_checked("ipset", &args).await.map(|_| ())
    }

    /// Remove an address; absent entries are not an error
    pub async fn del_ip(&self, addr: IpAddr) -> Result<(), NetfilterError> {
        let _guard = self.locker.lock().await;
        if !self.enabled.load(Ordering::SeqCst) {
            return Ok(());
        }
        let set = self.set_name(addr);
        let ip = addr.to_string();
        let args = ["-exist", "del", set.as_str(), ip.as_str()];
        run_checked("ipset", &args).await.map(|_| ())
    }

    /// Current entries of both family sets, with their remaining timeouts
    pub async fn list_ips(&self) -> Result<HashMap<IpAddr, Option<u32>>, NetfilterError> {
        let _guard = self.locker.lock().await;
        if !self.enabled.load(Ordering::SeqCst) {
            return Ok(HashMap::new());
        }
        let mut entries = HashMap::new();
        for suffix in ["_4", "_6"] {
            let set = format!("{}{suffix}", self.name);
            let stdout = run_checked("ipset", &["save", set.as_str()]).await?;
            parse_save_output(&stdout, &mut entries);
        }
        Ok(entries)
    }

    async fn create_sets(&self) -> Result<(), NetfilterError> {
        // A crashed predecessor may have left sets behind
        self.destroy_sets().await?;

        let timeout = DEFAULT_ENTRY_TIMEOUT.to_string();
        for (suffix, family) in [("_4", "inet"), ("_6", "inet6")] {
            let set = format!("{}{suffix}", self.name);
            run_checked(
                "ipset",
                &[
                    "create",
                    set.as_str(),
                    "hash:net",
                    "family",
                    family,
                    "timeout",
                    timeout.as_str(),
                ],
            )
            .await?;
        }
        Ok(())
    }

    async fn destroy_sets(&self) -> Result<(), NetfilterError> {
        let mut errs = Vec::new();
        for suffix in ["_4", "_6"] {
            let set = format!("{}{suffix}", self.name);
            let args = ["destroy", set.as_str()];
            match run("ipset", &args).await {
                Ok(out) if out.success || out.stderr.contains("does not exist") => {}
                Ok(out) => errs.push(command_error("ipset", &args, &out)),
                Err(e) => errs.push(e),
            }
        }
        NetfilterError::join(errs)
    }
}

fn compare_and_set(flag: &AtomicBool, current: bool, new: bool) -> bool {
    flag.compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
}

/// Parse `ipset save` output lines: `add <set> <addr>[/<cidr>] timeout <n>`
fn parse_save_output(stdout: &str, entries: &mut HashMap<IpAddr, Option<u32>>) {
    for line in stdout.lines() {
        let mut parts = line.split_whitespace();
        if parts.next() != Some("add") {
            continue;
        }
        let _set = parts.next();
        let Some(addr_field) = parts.next() else {
            continue;
        };
        let addr_str = addr_field.split('/').next().unwrap_or(addr_field);
        let Ok(addr) = addr_str.parse::<IpAddr>() else {
            continue;
        };
        let mut timeout = None;
        while let Some(token) = parts.next() {
            if token == "timeout" {
                timeout = parts.next().and_then(|t| t.parse().ok());
            }
        }
        entries.insert(addr, timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_save_output() {
        let output = "\
create mt_01020304_4 hash:net family inet hashsize 1024 maxelem 65536 timeout 300
add mt_01020304_4 1.2.3.4 timeout 287
add mt_01020304_4 10.0.0.0/8 timeout 42
add mt_01020304_4 5.6.7.8
";
        let mut entries = HashMap::new();
        parse_save_output(output, &mut entries);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[&"1.2.3.4".parse::<IpAddr>().unwrap()], Some(287));
        assert_eq!(entries[&"10.0.0.0".parse::<IpAddr>().unwrap()], Some(42));
        assert_eq!(entries[&"5.6.7.8".parse::<IpAddr>().unwrap()], None);
    }

    #[test]
    fn test_parse_save_output_v6() {
        let output = "add mt_01020304_6 2001:db8::1 timeout 10\n";
        let mut entries = HashMap::new();
        parse_save_output(output, &mut entries);
        assert_eq!(entries[&"2001:db8::1".parse::<IpAddr>().unwrap()], Some(10));
    }

    #[test]
    fn test_parse_save_output_ignores_garbage() {
        let mut entries = HashMap::new();
        parse_save_output("add set notanip timeout 5\nnonsense line\n", &mut entries);
        assert!(entries.is_empty());
    }

    #[test]
    fn test_set_name_dispatch() {
        let set = IpSet::new("mt_aabbccdd".into());
        assert_eq!(set.set_name("1.2.3.4".parse().unwrap()), "mt_aabbccdd_4");
        assert_eq!(set.set_name("::1".parse().unwrap()), "mt_aabbccdd_6");
    }
}
