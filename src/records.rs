//! Record store: short-TTL cache of observed DNS answers
//!
//! Stores A records and CNAME aliases keyed by domain name. A name maps to
//! at most one record kind at a time; the last writer wins. Lookups follow
//! CNAME chains with a visited set, so cyclic chains terminate. Expired
//! entries are purged lazily on every read.
//!
//! All operations are short and total, serialised by a single mutex.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Observed A (or AAAA) record with an absolute expiry deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ARecord {
    pub address: IpAddr,
    pub deadline: Instant,
}

impl ARecord {
    /// Remaining lifetime in whole seconds, clamped to zero once expired
    #[must_use]
    pub fn remaining_ttl(&self, now: Instant) -> u32 {
        u32::try_from(self.deadline.saturating_duration_since(now).as_secs()).unwrap_or(u32::MAX)
    }
}

/// CNAME alias with an absolute expiry deadline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CNameRecord {
    pub alias: String,
    pub deadline: Instant,
}

/// A domain name owns either a list of A records or a single CNAME
#[derive(Debug, Clone)]
enum RecordEntry {
    A(Vec<ARecord>),
    CName(CNameRecord),
}

/// TTL-aware in-memory map of domain → records, with reverse alias lookup
#[derive(Debug, Default)]
pub struct Records {
    inner: Mutex<HashMap<String, RecordEntry>>,
}

impl Records {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh an A record
    ///
    /// Multiple addresses may coexist under one name; re-observing an
    /// address replaces its deadline. The caller strips the trailing dot.
    pub fn add_a_record(&self, domain: &str, address: IpAddr, ttl: u32) {
        let deadline = Instant::now() + Duration::from_secs(u64::from(ttl));
        let mut map = self.inner.lock();

        let entry = map
            .entry(domain.to_string())
            .or_insert_with(|| RecordEntry::A(Vec::new()));
        if !matches!(entry, RecordEntry::A(_)) {
            // Name held a CNAME: the A observation replaces it
            *entry = RecordEntry::A(Vec::new());
        }
        let RecordEntry::A(records) = entry else {
            unreachable!()
        };

        if let Some(existing) = records.iter_mut().find(|r| r.address == address) {
            existing.deadline = deadline;
        } else {
            records.push(ARecord { address, deadline });
        }
    }

    /// Replace whatever exists under `domain` with a CNAME to `alias`
    ///
    /// Self-referencing aliases are dropped.
    pub fn add_cname_record(&self, domain: &str, alias: &str, ttl: u32) {
        if domain == alias {
            return;
        }
        let deadline = Instant::now() + Duration::from_secs(u64::from(ttl));
        self.inner.lock().insert(
            domain.to_string(),
            RecordEntry::CName(CNameRecord {
                alias: alias.to_string(),
                deadline,
            }),
        );
    }

    /// Follow the CNAME chain from `domain` and return the A records at its
    /// end, or an empty list
    ///
    /// Cyclic chains are cut by a visited set.
    pub fn get_a_records(&self, domain: &str) -> Vec<ARecord> {
        let mut map = self.inner.lock();
        Self::cleanup(&mut map);

        let mut visited = HashSet::new();
        visited.insert(domain.to_string());
        let mut current = domain.to_string();
        loop {
            match map.get(&current) {
                Some(RecordEntry::CName(cname)) => {
                    if !visited.insert(cname.alias.clone()) {
                        return Vec::new();
                    }
                    current = cname.alias.clone();
                }
                Some(RecordEntry::A(records)) => return records.clone(),
                None => return Vec::new(),
            }
        }
    }

    /// Every domain that CNAMEs (transitively) to `domain`, plus `domain`
    /// itself
    pub fn get_aliases(&self, domain: &str) -> Vec<String> {
        let mut map = self.inner.lock();
        Self::cleanup(&mut map);

        let mut names: HashSet<String> = HashSet::new();
        names.insert(domain.to_string());

        // Fixed point over the reverse alias relation
        loop {
            let mut added = false;
            for (name, entry) in map.iter() {
                if names.contains(name) {
                    continue;
                }
                if let RecordEntry::CName(cname) = entry {
                    if names.contains(&cname.alias) {
                        names.insert(name.clone());
                        added = true;
                    }
                }
            }
            if !added {
                break;
            }
        }

        names.into_iter().collect()
    }

    /// Snapshot of all live domain names
    pub fn list_known_domains(&self) -> Vec<String> {
        let mut map = self.inner.lock();
        Self::cleanup(&mut map);
        map.keys().cloned().collect()
    }

    /// Purge expired entries: A records individually, CNAME slots whole
    fn cleanup(map: &mut HashMap<String, RecordEntry>) {
        let now = Instant::now();
        map.retain(|_, entry| match entry {
            RecordEntry::A(records) => {
                records.retain(|r| r.deadline > now);
                !records.is_empty()
            }
            RecordEntry::CName(cname) => cname.deadline > now,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_a_record_lookup() {
        let r = Records::new();
        r.add_a_record("example.com", ip("1.2.3.4"), 60);
        let records = r.get_a_records("example.com");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].address, ip("1.2.3.4"));
    }

    #[test]
    fn test_cname_chain_resolves() {
        let r = Records::new();
        r.add_a_record("example.com", ip("1.2.3.4"), 60);
        r.add_cname_record("gateway.example.com", "example.com", 60);
        let records = r.get_a_records("gateway.example.com");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].address, ip("1.2.3.4"));
    }

    #[test]
    fn test_cname_loop_terminates() {
        let r = Records::new();
        r.add_cname_record("1", "2", 60);
        r.add_cname_record("2", "1", 60);
        assert!(r.get_a_records("1").is_empty());
        assert!(r.get_a_records("2").is_empty());
    }

    #[test]
    fn test_self_cname_ignored() {
        let r = Records::new();
        r.add_a_record("example.com", ip("1.2.3.4"), 60);
        r.add_cname_record("example.com", "example.com", 60);
        // The self-alias must not replace the A records
        assert_eq!(r.get_a_records("example.com").len(), 1);
    }

    #[test]
    fn test_expired_records_invisible() {
        let r = Records::new();
        r.add_a_record("example.com", ip("1.2.3.4"), 0);
        assert!(r.get_a_records("example.com").is_empty());
        assert!(r.list_known_domains().is_empty());
    }

    #[test]
    fn test_expired_then_fresh_insert() {
        let r = Records::new();
        r.add_a_record("example.com", ip("1.2.3.4"), 0);
        assert!(r.get_a_records("example.com").is_empty());
        r.add_a_record("example.com", ip("5.6.7.8"), 60);
        let records = r.get_a_records("example.com");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].address, ip("5.6.7.8"));
    }

    #[test]
    fn test_unknown_domain() {
        let r = Records::new();
        assert!(r.get_a_records("example.com").is_empty());
    }

    #[test]
    fn test_dangling_cname() {
        let r = Records::new();
        r.add_cname_record("gateway.example.com", "example.com", 60);
        assert!(r.get_a_records("gateway.example.com").is_empty());
    }

    #[test]
    fn test_cname_replaces_a_and_back() {
        let r = Records::new();
        r.add_cname_record("gateway.example.com", "example.com", 60);
        r.add_a_record("gateway.example.com", ip("1.2.3.4"), 60);
        let records = r.get_a_records("gateway.example.com");
        assert_eq!(records[0].address, ip("1.2.3.4"));
    }

    #[test]
    fn test_ttl_refresh_extends_deadline() {
        let r = Records::new();
        r.add_a_record("example.com", ip("1.2.3.4"), 5);
        let before = r.get_a_records("example.com")[0].deadline;
        r.add_a_record("example.com", ip("1.2.3.4"), 600);
        let after = r.get_a_records("example.com")[0].deadline;
        assert!(after > before);
        // Still a single entry for the same address
        assert_eq!(r.get_a_records("example.com").len(), 1);
    }

    #[test]
    fn test_multiple_addresses_coexist() {
        let r = Records::new();
        r.add_a_record("example.com", ip("1.2.3.4"), 60);
        r.add_a_record("example.com", ip("5.6.7.8"), 60);
        assert_eq!(r.get_a_records("example.com").len(), 2);
    }

    #[test]
    fn test_alias_closure() {
        let r = Records::new();
        r.add_a_record("1", ip("1.2.3.4"), 60);
        r.add_cname_record("2", "1", 60);
        r.add_cname_record("3", "2", 60);
        r.add_cname_record("4", "2", 60);
        r.add_cname_record("5", "1", 60);
        let mut aliases = r.get_aliases("1");
        aliases.sort();
        assert_eq!(aliases, vec!["1", "2", "3", "4", "5"]);
    }

    #[test]
    fn test_alias_closure_unrelated_names_excluded() {
        let r = Records::new();
        r.add_cname_record("2", "1", 60);
        r.add_cname_record("other", "elsewhere", 60);
        let mut aliases = r.get_aliases("1");
        aliases.sort();
        assert_eq!(aliases, vec!["1", "2"]);
    }

    #[test]
    fn test_remaining_ttl_clamps_to_zero() {
        let now = Instant::now();
        let expired = ARecord {
            address: ip("1.2.3.4"),
            deadline: now - Duration::from_secs(10),
        };
        assert_eq!(expired.remaining_ttl(now), 0);
        let live = ARecord {
            address: ip("1.2.3.4"),
            deadline: now + Duration::from_secs(90),
        };
        let ttl = live.remaining_ttl(now);
        assert!((89..=90).contains(&ttl));
    }
}
