//! Domain-to-address routing pipeline, end to end through the pure core:
//! record store observation → rule matching → desired-set computation →
//! reconciliation plan.

use std::collections::HashMap;
use std::net::IpAddr;

use trickle_router::group::{desired_addresses, sync_plan};
use trickle_router::models::{Rule, RuleKind};
use trickle_router::records::Records;
use trickle_router::Id;

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn rule(kind: RuleKind, pattern: &str) -> Rule {
    Rule {
        id: Id::random(),
        name: pattern.to_string(),
        kind,
        rule: pattern.to_string(),
        enable: true,
    }
}

#[test]
fn a_record_lands_in_matching_group_set() {
    // Client resolves foo.example.com; upstream returned 1.2.3.4.
    let records = Records::new();
    records.add_a_record("foo.example.com", ip("1.2.3.4"), 60);

    let rules = vec![rule(RuleKind::Namespace, "example.com")];
    let desired = desired_addresses(&rules, &records);

    assert_eq!(desired.len(), 1);
    let ttl = desired[&ip("1.2.3.4")];
    assert!((55..=60).contains(&ttl), "timeout should track the ttl, got {ttl}");

    // Fresh set: everything is an insertion.
    let (to_add, to_del) = sync_plan(&desired, &HashMap::new());
    assert_eq!(to_add, vec![(ip("1.2.3.4"), ttl)]);
    assert!(to_del.is_empty());
}

#[test]
fn cname_fanout_reaches_rule_via_alias() {
    // Record store already knows bar.example.net; the client then resolves
    // mirror.example.com which turns out to be a CNAME for it. The group's
    // rule matches the alias, so the target's address must be routed.
    let records = Records::new();
    records.add_a_record("bar.example.net", ip("9.9.9.9"), 300);
    records.add_cname_record("mirror.example.com", "bar.example.net", 60);

    let rules = vec![rule(RuleKind::Namespace, "example.com")];
    let desired = desired_addresses(&rules, &records);
    assert!(desired.contains_key(&ip("9.9.9.9")));

    // And the alias closure seen from the chain target includes the mirror.
    let aliases = records.get_aliases("bar.example.net");
    assert!(aliases.contains(&"mirror.example.com".to_string()));
    assert!(aliases.contains(&"bar.example.net".to_string()));
}

#[test]
fn disabled_rule_addresses_are_reaped() {
    let records = Records::new();
    records.add_a_record("site.com", ip("1.1.1.1"), 120);
    records.add_a_record("shared.com", ip("3.3.3.3"), 120);
    records.add_a_record("other.com", ip("2.2.2.2"), 120);
    // 3.3.3.3 is reachable through both rules
    records.add_cname_record("mirror.site.com", "shared.com", 120);
    records.add_cname_record("mirror.other.com", "shared.com", 120);

    let both = vec![
        rule(RuleKind::Namespace, "site.com"),
        rule(RuleKind::Namespace, "other.com"),
    ];
    let current: HashMap<IpAddr, Option<u32>> = desired_addresses(&both, &records)
        .into_iter()
        .map(|(a, t)| (a, Some(t)))
        .collect();
    assert_eq!(current.len(), 3);

    // Disable the first rule and re-plan.
    let mut after = both;
    after[0].enable = false;
    let desired = desired_addresses(&after, &records);
    let (_, to_del) = sync_plan(&desired, &current);

    // Only the address solely attributable to site.com goes away.
    assert_eq!(to_del, vec![ip("1.1.1.1")]);
    assert!(desired.contains_key(&ip("3.3.3.3")));
    assert!(desired.contains_key(&ip("2.2.2.2")));
}

#[test]
fn wildcard_and_regex_rules_participate() {
    let records = Records::new();
    records.add_a_record("cdn1.example.com", ip("5.5.5.5"), 60);
    records.add_a_record("static.example.org", ip("6.6.6.6"), 60);
    records.add_a_record("unrelated.net", ip("7.7.7.7"), 60);

    let rules = vec![
        rule(RuleKind::Wildcard, "cdn?.example.com"),
        rule(RuleKind::Regex, r"\.example\.org$"),
    ];
    let desired = desired_addresses(&rules, &records);
    assert_eq!(desired.len(), 2);
    assert!(desired.contains_key(&ip("5.5.5.5")));
    assert!(desired.contains_key(&ip("6.6.6.6")));
}

#[test]
fn expired_records_never_reach_the_plan() {
    let records = Records::new();
    records.add_a_record("gone.example.com", ip("8.8.8.8"), 0);

    let rules = vec![rule(RuleKind::Namespace, "example.com")];
    let desired = desired_addresses(&rules, &records);
    assert!(desired.is_empty());
}
