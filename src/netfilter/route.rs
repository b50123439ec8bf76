//! Policy rules, routes and link queries via `ip -json`
//!
//! Policy routing state is globally shared with the rest of the system, so
//! fwmark/table allocation re-scans the live rule and route sets on every
//! group enable instead of trusting local bookkeeping.

use std::collections::HashSet;
use std::net::IpAddr;

use serde_json::Value;

use crate::error::NetfilterError;
use crate::netfilter::exec::{command_error, run, run_checked};
use crate::netfilter::iptables::Family;

/// Routing tables that must never be allocated to a group
const RESERVED_TABLES: [u32; 4] = [0, 253, 254, 255];

/// One policy rule, reduced to the fields allocation cares about
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyRule {
    pub fwmark: Option<u32>,
    pub table: Option<u32>,
}

fn family_flag(family: Family) -> &'static str {
    match family {
        Family::V4 => "-4",
        Family::V6 => "-6",
    }
}

/// List policy rules of both families
pub async fn list_policy_rules() -> Result<Vec<PolicyRule>, NetfilterError> {
    let mut rules = Vec::new();
    for family in [Family::V4, Family::V6] {
        let stdout = run_checked("ip", &[family_flag(family), "-json", "rule", "show"]).await?;
        rules.extend(parse_policy_rules(&stdout)?);
    }
    Ok(rules)
}

/// Collect every routing-table id that currently holds at least one route
pub async fn list_route_tables() -> Result<HashSet<u32>, NetfilterError> {
    let mut tables = HashSet::new();
    for family in [Family::V4, Family::V6] {
        let stdout = run_checked(
            "ip",
            &[family_flag(family), "-json", "route", "show", "table", "all"],
        )
        .await?;
        parse_route_tables(&stdout, &mut tables)?;
    }
    Ok(tables)
}

/// Pick the lowest free fwmark and routing-table id
///
/// Mark 0 is the unmarked state and never allocated; reserved tables
/// (0, 253, 254, 255) are excluded alongside every table seen in a rule or
/// route.
pub fn pick_unused_mark_and_table(
    rules: &[PolicyRule],
    route_tables: &HashSet<u32>,
) -> Result<(u32, u32), NetfilterError> {
    let mut used_marks: HashSet<u32> = HashSet::from([0]);
    let mut used_tables: HashSet<u32> = RESERVED_TABLES.into_iter().collect();

    for rule in rules {
        if let Some(mark) = rule.fwmark {
            used_marks.insert(mark);
        }
        if let Some(table) = rule.table {
            used_tables.insert(table);
        }
    }
    used_tables.extend(route_tables);

    let mark = (0..u32::MAX)
        .find(|m| !used_marks.contains(m))
        .ok_or(NetfilterError::Exhausted("fwmark"))?;
    let table = (0..u32::MAX)
        .find(|t| !used_tables.contains(t))
        .ok_or(NetfilterError::Exhausted("table"))?;
    Ok((mark, table))
}

/// Install a policy rule `fwmark <mark> lookup <table>`
///
/// A stale identical rule is removed first so repeated enables do not stack
/// duplicates.
pub async fn add_policy_rule(
    family: Family,
    mark: u32,
    table: u32,
) -> Result<(), NetfilterError> {
    del_policy_rule(family, mark, table).await.ok();
    let mark_str = mark.to_string();
    let table_str = table.to_string();
    run_checked(
        "ip",
        &[
            family_flag(family),
            "rule",
            "add",
            "fwmark",
            mark_str.as_str(),
            "lookup",
            table_str.as_str(),
        ],
    )
    .await
    .map(|_| ())
}

/// Remove a policy rule; absence is not an error
pub async fn del_policy_rule(
    family: Family,
    mark: u32,
    table: u32,
) -> Result<(), NetfilterError> {
    let mark_str = mark.to_string();
    let table_str = table.to_string();
    let args = [
        family_flag(family),
        "rule",
        "del",
        "fwmark",
        mark_str.as_str(),
        "lookup",
        table_str.as_str(),
    ];
    let out = run("ip", &args).await?;
    if out.success || rule_missing(&out.stderr) {
        Ok(())
    } else {
        Err(command_error("ip", &args, &out))
    }
}

/// Install a default route via `iface` into `table`
///
/// An already-present identical route is fine.
pub async fn add_default_route(
    family: Family,
    iface: &str,
    table: u32,
) -> Result<(), NetfilterError> {
    let table_str = table.to_string();
    let args = [
        family_flag(family),
        "route",
        "add",
        "default",
        "dev",
        iface,
        "table",
        table_str.as_str(),
    ];
    let out = run("ip", &args).await?;
    if out.success || out.stderr.contains("File exists") {
        Ok(())
    } else {
        Err(command_error("ip", &args, &out))
    }
}

/// Remove the default route of `table`; absence is not an error
pub async fn del_default_route(
    family: Family,
    iface: &str,
    table: u32,
) -> Result<(), NetfilterError> {
    let table_str = table.to_string();
    let args = [
        family_flag(family),
        "route",
        "del",
        "default",
        "dev",
        iface,
        "table",
        table_str.as_str(),
    ];
    let out = run("ip", &args).await?;
    if out.success || rule_missing(&out.stderr) || out.stderr.contains("Cannot find device") {
        Ok(())
    } else {
        Err(command_error("ip", &args, &out))
    }
}

/// Does a link with this name currently exist?
pub async fn link_exists(name: &str) -> Result<bool, NetfilterError> {
    Ok(run("ip", &["link", "show", "dev", name]).await?.success)
}

/// Addresses assigned to a link, both families
///
/// Fails when the link does not exist.
pub async fn list_addresses(link: &str) -> Result<Vec<IpAddr>, NetfilterError> {
    let stdout = run_checked("ip", &["-json", "addr", "show", "dev", link]).await?;
    parse_addresses(&stdout)
}

/// Known link names with their flag sets
pub async fn list_links() -> Result<Vec<LinkInfo>, NetfilterError> {
    let stdout = run_checked("ip", &["-json", "link", "show"]).await?;
    parse_links(&stdout)
}

/// Summary of one network interface
#[derive(Debug, Clone)]
pub struct LinkInfo {
    pub name: String,
    pub flags: Vec<String>,
}

impl LinkInfo {
    /// Point-to-point links are what egress tunnels look like
    #[must_use]
    pub fn is_point_to_point(&self) -> bool {
        self.flags.iter().any(|f| f == "POINTOPOINT")
    }
}

fn rule_missing(stderr: &str) -> bool {
    stderr.contains("No such file or directory") || stderr.contains("No such process")
}

fn parse_error(reason: impl Into<String>) -> NetfilterError {
    NetfilterError::ParseOutput {
        program: "ip".to_string(),
        reason: reason.into(),
    }
}

/// Accept iproute2's mixed table encodings: numbers, numeric strings and
/// well-known names
fn table_id(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Value::String(s) => match s.as_str() {
            "local" => Some(255),
            "main" => Some(254),
            "default" => Some(253),
            "unspec" => Some(0),
            other => other.parse().ok(),
        },
        _ => None,
    }
}

/// fwmark renders as `"0x1"` or `"1"` depending on iproute2 version
fn mark_value(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Value::String(s) => {
            if let Some(hex) = s.strip_prefix("0x") {
                u32::from_str_radix(hex, 16).ok()
            } else {
                s.parse().ok()
            }
        }
        _ => None,
    }
}

fn parse_policy_rules(json: &str) -> Result<Vec<PolicyRule>, NetfilterError> {
    let values: Vec<Value> =
        serde_json::from_str(json).map_err(|e| parse_error(format!("rule list: {e}")))?;
    Ok(values
        .iter()
        .map(|v| PolicyRule {
            fwmark: v.get("fwmark").and_then(mark_value),
            table: v.get("table").and_then(table_id),
        })
        .collect())
}

fn parse_route_tables(json: &str, tables: &mut HashSet<u32>) -> Result<(), NetfilterError> {
    let values: Vec<Value> =
        serde_json::from_str(json).map_err(|e| parse_error(format!("route list: {e}")))?;
    for v in &values {
        // Routes printed without a table live in main
        let table = v.get("table").and_then(table_id).unwrap_or(254);
        tables.insert(table);
    }
    Ok(())
}

fn parse_addresses(json: &str) -> Result<Vec<IpAddr>, NetfilterError> {
    let values: Vec<Value> =
        serde_json::from_str(json).map_err(|e| parse_error(format!("addr list: {e}")))?;
    let mut addrs = Vec::new();
    for link in &values {
        let Some(infos) = link.get("addr_info").and_then(Value::as_array) else {
            continue;
        };
        for info in infos {
            if let Some(local) = info.get("local").and_then(Value::as_str) {
                if let Ok(addr) = local.parse() {
                    addrs.push(addr);
                }
            }
        }
    }
    Ok(addrs)
}

fn parse_links(json: &str) -> Result<Vec<LinkInfo>, NetfilterError> {
    let values: Vec<Value> =
        serde_json::from_str(json).map_err(|e| parse_error(format!("link list: {e}")))?;
    Ok(values
        .iter()
        .filter_map(|v| {
            let name = v.get("ifname").and_then(Value::as_str)?.to_string();
            let flags = v
                .get("flags")
                .and_then(Value::as_array)
                .map(|fs| {
                    fs.iter()
                        .filter_map(Value::as_str)
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default();
            Some(LinkInfo { name, flags })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULES_JSON: &str = r#"[
        {"priority":0,"src":"all","table":"local"},
        {"priority":100,"src":"all","fwmark":"0x1","table":"100"},
        {"priority":101,"src":"all","fwmark":"2","table":101},
        {"priority":32766,"src":"all","table":"main"},
        {"priority":32767,"src":"all","table":"default"}
    ]"#;

    #[test]
    fn test_parse_policy_rules() {
        let rules = parse_policy_rules(RULES_JSON).unwrap();
        assert_eq!(rules.len(), 5);
        assert_eq!(rules[1].fwmark, Some(1));
        assert_eq!(rules[1].table, Some(100));
        assert_eq!(rules[2].fwmark, Some(2));
        assert_eq!(rules[2].table, Some(101));
        assert_eq!(rules[3].table, Some(254));
    }

    #[test]
    fn test_parse_route_tables() {
        let json = r#"[
            {"dst":"default","dev":"eth0"},
            {"dst":"10.0.0.0/8","dev":"eth1","table":"42"},
            {"dst":"default","dev":"nwg0","table":100}
        ]"#;
        let mut tables = HashSet::new();
        parse_route_tables(json, &mut tables).unwrap();
        assert!(tables.contains(&254));
        assert!(tables.contains(&42));
        assert!(tables.contains(&100));
    }

    #[test]
    fn test_allocation_skips_used_and_reserved() {
        let rules = parse_policy_rules(RULES_JSON).unwrap();
        let mut route_tables = HashSet::new();
        route_tables.insert(1u32);
        route_tables.insert(2u32);
        let (mark, table) = pick_unused_mark_and_table(&rules, &route_tables).unwrap();
        // Marks 0 (unmarked), 1 and 2 are taken
        assert_eq!(mark, 3);
        // Tables 0, 253-255 reserved; 1, 2 routed; 100, 101 ruled
        assert_eq!(table, 3);
    }

    #[test]
    fn test_allocation_on_clean_system() {
        let rules = parse_policy_rules(
            r#"[{"priority":0,"table":"local"},{"priority":32766,"table":"main"}]"#,
        )
        .unwrap();
        let (mark, table) = pick_unused_mark_and_table(&rules, &HashSet::new()).unwrap();
        assert_eq!(mark, 1);
        assert_eq!(table, 1);
    }

    #[test]
    fn test_mark_value_encodings() {
        assert_eq!(mark_value(&serde_json::json!("0xff")), Some(255));
        assert_eq!(mark_value(&serde_json::json!("17")), Some(17));
        assert_eq!(mark_value(&serde_json::json!(9)), Some(9));
        assert_eq!(mark_value(&serde_json::json!(null)), None);
    }

    #[test]
    fn test_parse_addresses() {
        let json = r#"[{
            "ifname":"br0",
            "addr_info":[
                {"family":"inet","local":"192.168.1.1","prefixlen":24},
                {"family":"inet6","local":"fe80::1","prefixlen":64}
            ]
        }]"#;
        let addrs = parse_addresses(json).unwrap();
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[0], "192.168.1.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_parse_links_flags() {
        let json = r#"[
            {"ifname":"lo","flags":["LOOPBACK","UP"]},
            {"ifname":"nwg0","flags":["POINTOPOINT","NOARP","UP"]}
        ]"#;
        let links = parse_links(json).unwrap();
        assert_eq!(links.len(), 2);
        assert!(!links[0].is_point_to_point());
        assert!(links[1].is_point_to_point());
    }
}
