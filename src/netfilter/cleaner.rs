//! Chain cleaner: restore a clean slate at startup
//!
//! After a crash the previous incarnation's chains and jump rules survive
//! in the kernel. On engine start we walk `nat`, `mangle` and `filter` in
//! both families, first deleting every rule in foreign chains that jumps to
//! one of our prefixed chains, then flushing and deleting the prefixed
//! chains themselves.

use tracing::debug;

use crate::error::NetfilterError;
use crate::netfilter::iptables::IpTables;

const TABLES: [&str; 3] = ["nat", "mangle", "filter"];

/// Remove every chain named `<prefix>*` and every jump to one
pub async fn clean_chains(ipt: IpTables, prefix: &str) -> Result<(), NetfilterError> {
    let jump_marker = format!("-j {prefix}");

    for table in TABLES {
        let chains = ipt.list_chains(table).await?;
        let mut prefixed = Vec::new();

        for chain in &chains {
            if chain.starts_with(prefix) {
                prefixed.push(chain.clone());
                continue;
            }

            for rule in ipt.list_rules(table, chain).await? {
                if !rule.contains(&jump_marker) {
                    continue;
                }
                debug!(table, chain, rule, "removing stale jump");
                ipt.delete_rule_line(table, chain, &rule).await?;
            }
        }

        for chain in prefixed {
            debug!(table, chain, "removing stale chain");
            ipt.clear_and_delete_chain(table, &chain).await?;
        }
    }

    Ok(())
}
