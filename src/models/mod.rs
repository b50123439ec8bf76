//! Core entities: groups and domain rules

mod group;
mod rule;

pub use group::GroupModel;
pub use rule::{wildcard_match, Rule, RuleKind};
