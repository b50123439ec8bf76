//! Domain-name rules
//!
//! A rule matches domain names one of four ways: exact (`domain`), suffix
//! (`namespace`), glob (`wildcard`) or case-insensitive regular expression
//! (`regex`). Disabled rules never match.

use serde::{Deserialize, Serialize};

use crate::id::Id;

/// Matching strategy of a [`Rule`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    /// Exact domain-name equality
    Domain,
    /// The domain itself or any name below it
    Namespace,
    /// Glob pattern: `*` matches any run, `?` any single character
    Wildcard,
    /// Case-insensitive regular expression
    Regex,
}

/// A single domain-name matcher inside a group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: Id,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: RuleKind,
    pub rule: String,
    pub enable: bool,
}

impl Rule {
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enable
    }

    /// Test a domain name against this rule
    ///
    /// Invalid regex patterns simply never match.
    #[must_use]
    pub fn is_match(&self, domain: &str) -> bool {
        match self.kind {
            RuleKind::Domain => domain == self.rule,
            RuleKind::Namespace => {
                domain == self.rule || domain.ends_with(&format!(".{}", self.rule))
            }
            RuleKind::Wildcard => wildcard_match(&self.rule, domain),
            RuleKind::Regex => match regex::RegexBuilder::new(&self.rule)
                .case_insensitive(true)
                .build()
            {
                Ok(re) => re.is_match(domain),
                Err(_) => false,
            },
        }
    }
}

/// Iterative glob matcher: `*` matches any run of characters, `?` exactly
/// one
///
/// Backtracks to the most recent `*` on mismatch, so pathological patterns
/// stay linear in practice.
#[must_use]
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();

    let (mut pi, mut ni) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ni < n.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ni));
            pi += 1;
        } else if let Some((star_pi, star_ni)) = star {
            // Let the last `*` swallow one more character
            pi = star_pi + 1;
            ni = star_ni + 1;
            star = Some((star_pi, star_ni + 1));
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
