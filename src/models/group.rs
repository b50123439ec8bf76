//! Group entity
//!
//! A group is a user-defined collection of domain rules sharing one egress
//! interface, one IP set and one routing binding. The runtime wrapper lives
//! in [`crate::group`]; this is the plain data model carried by config files
//! and the REST API.

use serde::{Deserialize, Serialize};

use crate::id::Id;
use crate::models::Rule;

/// Fallback display color applied when the configured one is malformed
pub const DEFAULT_COLOR: &str = "#ffffff";

/// Group data model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupModel {
    pub id: Id,
    pub name: String,
    #[serde(default = "default_color")]
    pub color: String,
    pub interface: String,
    #[serde(default = "default_enable")]
    pub enable: bool,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

fn default_color() -> String {
    DEFAULT_COLOR.to_string()
}

fn default_enable() -> bool {
    true
}

impl GroupModel {
    /// Coerce a malformed color to [`DEFAULT_COLOR`]
    ///
    /// Accepted form: `#rrggbb`.
    pub fn normalize_color(&mut self) {
        if !is_valid_color(&self.color) {
            self.color = DEFAULT_COLOR.to_string();
        }
    }
}

/// Check the `#rrggbb` form
#[must_use]
pub fn is_valid_color(s: &str) -> bool {
    s.len() == 7
        && s.starts_with('#')
        && s[1..].bytes().all(|b| b.is_ascii_hexdigit())
}
