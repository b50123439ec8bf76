//! trickle-router: selective domain-based egress routing daemon
//!
//! This crate implements a router-resident daemon that steers traffic for
//! user-defined domains through a chosen egress interface. It works by
//! intercepting local DNS, observing resolved addresses, and programming
//! kernel packet-classification state so that packets destined to those
//! addresses leave via a specific link.
//!
//! # Architecture
//!
//! ```text
//! Client → DNS MITM proxy → upstream resolver
//!              ↓ response hook
//!         Record store (A/CNAME cache)
//!              ↓ rule match
//!         Group → IP set → mangle mark → policy rule → table → egress link
//! ```
//!
//! # Modules
//!
//! - [`records`]: TTL-aware cache of observed A/CNAME answers
//! - [`dns`]: DNS MITM proxy (UDP/TCP listeners + interception hooks)
//! - [`netfilter`]: IP sets, firewall chains, policy rules and routes
//! - [`group`]: group engine coupling rules, IP sets and routing bindings
//! - [`app`]: lifecycle supervisor and DNS hook logic
//! - [`api`]: REST API v1 served over HTTP and a Unix socket
//! - [`config`]: YAML configuration file model
//! - [`models`]: groups, rules and rule matching

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod api;
pub mod app;
pub mod config;
pub mod dns;
pub mod error;
pub mod group;
pub mod id;
pub mod logging;
pub mod models;
pub mod netfilter;
pub mod paths;
pub mod records;

pub use app::App;
pub use error::{AppError, ConfigError, DnsError, GroupError, IdError, NetfilterError};
pub use id::Id;
pub use models::{GroupModel, Rule, RuleKind};
pub use records::{ARecord, Records};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
