//! Error types for trickle-router
//!
//! Errors are categorized by subsystem. Kernel provisioning paths collect
//! every failure into a joined set instead of short-circuiting, so teardown
//! reports all broken steps at once.

use std::fmt;
use std::io;

use thiserror::Error;

/// Top-level application error
#[derive(Debug, Error)]
pub enum AppError {
    /// Configuration errors (file parsing, validation, version mismatch)
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// DNS proxy errors
    #[error("dns error: {0}")]
    Dns(#[from] DnsError),

    /// Kernel provisioning errors (iptables/ipset/ip)
    #[error("netfilter error: {0}")]
    Netfilter(#[from] NetfilterError),

    /// Group engine errors
    #[error("group error: {0}")]
    Group(#[from] GroupError),

    /// The daemon is already running (in-process flag)
    #[error("already running")]
    AlreadyRunning,

    /// Another daemon instance owns the PID file
    #[error("process {pid} is already running")]
    AlreadyRunningPid { pid: i32 },

    /// Group ID collision on import or create
    #[error("group id conflict")]
    GroupIdConflict,

    /// Rule ID collision within a group
    #[error("rule id conflict")]
    RuleIdConflict,

    /// Named uplink interface does not exist
    #[error("failed to find link {0}")]
    LinkNotFound(String),

    /// Configured DNS listen address does not parse
    #[error("invalid listen address {0}")]
    InvalidListenAddress(String),

    /// Panic captured from the supervisor task
    #[error("recovered panic: {0}")]
    Panic(String),

    /// I/O errors not covered by other categories
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file version does not match the supported prefix
    #[error("config unsupported version")]
    UnsupportedVersion,

    /// YAML parsing error
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// I/O error while reading or writing the config file
    #[error("config i/o error: {0}")]
    Io(#[from] io::Error),
}

/// ID parsing errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    /// Input is not exactly 8 characters
    #[error("id wrong length")]
    WrongLength,

    /// Input contains non-hex characters
    #[error("id is not hex: {0}")]
    NotHex(String),
}

/// DNS proxy errors
///
/// These terminate a single request; the daemon keeps serving.
#[derive(Debug, Error)]
pub enum DnsError {
    /// Failed to bind a listener
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Upstream dial or I/O failure
    #[error("upstream i/o error: {0}")]
    Upstream(io::Error),

    /// Upstream did not answer within the deadline
    #[error("upstream timeout")]
    UpstreamTimeout,

    /// Malformed DNS message
    #[error("failed to parse message: {0}")]
    Parse(#[from] hickory_proto::error::ProtoError),

    /// Request/response hook failure
    #[error("hook error: {0}")]
    Hook(String),

    /// I/O error on the client side
    #[error("client i/o error: {0}")]
    Io(#[from] io::Error),
}

impl DnsError {
    /// Timeouts are logged at warn, everything else at error
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::UpstreamTimeout => true,
            Self::Upstream(e) | Self::Io(e) => e.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}

/// Kernel provisioning errors
#[derive(Debug, Error)]
pub enum NetfilterError {
    /// External tool exited non-zero
    #[error("{program} {args:?} failed: {stderr}")]
    Command {
        program: String,
        args: Vec<String>,
        stderr: String,
    },

    /// Failed to spawn an external tool
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// Unparseable output from `ip -json` or `ipset save`
    #[error("failed to parse {program} output: {reason}")]
    ParseOutput { program: String, reason: String },

    /// No free fwmark or routing table found during allocation
    #[error("no unused {0} available")]
    Exhausted(&'static str),

    /// Several teardown steps failed
    #[error("{0}")]
    Joined(JoinedErrors),
}

impl NetfilterError {
    /// Collect a list of errors into a single joined error
    ///
    /// Returns `Ok(())` when the list is empty.
    pub fn join(errs: Vec<NetfilterError>) -> Result<(), NetfilterError> {
        if errs.is_empty() {
            Ok(())
        } else if errs.len() == 1 {
            Err(errs.into_iter().next().unwrap())
        } else {
            Err(NetfilterError::Joined(JoinedErrors(
                errs.into_iter().map(|e| e.to_string()).collect(),
            )))
        }
    }
}

/// Error set collected during multi-step teardown
#[derive(Debug)]
pub struct JoinedErrors(pub Vec<String>);

impl fmt::Display for JoinedErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("; "))
    }
}

/// Group engine errors
#[derive(Debug, Error)]
pub enum GroupError {
    /// IP set / chain / rule / route provisioning failed
    #[error("netfilter error: {0}")]
    Netfilter(#[from] NetfilterError),

    /// Vendor protection rule could not be applied
    #[error("failed to fix protect: {0}")]
    FixProtect(NetfilterError),
}
