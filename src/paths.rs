//! Filesystem locations used by the daemon
//!
//! The daemon takes no flags; config, PID file and control socket live at
//! fixed paths.

/// Directory holding the configuration file
pub const APP_DATA_DIR: &str = "/etc/trickle-router";

/// Configuration file location
pub const CONFIG_FILE: &str = "/etc/trickle-router/config.yaml";

/// Runtime state directory
pub const RUN_DIR: &str = "/var/run";

/// PID file location
pub const PID_FILE: &str = "/var/run/trickled.pid";

/// Unix control socket (REST API + netfilter.d hook ingress)
pub const CONTROL_SOCKET: &str = "/var/run/trickled.sock";
