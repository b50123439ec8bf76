//! Logging setup
//!
//! Installs a `tracing` subscriber with a reloadable level filter so a
//! config reload (SIGHUP) can re-apply the configured level without
//! restarting the process.

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Handle for changing the log level at runtime
#[derive(Clone)]
pub struct LevelHandle {
    reload: reload::Handle<EnvFilter, tracing_subscriber::Registry>,
}

impl LevelHandle {
    /// Re-apply a level from a config string
    ///
    /// Unknown strings fall back to `info`.
    pub fn set(&self, level: &str) {
        let filter = filter_for(level);
        if let Err(e) = self.reload.reload(filter) {
            eprintln!("failed to reload log level: {e}");
        }
    }
}

/// Map a config log-level string to an `EnvFilter`
///
/// `fatal` and `panic` have no `tracing` equivalent and collapse to `error`;
/// `nolevel` behaves as `info`; `disabled` turns logging off.
fn filter_for(level: &str) -> EnvFilter {
    let directive = match level {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "warn" => LevelFilter::WARN,
        "error" | "fatal" | "panic" => LevelFilter::ERROR,
        "disabled" => LevelFilter::OFF,
        // "info", "nolevel" and anything unrecognized
        _ => LevelFilter::INFO,
    };
    EnvFilter::builder()
        .with_default_directive(directive.into())
        .from_env_lossy()
}

/// Initialize the global subscriber and return the reload handle
///
/// `RUST_LOG` still takes precedence over the configured level, matching
/// standard Rust tooling expectations.
pub fn init(level: &str) -> LevelHandle {
    let (filter, handle) = reload::Layer::new(filter_for(level));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(filter))
        .init();
    LevelHandle { reload: handle }
}
