//! Link-state event stream
//!
//! Runs `ip -o monitor link` as a child process and translates its output
//! into [`LinkEvent`]s. The supervisor dispatches them to every group whose
//! egress interface matches, so routes deferred at enable time get
//! installed the moment the link appears.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{error, trace, warn};

/// One observed interface transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    /// Interface name
    pub name: String,
    /// Whether the interface is administratively up after the event
    pub up: bool,
}

/// Spawn the monitor task; events arrive on the returned channel
///
/// The task exits when the shutdown signal fires or the child dies. A dead
/// monitor only disables deferred-route installation, so it is logged but
/// not fatal.
pub fn spawn(mut shutdown: watch::Receiver<bool>) -> mpsc::Receiver<LinkEvent> {
    let (tx, rx) = mpsc::channel(16);

    tokio::spawn(async move {
        let child = Command::new("ip")
            .args(["-o", "monitor", "link"])
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn();

        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                error!(error = %e, "failed to start link monitor");
                return;
            }
        };
        let Some(stdout) = child.stdout.take() else {
            error!("link monitor has no stdout");
            return;
        };
        let mut lines = BufReader::new(stdout).lines();

        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Some(event) = parse_monitor_line(&line) {
                            trace!(name = %event.name, up = event.up, "link event");
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(None) => {
                        warn!("link monitor exited");
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "link monitor read error");
                        return;
                    }
                },
                _ = shutdown.changed() => return,
            }
        }
    });

    rx
}

/// Parse one `ip -o monitor link` line
///
/// Expected shapes:
/// ```text
/// 12: nwg0: <POINTOPOINT,NOARP,UP,LOWER_UP> mtu 1420 ...
/// Deleted 12: nwg0: <POINTOPOINT,NOARP> mtu 1420 ...
/// ```
pub fn parse_monitor_line(line: &str) -> Option<LinkEvent> {
    let line = line.strip_prefix("Deleted ").unwrap_or(line);

    let mut parts = line.split_whitespace();
    let index = parts.next()?;
    if !index.ends_with(':') || !index[..index.len() - 1].bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let name_field = parts.next()?.trim_end_matches(':');
    // Virtual links print as "veth0@if12"
    let name = name_field.split('@').next()?.to_string();
    if name.is_empty() {
        return None;
    }

    let flags = parts.next()?;
    if !flags.starts_with('<') {
        return None;
    }
    let up = flags
        .trim_start_matches('<')
        .trim_end_matches('>')
        .split(',')
        .any(|f| f == "UP");

    Some(LinkEvent { name, up })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_up_event() {
        let event = parse_monitor_line(
            "12: nwg0: <POINTOPOINT,NOARP,UP,LOWER_UP> mtu 1420 qdisc noqueue state UNKNOWN",
        )
        .unwrap();
        assert_eq!(event.name, "nwg0");
        assert!(event.up);
    }

    #[test]
    fn test_parse_down_event() {
        let event =
            parse_monitor_line("12: nwg0: <POINTOPOINT,NOARP> mtu 1420 qdisc noqueue").unwrap();
        assert_eq!(event.name, "nwg0");
        assert!(!event.up);
    }

    #[test]
    fn test_parse_deleted_event() {
        let event = parse_monitor_line(
            "Deleted 12: nwg0: <POINTOPOINT,NOARP> mtu 1420 qdisc noqueue",
        )
        .unwrap();
        assert_eq!(event.name, "nwg0");
        assert!(!event.up);
    }

    #[test]
    fn test_parse_at_suffix() {
        let event = parse_monitor_line(
            "7: veth0@if6: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc noqueue",
        )
        .unwrap();
        assert_eq!(event.name, "veth0");
        assert!(event.up);
    }

    #[test]
    fn test_parse_rejects_noise() {
        assert!(parse_monitor_line("").is_none());
        assert!(parse_monitor_line("not an event line").is_none());
        assert!(parse_monitor_line("12: nwg0: mtu 1420").is_none());
    }
}
