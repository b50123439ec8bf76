//! Lifecycle supervisor
//!
//! Startup order: exclusive-run flag, PID file, log level, DNS proxy and
//! record store, netfilter helpers + chain cleaner, DNS listeners, uplink
//! address collection, port-53 remap, group enablement, link-update
//! subscription, select loop. Teardown runs in reverse and joins errors.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::app::App;
use crate::dns::DnsMitmProxy;
use crate::error::AppError;
use crate::netfilter::{self, LinkEvent};
use crate::paths;

/// Removes the PID file when the supervisor unwinds
struct PidFileGuard;

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(paths::PID_FILE);
    }
}

impl App {
    /// Run the daemon until `shutdown` fires or a fatal error occurs
    ///
    /// Panics inside the supervisor are captured and surface as an error
    /// instead of aborting the process.
    pub async fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<(), AppError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AppError::AlreadyRunning);
        }

        let app = Arc::clone(self);
        let supervisor = tokio::spawn(async move { app.run(shutdown).await });
        let result = match supervisor.await {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => {
                let panic = join_err.into_panic();
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(AppError::Panic(msg))
            }
            Err(join_err) => Err(AppError::Panic(join_err.to_string())),
        };

        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<(), AppError> {
        check_pid_file()?;
        write_pid_file()?;
        let _pid_guard = PidFileGuard;

        self.apply_log_level();

        let nf = self.netfilter();
        nf.clean_iptables().await?;

        // Internal shutdown fans out to listeners and the link monitor and
        // always fires when the supervisor unwinds.
        let (int_tx, _) = watch::channel(false);
        let (err_tx, mut err_rx) = mpsc::channel::<AppError>(4);

        self.start_dns_listeners(&int_tx, &err_tx).await?;

        let mut link_events = netfilter::spawn_link_monitor(int_tx.subscribe());

        let result = match self.enable_dataplane().await {
            Ok(()) => {
                info!("daemon started");
                loop {
                    tokio::select! {
                        Some(event) = link_events.recv() => self.handle_link_event(&event).await,
                        Some(err) = err_rx.recv() => break Err(err),
                        _ = shutdown.changed() => {
                            info!("shutdown requested");
                            break Ok(());
                        }
                    }
                }
            }
            Err(e) => Err(e),
        };

        let _ = int_tx.send(true);
        self.disable_dataplane().await;
        result
    }

    /// Bind and spawn one UDP and one TCP listener per configured host
    async fn start_dns_listeners(
        self: &Arc<Self>,
        int_tx: &watch::Sender<bool>,
        err_tx: &mpsc::Sender<AppError>,
    ) -> Result<(), AppError> {
        let settings = self.settings();
        let proxy = Arc::new(DnsMitmProxy::new(
            settings.dns_proxy.upstream.address.clone(),
            settings.dns_proxy.upstream.port,
            Arc::clone(self) as Arc<dyn crate::dns::DnsInterceptor>,
        ));

        for host in settings.dns_proxy.listen_hosts() {
            let raw = format!("{}:{}", host.address, host.port);
            let addr: SocketAddr = raw
                .parse()
                .map_err(|_| AppError::InvalidListenAddress(raw.clone()))?;

            let udp = proxy.bind_udp(addr).await?;
            let udp_shutdown = int_tx.subscribe();
            let udp_err = err_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = udp.run(udp_shutdown).await {
                    let _ = udp_err.send(e.into()).await;
                }
            });

            let tcp = proxy.bind_tcp(addr).await?;
            let tcp_shutdown = int_tx.subscribe();
            let tcp_err = err_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = tcp.run(tcp_shutdown).await {
                    let _ = tcp_err.send(e.into()).await;
                }
            });
        }
        Ok(())
    }

    /// Install the port remap and enable every group
    async fn enable_dataplane(&self) -> Result<(), AppError> {
        let settings = self.settings();

        let mut addresses = Vec::new();
        for link in &settings.link {
            if !netfilter::link_exists(link).await? {
                return Err(AppError::LinkNotFound(link.clone()));
            }
            addresses.extend(netfilter::list_addresses(link).await?);
        }

        if !settings.dns_proxy.disable_remap53 {
            let mut remap =
                self.netfilter()
                    .port_remap("DNSOR", 53, settings.dns_proxy.host.port, addresses);
            remap.enable().await.map_err(AppError::Netfilter)?;
            *self.dns_overrider.lock().await = Some(remap);
        }

        for group in self.groups() {
            group.enable().await?;
        }
        Ok(())
    }

    /// Reverse of [`Self::enable_dataplane`]; errors are logged, not
    /// propagated
    async fn disable_dataplane(&self) {
        for group in self.groups() {
            if let Err(e) = group.disable().await {
                error!(id = %group.id(), error = %e, "failed to disable group");
            }
        }
        if let Some(mut remap) = self.dns_overrider.lock().await.take() {
            if let Err(e) = remap.disable().await {
                error!(error = %e, "failed to remove dns remap");
            }
        }
    }

    /// Dispatch a link event to every group bound to that interface
    async fn handle_link_event(&self, event: &LinkEvent) {
        debug!(iface = %event.name, up = event.up, "link event");
        for group in self.groups() {
            if group.interface() != event.name {
                continue;
            }
            if let Err(e) = group.link_update_hook(event).await {
                error!(id = %group.id(), error = %e, "error while handling link update");
            }
        }
    }
}

/// Refuse to start when another live instance owns the PID file
///
/// The PID is considered live when a process with it exists *and* shares
/// our executable base name; anything else is a stale file and is removed.
fn check_pid_file() -> Result<(), AppError> {
    let contents = match std::fs::read_to_string(paths::PID_FILE) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    if let Ok(pid) = contents.trim().parse::<i32>() {
        if process_matches_own_name(pid) {
            return Err(AppError::AlreadyRunningPid { pid });
        }
        warn!(pid, "removing stale pid file");
    }
    let _ = std::fs::remove_file(paths::PID_FILE);
    Ok(())
}

fn write_pid_file() -> Result<(), AppError> {
    std::fs::write(paths::PID_FILE, std::process::id().to_string())?;
    Ok(())
}

/// Does `pid` belong to a process with our executable base name?
fn process_matches_own_name(pid: i32) -> bool {
    // Signal 0 probes existence without delivering anything
    if unsafe { libc::kill(pid, 0) } != 0 {
        return false;
    }
    let Ok(comm) = std::fs::read_to_string(format!("/proc/{pid}/comm")) else {
        return false;
    };
    let Some(own) = own_process_name() else {
        return false;
    };
    // /proc/<pid>/comm is truncated to 15 bytes
    let comm = comm.trim();
    let own_truncated: String = own.chars().take(15).collect();
    comm == own_truncated
}

fn own_process_name() -> Option<String> {
    std::env::current_exe()
        .ok()?
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
}
