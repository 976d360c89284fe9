use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::probe;

/// Interval between reachability polls while waiting for the upstream.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Timeout for a single reachability probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Startup readiness of the upstream SOCKS5 endpoint.
///
/// Driven to `Ready` exactly once, before the listener starts accepting, and
/// never reverts: a transient upstream loss after startup surfaces as
/// per-request failures instead of a gate change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessState {
    NotChecked,
    WaitingForUpstream,
    Ready,
}

/// Writable side of the readiness state, owned by the supervisor alone.
#[derive(Debug)]
pub struct ReadinessGate {
    tx: watch::Sender<ReadinessState>,
}

impl ReadinessGate {
    fn new() -> Self {
        let (tx, _) = watch::channel(ReadinessState::NotChecked);
        Self { tx }
    }

    fn set(&self, state: ReadinessState) {
        let _ = self.tx.send(state);
    }

    fn watch(&self) -> ReadinessWatch {
        ReadinessWatch {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read-only view of the readiness state handed to everything that is not
/// the supervisor.
#[derive(Debug, Clone)]
pub struct ReadinessWatch {
    rx: watch::Receiver<ReadinessState>,
}

impl ReadinessWatch {
    pub fn is_ready(&self) -> bool {
        *self.rx.borrow() == ReadinessState::Ready
    }

    #[allow(dead_code)]
    pub fn state(&self) -> ReadinessState {
        *self.rx.borrow()
    }

    /// Wait until the supervisor certifies the upstream reachable.
    pub async fn ready(&mut self) -> color_eyre::Result<()> {
        self.rx
            .wait_for(|state| *state == ReadinessState::Ready)
            .await
            .map(|_| ())
            .map_err(|_| {
                color_eyre::eyre::eyre!("supervisor stopped before the upstream became ready")
            })
    }
}

/// Launches the upstream provider executable at most once per process start.
#[derive(Debug)]
struct Bootstrap {
    exe: PathBuf,
    attempted: bool,
}

impl Bootstrap {
    fn new(exe: PathBuf) -> Self {
        Self {
            exe,
            attempted: false,
        }
    }

    /// Spawn the provider detached if present and not already launched.
    /// Returns true when a process was actually started.
    fn maybe_launch(&mut self) -> bool {
        if self.attempted {
            return false;
        }
        if !self.exe.is_file() {
            debug!("upstream executable {} not found, not launching", self.exe.display());
            return false;
        }
        match spawn_detached(&self.exe) {
            Ok(()) => {
                info!("launched upstream provider {}", self.exe.display());
                self.attempted = true;
                true
            }
            Err(e) => {
                warn!("failed to launch {}: {}", self.exe.display(), e);
                false
            }
        }
    }
}

/// Launch with no inherited standard streams so the child outlives this
/// process and never writes to our terminal.
fn spawn_detached(exe: &Path) -> io::Result<()> {
    let mut command = Command::new(exe);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const DETACHED_PROCESS: u32 = 0x0000_0008;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
    }

    command.spawn().map(|_| ())
}

fn process_name_matches(process: &str, target: &str) -> bool {
    let target = target.to_ascii_lowercase();
    let process = process.to_ascii_lowercase();
    process == target || process == format!("{}.exe", target)
}

/// Check the process list for an already-running upstream provider.
fn is_upstream_process_running(name: &str) -> bool {
    let mut sys = System::new_with_specifics(
        RefreshKind::nothing().with_processes(ProcessRefreshKind::everything()),
    );
    sys.refresh_processes(ProcessesToUpdate::All, true);
    sys.processes()
        .values()
        .any(|p| process_name_matches(&p.name().to_string_lossy(), name))
}

/// Blocks startup until the upstream SOCKS5 endpoint accepts connections,
/// bootstrapping the provider process if necessary.
#[derive(Debug)]
pub struct Supervisor {
    socks_addr: SocketAddr,
    process_name: String,
    bootstrap: Bootstrap,
    poll_interval: Duration,
    gate: ReadinessGate,
}

impl Supervisor {
    pub fn new(socks_addr: SocketAddr, upstream_exe: PathBuf, process_name: String) -> Self {
        Self {
            socks_addr,
            process_name,
            bootstrap: Bootstrap::new(upstream_exe),
            poll_interval: POLL_INTERVAL,
            gate: ReadinessGate::new(),
        }
    }

    #[allow(dead_code)]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn watch(&self) -> ReadinessWatch {
        self.gate.watch()
    }

    /// Poll until the upstream is reachable, then certify readiness.
    ///
    /// This loop has no upper bound: the gateway refuses to accept traffic it
    /// cannot relay. It returns early without certifying when the
    /// cancellation token fires.
    pub async fn ensure_upstream_ready(&mut self, cancel: &CancellationToken) {
        info!("waiting for upstream SOCKS5 at {}", self.socks_addr);
        let started = Instant::now();

        loop {
            if probe::is_reachable(self.socks_addr, PROBE_TIMEOUT).await {
                self.gate.set(ReadinessState::Ready);
                info!("upstream SOCKS5 at {} is reachable", self.socks_addr);
                return;
            }
            self.gate.set(ReadinessState::WaitingForUpstream);

            if !is_upstream_process_running(&self.process_name) {
                self.bootstrap.maybe_launch();
            }

            info!(
                "still waiting for upstream SOCKS5 at {} ({}s elapsed)",
                self.socks_addr,
                started.elapsed().as_secs()
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("shutdown requested while waiting for upstream");
                    return;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}
