//! Process lifecycle: port occupancy checks, the managed-PID registry, and
//! restart/stop sequencing.
//!
//! Start refuses to proceed when an unmanaged process holds the port.
//! `--restart` posts `/shutdown` to the running instance, waits for the
//! port to free, then escalates SIGTERM -> SIGKILL against PIDs from the
//! registry file. The registry only ever contains PIDs this gateway wrote;
//! the current process id is never signalled.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_STOP_TIMEOUT: &str = "ROUTECODEX_STOP_TIMEOUT_MS";
pub const ENV_KILL_TIMEOUT: &str = "ROUTECODEX_KILL_TIMEOUT_MS";
pub const ENV_RESTART_ONLY: &str = "ROUTECODEX_BUILD_RESTART_ONLY";

const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_millis(5_000);
const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_millis(3_000);

#[must_use]
pub fn stop_timeout() -> Duration {
    env_duration(ENV_STOP_TIMEOUT).unwrap_or(DEFAULT_STOP_TIMEOUT)
}

#[must_use]
pub fn kill_timeout() -> Duration {
    env_duration(ENV_KILL_TIMEOUT).unwrap_or(DEFAULT_KILL_TIMEOUT)
}

#[must_use]
pub fn restart_in_place() -> bool {
    std::env::var(ENV_RESTART_ONLY)
        .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn env_duration(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_millis)
}

/// Check whether something already accepts connections on the address.
#[must_use]
pub fn port_is_occupied(host: &str, port: u16) -> bool {
    let Ok(addrs) = (host, port).to_socket_addrs() else {
        return false;
    };
    for addr in addrs {
        if TcpStream::connect_timeout(&addr, Duration::from_millis(400)).is_ok() {
            return true;
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Managed-PID registry
// ---------------------------------------------------------------------------

/// Registry of gateway PIDs this installation manages.
pub struct PidRegistry {
    path: PathBuf,
}

impl PidRegistry {
    #[must_use]
    pub fn new(home: &Path) -> Self {
        Self {
            path: home.join(".routecodex/state/managed-pids.json"),
        }
    }

    #[must_use]
    pub fn read(&self) -> Vec<u32> {
        std::fs::read(&self.path)
            .ok()
            .and_then(|raw| serde_json::from_slice(&raw).ok())
            .unwrap_or_default()
    }

    /// Record the current process.
    ///
    /// # Errors
    ///
    /// Propagates filesystem errors; callers log and continue.
    pub fn record_self(&self) -> std::io::Result<()> {
        let mut pids = self.read();
        let me = std::process::id();
        if !pids.contains(&me) {
            pids.push(me);
        }
        self.write(&pids)
    }

    /// Remove the current process on clean shutdown.
    ///
    /// # Errors
    ///
    /// Propagates filesystem errors; callers log and continue.
    pub fn remove_self(&self) -> std::io::Result<()> {
        let me = std::process::id();
        let pids: Vec<u32> = self.read().into_iter().filter(|pid| *pid != me).collect();
        self.write(&pids)
    }

    fn write(&self, pids: &[u32]) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_vec(pids)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &self.path)
    }
}

// ---------------------------------------------------------------------------
// Signalling
// ---------------------------------------------------------------------------

/// Send a signal to a managed PID. Refuses the current process
/// unconditionally: a restart must never kill itself.
fn signal_pid(pid: u32, signal: &str) -> bool {
    if pid == std::process::id() {
        tracing::warn!(pid, signal, "refusing to signal own PID");
        return false;
    }
    #[cfg(unix)]
    {
        std::process::Command::new("kill")
            .arg(format!("-{signal}"))
            .arg(pid.to_string())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, signal);
        false
    }
}

/// Stop a running instance: POST `/shutdown`, wait for the port to free,
/// then escalate against registry PIDs.
pub async fn restart_existing(host: &str, port: u16, registry: &PidRegistry) {
    let stop_deadline = stop_timeout();
    let kill_deadline = kill_timeout();

    let url = format!("http://{host}:{port}/shutdown");
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build();
    if let Ok(client) = client {
        let _ = client
            .post(&url)
            .header("x-routecodex-stop-caller-pid", std::process::id().to_string())
            .header("x-routecodex-stop-caller-reason", "restart")
            .send()
            .await;
    }

    if wait_for_port_free(host, port, stop_deadline).await {
        tracing::info!("previous instance stopped gracefully");
        return;
    }

    let pids = registry.read();
    if restart_in_place() {
        // In-place rebuild restarts: signal SIGUSR2, spawn nothing.
        for pid in &pids {
            signal_pid(*pid, "USR2");
        }
        return;
    }

    for pid in &pids {
        signal_pid(*pid, "TERM");
    }
    if wait_for_port_free(host, port, kill_deadline).await {
        return;
    }
    for pid in &pids {
        signal_pid(*pid, "KILL");
    }
    let _ = wait_for_port_free(host, port, kill_deadline).await;
}

async fn wait_for_port_free(host: &str, port: u16, deadline: Duration) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if !port_is_occupied(host, port) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    !port_is_occupied(host, port)
}

/// Resolve the bind address.
///
/// # Errors
///
/// Returns an I/O error when the host does not resolve.
pub fn resolve_bind_addr(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "no address"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_port_reports_unoccupied() {
        // Bind then drop to find a port that is free right now.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(!port_is_occupied("127.0.0.1", port));
    }

    #[test]
    fn held_port_reports_occupied() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(port_is_occupied("127.0.0.1", port));
    }

    #[test]
    fn pid_registry_round_trips_and_never_lists_self_after_remove() {
        let dir = tempfile::tempdir().unwrap();
        let registry = PidRegistry::new(dir.path());
        registry.record_self().unwrap();
        assert!(registry.read().contains(&std::process::id()));
        registry.remove_self().unwrap();
        assert!(!registry.read().contains(&std::process::id()));
    }

    #[test]
    fn own_pid_is_never_signalled() {
        assert!(!signal_pid(std::process::id(), "TERM"));
    }
}
