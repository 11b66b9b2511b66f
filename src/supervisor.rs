use crate::error::ProxyError;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

/// Process lifecycle as seen from inside the running instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// How a `stop` ended: the instance exited within the timeout, or it had to
/// be killed. Escalation is logged, not an error for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Graceful,
    Forced,
}

/// Liveness record: a plain-text pid at a fixed path. Record existence is
/// necessary but not sufficient for "running" — the referenced process must
/// also answer a liveness probe. Stale records self-heal (are removed).
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn read(&self) -> Option<i32> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        raw.trim().parse().ok()
    }

    pub fn write(&self, pid: u32) -> std::io::Result<()> {
        std::fs::write(&self.path, format!("{}\n", pid))
    }

    pub fn remove(&self) {
        let _ = std::fs::remove_file(&self.path);
    }

    /// The recorded pid, if that process is confirmed alive. A record whose
    /// process no longer exists is removed and treated as absent.
    pub fn live_pid(&self) -> Option<i32> {
        let pid = self.read()?;
        if process_alive(pid) {
            Some(pid)
        } else {
            tracing::info!("Removing stale pid file (pid {} is gone)", pid);
            self.remove();
            None
        }
    }
}

/// Refuse to start a second instance over a live one.
pub fn ensure_not_running(pidfile: &PidFile) -> Result<(), ProxyError> {
    match pidfile.live_pid() {
        Some(pid) => Err(ProxyError::AlreadyRunning(pid)),
        None => Ok(()),
    }
}

/// Liveness probe: signal 0, which checks existence without delivering
/// anything.
#[cfg(unix)]
pub fn process_alive(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

#[cfg(not(unix))]
pub fn process_alive(_pid: i32) -> bool {
    false
}

/// Stop the recorded instance: SIGTERM, bounded wait, SIGKILL escalation.
pub fn stop(pidfile: &PidFile, timeout: Duration) -> Result<StopOutcome, ProxyError> {
    let pid = pidfile.live_pid().ok_or(ProxyError::NotRunning)?;

    send_terminate(pid);
    tracing::info!("Sent SIGTERM to pid {}", pid);

    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if !process_alive(pid) {
            // A clean exit removes its own record; cover the crashy case.
            pidfile.remove();
            return Ok(StopOutcome::Graceful);
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    // Escalation is logged but not surfaced as a caller error.
    tracing::warn!("{}", ProxyError::ShutdownTimeout(timeout));
    send_kill(pid);
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while process_alive(pid) && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    pidfile.remove();
    Ok(StopOutcome::Forced)
}

/// Liveness query for `status`. Clears stale records as a side effect.
pub fn status(pidfile: &PidFile) -> Option<i32> {
    pidfile.live_pid()
}

#[cfg(unix)]
fn send_terminate(pid: i32) {
    let _ = nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid),
        nix::sys::signal::Signal::SIGTERM,
    );
}

#[cfg(unix)]
fn send_kill(pid: i32) {
    let _ = nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid),
        nix::sys::signal::Signal::SIGKILL,
    );
}

#[cfg(not(unix))]
fn send_terminate(_pid: i32) {}

#[cfg(not(unix))]
fn send_kill(_pid: i32) {}

/// Double-detach from the controlling terminal: fork, new session, fork
/// again so the survivor can never reacquire a controlling tty. Parents
/// exit inside this call; only the fully orphaned child returns.
#[cfg(unix)]
pub fn detach() -> anyhow::Result<()> {
    use nix::unistd::{fork, setsid, ForkResult};

    match unsafe { fork() }? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    setsid()?;
    match unsafe { fork() }? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    Ok(())
}

/// Platforms without detach support run in the foreground; the state
/// machine contract is unchanged.
#[cfg(not(unix))]
pub fn detach() -> anyhow::Result<()> {
    tracing::warn!("Detach not supported on this platform, running in foreground");
    Ok(())
}

/// Resolves when a graceful-termination request arrives: Ctrl+C, SIGTERM,
/// or an admin stop call.
pub async fn shutdown_signal(mut admin_rx: mpsc::Receiver<()>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Ctrl+C received"),
        _ = terminate => tracing::info!("SIGTERM received"),
        _ = admin_rx.recv() => tracing::info!("Stop requested via admin API"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_pidfile() -> (tempfile::TempDir, PidFile) {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = PidFile::new(dir.path().join("proxy.pid"));
        (dir, pidfile)
    }

    /// A pid that existed but is certainly dead now.
    #[cfg(unix)]
    fn dead_pid() -> i32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        child.wait().unwrap();
        pid
    }

    #[test]
    fn read_write_roundtrip() {
        let (_dir, pidfile) = temp_pidfile();
        assert!(pidfile.read().is_none());

        pidfile.write(12345).unwrap();
        assert_eq!(pidfile.read(), Some(12345));

        pidfile.remove();
        assert!(pidfile.read().is_none());
    }

    #[test]
    fn garbage_record_reads_as_absent() {
        let (dir, _) = temp_pidfile();
        let path = dir.path().join("proxy.pid");
        std::fs::write(&path, "not a pid").unwrap();
        assert!(PidFile::new(path).read().is_none());
    }

    #[test]
    #[cfg(unix)]
    fn own_process_is_alive() {
        assert!(process_alive(std::process::id() as i32));
    }

    #[test]
    #[cfg(unix)]
    fn stale_record_is_self_healed() {
        let (_dir, pidfile) = temp_pidfile();
        pidfile.write(dead_pid() as u32).unwrap();

        assert!(pidfile.live_pid().is_none());
        // The stale record was removed, not reported as running.
        assert!(pidfile.read().is_none());
    }

    #[test]
    #[cfg(unix)]
    fn live_record_blocks_second_start() {
        let (_dir, pidfile) = temp_pidfile();
        pidfile.write(std::process::id()).unwrap();

        match ensure_not_running(&pidfile) {
            Err(ProxyError::AlreadyRunning(pid)) => {
                assert_eq!(pid, std::process::id() as i32);
            }
            other => panic!("expected AlreadyRunning, got {:?}", other),
        }
        // Refusal must not clobber the existing record.
        assert_eq!(pidfile.read(), Some(std::process::id() as i32));
    }

    #[test]
    fn stop_without_record_is_not_running() {
        let (_dir, pidfile) = temp_pidfile();
        assert!(matches!(
            stop(&pidfile, Duration::from_secs(1)),
            Err(ProxyError::NotRunning)
        ));
        // And again: idempotent, no side effects.
        assert!(matches!(
            stop(&pidfile, Duration::from_secs(1)),
            Err(ProxyError::NotRunning)
        ));
    }

    #[test]
    #[cfg(unix)]
    fn stop_with_stale_record_is_not_running() {
        let (_dir, pidfile) = temp_pidfile();
        pidfile.write(dead_pid() as u32).unwrap();

        assert!(matches!(
            stop(&pidfile, Duration::from_secs(1)),
            Err(ProxyError::NotRunning)
        ));
        assert!(pidfile.read().is_none());
    }

    #[test]
    #[cfg(unix)]
    fn stop_terminates_a_live_process() {
        let (_dir, pidfile) = temp_pidfile();
        // A sleeper that dies promptly on SIGTERM. Reap it from another
        // thread so the liveness probe sees a real exit, not a zombie.
        let mut child = std::process::Command::new("sleep")
            .arg("60")
            .spawn()
            .unwrap();
        pidfile.write(child.id()).unwrap();
        let reaper = std::thread::spawn(move || {
            let _ = child.wait();
        });

        let outcome = stop(&pidfile, Duration::from_secs(5)).unwrap();
        reaper.join().unwrap();
        assert_eq!(outcome, StopOutcome::Graceful);
        assert!(pidfile.read().is_none());
        assert!(matches!(
            stop(&pidfile, Duration::from_secs(1)),
            Err(ProxyError::NotRunning)
        ));
    }

    #[test]
    fn status_reports_stopped_without_record() {
        let (_dir, pidfile) = temp_pidfile();
        assert!(status(&pidfile).is_none());
    }
}
