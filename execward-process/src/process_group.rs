//! Process-group helpers for reliable child cleanup.
//!
//! - `detach_from_tty` runs in `pre_exec` and starts a new session, so the
//!   child leads its own process group and has no controlling terminal.
//! - `set_parent_death_signal` (Linux) kills the child if the supervisor dies.
//! - `terminate_child_group` sends SIGTERM to the whole group, waits for the
//!   grace period, then sends SIGKILL.
//!
//! Signalling a group that no longer exists is not an error.

use std::io;
use std::time::Duration;

use tokio::process::Child;

/// Default grace period between SIGTERM and SIGKILL (milliseconds).
pub const DEFAULT_GRACEFUL_TIMEOUT_MS: u64 = 500;

/// How a termination request completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GracefulTerminationResult {
    /// The group exited within the grace period after SIGTERM.
    GracefulExit,
    /// The group had to be killed with SIGKILL.
    ForcefulKill,
    /// Nothing was running any more.
    AlreadyExited,
}

/// Arrange for the child to be killed when the original parent dies.
///
/// Must run in `pre_exec`. `parent_pid` is captured before the fork so a
/// parent that exits between fork and exec is still noticed.
#[cfg(target_os = "linux")]
pub fn set_parent_death_signal(parent_pid: libc::pid_t) -> io::Result<()> {
    // SAFETY: prctl with integer arguments only.
    if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) } == -1 {
        return Err(io::Error::last_os_error());
    }

    if nix::unistd::getppid().as_raw() != parent_pid {
        // SAFETY: raising a signal on ourselves.
        unsafe {
            libc::raise(libc::SIGKILL);
        }
    }

    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn set_parent_death_signal(_parent_pid: i32) -> io::Result<()> {
    Ok(())
}

/// Start a new session; fall back to a new process group if we already lead one.
#[cfg(unix)]
pub fn detach_from_tty() -> io::Result<()> {
    match nix::unistd::setsid() {
        Ok(_) => Ok(()),
        Err(nix::errno::Errno::EPERM) => set_process_group(),
        Err(errno) => Err(errno.into()),
    }
}

/// Put the calling process into its own process group.
#[cfg(unix)]
pub fn set_process_group() -> io::Result<()> {
    use nix::unistd::{Pid, setpgid};

    setpgid(Pid::from_raw(0), Pid::from_raw(0)).map_err(io::Error::from)
}

/// Send `signal` to every process in group `pgid`.
///
/// Returns `Ok(false)` when the group no longer exists.
#[cfg(unix)]
pub fn signal_process_group(pgid: u32, signal: nix::sys::signal::Signal) -> io::Result<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        return Ok(false);
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(errno) => Err(errno.into()),
    }
}

/// SIGKILL the whole group (best effort).
#[cfg(unix)]
pub fn kill_process_group(pgid: u32) -> io::Result<()> {
    signal_process_group(pgid, nix::sys::signal::Signal::SIGKILL).map(|_| ())
}

/// SIGTERM the child's group, wait up to `grace`, then SIGKILL.
///
/// The child is reaped on return; call `child.wait()` again to read its status.
#[cfg(unix)]
pub async fn terminate_child_group(
    child: &mut Child,
    pgid: u32,
    grace: Duration,
) -> io::Result<GracefulTerminationResult> {
    use nix::sys::signal::Signal;

    if !signal_process_group(pgid, Signal::SIGTERM)? {
        child.wait().await?;
        return Ok(GracefulTerminationResult::AlreadyExited);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            status?;
            // The leader is gone; grandchildren that ignored SIGTERM are not.
            signal_process_group(pgid, Signal::SIGKILL)?;
            Ok(GracefulTerminationResult::GracefulExit)
        }
        Err(_) => {
            signal_process_group(pgid, Signal::SIGKILL)?;
            child.wait().await?;
            tracing::debug!(pgid, "process group required SIGKILL");
            Ok(GracefulTerminationResult::ForcefulKill)
        }
    }
}

#[cfg(not(unix))]
pub async fn terminate_child_group(
    child: &mut Child,
    _pgid: u32,
    _grace: Duration,
) -> io::Result<GracefulTerminationResult> {
    if child.try_wait()?.is_some() {
        return Ok(GracefulTerminationResult::AlreadyExited);
    }
    child.kill().await?;
    Ok(GracefulTerminationResult::ForcefulKill)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    #[test]
    fn signalling_a_missing_group_is_not_an_error() {
        let delivered =
            signal_process_group(2_000_000_000, nix::sys::signal::Signal::SIGTERM).unwrap();
        assert!(!delivered);
    }

    #[tokio::test]
    async fn terminate_escalates_when_sigterm_is_ignored() {
        let mut command = Command::new("/bin/sh");
        command
            .arg("-c")
            .arg("trap '' TERM; while :; do sleep 1; done")
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // SAFETY: only async-signal-safe calls in the hook.
        unsafe {
            command.pre_exec(detach_from_tty);
        }
        let mut child = command.spawn().unwrap();
        let pgid = child.id().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let outcome = terminate_child_group(&mut child, pgid, Duration::from_millis(200))
            .await
            .unwrap();

        assert_eq!(outcome, GracefulTerminationResult::ForcefulKill);
        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn terminate_reports_graceful_exit() {
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg("sleep 30");
        // SAFETY: only async-signal-safe calls in the hook.
        unsafe {
            command.pre_exec(detach_from_tty);
        }
        let mut child = command.spawn().unwrap();
        let pgid = child.id().unwrap();

        let outcome = terminate_child_group(&mut child, pgid, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(outcome, GracefulTerminationResult::GracefulExit);
    }
}
