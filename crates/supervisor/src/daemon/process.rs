//! Process and filesystem helpers for the daemon lifecycle

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::fs;
use std::io;
use std::path::Path;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub fn read_pid_file(path: &Path) -> Option<u32> {
    let content = fs::read_to_string(path).ok()?;
    match content.trim().parse::<u32>() {
        Ok(pid) if pid > 1 => Some(pid),
        _ => {
            warn!("Ignoring malformed pid file {}", path.display());
            None
        }
    }
}

pub fn write_pid_file(path: &Path, pid: u32) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{}\n", pid))
}

/// Remove a file if present. Returns whether something was removed.
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Whether a process with this pid exists (zombies included)
pub fn pid_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match signal::kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Whether `pid` is running `program`, judged by argv[0] in /proc.
///
/// A pid file can outlive its process and the number can be recycled, so a
/// recorded pid is only signalled after this check.
pub fn pid_runs_program(pid: u32, program: &str) -> bool {
    let Ok(cmdline) = fs::read(format!("/proc/{}/cmdline", pid)) else {
        return false;
    };
    let Some(argv0) = cmdline.split(|b| *b == 0).next() else {
        return false;
    };
    let argv0 = String::from_utf8_lossy(argv0);
    basename(&argv0) == basename(program)
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Ask a process to exit. Returns false when the signal could not be sent.
pub fn send_sigterm(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match signal::kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            debug!("SIGTERM to {} failed: {}", pid, e);
            false
        }
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
///
/// Meant for processes this supervisor does not hold a child handle for.
pub async fn terminate_pid(pid: u32, grace: Duration) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if !send_sigterm(pid) {
        return;
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !pid_alive(pid) {
            debug!("Process {} exited after SIGTERM", pid);
            return;
        }
        sleep(POLL_INTERVAL).await;
    }

    warn!("Process {} ignored SIGTERM for {:?}, sending SIGKILL", pid, grace);
    if let Err(e) = signal::kill(Pid::from_raw(raw), Signal::SIGKILL) {
        debug!("SIGKILL to {} failed: {}", pid, e);
    }
}

/// Run a short external command with a timeout
pub async fn run_command(program: &str, args: &[&str], timeout: Duration) -> io::Result<Output> {
    let child = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(timeout, child).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("{} {} timed out after {:?}", program, args.join(" "), timeout),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_pid_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run/gpsd.pid");

        write_pid_file(&path, 4242).unwrap();
        assert_eq!(read_pid_file(&path), Some(4242));

        fs::write(&path, "garbage").unwrap();
        assert_eq!(read_pid_file(&path), None);
    }

    #[test]
    fn test_remove_if_exists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gpsd.sock");
        assert!(!remove_if_exists(&path).unwrap());
        fs::write(&path, b"").unwrap();
        assert!(remove_if_exists(&path).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn test_own_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[test]
    fn test_basename() {
        assert_eq!(basename("/usr/sbin/gpsd"), "gpsd");
        assert_eq!(basename("gpsd"), "gpsd");
    }

    #[tokio::test]
    async fn test_run_command_timeout() {
        let result = run_command("sleep", &["5"], Duration::from_millis(100)).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_terminate_pid() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap();
        assert!(pid_runs_program(pid, "sleep"));
        assert!(!pid_runs_program(pid, "gpsd"));

        // our own unreaped child stays visible as a zombie, so this also
        // walks the SIGKILL path
        terminate_pid(pid, Duration::from_millis(500)).await;
        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }
}
