//! gpsd lifecycle manager
//!
//! Implements the bind sequence:
//! 1. Quiesce - stop the previous instance, competing units, stale files
//! 2. Permission - make the device node read/write for the daemon
//! 3. Start - spawn gpsd in the foreground on the well-known socket
//! 4. Verify - process still alive after settling, control socket answers

use super::process::{
    pid_alive, pid_runs_program, read_pid_file, remove_if_exists, run_command, send_sigterm,
    terminate_pid, write_pid_file,
};
use super::{BindFailure, BindStage, DaemonControl, DaemonHandle};
use crate::config::DaemonSettings;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

const SOCKET_RETRY_INTERVAL: Duration = Duration::from_millis(200);

pub struct GpsdManager {
    settings: DaemonSettings,
    /// The instance this manager started, if still held
    child: Option<Child>,
    next_bind_id: u64,
}

impl GpsdManager {
    pub fn new(settings: DaemonSettings) -> Self {
        Self {
            settings,
            child: None,
            next_bind_id: 1,
        }
    }

    /// Continue bind ids from an earlier process, so ids stay unique
    /// across restarts
    pub fn with_first_bind_id(mut self, id: u64) -> Self {
        self.next_bind_id = id.max(1);
        self
    }

    /// Id the next bind will carry
    pub fn next_bind_id(&self) -> u64 {
        self.next_bind_id
    }

    pub fn settings(&self) -> &DaemonSettings {
        &self.settings
    }

    /// Pid of the managed instance: the owned child, else the pid file
    pub fn managed_pid(&self) -> Option<u32> {
        self.child
            .as_ref()
            .and_then(|c| c.id())
            .or_else(|| read_pid_file(&self.settings.pid_file))
    }

    /// Argument list with `{device}` and `{socket}` substituted
    pub fn render_args(&self, device: &Path) -> Vec<String> {
        let device = device.to_string_lossy();
        let socket = self.settings.control_socket.to_string_lossy();
        self.settings
            .args
            .iter()
            .map(|arg| arg.replace("{device}", &device).replace("{socket}", &socket))
            .collect()
    }

    async fn quiesce(&mut self) -> Result<(), BindFailure> {
        info!("Quiescing previous {} instance", self.settings.program);

        self.stop_instance().await;
        self.stop_competing_units().await;
        self.remove_stale_artifacts()
    }

    /// Stop the owned child and whatever the pid file points at
    async fn stop_instance(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Some(pid) = child.id() {
                info!("Stopping managed {} (pid {})", self.settings.program, pid);
                send_sigterm(pid);
                match tokio::time::timeout(self.settings.grace(), child.wait()).await {
                    Ok(Ok(status)) => debug!("Managed daemon exited: {}", status),
                    Ok(Err(e)) => warn!("Failed to reap managed daemon: {}", e),
                    Err(_) => {
                        warn!(
                            "Managed daemon ignored SIGTERM for {:?}, killing",
                            self.settings.grace()
                        );
                        if let Err(e) = child.kill().await {
                            error!("Failed to kill managed daemon: {}", e);
                        }
                    }
                }
            }
        }

        if let Some(pid) = read_pid_file(&self.settings.pid_file) {
            if pid_alive(pid) && pid_runs_program(pid, &self.settings.program) {
                info!(
                    "Stopping recorded {} instance (pid {} from {})",
                    self.settings.program,
                    pid,
                    self.settings.pid_file.display()
                );
                terminate_pid(pid, self.settings.grace()).await;
            } else {
                debug!("Recorded pid {} is not a live {}", pid, self.settings.program);
            }
        }
    }

    /// Stop and disable units that would start a conflicting instance
    async fn stop_competing_units(&self) {
        let timeout = self.settings.command_timeout();
        for unit in &self.settings.competing_units {
            for action in ["stop", "disable"] {
                match run_command(&self.settings.systemctl, &[action, unit], timeout).await {
                    Ok(output) if output.status.success() => {
                        debug!("systemctl {} {}: ok", action, unit);
                    }
                    Ok(output) => {
                        debug!(
                            "systemctl {} {} exited {}: {}",
                            action,
                            unit,
                            output.status,
                            String::from_utf8_lossy(&output.stderr).trim()
                        );
                    }
                    Err(e) => warn!("systemctl {} {} failed: {}", action, unit, e),
                }
            }
        }
    }

    fn remove_stale_artifacts(&self) -> Result<(), BindFailure> {
        let paths = [&self.settings.control_socket, &self.settings.pid_file]
            .into_iter()
            .chain(self.settings.stale_paths.iter());

        for path in paths {
            match remove_if_exists(path) {
                Ok(true) => info!("Removed stale file: {}", path.display()),
                Ok(false) => {}
                Err(e) => {
                    return Err(BindFailure::new(
                        BindStage::Quiesce,
                        format!("cannot remove {}: {}", path.display(), e),
                    ));
                }
            }
        }
        Ok(())
    }

    fn grant_access(&self, device: &Path) -> Result<(), BindFailure> {
        let meta = fs::metadata(device).map_err(|e| {
            BindFailure::new(
                BindStage::Permission,
                format!("{} unavailable: {}", device.display(), e),
            )
        })?;

        let mode = meta.permissions().mode() & 0o7777;
        if mode & 0o666 == 0o666 {
            return Ok(());
        }

        fs::set_permissions(device, fs::Permissions::from_mode(mode | 0o666)).map_err(|e| {
            BindFailure::new(
                BindStage::Permission,
                format!("cannot chmod {}: {}", device.display(), e),
            )
        })?;
        info!("Set permissions 0{:o} on {}", mode | 0o666, device.display());
        Ok(())
    }

    fn start(&mut self, device: &Path) -> Result<u32, BindFailure> {
        let args = self.render_args(device);
        info!("Starting {} {}", self.settings.program, args.join(" "));

        let child = Command::new(&self.settings.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            // Own process group: terminal signals aimed at the supervisor
            // must not reach the daemon
            .process_group(0)
            .spawn()
            .map_err(|e| {
                BindFailure::new(
                    BindStage::Start,
                    format!("cannot spawn {}: {}", self.settings.program, e),
                )
            })?;

        let pid = child
            .id()
            .ok_or_else(|| BindFailure::new(BindStage::Start, "daemon exited during spawn"))?;
        self.child = Some(child);

        if let Err(e) = write_pid_file(&self.settings.pid_file, pid) {
            warn!(
                "Failed to record pid in {}: {}",
                self.settings.pid_file.display(),
                e
            );
        }

        Ok(pid)
    }

    async fn verify(&mut self, pid: u32) -> Result<(), BindFailure> {
        sleep(self.settings.settle()).await;

        let Some(child) = self.child.as_mut() else {
            return Err(BindFailure::new(BindStage::Start, "daemon handle lost"));
        };
        match child.try_wait() {
            Ok(None) => debug!("Daemon pid {} alive after settle window", pid),
            Ok(Some(status)) => {
                self.child = None;
                return Err(BindFailure::new(
                    BindStage::Start,
                    format!("daemon exited during settle window: {}", status),
                ));
            }
            Err(e) => {
                return Err(BindFailure::new(
                    BindStage::Start,
                    format!("cannot poll daemon: {}", e),
                ));
            }
        }

        let socket = &self.settings.control_socket;
        let deadline = Instant::now() + self.settings.socket_timeout();
        loop {
            match UnixStream::connect(socket).await {
                Ok(_) => {
                    debug!("Control socket {} accepts connections", socket.display());
                    return Ok(());
                }
                Err(e) if Instant::now() >= deadline => {
                    return Err(BindFailure::new(
                        BindStage::Liveness,
                        format!("control socket {} unreachable: {}", socket.display(), e),
                    ));
                }
                Err(_) => sleep(SOCKET_RETRY_INTERVAL).await,
            }
        }
    }

    pub fn control_socket(&self) -> &Path {
        &self.settings.control_socket
    }
}

impl DaemonControl for GpsdManager {
    async fn bind(&mut self, device: &Path) -> Result<DaemonHandle, BindFailure> {
        let bind_id = self.next_bind_id;
        self.next_bind_id += 1;

        self.quiesce().await?;
        self.grant_access(device)?;
        let pid = self.start(device)?;
        self.verify(pid).await?;

        let handle = DaemonHandle {
            pid,
            control_socket: self.settings.control_socket.clone(),
            device: device.to_path_buf(),
            bind_id,
        };
        info!("Daemon bound: {}", handle);
        Ok(handle)
    }

    async fn stop(&mut self) -> Result<(), BindFailure> {
        self.stop_instance().await;
        remove_if_exists(&self.settings.pid_file).map_err(|e| {
            BindFailure::new(
                BindStage::Quiesce,
                format!("cannot remove {}: {}", self.settings.pid_file.display(), e),
            )
        })?;
        Ok(())
    }

    fn is_running(&mut self) -> bool {
        if let Some(child) = self.child.as_mut() {
            return matches!(child.try_wait(), Ok(None));
        }
        read_pid_file(&self.settings.pid_file)
            .is_some_and(|pid| pid_alive(pid) && pid_runs_program(pid, &self.settings.program))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn settings(dir: &TempDir, program: &str, args: &[&str]) -> DaemonSettings {
        DaemonSettings {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            control_socket: dir.path().join("gpsd.sock"),
            pid_file: dir.path().join("run/gpsd.pid"),
            stale_paths: vec![dir.path().join("gpsd.lock")],
            competing_units: Vec::new(),
            systemctl: "systemctl".to_string(),
            grace_secs: 1,
            settle_ms: 100,
            socket_timeout_secs: 1,
            command_timeout_secs: 1,
        }
    }

    #[test]
    fn test_render_args() {
        let dir = TempDir::new().unwrap();
        let mut s = settings(&dir, "gpsd", &[]);
        s.args = vec!["-N".into(), "-F".into(), "{socket}".into(), "{device}".into()];
        let manager = GpsdManager::new(s);

        let args = manager.render_args(Path::new("/dev/ttyUSB0"));
        assert_eq!(args[0], "-N");
        assert_eq!(args[2], manager.control_socket().to_string_lossy());
        assert_eq!(manager.control_socket(), dir.path().join("gpsd.sock"));
        assert_eq!(args[3], "/dev/ttyUSB0");
    }

    #[tokio::test]
    async fn test_bind_ids_continue_from_seed() {
        let dir = TempDir::new().unwrap();
        let device = dir.path().join("ttyUSB0");
        fs::write(&device, b"").unwrap();
        let mut manager = GpsdManager::new(settings(&dir, "sh", &["-c", "exit 1", "{device}"]))
            .with_first_bind_id(7);
        assert_eq!(manager.next_bind_id(), 7);

        // A failed bind still consumes its id
        manager.bind(&device).await.unwrap_err();
        assert_eq!(manager.next_bind_id(), 8);

        let fresh = GpsdManager::new(settings(&dir, "gpsd", &[])).with_first_bind_id(0);
        assert_eq!(fresh.next_bind_id(), 1);
    }

    #[test]
    fn test_remove_stale_artifacts() {
        let dir = TempDir::new().unwrap();
        let s = settings(&dir, "gpsd", &["{device}"]);
        fs::write(&s.control_socket, b"").unwrap();
        fs::write(dir.path().join("gpsd.lock"), b"").unwrap();
        let manager = GpsdManager::new(s.clone());

        manager.remove_stale_artifacts().unwrap();
        assert!(!s.control_socket.exists());
        assert!(!dir.path().join("gpsd.lock").exists());
    }

    #[test]
    fn test_grant_access() {
        let dir = TempDir::new().unwrap();
        let device = dir.path().join("ttyUSB0");
        fs::write(&device, b"").unwrap();
        fs::set_permissions(&device, fs::Permissions::from_mode(0o600)).unwrap();
        let manager = GpsdManager::new(settings(&dir, "gpsd", &["{device}"]));

        manager.grant_access(&device).unwrap();
        let mode = fs::metadata(&device).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o666);

        let missing = manager.grant_access(&dir.path().join("ttyUSB9"));
        assert_eq!(missing.unwrap_err().stage, BindStage::Permission);
    }

    #[tokio::test]
    async fn test_bind_fails_at_start_when_daemon_exits() {
        let dir = TempDir::new().unwrap();
        let device = dir.path().join("ttyUSB0");
        fs::write(&device, b"").unwrap();
        let mut manager = GpsdManager::new(settings(&dir, "sh", &["-c", "exit 1", "{device}"]));

        let err = manager.bind(&device).await.unwrap_err();
        assert_eq!(err.stage, BindStage::Start);
    }

    #[tokio::test]
    async fn test_bind_fails_at_start_when_program_missing() {
        let dir = TempDir::new().unwrap();
        let device = dir.path().join("ttyUSB0");
        fs::write(&device, b"").unwrap();
        let mut manager =
            GpsdManager::new(settings(&dir, "/nonexistent/gpsd", &["{device}"]));

        let err = manager.bind(&device).await.unwrap_err();
        assert_eq!(err.stage, BindStage::Start);
    }

    #[tokio::test]
    async fn test_bind_fails_liveness_without_socket() {
        let dir = TempDir::new().unwrap();
        let device = dir.path().join("ttyUSB0");
        fs::write(&device, b"").unwrap();
        // sleep stays alive but never creates the control socket
        let mut manager = GpsdManager::new(settings(&dir, "sh", &["-c", "exec sleep 30", "{device}"]));

        let err = manager.bind(&device).await.unwrap_err();
        assert_eq!(err.stage, BindStage::Liveness);
        assert!(manager.is_running());

        manager.stop().await.unwrap();
        assert!(!manager.is_running());
        assert!(manager.managed_pid().is_none());
    }
}
