//! Device hand-off file
//!
//! Downstream consumers (the telemetry forwarder and its unit files) learn
//! the acquired device from a small environment file. The file is replaced
//! atomically, so a reader sees either the previous binding or the new one.

use crate::daemon::DaemonHandle;
use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone)]
pub struct HandoffPublisher {
    path: PathBuf,
}

impl HandoffPublisher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Publish a verified or unverified binding
    pub fn publish(&self, handle: &DaemonHandle, verified: bool) -> Result<()> {
        let content = render(handle, verified);

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let staging = self.staging_path();
        {
            let mut file = fs::File::create(&staging)
                .with_context(|| format!("Failed to create {}", staging.display()))?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&staging, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        info!(
            "Published {} to {}",
            handle.device.display(),
            self.path.display()
        );
        Ok(())
    }

    /// Bind id of the binding currently on disk, if the file is readable
    pub fn last_bind_id(&self) -> Option<u64> {
        let content = fs::read_to_string(&self.path).ok()?;
        content
            .lines()
            .find_map(|line| line.strip_prefix("GPS_BIND_ID="))
            .and_then(|id| id.trim().parse().ok())
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "device.env".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

fn render(handle: &DaemonHandle, verified: bool) -> String {
    format!(
        "GPS_DEVICE={}\nGPS_DEVICE_VERIFIED={}\nGPSD_SOCKET={}\nGPSD_PID={}\nGPS_BIND_ID={}\n",
        handle.device.display(),
        u8::from(verified),
        handle.control_socket.display(),
        handle.pid,
        handle.bind_id
    )
}
