//! Location daemon lifecycle
//!
//! The supervisor owns exactly one gpsd instance. Every bind stops whatever
//! instance came before it, so at most one daemon is ever attached to the
//! well-known control socket.

pub mod lifecycle;
pub mod process;

pub use lifecycle::GpsdManager;

use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// A daemon instance started by one successful bind.
///
/// Other components keep it by value; the underlying process stays owned by
/// the lifecycle manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonHandle {
    pub pid: u32,
    pub control_socket: PathBuf,
    pub device: PathBuf,
    /// Strictly increasing per manager; never shared by two binds
    pub bind_id: u64,
}

impl fmt::Display for DaemonHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bind #{} pid {} on {} (socket {})",
            self.bind_id,
            self.pid,
            self.device.display(),
            self.control_socket.display()
        )
    }
}

/// Step of the bind sequence that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindStage {
    Quiesce,
    Permission,
    Start,
    Liveness,
}

impl fmt::Display for BindStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindStage::Quiesce => write!(f, "quiesce"),
            BindStage::Permission => write!(f, "permission"),
            BindStage::Start => write!(f, "start"),
            BindStage::Liveness => write!(f, "liveness"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("bind failed at {stage} stage: {reason}")]
pub struct BindFailure {
    pub stage: BindStage,
    pub reason: String,
}

impl BindFailure {
    pub fn new(stage: BindStage, reason: impl Into<String>) -> Self {
        Self {
            stage,
            reason: reason.into(),
        }
    }
}

/// Start/stop control over the single managed daemon.
#[allow(async_fn_in_trait)]
pub trait DaemonControl {
    /// Quiesce, fix permissions, start and verify a daemon on `device`
    async fn bind(&mut self, device: &Path) -> Result<DaemonHandle, BindFailure>;

    /// Stop the managed daemon, if any
    async fn stop(&mut self) -> Result<(), BindFailure>;

    /// Whether the managed daemon process is currently running
    fn is_running(&mut self) -> bool;
}
