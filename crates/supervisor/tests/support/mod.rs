//! Fakes and fixtures shared by the integration tests

#![allow(dead_code)]

use common::{UsbDescriptor, test_utils::garmin_descriptor};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use supervisor::acquisition::{AcquisitionController, RetryPolicy};
use supervisor::daemon::{BindFailure, DaemonControl, DaemonHandle};
use supervisor::probe::{DataFlowProbe, FlowSample, ProbeError};
use supervisor::usb::{DescriptorResolver, DeviceLocator, FallbackPolicy, ScanRange};
use tempfile::TempDir;

/// Resolver answering from a fixed path → descriptor table
#[derive(Debug, Default, Clone)]
pub struct MapResolver {
    table: HashMap<PathBuf, UsbDescriptor>,
}

impl MapResolver {
    pub fn insert(&mut self, path: impl Into<PathBuf>, descriptor: UsbDescriptor) {
        self.table.insert(path.into(), descriptor);
    }
}

impl DescriptorResolver for MapResolver {
    fn resolve(&self, device: &Path) -> Option<UsbDescriptor> {
        self.table.get(device).copied()
    }
}

/// A temporary `/dev`-like directory holding plain files as device nodes
pub struct DeviceDir {
    pub dir: TempDir,
    pub resolver: MapResolver,
}

impl DeviceDir {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            resolver: MapResolver::default(),
        }
    }

    pub fn prefix(&self) -> String {
        format!("{}/ttyUSB", self.dir.path().display())
    }

    pub fn node(&self, index: u32) -> PathBuf {
        PathBuf::from(format!("{}{}", self.prefix(), index))
    }

    /// Create `ttyUSB<index>`, optionally backed by a USB descriptor
    pub fn add(&mut self, index: u32, descriptor: Option<UsbDescriptor>) -> PathBuf {
        let path = self.node(index);
        fs::write(&path, b"").unwrap();
        if let Some(descriptor) = descriptor {
            self.resolver.insert(path.clone(), descriptor);
        }
        path
    }

    pub fn add_target(&mut self, index: u32) -> PathBuf {
        self.add(index, Some(garmin_descriptor()))
    }

    pub fn remove(&self, index: u32) {
        fs::remove_file(self.node(index)).unwrap();
    }

    pub fn locator(&self, fallback: FallbackPolicy) -> DeviceLocator<MapResolver> {
        DeviceLocator::new(
            self.resolver.clone(),
            ScanRange::new(self.prefix(), 0, 9),
            fallback,
        )
    }
}

/// Daemon double with scripted bind results; every bind replaces the
/// previous instance
#[derive(Debug, Default)]
pub struct FakeDaemon {
    script: VecDeque<Result<(), BindFailure>>,
    next_bind_id: u64,
    running: bool,
    pub binds: Vec<PathBuf>,
    pub stops: u32,
}

impl FakeDaemon {
    /// Every bind succeeds unless scripted otherwise
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted(script: Vec<Result<(), BindFailure>>) -> Self {
        Self {
            script: script.into(),
            ..Self::default()
        }
    }
}

impl DaemonControl for FakeDaemon {
    async fn bind(&mut self, device: &Path) -> Result<DaemonHandle, BindFailure> {
        self.next_bind_id += 1;
        self.binds.push(device.to_path_buf());
        self.running = false;

        self.script.pop_front().unwrap_or(Ok(()))?;
        self.running = true;

        Ok(DaemonHandle {
            pid: 1000 + self.next_bind_id as u32,
            control_socket: PathBuf::from("/tmp/fake-gpsd.sock"),
            device: device.to_path_buf(),
            bind_id: self.next_bind_id,
        })
    }

    async fn stop(&mut self) -> Result<(), BindFailure> {
        self.stops += 1;
        self.running = false;
        Ok(())
    }

    fn is_running(&mut self) -> bool {
        self.running
    }
}

/// Probe double returning scripted flow results, then `fallback`
#[derive(Debug)]
pub struct FakeProbe {
    script: Mutex<VecDeque<bool>>,
    fallback: bool,
    calls: Mutex<u32>,
}

impl FakeProbe {
    pub fn flowing() -> Self {
        Self::scripted(Vec::new(), true)
    }

    pub fn silent() -> Self {
        Self::scripted(Vec::new(), false)
    }

    pub fn scripted(script: Vec<bool>, fallback: bool) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: Mutex::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

impl DataFlowProbe for FakeProbe {
    async fn observe(&self, _window: Duration) -> Result<FlowSample, ProbeError> {
        *self.calls.lock().unwrap() += 1;
        let flowing = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);
        Ok(FlowSample {
            sentences: if flowing { 5 } else { 0 },
            bytes: if flowing { 350 } else { 0 },
            required: 1,
        })
    }
}

/// Retry policy without waits
pub fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, Duration::ZERO, Duration::ZERO)
}

pub type FakeController = AcquisitionController<MapResolver, FakeDaemon, FakeProbe>;

pub fn controller(
    devices: &DeviceDir,
    daemon: FakeDaemon,
    probe: FakeProbe,
    max_attempts: u32,
) -> FakeController {
    AcquisitionController::new(
        devices.locator(FallbackPolicy::Strict),
        daemon,
        probe,
        fast_policy(max_attempts),
        Duration::from_millis(10),
    )
}
