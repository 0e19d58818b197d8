//! GPS receiver acquisition and self-healing supervision
//!
//! Finds the USB GPS receiver by its vendor/product signature, binds a single
//! gpsd instance to it, verifies that sentences actually flow, and keeps
//! watching so a silent receiver is reset without operator involvement.

pub mod acquisition;
pub mod config;
pub mod daemon;
pub mod handoff;
pub mod probe;
pub mod service;
pub mod shutdown;
pub mod usb;
pub mod watchdog;

pub use acquisition::{AcquisitionController, AcquisitionError, AcquisitionState, RetryPolicy};
pub use config::SupervisorConfig;
pub use daemon::{DaemonControl, DaemonHandle, GpsdManager};
pub use probe::{DataFlowProbe, GpsdProbe};
pub use watchdog::{Decision, Observation, Watchdog};
