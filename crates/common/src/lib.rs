//! Common utilities for gps-supervisor
//!
//! Shared between the supervisor library and its binary: the USB descriptor
//! and signature types, error handling, logging setup, and a small NMEA
//! sentence check used by the data-flow probe.

pub mod error;
pub mod logging;
pub mod nmea;
pub mod test_utils;
pub mod usb_types;

pub use error::{Error, Result};
pub use logging::setup_logging;
pub use usb_types::{CandidateDevice, TargetSignature, UsbDescriptor};
