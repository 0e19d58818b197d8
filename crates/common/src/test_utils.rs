//! Test utilities for gps-supervisor
//!
//! Helpers shared by unit and integration tests across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{garmin_descriptor, nmea_burst};
//!
//! # fn main() {
//! assert_eq!(garmin_descriptor().to_string(), "091e:0003");
//! assert_eq!(nmea_burst(3).lines().count(), 3);
//! # }
//! ```

use crate::nmea;
use crate::usb_types::{TargetSignature, UsbDescriptor};
use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// The Garmin USB GPS descriptor used as the reference target
pub fn garmin_descriptor() -> UsbDescriptor {
    UsbDescriptor::new(0x091e, 0x0003)
}

/// Signature accepting only [`garmin_descriptor`]
pub fn garmin_signature() -> TargetSignature {
    TargetSignature::single(garmin_descriptor())
}

/// A descriptor that never matches the reference target (FTDI serial adapter)
pub fn other_descriptor() -> UsbDescriptor {
    UsbDescriptor::new(0x0403, 0x6001)
}

/// `count` newline-terminated NMEA sentences with valid checksums
pub fn nmea_burst(count: usize) -> String {
    (0..count)
        .map(|i| {
            let body = format!("GPGGA,1235{:02},4807.038,N,01131.000,E,1,08,0.9,545.4,M,,M,,", i % 60);
            format!("{}\r\n", nmea::with_checksum(&body))
        })
        .collect()
}

/// Run a future with a timeout, panicking if it does not complete in time
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> T
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .expect("Test timed out")
}
