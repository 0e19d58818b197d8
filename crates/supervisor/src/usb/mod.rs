//! USB device identification
//!
//! Maps serial device nodes to the USB descriptor of the hardware behind
//! them, and picks the node that carries the configured target signature:
//! - Descriptor resolution by walking the sysfs device hierarchy
//! - Candidate enumeration over a configured node range
//! - First-match location with an explicit fallback policy
//! - Diagnostic listing of attached USB devices via libusb

pub mod listing;
pub mod locator;
pub mod resolver;

pub use listing::{UsbDeviceSummary, list_usb_devices};
pub use locator::{DeviceLocator, FallbackPolicy, LocateOutcome, ScanRange};
pub use resolver::{DescriptorResolver, SysfsResolver};
