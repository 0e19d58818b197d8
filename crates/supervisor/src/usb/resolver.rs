//! USB descriptor resolution through sysfs
//!
//! A tty node such as `/dev/ttyUSB0` has a sysfs entry whose `device` link
//! points at the usb-serial port. The vendor/product ids live on the USB
//! device (`idVendor`/`idProduct`) a couple of directories above that port:
//!
//! ```text
//! /sys/devices/.../usb1/1-1             <- idVendor, idProduct (depth 2)
//! /sys/devices/.../usb1/1-1/1-1:1.0     <- interface (depth 1)
//! /sys/devices/.../1-1:1.0/ttyUSB0      <- usb-serial port (depth 0)
//! /sys/class/tty/ttyUSB0/device         -> the port above
//! ```

use common::UsbDescriptor;
use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Resolve a device node to the USB descriptor behind it.
///
/// `None` means "not USB-backed" or "metadata unavailable". Neither is an
/// error for callers, they simply move on to the next candidate.
pub trait DescriptorResolver {
    fn resolve(&self, device: &Path) -> Option<UsbDescriptor>;
}

/// Resolver that walks the kernel device model exposed under sysfs.
#[derive(Debug, Clone)]
pub struct SysfsResolver {
    root: PathBuf,
    max_depth: usize,
}

impl SysfsResolver {
    pub fn new(root: impl Into<PathBuf>, max_depth: usize) -> Self {
        Self {
            root: root.into(),
            max_depth,
        }
    }

    /// Canonical target of the node's `device` link; the walk starts here.
    ///
    /// Character devices are looked up by number under `dev/char`, which also
    /// works for udev aliases such as `/dev/serial/by-id/...`. Anything else
    /// falls back to `class/tty/<node name>`. Nodes without a `device` link
    /// (virtual terminals, pseudo ttys) have no hardware behind them.
    fn device_entry(&self, device: &Path) -> Option<PathBuf> {
        if let Ok(meta) = fs::metadata(device) {
            if meta.file_type().is_char_device() {
                let rdev = meta.rdev();
                let entry = self.root.join("dev").join("char").join(format!(
                    "{}:{}",
                    nix::sys::stat::major(rdev),
                    nix::sys::stat::minor(rdev)
                ));
                if let Ok(path) = fs::canonicalize(entry.join("device")) {
                    return Some(path);
                }
            }
        }

        let name = device.file_name()?;
        fs::canonicalize(self.root.join("class").join("tty").join(name).join("device")).ok()
    }

    /// Walk upward from `start` looking for a directory with both id attributes.
    fn walk(&self, start: &Path) -> Option<UsbDescriptor> {
        let root = fs::canonicalize(&self.root).unwrap_or_else(|_| self.root.clone());
        let mut current = start.to_path_buf();

        for depth in 0..=self.max_depth {
            if current == root || !current.starts_with(&root) {
                trace!("Descriptor walk left sysfs at {}", current.display());
                return None;
            }

            if let Some(descriptor) = read_descriptor(&current) {
                debug!(
                    "Found USB descriptor {} at {} (depth {})",
                    descriptor,
                    current.display(),
                    depth
                );
                return Some(descriptor);
            }

            current = current.parent()?.to_path_buf();
        }

        trace!(
            "Descriptor walk from {} exhausted depth budget {}",
            start.display(),
            self.max_depth
        );
        None
    }
}

impl DescriptorResolver for SysfsResolver {
    fn resolve(&self, device: &Path) -> Option<UsbDescriptor> {
        let Some(entry) = self.device_entry(device) else {
            debug!("No sysfs entry for {}", device.display());
            return None;
        };
        self.walk(&entry)
    }
}

fn read_descriptor(dir: &Path) -> Option<UsbDescriptor> {
    let vendor = fs::read_to_string(dir.join("idVendor")).ok()?;
    let product = fs::read_to_string(dir.join("idProduct")).ok()?;

    match UsbDescriptor::from_hex(&vendor, &product) {
        Ok(descriptor) => Some(descriptor),
        Err(e) => {
            debug!("Ignoring unreadable ids in {}: {}", dir.display(), e);
            None
        }
    }
}
