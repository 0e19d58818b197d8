//! USB identity types shared by the resolver, locator and configuration

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::{Error, Result};

/// Vendor/product identifier pair of a USB device class.
///
/// Both halves are 16-bit values. They are parsed from and rendered as
/// lowercase 4-digit hex, the form sysfs exposes in `idVendor`/`idProduct`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsbDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl UsbDescriptor {
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }

    /// Parse a descriptor from separate vendor and product hex strings.
    ///
    /// Accepts an optional `0x` prefix and surrounding whitespace (sysfs
    /// attribute files end with a newline).
    pub fn from_hex(vendor: &str, product: &str) -> Result<Self> {
        Ok(Self {
            vendor_id: parse_hex_id(vendor, "vendor id")?,
            product_id: parse_hex_id(product, "product id")?,
        })
    }

    pub fn vendor_hex(&self) -> String {
        format!("{:04x}", self.vendor_id)
    }

    pub fn product_hex(&self) -> String {
        format!("{:04x}", self.product_id)
    }
}

impl fmt::Display for UsbDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

impl FromStr for UsbDescriptor {
    type Err = Error;

    /// Parse the `vvvv:pppp` form used by `lsusb`
    fn from_str(s: &str) -> Result<Self> {
        let (vendor, product) = s
            .split_once(':')
            .ok_or_else(|| Error::Descriptor(format!("'{}' is not in VID:PID form", s)))?;
        Self::from_hex(vendor, product)
    }
}

fn parse_hex_id(raw: &str, what: &str) -> Result<u16> {
    let trimmed = raw.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if digits.is_empty() || digits.len() > 4 {
        return Err(Error::Descriptor(format!(
            "{} '{}' must be 1-4 hex digits",
            what, raw
        )));
    }

    u16::from_str_radix(digits, 16)
        .map_err(|_| Error::Descriptor(format!("{} '{}' is not valid hex", what, raw)))
}

/// The descriptors the supervisor is permitted to bind to.
///
/// Deployments configure exactly one descriptor. Matching is defined over the
/// whole set so a wider signature needs no change to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSignature {
    accepted: Vec<UsbDescriptor>,
}

impl TargetSignature {
    pub fn single(descriptor: UsbDescriptor) -> Self {
        Self {
            accepted: vec![descriptor],
        }
    }

    /// Build a signature from several descriptors. Returns `None` when empty.
    pub fn any_of(descriptors: impl IntoIterator<Item = UsbDescriptor>) -> Option<Self> {
        let mut accepted: Vec<UsbDescriptor> = Vec::new();
        for descriptor in descriptors {
            if !accepted.contains(&descriptor) {
                accepted.push(descriptor);
            }
        }
        (!accepted.is_empty()).then_some(Self { accepted })
    }

    pub fn matches(&self, descriptor: &UsbDescriptor) -> bool {
        self.accepted.iter().any(|d| d == descriptor)
    }

    pub fn descriptors(&self) -> &[UsbDescriptor] {
        &self.accepted
    }
}

impl fmt::Display for TargetSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, descriptor) in self.accepted.iter().enumerate() {
            if i > 0 {
                write!(f, "|")?;
            }
            write!(f, "{}", descriptor)?;
        }
        Ok(())
    }
}

/// A device node considered during one locate pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateDevice {
    pub path: PathBuf,
    /// Numeric suffix of the node name (`3` for `/dev/ttyUSB3`)
    pub index: u32,
}

impl CandidateDevice {
    pub fn new(path: impl Into<PathBuf>, index: u32) -> Self {
        Self {
            path: path.into(),
            index,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for CandidateDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reference_descriptor() {
        let desc = UsbDescriptor::from_hex("091e", "0003").unwrap();
        assert_eq!(desc.vendor_id, 0x091e);
        assert_eq!(desc.product_id, 0x0003);
        assert_eq!(desc.to_string(), "091e:0003");
    }

    #[test]
    fn test_parse_sysfs_attribute_text() {
        let desc = UsbDescriptor::from_hex("091e\n", "0x0003\n").unwrap();
        assert_eq!(desc, UsbDescriptor::new(0x091e, 0x0003));
    }

    #[test]
    fn test_parse_rejects_bad_ids() {
        assert!(UsbDescriptor::from_hex("", "0003").is_err());
        assert!(UsbDescriptor::from_hex("12345", "0003").is_err());
        assert!(UsbDescriptor::from_hex("zz1e", "0003").is_err());
        assert!("091e".parse::<UsbDescriptor>().is_err());
    }

    #[test]
    fn test_from_str() {
        let desc: UsbDescriptor = "091E:0003".parse().unwrap();
        assert_eq!(desc.vendor_hex(), "091e");
        assert_eq!(desc.product_hex(), "0003");
    }

    #[test]
    fn test_signature_matching() {
        let garmin = UsbDescriptor::new(0x091e, 0x0003);
        let ftdi = UsbDescriptor::new(0x0403, 0x6001);

        let single = TargetSignature::single(garmin);
        assert!(single.matches(&garmin));
        assert!(!single.matches(&ftdi));

        let both = TargetSignature::any_of([garmin, ftdi, garmin]).unwrap();
        assert_eq!(both.descriptors().len(), 2);
        assert!(both.matches(&ftdi));
        assert_eq!(both.to_string(), "091e:0003|0403:6001");

        assert!(TargetSignature::any_of([]).is_none());
    }
}
