//! Attached USB device listing for operator diagnostics

use common::UsbDescriptor;
use rusb::UsbContext;
use std::time::Duration;
use tracing::debug;

const STRING_READ_TIMEOUT: Duration = Duration::from_millis(200);

/// One attached USB device as libusb sees it
#[derive(Debug, Clone)]
pub struct UsbDeviceSummary {
    pub bus_number: u8,
    pub address: u8,
    pub descriptor: UsbDescriptor,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

/// Enumerate every USB device on the host.
///
/// String descriptors need the device opened; when that is not permitted the
/// summary simply carries no names.
pub fn list_usb_devices() -> Result<Vec<UsbDeviceSummary>, rusb::Error> {
    let context = rusb::Context::new()?;
    let mut summaries = Vec::new();

    for device in context.devices()?.iter() {
        let desc = match device.device_descriptor() {
            Ok(desc) => desc,
            Err(e) => {
                debug!(
                    "Skipping bus {:03} device {:03}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                );
                continue;
            }
        };

        let (manufacturer, product) = match device.open() {
            Ok(handle) => {
                let language = handle
                    .read_languages(STRING_READ_TIMEOUT)
                    .ok()
                    .and_then(|langs| langs.first().copied());
                match language {
                    Some(lang) => (
                        handle
                            .read_manufacturer_string(lang, &desc, STRING_READ_TIMEOUT)
                            .ok(),
                        handle
                            .read_product_string(lang, &desc, STRING_READ_TIMEOUT)
                            .ok(),
                    ),
                    None => (None, None),
                }
            }
            Err(_) => (None, None),
        };

        summaries.push(UsbDeviceSummary {
            bus_number: device.bus_number(),
            address: device.address(),
            descriptor: UsbDescriptor::new(desc.vendor_id(), desc.product_id()),
            manufacturer,
            product,
        });
    }

    summaries.sort_by_key(|s| (s.bus_number, s.address));
    Ok(summaries)
}
