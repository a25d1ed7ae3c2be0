//! USB modem detection.
//!
//! Each scan lists the attached USB devices and matches them against a
//! vendor/product table. A match either names an external dial helper (the
//! built-in management path is switched off and the helper is started) or
//! leaves the modem to the built-in path.

use std::borrow::Cow;
use std::sync::Arc;

use pcat_common::models::DeviceType;

use crate::error::{ModemError, Result};
use crate::host::HostControl;
use crate::status::StatusHandle;

/// Identity of one attached USB device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDeviceId {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus_number: u8,
    pub device_address: u8,
    /// Hub port numbers from the root hub down; empty when unknown.
    pub port_chain: Vec<u8>,
}

impl std::fmt::Display for UsbDeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} (bus {}, device {}",
            self.vendor_id, self.product_id, self.bus_number, self.device_address
        )?;
        if let Some((first, rest)) = self.port_chain.split_first() {
            write!(f, ", path {first}")?;
            for port in rest {
                write!(f, ".{port}")?;
            }
        }
        f.write_str(")")
    }
}

/// USB enumeration capability.
pub trait UsbBus: Send {
    fn list_devices(&self) -> Result<Vec<UsbDeviceId>>;
}

/// [`UsbBus`] on the host's USB stack via `nusb`.
#[derive(Debug, Default)]
pub struct NusbBus;

impl UsbBus for NusbBus {
    fn list_devices(&self) -> Result<Vec<UsbDeviceId>> {
        let devices = nusb::list_devices().map_err(|e| ModemError::Usb(e.to_string()))?;
        Ok(devices
            .map(|d| UsbDeviceId {
                vendor_id: d.vendor_id(),
                product_id: d.product_id(),
                bus_number: d.bus_number(),
                device_address: d.device_address(),
                port_chain: d.port_chain().to_vec(),
            })
            .collect())
    }
}

// ── Device table ────────────────────────────────────────────────────

/// One row of the supported-device table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDeviceEntry {
    pub device_type: DeviceType,
    pub vendor_id: u16,
    /// `0` matches any product of the vendor.
    pub product_id: u16,
    /// Dial helper to run for this modem; `None` selects the built-in path.
    pub external_exec: Option<Cow<'static, str>>,
    /// The helper stays resident for the whole session.
    pub daemon: bool,
}

impl UsbDeviceEntry {
    pub fn matches(&self, id: &UsbDeviceId) -> bool {
        self.vendor_id == id.vendor_id && (self.product_id == 0 || self.product_id == id.product_id)
    }
}

const QUECTEL_VID: u16 = 0x2C7C;
const QUECTEL_CM: &str = "/usr/bin/quectel-CM";

/// Supported modems. Order matters: the first matching row wins.
pub const SUPPORTED_DEVICES: &[UsbDeviceEntry] = &[
    // RM500Q / RM502Q
    UsbDeviceEntry {
        device_type: DeviceType::Nr5g,
        vendor_id: QUECTEL_VID,
        product_id: 0x0800,
        external_exec: Some(Cow::Borrowed(QUECTEL_CM)),
        daemon: true,
    },
    // RM500U / RM520N
    UsbDeviceEntry {
        device_type: DeviceType::Nr5g,
        vendor_id: QUECTEL_VID,
        product_id: 0x0900,
        external_exec: Some(Cow::Borrowed(QUECTEL_CM)),
        daemon: true,
    },
    // EC25 / EG25
    UsbDeviceEntry {
        device_type: DeviceType::Lte,
        vendor_id: QUECTEL_VID,
        product_id: 0x0125,
        external_exec: Some(Cow::Borrowed(QUECTEL_CM)),
        daemon: true,
    },
    // Anything else from Quectel goes through the built-in path.
    UsbDeviceEntry {
        device_type: DeviceType::General,
        vendor_id: QUECTEL_VID,
        product_id: 0,
        external_exec: None,
        daemon: false,
    },
];

/// First table row matching `id`.
pub fn classify<'a>(table: &'a [UsbDeviceEntry], id: &UsbDeviceId) -> Option<&'a UsbDeviceEntry> {
    table.iter().find(|entry| entry.matches(id))
}

// ── Scanner ─────────────────────────────────────────────────────────

/// Starts the dial helper for a matched device.
pub trait HelperLauncher {
    /// Start the helper unless one is already running.
    fn run(&self, entry: &UsbDeviceEntry) -> Result<()>;
}

pub struct DeviceScanner {
    bus: Box<dyn UsbBus>,
    host: Arc<dyn HostControl>,
    table: Vec<UsbDeviceEntry>,
    status: StatusHandle,
    /// Last state pushed to the built-in management toggle.
    builtin_enabled: Option<bool>,
}

impl DeviceScanner {
    pub fn new(
        bus: Box<dyn UsbBus>,
        host: Arc<dyn HostControl>,
        table: Vec<UsbDeviceEntry>,
        status: StatusHandle,
    ) -> Self {
        Self {
            bus,
            host,
            table,
            status,
            builtin_enabled: None,
        }
    }

    /// One scan tick. Returns the resulting device type, or `None` when the
    /// scan was skipped or the device list was unavailable.
    pub fn scan(&mut self, launcher: &dyn HelperLauncher) -> Option<DeviceType> {
        if self.host.native_manager_present() {
            tracing::trace!("native modem manager present, skipping USB scan");
            return None;
        }

        let devices = match self.bus.list_devices() {
            Ok(devices) => devices,
            Err(e) => {
                tracing::debug!(error = %e, "USB device list unavailable");
                return None;
            }
        };

        let mut device_type = DeviceType::None;
        for id in &devices {
            tracing::trace!(device = %id, "USB device");

            let Some(entry) = classify(&self.table, id).cloned() else {
                continue;
            };
            device_type = entry.device_type;

            if entry.external_exec.is_some() {
                self.set_builtin(false);
                if let Err(e) = launcher.run(&entry) {
                    tracing::warn!(device = %id, error = %e, "failed to start modem dial helper");
                }
            } else {
                self.set_builtin(true);
            }
        }

        self.status.set_device_type(device_type);
        Some(device_type)
    }

    fn set_builtin(&mut self, enabled: bool) {
        if self.builtin_enabled == Some(enabled) {
            return;
        }
        match self.host.set_builtin_management(enabled) {
            Ok(()) => {
                tracing::info!(enabled, "built-in modem management toggled");
                self.builtin_enabled = Some(enabled);
            }
            Err(e) => tracing::warn!(enabled, error = %e, "failed to toggle built-in modem management"),
        }
    }
}
