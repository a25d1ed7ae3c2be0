//! In-memory stand-ins for the hardware and host capabilities, used by the
//! unit and integration tests to drive the controller without a modem.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::error::{ModemError, Result};
use crate::gpio::{GpioBackend, OutputLine};
use crate::host::HostControl;
use crate::usb::{UsbBus, UsbDeviceId};

// ── GPIO ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct FakeLineState {
    history: Vec<u8>,
    requests: usize,
    released: bool,
}

#[derive(Debug, Default)]
struct FakeGpioState {
    lines: HashMap<(String, u32), FakeLineState>,
    failing_chips: HashSet<String>,
}

/// Records every level written to every line. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct FakeGpio {
    state: Arc<Mutex<FakeGpioState>>,
}

impl FakeGpio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every request on `chip` fail as if the chip could not be opened.
    pub fn fail_chip(&self, chip: &str) {
        self.lock().failing_chips.insert(chip.to_string());
    }

    /// Last level written to the line, if it was ever requested.
    pub fn value(&self, chip: &str, line: u32) -> Option<u8> {
        self.lock()
            .lines
            .get(&(chip.to_string(), line))
            .and_then(|l| l.history.last().copied())
    }

    /// Every level written to the line, starting with the requested one.
    pub fn history(&self, chip: &str, line: u32) -> Vec<u8> {
        self.lock()
            .lines
            .get(&(chip.to_string(), line))
            .map(|l| l.history.clone())
            .unwrap_or_default()
    }

    pub fn request_count(&self, chip: &str, line: u32) -> usize {
        self.lock()
            .lines
            .get(&(chip.to_string(), line))
            .map_or(0, |l| l.requests)
    }

    pub fn total_requests(&self) -> usize {
        self.lock().lines.values().map(|l| l.requests).sum()
    }

    pub fn is_released(&self, chip: &str, line: u32) -> bool {
        self.lock()
            .lines
            .get(&(chip.to_string(), line))
            .is_some_and(|l| l.released)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeGpioState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl GpioBackend for FakeGpio {
    fn request_output(
        &mut self,
        chip: &str,
        line: u32,
        _consumer: &str,
        value: u8,
    ) -> Result<Box<dyn OutputLine>> {
        let mut state = self.lock();
        if state.failing_chips.contains(chip) {
            return Err(ModemError::Gpio {
                chip: chip.to_string(),
                line,
                reason: "no such chip".into(),
            });
        }
        let entry = state.lines.entry((chip.to_string(), line)).or_default();
        entry.requests += 1;
        entry.released = false;
        entry.history.push(value);
        Ok(Box::new(FakeLine {
            key: (chip.to_string(), line),
            state: self.state.clone(),
        }))
    }
}

struct FakeLine {
    key: (String, u32),
    state: Arc<Mutex<FakeGpioState>>,
}

impl OutputLine for FakeLine {
    fn set_value(&mut self, value: u8) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(line) = state.lines.get_mut(&self.key) {
            line.history.push(value);
        }
        Ok(())
    }
}

impl Drop for FakeLine {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(line) = state.lines.get_mut(&self.key) {
            line.released = true;
        }
    }
}

// ── USB ─────────────────────────────────────────────────────────────

/// A USB bus whose device list is set by the test.
#[derive(Debug, Clone, Default)]
pub struct FakeUsb {
    devices: Arc<Mutex<Option<Vec<UsbDeviceId>>>>,
}

impl FakeUsb {
    pub fn new(devices: Vec<UsbDeviceId>) -> Self {
        Self {
            devices: Arc::new(Mutex::new(Some(devices))),
        }
    }

    pub fn set_devices(&self, devices: Vec<UsbDeviceId>) {
        *self.devices.lock().unwrap_or_else(|e| e.into_inner()) = Some(devices);
    }

    /// Make listing fail until devices are set again.
    pub fn fail_listing(&self) {
        *self.devices.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

impl UsbBus for FakeUsb {
    fn list_devices(&self) -> Result<Vec<UsbDeviceId>> {
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| ModemError::Usb("listing unavailable".into()))
    }
}

/// Shorthand for a device id on bus 1 with an unknown port path.
pub fn usb_device(vendor_id: u16, product_id: u16) -> UsbDeviceId {
    UsbDeviceId {
        vendor_id,
        product_id,
        bus_number: 1,
        device_address: 2,
        port_chain: Vec::new(),
    }
}

// ── Host ────────────────────────────────────────────────────────────

/// A host command invocation recorded by [`FakeHost`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCall {
    RadioBlocked(bool),
    BuiltinManagement(bool),
}

#[derive(Debug, Clone, Default)]
pub struct FakeHost {
    calls: Arc<Mutex<Vec<HostCall>>>,
    native_manager: Arc<Mutex<bool>>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_native_manager(&self, present: bool) {
        *self.native_manager.lock().unwrap_or_else(|e| e.into_inner()) = present;
    }

    fn record(&self, call: HostCall) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(call);
    }
}

impl HostControl for FakeHost {
    fn set_radio_blocked(&self, blocked: bool) -> Result<()> {
        self.record(HostCall::RadioBlocked(blocked));
        Ok(())
    }

    fn set_builtin_management(&self, enabled: bool) -> Result<()> {
        self.record(HostCall::BuiltinManagement(enabled));
        Ok(())
    }

    fn native_manager_present(&self) -> bool {
        *self.native_manager.lock().unwrap_or_else(|e| e.into_inner())
    }
}
