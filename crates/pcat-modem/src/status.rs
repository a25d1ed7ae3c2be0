//! Shared modem status.
//!
//! Written from the worker thread (device type) and from the event loop
//! (parser, watchdog), so every access goes through one mutex. Callers never
//! hold the lock across a blocking call: [`StatusHandle::update`] runs a
//! short closure and returns.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use pcat_common::models::{DeviceType, ModemMode, ModemStatusSnapshot};

#[derive(Debug, Clone)]
pub struct ModemStatus {
    pub mode: ModemMode,
    pub sim_state: i32,
    /// `true` when the radio is blocked.
    pub rfkill_state: bool,
    signal_strength: u8,
    pub isp_name: Option<String>,
    pub isp_plmn: Option<String>,
    /// A 5G attach was seen since the last radio reset.
    pub have_5g_connected: bool,
    /// Last 5G attach or fall-back from 5G.
    pub last_5g_timestamp: Instant,
    pub device_type: DeviceType,
}

impl ModemStatus {
    pub fn new(now: Instant) -> Self {
        Self {
            mode: ModemMode::None,
            sim_state: 0,
            rfkill_state: false,
            signal_strength: 0,
            isp_name: None,
            isp_plmn: None,
            have_5g_connected: false,
            last_5g_timestamp: now,
            device_type: DeviceType::None,
        }
    }

    pub fn signal_strength(&self) -> u8 {
        self.signal_strength
    }

    /// Store a signal strength, clamped to 0–100.
    pub fn set_signal_strength(&mut self, value: i32) {
        self.signal_strength = value.clamp(0, 100) as u8;
    }

    pub fn snapshot(&self) -> ModemStatusSnapshot {
        ModemStatusSnapshot {
            mode: self.mode,
            sim_state: self.sim_state,
            rfkill_state: self.rfkill_state,
            signal_strength: self.signal_strength,
            isp_name: self.isp_name.clone(),
            isp_plmn: self.isp_plmn.clone(),
            device_type: self.device_type,
        }
    }
}

impl Default for ModemStatus {
    fn default() -> Self {
        Self::new(Instant::now())
    }
}

/// Cloneable, thread-safe handle to the shared [`ModemStatus`].
#[derive(Debug, Clone, Default)]
pub struct StatusHandle {
    inner: Arc<Mutex<ModemStatus>>,
}

impl StatusHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the externally visible fields.
    pub fn snapshot(&self) -> ModemStatusSnapshot {
        self.update(|s| s.snapshot())
    }

    /// Run `f` with the status locked.
    pub fn update<R>(&self, f: impl FnOnce(&mut ModemStatus) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn set_device_type(&self, device_type: DeviceType) {
        self.update(|s| s.device_type = device_type);
    }
}
