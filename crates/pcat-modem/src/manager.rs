//! Modem lifecycle manager.
//!
//! Owns the worker thread that powers the modem up and then scans USB at a
//! fixed cadence, the dial helper supervisor, and the rfkill watchdog task.
//!
//! ```text
//!   NONE ── power sequence ok ──▶ READY ──▶ scan every 10 ticks
//!    │                                          │
//!    └─ failure: wait 20 ticks, retry           └─ until shutdown
//! ```
//!
//! With `retry_on_failure` disabled a failed power sequence moves to READY
//! after one attempt.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use pcat_common::config::{ModemConfig, PowerTiming};
use pcat_common::models::ModemStatusSnapshot;
use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::error::{ModemError, Result};
use crate::gpio::{CdevGpio, GpioBackend, SharedLine};
use crate::host::{CommandHost, HostControl};
use crate::power::PowerSequencer;
use crate::status::StatusHandle;
use crate::supervisor::{ProcessSupervisor, DEBUG_LOG_PATH};
use crate::usb::{DeviceScanner, NusbBus, UsbBus, UsbDeviceEntry, SUPPORTED_DEVICES};
use crate::watchdog::{RadioSwitch, RfkillWatchdog};

/// Ticks to wait before retrying a failed power sequence (2 s).
pub const RETRY_BACKOFF_TICKS: u32 = 20;
/// Ticks between USB scans in READY (1 s).
pub const SCAN_INTERVAL_TICKS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// Modem not powered yet.
    None,
    /// Powered; scanning for the USB device.
    Ready,
}

/// Hardware and host capabilities the manager runs on.
pub struct Backends {
    pub gpio: Box<dyn GpioBackend>,
    pub usb: Box<dyn UsbBus>,
    pub host: Arc<dyn HostControl>,
    pub device_table: Vec<UsbDeviceEntry>,
}

impl Backends {
    /// GPIO character devices, `nusb` and host commands from `config`.
    pub fn system(config: &ModemConfig) -> Self {
        Self {
            gpio: Box::new(CdevGpio::new()),
            usb: Box::new(NusbBus),
            host: Arc::new(CommandHost::new(config.host.clone())),
            device_table: SUPPORTED_DEVICES.to_vec(),
        }
    }
}

struct Running {
    flag: Arc<AtomicBool>,
    worker: thread::JoinHandle<()>,
    watchdog_stop: watch::Sender<bool>,
    radio: RadioSwitch,
}

pub struct ModemManager {
    config: ModemConfig,
    status: StatusHandle,
    state: Arc<Mutex<ManagerState>>,
    running: Option<Running>,
}

impl ModemManager {
    pub fn new(config: ModemConfig) -> Self {
        Self {
            config,
            status: StatusHandle::new(),
            state: Arc::new(Mutex::new(ManagerState::None)),
            running: None,
        }
    }

    /// Start the worker thread and the watchdog. `runtime` is the
    /// single-threaded event loop that watches the dial helper and runs the
    /// watchdog; it must be driven by the caller. Starting twice is a no-op.
    pub fn start(&mut self, backends: Backends, runtime: Handle) -> Result<()> {
        if self.running.is_some() {
            tracing::info!("modem manager already running");
            return Ok(());
        }

        let Backends {
            gpio,
            usb,
            host,
            device_table,
        } = backends;

        let rfkill_line: SharedLine = Arc::new(Mutex::new(None));
        let power = PowerSequencer::new(
            gpio,
            self.config.gpio.clone(),
            self.config.power.clone(),
            Arc::clone(&rfkill_line),
        );
        let scanner = DeviceScanner::new(usb, Arc::clone(&host), device_table, self.status.clone());
        let debug_log = self
            .config
            .debug_helper_output_log
            .then(|| PathBuf::from(DEBUG_LOG_PATH));
        let supervisor = ProcessSupervisor::new(
            runtime.clone(),
            self.config.dial.clone(),
            self.status.clone(),
            debug_log,
        );

        *self.lock_state() = ManagerState::None;
        let flag = Arc::new(AtomicBool::new(true));
        let worker = {
            let ctx = Worker {
                power,
                scanner,
                supervisor,
                timing: self.config.power.clone(),
                running: Arc::clone(&flag),
                state: Arc::clone(&self.state),
            };
            thread::Builder::new()
                .name("pcat-modem-worker".into())
                .spawn(move || ctx.run())
                .map_err(ModemError::Io)?
        };

        let switch = RadioSwitch::new(
            self.status.clone(),
            host,
            rfkill_line,
            self.config.gpio.rfkill.clone(),
        );
        let (watchdog_stop, stop_rx) = watch::channel(false);
        runtime.spawn(RfkillWatchdog::new(switch.clone(), self.config.watchdog.clone()).run(stop_rx));

        tracing::info!("modem manager started");
        self.running = Some(Running {
            flag,
            worker,
            watchdog_stop,
            radio: switch,
        });
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn state(&self) -> ManagerState {
        *self.lock_state()
    }

    /// Current status as seen by callers.
    pub fn status(&self) -> ModemStatusSnapshot {
        self.status.snapshot()
    }

    /// Block or unblock the modem radio. Returns `false` if the manager is
    /// not running or the radio was already in that state.
    pub fn set_rfkill(&self, blocked: bool) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| running.radio.set_rfkill(blocked))
    }

    /// Stop the worker and watchdog. The worker kills any live helper and
    /// releases the GPIO lines and the USB bus before it exits.
    pub fn shutdown(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.flag.store(false, Ordering::Relaxed);
        let _ = running.watchdog_stop.send(true);
        if running.worker.join().is_err() {
            tracing::warn!("modem worker panicked");
        }
        *self.lock_state() = ManagerState::None;
        tracing::info!("modem manager stopped");
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for ModemManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    power: PowerSequencer,
    scanner: DeviceScanner,
    supervisor: ProcessSupervisor,
    timing: PowerTiming,
    running: Arc<AtomicBool>,
    state: Arc<Mutex<ManagerState>>,
}

impl Worker {
    fn run(mut self) {
        while self.running.load(Ordering::Relaxed) {
            let state = *self.state.lock().unwrap_or_else(|e| e.into_inner());
            match state {
                ManagerState::None => match self.power.power_on(&self.running) {
                    Ok(()) => self.set_state(ManagerState::Ready),
                    Err(ModemError::Cancelled) => break,
                    Err(e) if self.timing.retry_on_failure => {
                        tracing::warn!(error = %e, "modem power sequence failed, retrying");
                        self.sleep_ticks(RETRY_BACKOFF_TICKS);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "modem power sequence failed, continuing");
                        self.set_state(ManagerState::Ready);
                    }
                },
                ManagerState::Ready => {
                    self.scanner.scan(&self.supervisor);
                    self.sleep_ticks(SCAN_INTERVAL_TICKS);
                }
            }
        }

        self.supervisor.terminate();
        self.power.release();
        // Dropping the scanner releases the USB bus.
        drop(self.scanner);
        tracing::debug!("modem worker exited");
    }

    fn set_state(&self, state: ManagerState) {
        tracing::debug!(?state, "modem manager state");
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn sleep_ticks(&self, ticks: u32) {
        for _ in 0..ticks {
            if !self.running.load(Ordering::Relaxed) {
                return;
            }
            thread::sleep(self.timing.tick);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{usb_device, FakeGpio, FakeHost, FakeUsb};
    use pcat_common::config::{GpioConfig, GpioLineConfig};
    use std::time::{Duration, Instant};

    fn config() -> ModemConfig {
        let line = |line| {
            Some(GpioLineConfig {
                chip: "gpiochip0".into(),
                line,
                active_low: false,
            })
        };
        ModemConfig {
            gpio: GpioConfig {
                power: line(1),
                reset: line(2),
                rfkill: None,
            },
            power: PowerTiming {
                power_wait_ticks: 1,
                reset_on_ticks: 1,
                reset_wait_ticks: 1,
                tick: Duration::from_millis(1),
                retry_on_failure: true,
            },
            ..ModemConfig::default()
        }
    }

    fn backends(gpio: &FakeGpio) -> Backends {
        Backends {
            gpio: Box::new(gpio.clone()),
            usb: Box::new(FakeUsb::new(vec![usb_device(0x2C7C, 0x0456)])),
            host: Arc::new(FakeHost::new()),
            device_table: SUPPORTED_DEVICES.to_vec(),
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[tokio::test]
    async fn start_twice_is_noop() {
        let gpio = FakeGpio::new();
        let mut manager = ModemManager::new(config());
        manager.start(backends(&gpio), Handle::current()).unwrap();
        manager.start(backends(&gpio), Handle::current()).unwrap();
        assert!(manager.is_running());

        assert!(wait_until(|| manager.state() == ManagerState::Ready));
        assert_eq!(gpio.request_count("gpiochip0", 1), 1);
        manager.shutdown();
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let gpio = FakeGpio::new();
        let mut manager = ModemManager::new(config());
        manager.start(backends(&gpio), Handle::current()).unwrap();
        manager.shutdown();
        manager.shutdown();
        assert!(!manager.is_running());
        assert_eq!(manager.state(), ManagerState::None);
    }

    #[tokio::test]
    async fn set_rfkill_requires_running_manager() {
        let gpio = FakeGpio::new();
        let mut manager = ModemManager::new(config());
        assert!(!manager.set_rfkill(true));

        manager.start(backends(&gpio), Handle::current()).unwrap();
        assert!(manager.set_rfkill(true));
        assert!(!manager.set_rfkill(true));
        assert!(manager.status().rfkill_state);
        manager.shutdown();
    }

    #[test]
    fn shutdown_without_start_is_noop() {
        let mut manager = ModemManager::new(ModemConfig::default());
        manager.shutdown();
        assert_eq!(manager.status().sim_state, 0);
    }
}
