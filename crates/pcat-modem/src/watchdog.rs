//! Radio kill switch and the 5G attach watchdog.
//!
//! A modem that attached to 5G and then lost it for longer than the
//! configured timeout is power-cycled at the radio level: block, then
//! unblock. The check runs on the event loop every 5 seconds.

use std::sync::Arc;
use std::time::{Duration, Instant};

use pcat_common::config::{GpioLineConfig, WatchdogConfig};
use tokio::sync::watch;

use crate::gpio::SharedLine;
use crate::host::HostControl;
use crate::status::StatusHandle;

pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);

/// Drives the radio block state through the host command and the optional
/// rfkill GPIO line, keeping `rfkill_state` in the shared status current.
#[derive(Clone)]
pub struct RadioSwitch {
    status: StatusHandle,
    host: Arc<dyn HostControl>,
    line: SharedLine,
    line_config: Option<GpioLineConfig>,
}

impl RadioSwitch {
    pub fn new(
        status: StatusHandle,
        host: Arc<dyn HostControl>,
        line: SharedLine,
        line_config: Option<GpioLineConfig>,
    ) -> Self {
        Self {
            status,
            host,
            line,
            line_config,
        }
    }

    /// Block (`true`) or unblock the radio. Returns `false` when the radio
    /// was already in the requested state and nothing was done.
    pub fn set_rfkill(&self, blocked: bool) -> bool {
        let changed = self.status.update(|s| {
            if s.rfkill_state == blocked {
                false
            } else {
                s.rfkill_state = blocked;
                true
            }
        });
        if !changed {
            return false;
        }

        tracing::info!(blocked, "modem radio state changed");
        if let Err(e) = self.host.set_radio_blocked(blocked) {
            tracing::warn!(blocked, error = %e, "radio control command failed");
        }

        if let Some(cfg) = &self.line_config {
            let mut slot = self.line.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(line) = slot.as_mut() {
                if let Err(e) = line.set_value(cfg.level(blocked)) {
                    tracing::warn!(blocked, error = %e, "failed to drive modem rfkill GPIO");
                }
            }
        }
        true
    }
}

/// Resets the radio when a 5G attach has been lost for too long.
pub struct RfkillWatchdog {
    switch: RadioSwitch,
    config: WatchdogConfig,
}

impl RfkillWatchdog {
    pub fn new(switch: RadioSwitch, config: WatchdogConfig) -> Self {
        Self { switch, config }
    }

    /// One watchdog tick. Returns `true` if the radio was cycled.
    pub fn check(&self, now: Instant) -> bool {
        if self.config.disable_5g_fail_auto_reset {
            return false;
        }

        let timeout = self.config.fail_timeout;
        let expired = self.switch.status.update(|s| {
            let expired = s.have_5g_connected
                && !s.rfkill_state
                && now > s.last_5g_timestamp + timeout;
            if expired {
                s.have_5g_connected = false;
            }
            expired
        });
        if !expired {
            return false;
        }

        tracing::warn!(timeout_s = timeout.as_secs(), "5G connection lost, resetting modem radio");
        self.switch.set_rfkill(true);
        self.switch.set_rfkill(false);
        true
    }

    /// Tick every [`WATCHDOG_INTERVAL`] until `shutdown` turns `true` or its
    /// sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(WATCHDOG_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.check(Instant::now());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::debug!("rfkill watchdog stopped");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::GpioBackend;
    use crate::test_util::{FakeGpio, FakeHost, HostCall};
    use std::sync::Mutex;

    fn switch(host: &FakeHost) -> (RadioSwitch, StatusHandle) {
        let status = StatusHandle::new();
        let line: SharedLine = Arc::new(Mutex::new(None));
        (
            RadioSwitch::new(status.clone(), Arc::new(host.clone()), line, None),
            status,
        )
    }

    fn config(disabled: bool) -> WatchdogConfig {
        WatchdogConfig {
            disable_5g_fail_auto_reset: disabled,
            fail_timeout: Duration::from_secs(60),
        }
    }

    // ─── set_rfkill ─────────────────────────────────────────────────────

    #[test]
    fn set_rfkill_twice_runs_command_once() {
        let host = FakeHost::new();
        let (switch, status) = switch(&host);

        assert!(switch.set_rfkill(true));
        assert!(!switch.set_rfkill(true));
        assert_eq!(host.calls(), vec![HostCall::RadioBlocked(true)]);
        assert!(status.snapshot().rfkill_state);
    }

    #[test]
    fn set_rfkill_to_current_state_is_noop() {
        let host = FakeHost::new();
        let (switch, _status) = switch(&host);
        assert!(!switch.set_rfkill(false));
        assert!(host.calls().is_empty());
    }

    #[test]
    fn set_rfkill_drives_gpio_line() {
        let host = FakeHost::new();
        let mut gpio = FakeGpio::new();
        let cfg = GpioLineConfig {
            chip: "gpiochip1".into(),
            line: 3,
            active_low: true,
        };
        let requested = gpio.request_output("gpiochip1", 3, "test", cfg.level(false)).unwrap();
        let line: SharedLine = Arc::new(Mutex::new(Some(requested)));
        let switch = RadioSwitch::new(StatusHandle::new(), Arc::new(host.clone()), line, Some(cfg));

        switch.set_rfkill(true);
        switch.set_rfkill(false);

        // active low: released (1), blocked (0), released (1)
        assert_eq!(gpio.history("gpiochip1", 3), vec![1, 0, 1]);
    }

    // ─── Watchdog ───────────────────────────────────────────────────────

    #[test]
    fn lost_5g_past_timeout_cycles_radio() {
        let host = FakeHost::new();
        let (switch, status) = switch(&host);
        let start = Instant::now();
        status.update(|s| {
            s.have_5g_connected = true;
            s.last_5g_timestamp = start;
        });
        let watchdog = RfkillWatchdog::new(switch, config(false));

        assert!(!watchdog.check(start + Duration::from_secs(30)));
        assert!(host.calls().is_empty());

        assert!(watchdog.check(start + Duration::from_secs(61)));
        assert_eq!(
            host.calls(),
            vec![HostCall::RadioBlocked(true), HostCall::RadioBlocked(false)]
        );
        status.update(|s| {
            assert!(!s.have_5g_connected);
            assert!(!s.rfkill_state);
        });

        // Flag was cleared, so the next tick does nothing.
        assert!(!watchdog.check(start + Duration::from_secs(70)));
        assert_eq!(host.calls().len(), 2);
    }

    #[test]
    fn timeout_boundary_is_exclusive() {
        let host = FakeHost::new();
        let (switch, status) = switch(&host);
        let start = Instant::now();
        status.update(|s| {
            s.have_5g_connected = true;
            s.last_5g_timestamp = start;
        });
        let watchdog = RfkillWatchdog::new(switch, config(false));
        assert!(!watchdog.check(start + Duration::from_secs(60)));
    }

    #[test]
    fn disabled_auto_reset_never_cycles() {
        let host = FakeHost::new();
        let (switch, status) = switch(&host);
        let start = Instant::now();
        status.update(|s| {
            s.have_5g_connected = true;
            s.last_5g_timestamp = start;
        });
        let watchdog = RfkillWatchdog::new(switch, config(true));

        assert!(!watchdog.check(start + Duration::from_secs(600)));
        assert!(host.calls().is_empty());
        status.update(|s| assert!(s.have_5g_connected));
    }

    #[test]
    fn blocked_radio_is_left_alone() {
        let host = FakeHost::new();
        let (switch, status) = switch(&host);
        let start = Instant::now();
        status.update(|s| {
            s.have_5g_connected = true;
            s.rfkill_state = true;
            s.last_5g_timestamp = start;
        });
        let watchdog = RfkillWatchdog::new(switch, config(false));
        assert!(!watchdog.check(start + Duration::from_secs(120)));
        assert!(host.calls().is_empty());
    }

    #[test]
    fn never_attached_to_5g_is_left_alone() {
        let host = FakeHost::new();
        let (switch, _status) = switch(&host);
        let watchdog = RfkillWatchdog::new(switch, config(false));
        assert!(!watchdog.check(Instant::now() + Duration::from_secs(3600)));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let host = FakeHost::new();
        let (switch, _status) = switch(&host);
        let watchdog = RfkillWatchdog::new(switch, config(false));
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(watchdog.run(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("watchdog did not stop")
            .unwrap();
    }
}
