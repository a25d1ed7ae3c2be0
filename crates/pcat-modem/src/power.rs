//! Modem power sequencing over GPIO.
//!
//! Sequence (levels are logical, `active_low` is applied per line):
//!
//! 1. request power (off), rfkill (blocked), reset (released)
//! 2. hold for `power_wait_ticks`
//! 3. power on, rfkill unblocked, reset released; wait `power_wait_ticks`
//! 4. assert reset for `reset_on_ticks`, release it
//! 5. settle for `reset_wait_ticks`
//!
//! Every wait runs in ticks and checks the shared work flag before each one,
//! so clearing the flag aborts the sequence within one tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pcat_common::config::{GpioConfig, GpioLineConfig, PowerTiming};

use crate::error::{ModemError, Result};
use crate::gpio::{GpioBackend, OutputLine, SharedLine};

const POWER_CONSUMER: &str = "gpio-modem-power";
const RESET_CONSUMER: &str = "gpio-modem-reset";
const RFKILL_CONSUMER: &str = "gpio-modem-rf-kill";

/// Owns the modem GPIO lines for the lifetime of the worker thread.
pub struct PowerSequencer {
    gpio: Box<dyn GpioBackend>,
    config: GpioConfig,
    timing: PowerTiming,
    power: Option<Box<dyn OutputLine>>,
    reset: Option<Box<dyn OutputLine>>,
    rfkill: SharedLine,
}

/// Set the line if already requested, otherwise request it at `value`.
fn drive(
    gpio: &mut dyn GpioBackend,
    slot: &mut Option<Box<dyn OutputLine>>,
    cfg: &GpioLineConfig,
    consumer: &str,
    value: u8,
) -> Result<()> {
    match slot {
        Some(line) => line.set_value(value),
        None => {
            let line = gpio.request_output(&cfg.chip, cfg.line, consumer, value)?;
            tracing::debug!(chip = %cfg.chip, line = cfg.line, consumer, value, "GPIO line requested");
            *slot = Some(line);
            Ok(())
        }
    }
}

impl PowerSequencer {
    pub fn new(
        gpio: Box<dyn GpioBackend>,
        config: GpioConfig,
        timing: PowerTiming,
        rfkill: SharedLine,
    ) -> Self {
        Self {
            gpio,
            config,
            timing,
            power: None,
            reset: None,
            rfkill,
        }
    }

    /// Run the power-on sequence. Returns `Err(Cancelled)` if `running` was
    /// cleared during a wait; any other error means a required line is
    /// missing or unusable.
    pub fn power_on(&mut self, running: &AtomicBool) -> Result<()> {
        tracing::info!("start modem power initialization");

        let power_cfg = self
            .config
            .power
            .clone()
            .ok_or(ModemError::ConfigMissing("modem power GPIO chip"))?;
        let reset_cfg = self
            .config
            .reset
            .clone()
            .ok_or(ModemError::ConfigMissing("modem reset GPIO chip"))?;
        let rfkill_cfg = self.config.rfkill.clone();
        if rfkill_cfg.is_none() {
            tracing::debug!("modem rfkill GPIO not configured, continuing without it");
        }

        drive(
            self.gpio.as_mut(),
            &mut self.power,
            &power_cfg,
            POWER_CONSUMER,
            power_cfg.level(false),
        )?;
        if let Some(cfg) = &rfkill_cfg {
            self.drive_rfkill(cfg, true);
        }
        drive(
            self.gpio.as_mut(),
            &mut self.reset,
            &reset_cfg,
            RESET_CONSUMER,
            reset_cfg.level(false),
        )?;

        self.wait(self.timing.power_wait_ticks, running)?;

        self.set_power(&power_cfg, true)?;
        if let Some(cfg) = &rfkill_cfg {
            self.drive_rfkill(cfg, false);
        }
        self.set_reset(&reset_cfg, false)?;

        self.wait(self.timing.power_wait_ticks, running)?;

        self.set_reset(&reset_cfg, true)?;
        self.wait(self.timing.reset_on_ticks, running)?;
        self.set_reset(&reset_cfg, false)?;

        self.wait(self.timing.reset_wait_ticks, running)?;

        tracing::info!("modem power initialization completed");
        Ok(())
    }

    /// Drive every held line to its inactive level and release it.
    pub fn release(&mut self) {
        let mut rfkill = self.rfkill.lock().unwrap_or_else(|e| e.into_inner());
        let lines = [
            (self.reset.take(), self.config.reset.as_ref()),
            (rfkill.take(), self.config.rfkill.as_ref()),
            (self.power.take(), self.config.power.as_ref()),
        ];
        for (line, cfg) in lines {
            if let (Some(mut line), Some(cfg)) = (line, cfg) {
                if let Err(e) = line.set_value(cfg.level(false)) {
                    tracing::warn!(error = %e, "failed to drive GPIO line to its safe level");
                }
                tracing::debug!(chip = %cfg.chip, line = cfg.line, "GPIO line released");
            }
        }
    }

    fn set_power(&mut self, cfg: &GpioLineConfig, on: bool) -> Result<()> {
        drive(self.gpio.as_mut(), &mut self.power, cfg, POWER_CONSUMER, cfg.level(on))
    }

    fn set_reset(&mut self, cfg: &GpioLineConfig, asserted: bool) -> Result<()> {
        drive(
            self.gpio.as_mut(),
            &mut self.reset,
            cfg,
            RESET_CONSUMER,
            cfg.level(asserted),
        )
    }

    /// The rfkill line is optional: failures are logged and the sequence goes on.
    fn drive_rfkill(&mut self, cfg: &GpioLineConfig, blocked: bool) {
        let rfkill = Arc::clone(&self.rfkill);
        let mut slot = rfkill.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = drive(
            self.gpio.as_mut(),
            &mut slot,
            cfg,
            RFKILL_CONSUMER,
            cfg.level(blocked),
        ) {
            tracing::warn!(error = %e, "modem rfkill GPIO unavailable");
        }
    }

    fn wait(&self, ticks: u32, running: &AtomicBool) -> Result<()> {
        for _ in 0..ticks {
            if !running.load(Ordering::Relaxed) {
                return Err(ModemError::Cancelled);
            }
            std::thread::sleep(self.timing.tick);
        }
        if !running.load(Ordering::Relaxed) {
            return Err(ModemError::Cancelled);
        }
        Ok(())
    }
}
