//! GPIO capability used by the power sequencer and the rfkill control.
//!
//! The controller only needs output lines: request a line on a named chip
//! with an initial level, then set its value. [`CdevGpio`] implements this on
//! the Linux GPIO character device; dropping a line handle releases it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use gpio_cdev::{Chip, LineHandle, LineRequestFlags};

use crate::error::{ModemError, Result};

/// A requested output line. Dropping it releases the line.
pub trait OutputLine: Send {
    fn set_value(&mut self, value: u8) -> Result<()>;
}

/// A line slot shared between the power sequencer (which requests it) and
/// the rfkill control (which drives it afterwards).
pub type SharedLine = Arc<Mutex<Option<Box<dyn OutputLine>>>>;

/// Source of output lines, addressed by chip name and line offset.
pub trait GpioBackend: Send {
    fn request_output(
        &mut self,
        chip: &str,
        line: u32,
        consumer: &str,
        value: u8,
    ) -> Result<Box<dyn OutputLine>>;
}

/// Linux GPIO character-device backend (`/dev/gpiochipN`).
///
/// Chips are opened on first use and kept open until the backend is dropped.
#[derive(Default)]
pub struct CdevGpio {
    chips: HashMap<String, Chip>,
}

impl CdevGpio {
    pub fn new() -> Self {
        Self::default()
    }

    fn chip(&mut self, name: &str) -> Result<&mut Chip> {
        if !self.chips.contains_key(name) {
            let chip = Chip::new(chip_path(name)).map_err(|e| ModemError::Gpio {
                chip: name.to_string(),
                line: 0,
                reason: format!("open chip: {e}"),
            })?;
            tracing::debug!(chip = %name, "GPIO chip opened");
            self.chips.insert(name.to_string(), chip);
        }
        self.chips
            .get_mut(name)
            .ok_or_else(|| ModemError::Gpio {
                chip: name.to_string(),
                line: 0,
                reason: "chip missing from cache".into(),
            })
    }
}

/// Accepts either a bare chip name (`gpiochip0`) or an absolute device path.
fn chip_path(name: &str) -> PathBuf {
    if name.starts_with('/') {
        PathBuf::from(name)
    } else {
        PathBuf::from("/dev").join(name)
    }
}

impl GpioBackend for CdevGpio {
    fn request_output(
        &mut self,
        chip: &str,
        line: u32,
        consumer: &str,
        value: u8,
    ) -> Result<Box<dyn OutputLine>> {
        let gpio_err = |reason: String| ModemError::Gpio {
            chip: chip.to_string(),
            line,
            reason,
        };
        let handle = self
            .chip(chip)?
            .get_line(line)
            .map_err(|e| gpio_err(format!("get line: {e}")))?
            .request(LineRequestFlags::OUTPUT, value, consumer)
            .map_err(|e| gpio_err(format!("request output: {e}")))?;
        Ok(Box::new(CdevLine {
            handle,
            chip: chip.to_string(),
            line,
        }))
    }
}

struct CdevLine {
    handle: LineHandle,
    chip: String,
    line: u32,
}

impl OutputLine for CdevLine {
    fn set_value(&mut self, value: u8) -> Result<()> {
        self.handle.set_value(value).map_err(|e| ModemError::Gpio {
            chip: self.chip.clone(),
            line: self.line,
            reason: format!("set value: {e}"),
        })
    }
}
