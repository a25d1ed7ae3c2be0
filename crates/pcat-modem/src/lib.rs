//! Cellular modem lifecycle controller.
//!
//! This crate contains:
//! - **Power sequencing** over GPIO (power, reset and optional rfkill lines)
//! - **USB detection** of supported modems and selection of the dial path
//! - **Dial helper supervision** with non-blocking parsing of its status output
//! - **Radio watchdog** that resets the radio after a lost 5G attach
//!
//! [`ModemManager`] ties these together: a worker thread for the blocking
//! hardware work and tasks on a caller-driven single-threaded tokio runtime
//! for the helper's output, its exit and the watchdog tick.

pub mod error;
pub mod gpio;
pub mod host;
pub mod manager;
pub mod power;
pub mod protocol;
pub mod status;
pub mod supervisor;
pub mod test_util;
pub mod usb;
pub mod watchdog;

pub use error::{ModemError, Result};
pub use manager::{Backends, ManagerState, ModemManager};
pub use status::StatusHandle;
