//! Error type shared by the modem controller components.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModemError {
    /// A required setting (e.g. the power GPIO chip) is not configured.
    #[error("{0} not configured")]
    ConfigMissing(&'static str),
    #[error("GPIO {chip}:{line}: {reason}")]
    Gpio {
        chip: String,
        line: u32,
        reason: String,
    },
    #[error("USB enumeration failed: {0}")]
    Usb(String),
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The shared work flag was cleared while waiting.
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ModemError>;
