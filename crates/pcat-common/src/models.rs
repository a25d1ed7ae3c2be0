//! Modem status models.
//!
//! These types are produced by the modem controller and read by the rest of
//! the gateway (status reporting, LEDs, the management API).

use serde::{Deserialize, Serialize};

// ── Access technology ───────────────────────────────────────────────

/// Current radio access technology, ordered from none to the fastest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ModemMode {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "2g")]
    Gsm,
    #[serde(rename = "3g")]
    Umts,
    #[serde(rename = "lte")]
    Lte,
    #[serde(rename = "5g")]
    Nr5g,
}

impl std::fmt::Display for ModemMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModemMode::None => write!(f, "none"),
            ModemMode::Gsm => write!(f, "2g"),
            ModemMode::Umts => write!(f, "3g"),
            ModemMode::Lte => write!(f, "lte"),
            ModemMode::Nr5g => write!(f, "5g"),
        }
    }
}

// ── Device class ────────────────────────────────────────────────────

/// Classification of the attached modem from the last USB scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    #[default]
    None,
    Lte,
    #[serde(rename = "5g")]
    Nr5g,
    General,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::None => write!(f, "none"),
            DeviceType::Lte => write!(f, "lte"),
            DeviceType::Nr5g => write!(f, "5g"),
            DeviceType::General => write!(f, "general"),
        }
    }
}

// ── Snapshot ────────────────────────────────────────────────────────

/// Point-in-time copy of the modem status, safe to hand to other threads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModemStatusSnapshot {
    pub mode: ModemMode,
    /// SIM state code as reported by the dial helper.
    pub sim_state: i32,
    /// `true` when the radio is blocked.
    pub rfkill_state: bool,
    /// Signal quality, 0–100.
    pub signal_strength: u8,
    pub isp_name: Option<String>,
    pub isp_plmn: Option<String>,
    pub device_type: DeviceType,
}
