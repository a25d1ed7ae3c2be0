//! Modem controller configuration.
//!
//! The on-disk format is TOML. [`ModemConfigInput`] mirrors the file with
//! every field optional; [`ModemConfigInput::resolve`] turns it into the
//! validated, read-only [`ModemConfig`] the controller consumes.
//!
//! ```toml
//! [gpio.power]
//! chip = "gpiochip0"
//! line = 12
//!
//! [gpio.reset]
//! chip = "gpiochip0"
//! line = 13
//! active_low = true
//!
//! [dial]
//! apn = "internet"
//!
//! [watchdog]
//! fail_timeout_s = 60
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Default time a 5G session may stay unrefreshed before the radio is cycled.
pub const DEFAULT_5G_FAIL_TIMEOUT_S: u64 = 60;

pub const DEFAULT_POWER_WAIT_TICKS: u32 = 30;
pub const DEFAULT_RESET_ON_TICKS: u32 = 10;
pub const DEFAULT_RESET_WAIT_TICKS: u32 = 30;

/// Length of one power-sequencer wait step; cancellation is checked once per tick.
pub const POWER_TICK: Duration = Duration::from_millis(100);

pub const DEFAULT_NATIVE_MANAGER_MARKER: &str = "/usr/sbin/ModemManager";

// ── Input (file) types ──────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModemConfigInput {
    pub gpio: GpioConfigInput,
    pub dial: DialConfigInput,
    pub watchdog: WatchdogConfigInput,
    pub power: PowerConfigInput,
    pub host: HostConfigInput,
    pub debug: DebugConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GpioConfigInput {
    pub power: Option<GpioLineInput>,
    pub reset: Option<GpioLineInput>,
    pub rfkill: Option<GpioLineInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GpioLineInput {
    pub chip: String,
    pub line: u32,
    pub active_low: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DialConfigInput {
    pub apn: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub auth: Option<String>,
    pub disable_ipv6: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WatchdogConfigInput {
    pub disable_5g_fail_auto_reset: bool,
    pub fail_timeout_s: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PowerConfigInput {
    pub power_wait_ticks: Option<u32>,
    pub reset_on_ticks: Option<u32>,
    pub reset_wait_ticks: Option<u32>,
    pub retry_on_failure: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HostConfigInput {
    pub native_manager_marker: Option<String>,
    pub builtin_enable_cmd: Option<Vec<String>>,
    pub builtin_disable_cmd: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DebugConfigInput {
    pub helper_output_log: bool,
}

// ── Resolved types ──────────────────────────────────────────────────

/// One GPIO output: chip name (e.g. `gpiochip0`), line offset and polarity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpioLineConfig {
    pub chip: String,
    pub line: u32,
    pub active_low: bool,
}

impl GpioLineConfig {
    /// Physical level for a logical state, honouring `active_low`.
    pub fn level(&self, active: bool) -> u8 {
        u8::from(active != self.active_low)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GpioConfig {
    pub power: Option<GpioLineConfig>,
    pub reset: Option<GpioLineConfig>,
    pub rfkill: Option<GpioLineConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialCredentials {
    pub user: String,
    pub password: String,
    pub auth: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DialConfig {
    pub apn: Option<String>,
    /// Present only when user, password and auth method are all set.
    pub credentials: Option<DialCredentials>,
    pub disable_ipv6: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogConfig {
    pub disable_5g_fail_auto_reset: bool,
    pub fail_timeout: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            disable_5g_fail_auto_reset: false,
            fail_timeout: Duration::from_secs(DEFAULT_5G_FAIL_TIMEOUT_S),
        }
    }
}

/// Power sequence timing, expressed in ticks of `tick`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerTiming {
    pub power_wait_ticks: u32,
    pub reset_on_ticks: u32,
    pub reset_wait_ticks: u32,
    pub tick: Duration,
    /// Retry the power sequence (2 s backoff) until it succeeds instead of
    /// moving on to device scanning after the first attempt.
    pub retry_on_failure: bool,
}

impl Default for PowerTiming {
    fn default() -> Self {
        Self {
            power_wait_ticks: DEFAULT_POWER_WAIT_TICKS,
            reset_on_ticks: DEFAULT_RESET_ON_TICKS,
            reset_wait_ticks: DEFAULT_RESET_WAIT_TICKS,
            tick: POWER_TICK,
            retry_on_failure: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// When this path exists the host runs its own modem manager and USB
    /// scanning is skipped.
    pub native_manager_marker: Option<PathBuf>,
    pub builtin_enable_cmd: Vec<String>,
    pub builtin_disable_cmd: Vec<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            native_manager_marker: Some(PathBuf::from(DEFAULT_NATIVE_MANAGER_MARKER)),
            builtin_enable_cmd: vec!["ifup".into(), "wwan".into()],
            builtin_disable_cmd: vec!["ifdown".into(), "wwan".into()],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModemConfig {
    pub gpio: GpioConfig,
    pub dial: DialConfig,
    pub watchdog: WatchdogConfig,
    pub power: PowerTiming,
    pub host: HostConfig,
    /// Append the dial helper's raw output to the debug log file.
    pub debug_helper_output_log: bool,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn resolve_line(input: Option<GpioLineInput>) -> Option<GpioLineConfig> {
    let input = input?;
    let chip = non_empty(Some(input.chip))?;
    Some(GpioLineConfig {
        chip,
        line: input.line,
        active_low: input.active_low,
    })
}

fn resolve_command(input: Option<Vec<String>>, default: Vec<String>) -> Result<Vec<String>, String> {
    match input {
        None => Ok(default),
        Some(cmd) if cmd.first().is_some_and(|p| !p.trim().is_empty()) => Ok(cmd),
        Some(_) => Err("host command must name a program".into()),
    }
}

impl ModemConfigInput {
    pub fn resolve(self) -> Result<ModemConfig, String> {
        let gpio = GpioConfig {
            power: resolve_line(self.gpio.power),
            reset: resolve_line(self.gpio.reset),
            rfkill: resolve_line(self.gpio.rfkill),
        };

        let credentials = match (
            non_empty(self.dial.user),
            non_empty(self.dial.password),
            non_empty(self.dial.auth),
        ) {
            (Some(user), Some(password), Some(auth)) => Some(DialCredentials {
                user,
                password,
                auth,
            }),
            _ => None,
        };
        let dial = DialConfig {
            apn: non_empty(self.dial.apn),
            credentials,
            disable_ipv6: self.dial.disable_ipv6,
        };

        let fail_timeout_s = self
            .watchdog
            .fail_timeout_s
            .unwrap_or(DEFAULT_5G_FAIL_TIMEOUT_S);
        if fail_timeout_s == 0 {
            return Err("watchdog.fail_timeout_s must be greater than zero".into());
        }
        let watchdog = WatchdogConfig {
            disable_5g_fail_auto_reset: self.watchdog.disable_5g_fail_auto_reset,
            fail_timeout: Duration::from_secs(fail_timeout_s),
        };

        let defaults = PowerTiming::default();
        let power = PowerTiming {
            power_wait_ticks: self.power.power_wait_ticks.unwrap_or(defaults.power_wait_ticks),
            reset_on_ticks: self.power.reset_on_ticks.unwrap_or(defaults.reset_on_ticks),
            reset_wait_ticks: self.power.reset_wait_ticks.unwrap_or(defaults.reset_wait_ticks),
            tick: defaults.tick,
            retry_on_failure: self.power.retry_on_failure.unwrap_or(defaults.retry_on_failure),
        };

        let host_defaults = HostConfig::default();
        let native_manager_marker = match self.host.native_manager_marker {
            Some(path) => non_empty(Some(path)).map(PathBuf::from),
            None => host_defaults.native_manager_marker,
        };
        let host = HostConfig {
            native_manager_marker,
            builtin_enable_cmd: resolve_command(
                self.host.builtin_enable_cmd,
                host_defaults.builtin_enable_cmd,
            )?,
            builtin_disable_cmd: resolve_command(
                self.host.builtin_disable_cmd,
                host_defaults.builtin_disable_cmd,
            )?,
        };

        Ok(ModemConfig {
            gpio,
            dial,
            watchdog,
            power,
            host,
            debug_helper_output_log: self.debug.helper_output_log,
        })
    }
}

impl ModemConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, String> {
        if input.trim().is_empty() {
            return Ok(ModemConfig::default());
        }
        let parsed: ModemConfigInput =
            toml::from_str(input).map_err(|e| format!("Invalid config TOML: {}", e))?;
        parsed.resolve()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_config() {
        let toml = r#"
            [gpio.power]
            chip = "gpiochip0"
            line = 12

            [gpio.reset]
            chip = "gpiochip0"
            line = 13
            active_low = true

            [gpio.rfkill]
            chip = "gpiochip1"
            line = 4

            [dial]
            apn = "internet"
            user = "web"
            password = "secret"
            auth = "2"
            disable_ipv6 = true

            [watchdog]
            disable_5g_fail_auto_reset = true
            fail_timeout_s = 120

            [power]
            power_wait_ticks = 5
            retry_on_failure = false

            [debug]
            helper_output_log = true
        "#;
        let cfg = ModemConfig::from_toml_str(toml).unwrap();
        assert_eq!(
            cfg.gpio.reset,
            Some(GpioLineConfig {
                chip: "gpiochip0".into(),
                line: 13,
                active_low: true
            })
        );
        assert_eq!(cfg.gpio.rfkill.as_ref().unwrap().chip, "gpiochip1");
        assert_eq!(cfg.dial.apn.as_deref(), Some("internet"));
        assert_eq!(cfg.dial.credentials.as_ref().unwrap().auth, "2");
        assert!(cfg.dial.disable_ipv6);
        assert!(cfg.watchdog.disable_5g_fail_auto_reset);
        assert_eq!(cfg.watchdog.fail_timeout, Duration::from_secs(120));
        assert_eq!(cfg.power.power_wait_ticks, 5);
        assert_eq!(cfg.power.reset_on_ticks, DEFAULT_RESET_ON_TICKS);
        assert!(!cfg.power.retry_on_failure);
        assert!(cfg.debug_helper_output_log);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = ModemConfig::from_toml_str("").unwrap();
        assert!(cfg.gpio.power.is_none());
        assert!(cfg.dial.apn.is_none());
        assert_eq!(
            cfg.watchdog.fail_timeout,
            Duration::from_secs(DEFAULT_5G_FAIL_TIMEOUT_S)
        );
        assert!(cfg.power.retry_on_failure);
        assert_eq!(cfg.power.tick, POWER_TICK);
    }

    #[test]
    fn blank_chip_name_counts_as_missing() {
        let cfg = ModemConfig::from_toml_str(
            r#"
            [gpio.power]
            chip = "  "
            line = 3
        "#,
        )
        .unwrap();
        assert!(cfg.gpio.power.is_none());
    }

    #[test]
    fn partial_credentials_are_dropped() {
        let cfg = ModemConfig::from_toml_str(
            r#"
            [dial]
            apn = "internet"
            user = "web"
            password = ""
            auth = "1"
        "#,
        )
        .unwrap();
        assert_eq!(cfg.dial.apn.as_deref(), Some("internet"));
        assert!(cfg.dial.credentials.is_none());
    }

    #[test]
    fn zero_fail_timeout_rejected() {
        let err = ModemConfig::from_toml_str("[watchdog]\nfail_timeout_s = 0\n").unwrap_err();
        assert!(err.contains("fail_timeout_s"));
    }

    #[test]
    fn empty_host_command_rejected() {
        let err = ModemConfig::from_toml_str("[host]\nbuiltin_enable_cmd = []\n").unwrap_err();
        assert!(err.contains("program"));
    }

    #[test]
    fn native_marker_can_be_disabled() {
        let cfg = ModemConfig::from_toml_str("[host]\nnative_manager_marker = \"\"\n").unwrap();
        assert!(cfg.host.native_manager_marker.is_none());
    }

    #[test]
    fn level_honours_active_low() {
        let high = GpioLineConfig {
            chip: "gpiochip0".into(),
            line: 1,
            active_low: false,
        };
        let low = GpioLineConfig {
            active_low: true,
            ..high.clone()
        };
        assert_eq!(high.level(true), 1);
        assert_eq!(high.level(false), 0);
        assert_eq!(low.level(true), 0);
        assert_eq!(low.level(false), 1);
    }

    #[test]
    fn invalid_toml_reports_error() {
        let err = ModemConfig::from_toml_str("[gpio.power\n").unwrap_err();
        assert!(err.starts_with("Invalid config TOML"));
    }
}
