//! Dial helper status protocol.
//!
//! The helper prints one record per line as comma-separated `KEY=VALUE`
//! fields, dispatched on `CMD`:
//!
//! ```text
//! CMD=SIGNALINFO,MODE=NR5G-NSA,RSRP=-92,RSRQ=-11
//! CMD=SIMSTATUS,STATE=1
//! CMD=ISPINFO,FNN=CMCC,RPLMN=46000,ALPHABET=0
//! ```
//!
//! The stream is best effort: records can be truncated, repeated or
//! garbled. Fields without `=` are dropped, unknown commands and
//! unparsable numbers are ignored, and nothing here is ever an error.

use std::collections::HashMap;
use std::time::Instant;

use bytes::BytesMut;
use pcat_common::models::ModemMode;

use crate::status::{ModemStatus, StatusHandle};

/// Upper bound on buffered bytes without a newline. Past it the partial
/// data is discarded.
pub const MAX_BUFFER_BYTES: usize = 1024 * 1024;

/// A decoded status record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusRecord {
    SignalInfo {
        mode: ModemMode,
        /// Signal quality (0–100) from the highest-priority metric present.
        signal: Option<i32>,
    },
    SimStatus {
        state: i32,
    },
    IspInfo {
        name: Option<String>,
        plmn: Option<String>,
        /// The helper flagged `name` as UCS2. Carried but not decoded.
        ucs2: bool,
    },
}

// ── Mode and signal tables ──────────────────────────────────────────

/// Map the helper's `MODE` string to an access technology.
pub fn mode_from_str(mode: &str) -> ModemMode {
    match mode {
        "NR5G-SA" | "NR5G-NSA" => ModemMode::Nr5g,
        "LTE" => ModemMode::Lte,
        "WCDMA" | "TDSCDMA" => ModemMode::Umts,
        "GSM" | "HDR" | "CDMA" => ModemMode::Gsm,
        _ => ModemMode::None,
    }
}

pub fn rssi_strength(rssi: i32) -> i32 {
    if rssi >= -65 {
        100
    } else if rssi >= -85 {
        (rssi + 85) * 5
    } else {
        0
    }
}

pub fn rsrq_strength(rsrq: i32) -> i32 {
    if rsrq >= -10 {
        100
    } else if rsrq >= -20 {
        (rsrq + 20) * 10
    } else {
        0
    }
}

pub fn rsrp_strength(rsrp: i32) -> i32 {
    if rsrp >= -80 {
        100
    } else if rsrp >= -100 {
        (rsrp + 100) * 5
    } else {
        0
    }
}

pub fn rscp_strength(rscp: i32) -> i32 {
    if rscp >= -60 {
        100
    } else if rscp >= -100 {
        (rscp + 100) * 5 / 2
    } else {
        0
    }
}

/// Integer part of a numeric field; accepts decimals like `-10.5`.
fn parse_int(value: &str) -> Option<i32> {
    let value = value.trim();
    value
        .parse::<i32>()
        .ok()
        .or_else(|| value.parse::<f64>().ok().filter(|v| v.is_finite()).map(|v| v as i32))
}

/// Signal quality from the first present metric, in priority order
/// RSSI, RSRQ, RSRP, RSCP. A metric whose value does not parse is skipped.
fn signal_from_fields(fields: &HashMap<&str, &str>) -> Option<i32> {
    const METRICS: [(&str, fn(i32) -> i32); 4] = [
        ("RSSI", rssi_strength),
        ("RSRQ", rsrq_strength),
        ("RSRP", rsrp_strength),
        ("RSCP", rscp_strength),
    ];
    METRICS.iter().find_map(|(key, formula)| {
        fields
            .get(key)
            .and_then(|v| parse_int(v))
            .map(formula)
    })
}

// ── Record decoding ─────────────────────────────────────────────────

/// Split a line into its `KEY=VALUE` fields. Later duplicates win.
fn parse_fields(line: &str) -> HashMap<&str, &str> {
    line.split(',')
        .filter_map(|field| field.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect()
}

/// Decode one line (without the trailing newline).
pub fn parse_record(line: &str) -> Option<StatusRecord> {
    let fields = parse_fields(line);
    match *fields.get("CMD")? {
        "SIGNALINFO" => Some(StatusRecord::SignalInfo {
            mode: fields.get("MODE").map_or(ModemMode::None, |m| mode_from_str(m)),
            signal: signal_from_fields(&fields),
        }),
        "SIMSTATUS" => fields
            .get("STATE")
            .and_then(|v| parse_int(v))
            .map(|state| StatusRecord::SimStatus { state }),
        "ISPINFO" => Some(StatusRecord::IspInfo {
            name: fields.get("FNN").map(|v| v.to_string()),
            plmn: fields.get("RPLMN").map(|v| v.to_string()),
            ucs2: fields
                .get("ALPHABET")
                .is_some_and(|v| *v == "1" || v.eq_ignore_ascii_case("UCS2")),
        }),
        _ => None,
    }
}

impl StatusRecord {
    /// Apply the record to `status` at time `now`.
    pub fn apply(self, status: &mut ModemStatus, now: Instant) {
        match self {
            StatusRecord::SignalInfo { mode, signal } => {
                let left_5g = status.mode == ModemMode::Nr5g && mode < ModemMode::Nr5g;
                status.mode = mode;

                if mode == ModemMode::Nr5g {
                    status.have_5g_connected = true;
                    status.last_5g_timestamp = now;
                } else if status.have_5g_connected && left_5g {
                    // Restart the watchdog window from the fall-back.
                    status.last_5g_timestamp = now;
                }

                if let Some(signal) = signal {
                    status.set_signal_strength(signal);
                }
            }
            StatusRecord::SimStatus { state } => {
                status.sim_state = state;
            }
            StatusRecord::IspInfo { name, plmn, ucs2 } => {
                if ucs2 {
                    tracing::trace!("operator name flagged as UCS2, stored as received");
                }
                status.isp_name = name;
                status.isp_plmn = plmn;
            }
        }
    }
}

// ── Incremental parser ──────────────────────────────────────────────

/// Line-buffering parser fed with raw chunks from the helper's output.
#[derive(Debug, Default)]
pub struct StatusParser {
    buf: BytesMut,
}

impl StatusParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes waiting for a newline.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Append `data` and apply every complete record to `status`.
    /// Returns the number of records applied.
    pub fn feed(&mut self, data: &[u8], status: &StatusHandle) -> usize {
        self.feed_at(data, status, Instant::now())
    }

    pub(crate) fn feed_at(&mut self, data: &[u8], status: &StatusHandle, now: Instant) -> usize {
        if self.buf.len() > MAX_BUFFER_BYTES {
            tracing::debug!(
                dropped = self.buf.len(),
                "status buffer overflow, discarding partial data"
            );
            self.buf.clear();
        }
        self.buf.extend_from_slice(data);

        let mut applied = 0;
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line = self.buf.split_to(pos + 1);
            let text = String::from_utf8_lossy(&line[..pos]);
            let text = text.trim_end_matches('\r');
            if text.is_empty() {
                continue;
            }
            match parse_record(text) {
                Some(record) => {
                    tracing::trace!(?record, "status record");
                    status.update(|s| record.apply(s, now));
                    applied += 1;
                }
                None => tracing::trace!(line = %text, "ignored status line"),
            }
        }

        if self.buf.len() > MAX_BUFFER_BYTES {
            tracing::debug!(
                dropped = self.buf.len(),
                "status line exceeds buffer limit, discarding"
            );
            self.buf.clear();
        }
        applied
    }
}
