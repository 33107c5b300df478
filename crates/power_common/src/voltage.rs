//! Undervoltage flags from the firmware's throttle register.
//!
//! `vcgencmd get_throttled` prints `throttled=0x50005`. Bit 0 is set while
//! the supply is low right now; bit 16 is set if it has been low at any
//! point since boot. The two are kept apart.

use serde::{Deserialize, Serialize};

const UNDER_VOLTAGE_NOW: u32 = 1 << 0;
const UNDER_VOLTAGE_SINCE_BOOT: u32 = 1 << 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoltageState {
    pub low_voltage_now: bool,
    pub low_voltage_ever_observed: bool,
}

impl VoltageState {
    pub fn from_bits(bits: u32) -> Self {
        Self {
            low_voltage_now: bits & UNDER_VOLTAGE_NOW != 0,
            low_voltage_ever_observed: bits & (UNDER_VOLTAGE_SINCE_BOOT | UNDER_VOLTAGE_NOW) != 0,
        }
    }

    /// Parse `vcgencmd get_throttled` output.
    pub fn parse(output: &str) -> Option<Self> {
        let value = output.trim().split_once('=').map(|(_, v)| v).unwrap_or(output.trim());
        let value = value.trim();
        let bits = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => value.parse().ok()?,
        };
        Some(Self::from_bits(bits))
    }

    /// Either flag set
    pub fn any(&self) -> bool {
        self.low_voltage_now || self.low_voltage_ever_observed
    }
}
