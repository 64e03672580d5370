//! Alarm threshold evaluation for analog inputs

use serde::Serialize;
use std::fmt;

use super::descriptor::AlarmConfig;

/// Outcome of evaluating one AI value; recomputed on every read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AlarmSeverity {
    Normal,
    #[serde(rename = "HH")]
    HighHigh,
    #[serde(rename = "HI")]
    High,
    #[serde(rename = "LO")]
    Low,
    #[serde(rename = "LL")]
    LowLow,
    #[serde(rename = "HF")]
    HighFault,
    #[serde(rename = "LF")]
    LowFault,
    /// Alarm configuration unavailable
    Error,
    /// Value could not be read
    Invalid,
}

impl AlarmSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::HighHigh => "HH",
            Self::High => "HI",
            Self::Low => "LO",
            Self::LowLow => "LL",
            Self::HighFault => "HF",
            Self::LowFault => "LF",
            Self::Error => "Error",
            Self::Invalid => "Invalid",
        }
    }
}

impl fmt::Display for AlarmSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Evaluate `value` against its thresholds; first match in priority order wins.
///
/// The deadband is subtracted from upper thresholds and added to lower ones.
/// The low-fault floor has no enable check.
pub fn evaluate(value: f32, config: Option<&AlarmConfig>) -> AlarmSeverity {
    let Some(c) = config else {
        return AlarmSeverity::Error;
    };
    let db = c.deadband;

    if c.hf.is_enabled() && value > c.hf.value {
        AlarmSeverity::HighFault
    } else if c.hh.is_enabled() && value >= c.hh.value - db {
        AlarmSeverity::HighHigh
    } else if c.hi.is_enabled() && value >= c.hi.value - db {
        AlarmSeverity::High
    } else if c.lo.is_enabled() && value < c.lo.value + db {
        AlarmSeverity::Low
    } else if c.ll.is_enabled() && value < c.ll.value + db {
        AlarmSeverity::LowLow
    } else if value < c.lf.value {
        AlarmSeverity::LowFault
    } else {
        AlarmSeverity::Normal
    }
}
