//! Per-channel configuration descriptors
//!
//! Each configurable channel owns a 256-register block. The first 17
//! registers are a common header (enabled flag + title), followed by
//! kind-specific fields. AI channels carry a second range with alarm
//! thresholds.

use serde::Serialize;

use super::channel::{ChannelKind, ChannelTag};
use super::register_map::{AI_ALARM_REGS, MAX_DECIMAL_PLACES, TITLE_REGS, UNIT_REGS};
use crate::codec::{encode_utf16_text, swapped_float_registers, RegisterCursor};
use crate::error::{Result, StationError};

/// Enabled flag and title shared by every descriptor block
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DescriptorHeader {
    pub enabled: bool,
    pub title: String,
}

impl DescriptorHeader {
    fn decode(cur: &mut RegisterCursor<'_>) -> Result<Self> {
        Ok(Self {
            enabled: cur.flag()?,
            title: cur.text(TITLE_REGS)?,
        })
    }

    fn encode(&self, regs: &mut Vec<u16>) {
        regs.push(u16::from(self.enabled));
        regs.extend(encode_utf16_text(&self.title, TITLE_REGS));
    }
}

// ============================================================================
// Alarm configuration
// ============================================================================

/// One severity threshold; style bit 0 enables it
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AlarmThreshold {
    pub style: u16,
    pub value: f32,
}

impl AlarmThreshold {
    pub fn enabled(value: f32) -> Self {
        Self { style: 1, value }
    }

    pub fn disabled(value: f32) -> Self {
        Self { style: 0, value }
    }

    pub fn is_enabled(&self) -> bool {
        self.style & 0x0001 != 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlarmConfig {
    /// High fault (absolute ceiling)
    pub hf: AlarmThreshold,
    pub hh: AlarmThreshold,
    pub hi: AlarmThreshold,
    pub lo: AlarmThreshold,
    pub ll: AlarmThreshold,
    /// Low fault (absolute floor)
    pub lf: AlarmThreshold,
    pub deadband: f32,
    pub low_cut: f32,
}

impl AlarmConfig {
    pub fn from_registers(regs: &[u16]) -> Result<Self> {
        let mut cur = RegisterCursor::new(regs);
        let mut threshold = || -> Result<AlarmThreshold> {
            Ok(AlarmThreshold {
                style: cur.u16()?,
                value: cur.swapped_f32()?,
            })
        };
        let hf = threshold()?;
        let hh = threshold()?;
        let hi = threshold()?;
        let lo = threshold()?;
        let ll = threshold()?;
        let lf = threshold()?;
        Ok(Self {
            hf,
            hh,
            hi,
            lo,
            ll,
            lf,
            deadband: cur.swapped_f32()?,
            low_cut: cur.swapped_f32()?,
        })
    }

    pub fn to_registers(&self) -> Vec<u16> {
        let mut regs = Vec::with_capacity(AI_ALARM_REGS as usize);
        for t in [self.hf, self.hh, self.hi, self.lo, self.ll, self.lf] {
            regs.push(t.style);
            regs.extend(swapped_float_registers(t.value));
        }
        regs.extend(swapped_float_registers(self.deadband));
        regs.extend(swapped_float_registers(self.low_cut));
        regs
    }
}

// ============================================================================
// Descriptors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AiDescriptor {
    pub index: u16,
    pub enabled: bool,
    pub title: String,
    pub decimal_places: u16,
    pub unit: String,
    pub gain: f32,
    pub offset: f32,
    pub min: f32,
    pub max: f32,
    /// `None` when the alarm range could not be read
    pub alarm: Option<AlarmConfig>,
}

impl AiDescriptor {
    pub fn tag(&self) -> ChannelTag {
        ChannelTag::new(ChannelKind::Ai, self.index)
    }

    /// Decode header + detail; the alarm range is attached separately
    pub fn from_registers(index: u16, regs: &[u16]) -> Result<Self> {
        let mut cur = RegisterCursor::new(regs);
        let header = DescriptorHeader::decode(&mut cur)?;
        Ok(Self {
            index,
            enabled: header.enabled,
            title: header.title,
            decimal_places: cur.u16()?.min(MAX_DECIMAL_PLACES),
            unit: cur.text(UNIT_REGS)?,
            gain: cur.swapped_f32()?,
            offset: cur.swapped_f32()?,
            min: cur.swapped_f32()?,
            max: cur.swapped_f32()?,
            alarm: None,
        })
    }

    pub fn to_registers(&self) -> Vec<u16> {
        let mut regs = Vec::new();
        DescriptorHeader {
            enabled: self.enabled,
            title: self.title.clone(),
        }
        .encode(&mut regs);
        regs.push(self.decimal_places);
        regs.extend(encode_utf16_text(&self.unit, UNIT_REGS));
        for v in [self.gain, self.offset, self.min, self.max] {
            regs.extend(swapped_float_registers(v));
        }
        regs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AoControlMode {
    Manual,
    Pid,
    Follow,
    Unknown(u16),
}

impl From<u16> for AoControlMode {
    fn from(raw: u16) -> Self {
        match raw {
            0 => Self::Manual,
            1 => Self::Pid,
            2 => Self::Follow,
            other => Self::Unknown(other),
        }
    }
}

impl From<AoControlMode> for u16 {
    fn from(mode: AoControlMode) -> Self {
        match mode {
            AoControlMode::Manual => 0,
            AoControlMode::Pid => 1,
            AoControlMode::Follow => 2,
            AoControlMode::Unknown(raw) => raw,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AoDescriptor {
    pub index: u16,
    pub enabled: bool,
    pub title: String,
    pub mode: AoControlMode,
    pub p: f32,
    pub i: f32,
    pub d: f32,
    pub manual_value: f32,
    pub unit: String,
    pub decimal_places: u16,
}

impl AoDescriptor {
    pub fn tag(&self) -> ChannelTag {
        ChannelTag::new(ChannelKind::Ao, self.index)
    }

    pub fn from_registers(index: u16, regs: &[u16]) -> Result<Self> {
        let mut cur = RegisterCursor::new(regs);
        let header = DescriptorHeader::decode(&mut cur)?;
        Ok(Self {
            index,
            enabled: header.enabled,
            title: header.title,
            mode: AoControlMode::from(cur.u16()?),
            p: cur.swapped_f32()?,
            i: cur.swapped_f32()?,
            d: cur.swapped_f32()?,
            manual_value: cur.swapped_f32()?,
            unit: cur.text(UNIT_REGS)?,
            decimal_places: cur.u16()?.min(MAX_DECIMAL_PLACES),
        })
    }

    pub fn to_registers(&self) -> Vec<u16> {
        let mut regs = Vec::new();
        DescriptorHeader {
            enabled: self.enabled,
            title: self.title.clone(),
        }
        .encode(&mut regs);
        regs.push(self.mode.into());
        for v in [self.p, self.i, self.d, self.manual_value] {
            regs.extend(swapped_float_registers(v));
        }
        regs.extend(encode_utf16_text(&self.unit, UNIT_REGS));
        regs.push(self.decimal_places);
        regs
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiDescriptor {
    pub index: u16,
    pub enabled: bool,
    pub title: String,
    pub inverse: bool,
    pub alarm_enabled: bool,
    pub alarm_delay_secs: u16,
}

impl DiDescriptor {
    pub fn tag(&self) -> ChannelTag {
        ChannelTag::new(ChannelKind::Di, self.index)
    }

    pub fn from_registers(index: u16, regs: &[u16]) -> Result<Self> {
        let mut cur = RegisterCursor::new(regs);
        let header = DescriptorHeader::decode(&mut cur)?;
        Ok(Self {
            index,
            enabled: header.enabled,
            title: header.title,
            inverse: cur.flag()?,
            alarm_enabled: cur.flag()?,
            alarm_delay_secs: cur.u16()?,
        })
    }

    pub fn to_registers(&self) -> Vec<u16> {
        let mut regs = Vec::new();
        DescriptorHeader {
            enabled: self.enabled,
            title: self.title.clone(),
        }
        .encode(&mut regs);
        regs.extend([
            u16::from(self.inverse),
            u16::from(self.alarm_enabled),
            self.alarm_delay_secs,
        ]);
        regs
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DoDescriptor {
    pub index: u16,
    pub enabled: bool,
    pub title: String,
    pub auto_control: bool,
    /// Echo of the last value written through this driver
    pub manual_value: bool,
    pub reverse: bool,
    pub on_timer_secs: u16,
    pub off_timer_secs: u16,
}

impl DoDescriptor {
    pub fn tag(&self) -> ChannelTag {
        ChannelTag::new(ChannelKind::Do, self.index)
    }

    pub fn from_registers(index: u16, regs: &[u16]) -> Result<Self> {
        let mut cur = RegisterCursor::new(regs);
        let header = DescriptorHeader::decode(&mut cur)?;
        Ok(Self {
            index,
            enabled: header.enabled,
            title: header.title,
            auto_control: cur.flag()?,
            manual_value: cur.flag()?,
            reverse: cur.flag()?,
            on_timer_secs: cur.u16()?,
            off_timer_secs: cur.u16()?,
        })
    }

    pub fn to_registers(&self) -> Vec<u16> {
        let mut regs = Vec::new();
        DescriptorHeader {
            enabled: self.enabled,
            title: self.title.clone(),
        }
        .encode(&mut regs);
        regs.extend([
            u16::from(self.auto_control),
            u16::from(self.manual_value),
            u16::from(self.reverse),
            self.on_timer_secs,
            self.off_timer_secs,
        ]);
        regs
    }
}

/// Reject a descriptor block whose layout is not what the kind expects
pub fn expect_len(tag: ChannelTag, regs: &[u16], expected: u16) -> Result<()> {
    if regs.len() == expected as usize {
        Ok(())
    } else {
        Err(StationError::data(format!(
            "{tag}: descriptor range returned {} registers, expected {expected}",
            regs.len()
        )))
    }
}
