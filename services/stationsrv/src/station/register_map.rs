//! Controller register map
//!
//! All addresses are 0-based protocol addresses. Holding registers unless
//! noted otherwise.

use super::channel::{ChannelKind, ChannelTag};
use crate::error::{Result, StationError};

// ============================================================================
// Identity and network (holding registers)
// ============================================================================

/// Model id (2) + version (1) + title (16)
pub const MODEL_ADDR: u16 = 0;
pub const MODEL_REGS: u16 = 19;

/// IP (2) + mask (2) + gateway (2) + hardware address (6)
pub const NETWORK_ADDR: u16 = 32;
pub const NETWORK_REGS: u16 = 12;

/// Hardware address, one octet per register (low byte)
pub const MAC_ADDR: u16 = 38;
pub const MAC_REGS: u16 = 6;

/// AI, DI, DO, AO, VO counts
pub const CHANNEL_COUNT_ADDR: u16 = 64;
pub const CHANNEL_COUNT_REGS: u16 = 5;

// ============================================================================
// Channel descriptor blocks (holding registers)
// ============================================================================

pub const DESCRIPTOR_BLOCK_SIZE: u16 = 256;

pub const AI_BLOCK_START: u16 = 0x1000;
pub const AO_BLOCK_START: u16 = 0x3000;
pub const DI_BLOCK_START: u16 = 0x5000;
pub const DO_BLOCK_START: u16 = 0x7000;

/// Kinds sit 0x2000 apart, so each has room for 32 descriptor blocks
pub const MAX_CHANNELS_PER_KIND: u16 = (AO_BLOCK_START - AI_BLOCK_START) / DESCRIPTOR_BLOCK_SIZE;

/// Enabled flag (1) + title (16)
pub const HEADER_REGS: u16 = 17;
pub const TITLE_REGS: usize = 16;
pub const UNIT_REGS: usize = 6;

/// Decimal places (1) + unit (6) + gain, offset, min, max (2 each)
pub const AI_DETAIL_REGS: u16 = 15;
/// Six thresholds of style (1) + value (2), then deadband (2) and low-cut (2)
pub const AI_ALARM_OFFSET: u16 = 64;
pub const AI_ALARM_REGS: u16 = 22;
/// Mode (1) + P, I, D, manual (2 each) + unit (6) + decimal places (1)
pub const AO_DETAIL_REGS: u16 = 16;
/// Inverse, alarm enabled, alarm delay
pub const DI_DETAIL_REGS: u16 = 3;
/// Auto, manual, reverse, on-timer, off-timer
pub const DO_DETAIL_REGS: u16 = 5;

/// Largest decimal-place count honored when scaling
pub const MAX_DECIMAL_PLACES: u16 = 6;

// ============================================================================
// Real-time image (input registers)
// ============================================================================

/// Two registers per channel, in AI, DI, DO, AO, VO order
pub const REALTIME_DATA_ADDR: u16 = 0x0000;
/// One register per channel, low byte is the readiness flag
pub const REALTIME_STATE_ADDR: u16 = 0x4000;
/// Readiness value marking a valid sample
pub const READY: u8 = 0;

/// Start of the descriptor block for a configurable channel
pub fn descriptor_address(tag: ChannelTag) -> Result<u16> {
    let start = match tag.kind {
        ChannelKind::Ai => AI_BLOCK_START,
        ChannelKind::Ao => AO_BLOCK_START,
        ChannelKind::Di => DI_BLOCK_START,
        ChannelKind::Do => DO_BLOCK_START,
        ChannelKind::Vo => {
            return Err(StationError::validation(format!(
                "{tag} has no descriptor block"
            )))
        },
    };
    if tag.index >= MAX_CHANNELS_PER_KIND {
        return Err(StationError::validation(format!(
            "{tag} is beyond the descriptor map ({MAX_CHANNELS_PER_KIND} per kind)"
        )));
    }
    Ok(start + tag.index * DESCRIPTOR_BLOCK_SIZE)
}

/// Configurable channels past the descriptor map cannot be described
pub fn has_descriptor(tag: ChannelTag) -> bool {
    tag.kind != ChannelKind::Vo && tag.index < MAX_CHANNELS_PER_KIND
}

/// Registers read in one go for header + kind-specific fields
pub fn descriptor_main_regs(kind: ChannelKind) -> u16 {
    HEADER_REGS
        + match kind {
            ChannelKind::Ai => AI_DETAIL_REGS,
            ChannelKind::Ao => AO_DETAIL_REGS,
            ChannelKind::Di => DI_DETAIL_REGS,
            ChannelKind::Do => DO_DETAIL_REGS,
            ChannelKind::Vo => 0,
        }
}
