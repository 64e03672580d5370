//! Channel kinds, tags and per-kind counts

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, StationError};

/// Channel kind, declared in the order channels are laid out in the real-time image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChannelKind {
    /// Analog input
    Ai,
    /// Digital input
    Di,
    /// Digital output (coil)
    Do,
    /// Analog output
    Ao,
    /// Virtual output
    Vo,
}

impl ChannelKind {
    /// Real-time image order
    pub const ALL: [ChannelKind; 5] = [Self::Ai, Self::Di, Self::Do, Self::Ao, Self::Vo];

    pub fn prefix(self) -> &'static str {
        match self {
            Self::Ai => "AI",
            Self::Di => "DI",
            Self::Do => "DO",
            Self::Ao => "AO",
            Self::Vo => "VO",
        }
    }

    fn slot(self) -> usize {
        match self {
            Self::Ai => 0,
            Self::Di => 1,
            Self::Do => 2,
            Self::Ao => 3,
            Self::Vo => 4,
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

impl FromStr for ChannelKind {
    type Err = StationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "AI" => Ok(Self::Ai),
            "DI" => Ok(Self::Di),
            "DO" => Ok(Self::Do),
            "AO" => Ok(Self::Ao),
            "VO" => Ok(Self::Vo),
            other => Err(StationError::validation(format!(
                "Unknown channel kind '{other}'"
            ))),
        }
    }
}

/// `KIND-N` channel name, e.g. `AI-3`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelTag {
    pub kind: ChannelKind,
    pub index: u16,
}

impl ChannelTag {
    pub fn new(kind: ChannelKind, index: u16) -> Self {
        Self { kind, index }
    }
}

impl fmt::Display for ChannelTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.kind, self.index)
    }
}

impl FromStr for ChannelTag {
    type Err = StationError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let (kind, index) = trimmed.split_once('-').ok_or_else(|| {
            StationError::validation(format!("Invalid channel tag '{s}', expected KIND-N"))
        })?;
        let kind = kind.parse::<ChannelKind>()?;
        let index = index.parse::<u16>().map_err(|_| {
            StationError::validation(format!("Invalid channel index in tag '{s}'"))
        })?;
        Ok(Self { kind, index })
    }
}

impl Serialize for ChannelTag {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Number of channels of each kind the controller exposes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelCount {
    counts: [u16; 5],
}

impl ChannelCount {
    pub fn new(ai: u16, di: u16, dout: u16, ao: u16, vo: u16) -> Self {
        Self {
            counts: [ai, di, dout, ao, vo],
        }
    }

    /// Decode the 5-register block: AI, DI, DO, AO, VO
    pub fn from_registers(regs: &[u16]) -> Result<Self> {
        match regs {
            [ai, di, dout, ao, vo, ..] => Ok(Self::new(*ai, *di, *dout, *ao, *vo)),
            _ => Err(StationError::data(format!(
                "Channel count needs 5 registers, got {}",
                regs.len()
            ))),
        }
    }

    pub fn to_registers(&self) -> [u16; 5] {
        self.counts
    }

    pub fn get(&self, kind: ChannelKind) -> u16 {
        self.counts[kind.slot()]
    }

    pub fn total(&self) -> usize {
        self.counts.iter().map(|&c| c as usize).sum()
    }

    /// Flat position of the first channel of `kind`
    pub fn flat_offset(&self, kind: ChannelKind) -> usize {
        self.counts[..kind.slot()].iter().map(|&c| c as usize).sum()
    }

    /// Flat position of `tag`, `None` when the controller has no such channel
    pub fn flat_index(&self, tag: ChannelTag) -> Option<usize> {
        (tag.index < self.get(tag.kind)).then(|| self.flat_offset(tag.kind) + tag.index as usize)
    }

    /// Validation error for indices at or beyond the live count
    pub fn check(&self, tag: ChannelTag) -> Result<()> {
        if tag.index < self.get(tag.kind) {
            Ok(())
        } else {
            Err(StationError::channel_out_of_range(tag, self.get(tag.kind)))
        }
    }

    /// Every tag, in real-time image order
    pub fn tags(&self) -> impl Iterator<Item = ChannelTag> + '_ {
        ChannelKind::ALL
            .into_iter()
            .flat_map(move |kind| (0..self.get(kind)).map(move |i| ChannelTag::new(kind, i)))
    }
}
