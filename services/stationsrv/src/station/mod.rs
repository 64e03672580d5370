//! Station controller model
//!
//! Register map, channel descriptors, the real-time image and the device
//! state machine that ties them to a transport.

pub mod alarm;
pub mod channel;
pub mod descriptor;
pub mod device;
pub mod identity;
pub mod realtime;
pub mod register_map;
pub mod registry;

pub use alarm::{evaluate, AlarmSeverity};
pub use channel::{ChannelCount, ChannelKind, ChannelTag};
pub use descriptor::{
    AiDescriptor, AlarmConfig, AlarmThreshold, AoControlMode, AoDescriptor, DiDescriptor,
    DoDescriptor,
};
pub use device::{
    ChannelReading, ChannelValue, ConnectionStatus, Device, DeviceSettings, RealtimeReport,
};
pub use identity::{MacAddress, ModelInfo, NetworkAddress};
pub use realtime::{RealtimeCache, RealtimeSnapshot};
pub use registry::DeviceRegistry;
