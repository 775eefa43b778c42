//! YMF262 (OPL3) FM synthesizer.
//!
//! [`Opl3Chip`] is the sample-stepped chip model; [`Opl3Device`] puts it
//! behind I/O ports with the two OPL timers and feeds a mixer channel.

pub mod channel;
pub mod chip;
pub mod device;
pub mod slot;
mod tables;
pub mod timer;

pub use channel::ChannelType;
pub use chip::{CHANNEL_COUNT, OPL3_NATIVE_RATE, Opl3Chip, SLOT_COUNT};
pub use device::{DEFAULT_BASE_PORT, Opl3Device, PortWrite};
pub use slot::EnvelopeStage;
pub use timer::OplTimer;
