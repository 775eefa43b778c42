pub mod buffer;
pub mod channel;
pub mod chorus;
pub mod compressor;
pub mod filters;
pub mod mixer;
pub mod output;
pub mod reverb;
pub mod settings;

pub use buffer::FrameBuffer;
pub use channel::{ChannelFeatures, LineIndex, MixerChannel, ResampleMethod, Sample, StereoLine};
pub use chorus::ChorusEngine;
pub use compressor::Compressor;
pub use mixer::{Mixer, MixerLockGuard, MixerState};
pub use output::{AudioOutput, NullOutput, RecordingOutput};
pub use reverb::ReverbEngine;
pub use settings::{
    ChorusPreset, CompressorSettings, CrossfeedPreset, MixerConfig, ReverbParams, ReverbPreset,
};
