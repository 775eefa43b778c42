//! Sound card emulation core: a block-based software mixer with a send-effect
//! chain, and a cycle-stepped OPL3 FM synthesizer that feeds it.
//!
//! Hardware front-ends register a [`MixerChannel`](audio::MixerChannel) with the
//! [`Mixer`](audio::Mixer) and push frames into it from their production
//! callback. The mixer owns the effect engines and writes finished blocks to an
//! [`AudioOutput`](audio::AudioOutput).

pub mod audio;
pub mod error;
pub mod frame;
pub mod opl3;

pub use audio::{
    AudioOutput, ChannelFeatures, ChorusPreset, CrossfeedPreset, Mixer, MixerChannel, MixerConfig,
    MixerState, ReverbPreset,
};
pub use error::{Error, Result};
pub use frame::StereoFrame;
pub use opl3::{Opl3Chip, Opl3Device};

#[cfg(test)]
mod tests {
    use ctor::ctor;
    use tracing::Level;
    use tracing_subscriber::FmtSubscriber;

    #[ctor]
    fn init_tracing() {
        let subscriber = FmtSubscriber::builder()
            .with_file(true)
            .with_line_number(true)
            .with_max_level(Level::DEBUG)
            .pretty()
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}
