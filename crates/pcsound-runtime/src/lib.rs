pub mod audio;
pub mod runtime;

pub use audio::CpalOutput;
pub use runtime::{MixerThread, MixerThreadHandle, RuntimeError};
