mod handle;
mod runner;
pub(crate) mod types;

pub use handle::{MixerThread, MixerThreadHandle};
pub use types::RuntimeError;
