use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    #[error("no default audio output device")]
    NoOutputDevice,
    #[error("failed to build output stream: {0}")]
    BuildStream(String),
    #[error("failed to start output stream: {0}")]
    PlayStream(String),
    #[error("failed to spawn {name} thread: {error}")]
    ThreadSpawn { name: &'static str, error: String },
    #[error("{name} thread did not stop within {timeout:?}")]
    JoinTimeout {
        name: &'static str,
        timeout: Duration,
    },
}

pub(crate) const MIXER_THREAD_NAME: &str = "pcsound-mixer";
pub(crate) const AUDIO_THREAD_NAME: &str = "pcsound-audio";
/// Upper bound on how long the audio thread may take to open the device.
pub(crate) const STREAM_REPLY_TIMEOUT: Duration = Duration::from_secs(5);
