use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// A buffer range reached past the logical end of the buffer.
    RangeOutOfBounds {
        start: usize,
        count: usize,
        len: usize,
    },
    /// A mix cycle asked for more frames than the mixer is configured to handle.
    BlockTooLarge { requested: usize, max: usize },
    /// Block size of zero or above the configured maximum.
    InvalidBlockSize(usize),
    /// Sample rate outside the supported range.
    InvalidSampleRate(u32),
    /// No channel is registered under the given name.
    ChannelNotFound(String),
    /// The output backend rejected a write or failed to start.
    Backend(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RangeOutOfBounds { start, count, len } => write!(
                f,
                "range {start}..{} is out of bounds for buffer of {len} frames",
                start + count
            ),
            Self::BlockTooLarge { requested, max } => {
                write!(f, "requested {requested} frames, the mixer handles at most {max}")
            }
            Self::InvalidBlockSize(size) => write!(f, "invalid block size {size}"),
            Self::InvalidSampleRate(rate) => write!(f, "unsupported sample rate {rate} Hz"),
            Self::ChannelNotFound(name) => write!(f, "no mixer channel named {name:?}"),
            Self::Backend(msg) => write!(f, "audio backend error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}
