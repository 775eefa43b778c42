use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;

/// Sink for finished mixer blocks.
///
/// Samples are interleaved stereo floats normalised to roughly `[-1, 1]`.
/// Implementations do their own buffering; `write_data` may block, but only
/// for a bounded time.
pub trait AudioOutput: Send {
    fn start(&mut self) -> Result<()>;

    fn write_data(&mut self, samples: &[f32]) -> Result<()>;

    fn dispose(&mut self);

    /// Whether a real device consumes the written data in real time.
    fn is_realtime(&self) -> bool {
        true
    }
}

/// Output that discards everything. Mixers built on it run in the no-sound state.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullOutput;

impl AudioOutput for NullOutput {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn write_data(&mut self, _samples: &[f32]) -> Result<()> {
        Ok(())
    }

    fn dispose(&mut self) {}

    fn is_realtime(&self) -> bool {
        false
    }
}

/// Output that keeps every written sample in memory, for offline rendering.
#[derive(Debug, Default, Clone)]
pub struct RecordingOutput {
    samples: Arc<Mutex<Vec<f32>>>,
    disposed: Arc<Mutex<bool>>,
}

impl RecordingOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared view of the recorded samples; stays valid after the output is
    /// moved into a mixer.
    pub fn samples(&self) -> Arc<Mutex<Vec<f32>>> {
        Arc::clone(&self.samples)
    }

    pub fn is_disposed(&self) -> bool {
        *self.disposed.lock()
    }
}

impl AudioOutput for RecordingOutput {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn write_data(&mut self, samples: &[f32]) -> Result<()> {
        self.samples.lock().extend_from_slice(samples);
        Ok(())
    }

    fn dispose(&mut self) {
        *self.disposed.lock() = true;
    }
}
