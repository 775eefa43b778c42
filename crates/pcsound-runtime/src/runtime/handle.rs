use std::{
    sync::{Arc, atomic::Ordering},
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use pcsound_core::Mixer;

use super::{
    runner::{ControlMessage, Runner, ThreadState},
    types::{MIXER_THREAD_NAME, RuntimeError},
};

struct MixerThreadInner {
    mixer: Arc<Mixer>,
    ctrl_tx: Sender<ControlMessage>,
    state: Arc<ThreadState>,
}

impl MixerThreadInner {
    fn request_stop(&self) {
        self.state.quit.store(true, Ordering::Release);
        let _ = self.ctrl_tx.send(ControlMessage::Stop);
    }
}

/// Owns the background thread that runs mix cycles.
///
/// Dropping it stops the thread, waits up to the mixer's `join_timeout`, and
/// disposes the output whether or not the thread finished.
pub struct MixerThread {
    inner: Arc<MixerThreadInner>,
    join: Option<JoinHandle<()>>,
    done_rx: Receiver<()>,
}

/// Cheap, cloneable view of a running [`MixerThread`].
#[derive(Clone)]
pub struct MixerThreadHandle {
    inner: Arc<MixerThreadInner>,
}

impl MixerThread {
    pub fn spawn(mixer: Arc<Mixer>) -> Result<Self, RuntimeError> {
        let (ctrl_tx, ctrl_rx) = unbounded();
        let (done_tx, done_rx) = bounded(1);
        let state = Arc::new(ThreadState::default());
        let runner = Runner::new(Arc::clone(&mixer), ctrl_rx, Arc::clone(&state));

        let join = thread::Builder::new()
            .name(MIXER_THREAD_NAME.to_string())
            .spawn(move || {
                runner.run();
                let _ = done_tx.send(());
            })
            .map_err(|err| RuntimeError::ThreadSpawn {
                name: MIXER_THREAD_NAME,
                error: err.to_string(),
            })?;

        Ok(Self {
            inner: Arc::new(MixerThreadInner {
                mixer,
                ctrl_tx,
                state,
            }),
            join: Some(join),
            done_rx,
        })
    }

    pub fn handle(&self) -> MixerThreadHandle {
        MixerThreadHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn mixer(&self) -> &Arc<Mixer> {
        &self.inner.mixer
    }

    /// Stops the thread and disposes the output.
    pub fn shutdown(mut self) -> Result<(), RuntimeError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), RuntimeError> {
        let Some(join) = self.join.take() else {
            return Ok(());
        };
        self.inner.request_stop();

        let timeout = self.inner.mixer.config().join_timeout;
        let result = match self.done_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if join.join().is_err() {
                    tracing::error!("mixer thread panicked");
                }
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(?timeout, "mixer thread did not stop in time, detaching it");
                Err(RuntimeError::JoinTimeout {
                    name: MIXER_THREAD_NAME,
                    timeout,
                })
            }
        };

        self.inner.mixer.dispose_output();
        result
    }
}

impl Drop for MixerThread {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

impl MixerThreadHandle {
    pub fn mixer(&self) -> &Arc<Mixer> {
        &self.inner.mixer
    }

    /// Asks the thread to exit after its current cycle.
    pub fn request_stop(&self) {
        self.inner.request_stop();
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.running.load(Ordering::Acquire)
    }

    /// Completed mix cycles.
    pub fn cycles(&self) -> u64 {
        self.inner.state.cycles.load(Ordering::Relaxed)
    }

    /// Cycles whose mix call returned an error.
    pub fn failed_cycles(&self) -> u64 {
        self.inner.state.failed_cycles.load(Ordering::Relaxed)
    }
}
