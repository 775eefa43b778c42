use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use pcsound_core::{Mixer, MixerState};

pub(crate) enum ControlMessage {
    Stop,
}

/// Counters and flags shared between the mixer thread and its handles.
#[derive(Debug, Default)]
pub(crate) struct ThreadState {
    pub quit: AtomicBool,
    pub running: AtomicBool,
    pub cycles: AtomicU64,
    pub failed_cycles: AtomicU64,
}

pub(crate) struct Runner {
    mixer: Arc<Mixer>,
    ctrl_rx: Receiver<ControlMessage>,
    state: Arc<ThreadState>,
}

impl Runner {
    pub(crate) fn new(
        mixer: Arc<Mixer>,
        ctrl_rx: Receiver<ControlMessage>,
        state: Arc<ThreadState>,
    ) -> Self {
        Self {
            mixer,
            ctrl_rx,
            state,
        }
    }

    pub(crate) fn run(&self) {
        self.state.running.store(true, Ordering::Release);
        tracing::info!("mixer thread started");

        let block = self.mixer.config().block_duration();
        loop {
            if self.state.quit.load(Ordering::Acquire) {
                break;
            }
            match self.ctrl_rx.try_recv() {
                Ok(ControlMessage::Stop) | Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }

            if let Err(err) = self.mixer.mix_cycle() {
                self.state.failed_cycles.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("mix cycle failed: {err}");
            }
            self.state.cycles.fetch_add(1, Ordering::Relaxed);

            // Nothing paces the loop without a device; wait out one block.
            if self.mixer.state() == MixerState::NoSound {
                match self.ctrl_rx.recv_timeout(block) {
                    Ok(ControlMessage::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
            }
        }

        self.state.running.store(false, Ordering::Release);
        tracing::info!(
            cycles = self.state.cycles.load(Ordering::Relaxed),
            "mixer thread exiting"
        );
    }
}
