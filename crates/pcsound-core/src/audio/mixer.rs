//! Central mixing engine.
//!
//! The mixer owns the channel registry, the shared effect engines and the
//! working buses. One cycle pulls a block from every enabled channel, runs the
//! master chain and writes the result to the [`AudioOutput`]:
//!
//! accumulate → master gain → reverb → chorus → crossfeed → master high-pass
//! → compressor → soft clip → normalise and write.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard, RwLock};

use super::buffer::FrameBuffer;
use super::channel::{ChannelFeatures, MixerChannel};
use super::chorus::ChorusEngine;
use super::compressor::Compressor;
use super::filters::{BiquadKind, StereoBiquad, db_to_gain, gain_to_db};
use super::output::AudioOutput;
use super::reverb::ReverbEngine;
use super::settings::{
    ChorusPreset, CompressorSettings, CrossfeedPreset, MixerConfig, ReverbPreset,
};
use crate::error::{Error, Result};
use crate::frame::StereoFrame;

/// Full-scale value of the internal 16-bit representation.
const SAMPLE_SCALE: f32 = 32_768.0;
const SAMPLE_MAX: f32 = 32_767.0;
const SAMPLE_MIN: f32 = -32_768.0;
/// Per-frame decay of the peak meter.
const PEAK_DECAY: f32 = 0.999_5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixerState {
    /// No device consumes the output; blocks are mixed and dropped.
    NoSound,
    On,
    /// The device keeps consuming, but only silence is written.
    Muted,
}

/// Send levels pushed to channels by the preset appliers.
#[derive(Debug, Default, Clone, Copy)]
struct SendLevels {
    reverb_synth: f32,
    reverb_digital: f32,
    chorus_synth: f32,
    chorus_digital: f32,
    crossfeed: f32,
}

impl SendLevels {
    fn apply_to(&self, channel: &MixerChannel) {
        let pick = |synth: f32, digital: f32| {
            if channel.has_feature(ChannelFeatures::SYNTHESIZER) {
                synth
            } else if channel.has_feature(ChannelFeatures::DIGITAL_AUDIO) {
                digital
            } else {
                0.0
            }
        };
        if channel.has_feature(ChannelFeatures::REVERB_SEND) {
            channel.set_reverb_level(pick(self.reverb_synth, self.reverb_digital));
        }
        if channel.has_feature(ChannelFeatures::CHORUS_SEND) {
            channel.set_chorus_level(pick(self.chorus_synth, self.chorus_digital));
        }
        let crossfeed = if channel.has_feature(ChannelFeatures::STEREO) {
            self.crossfeed
        } else {
            0.0
        };
        channel.set_crossfeed_strength(crossfeed);
    }
}

/// State guarded by the mixer lock.
struct MixerCore {
    state: MixerState,
    master_gain: f32,

    reverb_preset: ReverbPreset,
    reverb_enabled: bool,
    reverb: ReverbEngine,
    reverb_highpass: StereoBiquad,

    chorus_preset: ChorusPreset,
    chorus_enabled: bool,
    chorus: ChorusEngine,

    crossfeed_preset: CrossfeedPreset,
    crossfeed_strength: f32,

    master_highpass: StereoBiquad,
    compressor_enabled: bool,
    compressor: Compressor,

    soft_clip_threshold: f32,
    peak_tracking: bool,
    peak: StereoFrame,

    output: FrameBuffer,
    reverb_aux: FrameBuffer,
    chorus_aux: FrameBuffer,
    interleaved: Vec<f32>,
}

/// Holds the mixer lock. While a guard is alive no mix cycle can run and the
/// values it reports stay consistent.
pub struct MixerLockGuard<'a> {
    core: MutexGuard<'a, MixerCore>,
}

impl MixerLockGuard<'_> {
    pub fn state(&self) -> MixerState {
        self.core.state
    }

    pub fn master_gain(&self) -> f32 {
        self.core.master_gain
    }

    pub fn reverb_preset(&self) -> ReverbPreset {
        self.core.reverb_preset
    }

    pub fn chorus_preset(&self) -> ChorusPreset {
        self.core.chorus_preset
    }

    pub fn crossfeed_preset(&self) -> CrossfeedPreset {
        self.core.crossfeed_preset
    }

    pub fn peak(&self) -> StereoFrame {
        self.core.peak
    }
}

pub struct Mixer {
    config: MixerConfig,
    channels: DashMap<String, Arc<MixerChannel>>,
    sends: RwLock<SendLevels>,
    core: Mutex<MixerCore>,
    /// Separate from the mixer lock so the output can be disposed while a
    /// cycle is stuck in a producer.
    backend: Mutex<Box<dyn AudioOutput>>,
    disposed: AtomicBool,
}

impl Mixer {
    /// Builds the mixer and starts the output.
    ///
    /// A backend that fails to start, or one that is not real-time, leaves the
    /// mixer in [`MixerState::NoSound`].
    pub fn new(config: MixerConfig, mut backend: Box<dyn AudioOutput>) -> Result<Self> {
        config.validate()?;
        let rate = config.sample_rate;
        let sr = rate as f32;

        let state = match backend.start() {
            Ok(()) if backend.is_realtime() => MixerState::On,
            Ok(()) => MixerState::NoSound,
            Err(err) => {
                tracing::warn!("audio output failed to start, running without sound: {err}");
                MixerState::NoSound
            }
        };

        let core = MixerCore {
            state,
            master_gain: db_to_gain(config.master_gain_db),
            reverb_preset: ReverbPreset::None,
            reverb_enabled: false,
            reverb: ReverbEngine::new(rate),
            reverb_highpass: StereoBiquad::new(BiquadKind::HighPass, sr, 200.0),
            chorus_preset: ChorusPreset::None,
            chorus_enabled: false,
            chorus: ChorusEngine::new(rate),
            crossfeed_preset: CrossfeedPreset::None,
            crossfeed_strength: 0.0,
            master_highpass: StereoBiquad::new(BiquadKind::HighPass, sr, config.master_highpass_hz),
            compressor_enabled: config.compressor.enabled,
            compressor: Compressor::new(rate, &config.compressor),
            soft_clip_threshold: config.soft_clip_threshold,
            peak_tracking: config.peak_tracking,
            peak: StereoFrame::SILENCE,
            output: FrameBuffer::with_capacity(config.block_size),
            reverb_aux: FrameBuffer::with_capacity(config.block_size),
            chorus_aux: FrameBuffer::with_capacity(config.block_size),
            interleaved: Vec::with_capacity(config.block_size * 2),
        };

        let mixer = Self {
            channels: DashMap::new(),
            sends: RwLock::new(SendLevels::default()),
            core: Mutex::new(core),
            backend: Mutex::new(backend),
            disposed: AtomicBool::new(false),
            config,
        };
        mixer.set_reverb_preset(mixer.config.reverb);
        mixer.set_chorus_preset(mixer.config.chorus);
        mixer.set_crossfeed_preset(mixer.config.crossfeed);
        tracing::info!(
            sample_rate = rate,
            block_size = mixer.config.block_size,
            ?state,
            "mixer initialised"
        );
        Ok(mixer)
    }

    pub fn config(&self) -> &MixerConfig {
        &self.config
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    pub fn block_size(&self) -> usize {
        self.config.block_size
    }

    /// Registers a channel, replacing any existing channel with the same name.
    ///
    /// The channel starts disabled and receives the current preset send
    /// levels. `produce` runs on the mixer thread with the mixer lock held, so
    /// it must not call back into mixer methods that take the lock.
    pub fn add_channel(
        &self,
        produce: impl Fn(&MixerChannel, usize) + Send + Sync + 'static,
        sample_rate: u32,
        name: &str,
        features: ChannelFeatures,
    ) -> Arc<MixerChannel> {
        let channel = Arc::new(MixerChannel::new(
            name,
            sample_rate,
            self.config.sample_rate,
            features,
            produce,
        ));
        self.sends.read().apply_to(&channel);
        if self.channels.insert(name.to_owned(), Arc::clone(&channel)).is_some() {
            tracing::debug!(channel = name, "replaced existing mixer channel");
        }
        tracing::debug!(channel = name, sample_rate, ?features, "registered mixer channel");
        channel
    }

    /// Disables and removes a channel.
    pub fn deregister_channel(&self, name: &str) -> Result<()> {
        let (_, channel) = self
            .channels
            .remove(name)
            .ok_or_else(|| Error::ChannelNotFound(name.to_owned()))?;
        channel.enable(false);
        tracing::debug!(channel = name, "deregistered mixer channel");
        Ok(())
    }

    pub fn find_channel(&self, name: &str) -> Option<Arc<MixerChannel>> {
        self.channels.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Names of all registered channels, in no particular order.
    pub fn channels(&self) -> Vec<String> {
        self.channels.iter().map(|entry| entry.key().clone()).collect()
    }

    fn snapshot_channels(&self) -> Vec<Arc<MixerChannel>> {
        self.channels.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    /// Takes the mixer lock for a consistent view of mixer state.
    pub fn lock(&self) -> MixerLockGuard<'_> {
        MixerLockGuard {
            core: self.core.lock(),
        }
    }

    pub fn state(&self) -> MixerState {
        if self.disposed.load(Ordering::Acquire) {
            return MixerState::NoSound;
        }
        self.core.lock().state
    }

    pub fn mute(&self) {
        let mut core = self.core.lock();
        if core.state == MixerState::On {
            core.state = MixerState::Muted;
            tracing::info!("mixer muted");
        }
    }

    pub fn unmute(&self) {
        let mut core = self.core.lock();
        if core.state == MixerState::Muted {
            core.state = MixerState::On;
            tracing::info!("mixer unmuted");
        }
    }

    pub fn master_gain(&self) -> f32 {
        self.core.lock().master_gain
    }

    pub fn set_master_gain(&self, gain: f32) {
        self.core.lock().master_gain = gain.max(0.0);
    }

    pub fn set_master_gain_db(&self, db: f32) {
        self.set_master_gain(db_to_gain(db));
    }

    pub fn master_gain_db(&self) -> f32 {
        gain_to_db(self.master_gain())
    }

    pub fn reverb_preset(&self) -> ReverbPreset {
        self.core.lock().reverb_preset
    }

    pub fn chorus_preset(&self) -> ChorusPreset {
        self.core.lock().chorus_preset
    }

    pub fn crossfeed_preset(&self) -> CrossfeedPreset {
        self.core.lock().crossfeed_preset
    }

    pub fn set_reverb_preset(&self, preset: ReverbPreset) {
        {
            let mut core = self.core.lock();
            if core.reverb_preset == preset {
                return;
            }
            core.reverb_preset = preset;
            let mut sends = self.sends.write();
            match preset.params() {
                None => {
                    core.reverb_enabled = false;
                    sends.reverb_synth = 0.0;
                    sends.reverb_digital = 0.0;
                }
                Some(p) => {
                    let sr = self.config.sample_rate as f32;
                    let reverb = &mut core.reverb;
                    reverb.set_predelay(p.predelay);
                    reverb.set_early_mix(p.early_mix);
                    reverb.set_density(p.density);
                    reverb.set_bandwidth(p.bandwidth);
                    reverb.set_decay(p.decay);
                    reverb.set_damping(p.damping);
                    reverb.set_gain(1.0);
                    reverb.set_mix(1.0);
                    reverb.set_size(p.size);
                    core.reverb_highpass
                        .configure(BiquadKind::HighPass, sr, p.highpass_hz);
                    core.reverb_highpass.reset();
                    core.reverb_enabled = true;
                    sends.reverb_synth = p.synth_send;
                    sends.reverb_digital = p.digital_send;
                }
            }
        }
        tracing::debug!(?preset, "reverb preset changed");
        self.push_send_levels();
    }

    pub fn set_chorus_preset(&self, preset: ChorusPreset) {
        {
            let mut core = self.core.lock();
            if core.chorus_preset == preset {
                return;
            }
            core.chorus_preset = preset;
            let (synth, digital) = preset.sends();
            core.chorus_enabled = preset != ChorusPreset::None;
            if core.chorus_enabled {
                core.chorus.set_sample_rate(self.config.sample_rate);
                core.chorus.set_enables_chorus(true, false);
            }
            let mut sends = self.sends.write();
            sends.chorus_synth = synth;
            sends.chorus_digital = digital;
        }
        tracing::debug!(?preset, "chorus preset changed");
        self.push_send_levels();
    }

    pub fn set_crossfeed_preset(&self, preset: CrossfeedPreset) {
        {
            let mut core = self.core.lock();
            if core.crossfeed_preset == preset {
                return;
            }
            core.crossfeed_preset = preset;
            core.crossfeed_strength = preset.strength();
            self.sends.write().crossfeed = preset.strength();
        }
        tracing::debug!(?preset, "crossfeed preset changed");
        self.push_send_levels();
    }

    pub fn set_compressor_enabled(&self, enabled: bool) {
        let mut core = self.core.lock();
        if core.compressor_enabled != enabled {
            core.compressor_enabled = enabled;
            core.compressor.reset();
        }
    }

    pub fn configure_compressor(&self, settings: &CompressorSettings) {
        let mut core = self.core.lock();
        core.compressor_enabled = settings.enabled;
        core.compressor.configure(self.config.sample_rate, settings);
    }

    /// Decaying peak of the output, when peak tracking is enabled.
    pub fn peak(&self) -> StereoFrame {
        self.core.lock().peak
    }

    fn push_send_levels(&self) {
        let sends = *self.sends.read();
        for channel in self.snapshot_channels() {
            sends.apply_to(&channel);
        }
    }

    /// Runs one full cycle of `block_size` frames.
    pub fn mix_cycle(&self) -> Result<()> {
        self.mix_block(self.config.block_size)
    }

    /// Mixes `frames` frames and writes them to the output.
    pub fn mix_block(&self, frames: usize) -> Result<()> {
        self.check_block(frames)?;
        let mut core = self.core.lock();
        self.run_cycle(&mut core, frames);
        Ok(())
    }

    /// Mixes one millisecond without waiting for the lock. Returns false, and
    /// mixes nothing, if the lock is held elsewhere.
    pub fn try_tick(&self) -> bool {
        let Some(mut core) = self.core.try_lock() else {
            tracing::trace!("mixer busy, skipping tick");
            return false;
        };
        self.run_cycle(&mut core, self.config.frames_per_ms());
        true
    }

    /// Stops the output device. Safe to call more than once.
    pub fn dispose_output(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.backend.lock().dispose();
        if let Some(mut core) = self.core.try_lock() {
            core.state = MixerState::NoSound;
        }
        tracing::info!("audio output disposed");
    }

    fn check_block(&self, frames: usize) -> Result<()> {
        if frames > self.config.max_block_size {
            return Err(Error::BlockTooLarge {
                requested: frames,
                max: self.config.max_block_size,
            });
        }
        Ok(())
    }

    fn run_cycle(&self, core: &mut MixerCore, frames: usize) {
        self.accumulate_channels(core, frames);
        core.process_master(frames);
        if let Some(samples) = core.render_output() {
            self.write_backend(samples);
        }
    }

    fn write_backend(&self, samples: &[f32]) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        if let Err(err) = self.backend.lock().write_data(samples) {
            tracing::warn!("audio output write failed: {err}");
        }
    }

    fn accumulate_channels(&self, core: &mut MixerCore, frames: usize) {
        core.output.reset_to(frames);
        core.reverb_aux.reset_to(frames);
        core.chorus_aux.reset_to(frames);

        let MixerCore {
            output,
            reverb_aux,
            chorus_aux,
            reverb_enabled,
            chorus_enabled,
            ..
        } = core;

        for channel in self.snapshot_channels() {
            if !channel.is_enabled() {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| channel.mix(frames))).is_err() {
                let failures = channel.record_failure();
                tracing::error!(
                    channel = channel.name(),
                    failures,
                    "channel production callback panicked, skipping it this cycle"
                );
                continue;
            }
            let reverb = (*reverb_enabled).then_some(reverb_aux.as_mut_slice());
            let chorus = (*chorus_enabled).then_some(chorus_aux.as_mut_slice());
            channel.accumulate_into(frames, output.as_mut_slice(), reverb, chorus);
        }
    }
}

impl MixerCore {
    fn process_master(&mut self, frames: usize) {
        let gain = self.master_gain;
        for frame in self.output.iter_mut() {
            *frame = *frame * gain;
        }

        if self.reverb_enabled {
            self.reverb_highpass.process_slice(&mut self.reverb_aux);
            self.reverb.process_frames(&mut self.reverb_aux);
            for (out, wet) in self.output.iter_mut().zip(self.reverb_aux.iter()) {
                *out += *wet;
            }
        }

        if self.chorus_enabled {
            self.chorus.process_frames(&mut self.chorus_aux);
            for (out, wet) in self.output.iter_mut().zip(self.chorus_aux.iter()) {
                *out += *wet;
            }
        }

        if self.crossfeed_strength > 0.0 {
            apply_crossfeed(&mut self.output, self.crossfeed_strength);
        }

        self.master_highpass.process_slice(&mut self.output);

        if self.compressor_enabled {
            for frame in self.output.iter_mut() {
                *frame = self.compressor.process(*frame);
            }
        }

        let threshold = self.soft_clip_threshold;
        for frame in self.output.iter_mut() {
            *frame = frame.map(|s| soft_clip(s, threshold));
            if self.peak_tracking {
                self.peak = StereoFrame::new(
                    (self.peak.left * PEAK_DECAY).max(frame.left.abs()),
                    (self.peak.right * PEAK_DECAY).max(frame.right.abs()),
                );
            }
        }
        debug_assert_eq!(self.output.len(), frames);
    }

    /// Interleaved, normalised block for the output, or `None` when nothing
    /// consumes it.
    fn render_output(&mut self) -> Option<&[f32]> {
        match self.state {
            MixerState::NoSound => return None,
            MixerState::On => self.output.write_interleaved(&mut self.interleaved, 1.0 / SAMPLE_SCALE),
            MixerState::Muted => {
                self.interleaved.clear();
                self.interleaved.resize(self.output.len() * 2, 0.0);
            }
        }
        Some(&self.interleaved)
    }
}

/// Leaks a fraction of each side into the other.
pub fn apply_crossfeed(frames: &mut [StereoFrame], strength: f32) {
    for frame in frames {
        let StereoFrame { left, right } = *frame;
        *frame = StereoFrame::new(left + right * strength, right + left * strength);
    }
}

/// Halves the overshoot above `threshold`, then clamps to the 16-bit range.
pub fn soft_clip(sample: f32, threshold: f32) -> f32 {
    let magnitude = sample.abs();
    let shaped = if magnitude <= threshold {
        sample
    } else {
        (threshold + (magnitude - threshold) * 0.5).copysign(sample)
    };
    shaped.clamp(SAMPLE_MIN, SAMPLE_MAX)
}
