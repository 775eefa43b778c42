//! Per-device audio channel feeding the mixer.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;
use parking_lot::Mutex;

use super::buffer::FrameBuffer;
use super::filters::{BiquadKind, NoiseGate, StereoBiquad};
use crate::frame::StereoFrame;

/// Silence after which a sleep-capable channel stops being pulled.
const SLEEP_AFTER_MS: usize = 500;
/// Length of the fade applied before sleeping when the channel asks for it.
const FADE_OUT_MS: usize = 300;
/// Magnitude (16-bit scale) below which a frame counts as silence.
const SILENCE_THRESHOLD: f32 = 1.0;
/// Upper bound on callback invocations per mix request.
const MAX_PRODUCE_ATTEMPTS: usize = 8;

const NOISE_GATE_THRESHOLD_DB: f32 = -61.0;
const NOISE_GATE_ATTACK_MS: f32 = 1.0;
const NOISE_GATE_RELEASE_MS: f32 = 20.0;

bitflags! {
    /// Capabilities a device declares when registering its channel.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ChannelFeatures: u16 {
        const STEREO = 1 << 0;
        const DIGITAL_AUDIO = 1 << 1;
        const SYNTHESIZER = 1 << 2;
        const REVERB_SEND = 1 << 3;
        const CHORUS_SEND = 1 << 4;
        const SLEEP = 1 << 5;
        const FADE_OUT = 1 << 6;
        const NOISE_GATE = 1 << 7;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineIndex {
    #[default]
    Left,
    Right,
}

/// Which input line feeds each output side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StereoLine {
    pub left: LineIndex,
    pub right: LineIndex,
}

impl StereoLine {
    pub const STRAIGHT: Self = Self {
        left: LineIndex::Left,
        right: LineIndex::Right,
    };
    pub const REVERSED: Self = Self {
        left: LineIndex::Right,
        right: LineIndex::Left,
    };

    fn apply(self, frame: StereoFrame) -> StereoFrame {
        let pick = |line| match line {
            LineIndex::Left => frame.left,
            LineIndex::Right => frame.right,
        };
        StereoFrame::new(pick(self.left), pick(self.right))
    }
}

impl Default for StereoLine {
    fn default() -> Self {
        Self::STRAIGHT
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResampleMethod {
    /// Linear interpolation, with a band-limiting low-pass when decimating.
    #[default]
    LinearInterpolation,
    /// Hold each input frame until the next one, like an unfiltered DAC.
    ZeroOrderHold,
}

/// Raw sample encodings accepted by [`MixerChannel::add_samples`].
pub trait Sample: Copy {
    /// Converts to the mixer's 16-bit float scale.
    fn to_mixer(self) -> f32;
}

impl Sample for u8 {
    fn to_mixer(self) -> f32 {
        (self as f32 - 128.0) * 256.0
    }
}

impl Sample for i8 {
    fn to_mixer(self) -> f32 {
        self as f32 * 256.0
    }
}

impl Sample for i16 {
    fn to_mixer(self) -> f32 {
        self as f32
    }
}

impl Sample for u16 {
    fn to_mixer(self) -> f32 {
        self as f32 - 32_768.0
    }
}

impl Sample for f32 {
    fn to_mixer(self) -> f32 {
        self
    }
}

/// Streaming rate converter from a channel's native rate to the mixer rate.
#[derive(Debug, Clone)]
struct Resampler {
    method: ResampleMethod,
    step: f64,
    phase: f64,
    prev: StereoFrame,
    anti_alias: Option<StereoBiquad>,
}

impl Resampler {
    fn new(method: ResampleMethod, in_rate: u32, out_rate: u32) -> Self {
        let in_rate = in_rate.max(1);
        let out_rate = out_rate.max(1);
        let anti_alias = (method == ResampleMethod::LinearInterpolation && in_rate > out_rate)
            .then(|| StereoBiquad::new(BiquadKind::LowPass, in_rate as f32, out_rate as f32 * 0.45));
        Self {
            method,
            step: in_rate as f64 / out_rate as f64,
            phase: 0.0,
            prev: StereoFrame::SILENCE,
            anti_alias,
        }
    }

    fn is_passthrough(&self) -> bool {
        self.step == 1.0
    }

    fn push(&mut self, frame: StereoFrame, out: &mut FrameBuffer) {
        if self.is_passthrough() {
            out.push(frame);
            return;
        }
        let cur = match &mut self.anti_alias {
            Some(filter) => filter.process(frame),
            None => frame,
        };
        while self.phase < 1.0 {
            let sample = match self.method {
                ResampleMethod::LinearInterpolation => {
                    let t = self.phase as f32;
                    self.prev + (cur - self.prev) * t
                }
                ResampleMethod::ZeroOrderHold => self.prev,
            };
            out.push(sample);
            self.phase += self.step;
        }
        self.phase -= 1.0;
        self.prev = cur;
    }
}

/// Tracks silence on a channel and decides when it can stop being pulled.
#[derive(Debug, Clone)]
struct Sleeper {
    sleep_after: usize,
    fade_frames: usize,
    wants_fadeout: bool,
    had_signal: bool,
    frames_awake: usize,
    fade_level: f32,
}

impl Sleeper {
    fn new(mixer_rate: u32, wants_fadeout: bool) -> Self {
        let per_ms = (mixer_rate as usize / 1000).max(1);
        Self {
            sleep_after: SLEEP_AFTER_MS * per_ms,
            fade_frames: FADE_OUT_MS * per_ms,
            wants_fadeout,
            had_signal: false,
            frames_awake: 0,
            fade_level: 1.0,
        }
    }

    fn fade_or_listen(&mut self, frame: StereoFrame) -> StereoFrame {
        if self.wants_fadeout {
            return frame * self.fade_level;
        }
        if !self.had_signal {
            self.had_signal = frame.peak() > SILENCE_THRESHOLD;
        }
        frame
    }

    /// Returns true once the channel should be put to sleep.
    fn should_sleep(&mut self, consumed: usize) -> bool {
        self.frames_awake += consumed;
        if self.frames_awake < self.sleep_after {
            return false;
        }
        if self.wants_fadeout {
            if self.fade_level > 0.0 {
                let faded = (self.frames_awake - self.sleep_after) as f32 / self.fade_frames as f32;
                self.fade_level = (1.0 - faded).max(0.0);
                return false;
            }
        } else if self.had_signal {
            self.frames_awake = 0;
            self.had_signal = false;
            return false;
        }
        true
    }

    fn wake(&mut self) {
        self.frames_awake = 0;
        self.fade_level = 1.0;
        self.had_signal = false;
    }
}

#[derive(Debug, Clone)]
struct ChannelState {
    sample_rate: u32,
    app_volume: StereoFrame,
    user_volume: StereoFrame,
    reverb_level: f32,
    chorus_level: f32,
    crossfeed_strength: f32,
    channel_map: StereoLine,
    resampler: Resampler,
    noise_gate: Option<NoiseGate>,
    sleeper: Option<Sleeper>,
    frames: FrameBuffer,
}

impl ChannelState {
    fn volume(&self) -> StereoFrame {
        self.app_volume * self.user_volume
    }
}

/// Production callback: asked for `frames` frames at the channel's native
/// rate, it pushes them with one of the `add_*` methods.
pub type ProduceFn = dyn Fn(&MixerChannel, usize) + Send + Sync;

/// One audio source attached to the mixer.
///
/// Producers may append samples from any thread; the mixer thread pulls from
/// the channel through [`MixerChannel::mix`] and consumes frames FIFO.
pub struct MixerChannel {
    name: String,
    features: ChannelFeatures,
    mixer_rate: u32,
    produce: Box<ProduceFn>,
    enabled: AtomicBool,
    failures: AtomicU32,
    frames_mixed: AtomicU64,
    state: Mutex<ChannelState>,
}

impl fmt::Debug for MixerChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MixerChannel")
            .field("name", &self.name)
            .field("features", &self.features)
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}

impl MixerChannel {
    pub(crate) fn new(
        name: &str,
        sample_rate: u32,
        mixer_rate: u32,
        features: ChannelFeatures,
        produce: impl Fn(&MixerChannel, usize) + Send + Sync + 'static,
    ) -> Self {
        let sleeper = features
            .contains(ChannelFeatures::SLEEP)
            .then(|| Sleeper::new(mixer_rate, features.contains(ChannelFeatures::FADE_OUT)));
        let noise_gate = features.contains(ChannelFeatures::NOISE_GATE).then(|| {
            NoiseGate::new(
                mixer_rate as f32,
                NOISE_GATE_THRESHOLD_DB,
                NOISE_GATE_ATTACK_MS,
                NOISE_GATE_RELEASE_MS,
            )
        });
        Self {
            name: name.to_owned(),
            features,
            mixer_rate,
            produce: Box::new(produce),
            enabled: AtomicBool::new(false),
            failures: AtomicU32::new(0),
            frames_mixed: AtomicU64::new(0),
            state: Mutex::new(ChannelState {
                sample_rate,
                app_volume: StereoFrame::splat(1.0),
                user_volume: StereoFrame::splat(1.0),
                reverb_level: 0.0,
                chorus_level: 0.0,
                crossfeed_strength: 0.0,
                channel_map: StereoLine::STRAIGHT,
                resampler: Resampler::new(ResampleMethod::default(), sample_rate, mixer_rate),
                noise_gate,
                sleeper,
                frames: FrameBuffer::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn features(&self) -> ChannelFeatures {
        self.features
    }

    pub fn has_feature(&self, feature: ChannelFeatures) -> bool {
        self.features.contains(feature)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Gates whether the mixer pulls from this channel. Buffered frames are kept.
    pub fn enable(&self, enabled: bool) {
        let was = self.enabled.swap(enabled, Ordering::AcqRel);
        if was != enabled {
            tracing::debug!(channel = %self.name, enabled, "channel enable changed");
            if enabled && let Some(sleeper) = self.state.lock().sleeper.as_mut() {
                sleeper.wake();
            }
        }
    }

    /// Restarts the sleep timer, re-enabling the channel if it was asleep.
    /// Returns true if the channel had to be woken.
    pub fn wake_up(&self) -> bool {
        if let Some(sleeper) = self.state.lock().sleeper.as_mut() {
            sleeper.wake();
        }
        if self.is_enabled() {
            return false;
        }
        self.enable(true);
        true
    }

    pub fn sample_rate(&self) -> u32 {
        self.state.lock().sample_rate
    }

    pub fn set_sample_rate(&self, sample_rate: u32) {
        let mut state = self.state.lock();
        if state.sample_rate == sample_rate {
            return;
        }
        state.sample_rate = sample_rate;
        let method = state.resampler.method;
        state.resampler = Resampler::new(method, sample_rate, self.mixer_rate);
    }

    pub fn set_resample_method(&self, method: ResampleMethod) {
        let mut state = self.state.lock();
        let rate = state.sample_rate;
        state.resampler = Resampler::new(method, rate, self.mixer_rate);
    }

    /// Gain set by the emulated hardware (e.g. a mixer chip register).
    pub fn set_app_volume(&self, volume: StereoFrame) {
        self.state.lock().app_volume = volume;
    }

    /// Gain set by the user.
    pub fn set_user_volume(&self, volume: StereoFrame) {
        self.state.lock().user_volume = volume;
    }

    pub fn volume(&self) -> StereoFrame {
        self.state.lock().volume()
    }

    pub fn set_channel_map(&self, map: StereoLine) {
        self.state.lock().channel_map = map;
    }

    pub fn set_reverb_level(&self, level: f32) {
        self.state.lock().reverb_level = level.clamp(0.0, 1.0);
    }

    pub fn reverb_level(&self) -> f32 {
        self.state.lock().reverb_level
    }

    pub fn set_chorus_level(&self, level: f32) {
        self.state.lock().chorus_level = level.clamp(0.0, 1.0);
    }

    pub fn chorus_level(&self) -> f32 {
        self.state.lock().chorus_level
    }

    /// Crossfeed strength the active preset assigns to this channel.
    ///
    /// Informational only: the mixer applies crossfeed once on the master bus,
    /// so this value is never read while mixing.
    pub fn set_crossfeed_strength(&self, strength: f32) {
        self.state.lock().crossfeed_strength = strength.clamp(0.0, 1.0);
    }

    pub fn crossfeed_strength(&self) -> f32 {
        self.state.lock().crossfeed_strength
    }

    /// Frames buffered at the mixer rate and not yet consumed.
    pub fn buffered_frames(&self) -> usize {
        self.state.lock().frames.len()
    }

    /// Frames this channel has contributed to the mix so far.
    pub fn frames_mixed(&self) -> u64 {
        self.frames_mixed.load(Ordering::Relaxed)
    }

    /// Production callbacks that panicked.
    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    pub(crate) fn record_failure(&self) -> u32 {
        self.failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Appends interleaved (`stereo`) or mono samples.
    pub fn add_samples<T: Sample>(&self, data: &[T], stereo: bool) {
        if stereo {
            self.add_frames(
                data.chunks_exact(2)
                    .map(|pair| StereoFrame::new(pair[0].to_mixer(), pair[1].to_mixer())),
            );
        } else {
            self.add_frames(data.iter().map(|s| StereoFrame::splat(s.to_mixer())));
        }
    }

    pub fn add_samples_m8(&self, data: &[u8]) {
        self.add_samples(data, false);
    }

    pub fn add_samples_s8(&self, data: &[u8]) {
        self.add_samples(data, true);
    }

    pub fn add_samples_m16(&self, data: &[i16]) {
        self.add_samples(data, false);
    }

    pub fn add_samples_s16(&self, data: &[i16]) {
        self.add_samples(data, true);
    }

    /// Mono float samples already in 16-bit scale.
    pub fn add_samples_mfloat(&self, data: &[f32]) {
        self.add_samples(data, false);
    }

    /// Interleaved float samples already in 16-bit scale.
    pub fn add_samples_sfloat(&self, data: &[f32]) {
        self.add_samples(data, true);
    }

    pub fn add_stereo_frames(&self, frames: &[StereoFrame]) {
        self.add_frames(frames.iter().copied());
    }

    /// Appends `count` silent frames, e.g. to pad an underrunning producer.
    pub fn add_silence(&self, count: usize) {
        self.add_frames(std::iter::repeat_n(StereoFrame::SILENCE, count));
    }

    fn add_frames(&self, frames: impl Iterator<Item = StereoFrame>) {
        let mut heard_signal = false;
        {
            let mut state = self.state.lock();
            let ChannelState {
                app_volume,
                user_volume,
                channel_map,
                resampler,
                noise_gate,
                frames: buffer,
                ..
            } = &mut *state;
            let volume = *app_volume * *user_volume;
            for frame in frames {
                let mut frame = channel_map.apply(frame) * volume;
                if let Some(gate) = noise_gate {
                    frame = gate.process(frame);
                }
                heard_signal |= frame.peak() > SILENCE_THRESHOLD;
                resampler.push(frame, buffer);
            }
        }
        if heard_signal && self.features.contains(ChannelFeatures::SLEEP) && !self.is_enabled() {
            self.wake_up();
        }
    }

    /// Pulls from the production callback until at least `frames_requested`
    /// frames are buffered, or the callback stops producing.
    ///
    /// Only the mixer calls this; the callback runs without the channel lock
    /// held so it can push samples back into the channel.
    pub fn mix(&self, frames_requested: usize) {
        if !self.is_enabled() {
            return;
        }
        for _ in 0..MAX_PRODUCE_ATTEMPTS {
            let (have, native) = {
                let state = self.state.lock();
                let have = state.frames.len();
                if have >= frames_requested {
                    return;
                }
                let missing = (frames_requested - have) as u64;
                let native = (missing * state.sample_rate as u64).div_ceil(self.mixer_rate.max(1) as u64);
                (have, native.max(1) as usize)
            };
            (self.produce)(self, native);
            if self.buffered_frames() <= have {
                return;
            }
        }
    }

    /// Consumes up to `frames` buffered frames into the mixer's buses.
    ///
    /// Each frame passes the sleep/fade listener, is summed into `out`, and
    /// scaled copies go to the reverb and chorus buses when they are given and
    /// this channel has a non-zero send. Returns the number of frames consumed.
    pub(crate) fn accumulate_into(
        &self,
        frames: usize,
        out: &mut [StereoFrame],
        mut reverb: Option<&mut [StereoFrame]>,
        mut chorus: Option<&mut [StereoFrame]>,
    ) -> usize {
        let mut state = self.state.lock();
        let ChannelState {
            reverb_level,
            chorus_level,
            sleeper,
            frames: buffer,
            ..
        } = &mut *state;

        let count = frames.min(buffer.len()).min(out.len());
        let reverb_gain = if self.features.contains(ChannelFeatures::REVERB_SEND) {
            *reverb_level
        } else {
            0.0
        };
        let chorus_gain = if self.features.contains(ChannelFeatures::CHORUS_SEND) {
            *chorus_level
        } else {
            0.0
        };

        for i in 0..count {
            let mut frame = buffer[i];
            if let Some(sleeper) = sleeper.as_mut() {
                frame = sleeper.fade_or_listen(frame);
            }
            out[i] += frame;
            if reverb_gain > 0.0
                && let Some(bus) = reverb.as_deref_mut()
            {
                bus[i] += frame * reverb_gain;
            }
            if chorus_gain > 0.0
                && let Some(bus) = chorus.as_deref_mut()
            {
                bus[i] += frame * chorus_gain;
            }
        }

        let consumed = buffer.consume_front(count);
        debug_assert_eq!(consumed, count);
        self.frames_mixed.fetch_add(count as u64, Ordering::Relaxed);

        let sleep = sleeper.as_mut().is_some_and(|s| s.should_sleep(count));
        drop(state);
        if sleep {
            tracing::debug!(channel = %self.name, "channel went to sleep");
            self.enabled.store(false, Ordering::Release);
        }
        count
    }
}
