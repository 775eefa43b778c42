//! Two-voice stereo chorus.
//!
//! Each voice is a short delay line whose read position is swept by a slow
//! LFO. Voice outputs are DC-blocked and added to the dry input at a fixed
//! wet gain.

use std::f32::consts::PI;

use once_cell::sync::Lazy;

use super::filters::DcBlocker;
use crate::frame::StereoFrame;

const WET_GAIN: f32 = 1.4;
const DC_BLOCK_CUTOFF: f32 = 0.01;
const VOICE_LOWPASS: f32 = 0.95;
const VOICE_DELAY_MS: f32 = 7.0;

const TABLE_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LfoWaveform {
    Sine,
    #[default]
    Triangle,
    Saw,
    Rectangle,
    Exponential,
    /// Sample-and-hold of the noise oscillator, refreshed once per cycle.
    Random,
}

/// One period per table with a guard point at the end for interpolation.
struct LfoTables {
    sine: [f32; TABLE_LEN + 1],
    triangle: [f32; TABLE_LEN + 1],
    saw: [f32; TABLE_LEN + 1],
    rectangle: [f32; TABLE_LEN + 1],
    exponential: [f32; TABLE_LEN + 1],
}

static LFO_TABLES: Lazy<LfoTables> = Lazy::new(|| {
    let build = |f: fn(f32) -> f32| {
        let mut table = [0.0; TABLE_LEN + 1];
        for (i, v) in table.iter_mut().take(TABLE_LEN).enumerate() {
            *v = f(i as f32 / TABLE_LEN as f32);
        }
        table[TABLE_LEN] = table[0];
        table
    };
    LfoTables {
        sine: build(|x| (2.0 * PI * x).sin()),
        triangle: build(|x| if x < 0.5 { 4.0 * x - 1.0 } else { 3.0 - 4.0 * x }),
        saw: build(|x| 2.0 * x - 1.0),
        rectangle: build(|x| if x < 0.5 { 1.0 } else { -1.0 }),
        exponential: build(|x| {
            let e = (4.0_f32).exp() - 1.0;
            2.0 * ((4.0 * x).exp() - 1.0) / e - 1.0
        }),
    }
});

/// Park-Miller style LCG producing values in `[-1, 1)`.
#[derive(Debug, Clone, Copy)]
pub struct NoiseOscillator {
    seed: i32,
}

impl Default for NoiseOscillator {
    fn default() -> Self {
        Self { seed: 1 }
    }
}

impl NoiseOscillator {
    pub fn next_sample(&mut self) -> f32 {
        self.seed = self.seed.wrapping_mul(16807);
        self.seed as f32 * 4.656_613e-10
    }
}

/// Table-lookup LFO with linear interpolation.
#[derive(Debug, Clone, Copy)]
pub struct Lfo {
    waveform: LfoWaveform,
    phase: f32,
    inc: f32,
    noise: NoiseOscillator,
    held: f32,
}

impl Lfo {
    /// `start_phase` is in cycles, `[0, 1)`.
    pub fn new(sample_rate: f32, rate_hz: f32, start_phase: f32, waveform: LfoWaveform) -> Self {
        let mut noise = NoiseOscillator::default();
        let held = noise.next_sample();
        Self {
            waveform,
            phase: start_phase.rem_euclid(1.0) * TABLE_LEN as f32,
            inc: TABLE_LEN as f32 * rate_hz / sample_rate.max(1.0),
            noise,
            held,
        }
    }

    pub fn tick(&mut self) -> f32 {
        let index = self.phase as usize;
        let frac = self.phase - index as f32;
        let tables = &*LFO_TABLES;
        let table = match self.waveform {
            LfoWaveform::Sine => &tables.sine,
            LfoWaveform::Triangle => &tables.triangle,
            LfoWaveform::Saw => &tables.saw,
            LfoWaveform::Rectangle => &tables.rectangle,
            LfoWaveform::Exponential => &tables.exponential,
            LfoWaveform::Random => {
                self.advance();
                return self.held;
            }
        };
        let out = table[index] + (table[index + 1] - table[index]) * frac;
        self.advance();
        out
    }

    fn advance(&mut self) {
        self.phase += self.inc;
        if self.phase >= TABLE_LEN as f32 {
            self.phase -= TABLE_LEN as f32;
            self.held = self.noise.next_sample();
        }
    }
}

/// `p = (c * 0.98)^4` smoothing pole.
#[derive(Debug, Default, Clone, Copy)]
struct OnePole {
    state: f32,
}

impl OnePole {
    fn tick(&mut self, input: f32, cutoff: f32) -> f32 {
        let p = (cutoff * 0.98).powi(4);
        self.state = (1.0 - p) * input + p * self.state;
        self.state
    }
}

/// A single modulated delay line.
#[derive(Debug, Clone)]
struct ChorusVoice {
    line: Vec<f32>,
    write: usize,
    delay_samples: f32,
    lfo: Lfo,
    z1: f32,
    lowpass: OnePole,
}

impl ChorusVoice {
    fn new(sample_rate: f32, phase: f32, rate_hz: f32, delay_ms: f32) -> Self {
        let delay_samples = delay_ms * sample_rate * 0.001;
        let len = ((delay_samples.floor() as usize) * 2).max(2);
        Self {
            line: vec![0.0; len],
            write: len - 1,
            delay_samples,
            // A phase of 1.0 starts the sweep at its peak, 0.0 at its trough.
            lfo: Lfo::new(sample_rate, rate_hz, phase * 0.5, LfoWaveform::Triangle),
            z1: 0.0,
            lowpass: OnePole::default(),
        }
    }

    fn process(&mut self, input: f32) -> f32 {
        let len = self.line.len();
        let offset = (self.lfo.tick() * 0.3 + 0.4) * self.delay_samples;
        let whole = offset.floor();
        let frac = offset - whole;

        let ptr = (self.write + len - (whole as usize % len)) % len;
        let ptr2 = (ptr + len - 1) % len;

        let out = self.line[ptr2] + self.line[ptr] * (1.0 - frac) - (1.0 - frac) * self.z1;
        self.z1 = out;
        let out = self.lowpass.tick(out, VOICE_LOWPASS);

        self.line[self.write] = input;
        self.write += 1;
        if self.write >= len {
            self.write = 0;
        }
        out
    }
}

#[derive(Debug, Clone)]
struct StereoVoice {
    left: ChorusVoice,
    right: ChorusVoice,
    dc_left: DcBlocker,
    dc_right: DcBlocker,
}

impl StereoVoice {
    fn new(sample_rate: f32, phase_left: f32, phase_right: f32, rate_hz: f32) -> Self {
        let dc = DcBlocker::new(0.999 - DC_BLOCK_CUTOFF * 0.4);
        Self {
            left: ChorusVoice::new(sample_rate, phase_left, rate_hz, VOICE_DELAY_MS),
            right: ChorusVoice::new(sample_rate, phase_right, rate_hz, VOICE_DELAY_MS),
            dc_left: dc,
            dc_right: dc,
        }
    }
}

/// Stereo chorus with two independently enabled voices.
#[derive(Debug, Clone)]
pub struct ChorusEngine {
    sample_rate: u32,
    chorus1: StereoVoice,
    chorus2: StereoVoice,
    chorus1_enabled: bool,
    chorus2_enabled: bool,
}

impl ChorusEngine {
    /// Creates an engine with both voices disabled.
    pub fn new(sample_rate: u32) -> Self {
        let sr = sample_rate.max(1) as f32;
        Self {
            sample_rate,
            chorus1: StereoVoice::new(sr, 1.0, 0.0, 0.5),
            chorus2: StereoVoice::new(sr, 0.0, 1.0, 0.83),
            chorus1_enabled: false,
            chorus2_enabled: false,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Rebuilds both voices for the new rate. Leaves both voices disabled.
    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        *self = Self::new(sample_rate);
    }

    pub fn set_enables_chorus(&mut self, chorus1: bool, chorus2: bool) {
        self.chorus1_enabled = chorus1;
        self.chorus2_enabled = chorus2;
    }

    pub fn enabled(&self) -> (bool, bool) {
        (self.chorus1_enabled, self.chorus2_enabled)
    }

    /// Processes one stereo sample in place.
    pub fn process(&mut self, left: &mut f32, right: &mut f32) {
        let mut wet_l = 0.0;
        let mut wet_r = 0.0;

        if self.chorus1_enabled {
            wet_l += self.chorus1.left.process(*left);
            wet_r += self.chorus1.right.process(*right);
            wet_l = self.chorus1.dc_left.process(wet_l);
            wet_r = self.chorus1.dc_right.process(wet_r);
        }
        if self.chorus2_enabled {
            wet_l += self.chorus2.left.process(*left);
            wet_r += self.chorus2.right.process(*right);
            wet_l = self.chorus2.dc_left.process(wet_l);
            wet_r = self.chorus2.dc_right.process(wet_r);
        }

        *left += wet_l * WET_GAIN;
        *right += wet_r * WET_GAIN;
    }

    pub fn process_frames(&mut self, frames: &mut [StereoFrame]) {
        for frame in frames {
            let StereoFrame { left, right } = frame;
            self.process(left, right);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_engine_is_transparent() {
        let mut chorus = ChorusEngine::new(48_000);
        let mut frames: Vec<_> = (0..256).map(|i| StereoFrame::splat(i as f32)).collect();
        let dry = frames.clone();
        chorus.process_frames(&mut frames);
        assert_eq!(frames, dry);
    }

    #[test]
    fn set_sample_rate_disables_voices() {
        let mut chorus = ChorusEngine::new(48_000);
        chorus.set_enables_chorus(true, true);
        chorus.set_sample_rate(44_100);
        assert_eq!(chorus.enabled(), (false, false));
        assert_eq!(chorus.sample_rate(), 44_100);
        assert_eq!(chorus.chorus1.left.line.len(), (7.0_f32 * 44_100.0 * 0.001).floor() as usize * 2);
    }

    #[test]
    fn enabled_voice_adds_wet_signal() {
        let mut chorus = ChorusEngine::new(48_000);
        chorus.set_enables_chorus(true, false);
        let tone: Vec<StereoFrame> = (0..4_800)
            .map(|i| StereoFrame::splat((2.0 * PI * 440.0 * i as f32 / 48_000.0).sin() * 1_000.0))
            .collect();
        let mut wet = tone.clone();
        chorus.process_frames(&mut wet);
        let diff: f32 = tone.iter().zip(&wet).map(|(a, b)| (a.left - b.left).abs()).sum();
        assert!(diff > 1.0, "chorus did not alter the signal");
        assert!(wet.iter().all(|f| f.left.abs() < 5_000.0 && f.right.abs() < 5_000.0));
    }

    #[test]
    fn triangle_lfo_sweeps_full_range() {
        let mut lfo = Lfo::new(1_000.0, 1.0, 0.0, LfoWaveform::Triangle);
        let values: Vec<f32> = (0..1_000).map(|_| lfo.tick()).collect();
        assert!((values[0] + 1.0).abs() < 1e-6);
        let max = values.iter().copied().fold(f32::MIN, f32::max);
        assert!((max - 1.0).abs() < 0.01, "peak {max}");
    }

    #[test]
    fn lfo_tables_wrap_to_first_entry() {
        let t = &*LFO_TABLES;
        for table in [&t.sine, &t.triangle, &t.saw, &t.rectangle, &t.exponential] {
            assert_eq!(table[TABLE_LEN], table[0]);
            assert!(table.iter().all(|v| (-1.0..=1.0).contains(v)));
        }
    }

    #[test]
    fn noise_oscillator_is_deterministic_and_bounded() {
        let mut a = NoiseOscillator::default();
        let mut b = NoiseOscillator::default();
        for _ in 0..10_000 {
            let x = a.next_sample();
            assert_eq!(x, b.next_sample());
            assert!((-1.0..=1.0).contains(&x));
        }
    }
}
