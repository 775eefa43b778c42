//! Stereo algorithmic reverb built from a feedback delay network.
//!
//! The input is band-limited, split into two early-reflection tap lines and a
//! mono late path. The late path is smeared by four all-passes and feeds two
//! cross-coupled tanks (modulating all-pass, multi-tap delay, damping filter).
//! Output taps from both tanks build the decorrelated stereo tail.

use crate::frame::StereoFrame;

/// How often (in Hz) the band-limit and damping filters are retuned.
const CONTROL_RATE_HZ: f32 = 1000.0;
/// Oversampling factor of the damping/bandwidth state-variable filters.
const SVF_OVERSAMPLE: usize = 4;
/// Longest predelay reachable with the predelay parameter at 1.0, in seconds.
const MAX_PREDELAY_SECS: f32 = 0.2;
/// Highest state-variable cutoff as a fraction of the oversampled rate. Keeps
/// `f = 2 sin(pi fc / sr)` below `2 (sqrt 2 - 1)`, the stability edge at `q = 2`.
const SVF_MAX_CUTOFF_RATIO: f32 = 0.12;
/// Tank all-pass modulation: sweep rate and peak excursion.
const TANK_LFO_HZ: f32 = 0.5;
const TANK_MOD_DEPTH_SECS: f32 = 0.000_5;

/// Plain delay line returning the sample written `len` ticks ago.
#[derive(Debug, Clone)]
struct DelayLine<const TAPS: usize> {
    buffer: Vec<f32>,
    len: usize,
    taps: [usize; TAPS],
}

impl<const TAPS: usize> DelayLine<TAPS> {
    fn with_max_len(max_len: usize) -> Self {
        Self {
            buffer: vec![0.0; max_len.max(1)],
            len: 0,
            taps: [0; TAPS],
        }
    }

    fn set_len(&mut self, len: usize) {
        self.len = len.min(self.buffer.len());
        if self.len == 0 {
            self.taps = [0; TAPS];
        } else {
            for tap in &mut self.taps {
                *tap %= self.len;
            }
        }
    }

    /// Places the read taps. Tap 0 is the write head.
    fn set_taps(&mut self, taps: [usize; TAPS]) {
        self.taps = taps;
        self.set_len(self.len);
    }

    fn tap(&self, n: usize) -> f32 {
        self.buffer[self.taps[n]]
    }

    fn advance(&mut self) {
        for tap in &mut self.taps {
            *tap += 1;
            if *tap >= self.len {
                *tap = 0;
            }
        }
    }

    #[inline]
    fn process(&mut self, input: f32) -> f32 {
        let head = self.taps[0];
        let out = self.buffer[head];
        self.buffer[head] = input;
        self.advance();
        out
    }
}

impl<const TAPS: usize> Default for DelayLine<TAPS> {
    fn default() -> Self {
        Self::with_max_len(1)
    }
}

/// Schroeder all-pass sharing the tap layout of [`DelayLine`].
#[derive(Debug, Clone)]
struct Allpass<const TAPS: usize> {
    line: DelayLine<TAPS>,
    feedback: f32,
}

impl<const TAPS: usize> Allpass<TAPS> {
    fn with_max_len(max_len: usize) -> Self {
        Self {
            line: DelayLine::with_max_len(max_len),
            feedback: 0.0,
        }
    }

    #[inline]
    fn process(&mut self, input: f32) -> f32 {
        let head = self.line.taps[0];
        let delayed = self.line.buffer[head];
        let temp = input * -self.feedback;
        let out = delayed + temp;
        self.line.buffer[head] = input + out * self.feedback;
        self.line.advance();
        out
    }
}

impl Allpass<4> {
    /// Like [`process`](Allpass::process), but reads `offset` samples ahead of
    /// the write head, shortening the delay by a fractional amount.
    #[inline]
    fn process_modulated(&mut self, input: f32, offset: f32) -> f32 {
        let len = self.line.len.max(1);
        let head = self.line.taps[0];
        let offset = offset.clamp(0.0, (len - 1) as f32);
        let whole = offset as usize;
        let frac = offset - whole as f32;
        let a = self.line.buffer[(head + whole) % len];
        let b = self.line.buffer[(head + whole + 1) % len];
        let delayed = a + (b - a) * frac;
        let out = delayed - input * self.feedback;
        self.line.buffer[head] = input + out * self.feedback;
        self.line.advance();
        out
    }
}

impl<const TAPS: usize> Default for Allpass<TAPS> {
    fn default() -> Self {
        Self::with_max_len(1)
    }
}

/// Oversampled Chamberlin state-variable filter used in low-pass mode.
#[derive(Debug, Clone, Copy)]
struct StateVariable {
    sample_rate: f32,
    f: f32,
    q: f32,
    low: f32,
    band: f32,
}

impl StateVariable {
    fn new(sample_rate: f32) -> Self {
        let mut svf = Self {
            sample_rate: sample_rate * SVF_OVERSAMPLE as f32,
            f: 0.0,
            q: 2.0,
            low: 0.0,
            band: 0.0,
        };
        svf.set_frequency(1000.0);
        svf
    }

    fn set_frequency(&mut self, freq: f32) {
        let freq = freq.clamp(0.0, self.sample_rate * SVF_MAX_CUTOFF_RATIO);
        self.f = 2.0 * (std::f32::consts::PI * freq / self.sample_rate).sin();
    }

    #[inline]
    fn process(&mut self, input: f32) -> f32 {
        for _ in 0..SVF_OVERSAMPLE {
            self.low += self.f * self.band;
            let high = input - self.low - self.q * self.band;
            self.band += self.f * high;
        }
        self.low
    }
}

/// Smoothed parameter ramping linearly to its target over one block.
#[derive(Debug, Default, Clone, Copy)]
struct Smoothed {
    value: f32,
    delta: f32,
}

impl Smoothed {
    fn begin_block(&mut self, target: f32, inv_frames: f32) {
        self.delta = (target - self.value) * inv_frames;
    }

    #[inline]
    fn step(&mut self) -> f32 {
        self.value += self.delta;
        self.value
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Smoothing {
    mix: Smoothed,
    early_late: Smoothed,
    bandwidth: Smoothed,
    damping: Smoothed,
    predelay: Smoothed,
    decay: Smoothed,
    density: Smoothed,
    gain: Smoothed,
}

/// FDN reverb processor with smoothed room parameters.
///
/// All parameters take normalised values in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct ReverbEngine {
    sample_rate: f32,

    damping_freq: f32,
    density1: f32,
    bandwidth_freq: f32,
    predelay_time: f32,
    decay: f32,
    gain: f32,
    mix: f32,
    early_mix: f32,
    size: f32,

    smooth: Smoothing,
    control_rate: usize,
    control_counter: usize,
    prev_left_tank: f32,
    prev_right_tank: f32,
    lfo_phase: f32,
    /// Current read offsets of the two modulated tank all-passes.
    mod_offsets: [f32; 2],

    bandwidth: [StateVariable; 2],
    damping: [StateVariable; 2],
    predelay: DelayLine<1>,
    diffusers: [Allpass<1>; 4],
    tank_allpasses: [Allpass<4>; 4],
    tank_delays: [DelayLine<4>; 4],
    early: [DelayLine<8>; 2],
}

impl ReverbEngine {
    pub fn new(sample_rate: u32) -> Self {
        let sr = sample_rate.max(1) as f32;
        let mut engine = Self {
            sample_rate: sr,
            damping_freq: 0.9,
            density1: 0.0,
            bandwidth_freq: 0.9,
            predelay_time: 0.0,
            decay: 0.5,
            gain: 1.0,
            mix: 1.0,
            early_mix: 1.0,
            size: 1.0,
            smooth: Smoothing::default(),
            control_rate: 1,
            control_counter: 0,
            prev_left_tank: 0.0,
            prev_right_tank: 0.0,
            lfo_phase: 0.0,
            mod_offsets: [0.0; 2],
            bandwidth: [StateVariable::new(sr); 2],
            damping: [StateVariable::new(sr); 2],
            predelay: DelayLine::default(),
            diffusers: Default::default(),
            tank_allpasses: Default::default(),
            tank_delays: Default::default(),
            early: Default::default(),
        };
        engine.set_sample_rate(sample_rate);
        engine
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate as u32
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate.max(1) as f32;
        self.control_rate = ((self.sample_rate / CONTROL_RATE_HZ) as usize).max(1);
        self.reset();
    }

    /// Damping amount. Higher values darken the tail faster.
    pub fn set_damping(&mut self, value: f32) {
        self.damping_freq = 1.0 - value.clamp(0.0, 1.0);
    }

    pub fn set_density(&mut self, value: f32) {
        self.density1 = value.clamp(0.0, 1.0);
    }

    /// Input band-limit. 1.0 leaves the input nearly untouched.
    pub fn set_bandwidth(&mut self, value: f32) {
        self.bandwidth_freq = value.clamp(0.0, 1.0);
    }

    pub fn set_predelay(&mut self, value: f32) {
        self.predelay_time = value.clamp(0.0, 1.0);
    }

    pub fn set_decay(&mut self, value: f32) {
        self.decay = value.clamp(0.0, 1.0);
    }

    pub fn set_gain(&mut self, value: f32) {
        self.gain = value.max(0.0);
    }

    /// Dry/wet balance, 1.0 is fully wet.
    pub fn set_mix(&mut self, value: f32) {
        self.mix = value.clamp(0.0, 1.0);
    }

    /// Late/early balance, 1.0 is only the late tail.
    pub fn set_early_mix(&mut self, value: f32) {
        self.early_mix = value.clamp(0.0, 1.0);
    }

    /// Room size. Changing it rebuilds every delay line.
    pub fn set_size(&mut self, value: f32) {
        self.size = 0.95 * value.clamp(0.0, 1.0) + 0.05;
        self.reset();
    }

    pub fn size(&self) -> f32 {
        self.size
    }

    /// Rebuilds delay lengths from the current size and sample rate and
    /// clears all internal state.
    pub fn reset(&mut self) {
        let sr = self.sample_rate;
        let sz = self.size;
        let at = |secs: f32| (secs * sr) as usize;
        let sized = |secs: f32| (secs * sr * sz) as usize;

        self.control_counter = 0;
        self.prev_left_tank = 0.0;
        self.prev_right_tank = 0.0;
        self.lfo_phase = 0.0;
        self.mod_offsets = [0.0; 2];
        for svf in self.bandwidth.iter_mut().chain(self.damping.iter_mut()) {
            *svf = StateVariable::new(sr);
        }

        self.predelay = DelayLine::with_max_len(at(MAX_PREDELAY_SECS) + 1);
        self.predelay.set_len(self.smoothed_predelay_len());

        const DIFFUSER: [(f32, f32); 4] = [(0.0048, 0.75), (0.0036, 0.75), (0.0127, 0.625), (0.0093, 0.625)];
        for (ap, (secs, feedback)) in self.diffusers.iter_mut().zip(DIFFUSER) {
            *ap = Allpass::with_max_len(at(secs));
            ap.line.set_len(at(secs));
            ap.feedback = feedback;
        }

        const TANK_AP_LEN: [f32; 4] = [0.020, 0.060, 0.030, 0.089];
        const TANK_AP_TAPS: [[f32; 4]; 4] = [
            [0.0, 0.0, 0.0, 0.0],
            [0.0, 0.006, 0.041, 0.0],
            [0.0, 0.0, 0.0, 0.0],
            [0.0, 0.031, 0.011, 0.0],
        ];
        let density2 = self.density2(self.decay_target());
        for (i, ap) in self.tank_allpasses.iter_mut().enumerate() {
            *ap = Allpass::with_max_len(sized(TANK_AP_LEN[i]));
            ap.line.set_len(sized(TANK_AP_LEN[i]));
            ap.line.set_taps(TANK_AP_TAPS[i].map(sized));
            ap.feedback = if i % 2 == 0 { self.smooth.density.value } else { density2 };
        }

        const TANK_DELAY_LEN: [f32; 4] = [0.15, 0.12, 0.14, 0.11];
        const TANK_DELAY_TAPS: [[f32; 4]; 4] = [
            [0.0, 0.067, 0.011, 0.121],
            [0.0, 0.036, 0.089, 0.0],
            [0.0, 0.0089, 0.099, 0.0],
            [0.0, 0.067, 0.0041, 0.0],
        ];
        for (i, line) in self.tank_delays.iter_mut().enumerate() {
            *line = DelayLine::with_max_len(sized(TANK_DELAY_LEN[i]));
            line.set_len(sized(TANK_DELAY_LEN[i]));
            line.set_taps(TANK_DELAY_TAPS[i].map(sized));
        }

        const EARLY_LEN: [f32; 2] = [0.089, 0.069];
        const EARLY_TAPS: [[f32; 8]; 2] = [
            [0.0, 0.0199, 0.0219, 0.0354, 0.0389, 0.0414, 0.0692, 0.0],
            [0.0, 0.0099, 0.011, 0.0182, 0.0189, 0.0213, 0.0431, 0.0],
        ];
        for (i, line) in self.early.iter_mut().enumerate() {
            *line = DelayLine::with_max_len(at(EARLY_LEN[i]));
            line.set_len(at(EARLY_LEN[i]));
            line.set_taps(EARLY_TAPS[i].map(at));
        }
    }

    fn predelay_target(&self) -> f32 {
        self.predelay_time * 200.0 * (self.sample_rate / 1000.0)
    }

    fn smoothed_predelay_len(&self) -> usize {
        self.smooth.predelay.value.max(0.0) as usize
    }

    fn decay_target(&self) -> f32 {
        0.7995 * self.decay + 0.005
    }

    fn density2(&self, decay: f32) -> f32 {
        (decay + 0.15).clamp(0.25, 0.5)
    }

    fn begin_block(&mut self, frames: usize) {
        let inv = 1.0 / frames as f32;
        let predelay = self.predelay_target();
        let decay = self.decay_target();
        let s = &mut self.smooth;
        s.mix.begin_block(self.mix, inv);
        s.early_late.begin_block(self.early_mix, inv);
        s.bandwidth.begin_block(self.bandwidth_freq * 18400.0 + 100.0, inv);
        s.damping.begin_block(self.damping_freq * 18400.0 + 100.0, inv);
        s.predelay.begin_block(predelay, inv);
        s.decay.begin_block(decay, inv);
        s.density.begin_block(0.7995 * self.density1 + 0.005, inv);
        s.gain.begin_block(self.gain, inv);
    }

    /// Advances the tank LFO and returns the read offsets for the left and
    /// right modulated all-passes, swinging in opposite phase.
    fn step_modulation(&mut self) -> [f32; 2] {
        use std::f32::consts::TAU;
        self.lfo_phase += TAU * TANK_LFO_HZ / self.sample_rate;
        if self.lfo_phase >= TAU {
            self.lfo_phase -= TAU;
        }
        let depth = TANK_MOD_DEPTH_SECS * self.sample_rate * self.size;
        let swing = self.lfo_phase.sin();
        self.mod_offsets = [depth * 0.5 * (1.0 + swing), depth * 0.5 * (1.0 - swing)];
        self.mod_offsets
    }

    fn tick(&mut self, dry: StereoFrame) -> StereoFrame {
        let mix = self.smooth.mix.step();
        let early_mix = self.smooth.early_late.step();
        let bandwidth = self.smooth.bandwidth.step();
        let damping = self.smooth.damping.step();
        let predelay = self.smooth.predelay.step();
        let decay = self.smooth.decay.step();
        let density = self.smooth.density.step();
        let gain = self.smooth.gain.step();

        if self.control_counter >= self.control_rate {
            self.control_counter = 0;
            for svf in &mut self.bandwidth {
                svf.set_frequency(bandwidth);
            }
            for svf in &mut self.damping {
                svf.set_frequency(damping);
            }
        }
        self.control_counter += 1;

        self.predelay.set_len(predelay.max(0.0) as usize);
        let density2 = self.density2(decay);
        self.tank_allpasses[0].feedback = density;
        self.tank_allpasses[1].feedback = density2;
        self.tank_allpasses[2].feedback = density;
        self.tank_allpasses[3].feedback = density2;
        let [mod_l, mod_r] = self.step_modulation();

        let bw_l = self.bandwidth[0].process(dry.left);
        let bw_r = self.bandwidth[1].process(dry.right);

        let early_l = self.early_reflections(0, bw_l * 0.5 + bw_r * 0.3)
            + (bw_l * 0.4 + bw_r * 0.2) * 0.5;
        let early_r = self.early_reflections(1, bw_l * 0.3 + bw_r * 0.5)
            + (bw_l * 0.2 + bw_r * 0.4) * 0.5;

        let mut smeared = self.predelay.process((bw_l + bw_r) * 0.5);
        for ap in &mut self.diffusers {
            smeared = ap.process(smeared);
        }

        let mut left_tank = self.tank_allpasses[0].process_modulated(smeared + self.prev_right_tank, mod_l);
        left_tank = self.tank_delays[0].process(left_tank);
        left_tank = self.damping[0].process(left_tank);
        left_tank = self.tank_allpasses[1].process(left_tank);
        left_tank = self.tank_delays[1].process(left_tank);

        let mut right_tank = self.tank_allpasses[2].process_modulated(smeared + self.prev_left_tank, mod_r);
        right_tank = self.tank_delays[2].process(right_tank);
        right_tank = self.damping[1].process(right_tank);
        right_tank = self.tank_allpasses[3].process(right_tank);
        right_tank = self.tank_delays[3].process(right_tank);

        self.prev_left_tank = left_tank * decay;
        self.prev_right_tank = right_tank * decay;

        let d = &self.tank_delays;
        let ap = &self.tank_allpasses;
        let late_l = 0.6
            * (d[2].tap(1) + d[2].tap(2) - ap[3].line.tap(1) + d[3].tap(1)
                - d[0].tap(1)
                - ap[1].line.tap(1)
                - d[1].tap(1));
        let late_r = 0.6
            * (d[0].tap(2) + d[0].tap(3) - ap[1].line.tap(2) + d[1].tap(2)
                - d[2].tap(3)
                - ap[3].line.tap(2)
                - d[3].tap(2));

        let wet_l = late_l * early_mix + (1.0 - early_mix) * early_l;
        let wet_r = late_r * early_mix + (1.0 - early_mix) * early_r;

        StereoFrame::new(
            (dry.left + mix * (wet_l - dry.left)) * gain,
            (dry.right + mix * (wet_r - dry.right)) * gain,
        )
    }

    fn early_reflections(&mut self, side: usize, input: f32) -> f32 {
        const GAINS: [f32; 6] = [0.6, 0.4, 0.3, 0.3, 0.1, 0.1];
        let line = &mut self.early[side];
        let head = line.process(input);
        head + GAINS
            .iter()
            .enumerate()
            .map(|(i, g)| line.tap(i + 2) * g)
            .sum::<f32>()
    }

    /// Processes `frames` samples from the input slices into the output slices.
    ///
    /// Parameter changes made since the previous call are ramped in linearly
    /// across this block.
    pub fn process(
        &mut self,
        left_in: &[f32],
        right_in: &[f32],
        left_out: &mut [f32],
        right_out: &mut [f32],
        frames: usize,
    ) {
        let frames = frames
            .min(left_in.len())
            .min(right_in.len())
            .min(left_out.len())
            .min(right_out.len());
        if frames == 0 {
            return;
        }
        self.begin_block(frames);
        for i in 0..frames {
            let out = self.tick(StereoFrame::new(left_in[i], right_in[i]));
            left_out[i] = out.left;
            right_out[i] = out.right;
        }
    }

    /// In-place variant of [`process`](Self::process) over stereo frames.
    pub fn process_frames(&mut self, frames: &mut [StereoFrame]) {
        if frames.is_empty() {
            return;
        }
        self.begin_block(frames.len());
        for frame in frames {
            *frame = self.tick(*frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn room() -> ReverbEngine {
        room_at(48_000)
    }

    fn room_at(rate: u32) -> ReverbEngine {
        let mut reverb = ReverbEngine::new(rate);
        reverb.set_early_mix(0.75);
        reverb.set_size(0.5);
        reverb.set_density(0.5);
        reverb.set_bandwidth(0.95);
        reverb.set_decay(0.42);
        reverb.set_damping(0.21);
        reverb
    }

    fn impulse_response(reverb: &mut ReverbEngine, blocks: usize) -> Vec<StereoFrame> {
        let mut out = Vec::new();
        for b in 0..blocks {
            let mut block = vec![StereoFrame::SILENCE; 1024];
            if b == 0 {
                block[0] = StereoFrame::splat(10_000.0);
            }
            reverb.process_frames(&mut block);
            out.extend(block);
        }
        out
    }

    #[test]
    fn silence_stays_silent() {
        let mut reverb = room();
        let mut block = vec![StereoFrame::SILENCE; 2048];
        reverb.process_frames(&mut block);
        assert!(block.iter().all(StereoFrame::is_silent));
    }

    #[test]
    fn impulse_produces_decaying_tail() {
        let mut reverb = room();
        let ir = impulse_response(&mut reverb, 48);
        let energy = |range: std::ops::Range<usize>| -> f32 {
            ir[range].iter().map(|f| f.left * f.left + f.right * f.right).sum()
        };
        let early = energy(1024..8192);
        let late = energy(40_000..48_000);
        assert!(early > 0.0, "no reverb tail");
        assert!(late < early, "tail is not decaying: {early} -> {late}");
        assert!(ir.iter().all(|f| f.left.is_finite() && f.right.is_finite()));
    }

    #[test]
    fn noise_input_stays_bounded() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut reverb = room();
        for _ in 0..32 {
            let mut block: Vec<StereoFrame> = (0..1024)
                .map(|_| StereoFrame::new(rng.random_range(-8000.0..8000.0), rng.random_range(-8000.0..8000.0)))
                .collect();
            reverb.process_frames(&mut block);
            assert!(block.iter().all(|f| f.left.abs() < 1.0e6 && f.right.abs() < 1.0e6));
        }
    }

    #[test]
    fn stable_at_every_supported_rate() {
        for rate in [8_000, 11_025, 16_000, 22_050, 32_000, 44_100, 48_000, 96_000, 192_000] {
            let mut rng = StdRng::seed_from_u64(u64::from(rate));
            let mut reverb = room_at(rate);
            let mut tail_peak = 0.0f32;
            for b in 0..24 {
                let mut block: Vec<StereoFrame> = (0..1024)
                    .map(|_| {
                        if b < 16 {
                            StereoFrame::new(rng.random_range(-10_000.0..10_000.0), rng.random_range(-10_000.0..10_000.0))
                        } else {
                            StereoFrame::SILENCE
                        }
                    })
                    .collect();
                reverb.process_frames(&mut block);
                for f in &block {
                    assert!(f.left.is_finite() && f.right.is_finite(), "non-finite output at {rate} Hz");
                    assert!(f.peak() < 1.0e6, "runaway output at {rate} Hz: {f:?}");
                }
                if b == 16 {
                    tail_peak = block.iter().map(StereoFrame::peak).fold(0.0, f32::max);
                }
            }
            assert!(tail_peak > 0.0, "no tail at {rate} Hz");
        }
    }

    #[test]
    fn state_variable_cutoff_is_capped() {
        let mut svf = StateVariable::new(8_000.0);
        svf.set_frequency(0.95 * 18_400.0 + 100.0);
        assert!(svf.f < 2.0 * (2.0f32.sqrt() - 1.0));
        for _ in 0..10_000 {
            assert!(svf.process(10_000.0).abs() < 20_000.0);
        }
    }

    #[test]
    fn tank_allpasses_are_modulated() {
        let mut reverb = room();
        let mut left = Vec::new();
        let mut right = Vec::new();
        // Two seconds cover a full LFO period.
        for _ in 0..96 {
            let mut block = vec![StereoFrame::SILENCE; 1000];
            reverb.begin_block(block.len());
            for frame in &mut block {
                *frame = reverb.tick(*frame);
                left.push(reverb.mod_offsets[0]);
                right.push(reverb.mod_offsets[1]);
            }
        }
        let depth = TANK_MOD_DEPTH_SECS * 48_000.0 * reverb.size();
        let span = |v: &[f32]| {
            let (lo, hi) = v.iter().fold((f32::MAX, f32::MIN), |(lo, hi), &x| (lo.min(x), hi.max(x)));
            hi - lo
        };
        assert!(span(&left) > depth * 0.9, "left tap barely moves");
        assert!(span(&right) > depth * 0.9, "right tap barely moves");
        for (l, r) in left.iter().zip(&right) {
            assert!((l + r - depth).abs() < 1e-3, "taps are not in opposite phase");
        }
    }

    #[test]
    fn modulated_allpass_at_zero_offset_matches_static() {
        let mut a = Allpass::<4>::with_max_len(32);
        a.line.set_len(32);
        a.feedback = 0.5;
        let mut b = a.clone();
        for i in 0..200 {
            let x = ((i * 13) % 29) as f32 - 14.0;
            assert_eq!(a.process(x), b.process_modulated(x, 0.0));
        }
    }

    #[test]
    fn parameter_changes_ramp_across_the_block() {
        let mut reverb = room();
        let mut block = vec![StereoFrame::SILENCE; 256];
        reverb.process_frames(&mut block);
        let density_before = reverb.tank_allpasses[0].feedback;
        assert!((density_before - (0.7995 * 0.5 + 0.005)).abs() < 1e-4);

        reverb.set_density(1.0);
        reverb.set_gain(0.5);
        reverb.set_predelay(0.5);
        reverb.begin_block(100);
        for _ in 0..50 {
            reverb.tick(StereoFrame::SILENCE);
        }
        let density_target = 0.7995 + 0.005;
        let density_mid = reverb.tank_allpasses[0].feedback;
        assert!(density_mid > density_before + 0.1 && density_mid < density_target - 0.1);
        let gain_mid = reverb.smooth.gain.value;
        assert!(gain_mid > 0.6 && gain_mid < 0.9, "gain stepped: {gain_mid}");
        let predelay_mid = reverb.predelay.len;
        assert!((2_000..2_800).contains(&predelay_mid), "predelay stepped: {predelay_mid}");

        for _ in 0..50 {
            reverb.tick(StereoFrame::SILENCE);
        }
        assert!((reverb.tank_allpasses[0].feedback - density_target).abs() < 1e-4);
        assert!((reverb.smooth.gain.value - 0.5).abs() < 1e-4);
        assert!(reverb.predelay.len.abs_diff(4_800) <= 1);
    }

    #[test]
    fn processing_is_deterministic() {
        let a = impulse_response(&mut room(), 8);
        let b = impulse_response(&mut room(), 8);
        assert_eq!(a, b);
    }

    #[test]
    fn slice_and_frame_entry_points_agree() {
        let input: Vec<f32> = (0..512).map(|i| ((i * 37) % 101) as f32 - 50.0).collect();
        let mut by_slice = room();
        let (mut lo, mut ro) = (vec![0.0; 512], vec![0.0; 512]);
        by_slice.process(&input, &input, &mut lo, &mut ro, 512);

        let mut by_frame = room();
        let mut frames: Vec<_> = input.iter().map(|&s| StereoFrame::splat(s)).collect();
        by_frame.process_frames(&mut frames);

        for i in 0..512 {
            assert_eq!(frames[i], StereoFrame::new(lo[i], ro[i]));
        }
    }

    #[test]
    fn size_change_rebuilds_delay_lines() {
        let mut reverb = ReverbEngine::new(48_000);
        reverb.set_size(1.0);
        let large = reverb.tank_delays[0].len;
        reverb.set_size(0.05);
        let small = reverb.tank_delays[0].len;
        assert_eq!(large, (0.15_f32 * 48_000.0) as usize);
        assert!(small < large);
        assert!((reverb.size() - (0.95 * 0.05 + 0.05)).abs() < 1e-6);
    }

    #[test]
    fn sample_rate_change_resets_state() {
        let mut reverb = room();
        impulse_response(&mut reverb, 2);
        reverb.set_sample_rate(44_100);
        assert_eq!(reverb.sample_rate(), 44_100);
        assert_eq!(reverb.prev_left_tank, 0.0);
        assert_eq!(reverb.early[0].len, (0.089_f32 * 44_100.0) as usize);
    }
}
