//! Small DSP building blocks shared by the effect engines and the master bus.

use std::f32::consts::PI;

use crate::frame::StereoFrame;

/// Butterworth quality factor for a 2nd-order section.
const BUTTERWORTH_Q: f32 = std::f32::consts::FRAC_1_SQRT_2;

pub fn db_to_gain(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}

pub fn gain_to_db(gain: f32) -> f32 {
    20.0 * gain.max(f32::MIN_POSITIVE).log10()
}

pub(crate) fn pole_coeff(sample_rate: f32, cutoff_hz: f32) -> f32 {
    (-2.0 * PI * cutoff_hz / sample_rate).exp()
}

pub(crate) fn pole_alpha(sample_rate: f32, cutoff_hz: f32) -> f32 {
    1.0 - pole_coeff(sample_rate, cutoff_hz)
}

/// Time constant for an exponential follower that settles in `ms`.
pub(crate) fn time_coeff(ms: f32, sample_rate: f32) -> f32 {
    if ms <= 0.0 || sample_rate <= 0.0 {
        return 0.0;
    }
    (-1.0 / (ms * 0.001 * sample_rate)).exp()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BiquadKind {
    LowPass,
    HighPass,
}

/// Second-order IIR section in transposed direct form II.
#[derive(Debug, Default, Clone, Copy)]
pub struct Biquad {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    z1: f32,
    z2: f32,
}

impl Biquad {
    pub fn new(kind: BiquadKind, sample_rate: f32, cutoff_hz: f32) -> Self {
        let mut filter = Self::default();
        filter.configure(kind, sample_rate, cutoff_hz);
        filter
    }

    /// Recomputes coefficients for a Butterworth response. State is kept.
    pub fn configure(&mut self, kind: BiquadKind, sample_rate: f32, cutoff_hz: f32) {
        // Keep the cutoff strictly below Nyquist or the coefficients blow up.
        let cutoff = cutoff_hz.clamp(1.0, sample_rate * 0.49);
        let w0 = 2.0 * PI * cutoff / sample_rate;
        let cos = w0.cos();
        let alpha = w0.sin() / (2.0 * BUTTERWORTH_Q);
        let a0 = 1.0 + alpha;

        let (b0, b1, b2) = match kind {
            BiquadKind::LowPass => ((1.0 - cos) / 2.0, 1.0 - cos, (1.0 - cos) / 2.0),
            BiquadKind::HighPass => ((1.0 + cos) / 2.0, -(1.0 + cos), (1.0 + cos) / 2.0),
        };
        self.b0 = b0 / a0;
        self.b1 = b1 / a0;
        self.b2 = b2 / a0;
        self.a1 = -2.0 * cos / a0;
        self.a2 = (1.0 - alpha) / a0;
    }

    pub fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }

    #[inline]
    pub fn process(&mut self, input: f32) -> f32 {
        let out = self.b0 * input + self.z1;
        self.z1 = self.b1 * input - self.a1 * out + self.z2;
        self.z2 = self.b2 * input - self.a2 * out;
        out
    }
}

/// A pair of identical biquads, one per side.
#[derive(Debug, Default, Clone, Copy)]
pub struct StereoBiquad {
    left: Biquad,
    right: Biquad,
}

impl StereoBiquad {
    pub fn new(kind: BiquadKind, sample_rate: f32, cutoff_hz: f32) -> Self {
        let filter = Biquad::new(kind, sample_rate, cutoff_hz);
        Self {
            left: filter,
            right: filter,
        }
    }

    pub fn configure(&mut self, kind: BiquadKind, sample_rate: f32, cutoff_hz: f32) {
        self.left.configure(kind, sample_rate, cutoff_hz);
        self.right.configure(kind, sample_rate, cutoff_hz);
    }

    pub fn reset(&mut self) {
        self.left.reset();
        self.right.reset();
    }

    #[inline]
    pub fn process(&mut self, frame: StereoFrame) -> StereoFrame {
        StereoFrame::new(self.left.process(frame.left), self.right.process(frame.right))
    }

    pub fn process_slice(&mut self, frames: &mut [StereoFrame]) {
        for frame in frames {
            *frame = self.process(*frame);
        }
    }
}

/// Single-pole low-pass (exponential smoother).
#[derive(Debug, Default, Clone, Copy)]
pub struct OnePoleLowPass {
    alpha: f32,
    state: f32,
}

impl OnePoleLowPass {
    pub fn new(sample_rate: f32, cutoff_hz: f32) -> Self {
        Self {
            alpha: pole_alpha(sample_rate, cutoff_hz),
            state: 0.0,
        }
    }

    #[inline]
    pub fn process(&mut self, input: f32) -> f32 {
        self.state += (input - self.state) * self.alpha;
        self.state
    }

    pub fn reset(&mut self) {
        self.state = 0.0;
    }
}

/// First-order DC blocker: `y[n] = x[n] - x[n-1] + R * y[n-1]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DcBlocker {
    coeff: f32,
    last_in: f32,
    last_out: f32,
}

impl DcBlocker {
    pub fn new(coeff: f32) -> Self {
        Self {
            coeff,
            last_in: 0.0,
            last_out: 0.0,
        }
    }

    pub fn with_cutoff(sample_rate: f32, cutoff_hz: f32) -> Self {
        Self::new(pole_coeff(sample_rate, cutoff_hz))
    }

    #[inline]
    pub fn process(&mut self, input: f32) -> f32 {
        let out = input - self.last_in + self.coeff * self.last_out;
        self.last_in = input;
        self.last_out = out;
        out
    }

    pub fn reset(&mut self) {
        self.last_in = 0.0;
        self.last_out = 0.0;
    }
}

/// Gate that silences a channel while its level stays under a threshold.
///
/// The detector follows the peak of both sides; the gate gain ramps open with
/// the attack time and closes with the release time so it never clicks.
#[derive(Debug, Clone, Copy)]
pub struct NoiseGate {
    threshold: f32,
    attack: f32,
    release: f32,
    envelope: f32,
    gain: f32,
}

impl NoiseGate {
    pub fn new(sample_rate: f32, threshold_db: f32, attack_ms: f32, release_ms: f32) -> Self {
        Self {
            // Threshold is relative to 16-bit full scale.
            threshold: db_to_gain(threshold_db) * 32767.0,
            attack: time_coeff(attack_ms, sample_rate),
            release: time_coeff(release_ms, sample_rate),
            envelope: 0.0,
            gain: 0.0,
        }
    }

    pub fn process(&mut self, frame: StereoFrame) -> StereoFrame {
        let level = frame.peak();
        let env_coeff = if level > self.envelope {
            self.attack
        } else {
            self.release
        };
        self.envelope = level + env_coeff * (self.envelope - level);

        let target = if self.envelope >= self.threshold { 1.0 } else { 0.0 };
        let gain_coeff = if target > self.gain {
            self.attack
        } else {
            self.release
        };
        self.gain = target + gain_coeff * (self.gain - target);
        frame * self.gain
    }

    pub fn is_open(&self) -> bool {
        self.gain > 0.5
    }
}
