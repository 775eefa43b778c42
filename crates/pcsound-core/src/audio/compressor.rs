//! RMS-detecting feed-forward compressor for the master bus.

use super::filters::{db_to_gain, gain_to_db, time_coeff};
use super::settings::CompressorSettings;
use crate::frame::StereoFrame;

#[derive(Debug, Clone)]
pub struct Compressor {
    zero_dbfs: f32,
    threshold: f32,
    ratio: f32,
    attack_coeff: f32,
    release_coeff: f32,
    rms_coeff: f32,
    mean_squares: f32,
    run_db: f32,
}

impl Compressor {
    pub fn new(sample_rate: u32, settings: &CompressorSettings) -> Self {
        let mut comp = Self {
            zero_dbfs: 1.0,
            threshold: 1.0,
            ratio: 1.0,
            attack_coeff: 0.0,
            release_coeff: 0.0,
            rms_coeff: 0.0,
            mean_squares: 0.0,
            run_db: 0.0,
        };
        comp.configure(sample_rate, settings);
        comp
    }

    pub fn configure(&mut self, sample_rate: u32, settings: &CompressorSettings) {
        let sr = sample_rate as f32;
        self.zero_dbfs = settings.zero_dbfs.max(1.0);
        self.threshold = db_to_gain(settings.threshold_db);
        self.ratio = settings.ratio.max(1.0);
        self.attack_coeff = time_coeff(settings.attack_ms, sr);
        self.release_coeff = time_coeff(settings.release_ms, sr);
        self.rms_coeff = time_coeff(settings.rms_window_ms, sr);
        self.reset();
    }

    pub fn reset(&mut self) {
        self.mean_squares = 0.0;
        self.run_db = 0.0;
    }

    /// Current gain reduction in dB (zero or negative).
    pub fn gain_reduction_db(&self) -> f32 {
        -self.run_db * (1.0 - 1.0 / self.ratio)
    }

    pub fn process(&mut self, frame: StereoFrame) -> StereoFrame {
        let l = frame.left / self.zero_dbfs;
        let r = frame.right / self.zero_dbfs;
        let square = (l * l + r * r) * 0.5;
        self.mean_squares = square + self.rms_coeff * (self.mean_squares - square);

        let rms = self.mean_squares.max(0.0).sqrt();
        let over_db = if rms > self.threshold {
            gain_to_db(rms / self.threshold)
        } else {
            0.0
        };

        let coeff = if over_db > self.run_db {
            self.attack_coeff
        } else {
            self.release_coeff
        };
        self.run_db = over_db + coeff * (self.run_db - over_db);

        frame * db_to_gain(self.gain_reduction_db())
    }
}
