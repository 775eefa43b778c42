use std::time::Duration;

use crate::error::{Error, Result};

pub const MIN_SAMPLE_RATE: u32 = 8_000;
pub const MAX_SAMPLE_RATE: u32 = 192_000;

/// Reverb room presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ReverbPreset {
    #[default]
    None,
    Tiny,
    Small,
    Medium,
    Large,
    Huge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ChorusPreset {
    #[default]
    None,
    Light,
    Normal,
    Strong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CrossfeedPreset {
    #[default]
    None,
    Light,
    Normal,
    Strong,
}

/// Room parameters for one reverb preset. Engine values are normalised to
/// `[0, 1]`, send levels are linear gains.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReverbParams {
    pub predelay: f32,
    pub early_mix: f32,
    pub size: f32,
    pub density: f32,
    pub bandwidth: f32,
    pub decay: f32,
    pub damping: f32,
    pub synth_send: f32,
    pub digital_send: f32,
    pub highpass_hz: f32,
}

impl ReverbPreset {
    /// Parameter table. `None` yields `None`.
    ///
    /// | preset | early | size | density | bw   | decay | damp | synth | digital | hpf |
    /// |--------|-------|------|---------|------|-------|------|-------|---------|-----|
    /// | tiny   | 1.00  | 0.05 | 0.50    | 0.50 | 0.00  | 1.00 | 0.87  | 0.87    | 200 |
    /// | small  | 1.00  | 0.17 | 0.42    | 0.50 | 0.50  | 0.70 | 0.40  | 0.08    | 200 |
    /// | medium | 0.75  | 0.50 | 0.50    | 0.95 | 0.42  | 0.21 | 0.54  | 0.07    | 170 |
    /// | large  | 0.75  | 0.75 | 0.50    | 0.95 | 0.52  | 0.21 | 0.70  | 0.05    | 140 |
    /// | huge   | 0.75  | 0.75 | 0.50    | 0.95 | 0.52  | 0.21 | 0.85  | 0.05    | 140 |
    pub fn params(self) -> Option<ReverbParams> {
        let p = |early_mix, size, density, bandwidth, decay, damping, synth_send, digital_send, highpass_hz| {
            ReverbParams {
                predelay: 0.0,
                early_mix,
                size,
                density,
                bandwidth,
                decay,
                damping,
                synth_send,
                digital_send,
                highpass_hz,
            }
        };
        match self {
            Self::None => None,
            Self::Tiny => Some(p(1.00, 0.05, 0.50, 0.50, 0.00, 1.00, 0.87, 0.87, 200.0)),
            Self::Small => Some(p(1.00, 0.17, 0.42, 0.50, 0.50, 0.70, 0.40, 0.08, 200.0)),
            Self::Medium => Some(p(0.75, 0.50, 0.50, 0.95, 0.42, 0.21, 0.54, 0.07, 170.0)),
            Self::Large => Some(p(0.75, 0.75, 0.50, 0.95, 0.52, 0.21, 0.70, 0.05, 140.0)),
            Self::Huge => Some(p(0.75, 0.75, 0.50, 0.95, 0.52, 0.21, 0.85, 0.05, 140.0)),
        }
    }
}

impl ChorusPreset {
    /// `(synth_send, digital_send)`.
    pub fn sends(self) -> (f32, f32) {
        match self {
            Self::None => (0.0, 0.0),
            Self::Light => (0.33, 0.0),
            Self::Normal => (0.54, 0.0),
            Self::Strong => (0.75, 0.0),
        }
    }
}

impl CrossfeedPreset {
    pub fn strength(self) -> f32 {
        match self {
            Self::None => 0.0,
            Self::Light => 0.20,
            Self::Normal => 0.40,
            Self::Strong => 0.60,
        }
    }
}

/// Fixed RMS compressor parameters for the master bus.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CompressorSettings {
    pub enabled: bool,
    /// Sample value treated as 0 dBFS.
    pub zero_dbfs: f32,
    pub threshold_db: f32,
    pub ratio: f32,
    pub attack_ms: f32,
    pub release_ms: f32,
    pub rms_window_ms: f32,
}

impl Default for CompressorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            zero_dbfs: 32_767.0,
            threshold_db: -6.0,
            ratio: 3.0,
            attack_ms: 0.01,
            release_ms: 5_000.0,
            rms_window_ms: 10.0,
        }
    }
}

/// Mixer-wide configuration, fixed for the lifetime of a [`Mixer`](super::Mixer)
/// except for the presets, gain and compressor which can be changed live.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MixerConfig {
    pub sample_rate: u32,
    /// Frames mixed per cycle by the mixer thread.
    pub block_size: usize,
    /// Largest block a single mix call accepts.
    pub max_block_size: usize,
    pub master_gain_db: f32,
    pub reverb: ReverbPreset,
    pub chorus: ChorusPreset,
    pub crossfeed: CrossfeedPreset,
    pub compressor: CompressorSettings,
    /// Samples above this magnitude (16-bit scale) get their overshoot halved.
    pub soft_clip_threshold: f32,
    pub peak_tracking: bool,
    pub master_highpass_hz: f32,
    /// How long shutdown waits for the mixer thread before giving up on it.
    pub join_timeout: Duration,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            block_size: 1024,
            max_block_size: 16_384,
            master_gain_db: -6.0,
            reverb: ReverbPreset::None,
            chorus: ChorusPreset::None,
            crossfeed: CrossfeedPreset::None,
            compressor: CompressorSettings::default(),
            soft_clip_threshold: 30_000.0,
            peak_tracking: false,
            master_highpass_hz: 20.0,
            join_timeout: Duration::from_secs(3),
        }
    }
}

impl MixerConfig {
    pub fn validate(&self) -> Result<()> {
        if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&self.sample_rate) {
            return Err(Error::InvalidSampleRate(self.sample_rate));
        }
        if self.block_size == 0 || self.block_size > self.max_block_size {
            return Err(Error::InvalidBlockSize(self.block_size));
        }
        Ok(())
    }

    /// Real-time duration of one block at the configured rate.
    pub fn block_duration(&self) -> Duration {
        Duration::from_secs_f64(self.block_size as f64 / self.sample_rate as f64)
    }

    /// Frames in one millisecond, at least one.
    pub fn frames_per_ms(&self) -> usize {
        (self.sample_rate as usize / 1000).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = MixerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.frames_per_ms(), 48);
        assert!((config.block_duration().as_secs_f64() - 1024.0 / 48_000.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_bad_block_and_rate() {
        let config = MixerConfig {
            block_size: 0,
            ..MixerConfig::default()
        };
        assert_eq!(config.validate(), Err(Error::InvalidBlockSize(0)));

        let config = MixerConfig {
            block_size: 1 << 20,
            ..MixerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = MixerConfig {
            sample_rate: 1_000,
            ..MixerConfig::default()
        };
        assert_eq!(config.validate(), Err(Error::InvalidSampleRate(1_000)));
    }

    #[test]
    fn crossfeed_strengths() {
        assert_eq!(CrossfeedPreset::None.strength(), 0.0);
        assert_eq!(CrossfeedPreset::Light.strength(), 0.20);
        assert_eq!(CrossfeedPreset::Normal.strength(), 0.40);
        assert_eq!(CrossfeedPreset::Strong.strength(), 0.60);
    }

    #[test]
    fn reverb_none_has_no_params() {
        assert!(ReverbPreset::None.params().is_none());
        let medium = ReverbPreset::Medium.params().map(|p| p.highpass_hz);
        assert_eq!(medium, Some(170.0));
    }
}
