#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use pcsound_core::{
    Mixer, MixerConfig,
    audio::{CompressorSettings, RecordingOutput},
};

/// Default configuration with the compressor switched off, so levels are linear.
pub fn linear_config() -> MixerConfig {
    MixerConfig {
        compressor: CompressorSettings {
            enabled: false,
            ..CompressorSettings::default()
        },
        ..MixerConfig::default()
    }
}

/// A mixer writing into memory, plus the shared sample store.
pub fn recording_mixer(config: MixerConfig) -> Result<(Mixer, Arc<Mutex<Vec<f32>>>)> {
    let output = RecordingOutput::new();
    let samples = output.samples();
    let mixer = Mixer::new(config, Box::new(output))?;
    Ok((mixer, samples))
}

pub fn assert_close(actual: f32, expected: f32, tolerance: f32) {
    assert!(
        (actual - expected).abs() <= tolerance,
        "expected {expected} ± {tolerance}, got {actual}"
    );
}
