mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use common::{assert_close, linear_config, recording_mixer};
use parking_lot::Mutex;
use pcsound_core::{ChannelFeatures, ChorusPreset, CrossfeedPreset, MixerConfig, MixerState, ReverbPreset};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const SCALE: f32 = 32_768.0;

const SUPPORTED_RATES: [u32; 8] = [8_000, 11_025, 22_050, 32_000, 44_100, 48_000, 96_000, 192_000];

/// Output of a synth channel that plays seeded noise for `noise_cycles`
/// blocks and then goes quiet for `quiet_cycles` blocks.
struct Render {
    samples: Vec<f32>,
    /// Index of the first sample written after the noise stopped.
    quiet_from: usize,
}

fn render_effects(
    rate: u32,
    reverb: ReverbPreset,
    chorus: ChorusPreset,
    noise_cycles: usize,
    quiet_cycles: usize,
) -> Result<Render> {
    let config = MixerConfig {
        sample_rate: rate,
        block_size: rate as usize / 50,
        ..linear_config()
    };
    let (mixer, samples) = recording_mixer(config)?;
    mixer.set_reverb_preset(reverb);
    mixer.set_chorus_preset(chorus);

    let playing = Arc::new(AtomicBool::new(true));
    let rng = Mutex::new(StdRng::seed_from_u64(0x5eed));
    let gate = Arc::clone(&playing);
    let channel = mixer.add_channel(
        move |ch, frames| {
            if gate.load(Ordering::Relaxed) {
                let mut rng = rng.lock();
                let data: Vec<f32> = (0..frames * 2).map(|_| rng.random_range(-8_000.0..8_000.0)).collect();
                ch.add_samples_sfloat(&data);
            } else {
                ch.add_silence(frames);
            }
        },
        rate,
        "FM",
        ChannelFeatures::SYNTHESIZER | ChannelFeatures::REVERB_SEND | ChannelFeatures::CHORUS_SEND,
    );
    channel.enable(true);

    for _ in 0..noise_cycles {
        mixer.mix_cycle()?;
    }
    let quiet_from = samples.lock().len();
    playing.store(false, Ordering::Relaxed);
    for _ in 0..quiet_cycles {
        mixer.mix_cycle()?;
    }

    let samples = samples.lock().clone();
    Ok(Render { samples, quiet_from })
}

fn energy(samples: &[f32]) -> f64 {
    samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum()
}

#[test]
fn zero_channels_mix_to_silence() -> Result<()> {
    let (mixer, samples) = recording_mixer(linear_config())?;
    assert_eq!(mixer.state(), MixerState::On);
    mixer.mix_cycle()?;
    mixer.mix_cycle()?;

    let written = samples.lock();
    assert_eq!(written.len(), 2 * 2 * mixer.block_size());
    assert!(written.iter().all(|&s| s == 0.0));
    Ok(())
}

#[test]
fn crossfeed_leaks_preset_fraction_into_other_side() -> Result<()> {
    for (preset, strength) in [
        (CrossfeedPreset::None, 0.0),
        (CrossfeedPreset::Light, 0.20),
        (CrossfeedPreset::Normal, 0.40),
        (CrossfeedPreset::Strong, 0.60),
    ] {
        let (mixer, samples) = recording_mixer(linear_config())?;
        let channel = mixer.add_channel(
            |ch, frames| {
                let data: Vec<i16> = (0..frames).flat_map(|_| [10_000, 0]).collect();
                ch.add_samples_s16(&data);
            },
            mixer.sample_rate(),
            "LEFT",
            ChannelFeatures::STEREO,
        );
        channel.enable(true);
        mixer.set_crossfeed_preset(preset);
        mixer.mix_block(64)?;

        let written = samples.lock();
        let gain = mixer.master_gain();
        let left = written[0] * SCALE;
        let right = written[1] * SCALE;
        // The first frame has only been touched by the DC blocker's b0 term.
        assert_close(left, 10_000.0 * gain, 10_000.0 * gain * 0.01);
        assert_close(right, 10_000.0 * strength * gain, 10_000.0 * gain * 0.01);
    }
    Ok(())
}

#[test]
fn mute_twice_matches_mute_once() -> Result<()> {
    let render = |mutes: usize| -> Result<Vec<f32>> {
        let (mixer, samples) = recording_mixer(linear_config())?;
        let channel = mixer.add_channel(
            |ch, frames| ch.add_samples_m16(&vec![5_000; frames]),
            mixer.sample_rate(),
            "TONE",
            ChannelFeatures::empty(),
        );
        channel.enable(true);
        for _ in 0..mutes {
            mixer.mute();
        }
        assert_eq!(mixer.state(), MixerState::Muted);
        mixer.mix_block(128)?;
        mixer.unmute();
        mixer.mix_block(128)?;
        let written = samples.lock().clone();
        Ok(written)
    };

    let once = render(1)?;
    let twice = render(2)?;
    assert_eq!(once, twice);
    assert!(once[..256].iter().all(|&s| s == 0.0));
    assert!(once[256..].iter().any(|&s| s != 0.0));
    Ok(())
}

#[test]
fn resampled_channel_fills_whole_block() -> Result<()> {
    let (mixer, samples) = recording_mixer(linear_config())?;
    let channel = mixer.add_channel(
        |ch, frames| ch.add_samples_m8(&vec![0xc0; frames]),
        11_025,
        "DAC",
        ChannelFeatures::DIGITAL_AUDIO,
    );
    channel.enable(true);
    mixer.mix_block(256)?;

    let written = samples.lock();
    assert_eq!(written.len(), 512);
    // Past the interpolation ramp every frame carries signal.
    assert!(written[20..].iter().all(|&s| s > 0.0));
    assert_eq!(channel.frames_mixed(), 256);
    Ok(())
}

#[test]
fn reverb_tail_rings_at_every_supported_rate() -> Result<()> {
    for rate in SUPPORTED_RATES {
        let dry = render_effects(rate, ReverbPreset::None, ChorusPreset::None, 10, 10)?;
        let wet = render_effects(rate, ReverbPreset::Medium, ChorusPreset::None, 10, 10)?;

        assert!(wet.samples.iter().all(|s| s.is_finite()), "non-finite output at {rate} Hz");
        assert_ne!(dry.samples, wet.samples, "reverb had no effect at {rate} Hz");

        // Skip the first quiet blocks so only the late tail is measured.
        let late = wet.quiet_from + 2 * 5 * (rate as usize / 50);
        let wet_tail = energy(&wet.samples[late..]);
        let dry_tail = energy(&dry.samples[late..]);
        assert!(wet_tail > 0.0, "reverb tail is silent at {rate} Hz");
        assert!(wet_tail > dry_tail, "reverb tail no louder than dry at {rate} Hz");
    }
    Ok(())
}

#[test]
fn chorus_path_stays_finite_at_every_supported_rate() -> Result<()> {
    for rate in SUPPORTED_RATES {
        let dry = render_effects(rate, ReverbPreset::None, ChorusPreset::None, 6, 2)?;
        let wet = render_effects(rate, ReverbPreset::None, ChorusPreset::Normal, 6, 2)?;

        assert!(wet.samples.iter().all(|s| s.is_finite()), "non-finite output at {rate} Hz");
        assert_ne!(dry.samples, wet.samples, "chorus had no effect at {rate} Hz");
    }
    Ok(())
}
