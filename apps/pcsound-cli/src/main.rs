use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use pcsound_core::audio::{AudioOutput, NullOutput};
use pcsound_core::opl3::DEFAULT_BASE_PORT;
use pcsound_core::{ChorusPreset, CrossfeedPreset, Mixer, MixerConfig, Opl3Device, ReverbPreset};
use pcsound_runtime::{CpalOutput, MixerThread};

/// OPL3 FM playback demo
#[derive(Parser, Debug)]
#[command(name = "pcsound")]
#[command(about = "Plays a short FM melody through the pcsound mixer", long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: Level,

    /// Render into a null output instead of opening an audio device
    #[arg(long)]
    no_sound: bool,

    /// Frames mixed per cycle
    #[arg(long, default_value = "512")]
    block_size: usize,

    /// Device buffer latency in milliseconds
    #[arg(long, default_value = "60")]
    latency_ms: u64,

    /// Milliseconds each note is held
    #[arg(long, default_value = "250")]
    note_ms: u64,

    /// Master gain in decibels
    #[arg(long, default_value = "-6.0", allow_negative_numbers = true)]
    gain_db: f32,

    /// Reverb room preset
    #[arg(long, value_enum, default_value_t = ReverbArg::Medium)]
    reverb: ReverbArg,

    /// Chorus preset
    #[arg(long, value_enum, default_value_t = ChorusArg::Light)]
    chorus: ChorusArg,

    /// Headphone crossfeed preset
    #[arg(long, value_enum, default_value_t = CrossfeedArg::None)]
    crossfeed: CrossfeedArg,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ReverbArg {
    None,
    Tiny,
    Small,
    Medium,
    Large,
    Huge,
}

impl From<ReverbArg> for ReverbPreset {
    fn from(arg: ReverbArg) -> Self {
        match arg {
            ReverbArg::None => Self::None,
            ReverbArg::Tiny => Self::Tiny,
            ReverbArg::Small => Self::Small,
            ReverbArg::Medium => Self::Medium,
            ReverbArg::Large => Self::Large,
            ReverbArg::Huge => Self::Huge,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ChorusArg {
    None,
    Light,
    Normal,
    Strong,
}

impl From<ChorusArg> for ChorusPreset {
    fn from(arg: ChorusArg) -> Self {
        match arg {
            ChorusArg::None => Self::None,
            ChorusArg::Light => Self::Light,
            ChorusArg::Normal => Self::Normal,
            ChorusArg::Strong => Self::Strong,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CrossfeedArg {
    None,
    Light,
    Normal,
    Strong,
}

impl From<CrossfeedArg> for CrossfeedPreset {
    fn from(arg: CrossfeedArg) -> Self {
        match arg {
            CrossfeedArg::None => Self::None,
            CrossfeedArg::Light => Self::Light,
            CrossfeedArg::Normal => Self::Normal,
            CrossfeedArg::Strong => Self::Strong,
        }
    }
}

/// Two-operator organ-ish voice on channel 0: (register, value).
const VOICE: &[(u8, u8)] = &[
    (0x20, 0x21),
    (0x23, 0x21),
    (0x40, 0x1a),
    (0x43, 0x00),
    (0x60, 0xf4),
    (0x63, 0xf2),
    (0x80, 0x55),
    (0x83, 0x35),
    (0xc0, 0x3a),
];

/// F-numbers for one octave at block 4.
const SCALE: &[u16] = &[0x16b, 0x181, 0x1b0, 0x1ca, 0x202, 0x241, 0x287, 0x2d6];

/// Emulated clock handed to the device, in milliseconds since start.
struct Clock(Instant);

impl Clock {
    fn now(&self) -> f64 {
        self.0.elapsed().as_secs_f64() * 1000.0
    }
}

fn write_reg(device: &Opl3Device, clock: &Clock, reg: u8, value: u8) {
    device.write_port(DEFAULT_BASE_PORT, reg, clock.now());
    device.write_port(DEFAULT_BASE_PORT + 1, value, clock.now());
}

fn open_output(args: &Args) -> (Box<dyn AudioOutput>, Option<u32>) {
    if args.no_sound {
        info!("audio output disabled, rendering silently");
        return (Box::new(NullOutput), None);
    }
    match CpalOutput::open(Duration::from_millis(args.latency_ms)) {
        Ok(output) => {
            let rate = output.sample_rate();
            (Box::new(output), Some(rate))
        }
        Err(err) => {
            warn!("failed to open audio device ({err}), falling back to null output");
            (Box::new(NullOutput), None)
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let (output, device_rate) = open_output(&args);
    let mut config = MixerConfig {
        block_size: args.block_size,
        master_gain_db: args.gain_db,
        reverb: args.reverb.into(),
        chorus: args.chorus.into(),
        crossfeed: args.crossfeed.into(),
        ..MixerConfig::default()
    };
    if let Some(rate) = device_rate {
        config.sample_rate = rate;
    }
    info!(
        "mixer at {} Hz, {} frames per block",
        config.sample_rate, config.block_size
    );

    let mixer = Arc::new(Mixer::new(config, output).context("failed to create mixer")?);
    let device = Opl3Device::new(&mixer, DEFAULT_BASE_PORT);
    let mixer_thread = MixerThread::spawn(Arc::clone(&mixer)).context("failed to start mixer thread")?;

    let clock = Clock(Instant::now());
    for &(reg, value) in VOICE {
        write_reg(&device, &clock, reg, value);
    }

    let hold = Duration::from_millis(args.note_ms);
    for &f_num in SCALE.iter().chain(SCALE.iter().rev().skip(1)) {
        let low = (f_num & 0xff) as u8;
        let high = ((f_num >> 8) & 0x03) as u8 | (4 << 2);
        write_reg(&device, &clock, 0xa0, low);
        write_reg(&device, &clock, 0xb0, 0x20 | high);
        thread::sleep(hold);
        write_reg(&device, &clock, 0xb0, high);
    }

    // Let the release tail and reverb ring out.
    thread::sleep(Duration::from_millis(800));

    let handle = mixer_thread.handle();
    info!(
        "played {} mix cycles ({} failed)",
        handle.cycles(),
        handle.failed_cycles()
    );

    device.detach(&mixer).context("failed to detach OPL3 device")?;
    mixer_thread.shutdown().context("mixer thread did not stop cleanly")?;
    Ok(())
}
