use std::sync::Arc;

use parking_lot::Mutex;

use super::{
    chip::{OPL3_NATIVE_RATE, Opl3Chip},
    timer::{OplTimer, TIMER0_INTERVAL_MS, TIMER1_INTERVAL_MS},
};
use crate::{
    audio::{ChannelFeatures, Mixer, MixerChannel},
    error::Result,
};

/// Default AdLib/Sound Blaster FM base port.
pub const DEFAULT_BASE_PORT: u16 = 0x388;

pub const CHANNEL_NAME: &str = "OPL3";

const STATUS_IRQ: u8 = 0x80;
const STATUS_TIMER0: u8 = 0x40;
const STATUS_TIMER1: u8 = 0x20;

/// What a port write touched, so the caller can schedule follow-up work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortWrite {
    /// Address latch update.
    Address,
    /// A register that changes the audio output was queued.
    Audio,
    /// Timer counter or control register.
    Timer,
    /// Port outside the device's range.
    Ignored,
}

#[derive(Debug)]
struct Opl3State {
    chip: Opl3Chip,
    address: u16,
    timers: [OplTimer; 2],
    /// Emulated time of the most recent queued register write.
    last_audio_write: f64,
}

impl Opl3State {
    fn new() -> Self {
        Self {
            chip: Opl3Chip::new(OPL3_NATIVE_RATE),
            address: 0,
            timers: [
                OplTimer::new(TIMER0_INTERVAL_MS),
                OplTimer::new(TIMER1_INTERVAL_MS),
            ],
            last_audio_write: 0.0,
        }
    }

    fn write_timer(&mut self, reg: u16, value: u8, now: f64) -> bool {
        match reg {
            0x02 => self.timers[0].set_counter(value),
            0x03 => self.timers[1].set_counter(value),
            0x04 => {
                if value & 0x80 != 0 {
                    self.timers.iter_mut().for_each(|t| t.reset(now));
                } else {
                    let [timer0, timer1] = &mut self.timers;
                    timer0.set_mask(value & 0x40 != 0);
                    timer1.set_mask(value & 0x20 != 0);
                    if value & 0x01 != 0 {
                        timer0.start(now);
                    } else {
                        timer0.stop();
                    }
                    if value & 0x02 != 0 {
                        timer1.start(now);
                    } else {
                        timer1.stop();
                    }
                }
            }
            _ => return false,
        }
        true
    }

    fn status(&mut self, now: f64) -> u8 {
        let mut status = 0;
        if self.timers[0].update(now) {
            status |= STATUS_IRQ | STATUS_TIMER0;
        }
        if self.timers[1].update(now) {
            status |= STATUS_IRQ | STATUS_TIMER1;
        }
        status
    }
}

/// An OPL3 attached to a port range and a mixer channel.
///
/// Times passed to the port and scheduling methods are emulated milliseconds.
/// Register writes are queued on the chip and reach the audio stream as the
/// mixer pulls samples through the `"OPL3"` channel.
pub struct Opl3Device {
    base_port: u16,
    state: Arc<Mutex<Opl3State>>,
    channel: Arc<MixerChannel>,
}

impl Opl3Device {
    pub fn new(mixer: &Mixer, base_port: u16) -> Self {
        let state = Arc::new(Mutex::new(Opl3State::new()));
        let producer = Arc::clone(&state);
        let features = ChannelFeatures::SYNTHESIZER
            | ChannelFeatures::STEREO
            | ChannelFeatures::REVERB_SEND
            | ChannelFeatures::CHORUS_SEND
            | ChannelFeatures::SLEEP
            | ChannelFeatures::FADE_OUT;
        let channel = mixer.add_channel(
            move |channel, frames| {
                let mut samples = vec![0i16; frames * 2];
                producer.lock().chip.generate_stream(&mut samples);
                channel.add_samples_s16(&samples);
            },
            OPL3_NATIVE_RATE,
            CHANNEL_NAME,
            features,
        );
        tracing::info!(base_port = format_args!("{base_port:#x}"), "opl3 device attached");
        Self {
            base_port,
            state,
            channel,
        }
    }

    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    pub fn channel(&self) -> &Arc<MixerChannel> {
        &self.channel
    }

    /// Handles a byte write to `base+0..=3`.
    pub fn write_port(&self, port: u16, value: u8, now: f64) -> PortWrite {
        let Some(offset) = port.checked_sub(self.base_port).filter(|o| *o < 4) else {
            return PortWrite::Ignored;
        };
        let mut state = self.state.lock();
        match offset {
            0 => {
                state.address = value as u16;
                PortWrite::Address
            }
            2 => {
                state.address = 0x100 | value as u16;
                PortWrite::Address
            }
            _ => {
                let reg = state.address;
                if state.write_timer(reg, value, now) {
                    return PortWrite::Timer;
                }
                state.chip.write_reg_buffered(reg, value);
                state.last_audio_write = now;
                drop(state);
                if self.channel.wake_up() {
                    tracing::debug!("opl3 channel woken by register write");
                }
                PortWrite::Audio
            }
        }
    }

    /// Handles a byte read. The status register is mirrored on `base+0`; other
    /// offsets float high.
    pub fn read_port(&self, port: u16, now: f64) -> u8 {
        match port.checked_sub(self.base_port) {
            Some(0) => self.state.lock().status(now),
            _ => 0xff,
        }
    }

    /// Emulated milliseconds until the next queued register write is due.
    ///
    /// The queue delay counts from the most recent register write, so time
    /// already elapsed since then is subtracted.
    pub fn ticks_until_next_write(&self, now: f64) -> Option<f64> {
        let state = self.state.lock();
        let elapsed = (now - state.last_audio_write).max(0.0);
        state
            .chip
            .samples_until_next_write()
            .map(|samples| (samples as f64 * 1000.0 / OPL3_NATIVE_RATE as f64 - elapsed).max(0.0))
    }

    /// Emulated milliseconds until the earliest armed timer overflows.
    pub fn ticks_until_timer_overflow(&self, now: f64) -> Option<f64> {
        self.state
            .lock()
            .timers
            .iter()
            .filter_map(|t| t.time_until_overflow(now))
            .reduce(f64::min)
    }

    /// Resets the chip and timers.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        *state = Opl3State::new();
        tracing::debug!("opl3 device reset");
    }

    /// Runs `f` with exclusive access to the chip.
    pub fn with_chip<R>(&self, f: impl FnOnce(&mut Opl3Chip) -> R) -> R {
        f(&mut self.state.lock().chip)
    }

    /// Removes the device's channel from `mixer`.
    pub fn detach(self, mixer: &Mixer) -> Result<()> {
        mixer.deregister_channel(self.channel.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{MixerConfig, NullOutput};

    fn device() -> (Mixer, Opl3Device) {
        let mixer = Mixer::new(MixerConfig::default(), Box::new(NullOutput)).expect("mixer");
        let device = Opl3Device::new(&mixer, DEFAULT_BASE_PORT);
        (mixer, device)
    }

    #[test]
    fn registers_a_synth_channel() {
        let (mixer, device) = device();
        let channel = mixer.find_channel(CHANNEL_NAME).expect("channel registered");
        assert!(Arc::ptr_eq(&channel, device.channel()));
        assert!(channel.has_feature(ChannelFeatures::SYNTHESIZER | ChannelFeatures::SLEEP));
        assert_eq!(channel.sample_rate(), OPL3_NATIVE_RATE);
        assert!(!channel.is_enabled());
    }

    #[test]
    fn classifies_port_writes() {
        let (_mixer, device) = device();
        assert_eq!(device.write_port(0x388, 0x20, 0.0), PortWrite::Address);
        assert_eq!(device.write_port(0x389, 0x01, 0.0), PortWrite::Audio);
        assert_eq!(device.write_port(0x388, 0x04, 0.0), PortWrite::Address);
        assert_eq!(device.write_port(0x389, 0x00, 0.0), PortWrite::Timer);
        assert_eq!(device.write_port(0x38a, 0x05, 0.0), PortWrite::Address);
        assert_eq!(device.write_port(0x38b, 0x01, 0.0), PortWrite::Audio);
        assert_eq!(device.write_port(0x220, 0x01, 0.0), PortWrite::Ignored);
    }

    #[test]
    fn audio_writes_wake_the_channel_and_queue() {
        let (_mixer, device) = device();
        device.write_port(0x388, 0xa0, 0.0);
        device.write_port(0x389, 0x41, 0.0);
        assert!(device.channel().is_enabled());
        let until = device.ticks_until_next_write(0.0).expect("write queued");
        assert!((until - 2000.0 / OPL3_NATIVE_RATE as f64).abs() < 1e-9);
        assert_eq!(device.with_chip(|chip| chip.pending_writes()), 1);
    }

    #[test]
    fn next_write_delay_counts_down_from_the_last_write() {
        let (_mixer, device) = device();
        device.write_port(0x388, 0xa0, 1.0);
        device.write_port(0x389, 0x41, 1.0);
        let delay = 2000.0 / OPL3_NATIVE_RATE as f64;

        let at_write = device.ticks_until_next_write(1.0).expect("write queued");
        assert!((at_write - delay).abs() < 1e-9);
        let later = device.ticks_until_next_write(1.02).expect("write queued");
        assert!((later - (delay - 0.02)).abs() < 1e-9);
        assert_eq!(device.ticks_until_next_write(5.0), Some(0.0));
        // A clock reading before the write never extends the delay.
        let earlier = device.ticks_until_next_write(0.5).expect("write queued");
        assert!((earlier - delay).abs() < 1e-9);
    }

    #[test]
    fn timer_status_detection_sequence() {
        let (_mixer, device) = device();
        let write = |reg: u8, value: u8, now: f64| {
            device.write_port(0x388, reg, now);
            device.write_port(0x389, value, now);
        };
        // The classic AdLib detection routine.
        write(0x04, 0x60, 0.0);
        write(0x04, 0x80, 0.0);
        assert_eq!(device.read_port(0x388, 0.0) & 0xe0, 0x00);

        write(0x02, 0xff, 0.0);
        write(0x04, 0x21, 0.0);
        assert_eq!(device.ticks_until_timer_overflow(0.0).map(|t| (t * 1000.0).round()), Some(80.0));
        assert_eq!(device.read_port(0x388, 0.1) & 0xe0, 0xc0);

        write(0x04, 0x60, 0.2);
        write(0x04, 0x80, 0.2);
        assert_eq!(device.read_port(0x388, 0.2) & 0xe0, 0x00);
        assert_eq!(device.read_port(0x389, 0.2), 0xff);
    }

    #[test]
    fn reset_clears_queue_and_timers() {
        let (_mixer, device) = device();
        device.write_port(0x388, 0xb0, 0.0);
        device.write_port(0x389, 0x20, 0.0);
        device.write_port(0x388, 0x04, 0.0);
        device.write_port(0x389, 0x01, 0.0);
        device.reset();
        assert_eq!(device.ticks_until_next_write(0.0), None);
        assert_eq!(device.ticks_until_timer_overflow(0.0), None);
    }

    #[test]
    fn detach_removes_channel() {
        let (mixer, device) = device();
        device.detach(&mixer).expect("detach");
        assert!(mixer.find_channel(CHANNEL_NAME).is_none());
    }
}
