use super::tables::{EG_INC_STEP, EXP_ROM, KSL_ROM, KSL_SHIFT, LOG_SIN_ROM};

/// Key-on sources. A slot sounds while either bit is set.
pub(super) const KEY_NORMAL: u8 = 0x01;
pub(super) const KEY_DRUM: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnvelopeStage {
    Attack,
    Decay,
    Sustain,
    #[default]
    Release,
}

/// Where a slot takes its phase modulation from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(super) enum ModSource {
    #[default]
    Zero,
    /// Output of another slot.
    Output(usize),
    /// Feedback value of a slot (its own in practice).
    Feedback(usize),
}

/// Chip-wide envelope clock state shared by every slot for one sample.
#[derive(Debug, Clone, Copy)]
pub(super) struct EnvelopeClock {
    pub add: u8,
    pub state: u8,
    pub timer_lo: u8,
}

/// One operator.
#[derive(Debug, Clone, Copy)]
pub(super) struct Slot {
    pub channel: usize,

    pub out: i16,
    pub fbmod: i16,
    pub prout: i16,
    pub modulator: ModSource,

    pub eg_rout: u16,
    pub eg_out: u16,
    pub eg_ksl: u8,
    pub eg_gen: EnvelopeStage,
    pub key: u8,
    pub pg_reset: bool,
    pub pg_phase: u32,
    pub pg_phase_out: u16,

    pub tremolo: bool,
    pub vibrato: bool,
    /// Envelope type: sustain at the sustain level while keyed on.
    pub sustained: bool,
    pub ksr: bool,
    pub mult: u8,
    pub ksl: u8,
    pub total_level: u8,
    pub attack: u8,
    pub decay: u8,
    pub sustain_level: u8,
    pub release: u8,
    pub waveform: u8,
}

impl Slot {
    pub(super) fn new(channel: usize) -> Self {
        Self {
            channel,
            out: 0,
            fbmod: 0,
            prout: 0,
            modulator: ModSource::Zero,
            eg_rout: 0x1ff,
            eg_out: 0x1ff,
            eg_ksl: 0,
            eg_gen: EnvelopeStage::Release,
            key: 0,
            pg_reset: false,
            pg_phase: 0,
            pg_phase_out: 0,
            tremolo: false,
            vibrato: false,
            sustained: false,
            ksr: false,
            mult: 0,
            ksl: 0,
            total_level: 0,
            attack: 0,
            decay: 0,
            sustain_level: 0,
            release: 0,
            waveform: 0,
        }
    }

    pub(super) fn write_20(&mut self, data: u8) {
        self.tremolo = data & 0x80 != 0;
        self.vibrato = data & 0x40 != 0;
        self.sustained = data & 0x20 != 0;
        self.ksr = data & 0x10 != 0;
        self.mult = data & 0x0f;
    }

    pub(super) fn write_40(&mut self, data: u8, f_num: u16, block: u8) {
        self.ksl = (data >> 6) & 0x03;
        self.total_level = data & 0x3f;
        self.update_ksl(f_num, block);
    }

    pub(super) fn write_60(&mut self, data: u8) {
        self.attack = (data >> 4) & 0x0f;
        self.decay = data & 0x0f;
    }

    pub(super) fn write_80(&mut self, data: u8) {
        self.sustain_level = (data >> 4) & 0x0f;
        if self.sustain_level == 0x0f {
            self.sustain_level = 0x1f;
        }
        self.release = data & 0x0f;
    }

    pub(super) fn write_e0(&mut self, data: u8, opl3_mode: bool) {
        self.waveform = data & 0x07;
        if !opl3_mode {
            self.waveform &= 0x03;
        }
    }

    pub(super) fn update_ksl(&mut self, f_num: u16, block: u8) {
        let ksl = ((KSL_ROM[(f_num >> 6) as usize] as i16) << 2) - ((0x08 - block as i16) << 5);
        self.eg_ksl = ksl.max(0) as u8;
    }

    pub(super) fn key_on(&mut self, source: u8) {
        self.key |= source;
    }

    pub(super) fn key_off(&mut self, source: u8) {
        self.key &= !source;
    }

    pub(super) fn calc_feedback(&mut self, feedback: u8) {
        self.fbmod = if feedback != 0 {
            ((self.prout as i32 + self.out as i32) >> (0x09 - feedback)) as i16
        } else {
            0
        };
        self.prout = self.out;
    }

    /// Advances the envelope generator by one sample.
    pub(super) fn calc_envelope(&mut self, ksv: u8, tremolo: u8, clock: EnvelopeClock) {
        let eg_out = self.eg_rout
            + ((self.total_level as u16) << 2)
            + ((self.eg_ksl as u16) >> KSL_SHIFT[self.ksl as usize])
            + if self.tremolo { tremolo as u16 } else { 0 };
        self.eg_out = eg_out.min(0x1ff);

        let reset = self.key != 0 && self.eg_gen == EnvelopeStage::Release;
        let reg_rate = if reset {
            self.attack
        } else {
            match self.eg_gen {
                EnvelopeStage::Attack => self.attack,
                EnvelopeStage::Decay => self.decay,
                EnvelopeStage::Sustain if !self.sustained => self.release,
                EnvelopeStage::Sustain => 0,
                EnvelopeStage::Release => self.release,
            }
        };
        self.pg_reset = reset;

        let ks = ksv >> (((!self.ksr) as u8) << 1);
        let nonzero = reg_rate != 0;
        let rate = ks + (reg_rate << 2);
        let mut rate_hi = rate >> 2;
        let rate_lo = rate & 0x03;
        if rate_hi & 0x10 != 0 {
            rate_hi = 0x0f;
        }
        let eg_shift = rate_hi + clock.add;

        let mut shift = 0u8;
        if nonzero {
            if rate_hi < 12 {
                if clock.state != 0 {
                    shift = match eg_shift {
                        12 => 1,
                        13 => (rate_lo >> 1) & 0x01,
                        14 => rate_lo & 0x01,
                        _ => 0,
                    };
                }
            } else {
                shift = (rate_hi & 0x03) + EG_INC_STEP[rate_lo as usize][clock.timer_lo as usize];
                if shift & 0x04 != 0 {
                    shift = 0x03;
                }
                if shift == 0 {
                    shift = clock.state;
                }
            }
        }

        let mut eg_rout = self.eg_rout as i32;
        let mut eg_inc = 0i32;
        if reset && rate_hi == 0x0f {
            eg_rout = 0;
        }
        let eg_off = self.eg_rout & 0x1f8 == 0x1f8;
        if self.eg_gen != EnvelopeStage::Attack && !reset && eg_off {
            eg_rout = 0x1ff;
        }

        match self.eg_gen {
            EnvelopeStage::Attack => {
                if self.eg_rout == 0 {
                    self.eg_gen = EnvelopeStage::Decay;
                } else if self.key != 0 && shift > 0 && rate_hi != 0x0f {
                    eg_inc = (!(self.eg_rout as i32)) >> (4 - shift);
                }
            }
            EnvelopeStage::Decay => {
                if (self.eg_rout >> 4) as u8 == self.sustain_level {
                    self.eg_gen = EnvelopeStage::Sustain;
                } else if !eg_off && !reset && shift > 0 {
                    eg_inc = 1 << (shift - 1);
                }
            }
            EnvelopeStage::Sustain | EnvelopeStage::Release => {
                if !eg_off && !reset && shift > 0 {
                    eg_inc = 1 << (shift - 1);
                }
            }
        }
        self.eg_rout = ((eg_rout + eg_inc) & 0x1ff) as u16;

        if reset {
            self.eg_gen = EnvelopeStage::Attack;
        }
        if self.key == 0 {
            self.eg_gen = EnvelopeStage::Release;
        }
    }

    /// Computes the operator output for the current phase and envelope.
    pub(super) fn generate(&mut self, modulation: i16) {
        let phase = (self.pg_phase_out as i32 + modulation as i32) as u16;
        self.out = waveform(self.waveform, phase, self.eg_out);
    }
}

fn calc_exp(level: u32) -> i16 {
    let level = level.min(0x1fff);
    (((EXP_ROM[(level & 0xff) as usize] as u32) << 1) >> (level >> 8)) as i16
}

fn log_sin(index: u16) -> u32 {
    LOG_SIN_ROM[(index & 0xff) as usize] as u32
}

/// The eight OPL3 waveforms, evaluated in the log domain.
fn waveform(kind: u8, phase: u16, envelope: u16) -> i16 {
    let phase = phase & 0x3ff;
    let env = (envelope as u32) << 3;
    // Negation in the hardware is a one's complement.
    let neg = |v: i16, negative: bool| if negative { !v } else { v };
    match kind & 0x07 {
        0 => {
            let out = if phase & 0x100 != 0 {
                log_sin((phase & 0xff) ^ 0xff)
            } else {
                log_sin(phase)
            };
            neg(calc_exp(out + env), phase & 0x200 != 0)
        }
        1 => {
            let out = if phase & 0x200 != 0 {
                0x1000
            } else if phase & 0x100 != 0 {
                log_sin((phase & 0xff) ^ 0xff)
            } else {
                log_sin(phase)
            };
            calc_exp(out + env)
        }
        2 => {
            let out = if phase & 0x100 != 0 {
                log_sin((phase & 0xff) ^ 0xff)
            } else {
                log_sin(phase)
            };
            calc_exp(out + env)
        }
        3 => {
            let out = if phase & 0x100 != 0 { 0x1000 } else { log_sin(phase) };
            calc_exp(out + env)
        }
        4 => {
            let out = if phase & 0x200 != 0 {
                0x1000
            } else if phase & 0x80 != 0 {
                log_sin(((phase ^ 0xff) << 1) & 0xff)
            } else {
                log_sin((phase << 1) & 0xff)
            };
            neg(calc_exp(out + env), phase & 0x300 == 0x100)
        }
        5 => {
            let out = if phase & 0x200 != 0 {
                0x1000
            } else if phase & 0x80 != 0 {
                log_sin(((phase ^ 0xff) << 1) & 0xff)
            } else {
                log_sin((phase << 1) & 0xff)
            };
            calc_exp(out + env)
        }
        6 => neg(calc_exp(env), phase & 0x200 != 0),
        _ => {
            let negative = phase & 0x200 != 0;
            let phase = if negative { (phase & 0x1ff) ^ 0x1ff } else { phase };
            neg(calc_exp(((phase as u32) << 3) + env), negative)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sine_peaks_at_quarter_phase_and_inverts() {
        let peak = waveform(0, 0xff, 0);
        assert_eq!(peak, 4084);
        assert_eq!(waveform(0, 0x2ff, 0), !peak);
        assert!(waveform(0, 0, 0) < 20);
    }

    #[test]
    fn half_sine_is_silent_in_second_half() {
        assert_eq!(waveform(1, 0x200, 0), 0);
        assert_eq!(waveform(1, 0x3ff, 0), 0);
        assert!(waveform(1, 0x100, 0) > 4000);
    }

    #[test]
    fn full_attenuation_is_silent() {
        for kind in 0..8 {
            for phase in [0u16, 0x80, 0x100, 0x1ff, 0x200, 0x300] {
                let v = waveform(kind, phase, 0x1ff);
                assert!(v == 0 || v == -1, "waveform {kind} phase {phase:#x} gave {v}");
            }
        }
    }

    #[test]
    fn sustain_level_fifteen_maps_to_full_range() {
        let mut slot = Slot::new(0);
        slot.write_80(0xf3);
        assert_eq!(slot.sustain_level, 0x1f);
        assert_eq!(slot.release, 3);
    }

    #[test]
    fn opl2_mode_limits_waveforms() {
        let mut slot = Slot::new(0);
        slot.write_e0(0x07, false);
        assert_eq!(slot.waveform, 3);
        slot.write_e0(0x07, true);
        assert_eq!(slot.waveform, 7);
    }

    #[test]
    fn envelope_attacks_decays_and_releases() {
        let mut slot = Slot::new(0);
        slot.write_60(0xfa);
        slot.write_80(0x44);
        slot.sustained = true;
        slot.key_on(KEY_NORMAL);
        let clock = EnvelopeClock {
            add: 2,
            state: 1,
            timer_lo: 0,
        };

        slot.calc_envelope(0, 0, clock);
        assert_eq!(slot.eg_gen, EnvelopeStage::Attack);
        assert!(slot.pg_reset);
        assert_eq!(slot.eg_rout, 0, "rate 15 attack is instant");

        slot.calc_envelope(0, 0, clock);
        assert_eq!(slot.eg_gen, EnvelopeStage::Decay);

        for _ in 0..100_000 {
            slot.calc_envelope(0, 0, clock);
            if slot.eg_gen == EnvelopeStage::Sustain {
                break;
            }
        }
        assert_eq!(slot.eg_gen, EnvelopeStage::Sustain);
        assert_eq!(slot.eg_rout >> 4, 4);

        slot.key_off(KEY_NORMAL);
        slot.calc_envelope(0, 0, clock);
        assert_eq!(slot.eg_gen, EnvelopeStage::Release);
    }
}
