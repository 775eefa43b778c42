use super::{
    channel::{Channel, ChannelType},
    slot::{EnvelopeClock, EnvelopeStage, KEY_DRUM, KEY_NORMAL, ModSource, Slot},
    tables::{ADDRESS_SLOT, CHANNEL_SLOT, MULTIPLIER},
};

/// Native output rate of the chip (14.31818 MHz / 288).
pub const OPL3_NATIVE_RATE: u32 = 49_716;

pub const CHANNEL_COUNT: usize = 18;
pub const SLOT_COUNT: usize = 36;

const RESAMPLE_FRAC: u32 = 10;
const WRITE_BUFFER_SIZE: usize = 1024;
/// Minimum spacing, in native samples, between two buffered writes.
const WRITE_BUFFER_DELAY: u64 = 2;

const HH_SLOT: usize = 13;
const SD_SLOT: usize = 16;
const TC_SLOT: usize = 17;

#[derive(Debug, Clone, Copy, Default)]
struct PendingWrite {
    reg: u16,
    data: u8,
    time: u64,
    pending: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct RhythmBits {
    hh_bit2: u16,
    hh_bit3: u16,
    hh_bit7: u16,
    hh_bit8: u16,
    tc_bit3: u16,
    tc_bit5: u16,
}

/// Sample-accurate YMF262 (OPL3) emulation.
///
/// Operators and channels live in flat arrays and refer to each other by
/// index. Register writes can be applied immediately with
/// [`write_reg`](Self::write_reg) or queued with
/// [`write_reg_buffered`](Self::write_reg_buffered), in which case they are
/// applied between native samples in the order they were issued.
#[derive(Debug, Clone)]
pub struct Opl3Chip {
    channels: [Channel; CHANNEL_COUNT],
    slots: [Slot; SLOT_COUNT],

    timer: u16,
    eg_timer: u64,
    eg_timer_rem: bool,
    eg_state: u8,
    eg_add: u8,
    eg_timer_lo: u8,

    opl3_mode: bool,
    note_select: u8,
    rhythm: u8,
    vibrato_pos: u8,
    vibrato_shift: u8,
    tremolo: u8,
    tremolo_pos: u8,
    tremolo_shift: u8,
    noise: u32,
    rhythm_bits: RhythmBits,
    mix: [i32; 4],

    sample_rate: u32,
    rate_ratio: i32,
    sample_count: i32,
    old_samples: [i16; 4],
    samples: [i16; 4],

    write_buffer: Vec<PendingWrite>,
    write_sample_count: u64,
    write_cur: usize,
    write_last: usize,
    write_last_time: u64,
}

impl Opl3Chip {
    /// Creates a chip in its reset state, resampling to `sample_rate`.
    pub fn new(sample_rate: u32) -> Self {
        let mut slots: [Slot; SLOT_COUNT] = std::array::from_fn(|_| Slot::new(0));
        let channels: [Channel; CHANNEL_COUNT] = std::array::from_fn(|ch| {
            let first = CHANNEL_SLOT[ch];
            Channel::new(ch, first)
        });
        for ch in &channels {
            for &slot in &ch.slots {
                slots[slot].channel = ch.index;
            }
        }

        let mut chip = Self {
            channels,
            slots,
            timer: 0,
            eg_timer: 0,
            eg_timer_rem: false,
            eg_state: 0,
            eg_add: 0,
            eg_timer_lo: 0,
            opl3_mode: false,
            note_select: 0,
            rhythm: 0,
            vibrato_pos: 0,
            vibrato_shift: 1,
            tremolo: 0,
            tremolo_pos: 0,
            tremolo_shift: 4,
            noise: 1,
            rhythm_bits: RhythmBits::default(),
            mix: [0; 4],
            sample_rate,
            rate_ratio: ((sample_rate << RESAMPLE_FRAC) / OPL3_NATIVE_RATE).max(1) as i32,
            sample_count: 0,
            old_samples: [0; 4],
            samples: [0; 4],
            write_buffer: vec![PendingWrite::default(); WRITE_BUFFER_SIZE],
            write_sample_count: 0,
            write_cur: 0,
            write_last: 0,
            write_last_time: 0,
        };
        for ch in 0..CHANNEL_COUNT {
            chip.setup_algorithm(ch);
        }
        chip
    }

    /// Silences every operator, drops queued writes and rebuilds the channel graph.
    pub fn reset(&mut self, sample_rate: u32) {
        *self = Self::new(sample_rate);
        tracing::debug!(sample_rate, "opl3 chip reset");
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn is_opl3_mode(&self) -> bool {
        self.opl3_mode
    }

    pub fn channel_type(&self, channel: usize) -> ChannelType {
        self.channels[channel].kind
    }

    /// Four-operator partner of `channel`, if it has one.
    pub fn channel_pair(&self, channel: usize) -> Option<usize> {
        self.channels[channel].pair
    }

    /// Channel that owns operator `slot`.
    pub fn slot_channel(&self, slot: usize) -> usize {
        self.slots[slot].channel
    }

    pub fn envelope_stage(&self, slot: usize) -> EnvelopeStage {
        self.slots[slot].eg_gen
    }

    /// Number of buffered writes not yet applied.
    pub fn pending_writes(&self) -> usize {
        self.write_buffer.iter().filter(|w| w.pending).count()
    }

    /// Native samples until the oldest buffered write is due, if any is queued.
    pub fn samples_until_next_write(&self) -> Option<u64> {
        let next = &self.write_buffer[self.write_cur];
        next.pending
            .then(|| next.time.saturating_sub(self.write_sample_count))
    }

    /// Applies a register write immediately. `reg` is 9 bits wide, bit 8 selects the bank.
    pub fn write_reg(&mut self, reg: u16, data: u8) {
        let high = ((reg >> 8) & 0x01) as usize;
        let regm = (reg & 0xff) as u8;
        match regm & 0xf0 {
            0x00 => {
                if high == 1 {
                    match regm & 0x0f {
                        0x04 => self.set_four_op(data),
                        0x05 => {
                            self.opl3_mode = data & 0x01 != 0;
                            tracing::trace!(opl3_mode = self.opl3_mode, "opl3 mode changed");
                        }
                        _ => {}
                    }
                } else if regm & 0x0f == 0x08 {
                    self.note_select = (data >> 6) & 0x01;
                }
            }
            0x20 | 0x30 => {
                if let Some(slot) = Self::slot_for(high, regm) {
                    self.slots[slot].write_20(data);
                }
            }
            0x40 | 0x50 => {
                if let Some(slot) = Self::slot_for(high, regm) {
                    let ch = &self.channels[self.slots[slot].channel];
                    let (f_num, block) = (ch.f_num, ch.block);
                    self.slots[slot].write_40(data, f_num, block);
                }
            }
            0x60 | 0x70 => {
                if let Some(slot) = Self::slot_for(high, regm) {
                    self.slots[slot].write_60(data);
                }
            }
            0x80 | 0x90 => {
                if let Some(slot) = Self::slot_for(high, regm) {
                    self.slots[slot].write_80(data);
                }
            }
            0xe0 | 0xf0 => {
                if let Some(slot) = Self::slot_for(high, regm) {
                    self.slots[slot].write_e0(data, self.opl3_mode);
                }
            }
            0xa0 => {
                if let Some(ch) = Self::channel_for(high, regm) {
                    self.write_a0(ch, data);
                }
            }
            0xb0 => {
                if regm == 0xbd && high == 0 {
                    self.tremolo_shift = (((data >> 7) ^ 1) << 1) + 2;
                    self.vibrato_shift = ((data >> 6) & 0x01) ^ 1;
                    self.update_rhythm(data);
                } else if let Some(ch) = Self::channel_for(high, regm) {
                    self.write_b0(ch, data);
                    if data & 0x20 != 0 {
                        self.channel_key_on(ch);
                    } else {
                        self.channel_key_off(ch);
                    }
                }
            }
            0xc0 => {
                if let Some(ch) = Self::channel_for(high, regm) {
                    self.write_c0(ch, data);
                }
            }
            _ => {}
        }
    }

    /// Queues a register write to be applied at least two native samples after
    /// the previous queued write. If the ring is full the oldest entry is
    /// applied immediately.
    pub fn write_reg_buffered(&mut self, reg: u16, data: u8) {
        let last = self.write_last;
        let entry = self.write_buffer[last];
        if entry.pending {
            self.write_reg(entry.reg, entry.data);
            self.write_cur = (last + 1) % WRITE_BUFFER_SIZE;
            self.write_sample_count = entry.time;
        }

        let time = (self.write_last_time + WRITE_BUFFER_DELAY).max(self.write_sample_count);
        self.write_buffer[last] = PendingWrite {
            reg: reg & 0x1ff,
            data,
            time,
            pending: true,
        };
        self.write_last_time = time;
        self.write_last = (last + 1) % WRITE_BUFFER_SIZE;
    }

    /// Advances the chip by one native sample and returns the four DAC lines
    /// (A, B, C, D). Lines A and B are the stereo pair.
    pub fn generate_4ch(&mut self) -> [i16; 4] {
        let mut out = [0i16; 4];
        out[1] = clip_sample(self.mix[1]);
        out[3] = clip_sample(self.mix[3]);

        for slot in 0..15 {
            self.process_slot(slot);
        }
        let (a, c) = self.mix_channels(|ch| (ch.cha, ch.chc));
        self.mix[0] = a;
        self.mix[2] = c;

        for slot in 15..18 {
            self.process_slot(slot);
        }
        out[0] = clip_sample(self.mix[0]);
        out[2] = clip_sample(self.mix[2]);

        for slot in 18..33 {
            self.process_slot(slot);
        }
        let (b, d) = self.mix_channels(|ch| (ch.chb, ch.chd));
        self.mix[1] = b;
        self.mix[3] = d;

        for slot in 33..36 {
            self.process_slot(slot);
        }

        self.advance_lfo();
        self.advance_envelope_clock();
        self.apply_due_writes();
        out
    }

    /// One native stereo sample.
    pub fn generate(&mut self) -> [i16; 2] {
        let out = self.generate_4ch();
        [out[0], out[1]]
    }

    /// One stereo sample at the configured output rate, linearly interpolated
    /// from the native stream.
    pub fn generate_resampled(&mut self) -> [i16; 2] {
        while self.sample_count >= self.rate_ratio {
            self.old_samples = self.samples;
            self.samples = self.generate_4ch();
            self.sample_count -= self.rate_ratio;
        }
        let ratio = self.rate_ratio;
        let count = self.sample_count;
        let lerp = |i: usize| {
            ((self.old_samples[i] as i32 * (ratio - count) + self.samples[i] as i32 * count) / ratio)
                as i16
        };
        let out = [lerp(0), lerp(1)];
        self.sample_count += 1 << RESAMPLE_FRAC;
        out
    }

    /// Fills `out` with interleaved stereo samples at the output rate.
    pub fn generate_stream(&mut self, out: &mut [i16]) {
        for frame in out.chunks_exact_mut(2) {
            let [left, right] = self.generate_resampled();
            frame[0] = left;
            frame[1] = right;
        }
    }

    fn slot_for(high: usize, regm: u8) -> Option<usize> {
        let slot = ADDRESS_SLOT[(regm & 0x1f) as usize];
        (slot >= 0).then(|| 18 * high + slot as usize)
    }

    fn channel_for(high: usize, regm: u8) -> Option<usize> {
        let ch = (regm & 0x0f) as usize;
        (ch < 9).then(|| 9 * high + ch)
    }

    fn mix_channels(&self, masks: impl Fn(&Channel) -> (u16, u16)) -> (i32, i32) {
        self.channels.iter().fold((0, 0), |(first, second), ch| {
            let accm = ch.accumulate(|slot| self.slots[slot].out) as u16;
            let (m0, m1) = masks(ch);
            (
                first + (accm & m0) as i16 as i32,
                second + (accm & m1) as i16 as i32,
            )
        })
    }

    fn process_slot(&mut self, index: usize) {
        let channel = self.channels[self.slots[index].channel];
        let clock = EnvelopeClock {
            add: self.eg_add,
            state: self.eg_state,
            timer_lo: self.eg_timer_lo,
        };
        let tremolo = self.tremolo;

        let slot = &mut self.slots[index];
        slot.calc_feedback(channel.feedback);
        slot.calc_envelope(channel.ksv, tremolo, clock);

        self.generate_phase(index, &channel);

        let modulation = match self.slots[index].modulator {
            ModSource::Zero => 0,
            ModSource::Output(src) => self.slots[src].out,
            ModSource::Feedback(src) => self.slots[src].fbmod,
        };
        self.slots[index].generate(modulation);
    }

    fn generate_phase(&mut self, index: usize, channel: &Channel) {
        let slot = &mut self.slots[index];
        let mut f_num = channel.f_num;
        if slot.vibrato {
            let mut range = ((f_num >> 7) & 0x07) as i16;
            let pos = self.vibrato_pos;
            if pos & 0x03 == 0 {
                range = 0;
            } else if pos & 0x01 != 0 {
                range >>= 1;
            }
            range >>= self.vibrato_shift;
            if pos & 0x04 != 0 {
                range = -range;
            }
            f_num = f_num.wrapping_add_signed(range);
        }
        let base_freq = ((f_num as u32) << channel.block) >> 1;
        let phase = (slot.pg_phase >> 9) as u16;
        if slot.pg_reset {
            slot.pg_phase = 0;
        }
        slot.pg_phase = slot
            .pg_phase
            .wrapping_add((base_freq * MULTIPLIER[slot.mult as usize] as u32) >> 1);
        slot.pg_phase_out = phase;

        let noise = self.noise;
        let bits = &mut self.rhythm_bits;
        let rhythm_on = self.rhythm & 0x20 != 0;
        if index == HH_SLOT {
            bits.hh_bit2 = (phase >> 2) & 0x01;
            bits.hh_bit3 = (phase >> 3) & 0x01;
            bits.hh_bit7 = (phase >> 7) & 0x01;
            bits.hh_bit8 = (phase >> 8) & 0x01;
        }
        if index == TC_SLOT && rhythm_on {
            bits.tc_bit3 = (phase >> 3) & 0x01;
            bits.tc_bit5 = (phase >> 5) & 0x01;
        }
        if rhythm_on {
            let rm_xor = (bits.hh_bit2 ^ bits.hh_bit7)
                | (bits.hh_bit3 ^ bits.tc_bit5)
                | (bits.tc_bit3 ^ bits.tc_bit5);
            let noise_bit = (noise & 0x01) as u16;
            match index {
                HH_SLOT => {
                    slot.pg_phase_out = rm_xor << 9;
                    slot.pg_phase_out |= if rm_xor ^ noise_bit != 0 { 0xd0 } else { 0x34 };
                }
                SD_SLOT => {
                    slot.pg_phase_out = (bits.hh_bit8 << 9) | ((bits.hh_bit8 ^ noise_bit) << 8);
                }
                TC_SLOT => {
                    slot.pg_phase_out = (rm_xor << 9) | 0x80;
                }
                _ => {}
            }
        }

        let n_bit = ((noise >> 14) ^ noise) & 0x01;
        self.noise = (noise >> 1) | (n_bit << 22);
    }

    fn advance_lfo(&mut self) {
        if self.timer & 0x3f == 0x3f {
            self.tremolo_pos = (self.tremolo_pos + 1) % 210;
        }
        self.tremolo = if self.tremolo_pos < 105 {
            self.tremolo_pos >> self.tremolo_shift
        } else {
            (210 - self.tremolo_pos) >> self.tremolo_shift
        };
        if self.timer & 0x3ff == 0x3ff {
            self.vibrato_pos = (self.vibrato_pos + 1) & 0x07;
        }
        self.timer = self.timer.wrapping_add(1);
    }

    fn advance_envelope_clock(&mut self) {
        if self.eg_state != 0 {
            let shift = self.eg_timer.trailing_zeros().min(36);
            self.eg_add = if shift > 12 { 0 } else { shift as u8 + 1 };
            self.eg_timer_lo = (self.eg_timer & 0x03) as u8;
        }
        if self.eg_timer_rem || self.eg_state != 0 {
            if self.eg_timer == 0xf_ffff_ffff {
                self.eg_timer = 0;
                self.eg_timer_rem = true;
            } else {
                self.eg_timer += 1;
                self.eg_timer_rem = false;
            }
        }
        self.eg_state ^= 1;
    }

    fn apply_due_writes(&mut self) {
        loop {
            let entry = self.write_buffer[self.write_cur];
            if !entry.pending || entry.time > self.write_sample_count {
                break;
            }
            self.write_buffer[self.write_cur].pending = false;
            self.write_reg(entry.reg, entry.data);
            self.write_cur = (self.write_cur + 1) % WRITE_BUFFER_SIZE;
        }
        self.write_sample_count += 1;
    }

    fn refresh_ksl(&mut self, ch: usize) {
        let Channel {
            slots, f_num, block, ..
        } = self.channels[ch];
        for slot in slots {
            self.slots[slot].update_ksl(f_num, block);
        }
    }

    /// Copies frequency state to the second half of a four-operator pair.
    fn sync_pair_frequency(&mut self, ch: usize) {
        let src = self.channels[ch];
        if !(self.opl3_mode && src.kind == ChannelType::FourOp) {
            return;
        }
        if let Some(pair) = src.pair {
            let dst = &mut self.channels[pair];
            dst.f_num = src.f_num;
            dst.block = src.block;
            dst.ksv = src.ksv;
            self.refresh_ksl(pair);
        }
    }

    fn write_a0(&mut self, ch: usize, data: u8) {
        if self.opl3_mode && self.channels[ch].kind == ChannelType::FourOpSecond {
            return;
        }
        let note_select = self.note_select;
        let channel = &mut self.channels[ch];
        channel.f_num = (channel.f_num & 0x300) | data as u16;
        channel.update_ksv(note_select);
        self.refresh_ksl(ch);
        self.sync_pair_frequency(ch);
    }

    fn write_b0(&mut self, ch: usize, data: u8) {
        if self.opl3_mode && self.channels[ch].kind == ChannelType::FourOpSecond {
            return;
        }
        let note_select = self.note_select;
        let channel = &mut self.channels[ch];
        channel.f_num = (channel.f_num & 0xff) | (((data & 0x03) as u16) << 8);
        channel.block = (data >> 2) & 0x07;
        channel.update_ksv(note_select);
        self.refresh_ksl(ch);
        self.sync_pair_frequency(ch);
    }

    fn write_c0(&mut self, ch: usize, data: u8) {
        let channel = &mut self.channels[ch];
        channel.feedback = (data & 0x0e) >> 1;
        channel.connection = data & 0x01;
        channel.set_output_masks(data, self.opl3_mode);
        self.update_algorithm(ch);
    }

    fn update_algorithm(&mut self, ch: usize) {
        let connection = self.channels[ch].connection;
        self.channels[ch].algorithm = connection;
        if !self.opl3_mode {
            self.setup_algorithm(ch);
            return;
        }
        match (self.channels[ch].kind, self.channels[ch].pair) {
            (ChannelType::FourOp, Some(pair)) => {
                let pair_connection = self.channels[pair].connection;
                self.channels[pair].algorithm = 0x04 | (connection << 1) | pair_connection;
                self.channels[ch].algorithm = 0x08;
                self.setup_algorithm(pair);
            }
            (ChannelType::FourOpSecond, Some(pair)) => {
                let pair_connection = self.channels[pair].connection;
                self.channels[ch].algorithm = 0x04 | (pair_connection << 1) | connection;
                self.channels[pair].algorithm = 0x08;
                self.setup_algorithm(ch);
            }
            _ => self.setup_algorithm(ch),
        }
    }

    /// Rewires operator modulation inputs and channel output taps for the
    /// channel's current algorithm.
    fn setup_algorithm(&mut self, ch: usize) {
        use ModSource::{Feedback, Output, Zero};

        let channel = self.channels[ch];
        let [s0, s1] = channel.slots;

        if channel.kind == ChannelType::Drum {
            if ch == 7 || ch == 8 {
                self.slots[s0].modulator = Zero;
                self.slots[s1].modulator = Zero;
                return;
            }
            self.slots[s0].modulator = Feedback(s0);
            self.slots[s1].modulator = if channel.algorithm & 0x01 == 0 {
                Output(s0)
            } else {
                Zero
            };
            return;
        }

        if channel.algorithm & 0x08 != 0 {
            return;
        }

        if channel.algorithm & 0x04 != 0 {
            let Some(pair) = channel.pair else {
                return;
            };
            let [p0, p1] = self.channels[pair].slots;
            self.channels[pair].out = [Zero; 4];
            let (mods, out) = match channel.algorithm & 0x03 {
                0 => (
                    [Feedback(p0), Output(p0), Output(p1), Output(s0)],
                    [Output(s1), Zero, Zero, Zero],
                ),
                1 => (
                    [Feedback(p0), Output(p0), Zero, Output(s0)],
                    [Output(p1), Output(s1), Zero, Zero],
                ),
                2 => (
                    [Feedback(p0), Zero, Output(p1), Output(s0)],
                    [Output(p0), Output(s1), Zero, Zero],
                ),
                _ => (
                    [Feedback(p0), Zero, Output(p1), Zero],
                    [Output(p0), Output(s0), Output(s1), Zero],
                ),
            };
            for (slot, modulator) in [p0, p1, s0, s1].into_iter().zip(mods) {
                self.slots[slot].modulator = modulator;
            }
            self.channels[ch].out = out;
        } else {
            self.slots[s0].modulator = Feedback(s0);
            if channel.algorithm & 0x01 == 0 {
                self.slots[s1].modulator = Output(s0);
                self.channels[ch].out = [Output(s1), Zero, Zero, Zero];
            } else {
                self.slots[s1].modulator = Zero;
                self.channels[ch].out = [Output(s0), Output(s1), Zero, Zero];
            }
        }
    }

    /// Register 0x104: pairs channels 0-2/3-5 (bits 0-2) and 9-11/12-14 (bits 3-5).
    fn set_four_op(&mut self, data: u8) {
        for bit in 0..6 {
            let ch = if bit >= 3 { bit + 9 - 3 } else { bit };
            let (first, second) = if (data >> bit) & 0x01 != 0 {
                (ChannelType::FourOp, ChannelType::FourOpSecond)
            } else {
                (ChannelType::TwoOp, ChannelType::TwoOp)
            };
            self.channels[ch].kind = first;
            self.channels[ch + 3].kind = second;
            self.update_algorithm(ch);
            self.update_algorithm(ch + 3);
        }
    }

    fn update_rhythm(&mut self, data: u8) {
        use ModSource::{Output, Zero};

        self.rhythm = data & 0x3f;
        if self.rhythm & 0x20 == 0 {
            for ch in 6..9 {
                self.channels[ch].kind = ChannelType::TwoOp;
                self.setup_algorithm(ch);
                for slot in self.channels[ch].slots {
                    self.slots[slot].key_off(KEY_DRUM);
                }
            }
            return;
        }

        let op = |chip: &Self, ch: usize, n: usize| Output(chip.channels[ch].slots[n]);
        self.channels[6].out = [op(self, 6, 1), op(self, 6, 1), Zero, Zero];
        self.channels[7].out = [op(self, 7, 0), op(self, 7, 0), op(self, 7, 1), op(self, 7, 1)];
        self.channels[8].out = [op(self, 8, 0), op(self, 8, 0), op(self, 8, 1), op(self, 8, 1)];
        for ch in 6..9 {
            self.channels[ch].kind = ChannelType::Drum;
            self.setup_algorithm(ch);
        }

        // hi-hat, top cymbal, tom-tom, snare, bass drum (both operators)
        let drums = [(7, 0, 0x01), (8, 1, 0x02), (8, 0, 0x04), (7, 1, 0x08), (6, 0, 0x10), (6, 1, 0x10)];
        for (ch, n, bit) in drums {
            let slot = self.channels[ch].slots[n];
            if self.rhythm & bit != 0 {
                self.slots[slot].key_on(KEY_DRUM);
            } else {
                self.slots[slot].key_off(KEY_DRUM);
            }
        }
    }

    fn keyed_slots(&self, ch: usize) -> Vec<usize> {
        let channel = &self.channels[ch];
        if !self.opl3_mode {
            return channel.slots.to_vec();
        }
        match (channel.kind, channel.pair) {
            (ChannelType::FourOp, Some(pair)) => {
                let [a, b] = channel.slots;
                let [c, d] = self.channels[pair].slots;
                vec![a, b, c, d]
            }
            (ChannelType::FourOpSecond, _) => Vec::new(),
            _ => channel.slots.to_vec(),
        }
    }

    fn channel_key_on(&mut self, ch: usize) {
        for slot in self.keyed_slots(ch) {
            self.slots[slot].key_on(KEY_NORMAL);
        }
    }

    fn channel_key_off(&mut self, ch: usize) {
        for slot in self.keyed_slots(ch) {
            self.slots[slot].key_off(KEY_NORMAL);
        }
    }
}

fn clip_sample(sample: i32) -> i16 {
    sample.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Programs channel 0 as a plain sine voice and keys it on.
    fn key_on_sine(chip: &mut Opl3Chip, write: fn(&mut Opl3Chip, u16, u8)) {
        write(chip, 0x20, 0x21);
        write(chip, 0x23, 0x21);
        write(chip, 0x40, 0x3f);
        write(chip, 0x43, 0x00);
        write(chip, 0x60, 0xf0);
        write(chip, 0x63, 0xf0);
        write(chip, 0x80, 0x0f);
        write(chip, 0x83, 0x0f);
        write(chip, 0xa0, 0x41);
        write(chip, 0xc0, 0x30);
        write(chip, 0xb0, 0x32);
    }

    fn render(chip: &mut Opl3Chip, frames: usize) -> Vec<i16> {
        let mut out = vec![0i16; frames * 2];
        chip.generate_stream(&mut out);
        out
    }

    #[test]
    fn every_slot_belongs_to_exactly_one_channel() {
        let chip = Opl3Chip::new(48_000);
        let mut owners = [0usize; SLOT_COUNT];
        for ch in 0..CHANNEL_COUNT {
            for slot in chip.channels[ch].slots {
                owners[slot] += 1;
                assert_eq!(chip.slot_channel(slot), ch);
            }
        }
        assert!(owners.iter().all(|&n| n == 1));
    }

    #[test]
    fn four_op_pairing_is_symmetric() {
        let mut chip = Opl3Chip::new(48_000);
        chip.write_reg(0x105, 0x01);
        chip.write_reg(0x104, 0x3f);
        for ch in 0..CHANNEL_COUNT {
            if let Some(pair) = chip.channel_pair(ch) {
                assert_eq!(chip.channel_pair(pair), Some(ch));
            }
        }
        assert_eq!(chip.channel_type(0), ChannelType::FourOp);
        assert_eq!(chip.channel_type(3), ChannelType::FourOpSecond);
        assert_eq!(chip.channel_type(11), ChannelType::FourOp);
        assert_eq!(chip.channel_type(14), ChannelType::FourOpSecond);

        chip.write_reg(0x104, 0x00);
        assert_eq!(chip.channel_type(0), ChannelType::TwoOp);
        assert_eq!(chip.channel_type(3), ChannelType::TwoOp);
    }

    #[test]
    fn silent_after_reset() {
        let mut chip = Opl3Chip::new(48_000);
        assert!(render(&mut chip, 512).iter().all(|&s| s == 0));
    }

    #[test]
    fn key_on_produces_sound_and_key_off_releases() {
        let mut chip = Opl3Chip::new(48_000);
        key_on_sine(&mut chip, Opl3Chip::write_reg);
        let out = render(&mut chip, 2048);
        assert!(out.iter().any(|&s| s.unsigned_abs() > 1000));
        assert_eq!(chip.envelope_stage(3), EnvelopeStage::Sustain);

        chip.write_reg(0xb0, 0x12);
        render(&mut chip, 16);
        assert_eq!(chip.envelope_stage(3), EnvelopeStage::Release);
        render(&mut chip, 48_000);
        let tail = render(&mut chip, 256);
        assert!(tail.iter().all(|&s| s.unsigned_abs() < 2));
    }

    #[test]
    fn opl2_mode_feeds_both_lines() {
        let mut chip = Opl3Chip::new(48_000);
        key_on_sine(&mut chip, Opl3Chip::write_reg);
        let frames: Vec<[i16; 2]> = (0..1024).map(|_| chip.generate()).collect();
        assert!(frames.iter().any(|f| f[0] != 0));
        // Line B is latched one native sample after line A.
        for pair in frames.windows(2) {
            assert_eq!(pair[1][1], pair[0][0]);
        }
    }

    #[test]
    fn opl3_mode_honours_output_masks() {
        let mut chip = Opl3Chip::new(48_000);
        chip.write_reg(0x105, 0x01);
        key_on_sine(&mut chip, Opl3Chip::write_reg);
        chip.write_reg(0xc0, 0x10);
        let out = render(&mut chip, 1024);
        assert!(out.chunks_exact(2).any(|f| f[0] != 0));
        assert!(out.chunks_exact(2).all(|f| f[1] == 0));
    }

    #[test]
    fn buffered_writes_take_effect_in_order() {
        let mut chip = Opl3Chip::new(48_000);
        key_on_sine(&mut chip, Opl3Chip::write_reg_buffered);
        assert_eq!(chip.pending_writes(), 11);
        assert_eq!(chip.samples_until_next_write(), Some(2));

        let mut native = 0;
        while chip.pending_writes() > 0 {
            chip.generate();
            native += 1;
        }
        assert_eq!(native, 23);
        assert_eq!(chip.samples_until_next_write(), None);
        assert!(render(&mut chip, 1024).iter().any(|&s| s != 0));
    }

    #[test]
    fn buffered_and_immediate_writes_converge() {
        let mut immediate = Opl3Chip::new(48_000);
        let mut buffered = Opl3Chip::new(48_000);
        key_on_sine(&mut immediate, Opl3Chip::write_reg);
        key_on_sine(&mut buffered, Opl3Chip::write_reg_buffered);
        render(&mut buffered, 64);
        assert_eq!(buffered.pending_writes(), 0);
        assert_eq!(
            immediate.envelope_stage(3),
            buffered.envelope_stage(3),
        );
    }

    #[test]
    fn generation_is_deterministic() {
        let run = || {
            let mut chip = Opl3Chip::new(44_100);
            chip.write_reg(0x105, 0x01);
            key_on_sine(&mut chip, Opl3Chip::write_reg_buffered);
            chip.write_reg_buffered(0xbd, 0x3f);
            chip.write_reg_buffered(0xa6, 0x57);
            chip.write_reg_buffered(0xb6, 0x09);
            render(&mut chip, 4096)
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn rhythm_mode_rewires_drum_channels() {
        let mut chip = Opl3Chip::new(48_000);
        chip.write_reg(0xbd, 0x20);
        for ch in 6..9 {
            assert_eq!(chip.channel_type(ch), ChannelType::Drum);
        }
        chip.write_reg(0xbd, 0x00);
        for ch in 6..9 {
            assert_eq!(chip.channel_type(ch), ChannelType::TwoOp);
        }
    }

    #[test]
    fn reset_restores_power_on_state() {
        let mut chip = Opl3Chip::new(48_000);
        chip.write_reg(0x105, 0x01);
        key_on_sine(&mut chip, Opl3Chip::write_reg_buffered);
        chip.reset(22_050);
        assert_eq!(chip.sample_rate(), 22_050);
        assert!(!chip.is_opl3_mode());
        assert_eq!(chip.pending_writes(), 0);
        assert_eq!(chip.envelope_stage(0), EnvelopeStage::Release);
        assert!(render(&mut chip, 256).iter().all(|&s| s == 0));
    }
}
