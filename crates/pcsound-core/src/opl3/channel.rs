use super::slot::ModSource;

/// How a channel's operators are wired together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelType {
    #[default]
    TwoOp,
    /// First half of a four-operator pair; produces no output on its own.
    FourOp,
    /// Second half of a four-operator pair; carries the pair's output.
    FourOpSecond,
    /// Rhythm-mode channel (6, 7 or 8).
    Drum,
}

#[derive(Debug, Clone, Copy)]
pub(super) struct Channel {
    pub index: usize,
    /// Operator indices into the chip's slot arena.
    pub slots: [usize; 2],
    /// Four-operator partner. Pairing is symmetric.
    pub pair: Option<usize>,
    pub kind: ChannelType,
    pub out: [ModSource; 4],

    pub f_num: u16,
    pub block: u8,
    pub feedback: u8,
    pub connection: u8,
    pub algorithm: u8,
    pub ksv: u8,
    /// Output masks for the four DAC lines (A, B, C, D).
    pub cha: u16,
    pub chb: u16,
    pub chc: u16,
    pub chd: u16,
}

impl Channel {
    pub(super) fn new(index: usize, first_slot: usize) -> Self {
        let pair = match index % 9 {
            0..=2 => Some(index + 3),
            3..=5 => Some(index - 3),
            _ => None,
        };
        Self {
            index,
            slots: [first_slot, first_slot + 3],
            pair,
            kind: ChannelType::TwoOp,
            out: [ModSource::Zero; 4],
            f_num: 0,
            block: 0,
            feedback: 0,
            connection: 0,
            algorithm: 0,
            ksv: 0,
            cha: 0xffff,
            chb: 0xffff,
            chc: 0,
            chd: 0,
        }
    }

    pub(super) fn update_ksv(&mut self, note_select: u8) {
        self.ksv = (self.block << 1) | ((self.f_num >> (0x09 - note_select)) & 0x01) as u8;
    }

    pub(super) fn set_output_masks(&mut self, data: u8, opl3_mode: bool) {
        let mask = |bit: u8| if data & bit != 0 { 0xffff } else { 0 };
        if opl3_mode {
            self.cha = mask(0x10);
            self.chb = mask(0x20);
            self.chc = mask(0x40);
            self.chd = mask(0x80);
        } else {
            self.cha = 0xffff;
            self.chb = 0xffff;
            self.chc = 0;
            self.chd = 0;
        }
    }

    /// Sum of the channel's output taps, reading operator outputs from `slot_out`.
    pub(super) fn accumulate(&self, slot_out: impl Fn(usize) -> i16) -> i16 {
        self.out
            .iter()
            .map(|src| match *src {
                ModSource::Output(slot) => slot_out(slot),
                _ => 0,
            })
            .fold(0i16, |acc, v| acc.wrapping_add(v))
    }
}
