//! Fixed tables of the OPL3 operator and envelope hardware.

use once_cell::sync::Lazy;

/// Quarter-wave log-sine ROM: `-log2(sin(x)) * 256` over the first quarter.
pub(super) static LOG_SIN_ROM: Lazy<[u16; 256]> = Lazy::new(|| {
    let mut rom = [0u16; 256];
    for (i, v) in rom.iter_mut().enumerate() {
        let x = ((i as f64 + 0.5) * std::f64::consts::PI / 512.0).sin();
        *v = (-x.log2() * 256.0).round() as u16;
    }
    rom
});

/// Exponent ROM: `2^((255 - i) / 256) * 1024`.
pub(super) static EXP_ROM: Lazy<[u16; 256]> = Lazy::new(|| {
    let mut rom = [0u16; 256];
    for (i, v) in rom.iter_mut().enumerate() {
        *v = (2f64.powf((255 - i) as f64 / 256.0) * 1024.0).round() as u16;
    }
    rom
});

pub(super) const KSL_ROM: [u8; 16] = [0, 32, 40, 45, 48, 51, 53, 55, 56, 58, 59, 60, 61, 62, 63, 64];

pub(super) const KSL_SHIFT: [u8; 4] = [8, 1, 2, 0];

pub(super) const EG_INC_STEP: [[u8; 4]; 4] = [[0, 0, 0, 0], [1, 0, 0, 0], [1, 0, 1, 0], [1, 1, 1, 0]];

/// Frequency multiplier, doubled.
pub(super) const MULTIPLIER: [u8; 16] = [1, 2, 4, 6, 8, 10, 12, 14, 16, 18, 20, 20, 24, 24, 30, 30];

/// First operator of each channel; the second is three slots later.
pub(super) const CHANNEL_SLOT: [usize; 18] = [0, 1, 2, 6, 7, 8, 12, 13, 14, 18, 19, 20, 24, 25, 26, 30, 31, 32];

/// Register offset (low five bits) to operator index within a bank.
pub(super) const ADDRESS_SLOT: [i8; 32] = [
    0, 1, 2, 3, 4, 5, -1, -1, 6, 7, 8, 9, 10, 11, -1, -1, 12, 13, 14, 15, 16, 17, -1, -1, -1, -1, -1,
    -1, -1, -1, -1, -1,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_sin_rom_matches_hardware_endpoints() {
        assert_eq!(LOG_SIN_ROM[0], 2137);
        assert_eq!(LOG_SIN_ROM[255], 0);
        assert!(LOG_SIN_ROM.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn exp_rom_matches_hardware_endpoints() {
        assert_eq!(EXP_ROM[0], 0x7fa);
        assert_eq!(EXP_ROM[255], 0x400);
        assert!(EXP_ROM.windows(2).all(|w| w[0] >= w[1]));
    }
}
