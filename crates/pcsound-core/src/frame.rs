use std::ops::{Add, AddAssign, Index, IndexMut, Mul, MulAssign, Sub};

/// One instant of stereo audio.
///
/// Inside the mixer samples are kept in 16-bit integer scale (full scale is
/// roughly `±32767.0`); conversion to the backend's `[-1, 1]` range happens
/// only when a block is handed to the output.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StereoFrame {
    pub left: f32,
    pub right: f32,
}

impl StereoFrame {
    pub const SILENCE: Self = Self::new(0.0, 0.0);

    pub const fn new(left: f32, right: f32) -> Self {
        Self { left, right }
    }

    /// Same value on both sides.
    pub const fn splat(value: f32) -> Self {
        Self::new(value, value)
    }

    pub fn is_silent(&self) -> bool {
        self.left == 0.0 && self.right == 0.0
    }

    /// Largest absolute sample of the two sides.
    pub fn peak(&self) -> f32 {
        self.left.abs().max(self.right.abs())
    }

    pub fn map(self, mut f: impl FnMut(f32) -> f32) -> Self {
        Self::new(f(self.left), f(self.right))
    }
}

impl Add for StereoFrame {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.left + rhs.left, self.right + rhs.right)
    }
}

impl AddAssign for StereoFrame {
    fn add_assign(&mut self, rhs: Self) {
        self.left += rhs.left;
        self.right += rhs.right;
    }
}

impl Sub for StereoFrame {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.left - rhs.left, self.right - rhs.right)
    }
}

impl Mul for StereoFrame {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        Self::new(self.left * rhs.left, self.right * rhs.right)
    }
}

impl Mul<f32> for StereoFrame {
    type Output = Self;

    fn mul(self, rhs: f32) -> Self {
        Self::new(self.left * rhs, self.right * rhs)
    }
}

impl MulAssign for StereoFrame {
    fn mul_assign(&mut self, rhs: Self) {
        self.left *= rhs.left;
        self.right *= rhs.right;
    }
}

impl Index<usize> for StereoFrame {
    type Output = f32;

    fn index(&self, index: usize) -> &f32 {
        match index {
            0 => &self.left,
            1 => &self.right,
            _ => panic!("stereo frame index {index} out of range"),
        }
    }
}

impl IndexMut<usize> for StereoFrame {
    fn index_mut(&mut self, index: usize) -> &mut f32 {
        match index {
            0 => &mut self.left,
            1 => &mut self.right,
            _ => panic!("stereo frame index {index} out of range"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_is_component_wise() {
        let a = StereoFrame::new(1.0, -2.0);
        let b = StereoFrame::new(0.5, 4.0);
        assert_eq!(a + b, StereoFrame::new(1.5, 2.0));
        assert_eq!(a * b, StereoFrame::new(0.5, -8.0));
        assert_eq!(a * 2.0, StereoFrame::new(2.0, -4.0));
    }

    #[test]
    fn index_selects_side() {
        let mut f = StereoFrame::new(3.0, 7.0);
        assert_eq!(f[0], 3.0);
        assert_eq!(f[1], 7.0);
        f[1] = 1.0;
        assert_eq!(f.right, 1.0);
    }

    #[test]
    #[should_panic]
    fn index_past_right_panics() {
        let f = StereoFrame::default();
        let _ = f[2];
    }
}
