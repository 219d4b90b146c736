// Unsigned fixed point with 8 fractional bits
//
// Used where the firmware filters sensor streams without touching the FPU.
// The word is 32 bits wide so a full 10-bit ADC reading fits in the integer
// part; intermediates for mul widen to 64 bits.

use std::ops::{Add, Sub};

/// Number of fractional bits
pub const FRAC_BITS: u32 = 8;

/// Unsigned 24.8 fixed point value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Fixed(u32);

impl Fixed {
    pub const ZERO: Fixed = Fixed(0);
    pub const ONE: Fixed = Fixed(1 << FRAC_BITS);

    /// Wrap a raw fixed-point word
    pub const fn from_bits(bits: u32) -> Self {
        Fixed(bits)
    }

    /// Convert an integer; the integer part saturates at 24 bits
    pub const fn from_int(i: u32) -> Self {
        let max = u32::MAX >> FRAC_BITS;
        let i = if i > max { max } else { i };
        Fixed(i << FRAC_BITS)
    }

    /// Integer part, truncated
    pub const fn to_int(self) -> u32 {
        self.0 >> FRAC_BITS
    }

    pub fn to_f32(self) -> f32 {
        self.0 as f32 / (1u32 << FRAC_BITS) as f32
    }

    pub const fn mul(self, other: Fixed) -> Fixed {
        let wide = (self.0 as u64 * other.0 as u64) >> FRAC_BITS;
        Fixed(if wide > u32::MAX as u64 { u32::MAX } else { wide as u32 })
    }

    pub const fn saturating_sub(self, other: Fixed) -> Fixed {
        Fixed(self.0.saturating_sub(other.0))
    }
}

impl Add for Fixed {
    type Output = Fixed;

    fn add(self, rhs: Fixed) -> Fixed {
        Fixed(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Fixed {
    type Output = Fixed;

    fn sub(self, rhs: Fixed) -> Fixed {
        self.saturating_sub(rhs)
    }
}

/// Exponential smoothing with separate coefficients for rising and falling input
///
/// `value = (1 - k) * value + k * sample`, where `k` is the rise coefficient
/// when the sample is above the current value and the fall coefficient otherwise.
#[derive(Debug, Clone, Copy)]
pub struct AsymmetricEma {
    value: Fixed,
    rise: Fixed,
    fall: Fixed,
}

impl AsymmetricEma {
    pub fn new(rise: Fixed, fall: Fixed) -> Self {
        Self {
            value: Fixed::ZERO,
            rise,
            fall,
        }
    }

    pub fn update(&mut self, sample: Fixed) -> Fixed {
        let k = if sample > self.value { self.rise } else { self.fall };
        let keep = (Fixed::ONE - k).mul(self.value);
        self.value = keep + sample.mul(k);
        self.value
    }

    pub fn value(&self) -> Fixed {
        self.value
    }
}
