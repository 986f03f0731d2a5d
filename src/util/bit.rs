//! Bit-field packing for single-word atomic state
//!
//! Job flags, the active task status and the future wait queue all keep
//! several sub-fields in one machine word so they can be swapped with a
//! single compare-and-swap. `Pack` describes where one sub-field lives.

use std::fmt;

/// Location of a sub-field inside a `usize`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Pack {
    mask: usize,
    shift: u32,
}

impl Pack {
    /// Value is packed in the `width` least-significant bits.
    pub const fn least_significant(width: u32) -> Pack {
        let mask = mask_for(width);

        Pack { mask, shift: 0 }
    }

    /// Value is packed in the `width` bits directly above `self`.
    pub const fn then(
        &self,
        width: u32,
    ) -> Pack {
        let shift = usize::BITS - self.mask.leading_zeros();
        let mask = mask_for(width) << shift;

        Pack { mask, shift }
    }

    /// Width, in bits, dedicated to storing the value.
    pub const fn width(&self) -> u32 {
        usize::BITS - (self.mask >> self.shift).leading_zeros()
    }

    /// Bit offset of the field.
    pub const fn shift(&self) -> u32 {
        self.shift
    }

    /// In-place mask of the field.
    pub const fn mask(&self) -> usize {
        self.mask
    }

    /// Max representable value.
    pub const fn max_value(&self) -> usize {
        (1 << self.width()) - 1
    }

    /// Store `value` into the field, leaving the other bits of `base` alone.
    pub fn pack(
        &self,
        value: usize,
        base: usize,
    ) -> usize {
        assert!(value <= self.max_value(), "value does not fit in bit field");
        (base & !self.mask) | (value << self.shift)
    }

    /// Read the field back out of `src`.
    pub const fn unpack(
        &self,
        src: usize,
    ) -> usize {
        unpack(src, self.mask, self.shift)
    }

    /// Single-bit fields read as booleans.
    pub const fn is_set(
        &self,
        src: usize,
    ) -> bool {
        src & self.mask != 0
    }

    /// Set or clear a single-bit field.
    pub const fn set(
        &self,
        src: usize,
        on: bool,
    ) -> usize {
        if on {
            src | self.mask
        } else {
            src & !self.mask
        }
    }
}

impl fmt::Debug for Pack {
    fn fmt(
        &self,
        fmt: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(
            fmt,
            "Pack {{ mask: {:b}, shift: {} }}",
            self.mask, self.shift
        )
    }
}

/// Returns a `usize` with the right-most `n` bits set.
pub const fn mask_for(n: u32) -> usize {
    let shift = 1usize.wrapping_shl(n - 1);
    shift | (shift - 1)
}

/// Unpacks a value using a mask & shift.
pub const fn unpack(
    src: usize,
    mask: usize,
    shift: u32,
) -> usize {
    (src & mask) >> shift
}
