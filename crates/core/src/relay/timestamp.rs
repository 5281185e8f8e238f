//! Time bases and timestamp rescaling.
//!
//! A time base is the rational unit a stream's timestamps are counted in:
//! 90 kHz video over RTP uses `1/90000`, so a PTS of `90000` is one second.
//! Relaying a packet between containers converts its timestamps from the
//! input stream's time base to the output stream's.

use std::fmt;

/// A time base as `num/den` seconds per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// A time base is usable for rescaling only with a non-zero numerator
    /// and denominator.
    pub fn is_valid(&self) -> bool {
        self.num != 0 && self.den != 0
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Rescale `ts` from time base `from` to time base `to`.
///
/// Computes `ts * from / to` exactly in 128-bit arithmetic and rounds to the
/// nearest integer, halfway cases away from zero. Results beyond the `i64`
/// range saturate. An invalid time base on either side returns `ts`
/// unchanged.
///
/// ```
/// use camrelay::relay::timestamp::{Rational, rescale};
///
/// let rtp = Rational::new(1, 90000);
/// let out = Rational::new(1, 15000);
/// assert_eq!(rescale(90000, rtp, out), 15000);
/// assert_eq!(rescale(3, rtp, out), 1); // 0.5 rounds away from zero
/// ```
pub fn rescale(ts: i64, from: Rational, to: Rational) -> i64 {
    if !from.is_valid() || !to.is_valid() {
        return ts;
    }

    let num = ts as i128 * from.num as i128 * to.den as i128;
    let den = from.den as i128 * to.num as i128;

    let negative = (num < 0) != (den < 0);
    let (n, d) = (num.abs(), den.abs());
    let magnitude = (2 * n + d) / (2 * d);
    let rounded = if negative { -magnitude } else { magnitude };

    rounded.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// Rescale an optional timestamp; a missing timestamp stays missing.
pub fn rescale_opt(ts: Option<i64>, from: Rational, to: Rational) -> Option<i64> {
    ts.map(|t| rescale(t, from, to))
}
