//! Uniform quantization level sets.
//!
//! A level set holds `2^bits` evenly spaced values spanning either
//! `[-alpha, alpha]` (signed, used for weights) or `[0, alpha]` (unsigned,
//! used for post-ReLU activations). `alpha` is the clipping threshold and is
//! supplied per call so that it can be a learned parameter.

use serde::{Deserialize, Serialize};

use crate::error::{Result, VggQuantError};

/// Largest supported bit-width. Codes are stored as `u16`.
pub const MAX_BITS: u8 = 16;

/// Range covered by a level set, in units of the clipping threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuantRange {
    /// Levels span `[-alpha, alpha]`.
    Signed,
    /// Levels span `[0, alpha]`.
    Unsigned,
}

impl QuantRange {
    /// Lower bound of the normalized range.
    #[must_use]
    pub const fn lower(self) -> f32 {
        match self {
            Self::Signed => -1.0,
            Self::Unsigned => 0.0,
        }
    }

    /// Upper bound of the normalized range.
    #[must_use]
    pub const fn upper(self) -> f32 {
        1.0
    }

    /// Width of the normalized range.
    #[must_use]
    pub const fn span(self) -> f32 {
        match self {
            Self::Signed => 2.0,
            Self::Unsigned => 1.0,
        }
    }
}

/// Ordered set of `2^bits` representable values.
///
/// Deserialization goes through [`LevelSet::new`], so an invalid bit-width is
/// rejected there too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawLevelSet")]
pub struct LevelSet {
    bits: u8,
    range: QuantRange,
}

#[derive(Deserialize)]
struct RawLevelSet {
    bits: u8,
    range: QuantRange,
}

impl TryFrom<RawLevelSet> for LevelSet {
    type Error = VggQuantError;

    fn try_from(raw: RawLevelSet) -> Result<Self> {
        Self::new(raw.bits, raw.range)
    }
}

impl LevelSet {
    /// Create a level set.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `bits` is 0 or larger than [`MAX_BITS`].
    pub fn new(bits: u8, range: QuantRange) -> Result<Self> {
        validate_bits(bits)?;
        Ok(Self { bits, range })
    }

    /// Bit-width.
    #[must_use]
    pub const fn bits(&self) -> u8 {
        self.bits
    }

    /// Range kind.
    #[must_use]
    pub const fn range(&self) -> QuantRange {
        self.range
    }

    /// Number of levels, `2^bits`.
    #[must_use]
    pub const fn num_levels(&self) -> usize {
        1usize << self.bits
    }

    /// Largest code.
    #[must_use]
    pub const fn max_code(&self) -> u16 {
        (self.num_levels() - 1) as u16
    }

    /// Distance between adjacent levels in normalized units.
    #[must_use]
    pub fn step(&self) -> f32 {
        self.range.span() / f32::from(self.max_code())
    }

    /// Clamp a normalized value (`x / alpha`) into the covered range.
    ///
    /// NaN is left as NaN; [`Self::code`] maps it to the lowest level.
    #[must_use]
    pub fn clamp(&self, normalized: f32) -> f32 {
        normalized.clamp(self.range.lower(), self.range.upper())
    }

    /// Whether a normalized value lies inside the range, boundaries included.
    #[must_use]
    pub fn contains(&self, normalized: f32) -> bool {
        normalized >= self.range.lower() && normalized <= self.range.upper()
    }

    /// Index of the level nearest to a normalized value.
    #[must_use]
    pub fn code(&self, normalized: f32) -> u16 {
        let position = (self.clamp(normalized) - self.range.lower()) / self.step();
        // `as` saturates and maps NaN to 0.
        (position.round() as u16).min(self.max_code())
    }

    /// Value of level `code` for clipping threshold `alpha`.
    #[must_use]
    pub fn value(&self, code: u16, alpha: f32) -> f32 {
        let normalized = self.range.lower() + f32::from(code) * self.step();
        alpha * normalized
    }

    /// All levels in ascending order for clipping threshold `alpha`.
    #[must_use]
    pub fn levels(&self, alpha: f32) -> Vec<f32> {
        (0..=self.max_code()).map(|c| self.value(c, alpha)).collect()
    }
}

/// Check that a bit-width is usable.
///
/// # Errors
///
/// Returns `InvalidConfig` if `bits` is 0 or larger than [`MAX_BITS`].
pub fn validate_bits(bits: u8) -> Result<()> {
    if bits == 0 || bits > MAX_BITS {
        return Err(VggQuantError::InvalidConfig(format!(
            "bit-width must be 1-{MAX_BITS}, got {bits}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_bits_rejected() {
        assert!(LevelSet::new(0, QuantRange::Signed).is_err());
        assert!(LevelSet::new(17, QuantRange::Unsigned).is_err());
        assert!(LevelSet::new(16, QuantRange::Unsigned).is_ok());
    }

    #[test]
    fn test_level_count() {
        for bits in 1..=8 {
            let set = LevelSet::new(bits, QuantRange::Signed).unwrap();
            assert_eq!(set.num_levels(), 1 << bits);
            assert_eq!(set.levels(1.0).len(), 1 << bits);
        }
    }

    #[test]
    fn test_signed_two_bit_levels() {
        let set = LevelSet::new(2, QuantRange::Signed).unwrap();
        let levels = set.levels(3.0);
        let expected = [-3.0, -1.0, 1.0, 3.0];
        for (l, e) in levels.iter().zip(expected.iter()) {
            assert!((l - e).abs() < 1e-6, "{levels:?}");
        }
    }

    #[test]
    fn test_unsigned_levels_span_zero_to_alpha() {
        let set = LevelSet::new(4, QuantRange::Unsigned).unwrap();
        let levels = set.levels(8.0);
        assert_eq!(levels[0], 0.0);
        assert!((levels[15] - 8.0).abs() < 1e-6);
        assert!(levels.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_one_bit_signed_is_binary() {
        let set = LevelSet::new(1, QuantRange::Signed).unwrap();
        assert_eq!(set.levels(1.0), vec![-1.0, 1.0]);
        assert_eq!(set.code(-0.2), 0);
        assert_eq!(set.code(0.2), 1);
    }

    #[test]
    fn test_code_clamps_out_of_range() {
        let set = LevelSet::new(2, QuantRange::Unsigned).unwrap();
        assert_eq!(set.code(-5.0), 0);
        assert_eq!(set.code(5.0), set.max_code());
        assert_eq!(set.code(f32::INFINITY), set.max_code());
        assert_eq!(set.code(f32::NAN), 0);
    }

    #[test]
    fn test_deserialize_validates_bits() {
        let err = serde_json::from_str::<LevelSet>(r#"{"bits":0,"range":"Signed"}"#);
        assert!(err.is_err());
        let err = serde_json::from_str::<LevelSet>(r#"{"bits":17,"range":"Unsigned"}"#);
        assert!(err.is_err());

        let set: LevelSet = serde_json::from_str(r#"{"bits":4,"range":"Unsigned"}"#).unwrap();
        assert_eq!(set, LevelSet::new(4, QuantRange::Unsigned).unwrap());
    }

    #[test]
    fn test_contains_includes_boundaries() {
        let set = LevelSet::new(2, QuantRange::Signed).unwrap();
        assert!(set.contains(-1.0));
        assert!(set.contains(1.0));
        assert!(!set.contains(1.0001));
        assert!(!set.contains(f32::NAN));
    }
}
