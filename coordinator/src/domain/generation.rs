//! Repository generation numbers.
//!
//! A generation labels one version of a repository's content on one storage.
//! The value `-1` is a sentinel meaning "never observed" and is kept distinct
//! from `0`, which is the generation assigned to freshly created or imported
//! repositories.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Generation of a repository copy, or [`Generation::UNKNOWN`].
///
/// Ordering treats the unknown sentinel as `-1`, so an unknown generation
/// sorts below every observed generation. Callers that must not treat
/// "unknown" as "behind" check [`Generation::is_unknown`] first.
///
/// # Examples
/// ```
/// use coordinator::domain::Generation;
///
/// let observed = Generation::new(4);
/// assert!(Generation::UNKNOWN < observed);
/// assert_eq!(observed.next(), Generation::new(5));
/// assert_eq!(Generation::UNKNOWN.next(), Generation::new(0));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Generation(i64);

impl Generation {
    /// Sentinel for a copy whose generation has never been recorded.
    pub const UNKNOWN: Self = Self(-1);

    /// Wrap an observed generation.
    pub const fn new(value: u64) -> Self {
        // Generations are bounded by i64 in storage.
        if value > i64::MAX as u64 {
            Self(i64::MAX)
        } else {
            Self(value as i64)
        }
    }

    /// Interpret a raw stored value; negative values map to unknown.
    pub const fn from_raw(value: i64) -> Self {
        if value < 0 { Self::UNKNOWN } else { Self(value) }
    }

    /// Interpret an optional stored value; `None` maps to unknown.
    pub fn from_optional(value: Option<i64>) -> Self {
        value.map_or(Self::UNKNOWN, Self::from_raw)
    }

    /// Whether this is the unknown sentinel.
    pub const fn is_unknown(self) -> bool {
        self.0 < 0
    }

    /// Observed value, or `None` when unknown.
    pub const fn value(self) -> Option<u64> {
        if self.0 < 0 { None } else { Some(self.0 as u64) }
    }

    /// Raw value as stored in the database (`-1` for unknown).
    pub const fn as_i64(self) -> i64 {
        self.0
    }

    /// The generation following this one. Unknown advances to `0`.
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// How many generations `self` trails `latest` by, treating unknown as `-1`.
    pub const fn behind(self, latest: Self) -> u64 {
        let diff = latest.0.saturating_sub(self.0);
        if diff < 0 { 0 } else { diff as u64 }
    }
}

impl Default for Generation {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value() {
            Some(value) => write!(f, "{value}"),
            None => f.write_str("unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(-1, true)]
    #[case(-7, true)]
    #[case(0, false)]
    #[case(12, false)]
    fn raw_values_map_to_unknown_when_negative(#[case] raw: i64, #[case] unknown: bool) {
        assert_eq!(Generation::from_raw(raw).is_unknown(), unknown);
    }

    #[rstest]
    fn missing_value_is_unknown() {
        assert_eq!(Generation::from_optional(None), Generation::UNKNOWN);
        assert_eq!(Generation::from_optional(Some(3)), Generation::new(3));
    }

    #[rstest]
    #[case(Generation::new(5), Generation::new(5), 0)]
    #[case(Generation::new(3), Generation::new(5), 2)]
    #[case(Generation::UNKNOWN, Generation::new(0), 1)]
    #[case(Generation::new(6), Generation::new(5), 0)]
    fn behind_counts_missing_generations(
        #[case] copy: Generation,
        #[case] latest: Generation,
        #[case] expected: u64,
    ) {
        assert_eq!(copy.behind(latest), expected);
    }

    #[rstest]
    fn display_names_the_sentinel() {
        assert_eq!(Generation::UNKNOWN.to_string(), "unknown");
        assert_eq!(Generation::new(9).to_string(), "9");
    }
}
