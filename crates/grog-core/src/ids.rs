use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::CoreError;

/// Width of an encoded store key. `u64::MAX` has 20 decimal digits.
pub const KEY_WIDTH: usize = 20;

/// Position of a record in the log. The first persisted record is 1;
/// 0 means "nothing persisted yet".
#[derive(
    Clone, Copy, Debug, Default, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Sequence(u64);

impl Sequence {
    pub const ZERO: Sequence = Sequence(0);
    pub const FIRST: Sequence = Sequence(1);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// The following sequence, or `None` once the counter is exhausted.
    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }

    /// Step back `n` positions, never going below the first record.
    pub fn back_clamped(self, n: u64) -> Self {
        Self(self.0.saturating_sub(n).max(Self::FIRST.0))
    }

    /// Fixed-width, zero-padded decimal key. Byte order of keys equals
    /// numeric order of sequences.
    pub fn to_key(self) -> String {
        format!("{:0width$}", self.0, width = KEY_WIDTH)
    }

    /// Inverse of [`Sequence::to_key`]. Anything that is not exactly
    /// `KEY_WIDTH` ASCII digits is rejected.
    pub fn from_key(key: &str) -> Result<Self, CoreError> {
        if key.len() != KEY_WIDTH || !key.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CoreError::InvalidKey(key.to_owned()));
        }
        key.parse::<u64>()
            .map(Self)
            .map_err(|_| CoreError::InvalidKey(key.to_owned()))
    }
}

impl From<u64> for Sequence {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parses viewer-supplied cursor text: a base-10, non-negative integer.
/// Surrounding whitespace is ignored.
impl FromStr for Sequence {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CoreError::InvalidSequence(s.to_owned()));
        }
        trimmed
            .parse::<u64>()
            .map(Self)
            .map_err(|_| CoreError::InvalidSequence(s.to_owned()))
    }
}

/// Process-local identifier of a connected viewer. Never reused while the
/// process lives.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "viewer_{}", self.0)
    }
}
