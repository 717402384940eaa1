//! Byte quantities for memory limits
//!
//! Parses and formats sizes the way operators type them on the command line:
//! plain bytes ("4096"), or a number with a binary suffix ("64M", "64MiB").

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A size in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Size(pub u64);

impl Size {
    pub const fn bytes(self) -> u64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub const fn kib(n: u64) -> Self {
        Size(n << 10)
    }

    pub const fn mib(n: u64) -> Self {
        Size(n << 20)
    }

    pub const fn gib(n: u64) -> Self {
        Size(n << 30)
    }
}

const UNITS: [(&str, u64); 4] = [("TiB", 1 << 40), ("GiB", 1 << 30), ("MiB", 1 << 20), ("KiB", 1 << 10)];

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Use the largest unit that divides evenly, so "64MiB" round-trips
        for (suffix, factor) in UNITS {
            if self.0 >= factor && self.0 % factor == 0 {
                return write!(f, "{}{}", self.0 / factor, suffix);
            }
        }
        write!(f, "{}B", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseSizeError {
    #[error("empty size")]
    Empty,

    #[error("invalid size {0:?}")]
    Invalid(String),

    #[error("unknown size suffix {suffix:?} in {input:?}")]
    UnknownSuffix { input: String, suffix: String },

    #[error("size {0:?} overflows 64 bits")]
    Overflow(String),
}

impl FromStr for Size {
    type Err = ParseSizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseSizeError::Empty);
        }

        let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        let (digits, suffix) = s.split_at(split);
        if digits.is_empty() {
            return Err(ParseSizeError::Invalid(s.to_string()));
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| ParseSizeError::Overflow(s.to_string()))?;

        let factor: u64 = match suffix.trim() {
            "" | "B" => 1,
            "K" | "KiB" => 1 << 10,
            "M" | "MiB" => 1 << 20,
            "G" | "GiB" => 1 << 30,
            "T" | "TiB" => 1 << 40,
            other => {
                return Err(ParseSizeError::UnknownSuffix {
                    input: s.to_string(),
                    suffix: other.to_string(),
                })
            }
        };

        value
            .checked_mul(factor)
            .map(Size)
            .ok_or_else(|| ParseSizeError::Overflow(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_bytes() {
        assert_eq!("4096".parse::<Size>().unwrap(), Size(4096));
        assert_eq!("10B".parse::<Size>().unwrap(), Size(10));
    }

    #[test]
    fn test_parse_suffixes() {
        assert_eq!("64M".parse::<Size>().unwrap(), Size::mib(64));
        assert_eq!("64MiB".parse::<Size>().unwrap(), Size::mib(64));
        assert_eq!("2G".parse::<Size>().unwrap(), Size::gib(2));
        assert_eq!("8KiB".parse::<Size>().unwrap(), Size::kib(8));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!("".parse::<Size>(), Err(ParseSizeError::Empty));
        assert!(matches!("MiB".parse::<Size>(), Err(ParseSizeError::Invalid(_))));
        assert!(matches!(
            "10XB".parse::<Size>(),
            Err(ParseSizeError::UnknownSuffix { .. })
        ));
        assert!(matches!(
            "99999999999T".parse::<Size>(),
            Err(ParseSizeError::Overflow(_))
        ));
    }

    #[test]
    fn test_display() {
        assert_eq!(Size::mib(64).to_string(), "64MiB");
        assert_eq!(Size::gib(1).to_string(), "1GiB");
        assert_eq!(Size(1536).to_string(), "1536B");
        assert_eq!(Size(0).to_string(), "0B");
    }
}
