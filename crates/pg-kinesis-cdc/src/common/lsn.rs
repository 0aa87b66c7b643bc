//! Log sequence numbers
//!
//! An LSN is an opaque, monotonically increasing 64-bit position in the
//! upstream write-ahead log. The textual form is `X/Y`: the high and low
//! 32 bits as hex segments.

use std::fmt;
use std::str::FromStr;

/// A write-ahead-log position.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    /// The zero position (used before any message has been seen).
    pub const ZERO: Lsn = Lsn(0);
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 as u32)
    }
}

impl fmt::Debug for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lsn({})", self)
    }
}

impl FromStr for Lsn {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (high, low) = s
            .split_once('/')
            .ok_or_else(|| format!("invalid LSN {s:?}: expected X/Y"))?;
        let high = u64::from_str_radix(high, 16).map_err(|e| format!("invalid LSN {s:?}: {e}"))?;
        let low = u32::from_str_radix(low, 16).map_err(|e| format!("invalid LSN {s:?}: {e}"))?;
        if high > u32::MAX as u64 {
            return Err(format!("invalid LSN {s:?}: segment out of range"));
        }
        Ok(Lsn((high << 32) | low as u64))
    }
}

impl From<u64> for Lsn {
    fn from(raw: u64) -> Self {
        Lsn(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format() {
        assert_eq!(Lsn(0).to_string(), "0/0");
        assert_eq!(Lsn(0x1A0).to_string(), "0/1A0");
        assert_eq!(Lsn((1 << 32) | 0xDEADBEEF).to_string(), "1/DEADBEEF");
    }

    #[test]
    fn test_parse_round_trip() {
        for raw in [0u64, 0x1A0, (7 << 32) | 0x00FF_0001, u64::MAX] {
            let lsn = Lsn(raw);
            let parsed: Lsn = lsn.to_string().parse().unwrap();
            assert_eq!(parsed, lsn);
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!("".parse::<Lsn>().is_err());
        assert!("1A0".parse::<Lsn>().is_err());
        assert!("X/Y".parse::<Lsn>().is_err());
        assert!("100000000/0".parse::<Lsn>().is_err());
    }

    #[test]
    fn test_ordering() {
        assert!(Lsn(1) < Lsn(2));
        assert!(Lsn(1 << 32) > Lsn(u32::MAX as u64));
    }
}
