//! Utility functions and types used throughout the maprace framework.
//!
//! This module provides various helpers including:
//! - Constants for window sizing ([`MIN_LEAK_SIZE`], [`EVIDENCE_LEN`]) and default ceilings
//! - [`hexdump`] for rendering captured bytes
//! - [`pin_thread_to_core`] for racer CPU affinity
//! - Progress reporting utilities ([`NamedProgress`])

mod affinity;
mod constants;
mod hexdump;
mod named_progress;

pub use self::affinity::pin_thread_to_core;
pub use self::constants::*;
pub use self::hexdump::hexdump;
pub use self::named_progress::NamedProgress;

/// Parses an unsigned integer with an optional radix prefix.
///
/// Accepts `0x`/`0X` (hex), `0o` (octal), `0b` (binary) and plain decimal, ignoring `_`
/// separators.
///
/// # Examples
///
/// ```
/// use maprace_core::util::parse_prefixed;
///
/// assert_eq!(parse_prefixed("0x40"), Ok(64));
/// assert_eq!(parse_prefixed("1_024"), Ok(1024));
/// assert!(parse_prefixed("16k").is_err());
/// ```
pub fn parse_prefixed(s: &str) -> Result<u64, std::num::ParseIntError> {
    let s = s.trim().replace('_', "");
    let (digits, radix) = if let Some(hex) = s.strip_prefix("0x").or(s.strip_prefix("0X")) {
        (hex, 16)
    } else if let Some(oct) = s.strip_prefix("0o") {
        (oct, 8)
    } else if let Some(bin) = s.strip_prefix("0b") {
        (bin, 2)
    } else {
        (s.as_str(), 10)
    };
    u64::from_str_radix(digits, radix)
}

#[cfg(test)]
mod tests {
    use super::parse_prefixed;

    #[test]
    fn test_parse_prefixed() {
        assert_eq!(parse_prefixed("16"), Ok(16));
        assert_eq!(parse_prefixed("0x1000"), Ok(4096));
        assert_eq!(parse_prefixed("0o20"), Ok(16));
        assert_eq!(parse_prefixed("0b1000"), Ok(8));
        assert_eq!(parse_prefixed(" 64 "), Ok(64));
    }

    #[test]
    fn test_parse_prefixed_invalid() {
        assert!(parse_prefixed("").is_err());
        assert!(parse_prefixed("0x").is_err());
        assert!(parse_prefixed("12abc").is_err());
        assert!(parse_prefixed("-1").is_err());
    }
}
