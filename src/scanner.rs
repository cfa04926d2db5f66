//! Wildcarded byte-pattern scanning.
//!
//! Patterns are whitespace-delimited sequences of two-digit hex bytes and
//! `??` wildcards, e.g. `"E8 ?? ?? ?? ?? 5F"`. Scans are linear over the
//! region and a wildcard matches any byte.

use tracing::warn;

use crate::error::{Error, Result};

/// A parsed byte pattern. `None` entries match any byte.
#[derive(Clone, Debug)]
pub struct Pattern {
    bytes: Vec<Option<u8>>,
}

impl Pattern {
    /// Parse a pattern string. Fails on empty patterns and tokens that are
    /// neither two hex digits nor `??`.
    pub fn parse(pattern: &str) -> Result<Self> {
        let mut bytes = Vec::new();

        for token in pattern.split_whitespace() {
            if token == "??" {
                bytes.push(None);
            } else if token.len() == 2 {
                let byte = u8::from_str_radix(token, 16)
                    .map_err(|_| Error::InvalidPattern(pattern.to_string()))?;
                bytes.push(Some(byte));
            } else {
                return Err(Error::InvalidPattern(pattern.to_string()));
            }
        }

        if bytes.is_empty() {
            return Err(Error::InvalidPattern(pattern.to_string()));
        }

        Ok(Self { bytes })
    }

    /// Number of bytes the pattern covers.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Whether the pattern matches at `offset` within `region`.
    fn matches_at(&self, region: &[u8], offset: usize) -> bool {
        region[offset..offset + self.bytes.len()]
            .iter()
            .zip(&self.bytes)
            .all(|(byte, expected)| expected.map_or(true, |e| e == *byte))
    }

    /// Offset of the first match within `region`, if any.
    pub fn find_first(&self, region: &[u8]) -> Option<usize> {
        if region.len() < self.bytes.len() {
            return None;
        }

        (0..=region.len() - self.bytes.len()).find(|&offset| self.matches_at(region, offset))
    }

    /// Offsets of every match within `region`.
    pub fn find_all(&self, region: &[u8]) -> Vec<usize> {
        if region.len() < self.bytes.len() {
            return Vec::new();
        }

        (0..=region.len() - self.bytes.len())
            .filter(|&offset| self.matches_at(region, offset))
            .collect()
    }
}

/// Find the first match of a pattern string, tolerating malformed patterns.
///
/// A pattern that fails to parse is logged at warning level and yields no
/// match; it never aborts an analysis pass.
pub fn find_first(pattern: &str, region: &[u8]) -> Option<usize> {
    match Pattern::parse(pattern) {
        Ok(parsed) => parsed.find_first(region),
        Err(err) => {
            warn!("skipping pattern: {err}");
            None
        }
    }
}

/// Find every match of a pattern string, tolerating malformed patterns.
pub fn find_all(pattern: &str, region: &[u8]) -> Vec<usize> {
    match Pattern::parse(pattern) {
        Ok(parsed) => parsed.find_all(region),
        Err(err) => {
            warn!("skipping pattern: {err}");
            Vec::new()
        }
    }
}

/// Try each pattern in order, returning the first hit.
pub fn find_first_of(patterns: &[&str], region: &[u8]) -> Option<usize> {
    patterns.iter().find_map(|pattern| find_first(pattern, region))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let pattern = Pattern::parse("E8 ?? ?? ?? ?? 5F").unwrap();
        assert_eq!(pattern.len(), 6);

        assert!(Pattern::parse("").is_err());
        assert!(Pattern::parse("E8 ZZ").is_err());
        assert!(Pattern::parse("E800").is_err());
    }

    #[test]
    fn test_find_first() {
        let region = [0x00, 0xE8, 0x01, 0x02, 0x03, 0x04, 0x5F, 0xE8];
        assert_eq!(find_first("E8 ?? ?? ?? ?? 5F", &region), Some(1));
        assert_eq!(find_first("5F E8", &region), Some(6));
        assert_eq!(find_first("AA BB", &region), None);
    }

    #[test]
    fn test_find_all_matches_first() {
        let region = [0xCC, 0x90, 0xCC, 0x90, 0xCC];
        let all = find_all("CC ??", &region);
        assert_eq!(all, vec![0, 2]);
        // find_first must agree with the head of find_all for any pattern.
        assert_eq!(find_first("CC ??", &region), all.first().copied());
    }

    #[test]
    fn test_wildcards_match_any_byte() {
        let region = [0x51, 0xB8, 0xAA, 0xBB, 0xCC, 0xDD, 0xFF, 0xD0, 0x59, 0xFF, 0xE0];
        assert_eq!(find_first("51 B8 ?? ?? ?? ?? FF D0 59 FF E0", &region), Some(0));
    }

    #[test]
    fn test_region_shorter_than_pattern() {
        assert_eq!(find_first("E8 ?? ?? ?? ??", &[0xE8]), None);
        assert!(find_all("E8 ?? ?? ?? ??", &[0xE8]).is_empty());
    }

    #[test]
    fn test_malformed_pattern_is_caught() {
        let region = [0xE8, 0x00];
        assert_eq!(find_first("not a pattern", &region), None);
        assert!(find_all("not a pattern", &region).is_empty());
    }

    #[test]
    fn test_find_first_of() {
        let region = [0x55, 0x8B, 0xEC];
        assert_eq!(find_first_of(&["C3 C3", "55 8B EC"], &region), Some(0));
        assert_eq!(find_first_of(&["C3 C3", "C2 ?? ??"], &region), None);
    }
}
