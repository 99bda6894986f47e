/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use log::{debug, error, warn};

use crate::error::{Error, Result};

/// Matches any byte inside a hex pattern.
pub const WILDCARD: &str = "XX";

/// Parses a hex pattern like `"00A0E3 XX 1EFF2FE1"` into bytes, `None` standing for a wildcard.
/// Whitespace is ignored.
pub fn parse_pattern(pattern: &str) -> Result<Vec<Option<u8>>> {
    let compact: String = pattern.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() % 2 != 0 {
        return Err(Error::obscura(format!("Odd length pattern: {pattern}")));
    }

    compact
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair).map_err(|_| Error::obscura("Invalid pattern"))?;
            if pair.eq_ignore_ascii_case(WILDCARD) {
                Ok(None)
            } else {
                u8::from_str_radix(pair, 16)
                    .map(Some)
                    .map_err(|_| Error::obscura(format!("Invalid hex byte '{pair}' in pattern")))
            }
        })
        .collect()
}

/// Finds the first match of `pattern` at or after `start`.
pub fn find_pattern(data: &[u8], pattern: &str, start: usize) -> Option<usize> {
    let needle = match parse_pattern(pattern) {
        Ok(n) => n,
        Err(e) => {
            error!("{e}");
            return None;
        }
    };

    if needle.is_empty() || start >= data.len() || data.len() - start < needle.len() {
        return None;
    }

    data[start..]
        .windows(needle.len())
        .position(|window| {
            window.iter().zip(&needle).all(|(b, want)| want.is_none_or(|w| *b == w))
        })
        .map(|pos| pos + start)
}

/// Finds an exact byte sequence at or after `start`.
pub fn find_bytes(data: &[u8], needle: &[u8], start: usize) -> Option<usize> {
    if needle.is_empty() || start >= data.len() {
        return None;
    }
    data[start..].windows(needle.len()).position(|w| w == needle).map(|pos| pos + start)
}

/// Finds the last occurrence of an exact byte sequence.
pub fn rfind_bytes(data: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    data.windows(needle.len()).rposition(|w| w == needle)
}

/// Overwrites `data[offset..]` with the bytes of `hex`, never growing the buffer.
pub fn patch(data: &mut [u8], offset: usize, hex: &str) -> Result<()> {
    let compact: String = hex.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = hex::decode(compact).map_err(|e| Error::obscura(format!("Invalid patch: {e}")))?;
    patch_bytes(data, offset, &bytes)
}

pub fn patch_bytes(data: &mut [u8], offset: usize, bytes: &[u8]) -> Result<()> {
    let end = offset
        .checked_add(bytes.len())
        .filter(|end| *end <= data.len())
        .ok_or_else(|| Error::obscura(format!("Patch at 0x{offset:X} is out of bounds")))?;

    data[offset..end].copy_from_slice(bytes);
    debug!("Patched 0x{:X} bytes at 0x{:X}", bytes.len(), offset);
    Ok(())
}

pub fn bytes_to_hex(data: &[u8]) -> String {
    hex::encode_upper(data)
}

/// Result of running a single [`PatchRule`] over a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOutcome {
    /// Signature found and rewritten, at the listed offsets.
    Applied(Vec<usize>),
    /// Signature missing, buffer untouched.
    Skipped,
}

impl PatchOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, PatchOutcome::Applied(_))
    }
}

/// A signature to look for, and how to rewrite the code where it matches.
pub struct PatchRule {
    pub name: &'static str,
    /// Hex pattern, `XX` bytes are wildcards.
    pub signature: &'static str,
    /// Receives the whole buffer and the match offset.
    pub rewrite: fn(&mut [u8], usize) -> Result<()>,
    /// Rewrite every non overlapping match instead of the first one only.
    pub all_matches: bool,
}

impl PatchRule {
    pub fn apply(&self, data: &mut [u8]) -> PatchOutcome {
        let sig_len = match parse_pattern(self.signature) {
            Ok(p) => p.len(),
            Err(e) => {
                error!("Rule '{}' has an invalid signature: {e}", self.name);
                return PatchOutcome::Skipped;
            }
        };

        let mut applied = Vec::new();
        let mut pos = 0;

        while let Some(idx) = find_pattern(data, self.signature, pos) {
            match (self.rewrite)(data, idx) {
                Ok(()) => applied.push(idx),
                Err(e) => warn!("Rule '{}' matched at 0x{:X} but failed: {e}", self.name, idx),
            }

            if !self.all_matches {
                break;
            }
            pos = idx + sig_len;
        }

        if applied.is_empty() { PatchOutcome::Skipped } else { PatchOutcome::Applied(applied) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_search() {
        let data = [0x00, 0x11, 0x22, 0x33, 0x44, 0x11, 0x99, 0x33];
        assert_eq!(find_pattern(&data, "11XX33", 0), Some(1));
        assert_eq!(find_pattern(&data, "11 xx 33", 2), Some(5));
        assert_eq!(find_pattern(&data, "1155", 0), None);
        assert_eq!(find_pattern(&data, "11XX33", 100), None);
        assert_eq!(find_pattern(&data, "1", 0), None);
    }

    #[test]
    fn exact_search() {
        let data = b"ab01000100cd01000100";
        assert_eq!(find_bytes(data, b"0100", 0), Some(2));
        assert_eq!(rfind_bytes(data, b"01000100"), Some(12));
        assert_eq!(rfind_bytes(data, b"zz"), None);
    }

    #[test]
    fn patch_checks_bounds() {
        let mut data = vec![0u8; 4];
        patch(&mut data, 1, "AABB").unwrap();
        assert_eq!(data, [0x00, 0xAA, 0xBB, 0x00]);
        assert!(patch(&mut data, 3, "AABB").is_err());
        assert_eq!(data.len(), 4);
    }

    fn zero_two(data: &mut [u8], off: usize) -> Result<()> {
        patch_bytes(data, off, &[0, 0])
    }

    #[test]
    fn rule_applies_to_every_match() {
        let rule =
            PatchRule { name: "test", signature: "FFXX", rewrite: zero_two, all_matches: true };
        let mut data = vec![0xFF, 0x01, 0x02, 0xFF, 0x03];
        assert_eq!(rule.apply(&mut data), PatchOutcome::Applied(vec![0, 3]));
        assert_eq!(data, [0, 0, 0x02, 0, 0]);

        let mut untouched = vec![0x01, 0x02];
        assert_eq!(rule.apply(&mut untouched), PatchOutcome::Skipped);
        assert_eq!(untouched, [0x01, 0x02]);
    }
}
