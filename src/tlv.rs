//! BER-TLV codec.
//!
//! Every EMV data exchange in the engine goes through [`TlvMap`]: kernel
//! read results are parsed into one, and the cleaned outbound EMV blob is
//! rebuilt from one. Tags and values are kept as uppercase hex strings,
//! which is the representation the rest of the engine (and the downstream
//! sale payload) uses.
//!
//! Parsing is deliberately lenient: truncated or malformed trailing bytes
//! terminate the walk and return whatever parsed cleanly before them.
//! Kernel buffers are routinely padded with garbage after the last tag, so
//! a trailing parse error is a recoverable condition, not a fatal one.
//!
//! Building is deterministic: tags serialize in sorted order regardless of
//! insertion order, and empty values are dropped.

use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// TlvMap
// ---------------------------------------------------------------------------

/// Ordered tag -> value mapping for BER-TLV data.
///
/// Tags are one- or two-byte EMV tags as uppercase hex ("9F26", "5A").
/// Values are uppercase hex with byte-exact length. Tags are unique; a
/// repeated tag on insert or parse keeps the latest value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlvMap {
    entries: BTreeMap<String, String>,
}

impl TlvMap {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Parse a hex TLV stream. Stops at the first malformed or truncated
    /// element and returns the tags parsed so far.
    pub fn parse(hex_data: &str) -> Self {
        Self::from_bytes(&decode_hex_prefix(hex_data))
    }

    /// Parse a raw TLV byte stream. Same leniency as [`TlvMap::parse`].
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut map = Self::new();
        let mut input = data;
        loop {
            match parse_next(input) {
                Some((tag, value, rest)) => {
                    map.entries
                        .insert(hex_upper(tag), hex_upper(value));
                    input = rest;
                    if input.is_empty() {
                        break;
                    }
                }
                None => break,
            }
        }
        map
    }

    /// Serialize to a hex TLV stream in sorted tag order.
    ///
    /// Zero-length values are dropped, so the output is a canonical form:
    /// building a parsed build is a fixed point.
    pub fn build(&self) -> String {
        let mut out = String::new();
        for (tag, value) in &self.entries {
            if value.is_empty() {
                continue;
            }
            let value_len = value.len() / 2;
            out.push_str(tag);
            out.push_str(&encode_length(value_len));
            out.push_str(value);
        }
        out
    }

    /// Look up a tag (case-insensitive).
    pub fn get(&self, tag: &str) -> Option<&str> {
        self.entries.get(&tag.to_uppercase()).map(String::as_str)
    }

    /// Insert a tag/value pair. Both are normalized to uppercase hex; a
    /// value with a stray character or an odd trailing nibble is truncated
    /// to its valid even-length prefix, the same policy the parser applies,
    /// so [`TlvMap::build`] always emits byte-exact lengths.
    pub fn insert(&mut self, tag: &str, value: &str) {
        self.entries
            .insert(tag.to_uppercase(), hex_upper(&decode_hex_prefix(value)));
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.entries.contains_key(&tag.to_uppercase())
    }

    /// Build a cleaned subset containing only the given tags, in map order.
    /// Absent and empty tags are skipped.
    pub fn select(&self, tags: &[&str]) -> TlvMap {
        let mut out = TlvMap::new();
        for tag in tags {
            if let Some(value) = self.get(tag) {
                if !value.is_empty() {
                    out.insert(tag, value);
                }
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in sorted tag order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(t, v)| (t.as_str(), v.as_str()))
    }
}

// ---------------------------------------------------------------------------
// Wire-level helpers
// ---------------------------------------------------------------------------

/// Parse one tag-length-value element. Returns `None` on truncated or
/// malformed input (callers stop the walk there).
fn parse_next(input: &[u8]) -> Option<(&[u8], &[u8], &[u8])> {
    let (tag, rest) = parse_tag(input)?;
    let (len, rest) = parse_len(rest)?;
    if rest.len() < len {
        return None;
    }
    let (value, rest) = rest.split_at(len);
    Some((tag, value, rest))
}

/// Parse a BER-TLV tag. If the low 5 bits of the first byte are all set,
/// the tag continues; subsequent bytes continue while their high bit is set.
/// EMV tags in practice are one or two bytes.
fn parse_tag(input: &[u8]) -> Option<(&[u8], &[u8])> {
    for (i, v) in input.iter().enumerate() {
        let more_mask = if i == 0 { 0x1F } else { 0x80 };
        if *v & more_mask != more_mask {
            let (tag, rest) = input.split_at(i + 1);
            return Some((tag, rest));
        }
    }
    None
}

/// Parse a BER-TLV length. High bit clear: the byte is the length. High
/// bit set: the low 7 bits give the count of big-endian length bytes.
fn parse_len(input: &[u8]) -> Option<(usize, &[u8])> {
    let (&first, rest) = input.split_first()?;
    if first < 0x80 {
        return Some((first as usize, rest));
    }
    let n = (first & 0x7F) as usize;
    // 0x80 (indefinite form) and lengths wider than u32 are malformed here.
    if n == 0 || n > 4 || rest.len() < n {
        return None;
    }
    let (len_bytes, rest) = rest.split_at(n);
    let len = len_bytes.iter().fold(0usize, |acc, &b| (acc << 8) | b as usize);
    Some((len, rest))
}

/// Encode a value length as hex (short form up to 127, long form above).
fn encode_length(len: usize) -> String {
    if len < 0x80 {
        return format!("{len:02X}");
    }
    let mut bytes = Vec::new();
    let mut rem = len;
    while rem > 0 {
        bytes.push((rem & 0xFF) as u8);
        rem >>= 8;
    }
    bytes.reverse();
    let mut out = format!("{:02X}", 0x80 | bytes.len());
    for b in &bytes {
        out.push_str(&format!("{b:02X}"));
    }
    out
}

/// Decode the longest valid even-length hex prefix of the input.
/// A stray character mid-stream truncates there, matching the codec's
/// stop-at-first-malformed-element policy.
fn decode_hex_prefix(s: &str) -> Vec<u8> {
    let s = s.trim();
    let mut out = Vec::with_capacity(s.len() / 2);
    let bytes = s.as_bytes();
    let mut i = 0;
    while i + 1 < bytes.len() {
        let hi = (bytes[i] as char).to_digit(16);
        let lo = (bytes[i + 1] as char).to_digit(16);
        match (hi, lo) {
            (Some(h), Some(l)) => out.push(((h << 4) | l) as u8),
            _ => break,
        }
        i += 2;
    }
    out
}

fn hex_upper(data: &[u8]) -> String {
    hex::encode_upper(data)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_one_byte_tag() {
        let map = TlvMap::parse("5A0841111111111111F1");
        assert_eq!(map.get("5A"), Some("41111111111111F1"));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_parse_two_byte_tag() {
        let map = TlvMap::parse("5F2403251231");
        assert_eq!(map.get("5F24"), Some("251231"));
    }

    #[test]
    fn test_parse_multiple_tags() {
        let map = TlvMap::parse("9F2608AABBCCDD001122335F3401019C0100");
        assert_eq!(map.len(), 3);
        assert_eq!(map.get("9F26"), Some("AABBCCDD00112233"));
        assert_eq!(map.get("5F34"), Some("01"));
        assert_eq!(map.get("9C"), Some("00"));
    }

    #[test]
    fn test_parse_long_form_length() {
        // 0x81 => one length byte follows; value is 0x80 = 128 bytes
        let value = "AB".repeat(128);
        let map = TlvMap::parse(&format!("9F108180{value}"));
        assert_eq!(map.get("9F10"), Some(value.as_str()));
    }

    #[test]
    fn test_parse_truncated_returns_prefix() {
        // Second element declares 8 bytes but only 2 follow
        let map = TlvMap::parse("5F3401019F2608AABB");
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("5F34"), Some("01"));
        assert!(map.get("9F26").is_none());
    }

    #[test]
    fn test_parse_garbage_hex_stops() {
        let map = TlvMap::parse("9C0100ZZZZ");
        assert_eq!(map.get("9C"), Some("00"));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_parse_empty() {
        assert!(TlvMap::parse("").is_empty());
    }

    #[test]
    fn test_build_sorted_order() {
        let mut map = TlvMap::new();
        map.insert("9F26", "AABBCCDD00112233");
        map.insert("5A", "4111111111111111");
        map.insert("9C", "00");
        // 5A sorts before 9C sorts before 9F26
        assert_eq!(
            map.build(),
            "5A0841111111111111119C01009F2608AABBCCDD00112233"
        );
    }

    #[test]
    fn test_build_drops_empty_values() {
        let mut map = TlvMap::new();
        map.insert("5A", "4111111111111111");
        map.insert("9C", "");
        assert_eq!(map.build(), "5A084111111111111111");
    }

    #[test]
    fn test_insert_truncates_odd_nibble() {
        let mut map = TlvMap::new();
        map.insert("5A", "41111111111111111");
        assert_eq!(map.get("5A"), Some("4111111111111111"));
        // Declared length matches the stored bytes
        assert_eq!(map.build(), "5A084111111111111111");
    }

    #[test]
    fn test_insert_truncates_at_stray_character() {
        let mut map = TlvMap::new();
        map.insert("9F26", "AABBXXCCDD");
        assert_eq!(map.get("9F26"), Some("AABB"));
        assert_eq!(map.build(), "9F2602AABB");
    }

    #[test]
    fn test_insert_all_garbage_becomes_empty() {
        let mut map = TlvMap::new();
        map.insert("9C", "not hex at all");
        assert_eq!(map.get("9C"), Some(""));
        // Empty values never reach the wire
        assert_eq!(map.build(), "");
    }

    #[test]
    fn test_build_long_form_length() {
        let mut map = TlvMap::new();
        let value = "01".repeat(200);
        map.insert("9F10", &value);
        assert_eq!(map.build(), format!("9F1081C8{value}"));
    }

    #[test]
    fn test_canonical_fixed_point() {
        let mut map = TlvMap::new();
        map.insert("9F36", "001F");
        map.insert("5A", "4111111111111111");
        map.insert("82", "3900");
        let once = map.build();
        let twice = TlvMap::parse(&once).build();
        let thrice = TlvMap::parse(&twice).build();
        assert_eq!(once, twice);
        assert_eq!(twice, thrice);
    }

    #[test]
    fn test_select_subset() {
        let map = TlvMap::parse("5A0841111111111111119C01009F3602001F");
        let subset = map.select(&["5A", "9F36", "9F26"]);
        assert_eq!(subset.len(), 2);
        assert_eq!(subset.get("5A"), Some("4111111111111111"));
        assert_eq!(subset.get("9F36"), Some("001F"));
        assert!(!subset.contains("9C"));
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let mut map = TlvMap::new();
        map.insert("9f26", "aabb");
        assert_eq!(map.get("9F26"), Some("AABB"));
        assert_eq!(map.get("9f26"), Some("AABB"));
    }
}
