//! Card brand detection from BIN/IIN prefixes.
//!
//! Pure classification, no I/O. Rule precedence matters: the national
//! scheme prefix wins over everything, then single-digit, two-digit,
//! and finally the numeric prefix ranges. First match wins.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Brands
// ---------------------------------------------------------------------------

/// Card brands the engine recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardBrand {
    /// National scheme (NAPAS, BIN 9704).
    Napas,
    Visa,
    Mastercard,
    Amex,
    Jcb,
    Discover,
    UnionPay,
    Unknown,
}

impl CardBrand {
    pub fn as_str(self) -> &'static str {
        match self {
            CardBrand::Napas => "NAPAS",
            CardBrand::Visa => "VISA",
            CardBrand::Mastercard => "MASTERCARD",
            CardBrand::Amex => "AMEX",
            CardBrand::Jcb => "JCB",
            CardBrand::Discover => "DISCOVER",
            CardBrand::UnionPay => "UNIONPAY",
            CardBrand::Unknown => "UNKNOWN",
        }
    }
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// Classify a PAN into a card brand.
///
/// PANs shorter than 6 digits (no full IIN) classify as `Unknown`; this
/// never errors.
pub fn detect_brand(pan: &str) -> CardBrand {
    if pan.len() < 6 || !pan.chars().all(|c| c.is_ascii_digit()) {
        return CardBrand::Unknown;
    }

    // National scheme first: its range overlaps nothing below.
    if pan.starts_with("9704") {
        return CardBrand::Napas;
    }
    if pan.starts_with('4') {
        return CardBrand::Visa;
    }
    if in_prefix_range(pan, 2, 51, 55) {
        return CardBrand::Mastercard;
    }
    if pan.starts_with("34") || pan.starts_with("37") {
        return CardBrand::Amex;
    }
    if in_prefix_range(pan, 4, 2221, 2720) {
        return CardBrand::Mastercard;
    }
    if in_prefix_range(pan, 4, 3528, 3589) {
        return CardBrand::Jcb;
    }
    if in_prefix_range(pan, 6, 622126, 622925) {
        return CardBrand::Discover;
    }
    if pan.starts_with("6011") || pan.starts_with("65") {
        return CardBrand::Discover;
    }
    if pan.starts_with("62") {
        return CardBrand::UnionPay;
    }
    CardBrand::Unknown
}

/// Whether the first `digits` of the PAN form a number in `[lo, hi]`.
fn in_prefix_range(pan: &str, digits: usize, lo: u32, hi: u32) -> bool {
    pan.get(..digits)
        .and_then(|p| p.parse::<u32>().ok())
        .map(|v| (lo..=hi).contains(&v))
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visa() {
        assert_eq!(detect_brand("4111111111111111"), CardBrand::Visa);
        assert_eq!(detect_brand("4000056655665556"), CardBrand::Visa);
    }

    #[test]
    fn test_national_scheme() {
        assert_eq!(detect_brand("9704360000000000"), CardBrand::Napas);
    }

    #[test]
    fn test_mastercard_classic_range() {
        assert_eq!(detect_brand("5105105105105100"), CardBrand::Mastercard);
        assert_eq!(detect_brand("5555555555554444"), CardBrand::Mastercard);
    }

    #[test]
    fn test_mastercard_2_series() {
        assert_eq!(detect_brand("2221000000000009"), CardBrand::Mastercard);
        assert_eq!(detect_brand("2720990000000000"), CardBrand::Mastercard);
        // Just outside the range on both sides
        assert_ne!(detect_brand("2220990000000000"), CardBrand::Mastercard);
        assert_ne!(detect_brand("2721000000000000"), CardBrand::Mastercard);
    }

    #[test]
    fn test_amex() {
        assert_eq!(detect_brand("340000000000009"), CardBrand::Amex);
        assert_eq!(detect_brand("370000000000002"), CardBrand::Amex);
    }

    #[test]
    fn test_jcb() {
        assert_eq!(detect_brand("3528000000000007"), CardBrand::Jcb);
        assert_eq!(detect_brand("3589000000000003"), CardBrand::Jcb);
    }

    #[test]
    fn test_discover_range_beats_unionpay() {
        assert_eq!(detect_brand("6221260000000000"), CardBrand::Discover);
        assert_eq!(detect_brand("6229250000000000"), CardBrand::Discover);
        assert_eq!(detect_brand("6011000000000004"), CardBrand::Discover);
    }

    #[test]
    fn test_unionpay_fallback() {
        assert_eq!(detect_brand("6212345678901232"), CardBrand::UnionPay);
        assert_eq!(detect_brand("6229260000000000"), CardBrand::UnionPay);
    }

    #[test]
    fn test_short_pan_is_unknown() {
        assert_eq!(detect_brand("41111"), CardBrand::Unknown);
        assert_eq!(detect_brand(""), CardBrand::Unknown);
    }

    #[test]
    fn test_non_numeric_is_unknown() {
        assert_eq!(detect_brand("4111ABCD11111111"), CardBrand::Unknown);
    }

    #[test]
    fn test_unmatched_prefix_is_unknown() {
        assert_eq!(detect_brand("9999990000000000"), CardBrand::Unknown);
    }
}
