//! Transaction-scoped state and the engine's output types.
//!
//! [`TransactionContext`] is the mutable scratch space one processor owns
//! while a card is being worked: the amount, the candidate PAN for PIN
//! block construction, and the PIN/KSN crypto results. It zeroizes itself
//! on drop, and every exit path (success, error, cancel) drops it — PIN
//! material never survives a transaction.
//!
//! [`SaleRequest`] is the immutable output handed downstream; it is never
//! mutated after creation.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroize;

use crate::brand::CardBrand;
use crate::error::PaymentError;

// ---------------------------------------------------------------------------
// Card mode
// ---------------------------------------------------------------------------

/// Physical read path that produced a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardMode {
    Chip,
    Contactless,
    Magnetic,
    Proprietary,
}

impl CardMode {
    /// ISO 8583 POS entry mode code for this read path.
    pub fn pos_entry_mode(self) -> &'static str {
        match self {
            CardMode::Chip => "05",
            CardMode::Contactless => "07",
            CardMode::Magnetic => "90",
            CardMode::Proprietary => "01",
        }
    }
}

// ---------------------------------------------------------------------------
// Amount formatting
// ---------------------------------------------------------------------------

/// Zero-padded 12-digit numeric amount string the kernel and sale payload
/// both use.
pub fn format_amount(minor_units: u64) -> String {
    format!("{minor_units:012}")
}

/// Mask a PAN to first six + last four digits.
pub fn mask_pan(pan: &str) -> String {
    if pan.len() <= 10 {
        return "*".repeat(pan.len());
    }
    let (head, rest) = pan.split_at(6);
    let (mid, tail) = rest.split_at(rest.len() - 4);
    format!("{head}{}{tail}", "*".repeat(mid.len()))
}

// ---------------------------------------------------------------------------
// Transaction context
// ---------------------------------------------------------------------------

/// Mutable per-transaction scratch state, owned by exactly one active
/// processor. Zeroized on drop.
#[derive(Debug, Default)]
pub struct TransactionContext {
    /// Zero-padded 12-digit amount.
    pub amount: String,
    /// Amount in minor units, kept numeric for threshold checks.
    pub amount_minor: u64,
    /// Candidate PAN captured at card-number confirmation; some cards only
    /// reveal the authoritative PAN at that kernel step.
    pub pan_for_pin: Option<String>,
    /// Encrypted PIN block, hex, once the cardholder confirms.
    pub pin_block: Option<String>,
    /// Key-serial-number read after PIN confirmation.
    pub ksn: Option<String>,
}

impl TransactionContext {
    // Drop types cannot use struct-update syntax; every field is spelled
    // out.
    pub fn new(amount_minor_units: u64) -> Self {
        Self {
            amount: format_amount(amount_minor_units),
            amount_minor: amount_minor_units,
            pan_for_pin: None,
            pin_block: None,
            ksn: None,
        }
    }

    /// Clear all crypto scratch fields in place.
    pub fn clear_secrets(&mut self) {
        if let Some(p) = self.pan_for_pin.as_mut() {
            p.zeroize();
        }
        if let Some(p) = self.pin_block.as_mut() {
            p.zeroize();
        }
        if let Some(k) = self.ksn.as_mut() {
            k.zeroize();
        }
        self.pan_for_pin = None;
        self.pin_block = None;
        self.ksn = None;
    }
}

impl Drop for TransactionContext {
    fn drop(&mut self) {
        self.clear_secrets();
        self.amount.zeroize();
        self.amount_minor.zeroize();
    }
}

// ---------------------------------------------------------------------------
// Sale request
// ---------------------------------------------------------------------------

/// Normalized sale payload produced by a successful card read. Immutable;
/// one per successful transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaleRequest {
    pub transaction_id: String,
    pub card_mode: CardMode,
    pub brand: CardBrand,
    pub pan: String,
    pub masked_pan: String,
    /// Canonical `MMyy`.
    pub expiry: String,
    pub track1: Option<String>,
    pub track2: Option<String>,
    pub track3: Option<String>,
    /// Cleaned EMV TLV blob (sorted build), hex.
    pub emv_data: Option<String>,
    pub ksn: Option<String>,
    pub pin_block: Option<String>,
    /// Clear stored-value PIN; that path bypasses the hardware PIN pad,
    /// the collecting processor validates it before use.
    pub pin_clear: Option<String>,
    /// Whether the merchant's CVM thresholds call for a signature at
    /// this amount. Downstream prompts for it; this layer only decides.
    pub signature_required: bool,
    pub pos_entry_mode: String,
    /// Zero-padded 12-digit amount.
    pub amount: String,
    pub created_at: String,
}

impl SaleRequest {
    /// Start a builder-ish skeleton with the invariant fields filled.
    pub fn new(card_mode: CardMode, pan: String, expiry: String, amount: String) -> Self {
        let brand = crate::brand::detect_brand(&pan);
        Self {
            transaction_id: Uuid::new_v4().to_string(),
            card_mode,
            brand,
            masked_pan: mask_pan(&pan),
            pan,
            expiry,
            track1: None,
            track2: None,
            track3: None,
            emv_data: None,
            ksn: None,
            pin_block: None,
            pin_clear: None,
            signature_required: false,
            pos_entry_mode: card_mode.pos_entry_mode().to_string(),
            amount,
            created_at: Utc::now().to_rfc3339(),
        }
    }
}

/// Terminal outcome of one `start_processing` call. Delivered exactly once.
pub type PaymentResult = Result<SaleRequest, PaymentError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pos_entry_modes() {
        assert_eq!(CardMode::Chip.pos_entry_mode(), "05");
        assert_eq!(CardMode::Contactless.pos_entry_mode(), "07");
        assert_eq!(CardMode::Magnetic.pos_entry_mode(), "90");
        assert_eq!(CardMode::Proprietary.pos_entry_mode(), "01");
    }

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(100000), "000000100000");
        assert_eq!(format_amount(0), "000000000000");
    }

    #[test]
    fn test_mask_pan() {
        assert_eq!(mask_pan("4111111111111111"), "411111******1111");
        assert_eq!(mask_pan("4111111111111"), "411111***1111");
        // Too short to expose anything
        assert_eq!(mask_pan("41111"), "*****");
    }

    #[test]
    fn test_context_construction_and_drop() {
        // Construct, move, and drop; the Drop impl zeroizes in place.
        let ctx = TransactionContext::new(100000);
        assert_eq!(ctx.amount, "000000100000");
        assert_eq!(ctx.amount_minor, 100000);
        let moved = ctx;
        drop(moved);
    }

    #[test]
    fn test_context_clear_secrets() {
        let mut ctx = TransactionContext::new(100000);
        ctx.pan_for_pin = Some("4111111111111111".into());
        ctx.pin_block = Some("AABBCCDD00112233".into());
        ctx.ksn = Some("FFFF9876543210E00001".into());
        ctx.clear_secrets();
        assert!(ctx.pan_for_pin.is_none());
        assert!(ctx.pin_block.is_none());
        assert!(ctx.ksn.is_none());
        assert_eq!(ctx.amount, "000000100000");
    }

    #[test]
    fn test_sale_request_serializes_snake_case() {
        let sale = SaleRequest::new(
            CardMode::Chip,
            "4111111111111111".into(),
            "1225".into(),
            format_amount(100000),
        );
        let json = serde_json::to_value(&sale).unwrap();
        assert_eq!(json["card_mode"], "chip");
        assert_eq!(json["brand"], "visa");
        assert_eq!(json["masked_pan"], "411111******1111");
        assert_eq!(json["pos_entry_mode"], "05");
    }

    #[test]
    fn test_sale_request_detects_brand_and_masks() {
        let sale = SaleRequest::new(
            CardMode::Magnetic,
            "4111111111111111".into(),
            "1225".into(),
            format_amount(100000),
        );
        assert_eq!(sale.brand, crate::brand::CardBrand::Visa);
        assert_eq!(sale.masked_pan, "411111******1111");
        assert_eq!(sale.pos_entry_mode, "90");
        assert!(!sale.transaction_id.is_empty());
    }
}
