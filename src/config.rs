//! Terminal and EMV configuration model.
//!
//! Loaded once per session by the integrating shell (storage/API layers
//! are outside this crate) and treated as immutable for the lifetime of a
//! transaction. The manager holds the whole bundle in an `Arc`.

use serde::{Deserialize, Serialize};

use crate::brand::CardBrand;
use crate::context::CardMode;

// ---------------------------------------------------------------------------
// Terminal
// ---------------------------------------------------------------------------

/// Acquirer identity plus per-brand EMV parameters and key material refs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    pub merchant_id: String,
    pub terminal_id: String,
    /// One entry per supported card brand.
    pub emv_configs: Vec<EmvBrandConfig>,
    /// Cardholder verification thresholds.
    pub cvm_configs: Vec<CvmConfig>,
    /// Initial key-serial-number loaded into the secure module.
    pub initial_ksn: String,
    /// Secure-module slot holding the DUKPT base derivation key.
    pub bdk_index: u8,
    /// Proprietary stored-value card parameters.
    pub stored_value: StoredValueConfig,
}

impl TerminalConfig {
    pub fn emv_config_for(&self, brand: CardBrand) -> Option<&EmvBrandConfig> {
        self.emv_configs.iter().find(|c| c.brand == brand)
    }

    pub fn cvm_config_for(&self, brand: CardBrand, mode: CardMode) -> Option<&CvmConfig> {
        self.cvm_configs
            .iter()
            .find(|c| c.brand == brand && c.entry_mode == mode)
    }
}

// ---------------------------------------------------------------------------
// Stored-value parameters
// ---------------------------------------------------------------------------

/// Merchant parameters for the proprietary stored-value card path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredValueConfig {
    /// Key-type-A sector key.
    pub key_a: [u8; 6],
    /// Whether stored-value transactions require cardholder PIN entry.
    pub require_pin: bool,
}

impl Default for StoredValueConfig {
    fn default() -> Self {
        Self {
            key_a: [0xFF; 6],
            require_pin: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-brand EMV parameters
// ---------------------------------------------------------------------------

/// EMV kernel parameters for one card brand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmvBrandConfig {
    pub brand: CardBrand,
    /// ISO 3166 numeric country code, hex-encoded ("0704").
    pub country_code: String,
    /// ISO 4217 numeric currency code, hex-encoded ("0704").
    pub currency_code: String,
    /// Terminal capabilities (tag 9F33), hex.
    pub terminal_capabilities: String,
    /// Additional terminal capabilities (tag 9F40), hex.
    pub additional_capabilities: String,
    /// Floor limit in minor units.
    pub floor_limit: u64,
    /// Terminal action codes, hex.
    pub tac_denial: String,
    pub tac_online: String,
    pub tac_default: String,
}

// ---------------------------------------------------------------------------
// CVM thresholds
// ---------------------------------------------------------------------------

/// Cardholder-verification thresholds for one brand and entry mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CvmConfig {
    pub brand: CardBrand,
    pub entry_mode: CardMode,
    /// Amounts at or below this need no verification (minor units).
    pub no_cvm_limit: u64,
    /// Amounts above this require a signature.
    pub signature_limit: u64,
    /// Amounts above this require online PIN.
    pub pin_limit: u64,
}

impl CvmConfig {
    pub fn requires_pin(&self, amount: u64) -> bool {
        amount > self.pin_limit
    }

    pub fn requires_signature(&self, amount: u64) -> bool {
        amount > self.signature_limit && amount <= self.pin_limit
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_terminal() -> TerminalConfig {
        TerminalConfig {
            merchant_id: "000000000000001".into(),
            terminal_id: "TERM0001".into(),
            emv_configs: vec![EmvBrandConfig {
                brand: CardBrand::Visa,
                country_code: "0704".into(),
                currency_code: "0704".into(),
                terminal_capabilities: "E0F8C8".into(),
                additional_capabilities: "6000F0A001".into(),
                floor_limit: 0,
                tac_denial: "0010000000".into(),
                tac_online: "DC4004F800".into(),
                tac_default: "DC4000A800".into(),
            }],
            cvm_configs: vec![CvmConfig {
                brand: CardBrand::Visa,
                entry_mode: CardMode::Contactless,
                no_cvm_limit: 50_000,
                signature_limit: 100_000,
                pin_limit: 500_000,
            }],
            initial_ksn: "FFFF9876543210E00000".into(),
            bdk_index: 0,
            stored_value: StoredValueConfig::default(),
        }
    }

    #[test]
    fn test_lookup_by_brand() {
        let t = sample_terminal();
        assert!(t.emv_config_for(CardBrand::Visa).is_some());
        assert!(t.emv_config_for(CardBrand::Mastercard).is_none());
    }

    #[test]
    fn test_cvm_lookup_needs_both_keys() {
        let t = sample_terminal();
        assert!(t
            .cvm_config_for(CardBrand::Visa, CardMode::Contactless)
            .is_some());
        assert!(t.cvm_config_for(CardBrand::Visa, CardMode::Chip).is_none());
    }

    #[test]
    fn test_cvm_thresholds() {
        let t = sample_terminal();
        let cvm = t
            .cvm_config_for(CardBrand::Visa, CardMode::Contactless)
            .unwrap();
        assert!(!cvm.requires_pin(100_000));
        assert!(cvm.requires_signature(200_000));
        assert!(cvm.requires_pin(600_000));
        assert!(!cvm.requires_signature(600_000));
    }
}
