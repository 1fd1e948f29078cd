//! Hardware driver facade.
//!
//! The engine never talks to the vendor SDK directly; it consumes these
//! traits. The integrating shell implements them over the real kernel,
//! PIN pad, secure module and reader, and hands the engine shared
//! read-only handles. No implementation here may close or reinitialize
//! the underlying device — the handles are borrowed for the session.

use std::ops::BitOr;

use serde::{Deserialize, Serialize};

use crate::config::EmvBrandConfig;
use crate::error::PaymentError;
use crate::tlv::TlvMap;

// ---------------------------------------------------------------------------
// Card type masks
// ---------------------------------------------------------------------------

/// Bit set of card read paths a detection call should accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardTypeMask(pub u32);

impl CardTypeMask {
    /// Contact chip (ICC).
    pub const IC: CardTypeMask = CardTypeMask(0x01);
    /// Contactless (NFC), cards and phones alike.
    pub const NFC: CardTypeMask = CardTypeMask(0x02);
    /// Magnetic stripe.
    pub const MAGNETIC: CardTypeMask = CardTypeMask(0x04);
    /// Proprietary stored-value (Mifare) cards.
    pub const MIFARE: CardTypeMask = CardTypeMask(0x08);

    pub const fn union(self, other: CardTypeMask) -> CardTypeMask {
        CardTypeMask(self.0 | other.0)
    }

    pub const fn contains(self, other: CardTypeMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// Everything a standard payment flow accepts.
    pub const fn standard() -> CardTypeMask {
        Self::IC.union(Self::NFC).union(Self::MAGNETIC)
    }
}

impl BitOr for CardTypeMask {
    type Output = CardTypeMask;

    fn bitor(self, rhs: CardTypeMask) -> CardTypeMask {
        self.union(rhs)
    }
}

// ---------------------------------------------------------------------------
// Detection result
// ---------------------------------------------------------------------------

/// Raw payload from a successful card detection, tagged by read path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardDetection {
    /// Contact chip; ATR bytes as hex.
    Chip { atr: String },
    /// Contactless chip or phone; ATS bytes as hex.
    Contactless { ats: String },
    /// Stripe swipe; raw track data as read.
    Magnetic {
        track1: Option<String>,
        track2: Option<String>,
        track3: Option<String>,
    },
    /// Proprietary stored-value card; UID as hex.
    StoredValue { uid: String },
}

impl CardDetection {
    /// The mask bit this detection corresponds to.
    pub fn type_bit(&self) -> CardTypeMask {
        match self {
            CardDetection::Chip { .. } => CardTypeMask::IC,
            CardDetection::Contactless { .. } => CardTypeMask::NFC,
            CardDetection::Magnetic { .. } => CardTypeMask::MAGNETIC,
            CardDetection::StoredValue { .. } => CardTypeMask::MIFARE,
        }
    }
}

// ---------------------------------------------------------------------------
// Kernel transaction configuration
// ---------------------------------------------------------------------------

/// Config bundle passed to the kernel when starting a transact run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactConfig {
    /// Kernel flow type (full EMV vs. quick contactless).
    pub flow_type: u8,
    /// EMV transaction type byte (tag 9C; 0x00 = purchase).
    pub trans_type: u8,
    /// The read path being transacted.
    pub card_type: CardTypeMask,
    /// Zero-padded 12-digit amount.
    pub amount: String,
}

// ---------------------------------------------------------------------------
// PIN pad types
// ---------------------------------------------------------------------------

/// Configuration handed to the hardware PIN pad when the kernel requests
/// cardholder PIN entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinPadConfig {
    pub min_digits: u8,
    pub max_digits: u8,
    /// Secure-module key slot used for online PIN encryption.
    pub key_index: u8,
    pub timeout_secs: u16,
    /// Whether this is an online PIN (encrypted block) request.
    pub is_online_pin: bool,
    /// The 12 PAN digits the pad folds into the block.
    pub pan_digits: String,
}

impl Default for PinPadConfig {
    fn default() -> Self {
        Self {
            min_digits: 4,
            max_digits: 12,
            key_index: 0,
            timeout_secs: 60,
            is_online_pin: true,
            pan_digits: String::new(),
        }
    }
}

/// Outcome of a PIN pad interaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinPadResult {
    /// Cardholder confirmed. Pads without internal block support return
    /// the clear PIN for the engine to encrypt; pads that build the
    /// block on-device return it already encrypted (hex) with an empty
    /// clear PIN. At least one of the two must be present.
    Confirmed {
        pin: String,
        pin_block: Option<String>,
    },
    /// Cardholder pressed cancel.
    Cancelled,
    /// Cardholder confirmed with no PIN (CVM bypass).
    Bypassed,
}

// ---------------------------------------------------------------------------
// Facade traits
// ---------------------------------------------------------------------------

/// Card detection front-end.
pub trait CardReader: Send + Sync {
    /// Poll for a card matching the mask. Blocks up to `timeout_secs`.
    fn check_card(
        &self,
        mask: CardTypeMask,
        timeout_secs: u32,
    ) -> Result<CardDetection, PaymentError>;

    /// Abort an in-flight `check_card`. Idempotent.
    fn cancel_check_card(&self);
}

/// The vendor EMV kernel, reduced to the calls the engine makes.
///
/// The kernel invokes its callbacks on a thread it owns; implementations
/// convert each callback into a [`crate::kernel::KernelEvent`] and feed it
/// to the session, then deliver the returned import status through the
/// matching `import_*` call here.
pub trait EmvKernel: Send + Sync {
    /// Load per-brand EMV parameters (capabilities, floor limit, TACs)
    /// into the kernel. Called once per configured brand at setup.
    fn load_brand_config(&self, config: &EmvBrandConfig) -> Result<(), PaymentError>;

    fn start_transact(&self, config: &TransactConfig) -> Result<(), PaymentError>;

    fn import_app_select_status(&self, status: u8) -> Result<(), PaymentError>;
    fn import_card_confirm_status(&self, status: u8) -> Result<(), PaymentError>;
    fn import_pin_input_status(&self, status: u8) -> Result<(), PaymentError>;
    fn import_online_proc_status(&self, status: u8) -> Result<(), PaymentError>;
    fn import_cert_confirm_status(&self, status: u8) -> Result<(), PaymentError>;

    /// Read kernel-held EMV data for the given tags.
    fn read_kernel_data(&self, tags: &[&str]) -> Result<TlvMap, PaymentError>;

    /// Abort the current transact run. Idempotent.
    fn abort_transact(&self);
}

/// Hardware PIN pad.
pub trait PinPad: Send + Sync {
    fn show_pin_pad(&self, config: &PinPadConfig) -> Result<PinPadResult, PaymentError>;
}

/// Secure element: DUKPT state and key derivation.
pub trait SecureModule: Send + Sync {
    /// Current key-serial-number. Read only after PIN confirmation.
    fn current_ksn(&self) -> Result<String, PaymentError>;

    /// Derive the 16-byte per-transaction PIN key.
    fn derive_transaction_key(&self) -> Result<[u8; 16], PaymentError>;
}

/// Sector-level access for proprietary stored-value cards.
pub trait MifareReader: Send + Sync {
    /// Key-type-A authentication against one sector.
    fn authenticate_sector(&self, sector: u8, key_a: &[u8; 6]) -> Result<(), PaymentError>;

    /// Read one 16-byte block (absolute block number).
    fn read_block(&self, block: u8) -> Result<[u8; 16], PaymentError>;
}

/// UI-side PIN collection for the stored-value path, which bypasses the
/// hardware PIN pad. Injected capability; the engine stays UI-free.
pub trait PinInput: Send + Sync {
    fn request_pin(
        &self,
        on_entered: Box<dyn FnOnce(String) + Send>,
        on_cancelled: Box<dyn FnOnce() + Send>,
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
