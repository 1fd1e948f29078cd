//! Per-card-type transaction processors.
//!
//! One concrete processor per physical read path (chip, contactless,
//! magnetic, proprietary stored-value), all behind [`CardProcessor`].
//! Each turns raw detection data into a normalized [`SaleRequest`] or a
//! typed error, delivered through a one-shot completion callback.
//!
//! Shared invariants enforced here:
//!
//! - At most one `start_processing` in flight per processor. A second
//!   start while active is a logged no-op, not a caller error.
//! - Exactly one terminal result per accepted start, even when a cancel
//!   races the kernel's final-result callback.

pub mod chip;
pub mod contactless;
pub mod magnetic;
pub mod stored_value;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::context::{CardMode, PaymentResult, SaleRequest};
use crate::error::{ErrorKind, PaymentError};
use crate::hardware::CardDetection;
use crate::tlv::TlvMap;
use crate::track;

pub use chip::ChipProcessor;
pub use contactless::ContactlessProcessor;
pub use magnetic::MagneticProcessor;
pub use stored_value::StoredValueProcessor;

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// Delivered exactly once per accepted `start_processing`.
pub type CompletionCallback = Box<dyn FnOnce(PaymentResult) + Send>;

/// Inbound transaction request (amount in minor units).
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub amount: u64,
    pub merchant_id: String,
    pub terminal_id: String,
}

/// Common contract all processors implement.
pub trait CardProcessor: Send + Sync {
    /// Begin processing a detected card. The result arrives through
    /// `on_complete`; a start while another is active drops the callback
    /// and logs.
    fn start_processing(
        &self,
        detection: &CardDetection,
        request: &PaymentRequest,
        on_complete: CompletionCallback,
    );

    /// Cancel the in-flight transaction. Idempotent, callable from any
    /// thread.
    fn cancel_processing(&self);
}

// ---------------------------------------------------------------------------
// One-shot completion slot
// ---------------------------------------------------------------------------

/// Single-flight guard plus one-shot result delivery.
///
/// The active flag doubles as the late-callback filter: cancellation
/// flips it first, so kernel events arriving afterwards are ignored by
/// the session, and the slot guarantees the callback still fires at most
/// once whichever side wins the race.
pub(crate) struct CompletionSlot {
    active: Arc<AtomicBool>,
    callback: Mutex<Option<CompletionCallback>>,
}

impl CompletionSlot {
    pub fn new() -> Self {
        Self {
            active: Arc::new(AtomicBool::new(false)),
            callback: Mutex::new(None),
        }
    }

    /// Shared handle to the active flag (given to the kernel session).
    pub fn active_flag(&self) -> Arc<AtomicBool> {
        self.active.clone()
    }

    /// Claim the slot for a new transaction. Returns false (and logs) if
    /// one is already in flight.
    pub fn try_begin(&self, on_complete: CompletionCallback) -> bool {
        if self.active.swap(true, Ordering::SeqCst) {
            warn!("start_processing while a transaction is active, ignoring");
            return false;
        }
        *self.callback.lock().unwrap_or_else(|e| e.into_inner()) = Some(on_complete);
        true
    }

    /// Deliver the terminal result. No-op if it was already delivered.
    pub fn complete(&self, result: PaymentResult) {
        let cb = self
            .callback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.active.store(false, Ordering::SeqCst);
        match cb {
            Some(cb) => {
                match &result {
                    Ok(sale) => info!(
                        transaction_id = %sale.transaction_id,
                        mode = ?sale.card_mode,
                        "transaction complete"
                    ),
                    Err(e) => info!(kind = ?e.kind(), "transaction failed: {e}"),
                }
                cb(result);
            }
            None => warn!("terminal result after completion, dropping"),
        }
    }

    /// Flip the active flag off ahead of cancel teardown. Returns whether
    /// this call did the flip.
    pub fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Shared EMV payload extraction
// ---------------------------------------------------------------------------

/// EMV tags: application PAN and expiration date.
const TAG_PAN: &str = "5A";
const TAG_EXPIRY: &str = "5F24";
/// Track-2 equivalent data.
const TAG_TRACK2: &str = "57";

/// Build a sale payload from kernel TLV data.
///
/// PAN and expiry come from the dedicated tags when present; absent or
/// short values fall back to the Track-2-equivalent tag. Any failure is
/// `EmvDataInvalid` — the caller decides re-tap vs. abort.
pub(crate) fn extract_emv_sale(
    tlv: &TlvMap,
    mode: CardMode,
    amount: &str,
    blob_tags: &[&str],
) -> Result<SaleRequest, PaymentError> {
    let track2_raw = tlv.get(TAG_TRACK2).map(str::to_string);

    let pan = match tlv.get(TAG_PAN) {
        Some(v) if v.trim_end_matches(['F', 'f']).len() >= 13 => {
            v.trim_end_matches(['F', 'f']).to_string()
        }
        _ => {
            let raw = track2_raw.as_deref().ok_or_else(|| {
                PaymentError::new(ErrorKind::EmvDataInvalid, "no PAN tag and no track2 data")
            })?;
            track::parse_track2(raw)
                .map_err(|e| {
                    PaymentError::new(
                        ErrorKind::EmvDataInvalid,
                        format!("track2 fallback failed: {e}"),
                    )
                })?
                .pan
        }
    };

    let expiry = match tlv.get(TAG_EXPIRY) {
        // 5F24 is YYMMDD
        Some(v) if v.len() >= 4 => {
            let (yy, mm) = v[..4].split_at(2);
            let month: u32 = mm.parse().unwrap_or(0);
            if !(1..=12).contains(&month) {
                return Err(PaymentError::new(
                    ErrorKind::EmvDataInvalid,
                    format!("invalid expiry month in 5F24: {mm}"),
                ));
            }
            format!("{mm}{yy}")
        }
        _ => {
            let raw = track2_raw.as_deref().ok_or_else(|| {
                PaymentError::new(ErrorKind::EmvDataInvalid, "no expiry tag and no track2 data")
            })?;
            track::parse_track2(raw)
                .map_err(|e| {
                    PaymentError::new(
                        ErrorKind::EmvDataInvalid,
                        format!("track2 fallback failed: {e}"),
                    )
                })?
                .expiry
        }
    };

    let mut sale = SaleRequest::new(mode, pan, expiry, amount.to_string());
    sale.track2 = track2_raw;
    let blob = tlv.select(blob_tags).build();
    if !blob.is_empty() {
        sale.emv_data = Some(blob);
    }
    Ok(sale)
}

/// Reject a detection payload that does not match the processor.
pub(crate) fn wrong_detection(expected: &str, detection: &CardDetection) -> PaymentError {
    PaymentError::new(
        ErrorKind::MalformedCard,
        format!("{expected} processor got {detection:?}"),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
