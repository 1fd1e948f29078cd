//! Proprietary stored-value (Mifare) processor.
//!
//! These cards carry no EMV application. The card number and expiry live
//! in fixed sector blocks behind key-type-A authentication; the raw block
//! dump travels downstream in the track3 slot. When the merchant policy
//! requires a PIN it is collected in the clear from a UI collaborator —
//! this path bypasses the hardware PIN pad, so the processor itself
//! validates the PIN (exactly 6 numeric digits) before use.

use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::context::{format_amount, CardMode, SaleRequest};
use crate::error::{ErrorKind, PaymentError};
use crate::hardware::{CardDetection, MifareReader, PinInput};
use crate::processors::{
    self, CardProcessor, CompletionCallback, CompletionSlot, PaymentRequest,
};

// ---------------------------------------------------------------------------
// Card layout
// ---------------------------------------------------------------------------

/// Sectors holding the stored-value application data.
const DATA_SECTORS: &[u8] = &[1, 2];
/// Data blocks per sector (the fourth is the sector trailer).
const BLOCKS_PER_SECTOR: u8 = 3;
/// Absolute block holding the ASCII card number.
const CARD_NUMBER_BLOCK: u8 = 4;
/// Absolute block whose first four bytes are the ASCII `MMyy` expiry.
const EXPIRY_BLOCK: u8 = 5;

const PIN_LEN: usize = 6;

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

pub struct StoredValueProcessor {
    inner: Arc<Inner>,
}

struct Inner {
    mifare: Arc<dyn MifareReader>,
    pin_input: Arc<dyn PinInput>,
    /// Key-type-A sector key from merchant configuration.
    key_a: [u8; 6],
    require_pin: bool,
    slot: CompletionSlot,
}

impl StoredValueProcessor {
    pub fn new(
        mifare: Arc<dyn MifareReader>,
        pin_input: Arc<dyn PinInput>,
        key_a: [u8; 6],
        require_pin: bool,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                mifare,
                pin_input,
                key_a,
                require_pin,
                slot: CompletionSlot::new(),
            }),
        }
    }
}

impl Inner {
    /// Authenticate and dump the application sectors.
    fn read_sectors(&self) -> Result<Vec<[u8; 16]>, PaymentError> {
        let mut blocks = Vec::with_capacity(DATA_SECTORS.len() * BLOCKS_PER_SECTOR as usize);
        for &sector in DATA_SECTORS {
            self.mifare.authenticate_sector(sector, &self.key_a)?;
            let base = sector * 4;
            for offset in 0..BLOCKS_PER_SECTOR {
                blocks.push(self.mifare.read_block(base + offset)?);
            }
        }
        Ok(blocks)
    }

    fn build_sale(&self, uid: &str, amount: u64) -> Result<SaleRequest, PaymentError> {
        let blocks = self.read_sectors()?;

        let number_idx = block_index(CARD_NUMBER_BLOCK)?;
        let expiry_idx = block_index(EXPIRY_BLOCK)?;

        let pan = ascii_digits(&blocks[number_idx]);
        if pan.len() < 8 {
            return Err(PaymentError::new(
                ErrorKind::MalformedCard,
                format!("stored-value card number too short ({} digits)", pan.len()),
            ));
        }
        let expiry = ascii_digits(&blocks[expiry_idx][..4]);
        if expiry.len() != 4 {
            return Err(PaymentError::new(
                ErrorKind::MalformedCard,
                "stored-value expiry block unreadable",
            ));
        }

        let mut sale = SaleRequest::new(
            CardMode::Proprietary,
            pan,
            expiry,
            format_amount(amount),
        );
        // Raw sector dump for the downstream stored-value host.
        let mut dump = String::with_capacity(blocks.len() * 32);
        for block in &blocks {
            dump.push_str(&hex::encode_upper(block));
        }
        sale.track3 = Some(dump);
        info!(uid, masked_pan = %sale.masked_pan, "stored-value card read");
        Ok(sale)
    }

    /// Collect the clear PIN through the UI collaborator, then complete.
    fn collect_pin_and_complete(inner: &Arc<Inner>, sale: SaleRequest) {
        let pending = Arc::new(Mutex::new(Some(sale)));

        let entered_inner = Arc::clone(inner);
        let entered_pending = Arc::clone(&pending);
        let on_entered = Box::new(move |pin: String| {
            let sale = entered_pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            let Some(mut sale) = sale else { return };
            if pin.len() != PIN_LEN || !pin.bytes().all(|b| b.is_ascii_digit()) {
                warn!("stored-value PIN rejected by validation");
                entered_inner.slot.complete(Err(PaymentError::new(
                    ErrorKind::PinInputFailed,
                    "stored-value PIN must be exactly 6 digits",
                )));
                return;
            }
            sale.pin_clear = Some(pin);
            entered_inner.slot.complete(Ok(sale));
        });

        let cancelled_inner = Arc::clone(inner);
        let cancelled_pending = Arc::clone(&pending);
        let on_cancelled = Box::new(move || {
            cancelled_pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            cancelled_inner.slot.complete(Err(PaymentError::new(
                ErrorKind::UserCancelled,
                "stored-value PIN entry cancelled",
            )));
        });

        inner.pin_input.request_pin(on_entered, on_cancelled);
    }
}

/// Index of an absolute block number within the sector dump.
fn block_index(block: u8) -> Result<usize, PaymentError> {
    let sector = block / 4;
    let offset = block % 4;
    let pos = DATA_SECTORS.iter().position(|&s| s == sector);
    match pos {
        Some(i) if offset < BLOCKS_PER_SECTOR => {
            Ok(i * BLOCKS_PER_SECTOR as usize + offset as usize)
        }
        _ => Err(PaymentError::new(
            ErrorKind::NotInitialized,
            format!("block {block} outside the configured card layout"),
        )),
    }
}

/// Leading ASCII digit run of a block, padding ignored.
fn ascii_digits(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .map(|&b| b as char)
        .collect()
}

impl CardProcessor for StoredValueProcessor {
    fn start_processing(
        &self,
        detection: &CardDetection,
        request: &PaymentRequest,
        on_complete: CompletionCallback,
    ) {
        if !self.inner.slot.try_begin(on_complete) {
            return;
        }

        let uid = match detection {
            CardDetection::StoredValue { uid } => uid.clone(),
            other => {
                self.inner
                    .slot
                    .complete(Err(processors::wrong_detection("stored-value", other)));
                return;
            }
        };
        info!(%uid, amount = request.amount, "stored-value processing");

        match self.inner.build_sale(&uid, request.amount) {
            Ok(sale) if self.inner.require_pin => {
                Inner::collect_pin_and_complete(&self.inner, sale);
            }
            result => self.inner.slot.complete(result),
        }
    }

    fn cancel_processing(&self) {
        if !self.inner.slot.deactivate() {
            return;
        }
        info!("stored-value processing cancelled");
        self.inner.slot.complete(Err(PaymentError::new(
            ErrorKind::UserCancelled,
            "stored-value processing cancelled",
        )));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PaymentResult;
    use std::collections::HashMap;
    use std::sync::mpsc;

    struct FakeCard {
        blocks: HashMap<u8, [u8; 16]>,
        expected_key: [u8; 6],
    }

    impl MifareReader for FakeCard {
        fn authenticate_sector(&self, _sector: u8, key_a: &[u8; 6]) -> Result<(), PaymentError> {
            if key_a != &self.expected_key {
                return Err(PaymentError::new(
                    ErrorKind::SecurityViolation,
                    "sector authentication failed",
                ));
            }
            Ok(())
        }

        fn read_block(&self, block: u8) -> Result<[u8; 16], PaymentError> {
            self.blocks
                .get(&block)
                .copied()
                .ok_or_else(|| PaymentError::new(ErrorKind::MalformedCard, "block read failed"))
        }
    }

    /// Immediately enters the given PIN.
    struct AutoPin(String);

    impl PinInput for AutoPin {
        fn request_pin(
            &self,
            on_entered: Box<dyn FnOnce(String) + Send>,
            _on_cancelled: Box<dyn FnOnce() + Send>,
        ) {
            on_entered(self.0.clone());
        }
    }

    struct CancelPin;

    impl PinInput for CancelPin {
        fn request_pin(
            &self,
            _on_entered: Box<dyn FnOnce(String) + Send>,
            on_cancelled: Box<dyn FnOnce() + Send>,
        ) {
            on_cancelled();
        }
    }

    const KEY_A: [u8; 6] = [0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5];

    fn ascii_block(s: &str) -> [u8; 16] {
        let mut b = [0u8; 16];
        b[..s.len()].copy_from_slice(s.as_bytes());
        b
    }

    fn fake_card() -> FakeCard {
        let mut blocks = HashMap::new();
        blocks.insert(4, ascii_block("9876543210"));
        blocks.insert(5, ascii_block("1227"));
        blocks.insert(6, [0u8; 16]);
        blocks.insert(8, [0u8; 16]);
        blocks.insert(9, [0u8; 16]);
        blocks.insert(10, [0u8; 16]);
        FakeCard {
            blocks,
            expected_key: KEY_A,
        }
    }

    fn run(pin_input: Arc<dyn PinInput>, require_pin: bool, card: FakeCard) -> PaymentResult {
        let proc = StoredValueProcessor::new(Arc::new(card), pin_input, KEY_A, require_pin);
        let (tx, rx) = mpsc::channel::<PaymentResult>();
        let request = PaymentRequest {
            amount: 25_000,
            merchant_id: "M1".into(),
            terminal_id: "T1".into(),
        };
        proc.start_processing(
            &CardDetection::StoredValue {
                uid: "04AABBCC".into(),
            },
            &request,
            Box::new(move |r| tx.send(r).unwrap()),
        );
        rx.recv().unwrap()
    }

    #[test]
    fn test_read_without_pin_policy() {
        let sale = run(Arc::new(CancelPin), false, fake_card()).unwrap();
        assert_eq!(sale.pan, "9876543210");
        assert_eq!(sale.expiry, "1227");
        assert_eq!(sale.card_mode, CardMode::Proprietary);
        assert_eq!(sale.pos_entry_mode, "01");
        assert!(sale.pin_clear.is_none());
        // Six blocks of sixteen bytes each
        assert_eq!(sale.track3.as_deref().unwrap().len(), 6 * 32);
    }

    #[test]
    fn test_pin_policy_collects_clear_pin() {
        let sale = run(Arc::new(AutoPin("123456".into())), true, fake_card()).unwrap();
        assert_eq!(sale.pin_clear.as_deref(), Some("123456"));
        assert!(sale.pin_block.is_none());
    }

    #[test]
    fn test_short_pin_rejected() {
        let err = run(Arc::new(AutoPin("12345".into())), true, fake_card()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PinInputFailed);
    }

    #[test]
    fn test_non_numeric_pin_rejected() {
        let err = run(Arc::new(AutoPin("12a456".into())), true, fake_card()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PinInputFailed);
    }

    #[test]
    fn test_pin_entry_cancelled() {
        let err = run(Arc::new(CancelPin), true, fake_card()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UserCancelled);
    }

    #[test]
    fn test_wrong_sector_key_fails() {
        let mut card = fake_card();
        card.expected_key = [0xFF; 6];
        let err = run(Arc::new(CancelPin), false, card).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SecurityViolation);
    }

    #[test]
    fn test_short_card_number_is_malformed() {
        let mut card = fake_card();
        card.blocks.insert(4, ascii_block("1234"));
        let err = run(Arc::new(CancelPin), false, card).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedCard);
    }
}
