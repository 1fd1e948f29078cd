//! Contact chip (ICC) processor.
//!
//! Drives a full EMV contact flow through the kernel session. The shell
//! feeds kernel callbacks into [`ChipProcessor::handle_kernel_event`];
//! when the session reports an approved final result, the processor reads
//! the chip tag set from the kernel, extracts PAN/expiry, attaches the
//! PIN block and KSN collected during the run, and completes.

use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::config::TerminalConfig;
use crate::context::{CardMode, TransactionContext};
use crate::hardware::{
    CardDetection, CardTypeMask, EmvKernel, PinPad, SecureModule, TransactConfig,
};
use crate::kernel::{KernelEvent, KernelSession, SessionUpdate};
use crate::processors::{
    self, CardProcessor, CompletionCallback, CompletionSlot, PaymentRequest,
};

// ---------------------------------------------------------------------------
// Tag set
// ---------------------------------------------------------------------------

/// Tags read back from the kernel after an approved contact transaction.
pub const CHIP_TAGS: &[&str] = &[
    "57", "5A", "5F24", "5F2A", "5F34", "82", "84", "95", "9A", "9C", "9F02", "9F03", "9F10",
    "9F1A", "9F26", "9F27", "9F33", "9F34", "9F36", "9F37",
];

/// Kernel flow type for full contact EMV.
const FLOW_CONTACT: u8 = 0x01;
/// EMV transaction type: purchase.
const TRANS_PURCHASE: u8 = 0x00;

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

pub struct ChipProcessor {
    kernel: Arc<dyn EmvKernel>,
    pin_pad: Arc<dyn PinPad>,
    secure: Arc<dyn SecureModule>,
    config: Arc<TerminalConfig>,
    slot: CompletionSlot,
    session: Mutex<Option<KernelSession>>,
}

impl ChipProcessor {
    pub fn new(
        kernel: Arc<dyn EmvKernel>,
        pin_pad: Arc<dyn PinPad>,
        secure: Arc<dyn SecureModule>,
        config: Arc<TerminalConfig>,
    ) -> Self {
        Self {
            kernel,
            pin_pad,
            secure,
            config,
            slot: CompletionSlot::new(),
            session: Mutex::new(None),
        }
    }

    /// Feed one kernel callback through the active session.
    ///
    /// Called from the kernel's own thread; late events after cancel or
    /// completion are dropped by the session.
    pub fn handle_kernel_event(&self, event: KernelEvent) {
        let mut guard = self.session.lock().unwrap_or_else(|e| e.into_inner());
        let session = match guard.as_mut() {
            Some(s) => s,
            None => {
                warn!(?event, "kernel event with no active chip session");
                return;
            }
        };

        match session.handle(event) {
            SessionUpdate::Continue | SessionUpdate::Ignored => {}
            SessionUpdate::Finished(Ok(())) => {
                let session = guard.take().expect("session present");
                drop(guard);
                self.finish_approved(session);
            }
            SessionUpdate::Finished(Err(e)) => {
                // Dropping the session zeroizes its context.
                guard.take();
                drop(guard);
                self.slot.complete(Err(e));
            }
        }
    }

    fn finish_approved(&self, session: KernelSession) {
        let result = self
            .kernel
            .read_kernel_data(CHIP_TAGS)
            .and_then(|tlv| {
                processors::extract_emv_sale(&tlv, CardMode::Chip, session.amount(), CHIP_TAGS)
            })
            .map(|mut sale| {
                sale.pin_block = session.pin_block().map(str::to_string);
                sale.ksn = session.ksn().map(str::to_string);
                // PIN satisfies CVM on its own; signature applies only in
                // its threshold band.
                sale.signature_required = sale.pin_block.is_none()
                    && self
                        .config
                        .cvm_config_for(sale.brand, CardMode::Chip)
                        .map(|cvm| cvm.requires_signature(session.amount_minor()))
                        .unwrap_or(false);
                sale
            });
        // Context (and PIN scratch) zeroizes here.
        drop(session.into_context());
        self.slot.complete(result);
    }
}

impl CardProcessor for ChipProcessor {
    fn start_processing(
        &self,
        detection: &CardDetection,
        request: &PaymentRequest,
        on_complete: CompletionCallback,
    ) {
        if !self.slot.try_begin(on_complete) {
            return;
        }

        let atr = match detection {
            CardDetection::Chip { atr } => atr.clone(),
            other => {
                self.slot.complete(Err(processors::wrong_detection("chip", other)));
                return;
            }
        };
        info!(%atr, amount = request.amount, "chip transaction starting");

        let context = TransactionContext::new(request.amount);
        let config = TransactConfig {
            flow_type: FLOW_CONTACT,
            trans_type: TRANS_PURCHASE,
            card_type: CardTypeMask::IC,
            amount: context.amount.clone(),
        };
        let session = KernelSession::new(
            self.kernel.clone(),
            self.pin_pad.clone(),
            self.secure.clone(),
            self.config.clone(),
            CardMode::Chip,
            context,
            self.slot.active_flag(),
        );
        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(session);

        if let Err(e) = self.kernel.start_transact(&config) {
            warn!(error = %e, "kernel start_transact failed");
            self.session.lock().unwrap_or_else(|e| e.into_inner()).take();
            self.slot.complete(Err(e));
        }
    }

    fn cancel_processing(&self) {
        if !self.slot.deactivate() {
            return;
        }
        info!("chip transaction cancelled");
        self.kernel.abort_transact();
        self.session.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.slot.complete(Err(crate::error::PaymentError::new(
            crate::error::ErrorKind::UserCancelled,
            "chip processing cancelled",
        )));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
