//! Contactless (NFC) processor.
//!
//! Same kernel-session machinery as the contact path, on the quick
//! contactless flow. Phone wallets present like contactless cards; the
//! engine treats them identically and only notes the longer ATS some
//! handsets return.

use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

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

/// Tags read back after an approved contactless transaction. Narrower
/// than the contact set; quick kernels do not populate issuer app data
/// or CVM results on every scheme.
pub const CONTACTLESS_TAGS: &[&str] = &[
    "57", "5A", "5F24", "5F2A", "5F34", "82", "84", "95", "9A", "9C", "9F02", "9F10", "9F1A",
    "9F26", "9F27", "9F36", "9F37", "9F6E",
];

/// Kernel flow type for quick contactless.
const FLOW_CONTACTLESS: u8 = 0x02;
const TRANS_PURCHASE: u8 = 0x00;

/// ATS hex length above which the presented device is almost certainly a
/// phone wallet rather than a card.
const PHONE_ATS_HEX_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

pub struct ContactlessProcessor {
    kernel: Arc<dyn EmvKernel>,
    pin_pad: Arc<dyn PinPad>,
    secure: Arc<dyn SecureModule>,
    config: Arc<TerminalConfig>,
    slot: CompletionSlot,
    session: Mutex<Option<KernelSession>>,
}

impl ContactlessProcessor {
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
    pub fn handle_kernel_event(&self, event: KernelEvent) {
        let mut guard = self.session.lock().unwrap_or_else(|e| e.into_inner());
        let session = match guard.as_mut() {
            Some(s) => s,
            None => {
                warn!(?event, "kernel event with no active contactless session");
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
                guard.take();
                drop(guard);
                self.slot.complete(Err(e));
            }
        }
    }

    fn finish_approved(&self, session: KernelSession) {
        let result = self
            .kernel
            .read_kernel_data(CONTACTLESS_TAGS)
            .and_then(|tlv| {
                processors::extract_emv_sale(
                    &tlv,
                    CardMode::Contactless,
                    session.amount(),
                    CONTACTLESS_TAGS,
                )
            })
            .map(|mut sale| {
                sale.pin_block = session.pin_block().map(str::to_string);
                sale.ksn = session.ksn().map(str::to_string);
                sale.signature_required = sale.pin_block.is_none()
                    && self
                        .config
                        .cvm_config_for(sale.brand, CardMode::Contactless)
                        .map(|cvm| cvm.requires_signature(session.amount_minor()))
                        .unwrap_or(false);
                sale
            });
        drop(session.into_context());
        self.slot.complete(result);
    }
}

impl CardProcessor for ContactlessProcessor {
    fn start_processing(
        &self,
        detection: &CardDetection,
        request: &PaymentRequest,
        on_complete: CompletionCallback,
    ) {
        if !self.slot.try_begin(on_complete) {
            return;
        }

        let ats = match detection {
            CardDetection::Contactless { ats } => ats.clone(),
            other => {
                self.slot
                    .complete(Err(processors::wrong_detection("contactless", other)));
                return;
            }
        };
        if ats.len() > PHONE_ATS_HEX_LEN {
            debug!(%ats, "long ATS, likely phone wallet");
        }
        info!(amount = request.amount, "contactless transaction starting");

        let context = TransactionContext::new(request.amount);
        let config = TransactConfig {
            flow_type: FLOW_CONTACTLESS,
            trans_type: TRANS_PURCHASE,
            card_type: CardTypeMask::NFC,
            amount: context.amount.clone(),
        };
        let session = KernelSession::new(
            self.kernel.clone(),
            self.pin_pad.clone(),
            self.secure.clone(),
            self.config.clone(),
            CardMode::Contactless,
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
        info!("contactless transaction cancelled");
        self.kernel.abort_transact();
        self.session.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.slot.complete(Err(crate::error::PaymentError::new(
            crate::error::ErrorKind::UserCancelled,
            "contactless processing cancelled",
        )));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
