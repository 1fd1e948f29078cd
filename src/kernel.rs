//! EMV kernel callback adapter.
//!
//! The vendor kernel drives a fixed callback sequence during one transact
//! run: app selection, card-number confirmation, cardholder verification
//! (possibly PIN entry), risk management, online processing, final result.
//! The shell converts each callback into a [`KernelEvent`] and feeds it to
//! a [`KernelSession`], which answers with the mandated import status and
//! tells the caller whether the run is still going.
//!
//! Two hard rules live here:
//!
//! - A facade call that fails while acknowledging is caught and turned
//!   into a typed error; nothing may unwind through the kernel's own
//!   callback thread.
//! - Online processing is always acknowledged as approved. This layer
//!   never blocks on network I/O; the authorization decision happens
//!   downstream of the sale payload handoff.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};
use zeroize::Zeroize;

use crate::brand;
use crate::config::TerminalConfig;
use crate::context::{CardMode, TransactionContext};
use crate::error::{self, ErrorKind, PaymentError};
use crate::hardware::{EmvKernel, PinPad, PinPadConfig, PinPadResult, SecureModule};
use crate::pinblock;

// ---------------------------------------------------------------------------
// Import status codes
// ---------------------------------------------------------------------------

/// Acknowledge: proceed.
pub const STATUS_OK: u8 = 0;
/// Acknowledge: cardholder cancelled.
pub const STATUS_CANCEL: u8 = 1;
/// Acknowledge: error, abort the step.
pub const STATUS_ERROR: u8 = 3;

/// Kernel final-result codes that mean the transaction went through:
/// approved, offline approved, online approved.
pub const RESULT_SUCCESS_CODES: &[i32] = &[0, 1, 2];

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// One kernel callback, as an explicit event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelEvent {
    /// Candidate application list is ready.
    WaitAppSelect { candidates: Vec<String> },
    /// Final application selected.
    AppFinalSelect { aid: String },
    /// Card number read; some cards only reveal the authoritative PAN here.
    ConfirmCardNo { pan: String },
    /// Cardholder verification step (non-PIN methods).
    CardholderVerify { method: u8 },
    /// Kernel requests PIN entry.
    RequestShowPinPad { is_online_pin: bool, retry_times: u8 },
    /// Terminal risk management step; informational.
    TerminalRiskManagement,
    /// Kernel asks for the online authorization verdict.
    OnlineProc,
    /// Certificate verification step.
    CertVerify { cert_type: u8, cert_no: String },
    /// Terminal callback: the run is over.
    TransResult { code: i32, message: String },
}

/// Where the session believes the kernel is in its sequence. Tracking is
/// for logging and late-event filtering; the kernel owns the ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelPhase {
    Idle,
    AppSelection,
    CardConfirm,
    PinEntry,
    RiskManagement,
    OnlineProcessing,
    Done,
}

/// What the caller should do after feeding one event.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionUpdate {
    /// Acknowledged; keep feeding events.
    Continue,
    /// Session is cancelled or finished; event was dropped.
    Ignored,
    /// Terminal result. `Ok` means approved — extract the payload now.
    Finished(Result<(), PaymentError>),
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Per-transaction kernel adapter state machine.
pub struct KernelSession {
    kernel: Arc<dyn EmvKernel>,
    pin_pad: Arc<dyn PinPad>,
    secure: Arc<dyn SecureModule>,
    config: Arc<TerminalConfig>,
    mode: CardMode,
    context: TransactionContext,
    phase: KernelPhase,
    active: Arc<AtomicBool>,
}

impl KernelSession {
    pub fn new(
        kernel: Arc<dyn EmvKernel>,
        pin_pad: Arc<dyn PinPad>,
        secure: Arc<dyn SecureModule>,
        config: Arc<TerminalConfig>,
        mode: CardMode,
        context: TransactionContext,
        active: Arc<AtomicBool>,
    ) -> Self {
        Self {
            kernel,
            pin_pad,
            secure,
            config,
            mode,
            context,
            phase: KernelPhase::Idle,
            active,
        }
    }

    pub fn phase(&self) -> KernelPhase {
        self.phase
    }

    /// Zero-padded transaction amount this session was started with.
    pub fn amount(&self) -> &str {
        &self.context.amount
    }

    /// Same amount in minor units, for threshold checks.
    pub fn amount_minor(&self) -> u64 {
        self.context.amount_minor
    }

    /// The candidate PAN captured at card-number confirmation.
    pub fn candidate_pan(&self) -> Option<&str> {
        self.context.pan_for_pin.as_deref()
    }

    pub fn pin_block(&self) -> Option<&str> {
        self.context.pin_block.as_deref()
    }

    pub fn ksn(&self) -> Option<&str> {
        self.context.ksn.as_deref()
    }

    /// Take the transaction context out of a finished session.
    pub fn into_context(self) -> TransactionContext {
        self.context
    }

    /// Feed one kernel event through the state machine.
    ///
    /// Safe to call from the kernel's own thread. Late events after
    /// cancellation or completion are logged and dropped.
    pub fn handle(&mut self, event: KernelEvent) -> SessionUpdate {
        if !self.active.load(Ordering::SeqCst) {
            warn!(?event, "kernel event after cancellation, ignoring");
            return SessionUpdate::Ignored;
        }
        if self.phase == KernelPhase::Done {
            warn!(?event, "kernel event after final result, ignoring");
            return SessionUpdate::Ignored;
        }
        debug!(phase = ?self.phase, ?event, "kernel event");

        match event {
            KernelEvent::WaitAppSelect { candidates } => {
                self.phase = KernelPhase::AppSelection;
                debug!(count = candidates.len(), "application candidates");
                self.ack_app_select()
            }
            KernelEvent::AppFinalSelect { aid } => {
                self.phase = KernelPhase::AppSelection;
                info!(%aid, "application selected");
                self.ack_app_select()
            }
            KernelEvent::ConfirmCardNo { pan } => {
                self.phase = KernelPhase::CardConfirm;
                info!(pan = %crate::context::mask_pan(&pan), "card number confirmed");
                self.context.pan_for_pin = Some(pan);
                self.ack(|k, s| k.import_card_confirm_status(s), STATUS_OK)
            }
            KernelEvent::CardholderVerify { method } => {
                debug!(method, "cardholder verification step");
                SessionUpdate::Continue
            }
            KernelEvent::RequestShowPinPad {
                is_online_pin,
                retry_times,
            } => {
                self.phase = KernelPhase::PinEntry;
                self.run_pin_entry(is_online_pin, retry_times)
            }
            KernelEvent::TerminalRiskManagement => {
                self.phase = KernelPhase::RiskManagement;
                debug!("terminal risk management");
                SessionUpdate::Continue
            }
            KernelEvent::OnlineProc => {
                self.phase = KernelPhase::OnlineProcessing;
                // Always approved here; authorization happens downstream of
                // the sale payload handoff.
                info!("online processing requested, acknowledging approval");
                self.ack(|k, s| k.import_online_proc_status(s), STATUS_OK)
            }
            KernelEvent::CertVerify { cert_type, cert_no } => {
                debug!(cert_type, %cert_no, "certificate verification");
                self.ack(|k, s| k.import_cert_confirm_status(s), STATUS_OK)
            }
            KernelEvent::TransResult { code, message } => {
                self.phase = KernelPhase::Done;
                if RESULT_SUCCESS_CODES.contains(&code) {
                    info!(code, "kernel final result: approved");
                    SessionUpdate::Finished(Ok(()))
                } else {
                    let err = map_trans_result(code, &message);
                    warn!(code, %message, kind = ?err.kind(), "kernel final result: error");
                    SessionUpdate::Finished(Err(err))
                }
            }
        }
    }

    /// App-selection acks surface EMV_NO_APP when the ack itself fails.
    fn ack_app_select(&mut self) -> SessionUpdate {
        match self.kernel.import_app_select_status(STATUS_OK) {
            Ok(()) => SessionUpdate::Continue,
            Err(e) => {
                warn!(error = %e, "app select ack failed");
                SessionUpdate::Finished(Err(PaymentError::new(
                    ErrorKind::EmvNoApp,
                    format!("app selection acknowledgement failed: {e}"),
                )))
            }
        }
    }

    /// Acknowledge through the facade; a failing ack becomes an
    /// SDK-init-class error instead of unwinding into the kernel thread.
    fn ack(
        &mut self,
        f: impl FnOnce(&dyn EmvKernel, u8) -> Result<(), PaymentError>,
        status: u8,
    ) -> SessionUpdate {
        match f(self.kernel.as_ref(), status) {
            Ok(()) => SessionUpdate::Continue,
            Err(e) => {
                warn!(error = %e, status, "kernel acknowledgement failed");
                SessionUpdate::Finished(Err(PaymentError::new(
                    ErrorKind::SdkInitFailed,
                    format!("kernel acknowledgement failed: {e}"),
                )))
            }
        }
    }

    /// PIN entry: show the pad, build the block, fetch the KSN, ack.
    ///
    /// The only legal acknowledgements are 0 (confirmed), 1 (cancelled)
    /// and 3 (error).
    fn run_pin_entry(&mut self, is_online_pin: bool, retry_times: u8) -> SessionUpdate {
        info!(is_online_pin, retry_times, "kernel requests PIN entry");

        let status = match self.collect_pin(is_online_pin) {
            Ok(PinOutcome::Confirmed) => STATUS_OK,
            Ok(PinOutcome::Cancelled) => {
                info!("cardholder cancelled PIN entry");
                STATUS_CANCEL
            }
            Err(e) => {
                warn!(error = %e, "PIN entry failed");
                STATUS_ERROR
            }
        };
        self.ack(|k, s| k.import_pin_input_status(s), status)
    }

    fn collect_pin(&mut self, is_online_pin: bool) -> Result<PinOutcome, PaymentError> {
        let pan = self.context.pan_for_pin.clone().ok_or_else(|| {
            PaymentError::new(ErrorKind::EmvDataInvalid, "PIN requested before card number")
        })?;

        let config = PinPadConfig {
            is_online_pin,
            pan_digits: pinblock::pan_for_pin_block(&pan)?,
            ..PinPadConfig::default()
        };

        match self.pin_pad.show_pin_pad(&config)? {
            PinPadResult::Confirmed { mut pin, pin_block } => {
                if let Some(block) = pin_block {
                    // Pad built the block on-device; keep it as handed over.
                    pin.zeroize();
                    self.context.pin_block = Some(block.to_uppercase());
                } else if !pin.is_empty() {
                    let key = self.secure.derive_transaction_key()?;
                    let block = pinblock::build_pin_block(&pin, &pan, &key)?;
                    pin.zeroize();
                    self.context.pin_block = Some(hex::encode_upper(block));
                } else {
                    return Err(PaymentError::new(
                        ErrorKind::PinInputFailed,
                        "pad confirmed with neither clear PIN nor block",
                    ));
                }
                // KSN only after the block exists, so it names the key
                // that actually encrypted this PIN.
                self.context.ksn = Some(self.secure.current_ksn()?);
                info!("PIN confirmed, block and KSN stored");
                Ok(PinOutcome::Confirmed)
            }
            PinPadResult::Bypassed => {
                if self.pin_required_at_amount(&pan) {
                    return Err(PaymentError::new(
                        ErrorKind::PinInputFailed,
                        "PIN bypass refused, CVM thresholds require a PIN at this amount",
                    ));
                }
                info!("PIN bypassed by cardholder");
                Ok(PinOutcome::Confirmed)
            }
            PinPadResult::Cancelled => Ok(PinOutcome::Cancelled),
        }
    }

    /// Whether the configured CVM thresholds for this brand and entry mode
    /// mandate a PIN at the transaction amount.
    fn pin_required_at_amount(&self, pan: &str) -> bool {
        self.config
            .cvm_config_for(brand::detect_brand(pan), self.mode)
            .map(|cvm| cvm.requires_pin(self.context.amount_minor))
            .unwrap_or(false)
    }
}

enum PinOutcome {
    Confirmed,
    Cancelled,
}

/// Map a non-success kernel final-result code through the taxonomy,
/// keeping the kernel's own message when the code is unrecognized.
fn map_trans_result(code: i32, message: &str) -> PaymentError {
    let err = error::from_emv_result(code);
    if err.kind() == ErrorKind::Unknown && !message.is_empty() {
        PaymentError::with_code(ErrorKind::Unknown, message.to_string(), code)
    } else {
        err
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brand::CardBrand;
    use crate::config::{CvmConfig, EmvBrandConfig, StoredValueConfig};
    use crate::hardware::TransactConfig;
    use crate::tlv::TlvMap;
    use std::sync::Mutex;

    /// Records import calls; individual acks can be made to fail.
    #[derive(Default)]
    struct MockKernel {
        imports: Mutex<Vec<(&'static str, u8)>>,
        fail_app_select: bool,
        fail_pin_import: bool,
    }

    impl EmvKernel for MockKernel {
        fn load_brand_config(&self, _config: &EmvBrandConfig) -> Result<(), PaymentError> {
            Ok(())
        }

        fn start_transact(&self, _config: &TransactConfig) -> Result<(), PaymentError> {
            Ok(())
        }

        fn import_app_select_status(&self, status: u8) -> Result<(), PaymentError> {
            if self.fail_app_select {
                return Err(PaymentError::new(ErrorKind::SdkInitFailed, "ack blew up"));
            }
            self.imports.lock().unwrap().push(("app_select", status));
            Ok(())
        }

        fn import_card_confirm_status(&self, status: u8) -> Result<(), PaymentError> {
            self.imports.lock().unwrap().push(("card_confirm", status));
            Ok(())
        }

        fn import_pin_input_status(&self, status: u8) -> Result<(), PaymentError> {
            if self.fail_pin_import {
                return Err(PaymentError::new(ErrorKind::SdkInitFailed, "ack blew up"));
            }
            self.imports.lock().unwrap().push(("pin_input", status));
            Ok(())
        }

        fn import_online_proc_status(&self, status: u8) -> Result<(), PaymentError> {
            self.imports.lock().unwrap().push(("online_proc", status));
            Ok(())
        }

        fn import_cert_confirm_status(&self, status: u8) -> Result<(), PaymentError> {
            self.imports.lock().unwrap().push(("cert_confirm", status));
            Ok(())
        }

        fn read_kernel_data(&self, _tags: &[&str]) -> Result<TlvMap, PaymentError> {
            Ok(TlvMap::new())
        }

        fn abort_transact(&self) {}
    }

    struct MockPinPad {
        result: PinPadResult,
    }

    impl PinPad for MockPinPad {
        fn show_pin_pad(&self, _config: &PinPadConfig) -> Result<PinPadResult, PaymentError> {
            Ok(self.result.clone())
        }
    }

    struct MockSecure;

    impl SecureModule for MockSecure {
        fn current_ksn(&self) -> Result<String, PaymentError> {
            Ok("FFFF9876543210E00001".into())
        }

        fn derive_transaction_key(&self) -> Result<[u8; 16], PaymentError> {
            Ok([0x11; 16])
        }
    }

    fn terminal_config(cvm_configs: Vec<CvmConfig>) -> Arc<TerminalConfig> {
        Arc::new(TerminalConfig {
            merchant_id: "000000000000001".into(),
            terminal_id: "TERM0001".into(),
            emv_configs: vec![],
            cvm_configs,
            initial_ksn: "FFFF9876543210E00000".into(),
            bdk_index: 0,
            stored_value: StoredValueConfig::default(),
        })
    }

    fn session_with(kernel: Arc<MockKernel>, pad_result: PinPadResult) -> KernelSession {
        KernelSession::new(
            kernel,
            Arc::new(MockPinPad { result: pad_result }),
            Arc::new(MockSecure),
            terminal_config(vec![]),
            CardMode::Chip,
            TransactionContext::new(100_000),
            Arc::new(AtomicBool::new(true)),
        )
    }

    fn drive_to_pin(session: &mut KernelSession) {
        assert_eq!(
            session.handle(KernelEvent::WaitAppSelect {
                candidates: vec!["A0000000031010".into()]
            }),
            SessionUpdate::Continue
        );
        assert_eq!(
            session.handle(KernelEvent::AppFinalSelect {
                aid: "A0000000031010".into()
            }),
            SessionUpdate::Continue
        );
        assert_eq!(
            session.handle(KernelEvent::ConfirmCardNo {
                pan: "4111111111111111".into()
            }),
            SessionUpdate::Continue
        );
    }

    #[test]
    fn test_full_approved_flow() {
        let kernel = Arc::new(MockKernel::default());
        let mut session = session_with(
            kernel.clone(),
            PinPadResult::Confirmed {
                pin: "1234".into(),
                pin_block: None,
            },
        );

        drive_to_pin(&mut session);
        assert_eq!(
            session.handle(KernelEvent::RequestShowPinPad {
                is_online_pin: true,
                retry_times: 0
            }),
            SessionUpdate::Continue
        );
        assert_eq!(
            session.handle(KernelEvent::TerminalRiskManagement),
            SessionUpdate::Continue
        );
        assert_eq!(session.handle(KernelEvent::OnlineProc), SessionUpdate::Continue);
        assert_eq!(
            session.handle(KernelEvent::TransResult {
                code: 2,
                message: "online approved".into()
            }),
            SessionUpdate::Finished(Ok(()))
        );

        // PIN block and KSN landed in the context
        assert!(session.pin_block().is_some());
        assert_eq!(session.ksn(), Some("FFFF9876543210E00001"));

        let imports = kernel.imports.lock().unwrap();
        assert_eq!(
            *imports,
            vec![
                ("app_select", STATUS_OK),
                ("app_select", STATUS_OK),
                ("card_confirm", STATUS_OK),
                ("pin_input", STATUS_OK),
                ("online_proc", STATUS_OK),
            ]
        );
    }

    #[test]
    fn test_pin_cancel_acks_status_1() {
        let kernel = Arc::new(MockKernel::default());
        let mut session = session_with(kernel.clone(), PinPadResult::Cancelled);

        drive_to_pin(&mut session);
        session.handle(KernelEvent::RequestShowPinPad {
            is_online_pin: true,
            retry_times: 0,
        });

        let imports = kernel.imports.lock().unwrap();
        assert!(imports.contains(&("pin_input", STATUS_CANCEL)));
        assert!(session.pin_block().is_none());
    }

    #[test]
    fn test_pin_before_card_confirm_acks_status_3() {
        let kernel = Arc::new(MockKernel::default());
        let mut session = session_with(
            kernel.clone(),
            PinPadResult::Confirmed {
                pin: "1234".into(),
                pin_block: None,
            },
        );

        // No ConfirmCardNo first: block construction has no PAN
        session.handle(KernelEvent::RequestShowPinPad {
            is_online_pin: true,
            retry_times: 0,
        });
        let imports = kernel.imports.lock().unwrap();
        assert!(imports.contains(&("pin_input", STATUS_ERROR)));
    }

    #[test]
    fn test_app_select_ack_failure_is_no_app() {
        let kernel = Arc::new(MockKernel {
            fail_app_select: true,
            ..MockKernel::default()
        });
        let mut session = session_with(kernel, PinPadResult::Cancelled);
        match session.handle(KernelEvent::WaitAppSelect { candidates: vec![] }) {
            SessionUpdate::Finished(Err(e)) => assert_eq!(e.kind(), ErrorKind::EmvNoApp),
            other => panic!("expected EmvNoApp, got {other:?}"),
        }
    }

    #[test]
    fn test_pin_ack_failure_is_sdk_init() {
        let kernel = Arc::new(MockKernel {
            fail_pin_import: true,
            ..MockKernel::default()
        });
        let mut session = session_with(
            kernel,
            PinPadResult::Confirmed {
                pin: "1234".into(),
                pin_block: None,
            },
        );
        drive_to_pin(&mut session);
        match session.handle(KernelEvent::RequestShowPinPad {
            is_online_pin: true,
            retry_times: 0,
        }) {
            SessionUpdate::Finished(Err(e)) => assert_eq!(e.kind(), ErrorKind::SdkInitFailed),
            other => panic!("expected SdkInitFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_online_proc_always_approves() {
        let kernel = Arc::new(MockKernel::default());
        let mut session = session_with(kernel.clone(), PinPadResult::Cancelled);
        session.handle(KernelEvent::OnlineProc);
        let imports = kernel.imports.lock().unwrap();
        assert_eq!(*imports, vec![("online_proc", STATUS_OK)]);
    }

    #[test]
    fn test_trans_result_error_maps_through_taxonomy() {
        let kernel = Arc::new(MockKernel::default());
        let mut session = session_with(kernel, PinPadResult::Cancelled);
        match session.handle(KernelEvent::TransResult {
            code: -6,
            message: "blocked".into(),
        }) {
            SessionUpdate::Finished(Err(e)) => {
                assert_eq!(e.kind(), ErrorKind::CardBlocked);
                assert_eq!(e.code(), Some(-6));
            }
            other => panic!("expected CardBlocked, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_trans_result_keeps_kernel_message() {
        let kernel = Arc::new(MockKernel::default());
        let mut session = session_with(kernel, PinPadResult::Cancelled);
        match session.handle(KernelEvent::TransResult {
            code: -77,
            message: "weird vendor state".into(),
        }) {
            SessionUpdate::Finished(Err(e)) => {
                assert_eq!(e.kind(), ErrorKind::Unknown);
                assert!(e.message().contains("weird vendor state"));
            }
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn test_events_after_cancel_are_ignored() {
        let kernel = Arc::new(MockKernel::default());
        let active = Arc::new(AtomicBool::new(true));
        let mut session = KernelSession::new(
            kernel.clone(),
            Arc::new(MockPinPad {
                result: PinPadResult::Cancelled,
            }),
            Arc::new(MockSecure),
            terminal_config(vec![]),
            CardMode::Chip,
            TransactionContext::new(100_000),
            active.clone(),
        );

        active.store(false, Ordering::SeqCst);
        assert_eq!(
            session.handle(KernelEvent::OnlineProc),
            SessionUpdate::Ignored
        );
        assert_eq!(
            session.handle(KernelEvent::TransResult {
                code: 0,
                message: String::new()
            }),
            SessionUpdate::Ignored
        );
        assert!(kernel.imports.lock().unwrap().is_empty());
    }

    #[test]
    fn test_events_after_final_result_are_ignored() {
        let kernel = Arc::new(MockKernel::default());
        let mut session = session_with(kernel.clone(), PinPadResult::Cancelled);
        session.handle(KernelEvent::TransResult {
            code: 0,
            message: String::new(),
        });
        assert_eq!(
            session.handle(KernelEvent::OnlineProc),
            SessionUpdate::Ignored
        );
    }

    #[test]
    fn test_pin_bypass_acks_ok_without_block() {
        let kernel = Arc::new(MockKernel::default());
        let mut session = session_with(kernel.clone(), PinPadResult::Bypassed);
        drive_to_pin(&mut session);
        session.handle(KernelEvent::RequestShowPinPad {
            is_online_pin: true,
            retry_times: 0,
        });
        assert!(session.pin_block().is_none());
        let imports = kernel.imports.lock().unwrap();
        assert!(imports.contains(&("pin_input", STATUS_OK)));
    }

    #[test]
    fn test_pad_built_block_is_kept() {
        // Pad with on-device block support: empty clear PIN, block handed
        // over already encrypted.
        let kernel = Arc::new(MockKernel::default());
        let mut session = session_with(
            kernel.clone(),
            PinPadResult::Confirmed {
                pin: String::new(),
                pin_block: Some("a1b2c3d4e5f60718".into()),
            },
        );
        drive_to_pin(&mut session);
        session.handle(KernelEvent::RequestShowPinPad {
            is_online_pin: true,
            retry_times: 0,
        });
        assert_eq!(session.pin_block(), Some("A1B2C3D4E5F60718"));
        assert_eq!(session.ksn(), Some("FFFF9876543210E00001"));
        let imports = kernel.imports.lock().unwrap();
        assert!(imports.contains(&("pin_input", STATUS_OK)));
    }

    #[test]
    fn test_confirm_without_pin_or_block_acks_status_3() {
        let kernel = Arc::new(MockKernel::default());
        let mut session = session_with(
            kernel.clone(),
            PinPadResult::Confirmed {
                pin: String::new(),
                pin_block: None,
            },
        );
        drive_to_pin(&mut session);
        session.handle(KernelEvent::RequestShowPinPad {
            is_online_pin: true,
            retry_times: 0,
        });
        assert!(session.pin_block().is_none());
        assert!(session.ksn().is_none());
        let imports = kernel.imports.lock().unwrap();
        assert!(imports.contains(&("pin_input", STATUS_ERROR)));
    }

    #[test]
    fn test_bypass_refused_when_cvm_requires_pin() {
        // Amount 100_000 sits above the configured PIN limit, so the
        // cardholder may not skip PIN entry.
        let kernel = Arc::new(MockKernel::default());
        let mut session = KernelSession::new(
            kernel.clone(),
            Arc::new(MockPinPad {
                result: PinPadResult::Bypassed,
            }),
            Arc::new(MockSecure),
            terminal_config(vec![CvmConfig {
                brand: CardBrand::Visa,
                entry_mode: CardMode::Chip,
                no_cvm_limit: 10_000,
                signature_limit: 20_000,
                pin_limit: 50_000,
            }]),
            CardMode::Chip,
            TransactionContext::new(100_000),
            Arc::new(AtomicBool::new(true)),
        );
        drive_to_pin(&mut session);
        session.handle(KernelEvent::RequestShowPinPad {
            is_online_pin: true,
            retry_times: 0,
        });
        let imports = kernel.imports.lock().unwrap();
        assert!(imports.contains(&("pin_input", STATUS_ERROR)));
    }
}
