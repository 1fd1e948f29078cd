//! Top-level card processor manager.
//!
//! Owns the hardware handles, arbitrates one transaction at a time,
//! runs card detection on a background worker and routes the detection
//! to the processor for that read path. The integrating shell calls
//! [`CardProcessorManager::start_processing`] and hears back exactly
//! once through the completion callback.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::TerminalConfig;
use crate::context::PaymentResult;
use crate::error::{ErrorKind, PaymentError};
use crate::hardware::{
    CardDetection, CardReader, CardTypeMask, EmvKernel, MifareReader, PinInput, PinPad,
    SecureModule,
};
use crate::kernel::KernelEvent;
use crate::processors::{
    CardProcessor, ChipProcessor, CompletionCallback, ContactlessProcessor, MagneticProcessor,
    PaymentRequest, StoredValueProcessor,
};

// ---------------------------------------------------------------------------
// Hardware handles
// ---------------------------------------------------------------------------

/// Already-open driver handles, acquired once by the shell and shared
/// read-only with every processor for the manager's lifetime.
#[derive(Clone)]
pub struct HardwareHandles {
    pub reader: Arc<dyn CardReader>,
    pub kernel: Arc<dyn EmvKernel>,
    pub pin_pad: Arc<dyn PinPad>,
    pub secure: Arc<dyn SecureModule>,
    pub mifare: Arc<dyn MifareReader>,
    pub pin_input: Arc<dyn PinInput>,
}

// ---------------------------------------------------------------------------
// Manager state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
    Disconnected,
    Connecting,
    Ready,
    Busy,
}

/// Which processor currently owns the transaction; kernel events are
/// routed here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActiveRoute {
    Chip,
    Contactless,
    Magnetic,
    StoredValue,
    /// Detection worker still polling for a card.
    Detecting,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

const DEFAULT_DETECT_TIMEOUT_SECS: u32 = 30;

/// Shared state behind the manager facade; the detection worker and
/// completion callbacks hold `Arc` clones of this.
struct Core {
    state: Mutex<ManagerState>,
    route: Mutex<Option<ActiveRoute>>,
    reader: Arc<dyn CardReader>,
    kernel: Arc<dyn EmvKernel>,
    chip: Arc<ChipProcessor>,
    contactless: Arc<ContactlessProcessor>,
    magnetic: Arc<MagneticProcessor>,
    stored_value: Arc<StoredValueProcessor>,
    secure: Arc<dyn SecureModule>,
    config: Arc<TerminalConfig>,
    /// Transactions accepted since connect, for log correlation.
    accepted: AtomicU32,
}

pub struct CardProcessorManager {
    core: Arc<Core>,
    detect_timeout_secs: u32,
}

impl CardProcessorManager {
    /// Build the manager and its processors around the shared handles.
    /// Starts disconnected; call [`connect`](Self::connect) before use.
    pub fn new(handles: HardwareHandles, config: TerminalConfig) -> Self {
        let config = Arc::new(config);
        let sv = &config.stored_value;
        let stored_value = Arc::new(StoredValueProcessor::new(
            handles.mifare.clone(),
            handles.pin_input.clone(),
            sv.key_a,
            sv.require_pin,
        ));
        let core = Core {
            state: Mutex::new(ManagerState::Disconnected),
            route: Mutex::new(None),
            chip: Arc::new(ChipProcessor::new(
                handles.kernel.clone(),
                handles.pin_pad.clone(),
                handles.secure.clone(),
                config.clone(),
            )),
            contactless: Arc::new(ContactlessProcessor::new(
                handles.kernel.clone(),
                handles.pin_pad.clone(),
                handles.secure.clone(),
                config.clone(),
            )),
            magnetic: Arc::new(MagneticProcessor::new(config.clone())),
            stored_value,
            reader: handles.reader,
            kernel: handles.kernel,
            secure: handles.secure,
            config,
            accepted: AtomicU32::new(0),
        };
        Self {
            core: Arc::new(core),
            detect_timeout_secs: DEFAULT_DETECT_TIMEOUT_SECS,
        }
    }

    pub fn with_detect_timeout(mut self, secs: u32) -> Self {
        self.detect_timeout_secs = secs;
        self
    }

    pub fn state(&self) -> ManagerState {
        *self.core.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &TerminalConfig {
        &self.core.config
    }

    /// Bring the manager up. Probes the secure module as a liveness
    /// check and loads the per-brand EMV parameters into the kernel;
    /// the handles themselves were opened by the shell.
    pub fn connect(&self) -> Result<(), PaymentError> {
        let core = &self.core;
        let mut state = core.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            ManagerState::Disconnected => {}
            ManagerState::Connecting => {
                return Err(PaymentError::new(
                    ErrorKind::Busy,
                    "connect already in progress",
                ))
            }
            ManagerState::Ready | ManagerState::Busy => return Ok(()),
        }
        *state = ManagerState::Connecting;
        drop(state);

        let ksn = match core.secure.current_ksn() {
            Ok(ksn) => ksn,
            Err(e) => {
                warn!(error = %e, "secure module probe failed");
                *core.state.lock().unwrap_or_else(|e| e.into_inner()) =
                    ManagerState::Disconnected;
                return Err(PaymentError::new(
                    ErrorKind::ServiceNotConnected,
                    format!("secure module probe failed: {e}"),
                ));
            }
        };

        for brand_config in &core.config.emv_configs {
            if let Err(e) = core.kernel.load_brand_config(brand_config) {
                warn!(brand = ?brand_config.brand, error = %e, "brand config load failed");
                *core.state.lock().unwrap_or_else(|e| e.into_inner()) =
                    ManagerState::Disconnected;
                return Err(PaymentError::new(
                    ErrorKind::ServiceNotConnected,
                    format!("loading {:?} EMV parameters failed: {e}", brand_config.brand),
                ));
            }
            debug!(brand = ?brand_config.brand, "brand EMV parameters loaded");
        }

        info!(merchant_id = %core.config.merchant_id, %ksn, "card engine connected");
        *core.state.lock().unwrap_or_else(|e| e.into_inner()) = ManagerState::Ready;
        Ok(())
    }

    /// Start one transaction: detect a card matching `allowed`, route it
    /// to the processor for its read path, and deliver exactly one
    /// result through `on_complete`.
    ///
    /// A start while another transaction is in flight fails immediately
    /// with `Busy`; it is never queued.
    pub fn start_processing(
        &self,
        request: PaymentRequest,
        allowed: CardTypeMask,
        on_complete: CompletionCallback,
    ) {
        let core = &self.core;
        {
            let mut state = core.state.lock().unwrap_or_else(|e| e.into_inner());
            match *state {
                ManagerState::Ready => *state = ManagerState::Busy,
                ManagerState::Busy => {
                    drop(state);
                    on_complete(Err(PaymentError::new(
                        ErrorKind::Busy,
                        "a transaction is already in flight",
                    )));
                    return;
                }
                ManagerState::Disconnected | ManagerState::Connecting => {
                    drop(state);
                    on_complete(Err(PaymentError::new(
                        ErrorKind::ServiceNotConnected,
                        "card engine is not connected",
                    )));
                    return;
                }
            }
        }
        *core.route.lock().unwrap_or_else(|e| e.into_inner()) = Some(ActiveRoute::Detecting);

        let seq = core.accepted.fetch_add(1, Ordering::SeqCst) + 1;
        info!(seq, amount = request.amount, mask = allowed.0, "transaction accepted");

        let core = Arc::clone(core);
        let timeout = self.detect_timeout_secs;
        thread::spawn(move || {
            let detected = core.reader.check_card(allowed, timeout);
            Core::route_detection(&core, detected, allowed, request, on_complete);
        });
    }

    /// Forward one kernel callback to the processor driving the
    /// transaction. Events with no active EMV session are dropped.
    pub fn handle_kernel_event(&self, event: KernelEvent) {
        let route = *self.core.route.lock().unwrap_or_else(|e| e.into_inner());
        match route {
            Some(ActiveRoute::Chip) => self.core.chip.handle_kernel_event(event),
            Some(ActiveRoute::Contactless) => self.core.contactless.handle_kernel_event(event),
            _ => debug!(?event, "kernel event with no EMV transaction, dropping"),
        }
    }

    /// Cancel whatever is in flight: card detection or an active
    /// processor run. Idempotent; safe from any thread.
    pub fn cancel(&self) {
        let core = &self.core;
        let route = *core.route.lock().unwrap_or_else(|e| e.into_inner());
        match route {
            Some(ActiveRoute::Detecting) => {
                info!("cancelling card detection");
                core.reader.cancel_check_card();
            }
            Some(ActiveRoute::Chip) => core.chip.cancel_processing(),
            Some(ActiveRoute::Contactless) => core.contactless.cancel_processing(),
            Some(ActiveRoute::Magnetic) => core.magnetic.cancel_processing(),
            Some(ActiveRoute::StoredValue) => core.stored_value.cancel_processing(),
            None => debug!("cancel with nothing in flight"),
        }
    }

    /// Cancel any in-flight work and drop to disconnected. The handles
    /// stay open; they belong to the shell.
    pub fn shutdown(&self) {
        self.cancel();
        *self.core.state.lock().unwrap_or_else(|e| e.into_inner()) = ManagerState::Disconnected;
        info!("card engine shut down");
    }
}

impl Core {
    fn route_detection(
        core: &Arc<Core>,
        detected: Result<CardDetection, PaymentError>,
        allowed: CardTypeMask,
        request: PaymentRequest,
        on_complete: CompletionCallback,
    ) {
        let detection = match detected {
            Ok(d) => d,
            Err(e) => {
                core.finish(Err(e), on_complete);
                return;
            }
        };

        let bit = detection.type_bit();
        if !allowed.contains(bit) {
            core.finish(
                Err(PaymentError::new(
                    ErrorKind::MalformedCard,
                    format!("detected card type {:#04x} is not accepted here", bit.0),
                )),
                on_complete,
            );
            return;
        }

        let (route, processor): (ActiveRoute, Arc<dyn CardProcessor>) = match &detection {
            CardDetection::Chip { .. } => (ActiveRoute::Chip, core.chip.clone()),
            CardDetection::Contactless { .. } => {
                (ActiveRoute::Contactless, core.contactless.clone())
            }
            CardDetection::Magnetic { .. } => (ActiveRoute::Magnetic, core.magnetic.clone()),
            CardDetection::StoredValue { .. } => {
                (ActiveRoute::StoredValue, core.stored_value.clone())
            }
        };
        debug!(?route, "card detected, routing");
        *core.route.lock().unwrap_or_else(|e| e.into_inner()) = Some(route);

        let cb_core = Arc::clone(core);
        processor.start_processing(
            &detection,
            &request,
            Box::new(move |result| cb_core.finish(result, on_complete)),
        );
    }

    /// Release the busy state and hand the terminal result to the caller.
    fn finish(&self, result: PaymentResult, on_complete: CompletionCallback) {
        self.route.lock().unwrap_or_else(|e| e.into_inner()).take();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == ManagerState::Busy {
            *state = ManagerState::Ready;
        }
        drop(state);
        on_complete(result);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
