//! Magnetic stripe processor.
//!
//! Fully synchronous: the swipe already delivered the track data, so
//! there is no kernel session to run. Track 2 is authoritative; track 1
//! is a fallback and a name source, track 3 is carried through untouched.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::TerminalConfig;
use crate::context::{format_amount, CardMode, SaleRequest};
use crate::error::{ErrorKind, PaymentError};
use crate::hardware::CardDetection;
use crate::processors::{
    self, CardProcessor, CompletionCallback, CompletionSlot, PaymentRequest,
};
use crate::track;

pub struct MagneticProcessor {
    config: Arc<TerminalConfig>,
    slot: CompletionSlot,
}

impl MagneticProcessor {
    pub fn new(config: Arc<TerminalConfig>) -> Self {
        Self {
            config,
            slot: CompletionSlot::new(),
        }
    }

    fn build_sale(
        &self,
        detection: &CardDetection,
        request: &PaymentRequest,
    ) -> Result<SaleRequest, PaymentError> {
        let (track1, track2, track3) = match detection {
            CardDetection::Magnetic {
                track1,
                track2,
                track3,
            } => (track1.clone(), track2.clone(), track3.clone()),
            other => return Err(processors::wrong_detection("magnetic", other)),
        };

        let parsed = match track2.as_deref() {
            Some(raw) => track::parse_track2(raw)?,
            None => {
                let raw = track1.as_deref().ok_or_else(|| {
                    PaymentError::new(ErrorKind::MalformedCard, "swipe produced no track data")
                })?;
                warn!("no track 2, falling back to track 1");
                track::parse_track1(raw)?
            }
        };

        let mut sale = SaleRequest::new(
            CardMode::Magnetic,
            parsed.pan,
            parsed.expiry,
            format_amount(request.amount),
        );
        sale.track1 = track1;
        sale.track2 = track2;
        sale.track3 = track3;
        // Swipes never collect a PIN here; CVM comes down to signature.
        sale.signature_required = self
            .config
            .cvm_config_for(sale.brand, CardMode::Magnetic)
            .map(|cvm| cvm.requires_signature(request.amount))
            .unwrap_or(false);
        Ok(sale)
    }
}

impl CardProcessor for MagneticProcessor {
    fn start_processing(
        &self,
        detection: &CardDetection,
        request: &PaymentRequest,
        on_complete: CompletionCallback,
    ) {
        if !self.slot.try_begin(on_complete) {
            return;
        }
        info!(amount = request.amount, "magnetic swipe processing");
        self.slot.complete(self.build_sale(detection, request));
    }

    fn cancel_processing(&self) {
        // Synchronous path; by the time cancel can be observed the result
        // was already delivered.
        if self.slot.deactivate() {
            self.slot.complete(Err(PaymentError::new(
                ErrorKind::UserCancelled,
                "magnetic processing cancelled",
            )));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brand::CardBrand;
    use crate::config::{CvmConfig, StoredValueConfig};
    use crate::context::PaymentResult;
    use std::sync::mpsc;

    fn terminal_config(cvm_configs: Vec<CvmConfig>) -> Arc<TerminalConfig> {
        Arc::new(TerminalConfig {
            merchant_id: "M1".into(),
            terminal_id: "T1".into(),
            emv_configs: vec![],
            cvm_configs,
            initial_ksn: "FFFF9876543210E00000".into(),
            bdk_index: 0,
            stored_value: StoredValueConfig::default(),
        })
    }

    fn run_with(config: Arc<TerminalConfig>, detection: CardDetection) -> PaymentResult {
        let proc = MagneticProcessor::new(config);
        let (tx, rx) = mpsc::channel::<PaymentResult>();
        let request = PaymentRequest {
            amount: 100_000,
            merchant_id: "M1".into(),
            terminal_id: "T1".into(),
        };
        proc.start_processing(&detection, &request, Box::new(move |r| tx.send(r).unwrap()));
        rx.recv().unwrap()
    }

    fn run(detection: CardDetection) -> PaymentResult {
        run_with(terminal_config(vec![]), detection)
    }

    #[test]
    fn test_swipe_with_track2() {
        let sale = run(CardDetection::Magnetic {
            track1: None,
            track2: Some(";4111111111111111=25122011234567890?".into()),
            track3: None,
        })
        .unwrap();
        assert_eq!(sale.pan, "4111111111111111");
        assert_eq!(sale.expiry, "1225");
        assert_eq!(sale.brand, CardBrand::Visa);
        assert_eq!(sale.pos_entry_mode, "90");
        assert_eq!(sale.amount, "000000100000");
        assert_eq!(
            sale.track2.as_deref(),
            Some(";4111111111111111=25122011234567890?")
        );
    }

    #[test]
    fn test_swipe_falls_back_to_track1() {
        let sale = run(CardDetection::Magnetic {
            track1: Some("%B4111111111111111^DOE/JANE^25121010000000000?".into()),
            track2: None,
            track3: None,
        })
        .unwrap();
        assert_eq!(sale.pan, "4111111111111111");
        assert_eq!(sale.expiry, "1225");
    }

    #[test]
    fn test_swipe_without_tracks_is_malformed() {
        let err = run(CardDetection::Magnetic {
            track1: None,
            track2: None,
            track3: None,
        })
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedCard);
    }

    #[test]
    fn test_garbled_track2_is_malformed() {
        let err = run(CardDetection::Magnetic {
            track1: None,
            track2: Some(";41x111=9913?".into()),
            track3: None,
        })
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedCard);
    }

    #[test]
    fn test_swipe_in_signature_band_sets_flag() {
        let config = terminal_config(vec![CvmConfig {
            brand: CardBrand::Visa,
            entry_mode: CardMode::Magnetic,
            no_cvm_limit: 10_000,
            signature_limit: 20_000,
            pin_limit: 500_000,
        }]);
        let sale = run_with(
            config,
            CardDetection::Magnetic {
                track1: None,
                track2: Some(";4111111111111111=25122011234567890?".into()),
                track3: None,
            },
        )
        .unwrap();
        assert!(sale.signature_required);
    }

    #[test]
    fn test_track3_carried_through() {
        let sale = run(CardDetection::Magnetic {
            track1: None,
            track2: Some("4111111111111111=2512201".into()),
            track3: Some("011234567890".into()),
        })
        .unwrap();
        assert_eq!(sale.track3.as_deref(), Some("011234567890"));
    }
}
