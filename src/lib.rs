//! POS card-acceptance engine core.
//!
//! Everything between "a card was presented" and "here is a normalized
//! sale payload": BER-TLV codec, track parsing, brand detection, ISO 9564
//! PIN block construction, the EMV kernel adapter state machine, one
//! processor per physical read path, and the orchestrating manager. The
//! engine holds no network or UI code; the integrating shell supplies
//! hardware handles through the traits in [`hardware`] and hears back
//! through one completion callback per transaction.
//!
//! Typical wiring:
//!
//! ```ignore
//! let manager = Arc::new(CardProcessorManager::new(handles, terminal_config));
//! manager.connect()?;
//! manager.start_processing(request, CardTypeMask::standard(), Box::new(|result| {
//!     // exactly one PaymentResult per start
//! }));
//! ```

pub mod brand;
pub mod config;
pub mod context;
pub mod error;
pub mod hardware;
pub mod kernel;
pub mod manager;
pub mod pinblock;
pub mod processors;
pub mod tlv;
pub mod track;

pub use brand::{detect_brand, CardBrand};
pub use config::{CvmConfig, EmvBrandConfig, StoredValueConfig, TerminalConfig};
pub use context::{CardMode, PaymentResult, SaleRequest};
pub use error::{ErrorKind, PaymentError};
pub use hardware::{CardDetection, CardTypeMask};
pub use kernel::KernelEvent;
pub use manager::{CardProcessorManager, HardwareHandles, ManagerState};
pub use processors::{CardProcessor, CompletionCallback, PaymentRequest};
pub use tlv::TlvMap;
