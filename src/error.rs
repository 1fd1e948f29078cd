//! Payment error taxonomy.
//!
//! Every failure the engine can surface is one of a closed set of
//! [`ErrorKind`]s wrapped in a [`PaymentError`] carrying a technical
//! message and, where one exists, the numeric source code (kernel result
//! code, card-reader code, or ISO 8583 response code).
//!
//! The mapping functions are total: any code they do not recognize maps
//! to [`ErrorKind::Unknown`] with the code embedded in the message. No
//! numeric code goes unmapped silently.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Error kinds
// ---------------------------------------------------------------------------

/// Closed set of payment failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    // Card read failures
    ReadTimeout,
    ReadCancelled,
    CardRemoved,
    MalformedCard,

    // EMV kernel failures
    EmvTimeout,
    EmvDataInvalid,
    CardBlocked,
    TransactionDenied,
    EmvNoApp,
    UserCancelled,
    CardExpired,
    TransactionRejected,
    EmvTerminated,
    CommandTimeout,

    // Card status failures (ISO 8583 response codes)
    InsufficientFunds,
    InvalidCardNumber,
    PinTriesExceeded,
    NotPermitted,
    OverLimit,
    RestrictedCard,
    SecurityViolation,
    SuspectedFraud,

    // System failures
    SdkInitFailed,
    ServiceNotConnected,
    NotInitialized,
    PinInputFailed,
    Busy,
    Unknown,
}

impl ErrorKind {
    /// Whether re-presenting the card can plausibly succeed.
    ///
    /// Retryability is a static property of the kind: timeouts and bad
    /// reads invite a re-tap, while issuer verdicts (blocked, PIN tries
    /// exceeded, denied) are terminal for the card.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::ReadTimeout
                | ErrorKind::CardRemoved
                | ErrorKind::MalformedCard
                | ErrorKind::EmvTimeout
                | ErrorKind::EmvDataInvalid
                | ErrorKind::CommandTimeout
        )
    }
}

// ---------------------------------------------------------------------------
// PaymentError
// ---------------------------------------------------------------------------

/// A typed payment failure: taxonomy kind + technical message + optional
/// numeric source code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct PaymentError {
    kind: ErrorKind,
    message: String,
    code: Option<i32>,
}

impl PaymentError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(kind: ErrorKind, message: impl Into<String>, code: i32) -> Self {
        Self {
            kind,
            message: message.into(),
            code: Some(code),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> Option<i32> {
        self.code
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

// ---------------------------------------------------------------------------
// Code mappings
// ---------------------------------------------------------------------------

/// Reader codes the detection layer reports for a failed check-card call.
pub const CARD_READ_CODES: &[i32] = &[1, 2, 3, 4, 5];

/// Kernel result codes for a failed transact-process run. Codes 0/1/2 are
/// the approval family and never reach this mapping.
pub const EMV_RESULT_CODES: &[i32] = &[-1, -2, -3, -4, -5, -6, -7, -8, -9, -10];

/// ISO 8583 response codes the taxonomy recognizes.
pub const ISO_RESPONSE_CODES: &[&str] = &[
    "04", "14", "33", "36", "38", "41", "43", "51", "54", "57", "58", "59", "61", "62", "63",
    "65", "75", "78",
];

/// Map a card-reader detection code to a typed error.
pub fn from_card_read_code(code: i32) -> PaymentError {
    let (kind, message) = match code {
        1 => (ErrorKind::ReadTimeout, "card detection timed out"),
        2 => (ErrorKind::ReadCancelled, "card detection cancelled"),
        3 => (ErrorKind::CardRemoved, "card removed during read"),
        4 => (ErrorKind::MalformedCard, "unreadable or malformed card data"),
        5 => (ErrorKind::MalformedCard, "swipe error, bad track data"),
        other => {
            return PaymentError::with_code(
                ErrorKind::Unknown,
                format!("unrecognized card read code {other}"),
                other,
            )
        }
    };
    PaymentError::with_code(kind, message, code)
}

/// Map an EMV kernel result code to a typed error.
pub fn from_emv_result(code: i32) -> PaymentError {
    let (kind, message) = match code {
        -1 => (ErrorKind::EmvTimeout, "kernel transaction timed out"),
        -2 => (ErrorKind::UserCancelled, "cardholder cancelled transaction"),
        -3 => (ErrorKind::EmvTerminated, "kernel terminated transaction"),
        -4 => (ErrorKind::EmvDataInvalid, "card returned invalid EMV data"),
        -5 => (ErrorKind::EmvNoApp, "no mutually supported application"),
        -6 => (ErrorKind::CardBlocked, "card or application blocked"),
        -7 => (ErrorKind::TransactionDenied, "transaction denied by card"),
        -8 => (ErrorKind::CardExpired, "card expired"),
        -9 => (ErrorKind::TransactionRejected, "transaction rejected"),
        -10 => (ErrorKind::CommandTimeout, "card command timed out"),
        other => {
            return PaymentError::with_code(
                ErrorKind::Unknown,
                format!("unrecognized EMV result code {other}"),
                other,
            )
        }
    };
    PaymentError::with_code(kind, message, code)
}

/// Map a two-digit ISO 8583 response code to a typed error.
pub fn from_iso_response(code: &str) -> PaymentError {
    let (kind, message) = match code {
        "04" | "78" => (ErrorKind::CardBlocked, "card blocked by issuer"),
        "14" => (ErrorKind::InvalidCardNumber, "invalid card number"),
        "33" | "54" => (ErrorKind::CardExpired, "expired card"),
        "36" | "62" => (ErrorKind::RestrictedCard, "restricted card"),
        "38" | "75" => (ErrorKind::PinTriesExceeded, "allowable PIN tries exceeded"),
        "41" => (ErrorKind::SuspectedFraud, "lost card, pick up"),
        "43" => (ErrorKind::SuspectedFraud, "stolen card, pick up"),
        "51" => (ErrorKind::InsufficientFunds, "insufficient funds"),
        "57" => (ErrorKind::NotPermitted, "transaction not permitted to cardholder"),
        "58" => (ErrorKind::NotPermitted, "transaction not permitted to terminal"),
        "59" => (ErrorKind::SuspectedFraud, "suspected fraud"),
        "61" => (ErrorKind::OverLimit, "exceeds withdrawal amount limit"),
        "63" => (ErrorKind::SecurityViolation, "security violation"),
        "65" => (ErrorKind::OverLimit, "exceeds withdrawal frequency limit"),
        other => {
            return PaymentError::new(
                ErrorKind::Unknown,
                format!("unrecognized response code {other}"),
            )
        }
    };
    PaymentError::new(kind, format!("{message} ({code})"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
