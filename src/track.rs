//! Magnetic-stripe track parsing (ISO 7811 Track 1/2).
//!
//! Track data reaches the engine either as plain ASCII from a stripe read
//! or hex-encoded as the Track-2-equivalent EMV tag (57), where the field
//! separator is the nibble `D`. Both spellings are accepted.
//!
//! The stripe carries expiry as `YYMM`; the rest of the engine (and the
//! downstream sale payload) uses `MMyy`. The swap happens here and only
//! here — downstream expiry validation depends on it.

use crate::error::{ErrorKind, PaymentError};

// ---------------------------------------------------------------------------
// Parsed track data
// ---------------------------------------------------------------------------

/// Fields extracted from a magnetic track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackData {
    /// Primary account number, 13-19 digits.
    pub pan: String,
    /// Expiry in canonical `MMyy` form.
    pub expiry: String,
    /// Three-digit service code, when present.
    pub service_code: Option<String>,
    /// Issuer discretionary data after the service code.
    pub discretionary: String,
}

// ---------------------------------------------------------------------------
// Track 2
// ---------------------------------------------------------------------------

/// Parse Track 2 (or Track-2-equivalent) data.
///
/// Splits on `=`, `D`, or `d`; the first field is the PAN (13-19 numeric
/// digits), the second starts with `YYMM` expiry. An out-of-range month is
/// a hard failure, never silently defaulted.
pub fn parse_track2(raw: &str) -> Result<TrackData, PaymentError> {
    let raw = raw.trim().trim_start_matches(';').trim_end_matches('?');
    let sep = raw
        .find(|c| c == '=' || c == 'D' || c == 'd')
        .ok_or_else(|| {
            PaymentError::new(ErrorKind::MalformedCard, "track2 has no field separator")
        })?;

    let pan = &raw[..sep];
    validate_pan(pan)?;

    let tail = &raw[sep + 1..];
    let expiry = convert_expiry(tail)?;

    let service_code = tail
        .get(4..7)
        .filter(|s| s.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string);
    // Trailing F nibbles are padding in the hex-encoded spelling.
    let discretionary = tail.get(7..).unwrap_or("").trim_end_matches(['F', 'f']).to_string();

    Ok(TrackData {
        pan: pan.to_string(),
        expiry,
        service_code,
        discretionary,
    })
}

// ---------------------------------------------------------------------------
// Track 1
// ---------------------------------------------------------------------------

/// Parse Track 1 data (`%B<pan>^<name>^YYMM<service>...`).
///
/// Same PAN and expiry rules as Track 2; the cardholder name field is
/// skipped, the engine never uses it.
pub fn parse_track1(raw: &str) -> Result<TrackData, PaymentError> {
    let raw = raw.trim().trim_end_matches('?');
    let body = raw
        .strip_prefix("%B")
        .or_else(|| raw.strip_prefix("%b"))
        .or_else(|| raw.strip_prefix('B'))
        .unwrap_or(raw);

    let mut fields = body.split('^');
    let pan = fields.next().unwrap_or("");
    validate_pan(pan)?;
    let _name = fields.next().ok_or_else(|| {
        PaymentError::new(ErrorKind::MalformedCard, "track1 missing name field")
    })?;
    let tail = fields.next().ok_or_else(|| {
        PaymentError::new(ErrorKind::MalformedCard, "track1 missing expiry field")
    })?;

    let expiry = convert_expiry(tail)?;
    let service_code = tail
        .get(4..7)
        .filter(|s| s.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string);

    Ok(TrackData {
        pan: pan.to_string(),
        expiry,
        service_code,
        discretionary: tail.get(7..).unwrap_or("").to_string(),
    })
}

// ---------------------------------------------------------------------------
// Field validation
// ---------------------------------------------------------------------------

fn validate_pan(pan: &str) -> Result<(), PaymentError> {
    if !(13..=19).contains(&pan.len()) {
        return Err(PaymentError::new(
            ErrorKind::MalformedCard,
            format!("PAN length {} outside 13-19", pan.len()),
        ));
    }
    if !pan.chars().all(|c| c.is_ascii_digit()) {
        return Err(PaymentError::new(
            ErrorKind::MalformedCard,
            "PAN contains non-digit characters",
        ));
    }
    Ok(())
}

/// Convert the leading `YYMM` of a track tail to canonical `MMyy`.
fn convert_expiry(tail: &str) -> Result<String, PaymentError> {
    let yymm = tail.get(..4).ok_or_else(|| {
        PaymentError::new(ErrorKind::MalformedCard, "track expiry shorter than 4 chars")
    })?;
    if !yymm.chars().all(|c| c.is_ascii_digit()) {
        return Err(PaymentError::new(
            ErrorKind::MalformedCard,
            "track expiry is not numeric",
        ));
    }
    let (yy, mm) = yymm.split_at(2);
    let month: u32 = mm.parse().unwrap_or(0);
    if !(1..=12).contains(&month) {
        return Err(PaymentError::new(
            ErrorKind::MalformedCard,
            format!("invalid expiry month {mm}"),
        ));
    }
    Ok(format!("{mm}{yy}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
