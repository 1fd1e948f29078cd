//! ISO 9564 format-0 PIN block construction.
//!
//! The PIN pad hands the engine a confirmed PIN; this module folds it with
//! the PAN into a clear format-0 block and encrypts it with the
//! per-transaction key derived by the secure module (two-key triple-length
//! material, expanded to K1 || K2 || K1). Single unpadded TDES block, no
//! chaining.
//!
//! The key-serial-number is read from the secure module only *after* the
//! PIN is confirmed — the kernel session enforces the ordering so the KSN
//! always corresponds to the key that actually encrypted the block.
//!
//! All intermediate PIN material is zeroized before returning.

use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockEncrypt, KeyInit};
use des::TdesEde3;
use zeroize::Zeroize;

use crate::error::{ErrorKind, PaymentError};

// ---------------------------------------------------------------------------
// PIN block
// ---------------------------------------------------------------------------

/// Build and encrypt an ISO 9564 format-0 PIN block.
///
/// Preconditions: PIN is 4-12 numeric digits, PAN is at least 13 digits,
/// key is exactly 16 bytes. Violations return typed errors; internal
/// length mismatches past validation are programming errors and assert.
pub fn build_pin_block(pin: &str, pan: &str, key: &[u8]) -> Result<[u8; 8], PaymentError> {
    if key.len() != 16 {
        return Err(PaymentError::new(
            ErrorKind::SdkInitFailed,
            format!("PIN key must be 16 bytes, got {}", key.len()),
        ));
    }

    let mut clear = clear_pin_block(pin, pan)?;

    // Two-key TDES expanded to three keys: K1 || K2 || K1
    let mut full_key = [0u8; 24];
    full_key[..16].copy_from_slice(key);
    full_key[16..].copy_from_slice(&key[..8]);

    let cipher = TdesEde3::new_from_slice(&full_key).map_err(|e| {
        PaymentError::new(ErrorKind::SdkInitFailed, format!("TDES key schedule: {e}"))
    })?;

    let mut block = GenericArray::clone_from_slice(&clear);
    cipher.encrypt_block(&mut block);

    let mut out = [0u8; 8];
    out.copy_from_slice(&block);

    clear.zeroize();
    full_key.zeroize();
    Ok(out)
}

/// The 12 PAN digits folded into the PIN block: the rightmost 12 digits
/// excluding the check digit. Also handed to the PIN pad configuration.
pub fn pan_for_pin_block(pan: &str) -> Result<String, PaymentError> {
    if pan.len() < 13 || !pan.chars().all(|c| c.is_ascii_digit()) {
        return Err(PaymentError::new(
            ErrorKind::MalformedCard,
            "PAN too short for PIN block derivation",
        ));
    }
    let last13 = &pan[pan.len() - 13..];
    Ok(last13[..12].to_string())
}

/// Clear (pre-encryption) format-0 block: Part A XOR Part B.
fn clear_pin_block(pin: &str, pan: &str) -> Result<[u8; 8], PaymentError> {
    if !(4..=12).contains(&pin.len()) || !pin.chars().all(|c| c.is_ascii_digit()) {
        return Err(PaymentError::new(
            ErrorKind::PinInputFailed,
            "PIN must be 4-12 numeric digits",
        ));
    }

    // Part A: control nibble 0, PIN length nibble, PIN digits, F fill
    let mut part_a_hex = format!("0{:X}{pin}", pin.len());
    while part_a_hex.len() < 16 {
        part_a_hex.push('F');
    }

    // Part B: 0000 then the 12 PAN digits
    let mut part_b_hex = format!("0000{}", pan_for_pin_block(pan)?);

    let mut part_a = [0u8; 8];
    let mut part_b = [0u8; 8];
    hex::decode_to_slice(&part_a_hex, &mut part_a)
        .expect("part A is always 16 hex chars");
    hex::decode_to_slice(&part_b_hex, &mut part_b)
        .expect("part B is always 16 hex chars");

    let mut clear = [0u8; 8];
    for i in 0..8 {
        clear[i] = part_a[i] ^ part_b[i];
    }

    part_a_hex.zeroize();
    part_b_hex.zeroize();
    part_a.zeroize();
    part_b.zeroize();
    Ok(clear)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
