//! Parsing of Kubernetes resource quantities (`10Gi`, `500M`, `1.5Ti`, `1e9`) into bytes.
//!
//! k8s-openapi only carries quantities as opaque strings, but the storage size of a claim has to
//! be compared and turned into a transfer deadline.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::error::{KubeApiError, Result};

const BINARY_SUFFIXES: [(&str, u32); 6] = [
    ("Ki", 1),
    ("Mi", 2),
    ("Gi", 3),
    ("Ti", 4),
    ("Pi", 5),
    ("Ei", 6),
];

const DECIMAL_SUFFIXES: [(&str, u32); 6] = [
    ("k", 1),
    ("M", 2),
    ("G", 3),
    ("T", 4),
    ("P", 5),
    ("E", 6),
];

/// Number of bytes in a GiB.
pub const GIB: u128 = 1 << 30;

/// Returns the amount of bytes `quantity` stands for, rounding fractional bytes up like the
/// API server does.
pub fn parse_bytes(quantity: &str) -> Result<u128> {
    let invalid = || KubeApiError::InvalidQuantity(quantity.to_owned());
    let trimmed = quantity.trim();
    let unsigned = trimmed.strip_prefix('+').unwrap_or(trimmed);

    let number_end = unsigned
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(unsigned.len());
    let (number, suffix) = unsigned.split_at(number_end);

    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid());
    }

    let mantissa: u128 = format!("{whole}{fraction}")
        .parse()
        .map_err(|_| invalid())?;
    let mut numerator = mantissa;
    let mut denominator = 10u128
        .checked_pow(fraction.len() as u32)
        .ok_or_else(invalid)?;

    if let Some((_, power)) = BINARY_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        numerator = numerator
            .checked_mul(1024u128.pow(*power))
            .ok_or_else(invalid)?;
    } else if let Some((_, power)) = DECIMAL_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        numerator = numerator
            .checked_mul(1000u128.pow(*power))
            .ok_or_else(invalid)?;
    } else if suffix == "m" {
        denominator = denominator.checked_mul(1000).ok_or_else(invalid)?;
    } else if let Some(exponent) = suffix.strip_prefix(['e', 'E']) {
        let exponent: i32 = exponent.parse().map_err(|_| invalid())?;
        let scale = 10u128
            .checked_pow(exponent.unsigned_abs())
            .ok_or_else(invalid)?;
        if exponent >= 0 {
            numerator = numerator.checked_mul(scale).ok_or_else(invalid)?;
        } else {
            denominator = denominator.checked_mul(scale).ok_or_else(invalid)?;
        }
    } else if !suffix.is_empty() {
        return Err(invalid());
    }

    Ok(numerator.div_ceil(denominator))
}

pub fn quantity_bytes(quantity: &Quantity) -> Result<u128> {
    parse_bytes(&quantity.0)
}
