//! HMAC-SHA256 verification of raw webhook bodies.
//!
//! The MAC is computed over the exact bytes received on the wire. Any parse
//! problem with the header is reported as invalid; there is no path that
//! yields a valid result without a matching digest.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_PREFIX: &str = "sha256=";
const DIGEST_LEN: usize = 32;

/// Reason a signature was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VerificationFailure {
    #[error("signature header is missing")]
    Missing,
    #[error("signature must start with 'sha256='")]
    MissingPrefix,
    #[error("signature is not valid hex")]
    InvalidHex,
    #[error("signature has the wrong length")]
    InvalidLength,
    #[error("signing secret is not configured")]
    EmptySecret,
    #[error("signature mismatch")]
    Mismatch,
}

impl VerificationFailure {
    pub fn metric_label(self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::MissingPrefix | Self::InvalidHex | Self::InvalidLength => "malformed",
            Self::EmptySecret => "misconfigured",
            Self::Mismatch => "mismatch",
        }
    }
}

/// Outcome of a verification. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationResult {
    Valid,
    Invalid(VerificationFailure),
}

impl VerificationResult {
    pub fn failure(self) -> Option<VerificationFailure> {
        match self {
            Self::Valid => None,
            Self::Invalid(reason) => Some(reason),
        }
    }
}

/// Checks `header` against the HMAC of `body` keyed with `secret`.
pub fn verify(secret: &[u8], body: &[u8], header: Option<&str>) -> VerificationResult {
    match check(secret, body, header) {
        Ok(()) => VerificationResult::Valid,
        Err(reason) => VerificationResult::Invalid(reason),
    }
}

fn check(secret: &[u8], body: &[u8], header: Option<&str>) -> Result<(), VerificationFailure> {
    if secret.is_empty() {
        return Err(VerificationFailure::EmptySecret);
    }
    let header = header.ok_or(VerificationFailure::Missing)?.trim();
    let hex_part = header
        .strip_prefix(SIGNATURE_PREFIX)
        .ok_or(VerificationFailure::MissingPrefix)?;
    let provided = hex::decode(hex_part).map_err(|_| VerificationFailure::InvalidHex)?;
    if provided.len() != DIGEST_LEN {
        return Err(VerificationFailure::InvalidLength);
    }

    let expected = digest(secret, body).ok_or(VerificationFailure::EmptySecret)?;
    if expected.as_slice().ct_eq(provided.as_slice()).into() {
        Ok(())
    } else {
        Err(VerificationFailure::Mismatch)
    }
}

fn digest(secret: &[u8], body: &[u8]) -> Option<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(body);
    Some(mac.finalize().into_bytes().to_vec())
}

/// Produces a `sha256=<hex>` header value for `body`.
pub fn sign(secret: &[u8], body: &[u8]) -> Option<String> {
    if secret.is_empty() {
        return None;
    }
    digest(secret, body).map(|bytes| format!("{SIGNATURE_PREFIX}{}", hex::encode(bytes)))
}
