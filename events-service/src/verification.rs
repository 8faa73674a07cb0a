use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq)]
pub enum SignatureError {
    #[error("missing Stripe-Signature header")]
    MissingHeader,
    #[error("malformed Stripe-Signature header")]
    Malformed,
    #[error("timestamp outside the tolerance window")]
    Expired,
    #[error("no signature matches the payload")]
    Mismatch,
}

/// Verifies a Stripe webhook signature header (`t=<unix>,v1=<hex>[,v1=...]`).
/// The signed payload is `"{t}.{body}"`; any `v1` entry may match.
pub fn verify_stripe_signature(
    secret: &str,
    body: &[u8],
    header: Option<&str>,
    now: i64,
    tolerance_secs: i64,
) -> Result<(), SignatureError> {
    let header = header.ok_or(SignatureError::MissingHeader)?;

    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<Vec<u8>> = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => {
                timestamp = Some(value.parse().map_err(|_| SignatureError::Malformed)?);
            }
            // Undecodable entries just never match.
            Some(("v1", value)) => {
                if let Ok(sig) = hex::decode(value) {
                    signatures.push(sig);
                }
            }
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    if signatures.is_empty() {
        return Err(SignatureError::Mismatch);
    }
    // `t` is untrusted here, so the distance must not overflow.
    if now.abs_diff(timestamp) > tolerance_secs.max(0) as u64 {
        return Err(SignatureError::Expired);
    }

    let mac = signed_payload_mac(secret, timestamp, body)?;
    if signatures.iter().any(|sig| mac.clone().verify_slice(sig).is_ok()) {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

fn signed_payload_mac(secret: &str, timestamp: i64, body: &[u8]) -> Result<HmacSha256, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::Malformed)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(mac)
}

/// Builds a header the way Stripe does. Used to sign test payloads.
#[cfg(test)]
pub fn sign(secret: &str, timestamp: i64, body: &[u8]) -> String {
    let mac = signed_payload_mac(secret, timestamp, body).unwrap();
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}

/// `Authorization: Bearer <secret>` check for operator routes.
pub fn bearer_matches(headers: &HeaderMap, secret: &str) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| bool::from(token.as_bytes().ct_eq(secret.as_bytes())))
        .unwrap_or(false)
}
