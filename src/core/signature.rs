//! Verification of queue deliveries.
//!
//! The queue signs every delivery with a compact HS256 JWT carried in the
//! `X-Queue-Signature` header. The claims bind the token to the destination
//! URL and to a SHA-256 digest of the exact body bytes, so verification must
//! run on the raw body before any JSON parsing.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::core::config::QueueConfig;

pub const SIGNATURE_HEADER: &str = "x-queue-signature";

#[derive(Deserialize)]
struct Claims {
    sub: String,
    body: String,
}

#[derive(Clone)]
pub struct SignatureVerifier {
    current_key: String,
    next_key: String,
    validation: Validation,
}

impl SignatureVerifier {
    pub fn new(current_key: &str, next_key: &str, issuer: &str, tolerance_secs: i64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[issuer]);
        validation.set_required_spec_claims(&["exp", "nbf", "iss", "sub"]);
        validation.validate_nbf = true;
        validation.leeway = tolerance_secs.max(0) as u64;

        Self {
            current_key: current_key.to_string(),
            next_key: next_key.to_string(),
            validation,
        }
    }

    pub fn from_config(cfg: &QueueConfig) -> Self {
        Self::new(
            &cfg.current_signing_key,
            &cfg.next_signing_key,
            &cfg.issuer,
            cfg.clock_tolerance_secs,
        )
    }

    /// Returns true when the token is valid under the current or the next key.
    pub fn verify(&self, signature_header: Option<&str>, raw_body: &[u8], full_url: &str) -> bool {
        let Some(token) = signature_header.map(str::trim).filter(|t| !t.is_empty()) else {
            debug!("Queue delivery without signature header");
            return false;
        };

        let Some(claims) = [self.current_key.as_str(), self.next_key.as_str()]
            .into_iter()
            .filter(|key| !key.is_empty())
            .find_map(|key| self.decode_with_key(key, token))
        else {
            return false;
        };

        if claims.sub != full_url {
            debug!("Queue token subject mismatch (sub={})", claims.sub);
            return false;
        }
        let body_digest = URL_SAFE_NO_PAD.encode(Sha256::digest(raw_body));
        claims.body.trim_end_matches('=') == body_digest
    }

    fn decode_with_key(&self, key: &str, token: &str) -> Option<Claims> {
        match decode::<Claims>(
            token,
            &DecodingKey::from_secret(key.as_bytes()),
            &self.validation,
        ) {
            Ok(data) => Some(data.claims),
            Err(e) => {
                debug!("Queue token rejected: {}", e);
                None
            }
        }
    }
}

/// Produce a token the way the queue service does. Test fixtures only.
#[cfg(test)]
pub(crate) fn sign_for_test(key: &str, issuer: &str, url: &str, body: &[u8], now: i64) -> String {
    use jsonwebtoken::{EncodingKey, Header, encode};

    let claims = serde_json::json!({
        "iss": issuer,
        "sub": url,
        "exp": now + 300,
        "nbf": now,
        "iat": now,
        "jti": uuid::Uuid::new_v4().to_string(),
        "body": URL_SAFE_NO_PAD.encode(Sha256::digest(body)),
    });
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(key.as_bytes()),
    )
    .expect("HS256 encoding")
}
