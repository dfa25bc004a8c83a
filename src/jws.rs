//! Verification of the JWS envelope around signed API manifests.
//!
//! Manifests are served in JWS JSON serialization with a detached-style
//! unencoded payload (`b64: false`):
//!
//! ```json
//! { "payload": "<raw JSON text>",
//!   "signatures": [ { "protected": "<b64url header>", "header": { "kid": "homebrew-1" },
//!                     "signature": "<b64url RSA-PSS/SHA-512>" } ] }
//! ```
//!
//! Only a signature from the trusted key id, with protected header
//! `{"alg":"PS512","b64":false}`, over `protected || "." || payload` is accepted.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use ring::signature::{RSA_PSS_2048_8192_SHA512, UnparsedPublicKey};
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;

pub const TRUSTED_KEY_ID: &str = "homebrew-1";

/// Why a manifest failed verification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JwsError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("key not found")]
    KeyNotFound,
    #[error("invalid algorithm")]
    InvalidAlgorithm,
    #[error("signature mismatch")]
    SignatureMismatch,
    #[error("invalid public key: {0}")]
    InvalidKey(String),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    payload: String,
    #[serde(default)]
    signatures: Vec<Signature>,
}

#[derive(Debug, Deserialize)]
struct Signature {
    protected: String,
    #[serde(default)]
    header: Option<UnprotectedHeader>,
    signature: String,
}

#[derive(Debug, Deserialize)]
struct UnprotectedHeader {
    kid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProtectedHeader {
    alg: Option<String>,
    b64: Option<bool>,
}

/// RSA public key trusted to sign manifests, in PKCS#1 `RSAPublicKey` DER.
#[derive(Debug, Clone)]
pub struct TrustedKey {
    key_id: String,
    pkcs1_der: Vec<u8>,
}

impl TrustedKey {
    pub fn from_pkcs1_der(key_id: impl Into<String>, der: Vec<u8>) -> Self {
        Self {
            key_id: key_id.into(),
            pkcs1_der: der,
        }
    }

    /// Parse a PEM public key, either `RSA PUBLIC KEY` (PKCS#1) or
    /// `PUBLIC KEY` (SubjectPublicKeyInfo wrapping PKCS#1).
    pub fn from_pem(key_id: impl Into<String>, pem: &str) -> Result<Self, JwsError> {
        let label = pem
            .lines()
            .find_map(|l| l.trim().strip_prefix("-----BEGIN "))
            .and_then(|l| l.strip_suffix("-----"))
            .ok_or_else(|| JwsError::InvalidKey("missing PEM header".into()))?
            .to_string();
        let body: String = pem
            .lines()
            .map(str::trim)
            .filter(|l| !l.starts_with("-----"))
            .collect();
        let der = STANDARD
            .decode(body)
            .map_err(|e| JwsError::InvalidKey(e.to_string()))?;

        let pkcs1 = match label.as_str() {
            "RSA PUBLIC KEY" => der,
            "PUBLIC KEY" => spki_to_pkcs1(&der)?,
            other => return Err(JwsError::InvalidKey(format!("unsupported PEM type {other}"))),
        };
        Ok(Self::from_pkcs1_der(key_id, pkcs1))
    }

    pub fn from_pem_file(key_id: impl Into<String>, path: &Path) -> Result<Self, JwsError> {
        let pem = std::fs::read_to_string(path)
            .map_err(|e| JwsError::InvalidKey(format!("{}: {}", path.display(), e)))?;
        Self::from_pem(key_id, &pem)
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }
}

/// Verify a JWS envelope and return the parsed payload.
pub fn verify_and_parse(envelope: &Value, key: &TrustedKey) -> Result<Value, JwsError> {
    let envelope: Envelope = serde_json::from_value(envelope.clone())
        .map_err(|e| JwsError::Malformed(e.to_string()))?;

    let signature = envelope
        .signatures
        .iter()
        .find(|sig| {
            sig.header
                .as_ref()
                .and_then(|h| h.kid.as_deref())
                .is_some_and(|kid| kid == key.key_id)
        })
        .ok_or(JwsError::KeyNotFound)?;

    let header_bytes = URL_SAFE_NO_PAD
        .decode(signature.protected.trim_end_matches('='))
        .map_err(|e| JwsError::Malformed(e.to_string()))?;
    let header: ProtectedHeader =
        serde_json::from_slice(&header_bytes).map_err(|e| JwsError::Malformed(e.to_string()))?;
    // An absent b64 means true, which we do not accept.
    if header.alg.as_deref() != Some("PS512") || header.b64 != Some(false) {
        return Err(JwsError::InvalidAlgorithm);
    }

    let signature_bytes = URL_SAFE_NO_PAD
        .decode(signature.signature.trim_end_matches('='))
        .map_err(|e| JwsError::Malformed(e.to_string()))?;
    let signing_input = format!("{}.{}", signature.protected, envelope.payload);

    UnparsedPublicKey::new(&RSA_PSS_2048_8192_SHA512, &key.pkcs1_der)
        .verify(signing_input.as_bytes(), &signature_bytes)
        .map_err(|_| JwsError::SignatureMismatch)?;

    serde_json::from_str(&envelope.payload).map_err(|e| JwsError::Malformed(e.to_string()))
}

/// Pull the PKCS#1 `RSAPublicKey` out of a SubjectPublicKeyInfo:
/// `SEQUENCE { SEQUENCE { algorithm }, BIT STRING { 0x00, RSAPublicKey } }`.
fn spki_to_pkcs1(der: &[u8]) -> Result<Vec<u8>, JwsError> {
    let bad = || JwsError::InvalidKey("malformed SubjectPublicKeyInfo".into());

    let (tag, outer, _) = der_element(der).ok_or_else(bad)?;
    if tag != 0x30 {
        return Err(bad());
    }
    let (tag, _, rest) = der_element(outer).ok_or_else(bad)?;
    if tag != 0x30 {
        return Err(bad());
    }
    let (tag, bits, _) = der_element(rest).ok_or_else(bad)?;
    match (tag, bits.split_first()) {
        (0x03, Some((0, key))) => Ok(key.to_vec()),
        _ => Err(bad()),
    }
}

/// Split one DER TLV off the front of `input`: (tag, contents, remainder).
fn der_element(input: &[u8]) -> Option<(u8, &[u8], &[u8])> {
    let (&tag, rest) = input.split_first()?;
    let (&first, rest) = rest.split_first()?;
    let (len, rest) = if first & 0x80 == 0 {
        (usize::from(first), rest)
    } else {
        let n = usize::from(first & 0x7f);
        if n == 0 || n > 4 || rest.len() < n {
            return None;
        }
        let len = rest[..n]
            .iter()
            .fold(0usize, |acc, &b| (acc << 8) | usize::from(b));
        (len, &rest[n..])
    };
    if rest.len() < len {
        return None;
    }
    Some((tag, &rest[..len], &rest[len..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_key_id_is_rejected() {
        let key = TrustedKey::from_pkcs1_der(TRUSTED_KEY_ID, vec![0x30, 0x00]);
        let envelope = json!({
            "payload": "[]",
            "signatures": [{ "protected": "e30", "header": { "kid": "someone-else" }, "signature": "AA" }]
        });
        assert_eq!(verify_and_parse(&envelope, &key), Err(JwsError::KeyNotFound));
    }

    #[test]
    fn test_wrong_algorithm_is_rejected() {
        let key = TrustedKey::from_pkcs1_der(TRUSTED_KEY_ID, vec![0x30, 0x00]);
        let protected = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","b64":false}"#);
        let envelope = json!({
            "payload": "[]",
            "signatures": [{ "protected": protected, "header": { "kid": TRUSTED_KEY_ID }, "signature": "AA" }]
        });
        assert_eq!(verify_and_parse(&envelope, &key), Err(JwsError::InvalidAlgorithm));

        // b64 defaults to true when absent
        let protected = URL_SAFE_NO_PAD.encode(br#"{"alg":"PS512"}"#);
        let envelope = json!({
            "payload": "[]",
            "signatures": [{ "protected": protected, "header": { "kid": TRUSTED_KEY_ID }, "signature": "AA" }]
        });
        assert_eq!(verify_and_parse(&envelope, &key), Err(JwsError::InvalidAlgorithm));
    }

    #[test]
    fn test_envelope_without_payload_is_malformed() {
        let key = TrustedKey::from_pkcs1_der(TRUSTED_KEY_ID, vec![]);
        let result = verify_and_parse(&json!({"signatures": []}), &key);
        assert!(matches!(result, Err(JwsError::Malformed(_))));
    }

    #[test]
    fn test_der_element_long_form_length() {
        let mut der = vec![0x04, 0x81, 0x80];
        der.extend(std::iter::repeat_n(0xAB, 0x80));
        der.push(0xFF);
        let (tag, contents, rest) = der_element(&der).unwrap();
        assert_eq!(tag, 0x04);
        assert_eq!(contents.len(), 0x80);
        assert_eq!(rest, &[0xFF]);
    }

    #[test]
    fn test_pem_requires_header() {
        assert!(matches!(
            TrustedKey::from_pem(TRUSTED_KEY_ID, "not a pem"),
            Err(JwsError::InvalidKey(_))
        ));
    }
}
