//! Signed payment receipts.
//!
//! A receipt binds a verified payment to the exact request and response it
//! paid for. The signature covers a fixed nine-field subset serialized with
//! key-sorted JSON, so extending the receipt record later never invalidates
//! signatures already in the wild. Verification is a total function: any
//! malformed key, signature, or payload yields `false`, never a panic.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use serde_json::json;

use crate::canonical::{sha256_hex, stable_stringify};
use crate::types::Receipt;

#[derive(Debug, thiserror::Error)]
pub enum ReceiptError {
    #[error("signing key is not valid hex: {0}")]
    KeyHex(#[from] hex::FromHexError),
    #[error("signing seed must be 32 bytes, got {0}")]
    KeyLength(usize),
    #[error("signing key PEM rejected: {0}")]
    KeyPem(#[from] ed25519_dalek::pkcs8::Error),
}

/// Holds the gateway's Ed25519 signing key.
pub struct ReceiptSigner {
    key: SigningKey,
}

impl ReceiptSigner {
    /// Accepts either a 64-character hex seed or a PKCS#8 PEM block.
    pub fn from_key_material(material: &str) -> Result<Self, ReceiptError> {
        let material = material.trim();
        if material.starts_with("-----BEGIN") {
            let key = SigningKey::from_pkcs8_pem(material)?;
            return Ok(Self { key });
        }
        let seed = hex::decode(material)?;
        let seed: [u8; 32] = seed
            .as_slice()
            .try_into()
            .map_err(|_| ReceiptError::KeyLength(seed.len()))?;
        Ok(Self {
            key: SigningKey::from_bytes(&seed),
        })
    }

    /// Builds a signer from decrypted merchant key material: either 32 raw
    /// seed bytes or UTF-8 text holding a hex seed or a PEM block.
    pub fn from_decrypted(material: &[u8]) -> Result<Self, ReceiptError> {
        if let Ok(seed) = <[u8; 32]>::try_from(material) {
            return Ok(Self {
                key: SigningKey::from_bytes(&seed),
            });
        }
        let text = std::str::from_utf8(material)
            .map_err(|_| ReceiptError::KeyLength(material.len()))?;
        Self::from_key_material(text)
    }

    /// Hex-encoded public key, stored alongside each receipt.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.key.verifying_key().to_bytes())
    }

    /// Signs the canonical subset of `receipt`, returning a base64 signature.
    pub fn sign(&self, receipt: &Receipt) -> String {
        let payload = canonical_payload(receipt);
        let sig = self.key.sign(payload.as_bytes());
        BASE64.encode(sig.to_bytes())
    }
}

impl std::fmt::Debug for ReceiptSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiptSigner")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

/// Hashes an upstream response for inclusion in a receipt. Headers are the
/// subset the gateway chose to persist, already lowercased.
pub fn response_hash(status: u16, headers: &serde_json::Value, body: &str) -> String {
    let doc = json!({
        "status": status,
        "headers": headers,
        "body": body,
    });
    sha256_hex(stable_stringify(&doc).as_bytes())
}

/// The exact byte string a receipt signature covers. Only these nine fields
/// participate; everything else on [`Receipt`] travels unsigned.
fn canonical_payload(receipt: &Receipt) -> String {
    let subset = json!({
        "receiptId": receipt.receipt_id,
        "intentId": receipt.intent_id,
        "toolId": receipt.tool_id,
        "requestHash": receipt.request_hash,
        "responseHash": receipt.response_hash,
        "txSig": receipt.tx_sig,
        "payer": receipt.payer,
        "merchant": receipt.merchant,
        "timestamp": timestamp_wire(&receipt.timestamp),
    });
    stable_stringify(&subset)
}

fn timestamp_wire(ts: &DateTime<Utc>) -> serde_json::Value {
    // Serialize through serde so the signed form matches the wire form.
    serde_json::to_value(ts).unwrap_or_else(|_| json!(ts.to_rfc3339()))
}

/// Checks `receipt.signature` against `pubkey` (hex or SPKI PEM). Returns
/// `false` on any malformed input.
pub fn verify_receipt(receipt: &Receipt, pubkey: &str) -> bool {
    let Some(key) = parse_verifying_key(pubkey) else {
        return false;
    };
    let Ok(sig_bytes) = BASE64.decode(receipt.signature.trim()) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
        return false;
    };
    let sig = ed25519_dalek::Signature::from_bytes(&sig_bytes);
    let payload = canonical_payload(receipt);
    key.verify(payload.as_bytes(), &sig).is_ok()
}

fn parse_verifying_key(pubkey: &str) -> Option<VerifyingKey> {
    let pubkey = pubkey.trim();
    if pubkey.starts_with("-----BEGIN") {
        return VerifyingKey::from_public_key_pem(pubkey).ok();
    }
    let bytes = hex::decode(pubkey).ok()?;
    let bytes: [u8; 32] = bytes.as_slice().try_into().ok()?;
    VerifyingKey::from_bytes(&bytes).ok()
}
