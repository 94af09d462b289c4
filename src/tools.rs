//! Tool registry domain: canonical metadata signing, path-pattern matching,
//! and the typed pricing model.
//!
//! A tool is a merchant-registered payable endpoint. Its metadata carries an
//! Ed25519 signature produced by the merchant's signing key; the gateway
//! refuses to create intents for tools whose signature does not verify, which
//! is what binds "who may charge for this path" to a key the merchant holds.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use ed25519_dalek::pkcs8::DecodePublicKey;
use ed25519_dalek::{Verifier, VerifyingKey};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::amount::Amount;
use crate::canonical::stable_stringify;
use crate::types::Currency;

/// Session pricing: one payment buys up to `max_calls` invocations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPricing {
    pub amount: Amount,
    pub max_calls: u32,
}

/// How a tool charges. At least one of the two variants must be present for
/// the tool to be payable; `per_call` wins when the caller does not ask for a
/// session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricingModel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_call: Option<Amount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_session: Option<SessionPricing>,
}

/// A registered tool, as surfaced by the backing store. The merchant's
/// signing keys ride along so the gateway can verify metadata and sign
/// receipts without a second lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolRecord {
    pub tool_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub base_url: String,
    pub path_pattern: String,
    pub pricing_model: PricingModel,
    pub accepted_currency: Currency,
    pub merchant_wallet: String,
    pub metadata_signature: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Hex or PEM Ed25519 public key registered by the merchant.
    pub signing_public_key: String,
    /// Merchant signing key sealed with the deployment key, see `keys`.
    pub signing_private_key_encrypted: String,
}

/// The exact string a tool-metadata signature covers. The ten fields are
/// fixed; both the registering side and the gateway must produce the same
/// bytes or every signature check fails.
pub fn canonical_tool_metadata(tool: &ToolRecord) -> String {
    let doc = json!({
        "toolId": tool.tool_id,
        "name": tool.name,
        "description": tool.description,
        "baseUrl": tool.base_url,
        "pathPattern": tool.path_pattern,
        "pricingModel": tool.pricing_model,
        "acceptedCurrency": tool.accepted_currency,
        "merchantWallet": tool.merchant_wallet,
        "createdAt": timestamp_wire(&tool.created_at),
        "updatedAt": timestamp_wire(&tool.updated_at),
    });
    stable_stringify(&doc)
}

fn timestamp_wire(ts: &DateTime<Utc>) -> serde_json::Value {
    serde_json::to_value(ts).unwrap_or_else(|_| json!(ts.to_rfc3339()))
}

/// Checks the tool's metadata signature against its merchant's registered
/// public key. Returns `false` on any malformed key or signature.
pub fn verify_tool_metadata(tool: &ToolRecord) -> bool {
    if tool.signing_public_key.is_empty() || tool.metadata_signature.is_empty() {
        return false;
    }
    let Some(key) = parse_verifying_key(&tool.signing_public_key) else {
        return false;
    };
    let Ok(sig_bytes) = BASE64.decode(tool.metadata_signature.trim()) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
        return false;
    };
    let sig = ed25519_dalek::Signature::from_bytes(&sig_bytes);
    let canonical = canonical_tool_metadata(tool);
    key.verify(canonical.as_bytes(), &sig).is_ok()
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

/// Matches a registered path pattern against a normalized request path.
/// `**` matches any suffix including `/`, `*` matches a single segment, and
/// every other character is taken literally.
pub fn match_path_pattern(pattern: &str, path: &str) -> bool {
    let mut regex = String::with_capacity(pattern.len() + 8);
    regex.push('^');
    let bytes = pattern.as_bytes();
    let mut i = 0;
    let mut lit_start = 0;
    while i < bytes.len() {
        if bytes[i] == b'*' {
            regex.push_str(&regex::escape(&pattern[lit_start..i]));
            if bytes.get(i + 1) == Some(&b'*') {
                regex.push_str(".*");
                i += 2;
            } else {
                regex.push_str("[^/]+");
                i += 1;
            }
            lit_start = i;
        } else {
            i += 1;
        }
    }
    regex.push_str(&regex::escape(&pattern[lit_start..]));
    regex.push('$');
    Regex::new(&regex).map(|re| re.is_match(path)).unwrap_or(false)
}

impl PricingModel {
    pub fn is_payable(&self) -> bool {
        self.per_call.is_some() || self.per_session.is_some()
    }
}
