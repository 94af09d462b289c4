//! Wire types of the v402 protocol.
//!
//! These structs define the JSON bodies and headers exchanged between clients
//! and the gateway. Field names are camelCase on the wire, matching the
//! TypeScript SDK.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::chain::solana::Address;

/// Header carrying the intent id: on 402 responses and on paid retries.
pub const HEADER_INTENT: &str = "V402-Intent";
/// Header carrying the on-chain transaction signature on a paid retry.
pub const HEADER_TX: &str = "V402-Tx";
/// Header carrying the client-computed canonical request hash on a paid retry.
pub const HEADER_REQUEST_HASH: &str = "V402-Request-Hash";
/// Header carrying the JSON-encoded signed receipt on forwarded and replayed responses.
pub const HEADER_RECEIPT: &str = "V402-Receipt";

/// Prefix of the on-chain memo binding a transaction to an intent reference.
pub const MEMO_PREFIX: &str = "v402:";

/// The two assets a tool can charge in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency {
    #[serde(rename = "SOL")]
    Sol,
    #[serde(rename = "USDC")]
    Usdc,
}

impl Currency {
    /// Decimal precision of the asset's atomic unit.
    pub fn decimals(&self) -> u32 {
        match self {
            Currency::Sol => 9,
            Currency::Usdc => 6,
        }
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Currency::Sol => f.write_str("SOL"),
            Currency::Usdc => f.write_str("USDC"),
        }
    }
}

/// The ledger an intent settles on. Only Solana is verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    #[default]
    Solana,
}

/// Solana cluster the payment is expected on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolanaNetwork {
    #[serde(rename = "mainnet-beta")]
    MainnetBeta,
    #[serde(rename = "devnet")]
    Devnet,
    #[serde(rename = "testnet")]
    Testnet,
}

impl std::str::FromStr for SolanaNetwork {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet-beta" | "mainnet" => Ok(SolanaNetwork::MainnetBeta),
            "devnet" => Ok(SolanaNetwork::Devnet),
            "testnet" => Ok(SolanaNetwork::Testnet),
            other => Err(format!("unknown solana network: {other}")),
        }
    }
}

/// Lifecycle state of a payment intent.
///
/// Expiry is a read-time check against `expiresAt`, not a stored state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Created,
    PaidVerified,
    Consumed,
}

impl std::fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntentStatus::Created => f.write_str("created"),
            IntentStatus::PaidVerified => f.write_str("paid_verified"),
            IntentStatus::Consumed => f.write_str("consumed"),
        }
    }
}

/// A server-issued description of a required payment, scoped to one canonical
/// request, or to one session when `sessionId` is set.
///
/// `intentId` is the caller-facing id; `reference` is a second unique token
/// embedded verbatim in the on-chain memo, kept separate so memo constraints
/// never leak internal identifiers. `requestHash` never changes after
/// creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIntent {
    pub intent_id: String,
    pub tool_id: String,
    pub amount: Amount,
    pub currency: Currency,
    pub chain: Chain,
    pub recipient: Address,
    pub reference: String,
    pub expires_at: DateTime<Utc>,
    pub request_hash: String,
    /// Filled once the payment is verified on-chain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payer: Option<Address>,
    /// SPL token mint for USDC intents.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mint: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<SolanaNetwork>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_params_hash: Option<String>,
    /// Session billing: one verified payment covers up to `maxCalls` distinct
    /// request hashes under the same `sessionId`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_calls: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calls_used: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spending_account: Option<Address>,
}

impl PaymentIntent {
    pub fn is_session(&self) -> bool {
        self.session_id.is_some()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// A signed, tamper-evident record that a specific paid call occurred with a
/// specific result. Created exactly once per consumed intent (or per session
/// call) and immutable thereafter.
///
/// `signature` is base64 Ed25519 over the fixed canonical subset of fields
/// (see [`crate::receipt`]); the v2 extras (`version`, `amount`, `currency`,
/// `blockHeight`) ride along unsigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub receipt_id: String,
    pub intent_id: String,
    pub tool_id: String,
    pub request_hash: String,
    pub response_hash: String,
    pub tx_sig: String,
    pub payer: String,
    pub merchant: String,
    pub timestamp: DateTime<Utc>,
    pub signature: String,
    pub signer_pubkey: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<Amount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<Currency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_height: Option<u64>,
}

/// Result of a successful on-chain verification.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedPayment {
    pub tx_sig: String,
    pub payer: Address,
    /// Unix seconds of the transaction's block.
    pub block_time: i64,
    pub slot: Option<u64>,
}

/// JSON error body returned by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}
