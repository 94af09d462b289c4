//! Durable state behind the gateway.
//!
//! The gateway is a stateless handler over this trait: intents, receipts,
//! spending policies, daily-spend aggregates, and the tool registry all live
//! behind [`Backend`], so any number of gateway processes can share one
//! store. Two implementations ship: [`memory::MemoryBackend`] for tests and
//! single-process deployments, and [`remote::RemoteBackend`] speaking HTTP to
//! a hosted store.
//!
//! Concurrency-sensitive operations are modeled as atomic primitives of the
//! trait rather than read-modify-write on the caller's side:
//! [`Backend::begin_consume`] is a compare-and-swap on intent status and
//! [`Backend::claim_session_call`] an atomic bounded increment, which is what
//! makes "forward upstream at most once" hold across processes.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::chain::solana::Address;
use crate::policy::SpendingPolicy;
use crate::types::{IntentStatus, PaymentIntent, Receipt};
use crate::tools::ToolRecord;

pub mod memory;
pub mod remote;

pub use memory::MemoryBackend;
pub use remote::RemoteBackend;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("intent not found: {0}")]
    IntentNotFound(String),
    #[error("intent already exists: {0}")]
    DuplicateIntent(String),
    #[error("receipt already exists for intent {intent_id}")]
    DuplicateReceipt { intent_id: String },
    #[error("store request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("store responded {status}: {message}")]
    Remote { status: u16, message: String },
    #[error("store returned malformed data: {0}")]
    Decode(#[from] serde_json::Error),
}

/// An intent plus its server-side lifecycle state. The wire-facing
/// [`PaymentIntent`] carries no status; clients learn state transitions only
/// through gateway responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentRecord {
    #[serde(flatten)]
    pub intent: PaymentIntent,
    pub status: IntentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_sig: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A receipt together with the captured upstream response it attests to.
/// Replays are served verbatim from this record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredReceipt {
    pub receipt: Receipt,
    pub response_status: u16,
    /// Persisted subset of upstream headers, lowercased names.
    pub response_headers: serde_json::Value,
    pub response_body: String,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Persists a new intent in `created` state. Fails on id collision.
    async fn create_intent(&self, intent: &PaymentIntent) -> Result<(), StoreError>;

    async fn find_intent(&self, intent_id: &str) -> Result<Option<IntentRecord>, StoreError>;

    /// Records a successful on-chain verification: `created → paid_verified`,
    /// filling `payer` and `tx_sig`. Returns whether this caller performed
    /// the transition; at most one concurrent caller does, and the winner is
    /// the one that accounts the payment's spend. Idempotent when already
    /// past `created`.
    async fn mark_paid_verified(
        &self,
        intent_id: &str,
        payer: &Address,
        tx_sig: &str,
    ) -> Result<bool, StoreError>;

    /// Compare-and-swap `created | paid_verified → consumed`. Returns whether
    /// this caller won the transition; exactly one concurrent caller does.
    async fn begin_consume(&self, intent_id: &str) -> Result<bool, StoreError>;

    /// Atomically claims one call on a session intent: succeeds while the
    /// intent is verified and `calls_used < max_calls`, incrementing
    /// `calls_used`.
    async fn claim_session_call(&self, intent_id: &str) -> Result<bool, StoreError>;

    async fn find_receipt(
        &self,
        intent_id: &str,
        request_hash: &str,
    ) -> Result<Option<StoredReceipt>, StoreError>;

    /// Persists a receipt. At most one receipt may exist per
    /// `(intentId, requestHash)` pair.
    async fn store_receipt(&self, stored: &StoredReceipt) -> Result<(), StoreError>;

    /// Spending policy keyed by payer address, if one is registered.
    async fn policy_for(&self, payer: &str) -> Result<Option<SpendingPolicy>, StoreError>;

    /// Aggregate spend of `payer` on the given UTC date.
    async fn daily_spend(&self, payer: &str, date: NaiveDate) -> Result<Decimal, StoreError>;

    /// Atomically adds `amount` to the payer's aggregate for the date.
    async fn add_daily_spend(
        &self,
        payer: &str,
        date: NaiveDate,
        amount: Decimal,
    ) -> Result<(), StoreError>;

    /// Resolves the registered tool whose `baseUrl` matches and whose path
    /// pattern matches the normalized request path.
    async fn find_tool(&self, base_url: &str, path: &str) -> Result<Option<ToolRecord>, StoreError>;

    async fn tool_by_id(&self, tool_id: &str) -> Result<Option<ToolRecord>, StoreError>;
}

impl IntentRecord {
    pub fn new(intent: PaymentIntent) -> Self {
        Self {
            intent,
            status: IntentStatus::Created,
            tx_sig: None,
            created_at: Utc::now(),
        }
    }
}
