//! In-process store over `dashmap`.
//!
//! Suitable for tests and single-process deployments. The CAS and bounded
//! increment run under the entry's shard lock, so they are atomic with
//! respect to every other accessor of the same intent.

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use rust_decimal::Decimal;

use crate::chain::solana::Address;
use crate::policy::SpendingPolicy;
use crate::tools::{ToolRecord, match_path_pattern};
use crate::types::{IntentStatus, PaymentIntent};

use super::{Backend, IntentRecord, StoreError, StoredReceipt};

#[derive(Default)]
pub struct MemoryBackend {
    intents: DashMap<String, IntentRecord>,
    receipts: DashMap<(String, String), StoredReceipt>,
    policies: DashMap<String, SpendingPolicy>,
    daily: DashMap<(String, NaiveDate), Decimal>,
    tools: DashMap<String, ToolRecord>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool. Registration is an external concern; this exists so
    /// deployments and tests can seed the registry.
    pub fn insert_tool(&self, tool: ToolRecord) {
        self.tools.insert(tool.tool_id.clone(), tool);
    }

    pub fn insert_policy(&self, payer: impl Into<String>, policy: SpendingPolicy) {
        self.policies.insert(payer.into(), policy);
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn create_intent(&self, intent: &PaymentIntent) -> Result<(), StoreError> {
        match self.intents.entry(intent.intent_id.clone()) {
            dashmap::Entry::Occupied(_) => {
                Err(StoreError::DuplicateIntent(intent.intent_id.clone()))
            }
            dashmap::Entry::Vacant(slot) => {
                slot.insert(IntentRecord::new(intent.clone()));
                Ok(())
            }
        }
    }

    async fn find_intent(&self, intent_id: &str) -> Result<Option<IntentRecord>, StoreError> {
        Ok(self.intents.get(intent_id).map(|r| r.clone()))
    }

    async fn mark_paid_verified(
        &self,
        intent_id: &str,
        payer: &Address,
        tx_sig: &str,
    ) -> Result<bool, StoreError> {
        let mut record = self
            .intents
            .get_mut(intent_id)
            .ok_or_else(|| StoreError::IntentNotFound(intent_id.to_string()))?;
        if record.status != IntentStatus::Created {
            return Ok(false);
        }
        record.status = IntentStatus::PaidVerified;
        record.intent.payer = Some(*payer);
        record.tx_sig = Some(tx_sig.to_string());
        if record.intent.is_session() && record.intent.calls_used.is_none() {
            record.intent.calls_used = Some(0);
        }
        Ok(true)
    }

    async fn begin_consume(&self, intent_id: &str) -> Result<bool, StoreError> {
        let mut record = self
            .intents
            .get_mut(intent_id)
            .ok_or_else(|| StoreError::IntentNotFound(intent_id.to_string()))?;
        match record.status {
            IntentStatus::Created | IntentStatus::PaidVerified => {
                record.status = IntentStatus::Consumed;
                Ok(true)
            }
            IntentStatus::Consumed => Ok(false),
        }
    }

    async fn claim_session_call(&self, intent_id: &str) -> Result<bool, StoreError> {
        let mut record = self
            .intents
            .get_mut(intent_id)
            .ok_or_else(|| StoreError::IntentNotFound(intent_id.to_string()))?;
        if record.status != IntentStatus::PaidVerified {
            return Ok(false);
        }
        let max = record.intent.max_calls.unwrap_or(0);
        let used = record.intent.calls_used.unwrap_or(0);
        if used >= max {
            return Ok(false);
        }
        record.intent.calls_used = Some(used + 1);
        Ok(true)
    }

    async fn find_receipt(
        &self,
        intent_id: &str,
        request_hash: &str,
    ) -> Result<Option<StoredReceipt>, StoreError> {
        let key = (intent_id.to_string(), request_hash.to_string());
        Ok(self.receipts.get(&key).map(|r| r.clone()))
    }

    async fn store_receipt(&self, stored: &StoredReceipt) -> Result<(), StoreError> {
        let key = (
            stored.receipt.intent_id.clone(),
            stored.receipt.request_hash.clone(),
        );
        match self.receipts.entry(key) {
            dashmap::Entry::Occupied(_) => Err(StoreError::DuplicateReceipt {
                intent_id: stored.receipt.intent_id.clone(),
            }),
            dashmap::Entry::Vacant(slot) => {
                slot.insert(stored.clone());
                Ok(())
            }
        }
    }

    async fn policy_for(&self, payer: &str) -> Result<Option<SpendingPolicy>, StoreError> {
        Ok(self.policies.get(payer).map(|p| p.clone()))
    }

    async fn daily_spend(&self, payer: &str, date: NaiveDate) -> Result<Decimal, StoreError> {
        let key = (payer.to_string(), date);
        Ok(self
            .daily
            .get(&key)
            .map(|d| *d)
            .unwrap_or(Decimal::ZERO))
    }

    async fn add_daily_spend(
        &self,
        payer: &str,
        date: NaiveDate,
        amount: Decimal,
    ) -> Result<(), StoreError> {
        let key = (payer.to_string(), date);
        *self.daily.entry(key).or_insert(Decimal::ZERO) += amount;
        Ok(())
    }

    async fn find_tool(
        &self,
        base_url: &str,
        path: &str,
    ) -> Result<Option<ToolRecord>, StoreError> {
        let base = base_url.trim_end_matches('/');
        Ok(self
            .tools
            .iter()
            .find(|t| {
                t.base_url.trim_end_matches('/') == base && match_path_pattern(&t.path_pattern, path)
            })
            .map(|t| t.clone()))
    }

    async fn tool_by_id(&self, tool_id: &str) -> Result<Option<ToolRecord>, StoreError> {
        Ok(self.tools.get(tool_id).map(|t| t.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::Amount;
    use crate::types::{Chain, Currency};
    use chrono::{Duration, Utc};

    const RECIPIENT: &str = "So11111111111111111111111111111111111111112";

    fn intent(id: &str) -> PaymentIntent {
        PaymentIntent {
            intent_id: id.to_string(),
            tool_id: "tool_a".into(),
            amount: Amount::parse("0.01").unwrap(),
            currency: Currency::Usdc,
            chain: Chain::Solana,
            recipient: RECIPIENT.parse().unwrap(),
            reference: format!("ref-{id}"),
            expires_at: Utc::now() + Duration::minutes(15),
            request_hash: "h".repeat(64),
            payer: None,
            mint: None,
            network: None,
            tool_params_hash: None,
            session_id: None,
            max_calls: None,
            calls_used: None,
            spending_account: None,
        }
    }

    #[tokio::test]
    async fn test_duplicate_intent_rejected() {
        let store = MemoryBackend::new();
        store.create_intent(&intent("a")).await.unwrap();
        assert!(matches!(
            store.create_intent(&intent("a")).await,
            Err(StoreError::DuplicateIntent(_))
        ));
    }

    #[tokio::test]
    async fn test_begin_consume_wins_exactly_once() {
        let store = MemoryBackend::new();
        store.create_intent(&intent("a")).await.unwrap();
        let payer: Address = RECIPIENT.parse().unwrap();
        store.mark_paid_verified("a", &payer, "sig").await.unwrap();

        assert!(store.begin_consume("a").await.unwrap());
        assert!(!store.begin_consume("a").await.unwrap());
        let record = store.find_intent("a").await.unwrap().unwrap();
        assert_eq!(record.status, IntentStatus::Consumed);
        assert_eq!(record.tx_sig.as_deref(), Some("sig"));
    }

    #[tokio::test]
    async fn test_mark_paid_verified_transitions_exactly_once() {
        let store = MemoryBackend::new();
        store.create_intent(&intent("a")).await.unwrap();
        let payer: Address = RECIPIENT.parse().unwrap();
        assert!(store.mark_paid_verified("a", &payer, "sig").await.unwrap());
        assert!(!store.mark_paid_verified("a", &payer, "sig").await.unwrap());
        let record = store.find_intent("a").await.unwrap().unwrap();
        assert_eq!(record.status, IntentStatus::PaidVerified);
    }

    #[tokio::test]
    async fn test_mark_paid_verified_does_not_demote_consumed() {
        let store = MemoryBackend::new();
        store.create_intent(&intent("a")).await.unwrap();
        let payer: Address = RECIPIENT.parse().unwrap();
        assert!(store.mark_paid_verified("a", &payer, "sig1").await.unwrap());
        store.begin_consume("a").await.unwrap();
        assert!(!store.mark_paid_verified("a", &payer, "sig2").await.unwrap());
        let record = store.find_intent("a").await.unwrap().unwrap();
        assert_eq!(record.status, IntentStatus::Consumed);
        assert_eq!(record.tx_sig.as_deref(), Some("sig1"));
    }

    #[tokio::test]
    async fn test_session_claims_exhaust_at_max_calls() {
        let store = MemoryBackend::new();
        let mut i = intent("s");
        i.session_id = Some("sess-1".into());
        i.max_calls = Some(2);
        store.create_intent(&i).await.unwrap();
        let payer: Address = RECIPIENT.parse().unwrap();

        // Not yet verified: no claims.
        assert!(!store.claim_session_call("s").await.unwrap());

        store.mark_paid_verified("s", &payer, "sig").await.unwrap();
        assert!(store.claim_session_call("s").await.unwrap());
        assert!(store.claim_session_call("s").await.unwrap());
        assert!(!store.claim_session_call("s").await.unwrap());

        let record = store.find_intent("s").await.unwrap().unwrap();
        assert_eq!(record.intent.calls_used, Some(2));
    }

    #[tokio::test]
    async fn test_daily_spend_accumulates() {
        let store = MemoryBackend::new();
        let date = Utc::now().date_naive();
        assert_eq!(
            store.daily_spend("payer", date).await.unwrap(),
            Decimal::ZERO
        );
        store
            .add_daily_spend("payer", date, Decimal::new(5, 1))
            .await
            .unwrap();
        store
            .add_daily_spend("payer", date, Decimal::new(25, 2))
            .await
            .unwrap();
        assert_eq!(
            store.daily_spend("payer", date).await.unwrap(),
            Decimal::new(75, 2)
        );
    }

    #[tokio::test]
    async fn test_receipt_unique_per_request_hash() {
        use crate::types::Receipt;
        let store = MemoryBackend::new();
        let receipt = Receipt {
            receipt_id: "r1".into(),
            intent_id: "a".into(),
            tool_id: "tool_a".into(),
            request_hash: "h1".into(),
            response_hash: "rh".into(),
            tx_sig: "sig".into(),
            payer: "p".into(),
            merchant: "m".into(),
            timestamp: Utc::now(),
            signature: "s".into(),
            signer_pubkey: "k".into(),
            version: None,
            amount: None,
            currency: None,
            block_height: None,
        };
        let stored = StoredReceipt {
            receipt,
            response_status: 200,
            response_headers: serde_json::json!({}),
            response_body: "{}".into(),
        };
        store.store_receipt(&stored).await.unwrap();
        assert!(matches!(
            store.store_receipt(&stored).await,
            Err(StoreError::DuplicateReceipt { .. })
        ));
        assert!(store.find_receipt("a", "h1").await.unwrap().is_some());
        assert!(store.find_receipt("a", "h2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_tool_matches_pattern_and_base() {
        let store = MemoryBackend::new();
        let tool = ToolRecord {
            tool_id: "tool_a".into(),
            name: "A".into(),
            description: String::new(),
            base_url: "https://api.example.com/".into(),
            path_pattern: "/v1/data/**".into(),
            pricing_model: Default::default(),
            accepted_currency: Currency::Usdc,
            merchant_wallet: "m".into(),
            metadata_signature: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            signing_public_key: String::new(),
            signing_private_key_encrypted: String::new(),
        };
        store.insert_tool(tool);
        assert!(store
            .find_tool("https://api.example.com", "/v1/data/x/y")
            .await
            .unwrap()
            .is_some());
        assert!(store
            .find_tool("https://api.example.com", "/v2/data")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .find_tool("https://other.example.com", "/v1/data/x")
            .await
            .unwrap()
            .is_none());
    }
}
