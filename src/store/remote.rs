//! HTTP store client.
//!
//! Talks to a hosted v402 store exposing the same operations as [`Backend`]
//! under `/v1`. Authentication is a bearer API key. A 404 maps to `None` on
//! lookups; every other non-2xx status surfaces as [`StoreError::Remote`]
//! with the response body as the message.
//!
//! The atomic transitions (`mark_paid_verified`, `begin_consume`,
//! `claim_session_call`) are executed server-side; the wire answer is a
//! single boolean (`transitioned` or `claimed`), so multi-process
//! deployments get the same at-most-once guarantees as the in-memory store.

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::chain::solana::Address;
use crate::policy::SpendingPolicy;
use crate::tools::ToolRecord;
use crate::types::PaymentIntent;

use super::{Backend, IntentRecord, StoreError, StoredReceipt};

pub struct RemoteBackend {
    http: reqwest::Client,
    base: Url,
    api_key: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MarkPaidBody<'a> {
    payer: &'a Address,
    tx_sig: &'a str,
}

#[derive(Deserialize)]
struct ClaimedBody {
    claimed: bool,
}

#[derive(Deserialize)]
struct TransitionedBody {
    transitioned: bool,
}

#[derive(Deserialize)]
struct SpendBody {
    amount: Decimal,
}

#[derive(Serialize)]
struct AddSpendBody<'a> {
    date: NaiveDate,
    amount: Decimal,
    payer: &'a str,
}

impl RemoteBackend {
    pub fn new(http: reqwest::Client, base: Url, api_key: impl Into<String>) -> Self {
        Self {
            http,
            base,
            api_key: api_key.into(),
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = self.base.clone();
        {
            let mut parts = url.path_segments_mut().map_err(|_| StoreError::Remote {
                status: 0,
                message: "store base url cannot be a base".to_string(),
            })?;
            parts.pop_if_empty();
            parts.extend(["v1"].iter().chain(segments));
        }
        Ok(url)
    }

    async fn expect_ok(&self, response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(StoreError::Remote {
            status: status.as_u16(),
            message,
        })
    }

    async fn get_optional<T: serde::de::DeserializeOwned>(
        &self,
        url: Url,
    ) -> Result<Option<T>, StoreError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = self.expect_ok(response).await?;
        Ok(Some(response.json().await?))
    }

    async fn post_json<B: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        url: Url,
        body: &B,
    ) -> Result<T, StoreError> {
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;
        let response = self.expect_ok(response).await?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl Backend for RemoteBackend {
    async fn create_intent(&self, intent: &PaymentIntent) -> Result<(), StoreError> {
        let url = self.endpoint(&["intents"])?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(intent)
            .send()
            .await?;
        if response.status() == StatusCode::CONFLICT {
            return Err(StoreError::DuplicateIntent(intent.intent_id.clone()));
        }
        self.expect_ok(response).await?;
        Ok(())
    }

    async fn find_intent(&self, intent_id: &str) -> Result<Option<IntentRecord>, StoreError> {
        let url = self.endpoint(&["intents", intent_id])?;
        self.get_optional(url).await
    }

    async fn mark_paid_verified(
        &self,
        intent_id: &str,
        payer: &Address,
        tx_sig: &str,
    ) -> Result<bool, StoreError> {
        let url = self.endpoint(&["intents", intent_id, "paid"])?;
        let body: TransitionedBody = self.post_json(url, &MarkPaidBody { payer, tx_sig }).await?;
        Ok(body.transitioned)
    }

    async fn begin_consume(&self, intent_id: &str) -> Result<bool, StoreError> {
        let url = self.endpoint(&["intents", intent_id, "consume"])?;
        let body: ClaimedBody = self.post_json(url, &serde_json::json!({})).await?;
        Ok(body.claimed)
    }

    async fn claim_session_call(&self, intent_id: &str) -> Result<bool, StoreError> {
        let url = self.endpoint(&["intents", intent_id, "claim-call"])?;
        let body: ClaimedBody = self.post_json(url, &serde_json::json!({})).await?;
        Ok(body.claimed)
    }

    async fn find_receipt(
        &self,
        intent_id: &str,
        request_hash: &str,
    ) -> Result<Option<StoredReceipt>, StoreError> {
        let mut url = self.endpoint(&["receipts"])?;
        url.query_pairs_mut()
            .append_pair("intentId", intent_id)
            .append_pair("requestHash", request_hash);
        self.get_optional(url).await
    }

    async fn store_receipt(&self, stored: &StoredReceipt) -> Result<(), StoreError> {
        let url = self.endpoint(&["receipts"])?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(stored)
            .send()
            .await?;
        if response.status() == StatusCode::CONFLICT {
            return Err(StoreError::DuplicateReceipt {
                intent_id: stored.receipt.intent_id.clone(),
            });
        }
        self.expect_ok(response).await?;
        Ok(())
    }

    async fn policy_for(&self, payer: &str) -> Result<Option<SpendingPolicy>, StoreError> {
        let url = self.endpoint(&["policies", payer])?;
        self.get_optional(url).await
    }

    async fn daily_spend(&self, payer: &str, date: NaiveDate) -> Result<Decimal, StoreError> {
        let mut url = self.endpoint(&["spend", payer])?;
        url.query_pairs_mut()
            .append_pair("date", &date.to_string());
        let body: Option<SpendBody> = self.get_optional(url).await?;
        Ok(body.map(|b| b.amount).unwrap_or(Decimal::ZERO))
    }

    async fn add_daily_spend(
        &self,
        payer: &str,
        date: NaiveDate,
        amount: Decimal,
    ) -> Result<(), StoreError> {
        let url = self.endpoint(&["spend"])?;
        let _: serde_json::Value = self
            .post_json(url, &AddSpendBody { date, amount, payer })
            .await?;
        Ok(())
    }

    async fn find_tool(
        &self,
        base_url: &str,
        path: &str,
    ) -> Result<Option<ToolRecord>, StoreError> {
        let mut url = self.endpoint(&["tools", "resolve"])?;
        url.query_pairs_mut()
            .append_pair("baseUrl", base_url)
            .append_pair("path", path);
        self.get_optional(url).await
    }

    async fn tool_by_id(&self, tool_id: &str) -> Result<Option<ToolRecord>, StoreError> {
        let url = self.endpoint(&["tools", tool_id])?;
        self.get_optional(url).await
    }
}
