//! The paid-request state machine.
//!
//! One inbound request flows through: canonicalize, replay lookup, on-chain
//! verification, policy evaluation, an atomic consume claim, upstream
//! forwarding, and receipt issuance. The handler holds no request-local
//! mutable state; every cross-request effect goes through the [`Backend`]
//! trait, so any number of gateway processes can serve the same store.
//!
//! At-most-once forwarding rests on two store primitives: the replay lookup
//! (a receipt for `(intentId, requestHash)` short-circuits everything) and
//! the compare-and-swap to `consumed`, taken before the upstream call. A
//! loser of that race re-reads the winner's receipt instead of forwarding.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::amount::Amount;
use crate::canonical::{CanonicalRequest, canonicalize, normalize_path, request_hash};
use crate::chain::solana::{Address, LedgerVerifier, VerifyError};
use crate::keys::{EncryptionKey, KeyError};
use crate::policy::{Charge, PolicyDecision, evaluate};
use crate::rate_limit::{RateLimitDecision, RateLimiter, rate_limit_key};
use crate::receipt::{ReceiptError, ReceiptSigner, response_hash};
use crate::store::{Backend, StoreError, StoredReceipt};
use crate::tools::{SessionPricing, ToolRecord, verify_tool_metadata};
use crate::types::{
    Chain, Currency, HEADER_INTENT, HEADER_REQUEST_HASH, HEADER_TX, IntentStatus, PaymentIntent,
    Receipt, SolanaNetwork, VerifiedPayment,
};

/// Transport-independent view of an inbound request. Header names are
/// lowercased by the adapter; `body` is UTF-8 text, lossily decoded for
/// binary payloads.
#[derive(Debug, Clone, Default)]
pub struct IncomingRequest {
    pub method: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HashMap<String, String>,
    pub body: String,
    pub content_type: Option<String>,
}

impl IncomingRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// What the transport layer sends back to the caller.
#[derive(Debug, Clone)]
pub enum GatewayResponse {
    /// HTTP 402 with the intent as the body.
    PaymentRequired(PaymentIntent),
    /// The upstream response, forwarded or replayed, with its receipt.
    Completed {
        status: u16,
        headers: Vec<(String, String)>,
        body: String,
        receipt: Receipt,
        replayed: bool,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("intent expired")]
    Expired,
    #[error("ledger rpc error: {0}")]
    Rpc(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("payment verification failed: {0}")]
    VerificationFailed(VerifyError),
    #[error("policy denied: {0}")]
    PolicyDenied(String),
    #[error("signature invalid: {0}")]
    SignatureInvalid(String),
    #[error("upstream error: {0}")]
    UpstreamError(String),
    #[error("rate limited, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable machine-readable code carried in error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_) => "INVALID_REQUEST",
            GatewayError::Expired => "EXPIRED",
            GatewayError::Rpc(_) => "RPC_ERROR",
            GatewayError::NotFound(_) => "NOT_FOUND",
            GatewayError::VerificationFailed(_) => "VERIFICATION_FAILED",
            GatewayError::PolicyDenied(_) => "POLICY_DENIED",
            GatewayError::SignatureInvalid(_) => "SIGNATURE_INVALID",
            GatewayError::UpstreamError(_) => "UPSTREAM_ERROR",
            GatewayError::RateLimited { .. } => "RATE_LIMITED",
            GatewayError::Store(_) => "STORE_ERROR",
            GatewayError::Internal(_) => "INTERNAL",
        }
    }
}

impl From<VerifyError> for GatewayError {
    fn from(err: VerifyError) -> Self {
        match err {
            VerifyError::Rpc(message) => GatewayError::Rpc(message),
            VerifyError::NotFound => GatewayError::NotFound("transaction"),
            VerifyError::Expired => GatewayError::Expired,
            other => GatewayError::VerificationFailed(other),
        }
    }
}

impl From<ReceiptError> for GatewayError {
    fn from(err: ReceiptError) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

impl From<KeyError> for GatewayError {
    fn from(err: KeyError) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

/// Captured upstream response, headers already filtered of hop-by-hop noise.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

/// Forwards a verified request to the tool's origin.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn forward(
        &self,
        tool: &ToolRecord,
        request: &IncomingRequest,
    ) -> Result<UpstreamResponse, GatewayError>;
}

const HOP_BY_HOP: &[&str] = &["connection", "transfer-encoding", "content-length", "keep-alive"];

pub struct HttpUpstream {
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpUpstream {
    pub fn new(http: reqwest::Client, timeout: Duration) -> Self {
        Self { http, timeout }
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn forward(
        &self,
        tool: &ToolRecord,
        request: &IncomingRequest,
    ) -> Result<UpstreamResponse, GatewayError> {
        let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| GatewayError::InvalidRequest(format!("bad method {}", request.method)))?;
        let url = format!(
            "{}{}",
            tool.base_url.trim_end_matches('/'),
            normalize_path(&request.path)
        );

        let mut builder = self.http.request(method, &url).timeout(self.timeout);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(content_type) = &request.content_type {
            builder = builder.header("content-type", content_type);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamError(e.to_string()))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter(|(name, _)| !HOP_BY_HOP.contains(&name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::UpstreamError(e.to_string()))?;
        Ok(UpstreamResponse { status, headers, body })
    }
}

/// Tunables of a gateway instance.
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    /// Lifetime of fresh intents. Default 15 minutes.
    pub intent_ttl: chrono::Duration,
    /// Upper bound on one ledger verification, wallclock.
    pub verify_timeout: Duration,
    pub usdc_mint: Address,
    pub network: Option<SolanaNetwork>,
}

pub struct Gateway {
    backend: Arc<dyn Backend>,
    verifier: Arc<dyn LedgerVerifier>,
    upstream: Arc<dyn Upstream>,
    rate_limiter: Arc<RateLimiter>,
    encryption_key: EncryptionKey,
    options: GatewayOptions,
}

enum PaidOutcome {
    Response(GatewayResponse),
    /// Proof did not buy this call (exhausted session); charge afresh.
    FallThrough,
}

impl Gateway {
    pub fn new(
        backend: Arc<dyn Backend>,
        verifier: Arc<dyn LedgerVerifier>,
        upstream: Arc<dyn Upstream>,
        rate_limiter: Arc<RateLimiter>,
        encryption_key: EncryptionKey,
        options: GatewayOptions,
    ) -> Self {
        Self {
            backend,
            verifier,
            upstream,
            rate_limiter,
            encryption_key,
            options,
        }
    }

    #[instrument(skip_all, fields(method = %request.method, path = %request.path))]
    pub async fn handle(&self, request: IncomingRequest) -> Result<GatewayResponse, GatewayError> {
        let canonical = canonicalize(&CanonicalRequest {
            method: &request.method,
            path: &request.path,
            query: &request.query,
            body: (!request.body.is_empty()).then_some(request.body.as_str()),
            content_type: request.content_type.as_deref(),
        });
        let hash = request_hash(&canonical);

        let proof = (
            request.header(HEADER_INTENT),
            request.header(HEADER_TX),
            request.header(HEADER_REQUEST_HASH),
        );
        if let (Some(intent_id), Some(tx_sig), Some(hash_header)) = proof {
            if hash_header == hash {
                let intent_id = intent_id.to_string();
                let tx_sig = tx_sig.to_string();
                match self.handle_paid(&request, &intent_id, &tx_sig, &hash).await? {
                    PaidOutcome::Response(response) => return Ok(response),
                    PaidOutcome::FallThrough => {}
                }
            }
        }
        self.handle_unpaid(&request, &hash).await
    }

    /// Proof headers present and bound to this exact request.
    async fn handle_paid(
        &self,
        request: &IncomingRequest,
        intent_id: &str,
        tx_sig: &str,
        hash: &str,
    ) -> Result<PaidOutcome, GatewayError> {
        // Replay wins over everything, including expiry: a consumed call must
        // stay observable byte-for-byte.
        if let Some(stored) = self.backend.find_receipt(intent_id, hash).await? {
            info!(intent_id, "replaying stored response");
            return Ok(PaidOutcome::Response(replayed_response(stored)));
        }

        let record = self
            .backend
            .find_intent(intent_id)
            .await?
            .ok_or(GatewayError::NotFound("intent"))?;
        let intent = record.intent.clone();
        let now = Utc::now();

        // Session continuation: payment already verified, a new distinct
        // request under the same session.
        if intent.is_session()
            && record.status == IntentStatus::PaidVerified
            && hash != intent.request_hash
        {
            if intent.is_expired_at(now) {
                return Err(GatewayError::Expired);
            }
            let payer = intent
                .payer
                .ok_or_else(|| GatewayError::Internal("verified session has no payer".into()))?;
            let tool = self
                .backend
                .tool_by_id(&intent.tool_id)
                .await?
                .ok_or(GatewayError::NotFound("tool"))?;
            self.enforce_policy(&payer.to_string(), &intent, &tool).await?;
            if !self.backend.claim_session_call(intent_id).await? {
                info!(intent_id, "session exhausted, charging afresh");
                return Ok(PaidOutcome::FallThrough);
            }
            let response = self
                .forward_and_receipt(request, &intent, &tool, tx_sig, &payer.to_string(), hash, None)
                .await?;
            return Ok(PaidOutcome::Response(response));
        }

        if record.status == IntentStatus::Consumed {
            // The replay lookup found no receipt, so either the hash differs
            // from the consumed one or a concurrent winner is still writing.
            return Err(GatewayError::InvalidRequest("intent already consumed".into()));
        }
        if intent.is_expired_at(now) {
            return Err(GatewayError::Expired);
        }
        if hash != intent.request_hash {
            return Err(GatewayError::InvalidRequest(
                "request does not match the intent it pays for".into(),
            ));
        }

        let verified = tokio::time::timeout(
            self.options.verify_timeout,
            self.verifier.verify(tx_sig, &intent),
        )
        .await
        .map_err(|_| GatewayError::Rpc("ledger verification timed out".into()))??;

        let tool = self
            .backend
            .tool_by_id(&intent.tool_id)
            .await?
            .ok_or(GatewayError::NotFound("tool"))?;
        let payer = verified.payer.to_string();
        self.enforce_policy(&payer, &intent, &tool).await?;

        // The intent advances to paid_verified only once verification AND
        // policy both pass, and the spend increment rides on winning that
        // transition. A denied payment stays created and retryable; a retried
        // or concurrent duplicate proof loses the transition and cannot count
        // the spend twice.
        let first_verification = self
            .backend
            .mark_paid_verified(intent_id, &verified.payer, tx_sig)
            .await?;
        if first_verification {
            self.backend
                .add_daily_spend(&payer, now.date_naive(), intent.amount.as_decimal())
                .await?;
        }

        if intent.is_session() {
            if !self.backend.claim_session_call(intent_id).await? {
                return Ok(PaidOutcome::FallThrough);
            }
        } else if !self.backend.begin_consume(intent_id).await? {
            // Lost the consume race; the winner's receipt settles it.
            if let Some(stored) = self.backend.find_receipt(intent_id, hash).await? {
                return Ok(PaidOutcome::Response(replayed_response(stored)));
            }
            return Err(GatewayError::InvalidRequest("intent already consumed".into()));
        }

        let response = self
            .forward_and_receipt(request, &intent, &tool, tx_sig, &payer, hash, Some(&verified))
            .await?;
        Ok(PaidOutcome::Response(response))
    }

    async fn enforce_policy(
        &self,
        payer: &str,
        intent: &PaymentIntent,
        tool: &ToolRecord,
    ) -> Result<(), GatewayError> {
        let Some(policy) = self.backend.policy_for(payer).await? else {
            return Ok(());
        };
        let daily_spend = self
            .backend
            .daily_spend(payer, Utc::now().date_naive())
            .await?;
        let decision = evaluate(
            &policy,
            &Charge {
                amount: intent.amount,
                tool_id: &tool.tool_id,
                merchant_wallet: &tool.merchant_wallet,
                daily_spend,
            },
        );
        match decision {
            PolicyDecision::Allowed => Ok(()),
            PolicyDecision::Denied { reason } => {
                warn!(payer, %reason, "payment rejected by spending policy");
                Err(GatewayError::PolicyDenied(reason))
            }
        }
    }

    /// Forwards upstream and issues the receipt. The caller has already won
    /// the consume claim; any error past the upstream call is surfaced, never
    /// swallowed, because the side effect happened.
    async fn forward_and_receipt(
        &self,
        request: &IncomingRequest,
        intent: &PaymentIntent,
        tool: &ToolRecord,
        tx_sig: &str,
        payer: &str,
        hash: &str,
        verified: Option<&VerifiedPayment>,
    ) -> Result<GatewayResponse, GatewayError> {
        let upstream = self.upstream.forward(tool, request).await?;
        let headers_value = headers_to_value(&upstream.headers);

        let mut receipt = Receipt {
            receipt_id: Uuid::new_v4().to_string(),
            intent_id: intent.intent_id.clone(),
            tool_id: tool.tool_id.clone(),
            request_hash: hash.to_string(),
            response_hash: response_hash(upstream.status, &headers_value, &upstream.body),
            tx_sig: tx_sig.to_string(),
            payer: payer.to_string(),
            merchant: tool.merchant_wallet.clone(),
            timestamp: Utc::now(),
            signature: String::new(),
            signer_pubkey: tool.signing_public_key.clone(),
            version: Some(2),
            amount: Some(intent.amount),
            currency: Some(intent.currency),
            block_height: verified.and_then(|v| v.slot),
        };

        // The merchant key exists in plaintext only for the span of this sign.
        let key_material = self
            .encryption_key
            .decrypt(&tool.signing_private_key_encrypted)?;
        let signer = ReceiptSigner::from_decrypted(&key_material)?;
        receipt.signature = signer.sign(&receipt);

        let stored = StoredReceipt {
            receipt: receipt.clone(),
            response_status: upstream.status,
            response_headers: headers_value,
            response_body: upstream.body.clone(),
        };
        if let Err(err) = self.backend.store_receipt(&stored).await {
            error!(
                intent_id = %intent.intent_id,
                error = %err,
                "upstream call forwarded but receipt storage failed"
            );
            return Err(err.into());
        }
        info!(
            intent_id = %intent.intent_id,
            receipt_id = %receipt.receipt_id,
            status = upstream.status,
            "paid call forwarded and receipted"
        );
        Ok(GatewayResponse::Completed {
            status: upstream.status,
            headers: upstream.headers,
            body: upstream.body,
            receipt,
            replayed: false,
        })
    }

    /// No usable proof: price the call and answer 402 with a fresh intent.
    async fn handle_unpaid(
        &self,
        request: &IncomingRequest,
        hash: &str,
    ) -> Result<GatewayResponse, GatewayError> {
        let key = rate_limit_key(|name| request.header(name).map(str::to_string));
        if let RateLimitDecision::Limited { retry_after } = self.rate_limiter.check(&key) {
            warn!(key, retry_after, "intent creation rate limited");
            return Err(GatewayError::RateLimited { retry_after });
        }

        let base_url = resolve_base_url(request);
        let path = normalize_path(&request.path);
        let tool = self
            .backend
            .find_tool(&base_url, &path)
            .await?
            .ok_or(GatewayError::NotFound("tool"))?;
        if !verify_tool_metadata(&tool) {
            warn!(tool_id = %tool.tool_id, "tool metadata signature rejected");
            return Err(GatewayError::SignatureInvalid(
                "tool metadata signature does not verify".into(),
            ));
        }

        let (amount, session) = price_for(&tool, request)?;
        let recipient: Address = tool.merchant_wallet.parse().map_err(|_| {
            GatewayError::Internal(format!(
                "merchant wallet of tool {} is not a valid address",
                tool.tool_id
            ))
        })?;
        let now = Utc::now();
        let intent = PaymentIntent {
            intent_id: Uuid::new_v4().to_string(),
            tool_id: tool.tool_id.clone(),
            amount,
            currency: tool.accepted_currency,
            chain: Chain::Solana,
            recipient,
            reference: Uuid::new_v4().to_string(),
            expires_at: now + self.options.intent_ttl,
            request_hash: hash.to_string(),
            payer: None,
            mint: (tool.accepted_currency == Currency::Usdc).then_some(self.options.usdc_mint),
            network: self.options.network,
            tool_params_hash: None,
            session_id: session.as_ref().map(|_| Uuid::new_v4().to_string()),
            max_calls: session.as_ref().map(|s| s.max_calls),
            calls_used: session.as_ref().map(|_| 0),
            spending_account: None,
        };
        self.backend.create_intent(&intent).await?;
        info!(
            intent_id = %intent.intent_id,
            tool_id = %tool.tool_id,
            amount = %intent.amount,
            currency = %intent.currency,
            session = intent.is_session(),
            "issued payment intent"
        );
        Ok(GatewayResponse::PaymentRequired(intent))
    }
}

/// Picks the price: a caller opts into session pricing with the
/// `V402-Session` header; tools priced only per session always get one.
fn price_for(
    tool: &ToolRecord,
    request: &IncomingRequest,
) -> Result<(Amount, Option<SessionPricing>), GatewayError> {
    let wants_session = request.header("v402-session").is_some();
    match (&tool.pricing_model.per_call, &tool.pricing_model.per_session) {
        (_, Some(session)) if wants_session => Ok((session.amount, Some(session.clone()))),
        (Some(per_call), _) => Ok((*per_call, None)),
        (None, Some(session)) => Ok((session.amount, Some(session.clone()))),
        (None, None) => Err(GatewayError::Internal(format!(
            "tool {} has no pricing model",
            tool.tool_id
        ))),
    }
}

/// Public base URL of this deployment, for tool lookup behind proxies.
fn resolve_base_url(request: &IncomingRequest) -> String {
    if let Some(host) = request.header("x-forwarded-host") {
        let proto = request.header("x-forwarded-proto").unwrap_or("https");
        return format!("{proto}://{host}");
    }
    request.header("origin").unwrap_or_default().to_string()
}

fn replayed_response(stored: StoredReceipt) -> GatewayResponse {
    GatewayResponse::Completed {
        status: stored.response_status,
        headers: value_to_headers(&stored.response_headers),
        body: stored.response_body,
        receipt: stored.receipt,
        replayed: true,
    }
}

fn headers_to_value(headers: &[(String, String)]) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (name, value) in headers {
        map.insert(name.to_ascii_lowercase(), json!(value));
    }
    serde_json::Value::Object(map)
}

fn value_to_headers(value: &serde_json::Value) -> Vec<(String, String)> {
    value
        .as_object()
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}
