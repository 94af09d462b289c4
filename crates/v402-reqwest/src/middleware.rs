//! Middleware handling HTTP 402 Payment Required responses from a v402 gateway.
//!
//! [`V402Payments`] implements `reqwest_middleware::Middleware`. It sends the
//! original request untouched; on a 402 it parses the payment intent from the
//! body, runs the caller's checks, pays through the injected wallet, and
//! retries the request byte-identically with the `V402-Intent`, `V402-Tx` and
//! `V402-Request-Hash` proof headers attached. The request hash is computed
//! locally with the same canonicalization the gateway uses, so both sides
//! agree on it without any shared state.

use chrono::{DateTime, Utc};
use http::{Extensions, HeaderValue, StatusCode};
use reqwest::{Request, Response};
use reqwest_middleware as rqm;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

use v402_rs::canonical::{CanonicalRequest, canonicalize, request_hash};
use v402_rs::types::{HEADER_INTENT, HEADER_REQUEST_HASH, HEADER_TX, PaymentIntent};

use crate::wallet::{PayParams, PaymentApproval, WalletPay};

/// Errors raised while settling a 402 response.
///
/// [`V402PaymentsError::code`] collapses these into the four stable failure
/// codes callers branch on: `INVALID_INTENT`, `INTENT_EXPIRED`,
/// `PAYMENT_FAILED`, `RETRY_FAILED`.
#[derive(Debug, thiserror::Error)]
pub enum V402PaymentsError {
    /// The 402 body was not a usable payment intent.
    #[error("402 body is not a usable payment intent: {reason}")]
    InvalidIntent { reason: String },
    /// The intent's deadline had already passed when the 402 arrived.
    #[error("payment intent {intent_id} expired at {expires_at}")]
    IntentExpired {
        intent_id: String,
        expires_at: DateTime<Utc>,
    },
    /// The caller's pre-payment hook declined the charge. No money moved.
    #[error("payment for intent {intent_id} was vetoed before any funds moved")]
    PaymentVetoed { intent_id: String },
    /// The wallet failed to sign or submit the transaction.
    #[error("wallet payment failed for intent {intent_id}")]
    PaymentFailed {
        intent_id: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// The wallet did not finish within the configured payment timeout.
    /// The transaction may or may not have landed on chain.
    #[error("wallet payment for intent {intent_id} timed out after {after:?}")]
    PaymentTimeout { intent_id: String, after: Duration },
    /// The paid retry came back non-2xx. The payment already happened; the
    /// intent id can be used to retry with the same proof headers.
    #[error("paid retry for intent {intent_id} returned {status}: {body}")]
    RetryFailed {
        intent_id: String,
        status: StatusCode,
        body: String,
    },
    /// The original request could not be cloned for the paid retry, typically
    /// because its body is a stream. Detected before any payment is made.
    #[error("request object is not cloneable. Are you passing a streaming body?")]
    RequestNotCloneable,
    /// A proof value could not be encoded into an HTTP header.
    #[error("failed to encode payment proof header")]
    HeaderEncode(#[source] http::header::InvalidHeaderValue),
}

impl V402PaymentsError {
    /// Stable failure code for programmatic handling.
    pub fn code(&self) -> &'static str {
        match self {
            V402PaymentsError::InvalidIntent { .. } | V402PaymentsError::RequestNotCloneable => {
                "INVALID_INTENT"
            }
            V402PaymentsError::IntentExpired { .. } => "INTENT_EXPIRED",
            V402PaymentsError::PaymentVetoed { .. }
            | V402PaymentsError::PaymentFailed { .. }
            | V402PaymentsError::PaymentTimeout { .. } => "PAYMENT_FAILED",
            V402PaymentsError::RetryFailed { .. } | V402PaymentsError::HeaderEncode(_) => {
                "RETRY_FAILED"
            }
        }
    }
}

impl From<V402PaymentsError> for rqm::Error {
    fn from(error: V402PaymentsError) -> Self {
        rqm::Error::Middleware(error.into())
    }
}

/// Middleware that settles 402 responses through an injected wallet and
/// retries with proof headers.
#[derive(Clone)]
pub struct V402Payments {
    wallet: Arc<dyn WalletPay>,
    approval: Option<Arc<dyn PaymentApproval>>,
    pay_timeout: Option<Duration>,
}

impl V402Payments {
    /// Create a new middleware instance paying through the given wallet.
    pub fn with_wallet<W: WalletPay + 'static>(wallet: W) -> Self {
        Self {
            wallet: Arc::new(wallet),
            approval: None,
            pay_timeout: None,
        }
    }

    /// Install a pre-payment hook that can veto a charge before any funds move.
    pub fn approval<A: PaymentApproval + 'static>(&self, approval: A) -> Self {
        let mut this = self.clone();
        this.approval = Some(Arc::new(approval));
        this
    }

    /// Bound the wallet-pay step. A timeout surfaces as `PAYMENT_FAILED`.
    pub fn pay_timeout(&self, timeout: Duration) -> Self {
        let mut this = self.clone();
        this.pay_timeout = Some(timeout);
        this
    }

    async fn parse_intent(res: Response) -> Result<PaymentIntent, V402PaymentsError> {
        let intent: PaymentIntent =
            res.json()
                .await
                .map_err(|e| V402PaymentsError::InvalidIntent {
                    reason: e.to_string(),
                })?;
        if intent.intent_id.is_empty() || intent.reference.is_empty() {
            return Err(V402PaymentsError::InvalidIntent {
                reason: "intentId and reference are required".to_string(),
            });
        }
        Ok(intent)
    }

    async fn settle(&self, intent: &PaymentIntent) -> Result<String, V402PaymentsError> {
        if let Some(approval) = &self.approval {
            if !approval.approve(intent).await {
                return Err(V402PaymentsError::PaymentVetoed {
                    intent_id: intent.intent_id.clone(),
                });
            }
        }
        let pay = self.wallet.pay(PayParams::from_intent(intent));
        let outcome = match self.pay_timeout {
            Some(limit) => tokio::time::timeout(limit, pay).await.map_err(|_| {
                V402PaymentsError::PaymentTimeout {
                    intent_id: intent.intent_id.clone(),
                    after: limit,
                }
            })?,
            None => pay.await,
        };
        let paid = outcome.map_err(|source| V402PaymentsError::PaymentFailed {
            intent_id: intent.intent_id.clone(),
            source,
        })?;
        Ok(paid.tx_sig)
    }
}

/// Computes the canonical request hash the gateway will compute for this
/// request. Streaming bodies hash as empty; they are rejected before payment
/// anyway because they cannot be cloned for the retry.
fn proof_request_hash(req: &Request) -> String {
    let query: Vec<(String, String)> = req
        .url()
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let content_type = req
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let body = req
        .body()
        .and_then(|b| b.as_bytes())
        .map(String::from_utf8_lossy);
    let canonical = canonicalize(&CanonicalRequest {
        method: req.method().as_str(),
        path: req.url().path(),
        query: &query,
        body: body.as_deref(),
        content_type,
    });
    request_hash(&canonical)
}

fn header_value(value: &str) -> Result<HeaderValue, V402PaymentsError> {
    HeaderValue::from_str(value).map_err(V402PaymentsError::HeaderEncode)
}

#[async_trait::async_trait]
impl rqm::Middleware for V402Payments {
    /// Intercepts the response. If it's a 402, it pays the intent and retries
    /// the request with proof headers.
    #[instrument(name = "v402.handle", skip(self, req, extensions, next), fields(method = %req.method(), url = %req.url()))]
    async fn handle(
        &self,
        req: Request,
        extensions: &mut Extensions,
        next: rqm::Next<'_>,
    ) -> rqm::Result<Response> {
        let hash = proof_request_hash(&req);
        let retry_req = req.try_clone();

        let res = next.clone().run(req, extensions).await?;
        if res.status() != StatusCode::PAYMENT_REQUIRED {
            return Ok(res);
        }

        let intent = Self::parse_intent(res).await?;
        tracing::debug!(
            intent_id = %intent.intent_id,
            amount = %intent.amount,
            currency = %intent.currency,
            "Received 402 payment intent"
        );
        if intent.is_expired_at(Utc::now()) {
            return Err(V402PaymentsError::IntentExpired {
                intent_id: intent.intent_id,
                expires_at: intent.expires_at,
            }
            .into());
        }

        // Refuse up front rather than paying for a request we cannot re-send.
        let mut retry = retry_req.ok_or(V402PaymentsError::RequestNotCloneable)?;

        let tx_sig = self.settle(&intent).await?;
        tracing::debug!(intent_id = %intent.intent_id, tx_sig = %tx_sig, "Payment submitted, retrying");

        let headers = retry.headers_mut();
        headers.insert(HEADER_INTENT, header_value(&intent.intent_id)?);
        headers.insert(HEADER_TX, header_value(&tx_sig)?);
        headers.insert(HEADER_REQUEST_HASH, header_value(&hash)?);

        let res = next.run(retry, extensions).await?;
        if res.status().is_success() {
            return Ok(res);
        }
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        Err(V402PaymentsError::RetryFailed {
            intent_id: intent.intent_id,
            status,
            body,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::PayResult;

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use reqwest_middleware::ClientBuilder;
    use serde_json::json;
    use std::sync::Mutex;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RECIPIENT: &str = "So11111111111111111111111111111111111111112";
    const USDC_MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

    struct StubWallet {
        tx_sig: Option<&'static str>,
        seen: Arc<Mutex<Vec<PayParams>>>,
    }

    impl StubWallet {
        fn paying(tx_sig: &'static str) -> (Self, Arc<Mutex<Vec<PayParams>>>) {
            let seen = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    tx_sig: Some(tx_sig),
                    seen: Arc::clone(&seen),
                },
                seen,
            )
        }

        fn broke() -> Self {
            Self {
                tx_sig: None,
                seen: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl WalletPay for StubWallet {
        async fn pay(
            &self,
            params: PayParams,
        ) -> Result<PayResult, Box<dyn std::error::Error + Send + Sync>> {
            self.seen.lock().unwrap().push(params);
            match self.tx_sig {
                Some(tx_sig) => Ok(PayResult {
                    tx_sig: tx_sig.to_string(),
                }),
                None => Err("insufficient funds".into()),
            }
        }
    }

    struct SlowWallet;

    #[async_trait]
    impl WalletPay for SlowWallet {
        async fn pay(
            &self,
            _params: PayParams,
        ) -> Result<PayResult, Box<dyn std::error::Error + Send + Sync>> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(PayResult {
                tx_sig: "late".to_string(),
            })
        }
    }

    struct Deny;

    #[async_trait]
    impl PaymentApproval for Deny {
        async fn approve(&self, _intent: &PaymentIntent) -> bool {
            false
        }
    }

    fn intent_body(ttl: ChronoDuration) -> serde_json::Value {
        json!({
            "intentId": "int_abc",
            "toolId": "tool_weather",
            "amount": "0.10",
            "currency": "USDC",
            "chain": "solana",
            "recipient": RECIPIENT,
            "reference": "ref_xyz",
            "expiresAt": (Utc::now() + ttl).to_rfc3339(),
            "requestHash": "0".repeat(64),
            "mint": USDC_MINT,
        })
    }

    fn client(middleware: V402Payments) -> rqm::ClientWithMiddleware {
        ClientBuilder::new(reqwest::Client::new())
            .with(middleware)
            .build()
    }

    fn unwrap_client_error(err: rqm::Error) -> String {
        match err {
            rqm::Error::Middleware(inner) => {
                let e: &V402PaymentsError = inner
                    .downcast_ref()
                    .unwrap_or_else(|| panic!("not a payments error: {inner:?}"));
                e.code().to_string()
            }
            other => panic!("unexpected error kind: {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_402_responses_pass_through_unpaid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/free"))
            .respond_with(ResponseTemplate::new(200).set_body_string("no charge"))
            .mount(&server)
            .await;

        let (wallet, seen) = StubWallet::paying("sig");
        let client = client(V402Payments::with_wallet(wallet));
        let res = client
            .get(format!("{}/api/free", server.uri()))
            .send()
            .await
            .unwrap();

        assert_eq!(res.status(), 200);
        assert_eq!(res.text().await.unwrap(), "no charge");
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn pays_intent_and_retries_with_proof_headers() {
        let server = MockServer::start().await;
        // The retry carries the hash of "GET\n/api/tool\na=1&b=2\n\n".
        let expected_hash = request_hash(&canonicalize(&CanonicalRequest {
            method: "GET",
            path: "/api/tool",
            query: &[("b".to_string(), "2".to_string()), ("a".to_string(), "1".to_string())],
            body: None,
            content_type: None,
        }));
        Mock::given(method("GET"))
            .and(path("/api/tool"))
            .and(header(HEADER_INTENT, "int_abc"))
            .and(header(HEADER_TX, "tx_sig_1"))
            .and(header(HEADER_REQUEST_HASH, expected_hash.as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_string("forecast"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/tool"))
            .respond_with(
                ResponseTemplate::new(402).set_body_json(intent_body(ChronoDuration::minutes(10))),
            )
            .mount(&server)
            .await;

        let (wallet, seen) = StubWallet::paying("tx_sig_1");
        let client = client(V402Payments::with_wallet(wallet));
        let res = client
            .get(format!("{}/api/tool?b=2&a=1", server.uri()))
            .send()
            .await
            .unwrap();

        assert_eq!(res.status(), 200);
        assert_eq!(res.text().await.unwrap(), "forecast");
        let calls = seen.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].recipient, RECIPIENT);
        assert_eq!(calls[0].amount, "0.10");
        assert_eq!(calls[0].reference, "ref_xyz");
        assert_eq!(calls[0].mint.as_deref(), Some(USDC_MINT));
    }

    #[tokio::test]
    async fn unparseable_402_body_is_invalid_intent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(402).set_body_string("upgrade required"))
            .mount(&server)
            .await;

        let client = client(V402Payments::with_wallet(StubWallet::broke()));
        let err = client
            .get(format!("{}/api/tool", server.uri()))
            .send()
            .await
            .unwrap_err();
        assert_eq!(unwrap_client_error(err), "INVALID_INTENT");
    }

    #[tokio::test]
    async fn missing_reference_is_invalid_intent() {
        let server = MockServer::start().await;
        let mut body = intent_body(ChronoDuration::minutes(10));
        body["reference"] = json!("");
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(402).set_body_json(body))
            .mount(&server)
            .await;

        let client = client(V402Payments::with_wallet(StubWallet::broke()));
        let err = client
            .get(format!("{}/api/tool", server.uri()))
            .send()
            .await
            .unwrap_err();
        assert_eq!(unwrap_client_error(err), "INVALID_INTENT");
    }

    #[tokio::test]
    async fn expired_intent_is_not_paid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(402).set_body_json(intent_body(ChronoDuration::minutes(-5))),
            )
            .mount(&server)
            .await;

        let (wallet, seen) = StubWallet::paying("sig");
        let client = client(V402Payments::with_wallet(wallet));
        let err = client
            .get(format!("{}/api/tool", server.uri()))
            .send()
            .await
            .unwrap_err();
        assert_eq!(unwrap_client_error(err), "INTENT_EXPIRED");
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn veto_hook_blocks_payment() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(402).set_body_json(intent_body(ChronoDuration::minutes(10))),
            )
            .mount(&server)
            .await;

        let (wallet, seen) = StubWallet::paying("sig");
        let client = client(V402Payments::with_wallet(wallet).approval(Deny));
        let err = client
            .get(format!("{}/api/tool", server.uri()))
            .send()
            .await
            .unwrap_err();
        assert_eq!(unwrap_client_error(err), "PAYMENT_FAILED");
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn wallet_failure_is_payment_failed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(402).set_body_json(intent_body(ChronoDuration::minutes(10))),
            )
            .mount(&server)
            .await;

        let client = client(V402Payments::with_wallet(StubWallet::broke()));
        let err = client
            .get(format!("{}/api/tool", server.uri()))
            .send()
            .await
            .unwrap_err();
        assert_eq!(unwrap_client_error(err), "PAYMENT_FAILED");
    }

    #[tokio::test]
    async fn slow_wallet_hits_pay_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(402).set_body_json(intent_body(ChronoDuration::minutes(10))),
            )
            .mount(&server)
            .await;

        let middleware =
            V402Payments::with_wallet(SlowWallet).pay_timeout(Duration::from_millis(20));
        let err = client(middleware)
            .get(format!("{}/api/tool", server.uri()))
            .send()
            .await
            .unwrap_err();
        assert_eq!(unwrap_client_error(err), "PAYMENT_FAILED");
    }

    #[tokio::test]
    async fn non_2xx_retry_is_retry_failed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header_exists(HEADER_INTENT))
            .respond_with(ResponseTemplate::new(502).set_body_string("upstream died"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(402).set_body_json(intent_body(ChronoDuration::minutes(10))),
            )
            .mount(&server)
            .await;

        let (wallet, seen) = StubWallet::paying("tx_sig_1");
        let client = client(V402Payments::with_wallet(wallet));
        let err = client
            .get(format!("{}/api/tool", server.uri()))
            .send()
            .await
            .unwrap_err();
        assert_eq!(unwrap_client_error(err), "RETRY_FAILED");
        // The payment itself went through before the retry failed.
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
