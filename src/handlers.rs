//! Axum transport binding.
//!
//! One catch-all route feeds every method and path into the protocol core;
//! the handler's only job is translating between HTTP and the
//! [`IncomingRequest`]/[`GatewayResponse`] pair, plus the error-to-status
//! mapping. A small `POST /v402/verify-receipt` endpoint lets anyone check a
//! receipt signature offline.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::gateway::{Gateway, GatewayError, GatewayResponse, IncomingRequest};
use crate::receipt::verify_receipt;
use crate::types::{ErrorResponse, HEADER_INTENT, HEADER_RECEIPT, Receipt};

pub fn routes() -> Router<Arc<Gateway>> {
    Router::new()
        .route("/v402/verify-receipt", post(post_verify_receipt))
        .fallback(proxy)
}

#[instrument(skip_all, fields(method = %method, path = %uri.path()))]
async fn proxy(
    State(gateway): State<Arc<Gateway>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = incoming_request(method, &uri, &headers, &body);
    match gateway.handle(request).await {
        Ok(GatewayResponse::PaymentRequired(intent)) => {
            let mut response =
                (StatusCode::PAYMENT_REQUIRED, Json(&intent)).into_response();
            if let Ok(value) = HeaderValue::from_str(&intent.intent_id) {
                response.headers_mut().insert(HEADER_INTENT, value);
            }
            response
        }
        Ok(GatewayResponse::Completed {
            status,
            headers,
            body,
            receipt,
            ..
        }) => completed_response(status, headers, body, &receipt),
        Err(error) => error_response(error),
    }
}

fn incoming_request(
    method: Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &Bytes,
) -> IncomingRequest {
    let query = uri
        .query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default();
    let header_map: HashMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();
    let content_type = header_map.get("content-type").cloned();
    IncomingRequest {
        method: method.to_string(),
        path: uri.path().to_string(),
        query,
        headers: header_map,
        body: String::from_utf8_lossy(body).into_owned(),
        content_type,
    }
}

fn completed_response(
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
    receipt: &Receipt,
) -> Response {
    let mut response = Response::new(body.into());
    *response.status_mut() =
        StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            header::HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    if let Ok(encoded) = serde_json::to_string(receipt) {
        if let Ok(value) = HeaderValue::from_str(&encoded) {
            response.headers_mut().insert(HEADER_RECEIPT, value);
        }
    }
    response
}

fn error_response(error: GatewayError) -> Response {
    let status = match &error {
        GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        GatewayError::Expired | GatewayError::VerificationFailed(_) => {
            StatusCode::PAYMENT_REQUIRED
        }
        GatewayError::Rpc(_) => StatusCode::SERVICE_UNAVAILABLE,
        GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
        GatewayError::PolicyDenied(_) => StatusCode::FORBIDDEN,
        GatewayError::UpstreamError(_) => StatusCode::BAD_GATEWAY,
        GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        GatewayError::SignatureInvalid(_)
        | GatewayError::Store(_)
        | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = ErrorResponse {
        error: error.to_string(),
        code: Some(error.code().to_string()),
    };
    let mut response = (status, Json(body)).into_response();
    if let GatewayError::RateLimited { retry_after } = error {
        if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    response
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyReceiptRequest {
    receipt: Receipt,
    /// Overrides the receipt's embedded `signerPubkey` when present.
    #[serde(default)]
    signer_pubkey: Option<String>,
}

#[derive(Debug, Serialize)]
struct VerifyReceiptResponse {
    valid: bool,
}

/// `POST /v402/verify-receipt`: offline signature check for a receipt.
#[instrument(skip_all)]
async fn post_verify_receipt(
    Json(body): Json<VerifyReceiptRequest>,
) -> impl IntoResponse {
    let pubkey = body
        .signer_pubkey
        .as_deref()
        .unwrap_or(&body.receipt.signer_pubkey);
    let valid = verify_receipt(&body.receipt, pubkey);
    (StatusCode::OK, Json(VerifyReceiptResponse { valid }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incoming_request_translation() {
        let uri: Uri = "/api/tool?b=2&a=1".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("Content-Type", HeaderValue::from_static("application/json"));
        headers.insert("V402-Intent", HeaderValue::from_static("int-1"));
        let body = Bytes::from_static(b"{\"x\":1}");
        let request = incoming_request(Method::POST, &uri, &headers, &body);

        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/api/tool");
        assert_eq!(request.query.len(), 2);
        assert_eq!(request.content_type.as_deref(), Some("application/json"));
        assert_eq!(request.header("v402-intent"), Some("int-1"));
        assert_eq!(request.header("V402-Intent"), Some("int-1"));
        assert_eq!(request.body, "{\"x\":1}");
    }

    #[test]
    fn test_error_mapping() {
        let response = error_response(GatewayError::PolicyDenied("cap".into()));
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = error_response(GatewayError::RateLimited { retry_after: 7 });
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            &HeaderValue::from_static("7")
        );

        let response = error_response(GatewayError::Expired);
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    }
}
