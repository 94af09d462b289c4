//! Reqwest middleware for automatic v402 payment handling.
//!
//! This crate provides [`V402Payments`], a `reqwest_middleware::Middleware`
//! that turns `402 Payment Required` responses from a v402 gateway into paid,
//! receipted calls. When a request receives a 402, the middleware parses the
//! payment intent from the body, checks its expiry, pays it through a
//! caller-supplied [`WalletPay`] implementation, and retries the request
//! byte-identically with `V402-Intent`, `V402-Tx` and `V402-Request-Hash`
//! proof headers.
//!
//! The wallet is a capability, not a bundled signer: the middleware never
//! sees key material. Implement [`WalletPay`] over whatever holds the keys
//! and make sure the intent's `reference` lands in the transaction memo as
//! `v402:<reference>`.
//!
//! ## Quickstart
//!
//! ```rust,ignore
//! use v402_reqwest::V402Payments;
//! use reqwest_middleware::ClientBuilder;
//! use std::time::Duration;
//!
//! let client = ClientBuilder::new(reqwest::Client::new())
//!     .with(
//!         V402Payments::with_wallet(my_wallet)
//!             .pay_timeout(Duration::from_secs(60)),
//!     )
//!     .build();
//!
//! // 402 responses are paid and retried automatically.
//! let response = client
//!     .get("https://api.example.com/paid-tool")
//!     .send()
//!     .await?;
//! ```
//!
//! Failures carry one of four stable codes via [`V402PaymentsError::code`]:
//! `INVALID_INTENT`, `INTENT_EXPIRED`, `PAYMENT_FAILED`, `RETRY_FAILED`.

mod middleware;
mod wallet;

pub use middleware::*;
pub use wallet::*;
