//! Core Rust implementation of the v402 protocol.
//!
//! v402 gates paid tool and API calls behind verified on-chain payments
//! using the HTTP `402 Payment Required` status code. A caller receives a
//! payment intent, pays on Solana with the intent's reference embedded in a
//! memo, and retries the call with proof headers; the gateway independently
//! verifies the transfer on-chain, forwards the request upstream exactly
//! once, and returns a signed receipt. No funds ever pass through the
//! gateway.
//!
//! # Modules
//!
//! - [`canonical`] — Deterministic request canonicalization and SHA-256
//!   hashing shared by clients and the gateway.
//! - [`amount`] — Decimal payment amounts and atomic-unit conversion.
//! - [`types`] — Wire types: [`types::PaymentIntent`], [`types::Receipt`],
//!   protocol headers.
//! - [`chain`] — Solana ledger verification: memo binding, SOL and USDC
//!   transfer checks, payer derivation.
//! - [`store`] — The [`store::Backend`] trait plus in-memory and remote
//!   implementations.
//! - [`policy`] — Server-side spending policy evaluation.
//! - [`receipt`] — Ed25519 receipt signing and verification.
//! - [`keys`] — At-rest encryption of merchant signing keys.
//! - [`tools`] — Tool registry: metadata signatures, path patterns, pricing.
//! - [`rate_limit`] — Intent-creation throttling.
//! - [`gateway`] — The request state machine tying everything together.
//! - [`config`] — Environment-backed server configuration.
//! - [`handlers`] — Axum transport binding.
//!
//! The client-side retry orchestrator lives in the `v402-reqwest` crate.

pub mod amount;
pub mod canonical;
pub mod chain;
pub mod config;
pub mod gateway;
pub mod handlers;
pub mod keys;
pub mod policy;
pub mod rate_limit;
pub mod receipt;
pub mod store;
pub mod tools;
pub mod types;
