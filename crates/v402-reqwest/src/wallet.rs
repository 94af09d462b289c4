//! Wallet capability the middleware pays with.
//!
//! The middleware never touches key material. Callers supply a [`WalletPay`]
//! implementation that signs and submits the Solana transaction itself, so the
//! private key stays wherever the caller keeps it (a local keypair, a hardware
//! wallet, a signing service).

use async_trait::async_trait;

use v402_rs::types::{Currency, PaymentIntent};

/// Everything the wallet needs to settle one intent.
///
/// `reference` must end up verbatim in the transaction memo as
/// `v402:<reference>`; the gateway matches on that memo when verifying.
#[derive(Debug, Clone, PartialEq)]
pub struct PayParams {
    pub recipient: String,
    pub amount: String,
    pub currency: Currency,
    pub reference: String,
    /// SPL token mint, present for USDC intents.
    pub mint: Option<String>,
}

impl PayParams {
    /// Extracts pay parameters from a 402 intent.
    pub fn from_intent(intent: &PaymentIntent) -> Self {
        PayParams {
            recipient: intent.recipient.to_string(),
            amount: intent.amount.to_string(),
            currency: intent.currency,
            reference: intent.reference.clone(),
            mint: intent.mint.map(|m| m.to_string()),
        }
    }
}

/// Outcome of a wallet payment: the submitted transaction signature.
#[derive(Debug, Clone, PartialEq)]
pub struct PayResult {
    pub tx_sig: String,
}

/// Signs and submits a payment transaction for an intent.
///
/// Implementations must confirm the transaction far enough that the gateway's
/// ledger lookup can see it before returning.
#[async_trait]
pub trait WalletPay: Send + Sync {
    async fn pay(
        &self,
        params: PayParams,
    ) -> Result<PayResult, Box<dyn std::error::Error + Send + Sync>>;
}

/// Pre-payment hook: inspects the intent before any money moves and may veto.
///
/// A veto surfaces to the caller as a payment failure carrying the intent id.
#[async_trait]
pub trait PaymentApproval: Send + Sync {
    async fn approve(&self, intent: &PaymentIntent) -> bool;
}
