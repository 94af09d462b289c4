//! Ledger-specific types and verification.
//!
//! Only the Solana chain family is implemented: v402 verifies transactions
//! that already landed on-chain, looked up by signature over JSON-RPC.

pub mod solana;

pub use solana::{Address, LedgerVerifier, SolanaRpc, SolanaVerifier, VerifyError};
