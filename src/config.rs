//! Gateway configuration.
//!
//! Every setting is a CLI flag backed by an environment variable, so the
//! binary runs from a `.env` file in development and plain environment in
//! production. Validation happens at parse time through the typed fields;
//! a bad address or URL aborts startup instead of failing a request later.

use std::net::IpAddr;
use std::time::Duration;

use clap::Parser;
use url::Url;

use crate::chain::solana::{Address, Commitment};
use crate::types::SolanaNetwork;

pub const USDC_MAINNET_MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

#[derive(Parser, Debug, Clone)]
#[command(name = "v402-rs")]
#[command(about = "v402 payment gateway HTTP server")]
pub struct Config {
    /// Address to bind.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    #[arg(long, env = "PORT", default_value_t = 8402)]
    pub port: u16,

    /// Solana JSON-RPC endpoint used for payment verification.
    #[arg(
        long,
        env = "SOLANA_RPC_URL",
        default_value = "https://api.mainnet-beta.solana.com"
    )]
    pub solana_rpc_url: Url,

    /// Commitment level for transaction lookups.
    #[arg(long, env = "SOLANA_COMMITMENT", default_value = "confirmed")]
    pub commitment: Commitment,

    /// Mint accepted for USDC-priced tools.
    #[arg(long, env = "USDC_MINT", default_value = USDC_MAINNET_MINT)]
    pub usdc_mint: Address,

    /// Cluster advertised on issued intents.
    #[arg(long, env = "SOLANA_NETWORK")]
    pub network: Option<SolanaNetwork>,

    /// 64-character hex AES-256-GCM key protecting merchant signing keys.
    #[arg(long, env = "ENCRYPTION_KEY", hide_env_values = true)]
    pub encryption_key: String,

    /// Lifetime of issued intents, seconds.
    #[arg(long, env = "INTENT_TTL_SECS", default_value_t = 900)]
    pub intent_ttl_secs: i64,

    /// Upper bound on one ledger verification, seconds.
    #[arg(long, env = "VERIFY_TIMEOUT_SECS", default_value_t = 15)]
    pub verify_timeout_secs: u64,

    /// Upper bound on one upstream forward, seconds.
    #[arg(long, env = "UPSTREAM_TIMEOUT_SECS", default_value_t = 30)]
    pub upstream_timeout_secs: u64,

    /// Intent creations allowed per caller key per window.
    #[arg(long, env = "INTENT_RATE_LIMIT", default_value_t = 60)]
    pub intent_rate_limit: u32,

    #[arg(long, env = "INTENT_RATE_WINDOW_SECS", default_value_t = 60)]
    pub intent_rate_window_secs: u64,

    /// Hosted store URL. Together with the API key this selects the remote
    /// backend; without it the gateway runs on the in-process store.
    #[arg(long, env = "V402_STORE_URL")]
    pub store_url: Option<Url>,

    #[arg(long, env = "V402_API_KEY", hide_env_values = true)]
    pub store_api_key: Option<String>,
}

impl Config {
    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    pub fn intent_rate_window(&self) -> Duration {
        Duration::from_secs(self.intent_rate_window_secs)
    }

    pub fn intent_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.intent_ttl_secs)
    }
}
