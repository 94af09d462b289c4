//! v402 gateway HTTP entrypoint.
//!
//! Launches an Axum server that prices inbound requests, verifies Solana
//! payments, forwards paid calls to their registered upstream tools, and
//! issues signed receipts.
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `HOST`, `PORT` control the bind address
//! - `SOLANA_RPC_URL`, `SOLANA_COMMITMENT`, `USDC_MINT` configure ledger
//!   verification
//! - `ENCRYPTION_KEY` unlocks merchant signing keys
//! - `V402_STORE_URL` + `V402_API_KEY` select the hosted store; without them
//!   the gateway runs on the in-process store
//! - `RUST_LOG` controls log filtering

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::Method;
use clap::Parser;
use dotenvy::dotenv;
use tower_http::cors;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use v402_rs::chain::solana::{SolanaRpc, SolanaVerifier};
use v402_rs::config::Config;
use v402_rs::gateway::{Gateway, GatewayOptions, HttpUpstream};
use v402_rs::handlers;
use v402_rs::keys::EncryptionKey;
use v402_rs::rate_limit::RateLimiter;
use v402_rs::store::{Backend, MemoryBackend, RemoteBackend};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    let encryption_key = EncryptionKey::from_hex(&config.encryption_key)?;

    let http = reqwest::Client::new();
    let rpc = SolanaRpc::new(
        config.solana_rpc_url.clone(),
        config.commitment,
        config.verify_timeout(),
    )?;
    let verifier = Arc::new(SolanaVerifier::new(rpc, config.usdc_mint));

    let backend: Arc<dyn Backend> = match (&config.store_url, &config.store_api_key) {
        (Some(url), Some(api_key)) => {
            tracing::info!(store = %url, "using remote store");
            Arc::new(RemoteBackend::new(http.clone(), url.clone(), api_key.as_str()))
        }
        _ => {
            tracing::warn!("no remote store configured, state will not survive restarts");
            Arc::new(MemoryBackend::new())
        }
    };

    let rate_limiter = Arc::new(RateLimiter::new(
        config.intent_rate_limit,
        config.intent_rate_window(),
    ));
    rate_limiter.start_sweeper();

    let gateway = Arc::new(Gateway::new(
        backend,
        verifier,
        Arc::new(HttpUpstream::new(http, config.upstream_timeout())),
        rate_limiter.clone(),
        encryption_key,
        GatewayOptions {
            intent_ttl: config.intent_ttl(),
            verify_timeout: config.verify_timeout(),
            usdc_mint: config.usdc_mint,
            network: config.network,
        },
    ));

    let app = handlers::routes()
        .with_state(gateway)
        .layer(TraceLayer::new_for_http())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
                .allow_headers(cors::Any),
        );

    let addr = SocketAddr::new(config.host, config.port);
    tracing::info!("Starting server at http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    rate_limiter.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
