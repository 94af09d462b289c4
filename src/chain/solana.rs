//! Solana ledger verification.
//!
//! The gateway never trusts client-supplied payment metadata: given a
//! transaction signature and a [`PaymentIntent`], the verifier fetches the
//! transaction in `jsonParsed` form from the configured RPC endpoint and
//! checks memo, execution result, expiry, amount, and recipient on chain
//! state. The paying address is always derived from the transaction itself
//! (fee payer for SOL, source token-account owner for USDC), which is the
//! core non-custodial trust property of the protocol.

use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use once_cell::sync::Lazy;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Value, json};
use solana_pubkey::Pubkey;
use url::Url;

use crate::types::{Currency, MEMO_PREFIX, PaymentIntent, VerifiedPayment};

/// Memo program (same id on mainnet and devnet).
pub const MEMO_PROGRAM_ID: &str = "MemoSq4gqABAXKb96qnH8TysNcWxMyWCqXgDLGmfcHr";
/// System program, carrier of native SOL transfers.
pub const SYSTEM_PROGRAM_ID: &str = "11111111111111111111111111111111";
/// Classic SPL Token program.
pub const TOKEN_PROGRAM_ID: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";
/// Token-2022 program; shares the jsonParsed transfer layout with the classic program.
pub const TOKEN_2022_PROGRAM_ID: &str = "TokenzQdBNbLqP5VEhdkAS6EPFLC1PHnBqCXEpPxuEb";

static ATA_PROGRAM: Lazy<Pubkey> = Lazy::new(|| {
    Pubkey::from_str("ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL").expect("valid program id")
});

/// A Solana account address, base58 on the wire.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct Address(Pubkey);

impl Address {
    pub const fn new(pubkey: Pubkey) -> Self {
        Self(pubkey)
    }

    pub fn pubkey(&self) -> &Pubkey {
        &self.0
    }

    /// Derives the associated token account of `self` for the given mint and
    /// token program.
    pub fn associated_token_account(&self, token_program: &Pubkey, mint: &Address) -> Address {
        let (ata, _) = Pubkey::find_program_address(
            &[self.0.as_ref(), token_program.as_ref(), mint.0.as_ref()],
            &ATA_PROGRAM,
        );
        Address(ata)
    }
}

impl From<Pubkey> for Address {
    fn from(pubkey: Pubkey) -> Self {
        Self(pubkey)
    }
}

impl AsRef<[u8]> for Address {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let pubkey = Pubkey::from_str(s).map_err(|_| AddressParseError(s.to_string()))?;
        Ok(Self(pubkey))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid Solana address: {0}")]
pub struct AddressParseError(String);

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Commitment level for RPC lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Commitment {
    Processed,
    #[default]
    Confirmed,
    Finalized,
}

impl FromStr for Commitment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processed" => Ok(Commitment::Processed),
            "confirmed" => Ok(Commitment::Confirmed),
            "finalized" => Ok(Commitment::Finalized),
            other => Err(format!("Unknown commitment level: {other}")),
        }
    }
}

impl Display for Commitment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Commitment::Processed => f.write_str("processed"),
            Commitment::Confirmed => f.write_str("confirmed"),
            Commitment::Finalized => f.write_str("finalized"),
        }
    }
}

/// Why a payment proof was rejected.
///
/// [`VerifyError::Rpc`] is transient (the proof may still be good); every
/// other variant is final for the presented transaction — the caller needs a
/// new intent or a new on-chain payment.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("Ledger RPC error: {0}")]
    Rpc(String),
    #[error("Transaction not found or not confirmed")]
    NotFound,
    #[error("Transaction is after intent expiry")]
    Expired,
    #[error("Transaction failed on-chain")]
    TxFailed,
    #[error("Missing memo instruction {MEMO_PREFIX}{0}")]
    MemoMissing(String),
    #[error("Transfer to intent recipient not found")]
    TransferNotFound,
    #[error("Transfer amount below required atomic units")]
    AmountTooLow,
    #[error("Derived payer does not match intent payer")]
    PayerMismatch,
    #[error(transparent)]
    Amount(#[from] crate::amount::AmountParseError),
}

impl VerifyError {
    /// Stable machine-readable code surfaced to callers.
    pub fn code(&self) -> &'static str {
        match self {
            VerifyError::Rpc(_) => "RPC_ERROR",
            VerifyError::NotFound => "NOT_FOUND",
            VerifyError::Expired => "EXPIRED",
            VerifyError::TxFailed => "TX_FAILED",
            VerifyError::MemoMissing(_) => "MEMO_MISSING",
            VerifyError::TransferNotFound => "TRANSFER_NOT_FOUND",
            VerifyError::AmountTooLow => "AMOUNT_TOO_LOW",
            VerifyError::PayerMismatch => "PAYER_MISMATCH",
            VerifyError::Amount(_) => "INVALID_AMOUNT",
        }
    }

    /// Transient errors may be retried with the same proof; final ones not.
    pub fn is_transient(&self) -> bool {
        matches!(self, VerifyError::Rpc(_))
    }
}

// ---------------------------------------------------------------------------
// jsonParsed transaction model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RpcTransaction {
    pub transaction: RpcTransactionInner,
    #[serde(rename = "blockTime")]
    pub block_time: Option<i64>,
    pub slot: Option<u64>,
    pub meta: Option<RpcTransactionMeta>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcTransactionInner {
    pub message: RpcMessage,
    #[serde(default)]
    pub signatures: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcMessage {
    #[serde(rename = "accountKeys", default)]
    pub account_keys: Vec<RpcAccountKey>,
    #[serde(default)]
    pub instructions: Vec<RpcInstruction>,
}

/// Account keys arrive as bare strings or `{ "pubkey": ... }` objects
/// depending on RPC provider and encoding.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RpcAccountKey {
    Plain(String),
    Keyed { pubkey: String },
}

impl RpcAccountKey {
    pub fn pubkey(&self) -> &str {
        match self {
            RpcAccountKey::Plain(s) => s,
            RpcAccountKey::Keyed { pubkey } => pubkey,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcTransactionMeta {
    pub err: Option<Value>,
    #[serde(rename = "innerInstructions", default)]
    pub inner_instructions: Vec<RpcInnerInstructions>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcInnerInstructions {
    #[serde(default)]
    pub instructions: Vec<RpcInstruction>,
}

/// One instruction in `jsonParsed` form. Instructions the RPC node could not
/// parse keep a base58/base64 `data` field instead of `parsed`.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcInstruction {
    #[serde(rename = "programId")]
    pub program_id: Option<String>,
    pub program: Option<String>,
    pub parsed: Option<Value>,
    pub data: Option<String>,
}

impl RpcInstruction {
    fn program_id(&self) -> Option<&str> {
        self.program_id.as_deref().or(self.program.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ParsedInstruction {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    info: Value,
}

// ---------------------------------------------------------------------------
// RPC client
// ---------------------------------------------------------------------------

/// Thin JSON-RPC client for the two lookups verification needs:
/// `getTransaction` and `getAccountInfo`.
#[derive(Clone)]
pub struct SolanaRpc {
    http: reqwest::Client,
    url: Url,
    commitment: Commitment,
}

impl Debug for SolanaRpc {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SolanaRpc")
            .field("url", &self.url.as_str())
            .field("commitment", &self.commitment)
            .finish()
    }
}

impl SolanaRpc {
    pub fn new(url: Url, commitment: Commitment, timeout: Duration) -> Result<Self, VerifyError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VerifyError::Rpc(e.to_string()))?;
        Ok(Self {
            http,
            url,
            commitment,
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, VerifyError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": "v402-verify",
            "method": method,
            "params": params,
        });
        let response = self
            .http
            .post(self.url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| VerifyError::Rpc(e.to_string()))?;
        let payload: Value = response
            .json()
            .await
            .map_err(|e| VerifyError::Rpc(e.to_string()))?;
        if let Some(error) = payload.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            return Err(VerifyError::Rpc(message.to_string()));
        }
        Ok(payload.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Fetches a transaction by signature in `jsonParsed` encoding.
    /// `Ok(None)` means absent or not yet at the configured commitment.
    pub async fn get_transaction(&self, tx_sig: &str) -> Result<Option<RpcTransaction>, VerifyError> {
        let result = self
            .call(
                "getTransaction",
                json!([tx_sig, {
                    "encoding": "jsonParsed",
                    "maxSupportedTransactionVersion": 0,
                    "commitment": self.commitment,
                }]),
            )
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        let tx: RpcTransaction =
            serde_json::from_value(result).map_err(|e| VerifyError::Rpc(e.to_string()))?;
        Ok(Some(tx))
    }

    /// Returns `(owner, mint)` of a token account, if the account exists and
    /// parses as one.
    pub async fn get_token_account(
        &self,
        address: &Address,
    ) -> Result<Option<(Address, Address)>, VerifyError> {
        let result = self
            .call(
                "getAccountInfo",
                json!([address.to_string(), {
                    "encoding": "jsonParsed",
                    "commitment": self.commitment,
                }]),
            )
            .await?;
        let info = &result["value"]["data"]["parsed"]["info"];
        let owner = info.get("owner").and_then(Value::as_str);
        let mint = info.get("mint").and_then(Value::as_str);
        match (owner, mint) {
            (Some(owner), Some(mint)) => {
                let owner = Address::from_str(owner).map_err(|e| VerifyError::Rpc(e.to_string()))?;
                let mint = Address::from_str(mint).map_err(|e| VerifyError::Rpc(e.to_string()))?;
                Ok(Some((owner, mint)))
            }
            _ => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Seam between the gateway flow and the ledger. The flow only needs one
/// operation; tests substitute a stub.
#[async_trait]
pub trait LedgerVerifier: Send + Sync {
    async fn verify(
        &self,
        tx_sig: &str,
        intent: &PaymentIntent,
    ) -> Result<VerifiedPayment, VerifyError>;
}

/// On-chain verifier for Solana payments.
#[derive(Debug, Clone)]
pub struct SolanaVerifier {
    rpc: SolanaRpc,
    usdc_mint: Address,
}

impl SolanaVerifier {
    pub fn new(rpc: SolanaRpc, usdc_mint: Address) -> Self {
        Self { rpc, usdc_mint }
    }

    fn collect_memos(tx: &RpcTransaction) -> Vec<String> {
        let mut memos = Vec::new();
        let top = tx.transaction.message.instructions.iter();
        let inner = tx
            .meta
            .iter()
            .flat_map(|m| m.inner_instructions.iter())
            .flat_map(|group| group.instructions.iter());
        for ix in top.chain(inner) {
            if ix.program_id() != Some(MEMO_PROGRAM_ID) {
                continue;
            }
            // jsonParsed memos carry the text in `parsed`; unparsed ones keep
            // raw `data`, possibly base64.
            let data = match (&ix.parsed, &ix.data) {
                (Some(Value::String(s)), _) => Some(s.clone()),
                (Some(parsed), _) => parsed
                    .get("memo")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                (None, Some(data)) => Some(data.clone()),
                (None, None) => None,
            };
            if let Some(data) = data {
                memos.push(data);
            }
        }
        memos
    }

    fn memo_matches(data: &str, expected: &str) -> bool {
        let trimmed = data.trim();
        if trimmed == expected {
            return true;
        }
        // Some RPC nodes hand memo bytes back base64-encoded.
        let looks_base64 = trimmed.len() % 4 == 0
            && !trimmed.is_empty()
            && trimmed
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=');
        if looks_base64 {
            if let Ok(decoded) = BASE64.decode(trimmed) {
                if let Ok(text) = String::from_utf8(decoded) {
                    return text.trim() == expected;
                }
            }
        }
        false
    }

    fn has_binding_memo(tx: &RpcTransaction, reference: &str) -> bool {
        let expected = format!("{MEMO_PREFIX}{reference}");
        Self::collect_memos(tx)
            .iter()
            .any(|memo| Self::memo_matches(memo, &expected))
    }

    fn verify_sol_transfer(
        tx: &RpcTransaction,
        intent: &PaymentIntent,
        required: u64,
    ) -> Result<Address, VerifyError> {
        let recipient = intent.recipient.to_string();
        let mut found = false;
        for ix in &tx.transaction.message.instructions {
            if ix.program_id() != Some(SYSTEM_PROGRAM_ID) {
                continue;
            }
            let Some(parsed) = ix
                .parsed
                .clone()
                .and_then(|p| serde_json::from_value::<ParsedInstruction>(p).ok())
            else {
                continue;
            };
            if parsed.kind != "transfer" {
                continue;
            }
            if parsed.info.get("destination").and_then(Value::as_str) != Some(recipient.as_str()) {
                continue;
            }
            let lamports = parsed.info.get("lamports").and_then(Value::as_u64).unwrap_or(0);
            if lamports < required {
                return Err(VerifyError::AmountTooLow);
            }
            found = true;
            break;
        }
        if !found {
            return Err(VerifyError::TransferNotFound);
        }
        // Payer of a native transfer is the fee payer (first account key).
        let fee_payer = tx
            .transaction
            .message
            .account_keys
            .first()
            .map(RpcAccountKey::pubkey)
            .ok_or(VerifyError::TransferNotFound)?;
        Address::from_str(fee_payer).map_err(|_| VerifyError::TransferNotFound)
    }

    async fn verify_token_transfer(
        &self,
        tx: &RpcTransaction,
        intent: &PaymentIntent,
        required: u64,
    ) -> Result<Address, VerifyError> {
        let expected_mint = intent.mint.unwrap_or(self.usdc_mint);
        for ix in &tx.transaction.message.instructions {
            let program_id = match ix.program_id() {
                Some(TOKEN_PROGRAM_ID) => TOKEN_PROGRAM_ID,
                Some(TOKEN_2022_PROGRAM_ID) => TOKEN_2022_PROGRAM_ID,
                _ => continue,
            };
            let Some(parsed) = ix
                .parsed
                .clone()
                .and_then(|p| serde_json::from_value::<ParsedInstruction>(p).ok())
            else {
                continue;
            };
            if parsed.kind != "transfer" && parsed.kind != "transferChecked" {
                continue;
            }
            let info = &parsed.info;
            // transferChecked names the mint; a plain transfer does not, and
            // is pinned to the mint through the destination-account check.
            if let Some(mint) = info.get("mint").and_then(Value::as_str) {
                if mint != expected_mint.to_string() {
                    continue;
                }
            }
            let amount = info
                .get("amount")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| {
                    info.get("tokenAmount")
                        .and_then(|ta| ta.get("amount"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                });
            let authority = info
                .get("authority")
                .or_else(|| info.get("multisigAuthority"))
                .and_then(Value::as_str);
            let destination = info.get("destination").and_then(Value::as_str);
            let (Some(amount), Some(authority), Some(destination)) =
                (amount, authority, destination)
            else {
                continue;
            };
            let destination = Address::from_str(destination)
                .map_err(|e| VerifyError::Rpc(e.to_string()))?;
            let token_program = Pubkey::from_str(program_id)
                .map_err(|e| VerifyError::Rpc(e.to_string()))?;
            if !self
                .destination_belongs_to_recipient(
                    &destination,
                    &intent.recipient,
                    &token_program,
                    &expected_mint,
                )
                .await?
            {
                continue;
            }
            let atomic: u64 = amount
                .parse()
                .map_err(|_| VerifyError::Rpc(format!("Unparseable token amount: {amount}")))?;
            if atomic < required {
                return Err(VerifyError::AmountTooLow);
            }
            return Address::from_str(authority).map_err(|_| VerifyError::TransferNotFound);
        }
        Err(VerifyError::TransferNotFound)
    }

    /// The ATA derivation and the account-owner lookup are equally
    /// authoritative answers to "does this destination belong to the
    /// recipient"; the RPC fallback is not a degraded mode.
    async fn destination_belongs_to_recipient(
        &self,
        destination: &Address,
        recipient: &Address,
        token_program: &Pubkey,
        mint: &Address,
    ) -> Result<bool, VerifyError> {
        let expected_ata = recipient.associated_token_account(token_program, mint);
        if destination == &expected_ata {
            return Ok(true);
        }
        match self.rpc.get_token_account(destination).await? {
            Some((owner, account_mint)) => Ok(&owner == recipient && &account_mint == mint),
            None => Ok(false),
        }
    }
}

#[async_trait]
impl LedgerVerifier for SolanaVerifier {
    #[tracing::instrument(skip_all, fields(tx_sig = %tx_sig, intent_id = %intent.intent_id))]
    async fn verify(
        &self,
        tx_sig: &str,
        intent: &PaymentIntent,
    ) -> Result<VerifiedPayment, VerifyError> {
        let tx = self
            .rpc
            .get_transaction(tx_sig)
            .await?
            .ok_or(VerifyError::NotFound)?;

        let block_time = tx.block_time.ok_or(VerifyError::NotFound)?;
        if block_time > intent.expires_at.timestamp() {
            return Err(VerifyError::Expired);
        }
        if tx.meta.as_ref().is_some_and(|m| m.err.is_some()) {
            return Err(VerifyError::TxFailed);
        }
        if !Self::has_binding_memo(&tx, &intent.reference) {
            return Err(VerifyError::MemoMissing(intent.reference.clone()));
        }

        let required = intent.amount.atomic_units(intent.currency.decimals())?;
        let payer = match intent.currency {
            Currency::Sol => Self::verify_sol_transfer(&tx, intent, required)?,
            Currency::Usdc => self.verify_token_transfer(&tx, intent, required).await?,
        };

        // Session continuation: the payer recorded at first verification must
        // keep paying.
        if let Some(expected) = &intent.payer {
            if expected != &payer {
                return Err(VerifyError::PayerMismatch);
            }
        }

        tracing::debug!(payer = %payer, block_time, "Payment verified on-chain");
        Ok(VerifiedPayment {
            tx_sig: tx_sig.to_string(),
            payer,
            block_time,
            slot: tx.slot,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::Amount;
    use crate::types::Chain;
    use chrono::{Duration as ChronoDuration, Utc};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RECIPIENT: &str = "DRpbCBMxVnDK7maPM5tGv6MvB3v1sRMC86PZ8okm21hy";
    const PAYER: &str = "4Nd1mBQtrMJVYVfKf2PJy9NZUZdTAsp7D4xWLs4gDB4T";
    const USDC_MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

    fn intent(currency: Currency, amount: &str) -> PaymentIntent {
        PaymentIntent {
            intent_id: "intent-1".into(),
            tool_id: "tool-1".into(),
            amount: Amount::parse(amount).unwrap(),
            currency,
            chain: Chain::Solana,
            recipient: RECIPIENT.parse().unwrap(),
            reference: "ref-abc".into(),
            expires_at: Utc::now() + ChronoDuration::minutes(15),
            request_hash: "aa".repeat(32),
            payer: None,
            mint: Some(USDC_MINT.parse().unwrap()),
            network: None,
            tool_params_hash: None,
            session_id: None,
            max_calls: None,
            calls_used: None,
            spending_account: None,
        }
    }

    fn sol_tx(memo: &str, destination: &str, lamports: u64) -> Value {
        json!({
            "blockTime": Utc::now().timestamp(),
            "slot": 1,
            "meta": { "err": null, "innerInstructions": [] },
            "transaction": {
                "signatures": ["sig-1"],
                "message": {
                    "accountKeys": [ { "pubkey": PAYER }, { "pubkey": destination } ],
                    "instructions": [
                        {
                            "programId": SYSTEM_PROGRAM_ID,
                            "parsed": { "type": "transfer", "info": {
                                "source": PAYER,
                                "destination": destination,
                                "lamports": lamports
                            }}
                        },
                        { "programId": MEMO_PROGRAM_ID, "parsed": memo }
                    ]
                }
            }
        })
    }

    fn usdc_tx(memo: &str, destination: &str, amount: &str) -> Value {
        json!({
            "blockTime": Utc::now().timestamp(),
            "slot": 1,
            "meta": { "err": null, "innerInstructions": [] },
            "transaction": {
                "signatures": ["sig-1"],
                "message": {
                    "accountKeys": [ { "pubkey": PAYER } ],
                    "instructions": [
                        {
                            "programId": TOKEN_PROGRAM_ID,
                            "parsed": { "type": "transferChecked", "info": {
                                "source": "9vYWHBPz817wJdQpE8u3QmDMV8ZsTFv5mnBWCnXLwfVR",
                                "destination": destination,
                                "mint": USDC_MINT,
                                "authority": PAYER,
                                "tokenAmount": { "amount": amount, "decimals": 6 }
                            }}
                        },
                        { "programId": MEMO_PROGRAM_ID, "parsed": memo }
                    ]
                }
            }
        })
    }

    async fn verifier_for(server: &MockServer) -> SolanaVerifier {
        let rpc = SolanaRpc::new(
            server.uri().parse().unwrap(),
            Commitment::Confirmed,
            Duration::from_secs(5),
        )
        .unwrap();
        SolanaVerifier::new(rpc, USDC_MINT.parse().unwrap())
    }

    async fn mount_transaction(server: &MockServer, tx: Value) {
        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_partial_json(json!({ "method": "getTransaction" })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "jsonrpc": "2.0", "id": "v402-verify", "result": tx })),
            )
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_sol_payment_verifies_and_derives_fee_payer() {
        let server = MockServer::start().await;
        mount_transaction(&server, sol_tx("v402:ref-abc", RECIPIENT, 1_000_000_000)).await;
        let verifier = verifier_for(&server).await;

        let verified = verifier.verify("sig-1", &intent(Currency::Sol, "1")).await.unwrap();
        assert_eq!(verified.payer.to_string(), PAYER);
        assert_eq!(verified.tx_sig, "sig-1");
    }

    #[tokio::test]
    async fn test_missing_memo_rejected() {
        let server = MockServer::start().await;
        mount_transaction(&server, sol_tx("v402:other-ref", RECIPIENT, 1_000_000_000)).await;
        let verifier = verifier_for(&server).await;

        let err = verifier
            .verify("sig-1", &intent(Currency::Sol, "1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "MEMO_MISSING");
    }

    #[tokio::test]
    async fn test_memo_must_match_verbatim_not_contain() {
        let server = MockServer::start().await;
        mount_transaction(
            &server,
            sol_tx("prefix v402:ref-abc suffix", RECIPIENT, 1_000_000_000),
        )
        .await;
        let verifier = verifier_for(&server).await;

        let err = verifier
            .verify("sig-1", &intent(Currency::Sol, "1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "MEMO_MISSING");
    }

    #[tokio::test]
    async fn test_amount_below_required_rejected() {
        let server = MockServer::start().await;
        mount_transaction(&server, sol_tx("v402:ref-abc", RECIPIENT, 999_999_999)).await;
        let verifier = verifier_for(&server).await;

        let err = verifier
            .verify("sig-1", &intent(Currency::Sol, "1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "AMOUNT_TOO_LOW");
    }

    #[tokio::test]
    async fn test_wrong_recipient_rejected() {
        let server = MockServer::start().await;
        mount_transaction(&server, sol_tx("v402:ref-abc", PAYER, 1_000_000_000)).await;
        let verifier = verifier_for(&server).await;

        let err = verifier
            .verify("sig-1", &intent(Currency::Sol, "1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TRANSFER_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_failed_transaction_rejected() {
        let server = MockServer::start().await;
        let mut tx = sol_tx("v402:ref-abc", RECIPIENT, 1_000_000_000);
        tx["meta"]["err"] = json!({ "InstructionError": [0, "Custom"] });
        mount_transaction(&server, tx).await;
        let verifier = verifier_for(&server).await;

        let err = verifier
            .verify("sig-1", &intent(Currency::Sol, "1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TX_FAILED");
    }

    #[tokio::test]
    async fn test_transaction_after_expiry_rejected() {
        let server = MockServer::start().await;
        let mut tx = sol_tx("v402:ref-abc", RECIPIENT, 1_000_000_000);
        tx["blockTime"] = json!((Utc::now() + ChronoDuration::hours(1)).timestamp());
        mount_transaction(&server, tx).await;
        let verifier = verifier_for(&server).await;

        let err = verifier
            .verify("sig-1", &intent(Currency::Sol, "1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "EXPIRED");
    }

    #[tokio::test]
    async fn test_absent_transaction_is_not_found() {
        let server = MockServer::start().await;
        mount_transaction(&server, Value::Null).await;
        let verifier = verifier_for(&server).await;

        let err = verifier
            .verify("sig-404", &intent(Currency::Sol, "1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_usdc_payment_verifies_via_ata_derivation() {
        let server = MockServer::start().await;
        let recipient: Address = RECIPIENT.parse().unwrap();
        let token_program = Pubkey::from_str(TOKEN_PROGRAM_ID).unwrap();
        let ata = recipient.associated_token_account(&token_program, &USDC_MINT.parse().unwrap());
        mount_transaction(&server, usdc_tx("v402:ref-abc", &ata.to_string(), "500000")).await;
        let verifier = verifier_for(&server).await;

        let verified = verifier
            .verify("sig-1", &intent(Currency::Usdc, "0.50"))
            .await
            .unwrap();
        // Token payer is the source token-account owner, not the fee payer.
        assert_eq!(verified.payer.to_string(), PAYER);
    }

    #[tokio::test]
    async fn test_usdc_owner_lookup_fallback_is_authoritative() {
        let server = MockServer::start().await;
        // Destination is not the derived ATA; owner lookup must settle it.
        let destination = "So11111111111111111111111111111111111111112".to_string();
        mount_transaction(&server, usdc_tx("v402:ref-abc", &destination, "500000")).await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "getAccountInfo" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": "v402-verify",
                "result": { "value": { "data": { "parsed": { "info": {
                    "owner": RECIPIENT,
                    "mint": USDC_MINT
                }}}}}
            })))
            .mount(&server)
            .await;
        let verifier = verifier_for(&server).await;

        let verified = verifier
            .verify("sig-1", &intent(Currency::Usdc, "0.50"))
            .await
            .unwrap();
        assert_eq!(verified.payer.to_string(), PAYER);
    }

    #[tokio::test]
    async fn test_usdc_foreign_destination_rejected() {
        let server = MockServer::start().await;
        let destination = "So11111111111111111111111111111111111111112".to_string();
        mount_transaction(&server, usdc_tx("v402:ref-abc", &destination, "500000")).await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "getAccountInfo" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": "v402-verify",
                "result": { "value": { "data": { "parsed": { "info": {
                    "owner": PAYER,
                    "mint": USDC_MINT
                }}}}}
            })))
            .mount(&server)
            .await;
        let verifier = verifier_for(&server).await;

        let err = verifier
            .verify("sig-1", &intent(Currency::Usdc, "0.50"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TRANSFER_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_base64_memo_accepted() {
        let server = MockServer::start().await;
        let encoded = BASE64.encode("v402:ref-abc");
        let mut tx = sol_tx("", RECIPIENT, 1_000_000_000);
        tx["transaction"]["message"]["instructions"][1] =
            json!({ "programId": MEMO_PROGRAM_ID, "data": encoded });
        mount_transaction(&server, tx).await;
        let verifier = verifier_for(&server).await;

        let verified = verifier.verify("sig-1", &intent(Currency::Sol, "1")).await.unwrap();
        assert_eq!(verified.payer.to_string(), PAYER);
    }

    #[tokio::test]
    async fn test_session_payer_mismatch_rejected() {
        let server = MockServer::start().await;
        mount_transaction(&server, sol_tx("v402:ref-abc", RECIPIENT, 1_000_000_000)).await;
        let verifier = verifier_for(&server).await;

        let mut session_intent = intent(Currency::Sol, "1");
        session_intent.payer = Some(USDC_MINT.parse().unwrap());
        let err = verifier.verify("sig-1", &session_intent).await.unwrap_err();
        assert_eq!(err.code(), "PAYER_MISMATCH");
    }
}
