//! JSON-RPC ledger client

use crate::client::{
    LedgerClient, LogStream, RecentBlockhash, SignatureInfo, SignatureQuery, TransactionLogs,
    TxStatus,
};
use crate::{Error, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use vault_ledger::tx::Transaction;
use vault_ledger::{Pubkey, Signature};

/// Connection settings for a JSON-RPC node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcClientConfig {
    /// Node URL
    pub url: String,
    /// Commitment level for reads
    pub commitment: String,
    /// Per-request timeout (milliseconds)
    pub request_timeout_ms: u64,
    /// Interval between history polls of a live subscription (milliseconds)
    pub poll_interval_ms: u64,
    /// Signatures per page when a poll walks back to the last delivered one
    #[serde(default = "default_poll_page_size")]
    pub poll_page_size: usize,
}

fn default_poll_page_size() -> usize {
    1000
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            url: "https://api.devnet.solana.com".to_string(),
            commitment: "confirmed".to_string(),
            request_timeout_ms: 30_000,
            poll_interval_ms: 2_000,
            poll_page_size: default_poll_page_size(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct WithContext<T> {
    value: T,
}

#[derive(Debug, Deserialize)]
struct AccountInfo {
    data: (String, String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignatureEntry {
    signature: String,
    slot: u64,
    err: Option<Value>,
    block_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionMeta {
    err: Option<Value>,
    log_messages: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionEntry {
    slot: u64,
    block_time: Option<i64>,
    meta: Option<TransactionMeta>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockhashEntry {
    blockhash: String,
    last_valid_block_height: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusEntry {
    slot: u64,
    err: Option<Value>,
    confirmation_status: Option<String>,
}

/// Ledger client over HTTP JSON-RPC
#[derive(Debug, Clone)]
pub struct RpcLedgerClient {
    http: reqwest::Client,
    config: RpcClientConfig,
    next_id: Arc<AtomicU64>,
}

impl RpcLedgerClient {
    /// Create a client
    pub fn new(config: RpcClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;

        Ok(Self {
            http,
            config,
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Node URL
    pub fn url(&self) -> &str {
        &self.config.url
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        self.call_nullable(method, params)
            .await?
            .ok_or_else(|| Error::Other(format!("{} returned no result", method)))
    }

    /// Like `call`, but a null `result` is a valid answer
    async fn call_nullable<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<Option<T>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self.http.post(&self.config.url).json(&body).send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(method.to_string())
            } else {
                Error::Http(e)
            }
        })?;

        if response.status().as_u16() == 429 {
            return Err(Error::Rpc {
                code: 429,
                message: format!("{} rate limited", method),
            });
        }

        let parsed: RpcResponse = response.json().await?;
        if let Some(err) = parsed.error {
            return Err(Error::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        if parsed.result.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(parsed.result)?))
    }

    /// Signatures newer than `until`, oldest first, paging back with `before`
    async fn signatures_since(&self, program: &Pubkey, until: Option<Signature>) -> Result<Vec<SignatureInfo>> {
        let limit = self.config.poll_page_size.max(1);
        let mut collected = Vec::new();
        let mut before = None;

        loop {
            let page = self
                .get_signatures(program, SignatureQuery { before, until, limit })
                .await?;
            let full = page.len() == limit;
            before = page.last().map(|info| info.signature);
            collected.extend(page);
            if !full || before.is_none() {
                break;
            }
        }

        collected.reverse();
        Ok(collected)
    }

    fn commitment(&self) -> Value {
        json!({ "commitment": self.config.commitment })
    }
}

fn err_string(err: Option<Value>) -> Option<String> {
    err.filter(|v| !v.is_null()).map(|v| v.to_string())
}

#[async_trait]
impl LedgerClient for RpcLedgerClient {
    async fn get_account_data(&self, address: &Pubkey) -> Result<Option<Vec<u8>>> {
        let params = json!([
            address.to_string(),
            { "encoding": "base64", "commitment": self.config.commitment },
        ]);
        let info: WithContext<Option<AccountInfo>> = self.call("getAccountInfo", params).await?;

        match info.value {
            Some(account) => {
                let data = BASE64
                    .decode(account.data.0)
                    .map_err(|e| Error::Other(format!("account data base64: {}", e)))?;
                Ok(Some(data))
            }
            None => Ok(None),
        }
    }

    async fn get_signatures(&self, program: &Pubkey, query: SignatureQuery) -> Result<Vec<SignatureInfo>> {
        let mut options = json!({
            "limit": query.limit,
            "commitment": self.config.commitment,
        });
        if let Some(before) = query.before {
            options["before"] = json!(before.to_string());
        }
        if let Some(until) = query.until {
            options["until"] = json!(until.to_string());
        }

        let entries: Vec<SignatureEntry> = self
            .call("getSignaturesForAddress", json!([program.to_string(), options]))
            .await?;

        entries
            .into_iter()
            .map(|entry| {
                Ok(SignatureInfo {
                    signature: entry.signature.parse()?,
                    slot: entry.slot,
                    err: err_string(entry.err),
                    block_time: entry.block_time,
                })
            })
            .collect()
    }

    async fn get_transaction_logs(&self, signature: &Signature) -> Result<Option<TransactionLogs>> {
        let params = json!([
            signature.to_string(),
            {
                "encoding": "json",
                "commitment": self.config.commitment,
                "maxSupportedTransactionVersion": 0,
            },
        ]);
        // Null while the transaction is not yet visible at this commitment
        let entry: Option<TransactionEntry> = self.call_nullable("getTransaction", params).await?;

        Ok(entry.map(|tx| {
            let (err, logs) = match tx.meta {
                Some(meta) => (err_string(meta.err), meta.log_messages.unwrap_or_default()),
                None => (None, Vec::new()),
            };
            TransactionLogs {
                signature: *signature,
                slot: tx.slot,
                block_time: tx.block_time,
                err,
                logs,
            }
        }))
    }

    async fn subscribe_logs(&self, program: &Pubkey) -> Result<LogStream> {
        // Anchor the stream at the current head so history is not replayed
        let head = self
            .get_signatures(
                program,
                SignatureQuery {
                    limit: 1,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Error::Subscription(e.to_string()))?
            .first()
            .map(|info| info.signature);

        let (tx, rx) = mpsc::channel(1000);
        let client = self.clone();
        let program = *program;
        let interval = Duration::from_millis(self.config.poll_interval_ms);

        tokio::spawn(async move {
            let mut last = head;
            let mut ticker = tokio::time::interval(interval);

            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    debug!(program = %program, "Log subscription closed");
                    return;
                }

                let page = match client.signatures_since(&program, last).await {
                    Ok(page) => page,
                    Err(e) => {
                        warn!(program = %program, error = %e, "Log poll failed");
                        continue;
                    }
                };

                for info in page {
                    let logs = match client.get_transaction_logs(&info.signature).await {
                        Ok(Some(logs)) => logs,
                        Ok(None) => TransactionLogs {
                            signature: info.signature,
                            slot: info.slot,
                            block_time: info.block_time,
                            err: info.err.clone(),
                            logs: Vec::new(),
                        },
                        Err(e) => {
                            // Retry from here on the next tick
                            warn!(signature = %info.signature, error = %e, "Log fetch failed");
                            break;
                        }
                    };
                    if tx.send(logs).await.is_err() {
                        return;
                    }
                    last = Some(info.signature);
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn latest_blockhash(&self) -> Result<RecentBlockhash> {
        let entry: WithContext<BlockhashEntry> =
            self.call("getLatestBlockhash", json!([self.commitment()])).await?;
        Ok(RecentBlockhash {
            blockhash: entry.value.blockhash.parse()?,
            last_valid_block_height: entry.value.last_valid_block_height,
        })
    }

    async fn block_height(&self) -> Result<u64> {
        self.call("getBlockHeight", json!([self.commitment()])).await
    }

    async fn send_transaction(&self, tx: &Transaction) -> Result<Signature> {
        let encoded = tx.to_base64()?;
        let params = json!([
            encoded,
            { "encoding": "base64", "preflightCommitment": self.config.commitment },
        ]);

        let signature: String = self.call("sendTransaction", params).await.map_err(|e| match e {
            Error::Rpc { code, message } if code == -32002 || code == -32003 => {
                Error::TransactionRejected(message)
            }
            other => other,
        })?;
        Ok(signature.parse()?)
    }

    async fn signature_status(&self, signature: &Signature) -> Result<TxStatus> {
        let params = json!([[signature.to_string()], { "searchTransactionHistory": false }]);
        let statuses: WithContext<Vec<Option<StatusEntry>>> =
            self.call("getSignatureStatuses", params).await?;

        let entry = match statuses.value.into_iter().next().flatten() {
            Some(entry) => entry,
            None => return Ok(TxStatus::Pending),
        };
        if let Some(reason) = err_string(entry.err) {
            return Ok(TxStatus::Failed {
                slot: entry.slot,
                reason,
            });
        }
        match entry.confirmation_status.as_deref() {
            Some("confirmed") | Some("finalized") => Ok(TxStatus::Confirmed { slot: entry.slot }),
            _ => Ok(TxStatus::Pending),
        }
    }
}
