//! toncenter v3 node client with multi-endpoint failover

use super::{
    AccountState, ActionPhase, BlockRef, ComputePhase, MessageInfo, MessageKind, NodeClient,
    StackEntry, Transaction,
};
use crate::cell::{from_boc, from_boc_base64, Address, ArcCell, CellExt};
use crate::config::NodeConfig;
use crate::error::{TxmError, TxmResult};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// HTTP client over one or more toncenter endpoints
pub struct ToncenterClient {
    http: Client,
    endpoints: Vec<String>,
    api_key: Option<String>,
    current: AtomicUsize,
    block_poll: Duration,
}

impl ToncenterClient {
    pub fn new(config: &NodeConfig) -> TxmResult<Self> {
        if config.endpoints.is_empty() {
            return Err(TxmError::Config("no node endpoints configured".into()));
        }
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| TxmError::Config(format!("http client: {}", e)))?;
        Ok(Self {
            http,
            endpoints: config
                .endpoints
                .iter()
                .map(|e| e.trim_end_matches('/').to_string())
                .collect(),
            api_key: config.api_key.clone(),
            current: AtomicUsize::new(0),
            block_poll: Duration::from_millis(config.block_poll_ms),
        })
    }

    fn endpoint(&self) -> &str {
        let idx = self.current.load(Ordering::Relaxed);
        &self.endpoints[idx % self.endpoints.len()]
    }

    /// Switch to next endpoint
    pub fn failover(&self) {
        let next = (self.current.load(Ordering::Relaxed) + 1) % self.endpoints.len();
        self.current.store(next, Ordering::Relaxed);
        warn!("Node failover to endpoint {}", self.endpoints[next]);
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> TxmResult<T> {
        let mut last_err = None;
        for _ in 0..self.endpoints.len() {
            let url = format!("{}{}", self.endpoint(), path);
            let mut req = self.http.get(&url).query(query);
            if let Some(key) = &self.api_key {
                req = req.header("X-API-Key", key);
            }
            match Self::decode(url.clone(), req.send().await).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() => {
                    warn!("GET {} failed: {}", url, e);
                    last_err = Some(e);
                    self.failover();
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| TxmError::Node {
            message: "all endpoints failed".into(),
        }))
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> TxmResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut last_err = None;
        for _ in 0..self.endpoints.len() {
            let url = format!("{}{}", self.endpoint(), path);
            let mut req = self.http.post(&url).json(body);
            if let Some(key) = &self.api_key {
                req = req.header("X-API-Key", key);
            }
            match Self::decode(url.clone(), req.send().await).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() => {
                    warn!("POST {} failed: {}", url, e);
                    last_err = Some(e);
                    self.failover();
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| TxmError::Node {
            message: "all endpoints failed".into(),
        }))
    }

    async fn decode<T: DeserializeOwned>(
        url: String,
        response: Result<reqwest::Response, reqwest::Error>,
    ) -> TxmResult<T> {
        let response = response?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(TxmError::RateLimited { endpoint: url });
        }
        if status.is_server_error() {
            return Err(TxmError::Node {
                message: format!("{} returned {}", url, status),
            });
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(TxmError::Rejected {
                message: format!("{}: {}", status, text),
            });
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl NodeClient for ToncenterClient {
    async fn current_tip(&self) -> TxmResult<BlockRef> {
        let info: MasterchainInfo = self.get("/api/v3/masterchainInfo", &[]).await?;
        Ok(BlockRef {
            workchain: info.last.workchain,
            shard: parse_shard(&info.last.shard),
            seqno: info.last.seqno,
        })
    }

    async fn get_account(&self, tip: &BlockRef, address: &Address) -> TxmResult<AccountState> {
        debug!("Reading account {} at block {}", address, tip.seqno);
        let info: WalletInformation = self
            .get(
                "/api/v3/walletInformation",
                &[("address", address.to_raw()), ("use_v2", "false".into())],
            )
            .await?;
        Ok(AccountState {
            balance: parse_amount(&info.balance)?,
            seqno: info.seqno.unwrap_or(0),
            is_active: info.status == "active",
            last_tx_lt: parse_amount(&info.last_transaction_lt)? as u64,
            last_tx_hash: match info.last_transaction_hash.as_deref() {
                Some(h) => decode_hash(h)?,
                None => [0u8; 32],
            },
        })
    }

    async fn run_get_method(
        &self,
        _tip: &BlockRef,
        address: &Address,
        method: &str,
        args: Vec<StackEntry>,
    ) -> TxmResult<Vec<StackEntry>> {
        let request = RunGetMethodRequest {
            address: address.to_raw(),
            method: method.to_string(),
            stack: args
                .iter()
                .map(ApiStackEntry::from_entry)
                .collect::<TxmResult<_>>()?,
        };
        let result: RunGetMethodResponse = self.post("/api/v3/runGetMethod", &request).await?;
        if result.exit_code != 0 && result.exit_code != 1 {
            return Err(TxmError::Contract(format!(
                "get-method {} on {} exited with {}",
                method,
                address,
                super::ExitCode::from(result.exit_code)
            )));
        }
        result.stack.iter().map(ApiStackEntry::to_entry).collect()
    }

    async fn send_external_message(&self, boc: &[u8]) -> TxmResult<[u8; 32]> {
        let root = from_boc(boc)?;
        let request = SendMessageRequest {
            boc: STANDARD.encode(boc),
        };
        let _: serde_json::Value = self.post("/api/v3/message", &request).await?;
        Ok(root.repr_hash())
    }

    async fn get_transaction(
        &self,
        address: &Address,
        lt: u64,
        hash: &[u8; 32],
    ) -> TxmResult<Option<Transaction>> {
        let page: TransactionsPage = self
            .get(
                "/api/v3/transactions",
                &[
                    ("account", address.to_raw()),
                    ("lt", lt.to_string()),
                    ("hash", hex::encode(hash)),
                    ("limit", "1".into()),
                ],
            )
            .await?;
        page.transactions
            .into_iter()
            .next()
            .map(ApiTransaction::into_transaction)
            .transpose()
    }

    async fn list_transactions(
        &self,
        address: &Address,
        limit: usize,
        before: Option<(u64, [u8; 32])>,
    ) -> TxmResult<Vec<Transaction>> {
        let mut query = vec![
            ("account", address.to_raw()),
            ("limit", limit.to_string()),
            ("sort", "desc".to_string()),
        ];
        if let Some((lt, _)) = before {
            query.push(("end_lt", lt.saturating_sub(1).to_string()));
        }
        let page: TransactionsPage = self.get("/api/v3/transactions", &query).await?;
        page.transactions
            .into_iter()
            .map(ApiTransaction::into_transaction)
            .collect()
    }

    async fn wait_for_block(&self, seqno: u32) -> TxmResult<BlockRef> {
        loop {
            let tip = self.current_tip().await?;
            if tip.seqno >= seqno {
                return Ok(tip);
            }
            tokio::time::sleep(self.block_poll).await;
        }
    }
}

fn parse_amount(s: &str) -> TxmResult<u128> {
    if s.is_empty() {
        return Ok(0);
    }
    s.parse::<u128>().map_err(|e| TxmError::Node {
        message: format!("bad amount {:?}: {}", s, e),
    })
}

fn parse_shard(s: &str) -> i64 {
    let trimmed = s.trim_start_matches("0x");
    u64::from_str_radix(trimmed, 16)
        .map(|v| v as i64)
        .or_else(|_| s.parse::<i64>())
        .unwrap_or(i64::MIN)
}

/// Hashes come back base64 in v3 and hex elsewhere
fn decode_hash(s: &str) -> TxmResult<[u8; 32]> {
    let bytes = if s.len() == 64 {
        hex::decode(s).map_err(|e| TxmError::Node {
            message: format!("bad hash {:?}: {}", s, e),
        })?
    } else {
        STANDARD
            .decode(s)
            .or_else(|_| base64::engine::general_purpose::URL_SAFE.decode(s))
            .map_err(|e| TxmError::Node {
                message: format!("bad hash {:?}: {}", s, e),
            })?
    };
    bytes.try_into().map_err(|_| TxmError::Node {
        message: format!("hash {:?} is not 32 bytes", s),
    })
}

fn parse_address(s: Option<&str>) -> TxmResult<Option<Address>> {
    match s {
        None | Some("") => Ok(None),
        Some(raw) => raw.parse::<Address>().map(Some).map_err(TxmError::from),
    }
}

fn parse_int(s: &str) -> TxmResult<i128> {
    let (neg, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let value = match digits.strip_prefix("0x") {
        Some(hex_digits) => i128::from_str_radix(hex_digits, 16),
        None => digits.parse::<i128>(),
    }
    .map_err(|e| TxmError::Node {
        message: format!("bad stack integer {:?}: {}", s, e),
    })?;
    Ok(if neg { -value } else { value })
}

#[derive(Debug, Deserialize)]
struct MasterchainInfo {
    last: ApiBlock,
}

#[derive(Debug, Deserialize)]
struct ApiBlock {
    workchain: i32,
    shard: String,
    seqno: u32,
}

#[derive(Debug, Deserialize)]
struct WalletInformation {
    #[serde(default)]
    balance: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    seqno: Option<u32>,
    #[serde(default)]
    last_transaction_lt: String,
    #[serde(default)]
    last_transaction_hash: Option<String>,
}

#[derive(Debug, Serialize)]
struct RunGetMethodRequest {
    address: String,
    method: String,
    stack: Vec<ApiStackEntry>,
}

#[derive(Debug, Deserialize)]
struct RunGetMethodResponse {
    exit_code: i32,
    #[serde(default)]
    stack: Vec<ApiStackEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiStackEntry {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    value: Option<String>,
}

impl ApiStackEntry {
    fn from_entry(entry: &StackEntry) -> TxmResult<Self> {
        let (kind, value) = match entry {
            StackEntry::Int(v) if *v < 0 => ("num", Some(format!("-0x{:x}", v.unsigned_abs()))),
            StackEntry::Int(v) => ("num", Some(format!("0x{:x}", v))),
            StackEntry::Cell(c) => ("cell", Some(c.to_boc_base64()?)),
            StackEntry::Slice(c) => ("slice", Some(c.to_boc_base64()?)),
            StackEntry::Null => ("null", None),
        };
        Ok(Self {
            kind: kind.to_string(),
            value,
        })
    }

    fn to_entry(&self) -> TxmResult<StackEntry> {
        let value = self.value.as_deref().unwrap_or_default();
        match self.kind.as_str() {
            "num" => parse_int(value).map(StackEntry::Int),
            "cell" => Ok(StackEntry::Cell(from_boc_base64(value)?)),
            "slice" => Ok(StackEntry::Slice(from_boc_base64(value)?)),
            "null" => Ok(StackEntry::Null),
            other => Err(TxmError::Node {
                message: format!("unsupported stack entry type {}", other),
            }),
        }
    }
}

#[derive(Debug, Serialize)]
struct SendMessageRequest {
    boc: String,
}

#[derive(Debug, Deserialize)]
struct TransactionsPage {
    #[serde(default)]
    transactions: Vec<ApiTransaction>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ApiTransaction {
    account: String,
    hash: String,
    lt: String,
    now: u32,
    total_fees: String,
    description: ApiDescription,
    in_msg: Option<ApiMessage>,
    out_msgs: Vec<ApiMessage>,
    account_state_before: Option<ApiAccountState>,
    account_state_after: Option<ApiAccountState>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ApiDescription {
    aborted: bool,
    storage_ph: Option<ApiStoragePhase>,
    compute_ph: Option<ApiComputePhase>,
    action: Option<ApiActionPhase>,
    bounce: Option<ApiBouncePhase>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ApiStoragePhase {
    storage_fees_collected: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ApiComputePhase {
    skipped: bool,
    success: bool,
    exit_code: i32,
    gas_fees: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ApiActionPhase {
    success: bool,
    result_code: i32,
    total_fwd_fees: String,
    total_action_fees: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ApiBouncePhase {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ApiAccountState {
    balance: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ApiMessage {
    hash: String,
    source: Option<String>,
    destination: Option<String>,
    value: Option<String>,
    fwd_fee: Option<String>,
    import_fee: Option<String>,
    created_lt: Option<String>,
    created_at: Option<String>,
    bounce: Option<bool>,
    bounced: Option<bool>,
    message_content: Option<ApiMessageContent>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ApiMessageContent {
    body: Option<String>,
}

impl ApiMessage {
    fn into_message(self) -> TxmResult<MessageInfo> {
        let src = parse_address(self.source.as_deref())?;
        let dst = parse_address(self.destination.as_deref())?;
        let kind = match (&src, &dst) {
            (None, Some(_)) => MessageKind::ExternalIn,
            (Some(_), None) => MessageKind::ExternalOut,
            _ => MessageKind::Internal,
        };
        let amount = |v: Option<String>| parse_amount(v.as_deref().unwrap_or_default());
        let body: Option<ArcCell> = match self.message_content.and_then(|c| c.body) {
            Some(b) if !b.is_empty() => Some(from_boc_base64(&b)?),
            _ => None,
        };
        Ok(MessageInfo {
            hash: decode_hash(&self.hash)?,
            kind,
            src,
            dst,
            value: amount(self.value)?,
            fwd_fee: amount(self.fwd_fee)?,
            import_fee: amount(self.import_fee)?,
            created_lt: amount(self.created_lt)? as u64,
            created_at: amount(self.created_at)? as u32,
            bounce: self.bounce.unwrap_or(false),
            bounced: self.bounced.unwrap_or(false),
            body,
        })
    }
}

impl ApiTransaction {
    fn into_transaction(self) -> TxmResult<Transaction> {
        let account = self.account.parse::<Address>()?;
        let desc = self.description;
        let compute = desc
            .compute_ph
            .map(|c| -> TxmResult<ComputePhase> {
                Ok(ComputePhase {
                    skipped: c.skipped,
                    success: c.success,
                    exit_code: c.exit_code,
                    gas_fees: parse_amount(&c.gas_fees)?,
                })
            })
            .transpose()?
            .unwrap_or(ComputePhase {
                skipped: true,
                ..ComputePhase::default()
            });
        let action = desc
            .action
            .map(|a| -> TxmResult<ActionPhase> {
                Ok(ActionPhase {
                    success: a.success,
                    result_code: a.result_code,
                    total_action_fees: parse_amount(&a.total_action_fees)?,
                    total_fwd_fees: parse_amount(&a.total_fwd_fees)?,
                })
            })
            .transpose()?;
        let storage_fees = match desc.storage_ph {
            Some(s) => parse_amount(&s.storage_fees_collected)?,
            None => 0,
        };
        let balance = |s: Option<ApiAccountState>| -> TxmResult<Option<u128>> {
            s.and_then(|s| s.balance).map(|b| parse_amount(&b)).transpose()
        };
        let before = balance(self.account_state_before)?;
        let after = balance(self.account_state_after)?;

        Ok(Transaction {
            account,
            hash: decode_hash(&self.hash)?,
            lt: parse_amount(&self.lt)? as u64,
            now: self.now,
            in_msg: self.in_msg.map(ApiMessage::into_message).transpose()?,
            out_msgs: self
                .out_msgs
                .into_iter()
                .map(ApiMessage::into_message)
                .collect::<TxmResult<Vec<_>>>()?,
            total_fees: parse_amount(&self.total_fees)?,
            storage_fees,
            compute,
            action,
            bounce_emitted: desc.bounce.map_or(false, |b| b.kind == "ok"),
            aborted: desc.aborted,
            balance_delta: match (before, after) {
                (Some(b), Some(a)) => Some(a as i128 - b as i128),
                _ => None,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_transaction_json() {
        let json = serde_json::json!({
            "account": "0:0000000000000000000000000000000000000000000000000000000000000001",
            "hash": STANDARD.encode([7u8; 32]),
            "lt": "1000",
            "now": 1700000000,
            "total_fees": "1500",
            "description": {
                "aborted": false,
                "storage_ph": {"storage_fees_collected": "100"},
                "compute_ph": {"skipped": false, "success": true, "exit_code": 0, "gas_fees": "1000"},
                "action": {"success": true, "result_code": 0, "total_fwd_fees": "600", "total_action_fees": "200"}
            },
            "in_msg": {
                "hash": hex::encode([1u8; 32]),
                "source": null,
                "destination": "0:0000000000000000000000000000000000000000000000000000000000000001",
                "import_fee": "200"
            },
            "out_msgs": [{
                "hash": STANDARD.encode([2u8; 32]),
                "source": "0:0000000000000000000000000000000000000000000000000000000000000001",
                "destination": "0:0000000000000000000000000000000000000000000000000000000000000002",
                "value": "5000",
                "fwd_fee": "400",
                "created_lt": "1001",
                "bounce": true
            }],
            "account_state_before": {"balance": "100000"},
            "account_state_after": {"balance": "92900"}
        });
        let api: ApiTransaction = serde_json::from_value(json).unwrap();
        let tx = api.into_transaction().unwrap();
        assert_eq!(tx.lt, 1000);
        assert_eq!(tx.external_in_hash(), Some([1u8; 32]));
        assert_eq!(tx.compute.gas_fees, 1000);
        assert_eq!(tx.action.as_ref().unwrap().total_action_fees, 200);
        assert_eq!(tx.out_msgs[0].kind, MessageKind::Internal);
        assert_eq!(tx.out_msgs[0].value, 5000);
        assert_eq!(tx.balance_delta, Some(-7100));
    }

    #[test]
    fn test_stack_entries() {
        assert_eq!(parse_int("0x10").unwrap(), 16);
        assert_eq!(parse_int("-0x1").unwrap(), -1);
        assert_eq!(parse_int("42").unwrap(), 42);
        let entry = ApiStackEntry::from_entry(&StackEntry::Int(-255)).unwrap();
        assert_eq!(entry.value.as_deref(), Some("-0xff"));
        assert_eq!(entry.to_entry().unwrap(), StackEntry::Int(-255));
    }

    #[test]
    fn test_requires_endpoints() {
        let config = NodeConfig {
            endpoints: Vec::new(),
            api_key: None,
            request_timeout_secs: 10,
            block_poll_ms: 500,
        };
        assert!(ToncenterClient::new(&config).is_err());
    }
}
