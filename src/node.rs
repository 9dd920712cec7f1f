//! Full-node gateway.
//!
//! [`NodeGateway`] is the slice of Bitcoin Core's wallet RPC the coordinator
//! consumes. [`RpcNode`] implements it over JSON-RPC with a fresh client per
//! call, a fixed timeout and a bounded retry on transport failures.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::{Amount, SignedAmount};
use bitcoincore_rpc::jsonrpc;
use bitcoincore_rpc::{Client, RpcApi};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use crate::descriptor::Network;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    /// Transport-level failure of a single attempt.
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("node unreachable after {attempts} attempts: {message}")]
    Unavailable { attempts: u32, message: String },

    #[error("rpc error {code}: {message}")]
    Rpc { code: i32, message: String },

    #[error("unexpected node response: {0}")]
    Response(String),
}

impl NodeError {
    fn from_rpc(err: bitcoincore_rpc::Error) -> Self {
        match err {
            bitcoincore_rpc::Error::JsonRpc(jsonrpc::Error::Rpc(e)) => NodeError::Rpc {
                code: e.code,
                message: e.message,
            },
            bitcoincore_rpc::Error::JsonRpc(jsonrpc::Error::Transport(e)) => NodeError::Transport(e.to_string()),
            bitcoincore_rpc::Error::Io(e) => NodeError::Transport(e.to_string()),
            other => NodeError::Response(other.to_string()),
        }
    }
}

/// Connection descriptor persisted with each wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Cookie auth takes precedence over user/password when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie_file: Option<PathBuf>,
    /// Name of the node-side watch-only wallet.
    pub wallet_name: String,
    pub network: Network,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DescriptorInfo {
    /// Canonical descriptor including `#checksum`.
    pub descriptor: String,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(rename = "isrange", default)]
    pub is_range: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubkeys: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddressInfo {
    pub address: String,
    #[serde(rename = "iswatchonly", default)]
    pub is_watch_only: bool,
    #[serde(rename = "ischange", default)]
    pub is_change: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubkeys: Option<Vec<String>>,
    /// P2SH-wrapped scripts report their keys here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedded: Option<EmbeddedInfo>,
}

impl AddressInfo {
    /// Multisig keys in script order, wherever the node put them.
    pub fn multisig_pubkeys(&self) -> Option<&[String]> {
        self.pubkeys
            .as_deref()
            .or_else(|| self.embedded.as_ref()?.pubkeys.as_deref())
    }
}

/// Watch registration for a single descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRequest {
    pub descriptor: String,
    pub internal: bool,
    pub label: Option<String>,
    /// Scan from genesis rather than from now.
    pub since_genesis: bool,
}

impl WatchRequest {
    pub fn to_json(&self) -> Value {
        let mut request = json!({
            "desc": self.descriptor,
            "timestamp": if self.since_genesis { json!(0) } else { json!("now") },
            "internal": self.internal,
            "watchonly": true,
        });
        // Core refuses labels on internal addresses.
        if let (Some(label), false) = (&self.label, self.internal) {
            request["label"] = json!(label);
        }
        request
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RpcErrorBody {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ImportOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payment {
    pub address: String,
    pub amount: Amount,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FundingOptions {
    pub change_address: String,
    pub subtract_fee_from_outputs: Vec<usize>,
}

impl FundingOptions {
    pub fn to_json(&self) -> Value {
        json!({
            "changeAddress": self.change_address,
            "subtractFeeFromOutputs": self.subtract_fee_from_outputs,
            "includeWatching": true,
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct FundedPsbt {
    pub psbt: String,
    #[serde(with = "bitcoin::amount::serde::as_btc")]
    pub fee: Amount,
    #[serde(rename = "changepos")]
    pub change_position: i32,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct FinalizedPsbt {
    #[serde(default)]
    pub psbt: Option<String>,
    #[serde(default)]
    pub hex: Option<String>,
    pub complete: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(with = "bitcoin::amount::serde::as_btc")]
    pub amount: Amount,
    #[serde(default)]
    pub confirmations: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct LockedOutput {
    pub txid: String,
    pub vout: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct WalletTransaction {
    pub txid: String,
    #[serde(default)]
    pub address: Option<String>,
    pub category: String,
    #[serde(with = "bitcoin::amount::serde::as_btc")]
    pub amount: SignedAmount,
    #[serde(default)]
    pub confirmations: i64,
    #[serde(default)]
    pub time: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct BalanceSet {
    #[serde(with = "bitcoin::amount::serde::as_btc")]
    pub trusted: Amount,
    #[serde(with = "bitcoin::amount::serde::as_btc")]
    pub untrusted_pending: Amount,
    #[serde(with = "bitcoin::amount::serde::as_btc")]
    pub immature: Amount,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct Balances {
    pub mine: BalanceSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watchonly: Option<BalanceSet>,
}

impl Balances {
    /// Legacy watch-only wallets report funds under `watchonly`.
    pub fn watched(&self) -> &BalanceSet {
        self.watchonly.as_ref().unwrap_or(&self.mine)
    }
}

/// Node RPC surface used by the coordinator.
pub trait NodeGateway: Send + Sync {
    fn list_wallets(&self) -> Result<Vec<String>, NodeError>;
    fn load_wallet(&self, name: &str) -> Result<(), NodeError>;
    fn create_watch_only_wallet(&self, name: &str) -> Result<(), NodeError>;
    fn descriptor_info(&self, descriptor: &str) -> Result<DescriptorInfo, NodeError>;
    fn derive_addresses(&self, descriptor: &str, range: Option<[u32; 2]>) -> Result<Vec<String>, NodeError>;
    fn address_info(&self, address: &str) -> Result<AddressInfo, NodeError>;
    fn import_multi(&self, requests: &[WatchRequest], rescan: bool) -> Result<Vec<ImportOutcome>, NodeError>;
    fn create_funded_psbt(&self, outputs: &[Payment], options: &FundingOptions) -> Result<FundedPsbt, NodeError>;
    fn decode_psbt(&self, psbt: &str) -> Result<Value, NodeError>;
    fn finalize_psbt(&self, psbt: &str) -> Result<FinalizedPsbt, NodeError>;
    /// Returns the txid.
    fn submit_raw_transaction(&self, hex: &str) -> Result<String, NodeError>;
    fn get_transaction(&self, txid: &str) -> Result<Value, NodeError>;
    fn list_transactions(&self, count: usize) -> Result<Vec<WalletTransaction>, NodeError>;
    fn list_unspent(&self) -> Result<Vec<Utxo>, NodeError>;
    fn list_lock_unspent(&self) -> Result<Vec<LockedOutput>, NodeError>;
    fn get_balances(&self) -> Result<Balances, NodeError>;
}

/// Turns a persisted [`Node`] into a live gateway.
pub trait NodeConnector: Send + Sync {
    fn connect(&self, node: &Node) -> Arc<dyn NodeGateway>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// The node's default wallet endpoint.
    Default,
    /// `/wallet/<wallet_name>`
    Wallet,
}

/// Runs `op`, retrying transport failures up to `retries` extra times.
pub(crate) fn with_retry<T>(
    method: &str,
    retries: u32,
    backoff: Duration,
    mut op: impl FnMut() -> Result<T, NodeError>,
) -> Result<T, NodeError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op() {
            Err(NodeError::Transport(message)) => {
                if attempt > retries {
                    return Err(NodeError::Unavailable {
                        attempts: attempt,
                        message,
                    });
                }
                warn!(method, attempt, %message, "node call failed, retrying");
                std::thread::sleep(backoff * attempt);
            }
            other => return other,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RpcNode {
    node: Node,
    timeout: Duration,
    retries: u32,
    backoff: Duration,
}

impl RpcNode {
    pub fn new(node: Node, timeout: Duration, retries: u32) -> Self {
        Self {
            node,
            timeout,
            retries,
            backoff: Duration::from_millis(250),
        }
    }

    pub fn url(&self, scope: Scope) -> String {
        match scope {
            Scope::Default => format!("http://{}:{}", self.node.host, self.node.port),
            Scope::Wallet => format!(
                "http://{}:{}/wallet/{}",
                self.node.host, self.node.port, self.node.wallet_name
            ),
        }
    }

    fn credentials(&self) -> Result<(String, Option<String>), NodeError> {
        match &self.node.cookie_file {
            Some(path) => {
                let cookie = fs::read_to_string(path)
                    .map_err(|e| NodeError::Transport(format!("reading cookie {}: {e}", path.display())))?;
                let (user, pass) = cookie
                    .trim()
                    .split_once(':')
                    .ok_or_else(|| NodeError::Response(format!("malformed cookie file {}", path.display())))?;
                Ok((user.to_string(), Some(pass.to_string())))
            }
            None => Ok((self.node.user.clone(), self.node.password.clone())),
        }
    }

    fn client(&self, scope: Scope) -> Result<Client, NodeError> {
        let (user, pass) = self.credentials()?;
        let transport = jsonrpc::simple_http::SimpleHttpTransport::builder()
            .url(&self.url(scope))
            .map_err(|e| NodeError::Transport(e.to_string()))?
            .timeout(self.timeout)
            .auth(user, pass)
            .build();
        Ok(Client::from_jsonrpc(jsonrpc::Client::with_transport(transport)))
    }

    fn call<T: DeserializeOwned>(&self, scope: Scope, method: &str, args: &[Value]) -> Result<T, NodeError> {
        debug!(method, ?scope, "node rpc");
        with_retry(method, self.retries, self.backoff, || {
            let client = self.client(scope)?;
            client.call(method, args).map_err(NodeError::from_rpc)
        })
    }
}

impl NodeGateway for RpcNode {
    fn list_wallets(&self) -> Result<Vec<String>, NodeError> {
        self.call(Scope::Default, "listwallets", &[])
    }

    fn load_wallet(&self, name: &str) -> Result<(), NodeError> {
        self.call::<Value>(Scope::Default, "loadwallet", &[json!(name)])
            .map(|_| ())
    }

    fn create_watch_only_wallet(&self, name: &str) -> Result<(), NodeError> {
        // importmulti needs a legacy (non-descriptor) wallet.
        let args = [json!(name), json!(true), json!(false), json!(""), json!(false), json!(false)];
        self.call::<Value>(Scope::Default, "createwallet", &args).map(|_| ())
    }

    fn descriptor_info(&self, descriptor: &str) -> Result<DescriptorInfo, NodeError> {
        self.call(Scope::Default, "getdescriptorinfo", &[json!(descriptor)])
    }

    fn derive_addresses(&self, descriptor: &str, range: Option<[u32; 2]>) -> Result<Vec<String>, NodeError> {
        let mut args = vec![json!(descriptor)];
        if let Some(range) = range {
            args.push(json!(range));
        }
        self.call(Scope::Default, "deriveaddresses", &args)
    }

    fn address_info(&self, address: &str) -> Result<AddressInfo, NodeError> {
        self.call(Scope::Wallet, "getaddressinfo", &[json!(address)])
    }

    fn import_multi(&self, requests: &[WatchRequest], rescan: bool) -> Result<Vec<ImportOutcome>, NodeError> {
        let requests: Vec<Value> = requests.iter().map(WatchRequest::to_json).collect();
        self.call(
            Scope::Wallet,
            "importmulti",
            &[json!(requests), json!({ "rescan": rescan })],
        )
    }

    fn create_funded_psbt(&self, outputs: &[Payment], options: &FundingOptions) -> Result<FundedPsbt, NodeError> {
        let outputs: Vec<Value> = outputs
            .iter()
            .map(|p| {
                let mut output = serde_json::Map::new();
                output.insert(p.address.clone(), json!(format!("{:.8}", p.amount.to_btc())));
                Value::Object(output)
            })
            .collect();
        self.call(
            Scope::Wallet,
            "walletcreatefundedpsbt",
            &[json!([]), json!(outputs), json!(0), options.to_json(), json!(true)],
        )
    }

    fn decode_psbt(&self, psbt: &str) -> Result<Value, NodeError> {
        self.call(Scope::Default, "decodepsbt", &[json!(psbt)])
    }

    fn finalize_psbt(&self, psbt: &str) -> Result<FinalizedPsbt, NodeError> {
        self.call(Scope::Default, "finalizepsbt", &[json!(psbt), json!(true)])
    }

    fn submit_raw_transaction(&self, hex: &str) -> Result<String, NodeError> {
        self.call(Scope::Default, "sendrawtransaction", &[json!(hex)])
    }

    fn get_transaction(&self, txid: &str) -> Result<Value, NodeError> {
        self.call(Scope::Wallet, "gettransaction", &[json!(txid), json!(true)])
    }

    fn list_transactions(&self, count: usize) -> Result<Vec<WalletTransaction>, NodeError> {
        self.call(
            Scope::Wallet,
            "listtransactions",
            &[json!("*"), json!(count), json!(0), json!(true)],
        )
    }

    fn list_unspent(&self) -> Result<Vec<Utxo>, NodeError> {
        self.call(
            Scope::Wallet,
            "listunspent",
            &[json!(0), json!(9_999_999), json!([]), json!(true)],
        )
    }

    fn list_lock_unspent(&self) -> Result<Vec<LockedOutput>, NodeError> {
        self.call(Scope::Wallet, "listlockunspent", &[])
    }

    fn get_balances(&self) -> Result<Balances, NodeError> {
        self.call(Scope::Wallet, "getbalances", &[])
    }
}

/// Connects to Bitcoin Core over JSON-RPC.
#[derive(Debug, Clone)]
pub struct RpcConnector {
    pub timeout: Duration,
    pub retries: u32,
}

impl NodeConnector for RpcConnector {
    fn connect(&self, node: &Node) -> Arc<dyn NodeGateway> {
        Arc::new(RpcNode::new(node.clone(), self.timeout, self.retries))
    }
}
