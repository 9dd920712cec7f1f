#![allow(dead_code)]

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use bitcoin::bip32::DerivationPath;
use bitcoin::consensus::encode::{deserialize_hex, serialize_hex};
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{
    Address, Amount, OutPoint, ScriptBuf, Sequence, SignedAmount, Transaction, TxIn, TxOut, Txid, Witness,
    absolute, transaction,
};
use miniscript::descriptor::{DefiniteDescriptorKey, Descriptor, DescriptorPublicKey};
use miniscript::psbt::PsbtExt;
use miniscript::{ForEachKey, ToPublicKey};
use serde_json::{Value, json};
use tempfile::TempDir;

use multisig_coordinator::descriptor::account_path;
use multisig_coordinator::node::{
    AddressInfo, BalanceSet, Balances, DescriptorInfo, EmbeddedInfo, FinalizedPsbt, FundedPsbt, FundingOptions,
    ImportOutcome, LockedOutput, Utxo, WalletTransaction, WatchRequest,
};
use multisig_coordinator::psbt;
use multisig_coordinator::{
    Context, FileStore, Network, NewWallet, Node, NodeConnector, NodeError, NodeGateway, Payment, ScriptType,
    SoftwareSigner, WalletRecord, WalletType,
};

pub const FEE: Amount = Amount::from_sat(1_000);

/// A BIP173 testnet address owned by nobody in these tests.
pub const EXTERNAL_ADDRESS: &str = "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx";

struct Watched {
    descriptor: Descriptor<DefiniteDescriptorKey>,
    internal: bool,
}

struct Coin {
    outpoint: OutPoint,
    address: String,
    value: Amount,
}

/// Node state tests can inspect and rig.
#[derive(Default)]
pub struct State {
    /// Wallets that exist on the node.
    pub wallets: Vec<String>,
    pub loaded: Vec<String>,
    watched: HashMap<String, Watched>,
    coins: Vec<Coin>,
    pub broadcast: Vec<Transaction>,
    pub unavailable: bool,
    /// Report registered addresses as not watch-only.
    pub not_watch_only: bool,
    /// Report multisig keys in reverse order.
    pub reverse_pubkeys: bool,
    /// Fail the next submissions with this error.
    pub submit_error: Option<NodeError>,
    /// Accept submitted transactions even when failing with `submit_error`.
    pub accept_failed_submissions: bool,
    /// Fail `gettransaction` for this txid with the given error.
    pub lookup_error: Option<(String, NodeError)>,
    pub import_calls: usize,
    pub rescans: usize,
}

/// In-process stand-in for Bitcoin Core's wallet RPC.
pub struct FakeNode {
    network: bitcoin::Network,
    state: Mutex<State>,
}

fn rpc(code: i32, message: impl Into<String>) -> NodeError {
    NodeError::Rpc {
        code,
        message: message.into(),
    }
}

fn parse_descriptor(descriptor: &str) -> Result<Descriptor<DefiniteDescriptorKey>, NodeError> {
    Descriptor::<DescriptorPublicKey>::from_str(descriptor)
        .map_err(|e| rpc(-5, e.to_string()))?
        .at_derivation_index(0)
        .map_err(|e| rpc(-5, e.to_string()))
}

impl FakeNode {
    pub fn new(network: bitcoin::Network) -> Arc<Self> {
        Arc::new(Self {
            network,
            state: Mutex::new(State::default()),
        })
    }

    pub fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn online(&self) -> Result<MutexGuard<'_, State>, NodeError> {
        let state = self.state();
        if state.unavailable {
            return Err(NodeError::Unavailable {
                attempts: 4,
                message: "connection refused".into(),
            });
        }
        Ok(state)
    }

    pub fn is_watched(&self, address: &str) -> bool {
        self.state().watched.contains_key(address)
    }

    pub fn watched_count(&self) -> usize {
        self.state().watched.len()
    }

    /// Simulates a node that lost its watch-only data.
    pub fn forget_watches(&self) {
        self.state().watched.clear();
    }

    pub fn fund(&self, address: &str, value: Amount) -> OutPoint {
        let mut state = self.state();
        let outpoint = OutPoint {
            txid: Txid::from_str(&format!("{:064x}", state.coins.len() + 1)).unwrap(),
            vout: 0,
        };
        state.coins.push(Coin {
            outpoint,
            address: address.to_string(),
            value,
        });
        outpoint
    }

    fn address_of(&self, descriptor: &Descriptor<DefiniteDescriptorKey>) -> Result<String, NodeError> {
        Ok(descriptor
            .address(self.network)
            .map_err(|e| rpc(-5, e.to_string()))?
            .to_string())
    }

    fn parse_address(&self, address: &str) -> Result<Address, NodeError> {
        Address::from_str(address)
            .map_err(|e| rpc(-5, e.to_string()))?
            .require_network(self.network)
            .map_err(|e| rpc(-5, e.to_string()))
    }
}

fn multisig_keys(descriptor: &Descriptor<DefiniteDescriptorKey>) -> Option<Vec<String>> {
    if !descriptor.to_string().contains("multi(") {
        return None;
    }
    let mut keys = Vec::new();
    descriptor.for_each_key(|key| {
        keys.push(key.to_public_key().to_string());
        true
    });
    Some(keys)
}

impl NodeGateway for FakeNode {
    fn list_wallets(&self) -> Result<Vec<String>, NodeError> {
        Ok(self.online()?.loaded.clone())
    }

    fn load_wallet(&self, name: &str) -> Result<(), NodeError> {
        let mut state = self.online()?;
        if state.loaded.iter().any(|w| w == name) {
            return Err(rpc(-35, "Wallet is already loaded"));
        }
        if !state.wallets.iter().any(|w| w == name) {
            return Err(rpc(-18, "Wallet file not found"));
        }
        state.loaded.push(name.to_string());
        Ok(())
    }

    fn create_watch_only_wallet(&self, name: &str) -> Result<(), NodeError> {
        let mut state = self.online()?;
        if state.wallets.iter().any(|w| w == name) {
            return Err(rpc(-4, "Wallet already exists"));
        }
        state.wallets.push(name.to_string());
        state.loaded.push(name.to_string());
        Ok(())
    }

    fn descriptor_info(&self, descriptor: &str) -> Result<DescriptorInfo, NodeError> {
        let _state = self.online()?;
        let parsed = Descriptor::<DescriptorPublicKey>::from_str(descriptor).map_err(|e| rpc(-5, e.to_string()))?;
        let canonical = parsed.to_string();
        Ok(DescriptorInfo {
            checksum: canonical.split_once('#').map(|(_, checksum)| checksum.to_string()),
            descriptor: canonical,
            is_range: false,
        })
    }

    fn derive_addresses(&self, descriptor: &str, _range: Option<[u32; 2]>) -> Result<Vec<String>, NodeError> {
        let _state = self.online()?;
        Ok(vec![self.address_of(&parse_descriptor(descriptor)?)?])
    }

    fn address_info(&self, address: &str) -> Result<AddressInfo, NodeError> {
        let state = self.online()?;
        let Some(watched) = state.watched.get(address) else {
            return Ok(AddressInfo {
                address: address.to_string(),
                ..AddressInfo::default()
            });
        };

        let mut keys = multisig_keys(&watched.descriptor);
        if state.reverse_pubkeys {
            if let Some(keys) = keys.as_mut() {
                keys.reverse();
            }
        }
        let wrapped = matches!(watched.descriptor, Descriptor::Sh(_));
        Ok(AddressInfo {
            address: address.to_string(),
            is_watch_only: !state.not_watch_only,
            is_change: watched.internal,
            pubkeys: if wrapped { None } else { keys.clone() },
            embedded: wrapped.then(|| EmbeddedInfo { pubkeys: keys }),
        })
    }

    fn import_multi(&self, requests: &[WatchRequest], rescan: bool) -> Result<Vec<ImportOutcome>, NodeError> {
        let mut outcomes = Vec::new();
        let mut imported = Vec::new();
        for request in requests {
            let descriptor = parse_descriptor(&request.descriptor)?;
            imported.push((self.address_of(&descriptor)?, descriptor, request.internal));
        }

        let mut state = self.online()?;
        state.import_calls += 1;
        if rescan {
            state.rescans += 1;
        }
        for (address, descriptor, internal) in imported {
            state.watched.insert(address, Watched { descriptor, internal });
            outcomes.push(ImportOutcome {
                success: true,
                warnings: Vec::new(),
                error: None,
            });
        }
        Ok(outcomes)
    }

    fn create_funded_psbt(&self, outputs: &[Payment], options: &FundingOptions) -> Result<FundedPsbt, NodeError> {
        let state = self.online()?;
        let total = outputs.iter().map(|p| p.amount).sum::<Amount>();
        let subtract = !options.subtract_fee_from_outputs.is_empty();
        let needed = if subtract { total } else { total + FEE };

        let spent = state
            .broadcast
            .iter()
            .flat_map(|tx| tx.input.iter().map(|i| i.previous_output))
            .collect::<Vec<_>>();
        let coin = state
            .coins
            .iter()
            .filter(|c| !spent.contains(&c.outpoint) && state.watched.contains_key(&c.address))
            .find(|c| c.value >= needed)
            .ok_or_else(|| rpc(-4, "Insufficient funds"))?;
        let watched = &state.watched[&coin.address];

        let mut tx_outputs = outputs
            .iter()
            .map(|p| {
                Ok(TxOut {
                    value: p.amount,
                    script_pubkey: self.parse_address(&p.address)?.script_pubkey(),
                })
            })
            .collect::<Result<Vec<_>, NodeError>>()?;
        if let Some(&index) = options.subtract_fee_from_outputs.first() {
            tx_outputs[index].value = tx_outputs[index].value - FEE;
        }
        let change_position = tx_outputs.len();
        tx_outputs.push(TxOut {
            value: coin.value - needed,
            script_pubkey: self.parse_address(&options.change_address)?.script_pubkey(),
        });

        let tx = Transaction {
            version: transaction::Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: coin.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            }],
            output: tx_outputs,
        };
        let mut psbt = Psbt::from_unsigned_tx(tx).map_err(|e| rpc(-22, e.to_string()))?;
        psbt.inputs[0].witness_utxo = Some(TxOut {
            value: coin.value,
            script_pubkey: self.parse_address(&coin.address)?.script_pubkey(),
        });
        psbt.update_input_with_descriptor(0, &watched.descriptor)
            .map_err(|e| rpc(-22, format!("{e:?}")))?;

        Ok(FundedPsbt {
            psbt: psbt::encode(&psbt),
            fee: FEE,
            change_position: change_position as i32,
        })
    }

    fn decode_psbt(&self, encoded: &str) -> Result<Value, NodeError> {
        let _state = self.online()?;
        let psbt = psbt::decode(encoded).map_err(|e| rpc(-22, e.to_string()))?;
        let vout = psbt
            .unsigned_tx
            .output
            .iter()
            .enumerate()
            .map(|(n, out)| {
                let address = Address::from_script(&out.script_pubkey, self.network)
                    .map(|a| a.to_string())
                    .ok();
                json!({
                    "n": n,
                    "value": out.value.to_btc(),
                    "scriptPubKey": { "address": address },
                })
            })
            .collect::<Vec<_>>();
        Ok(json!({
            "tx": { "txid": psbt.unsigned_tx.compute_txid().to_string(), "vout": vout },
            "fee": FEE.to_btc(),
        }))
    }

    fn finalize_psbt(&self, encoded: &str) -> Result<FinalizedPsbt, NodeError> {
        let _state = self.online()?;
        let mut psbt = psbt::decode(encoded).map_err(|e| rpc(-22, e.to_string()))?;
        match psbt.finalize_mut(&Secp256k1::verification_only()) {
            Ok(()) => Ok(FinalizedPsbt {
                psbt: None,
                hex: Some(serialize_hex(&psbt.extract_tx_unchecked_fee_rate())),
                complete: true,
            }),
            Err(_) => Ok(FinalizedPsbt {
                psbt: Some(encoded.to_string()),
                hex: None,
                complete: false,
            }),
        }
    }

    fn submit_raw_transaction(&self, hex: &str) -> Result<String, NodeError> {
        let mut state = self.online()?;
        let tx: Transaction = deserialize_hex(hex).map_err(|e| rpc(-22, e.to_string()))?;
        let txid = tx.compute_txid();
        if let Some(err) = state.submit_error.clone() {
            if state.accept_failed_submissions {
                state.broadcast.push(tx);
            }
            return Err(err);
        }
        if state.broadcast.iter().any(|t| t.compute_txid() == txid) {
            return Err(rpc(-27, "Transaction already in block chain"));
        }
        state.broadcast.push(tx);
        Ok(txid.to_string())
    }

    fn get_transaction(&self, txid: &str) -> Result<Value, NodeError> {
        let state = self.online()?;
        if let Some((failing, err)) = &state.lookup_error {
            if failing == txid {
                return Err(err.clone());
            }
        }
        state
            .broadcast
            .iter()
            .find(|tx| tx.compute_txid().to_string() == txid)
            .map(|tx| json!({ "txid": tx.compute_txid().to_string(), "confirmations": 0 }))
            .ok_or_else(|| rpc(-5, "Invalid or non-wallet transaction id"))
    }

    fn list_transactions(&self, count: usize) -> Result<Vec<WalletTransaction>, NodeError> {
        let state = self.online()?;
        Ok(state
            .coins
            .iter()
            .take(count)
            .map(|c| WalletTransaction {
                txid: c.outpoint.txid.to_string(),
                address: Some(c.address.clone()),
                category: "receive".into(),
                amount: SignedAmount::from_sat(c.value.to_sat() as i64),
                confirmations: 1,
                time: 0,
            })
            .collect())
    }

    fn list_unspent(&self) -> Result<Vec<Utxo>, NodeError> {
        let state = self.online()?;
        Ok(state
            .coins
            .iter()
            .map(|c| Utxo {
                txid: c.outpoint.txid.to_string(),
                vout: c.outpoint.vout,
                address: Some(c.address.clone()),
                amount: c.value,
                confirmations: 1,
            })
            .collect())
    }

    fn list_lock_unspent(&self) -> Result<Vec<LockedOutput>, NodeError> {
        let _state = self.online()?;
        Ok(Vec::new())
    }

    fn get_balances(&self) -> Result<Balances, NodeError> {
        let state = self.online()?;
        Ok(Balances {
            mine: BalanceSet::default(),
            watchonly: Some(BalanceSet {
                trusted: state.coins.iter().map(|c| c.value).sum(),
                ..BalanceSet::default()
            }),
        })
    }
}

pub struct FakeConnector(pub Arc<FakeNode>);

impl NodeConnector for FakeConnector {
    fn connect(&self, _node: &Node) -> Arc<dyn NodeGateway> {
        self.0.clone()
    }
}

/// Temporary datadir, fake node and the context wiring them together.
pub struct Harness {
    pub dir: TempDir,
    pub node: Arc<FakeNode>,
    pub ctx: Context,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_window(2)
    }

    pub fn with_window(address_window: u32) -> Self {
        let dir = TempDir::new().unwrap();
        let node = FakeNode::new(bitcoin::Network::Testnet);
        let ctx = Context {
            store: Arc::new(FileStore::open(dir.path()).unwrap()),
            connector: Arc::new(FakeConnector(node.clone())),
            address_window,
        };
        Self { dir, node, ctx }
    }

    pub fn params(&self, name: &str, m: usize, n: usize) -> NewWallet {
        NewWallet {
            name: name.to_string(),
            m,
            n,
            network: Network::Testnet,
            script_type: ScriptType::Native,
            wallet_type: WalletType::Multi,
            node: node_descriptor(name),
        }
    }

    /// Creates an `m`-of-`n` wallet and enrolls `n` software signers.
    pub fn ready_wallet(&self, params: NewWallet) -> (WalletRecord, Vec<SoftwareSigner>) {
        let mut wallet = WalletRecord::create(&self.ctx, params).unwrap();
        let path = wallet.account_path();
        let signers = (1..=wallet.n() as u8).map(|seed| signer(seed, &path)).collect::<Vec<_>>();
        for s in &signers {
            wallet.enroll(s.name(), s).unwrap();
        }
        assert!(wallet.ready());
        (wallet, signers)
    }

    /// Issues a receiving address and funds it.
    pub fn funded_wallet(&self, params: NewWallet, value: Amount) -> (WalletRecord, Vec<SoftwareSigner>) {
        let (mut wallet, signers) = self.ready_wallet(params);
        let address = wallet.derive_receiving_address().unwrap();
        self.node.fund(&address, value);
        (wallet, signers)
    }
}

pub fn node_descriptor(wallet_name: &str) -> Node {
    Node {
        host: "127.0.0.1".into(),
        port: 18332,
        user: "bitcoin".into(),
        password: Some("secret".into()),
        cookie_file: None,
        wallet_name: wallet_name.to_string(),
        network: Network::Testnet,
    }
}

pub fn signer(seed: u8, path: &DerivationPath) -> SoftwareSigner {
    SoftwareSigner::from_seed(&format!("signer-{seed}"), bitcoin::Network::Testnet, &[seed; 32], path).unwrap()
}

pub fn native_multi_path() -> DerivationPath {
    account_path(ScriptType::Native, WalletType::Multi, Network::Testnet)
}

pub fn payment(address: &str, sats: u64) -> Payment {
    Payment {
        address: address.to_string(),
        amount: Amount::from_sat(sats),
    }
}
