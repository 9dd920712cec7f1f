//! The persisted multisig wallet and every operation on it.
//!
//! Each mutating operation changes the in-memory record and writes the whole
//! record back before returning. Every save bumps the record's revision and
//! is refused if another handle saved in between, so two handles on one
//! wallet can never both commit the same address index.

use std::str::FromStr;
use std::sync::Arc;

use bitcoin::psbt::Psbt;
use bitcoin::{Address, Transaction, Txid};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::address::{AddressAllocator, Policy, Slot};
use crate::descriptor::{self, Network, ScriptType, WalletType};
use crate::device::SignerDevice;
use crate::error::{Error, Result};
use crate::node::{
    BalanceSet, FundingOptions, LockedOutput, Node, NodeConnector, NodeError, NodeGateway, Payment, Utxo,
    WalletTransaction,
};
use crate::psbt::{self, LedgerRecord, PsbtLedger, PsbtStatus};
use crate::signer::{DeviceType, Signer, SignerRecord};
use crate::store::{StoreError, WalletStore};

/// Version written to, and required from, wallet files.
pub const FORMAT_VERSION: u64 = 1;

// Bitcoin Core RPC error codes the wallet reacts to.
const RPC_INVALID_ADDRESS_OR_KEY: i32 = -5;
const RPC_WALLET_NOT_FOUND: i32 = -18;
const RPC_VERIFY_ALREADY_IN_CHAIN: i32 = -27;
const RPC_WALLET_ALREADY_LOADED: i32 = -35;

/// Collaborators shared by every wallet in a process.
#[derive(Clone)]
pub struct Context {
    pub store: Arc<dyn WalletStore>,
    pub connector: Arc<dyn NodeConnector>,
    /// Addresses per chain exported to the node when quorum is reached.
    pub address_window: u32,
}

/// Result of a read that depends on the node.
#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot<T> {
    Live(T),
    /// The node could not be reached. No figures are better than stale ones.
    Unavailable,
}

impl<T> Snapshot<T> {
    pub fn live(self) -> Option<T> {
        match self {
            Snapshot::Live(value) => Some(value),
            Snapshot::Unavailable => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Snapshot::Live(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Coins {
    pub unspent: Vec<Utxo>,
    pub locked: Vec<LockedOutput>,
}

/// Outcome of [`WalletRecord::reconcile`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciled {
    /// Known to the node and dropped from the ledger.
    pub confirmed: Vec<Txid>,
    /// Unknown to the node and returned to their signing state.
    pub reverted: Vec<Txid>,
}

/// Parameters of a new wallet.
#[derive(Debug, Clone)]
pub struct NewWallet {
    pub name: String,
    pub m: usize,
    pub n: usize,
    pub network: Network,
    pub script_type: ScriptType,
    pub wallet_type: WalletType,
    pub node: Node,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignerSummary {
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub fingerprint: String,
    pub derivation_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WalletSummary {
    pub name: String,
    pub m: usize,
    pub n: usize,
    pub network: Network,
    pub script_type: ScriptType,
    pub wallet_type: WalletType,
    pub ready: bool,
    pub signers: Vec<SignerSummary>,
    pub receiving_address_index: u32,
    pub change_address_index: u32,
    pub psbts: Vec<PsbtStatus>,
    pub node_linked: bool,
    /// The address window due at quorum has not reached the node yet.
    pub window_pending: bool,
}

/// On-disk layout.
#[derive(Debug, Serialize, Deserialize)]
struct WalletFile {
    version: u64,
    #[serde(default)]
    revision: u64,
    name: String,
    m: usize,
    n: usize,
    signers: Vec<SignerRecord>,
    psbts: Vec<LedgerRecord>,
    receiving_address_index: u32,
    change_address_index: u32,
    network: Network,
    script_type: ScriptType,
    wallet_type: WalletType,
    node: Node,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    window_pending: bool,
}

enum Link {
    Linked,
    Degraded(String),
}

pub struct WalletRecord {
    name: String,
    m: usize,
    n: usize,
    signers: Vec<Signer>,
    psbts: PsbtLedger,
    receiving_address_index: u32,
    change_address_index: u32,
    network: Network,
    script_type: ScriptType,
    wallet_type: WalletType,
    node: Node,
    window_pending: bool,
    /// Revision of the stored record this handle last loaded or saved.
    revision: Option<u64>,
    gateway: Arc<dyn NodeGateway>,
    link: Link,
    ctx: Context,
}

/// Loads the node-side watch-only wallet, creating it when missing.
fn ensure_watch_only(gateway: &dyn NodeGateway, name: &str) -> Result<(), NodeError> {
    if gateway.list_wallets()?.iter().any(|w| w == name) {
        return Ok(());
    }
    match gateway.load_wallet(name) {
        Ok(()) => {
            debug!(wallet = name, "loaded watch-only wallet");
            Ok(())
        }
        Err(NodeError::Rpc { code: RPC_WALLET_ALREADY_LOADED, .. }) => Ok(()),
        Err(NodeError::Rpc { code: RPC_WALLET_NOT_FOUND, .. }) => {
            gateway.create_watch_only_wallet(name)?;
            info!(wallet = name, "created watch-only wallet");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

impl WalletRecord {
    /// Creates and persists a new, empty wallet.
    ///
    /// Parameters are validated before anything touches the store or node.
    pub fn create(ctx: &Context, params: NewWallet) -> Result<Self> {
        descriptor::validate_policy(params.m, params.n, params.wallet_type)?;
        if params.node.network != params.network {
            return Err(Error::Configuration(format!(
                "node is configured for {}, wallet for {}",
                params.node.network, params.network
            )));
        }
        if ctx.store.exists(&params.name)? {
            return Err(Error::AlreadyExists(params.name));
        }

        let gateway = ctx.connector.connect(&params.node);
        ensure_watch_only(gateway.as_ref(), &params.node.wallet_name)?;

        let mut wallet = Self {
            name: params.name,
            m: params.m,
            n: params.n,
            signers: Vec::new(),
            psbts: PsbtLedger::new(),
            receiving_address_index: 0,
            change_address_index: 0,
            network: params.network,
            script_type: params.script_type,
            wallet_type: params.wallet_type,
            node: params.node,
            window_pending: false,
            revision: None,
            gateway,
            link: Link::Linked,
            ctx: ctx.clone(),
        };
        wallet.save()?;
        info!(
            wallet = %wallet.name,
            policy = %format!("{}-of-{}", wallet.m, wallet.n),
            network = %wallet.network,
            "created wallet"
        );
        Ok(wallet)
    }

    /// Loads a stored wallet. An unreachable node does not fail the open;
    /// node-backed reads report `Snapshot::Unavailable` until `reconnect`.
    pub fn open(ctx: &Context, name: &str) -> Result<Self> {
        let contents = ctx
            .store
            .load(name)?
            .ok_or_else(|| Error::NotFound(format!("wallet \"{name}\"")))?;
        let file = parse_file(name, &contents)?;

        let gateway = ctx.connector.connect(&file.node);
        let link = match ensure_watch_only(gateway.as_ref(), &file.node.wallet_name) {
            Ok(()) => Link::Linked,
            Err(e) => {
                warn!(wallet = name, error = %e, "watch-only wallet unreachable, continuing degraded");
                Link::Degraded(e.to_string())
            }
        };

        let signers = file.signers.iter().map(Signer::from_record).collect::<Result<Vec<_>>>()?;
        Ok(Self {
            name: file.name,
            m: file.m,
            n: file.n,
            signers,
            psbts: PsbtLedger::from_records(&file.psbts)?,
            receiving_address_index: file.receiving_address_index,
            change_address_index: file.change_address_index,
            network: file.network,
            script_type: file.script_type,
            wallet_type: file.wallet_type,
            node: file.node,
            window_pending: file.window_pending,
            revision: Some(file.revision),
            gateway,
            link,
            ctx: ctx.clone(),
        })
    }

    /// Names of every stored wallet.
    pub fn list(ctx: &Context) -> Result<Vec<String>> {
        Ok(ctx.store.list()?)
    }

    /// Writes the record under the next revision. Fails with
    /// `StoreError::Conflict` when another handle saved since this one last
    /// loaded or saved; reopen the wallet and retry.
    pub fn save(&mut self) -> Result<()> {
        let next = self.revision.map_or(1, |r| r + 1);
        self.ctx.store.save(&self.name, self.revision, &self.serialize(next)?)?;
        self.revision = Some(next);
        Ok(())
    }

    /// The persisted form, as last loaded or saved.
    pub fn to_json(&self) -> Result<String> {
        self.serialize(self.revision.unwrap_or(0))
    }

    fn serialize(&self, revision: u64) -> Result<String> {
        let file = WalletFile {
            version: FORMAT_VERSION,
            revision,
            name: self.name.clone(),
            m: self.m,
            n: self.n,
            signers: self.signers.iter().map(Signer::to_record).collect(),
            psbts: self.psbts.to_records(),
            receiving_address_index: self.receiving_address_index,
            change_address_index: self.change_address_index,
            network: self.network,
            script_type: self.script_type,
            wallet_type: self.wallet_type,
            node: self.node.clone(),
            window_pending: self.window_pending,
        };
        Ok(serde_json::to_string_pretty(&file).map_err(StoreError::from)?)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn m(&self) -> usize {
        self.m
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn signers(&self) -> &[Signer] {
        &self.signers
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn script_type(&self) -> ScriptType {
        self.script_type
    }

    pub fn wallet_type(&self) -> WalletType {
        self.wallet_type
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn receiving_address_index(&self) -> u32 {
        self.receiving_address_index
    }

    pub fn change_address_index(&self) -> u32 {
        self.change_address_index
    }

    pub fn psbts(&self) -> &PsbtLedger {
        &self.psbts
    }

    pub fn ready(&self) -> bool {
        self.signers.len() == self.n
    }

    pub fn window_pending(&self) -> bool {
        self.window_pending
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self.link, Link::Degraded(_))
    }

    /// Account path signers must export their xpub at.
    pub fn account_path(&self) -> bitcoin::bip32::DerivationPath {
        descriptor::account_path(self.script_type, self.wallet_type, self.network)
    }

    fn policy(&self) -> Policy {
        Policy {
            m: self.m,
            network: self.network,
            script_type: self.script_type,
            wallet_type: self.wallet_type,
        }
    }

    fn allocator(&self) -> AddressAllocator<'_> {
        AddressAllocator::new(self.gateway.as_ref(), &self.signers, self.policy(), &self.name)
    }

    fn require_ready(&self) -> Result<()> {
        if self.ready() {
            Ok(())
        } else {
            Err(Error::NotReady(format!(
                "{} of {} required signers enrolled",
                self.signers.len(),
                self.n
            )))
        }
    }

    /// Writes need the watch-only wallet; a degraded wallet retries the link
    /// once before giving up.
    fn ensure_linked(&mut self) -> Result<()> {
        if let Link::Degraded(_) = self.link {
            self.reconnect()?;
        }
        Ok(())
    }

    /// Re-establishes the watch-only link after a degraded open.
    pub fn reconnect(&mut self) -> Result<()> {
        let gateway = self.ctx.connector.connect(&self.node);
        match ensure_watch_only(gateway.as_ref(), &self.node.wallet_name) {
            Ok(()) => {
                self.gateway = gateway;
                if self.is_degraded() {
                    info!(wallet = %self.name, "watch-only wallet reachable again");
                }
                self.link = Link::Linked;
                self.export_pending_window()?;
                Ok(())
            }
            Err(e) => {
                self.link = Link::Degraded(e.to_string());
                Err(e.into())
            }
        }
    }

    pub fn add_signer(
        &mut self,
        name: &str,
        fingerprint: &str,
        xpub: &str,
        device_type: DeviceType,
        derivation_path: &str,
    ) -> Result<()> {
        let signer = Signer::parse(name, device_type, fingerprint, xpub, derivation_path)?;
        self.add(signer)
    }

    /// Reads fingerprint and account xpub from `device` and enrolls it.
    pub fn enroll(&mut self, name: &str, device: &dyn SignerDevice) -> Result<Signer> {
        self.check_room()?;
        let derivation_path = self.account_path();
        let signer = Signer {
            name: name.to_string(),
            device_type: device.device_type(),
            fingerprint: device.fingerprint()?,
            xpub: device.get_xpub(&derivation_path)?,
            derivation_path,
        };
        self.add(signer.clone())?;
        Ok(signer)
    }

    fn check_room(&self) -> Result<()> {
        if self.ready() {
            return Err(Error::NotReady(format!(
                "already have {n} of {n} required signers",
                n = self.n
            )));
        }
        Ok(())
    }

    fn add(&mut self, signer: Signer) -> Result<()> {
        self.check_room()?;
        if self.signers.iter().any(|s| s.name == signer.name) {
            return Err(Error::DuplicateSigner(format!("name \"{}\" already enrolled", signer.name)));
        }
        if self.signers.iter().any(|s| s.fingerprint == signer.fingerprint) {
            return Err(Error::DuplicateSigner(format!(
                "fingerprint {} already enrolled",
                signer.fingerprint
            )));
        }
        if self.signers.iter().any(|s| s.xpub == signer.xpub) {
            return Err(Error::DuplicateSigner(format!("xpub of \"{}\" already enrolled", signer.name)));
        }
        if signer.xpub.network != self.network.network_kind() {
            return Err(Error::Configuration(format!(
                "xpub of \"{}\" is not for {}",
                signer.name, self.network
            )));
        }
        let expected = self.account_path();
        if signer.derivation_path != expected {
            warn!(
                signer = %signer.name,
                path = %signer.derivation_path,
                expected = %expected,
                "signer xpub was not exported at the standard account path"
            );
        }

        let (name, fingerprint) = (signer.name.clone(), signer.fingerprint);
        self.signers.push(signer);
        self.window_pending = self.ready() && self.ctx.address_window > 0;
        if let Err(e) = self.save() {
            self.signers.pop();
            self.window_pending = false;
            return Err(e);
        }
        info!(wallet = %self.name, signer = %name, %fingerprint, "added signer");

        if self.ready() {
            info!(wallet = %self.name, "wallet reached quorum");
            // The signer is committed; a node outage only delays the export
            // until the next sync or reconnect.
            let exported = match self.ensure_linked() {
                Ok(()) => self.export_pending_window(),
                Err(e) => Err(e),
            };
            if let Err(e) = exported {
                warn!(wallet = %self.name, error = %e, "address window not exported, will retry on sync");
            }
        }
        Ok(())
    }

    /// Sends the address window due at quorum, if it is still outstanding.
    /// Returns the number of addresses sent.
    fn export_pending_window(&mut self) -> Result<usize> {
        if !self.window_pending {
            return Ok(0);
        }
        let count = self.allocator().export_window(
            self.receiving_address_index,
            self.change_address_index,
            self.ctx.address_window,
        )?;
        self.window_pending = false;
        self.save()?;
        Ok(count)
    }

    /// Descriptor of one address, for inspection.
    pub fn descriptor(&self, change: bool, index: u32) -> Result<String> {
        self.require_ready()?;
        self.allocator().descriptor(Slot { change, index })
    }

    pub fn derive_receiving_address(&mut self) -> Result<String> {
        self.derive_address(false)
    }

    pub fn derive_change_address(&mut self) -> Result<String> {
        self.derive_address(true)
    }

    /// Issues the next address of a chain. The counter is persisted before
    /// the address is returned, so an index is never handed out twice.
    pub fn derive_address(&mut self, change: bool) -> Result<String> {
        self.require_ready()?;
        self.ensure_linked()?;
        let index = if change {
            self.change_address_index
        } else {
            self.receiving_address_index
        };
        let next = index
            .checked_add(1)
            .filter(|next| *next < (1 << 31))
            .ok_or_else(|| Error::Configuration("address index space exhausted".into()))?;

        let address = self.allocator().register(Slot { change, index })?;

        self.set_counter(change, next);
        if let Err(e) = self.save() {
            self.set_counter(change, index);
            return Err(e);
        }
        Ok(address)
    }

    fn set_counter(&mut self, change: bool, value: u32) {
        if change {
            self.change_address_index = value;
        } else {
            self.receiving_address_index = value;
        }
    }

    /// Re-registers issued addresses the node no longer watches, and sends
    /// an address window left outstanding at quorum. With `rescan`, the node
    /// rescans the chain for their history. Returns the number of addresses
    /// sent to the node.
    pub fn sync(&mut self, rescan: bool) -> Result<usize> {
        self.require_ready()?;
        self.ensure_linked()?;
        let exported = self.export_pending_window()?;
        let repaired = self
            .allocator()
            .sync(self.receiving_address_index, self.change_address_index, rescan)?;
        Ok(exported + repaired)
    }

    /// Asks the node to fund `outputs` from the wallet's coins and records
    /// the result. Returns the new entry's index.
    pub fn create_psbt(&mut self, outputs: &[Payment], subtract_fee_from: &[usize]) -> Result<usize> {
        self.require_ready()?;
        if outputs.is_empty() {
            return Err(Error::Configuration("a psbt needs at least one output".into()));
        }
        for payment in outputs {
            let address = Address::from_str(&payment.address)
                .map_err(|e| Error::Configuration(format!("invalid address {}: {e}", payment.address)))?;
            if !address.is_valid_for_network(self.network.to_bitcoin()) {
                return Err(Error::Configuration(format!(
                    "address {} is not for {}",
                    payment.address, self.network
                )));
            }
        }
        if let Some(index) = subtract_fee_from.iter().find(|i| **i >= outputs.len()) {
            return Err(Error::Configuration(format!("no output {index} to subtract the fee from")));
        }

        let change_address = self.derive_change_address()?;
        let funded = self.gateway.create_funded_psbt(
            outputs,
            &FundingOptions {
                change_address,
                subtract_fee_from_outputs: subtract_fee_from.to_vec(),
            },
        )?;
        let psbt = psbt::decode(&funded.psbt)?;

        let index = self.psbts.push(psbt);
        self.save()?;
        info!(wallet = %self.name, index, fee = %funded.fee, "created psbt");
        Ok(index)
    }

    pub fn psbt(&self, index: usize) -> Result<&Psbt> {
        Ok(&self.psbts.get(index)?.psbt)
    }

    pub fn psbt_status(&self, index: usize) -> Result<PsbtStatus> {
        Ok(self.psbts.get(index)?.status(self.m))
    }

    /// The node's view of a ledger entry.
    pub fn decode_psbt(&self, index: usize) -> Result<Value> {
        let encoded = psbt::encode(&self.psbts.get(index)?.psbt);
        Ok(self.gateway.decode_psbt(&encoded)?)
    }

    /// Replaces an entry with a newer version, trusting that it is the same
    /// transaction. Prefer [`combine_psbt`](Self::combine_psbt).
    pub fn update_psbt(&mut self, index: usize, psbt: Psbt) -> Result<()> {
        self.require_unsubmitted(index)?;
        self.psbts.replace(index, psbt)?;
        self.save()
    }

    fn require_unsubmitted(&self, index: usize) -> Result<()> {
        match self.psbts.get(index)?.submitted_txid {
            Some(txid) => Err(Error::InvalidPsbt(format!(
                "psbt {index} was already submitted as {txid}; reconcile first"
            ))),
            None => Ok(()),
        }
    }

    /// Merges signatures from an externally signed copy.
    pub fn combine_psbt(&mut self, index: usize, psbt: Psbt) -> Result<PsbtStatus> {
        self.psbts.combine(index, psbt)?;
        self.save()?;
        self.psbt_status(index)
    }

    /// Runs one signing round trip with `device`.
    pub fn sign_psbt(&mut self, index: usize, device: &dyn SignerDevice) -> Result<PsbtStatus> {
        self.require_ready()?;
        self.require_unsubmitted(index)?;
        let signed = device.sign_transaction(&self.psbts.get(index)?.psbt)?;
        let status = self.combine_psbt(index, signed)?;
        info!(wallet = %self.name, index, ?status, device = %device.device_type(), "psbt signed");
        Ok(status)
    }

    /// Drops an entry without broadcasting it.
    pub fn remove_psbt(&mut self, index: usize) -> Result<Psbt> {
        let entry = self.psbts.remove(index)?;
        self.save()?;
        info!(wallet = %self.name, index, "removed psbt");
        Ok(entry.psbt)
    }

    /// Finalizes and submits an entry, then drops it from the ledger.
    ///
    /// The entry is marked submitted and persisted before the node sees the
    /// transaction. If submission fails with an RPC rejection the mark is
    /// cleared again; if the node cannot be reached the mark stays, since the
    /// outcome is unknown, and [`reconcile`](Self::reconcile) resolves it.
    pub fn broadcast(&mut self, index: usize) -> Result<Txid> {
        self.require_ready()?;
        self.require_unsubmitted(index)?;
        let entry = self.psbts.get(index)?;
        let signed = psbt::signature_count(&entry.psbt, self.m);
        let finalized = self.gateway.finalize_psbt(&psbt::encode(&entry.psbt))?;
        let hex = match (finalized.complete, finalized.hex) {
            (true, Some(hex)) => hex,
            _ => {
                return Err(Error::Incomplete(format!(
                    "psbt {index} has {signed} of {} required signatures",
                    self.m
                )));
            }
        };
        let tx: Transaction = bitcoin::consensus::encode::deserialize_hex(&hex)
            .map_err(|e| NodeError::Response(format!("finalized transaction: {e}")))?;
        let txid = tx.compute_txid();

        self.psbts.mark_submitted(index, txid)?;
        self.save()?;

        match self.gateway.submit_raw_transaction(&hex) {
            Ok(reported) => {
                if reported != txid.to_string() {
                    warn!(%txid, %reported, "node reported a different txid");
                }
            }
            Err(NodeError::Rpc { code: RPC_VERIFY_ALREADY_IN_CHAIN, .. }) => {
                info!(%txid, "transaction already in chain");
            }
            Err(e @ NodeError::Rpc { .. }) => {
                self.psbts.clear_submitted(index)?;
                self.save()?;
                return Err(e.into());
            }
            Err(e) => {
                warn!(%txid, error = %e, "submission outcome unknown, psbt stays marked submitted");
                return Err(e.into());
            }
        }

        self.psbts.remove(index)?;
        self.save()?;
        info!(wallet = %self.name, %txid, "broadcast transaction");
        Ok(txid)
    }

    /// Resolves entries left marked submitted by an interrupted broadcast.
    ///
    /// Entries resolved before a failed lookup are saved before the error is
    /// returned.
    pub fn reconcile(&mut self) -> Result<Reconciled> {
        let mut outcome = Reconciled::default();
        let mut failure = None;
        for txid in self.psbts.submitted() {
            let Some(index) = self.psbts.position_of(&txid) else {
                continue;
            };
            match self.gateway.get_transaction(&txid.to_string()) {
                Ok(_) => {
                    self.psbts.remove(index)?;
                    outcome.confirmed.push(txid);
                }
                Err(NodeError::Rpc { code: RPC_INVALID_ADDRESS_OR_KEY, .. }) => {
                    self.psbts.clear_submitted(index)?;
                    outcome.reverted.push(txid);
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        if !outcome.confirmed.is_empty() || !outcome.reverted.is_empty() {
            self.save()?;
            info!(
                wallet = %self.name,
                confirmed = outcome.confirmed.len(),
                reverted = outcome.reverted.len(),
                "reconciled submitted psbts"
            );
        }
        match failure {
            Some(e) => Err(e.into()),
            None => Ok(outcome),
        }
    }

    fn read<T>(&self, what: &str, op: impl FnOnce(&dyn NodeGateway) -> Result<T, NodeError>) -> Result<Snapshot<T>> {
        if let Link::Degraded(reason) = &self.link {
            debug!(what, %reason, "wallet degraded");
            return Ok(Snapshot::Unavailable);
        }
        match op(self.gateway.as_ref()) {
            Ok(value) => Ok(Snapshot::Live(value)),
            Err(e @ (NodeError::Unavailable { .. } | NodeError::Transport(_))) => {
                warn!(what, error = %e, "node unavailable");
                Ok(Snapshot::Unavailable)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn balances(&self) -> Result<Snapshot<BalanceSet>> {
        self.read("balances", |node| Ok(node.get_balances()?.watched().clone()))
    }

    pub fn history(&self, count: usize) -> Result<Snapshot<Vec<WalletTransaction>>> {
        self.read("history", |node| node.list_transactions(count))
    }

    pub fn coins(&self) -> Result<Snapshot<Coins>> {
        self.read("coins", |node| {
            Ok(Coins {
                unspent: node.list_unspent()?,
                locked: node.list_lock_unspent()?,
            })
        })
    }

    pub fn describe(&self) -> WalletSummary {
        WalletSummary {
            name: self.name.clone(),
            m: self.m,
            n: self.n,
            network: self.network,
            script_type: self.script_type,
            wallet_type: self.wallet_type,
            ready: self.ready(),
            signers: self
                .signers
                .iter()
                .map(|s| SignerSummary {
                    name: s.name.clone(),
                    device_type: s.device_type,
                    fingerprint: s.fingerprint.to_string(),
                    derivation_path: s.derivation_path.to_string(),
                })
                .collect(),
            receiving_address_index: self.receiving_address_index,
            change_address_index: self.change_address_index,
            psbts: self.psbts.entries().iter().map(|e| e.status(self.m)).collect(),
            node_linked: !self.is_degraded(),
            window_pending: self.window_pending,
        }
    }
}

fn parse_file(name: &str, contents: &str) -> Result<WalletFile> {
    let corrupt = |reason: String| StoreError::Corrupt {
        name: name.to_string(),
        reason,
    };
    let value: Value = serde_json::from_str(contents).map_err(|e| corrupt(e.to_string()))?;
    match value.get("version").and_then(Value::as_u64) {
        Some(FORMAT_VERSION) => {}
        Some(other) => {
            return Err(Error::Configuration(format!(
                "wallet \"{name}\" uses format version {other}, expected {FORMAT_VERSION}"
            )));
        }
        None => {
            return Err(Error::Configuration(format!("wallet \"{name}\" has no format version")));
        }
    }
    let file: WalletFile = serde_json::from_value(value).map_err(|e| corrupt(e.to_string()))?;
    if file.name != name {
        return Err(corrupt(format!("record is named \"{}\"", file.name)).into());
    }
    descriptor::validate_policy(file.m, file.n, file.wallet_type)?;
    if file.signers.len() > file.n {
        return Err(corrupt(format!("{} signers for n = {}", file.signers.len(), file.n)).into());
    }
    Ok(file)
}
