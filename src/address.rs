//! Address issuance and node-side watch registration.
//!
//! The allocator never touches the counters itself. `WalletRecord` owns them
//! and commits each increment before handing an address out.

use std::str::FromStr;

use miniscript::descriptor::{Descriptor, DescriptorPublicKey};
use tracing::{debug, info, warn};

use crate::descriptor::{self, Network, ScriptType, WalletType};
use crate::error::{Error, Result};
use crate::node::{AddressInfo, NodeError, NodeGateway, WatchRequest};
use crate::signer::Signer;

/// One position in the wallet's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot {
    pub change: bool,
    pub index: u32,
}

impl Slot {
    pub fn receiving(index: u32) -> Self {
        Self { change: false, index }
    }

    pub fn change(index: u32) -> Self {
        Self { change: true, index }
    }

    fn chain(&self) -> &'static str {
        if self.change { "change" } else { "receiving" }
    }
}

/// Wallet parameters that shape the address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub m: usize,
    pub network: Network,
    pub script_type: ScriptType,
    pub wallet_type: WalletType,
}

#[derive(Debug, Clone)]
struct Resolved {
    slot: Slot,
    /// Node-canonical form, checksum included.
    descriptor: String,
    address: String,
}

pub struct AddressAllocator<'a> {
    node: &'a dyn NodeGateway,
    signers: &'a [Signer],
    policy: Policy,
    label: &'a str,
}

impl<'a> AddressAllocator<'a> {
    pub fn new(node: &'a dyn NodeGateway, signers: &'a [Signer], policy: Policy, label: &'a str) -> Self {
        Self {
            node,
            signers,
            policy,
            label,
        }
    }

    pub fn descriptor(&self, slot: Slot) -> Result<String> {
        descriptor::descriptor(
            self.signers,
            self.policy.m,
            self.policy.script_type,
            self.policy.wallet_type,
            slot.change,
            slot.index,
        )
    }

    /// Address the slot maps to, computed without the node.
    pub fn local_address(&self, slot: Slot) -> Result<String> {
        address_of(&self.descriptor(slot)?, self.policy.network)
    }

    /// Registers a fresh address with the node and checks what comes back.
    ///
    /// Fails with `ConsistencyViolation` when the node does not watch the
    /// address, or when a multisig address carries keys out of BIP67 order.
    pub fn register(&self, slot: Slot) -> Result<String> {
        let resolved = self.resolve(slot)?;
        self.watch(std::slice::from_ref(&resolved), false)?;
        self.verify(slot, &resolved.address)?;
        info!(chain = slot.chain(), index = slot.index, address = %resolved.address, "registered address");
        Ok(resolved.address)
    }

    /// Registers `window` addresses per chain starting at the given indices,
    /// leaving the counters where they are. Returns how many were sent.
    pub fn export_window(&self, receiving_index: u32, change_index: u32, window: u32) -> Result<usize> {
        let slots = (receiving_index..receiving_index.saturating_add(window))
            .map(Slot::receiving)
            .chain((change_index..change_index.saturating_add(window)).map(Slot::change));
        let resolved = slots.map(|slot| self.resolve(slot)).collect::<Result<Vec<_>>>()?;
        self.watch(&resolved, false)?;
        info!(window, count = resolved.len(), "exported address window");
        Ok(resolved.len())
    }

    /// Re-registers every issued address the node has stopped watching and
    /// re-checks key order on the ones it still watches. Returns the number of
    /// addresses re-registered.
    pub fn sync(&self, receiving_index: u32, change_index: u32, rescan: bool) -> Result<usize> {
        let mut missing = Vec::new();
        let issued = (0..receiving_index)
            .map(Slot::receiving)
            .chain((0..change_index).map(Slot::change));
        for slot in issued {
            let resolved = self.resolve(slot)?;
            let info = self.node.address_info(&resolved.address)?;
            if info.is_watch_only {
                self.check_key_order(slot, &info)?;
            } else {
                debug!(chain = slot.chain(), index = slot.index, "address no longer watched");
                missing.push(resolved);
            }
        }

        self.watch(&missing, rescan)?;
        for resolved in &missing {
            self.verify(resolved.slot, &resolved.address)?;
        }
        if !missing.is_empty() {
            info!(count = missing.len(), rescan, "re-registered addresses");
        }
        Ok(missing.len())
    }

    /// Builds the descriptor, lets the node canonicalize it and cross-checks
    /// the node's address against the one derived locally.
    fn resolve(&self, slot: Slot) -> Result<Resolved> {
        let descriptor = self.descriptor(slot)?;
        let canonical = self.node.descriptor_info(&descriptor)?.descriptor;
        let derived = self.node.derive_addresses(&canonical, None)?;
        let [address] = derived.as_slice() else {
            return Err(Error::ConsistencyViolation(format!(
                "node derived {} addresses for {} index {}",
                derived.len(),
                slot.chain(),
                slot.index
            )));
        };

        let expected = address_of(&descriptor, self.policy.network)?;
        if *address != expected {
            return Err(Error::ConsistencyViolation(format!(
                "node derived {address} for {} index {}, expected {expected}",
                slot.chain(),
                slot.index
            )));
        }

        Ok(Resolved {
            slot,
            descriptor: canonical,
            address: expected,
        })
    }

    fn watch(&self, resolved: &[Resolved], rescan: bool) -> Result<()> {
        if resolved.is_empty() {
            return Ok(());
        }
        let requests = resolved
            .iter()
            .map(|r| WatchRequest {
                descriptor: r.descriptor.clone(),
                internal: r.slot.change,
                label: (!r.slot.change).then(|| self.label.to_string()),
                since_genesis: rescan,
            })
            .collect::<Vec<_>>();

        let outcomes = self.node.import_multi(&requests, rescan)?;
        if outcomes.len() != requests.len() {
            return Err(NodeError::Response(format!(
                "importmulti answered {} of {} requests",
                outcomes.len(),
                requests.len()
            ))
            .into());
        }

        for (outcome, r) in outcomes.iter().zip(resolved) {
            for warning in &outcome.warnings {
                warn!(address = %r.address, %warning, "importmulti warning");
            }
            if !outcome.success {
                let err = match &outcome.error {
                    Some(body) => NodeError::Rpc {
                        code: body.code as i32,
                        message: format!("importing {}: {}", r.address, body.message),
                    },
                    None => NodeError::Response(format!("importing {} failed", r.address)),
                };
                return Err(err.into());
            }
        }
        Ok(())
    }

    fn verify(&self, slot: Slot, address: &str) -> Result<AddressInfo> {
        let info = self.node.address_info(address)?;
        if !info.is_watch_only {
            return Err(Error::ConsistencyViolation(format!(
                "node does not report {address} as watch-only"
            )));
        }
        self.check_key_order(slot, &info)?;
        Ok(info)
    }

    /// Multisig only: the node's key list must be strictly ascending and equal
    /// to the enrolled signers' child keys.
    fn check_key_order(&self, slot: Slot, info: &AddressInfo) -> Result<()> {
        if self.policy.wallet_type != WalletType::Multi {
            return Ok(());
        }
        let address = &info.address;
        let reported = info
            .multisig_pubkeys()
            .ok_or_else(|| Error::ConsistencyViolation(format!("node reported no public keys for {address}")))?;

        let keys = reported
            .iter()
            .map(|hex| {
                bitcoin::PublicKey::from_str(hex).map_err(|e| {
                    Error::ConsistencyViolation(format!("unparseable public key {hex} for {address}: {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if !keys.windows(2).all(|pair| pair[0].to_bytes() < pair[1].to_bytes()) {
            return Err(Error::ConsistencyViolation(format!(
                "public keys of {address} are not in ascending order"
            )));
        }

        let expected = descriptor::sorted_signers(self.signers, slot.change, slot.index)?;
        let matches = keys.len() == expected.len()
            && keys.iter().zip(&expected).all(|(key, (child, _))| key.inner == *child);
        if !matches {
            return Err(Error::ConsistencyViolation(format!(
                "public keys of {address} differ from the enrolled signers' keys at {} index {}",
                slot.chain(),
                slot.index
            )));
        }
        Ok(())
    }
}

/// Address of a single-address descriptor.
pub fn address_of(descriptor: &str, network: Network) -> Result<String> {
    let parsed = Descriptor::<DescriptorPublicKey>::from_str(descriptor)
        .map_err(|e| Error::Configuration(format!("unparseable descriptor: {e}")))?;
    let address = parsed
        .at_derivation_index(0)
        .map_err(|e| Error::Configuration(format!("underivable descriptor: {e}")))?
        .address(network.to_bitcoin())
        .map_err(|e| Error::Configuration(format!("descriptor has no address form: {e}")))?;
    Ok(address.to_string())
}
