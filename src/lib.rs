//! Coordinator for m-of-n Bitcoin multisig wallets.
//!
//! Signers are enrolled by fingerprint and account xpub. Addresses are
//! derived with BIP67 key ordering and registered with a Bitcoin Core
//! watch-only wallet. PSBTs are tracked from funding through signing to
//! broadcast.

pub mod address;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod node;
pub mod psbt;
pub mod signer;
pub mod store;
pub mod wallet;

pub use descriptor::{Network, ScriptType, WalletType};
pub use device::{DeviceError, Hwi, HwiDevice, KeyData, SignerDevice, SoftwareSigner};
pub use error::{Error, Result};
pub use node::{Node, NodeConnector, NodeError, NodeGateway, Payment, RpcConnector, RpcNode};
pub use psbt::{PsbtLedger, PsbtStatus};
pub use signer::{DeviceType, Signer};
pub use store::{FileStore, StoreError, WalletStore};
pub use wallet::{Context, NewWallet, Snapshot, WalletRecord};
