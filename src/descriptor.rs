//! Output descriptor construction for the wallet's address space.
//!
//! Multisig descriptors use plain `multi()` with the keys already in BIP67
//! order for the requested `(change, index)`: every signer's xpub is derived
//! at `change/index`, and signers are sorted by the raw bytes of that child
//! key. The resulting script is identical to `sortedmulti()` while staying
//! expressible for nodes that predate it.

use std::fmt;
use std::str::FromStr;

use bitcoin::bip32::{ChildNumber, DerivationPath};
use bitcoin::secp256k1::{PublicKey, Secp256k1, Verification};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::signer::Signer;

/// Largest supported signer count.
pub const MAX_SIGNERS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }

    pub fn to_bitcoin(&self) -> bitcoin::Network {
        match self {
            Network::Mainnet => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
            Network::Regtest => bitcoin::Network::Regtest,
        }
    }

    /// SLIP-44 coin type used in account paths.
    pub fn coin_type(&self) -> u32 {
        match self {
            Network::Mainnet => 0,
            Network::Testnet | Network::Regtest => 1,
        }
    }

    pub fn network_kind(&self) -> bitcoin::NetworkKind {
        match self {
            Network::Mainnet => bitcoin::NetworkKind::Main,
            Network::Testnet | Network::Regtest => bitcoin::NetworkKind::Test,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "mainnet" | "bitcoin" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(Error::Configuration(format!("unknown network \"{other}\""))),
        }
    }
}

/// Native segwit or segwit wrapped in P2SH.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptType {
    Native,
    Wrapped,
}

impl fmt::Display for ScriptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScriptType::Native => "native",
            ScriptType::Wrapped => "wrapped",
        })
    }
}

impl FromStr for ScriptType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "native" => Ok(ScriptType::Native),
            "wrapped" => Ok(ScriptType::Wrapped),
            other => Err(Error::Configuration(format!("unknown script type \"{other}\""))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalletType {
    Single,
    Multi,
}

impl fmt::Display for WalletType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WalletType::Single => "single",
            WalletType::Multi => "multi",
        })
    }
}

impl FromStr for WalletType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "single" => Ok(WalletType::Single),
            "multi" => Ok(WalletType::Multi),
            other => Err(Error::Configuration(format!("unknown wallet type \"{other}\""))),
        }
    }
}

/// Account-level path signers export their xpub at.
///
/// This table fixes the wallet's address space. It must never change for a
/// wallet that already has signers.
///
/// | script  | wallet | path                |
/// |---------|--------|---------------------|
/// | native  | multi  | `m/48'/coin'/0'/2'` |
/// | wrapped | multi  | `m/48'/coin'/0'/1'` |
/// | native  | single | `m/84'/coin'/0'`    |
/// | wrapped | single | `m/49'/coin'/0'`    |
pub fn account_path(script_type: ScriptType, wallet_type: WalletType, network: Network) -> DerivationPath {
    let coin = network.coin_type();
    let indices: &[u32] = match (script_type, wallet_type) {
        (ScriptType::Native, WalletType::Multi) => &[48, coin, 0, 2],
        (ScriptType::Wrapped, WalletType::Multi) => &[48, coin, 0, 1],
        (ScriptType::Native, WalletType::Single) => &[84, coin, 0],
        (ScriptType::Wrapped, WalletType::Single) => &[49, coin, 0],
    };
    indices
        .iter()
        .map(|&index| ChildNumber::Hardened { index })
        .collect::<Vec<_>>()
        .into()
}

/// Checks the threshold parameters of a wallet.
pub fn validate_policy(m: usize, n: usize, wallet_type: WalletType) -> Result<()> {
    if m < 1 || n < 1 {
        return Err(Error::Configuration(format!("m ({m}) and n ({n}) must be at least 1")));
    }
    if m > n {
        return Err(Error::Configuration(format!("\"m\" ({m}) must be no larger than \"n\" ({n})")));
    }
    if n > MAX_SIGNERS {
        return Err(Error::Configuration(format!("\"n\" ({n}) must be no larger than {MAX_SIGNERS}")));
    }
    if wallet_type == WalletType::Single && n != 1 {
        return Err(Error::Configuration(format!(
            "single-signer wallets take exactly one signer, got n = {n}"
        )));
    }
    Ok(())
}

/// Child public key of `signer` at `change/index`.
pub fn child_pubkey<C: Verification>(
    secp: &Secp256k1<C>,
    signer: &Signer,
    change: bool,
    index: u32,
) -> Result<PublicKey> {
    let path = [
        ChildNumber::from_normal_idx(change as u32)?,
        ChildNumber::from_normal_idx(index)?,
    ];
    Ok(signer.xpub.derive_pub(secp, &path)?.public_key)
}

/// Signers ordered by their child key at `change/index` (BIP67).
pub fn sorted_signers<'a>(signers: &'a [Signer], change: bool, index: u32) -> Result<Vec<(PublicKey, &'a Signer)>> {
    let secp = Secp256k1::verification_only();
    let mut keyed = signers
        .iter()
        .map(|signer| Ok((child_pubkey(&secp, signer, change, index)?, signer)))
        .collect::<Result<Vec<_>>>()?;
    keyed.sort_by(|a, b| a.0.serialize().cmp(&b.0.serialize()));
    Ok(keyed)
}

/// Builds the checksum-less descriptor for one address of the wallet.
///
/// Pure: identical inputs always yield an identical string.
pub fn descriptor(
    signers: &[Signer],
    m: usize,
    script_type: ScriptType,
    wallet_type: WalletType,
    change: bool,
    index: u32,
) -> Result<String> {
    match wallet_type {
        WalletType::Single => {
            let [signer] = signers else {
                return Err(Error::Configuration(format!(
                    "single-signer descriptor needs exactly one signer, got {}",
                    signers.len()
                )));
            };
            let key = key_expression(signer, change, index);
            Ok(match script_type {
                ScriptType::Native => format!("wpkh({key})"),
                ScriptType::Wrapped => format!("sh(wpkh({key}))"),
            })
        }
        WalletType::Multi => {
            if signers.is_empty() || m < 1 || m > signers.len() {
                return Err(Error::Configuration(format!(
                    "cannot build {m}-of-{} multisig descriptor",
                    signers.len()
                )));
            }
            let keys = sorted_signers(signers, change, index)?
                .into_iter()
                .map(|(_, signer)| key_expression(signer, change, index))
                .collect::<Vec<_>>()
                .join(",");
            let multi = format!("multi({m},{keys})");
            Ok(match script_type {
                ScriptType::Native => format!("wsh({multi})"),
                ScriptType::Wrapped => format!("sh(wsh({multi}))"),
            })
        }
    }
}

/// `[fingerprint/origin]xpub/change/index`
fn key_expression(signer: &Signer, change: bool, index: u32) -> String {
    let origin = (&signer.derivation_path)
        .into_iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    let origin = if origin.is_empty() {
        signer.fingerprint.to_string()
    } else {
        format!("{}/{}", signer.fingerprint, origin.join("/"))
    };
    format!("[{}]{}/{}/{}", origin, signer.xpub, change as u32, index)
}
