//! Key-holding signer devices.
//!
//! Hardware wallets are driven through the HWI command line tool; software
//! signers keep an account-level `Xpriv` in memory and sign locally.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;

use base64::{Engine, engine::general_purpose::STANDARD};
use bitcoin::bip32::{ChildNumber, DerivationPath, Fingerprint, Xpriv, Xpub};
use bitcoin::ecdsa::Signature as EcdsaSignature;
use bitcoin::hashes::Hash;
use bitcoin::psbt::{self, Psbt};
use bitcoin::secp256k1::{All, Message, PublicKey, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::descriptor::Network;
use crate::signer::DeviceType;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("{device} devices do not support {operation}")]
    Unsupported { device: DeviceType, operation: &'static str },
    #[error("hwi error {code}: {message}")]
    Hwi { code: i64, message: String },
    #[error("failed to run hwi: {0}")]
    Io(#[from] io::Error),
    #[error("unexpected device output: {0}")]
    Parse(String),
    #[error("key error: {0}")]
    Key(String),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("device {0} is locked or not connected")]
    Unavailable(String),
}

impl From<bitcoin::bip32::Error> for DeviceError {
    fn from(err: bitcoin::bip32::Error) -> Self {
        DeviceError::Key(err.to_string())
    }
}

/// Capability interface every signer family implements.
pub trait SignerDevice {
    fn device_type(&self) -> DeviceType;

    fn fingerprint(&self) -> Result<Fingerprint, DeviceError>;

    fn get_xpub(&self, path: &DerivationPath) -> Result<Xpub, DeviceError>;

    /// Returns a copy of `psbt` carrying this device's signatures.
    fn sign_transaction(&self, psbt: &Psbt) -> Result<Psbt, DeviceError>;

    fn prompt_pin(&self) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported {
            device: self.device_type(),
            operation: "pin entry",
        })
    }

    fn send_pin(&self, _pin: &str) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported {
            device: self.device_type(),
            operation: "pin entry",
        })
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// `m/48'/1'/0'/2'`, the form HWI expects.
fn path_arg(path: &DerivationPath) -> String {
    std::iter::once("m".to_string())
        .chain(path.into_iter().map(ToString::to_string))
        .collect::<Vec<_>>()
        .join("/")
}

/// One entry of `hwi enumerate`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DeviceInfo {
    #[serde(rename = "type")]
    pub device_type: String,
    pub path: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub needs_pin_sent: bool,
    #[serde(default)]
    pub needs_passphrase_sent: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl DeviceInfo {
    /// Supported hardware family, if any.
    pub fn family(&self) -> Option<DeviceType> {
        match DeviceType::from_str(&self.device_type) {
            Ok(DeviceType::Software) | Err(_) => None,
            Ok(family) => Some(family),
        }
    }
}

/// Runs the HWI executable.
#[derive(Debug, Clone)]
pub struct Hwi {
    path: PathBuf,
    network: Network,
}

impl Hwi {
    pub fn new(path: impl Into<PathBuf>, network: Network) -> Self {
        Self {
            path: path.into(),
            network,
        }
    }

    fn chain(&self) -> &'static str {
        match self.network {
            Network::Mainnet => "main",
            Network::Testnet => "test",
            Network::Regtest => "regtest",
        }
    }

    fn run(&self, device: Option<&DeviceInfo>, args: &[&str]) -> Result<Value, DeviceError> {
        let mut command = Command::new(&self.path);
        command.arg("--chain").arg(self.chain());
        if let Some(device) = device {
            command
                .arg("--device-type")
                .arg(&device.device_type)
                .arg("--device-path")
                .arg(&device.path);
        }
        command.args(args);
        debug!(hwi = %self.path.display(), command = args.first().copied().unwrap_or(""), "running hwi");

        let output = command.output()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let value: Value = serde_json::from_str(stdout.trim()).map_err(|e| {
            let stderr = String::from_utf8_lossy(&output.stderr);
            DeviceError::Parse(format!("{e}: {}", stderr.trim()))
        })?;
        check_error(value)
    }

    pub fn enumerate(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        let value = self.run(None, &["enumerate"])?;
        serde_json::from_value(value).map_err(|e| DeviceError::Parse(e.to_string()))
    }

    pub fn open(&self, info: &DeviceInfo) -> Result<HwiDevice, DeviceError> {
        let device_type = info.family().ok_or_else(|| DeviceError::Unsupported {
            device: DeviceType::Software,
            operation: "hardware signing",
        })?;
        if let Some(error) = &info.error {
            return Err(DeviceError::Unavailable(format!("{} at {}: {error}", info.device_type, info.path)));
        }
        Ok(HwiDevice {
            hwi: self.clone(),
            info: info.clone(),
            device_type,
        })
    }
}

/// HWI reports failures as `{"error": ..., "code": ...}` on stdout.
fn check_error(value: Value) -> Result<Value, DeviceError> {
    if let Some(message) = value.get("error").and_then(Value::as_str) {
        let code = value.get("code").and_then(Value::as_i64).unwrap_or(0);
        return Err(DeviceError::Hwi {
            code,
            message: message.to_string(),
        });
    }
    Ok(value)
}

fn field<'a>(value: &'a Value, name: &str) -> Result<&'a str, DeviceError> {
    value
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| DeviceError::Parse(format!("missing \"{name}\" in {value}")))
}

#[derive(Debug, Clone)]
pub struct HwiDevice {
    hwi: Hwi,
    info: DeviceInfo,
    device_type: DeviceType,
}

impl HwiDevice {
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }
}

impl SignerDevice for HwiDevice {
    fn device_type(&self) -> DeviceType {
        self.device_type
    }

    fn fingerprint(&self) -> Result<Fingerprint, DeviceError> {
        let fingerprint = match &self.info.fingerprint {
            Some(fp) => fp.clone(),
            // Locked devices only report it once unlocked.
            None => self
                .hwi
                .enumerate()?
                .into_iter()
                .find(|d| d.path == self.info.path)
                .and_then(|d| d.fingerprint)
                .ok_or_else(|| DeviceError::Unavailable(self.info.path.clone()))?,
        };
        Fingerprint::from_str(&fingerprint).map_err(|e| DeviceError::Parse(format!("fingerprint {fingerprint}: {e}")))
    }

    fn get_xpub(&self, path: &DerivationPath) -> Result<Xpub, DeviceError> {
        let value = self.hwi.run(Some(&self.info), &["getxpub", &path_arg(path)])?;
        let xpub = field(&value, "xpub")?;
        Xpub::from_str(xpub).map_err(|e| DeviceError::Parse(format!("xpub {xpub}: {e}")))
    }

    fn sign_transaction(&self, psbt: &Psbt) -> Result<Psbt, DeviceError> {
        let encoded = STANDARD.encode(psbt.serialize());
        let value = self.hwi.run(Some(&self.info), &["signtx", &encoded])?;
        let bytes = STANDARD
            .decode(field(&value, "psbt")?)
            .map_err(|e| DeviceError::Parse(format!("signed psbt: {e}")))?;
        Psbt::deserialize(&bytes).map_err(|e| DeviceError::Parse(format!("signed psbt: {e}")))
    }

    fn prompt_pin(&self) -> Result<(), DeviceError> {
        if self.device_type != DeviceType::Trezor {
            return Err(DeviceError::Unsupported {
                device: self.device_type,
                operation: "pin entry",
            });
        }
        self.hwi.run(Some(&self.info), &["promptpin"]).map(|_| ())
    }

    fn send_pin(&self, pin: &str) -> Result<(), DeviceError> {
        if self.device_type != DeviceType::Trezor {
            return Err(DeviceError::Unsupported {
                device: self.device_type,
                operation: "pin entry",
            });
        }
        let value = self.hwi.run(Some(&self.info), &["sendpin", pin])?;
        match value.get("success").and_then(Value::as_bool) {
            Some(true) => Ok(()),
            _ => Err(DeviceError::Hwi {
                code: 0,
                message: "pin rejected".into(),
            }),
        }
    }
}

/// Key file written by `keygen`. `xprv` is the account-level key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyData {
    pub name: String,
    pub xprv: String,
    pub xpub: String,
    pub fingerprint: String,
    pub derivation_path: String,
}

/// Signer backed by an in-memory account key.
pub struct SoftwareSigner {
    name: String,
    fingerprint: Fingerprint,
    account_path: DerivationPath,
    account_key: Xpriv,
    secp: Secp256k1<All>,
}

impl SoftwareSigner {
    pub fn from_seed(
        name: &str,
        network: bitcoin::Network,
        seed: &[u8],
        account_path: &DerivationPath,
    ) -> Result<Self, DeviceError> {
        let secp = Secp256k1::new();
        let master = Xpriv::new_master(network, seed)?;
        Ok(Self {
            name: name.to_string(),
            fingerprint: master.fingerprint(&secp),
            account_path: account_path.clone(),
            account_key: master.derive_priv(&secp, account_path)?,
            secp,
        })
    }

    pub fn from_key_data(data: &KeyData) -> Result<Self, DeviceError> {
        let account_key = Xpriv::from_str(&data.xprv)?;
        let fingerprint = Fingerprint::from_str(&data.fingerprint)
            .map_err(|e| DeviceError::Key(format!("fingerprint {}: {e}", data.fingerprint)))?;
        let account_path = DerivationPath::from_str(&data.derivation_path)?;
        let secp = Secp256k1::new();

        let xpub = Xpub::from_priv(&secp, &account_key);
        if xpub.to_string() != data.xpub {
            return Err(DeviceError::Key(format!("xpub in key file {} does not match its xprv", data.name)));
        }
        Ok(Self {
            name: data.name.clone(),
            fingerprint,
            account_path,
            account_key,
            secp,
        })
    }

    pub fn from_key_file(path: impl AsRef<Path>) -> Result<Self, DeviceError> {
        let data: KeyData = serde_json::from_str(&fs::read_to_string(path)?)
            .map_err(|e| DeviceError::Parse(format!("key file: {e}")))?;
        Self::from_key_data(&data)
    }

    pub fn key_data(&self) -> KeyData {
        KeyData {
            name: self.name.clone(),
            xprv: self.account_key.to_string(),
            xpub: Xpub::from_priv(&self.secp, &self.account_key).to_string(),
            fingerprint: self.fingerprint.to_string(),
            derivation_path: path_arg(&self.account_path),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn account_path(&self) -> &DerivationPath {
        &self.account_path
    }

    /// Path below the account key, if `path` lives under it.
    fn relative(&self, path: &DerivationPath) -> Option<DerivationPath> {
        let full: &[ChildNumber] = path.as_ref();
        let account: &[ChildNumber] = self.account_path.as_ref();
        Some(DerivationPath::from(full.strip_prefix(account)?.to_vec()))
    }

    /// Our key in this input, with its path relative to the account key.
    fn own_key(&self, input: &psbt::Input) -> Option<(PublicKey, DerivationPath)> {
        input.bip32_derivation.iter().find_map(|(pubkey, (fingerprint, path))| {
            if *fingerprint != self.fingerprint {
                return None;
            }
            Some((*pubkey, self.relative(path)?))
        })
    }
}

impl SignerDevice for SoftwareSigner {
    fn device_type(&self) -> DeviceType {
        DeviceType::Software
    }

    fn fingerprint(&self) -> Result<Fingerprint, DeviceError> {
        Ok(self.fingerprint)
    }

    fn get_xpub(&self, path: &DerivationPath) -> Result<Xpub, DeviceError> {
        let relative = self.relative(path).ok_or_else(|| {
            DeviceError::Key(format!(
                "{} only holds keys below {}, not {}",
                self.name,
                path_arg(&self.account_path),
                path_arg(path)
            ))
        })?;
        let key = self.account_key.derive_priv(&self.secp, &relative)?;
        Ok(Xpub::from_priv(&self.secp, &key))
    }

    fn sign_transaction(&self, psbt: &Psbt) -> Result<Psbt, DeviceError> {
        let mut psbt = psbt.clone();
        let tx = psbt.unsigned_tx.clone();
        let mut cache = SighashCache::new(&tx);
        let mut signed = 0;

        for index in 0..psbt.inputs.len() {
            let Some((target, relative)) = self.own_key(&psbt.inputs[index]) else {
                continue;
            };
            let key = self.account_key.derive_priv(&self.secp, &relative)?;
            let pubkey = PublicKey::from_secret_key(&self.secp, &key.private_key);
            if pubkey != target {
                warn!(signer = %self.name, input = index, "derived key does not match psbt, skipping");
                continue;
            }

            let input = &psbt.inputs[index];
            let utxo = input
                .witness_utxo
                .as_ref()
                .ok_or_else(|| DeviceError::Signing(format!("input {index} has no witness utxo")))?;
            let sighash = match (&input.witness_script, &input.redeem_script) {
                (Some(witness_script), _) => cache
                    .p2wsh_signature_hash(index, witness_script, utxo.value, EcdsaSighashType::All)
                    .map_err(|e| DeviceError::Signing(e.to_string()))?,
                // P2SH-P2WPKH: the redeem script is the witness program.
                (None, Some(redeem_script)) => cache
                    .p2wpkh_signature_hash(index, redeem_script, utxo.value, EcdsaSighashType::All)
                    .map_err(|e| DeviceError::Signing(e.to_string()))?,
                (None, None) => cache
                    .p2wpkh_signature_hash(index, &utxo.script_pubkey, utxo.value, EcdsaSighashType::All)
                    .map_err(|e| DeviceError::Signing(e.to_string()))?,
            };

            let message = Message::from_digest(*sighash.as_byte_array());
            let signature = self.secp.sign_ecdsa(&message, &key.private_key);
            psbt.inputs[index]
                .partial_sigs
                .insert(bitcoin::PublicKey::new(pubkey), EcdsaSignature::sighash_all(signature));
            signed += 1;
        }

        info!(signer = %self.name, inputs = signed, "signed psbt");
        Ok(psbt)
    }
}
