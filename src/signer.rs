//! Enrolled signers and their persisted form.

use std::fmt;
use std::str::FromStr;

use bitcoin::bip32::{DerivationPath, Fingerprint, Xpub};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Device family a signer lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Ledger,
    Trezor,
    Coldcard,
    /// In-memory key, for development and test wallets.
    Software,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Ledger => "ledger",
            DeviceType::Trezor => "trezor",
            DeviceType::Coldcard => "coldcard",
            DeviceType::Software => "software",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "ledger" => Ok(DeviceType::Ledger),
            "trezor" => Ok(DeviceType::Trezor),
            "coldcard" => Ok(DeviceType::Coldcard),
            "software" => Ok(DeviceType::Software),
            other => Err(Error::Configuration(format!("unknown device type \"{other}\""))),
        }
    }
}

/// A key holder participating in the wallet. Immutable once added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signer {
    pub name: String,
    pub device_type: DeviceType,
    pub fingerprint: Fingerprint,
    pub xpub: Xpub,
    /// Account-level path `xpub` was obtained at.
    pub derivation_path: DerivationPath,
}

/// On-disk signer layout (version 1 of the wallet file).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignerRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub fingerprint: String,
    pub xpub: String,
    pub derivation_path: String,
}

impl Signer {
    /// Parses the string forms handed over by a device or a user.
    pub fn parse(
        name: &str,
        device_type: DeviceType,
        fingerprint: &str,
        xpub: &str,
        derivation_path: &str,
    ) -> Result<Self> {
        if name.trim().is_empty() {
            return Err(Error::Configuration("signer name must not be empty".into()));
        }
        let fingerprint = Fingerprint::from_str(fingerprint)
            .map_err(|e| Error::Configuration(format!("invalid fingerprint \"{fingerprint}\": {e}")))?;
        let xpub = Xpub::from_str(xpub)
            .map_err(|e| Error::Configuration(format!("invalid xpub for \"{name}\": {e}")))?;
        let derivation_path = DerivationPath::from_str(derivation_path).map_err(|e| {
            Error::Configuration(format!("invalid derivation path \"{derivation_path}\": {e}"))
        })?;

        Ok(Self {
            name: name.to_string(),
            device_type,
            fingerprint,
            xpub,
            derivation_path,
        })
    }

    pub fn to_record(&self) -> SignerRecord {
        SignerRecord {
            name: self.name.clone(),
            device_type: self.device_type,
            fingerprint: self.fingerprint.to_string(),
            xpub: self.xpub.to_string(),
            derivation_path: self.derivation_path.to_string(),
        }
    }

    pub fn from_record(record: &SignerRecord) -> Result<Self> {
        Self::parse(
            &record.name,
            record.device_type,
            &record.fingerprint,
            &record.xpub,
            &record.derivation_path,
        )
    }
}
