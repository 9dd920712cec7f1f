//! Ledger of in-flight partially signed transactions.
//!
//! The ledger only orders and tracks PSBTs. Input selection, fees and
//! finalization belong to the node; see `WalletRecord::create_psbt` and
//! `WalletRecord::broadcast`.

use std::str::FromStr;

use base64::{Engine, engine::general_purpose::STANDARD};
use bitcoin::psbt::Psbt;
use bitcoin::{Address, Amount, Txid};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub fn encode(psbt: &Psbt) -> String {
    STANDARD.encode(psbt.serialize())
}

pub fn decode(encoded: &str) -> Result<Psbt> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::InvalidPsbt(format!("bad base64: {e}")))?;
    Ok(Psbt::deserialize(&bytes)?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PsbtStatus {
    Created,
    PartiallySigned { signed: usize, required: usize },
    FullySigned,
    /// Handed to the node; removal from the ledger is still pending.
    Submitted { txid: Txid },
}

/// Signatures collected on the least-signed input. Finalized inputs count as
/// complete.
pub fn signature_count(psbt: &Psbt, required: usize) -> usize {
    psbt.inputs
        .iter()
        .map(|input| {
            if input.final_script_witness.is_some() || input.final_script_sig.is_some() {
                required
            } else {
                input.partial_sigs.len()
            }
        })
        .min()
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub psbt: Psbt,
    pub submitted_txid: Option<Txid>,
}

impl LedgerEntry {
    pub fn status(&self, required: usize) -> PsbtStatus {
        if let Some(txid) = self.submitted_txid {
            return PsbtStatus::Submitted { txid };
        }
        match signature_count(&self.psbt, required) {
            0 => PsbtStatus::Created,
            signed if signed >= required => PsbtStatus::FullySigned,
            signed => PsbtStatus::PartiallySigned { signed, required },
        }
    }
}

/// Persisted form of a ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerRecord {
    pub psbt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_txid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSummary {
    pub address: Option<String>,
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsbtSummary {
    pub txid: Txid,
    pub outputs: Vec<OutputSummary>,
    /// Known only when every input carries its spent output.
    pub fee: Option<Amount>,
}

pub fn summarize(psbt: &Psbt, network: bitcoin::Network) -> PsbtSummary {
    let outputs = psbt
        .unsigned_tx
        .output
        .iter()
        .map(|out| OutputSummary {
            address: Address::from_script(&out.script_pubkey, network)
                .ok()
                .map(|a| a.to_string()),
            amount: out.value,
        })
        .collect::<Vec<_>>();

    let total_in = psbt
        .inputs
        .iter()
        .map(|i| i.witness_utxo.as_ref().map(|u| u.value))
        .sum::<Option<Amount>>();
    let total_out = outputs.iter().map(|o| o.amount).sum::<Amount>();
    let fee = total_in.and_then(|total_in| total_in.checked_sub(total_out));

    PsbtSummary {
        txid: psbt.unsigned_tx.compute_txid(),
        outputs,
        fee,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PsbtLedger {
    entries: Vec<LedgerEntry>,
}

impl PsbtLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: &[LedgerRecord]) -> Result<Self> {
        let entries = records
            .iter()
            .map(|record| {
                let submitted_txid = record
                    .submitted_txid
                    .as_deref()
                    .map(Txid::from_str)
                    .transpose()
                    .map_err(|e| Error::InvalidPsbt(format!("bad submitted txid: {e}")))?;
                Ok(LedgerEntry {
                    psbt: decode(&record.psbt)?,
                    submitted_txid,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }

    pub fn to_records(&self) -> Vec<LedgerRecord> {
        self.entries
            .iter()
            .map(|entry| LedgerRecord {
                psbt: encode(&entry.psbt),
                submitted_txid: entry.submitted_txid.map(|t| t.to_string()),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Result<&LedgerEntry> {
        self.entries
            .get(index)
            .ok_or_else(|| Error::NotFound(format!("no psbt at index {index} ({} in ledger)", self.entries.len())))
    }

    fn get_mut(&mut self, index: usize) -> Result<&mut LedgerEntry> {
        let len = self.entries.len();
        self.entries
            .get_mut(index)
            .ok_or_else(|| Error::NotFound(format!("no psbt at index {index} ({len} in ledger)")))
    }

    /// Appends and returns the new entry's index.
    pub fn push(&mut self, psbt: Psbt) -> usize {
        self.entries.push(LedgerEntry {
            psbt,
            submitted_txid: None,
        });
        self.entries.len() - 1
    }

    /// Replaces an entry with a newer version. The caller vouches that it is
    /// the same transaction.
    pub fn replace(&mut self, index: usize, psbt: Psbt) -> Result<()> {
        self.get_mut(index)?.psbt = psbt;
        Ok(())
    }

    /// Merges signatures from another copy of the same transaction.
    pub fn combine(&mut self, index: usize, other: Psbt) -> Result<()> {
        self.get_mut(index)?.psbt.combine(other)?;
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> Result<LedgerEntry> {
        self.get(index)?;
        Ok(self.entries.remove(index))
    }

    pub fn mark_submitted(&mut self, index: usize, txid: Txid) -> Result<()> {
        self.get_mut(index)?.submitted_txid = Some(txid);
        Ok(())
    }

    pub fn clear_submitted(&mut self, index: usize) -> Result<()> {
        self.get_mut(index)?.submitted_txid = None;
        Ok(())
    }

    /// Index of the entry submitted as `txid`, if still present.
    pub fn position_of(&self, txid: &Txid) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.submitted_txid.as_ref() == Some(txid))
    }

    pub fn submitted(&self) -> Vec<Txid> {
        self.entries.iter().filter_map(|e| e.submitted_txid).collect()
    }
}
