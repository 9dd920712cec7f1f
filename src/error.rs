//! Error taxonomy shared by every coordinator component.

use thiserror::Error;

use crate::device::DeviceError;
use crate::node::NodeError;
use crate::store::StoreError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// Invalid m/n, unsupported script/wallet combination, malformed keys.
    /// Always raised before any side effect.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("wallet \"{0}\" already exists")]
    AlreadyExists(String),

    #[error("wallet not ready: {0}")]
    NotReady(String),

    #[error("duplicate signer: {0}")]
    DuplicateSigner(String),

    /// The watch-only wallet could not be reached after retries. Reads
    /// degrade to `Snapshot::Unavailable`; writes fail with this error.
    #[error("node unavailable: {0}")]
    NodeUnavailable(String),

    /// The node disagrees with what the coordinator derived. Never retried.
    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("psbt incomplete: {0}")]
    Incomplete(String),

    #[error("invalid psbt: {0}")]
    InvalidPsbt(String),

    #[error("node error: {0}")]
    Node(NodeError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("device error: {0}")]
    Device(#[from] DeviceError),
}

impl Error {
    /// Consistency violations mean the derived address space can no longer be
    /// trusted; callers must stop rather than retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ConsistencyViolation(_))
    }
}

impl From<NodeError> for Error {
    fn from(err: NodeError) -> Self {
        match err {
            NodeError::Unavailable { .. } | NodeError::Transport(_) => Error::NodeUnavailable(err.to_string()),
            other => Error::Node(other),
        }
    }
}

impl From<bitcoin::bip32::Error> for Error {
    fn from(err: bitcoin::bip32::Error) -> Self {
        Error::Configuration(err.to_string())
    }
}

impl From<bitcoin::psbt::Error> for Error {
    fn from(err: bitcoin::psbt::Error) -> Self {
        Error::InvalidPsbt(err.to_string())
    }
}
