use ethers::types::{Address, H256, U256};
use std::fmt;
use thiserror::Error;

/// Coarse classification every failure maps to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Expected absence of an event or operation.
    NotFound,
    /// Malformed or unexpected binary payload.
    Decode,
    /// Transport or endpoint failure.
    Network,
    /// A post-condition failed after a state-changing step; inspect manually.
    VerificationFailed,
    /// A pre-condition failed; nothing was changed by the failing step.
    ValidationFailed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::Decode => "decode error",
            ErrorKind::Network => "network error",
            ErrorKind::VerificationFailed => "verification failed",
            ErrorKind::ValidationFailed => "validation failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("not a handleOps call (selector 0x{selector})")]
    NotABatchCall { selector: String },

    #[error("malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },

    #[error("initCode is {len} bytes; expected at least 20 (factory address)")]
    InitCodeTooShort { len: usize },
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("log request failed: {0}")]
    Network(String),

    #[error("failed to decode AddOwner log{}: {reason}", .tx.map(|t| format!(" in tx {t:#x}")).unwrap_or_default())]
    Decode { tx: Option<H256>, reason: String },

    #[error("log source is on chain {actual}, expected chain {expected}")]
    ChainMismatch { expected: u64, actual: u64 },

    #[error("{0} not found")]
    NotFound(&'static str),
}

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("trace unavailable for tx {tx:#x}: {reason}")]
    Unavailable { tx: H256, reason: String },

    #[error("trace for tx {tx:#x} could not be parsed: {reason}")]
    Malformed { tx: H256, reason: String },
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{chain} {op} failed: {reason}")]
    Network {
        chain: &'static str,
        op: &'static str,
        reason: String,
    },

    /// The node rejected the call or transaction as reverting (eth_call / gas estimation).
    #[error("{chain} {op} reverted: {reason}")]
    Reverted {
        chain: &'static str,
        op: &'static str,
        reason: String,
    },

    #[error("{chain} transaction {tx:#x} was mined but reverted")]
    TxReverted { chain: &'static str, tx: H256 },

    #[error("{chain} transaction {tx:#x} was dropped before a receipt was produced")]
    Dropped { chain: &'static str, tx: H256 },

    #[error("{chain} RPC is on chain {actual}, expected chain {expected}")]
    ChainMismatch {
        chain: &'static str,
        expected: u64,
        actual: u64,
    },
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Network { .. } | GatewayError::Dropped { .. } => ErrorKind::Network,
            GatewayError::Reverted { .. } | GatewayError::ChainMismatch { .. } => {
                ErrorKind::ValidationFailed
            }
            GatewayError::TxReverted { .. } => ErrorKind::VerificationFailed,
        }
    }
}

#[derive(Debug, Error)]
pub enum RescueError {
    #[error(
        "recovery owner {actor:?} holds {balance} wei, needs {required} wei; funding was not completed"
    )]
    FundingAborted {
        actor: Address,
        balance: U256,
        required: U256,
    },

    #[error(
        "recovery owner registered on the origin chain is {registered}, but the recovery phrase controls {actor:?}"
    )]
    RecoveryOwnerMismatch { registered: String, actor: Address },

    #[error("destination client sends from {sender:?}, but the recovery owner is {actor:?}")]
    SenderMismatch { sender: Address, actor: Address },

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Trace(#[from] TraceError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("no UserOperation with initCode found in deployment tx {tx:#x}")]
    DeploymentOpNotFound { tx: H256 },

    #[error(
        "no cross-chain replayable UserOperation from {sender:?} in tx {tx:#x}; the recovery owner was not added with the replayable nonce key"
    )]
    ReplayableOpNotFound { tx: H256, sender: Address },

    #[error("deployment tx {tx:#x} via factory {factory:?} did not create {wallet:?}")]
    DeploymentMismatch {
        tx: H256,
        factory: Address,
        wallet: Address,
    },

    #[error("ownership verification failed: {reason}")]
    OwnershipVerificationFailed { reason: String },

    #[error("wallet {wallet:?} holds no balance of token {token:?}")]
    NothingToRescue { wallet: Address, token: Address },

    #[error("failed to sign UserOperation hash: {0}")]
    Signing(String),

    #[error("rescue tx {tx:#x} has no Transfer log to {destination:?}")]
    TransferLogNotFound { tx: H256, destination: Address },

    #[error("destination balance unchanged ({balance}) after rescue tx {tx:#x}")]
    BalanceUnchanged { tx: H256, balance: U256 },
}

impl RescueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RescueError::FundingAborted { .. }
            | RescueError::NothingToRescue { .. }
            | RescueError::Signing(_)
            | RescueError::RecoveryOwnerMismatch { .. }
            | RescueError::SenderMismatch { .. } => ErrorKind::ValidationFailed,
            RescueError::Scan(err) => match err {
                ScanError::Network(_) => ErrorKind::Network,
                ScanError::Decode { .. } => ErrorKind::Decode,
                ScanError::ChainMismatch { .. } => ErrorKind::ValidationFailed,
                ScanError::NotFound(_) => ErrorKind::NotFound,
            },
            RescueError::Trace(err) => match err {
                TraceError::Unavailable { .. } => ErrorKind::Network,
                TraceError::Malformed { .. } => ErrorKind::Decode,
            },
            RescueError::Codec(_) => ErrorKind::Decode,
            RescueError::Gateway(err) => err.kind(),
            RescueError::DeploymentOpNotFound { .. } | RescueError::ReplayableOpNotFound { .. } => {
                ErrorKind::NotFound
            }
            RescueError::DeploymentMismatch { .. }
            | RescueError::OwnershipVerificationFailed { .. }
            | RescueError::TransferLogNotFound { .. }
            | RescueError::BalanceUnchanged { .. } => ErrorKind::VerificationFailed,
        }
    }
}
