//! Error taxonomy for the synchronization layer.
//!
//! Every failure that crosses a component boundary is a [`SyncError`]. The variant
//! decides how it is handled: transient failures are retried, stale-context failures
//! are dropped silently, reverts and rejections go to the user, and vanished
//! resources become ledger state transitions.

use ethers::types::U256;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Timeout, rate limit or node hiccup. Retried by the retry wrapper.
    #[error("transient RPC failure: {0}")]
    Transient(String),

    /// The chain or account changed while the work was in flight.
    #[error("chain context changed while the request was in flight")]
    StaleContext,

    /// Logical rejection detected before reaching the chain (not mature, wrong network...).
    #[error("rejected: {0}")]
    Rejected(String),

    /// The contract reverted the call.
    #[error("contract reverted: {0}")]
    Revert(String),

    /// The response did not have the expected shape.
    #[error("unexpected response shape: {0}")]
    SchemaDrift(String),

    /// The token no longer exists or is no longer owned by the account.
    #[error("token {token_id} no longer exists")]
    Vanished { token_id: U256 },

    /// The address book has no entry for this contract on the active chain.
    #[error("no {contract} contract configured for chain {chain_id}")]
    MissingContract { contract: String, chain_id: u64 },

    #[error("no account connected")]
    NoAccount,

    #[error("request scheduler is closed")]
    SchedulerClosed,

    #[error("HTTP request failed: {0}")]
    Http(String),
}

/// Fragments that node errors carry when an ERC-721 token is burned or unknown.
const VANISHED_MARKERS: &[&str] = &[
    "nonexistent token",
    "invalid token id",
    "owner query for nonexistent",
    "erc721nonexistenttoken",
];

const REVERT_MARKERS: &[&str] = &["execution reverted", "revert", "vm exception"];

impl SyncError {
    /// Whether the retry wrapper should try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transient(_) | SyncError::Http(_))
    }

    /// Whether this failure should be shown to the user.
    pub fn is_user_facing(&self) -> bool {
        !matches!(self, SyncError::StaleContext)
    }

    pub fn is_vanished(&self) -> bool {
        matches!(self, SyncError::Vanished { .. })
    }

    /// Classify a raw node error message.
    ///
    /// `token_id` is used when the message indicates a vanished token.
    pub fn classify(message: &str, token_id: Option<U256>) -> Self {
        let lower = message.to_lowercase();

        if VANISHED_MARKERS.iter().any(|m| lower.contains(m)) {
            return SyncError::Vanished {
                token_id: token_id.unwrap_or_default(),
            };
        }
        if REVERT_MARKERS.iter().any(|m| lower.contains(m)) {
            return SyncError::Revert(message.to_string());
        }
        SyncError::Transient(message.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::Http(e.to_string())
    }
}
