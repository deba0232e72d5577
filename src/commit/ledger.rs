//! Token ledgers behind the commit service.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::{new_id, IdKind};

/// Failure reported by a ledger.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct LedgerError(pub String);

/// Mints the token that seals a commit.
///
/// Called at most once per successful commit of a verification.
pub trait Ledger: Send + Sync {
    /// Mint a token for `verification_id`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] when the token cannot be minted; the commit
    /// is recorded as failed and may be retried.
    fn mint(&self, verification_id: &str) -> Result<String, LedgerError>;
}

/// In-process ledger minting random token ids.
#[derive(Debug, Default)]
pub struct LocalLedger {
    minted: AtomicU64,
}

impl LocalLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tokens minted so far.
    pub fn minted(&self) -> u64 {
        self.minted.load(Ordering::Relaxed)
    }
}

impl Ledger for LocalLedger {
    fn mint(&self, _verification_id: &str) -> Result<String, LedgerError> {
        self.minted.fetch_add(1, Ordering::Relaxed);
        Ok(new_id(IdKind::Token))
    }
}
