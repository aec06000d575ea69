//! Append-only event log boundary.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use zkrep_ledger::RawLog;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid log: {0}")]
    InvalidLog(String),
}

/// Remote log of contract events.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Logs emitted in blocks `from_block..=to_block`, in any order.
    async fn fetch_events(&self, from_block: u64, to_block: u64) -> Result<Vec<RawLog>, SourceError>;

    /// Latest block the source considers final.
    async fn current_block(&self) -> Result<u64, SourceError>;

    /// Push channel of new head blocks, if the source supports one.
    fn new_blocks(&self) -> Option<watch::Receiver<u64>> {
        None
    }
}
