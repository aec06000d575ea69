//! JSON-RPC event source over an ethers HTTP provider.

use async_trait::async_trait;
use ethers::{
    providers::{Http, Middleware, Provider},
    types::{Address, Filter, Log},
};
use tracing::debug;
use zkrep_ledger::RawLog;

use crate::source::{EventSource, SourceError};

/// Reads ledger contract logs with `eth_getLogs`.
pub struct RpcEventSource {
    provider: Provider<Http>,
    contract: Address,
}

impl RpcEventSource {
    pub fn new(rpc_url: &str, contract: Address) -> Result<Self, SourceError> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| SourceError::Rpc(format!("invalid rpc url {rpc_url}: {e}")))?;
        Ok(Self { provider, contract })
    }

    pub fn contract(&self) -> Address {
        self.contract
    }
}

#[async_trait]
impl EventSource for RpcEventSource {
    async fn fetch_events(&self, from_block: u64, to_block: u64) -> Result<Vec<RawLog>, SourceError> {
        let filter = Filter::new()
            .address(self.contract)
            .from_block(from_block)
            .to_block(to_block);
        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| SourceError::Rpc(e.to_string()))?;
        debug!(from_block, to_block, count = logs.len(), "fetched logs");

        logs.into_iter()
            .filter(|log| log.removed != Some(true))
            .map(raw_log)
            .collect()
    }

    async fn current_block(&self) -> Result<u64, SourceError> {
        self.provider
            .get_block_number()
            .await
            .map(|block| block.as_u64())
            .map_err(|e| SourceError::Rpc(e.to_string()))
    }
}

fn raw_log(log: Log) -> Result<RawLog, SourceError> {
    let block_number = log
        .block_number
        .ok_or_else(|| SourceError::InvalidLog("log has no block number".into()))?;
    let transaction_index = log
        .transaction_index
        .ok_or_else(|| SourceError::InvalidLog("log has no transaction index".into()))?;
    let log_index = log
        .log_index
        .ok_or_else(|| SourceError::InvalidLog("log has no log index".into()))?;
    Ok(RawLog {
        block_number: block_number.as_u64(),
        transaction_index: transaction_index.as_u64(),
        log_index: log_index.low_u64(),
        topics: log.topics,
        data: log.data,
    })
}
