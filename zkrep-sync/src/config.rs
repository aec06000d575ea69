//! Synchronizer configuration.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use ethers::types::Address;
use zkrep_common::FieldElement;
use zkrep_ledger::{Identity, ProtocolConfig};

/// Daemon loop tuning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DaemonConfig {
    /// First block to replay when no snapshot exists.
    pub start_block: u64,
    /// Wait between head polls once caught up.
    pub poll_interval: Duration,
    /// Largest block range fetched per batch.
    pub max_block_range: u64,
    pub retry_base: Duration,
    pub max_retry_delay: Duration,
    /// Deadline for each event source call.
    pub rpc_timeout: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            start_block: 0,
            poll_interval: Duration::from_millis(5000),
            max_block_range: 2000,
            retry_base: Duration::from_millis(500),
            max_retry_delay: Duration::from_millis(30_000),
            rpc_timeout: Duration::from_secs(30),
        }
    }
}

/// Everything the `zkrep-sync` binary needs, read from the environment.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub rpc_url: String,
    pub contract_address: Address,
    pub verifier_url: String,
    pub snapshot_path: PathBuf,
    pub daemon: DaemonConfig,
    pub protocol: ProtocolConfig,
    /// Identity whose projection is logged as the ledger advances.
    pub identity: Option<Identity>,
    pub log_json: bool,
}

impl SyncConfig {
    /// Load configuration from environment variables (and `.env`, if present).
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let rpc_url = env::var("ZKREP_RPC_URL").context("ZKREP_RPC_URL must be set")?;
        let contract_address = env::var("ZKREP_CONTRACT_ADDRESS")
            .context("ZKREP_CONTRACT_ADDRESS must be set")?
            .parse::<Address>()
            .context("ZKREP_CONTRACT_ADDRESS is not a valid address")?;
        let verifier_url =
            env::var("ZKREP_VERIFIER_URL").context("ZKREP_VERIFIER_URL must be set")?;
        let snapshot_path = env::var("ZKREP_SNAPSHOT_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("zkrep-snapshot.json"));

        let defaults = DaemonConfig::default();
        let daemon = DaemonConfig {
            start_block: env_or("ZKREP_START_BLOCK", defaults.start_block),
            poll_interval: Duration::from_millis(env_or("ZKREP_POLL_INTERVAL_MS", 5000)),
            max_block_range: env_or("ZKREP_MAX_BLOCK_RANGE", defaults.max_block_range).max(1),
            retry_base: Duration::from_millis(env_or("ZKREP_RETRY_BASE_MS", 500)),
            max_retry_delay: Duration::from_millis(env_or("ZKREP_MAX_RETRY_MS", 30_000)),
            rpc_timeout: Duration::from_secs(env_or("ZKREP_RPC_TIMEOUT_SECS", 30)),
        };

        let protocol_defaults = ProtocolConfig::default();
        let protocol = ProtocolConfig {
            gst_depth: env_or("ZKREP_GST_DEPTH", protocol_defaults.gst_depth),
            epoch_tree_depth: env_or("ZKREP_EPOCH_TREE_DEPTH", protocol_defaults.epoch_tree_depth),
            keys_per_epoch: env_or("ZKREP_KEYS_PER_EPOCH", protocol_defaults.keys_per_epoch),
            max_reputation_budget: env_or(
                "ZKREP_MAX_REP_BUDGET",
                protocol_defaults.max_reputation_budget,
            ),
        };
        protocol
            .validate()
            .map_err(|reason| anyhow!("invalid protocol config: {reason}"))?;

        let identity = match env::var("ZKREP_IDENTITY") {
            Ok(raw) => Some(parse_identity(&raw).context("ZKREP_IDENTITY is malformed")?),
            Err(_) => None,
        };

        Ok(Self {
            rpc_url,
            contract_address,
            verifier_url,
            snapshot_path,
            daemon,
            protocol,
            identity,
            log_json: log_json_enabled(),
        })
    }
}

/// Whether `ZKREP_LOG_JSON` asks for JSON log lines.
pub fn log_json_enabled() -> bool {
    matches!(
        env::var("ZKREP_LOG_JSON").as_deref(),
        Ok("1") | Ok("true")
    )
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Parses `nullifier:trapdoor`, each a decimal or `0x` hex field element.
pub fn parse_identity(raw: &str) -> Result<Identity> {
    let (nullifier, trapdoor) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("expected nullifier:trapdoor"))?;
    let nullifier = FieldElement::from_str(nullifier.trim()).context("invalid identity nullifier")?;
    let trapdoor = FieldElement::from_str(trapdoor.trim()).context("invalid identity trapdoor")?;
    Ok(Identity::new(nullifier, trapdoor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_identity() {
        let identity = parse_identity("12:0x1f").unwrap();
        assert_eq!(
            identity,
            Identity::new(FieldElement::from(12), FieldElement::from(31))
        );
        assert!(parse_identity("12").is_err());
        assert!(parse_identity("12:zz").is_err());
    }

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        env::set_var("ZKREP_TEST_ENV_OR", "not-a-number");
        assert_eq!(env_or("ZKREP_TEST_ENV_OR", 7u64), 7);
        env::set_var("ZKREP_TEST_ENV_OR", "42");
        assert_eq!(env_or("ZKREP_TEST_ENV_OR", 7u64), 42);
        env::remove_var("ZKREP_TEST_ENV_OR");
        assert_eq!(env_or("ZKREP_TEST_ENV_OR", 7u64), 7);
    }

    #[test]
    fn test_daemon_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.max_block_range, 2000);
        assert_eq!(config.max_retry_delay, Duration::from_secs(30));
    }
}
