//! zkrep-sync
//!
//! Reconstructs the reputation ledger from contract logs.
//!
//! 1. Restore the last snapshot, if any
//! 2. Replay the backlog from the RPC node in bounded block ranges
//! 3. Tail the chain head, persisting a snapshot after every batch
//! 4. Optionally log one identity's projection as effects arrive

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use zkrep_ledger::{EventProcessor, Identity, UserProjection};
use zkrep_sync::config::log_json_enabled;
use zkrep_sync::{
    FileSnapshotStore, HttpProofVerifier, RpcEventSource, SyncConfig, Synchronizer, TokioScheduler,
};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "zkrep_sync=info,zkrep_ledger=info".into());
    if log_json_enabled() {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn spawn_projection(sync: Arc<Synchronizer>, identity: Identity) {
    tokio::spawn(async move {
        let mut effects = sync.subscribe();
        let mut projection = UserProjection::from_state(identity, &*sync.state().await);
        info!(
            signed_up = projection.is_signed_up(),
            reputation = projection.reputation() as i64,
            "identity projection loaded"
        );
        loop {
            match effects.recv().await {
                Ok(event) => {
                    projection.apply(&event.effect);
                    info!(
                        block = event.position.block_number,
                        reputation = projection.reputation() as i64,
                        needs_transition = projection.needs_transition(),
                        "identity projection updated"
                    );
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "projection lagged, resyncing");
                    projection.resync(&*sync.state().await);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = SyncConfig::from_env()?;

    info!("Starting zkrep-sync");
    info!("RPC: {}", config.rpc_url);
    info!("Contract: {:?}", config.contract_address);
    info!("Snapshot: {}", config.snapshot_path.display());

    let source = Arc::new(
        RpcEventSource::new(&config.rpc_url, config.contract_address)
            .context("failed to create event source")?,
    );
    let verifier = Arc::new(HttpProofVerifier::new(&config.verifier_url));
    let processor = EventProcessor::new(verifier, config.protocol.clone());
    let store = Arc::new(FileSnapshotStore::new(&config.snapshot_path));

    let sync = Arc::new(Synchronizer::new(
        config.daemon.clone(),
        source,
        processor,
        store,
        Arc::new(TokioScheduler),
    ));
    let resumed = sync
        .load_from_store()
        .await
        .context("failed to load snapshot")?;
    info!(
        resumed,
        latest_processed_block = sync.cursor().latest_processed_block,
        "ledger state ready"
    );

    if let Some(identity) = config.identity.clone() {
        spawn_projection(Arc::clone(&sync), identity);
    }

    let daemon = sync.start_daemon()?;
    let shutdown = daemon.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down synchronizer...");
            shutdown.cancel();
        }
    });

    if let Err(e) = daemon.join().await {
        error!(code = e.error_code(), "synchronizer exited: {}", e);
        return Err(e.into());
    }
    Ok(())
}
