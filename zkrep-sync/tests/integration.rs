//! Daemon scenarios against an in-memory event source.

use std::sync::Arc;
use std::time::Duration;

use ethers::types::{Bytes, H256};
use rand::seq::SliceRandom;
use zkrep_ledger::accumulator::signup_leaf;
use zkrep_ledger::{EventProcessor, LedgerState, RawLog, UserProjection};
use zkrep_sync::{DaemonConfig, MemorySnapshotStore, SyncError, Synchronizer};
use zkrep_test_fixtures::{
    gst_root, sample_identity, sample_identity_n, sample_protocol_config, EventFactory,
    InstantScheduler, LogSequence, MockEventSource, MockVerifier,
};

const HEAD: u64 = 5;

/// Two sign-ups, an attested epoch key, an epoch end and a sign-up in epoch 2.
fn scenario() -> Vec<RawLog> {
    let config = sample_protocol_config();
    let events = EventFactory::new(config.clone());
    let alice = sample_identity();
    let bob = sample_identity_n(1);

    let mut seq = LogSequence::starting_at(1);
    seq.push(events.signup(1, alice.commitment(), 30));
    seq.push(events.signup(1, bob.commitment(), 10));
    let root = gst_root(
        &config,
        &[
            signup_leaf(&alice.commitment(), 1, 30),
            signup_leaf(&bob.commitment(), 1, 10),
        ],
    );
    let key = alice.epoch_keys(1, &config)[0];
    seq.at_block(2).push(events.epoch_key_proof(1, 1, key, root));
    seq.at_block(3).push(events.attestation(1, key, 7, 2, 1, None));
    seq.at_block(4).push(events.epoch_ended(1));
    seq.at_block(HEAD)
        .push(events.signup(2, sample_identity_n(2).commitment(), 0));
    seq.into_logs()
}

fn daemon_config(max_block_range: u64) -> DaemonConfig {
    DaemonConfig {
        start_block: 1,
        poll_interval: Duration::from_millis(10),
        max_block_range,
        retry_base: Duration::from_millis(1),
        max_retry_delay: Duration::from_millis(5),
        rpc_timeout: Duration::from_secs(5),
    }
}

struct Harness {
    source: Arc<MockEventSource>,
    verifier: Arc<MockVerifier>,
    scheduler: Arc<InstantScheduler>,
    store: Arc<MemorySnapshotStore>,
    sync: Arc<Synchronizer>,
}

fn harness(source: Arc<MockEventSource>, store: Arc<MemorySnapshotStore>, max_block_range: u64) -> Harness {
    let verifier = Arc::new(MockVerifier::new());
    let scheduler = Arc::new(InstantScheduler::new());
    let processor = EventProcessor::new(verifier.clone(), sample_protocol_config());
    let sync = Arc::new(Synchronizer::new(
        daemon_config(max_block_range),
        source.clone(),
        processor,
        store.clone(),
        scheduler.clone(),
    ));
    Harness {
        source,
        verifier,
        scheduler,
        store,
        sync,
    }
}

async fn synced(sync: &Synchronizer, target: u64) {
    tokio::time::timeout(Duration::from_secs(10), sync.wait_for_sync(Some(target)))
        .await
        .expect("sync timed out")
        .unwrap();
}

/// Ledger state after applying `logs` from genesis in one batch.
async fn replay(logs: Vec<RawLog>) -> LedgerState {
    let h = harness(
        Arc::new(MockEventSource::new()),
        Arc::new(MemorySnapshotStore::new()),
        100,
    );
    h.sync.process_events(logs).await.unwrap();
    let state = h.sync.state().await.clone();
    state
}

#[tokio::test]
async fn test_shuffled_batch_applied_in_canonical_order() {
    let logs = scenario();
    let mut shuffled = logs.clone();
    shuffled.shuffle(&mut rand::thread_rng());

    let h = harness(
        Arc::new(MockEventSource::new()),
        Arc::new(MemorySnapshotStore::new()),
        100,
    );
    let mut effects = h.sync.subscribe();
    let report = h.sync.process_events(shuffled).await.unwrap();
    assert_eq!(report.accepted, logs.len());
    assert_eq!(report.rejected, 0);
    assert_eq!((report.first_block, report.last_block), (Some(1), Some(HEAD)));

    let mut positions = Vec::new();
    while let Ok(event) = effects.try_recv() {
        positions.push(event.position);
    }
    let expected: Vec<_> = logs.iter().map(RawLog::position).collect();
    assert_eq!(positions, expected);

    let state = h.sync.state().await;
    let projection = UserProjection::from_state(sample_identity(), &state);
    assert_eq!(projection.reputation(), 35);
    assert!(projection.needs_transition());
}

#[tokio::test]
async fn test_daemon_reorders_shuffled_source() {
    let logs = scenario();
    let source = Arc::new(MockEventSource::with_logs(logs.clone()));
    source.shuffle_results(true);
    let h = harness(source, Arc::new(MemorySnapshotStore::new()), 100);

    let daemon = h.sync.start_daemon().unwrap();
    synced(&h.sync, HEAD).await;
    daemon.stop().await.unwrap();

    assert_eq!(*h.sync.state().await, replay(logs).await);
    assert_eq!(h.source.fetches(), vec![(1, HEAD)]);
}

#[tokio::test]
async fn test_daemon_survives_transient_source_failures() {
    let logs = scenario();
    let source = Arc::new(MockEventSource::with_logs(logs.clone()));
    source.fail_next_heads(2);
    source.fail_next_fetches(3);
    let h = harness(source, Arc::new(MemorySnapshotStore::new()), 2);

    let daemon = h.sync.start_daemon().unwrap();
    synced(&h.sync, HEAD).await;
    assert!(h.sync.is_running());
    daemon.stop().await.unwrap();

    assert_eq!(*h.sync.state().await, replay(logs).await);
    assert_eq!(h.source.fetches(), vec![(1, 2), (3, 4), (5, 5)]);
    assert!(h.scheduler.sleeps() >= 5);
    assert!(h.store.save_count().await >= 3);
}

#[tokio::test]
async fn test_verifier_outage_retries_whole_batch() {
    let logs = scenario();
    let h = harness(
        Arc::new(MockEventSource::with_logs(logs.clone())),
        Arc::new(MemorySnapshotStore::new()),
        100,
    );
    h.verifier.fail_next(3);

    let daemon = h.sync.start_daemon().unwrap();
    synced(&h.sync, HEAD).await;
    daemon.stop().await.unwrap();

    // One proof in the log: three failed attempts, then success.
    assert_eq!(h.verifier.calls(), 4);
    assert_eq!(*h.sync.state().await, replay(logs).await);
}

#[tokio::test]
async fn test_second_daemon_rejected() {
    let h = harness(
        Arc::new(MockEventSource::with_logs(scenario())),
        Arc::new(MemorySnapshotStore::new()),
        100,
    );
    let daemon = h.sync.start_daemon().unwrap();
    let err = h.sync.start_daemon().err().expect("second daemon started");
    assert!(matches!(err, SyncError::AlreadyRunning));
    assert_eq!(err.error_code(), "ALREADY_RUNNING");

    daemon.stop().await.unwrap();
    assert!(!h.sync.is_running());
    let again = h.sync.start_daemon().unwrap();
    again.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_topic_stops_daemon_before_batch() {
    let mut logs = scenario();
    logs.retain(|log| log.block_number < 4);
    logs.push(RawLog {
        block_number: 4,
        transaction_index: 0,
        log_index: 0,
        topics: vec![H256::repeat_byte(0x42)],
        data: Bytes::default(),
    });
    let h = harness(
        Arc::new(MockEventSource::with_logs(logs)),
        Arc::new(MemorySnapshotStore::new()),
        2,
    );

    let daemon = h.sync.start_daemon().unwrap();
    let result = tokio::time::timeout(Duration::from_secs(10), daemon.join())
        .await
        .expect("daemon did not stop");
    assert!(matches!(result, Err(SyncError::Schema(_))));
    assert!(!h.sync.is_running());

    assert_eq!(h.sync.cursor().latest_processed_block, 2);
    let state = h.sync.state().await;
    assert!(state.accumulator.epoch_keys(1).is_empty(), "block 3 was committed");
    let saved = h.store.contents().await.unwrap();
    assert!(saved.contains("\"latestProcessedBlock\": 2"));
}

#[tokio::test]
async fn test_malformed_known_event_is_skipped() {
    let mut logs = scenario();
    logs[1].data = Bytes::from(vec![0u8; 7]);
    let h = harness(
        Arc::new(MockEventSource::new()),
        Arc::new(MemorySnapshotStore::new()),
        100,
    );
    let report = h.sync.process_events(logs.clone()).await.unwrap();
    assert_eq!(report.malformed, 1);
    assert_eq!(report.total(), logs.len());
    // The attested epoch key proof cites a root that includes the dropped sign-up.
    assert!(report.rejected >= 1);
}

#[tokio::test]
async fn test_resume_from_snapshot_matches_genesis_replay() {
    let logs = scenario();
    let store = Arc::new(MemorySnapshotStore::new());

    let first_source = Arc::new(MockEventSource::new());
    first_source.push_logs(logs.clone());
    first_source.set_head(3);
    let first = harness(first_source, store.clone(), 100);
    let daemon = first.sync.start_daemon().unwrap();
    synced(&first.sync, 3).await;
    daemon.stop().await.unwrap();

    let second = harness(
        Arc::new(MockEventSource::with_logs(logs.clone())),
        store.clone(),
        100,
    );
    assert!(second.sync.load_from_store().await.unwrap());
    assert_eq!(second.sync.cursor().latest_processed_block, 3);
    assert_eq!(second.sync.cursor().start_block, Some(1));

    let daemon = second.sync.start_daemon().unwrap();
    let reached = tokio::time::timeout(Duration::from_secs(10), second.sync.wait_for_sync(None))
        .await
        .expect("sync timed out")
        .unwrap();
    assert_eq!(reached, HEAD);
    daemon.stop().await.unwrap();

    assert_eq!(second.source.fetches()[0], (4, HEAD));
    assert_eq!(*second.sync.state().await, replay(logs).await);
}

#[tokio::test]
async fn test_sync_percent_tracks_progress() {
    let h = harness(
        Arc::new(MockEventSource::with_logs(scenario())),
        Arc::new(MemorySnapshotStore::new()),
        1,
    );
    assert_eq!(h.sync.sync_percent(), 0.0);

    let mut cursor = h.sync.watch_cursor();
    let daemon = h.sync.start_daemon().unwrap();
    tokio::time::timeout(
        Duration::from_secs(10),
        cursor.wait_for(|c| c.latest_processed_block >= 3),
    )
    .await
    .expect("sync timed out")
    .unwrap();
    synced(&h.sync, HEAD).await;
    daemon.stop().await.unwrap();

    assert_eq!(h.sync.sync_percent(), 100.0);
    let cursor = h.sync.cursor();
    assert_eq!(cursor.start_block, Some(1));
    assert_eq!(cursor.latest_known_block, Some(HEAD));
}

#[tokio::test]
async fn test_daemon_follows_new_blocks() {
    let logs = scenario();
    let (early, late): (Vec<RawLog>, Vec<RawLog>) =
        logs.iter().cloned().partition(|log| log.block_number <= 2);
    let source = Arc::new(MockEventSource::with_logs(early));
    let h = harness(source, Arc::new(MemorySnapshotStore::new()), 100);

    let daemon = h.sync.start_daemon().unwrap();
    synced(&h.sync, 2).await;

    h.source.push_logs(late);
    h.source.set_head(HEAD);
    synced(&h.sync, HEAD).await;
    daemon.stop().await.unwrap();

    assert_eq!(*h.sync.state().await, replay(logs).await);
}
