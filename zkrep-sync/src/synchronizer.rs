//! Event replay engine.
//!
//! The [`Synchronizer`] pulls contract logs from an [`EventSource`], orders
//! them canonically, runs them through the [`EventProcessor`] and commits the
//! resulting ledger state one batch at a time. Between batches it advances the
//! cursor, persists a snapshot and broadcasts the accepted effects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, Mutex, RwLock, RwLockReadGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zkrep_ledger::{
    decode_log, Effect, EventPosition, EventProcessor, LedgerState, Outcome, RawLog,
};

use crate::config::DaemonConfig;
use crate::error::SyncError;
use crate::scheduler::{backoff_delay, Scheduler};
use crate::snapshot::{Snapshot, SyncCursor};
use crate::source::{EventSource, SourceError};
use crate::store::SnapshotStore;

const EFFECT_CHANNEL_CAPACITY: usize = 1024;

/// An effect committed to ledger state, with the position of its event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcceptedEvent {
    pub position: EventPosition,
    pub effect: Effect,
}

/// Counts for one call to [`Synchronizer::process_events`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub accepted: usize,
    pub rejected: usize,
    /// Logs with a known topic whose payload could not be decoded.
    pub malformed: usize,
    pub first_block: Option<u64>,
    pub last_block: Option<u64>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.accepted + self.rejected + self.malformed
    }
}

/// Handle to a running daemon task.
pub struct DaemonHandle {
    token: CancellationToken,
    task: JoinHandle<Result<(), SyncError>>,
}

impl DaemonHandle {
    /// Requests a stop at the next batch boundary and waits for the task.
    pub async fn stop(self) -> Result<(), SyncError> {
        self.token.cancel();
        self.join().await
    }

    /// Waits for the daemon to exit on its own (cancellation or a fatal error).
    pub async fn join(self) -> Result<(), SyncError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                error!("synchronizer task aborted: {}", e);
                Err(SyncError::Shutdown)
            }
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Clears the running flag when the daemon task ends, however it ends.
struct RunningGuard(Arc<Synchronizer>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::SeqCst);
    }
}

pub struct Synchronizer {
    config: DaemonConfig,
    source: Arc<dyn EventSource>,
    processor: EventProcessor,
    store: Arc<dyn SnapshotStore>,
    scheduler: Arc<dyn Scheduler>,
    state: RwLock<LedgerState>,
    cursor: watch::Sender<SyncCursor>,
    effects: broadcast::Sender<AcceptedEvent>,
    running: AtomicBool,
    /// Serializes batch application between the daemon and direct callers.
    writer: Mutex<()>,
}

impl Synchronizer {
    pub fn new(
        config: DaemonConfig,
        source: Arc<dyn EventSource>,
        processor: EventProcessor,
        store: Arc<dyn SnapshotStore>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let state = LedgerState::new(processor.config().clone());
        let (cursor, _) = watch::channel(SyncCursor::default());
        let (effects, _) = broadcast::channel(EFFECT_CHANNEL_CAPACITY);
        Self {
            config,
            source,
            processor,
            store,
            scheduler,
            state: RwLock::new(state),
            cursor,
            effects,
            running: AtomicBool::new(false),
            writer: Mutex::new(()),
        }
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    /// Restores cursor and ledger state from `snapshot`, or resets to empty state.
    pub async fn load(&self, snapshot: Option<Snapshot>) -> Result<(), SyncError> {
        let _writer = self.writer.lock().await;
        let (cursor, state) = match snapshot {
            Some(snapshot) => {
                let (cursor, state) = snapshot.restore()?;
                if state.accumulator.config() != self.processor.config() {
                    return Err(crate::store::StoreError::Incompatible(format!(
                        "snapshot protocol config {:?} differs from {:?}",
                        state.accumulator.config(),
                        self.processor.config()
                    ))
                    .into());
                }
                info!(
                    latest_processed_block = cursor.latest_processed_block,
                    epoch = state.current_epoch(),
                    "restored snapshot"
                );
                (cursor, state)
            }
            None => {
                info!("no snapshot, starting from empty state");
                (
                    SyncCursor::default(),
                    LedgerState::new(self.processor.config().clone()),
                )
            }
        };
        *self.state.write().await = state;
        self.cursor.send_replace(cursor);
        Ok(())
    }

    /// Loads whatever the configured store holds. Returns whether a snapshot was found.
    pub async fn load_from_store(&self) -> Result<bool, SyncError> {
        let snapshot = self.store.load().await?;
        let found = snapshot.is_some();
        self.load(snapshot).await?;
        Ok(found)
    }

    pub async fn snapshot(&self) -> Snapshot {
        let state = self.state.read().await;
        Snapshot::capture(&self.cursor(), &state)
    }

    async fn persist(&self) {
        let snapshot = self.snapshot().await;
        if let Err(e) = self.store.save(&snapshot).await {
            warn!(
                block = snapshot.latest_processed_block,
                "failed to persist snapshot, retrying at next batch: {}", e
            );
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn cursor(&self) -> SyncCursor {
        *self.cursor.borrow()
    }

    pub fn watch_cursor(&self) -> watch::Receiver<SyncCursor> {
        self.cursor.subscribe()
    }

    /// Stream of effects, delivered after each batch is committed.
    pub fn subscribe(&self) -> broadcast::Receiver<AcceptedEvent> {
        self.effects.subscribe()
    }

    /// Read access to the committed ledger state.
    pub async fn state(&self) -> RwLockReadGuard<'_, LedgerState> {
        self.state.read().await
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Replay progress in percent, 0 until both start and head are known.
    pub fn sync_percent(&self) -> f64 {
        let cursor = self.cursor();
        let (Some(start), Some(known)) = (cursor.start_block, cursor.latest_known_block) else {
            return 0.0;
        };
        if known <= start {
            return 0.0;
        }
        let done = cursor.latest_processed_block.saturating_sub(start) as f64;
        (100.0 * done / (known - start) as f64).clamp(0.0, 100.0)
    }

    /// Waits until `target` (or the source head at call time) has been processed.
    pub async fn wait_for_sync(&self, target: Option<u64>) -> Result<u64, SyncError> {
        let target = match target {
            Some(target) => target,
            None => self
                .head_with_retry(&CancellationToken::new())
                .await
                .ok_or(SyncError::Shutdown)?,
        };
        let mut cursor = self.cursor.subscribe();
        cursor
            .wait_for(|c| c.latest_processed_block >= target)
            .await
            .map_err(|_| SyncError::Shutdown)?;
        Ok(target)
    }

    // ========================================================================
    // Batch processing
    // ========================================================================

    /// Applies one batch of logs in canonical order and commits the result.
    ///
    /// Rejected and malformed events are skipped. An unknown topic or a
    /// ledger invariant violation aborts the batch without committing; so does
    /// a verifier outage, which the daemon retries.
    pub async fn process_events(&self, mut logs: Vec<RawLog>) -> Result<BatchReport, SyncError> {
        let _writer = self.writer.lock().await;
        logs.sort_by_key(RawLog::position);

        let mut report = BatchReport {
            first_block: logs.first().map(|log| log.block_number),
            last_block: logs.last().map(|log| log.block_number),
            ..Default::default()
        };
        let mut working = self.state.read().await.clone();
        let mut accepted = Vec::new();

        for log in &logs {
            let decoded = match decode_log(log) {
                Ok(decoded) => decoded,
                Err(e) if e.is_fatal() => {
                    error!(
                        block = log.block_number,
                        tx = log.transaction_index,
                        log = log.log_index,
                        "cannot decode event: {}", e
                    );
                    return Err(SyncError::Schema(e));
                }
                Err(e) => {
                    warn!(
                        block = log.block_number,
                        tx = log.transaction_index,
                        log = log.log_index,
                        code = "MALFORMED",
                        "skipping event: {}", e
                    );
                    report.malformed += 1;
                    continue;
                }
            };

            match self.processor.apply(&mut working, &decoded).await? {
                Outcome::Accepted(effect) => {
                    report.accepted += 1;
                    accepted.push(AcceptedEvent {
                        position: decoded.position,
                        effect,
                    });
                }
                Outcome::Rejected(_) => report.rejected += 1,
            }
        }

        *self.state.write().await = working;
        if let Some(first) = report.first_block {
            self.cursor.send_if_modified(|cursor| {
                if cursor.start_block.is_none() {
                    cursor.start_block = Some(first);
                    true
                } else {
                    false
                }
            });
        }
        for event in accepted {
            // No receivers is fine.
            let _ = self.effects.send(event);
        }

        debug!(
            accepted = report.accepted,
            rejected = report.rejected,
            malformed = report.malformed,
            "batch committed"
        );
        Ok(report)
    }

    fn advance_cursor(&self, from_block: u64, to_block: u64) {
        self.cursor.send_modify(|cursor| {
            cursor.start_block.get_or_insert(from_block);
            cursor.latest_processed_block = cursor.latest_processed_block.max(to_block);
            let known = cursor.latest_known_block.unwrap_or(to_block);
            cursor.latest_known_block = Some(known.max(cursor.latest_processed_block));
        });
    }

    fn observe_head(&self, head: u64) {
        self.cursor.send_if_modified(|cursor| {
            let known = head.max(cursor.latest_processed_block);
            if cursor.latest_known_block == Some(known) {
                return false;
            }
            cursor.latest_known_block = Some(known);
            true
        });
    }

    // ========================================================================
    // Daemon
    // ========================================================================

    /// Spawns the replay loop. Only one daemon may run per synchronizer.
    pub fn start_daemon(self: &Arc<Self>) -> Result<DaemonHandle, SyncError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::AlreadyRunning);
        }

        let token = CancellationToken::new();
        let guard = RunningGuard(Arc::clone(self));
        let child = token.clone();
        let task = tokio::spawn(async move {
            let result = guard.0.run_daemon(child).await;
            drop(guard);
            result
        });
        Ok(DaemonHandle { token, task })
    }

    async fn run_daemon(&self, token: CancellationToken) -> Result<(), SyncError> {
        info!(
            start_block = self.config.start_block,
            latest_processed_block = self.cursor().latest_processed_block,
            "synchronizer daemon started"
        );
        let mut new_blocks = self.source.new_blocks();
        let mut attempt = 0u32;

        while !token.is_cancelled() {
            let Some(head) = self.head_with_retry(&token).await else {
                break;
            };
            self.observe_head(head);

            let from = self.next_block();
            if from > head {
                self.wait_for_head(&token, &mut new_blocks).await;
                continue;
            }

            match self.sync_range(from, head, &token).await {
                Ok(()) => attempt = 0,
                Err(e) if e.is_retryable() => {
                    attempt += 1;
                    let delay = backoff_delay(self.config.retry_base, attempt, self.config.max_retry_delay);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        code = e.error_code(),
                        "batch failed, retrying: {}", e
                    );
                    self.pause(delay, &token).await;
                }
                Err(e) => {
                    error!(
                        code = e.error_code(),
                        latest_processed_block = self.cursor().latest_processed_block,
                        "synchronizer stopped: {}", e
                    );
                    return Err(e);
                }
            }
        }

        info!(
            latest_processed_block = self.cursor().latest_processed_block,
            "synchronizer daemon stopped"
        );
        Ok(())
    }

    fn next_block(&self) -> u64 {
        let processed = self.cursor().latest_processed_block;
        if processed == 0 && self.cursor().start_block.is_none() {
            self.config.start_block
        } else {
            (processed + 1).max(self.config.start_block)
        }
    }

    /// Replays `from..=to` in chunks of at most `max_block_range` blocks.
    async fn sync_range(&self, from: u64, to: u64, token: &CancellationToken) -> Result<(), SyncError> {
        let range = self.config.max_block_range.max(1);
        let mut lo = from;
        while lo <= to {
            if token.is_cancelled() {
                return Ok(());
            }
            let hi = lo.saturating_add(range - 1).min(to);
            let logs = self.fetch_events(lo, hi).await?;
            let report = self.process_events(logs).await?;
            self.advance_cursor(lo, hi);
            self.persist().await;
            info!(
                from_block = lo,
                to_block = hi,
                events = report.total(),
                accepted = report.accepted,
                rejected = report.rejected,
                "synced block range"
            );
            if hi == u64::MAX {
                break;
            }
            lo = hi + 1;
        }
        Ok(())
    }

    async fn fetch_events(&self, from: u64, to: u64) -> Result<Vec<RawLog>, SourceError> {
        match tokio::time::timeout(self.config.rpc_timeout, self.source.fetch_events(from, to)).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Timeout(self.config.rpc_timeout)),
        }
    }

    /// Current head, retrying transient failures. `None` once `token` is cancelled.
    async fn head_with_retry(&self, token: &CancellationToken) -> Option<u64> {
        let mut attempt = 0u32;
        loop {
            let result = match tokio::time::timeout(self.config.rpc_timeout, self.source.current_block()).await {
                Ok(result) => result,
                Err(_) => Err(SourceError::Timeout(self.config.rpc_timeout)),
            };
            match result {
                Ok(head) => return Some(head),
                Err(e) => {
                    attempt += 1;
                    let delay = backoff_delay(self.config.retry_base, attempt, self.config.max_retry_delay);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, "head query failed: {}", e);
                    if !self.pause(delay, token).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Sleeps for `delay`. Returns false if cancelled first.
    async fn pause(&self, delay: Duration, token: &CancellationToken) -> bool {
        tokio::select! {
            _ = token.cancelled() => false,
            _ = self.scheduler.sleep(delay) => true,
        }
    }

    async fn wait_for_head(
        &self,
        token: &CancellationToken,
        new_blocks: &mut Option<watch::Receiver<u64>>,
    ) {
        let closed = match new_blocks.as_mut() {
            Some(blocks) => tokio::select! {
                _ = token.cancelled() => false,
                _ = self.scheduler.sleep(self.config.poll_interval) => false,
                changed = blocks.changed() => changed.is_err(),
            },
            None => {
                self.pause(self.config.poll_interval, token).await;
                false
            }
        };
        if closed {
            debug!("new block channel closed, polling only");
            *new_blocks = None;
        }
    }
}
