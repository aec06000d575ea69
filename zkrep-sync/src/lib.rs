//! Event-driven synchronizer for the zkrep reputation ledger.
//!
//! Replays contract logs into [`zkrep_ledger::LedgerState`], tails the chain
//! head, and persists progress so a restart resumes where it left off.

pub mod config;
pub mod error;
pub mod rpc;
pub mod scheduler;
pub mod snapshot;
pub mod source;
pub mod store;
pub mod synchronizer;
pub mod verifier_client;

pub use config::{DaemonConfig, SyncConfig};
pub use error::SyncError;
pub use rpc::RpcEventSource;
pub use scheduler::{backoff_delay, Scheduler, TokioScheduler};
pub use snapshot::{Snapshot, SyncCursor, SNAPSHOT_VERSION};
pub use source::{EventSource, SourceError};
pub use store::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore, StoreError};
pub use synchronizer::{AcceptedEvent, BatchReport, DaemonHandle, Synchronizer};
pub use verifier_client::HttpProofVerifier;
