//! Persisted synchronizer state.
//!
//! A snapshot is the cursor plus everything the event processor mutates,
//! written as JSON with big integers in the tagged `BigNumber` shape.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use zkrep_common::FieldElement;
use zkrep_ledger::{AccumulatorState, LedgerState, NullifierLedger, ProofKey, ValidProofRecord};

use crate::store::StoreError;

pub const SNAPSHOT_VERSION: u32 = 1;

/// Replay progress. `start_block <= latest_processed_block <= latest_known_block` once all are set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCursor {
    pub start_block: Option<u64>,
    pub latest_processed_block: u64,
    pub latest_known_block: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub version: u32,
    pub latest_processed_block: u64,
    pub latest_block: Option<u64>,
    pub start_block: Option<u64>,
    pub valid_proofs: BTreeMap<ProofKey, ValidProofRecord>,
    pub spent_proofs: BTreeMap<ProofKey, bool>,
    pub spent_nullifiers: Vec<FieldElement>,
    pub accumulator: AccumulatorState,
}

impl Snapshot {
    pub fn capture(cursor: &SyncCursor, state: &LedgerState) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            latest_processed_block: cursor.latest_processed_block,
            latest_block: cursor.latest_known_block,
            start_block: cursor.start_block,
            valid_proofs: state.nullifiers.valid_proofs().clone(),
            spent_proofs: state.nullifiers.spent_proofs().clone(),
            spent_nullifiers: state.nullifiers.spent_nullifiers().iter().copied().collect(),
            accumulator: state.accumulator.clone(),
        }
    }

    pub fn cursor(&self) -> SyncCursor {
        SyncCursor {
            start_block: self.start_block,
            latest_processed_block: self.latest_processed_block,
            latest_known_block: self.latest_block,
        }
    }

    /// Rebuilds the cursor and ledger state.
    pub fn restore(self) -> Result<(SyncCursor, LedgerState), StoreError> {
        if self.version != SNAPSHOT_VERSION {
            return Err(StoreError::Version {
                found: self.version,
                expected: SNAPSHOT_VERSION,
            });
        }
        let cursor = self.cursor();
        if let Some(known) = cursor.latest_known_block {
            if cursor.latest_processed_block > known {
                return Err(StoreError::Incompatible(format!(
                    "processed block {} is ahead of known block {known}",
                    cursor.latest_processed_block
                )));
            }
        }
        let nullifiers =
            NullifierLedger::from_parts(self.valid_proofs, self.spent_proofs, self.spent_nullifiers);
        Ok((
            cursor,
            LedgerState {
                accumulator: self.accumulator,
                nullifiers,
            },
        ))
    }

    pub fn to_json(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, StoreError> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zkrep_ledger::ProtocolConfig;

    fn sample_state() -> LedgerState {
        let mut state = LedgerState::new(ProtocolConfig::default());
        state.accumulator.insert_leaf(1, FieldElement::from(5)).unwrap();
        state.nullifiers.mark_spent(FieldElement::from(u64::MAX)).unwrap();
        state
    }

    #[test]
    fn test_capture_restore() {
        let cursor = SyncCursor {
            start_block: Some(10),
            latest_processed_block: 20,
            latest_known_block: Some(25),
        };
        let state = sample_state();
        let json = Snapshot::capture(&cursor, &state).to_json().unwrap();
        let (restored_cursor, restored) = Snapshot::from_json(&json).unwrap().restore().unwrap();
        assert_eq!(restored_cursor, cursor);
        assert_eq!(restored, state);
    }

    #[test]
    fn test_json_layout() {
        let snapshot = Snapshot::capture(&SyncCursor::default(), &sample_state());
        let value: serde_json::Value = serde_json::from_str(&snapshot.to_json().unwrap()).unwrap();
        for key in [
            "version",
            "latestProcessedBlock",
            "latestBlock",
            "startBlock",
            "validProofs",
            "spentProofs",
            "spentNullifiers",
            "accumulator",
        ] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        assert_eq!(value["spentNullifiers"][0]["type"], "BigNumber");
        assert_eq!(value["spentNullifiers"][0]["hex"], "0xffffffffffffffff");
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut snapshot = Snapshot::capture(&SyncCursor::default(), &sample_state());
        snapshot.version = 99;
        assert!(matches!(
            snapshot.restore(),
            Err(StoreError::Version { found: 99, .. })
        ));
    }

    #[test]
    fn test_cursor_ahead_of_head_rejected() {
        let cursor = SyncCursor {
            start_block: Some(1),
            latest_processed_block: 30,
            latest_known_block: Some(20),
        };
        let snapshot = Snapshot::capture(&cursor, &sample_state());
        assert!(matches!(snapshot.restore(), Err(StoreError::Incompatible(_))));
    }
}
