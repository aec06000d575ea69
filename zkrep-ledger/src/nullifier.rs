//! Spent nullifiers and verified proof records.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use zkrep_common::FieldElement;

use crate::error::LedgerError;
use crate::signals::ProofArgs;
use crate::types::{ProofIndex, ProofKey, SnarkProof};
use crate::verifier::CircuitTag;

/// A proof that passed verification, with its decoded public signals.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidProofRecord {
    pub circuit: CircuitTag,
    pub args: ProofArgs,
    pub proof: SnarkProof,
    /// Start-transition and process-attestations proofs a transition proof builds on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub linked_proofs: Vec<ProofIndex>,
    pub block_number: u64,
}

/// Double-spend guard for nullifiers and consumable proofs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NullifierLedger {
    spent_nullifiers: BTreeSet<FieldElement>,
    valid_proofs: BTreeMap<ProofKey, ValidProofRecord>,
    spent_proofs: BTreeMap<ProofKey, bool>,
}

impl NullifierLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a ledger from its persisted parts.
    pub fn from_parts(
        valid_proofs: BTreeMap<ProofKey, ValidProofRecord>,
        spent_proofs: BTreeMap<ProofKey, bool>,
        spent_nullifiers: impl IntoIterator<Item = FieldElement>,
    ) -> Self {
        Self {
            spent_nullifiers: spent_nullifiers.into_iter().collect(),
            valid_proofs,
            spent_proofs: spent_proofs.into_iter().filter(|(_, spent)| *spent).collect(),
        }
    }

    pub fn is_spent(&self, nullifier: &FieldElement) -> bool {
        self.spent_nullifiers.contains(nullifier)
    }

    /// First nullifier of `nullifiers` that is already spent.
    pub fn first_spent(&self, nullifiers: &[FieldElement]) -> Option<FieldElement> {
        nullifiers.iter().find(|n| self.is_spent(n)).copied()
    }

    /// Records `nullifier` as spent. A second call for the same nullifier is an error.
    pub fn mark_spent(&mut self, nullifier: FieldElement) -> Result<(), LedgerError> {
        if !self.spent_nullifiers.insert(nullifier) {
            return Err(LedgerError::DoubleSpend(nullifier));
        }
        Ok(())
    }

    pub fn spent_nullifiers(&self) -> &BTreeSet<FieldElement> {
        &self.spent_nullifiers
    }

    pub fn proof(&self, key: &ProofKey) -> Option<&ValidProofRecord> {
        self.valid_proofs.get(key)
    }

    pub fn record_proof(&mut self, key: ProofKey, record: ValidProofRecord) -> Result<(), LedgerError> {
        if self.valid_proofs.contains_key(&key) {
            return Err(LedgerError::ProofAlreadyRecorded(key));
        }
        self.valid_proofs.insert(key, record);
        Ok(())
    }

    pub fn valid_proofs(&self) -> &BTreeMap<ProofKey, ValidProofRecord> {
        &self.valid_proofs
    }

    pub fn is_proof_spent(&self, key: &ProofKey) -> bool {
        self.spent_proofs.get(key).copied().unwrap_or(false)
    }

    pub fn mark_proof_spent(&mut self, key: ProofKey) -> Result<(), LedgerError> {
        if self.is_proof_spent(&key) {
            return Err(LedgerError::ProofAlreadySpent(key));
        }
        self.spent_proofs.insert(key, true);
        Ok(())
    }

    pub fn spent_proofs(&self) -> &BTreeMap<ProofKey, bool> {
        &self.spent_proofs
    }
}
