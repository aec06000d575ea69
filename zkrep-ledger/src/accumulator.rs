//! Global state trees, epoch trees and sign-up records.

use std::collections::{BTreeMap, BTreeSet};

use ethers::types::Address;
use serde::{Deserialize, Serialize};
use tracing::debug;
use zkrep_common::{hash::USER_STATE_DOMAIN, hash_fields, hash_left_right, FieldElement};

use crate::error::LedgerError;
use crate::tree::{sparse_merkle_root, IncrementalMerkleTree};
use crate::types::{
    Attestation, AttestationKind, AttestationRecord, Epoch, EpochKey, ProtocolConfig,
    GENESIS_EPOCH,
};

/// GST leaf committing to a fresh sign-up.
pub fn signup_leaf(commitment: &FieldElement, attester_id: u64, airdrop: u64) -> FieldElement {
    let user_state = hash_fields(
        USER_STATE_DOMAIN,
        &[FieldElement::from(attester_id), FieldElement::from(airdrop)],
    );
    hash_left_right(commitment, &user_state)
}

/// Aggregated attestations received by one epoch key in one epoch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpochTreeBucket {
    pub pos_rep: u128,
    pub neg_rep: u128,
    pub graffiti: FieldElement,
    pub sign_up: bool,
    pub hash_chain: FieldElement,
    pub attestations: Vec<AttestationRecord>,
}

impl EpochTreeBucket {
    pub fn net_reputation(&self) -> i128 {
        self.pos_rep as i128 - self.neg_rep as i128
    }

    /// Epoch tree leaf value once the epoch is sealed.
    pub fn sealed_hash_chain(&self) -> FieldElement {
        hash_left_right(&FieldElement::one(), &self.hash_chain)
    }

    fn fold(&mut self, record: AttestationRecord) {
        let attestation = &record.attestation;
        self.pos_rep += attestation.pos_rep as u128;
        self.neg_rep += attestation.neg_rep as u128;
        if !attestation.graffiti.is_zero() {
            self.graffiti = attestation.graffiti;
        }
        self.sign_up |= attestation.sign_up;
        self.hash_chain = hash_left_right(&attestation.hash(), &self.hash_chain);
        self.attestations.push(record);
    }
}

/// Accumulators of a single epoch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpochState {
    pub gst: IncrementalMerkleTree,
    /// Every root the GST has had during this epoch.
    pub gst_roots: BTreeSet<FieldElement>,
    pub epoch_tree: BTreeMap<EpochKey, EpochTreeBucket>,
    /// Epoch tree root, set when the epoch ends.
    pub sealed_root: Option<FieldElement>,
}

impl EpochState {
    fn new(gst_depth: u32) -> Self {
        Self {
            gst: IncrementalMerkleTree::new(gst_depth),
            gst_roots: BTreeSet::new(),
            epoch_tree: BTreeMap::new(),
            sealed_root: None,
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed_root.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignUpRecord {
    pub commitment: FieldElement,
    pub epoch: Epoch,
    pub attester_id: u64,
    pub airdrop: u64,
    pub leaf: FieldElement,
    pub leaf_index: u64,
}

/// The reconstructed accumulator state of one protocol instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccumulatorState {
    config: ProtocolConfig,
    current_epoch: Epoch,
    epochs: BTreeMap<Epoch, EpochState>,
    #[serde(with = "serde_pairs")]
    signups: BTreeMap<FieldElement, SignUpRecord>,
}

impl AccumulatorState {
    pub fn new(config: ProtocolConfig) -> Self {
        let mut epochs = BTreeMap::new();
        epochs.insert(GENESIS_EPOCH, EpochState::new(config.gst_depth));
        Self {
            config,
            current_epoch: GENESIS_EPOCH,
            epochs,
            signups: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn current_epoch(&self) -> Epoch {
        self.current_epoch
    }

    pub fn epoch(&self, epoch: Epoch) -> Option<&EpochState> {
        self.epochs.get(&epoch)
    }

    pub fn epochs(&self) -> impl Iterator<Item = (&Epoch, &EpochState)> {
        self.epochs.iter()
    }

    // ------------------------------------------------------------------
    // Global state tree
    // ------------------------------------------------------------------

    /// Whether `root` was ever the GST root during `epoch`.
    pub fn root_is_known(&self, root: &FieldElement, epoch: Epoch) -> bool {
        self.epochs
            .get(&epoch)
            .map(|state| state.gst_roots.contains(root))
            .unwrap_or(false)
    }

    pub fn root_known_in_any_epoch(&self, root: &FieldElement) -> bool {
        self.epochs.values().any(|state| state.gst_roots.contains(root))
    }

    /// Appends `leaf` to the GST of `epoch` and returns the new root.
    pub fn insert_leaf(&mut self, epoch: Epoch, leaf: FieldElement) -> Result<FieldElement, LedgerError> {
        let depth = self.config.gst_depth;
        let state = self
            .epochs
            .get_mut(&epoch)
            .ok_or(LedgerError::UnknownEpoch(epoch))?;
        let root = state
            .gst
            .insert(leaf)
            .ok_or(LedgerError::TreeFull { epoch, depth })?;
        state.gst_roots.insert(root);
        debug!(epoch, leaves = state.gst.len(), %root, "gst leaf inserted");
        Ok(root)
    }

    pub fn gst_root(&self, epoch: Epoch) -> Option<FieldElement> {
        self.epochs.get(&epoch).map(|state| state.gst.root())
    }

    pub fn gst_leaves(&self, epoch: Epoch) -> &[FieldElement] {
        self.epochs
            .get(&epoch)
            .map(|state| state.gst.leaves())
            .unwrap_or(&[])
    }

    /// Epoch whose GST contains `leaf`, searching newest first.
    pub fn epoch_of_leaf(&self, leaf: &FieldElement) -> Option<Epoch> {
        self.epochs
            .iter()
            .rev()
            .find(|(_, state)| state.gst.leaves().contains(leaf))
            .map(|(epoch, _)| *epoch)
    }

    // ------------------------------------------------------------------
    // Epoch trees
    // ------------------------------------------------------------------

    pub fn is_sealed(&self, epoch: Epoch) -> bool {
        self.epochs
            .get(&epoch)
            .map(EpochState::is_sealed)
            .unwrap_or(false)
    }

    pub fn sealed_epoch_tree_root(&self, epoch: Epoch) -> Option<FieldElement> {
        self.epochs.get(&epoch).and_then(|state| state.sealed_root)
    }

    pub fn epoch_tree_bucket(&self, epoch: Epoch, key: &EpochKey) -> Option<&EpochTreeBucket> {
        self.epochs
            .get(&epoch)
            .and_then(|state| state.epoch_tree.get(key))
    }

    /// Epoch keys that received at least one attestation in `epoch`.
    pub fn epoch_keys(&self, epoch: Epoch) -> Vec<EpochKey> {
        self.epochs
            .get(&epoch)
            .map(|state| state.epoch_tree.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn attestations(&self, epoch: Epoch, key: &EpochKey) -> &[AttestationRecord] {
        self.epoch_tree_bucket(epoch, key)
            .map(|bucket| bucket.attestations.as_slice())
            .unwrap_or(&[])
    }

    /// Adds an attestation to the bucket of `key` in an unsealed epoch.
    pub fn fold_attestation(
        &mut self,
        epoch: Epoch,
        key: EpochKey,
        kind: AttestationKind,
        attester: Address,
        attestation: Attestation,
    ) -> Result<&EpochTreeBucket, LedgerError> {
        if key.leaf_index(self.config.epoch_tree_depth).is_none() {
            return Err(LedgerError::EpochKeyOutOfRange(key));
        }
        let state = self
            .epochs
            .get_mut(&epoch)
            .ok_or(LedgerError::UnknownEpoch(epoch))?;
        if state.is_sealed() {
            return Err(LedgerError::SealedEpochWrite(epoch));
        }
        let bucket = state.epoch_tree.entry(key).or_default();
        bucket.fold(AttestationRecord {
            kind,
            attester,
            attestation,
        });
        Ok(bucket)
    }

    /// Seals the current epoch's tree, opens the next epoch, and returns the sealed root.
    pub fn seal_current_epoch(&mut self) -> Result<FieldElement, LedgerError> {
        let epoch = self.current_epoch;
        let depth = self.config.epoch_tree_depth;
        let state = self
            .epochs
            .get_mut(&epoch)
            .ok_or(LedgerError::UnknownEpoch(epoch))?;
        if state.is_sealed() {
            return Err(LedgerError::SealedEpochWrite(epoch));
        }

        let mut leaves = BTreeMap::new();
        for (key, bucket) in &state.epoch_tree {
            let index = key
                .leaf_index(depth)
                .ok_or(LedgerError::EpochKeyOutOfRange(*key))?;
            leaves.insert(index, bucket.sealed_hash_chain());
        }
        let root = sparse_merkle_root(depth, &leaves);
        state.sealed_root = Some(root);

        self.current_epoch = epoch + 1;
        self.epochs
            .insert(self.current_epoch, EpochState::new(self.config.gst_depth));
        debug!(epoch, keys = leaves.len(), %root, "epoch sealed");
        Ok(root)
    }

    // ------------------------------------------------------------------
    // Sign-ups
    // ------------------------------------------------------------------

    pub fn signup(&self, commitment: &FieldElement) -> Option<&SignUpRecord> {
        self.signups.get(commitment)
    }

    pub fn signups(&self) -> impl Iterator<Item = &SignUpRecord> {
        self.signups.values()
    }

    pub fn record_signup(&mut self, record: SignUpRecord) {
        self.signups.insert(record.commitment, record);
    }
}

/// Serializes maps whose keys are not strings as a list of `[key, value]` pairs.
mod serde_pairs {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<K, V, S>(map: &BTreeMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        K: Serialize,
        V: Serialize,
        S: Serializer,
    {
        serializer.collect_seq(map.iter())
    }

    pub fn deserialize<'de, K, V, D>(deserializer: D) -> Result<BTreeMap<K, V>, D::Error>
    where
        K: Deserialize<'de> + Ord,
        V: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        let pairs = Vec::<(K, V)>::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}
