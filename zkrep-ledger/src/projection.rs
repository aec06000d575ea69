//! Per-identity view over the ledger.
//!
//! A [`UserProjection`] is built once from a [`LedgerState`] and then kept
//! current by feeding it the effects of accepted events.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::debug;
use zkrep_common::FieldElement;

use crate::identity::Identity;
use crate::processor::{Effect, LedgerState};
use crate::signals::ProofArgs;
use crate::types::{Epoch, EpochKey, ProtocolConfig};

/// One accepted state transition of the projected identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionRecord {
    pub from_epoch: Epoch,
    pub to_epoch: Epoch,
    pub leaf: FieldElement,
}

#[derive(Clone, Debug)]
pub struct UserProjection {
    identity: Identity,
    config: ProtocolConfig,
    current_epoch: Epoch,
    signup_epoch: Option<Epoch>,
    airdrop: u64,
    pos_rep: u128,
    neg_rep: u128,
    spent: u128,
    latest_transitioned_epoch: Option<Epoch>,
    transitions: Vec<TransitionRecord>,
}

impl UserProjection {
    pub fn from_state(identity: Identity, state: &LedgerState) -> Self {
        let mut projection = Self {
            identity,
            config: state.accumulator.config().clone(),
            current_epoch: state.current_epoch(),
            signup_epoch: None,
            airdrop: 0,
            pos_rep: 0,
            neg_rep: 0,
            spent: 0,
            latest_transitioned_epoch: None,
            transitions: Vec::new(),
        };
        projection.resync(state);
        projection
    }

    /// Recomputes every field from `state`.
    pub fn resync(&mut self, state: &LedgerState) {
        let accumulator = &state.accumulator;
        self.config = accumulator.config().clone();
        self.current_epoch = accumulator.current_epoch();
        self.pos_rep = 0;
        self.neg_rep = 0;
        self.spent = 0;
        self.transitions.clear();

        let Some(signup) = accumulator.signup(&self.identity.commitment()) else {
            self.signup_epoch = None;
            self.airdrop = 0;
            self.latest_transitioned_epoch = None;
            return;
        };
        self.signup_epoch = Some(signup.epoch);
        self.airdrop = signup.airdrop;
        self.latest_transitioned_epoch = Some(signup.epoch);

        for epoch in signup.epoch..=self.current_epoch {
            let keys: BTreeSet<EpochKey> = self.owned_keys(epoch).into_iter().collect();
            for key in keys {
                if let Some(bucket) = accumulator.epoch_tree_bucket(epoch, &key) {
                    self.pos_rep += bucket.pos_rep;
                    self.neg_rep += bucket.neg_rep;
                }
            }
        }

        for (key, record) in state.nullifiers.valid_proofs() {
            if !state.nullifiers.is_proof_spent(key) {
                continue;
            }
            match &record.args {
                ProofArgs::Reputation(rep) if self.owns_key(rep.epoch, &rep.epoch_key) => {
                    self.spent += rep.spend_amount as u128;
                }
                ProofArgs::UserStateTransition(ust)
                    if self.owns_any_nullifier(ust.from_epoch, &ust.epk_nullifiers) =>
                {
                    if let Some(to_epoch) = accumulator.epoch_of_leaf(&ust.new_gst_leaf) {
                        self.record_transition(ust.from_epoch, to_epoch, ust.new_gst_leaf);
                    }
                }
                _ => {}
            }
        }
        self.transitions.sort_by_key(|t| (t.to_epoch, t.from_epoch));
    }

    /// Folds the effect of one accepted event into the projection.
    pub fn apply(&mut self, effect: &Effect) {
        match effect {
            Effect::SignedUp {
                epoch,
                commitment,
                airdrop,
                ..
            } if *commitment == self.identity.commitment() => {
                self.signup_epoch = Some(*epoch);
                self.airdrop = *airdrop;
                self.latest_transitioned_epoch = Some(*epoch);
                debug!(epoch, airdrop, "identity signed up");
            }
            Effect::Attested {
                epoch,
                epoch_key,
                attestation,
                spent,
                ..
            } => {
                if !self.is_signed_up() {
                    return;
                }
                if self.owns_key(*epoch, epoch_key) {
                    self.pos_rep += attestation.pos_rep as u128;
                    self.neg_rep += attestation.neg_rep as u128;
                }
                if let Some(spend) = spent {
                    if self.owns_key(*epoch, &spend.epoch_key) {
                        self.spent += spend.amount as u128;
                    }
                }
            }
            Effect::Transitioned {
                epoch,
                from_epoch,
                leaf,
                nullifiers,
                ..
            } if self.owns_any_nullifier(*from_epoch, nullifiers) => {
                self.record_transition(*from_epoch, *epoch, *leaf);
                debug!(from_epoch, to_epoch = epoch, "identity transitioned");
            }
            Effect::EpochEnded { epoch, .. } => {
                self.current_epoch = self.current_epoch.max(epoch + 1);
            }
            _ => {}
        }
    }

    pub fn is_signed_up(&self) -> bool {
        self.signup_epoch.is_some()
    }

    pub fn signup_epoch(&self) -> Option<Epoch> {
        self.signup_epoch
    }

    pub fn current_epoch(&self) -> Epoch {
        self.current_epoch
    }

    pub fn latest_transitioned_epoch(&self) -> Option<Epoch> {
        self.latest_transitioned_epoch
    }

    /// Airdrop plus net attested reputation, minus proven spends.
    pub fn reputation(&self) -> i128 {
        self.airdrop as i128 + self.pos_rep as i128 - self.neg_rep as i128 - self.spent as i128
    }

    pub fn needs_transition(&self) -> bool {
        match self.latest_transitioned_epoch {
            Some(latest) => self.current_epoch > latest,
            None => false,
        }
    }

    pub fn epoch_keys(&self, epoch: Epoch) -> Vec<EpochKey> {
        self.identity.epoch_keys(epoch, &self.config)
    }

    /// Epoch keys of every epoch since sign-up, excluding the current one.
    pub fn past_epoch_keys(&self) -> BTreeSet<EpochKey> {
        let Some(first) = self.signup_epoch else {
            return BTreeSet::new();
        };
        (first..self.current_epoch)
            .flat_map(|epoch| self.owned_keys(epoch))
            .collect()
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    fn owned_keys(&self, epoch: Epoch) -> Vec<EpochKey> {
        self.identity.epoch_keys(epoch, &self.config)
    }

    fn owns_key(&self, epoch: Epoch, key: &EpochKey) -> bool {
        match self.signup_epoch {
            Some(first) if epoch >= first => self.owned_keys(epoch).contains(key),
            _ => false,
        }
    }

    fn owns_any_nullifier(&self, epoch: Epoch, nullifiers: &[FieldElement]) -> bool {
        self.identity
            .epoch_key_nullifiers(epoch, &self.config)
            .iter()
            .any(|n| nullifiers.contains(n))
    }

    fn record_transition(&mut self, from_epoch: Epoch, to_epoch: Epoch, leaf: FieldElement) {
        self.transitions.push(TransitionRecord {
            from_epoch,
            to_epoch,
            leaf,
        });
        let latest = self.latest_transitioned_epoch.unwrap_or(to_epoch);
        self.latest_transitioned_epoch = Some(latest.max(to_epoch));
    }
}
