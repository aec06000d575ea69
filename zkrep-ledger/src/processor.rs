//! Per-event state transitions.
//!
//! [`EventProcessor::apply`] takes one decoded event and mutates a
//! [`LedgerState`] in place. Every check runs before the first write, so a
//! rejected event leaves the state untouched.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, warn};
use zkrep_common::FieldElement;

use crate::accumulator::{signup_leaf, AccumulatorState, SignUpRecord};
use crate::error::{LedgerError, Rejection};
use crate::events::{AttestationEvent, DecodedEvent, EventPosition, LedgerEvent, ProofEvent};
use crate::nullifier::{NullifierLedger, ValidProofRecord};
use crate::signals::ProofArgs;
use crate::types::{Attestation, AttestationKind, Epoch, EpochKey, ProofIndex, ProofKey, ProtocolConfig};
use crate::verifier::{CircuitTag, ProofVerifier};

/// Accumulators and nullifier ledger, mutated together.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerState {
    pub accumulator: AccumulatorState,
    pub nullifiers: NullifierLedger,
}

impl LedgerState {
    pub fn new(config: ProtocolConfig) -> Self {
        Self {
            accumulator: AccumulatorState::new(config),
            nullifiers: NullifierLedger::new(),
        }
    }

    pub fn current_epoch(&self) -> Epoch {
        self.accumulator.current_epoch()
    }
}

/// A reputation proof consumed by an attestation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReputationSpend {
    pub proof: ProofKey,
    pub epoch_key: EpochKey,
    pub amount: u64,
    pub nullifiers: Vec<FieldElement>,
}

/// What an accepted event changed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    ProofRecorded {
        key: ProofKey,
        circuit: CircuitTag,
    },
    SignedUp {
        epoch: Epoch,
        commitment: FieldElement,
        attester_id: u64,
        airdrop: u64,
        leaf: FieldElement,
        leaf_index: u64,
        gst_root: FieldElement,
    },
    Attested {
        epoch: Epoch,
        epoch_key: EpochKey,
        kind: AttestationKind,
        attestation: Attestation,
        spent: Option<ReputationSpend>,
    },
    Transitioned {
        epoch: Epoch,
        from_epoch: Epoch,
        leaf: FieldElement,
        gst_root: FieldElement,
        nullifiers: Vec<FieldElement>,
    },
    EpochEnded {
        epoch: Epoch,
        epoch_tree_root: FieldElement,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Accepted(Effect),
    Rejected(Rejection),
}

impl Outcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Outcome::Accepted(_))
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Outcome::Rejected(rejection) => Some(rejection),
            Outcome::Accepted(_) => None,
        }
    }
}

enum Step {
    Rejected(Rejection),
    Failed(LedgerError),
}

impl From<Rejection> for Step {
    fn from(rejection: Rejection) -> Self {
        Step::Rejected(rejection)
    }
}

impl From<LedgerError> for Step {
    fn from(err: LedgerError) -> Self {
        Step::Failed(err)
    }
}

/// Applies decoded events to ledger state, verifying attached proofs.
#[derive(Clone)]
pub struct EventProcessor {
    verifier: Arc<dyn ProofVerifier>,
    config: ProtocolConfig,
}

impl EventProcessor {
    pub fn new(verifier: Arc<dyn ProofVerifier>, config: ProtocolConfig) -> Self {
        Self { verifier, config }
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Applies `event` to `state`.
    ///
    /// Returns `Err` only for failures that must abort the batch: fatal
    /// bookkeeping errors and an unreachable verifier.
    pub async fn apply(
        &self,
        state: &mut LedgerState,
        event: &DecodedEvent,
    ) -> Result<Outcome, LedgerError> {
        let position = event.position;
        let result = match &event.event {
            LedgerEvent::Proof(proof) => self.apply_proof(state, proof, position).await,
            LedgerEvent::AttestationSubmitted(attestation) => {
                self.apply_attestation(state, attestation)
            }
            LedgerEvent::UserSignedUp {
                epoch,
                identity_commitment,
                attester_id,
                airdrop,
            } => self.apply_signup(state, *epoch, *identity_commitment, *attester_id, *airdrop),
            LedgerEvent::UserStateTransitioned {
                epoch,
                hashed_leaf,
                proof_index,
            } => self.apply_transition(state, *epoch, *hashed_leaf, *proof_index),
            LedgerEvent::EpochEnded { epoch } => self.apply_epoch_ended(state, *epoch),
        };

        match result {
            Ok(effect) => {
                debug!(
                    block = position.block_number,
                    tx = position.transaction_index,
                    log = position.log_index,
                    kind = %event.event.kind(),
                    "event accepted"
                );
                Ok(Outcome::Accepted(effect))
            }
            Err(Step::Rejected(rejection)) => {
                warn!(
                    block = position.block_number,
                    tx = position.transaction_index,
                    log = position.log_index,
                    kind = %event.event.kind(),
                    code = rejection.code(),
                    "event rejected: {}",
                    rejection
                );
                Ok(Outcome::Rejected(rejection))
            }
            Err(Step::Failed(err)) => Err(err),
        }
    }

    // ========================================================================
    // Proofs
    // ========================================================================

    async fn apply_proof(
        &self,
        state: &mut LedgerState,
        event: &ProofEvent,
        position: EventPosition,
    ) -> Result<Effect, Step> {
        let args = ProofArgs::decode(event.circuit, &event.public_signals, &self.config)?;

        if event.epoch.is_some() && event.epoch != args.epoch() {
            return Err(Rejection::SignalMismatch(format!(
                "indexed epoch {:?} but signals prove {:?}",
                event.epoch,
                args.epoch()
            ))
            .into());
        }
        if event.epoch_key.is_some() && event.epoch_key != args.epoch_key() {
            return Err(Rejection::SignalMismatch("indexed epoch key differs from signals".into()).into());
        }

        let key = ProofKey {
            epoch: args.epoch(),
            index: event.proof_index,
        };
        if state.nullifiers.proof(&key).is_some() {
            return Err(Rejection::DuplicateProofIndex(key).into());
        }

        check_roots(state, &args, &event.linked_proofs)?;

        if let Some(spent) = state.nullifiers.first_spent(&args.nullifiers()) {
            return Err(Rejection::DuplicateNullifier(spent).into());
        }

        let valid = self
            .verifier
            .verify(event.circuit, &event.public_signals, &event.proof)
            .await
            .map_err(|e| LedgerError::Verifier(e.to_string()))?;
        if !valid {
            return Err(Rejection::InvalidProof {
                circuit: event.circuit,
            }
            .into());
        }

        state.nullifiers.record_proof(
            key,
            ValidProofRecord {
                circuit: event.circuit,
                args,
                proof: event.proof.clone(),
                linked_proofs: event.linked_proofs.clone(),
                block_number: position.block_number,
            },
        )?;
        Ok(Effect::ProofRecorded {
            key,
            circuit: event.circuit,
        })
    }

    // ========================================================================
    // Attestations
    // ========================================================================

    fn apply_attestation(
        &self,
        state: &mut LedgerState,
        event: &AttestationEvent,
    ) -> Result<Effect, Step> {
        check_current_epoch(state, event.epoch)?;
        if event.epoch_key.leaf_index(self.config.epoch_tree_depth).is_none() {
            return Err(Rejection::Malformed(format!(
                "epoch key {} exceeds {} bits",
                event.epoch_key, self.config.epoch_tree_depth
            ))
            .into());
        }

        let to_key = ProofKey::epoch(event.epoch, event.to_proof_index);
        let to_proof = state
            .nullifiers
            .proof(&to_key)
            .ok_or(Rejection::UnknownProof(to_key))?;
        let proven_key = match &to_proof.args {
            ProofArgs::EpochKey(_) | ProofArgs::Reputation(_) | ProofArgs::SignUp(_) => {
                to_proof.args.epoch_key()
            }
            _ => None,
        }
        .ok_or(Rejection::WrongProofKind {
            key: to_key,
            found: to_proof.circuit,
            expected: "epoch key",
        })?;
        if proven_key != event.epoch_key {
            return Err(Rejection::EpochKeyMismatch {
                proof: proven_key,
                event: event.epoch_key,
            }
            .into());
        }

        let spend = match event.from_proof_index {
            Some(index) => Some(check_reputation_spend(
                &state.nullifiers,
                ProofKey::epoch(event.epoch, index),
                &event.attestation,
            )?),
            None => None,
        };

        if let Some(spend) = &spend {
            state.nullifiers.mark_proof_spent(spend.proof)?;
            for nullifier in &spend.nullifiers {
                state.nullifiers.mark_spent(*nullifier)?;
            }
        }
        state.accumulator.fold_attestation(
            event.epoch,
            event.epoch_key,
            event.kind,
            event.attester,
            event.attestation.clone(),
        )?;

        Ok(Effect::Attested {
            epoch: event.epoch,
            epoch_key: event.epoch_key,
            kind: event.kind,
            attestation: event.attestation.clone(),
            spent: spend,
        })
    }

    // ========================================================================
    // Sign-ups and transitions
    // ========================================================================

    fn apply_signup(
        &self,
        state: &mut LedgerState,
        epoch: Epoch,
        commitment: FieldElement,
        attester_id: u64,
        airdrop: u64,
    ) -> Result<Effect, Step> {
        let current = state.current_epoch();
        if epoch != current {
            return Err(Rejection::EpochMismatch {
                event: epoch,
                current,
            }
            .into());
        }
        if state.accumulator.signup(&commitment).is_some() {
            return Err(Rejection::AlreadySignedUp(commitment).into());
        }

        let leaf = signup_leaf(&commitment, attester_id, airdrop);
        let leaf_index = state.accumulator.gst_leaves(epoch).len() as u64;
        let gst_root = state.accumulator.insert_leaf(epoch, leaf)?;
        state.accumulator.record_signup(SignUpRecord {
            commitment,
            epoch,
            attester_id,
            airdrop,
            leaf,
            leaf_index,
        });

        Ok(Effect::SignedUp {
            epoch,
            commitment,
            attester_id,
            airdrop,
            leaf,
            leaf_index,
            gst_root,
        })
    }

    fn apply_transition(
        &self,
        state: &mut LedgerState,
        epoch: Epoch,
        hashed_leaf: FieldElement,
        proof_index: ProofIndex,
    ) -> Result<Effect, Step> {
        check_current_epoch(state, epoch)?;

        let key = ProofKey::transition(proof_index);
        let record = state
            .nullifiers
            .proof(&key)
            .ok_or(Rejection::UnknownProof(key))?;
        let ProofArgs::UserStateTransition(ust) = &record.args else {
            return Err(Rejection::WrongProofKind {
                key,
                found: record.circuit,
                expected: "user state transition",
            }
            .into());
        };
        if state.nullifiers.is_proof_spent(&key) {
            return Err(Rejection::AlreadySpent(key).into());
        }
        if hashed_leaf != ust.new_gst_leaf {
            return Err(Rejection::LeafMismatch {
                event: hashed_leaf,
                proof: ust.new_gst_leaf,
            }
            .into());
        }
        if ust.from_epoch >= epoch {
            return Err(Rejection::EpochMismatch {
                event: ust.from_epoch,
                current: epoch,
            }
            .into());
        }
        let nullifiers = record.args.nullifiers();
        if let Some(spent) = state.nullifiers.first_spent(&nullifiers) {
            return Err(Rejection::DuplicateNullifier(spent).into());
        }
        let linked: BTreeSet<ProofKey> = record
            .linked_proofs
            .iter()
            .map(|index| ProofKey::transition(*index))
            .collect();
        if let Some(spent) = linked.iter().find(|k| state.nullifiers.is_proof_spent(k)) {
            return Err(Rejection::AlreadySpent(*spent).into());
        }
        let from_epoch = ust.from_epoch;

        for nullifier in &nullifiers {
            state.nullifiers.mark_spent(*nullifier)?;
        }
        state.nullifiers.mark_proof_spent(key)?;
        for linked_key in linked {
            state.nullifiers.mark_proof_spent(linked_key)?;
        }
        let gst_root = state.accumulator.insert_leaf(epoch, hashed_leaf)?;

        Ok(Effect::Transitioned {
            epoch,
            from_epoch,
            leaf: hashed_leaf,
            gst_root,
            nullifiers,
        })
    }

    fn apply_epoch_ended(&self, state: &mut LedgerState, epoch: Epoch) -> Result<Effect, Step> {
        let current = state.current_epoch();
        if epoch != current {
            return Err(Rejection::EpochMismatch {
                event: epoch,
                current,
            }
            .into());
        }
        let epoch_tree_root = state.accumulator.seal_current_epoch()?;
        Ok(Effect::EpochEnded {
            epoch,
            epoch_tree_root,
        })
    }
}

fn check_current_epoch(state: &LedgerState, epoch: Epoch) -> Result<(), Rejection> {
    let current = state.current_epoch();
    if epoch < current || state.accumulator.is_sealed(epoch) {
        return Err(Rejection::EpochSealed(epoch));
    }
    if epoch > current {
        return Err(Rejection::EpochMismatch {
            event: epoch,
            current,
        });
    }
    Ok(())
}

/// Root gating: every tree root a proof cites must have been observed for its epoch.
fn check_roots(
    state: &LedgerState,
    args: &ProofArgs,
    linked: &[ProofIndex],
) -> Result<(), Rejection> {
    let accumulator = &state.accumulator;
    match args {
        ProofArgs::EpochKey(s) => require_root(accumulator, s.gst_root, s.epoch),
        ProofArgs::Reputation(s) => require_root(accumulator, s.gst_root, s.epoch),
        ProofArgs::SignUp(s) => require_root(accumulator, s.gst_root, s.epoch),
        ProofArgs::StartTransition(s) => {
            if accumulator.root_known_in_any_epoch(&s.gst_root) {
                Ok(())
            } else {
                Err(Rejection::UnknownRoot {
                    root: s.gst_root,
                    epoch: None,
                })
            }
        }
        ProofArgs::ProcessAttestations(_) => Ok(()),
        ProofArgs::UserStateTransition(s) => {
            require_root(accumulator, s.from_gst_root, s.from_epoch)?;
            if accumulator.sealed_epoch_tree_root(s.from_epoch) != Some(s.from_epoch_tree_root) {
                return Err(Rejection::UnknownEpochTreeRoot {
                    root: s.from_epoch_tree_root,
                    epoch: s.from_epoch,
                });
            }
            check_linked_proofs(&state.nullifiers, s.blinded_user_states[0], linked)
        }
    }
}

fn require_root(
    accumulator: &AccumulatorState,
    root: FieldElement,
    epoch: Epoch,
) -> Result<(), Rejection> {
    if accumulator.root_is_known(&root, epoch) {
        Ok(())
    } else {
        Err(Rejection::UnknownRoot {
            root,
            epoch: Some(epoch),
        })
    }
}

/// A transition proof must build on a recorded start-transition proof for
/// the same blinded user state, followed by process-attestations proofs.
/// Each linked record may appear once.
fn check_linked_proofs(
    nullifiers: &NullifierLedger,
    initial_blinded_state: FieldElement,
    linked: &[ProofIndex],
) -> Result<(), Rejection> {
    let mut seen = BTreeSet::new();
    if let Some(repeated) = linked.iter().find(|index| !seen.insert(**index)) {
        return Err(Rejection::Malformed(format!(
            "transition proof links record {repeated} more than once"
        )));
    }

    let Some((first, rest)) = linked.split_first() else {
        return Err(Rejection::SignalMismatch(
            "transition proof links no start-transition proof".into(),
        ));
    };

    let start_key = ProofKey::transition(*first);
    let start = nullifiers
        .proof(&start_key)
        .ok_or(Rejection::UnknownProof(start_key))?;
    match &start.args {
        ProofArgs::StartTransition(s) if s.blinded_user_state == initial_blinded_state => {}
        ProofArgs::StartTransition(_) => {
            return Err(Rejection::SignalMismatch(
                "start-transition proof commits to a different user state".into(),
            ))
        }
        _ => {
            return Err(Rejection::WrongProofKind {
                key: start_key,
                found: start.circuit,
                expected: "start transition",
            })
        }
    }

    for index in rest {
        let key = ProofKey::transition(*index);
        let record = nullifiers.proof(&key).ok_or(Rejection::UnknownProof(key))?;
        if !matches!(record.args, ProofArgs::ProcessAttestations(_)) {
            return Err(Rejection::WrongProofKind {
                key,
                found: record.circuit,
                expected: "process attestations",
            });
        }
    }
    Ok(())
}

fn check_reputation_spend(
    nullifiers: &NullifierLedger,
    key: ProofKey,
    attestation: &Attestation,
) -> Result<ReputationSpend, Rejection> {
    let record = nullifiers.proof(&key).ok_or(Rejection::UnknownProof(key))?;
    let ProofArgs::Reputation(rep) = &record.args else {
        return Err(Rejection::WrongProofKind {
            key,
            found: record.circuit,
            expected: "reputation",
        });
    };
    if nullifiers.is_proof_spent(&key) {
        return Err(Rejection::AlreadySpent(key));
    }
    let requested = attestation.amount().ok_or(Rejection::RepAmountMismatch {
        declared: rep.spend_amount,
        requested: u64::MAX,
    })?;
    if rep.spend_amount != requested {
        return Err(Rejection::RepAmountMismatch {
            declared: rep.spend_amount,
            requested,
        });
    }
    let spent_nullifiers = record.args.nullifiers();
    if let Some(spent) = nullifiers.first_spent(&spent_nullifiers) {
        return Err(Rejection::DuplicateNullifier(spent));
    }
    Ok(ReputationSpend {
        proof: key,
        epoch_key: rep.epoch_key,
        amount: rep.spend_amount,
        nullifiers: spent_nullifiers,
    })
}
