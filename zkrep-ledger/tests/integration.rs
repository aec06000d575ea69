//! End-to-end ledger scenarios: events are encoded as contract logs, decoded
//! and applied in order.

use std::sync::Arc;

use zkrep_common::FieldElement;
use zkrep_ledger::{
    decode_log, Effect, EpochKey, EventPosition, EventProcessor, Identity, LedgerEvent,
    LedgerState, Outcome, ProofKey, ProtocolConfig, UserProjection,
};
use zkrep_test_fixtures::{
    empty_epoch_tree_root, raw_log, sample_identity, sample_identity_n, sample_protocol_config,
    with_invalid_proof, EventFactory, MockVerifier, TransitionProof,
};

struct Ledger {
    processor: EventProcessor,
    state: LedgerState,
    events: EventFactory,
    block: u64,
}

impl Ledger {
    fn new(config: ProtocolConfig) -> Self {
        Self {
            processor: EventProcessor::new(Arc::new(MockVerifier::new()), config.clone()),
            state: LedgerState::new(config.clone()),
            events: EventFactory::new(config),
            block: 0,
        }
    }

    async fn apply(&mut self, event: LedgerEvent) -> Outcome {
        self.block += 1;
        let position = EventPosition {
            block_number: self.block,
            ..Default::default()
        };
        let decoded = decode_log(&raw_log(position, &event)).unwrap();
        assert_eq!(decoded.event, event);
        self.processor.apply(&mut self.state, &decoded).await.unwrap()
    }

    async fn accept(&mut self, event: LedgerEvent) -> Effect {
        match self.apply(event).await {
            Outcome::Accepted(effect) => effect,
            Outcome::Rejected(rejection) => panic!("unexpected rejection: {rejection}"),
        }
    }

    /// Applies `event`, expecting a rejection that leaves the state untouched.
    async fn reject(&mut self, event: LedgerEvent) -> &'static str {
        let before = self.state.clone();
        let outcome = self.apply(event).await;
        assert_eq!(self.state, before, "rejected event mutated state");
        outcome.rejection().expect("event was accepted").code()
    }

    async fn sign_up(&mut self, identity: &Identity, airdrop: u64) -> FieldElement {
        let epoch = self.state.current_epoch();
        let event = self.events.signup(epoch, identity.commitment(), airdrop);
        match self.accept(event).await {
            Effect::SignedUp { gst_root, .. } => gst_root,
            other => panic!("expected sign-up effect, got {other:?}"),
        }
    }

    fn config(&self) -> ProtocolConfig {
        self.events.config().clone()
    }
}

fn key_outside(identity: &Identity, epoch: u64, config: &ProtocolConfig) -> EpochKey {
    let owned = identity.epoch_keys(epoch, config);
    (1..256u64)
        .map(EpochKey::from)
        .find(|key| !owned.contains(key))
        .unwrap()
}

#[tokio::test]
async fn test_airdrop_visible_in_projection() {
    let mut ledger = Ledger::new(sample_protocol_config());
    let alice = sample_identity();
    ledger.sign_up(&alice, 30).await;

    let projection = UserProjection::from_state(alice, &ledger.state);
    assert!(projection.is_signed_up());
    assert_eq!(projection.signup_epoch(), Some(1));
    assert_eq!(projection.reputation(), 30);
    assert!(!projection.needs_transition());
}

#[tokio::test]
async fn test_reputation_proof_spent_once() {
    let config = ProtocolConfig {
        max_reputation_budget: 5,
        ..sample_protocol_config()
    };
    let mut ledger = Ledger::new(config.clone());
    let alice = sample_identity();
    let root = ledger.sign_up(&alice, 30).await;

    let spender = alice.epoch_keys(1, &config)[0];
    let receiver = key_outside(&alice, 1, &config);
    let nullifiers: Vec<FieldElement> = (0..5).map(|n| alice.reputation_nullifier(1, n)).collect();

    let rep = ledger.events.reputation_proof(1, 1, spender, root, &nullifiers, 5);
    ledger.accept(rep).await;
    let target = ledger.events.epoch_key_proof(2, 1, receiver, root);
    ledger.accept(target).await;

    let spend = ledger.events.attestation(1, receiver, 3, 2, 2, Some(1));
    let Effect::Attested { spent, .. } = ledger.accept(spend.clone()).await else {
        panic!("expected attestation effect");
    };
    let spent = spent.expect("spend recorded");
    assert_eq!(spent.amount, 5);
    assert_eq!(spent.epoch_key, spender);
    assert!(ledger.state.nullifiers.is_proof_spent(&ProofKey::epoch(1, 1)));
    assert!(nullifiers.iter().all(|n| ledger.state.nullifiers.is_spent(n)));

    assert_eq!(ledger.reject(spend).await, "ALREADY_SPENT");

    let bucket = ledger
        .state
        .accumulator
        .epoch_tree_bucket(1, &receiver)
        .unwrap();
    assert_eq!((bucket.pos_rep, bucket.neg_rep), (3, 2));

    let projection = UserProjection::from_state(alice, &ledger.state);
    assert_eq!(projection.reputation(), 25);
}

#[tokio::test]
async fn test_spend_amount_must_match_proof() {
    let config = ProtocolConfig {
        max_reputation_budget: 5,
        ..sample_protocol_config()
    };
    let mut ledger = Ledger::new(config.clone());
    let alice = sample_identity();
    let root = ledger.sign_up(&alice, 30).await;
    let spender = alice.epoch_keys(1, &config)[0];
    let receiver = key_outside(&alice, 1, &config);
    let nullifiers: Vec<FieldElement> = (0..5).map(|n| alice.reputation_nullifier(1, n)).collect();

    let rep = ledger.events.reputation_proof(1, 1, spender, root, &nullifiers, 5);
    ledger.accept(rep).await;
    let target = ledger.events.epoch_key_proof(2, 1, receiver, root);
    ledger.accept(target).await;

    let short = ledger.events.attestation(1, receiver, 3, 1, 2, Some(1));
    assert_eq!(ledger.reject(short).await, "REP_AMOUNT_MISMATCH");
    assert!(!ledger.state.nullifiers.is_proof_spent(&ProofKey::epoch(1, 1)));

    let wrong_source = ledger.events.attestation(1, receiver, 3, 2, 2, Some(2));
    assert_eq!(ledger.reject(wrong_source).await, "WRONG_PROOF_KIND");
}

#[tokio::test]
async fn test_transitions_sharing_a_nullifier() {
    let config = sample_protocol_config();
    let mut ledger = Ledger::new(config.clone());
    let alice = sample_identity();
    let root = ledger.sign_up(&alice, 30).await;

    let start_a = ledger.events.start_transition_proof(1, FieldElement::from(11), root);
    ledger.accept(start_a).await;
    let start_b = ledger.events.start_transition_proof(3, FieldElement::from(12), root);
    ledger.accept(start_b).await;
    let Effect::EpochEnded { epoch_tree_root, .. } = ledger.accept(ledger.events.epoch_ended(1)).await
    else {
        panic!("expected epoch end");
    };
    assert_eq!(epoch_tree_root, empty_epoch_tree_root(&config));

    let nullifiers = alice.epoch_key_nullifiers(1, &config);
    let first = TransitionProof {
        new_gst_leaf: FieldElement::from(1001),
        epk_nullifiers: nullifiers.clone(),
        from_epoch: 1,
        blinded_user_states: [FieldElement::from(11), FieldElement::from(21)],
        from_gst_root: root,
        blinded_hash_chains: vec![],
        from_epoch_tree_root: epoch_tree_root,
        linked_proofs: vec![1],
    };
    let second = TransitionProof {
        new_gst_leaf: FieldElement::from(1002),
        epk_nullifiers: vec![nullifiers[0], FieldElement::from(99)],
        blinded_user_states: [FieldElement::from(12), FieldElement::from(22)],
        linked_proofs: vec![3],
        ..first.clone()
    };
    let proof_a = ledger.events.transition_proof(2, &first);
    ledger.accept(proof_a).await;
    let proof_b = ledger.events.transition_proof(4, &second);
    ledger.accept(proof_b).await;

    let transition_a = ledger.events.transition(2, first.new_gst_leaf, 2);
    let Effect::Transitioned { from_epoch, .. } = ledger.accept(transition_a).await else {
        panic!("expected transition effect");
    };
    assert_eq!(from_epoch, 1);
    assert!(ledger.state.nullifiers.is_proof_spent(&ProofKey::transition(1)));

    let transition_b = ledger.events.transition(2, second.new_gst_leaf, 4);
    assert_eq!(ledger.reject(transition_b).await, "DUPLICATE_NULLIFIER");
    assert_eq!(ledger.state.accumulator.gst_leaves(2), &[first.new_gst_leaf]);

    let projection = UserProjection::from_state(alice, &ledger.state);
    assert!(!projection.needs_transition());
    assert_eq!(projection.transitions().len(), 1);
    assert_eq!(projection.transitions()[0].to_epoch, 2);
}

#[tokio::test]
async fn test_transition_proof_must_link_start_proof() {
    let config = sample_protocol_config();
    let mut ledger = Ledger::new(config.clone());
    let alice = sample_identity();
    let root = ledger.sign_up(&alice, 0).await;
    let start = ledger.events.start_transition_proof(1, FieldElement::from(11), root);
    ledger.accept(start).await;
    let process = ledger
        .events
        .process_attestations_proof(2, FieldElement::from(11), FieldElement::from(12));
    ledger.accept(process).await;
    ledger.accept(ledger.events.epoch_ended(1)).await;

    let proof = TransitionProof {
        new_gst_leaf: FieldElement::from(1001),
        epk_nullifiers: alice.epoch_key_nullifiers(1, &config),
        from_epoch: 1,
        blinded_user_states: [FieldElement::from(11), FieldElement::from(12)],
        from_gst_root: root,
        blinded_hash_chains: vec![],
        from_epoch_tree_root: empty_epoch_tree_root(&config),
        linked_proofs: vec![1, 2],
    };

    let unknown = TransitionProof {
        linked_proofs: vec![1, 7],
        ..proof.clone()
    };
    let event = ledger.events.transition_proof(5, &unknown);
    assert_eq!(ledger.reject(event).await, "UNKNOWN_PROOF");

    let reordered = TransitionProof {
        linked_proofs: vec![2, 1],
        ..proof.clone()
    };
    let event = ledger.events.transition_proof(5, &reordered);
    assert_eq!(ledger.reject(event).await, "WRONG_PROOF_KIND");

    let foreign_state = TransitionProof {
        blinded_user_states: [FieldElement::from(13), FieldElement::from(12)],
        ..proof.clone()
    };
    let event = ledger.events.transition_proof(5, &foreign_state);
    assert_eq!(ledger.reject(event).await, "SIGNAL_MISMATCH");

    let stale_tree = TransitionProof {
        from_epoch_tree_root: FieldElement::from(404),
        ..proof.clone()
    };
    let event = ledger.events.transition_proof(5, &stale_tree);
    assert_eq!(ledger.reject(event).await, "UNKNOWN_EPOCH_TREE_ROOT");

    let event = ledger.events.transition_proof(5, &proof);
    ledger.accept(event).await;
}

#[tokio::test]
async fn test_transition_proof_linking_a_record_twice() {
    let config = sample_protocol_config();
    let mut ledger = Ledger::new(config.clone());
    let alice = sample_identity();
    let root = ledger.sign_up(&alice, 0).await;
    let start = ledger.events.start_transition_proof(1, FieldElement::from(11), root);
    ledger.accept(start).await;
    let process = ledger
        .events
        .process_attestations_proof(2, FieldElement::from(11), FieldElement::from(12));
    ledger.accept(process).await;
    ledger.accept(ledger.events.epoch_ended(1)).await;

    let proof = TransitionProof {
        new_gst_leaf: FieldElement::from(1001),
        epk_nullifiers: alice.epoch_key_nullifiers(1, &config),
        from_epoch: 1,
        blinded_user_states: [FieldElement::from(11), FieldElement::from(12)],
        from_gst_root: root,
        blinded_hash_chains: vec![],
        from_epoch_tree_root: empty_epoch_tree_root(&config),
        linked_proofs: vec![1, 2, 2],
    };
    let event = ledger.events.transition_proof(5, &proof);
    assert_eq!(ledger.reject(event).await, "MALFORMED");

    let event = ledger.events.transition(2, proof.new_gst_leaf, 5);
    assert_eq!(ledger.reject(event).await, "UNKNOWN_PROOF");

    let proof = TransitionProof {
        linked_proofs: vec![1, 2],
        ..proof
    };
    ledger.accept(ledger.events.transition_proof(5, &proof)).await;
    ledger.accept(ledger.events.transition(2, proof.new_gst_leaf, 5)).await;
    for index in [1, 2, 5] {
        assert!(ledger.state.nullifiers.is_proof_spent(&ProofKey::transition(index)));
    }
}

#[tokio::test]
async fn test_transitions_sharing_a_process_record() {
    let config = sample_protocol_config();
    let mut ledger = Ledger::new(config.clone());
    let alice = sample_identity();
    let bob = sample_identity_n(1);
    ledger.sign_up(&alice, 0).await;
    let root = ledger.sign_up(&bob, 0).await;

    let start_a = ledger.events.start_transition_proof(1, FieldElement::from(11), root);
    ledger.accept(start_a).await;
    let process = ledger
        .events
        .process_attestations_proof(2, FieldElement::from(11), FieldElement::from(12));
    ledger.accept(process).await;
    let start_b = ledger.events.start_transition_proof(3, FieldElement::from(13), root);
    ledger.accept(start_b).await;
    ledger.accept(ledger.events.epoch_ended(1)).await;

    let first = TransitionProof {
        new_gst_leaf: FieldElement::from(1001),
        epk_nullifiers: alice.epoch_key_nullifiers(1, &config),
        from_epoch: 1,
        blinded_user_states: [FieldElement::from(11), FieldElement::from(12)],
        from_gst_root: root,
        blinded_hash_chains: vec![],
        from_epoch_tree_root: empty_epoch_tree_root(&config),
        linked_proofs: vec![1, 2],
    };
    let second = TransitionProof {
        new_gst_leaf: FieldElement::from(1002),
        epk_nullifiers: bob.epoch_key_nullifiers(1, &config),
        blinded_user_states: [FieldElement::from(13), FieldElement::from(14)],
        linked_proofs: vec![3, 2],
        ..first.clone()
    };
    ledger.accept(ledger.events.transition_proof(5, &first)).await;
    ledger.accept(ledger.events.transition_proof(6, &second)).await;

    ledger.accept(ledger.events.transition(2, first.new_gst_leaf, 5)).await;
    let event = ledger.events.transition(2, second.new_gst_leaf, 6);
    assert_eq!(ledger.reject(event).await, "ALREADY_SPENT");
    assert!(!ledger.state.nullifiers.is_proof_spent(&ProofKey::transition(3)));
    assert_eq!(ledger.state.accumulator.gst_leaves(2), &[first.new_gst_leaf]);
}

#[tokio::test]
async fn test_sealed_epoch_rejects_attestations() {
    let mut ledger = Ledger::new(sample_protocol_config());
    let alice = sample_identity();
    let root = ledger.sign_up(&alice, 0).await;
    let key = alice.epoch_keys(1, &ledger.config())[0];
    let proof = ledger.events.epoch_key_proof(1, 1, key, root);
    ledger.accept(proof).await;

    for epoch in 1..=5 {
        ledger.accept(ledger.events.epoch_ended(epoch)).await;
    }
    assert_eq!(ledger.state.current_epoch(), 6);

    let late = ledger.events.attestation(5, key, 1, 0, 1, None);
    assert_eq!(ledger.reject(late).await, "EPOCH_SEALED");
    let older = ledger.events.attestation(1, key, 1, 0, 1, None);
    assert_eq!(ledger.reject(older).await, "EPOCH_SEALED");
    let replayed_end = ledger.events.epoch_ended(5);
    assert_eq!(ledger.reject(replayed_end).await, "EPOCH_MISMATCH");
    let stale_signup = ledger.events.signup(5, sample_identity_n(1).commitment(), 0);
    assert_eq!(ledger.reject(stale_signup).await, "EPOCH_MISMATCH");
}

#[tokio::test]
async fn test_proofs_gated_on_known_roots() {
    let mut ledger = Ledger::new(sample_protocol_config());
    let alice = sample_identity();
    let config = ledger.config();
    let epoch_one_root = ledger.sign_up(&alice, 0).await;
    ledger.accept(ledger.events.epoch_ended(1)).await;

    let key = alice.epoch_keys(2, &config)[0];
    let stale = ledger.events.epoch_key_proof(1, 2, key, epoch_one_root);
    assert_eq!(ledger.reject(stale).await, "UNKNOWN_ROOT");

    let bob = sample_identity_n(2);
    let epoch_two_root = ledger.sign_up(&bob, 0).await;
    let invalid = with_invalid_proof(ledger.events.epoch_key_proof(1, 2, key, epoch_two_root));
    assert_eq!(ledger.reject(invalid).await, "INVALID_PROOF");

    let valid = ledger.events.epoch_key_proof(1, 2, key, epoch_two_root);
    ledger.accept(valid).await;
    assert!(ledger.state.nullifiers.proof(&ProofKey::epoch(2, 1)).is_some());
}

#[tokio::test]
async fn test_attested_reputation_is_conserved() {
    let mut ledger = Ledger::new(sample_protocol_config());
    let config = ledger.config();
    let mut root = FieldElement::zero();
    for n in 0..3 {
        root = ledger.sign_up(&sample_identity_n(n), 10).await;
    }

    let keys: Vec<EpochKey> = (0..3)
        .map(|n| sample_identity_n(n).epoch_keys(1, &config)[0])
        .collect();
    for (index, key) in keys.iter().enumerate() {
        let proof = ledger.events.epoch_key_proof(index as u64 + 1, 1, *key, root);
        ledger.accept(proof).await;
    }

    let mut accepted = (0u128, 0u128);
    let attestations = [(0usize, 4, 1, 1), (1, 2, 0, 2), (2, 0, 3, 3), (0, 5, 5, 1)];
    for (key_index, pos, neg, proof_index) in attestations {
        let event = ledger
            .events
            .attestation(1, keys[key_index], pos, neg, proof_index, None);
        ledger.accept(event).await;
        accepted.0 += pos as u128;
        accepted.1 += neg as u128;
    }

    let unknown_target = ledger.events.attestation(1, keys[0], 100, 0, 9, None);
    assert_eq!(ledger.reject(unknown_target).await, "UNKNOWN_PROOF");
    let mismatched = ledger.events.attestation(1, keys[1], 100, 0, 1, None);
    if keys[1] != keys[0] {
        assert_eq!(ledger.reject(mismatched).await, "EPOCH_KEY_MISMATCH");
    }

    let totals = ledger
        .state
        .accumulator
        .epoch_keys(1)
        .iter()
        .filter_map(|key| ledger.state.accumulator.epoch_tree_bucket(1, key))
        .fold((0u128, 0u128), |acc, bucket| {
            (acc.0 + bucket.pos_rep, acc.1 + bucket.neg_rep)
        });
    assert_eq!(totals, accepted);
}
