//! Shared collaborators and event builders for zkrep integration tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use ethers::types::Address;
use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use tokio::sync::watch;
use zkrep_common::FieldElement;
use zkrep_ledger::events::{AttestationEvent, ProofEvent};
use zkrep_ledger::tree::{sparse_merkle_root, IncrementalMerkleTree};
use zkrep_ledger::{
    Attestation, AttestationKind, CircuitTag, Epoch, EpochKey, EventPosition, Identity,
    LedgerEvent, ProofIndex, ProofVerifier, ProtocolConfig, RawLog, SnarkProof, VerifierError,
};
use zkrep_sync::{EventSource, Scheduler, SourceError};

/// First proof element that makes [`MockVerifier`] answer `false`.
pub const INVALID_PROOF_MARKER: u64 = 0xbad;

static SAMPLE_IDENTITY: Lazy<Identity> =
    Lazy::new(|| Identity::new(FieldElement::from(1_234_567), FieldElement::from(7_654_321)));

pub fn sample_identity() -> Identity {
    SAMPLE_IDENTITY.clone()
}

/// Deterministic identity number `n`.
pub fn sample_identity_n(n: u64) -> Identity {
    Identity::new(
        FieldElement::from(1_000_000 + n),
        FieldElement::from(2_000_000 + n),
    )
}

/// Small trees keep tests fast.
pub fn sample_protocol_config() -> ProtocolConfig {
    ProtocolConfig {
        gst_depth: 8,
        epoch_tree_depth: 8,
        keys_per_epoch: 2,
        max_reputation_budget: 3,
    }
}

pub fn valid_proof() -> SnarkProof {
    SnarkProof(std::array::from_fn(|i| FieldElement::from(i as u64 + 1)))
}

pub fn invalid_proof() -> SnarkProof {
    let mut proof = valid_proof();
    proof.0[0] = FieldElement::from(INVALID_PROOF_MARKER);
    proof
}

/// GST root after inserting `leaves` into an empty tree.
pub fn gst_root(config: &ProtocolConfig, leaves: &[FieldElement]) -> FieldElement {
    let mut tree = IncrementalMerkleTree::new(config.gst_depth);
    let mut root = tree.root();
    for leaf in leaves {
        root = tree.insert(*leaf).expect("sample tree overflow");
    }
    root
}

/// Sealed root of an epoch in which no epoch key received attestations.
pub fn empty_epoch_tree_root(config: &ProtocolConfig) -> FieldElement {
    sparse_merkle_root(config.epoch_tree_depth, &BTreeMap::new())
}

// ============================================================================
// Event builders
// ============================================================================

/// Signals of a user-state-transition proof; short vectors are zero padded.
#[derive(Clone, Debug, Default)]
pub struct TransitionProof {
    pub new_gst_leaf: FieldElement,
    pub epk_nullifiers: Vec<FieldElement>,
    pub from_epoch: Epoch,
    pub blinded_user_states: [FieldElement; 2],
    pub from_gst_root: FieldElement,
    pub blinded_hash_chains: Vec<FieldElement>,
    pub from_epoch_tree_root: FieldElement,
    pub linked_proofs: Vec<ProofIndex>,
}

/// Builds contract events with public signals laid out for `config`.
#[derive(Clone, Debug)]
pub struct EventFactory {
    config: ProtocolConfig,
    attester: Address,
}

impl EventFactory {
    pub fn new(config: ProtocolConfig) -> Self {
        Self {
            config,
            attester: Address::repeat_byte(0xa7),
        }
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn attester(&self) -> Address {
        self.attester
    }

    pub fn signup(&self, epoch: Epoch, commitment: FieldElement, airdrop: u64) -> LedgerEvent {
        LedgerEvent::UserSignedUp {
            epoch,
            identity_commitment: commitment,
            attester_id: 1,
            airdrop,
        }
    }

    pub fn epoch_key_proof(
        &self,
        index: ProofIndex,
        epoch: Epoch,
        key: EpochKey,
        gst_root: FieldElement,
    ) -> LedgerEvent {
        proof_event(
            CircuitTag::VerifyEpochKey,
            index,
            Some((epoch, key)),
            vec![gst_root, FieldElement::from(epoch), *key.as_field()],
            vec![],
        )
    }

    pub fn reputation_proof(
        &self,
        index: ProofIndex,
        epoch: Epoch,
        key: EpochKey,
        gst_root: FieldElement,
        nullifiers: &[FieldElement],
        amount: u64,
    ) -> LedgerEvent {
        let mut signals = padded(nullifiers, self.config.max_reputation_budget as usize);
        signals.extend([
            FieldElement::from(epoch),
            *key.as_field(),
            gst_root,
            FieldElement::from(1),
            FieldElement::from(amount),
            FieldElement::zero(),
            FieldElement::zero(),
            FieldElement::zero(),
        ]);
        proof_event(
            CircuitTag::ProveReputation,
            index,
            Some((epoch, key)),
            signals,
            vec![],
        )
    }

    pub fn signup_proof(
        &self,
        index: ProofIndex,
        epoch: Epoch,
        key: EpochKey,
        gst_root: FieldElement,
    ) -> LedgerEvent {
        proof_event(
            CircuitTag::ProveUserSignUp,
            index,
            Some((epoch, key)),
            vec![
                FieldElement::from(epoch),
                *key.as_field(),
                gst_root,
                FieldElement::from(1),
                FieldElement::one(),
            ],
            vec![],
        )
    }

    pub fn start_transition_proof(
        &self,
        index: ProofIndex,
        blinded_user_state: FieldElement,
        gst_root: FieldElement,
    ) -> LedgerEvent {
        proof_event(
            CircuitTag::StartTransition,
            index,
            None,
            vec![blinded_user_state, FieldElement::from(index), gst_root],
            vec![],
        )
    }

    pub fn process_attestations_proof(
        &self,
        index: ProofIndex,
        input_blinded_user_state: FieldElement,
        output_blinded_user_state: FieldElement,
    ) -> LedgerEvent {
        proof_event(
            CircuitTag::ProcessAttestations,
            index,
            None,
            vec![
                output_blinded_user_state,
                FieldElement::from(index),
                input_blinded_user_state,
            ],
            vec![],
        )
    }

    pub fn transition_proof(&self, index: ProofIndex, proof: &TransitionProof) -> LedgerEvent {
        let keys = self.config.keys_per_epoch as usize;
        let mut signals = vec![proof.new_gst_leaf];
        signals.extend(padded(&proof.epk_nullifiers, keys));
        signals.push(FieldElement::from(proof.from_epoch));
        signals.extend(proof.blinded_user_states);
        signals.push(proof.from_gst_root);
        signals.extend(padded(&proof.blinded_hash_chains, keys));
        signals.push(proof.from_epoch_tree_root);
        proof_event(
            CircuitTag::UserStateTransition,
            index,
            None,
            signals,
            proof.linked_proofs.clone(),
        )
    }

    pub fn attestation(
        &self,
        epoch: Epoch,
        key: EpochKey,
        pos_rep: u64,
        neg_rep: u64,
        to_proof_index: ProofIndex,
        from_proof_index: Option<ProofIndex>,
    ) -> LedgerEvent {
        let kind = if from_proof_index.is_some() {
            AttestationKind::SpendReputation
        } else {
            AttestationKind::SendAttestation
        };
        LedgerEvent::AttestationSubmitted(AttestationEvent {
            epoch,
            epoch_key: key,
            attester: self.attester,
            kind,
            attestation: Attestation {
                attester_id: 1,
                pos_rep,
                neg_rep,
                graffiti: FieldElement::zero(),
                sign_up: false,
            },
            to_proof_index,
            from_proof_index,
        })
    }

    pub fn transition(&self, epoch: Epoch, leaf: FieldElement, proof_index: ProofIndex) -> LedgerEvent {
        LedgerEvent::UserStateTransitioned {
            epoch,
            hashed_leaf: leaf,
            proof_index,
        }
    }

    pub fn epoch_ended(&self, epoch: Epoch) -> LedgerEvent {
        LedgerEvent::EpochEnded { epoch }
    }
}

fn padded(values: &[FieldElement], len: usize) -> Vec<FieldElement> {
    let mut out = values.to_vec();
    out.resize(len.max(values.len()), FieldElement::zero());
    out
}

fn proof_event(
    circuit: CircuitTag,
    proof_index: ProofIndex,
    scope: Option<(Epoch, EpochKey)>,
    public_signals: Vec<FieldElement>,
    linked_proofs: Vec<ProofIndex>,
) -> LedgerEvent {
    LedgerEvent::Proof(ProofEvent {
        circuit,
        proof_index,
        epoch: scope.map(|(epoch, _)| epoch),
        epoch_key: scope.map(|(_, key)| key),
        public_signals,
        proof: valid_proof(),
        linked_proofs,
    })
}

/// Replaces the proof of a proof event with one [`MockVerifier`] rejects.
pub fn with_invalid_proof(event: LedgerEvent) -> LedgerEvent {
    match event {
        LedgerEvent::Proof(mut proof) => {
            proof.proof = invalid_proof();
            LedgerEvent::Proof(proof)
        }
        other => other,
    }
}

pub fn raw_log(position: EventPosition, event: &LedgerEvent) -> RawLog {
    let (topics, data) = event.encode();
    RawLog {
        block_number: position.block_number,
        transaction_index: position.transaction_index,
        log_index: position.log_index,
        topics,
        data,
    }
}

/// Assigns canonical positions to events as they are appended.
#[derive(Clone, Debug, Default)]
pub struct LogSequence {
    logs: Vec<RawLog>,
    block: u64,
    next_tx: u64,
}

impl LogSequence {
    pub fn starting_at(block: u64) -> Self {
        Self {
            logs: Vec::new(),
            block,
            next_tx: 0,
        }
    }

    /// Moves to `block`; later pushes land there.
    pub fn at_block(&mut self, block: u64) -> &mut Self {
        if block != self.block {
            self.block = block;
            self.next_tx = 0;
        }
        self
    }

    pub fn push(&mut self, event: LedgerEvent) -> EventPosition {
        let position = EventPosition {
            block_number: self.block,
            transaction_index: self.next_tx,
            log_index: 0,
        };
        self.next_tx += 1;
        self.logs.push(raw_log(position, &event));
        position
    }

    pub fn block(&self) -> u64 {
        self.block
    }

    pub fn logs(&self) -> &[RawLog] {
        &self.logs
    }

    pub fn into_logs(self) -> Vec<RawLog> {
        self.logs
    }
}

// ============================================================================
// Mock collaborators
// ============================================================================

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Verifier that accepts every proof except those marked by [`invalid_proof`].
#[derive(Debug, Default)]
pub struct MockVerifier {
    calls: AtomicUsize,
    outages: AtomicU32,
}

impl MockVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` calls fail with a transport error.
    pub fn fail_next(&self, n: u32) {
        self.outages.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProofVerifier for MockVerifier {
    async fn verify(
        &self,
        _circuit: CircuitTag,
        _public_signals: &[FieldElement],
        proof: &SnarkProof,
    ) -> Result<bool, VerifierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.outages) {
            return Err(VerifierError::Transport("injected verifier outage".into()));
        }
        Ok(proof.elements()[0] != FieldElement::from(INVALID_PROOF_MARKER))
    }
}

/// In-memory event log with an adjustable head and injectable failures.
pub struct MockEventSource {
    logs: Mutex<Vec<RawLog>>,
    head: AtomicU64,
    fetch_failures: AtomicU32,
    head_failures: AtomicU32,
    shuffle: AtomicBool,
    fetches: Mutex<Vec<(u64, u64)>>,
    blocks: watch::Sender<u64>,
}

impl Default for MockEventSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEventSource {
    pub fn new() -> Self {
        let (blocks, _) = watch::channel(0);
        Self {
            logs: Mutex::new(Vec::new()),
            head: AtomicU64::new(0),
            fetch_failures: AtomicU32::new(0),
            head_failures: AtomicU32::new(0),
            shuffle: AtomicBool::new(false),
            fetches: Mutex::new(Vec::new()),
            blocks,
        }
    }

    /// Source holding `logs` with the head at the highest log block.
    pub fn with_logs(logs: Vec<RawLog>) -> Self {
        let source = Self::new();
        let head = logs.iter().map(|log| log.block_number).max().unwrap_or(0);
        source.push_logs(logs);
        source.set_head(head);
        source
    }

    pub fn push_logs(&self, logs: impl IntoIterator<Item = RawLog>) {
        lock(&self.logs).extend(logs);
    }

    /// Moves the head and notifies new-block subscribers.
    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
        self.blocks.send_replace(head);
    }

    pub fn fail_next_fetches(&self, n: u32) {
        self.fetch_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_heads(&self, n: u32) {
        self.head_failures.store(n, Ordering::SeqCst);
    }

    /// Return logs in random order.
    pub fn shuffle_results(&self, shuffle: bool) {
        self.shuffle.store(shuffle, Ordering::SeqCst);
    }

    /// Block ranges successfully fetched so far.
    pub fn fetches(&self) -> Vec<(u64, u64)> {
        lock(&self.fetches).clone()
    }

    fn logs_in_range(&self, from_block: u64, to_block: u64) -> Vec<RawLog> {
        let mut logs: Vec<RawLog> = lock(&self.logs)
            .iter()
            .filter(|log| (from_block..=to_block).contains(&log.block_number))
            .cloned()
            .collect();
        if self.shuffle.load(Ordering::SeqCst) {
            logs.shuffle(&mut rand::thread_rng());
        }
        logs
    }
}

#[async_trait]
impl EventSource for MockEventSource {
    async fn fetch_events(&self, from_block: u64, to_block: u64) -> Result<Vec<RawLog>, SourceError> {
        if take_one(&self.fetch_failures) {
            return Err(SourceError::Rpc("injected fetch failure".into()));
        }
        let logs = self.logs_in_range(from_block, to_block);
        lock(&self.fetches).push((from_block, to_block));
        Ok(logs)
    }

    async fn current_block(&self) -> Result<u64, SourceError> {
        if take_one(&self.head_failures) {
            return Err(SourceError::Rpc("injected head failure".into()));
        }
        Ok(self.head.load(Ordering::SeqCst))
    }

    fn new_blocks(&self) -> Option<watch::Receiver<u64>> {
        Some(self.blocks.subscribe())
    }
}

/// Scheduler that never waits on the wall clock.
#[derive(Debug, Default)]
pub struct InstantScheduler {
    sleeps: AtomicUsize,
    requested_ms: AtomicU64,
}

impl InstantScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleeps(&self) -> usize {
        self.sleeps.load(Ordering::SeqCst)
    }

    /// Sum of all requested sleep durations.
    pub fn requested(&self) -> Duration {
        Duration::from_millis(self.requested_ms.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl Scheduler for InstantScheduler {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.fetch_add(1, Ordering::SeqCst);
        self.requested_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
        tokio::task::yield_now().await;
    }
}
