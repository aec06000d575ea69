//! Error taxonomy for ledger state transitions.
//!
//! [`Rejection`] covers adversarial or stale input: the event is logged and
//! discarded and the cursor still advances. [`LedgerError`] covers failures
//! that must not be skipped.

use thiserror::Error;
use zkrep_common::FieldElement;

use crate::types::{Epoch, EpochKey, ProofKey};
use crate::verifier::CircuitTag;

/// Reasons an event is discarded without mutating ledger state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Rejection {
    /// The verifier returned false for a well-formed proof.
    #[error("proof failed verification for circuit {circuit}")]
    InvalidProof { circuit: CircuitTag },

    /// The proof cites a global state tree root never recorded for its epoch.
    #[error("global state tree root {root} was never recorded for epoch {}", epoch_label(.epoch))]
    UnknownRoot {
        root: FieldElement,
        epoch: Option<Epoch>,
    },

    /// The proof cites an epoch tree root that is not the sealed root of its epoch.
    #[error("epoch tree root {root} does not match sealed epoch {epoch}")]
    UnknownEpochTreeRoot { root: FieldElement, epoch: Epoch },

    #[error("nullifier {0} already spent")]
    DuplicateNullifier(FieldElement),

    #[error("proof {0} already spent")]
    AlreadySpent(ProofKey),

    #[error("reputation proof declares {declared} but attestation moves {requested}")]
    RepAmountMismatch { declared: u64, requested: u64 },

    #[error("no valid proof recorded at {0}")]
    UnknownProof(ProofKey),

    #[error("proof {key} is a {found} proof, expected {expected}")]
    WrongProofKind {
        key: ProofKey,
        found: CircuitTag,
        expected: &'static str,
    },

    #[error("identity commitment {0} already signed up")]
    AlreadySignedUp(FieldElement),

    #[error("epoch {0} is sealed")]
    EpochSealed(Epoch),

    #[error("event epoch {event} does not match epoch {current}")]
    EpochMismatch { event: Epoch, current: Epoch },

    #[error("proof epoch key {proof} does not match event epoch key {event}")]
    EpochKeyMismatch { proof: EpochKey, event: EpochKey },

    #[error("transitioned leaf {event} does not match proven leaf {proof}")]
    LeafMismatch {
        event: FieldElement,
        proof: FieldElement,
    },

    #[error("public signals disagree with event: {0}")]
    SignalMismatch(String),

    #[error("proof {0} already recorded")]
    DuplicateProofIndex(ProofKey),

    #[error("malformed event: {0}")]
    Malformed(String),
}

fn epoch_label(epoch: &Option<Epoch>) -> String {
    match epoch {
        Some(epoch) => epoch.to_string(),
        None => "any".to_string(),
    }
}

impl Rejection {
    /// Machine-readable rejection code.
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::InvalidProof { .. } => "INVALID_PROOF",
            Rejection::UnknownRoot { .. } => "UNKNOWN_ROOT",
            Rejection::UnknownEpochTreeRoot { .. } => "UNKNOWN_EPOCH_TREE_ROOT",
            Rejection::DuplicateNullifier(_) => "DUPLICATE_NULLIFIER",
            Rejection::AlreadySpent(_) => "ALREADY_SPENT",
            Rejection::RepAmountMismatch { .. } => "REP_AMOUNT_MISMATCH",
            Rejection::UnknownProof(_) => "UNKNOWN_PROOF",
            Rejection::WrongProofKind { .. } => "WRONG_PROOF_KIND",
            Rejection::AlreadySignedUp(_) => "ALREADY_SIGNED_UP",
            Rejection::EpochSealed(_) => "EPOCH_SEALED",
            Rejection::EpochMismatch { .. } => "EPOCH_MISMATCH",
            Rejection::EpochKeyMismatch { .. } => "EPOCH_KEY_MISMATCH",
            Rejection::LeafMismatch { .. } => "LEAF_MISMATCH",
            Rejection::SignalMismatch(_) => "SIGNAL_MISMATCH",
            Rejection::DuplicateProofIndex(_) => "DUPLICATE_PROOF_INDEX",
            Rejection::Malformed(_) => "MALFORMED",
        }
    }

    /// Whether the rejection stems from stale or foreign tree state rather
    /// than from the proof itself.
    pub fn is_stale_state(&self) -> bool {
        matches!(
            self,
            Rejection::UnknownRoot { .. } | Rejection::UnknownEpochTreeRoot { .. }
        )
    }
}

/// Failures that abort the batch being applied.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    /// A nullifier reached `mark_spent` twice. Indicates a verification bug.
    #[error("nullifier {0} marked spent twice")]
    DoubleSpend(FieldElement),

    #[error("proof {0} marked spent twice")]
    ProofAlreadySpent(ProofKey),

    #[error("proof {0} recorded twice")]
    ProofAlreadyRecorded(ProofKey),

    #[error("global state tree for epoch {epoch} is full (depth {depth})")]
    TreeFull { epoch: Epoch, depth: u32 },

    #[error("no accumulator for epoch {0}")]
    UnknownEpoch(Epoch),

    #[error("write to sealed epoch {0}")]
    SealedEpochWrite(Epoch),

    #[error("epoch key {0} outside epoch tree")]
    EpochKeyOutOfRange(EpochKey),

    /// The proof verifier could not be reached. The batch may be retried.
    #[error("proof verifier unavailable: {0}")]
    Verifier(String),
}

impl LedgerError {
    /// Fatal errors stop the synchronizer; the rest leave state untouched and can be retried.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, LedgerError::Verifier(_))
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            LedgerError::DoubleSpend(_) => "DOUBLE_SPEND",
            LedgerError::ProofAlreadySpent(_) => "PROOF_ALREADY_SPENT",
            LedgerError::ProofAlreadyRecorded(_) => "PROOF_ALREADY_RECORDED",
            LedgerError::TreeFull { .. } => "TREE_FULL",
            LedgerError::UnknownEpoch(_) => "UNKNOWN_EPOCH",
            LedgerError::SealedEpochWrite(_) => "SEALED_EPOCH_WRITE",
            LedgerError::EpochKeyOutOfRange(_) => "EPOCH_KEY_OUT_OF_RANGE",
            LedgerError::Verifier(_) => "VERIFIER_UNAVAILABLE",
        }
    }
}
