//! Ledger state for the zkrep reputation synchronizer.
//!
//! Holds the per-epoch accumulators (global state trees and epoch trees),
//! the nullifier ledger, the on-chain event schema and the rules that apply
//! one decoded event to that state.

pub mod accumulator;
pub mod error;
pub mod events;
pub mod identity;
pub mod nullifier;
pub mod processor;
pub mod projection;
pub mod signals;
pub mod tree;
pub mod types;
pub mod verifier;

pub use accumulator::{AccumulatorState, EpochState, EpochTreeBucket, SignUpRecord};
pub use error::{LedgerError, Rejection};
pub use events::{decode_log, DecodeError, DecodedEvent, EventKind, EventPosition, LedgerEvent, RawLog};
pub use identity::Identity;
pub use nullifier::{NullifierLedger, ValidProofRecord};
pub use processor::{Effect, EventProcessor, LedgerState, Outcome, ReputationSpend};
pub use projection::{TransitionRecord, UserProjection};
pub use signals::ProofArgs;
pub use types::{
    Attestation, AttestationKind, Epoch, EpochKey, ProofIndex, ProofKey, ProtocolConfig, SnarkProof,
    GENESIS_EPOCH,
};
pub use verifier::{CircuitTag, ProofVerifier, VerifierError};
