//! Event schema of the reputation ledger contract.
//!
//! Logs are decoded once, at the source boundary, into the closed
//! [`LedgerEvent`] sum type. The first topic of every log is the keccak hash
//! of the event signature; an unrecognized first topic means the contract
//! speaks a schema this build does not understand and is fatal.

use std::collections::HashMap;

use ethers::{
    abi::{self, ParamType, Token},
    types::{Address, Bytes, H256, U256},
    utils::keccak256,
};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zkrep_common::FieldElement;

use crate::types::{Attestation, AttestationKind, Epoch, EpochKey, ProofIndex, SnarkProof};
use crate::verifier::CircuitTag;

// ============================================================================
// Raw logs
// ============================================================================

/// Canonical total order of events: `(block, transaction, log)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPosition {
    pub block_number: u64,
    pub transaction_index: u64,
    pub log_index: u64,
}

/// A log as returned by an event source, before decoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawLog {
    pub block_number: u64,
    pub transaction_index: u64,
    pub log_index: u64,
    pub topics: Vec<H256>,
    pub data: Bytes,
}

impl RawLog {
    pub fn position(&self) -> EventPosition {
        EventPosition {
            block_number: self.block_number,
            transaction_index: self.transaction_index,
            log_index: self.log_index,
        }
    }
}

// ============================================================================
// Event kinds and topics
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    UserSignedUp,
    UserStateTransitioned,
    AttestationSubmitted,
    EpochEnded,
    IndexedEpochKeyProof,
    IndexedReputationProof,
    IndexedUserSignedUpProof,
    IndexedStartedTransitionProof,
    IndexedProcessedAttestationsProof,
    IndexedUserStateTransitionProof,
}

static TOPICS: Lazy<HashMap<H256, EventKind>> = Lazy::new(|| {
    EventKind::ALL
        .iter()
        .map(|kind| (kind.topic(), *kind))
        .collect()
});

impl EventKind {
    pub const ALL: [EventKind; 10] = [
        EventKind::UserSignedUp,
        EventKind::UserStateTransitioned,
        EventKind::AttestationSubmitted,
        EventKind::EpochEnded,
        EventKind::IndexedEpochKeyProof,
        EventKind::IndexedReputationProof,
        EventKind::IndexedUserSignedUpProof,
        EventKind::IndexedStartedTransitionProof,
        EventKind::IndexedProcessedAttestationsProof,
        EventKind::IndexedUserStateTransitionProof,
    ];

    pub fn signature(&self) -> &'static str {
        match self {
            EventKind::UserSignedUp => "UserSignedUp(uint256,uint256,uint256,uint256)",
            EventKind::UserStateTransitioned => "UserStateTransitioned(uint256,uint256,uint256)",
            EventKind::AttestationSubmitted => {
                "AttestationSubmitted(uint256,uint256,address,uint8,(uint256,uint256,uint256,uint256,uint256),uint256,uint256)"
            }
            EventKind::EpochEnded => "EpochEnded(uint256)",
            EventKind::IndexedEpochKeyProof => {
                "IndexedEpochKeyProof(uint256,uint256,uint256,uint256[],uint256[8])"
            }
            EventKind::IndexedReputationProof => {
                "IndexedReputationProof(uint256,uint256,uint256,uint256[],uint256[8])"
            }
            EventKind::IndexedUserSignedUpProof => {
                "IndexedUserSignedUpProof(uint256,uint256,uint256,uint256[],uint256[8])"
            }
            EventKind::IndexedStartedTransitionProof => {
                "IndexedStartedTransitionProof(uint256,uint256[],uint256[8])"
            }
            EventKind::IndexedProcessedAttestationsProof => {
                "IndexedProcessedAttestationsProof(uint256,uint256[],uint256[8])"
            }
            EventKind::IndexedUserStateTransitionProof => {
                "IndexedUserStateTransitionProof(uint256,uint256[],uint256[8],uint256[])"
            }
        }
    }

    pub fn name(&self) -> &'static str {
        let signature = self.signature();
        &signature[..signature.find('(').unwrap_or(signature.len())]
    }

    pub fn topic(&self) -> H256 {
        H256::from(keccak256(self.signature()))
    }

    pub fn from_topic(topic: &H256) -> Option<Self> {
        TOPICS.get(topic).copied()
    }

    pub fn circuit(&self) -> Option<CircuitTag> {
        match self {
            EventKind::IndexedEpochKeyProof => Some(CircuitTag::VerifyEpochKey),
            EventKind::IndexedReputationProof => Some(CircuitTag::ProveReputation),
            EventKind::IndexedUserSignedUpProof => Some(CircuitTag::ProveUserSignUp),
            EventKind::IndexedStartedTransitionProof => Some(CircuitTag::StartTransition),
            EventKind::IndexedProcessedAttestationsProof => Some(CircuitTag::ProcessAttestations),
            EventKind::IndexedUserStateTransitionProof => Some(CircuitTag::UserStateTransition),
            _ => None,
        }
    }

    pub fn for_circuit(circuit: CircuitTag) -> Self {
        match circuit {
            CircuitTag::VerifyEpochKey => EventKind::IndexedEpochKeyProof,
            CircuitTag::ProveReputation => EventKind::IndexedReputationProof,
            CircuitTag::ProveUserSignUp => EventKind::IndexedUserSignedUpProof,
            CircuitTag::StartTransition => EventKind::IndexedStartedTransitionProof,
            CircuitTag::ProcessAttestations => EventKind::IndexedProcessedAttestationsProof,
            CircuitTag::UserStateTransition => EventKind::IndexedUserStateTransitionProof,
        }
    }

    fn indexed_count(&self) -> usize {
        match self {
            EventKind::UserSignedUp | EventKind::UserStateTransitioned => 2,
            EventKind::AttestationSubmitted => 3,
            EventKind::EpochEnded => 1,
            EventKind::IndexedEpochKeyProof
            | EventKind::IndexedReputationProof
            | EventKind::IndexedUserSignedUpProof => 3,
            EventKind::IndexedStartedTransitionProof
            | EventKind::IndexedProcessedAttestationsProof
            | EventKind::IndexedUserStateTransitionProof => 1,
        }
    }

    fn data_layout(&self) -> Vec<ParamType> {
        let signals = ParamType::Array(Box::new(ParamType::Uint(256)));
        let proof = ParamType::FixedArray(Box::new(ParamType::Uint(256)), 8);
        match self {
            EventKind::UserSignedUp => vec![ParamType::Uint(256), ParamType::Uint(256)],
            EventKind::UserStateTransitioned => vec![ParamType::Uint(256)],
            EventKind::AttestationSubmitted => vec![
                ParamType::Uint(8),
                ParamType::Tuple(vec![ParamType::Uint(256); 5]),
                ParamType::Uint(256),
                ParamType::Uint(256),
            ],
            EventKind::EpochEnded => vec![],
            EventKind::IndexedUserStateTransitionProof => vec![
                signals,
                proof,
                ParamType::Array(Box::new(ParamType::Uint(256))),
            ],
            _ => vec![signals, proof],
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Decoded events
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttestationEvent {
    pub epoch: Epoch,
    pub epoch_key: EpochKey,
    pub attester: Address,
    pub kind: AttestationKind,
    pub attestation: Attestation,
    pub to_proof_index: ProofIndex,
    /// Reputation proof funding the attestation, if any.
    pub from_proof_index: Option<ProofIndex>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProofEvent {
    pub circuit: CircuitTag,
    pub proof_index: ProofIndex,
    /// Indexed epoch of epoch-scoped proofs.
    pub epoch: Option<Epoch>,
    /// Indexed epoch key of epoch-scoped proofs.
    pub epoch_key: Option<EpochKey>,
    pub public_signals: Vec<FieldElement>,
    pub proof: SnarkProof,
    /// Proof indices a user-state-transition proof builds on.
    pub linked_proofs: Vec<ProofIndex>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LedgerEvent {
    UserSignedUp {
        epoch: Epoch,
        identity_commitment: FieldElement,
        attester_id: u64,
        airdrop: u64,
    },
    UserStateTransitioned {
        epoch: Epoch,
        hashed_leaf: FieldElement,
        proof_index: ProofIndex,
    },
    AttestationSubmitted(AttestationEvent),
    EpochEnded {
        epoch: Epoch,
    },
    Proof(ProofEvent),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedEvent {
    pub position: EventPosition,
    pub event: LedgerEvent,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unrecognized event topic {0:?}")]
    UnknownTopic(H256),

    #[error("log carries no topics")]
    MissingTopic,

    #[error("malformed {kind} event: {reason}")]
    Malformed { kind: EventKind, reason: String },
}

impl DecodeError {
    /// Schema mismatches are fatal; a malformed payload of a known event is skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DecodeError::UnknownTopic(_) | DecodeError::MissingTopic)
    }
}

/// Decodes one raw log.
pub fn decode_log(log: &RawLog) -> Result<DecodedEvent, DecodeError> {
    let topic = log.topics.first().ok_or(DecodeError::MissingTopic)?;
    let kind = EventKind::from_topic(topic).ok_or(DecodeError::UnknownTopic(*topic))?;
    let event = LedgerEvent::decode(kind, &log.topics[1..], log.data.as_ref())
        .map_err(|reason| DecodeError::Malformed { kind, reason })?;
    Ok(DecodedEvent {
        position: log.position(),
        event,
    })
}

fn word(value: U256) -> H256 {
    let mut bytes = [0u8; 32];
    value.to_big_endian(&mut bytes);
    H256(bytes)
}

fn address_word(address: Address) -> H256 {
    let mut bytes = [0u8; 32];
    bytes[12..].copy_from_slice(address.as_bytes());
    H256(bytes)
}

fn small(value: U256, name: &str) -> Result<u64, String> {
    FieldElement::from_u256(value)
        .to_u64()
        .ok_or_else(|| format!("{name} does not fit in 64 bits"))
}

struct Topics<'a>(&'a [H256]);

impl Topics<'_> {
    fn uint(&self, index: usize) -> U256 {
        U256::from_big_endian(self.0[index].as_bytes())
    }

    fn field(&self, index: usize) -> FieldElement {
        FieldElement::from_u256(self.uint(index))
    }

    fn u64(&self, index: usize, name: &str) -> Result<u64, String> {
        small(self.uint(index), name)
    }

    fn address(&self, index: usize) -> Address {
        Address::from_slice(&self.0[index].as_bytes()[12..])
    }
}

struct Tokens(std::vec::IntoIter<Token>);

impl Tokens {
    fn next(&mut self) -> Result<Token, String> {
        self.0.next().ok_or_else(|| "missing data field".to_string())
    }

    fn uint(&mut self) -> Result<U256, String> {
        self.next()?
            .into_uint()
            .ok_or_else(|| "expected uint".to_string())
    }

    fn u64(&mut self, name: &str) -> Result<u64, String> {
        small(self.uint()?, name)
    }

    fn fields(&mut self) -> Result<Vec<FieldElement>, String> {
        let token = self.next()?;
        let items = match token {
            Token::Array(items) | Token::FixedArray(items) => items,
            _ => return Err("expected uint array".into()),
        };
        items
            .into_iter()
            .map(|item| {
                item.into_uint()
                    .map(FieldElement::from_u256)
                    .ok_or_else(|| "expected uint array element".to_string())
            })
            .collect()
    }

    fn tuple(&mut self) -> Result<Tokens, String> {
        self.next()?
            .into_tuple()
            .map(|items| Tokens(items.into_iter()))
            .ok_or_else(|| "expected tuple".to_string())
    }
}

fn uint_tokens(values: impl IntoIterator<Item = U256>) -> Vec<Token> {
    values.into_iter().map(Token::Uint).collect()
}

fn field_tokens(values: &[FieldElement]) -> Vec<Token> {
    uint_tokens(values.iter().map(FieldElement::as_u256))
}

impl LedgerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            LedgerEvent::UserSignedUp { .. } => EventKind::UserSignedUp,
            LedgerEvent::UserStateTransitioned { .. } => EventKind::UserStateTransitioned,
            LedgerEvent::AttestationSubmitted(_) => EventKind::AttestationSubmitted,
            LedgerEvent::EpochEnded { .. } => EventKind::EpochEnded,
            LedgerEvent::Proof(proof) => EventKind::for_circuit(proof.circuit),
        }
    }

    /// Decodes the indexed topics (without the signature topic) and data of a `kind` log.
    pub fn decode(kind: EventKind, indexed: &[H256], data: &[u8]) -> Result<Self, String> {
        if indexed.len() != kind.indexed_count() {
            return Err(format!(
                "expected {} indexed topics, got {}",
                kind.indexed_count(),
                indexed.len()
            ));
        }
        let topics = Topics(indexed);
        let mut tokens = Tokens(
            abi::decode(&kind.data_layout(), data)
                .map_err(|e| e.to_string())?
                .into_iter(),
        );

        let event = match kind {
            EventKind::UserSignedUp => LedgerEvent::UserSignedUp {
                epoch: topics.u64(0, "epoch")?,
                identity_commitment: topics.field(1),
                attester_id: tokens.u64("attesterId")?,
                airdrop: tokens.u64("airdropAmount")?,
            },
            EventKind::UserStateTransitioned => LedgerEvent::UserStateTransitioned {
                epoch: topics.u64(0, "epoch")?,
                hashed_leaf: topics.field(1),
                proof_index: tokens.u64("proofIndex")?,
            },
            EventKind::AttestationSubmitted => {
                let raw_kind = tokens.u64("attestationEvent")?;
                let att_kind = u8::try_from(raw_kind)
                    .ok()
                    .and_then(AttestationKind::from_u8)
                    .ok_or_else(|| format!("unknown attestation event {raw_kind}"))?;
                let mut fields = tokens.tuple()?;
                let attestation = Attestation {
                    attester_id: fields.u64("attesterId")?,
                    pos_rep: fields.u64("posRep")?,
                    neg_rep: fields.u64("negRep")?,
                    graffiti: FieldElement::from_u256(fields.uint()?),
                    sign_up: match fields.u64("signUp")? {
                        0 => false,
                        1 => true,
                        other => return Err(format!("signUp must be 0 or 1, got {other}")),
                    },
                };
                let to_proof_index = tokens.u64("toProofIndex")?;
                let from_proof_index = tokens.u64("fromProofIndex")?;
                LedgerEvent::AttestationSubmitted(AttestationEvent {
                    epoch: topics.u64(0, "epoch")?,
                    epoch_key: EpochKey::new(topics.field(1)),
                    attester: topics.address(2),
                    kind: att_kind,
                    attestation,
                    to_proof_index,
                    from_proof_index: (from_proof_index != 0).then_some(from_proof_index),
                })
            }
            EventKind::EpochEnded => LedgerEvent::EpochEnded {
                epoch: topics.u64(0, "epoch")?,
            },
            _ => {
                let circuit = kind
                    .circuit()
                    .ok_or_else(|| format!("{kind} carries no proof"))?;
                let public_signals = tokens.fields()?;
                let elements = tokens.fields()?;
                let proof: [FieldElement; 8] = elements
                    .try_into()
                    .map_err(|_| "proof must have 8 elements".to_string())?;
                let linked_proofs = if kind == EventKind::IndexedUserStateTransitionProof {
                    tokens
                        .fields()?
                        .iter()
                        .map(|index| {
                            index
                                .to_u64()
                                .ok_or_else(|| "proof index does not fit in 64 bits".to_string())
                        })
                        .collect::<Result<Vec<_>, _>>()?
                } else {
                    Vec::new()
                };
                let (epoch, epoch_key) = if circuit.is_epoch_scoped() {
                    (
                        Some(topics.u64(1, "epoch")?),
                        Some(EpochKey::new(topics.field(2))),
                    )
                } else {
                    (None, None)
                };
                LedgerEvent::Proof(ProofEvent {
                    circuit,
                    proof_index: topics.u64(0, "proofIndex")?,
                    epoch,
                    epoch_key,
                    public_signals,
                    proof: SnarkProof(proof),
                    linked_proofs,
                })
            }
        };
        Ok(event)
    }

    /// Encodes the event as `(topics, data)` the way the contract emits it.
    pub fn encode(&self) -> (Vec<H256>, Bytes) {
        let mut topics = vec![self.kind().topic()];
        let data = match self {
            LedgerEvent::UserSignedUp {
                epoch,
                identity_commitment,
                attester_id,
                airdrop,
            } => {
                topics.push(word(U256::from(*epoch)));
                topics.push(word(identity_commitment.as_u256()));
                abi::encode(&uint_tokens([U256::from(*attester_id), U256::from(*airdrop)]))
            }
            LedgerEvent::UserStateTransitioned {
                epoch,
                hashed_leaf,
                proof_index,
            } => {
                topics.push(word(U256::from(*epoch)));
                topics.push(word(hashed_leaf.as_u256()));
                abi::encode(&uint_tokens([U256::from(*proof_index)]))
            }
            LedgerEvent::AttestationSubmitted(event) => {
                topics.push(word(U256::from(event.epoch)));
                topics.push(word(event.epoch_key.as_field().as_u256()));
                topics.push(address_word(event.attester));
                let att = &event.attestation;
                abi::encode(&[
                    Token::Uint(U256::from(event.kind.as_u8())),
                    Token::Tuple(uint_tokens([
                        U256::from(att.attester_id),
                        U256::from(att.pos_rep),
                        U256::from(att.neg_rep),
                        att.graffiti.as_u256(),
                        U256::from(att.sign_up as u64),
                    ])),
                    Token::Uint(U256::from(event.to_proof_index)),
                    Token::Uint(U256::from(event.from_proof_index.unwrap_or(0))),
                ])
            }
            LedgerEvent::EpochEnded { epoch } => {
                topics.push(word(U256::from(*epoch)));
                Vec::new()
            }
            LedgerEvent::Proof(proof) => {
                topics.push(word(U256::from(proof.proof_index)));
                if proof.circuit.is_epoch_scoped() {
                    topics.push(word(U256::from(proof.epoch.unwrap_or_default())));
                    topics.push(word(
                        proof.epoch_key.unwrap_or_default().as_field().as_u256(),
                    ));
                }
                let mut tokens = vec![
                    Token::Array(field_tokens(&proof.public_signals)),
                    Token::FixedArray(field_tokens(proof.proof.elements())),
                ];
                if proof.circuit == CircuitTag::UserStateTransition {
                    tokens.push(Token::Array(uint_tokens(
                        proof.linked_proofs.iter().map(|i| U256::from(*i)),
                    )));
                }
                abi::encode(&tokens)
            }
        };
        (topics, Bytes::from(data))
    }
}
