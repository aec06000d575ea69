//! Public-signal layouts of each circuit.
//!
//! | circuit | signals |
//! |---|---|
//! | `verifyEpochKey` | `gstRoot, epoch, epochKey` |
//! | `proveReputation` | `repNullifiers[B], epoch, epochKey, gstRoot, attesterId, proveReputationAmount, minRep, proveGraffiti, graffitiPreImage` |
//! | `proveUserSignUp` | `epoch, epochKey, gstRoot, attesterId, userHasSignedUp` |
//! | `startTransition` | `blindedUserState, blindedHashChain, gstRoot` |
//! | `processAttestations` | `outputBlindedUserState, outputBlindedHashChain, inputBlindedUserState` |
//! | `userStateTransition` | `newGstLeaf, epkNullifiers[K], transitionFromEpoch, blindedUserStates[2], fromGstRoot, blindedHashChains[K], fromEpochTreeRoot` |
//!
//! `B` is the reputation budget and `K` the number of epoch keys per epoch.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use zkrep_common::FieldElement;

use crate::error::Rejection;
use crate::types::{Epoch, EpochKey, ProtocolConfig};
use crate::verifier::CircuitTag;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpochKeySignals {
    pub gst_root: FieldElement,
    pub epoch: Epoch,
    pub epoch_key: EpochKey,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReputationSignals {
    /// Fixed-length nullifier slots; zero slots are padding.
    pub rep_nullifiers: Vec<FieldElement>,
    pub epoch: Epoch,
    pub epoch_key: EpochKey,
    pub gst_root: FieldElement,
    pub attester_id: u64,
    pub spend_amount: u64,
    pub min_rep: u64,
    pub prove_graffiti: bool,
    pub graffiti_pre_image: FieldElement,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignUpSignals {
    pub epoch: Epoch,
    pub epoch_key: EpochKey,
    pub gst_root: FieldElement,
    pub attester_id: u64,
    pub user_has_signed_up: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTransitionSignals {
    pub blinded_user_state: FieldElement,
    pub blinded_hash_chain: FieldElement,
    pub gst_root: FieldElement,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessAttestationsSignals {
    pub output_blinded_user_state: FieldElement,
    pub output_blinded_hash_chain: FieldElement,
    pub input_blinded_user_state: FieldElement,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStateTransitionSignals {
    pub new_gst_leaf: FieldElement,
    pub epk_nullifiers: Vec<FieldElement>,
    pub from_epoch: Epoch,
    pub blinded_user_states: [FieldElement; 2],
    pub from_gst_root: FieldElement,
    pub blinded_hash_chains: Vec<FieldElement>,
    pub from_epoch_tree_root: FieldElement,
}

/// Decoded public signals of a verified proof.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ProofArgs {
    EpochKey(EpochKeySignals),
    Reputation(ReputationSignals),
    SignUp(SignUpSignals),
    StartTransition(StartTransitionSignals),
    ProcessAttestations(ProcessAttestationsSignals),
    UserStateTransition(UserStateTransitionSignals),
}

/// Number of public signals `circuit` exposes under `config`.
pub fn signal_count(circuit: CircuitTag, config: &ProtocolConfig) -> usize {
    match circuit {
        CircuitTag::VerifyEpochKey => 3,
        CircuitTag::ProveReputation => config.max_reputation_budget as usize + 8,
        CircuitTag::ProveUserSignUp => 5,
        CircuitTag::StartTransition => 3,
        CircuitTag::ProcessAttestations => 3,
        CircuitTag::UserStateTransition => 2 * config.keys_per_epoch as usize + 6,
    }
}

struct SignalReader<'a> {
    circuit: CircuitTag,
    signals: &'a [FieldElement],
    position: usize,
    epoch_tree_depth: u32,
}

impl<'a> SignalReader<'a> {
    fn field(&mut self) -> FieldElement {
        let value = self.signals[self.position];
        self.position += 1;
        value
    }

    fn fields(&mut self, count: usize) -> Vec<FieldElement> {
        let values = self.signals[self.position..self.position + count].to_vec();
        self.position += count;
        values
    }

    fn integer(&mut self, name: &str) -> Result<u64, Rejection> {
        let value = self.field();
        value.to_u64().ok_or_else(|| {
            Rejection::Malformed(format!("{}: {name} does not fit in 64 bits", self.circuit))
        })
    }

    fn flag(&mut self, name: &str) -> Result<bool, Rejection> {
        match self.integer(name)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Rejection::Malformed(format!(
                "{}: {name} must be 0 or 1, got {other}",
                self.circuit
            ))),
        }
    }

    fn epoch(&mut self) -> Result<Epoch, Rejection> {
        let epoch = self.integer("epoch")?;
        if epoch == 0 {
            return Err(Rejection::Malformed(format!("{}: epoch 0", self.circuit)));
        }
        Ok(epoch)
    }

    fn epoch_key(&mut self) -> Result<EpochKey, Rejection> {
        let key = EpochKey::new(self.field());
        if key.leaf_index(self.epoch_tree_depth).is_none() {
            return Err(Rejection::Malformed(format!(
                "{}: epoch key {} exceeds {} bits",
                self.circuit, key, self.epoch_tree_depth
            )));
        }
        Ok(key)
    }
}

fn ensure_distinct(circuit: CircuitTag, nullifiers: &[FieldElement]) -> Result<(), Rejection> {
    let mut seen = BTreeSet::new();
    for nullifier in nullifiers.iter().filter(|n| !n.is_zero()) {
        if !seen.insert(*nullifier) {
            return Err(Rejection::Malformed(format!(
                "{circuit}: nullifier {nullifier} repeated"
            )));
        }
    }
    Ok(())
}

impl ProofArgs {
    /// Decodes `signals` according to the layout of `circuit`.
    pub fn decode(
        circuit: CircuitTag,
        signals: &[FieldElement],
        config: &ProtocolConfig,
    ) -> Result<Self, Rejection> {
        let expected = signal_count(circuit, config);
        if signals.len() != expected {
            return Err(Rejection::Malformed(format!(
                "{circuit}: expected {expected} public signals, got {}",
                signals.len()
            )));
        }
        let mut reader = SignalReader {
            circuit,
            signals,
            position: 0,
            epoch_tree_depth: config.epoch_tree_depth,
        };

        let args = match circuit {
            CircuitTag::VerifyEpochKey => ProofArgs::EpochKey(EpochKeySignals {
                gst_root: reader.field(),
                epoch: reader.epoch()?,
                epoch_key: reader.epoch_key()?,
            }),
            CircuitTag::ProveReputation => {
                let rep_nullifiers = reader.fields(config.max_reputation_budget as usize);
                ensure_distinct(circuit, &rep_nullifiers)?;
                ProofArgs::Reputation(ReputationSignals {
                    rep_nullifiers,
                    epoch: reader.epoch()?,
                    epoch_key: reader.epoch_key()?,
                    gst_root: reader.field(),
                    attester_id: reader.integer("attesterId")?,
                    spend_amount: reader.integer("proveReputationAmount")?,
                    min_rep: reader.integer("minRep")?,
                    prove_graffiti: reader.flag("proveGraffiti")?,
                    graffiti_pre_image: reader.field(),
                })
            }
            CircuitTag::ProveUserSignUp => ProofArgs::SignUp(SignUpSignals {
                epoch: reader.epoch()?,
                epoch_key: reader.epoch_key()?,
                gst_root: reader.field(),
                attester_id: reader.integer("attesterId")?,
                user_has_signed_up: reader.flag("userHasSignedUp")?,
            }),
            CircuitTag::StartTransition => ProofArgs::StartTransition(StartTransitionSignals {
                blinded_user_state: reader.field(),
                blinded_hash_chain: reader.field(),
                gst_root: reader.field(),
            }),
            CircuitTag::ProcessAttestations => {
                ProofArgs::ProcessAttestations(ProcessAttestationsSignals {
                    output_blinded_user_state: reader.field(),
                    output_blinded_hash_chain: reader.field(),
                    input_blinded_user_state: reader.field(),
                })
            }
            CircuitTag::UserStateTransition => {
                let keys = config.keys_per_epoch as usize;
                let new_gst_leaf = reader.field();
                let epk_nullifiers = reader.fields(keys);
                ensure_distinct(circuit, &epk_nullifiers)?;
                ProofArgs::UserStateTransition(UserStateTransitionSignals {
                    new_gst_leaf,
                    epk_nullifiers,
                    from_epoch: reader.epoch()?,
                    blinded_user_states: [reader.field(), reader.field()],
                    from_gst_root: reader.field(),
                    blinded_hash_chains: reader.fields(keys),
                    from_epoch_tree_root: reader.field(),
                })
            }
        };
        Ok(args)
    }

    pub fn circuit(&self) -> CircuitTag {
        match self {
            ProofArgs::EpochKey(_) => CircuitTag::VerifyEpochKey,
            ProofArgs::Reputation(_) => CircuitTag::ProveReputation,
            ProofArgs::SignUp(_) => CircuitTag::ProveUserSignUp,
            ProofArgs::StartTransition(_) => CircuitTag::StartTransition,
            ProofArgs::ProcessAttestations(_) => CircuitTag::ProcessAttestations,
            ProofArgs::UserStateTransition(_) => CircuitTag::UserStateTransition,
        }
    }

    /// Epoch the proof is recorded under; `None` for the transition family.
    pub fn epoch(&self) -> Option<Epoch> {
        match self {
            ProofArgs::EpochKey(s) => Some(s.epoch),
            ProofArgs::Reputation(s) => Some(s.epoch),
            ProofArgs::SignUp(s) => Some(s.epoch),
            _ => None,
        }
    }

    pub fn epoch_key(&self) -> Option<EpochKey> {
        match self {
            ProofArgs::EpochKey(s) => Some(s.epoch_key),
            ProofArgs::Reputation(s) => Some(s.epoch_key),
            ProofArgs::SignUp(s) => Some(s.epoch_key),
            _ => None,
        }
    }

    /// Non-padding nullifiers the proof will spend once consumed.
    pub fn nullifiers(&self) -> Vec<FieldElement> {
        let all = match self {
            ProofArgs::Reputation(s) => &s.rep_nullifiers,
            ProofArgs::UserStateTransition(s) => &s.epk_nullifiers,
            _ => return Vec::new(),
        };
        all.iter().filter(|n| !n.is_zero()).copied().collect()
    }
}
