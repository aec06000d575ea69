//! Core ledger value types.

use std::{fmt, str::FromStr};

use ethers::types::Address;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use zkrep_common::{hash::ATTESTATION_DOMAIN, hash_fields, FieldElement};

/// Protocol epoch number. The first epoch is 1.
pub type Epoch = u64;

/// On-chain index assigned to each submitted proof. Index 0 means "none".
pub type ProofIndex = u64;

/// First epoch of every protocol instance.
pub const GENESIS_EPOCH: Epoch = 1;

// ============================================================================
// Protocol parameters
// ============================================================================

/// Tree shapes and per-epoch limits shared with the on-chain verifier.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolConfig {
    #[serde(default = "default_gst_depth")]
    pub gst_depth: u32,
    #[serde(default = "default_epoch_tree_depth")]
    pub epoch_tree_depth: u32,
    #[serde(default = "default_keys_per_epoch")]
    pub keys_per_epoch: u32,
    #[serde(default = "default_max_reputation_budget")]
    pub max_reputation_budget: u32,
}

fn default_gst_depth() -> u32 {
    17
}

fn default_epoch_tree_depth() -> u32 {
    8
}

fn default_keys_per_epoch() -> u32 {
    3
}

fn default_max_reputation_budget() -> u32 {
    10
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            gst_depth: default_gst_depth(),
            epoch_tree_depth: default_epoch_tree_depth(),
            keys_per_epoch: default_keys_per_epoch(),
            max_reputation_budget: default_max_reputation_budget(),
        }
    }
}

impl ProtocolConfig {
    /// Checks the parameters against the limits of the tree implementations.
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=32).contains(&self.gst_depth) {
            return Err(format!("gst_depth must be in 1..=32, got {}", self.gst_depth));
        }
        if !(1..=64).contains(&self.epoch_tree_depth) {
            return Err(format!(
                "epoch_tree_depth must be in 1..=64, got {}",
                self.epoch_tree_depth
            ));
        }
        if self.keys_per_epoch == 0 {
            return Err("keys_per_epoch must be positive".into());
        }
        if self.max_reputation_budget == 0 {
            return Err("max_reputation_budget must be positive".into());
        }
        Ok(())
    }
}

// ============================================================================
// Epoch keys
// ============================================================================

/// Unlinkable per-epoch pseudonym, stored as a fixed-width hex string.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EpochKey(#[serde(with = "zkrep_common::serde_hex_padded")] pub FieldElement);

impl EpochKey {
    pub fn new(value: FieldElement) -> Self {
        Self(value)
    }

    pub fn as_field(&self) -> &FieldElement {
        &self.0
    }

    /// Leaf index inside an epoch tree of the given depth.
    pub fn leaf_index(&self, depth: u32) -> Option<u64> {
        if self.0.fits_bits(depth) {
            self.0.to_u64()
        } else {
            None
        }
    }
}

impl From<u64> for EpochKey {
    fn from(value: u64) -> Self {
        Self(FieldElement::from(value))
    }
}

impl fmt::Display for EpochKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_hex_padded())
    }
}

impl fmt::Debug for EpochKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EpochKey({})", self.0.to_hex())
    }
}

// ============================================================================
// Proof keys
// ============================================================================

/// Key of a verified proof record: `(epoch-or-null, proofIndex)`.
///
/// Epoch-scoped proofs (epoch key, reputation, sign-up) carry their epoch;
/// the transition family is keyed by index alone. The canonical string form
/// is `"{epoch}_{index}"` or `"null_{index}"`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProofKey {
    pub epoch: Option<Epoch>,
    pub index: ProofIndex,
}

impl ProofKey {
    pub fn epoch(epoch: Epoch, index: ProofIndex) -> Self {
        Self {
            epoch: Some(epoch),
            index,
        }
    }

    pub fn transition(index: ProofIndex) -> Self {
        Self { epoch: None, index }
    }
}

impl fmt::Display for ProofKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.epoch {
            Some(epoch) => write!(f, "{}_{}", epoch, self.index),
            None => write!(f, "null_{}", self.index),
        }
    }
}

impl fmt::Debug for ProofKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProofKey({})", self)
    }
}

impl FromStr for ProofKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (epoch, index) = s
            .split_once('_')
            .ok_or_else(|| format!("proof key `{s}` is missing `_`"))?;
        let index = index
            .parse()
            .map_err(|_| format!("proof key `{s}` has a non-numeric index"))?;
        let epoch = match epoch {
            "null" => None,
            other => Some(
                other
                    .parse()
                    .map_err(|_| format!("proof key `{s}` has a non-numeric epoch"))?,
            ),
        };
        Ok(Self { epoch, index })
    }
}

impl Serialize for ProofKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ProofKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}

// ============================================================================
// Attestations
// ============================================================================

/// Why an attestation was submitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttestationKind {
    SendAttestation,
    Airdrop,
    SpendReputation,
}

impl AttestationKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::SendAttestation),
            1 => Some(Self::Airdrop),
            2 => Some(Self::SpendReputation),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::SendAttestation => 0,
            Self::Airdrop => 1,
            Self::SpendReputation => 2,
        }
    }
}

/// Reputation delta attached to an epoch key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attestation {
    pub attester_id: u64,
    pub pos_rep: u64,
    pub neg_rep: u64,
    pub graffiti: FieldElement,
    pub sign_up: bool,
}

impl Attestation {
    /// Total reputation moved by this attestation, if it fits in a `u64`.
    pub fn amount(&self) -> Option<u64> {
        self.pos_rep.checked_add(self.neg_rep)
    }

    pub fn hash(&self) -> FieldElement {
        hash_fields(
            ATTESTATION_DOMAIN,
            &[
                FieldElement::from(self.attester_id),
                FieldElement::from(self.pos_rep),
                FieldElement::from(self.neg_rep),
                self.graffiti,
                FieldElement::from(self.sign_up as u64),
            ],
        )
    }
}

/// An attestation as stored in an epoch tree bucket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationRecord {
    pub kind: AttestationKind,
    pub attester: Address,
    pub attestation: Attestation,
}

// ============================================================================
// Proofs
// ============================================================================

/// Fixed-shape Groth16 proof: eight field elements.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnarkProof(pub [FieldElement; 8]);

impl SnarkProof {
    pub fn elements(&self) -> &[FieldElement; 8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proof_key_string_form() {
        let scoped = ProofKey::epoch(3, 17);
        let transition = ProofKey::transition(9);
        assert_eq!(scoped.to_string(), "3_17");
        assert_eq!(transition.to_string(), "null_9");
        assert_eq!("3_17".parse::<ProofKey>().unwrap(), scoped);
        assert_eq!("null_9".parse::<ProofKey>().unwrap(), transition);
        assert!("3-17".parse::<ProofKey>().is_err());
        assert!("x_1".parse::<ProofKey>().is_err());
    }

    #[test]
    fn test_proof_key_as_json_map_key() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(ProofKey::epoch(1, 2), true);
        map.insert(ProofKey::transition(4), true);
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"null_4":true,"1_2":true}"#);
        let back: std::collections::BTreeMap<ProofKey, bool> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn test_epoch_key_fixed_width() {
        let key = EpochKey::from(0xab);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json.len(), 66 + 2);
        let back: EpochKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
        assert_eq!(key.leaf_index(8), Some(0xab));
        assert_eq!(key.leaf_index(7), None);
    }

    #[test]
    fn test_attestation_amount() {
        let att = Attestation {
            pos_rep: 3,
            neg_rep: 2,
            ..Default::default()
        };
        assert_eq!(att.amount(), Some(5));
        let overflow = Attestation {
            pos_rep: u64::MAX,
            neg_rep: 1,
            ..Default::default()
        };
        assert_eq!(overflow.amount(), None);
    }

    #[test]
    fn test_attestation_kind_codes() {
        for kind in [
            AttestationKind::SendAttestation,
            AttestationKind::Airdrop,
            AttestationKind::SpendReputation,
        ] {
            assert_eq!(AttestationKind::from_u8(kind.as_u8()), Some(kind));
        }
        assert_eq!(AttestationKind::from_u8(3), None);
    }

    #[test]
    fn test_config_validation() {
        assert!(ProtocolConfig::default().validate().is_ok());
        let bad = ProtocolConfig {
            gst_depth: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
