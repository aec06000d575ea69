//! Identity secrets and the values derived from them.

use std::fmt;

use zkrep_common::{
    hash::{EPK_NULLIFIER_DOMAIN, EPOCH_KEY_DOMAIN, IDENTITY_DOMAIN, REP_NULLIFIER_DOMAIN},
    hash_fields, FieldElement,
};

use crate::types::{Epoch, EpochKey, ProtocolConfig};

/// A user's secret identity. Only its commitment ever appears on chain.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    nullifier: FieldElement,
    trapdoor: FieldElement,
}

impl Identity {
    pub fn new(nullifier: FieldElement, trapdoor: FieldElement) -> Self {
        Self {
            nullifier,
            trapdoor,
        }
    }

    pub fn commitment(&self) -> FieldElement {
        hash_fields(IDENTITY_DOMAIN, &[self.nullifier, self.trapdoor])
    }

    pub fn epoch_key(&self, epoch: Epoch, nonce: u32, epoch_tree_depth: u32) -> EpochKey {
        let raw = hash_fields(
            EPOCH_KEY_DOMAIN,
            &[
                self.nullifier,
                FieldElement::from(epoch),
                FieldElement::from(nonce as u64),
            ],
        );
        EpochKey::new(raw.truncate_bits(epoch_tree_depth))
    }

    /// All epoch keys of this identity for `epoch`, in nonce order.
    pub fn epoch_keys(&self, epoch: Epoch, config: &ProtocolConfig) -> Vec<EpochKey> {
        (0..config.keys_per_epoch)
            .map(|nonce| self.epoch_key(epoch, nonce, config.epoch_tree_depth))
            .collect()
    }

    /// Nullifier revealed when the epoch key `(epoch, nonce)` is transitioned away from.
    pub fn epoch_key_nullifier(&self, epoch: Epoch, nonce: u32) -> FieldElement {
        hash_fields(
            EPK_NULLIFIER_DOMAIN,
            &[
                self.nullifier,
                FieldElement::from(epoch),
                FieldElement::from(nonce as u64),
            ],
        )
    }

    pub fn epoch_key_nullifiers(&self, epoch: Epoch, config: &ProtocolConfig) -> Vec<FieldElement> {
        (0..config.keys_per_epoch)
            .map(|nonce| self.epoch_key_nullifier(epoch, nonce))
            .collect()
    }

    /// Nullifier for the `nonce`-th unit of reputation spent in `epoch`.
    pub fn reputation_nullifier(&self, epoch: Epoch, nonce: u64) -> FieldElement {
        hash_fields(
            REP_NULLIFIER_DOMAIN,
            &[
                self.nullifier,
                FieldElement::from(epoch),
                FieldElement::from(nonce),
            ],
        )
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("commitment", &self.commitment())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_identity() -> Identity {
        Identity::new(FieldElement::from(11), FieldElement::from(22))
    }

    #[test]
    fn test_epoch_keys_fit_tree() {
        let config = ProtocolConfig::default();
        let id = sample_identity();
        let keys = id.epoch_keys(1, &config);
        assert_eq!(keys.len(), config.keys_per_epoch as usize);
        for key in keys {
            assert!(key.leaf_index(config.epoch_tree_depth).is_some());
        }
    }

    #[test]
    fn test_derivations_are_deterministic_and_scoped() {
        let id = sample_identity();
        assert_eq!(id.epoch_key(1, 0, 32), id.epoch_key(1, 0, 32));
        assert_ne!(id.epoch_key(1, 0, 32), id.epoch_key(2, 0, 32));
        assert_ne!(id.epoch_key_nullifier(1, 0), id.reputation_nullifier(1, 0));
        let other = Identity::new(FieldElement::from(12), FieldElement::from(22));
        assert_ne!(id.commitment(), other.commitment());
    }

    #[test]
    fn test_debug_hides_secrets() {
        let rendered = format!("{:?}", sample_identity());
        assert!(rendered.contains("commitment"));
        assert!(!rendered.contains("trapdoor"));
    }
}
