//! Domain-separated blake3 hashing onto [`FieldElement`]s.

use crate::FieldElement;

pub const TREE_NODE_DOMAIN: &[u8] = b"zkrep_tree_node_v1";
pub const IDENTITY_DOMAIN: &[u8] = b"zkrep_identity_v1";
pub const EPOCH_KEY_DOMAIN: &[u8] = b"zkrep_epoch_key_v1";
pub const EPK_NULLIFIER_DOMAIN: &[u8] = b"zkrep_epk_nullifier_v1";
pub const REP_NULLIFIER_DOMAIN: &[u8] = b"zkrep_rep_nullifier_v1";
pub const ATTESTATION_DOMAIN: &[u8] = b"zkrep_attestation_v1";
pub const USER_STATE_DOMAIN: &[u8] = b"zkrep_user_state_v1";

/// Outputs are kept below 2^253 so they stay valid inputs for SNARK-friendly fields.
const OUTPUT_TOP_BYTE_MASK: u8 = 0x1f;

/// Hashes `inputs` under `domain`, each input as 32 big-endian bytes.
pub fn hash_fields(domain: &[u8], inputs: &[FieldElement]) -> FieldElement {
    let mut hasher = blake3::Hasher::new();
    hasher.update(domain);
    hasher.update(&(inputs.len() as u32).to_be_bytes());
    for input in inputs {
        hasher.update(&input.to_be_bytes());
    }
    let mut out = *hasher.finalize().as_bytes();
    out[0] &= OUTPUT_TOP_BYTE_MASK;
    FieldElement::from_be_bytes(out)
}

/// Merkle node hash.
pub fn hash_left_right(left: &FieldElement, right: &FieldElement) -> FieldElement {
    hash_fields(TREE_NODE_DOMAIN, &[*left, *right])
}
