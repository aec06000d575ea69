//! Succinct-proof verification seam.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zkrep_common::FieldElement;

use crate::types::SnarkProof;

/// Circuits whose proofs appear in the event log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CircuitTag {
    VerifyEpochKey,
    ProveReputation,
    ProveUserSignUp,
    StartTransition,
    ProcessAttestations,
    UserStateTransition,
}

impl CircuitTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitTag::VerifyEpochKey => "verifyEpochKey",
            CircuitTag::ProveReputation => "proveReputation",
            CircuitTag::ProveUserSignUp => "proveUserSignUp",
            CircuitTag::StartTransition => "startTransition",
            CircuitTag::ProcessAttestations => "processAttestations",
            CircuitTag::UserStateTransition => "userStateTransition",
        }
    }

    /// Proofs of these circuits are recorded under `(epoch, index)`; the rest under `(null, index)`.
    pub fn is_epoch_scoped(&self) -> bool {
        matches!(
            self,
            CircuitTag::VerifyEpochKey | CircuitTag::ProveReputation | CircuitTag::ProveUserSignUp
        )
    }
}

impl fmt::Display for CircuitTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum VerifierError {
    #[error("verifier transport error: {0}")]
    Transport(String),

    #[error("unexpected verifier response: {0}")]
    Response(String),
}

/// Verifies a proof for `circuit` against its public signals.
///
/// `Ok(false)` means the proof is invalid. `Err` means no verdict could be
/// obtained and the caller should retry later.
#[async_trait]
pub trait ProofVerifier: Send + Sync {
    async fn verify(
        &self,
        circuit: CircuitTag,
        public_signals: &[FieldElement],
        proof: &SnarkProof,
    ) -> Result<bool, VerifierError>;
}
