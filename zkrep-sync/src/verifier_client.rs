//! HTTP client for an external proof verification service.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use zkrep_common::FieldElement;
use zkrep_ledger::{CircuitTag, ProofVerifier, SnarkProof, VerifierError};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifyRequest {
    circuit: CircuitTag,
    public_signals: Vec<String>,
    proof: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    valid: bool,
}

/// Calls `POST {base_url}/verify` for every proof.
#[derive(Clone, Debug)]
pub struct HttpProofVerifier {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpProofVerifier {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!("{}/verify", base_url.trim_end_matches('/')),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn decimal_strings(values: &[FieldElement]) -> Vec<String> {
    values.iter().map(FieldElement::to_string).collect()
}

#[async_trait]
impl ProofVerifier for HttpProofVerifier {
    async fn verify(
        &self,
        circuit: CircuitTag,
        public_signals: &[FieldElement],
        proof: &SnarkProof,
    ) -> Result<bool, VerifierError> {
        let request = VerifyRequest {
            circuit,
            public_signals: decimal_strings(public_signals),
            proof: decimal_strings(proof.elements()),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| VerifierError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(VerifierError::Transport(format!(
                "verifier returned HTTP {status}"
            )));
        }

        let body: VerifyResponse = response
            .json()
            .await
            .map_err(|e| VerifierError::Response(e.to_string()))?;
        debug!(%circuit, valid = body.valid, "proof verified");
        Ok(body.valid)
    }
}
