//! Authority signer service client
//!
//! JSON-RPC client for the service that collects authority signatures over
//! message commitments for threshold-signature light clients.

use std::time::Duration;

use alloy::primitives::{Bytes, B256};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::AuthoritySigner;
use crate::error::{RelayError, RelayResult};
use crate::lightclient::threshold::Commitment;
use crate::types::quantity;

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i32,
    message: String,
}

/// Wire form of a commitment
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CommitmentParams {
    #[serde(with = "quantity")]
    block_number: u64,
    message_root: B256,
    #[serde(with = "quantity")]
    nonce: u64,
}

#[derive(Debug, Deserialize)]
struct NonceResult(#[serde(with = "quantity")] u64);

pub struct AuthorityClient {
    endpoint: String,
    client: reqwest::Client,
}

impl AuthorityClient {
    pub fn new(endpoint: impl Into<String>) -> RelayResult<Self> {
        let endpoint = endpoint.into();
        url::Url::parse(&endpoint)
            .map_err(|e| RelayError::InvalidInput(format!("Invalid signer endpoint: {}", e)))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self { endpoint, client })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> RelayResult<T> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        debug!(method, "Authority signer request");

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await?
            .json::<RpcResponse<T>>()
            .await?;

        if let Some(error) = response.error {
            return Err(RelayError::MissingDependency(format!(
                "{} error {}: {}",
                method, error.code, error.message
            )));
        }

        response
            .result
            .ok_or_else(|| RelayError::MissingDependency(format!("{} returned no result", method)))
    }
}

#[async_trait]
impl AuthoritySigner for AuthorityClient {
    async fn authority_nonce(&self, block_hash: B256) -> RelayResult<u64> {
        let nonce: NonceResult = self
            .call("authority_nonce", serde_json::json!([block_hash]))
            .await?;
        Ok(nonce.0)
    }

    async fn sign_commitment(&self, commitment: &Commitment) -> RelayResult<Vec<Bytes>> {
        let params = CommitmentParams {
            block_number: commitment.block_number,
            message_root: commitment.message_root,
            nonce: commitment.nonce,
        };
        self.call("authority_signCommitment", serde_json::json!([params]))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commitment_params_wire_form() {
        let params = CommitmentParams {
            block_number: 256,
            message_root: B256::repeat_byte(1),
            nonce: 3,
        };
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["blockNumber"], "0x100");
        assert_eq!(json["nonce"], "0x3");
    }

    #[test]
    fn test_nonce_result_accepts_hex_and_number() {
        let hex: NonceResult = serde_json::from_value(serde_json::json!("0x2a")).unwrap();
        assert_eq!(hex.0, 42);
        let number: NonceResult = serde_json::from_value(serde_json::json!(42)).unwrap();
        assert_eq!(number.0, 42);
    }

    #[test]
    fn test_rpc_error_is_missing_dependency() {
        let response: RpcResponse<u64> = serde_json::from_value(serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": { "code": -32001, "message": "not enough signatures" }
        }))
        .unwrap();
        assert!(response.result.is_none());
        assert_eq!(response.error.unwrap().message, "not enough signatures");
    }
}
