//! Beacon node light-client REST client

use std::time::Duration;

use alloy::primitives::B256;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use super::BeaconApi;
use crate::error::{RelayError, RelayResult};
use crate::lightclient::committee::{Bootstrap, FinalityUpdate, LightClientUpdate};

/// Beacon API `{ "data": ... }` envelope
#[derive(Debug, Deserialize)]
struct DataResponse<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct HeaderRoot {
    root: B256,
}

pub struct BeaconClient {
    endpoint: String,
    client: reqwest::Client,
}

impl BeaconClient {
    pub fn new(endpoint: impl Into<String>) -> RelayResult<Self> {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        url::Url::parse(&endpoint)
            .map_err(|e| RelayError::InvalidInput(format!("Invalid beacon endpoint: {}", e)))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self { endpoint, client })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> RelayResult<T> {
        let url = format!("{}{}", self.endpoint, path);
        debug!(url = %url, "Beacon API request");

        let response = self.client.get(&url).send().await?;
        match response.status() {
            status if status.is_success() => Ok(response.json::<T>().await?),
            StatusCode::NOT_FOUND => Err(RelayError::MissingDependency(format!(
                "beacon node has no data for {}",
                path
            ))),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(RelayError::TransportFailure(format!(
                    "beacon API {} returned {}: {}",
                    path, status, body
                )))
            }
        }
    }
}

#[async_trait]
impl BeaconApi for BeaconClient {
    async fn get_finality_update(&self) -> RelayResult<FinalityUpdate> {
        let response: DataResponse<FinalityUpdate> = self
            .get("/eth/v1/beacon/light_client/finality_update")
            .await?;
        Ok(response.data)
    }

    async fn get_sync_committee_period_update(
        &self,
        period: u64,
    ) -> RelayResult<LightClientUpdate> {
        let updates: Vec<DataResponse<LightClientUpdate>> = self
            .get(&format!(
                "/eth/v1/beacon/light_client/updates?start_period={}&count=1",
                period
            ))
            .await?;

        updates
            .into_iter()
            .next()
            .map(|u| u.data)
            .ok_or_else(|| {
                RelayError::MissingDependency(format!("no sync committee update for period {}", period))
            })
    }

    async fn get_bootstrap(&self, block_root: B256) -> RelayResult<Bootstrap> {
        let response: DataResponse<Bootstrap> = self
            .get(&format!("/eth/v1/beacon/light_client/bootstrap/{}", block_root))
            .await?;
        Ok(response.data)
    }

    async fn get_beacon_block_root(&self, slot: u64) -> RelayResult<B256> {
        let response: DataResponse<HeaderRoot> = self
            .get(&format!("/eth/v1/beacon/headers/{}", slot))
            .await?;
        Ok(response.data.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_trailing_slash_trimmed() {
        let client = BeaconClient::new("http://localhost:5052/").unwrap();
        assert_eq!(client.endpoint, "http://localhost:5052");
    }

    #[test]
    fn test_invalid_endpoint() {
        assert!(matches!(
            BeaconClient::new("localhost"),
            Err(RelayError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_header_root_response() {
        let json = serde_json::json!({
            "execution_optimistic": false,
            "data": {
                "root": format!("0x{}", "ab".repeat(32)),
                "canonical": true,
                "header": {}
            }
        });
        let response: DataResponse<HeaderRoot> = serde_json::from_value(json).unwrap();
        assert_eq!(response.data.root, B256::repeat_byte(0xab));
    }
}
