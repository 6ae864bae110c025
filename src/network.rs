use async_trait::async_trait;
use futures::future::try_join_all;
use reqwest::Client;
use thiserror::Error;

use crate::types::{GraphQLRequest, GraphQLResult};

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),
    #[error("batch response size mismatch: sent {sent} requests, received {received} results")]
    BatchSizeMismatch { sent: usize, received: usize },
    #[error("request dropped before a response was delivered")]
    RequestDropped,
    #[error("transport error: {0}")]
    Transport(String),
}

/// The transport seam. Implementations that can coalesce several requests
/// into one round trip advertise it through `supports_batching`, which turns
/// on batching in the manager by default.
#[async_trait]
pub trait NetworkInterface: Send + Sync {
    async fn query(&self, request: GraphQLRequest) -> Result<GraphQLResult, NetworkError>;

    fn supports_batching(&self) -> bool {
        false
    }

    /// Execute several requests in one round trip, results in request order.
    /// The default fans out to `query`.
    async fn batch_query(
        &self,
        requests: Vec<GraphQLRequest>,
    ) -> Result<Vec<GraphQLResult>, NetworkError> {
        try_join_all(requests.into_iter().map(|request| self.query(request))).await
    }
}

/// Network interface posting standard GraphQL JSON bodies to a single
/// endpoint; batches are posted as a request array.
pub struct HttpNetworkInterface {
    client: Client,
    endpoint: String,
}

impl HttpNetworkInterface {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
        }
    }

    pub fn with_client(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl NetworkInterface for HttpNetworkInterface {
    async fn query(&self, request: GraphQLRequest) -> Result<GraphQLResult, NetworkError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await?
            .error_for_status()?;

        Ok(response.json().await?)
    }

    fn supports_batching(&self) -> bool {
        true
    }

    async fn batch_query(
        &self,
        requests: Vec<GraphQLRequest>,
    ) -> Result<Vec<GraphQLResult>, NetworkError> {
        let sent = requests.len();
        let response = self
            .client
            .post(&self.endpoint)
            .json(&requests)
            .send()
            .await?
            .error_for_status()?;

        let results: Vec<GraphQLResult> = response.json().await?;
        if results.len() != sent {
            return Err(NetworkError::BatchSizeMismatch {
                sent,
                received: results.len(),
            });
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn request_serializes_with_camel_case_operation_name() {
        let request = GraphQLRequest {
            query: "query Hero { hero { name } }".to_string(),
            variables: Some(json!({"id": 1})),
            operation_name: Some("Hero".to_string()),
        };

        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["operationName"], json!("Hero"));
        assert_eq!(body["variables"], json!({"id": 1}));
    }

    #[test]
    fn request_omits_absent_fields() {
        let request = GraphQLRequest {
            query: "{ hero { name } }".to_string(),
            variables: None,
            operation_name: None,
        };

        let body = serde_json::to_value(&request).unwrap();
        assert!(body.get("variables").is_none());
        assert!(body.get("operationName").is_none());
    }
}
