use crate::error::ClusterQueryError;
use crate::events::HealthState;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Aggregated health of one cluster node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeHealth {
    pub name: String,
    pub health: HealthState,
}

/// Source of per-node cluster health
pub trait ClusterHealthSource: Send + Sync {
    fn node_health<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<NodeHealth>, ClusterQueryError>> + Send + 'a>>;
}

/// Cluster-health source backed by an HTTP endpoint
///
/// The endpoint returns `{"nodes": [{"name": "...", "health": "Ok"}, ...]}`.
/// Timeouts, connection failures and 5xx responses are transient; anything else
/// (4xx, malformed payloads) is reported as `ClusterQueryError::Other`.
pub struct HttpClusterHealth {
    client: Client,
    endpoint: String,
}

/// Response format of the cluster-health endpoint
#[derive(Debug, Deserialize)]
struct ClusterHealthResponse {
    nodes: Vec<NodeHealth>,
}

impl HttpClusterHealth {
    /// Create a source for `endpoint` with a per-request timeout
    ///
    /// # Errors
    ///
    /// Returns `ClusterQueryError::Other` if the HTTP client cannot be built.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, ClusterQueryError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClusterQueryError::Other(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    fn classify_request_error(e: reqwest::Error) -> ClusterQueryError {
        if e.is_timeout() {
            ClusterQueryError::Timeout
        } else if e.is_connect() || e.is_request() {
            ClusterQueryError::Transient(e.to_string())
        } else {
            ClusterQueryError::Other(e.to_string())
        }
    }

    fn classify_status(status: StatusCode) -> Option<ClusterQueryError> {
        if status.is_success() {
            None
        } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Some(ClusterQueryError::Transient(format!(
                "cluster health endpoint returned {}",
                status
            )))
        } else {
            Some(ClusterQueryError::Other(format!(
                "cluster health endpoint returned {}",
                status
            )))
        }
    }
}

impl ClusterHealthSource for HttpClusterHealth {
    fn node_health<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<NodeHealth>, ClusterQueryError>> + Send + 'a>> {
        Box::pin(async move {
            let response = self
                .client
                .get(&self.endpoint)
                .send()
                .await
                .map_err(Self::classify_request_error)?;

            if let Some(e) = Self::classify_status(response.status()) {
                return Err(e);
            }

            let body: ClusterHealthResponse = response.json().await.map_err(|e| {
                if e.is_timeout() {
                    ClusterQueryError::Timeout
                } else {
                    ClusterQueryError::Other(format!("invalid cluster health payload: {}", e))
                }
            })?;

            Ok(body.nodes)
        })
    }
}

/// Cluster-health source returning a fixed snapshot or a fixed failure
#[derive(Debug, Clone)]
pub struct StaticClusterHealth {
    result: Result<Vec<NodeHealth>, ClusterQueryError>,
}

impl StaticClusterHealth {
    pub fn new(nodes: Vec<NodeHealth>) -> Self {
        Self { result: Ok(nodes) }
    }

    pub fn failing(error: ClusterQueryError) -> Self {
        Self { result: Err(error) }
    }
}

impl ClusterHealthSource for StaticClusterHealth {
    fn node_health<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<NodeHealth>, ClusterQueryError>> + Send + 'a>> {
        Box::pin(async move { self.result.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(HttpClusterHealth::classify_status(StatusCode::OK), None);
        assert!(matches!(
            HttpClusterHealth::classify_status(StatusCode::SERVICE_UNAVAILABLE),
            Some(ClusterQueryError::Transient(_))
        ));
        assert!(matches!(
            HttpClusterHealth::classify_status(StatusCode::NOT_FOUND),
            Some(ClusterQueryError::Other(_))
        ));
    }

    #[test]
    fn test_response_payload_parses() {
        let body: ClusterHealthResponse = serde_json::from_str(
            r#"{"nodes":[{"name":"n0","health":"Ok"},{"name":"n1","health":"Error"}]}"#,
        )
        .unwrap();
        assert_eq!(body.nodes.len(), 2);
        assert_eq!(body.nodes[1].health, HealthState::Error);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient_or_timeout() {
        // Port 9 (discard) on localhost is expected to refuse connections
        let source =
            HttpClusterHealth::new("http://127.0.0.1:9/health", Duration::from_secs(2)).unwrap();
        let result = source.node_health().await;
        assert!(matches!(
            result,
            Err(ClusterQueryError::Transient(_)) | Err(ClusterQueryError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_static_source_returns_snapshot() {
        let source = StaticClusterHealth::new(vec![NodeHealth {
            name: "n0".to_string(),
            health: HealthState::Ok,
        }]);
        assert_eq!(source.node_health().await.unwrap().len(), 1);
    }
}
