use crate::data_source::DataSource;
use crate::error::{ApiError, ApiResult};
use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// HTTP GraphQL query executor
pub struct GraphQlClient {
    endpoint_url: String,
    auth_token: String,
    client: reqwest::Client,
}

impl GraphQlClient {
    pub fn new(endpoint_url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            auth_token: auth_token.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn post(&self, query: &str, timeout: Duration) -> ApiResult<GraphQlResponse> {
        if self.endpoint_url.is_empty() {
            return Err(ApiError::NotConfigured);
        }
        debug!("POST {} ({} bytes)", self.endpoint_url, query.len());
        let response = self
            .client
            .post(&self.endpoint_url)
            .bearer_auth(&self.auth_token)
            .timeout(timeout)
            .json(&GraphQlRequest { query })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl DataSource for GraphQlClient {
    async fn execute(&self, query: &str, timeout: Duration) -> ApiResult<Value> {
        let response = self.post(query, timeout).await?;
        if let Some(errors) = response.errors.filter(|e| !e.is_empty()) {
            let message = errors
                .iter()
                .map(|e| e.message.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            if response.data.is_none() {
                return Err(ApiError::GraphQl(message));
            }
            warn!("Partial GraphQL response: {message}");
        }
        response.data.ok_or(ApiError::MissingData)
    }

    fn name(&self) -> &str {
        &self.endpoint_url
    }
}

#[derive(Debug, Serialize)]
struct GraphQlRequest<'a> {
    query: &'a str,
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize)]
pub struct GraphQlResponse {
    pub data: Option<Value>,
    pub errors: Option<Vec<GraphQlError>>,
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize)]
pub struct GraphQlError {
    pub message: String,
}

#[cfg(test)]
mod test_graphql_client {
    use super::*;
    use crate::data_source::DEFAULT_QUERY_TIMEOUT;
    use serde_json::json;

    #[tokio::test]
    async fn test_execute_returns_data() {
        let mut server = mockito::Server::new_async().await;

        let mock = server
            .mock("POST", "/")
            .match_header("Authorization", "Bearer test_token")
            .match_body(mockito::Matcher::PartialJson(json!({"query": "{ viewer { name } }"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data": {"viewer": {"name": "Jan"}}}"#)
            .create_async()
            .await;

        let client = GraphQlClient::new(server.url(), "test_token");
        let result = client
            .execute("{ viewer { name } }", DEFAULT_QUERY_TIMEOUT)
            .await
            .unwrap();

        assert_eq!(result, json!({"viewer": {"name": "Jan"}}));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_execute_graphql_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"errors": [{"message": "home not found"}]}"#)
            .create_async()
            .await;

        let client = GraphQlClient::new(server.url(), "t");
        let err = client.execute("{}", DEFAULT_QUERY_TIMEOUT).await.unwrap_err();
        assert_eq!(err.to_string(), "graphql error: home not found");
    }

    #[tokio::test]
    async fn test_execute_http_status_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/")
            .with_status(401)
            .with_body("unauthorized")
            .create_async()
            .await;

        let client = GraphQlClient::new(server.url(), "bad");
        let err = client.execute("{}", DEFAULT_QUERY_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, ApiError::Status { status: 401, .. }));
    }

    #[tokio::test]
    async fn test_execute_no_endpoint() {
        let client = GraphQlClient::new("", "t");
        let result = client.execute("{}", DEFAULT_QUERY_TIMEOUT).await;

        assert!(result.is_err());
        assert_eq!(result.unwrap_err().to_string(), "no api endpoint configured");
    }
}
