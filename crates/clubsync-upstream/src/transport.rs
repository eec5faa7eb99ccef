use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::error::{classify_graphql_errors, classify_status, GraphqlError, RetryDisposition};
use crate::limiter::{RateLimiter, TokenBucketConfig};
use crate::UpstreamError;

/// Fixed backoff applied to 502 responses. Other statuses are not retried
/// here; the orchestrator decides what to do with them.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub bad_gateway_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            bad_gateway_backoff: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GraphqlClientConfig {
    pub endpoint: String,
    pub api_token: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
    pub token_bucket: TokenBucketConfig,
}

impl GraphqlClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_token: None,
            timeout: Duration::from_secs(30),
            user_agent: None,
            retry: RetryPolicy::default(),
            token_bucket: TokenBucketConfig::default(),
        }
    }
}

#[derive(Debug, Serialize)]
struct GraphqlRequest<'a> {
    query: &'a str,
    variables: &'a JsonValue,
}

#[derive(Debug, Deserialize)]
struct GraphqlEnvelope<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Debug, Clone)]
pub struct GraphqlClient {
    client: reqwest::Client,
    endpoint: String,
    api_token: Option<String>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
}

impl GraphqlClient {
    pub fn new(config: GraphqlClientConfig) -> Result<Self, UpstreamError> {
        let limiter = Arc::new(RateLimiter::new(config.token_bucket));
        Self::with_limiter(config, limiter)
    }

    /// Build a client that draws tokens from an existing limiter.
    pub fn with_limiter(
        config: GraphqlClientConfig,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self, UpstreamError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            endpoint: config.endpoint,
            api_token: config.api_token,
            limiter,
            retry: config.retry,
        })
    }

    /// Run one GraphQL operation and decode its `data` member into `T`.
    pub async fn execute<T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        query: &str,
        variables: JsonValue,
    ) -> Result<T, UpstreamError> {
        let span = info_span!("graphql_execute", endpoint = %self.endpoint);
        self.execute_inner(cancel, query, &variables)
            .instrument(span)
            .await
    }

    async fn execute_inner<T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        query: &str,
        variables: &JsonValue,
    ) -> Result<T, UpstreamError> {
        let body = GraphqlRequest { query, variables };

        for attempt in 0..=self.retry.max_retries {
            self.limiter.wait(cancel).await?;

            let mut request = self
                .client
                .post(&self.endpoint)
                .header(ACCEPT, "application/json")
                .header(CONTENT_TYPE, "application/json")
                .json(&body);
            if let Some(token) = &self.api_token {
                request = request.bearer_auth(token);
            }

            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(UpstreamError::Cancelled),
                response = request.send() => response?,
            };
            let status = response.status();

            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                if classify_status(status) == RetryDisposition::Retryable {
                    if attempt == self.retry.max_retries {
                        break;
                    }
                    warn!(
                        attempt,
                        status = status.as_u16(),
                        backoff_secs = self.retry.bad_gateway_backoff.as_secs_f64(),
                        "upstream bad gateway, backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(UpstreamError::Cancelled),
                        _ = tokio::time::sleep(self.retry.bad_gateway_backoff) => {}
                    }
                    continue;
                }
                return Err(UpstreamError::RequestFailed {
                    status: status.as_u16(),
                    body: text,
                });
            }

            let text = tokio::select! {
                _ = cancel.cancelled() => return Err(UpstreamError::Cancelled),
                text = response.text() => text?,
            };
            return decode_envelope(&text);
        }

        Err(UpstreamError::TooManyRequests)
    }
}

fn decode_envelope<T: DeserializeOwned>(text: &str) -> Result<T, UpstreamError> {
    let envelope: GraphqlEnvelope<T> = serde_json::from_str(text)
        .map_err(|err| UpstreamError::Malformed(format!("decoding response envelope: {err}")))?;

    if !envelope.errors.is_empty() {
        debug!(count = envelope.errors.len(), "upstream returned graphql errors");
        return Err(classify_graphql_errors(&envelope.errors));
    }

    envelope
        .data
        .ok_or_else(|| UpstreamError::Malformed("response has neither data nor errors".into()))
}
