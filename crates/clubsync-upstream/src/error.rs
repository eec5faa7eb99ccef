use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("too many requests: upstream kept answering 502 after retries")]
    TooManyRequests,
    #[error("request failed with http status {status}: {body}")]
    RequestFailed { status: u16, body: String },
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("event not found")]
    EventNotFound,
    #[error("unsupported meetup")]
    UnsupportedMeetup,
    #[error("upstream error: {0}")]
    Graphql(String),
    #[error("malformed upstream response: {0}")]
    Malformed(String),
}

impl UpstreamError {
    /// The record asked about no longer exists upstream, or never will be
    /// importable. Either way retrying the same call cannot help.
    pub fn is_skippable(&self) -> bool {
        matches!(self, Self::EventNotFound | Self::UnsupportedMeetup)
    }

    /// The same call may succeed later: rate limiting, cancellation, network
    /// trouble and server-side failures.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Cancelled | Self::TooManyRequests | Self::Http(_) => true,
            Self::RequestFailed { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Only a bad gateway is retried in place; every other status is handed to
/// the caller to classify.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::BAD_GATEWAY {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphqlError {
    pub message: String,
    #[serde(default)]
    pub extensions: Option<JsonValue>,
}

impl GraphqlError {
    fn code(&self) -> Option<&str> {
        self.extensions
            .as_ref()
            .and_then(|ext| ext.get("code"))
            .and_then(JsonValue::as_str)
    }

    fn is_event_not_found(&self) -> bool {
        self.message.trim().eq_ignore_ascii_case("event not found")
            || self.code() == Some("EVENT_NOT_FOUND")
    }

    fn is_unsupported(&self) -> bool {
        self.message.to_ascii_lowercase().contains("unsupported")
            || self.code() == Some("UNSUPPORTED_MEETUP")
    }
}

/// Fold a non-empty GraphQL `errors` array into one error. Any not-found
/// entry is definitive, then any unsupported entry; the rest are joined.
pub fn classify_graphql_errors(errors: &[GraphqlError]) -> UpstreamError {
    if errors.iter().any(GraphqlError::is_event_not_found) {
        return UpstreamError::EventNotFound;
    }
    if errors.iter().any(GraphqlError::is_unsupported) {
        return UpstreamError::UnsupportedMeetup;
    }
    UpstreamError::Graphql(
        errors
            .iter()
            .map(|err| err.message.as_str())
            .collect::<Vec<_>>()
            .join("; "),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn err(message: &str) -> GraphqlError {
        GraphqlError {
            message: message.to_string(),
            extensions: None,
        }
    }

    #[test]
    fn not_found_wins_over_other_errors() {
        let errors = vec![err("rate limited"), err("Event not found"), err("unsupported meetup")];
        assert!(matches!(
            classify_graphql_errors(&errors),
            UpstreamError::EventNotFound
        ));
    }

    #[test]
    fn extension_codes_are_recognised() {
        let errors = vec![GraphqlError {
            message: "nope".into(),
            extensions: Some(json!({ "code": "UNSUPPORTED_MEETUP" })),
        }];
        assert!(matches!(
            classify_graphql_errors(&errors),
            UpstreamError::UnsupportedMeetup
        ));
    }

    #[test]
    fn opaque_errors_are_joined() {
        let errors = vec![err("first"), err("second")];
        match classify_graphql_errors(&errors) {
            UpstreamError::Graphql(message) => assert_eq!(message, "first; second"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn transient_errors_are_told_apart_from_permanent_ones() {
        let failed = |status| UpstreamError::RequestFailed {
            status,
            body: String::new(),
        };
        assert!(UpstreamError::TooManyRequests.is_transient());
        assert!(failed(503).is_transient());
        assert!(failed(429).is_transient());
        assert!(!failed(403).is_transient());
        assert!(!UpstreamError::Graphql("forbidden".into()).is_transient());
        assert!(!UpstreamError::Malformed("no id".into()).is_transient());
    }

    #[test]
    fn only_bad_gateway_is_retried_in_place() {
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::NonRetryable
        );
    }
}
