use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::messages::anthropic::{AnthropicErrorBody, AnthropicErrorDetails};

pub type LlmResult<T> = std::result::Result<T, LlmError>;

/// Proxy errors, mapped to both an HTTP status and the error `type` string
/// the client understands.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Malformed incoming request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Missing or rejected credential.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The backend does not know the requested model.
    #[error("{0}")]
    ModelNotFound(String),

    /// The backend cannot fulfill a requested feature (e.g. tool calls).
    #[error("{0}")]
    CapabilityError(String),

    /// A local backend is unreachable.
    #[error("{0}")]
    ConnectionError(String),

    /// Upstream rate limit.
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// Upstream is overloaded.
    #[error("Upstream overloaded: {0}")]
    Overloaded(String),

    /// A probe or request exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Any other non-2xx from the backend, with its original status.
    #[error("Upstream API error ({status}): {message}")]
    ProviderApiError { status: u16, message: String },

    /// Internal error. `Some` carries a provider message safe to surface;
    /// `None` must not leak details.
    #[error("Internal server error")]
    Internal(Option<String>),
}

impl LlmError {
    /// HTTP status for errors surfaced before the stream starts.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::CapabilityError(_) => StatusCode::BAD_REQUEST,
            Self::AuthenticationFailed(_) => StatusCode::UNAUTHORIZED,
            Self::ModelNotFound(_) => StatusCode::NOT_FOUND,
            Self::RateLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::ConnectionError(_) | Self::Overloaded(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::ProviderApiError { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The error `type` string emitted to the client.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "validation_error",
            Self::AuthenticationFailed(_) => "authentication_error",
            Self::ModelNotFound(_) => "model_not_found",
            Self::CapabilityError(_) => "capability_error",
            Self::ConnectionError(_) => "connection_error",
            Self::RateLimitExceeded(_) => "rate_limit_error",
            Self::Overloaded(_) => "overloaded_error",
            Self::Timeout(_) => "timeout_error",
            Self::ProviderApiError { .. } => "api_error",
            Self::Internal(_) => "api_error",
        }
    }

    /// Message that is safe to expose to the client.
    pub fn client_message(&self) -> String {
        match self {
            Self::Internal(Some(provider_msg)) => provider_msg.clone(),
            Self::Internal(None) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }

    /// Error payload for the in-stream `error` event, used once the HTTP
    /// status can no longer be changed.
    pub fn stream_details(&self) -> AnthropicErrorDetails {
        AnthropicErrorDetails {
            error_type: self.error_type().to_string(),
            message: self.client_message(),
        }
    }
}

impl IntoResponse for LlmError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = AnthropicErrorBody::new(self.error_type(), self.client_message());

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_and_type_mapping() {
        let cases = [
            (
                LlmError::InvalidRequest("bad".into()),
                StatusCode::BAD_REQUEST,
                "validation_error",
            ),
            (
                LlmError::AuthenticationFailed("no key".into()),
                StatusCode::UNAUTHORIZED,
                "authentication_error",
            ),
            (
                LlmError::ModelNotFound("nope".into()),
                StatusCode::NOT_FOUND,
                "model_not_found",
            ),
            (
                LlmError::ConnectionError("refused".into()),
                StatusCode::SERVICE_UNAVAILABLE,
                "connection_error",
            ),
            (
                LlmError::RateLimitExceeded("slow down".into()),
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limit_error",
            ),
            (
                LlmError::ProviderApiError {
                    status: 418,
                    message: "teapot".into(),
                },
                StatusCode::IM_A_TEAPOT,
                "api_error",
            ),
        ];

        for (error, status, error_type) in cases {
            assert_eq!(error.status_code(), status, "{error:?}");
            assert_eq!(error.error_type(), error_type, "{error:?}");
        }
    }

    #[test]
    fn internal_error_hides_details_without_provider_message() {
        assert_eq!(
            LlmError::Internal(None).client_message(),
            "Internal server error"
        );
        assert_eq!(
            LlmError::Internal(Some("backend exploded".into())).client_message(),
            "backend exploded"
        );
    }

    #[test]
    fn stream_details_carry_the_taxonomy_type() {
        let details = LlmError::CapabilityError("model has no tool support".into()).stream_details();
        assert_eq!(details.error_type, "capability_error");
        assert_eq!(details.message, "model has no tool support");
    }
}
