//! Monitor mode: a pass-through to the vendor endpoint that logs both
//! directions for offline fixture capture.
//!
//! The translator is bypassed entirely; bytes go upstream as received and
//! events come back verbatim. Logged copies are normalized so captured
//! fixtures are reproducible run over run.

use std::{convert::Infallible, sync::LazyLock};

use axum::{
    body::Bytes,
    http::HeaderMap,
    response::{IntoResponse, Response, Sse, sse::Event},
};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use regex::Regex;
use reqwest::Method;

use crate::error::LlmError;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com";

/// Headers forwarded to the vendor. The client's own credential passes
/// through untouched; `ANTHROPIC_API_KEY` only fills in when the client
/// sent none.
const FORWARDED_HEADERS: &[&str] = &[
    "authorization",
    "x-api-key",
    "anthropic-version",
    "anthropic-beta",
    "content-type",
];

/// Dynamic identifiers scrubbed from logged fixtures.
static DYNAMIC_IDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(msg|toolu|req)_[A-Za-z0-9]{6,}").expect("redaction pattern is static")
});

pub(crate) struct MonitorProxy {
    client: reqwest::Client,
    base_url: String,
}

impl Default for MonitorProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorProxy {
    pub fn new() -> Self {
        let base_url = std::env::var("ANTHROPIC_BASE_URL")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| ANTHROPIC_API_URL.to_string());

        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Forward a request verbatim and relay the reply, logging both sides.
    pub async fn forward(
        &self,
        method: Method,
        path: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Response {
        // Prefer the client's own credential; fall back to the environment.
        let has_client_credential =
            headers.contains_key("authorization") || headers.contains_key("x-api-key");
        let fallback_key = std::env::var("ANTHROPIC_API_KEY")
            .ok()
            .filter(|v| !v.is_empty());

        if !has_client_credential && fallback_key.is_none() {
            return LlmError::AuthenticationFailed(
                "monitor mode needs an Anthropic credential; none in the request or ANTHROPIC_API_KEY"
                    .to_string(),
            )
            .into_response();
        }

        if !body.is_empty() {
            log::info!(
                "monitor request {path}: {}",
                normalize_fixture(&String::from_utf8_lossy(&body))
            );
        }

        let url = format!("{}{path}", self.base_url);
        let mut builder = self.client.request(method, &url);

        for name in FORWARDED_HEADERS {
            if let Some(value) = headers.get(*name) {
                builder = builder.header(*name, value);
            }
        }
        if !has_client_credential
            && let Some(key) = fallback_key
        {
            builder = builder.header("x-api-key", key);
        }
        if !body.is_empty() {
            builder = builder.body(body);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                log::error!("monitor forward to {url} failed: {e}");
                return LlmError::ConnectionError(format!(
                    "could not reach the Anthropic API: {e}"
                ))
                .into_response();
            }
        };

        let status = response.status();
        let is_event_stream = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("text/event-stream"));

        if is_event_stream && status.is_success() {
            let event_stream = response.bytes_stream().eventsource().filter_map(|event| async {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        log::error!("monitor stream parse error: {e}");
                        return None;
                    }
                };

                log::info!(
                    "monitor event {}: {}",
                    event.event,
                    normalize_fixture(&event.data)
                );

                Some(Ok::<_, Infallible>(
                    Event::default().event(event.event).data(event.data),
                ))
            });

            return Sse::new(event_stream).into_response();
        }

        let body = response.bytes().await.unwrap_or_default();
        log::info!(
            "monitor response {status}: {}",
            normalize_fixture(&String::from_utf8_lossy(&body))
        );

        (
            status,
            [("content-type", "application/json")],
            body,
        )
            .into_response()
    }
}

/// Replace dynamic identifiers with stable placeholders.
fn normalize_fixture(text: &str) -> String {
    DYNAMIC_IDS.replace_all(text, "${1}_redacted").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_redacts_dynamic_ids() {
        let raw = r#"{"id":"msg_01XFDUDYJgAACzvnptvVoYEL","content":[{"type":"tool_use","id":"toolu_9qZx83kFm2"}]}"#;
        let normalized = normalize_fixture(raw);

        assert_eq!(
            normalized,
            r#"{"id":"msg_redacted","content":[{"type":"tool_use","id":"toolu_redacted"}]}"#
        );
    }

    #[test]
    fn normalization_leaves_ordinary_text_alone() {
        let raw = r#"{"model":"claude-sonnet-4-5","stop_reason":"end_turn"}"#;
        assert_eq!(normalize_fixture(raw), raw);
    }
}
