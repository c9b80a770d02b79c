//! First-use health probes and context-window discovery for local backends.

use std::time::Duration;

use serde_json::{Value, json};

use crate::{
    error::{LlmError, LlmResult},
    provider::ProviderDescriptor,
};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const CONTEXT_TIMEOUT: Duration = Duration::from_secs(3);

/// Assumed context window when the backend exposes no model metadata.
pub(crate) const DEFAULT_CONTEXT_WINDOW: u32 = 8192;

/// Probe the provider's health endpoints in order. Any 2xx wins.
pub(crate) async fn check_health(
    client: &reqwest::Client,
    provider: &ProviderDescriptor,
) -> LlmResult<()> {
    for path in provider.health_paths {
        let url = format!("{}{}", provider.base_url, path);

        match tokio::time::timeout(HEALTH_TIMEOUT, client.get(&url).send()).await {
            Ok(Ok(response)) if response.status().is_success() => {
                log::debug!("health probe {url} succeeded");
                return Ok(());
            }
            Ok(Ok(response)) => {
                log::debug!("health probe {url} returned {}", response.status());
            }
            Ok(Err(e)) => {
                log::debug!("health probe {url} failed: {e}");
            }
            Err(_) => {
                log::debug!("health probe {url} timed out");
            }
        }
    }

    let mut message = format!(
        "{} is not reachable at {}",
        provider.name, provider.base_url
    );
    if let Some(start) = provider.start_command {
        message.push_str(&format!(" (start it with `{start}`)"));
    }

    Err(LlmError::ConnectionError(message))
}

/// Discover the model's context window where the provider exposes metadata;
/// currently only Ollama's `/api/show` does.
pub(crate) async fn discover_context_window(
    client: &reqwest::Client,
    provider: &ProviderDescriptor,
    model: &str,
) -> u32 {
    if provider.name != "ollama" {
        return DEFAULT_CONTEXT_WINDOW;
    }

    let url = format!("{}/api/show", provider.base_url);
    let request = client.post(&url).json(&json!({ "model": model })).send();

    let response = match tokio::time::timeout(CONTEXT_TIMEOUT, request).await {
        Ok(Ok(response)) if response.status().is_success() => response,
        Ok(Ok(response)) => {
            log::debug!("context probe {url} returned {}", response.status());
            return DEFAULT_CONTEXT_WINDOW;
        }
        Ok(Err(e)) => {
            log::debug!("context probe {url} failed: {e}");
            return DEFAULT_CONTEXT_WINDOW;
        }
        Err(_) => {
            log::debug!("context probe {url} timed out");
            return DEFAULT_CONTEXT_WINDOW;
        }
    };

    let body: Value = match response.json().await {
        Ok(body) => body,
        Err(e) => {
            log::debug!("context probe returned unparseable body: {e}");
            return DEFAULT_CONTEXT_WINDOW;
        }
    };

    let window = parse_context_window(&body).unwrap_or(DEFAULT_CONTEXT_WINDOW);
    log::debug!("model '{model}' context window: {window}");
    window
}

/// `/api/show` reports the window under `model_info` with an
/// architecture-specific key like `llama.context_length`.
fn parse_context_window(body: &Value) -> Option<u32> {
    let model_info = body.get("model_info")?.as_object()?;

    model_info
        .iter()
        .find(|(key, _)| key.ends_with(".context_length"))
        .and_then(|(_, value)| value.as_u64())
        .map(|v| v as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_ollama_show_payload() {
        let body = json!({
            "details": {"family": "qwen3"},
            "model_info": {
                "general.architecture": "qwen3",
                "qwen3.context_length": 40960,
                "qwen3.embedding_length": 4096
            }
        });

        assert_eq!(parse_context_window(&body), Some(40960));
    }

    #[test]
    fn missing_metadata_falls_back() {
        assert_eq!(parse_context_window(&json!({})), None);
        assert_eq!(parse_context_window(&json!({"model_info": {}})), None);
    }
}
