//! Provider descriptors and model resolution.
//!
//! A model identifier resolves, in order, to:
//!
//! 1. a registered local provider, when it carries a known prefix
//!    (`ollama/qwen3:8b`, `lmstudio:llama-3.2-3b`),
//! 2. an ad-hoc provider, when it is an absolute URL whose last path segment
//!    names the model,
//! 3. a custom provider, when `CLAUDISH_BASE_URL` is configured,
//! 4. the hosted aggregator otherwise.
//!
//! Environment variables are re-read on every lookup so a restarted backend
//! on a new port is picked up without restarting the proxy.

pub(crate) mod health;
pub(crate) mod openai;

use secrecy::SecretString;
use url::Url;

use crate::error::{LlmError, LlmResult};

/// Generic credential for local servers, used when the provider-specific
/// variable is unset.
const LOCAL_API_KEY_ENV: &str = "CLAUDISH_LOCAL_API_KEY";

/// Custom OpenAI-compatible endpoint override.
const CUSTOM_BASE_URL_ENV: &str = "CLAUDISH_BASE_URL";

const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api";
const OPENAI_CHAT_PATH: &str = "/v1/chat/completions";

/// What a backend can do. Gating happens before the request leaves the proxy
/// so unsupported features degrade predictably instead of erroring upstream.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ProviderCapabilities {
    pub supports_tools: bool,
    pub supports_vision: bool,
    pub supports_streaming: bool,
    pub supports_json_mode: bool,
}

impl ProviderCapabilities {
    const FULL: Self = Self {
        supports_tools: true,
        supports_vision: true,
        supports_streaming: true,
        supports_json_mode: true,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProviderKind {
    /// A registered local server (Ollama, LM Studio, vLLM, MLX).
    Local,
    /// The hosted aggregator.
    Hosted,
    /// `CLAUDISH_BASE_URL` override.
    Custom,
    /// Parsed out of a URL-shaped model identifier.
    AdHoc,
}

/// A resolved backend endpoint.
#[derive(Debug, Clone)]
pub(crate) struct ProviderDescriptor {
    pub name: String,
    pub base_url: String,
    pub api_path: String,
    pub kind: ProviderKind,
    pub capabilities: ProviderCapabilities,
    /// Provider-specific credential variable.
    pub api_key_env: Option<&'static str>,
    /// Canonical command to start the server, quoted in connection errors.
    pub start_command: Option<&'static str>,
    /// Probe paths tried in order by the health gate.
    pub health_paths: &'static [&'static str],
}

impl ProviderDescriptor {
    /// Full URL for chat completions.
    pub fn chat_url(&self) -> String {
        format!("{}{}", self.base_url, self.api_path)
    }

    /// Credential lookup: the provider-specific variable first, then the
    /// generic local key for local servers. Local servers without a
    /// configured key get no credential at all.
    pub fn api_key(&self) -> Option<SecretString> {
        let from_env = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        let key = self
            .api_key_env
            .and_then(from_env)
            .or_else(|| match self.kind {
                ProviderKind::Local | ProviderKind::Custom | ProviderKind::AdHoc => {
                    from_env(LOCAL_API_KEY_ENV)
                }
                ProviderKind::Hosted => None,
            });

        key.map(SecretString::from)
    }

    /// Whether the first-use health gate applies.
    pub fn needs_health_check(&self) -> bool {
        matches!(self.kind, ProviderKind::Local | ProviderKind::AdHoc)
    }
}

/// A model identifier resolved to a provider plus the model name to send
/// upstream.
#[derive(Debug, Clone)]
pub(crate) struct Resolution {
    pub provider: ProviderDescriptor,
    pub model: String,
}

struct ProviderTemplate {
    name: &'static str,
    prefixes: &'static [&'static str],
    base_url_envs: &'static [&'static str],
    default_base_url: &'static str,
    api_key_env: &'static str,
    start_command: &'static str,
    health_paths: &'static [&'static str],
    capabilities: ProviderCapabilities,
}

/// Registered local providers. Default ports follow each server's
/// documentation.
const TEMPLATES: &[ProviderTemplate] = &[
    ProviderTemplate {
        name: "ollama",
        prefixes: &["ollama/", "ollama:"],
        base_url_envs: &["OLLAMA_HOST", "OLLAMA_BASE_URL"],
        default_base_url: "http://localhost:11434",
        api_key_env: "OLLAMA_API_KEY",
        start_command: "ollama serve",
        health_paths: &["/api/tags", "/v1/models"],
        capabilities: ProviderCapabilities::FULL,
    },
    ProviderTemplate {
        name: "lmstudio",
        prefixes: &["lmstudio/", "lmstudio:"],
        base_url_envs: &["LMSTUDIO_BASE_URL"],
        default_base_url: "http://localhost:1234",
        api_key_env: "LMSTUDIO_API_KEY",
        start_command: "lms server start",
        health_paths: &["/v1/models"],
        capabilities: ProviderCapabilities::FULL,
    },
    ProviderTemplate {
        name: "vllm",
        prefixes: &["vllm/", "vllm:"],
        base_url_envs: &["VLLM_BASE_URL"],
        default_base_url: "http://localhost:8000",
        api_key_env: "VLLM_API_KEY",
        start_command: "vllm serve <model>",
        health_paths: &["/v1/models"],
        capabilities: ProviderCapabilities::FULL,
    },
    ProviderTemplate {
        name: "mlx",
        prefixes: &["mlx/", "mlx:"],
        base_url_envs: &["MLX_BASE_URL"],
        default_base_url: "http://localhost:8080",
        api_key_env: "MLX_API_KEY",
        start_command: "mlx_lm.server --port 8080",
        health_paths: &["/v1/models"],
        // mlx_lm.server streams fine but has no native tool calling.
        capabilities: ProviderCapabilities {
            supports_tools: false,
            supports_vision: false,
            supports_streaming: true,
            supports_json_mode: false,
        },
    },
];

impl ProviderTemplate {
    fn descriptor(&self) -> ProviderDescriptor {
        let base_url = self
            .base_url_envs
            .iter()
            .find_map(|name| std::env::var(name).ok().filter(|v| !v.is_empty()))
            .map(|value| normalize_base_url(&value))
            .unwrap_or_else(|| self.default_base_url.to_string());

        ProviderDescriptor {
            name: self.name.to_string(),
            base_url,
            api_path: OPENAI_CHAT_PATH.to_string(),
            kind: ProviderKind::Local,
            capabilities: self.capabilities,
            api_key_env: Some(self.api_key_env),
            start_command: Some(self.start_command),
            health_paths: self.health_paths,
        }
    }
}

/// Accept `host:port` without a scheme (the OLLAMA_HOST convention) and strip
/// trailing slashes.
fn normalize_base_url(value: &str) -> String {
    let with_scheme = if value.contains("://") {
        value.to_string()
    } else {
        format!("http://{value}")
    };

    with_scheme.trim_end_matches('/').to_string()
}

/// Resolve a model identifier to a backend.
pub(crate) fn resolve_model(model_id: &str) -> LlmResult<Resolution> {
    for template in TEMPLATES {
        for prefix in template.prefixes {
            if let Some(stripped) = model_id.strip_prefix(prefix) {
                if stripped.is_empty() {
                    return Err(LlmError::InvalidRequest(format!(
                        "model identifier '{model_id}' has a provider prefix but no model name"
                    )));
                }

                log::debug!(
                    "model '{model_id}' routed to provider '{}' as '{stripped}'",
                    template.name
                );

                return Ok(Resolution {
                    provider: template.descriptor(),
                    model: stripped.to_string(),
                });
            }
        }
    }

    if model_id.starts_with("http://") || model_id.starts_with("https://") {
        return resolve_url_model(model_id);
    }

    if let Ok(base_url) = std::env::var(CUSTOM_BASE_URL_ENV)
        && !base_url.is_empty()
    {
        log::debug!("model '{model_id}' routed to custom base URL");

        return Ok(Resolution {
            provider: ProviderDescriptor {
                name: "custom".to_string(),
                base_url: normalize_base_url(&base_url),
                api_path: OPENAI_CHAT_PATH.to_string(),
                kind: ProviderKind::Custom,
                capabilities: ProviderCapabilities::FULL,
                api_key_env: None,
                start_command: None,
                health_paths: &["/v1/models"],
            },
            model: model_id.to_string(),
        });
    }

    log::debug!("model '{model_id}' routed to hosted aggregator");

    Ok(Resolution {
        provider: ProviderDescriptor {
            name: "openrouter".to_string(),
            base_url: OPENROUTER_BASE_URL.to_string(),
            api_path: OPENAI_CHAT_PATH.to_string(),
            kind: ProviderKind::Hosted,
            capabilities: ProviderCapabilities::FULL,
            api_key_env: Some("OPENROUTER_API_KEY"),
            start_command: None,
            health_paths: &[],
        },
        model: model_id.to_string(),
    })
}

/// A URL-shaped model identifier: the trailing path segment is the model, the
/// rest is the endpoint.
fn resolve_url_model(model_id: &str) -> LlmResult<Resolution> {
    let url = Url::parse(model_id)
        .map_err(|e| LlmError::InvalidRequest(format!("invalid model URL '{model_id}': {e}")))?;

    let mut segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default();

    let Some(model) = segments.pop().filter(|m| !m.is_empty()) else {
        return Err(LlmError::InvalidRequest(format!(
            "model URL '{model_id}' has no trailing model segment"
        )));
    };

    let host = url
        .host_str()
        .ok_or_else(|| LlmError::InvalidRequest(format!("model URL '{model_id}' has no host")))?;

    let mut base_url = format!("{}://{host}", url.scheme());
    if let Some(port) = url.port() {
        base_url.push_str(&format!(":{port}"));
    }
    for segment in &segments {
        base_url.push('/');
        base_url.push_str(segment);
    }

    log::debug!("model URL '{model_id}' parsed as base '{base_url}', model '{model}'");

    Ok(Resolution {
        provider: ProviderDescriptor {
            name: host.to_string(),
            base_url,
            api_path: OPENAI_CHAT_PATH.to_string(),
            kind: ProviderKind::AdHoc,
            capabilities: ProviderCapabilities::FULL,
            api_key_env: None,
            start_command: None,
            health_paths: &["/v1/models"],
        },
        model: model.to_string(),
    })
}
