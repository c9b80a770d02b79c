//! A loopback translating proxy between the Anthropic Messages protocol and
//! OpenAI-compatible chat backends.
//!
//! The client is pointed at this listener and keeps speaking its native
//! protocol; the proxy rewrites requests for the selected backend (hosted
//! aggregator, Ollama, LM Studio, vLLM, MLX, or a custom base URL) and
//! reconstructs the block-oriented SSE event sequence from the backend's
//! delta stream in flight.

use std::{convert::Infallible, sync::Arc};

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::HeaderMap,
    middleware,
    response::{IntoResponse, Response, Sse, sse::Event},
    routing::{get, post},
};
use futures::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

mod adapter;
mod error;
mod messages;
mod provider;
mod proxy;
mod request;
mod server;
mod stream;
mod token_counter;
mod usage;

pub use error::{LlmError, LlmResult as Result};
pub use stream::ReasoningPolicy;

use messages::anthropic::{
    AnthropicChatRequest, AnthropicModel, AnthropicModelsResponse, CountTokensRequest,
    CountTokensResponse,
};
use proxy::MonitorProxy;
use server::{LlmServer, MessagesReply, ServerConfig};

/// Configuration handed in by the launcher.
pub struct ProxyConfig {
    /// Loopback port this listener is bound to; names the status file.
    pub port: u16,
    /// The selected model identifier, routed as-is.
    pub model: String,
    /// Pass-through to the vendor endpoint instead of translating.
    pub monitor: bool,
    pub reasoning_policy: ReasoningPolicy,
}

/// Bind the proxy endpoints and serve until `shutdown` resolves.
pub async fn serve(
    listener: tokio::net::TcpListener,
    config: ProxyConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    let (router, server) = build_router(config);

    log::info!("claudish listening on http://{addr}");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    if let Some(server) = server {
        server.totals().remove_status_file();
    }

    Ok(())
}

fn build_router(config: ProxyConfig) -> (Router, Option<Arc<LlmServer>>) {
    if config.monitor {
        log::info!("monitor mode: forwarding to the vendor endpoint unchanged");

        let monitor = Arc::new(MonitorProxy::new());
        let router = Router::new()
            .route("/v1/messages", post(monitor_messages))
            .route("/v1/messages/count_tokens", post(monitor_count_tokens))
            .route("/v1/models", get(monitor_models))
            .layer(middleware::from_fn(log_request))
            .with_state(monitor);

        return (router, None);
    }

    let server = Arc::new(LlmServer::new(ServerConfig {
        port: config.port,
        model: config.model,
        reasoning_policy: config.reasoning_policy,
    }));

    // Periodic eviction of stale conversation-cache entries; runs for the
    // life of the process.
    let _ = server.cache().spawn_sweeper();

    let router = Router::new()
        .route("/v1/messages", post(anthropic_messages))
        .route("/v1/messages/count_tokens", post(count_tokens))
        .route("/v1/models", get(list_models))
        .layer(middleware::from_fn(log_request))
        .with_state(Arc::clone(&server));

    (router, Some(server))
}

/// Handle a messages request: streaming requests produce an SSE response,
/// non-streaming ones a complete message body.
async fn anthropic_messages(
    State(server): State<Arc<LlmServer>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let request: AnthropicChatRequest = serde_json::from_slice(&body)
        .map_err(|e| LlmError::InvalidRequest(format!("malformed request body: {e}")))?;

    log::debug!(
        "messages request: model={}, messages={}, stream={}",
        request.model,
        request.messages.len(),
        request.stream.unwrap_or(false)
    );

    let context = request::extract_context(&headers);

    match server.handle_messages(&context, request).await? {
        MessagesReply::Complete(response) => Ok(Json(*response).into_response()),
        MessagesReply::Stream(rx) => {
            let event_stream = ReceiverStream::new(rx).map(|event| {
                let sse = Event::default().event(event.event_name());

                let sse = match serde_json::to_string(&event) {
                    Ok(json) => sse.data(json),
                    Err(e) => {
                        log::error!("failed to serialize stream event: {e}");
                        sse.data(r#"{"type":"ping"}"#)
                    }
                };

                Ok::<_, Infallible>(sse)
            });

            Ok(Sse::new(event_stream).into_response())
        }
    }
}

/// Token estimate from the request size; local backends expose no tokenizer.
async fn count_tokens(body: Bytes) -> Result<Json<CountTokensResponse>> {
    let request: CountTokensRequest = serde_json::from_slice(&body)
        .map_err(|e| LlmError::InvalidRequest(format!("malformed request body: {e}")))?;

    let input_tokens = token_counter::count_request_tokens(&request);
    log::debug!("count_tokens for {}: {input_tokens}", request.model);

    Ok(Json(CountTokensResponse { input_tokens }))
}

/// A synthetic single-entry list naming the currently routed model.
async fn list_models(State(server): State<Arc<LlmServer>>) -> Json<AnthropicModelsResponse> {
    Json(AnthropicModelsResponse {
        data: vec![AnthropicModel {
            id: server.model().to_string(),
            model_type: "model".to_string(),
            display_name: server.model().to_string(),
            created_at: 0,
        }],
        has_more: false,
    })
}

async fn monitor_messages(
    State(monitor): State<Arc<MonitorProxy>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    monitor
        .forward(reqwest::Method::POST, "/v1/messages", &headers, body)
        .await
}

async fn monitor_count_tokens(
    State(monitor): State<Arc<MonitorProxy>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    monitor
        .forward(
            reqwest::Method::POST,
            "/v1/messages/count_tokens",
            &headers,
            body,
        )
        .await
}

async fn monitor_models(State(monitor): State<Arc<MonitorProxy>>, headers: HeaderMap) -> Response {
    monitor
        .forward(reqwest::Method::GET, "/v1/models", &headers, Bytes::new())
        .await
}

async fn log_request(request: axum::extract::Request, next: middleware::Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    log::debug!("{method} {path} -> {}", response.status());
    response
}
