use anyhow::Context;
use clap::Parser;

use args::Args;

mod args;
mod logger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    logger::init(args.debug);

    let reasoning_policy = match args.reasoning.as_deref() {
        Some(value) => value.parse().map_err(anyhow::Error::msg)?,
        None => llm::ReasoningPolicy::default(),
    };

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", args.port))
        .await
        .with_context(|| format!("could not bind loopback port {}", args.port))?;

    let port = listener.local_addr()?.port();

    let config = llm::ProxyConfig {
        port,
        model: args.model,
        monitor: args.monitor,
        reasoning_policy,
    };

    llm::serve(listener, config, shutdown_signal()).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("could not listen for shutdown signal: {e}");
        return;
    }

    log::info!("shutting down");
}
