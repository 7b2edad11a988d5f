#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]
use agentry::agent::AgentRegistry;
use agentry::chat::buffer::LogCodeSink;
use agentry::chat::client::{ChatCallback, ChatClient, ChatRequest, ChatResponseEvent};
use agentry::chat::scheduler::TokioScheduler;
use agentry::constants::UPSTREAM_API_KEY_ENV;
use agentry::engine::UpstreamEngine;
use agentry::logging::{init_tracing, panic_message, setup_panic_hook};
use agentry::main_helper::{build_http_client, ChatArgs, ServeArgs};
use agentry::router::build_router;
use agentry::*;

use clap::Parser;
use futures_util::FutureExt;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let log_dir = match &cli.command {
        Command::Serve(args) => args.log_dir.clone(),
        Command::Chat(args) => args.log_dir.clone(),
    };
    let _log_guards = match init_tracing(&log_dir) {
        Ok(guards) => guards,
        Err(e) => {
            eprintln!("Failed to set up logging in {}: {}", log_dir.display(), e);
            std::process::exit(1);
        }
    };

    setup_panic_hook();

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Chat(args) => chat(args).await,
    }
}

async fn serve(args: ServeArgs) {
    let registry = match AgentRegistry::load(&args.agents_file).await {
        Ok(r) => Arc::new(r),
        Err(e) => {
            eprintln!(
                "Failed to load agents from {}: {}",
                args.agents_file.display(),
                e.inner
            );
            std::process::exit(1);
        }
    };
    if registry.is_empty() {
        tracing::warn!("No agents defined; every request will be answered with 404");
    }

    let client = match build_http_client(&args) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to build HTTP client: {}", e.inner);
            std::process::exit(1);
        }
    };

    let api_key = std::env::var(UPSTREAM_API_KEY_ENV)
        .ok()
        .filter(|k| !k.is_empty());
    if api_key.is_none() {
        tracing::warn!(
            "{} is not set; upstream requests are sent without credentials",
            UPSTREAM_API_KEY_ENV
        );
    }

    let engine = Arc::new(UpstreamEngine::new(
        client,
        args.upstream_url.clone(),
        args.upstream_model.clone(),
        api_key,
    ));
    let state = Arc::new(AppState::new(
        registry,
        engine,
        Duration::from_millis(args.chunk_delay_ms),
        Arc::new(LogCodeSink),
    ));
    let app = build_router(state.clone(), args.max_body_size);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            eprintln!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    let _server_handle = tokio::spawn(async move {
        tracing::info!("Agentry listening on {}", addr);

        let server_future = async move { axum::serve(listener, app).await };

        match std::panic::AssertUnwindSafe(server_future)
            .catch_unwind()
            .await
        {
            Ok(result) => {
                if let Err(e) = result {
                    tracing::error!("Server error: {}", e);
                }
            }
            Err(payload) => {
                tracing::error!(
                    target: "panic",
                    "CRITICAL: Server task panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutting down");
    state.metrics.log_summary().await;
}

async fn chat(args: ChatArgs) {
    let client = ChatClient::new(reqwest::Client::new(), args.url.clone(), Arc::new(TokioScheduler));
    let request = ChatRequest {
        agent_id: args.agent,
        message: args.message,
        conversation_id: args.conversation_id,
        headers: args.headers,
    };

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let callback: ChatCallback = Arc::new(|event: ChatResponseEvent| {
        if let Some(status) = event.status.as_deref().filter(|s| !s.is_empty()) {
            eprintln!("[{}]", status);
        }
        if let Some(content) = &event.content {
            let mut out = std::io::stdout().lock();
            let _ = out.write_all(content.as_bytes());
            let _ = out.flush();
        }
        if event.end {
            println!();
        }
    });

    match client.send(&request, callback, cancel).await {
        Ok(outcome) => {
            tracing::info!(phase = ?outcome.phase, chars = outcome.message.len(), "Chat finished");
        }
        Err(e) if e.is_cancelled() => std::process::exit(130),
        Err(e) => {
            tracing::error!("Chat failed: {}", e);
            std::process::exit(1);
        }
    }
}
