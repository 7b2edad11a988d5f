use crate::agent::{AgentLoader, AgentRegistry};
use crate::chat::buffer::CodeBlockSink;
use crate::chat::chatbot::ChatSessions;
use crate::constants::{DEFAULT_UPSTREAM_MODEL, DEFAULT_UPSTREAM_URL};
use crate::debugger::{DebugSessionMiddleware, DebugSessions, MonitorHub};
use crate::engine::ConversationEngine;
use crate::metrics::RouterMetrics;
use crate::pipeline::{MiddlewareChain, RequestMiddleware};
use crate::processor::ChatProcessor;
use crate::router::{ModeHandlers, SmartRouter};
use crate::routing::RoutingMode;
use crate::types::*;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the agent router.
    Serve(ServeArgs),
    /// Send one chat message to a running router and print the reply.
    Chat(ChatArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    /// JSON array of agent definitions.
    #[arg(long, default_value = "agents.json")]
    pub agents_file: PathBuf,
    #[arg(long, default_value = DEFAULT_UPSTREAM_URL)]
    pub upstream_url: String,
    #[arg(long, default_value = DEFAULT_UPSTREAM_MODEL)]
    pub upstream_model: String,
    #[arg(long, default_value_t = 120)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    pub max_body_size: usize,
    /// Pause between streamed prose chunks.
    #[arg(long, default_value_t = 10)]
    pub chunk_delay_ms: u64,
    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct ChatArgs {
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    pub url: String,
    #[arg(long)]
    pub agent: String,
    #[arg(long)]
    pub conversation_id: Option<String>,
    /// Send routing headers as `name=value`; may repeat.
    #[arg(long = "header", value_parser = parse_header_arg)]
    pub headers: Vec<(String, String)>,
    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,
    pub message: String,
}

fn parse_header_arg(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_ascii_lowercase(), value.trim().to_string()))
        }
        _ => Err(format!("expected name=value, got '{}'", raw)),
    }
}

pub struct AppState {
    pub router: SmartRouter,
    pub registry: Arc<AgentRegistry>,
    pub debug_sessions: Arc<DebugSessions>,
    pub monitor: MonitorHub,
    pub sessions: Arc<ChatSessions>,
    pub metrics: RouterMetrics,
}

impl AppState {
    /// Wires both modes. Debugger: agent loader, debug session. Agent runner:
    /// agent loader only.
    pub fn new(
        registry: Arc<AgentRegistry>,
        engine: Arc<dyn ConversationEngine>,
        pacing: Duration,
        sink: Arc<dyn CodeBlockSink>,
    ) -> Self {
        let debug_sessions = Arc::new(DebugSessions::new());
        let monitor = MonitorHub::new();
        let sessions = Arc::new(ChatSessions::new(engine, pacing, sink));
        let metrics = RouterMetrics::new();
        let loader: Arc<dyn RequestMiddleware> = Arc::new(AgentLoader::new(registry.clone()));

        let debugger = ModeHandlers::new(
            MiddlewareChain::new(vec![
                loader.clone(),
                Arc::new(DebugSessionMiddleware::new(debug_sessions.clone())),
            ]),
            Arc::new(ChatProcessor::new(
                RoutingMode::Debugger,
                sessions.clone(),
                monitor.clone(),
            )),
        );
        let agent_runner = ModeHandlers::new(
            MiddlewareChain::new(vec![loader]),
            Arc::new(ChatProcessor::new(
                RoutingMode::AgentRunner,
                sessions.clone(),
                monitor.clone(),
            )),
        );

        Self {
            router: SmartRouter::new(debugger, agent_runner, metrics.clone()),
            registry,
            debug_sessions,
            monitor,
            sessions,
            metrics,
        }
    }

    /// Same registry and sessions, custom mode handlers.
    pub fn with_router(mut self, router: SmartRouter) -> Self {
        self.router = router;
        self
    }
}

pub fn build_http_client(args: &ServeArgs) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(args.request_timeout_secs))
        .connect_timeout(Duration::from_secs(args.connect_timeout_secs))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .build()?;
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_defaults() {
        let cli = Cli::parse_from(["agentry", "serve"]);
        match cli.command {
            Command::Serve(args) => {
                assert_eq!(args.port, 8080);
                assert_eq!(args.upstream_model, DEFAULT_UPSTREAM_MODEL);
                assert_eq!(args.chunk_delay_ms, 10);
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_chat_headers() {
        let cli = Cli::parse_from([
            "agentry",
            "chat",
            "--agent",
            "travel",
            "--header",
            "X-Debug-Run=true",
            "hello there",
        ]);
        match cli.command {
            Command::Chat(args) => {
                assert_eq!(args.agent, "travel");
                assert_eq!(args.message, "hello there");
                assert_eq!(args.headers, vec![("x-debug-run".to_string(), "true".to_string())]);
            }
            _ => panic!("expected chat"),
        }
    }
}
