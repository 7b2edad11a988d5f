use crate::agent_layer::NdjsonLayer;
use crate::constants::CORRELATION_ID_HEADER;
use crate::routing::RoutingMode;
use crate::types::{CorrelationId, StreamEvent};
use axum::{
    body::Body,
    http::{HeaderValue, Request, Response},
    middleware::Next,
};
use std::panic;
use std::path::Path;
use std::time::Instant;
use tracing::{error, info, info_span, Instrument};
use tracing_appender::non_blocking::WorkerGuard;

/// Keeps the background log writers alive; drop it last.
pub struct LogGuards {
    _file: WorkerGuard,
    _ndjson: WorkerGuard,
}

/// Installs the global subscriber: env filter, plain text file log, NDJSON
/// trace file and the span-trace error layer.
pub fn init_tracing(log_dir: &Path) -> std::io::Result<LogGuards> {
    use tracing_subscriber::prelude::*;

    std::fs::create_dir_all(log_dir)?;

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => "agentry=debug,tower_http=info".into(),
    };

    let file_appender = tracing_appender::rolling::daily(log_dir, "agentry.log");
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);

    let trace_appender = tracing_appender::rolling::daily(log_dir, "trace.ndjson");
    let (trace_writer, trace_guard) = tracing_appender::non_blocking(trace_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .with(NdjsonLayer::new(trace_writer))
        .with(tracing_error::ErrorLayer::default())
        .init();

    Ok(LogGuards {
        _file: file_guard,
        _ndjson: trace_guard,
    })
}

/// Sets up a global panic hook that logs panics using tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let message = panic_message(panic_info.payload());
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "Unknown panic payload"
    }
}

/// Echoes the inbound correlation id (or mints one), exposes it to handlers as
/// an extension and stamps it on the response. The request runs inside a
/// `request` span; the router fills in `mode`.
pub async fn correlation_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let correlation_id = req
        .headers()
        .get(CORRELATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| CorrelationId(s.to_string()))
        .unwrap_or_default();
    req.extensions_mut().insert(correlation_id.clone());

    let span = info_span!(
        "request",
        correlation_id = %correlation_id,
        method = %req.method(),
        path = %req.uri().path(),
        mode = tracing::field::Empty,
    );
    let started = Instant::now();
    let mut response = next.run(req).instrument(span.clone()).await;

    if let Ok(value) = HeaderValue::from_str(&correlation_id.0) {
        response.headers_mut().insert(CORRELATION_ID_HEADER, value);
    }
    span.in_scope(|| {
        info!(
            status = response.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Request completed"
        )
    });
    response
}

/// Per-turn counters for the outbound chat stream, logged when the turn ends.
#[derive(Default)]
pub struct TurnMetric {
    pub events: usize,
    pub content_chars: usize,
    pub code_blocks: usize,
    pub errors: usize,
    pub tool_names: Vec<String>,
}

impl TurnMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: &StreamEvent) {
        self.events += 1;
        if let Some(content) = &event.content {
            self.content_chars += content.chars().count();
        }
        if event.block.as_ref().is_some_and(|b| b.done) {
            self.code_blocks += 1;
        }
        if event.error.is_some() {
            self.errors += 1;
        }
        if let Some(name) = event.function_name() {
            if self.tool_names.last().map(String::as_str) != Some(name) {
                self.tool_names.push(name.to_string());
            }
        }
    }

    pub fn log_summary(&self, correlation_id: &CorrelationId, mode: RoutingMode) {
        let tools = if self.tool_names.is_empty() {
            "none".to_string()
        } else {
            self.tool_names.join(", ")
        };

        info!(
            target: "turn",
            "[TURN END] {} | mode: {} | events: {} | text: {} chars | code blocks: {} | tools: {} | errors: {}",
            correlation_id.short(),
            mode,
            self.events,
            self.content_chars,
            self.code_blocks,
            tools,
            self.errors
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BlockUpdate;

    #[test]
    fn test_turn_metric_counts() {
        let mut metric = TurnMetric::new();
        metric.record(&StreamEvent::content("héllo"));
        metric.record(&StreamEvent {
            function: Some("lookup".into()),
            ..Default::default()
        });
        metric.record(&StreamEvent {
            function: Some("lookup".into()),
            ..Default::default()
        });
        metric.record(&StreamEvent {
            block: Some(BlockUpdate {
                done: true,
                ..Default::default()
            }),
            ..Default::default()
        });
        metric.record(&StreamEvent::error("boom", "agent"));

        assert_eq!(metric.events, 5);
        assert_eq!(metric.content_chars, 5);
        assert_eq!(metric.tool_names, vec!["lookup"]);
        assert_eq!(metric.code_blocks, 1);
        assert_eq!(metric.errors, 1);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
    }
}
