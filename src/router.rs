//! Smart request router.
//!
//! Every `/api/*` request is assigned a mode by `routing::decide`, run through
//! that mode's middleware chain and handed to its processor. Failures of any
//! kind, panics included, are answered with a generic 500 carrying only the
//! correlation id.

use crate::constants::{
    CORRELATION_ID_HEADER, DEBUG_SESSION_ROUTE, GENERIC_FAILURE_MESSAGE, MONITOR_ROUTE,
};
use crate::health;
use crate::logging::{correlation_id_middleware, panic_message};
use crate::main_helper::AppState;
use crate::metrics::{Outcome, RouterMetrics};
use crate::pipeline::{
    MiddlewareChain, MiddlewareFlow, ProcessorResponse, RequestContext, RequestProcessor,
};
use crate::routing::{self, RoutingMode};
use crate::types::*;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, HeaderName, Method, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{any, get},
    Extension, Json, Router,
};
use futures_util::FutureExt;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};

lazy_static! {
    static ref PINNED_VERSION: Regex = Regex::new(r"^v\d+(\.\d+)?$").unwrap();
}

/// Middlewares and processor of one mode.
pub struct ModeHandlers {
    pub chain: MiddlewareChain,
    pub processor: Arc<dyn RequestProcessor>,
}

impl ModeHandlers {
    pub fn new(chain: MiddlewareChain, processor: Arc<dyn RequestProcessor>) -> Self {
        Self { chain, processor }
    }
}

pub struct SmartRouter {
    debugger: ModeHandlers,
    agent_runner: ModeHandlers,
    metrics: RouterMetrics,
}

impl SmartRouter {
    pub fn new(debugger: ModeHandlers, agent_runner: ModeHandlers, metrics: RouterMetrics) -> Self {
        tracing::debug!(
            debugger = ?debugger.chain,
            agent_runner = ?agent_runner.chain,
            "Router configured"
        );
        Self {
            debugger,
            agent_runner,
            metrics,
        }
    }

    pub fn handlers(&self, mode: RoutingMode) -> &ModeHandlers {
        match mode {
            RoutingMode::Debugger => &self.debugger,
            RoutingMode::AgentRunner => &self.agent_runner,
        }
    }

    /// Runs the chain and, unless a middleware answered, the processor.
    pub async fn execute(&self, mut ctx: RequestContext) -> Result<(ProcessorResponse, Outcome)> {
        let handlers = self.handlers(ctx.mode);
        match handlers.chain.run(&mut ctx).await? {
            MiddlewareFlow::Respond(response) => Ok((response, Outcome::ShortCircuited)),
            MiddlewareFlow::Continue => {
                let response = handlers.processor.process(ctx).await?;
                Ok((response, Outcome::Processed))
            }
        }
    }

    /// `execute` behind the failure boundary. Never fails.
    pub async fn dispatch(&self, ctx: RequestContext) -> Response {
        let mode = ctx.mode;
        let correlation_id = ctx.correlation_id.clone();
        let started = Instant::now();
        tracing::Span::current().record("mode", mode.as_str());

        let (response, outcome) = match AssertUnwindSafe(self.execute(ctx)).catch_unwind().await {
            Ok(Ok((response, outcome))) => (response.into_response(), outcome),
            Ok(Err(e)) => {
                tracing::error!(mode = %mode, "Request failed: {}", e);
                (failure_response(&correlation_id), Outcome::Failed)
            }
            Err(payload) => {
                tracing::error!(
                    target: "panic",
                    mode = %mode,
                    "Request handler panicked: {}",
                    panic_message(payload.as_ref())
                );
                (failure_response(&correlation_id), Outcome::Failed)
            }
        };

        self.metrics
            .record(mode, outcome, LatencyMs(started.elapsed().as_millis()))
            .await;
        response
    }
}

/// The only body a caller ever sees for a failed request.
pub fn failure_response(correlation_id: &CorrelationId) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": GENERIC_FAILURE_MESSAGE,
            "correlationId": correlation_id.0,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    )
        .into_response()
}

pub fn build_router(state: Arc<AppState>, max_body_size: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([HeaderName::from_static(CORRELATION_ID_HEADER)]);

    Router::new()
        .route("/health", get(health::liveness))
        .route("/agent/:id/debugSession", get(debug_session_handler))
        .route("/agent/:id/monitor", get(monitor_handler))
        .route("/api/*path", any(api_handler))
        .route("/:version/api/*path", any(versioned_api_handler))
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(cors)
        .layer(middleware::from_fn(correlation_id_middleware))
        .with_state(state)
}

fn correlation(ext: Option<Extension<CorrelationId>>) -> CorrelationId {
    ext.map(|Extension(id)| id).unwrap_or_default()
}

async fn route_api(
    state: &AppState,
    correlation_id: CorrelationId,
    method: Method,
    headers: HeaderMap,
    version: Option<String>,
    path: &str,
    body: Bytes,
) -> Response {
    let decision = routing::decide(&headers);
    tracing::info!(
        mode = %decision.mode,
        reason = decision.reason,
        path = path,
        "Routing decision"
    );

    let ctx = RequestContext::new(correlation_id, decision.mode, method, path)
        .with_headers(headers)
        .with_body(body)
        .with_version(version);
    state.router.dispatch(ctx).await
}

async fn api_handler(
    State(state): State<Arc<AppState>>,
    correlation_id: Option<Extension<CorrelationId>>,
    method: Method,
    headers: HeaderMap,
    Path(path): Path<String>,
    body: Bytes,
) -> Response {
    route_api(&state, correlation(correlation_id), method, headers, None, &path, body).await
}

async fn versioned_api_handler(
    State(state): State<Arc<AppState>>,
    correlation_id: Option<Extension<CorrelationId>>,
    method: Method,
    headers: HeaderMap,
    Path((version, path)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    if PINNED_VERSION.is_match(&version) {
        tracing::debug!(version = %version, "Pinned API version");
    } else {
        tracing::debug!(version = %version, "API version tag");
    }
    route_api(
        &state,
        correlation(correlation_id),
        method,
        headers,
        Some(version),
        &path,
        body,
    )
    .await
}

/// Always debugger mode.
async fn debug_session_handler(
    State(state): State<Arc<AppState>>,
    correlation_id: Option<Extension<CorrelationId>>,
    headers: HeaderMap,
    Path(agent_id): Path<String>,
) -> Response {
    let ctx = RequestContext::new(
        correlation(correlation_id),
        RoutingMode::Debugger,
        Method::GET,
        DEBUG_SESSION_ROUTE,
    )
    .with_headers(headers)
    .with_agent_id(Some(AgentId(agent_id)));
    state.router.dispatch(ctx).await
}

/// Always debugger mode. The first SSE frame is `init` carrying the new
/// subscription id.
async fn monitor_handler(
    State(state): State<Arc<AppState>>,
    correlation_id: Option<Extension<CorrelationId>>,
    headers: HeaderMap,
    Path(agent_id): Path<String>,
) -> Response {
    let ctx = RequestContext::new(
        correlation(correlation_id),
        RoutingMode::Debugger,
        Method::GET,
        MONITOR_ROUTE,
    )
    .with_headers(headers)
    .with_agent_id(Some(AgentId(agent_id)));
    state.router.dispatch(ctx).await
}
