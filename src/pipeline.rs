//! Request context, middleware chain and processor contract shared by both
//! routing modes.
//!
//! A mode is a list of middlewares run in order followed by one processor. A
//! middleware can:
//!
//! - return `Ok(MiddlewareFlow::Continue)` to hand over to the next one,
//! - return `Ok(MiddlewareFlow::Respond(..))` to answer the request itself,
//! - return `Err(..)`, which aborts the chain and becomes a generic failure.

use crate::agent::Agent;
use crate::routing::RoutingMode;
use crate::types::*;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

/// Everything known about one inbound request while it moves through a mode.
pub struct RequestContext {
    pub correlation_id: CorrelationId,
    pub mode: RoutingMode,
    pub method: Method,
    /// Path below the `api/` segment, without leading slash (e.g. `chat`).
    pub path: String,
    pub version: Option<String>,
    pub agent_id: Option<AgentId>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub agent: Option<Arc<Agent>>,
    pub debug_session: Option<String>,
    pub started_at: Instant,
}

impl RequestContext {
    pub fn new(correlation_id: CorrelationId, mode: RoutingMode, method: Method, path: &str) -> Self {
        Self {
            correlation_id,
            mode,
            method,
            path: path.trim_matches('/').to_string(),
            version: None,
            agent_id: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            agent: None,
            debug_session: None,
            started_at: Instant::now(),
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    pub fn with_version(mut self, version: Option<String>) -> Self {
        self.version = version;
        self
    }

    pub fn with_agent_id(mut self, agent_id: Option<AgentId>) -> Self {
        self.agent_id = agent_id;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The agent attached by the loading middleware.
    pub fn agent(&self) -> Result<&Arc<Agent>> {
        self.agent.as_ref().ok_or_else(|| {
            AgentryError::internal("processor reached without a resolved agent").into()
        })
    }
}

pub enum ResponseData {
    Json(serde_json::Value),
    Text(String),
    Stream(BoxStream<'static, std::result::Result<Bytes, std::io::Error>>),
    /// Server-sent events, kept alive while the client stays connected.
    Events(BoxStream<'static, std::result::Result<Event, Infallible>>),
}

impl std::fmt::Debug for ResponseData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseData::Json(v) => f.debug_tuple("Json").field(v).finish(),
            ResponseData::Text(s) => f.debug_tuple("Text").field(s).finish(),
            ResponseData::Stream(_) => f.write_str("Stream(..)"),
            ResponseData::Events(_) => f.write_str("Events(..)"),
        }
    }
}

/// What a processor (or a short-circuiting middleware) hands back.
#[derive(Debug)]
pub struct ProcessorResponse {
    pub status: StatusCode,
    pub data: ResponseData,
}

impl ProcessorResponse {
    pub fn json(status: StatusCode, value: serde_json::Value) -> Self {
        Self {
            status,
            data: ResponseData::Json(value),
        }
    }

    pub fn stream(stream: BoxStream<'static, std::result::Result<Bytes, std::io::Error>>) -> Self {
        Self {
            status: StatusCode::OK,
            data: ResponseData::Stream(stream),
        }
    }

    pub fn events(stream: BoxStream<'static, std::result::Result<Event, Infallible>>) -> Self {
        Self {
            status: StatusCode::OK,
            data: ResponseData::Events(stream),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::json(
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": message.into() }),
        )
    }
}

impl IntoResponse for ProcessorResponse {
    fn into_response(self) -> Response {
        match self.data {
            ResponseData::Json(value) => (self.status, axum::Json(value)).into_response(),
            ResponseData::Text(text) => (self.status, text).into_response(),
            ResponseData::Stream(stream) => {
                let mut response = Response::new(Body::from_stream(stream));
                *response.status_mut() = self.status;
                response.headers_mut().insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json; charset=utf-8"),
                );
                response
                    .headers_mut()
                    .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
                response
            }
            ResponseData::Events(stream) => {
                let mut response = Sse::new(stream)
                    .keep_alive(KeepAlive::default())
                    .into_response();
                *response.status_mut() = self.status;
                response
            }
        }
    }
}

pub enum MiddlewareFlow {
    Continue,
    Respond(ProcessorResponse),
}

#[async_trait]
pub trait RequestMiddleware: Send + Sync {
    async fn handle(&self, ctx: &mut RequestContext) -> Result<MiddlewareFlow>;

    /// Name used in logs.
    fn name(&self) -> &'static str;
}

#[async_trait]
pub trait RequestProcessor: Send + Sync {
    async fn process(&self, ctx: RequestContext) -> Result<ProcessorResponse>;
}

/// Runs middlewares one after another, never in parallel.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn RequestMiddleware>>,
}

impl MiddlewareChain {
    pub fn new(middlewares: Vec<Arc<dyn RequestMiddleware>>) -> Self {
        Self { middlewares }
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.middlewares.iter().map(|m| m.name()).collect()
    }

    pub async fn run(&self, ctx: &mut RequestContext) -> Result<MiddlewareFlow> {
        for middleware in &self.middlewares {
            let name = middleware.name();
            tracing::debug!(middleware = name, "Running middleware");
            match middleware.handle(ctx).await {
                Ok(MiddlewareFlow::Continue) => {}
                Ok(MiddlewareFlow::Respond(response)) => {
                    tracing::debug!(
                        middleware = name,
                        status = %response.status,
                        "Middleware answered the request"
                    );
                    return Ok(MiddlewareFlow::Respond(response));
                }
                Err(e) => {
                    tracing::warn!(middleware = name, "Middleware failed: {}", e.inner);
                    return Err(e);
                }
            }
        }
        Ok(MiddlewareFlow::Continue)
    }
}

impl std::fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareChain")
            .field("middlewares", &self.names())
            .finish()
    }
}
