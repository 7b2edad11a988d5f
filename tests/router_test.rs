#[cfg(test)]
mod tests {
    use agentry::agent::{Agent, AgentLoader, AgentRegistry};
    use agentry::chat::buffer::LogCodeSink;
    use agentry::chat::splitter::decode_events;
    use agentry::constants::CORRELATION_ID_HEADER;
    use agentry::engine::{ConversationEngine, ConversationEvent};
    use agentry::metrics::RouterMetrics;
    use agentry::pipeline::{
        MiddlewareChain, MiddlewareFlow, ProcessorResponse, RequestContext, RequestMiddleware,
        RequestProcessor,
    };
    use agentry::router::{build_router, ModeHandlers, SmartRouter};
    use agentry::routing::RoutingMode;
    use agentry::*;
    use async_trait::async_trait;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use futures_util::StreamExt;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tower::util::ServiceExt;

    struct ScriptedEngine(Vec<ConversationEvent>);

    #[async_trait]
    impl ConversationEngine for ScriptedEngine {
        async fn start(
            &self,
            _agent: &Agent,
            _history: &[ConvMessage],
            _message: &str,
        ) -> agentry::Result<mpsc::Receiver<ConversationEvent>> {
            let (tx, rx) = mpsc::channel(self.0.len().max(1));
            for event in &self.0 {
                let _ = tx.send(event.clone()).await;
            }
            Ok(rx)
        }
    }

    fn registry() -> Arc<AgentRegistry> {
        Arc::new(AgentRegistry::new(vec![
            Agent::new("travel", "You plan trips.").with_domain("travel.example.com"),
        ]))
    }

    fn state(script: Vec<ConversationEvent>) -> Arc<AppState> {
        Arc::new(AppState::new(
            registry(),
            Arc::new(ScriptedEngine(script)),
            Duration::ZERO,
            Arc::new(LogCodeSink),
        ))
    }

    fn app(state: Arc<AppState>) -> axum::Router {
        build_router(state, 1024 * 1024)
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn correlation(response: &axum::response::Response) -> String {
        response
            .headers()
            .get(CORRELATION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    #[tokio::test]
    async fn test_debug_header_routes_to_debugger_with_generated_correlation_id() {
        let response = app(state(vec![]))
            .oneshot(
                Request::builder()
                    .uri("/api/agent")
                    .header("X-DEBUG-RUN", "true")
                    .header("x-agent-id", "travel")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let cid = correlation(&response);
        assert!(uuid::Uuid::parse_str(&cid).is_ok(), "got {:?}", cid);

        let body = body_json(response).await;
        assert_eq!(body["mode"], "debugger");
        assert_eq!(body["id"], "travel");
        assert!(body["dbgSession"].is_string());
    }

    #[tokio::test]
    async fn test_default_is_agent_runner_and_correlation_id_is_echoed() {
        let response = app(state(vec![]))
            .oneshot(
                Request::builder()
                    .uri("/api/agent")
                    .header("host", "travel.example.com")
                    .header(CORRELATION_ID_HEADER, "req-42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(correlation(&response), "req-42");
        let body = body_json(response).await;
        assert_eq!(body["mode"], "agent-runner");
        assert!(body.get("dbgSession").is_none());
    }

    #[tokio::test]
    async fn test_versioned_paths_are_routed() {
        let app = app(state(vec![]));
        for uri in ["/v1/api/agent", "/v2.1/api/agent", "/dev/api/agent"] {
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .uri(uri)
                        .header("x-agent-id", "travel")
                        .header("x-routing-mode", "debugger")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{}", uri);
            assert_eq!(body_json(response).await["mode"], "debugger");
        }
    }

    #[tokio::test]
    async fn test_unknown_agent_and_unknown_route_are_404() {
        let app = app(state(vec![]));
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/agent")
                    .header("x-agent-id", "ghost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(!correlation(&response).is_empty());
        assert_eq!(body_json(response).await["error"], "Agent not found: ghost");

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/nope")
                    .header("x-agent-id", "travel")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    struct FailingMiddleware;

    #[async_trait]
    impl RequestMiddleware for FailingMiddleware {
        async fn handle(&self, _ctx: &mut RequestContext) -> agentry::Result<MiddlewareFlow> {
            Err(AgentryError::Middleware("failing", "database password is hunter2".into()).into())
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    struct PanickingProcessor;

    #[async_trait]
    impl RequestProcessor for PanickingProcessor {
        async fn process(&self, _ctx: RequestContext) -> agentry::Result<ProcessorResponse> {
            panic!("processor exploded");
        }
    }

    fn broken_state() -> Arc<AppState> {
        let debugger = ModeHandlers::new(
            MiddlewareChain::new(vec![Arc::new(FailingMiddleware)]),
            Arc::new(PanickingProcessor),
        );
        let agent_runner = ModeHandlers::new(
            MiddlewareChain::new(vec![Arc::new(AgentLoader::new(registry()))]),
            Arc::new(PanickingProcessor),
        );
        let base = AppState::new(
            registry(),
            Arc::new(ScriptedEngine(vec![])),
            Duration::ZERO,
            Arc::new(LogCodeSink),
        );
        let metrics = base.metrics.clone();
        Arc::new(base.with_router(SmartRouter::new(debugger, agent_runner, metrics)))
    }

    #[tokio::test]
    async fn test_middleware_failure_is_generic_500() {
        let state = broken_state();
        let response = app(state.clone())
            .oneshot(
                Request::builder()
                    .uri("/api/agent")
                    .header("x-force-debugger", "1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let cid = correlation(&response);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Internal Server Error");
        assert_eq!(body["correlationId"], cid.as_str());
        assert!(body["timestamp"].is_string());
        assert!(!body.to_string().contains("hunter2"));

        let metrics = state.metrics.get(RoutingMode::Debugger).await;
        assert_eq!((metrics.requests, metrics.failures), (1, 1));
    }

    #[tokio::test]
    async fn test_processor_panic_is_generic_500() {
        let response = app(broken_state())
            .oneshot(
                Request::builder()
                    .uri("/api/agent")
                    .header("x-agent-id", "travel")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Internal Server Error");
        assert!(!body.to_string().contains("exploded"));
    }

    #[tokio::test]
    async fn test_chat_streams_concatenated_events() {
        let state = state(vec![
            ConversationEvent::ToolInfo {
                name: "get_destinations".into(),
                arguments: Value::Null,
            },
            ConversationEvent::Content("Hello\nWor".into()),
            ConversationEvent::Content("ld".into()),
        ]);
        let response = app(state.clone())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/chat")
                    .header("x-agent-id", "travel")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({ "message": "hi", "conversationId": "c1" }).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let raw = String::from_utf8(bytes.to_vec()).unwrap();

        let events = decode_events(&raw);
        assert_eq!(events[0].function.as_deref(), Some("get_destinations"));
        assert_eq!(events[0].debug.as_deref(), Some("get_destinations"));
        let text: String = events.iter().filter_map(|e| e.content.clone()).collect();
        assert_eq!(text, "Hello\nWorld");

        let travel = state.registry.get(&"travel".into()).unwrap();
        let bot = state.sessions.get_or_create(&travel, "c1").await;
        assert_eq!(
            bot.history(),
            vec![ConvMessage::user("hi"), ConvMessage::assistant("Hello\nWorld")]
        );
    }

    #[tokio::test]
    async fn test_chat_rejects_bad_body() {
        let response = app(state(vec![]))
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/chat")
                    .header("x-agent-id", "travel")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_debug_session_is_stable_per_agent() {
        let app = app(state(vec![]));
        let mut seen = Vec::new();
        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .uri("/agent/travel/debugSession")
                        .header("x-force-agent-runner", "1")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            seen.push(body_json(response).await["dbgSession"].clone());
        }
        assert!(seen[0].is_string());
        assert_eq!(seen[0], seen[1]);
    }

    #[tokio::test]
    async fn test_monitor_starts_with_init_frame() {
        let state = state(vec![]);
        let response = app(state.clone())
            .oneshot(
                Request::builder()
                    .uri("/agent/travel/monitor")
                    .header("x-force-agent-runner", "1")
                    .header("x-debug-run", "true")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(!correlation(&response).is_empty());
        let debugger = state.metrics.get(RoutingMode::Debugger).await;
        assert_eq!((debugger.requests, debugger.failures), (1, 0));
        assert_eq!(state.metrics.get(RoutingMode::AgentRunner).await.requests, 0);
        // the debugger chain ran, so the marker header opened a debug session
        assert!(state.debug_sessions.get(&"travel".into()).await.is_some());
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/event-stream"
        );
        assert_eq!(state.monitor.subscriber_count(), 1);

        let mut body = response.into_body().into_data_stream();
        let first = body.next().await.unwrap().unwrap();
        let frame = String::from_utf8(first.to_vec()).unwrap();
        assert!(frame.starts_with("event: init\ndata: "), "got {:?}", frame);
        let id = frame
            .trim_start_matches("event: init\ndata: ")
            .trim_end();
        assert!(uuid::Uuid::parse_str(id).is_ok());

        drop(body);
        assert_eq!(state.monitor.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_monitor_for_unknown_agent_is_404() {
        let response = app(state(vec![]))
            .oneshot(
                Request::builder()
                    .uri("/agent/ghost/monitor")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"], "Agent not found: ghost");
    }

    #[tokio::test]
    async fn test_monitor_failure_is_generic_500() {
        let state = broken_state();
        let response = app(state.clone())
            .oneshot(
                Request::builder()
                    .uri("/agent/travel/monitor")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(response).await["error"], "Internal Server Error");
        assert_eq!(state.monitor.subscriber_count(), 0);
        assert_eq!(state.metrics.get(RoutingMode::Debugger).await.failures, 1);
    }

    #[tokio::test]
    async fn test_health_reports_agents_and_metrics() {
        let state = state(vec![]);
        let app = app(state.clone());
        app.clone()
            .oneshot(
                Request::builder()
                    .uri("/api/agent")
                    .header("x-agent-id", "travel")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["agents"], 1);
        assert_eq!(body["modes"]["agent-runner"]["requests"], 1);
    }

    #[tokio::test]
    async fn test_metrics_start_empty() {
        let metrics = RouterMetrics::new();
        assert_eq!(metrics.get(RoutingMode::AgentRunner).await.requests, 0);
    }
}
