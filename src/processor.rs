//! The processor at the end of each mode's middleware chain.
//!
//! Both modes serve the same chat API. They differ in how much tool activity
//! reaches the wire: the debugger mode sends full call/response traces and
//! mirrors every event to the monitor hub, the agent-runner mode only names the
//! function being used.

use crate::chat::buffer::BufferEvent;
use crate::chat::chatbot::{ChatSessions, TurnEvent};
use crate::chat::function_name::humanize;
use crate::constants::{CONVERSATION_ID_HEADER, DEBUG_SESSION_ROUTE, MONITOR_ID_HEADER, MONITOR_ROUTE};
use crate::debugger::{MonitorEvent, MonitorHub};
use crate::engine::ConversationEvent;
use crate::logging::TurnMetric;
use crate::pipeline::{ProcessorResponse, RequestContext, RequestProcessor};
use crate::routing::RoutingMode;
use crate::types::*;
use async_trait::async_trait;
use axum::http::{Method, StatusCode};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

const DEFAULT_CONVERSATION: &str = "default";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatBody {
    message: String,
    #[serde(default)]
    conversation_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StopBody {
    #[serde(default)]
    conversation_id: Option<String>,
}

pub struct ChatProcessor {
    mode: RoutingMode,
    sessions: Arc<ChatSessions>,
    monitor: MonitorHub,
}

impl ChatProcessor {
    pub fn new(mode: RoutingMode, sessions: Arc<ChatSessions>, monitor: MonitorHub) -> Self {
        Self {
            mode,
            sessions,
            monitor,
        }
    }

    async fn chat(&self, ctx: &RequestContext) -> Result<ProcessorResponse> {
        let agent = ctx.agent()?.clone();
        let body: ChatBody = match serde_json::from_slice(&ctx.body) {
            Ok(b) => b,
            Err(e) => return Ok(bad_request(format!("Invalid chat request: {}", e))),
        };
        if body.message.trim().is_empty() {
            return Ok(bad_request("Message must not be empty".to_string()));
        }

        let conversation_id = conversation_id(ctx, body.conversation_id);
        tracing::info!(
            agent = %agent.id.short(),
            conversation = %conversation_id,
            mode = %self.mode,
            "Chat turn started"
        );

        let bot = self.sessions.get_or_create(&agent, &conversation_id).await;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(bot.run_turn(body.message, tx));

        let mut encoder = TurnEncoder {
            mode: self.mode,
            agent_id: agent.id.clone(),
            correlation_id: ctx.correlation_id.clone(),
            subscription: ctx.header(MONITOR_ID_HEADER).map(|s| SubscriptionId(s.to_string())),
            monitor: match self.mode {
                RoutingMode::Debugger => Some(self.monitor.clone()),
                RoutingMode::AgentRunner => None,
            },
            metric: TurnMetric::new(),
        };

        let stream = UnboundedReceiverStream::new(rx)
            .filter_map(move |event| futures_util::future::ready(encoder.encode(event).map(Ok)));
        Ok(ProcessorResponse::stream(stream.boxed()))
    }

    async fn stop(&self, ctx: &RequestContext) -> Result<ProcessorResponse> {
        let agent = ctx.agent()?;
        let body: StopBody = if ctx.body.is_empty() {
            StopBody::default()
        } else {
            match serde_json::from_slice(&ctx.body) {
                Ok(b) => b,
                Err(e) => return Ok(bad_request(format!("Invalid stop request: {}", e))),
            }
        };
        let conversation_id = conversation_id(ctx, body.conversation_id);
        let stopped = self.sessions.stop(&agent.id, &conversation_id).await;
        tracing::info!(agent = %agent.id.short(), conversation = %conversation_id, stopped, "Chat stop requested");
        Ok(ProcessorResponse::json(
            StatusCode::OK,
            json!({ "stopped": stopped, "conversationId": conversation_id }),
        ))
    }

    fn monitor(&self, ctx: &RequestContext) -> Result<ProcessorResponse> {
        let agent = ctx.agent()?;
        let (subscription, stream) = self.monitor.event_stream(agent.id.clone());
        tracing::debug!(agent = %agent.id.short(), subscription = %subscription, "Monitor stream opened");
        Ok(ProcessorResponse::events(stream))
    }

    fn agent_info(&self, ctx: &RequestContext) -> Result<ProcessorResponse> {
        let agent = ctx.agent()?;
        let mut summary = agent.summary();
        summary["mode"] = json!(self.mode.as_str());
        if let Some(session) = &ctx.debug_session {
            summary["dbgSession"] = json!(session);
        }
        Ok(ProcessorResponse::json(StatusCode::OK, summary))
    }
}

#[async_trait]
impl RequestProcessor for ChatProcessor {
    async fn process(&self, ctx: RequestContext) -> Result<ProcessorResponse> {
        match (&ctx.method, ctx.path.as_str()) {
            (&Method::POST, "chat") => self.chat(&ctx).await,
            (&Method::POST, "chat/stop") => self.stop(&ctx).await,
            (&Method::GET, "agent") => self.agent_info(&ctx),
            (&Method::GET, DEBUG_SESSION_ROUTE) if self.mode == RoutingMode::Debugger => Ok(
                ProcessorResponse::json(StatusCode::OK, json!({ "dbgSession": ctx.debug_session })),
            ),
            (&Method::GET, MONITOR_ROUTE) if self.mode == RoutingMode::Debugger => self.monitor(&ctx),
            _ => Ok(ProcessorResponse::not_found(format!(
                "No route for {} /api/{}",
                ctx.method, ctx.path
            ))),
        }
    }
}

fn bad_request(message: String) -> ProcessorResponse {
    ProcessorResponse::json(StatusCode::BAD_REQUEST, json!({ "error": message }))
}

/// Body first, then the `x-conversation-id` header.
fn conversation_id(ctx: &RequestContext, from_body: Option<String>) -> String {
    from_body
        .filter(|id| !id.trim().is_empty())
        .or_else(|| ctx.header(CONVERSATION_ID_HEADER).map(str::to_string))
        .unwrap_or_else(|| DEFAULT_CONVERSATION.to_string())
}

/// Turns one chat turn's events into wire objects.
struct TurnEncoder {
    mode: RoutingMode,
    agent_id: AgentId,
    correlation_id: CorrelationId,
    subscription: Option<SubscriptionId>,
    monitor: Option<MonitorHub>,
    metric: TurnMetric,
}

impl TurnEncoder {
    fn encode(&mut self, event: TurnEvent) -> Option<Bytes> {
        let wire = to_stream_event(self.mode, event)?;
        self.metric.record(&wire);

        if let Some(monitor) = &self.monitor {
            let payload = serde_json::to_value(&wire).unwrap_or_default();
            monitor.publish(MonitorEvent {
                agent_id: self.agent_id.clone(),
                subscription_id: self.subscription.clone(),
                event: "chat".to_string(),
                payload,
            });
        }

        match serde_json::to_vec(&wire) {
            Ok(bytes) => Some(Bytes::from(bytes)),
            Err(e) => {
                tracing::error!("Failed to encode stream event: {}", e);
                None
            }
        }
    }
}

impl Drop for TurnEncoder {
    fn drop(&mut self) {
        self.metric.log_summary(&self.correlation_id, self.mode);
    }
}

/// Maps a turn event to its wire object, or `None` when it has no wire form.
pub fn to_stream_event(mode: RoutingMode, event: TurnEvent) -> Option<StreamEvent> {
    match event {
        TurnEvent::Buffer(BufferEvent::Content(text)) => Some(StreamEvent::content(text)),
        TurnEvent::Buffer(BufferEvent::Code { props, line }) => Some(StreamEvent {
            block: Some(BlockUpdate {
                props,
                code: line,
                done: false,
            }),
            ..Default::default()
        }),
        TurnEvent::Buffer(BufferEvent::CodeDone { props, code }) => Some(StreamEvent {
            block: Some(BlockUpdate {
                props,
                code,
                done: true,
            }),
            ..Default::default()
        }),
        TurnEvent::Buffer(BufferEvent::End { .. }) | TurnEvent::Buffer(BufferEvent::Interrupted) => None,
        TurnEvent::Engine(ConversationEvent::Content(_)) => None,
        TurnEvent::Engine(ConversationEvent::ToolInfo { name, arguments })
        | TurnEvent::Engine(ConversationEvent::BeforeToolCall { name, arguments }) => match mode {
            RoutingMode::Debugger => Some(StreamEvent {
                debug: Some(format!("Function Call : {}\n{}", name, arguments)),
                title: Some(humanize(&name)),
                function: Some(name.clone()),
                function_call: Some(FunctionCall { name, arguments }),
                ..Default::default()
            }),
            RoutingMode::AgentRunner => Some(StreamEvent {
                debug: Some(name.clone()),
                function: Some(name),
                ..Default::default()
            }),
        },
        TurnEvent::Engine(ConversationEvent::AfterToolCall { name, result }) => match mode {
            RoutingMode::Debugger => Some(StreamEvent {
                debug: Some(format!("Call Response : {}\n{}", name, result)),
                function: Some(name),
                ..Default::default()
            }),
            RoutingMode::AgentRunner => None,
        },
        TurnEvent::Engine(ConversationEvent::Error {
            message,
            error_type,
        }) => Some(StreamEvent::error(message, error_type)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::function_name::extract_function_name;
    use serde_json::Value;

    #[test]
    fn test_debugger_tool_event_is_traceable() {
        let event = to_stream_event(
            RoutingMode::Debugger,
            TurnEvent::Engine(ConversationEvent::ToolInfo {
                name: "get_destinations".into(),
                arguments: json!({"region": "EU"}),
            }),
        )
        .unwrap();
        assert_eq!(event.title.as_deref(), Some("Get Destinations"));
        assert_eq!(event.function_name(), Some("get_destinations"));
        let debug = event.debug.unwrap();
        assert_eq!(extract_function_name(&debug).as_deref(), Some("get_destinations"));
    }

    #[test]
    fn test_agent_runner_hides_call_details() {
        let event = to_stream_event(
            RoutingMode::AgentRunner,
            TurnEvent::Engine(ConversationEvent::BeforeToolCall {
                name: "lookup".into(),
                arguments: Value::Null,
            }),
        )
        .unwrap();
        assert_eq!(event.debug.as_deref(), Some("lookup"));
        assert!(event.function_call.is_none());

        assert!(to_stream_event(
            RoutingMode::AgentRunner,
            TurnEvent::Engine(ConversationEvent::AfterToolCall {
                name: "lookup".into(),
                result: "secret".into(),
            }),
        )
        .is_none());
    }

    #[test]
    fn test_buffer_events_map_to_wire() {
        let content = to_stream_event(RoutingMode::AgentRunner, TurnEvent::Buffer(BufferEvent::Content("Hel".into())));
        assert_eq!(serde_json::to_string(&content.unwrap()).unwrap(), r#"{"content":"Hel"}"#);

        let done = to_stream_event(
            RoutingMode::AgentRunner,
            TurnEvent::Buffer(BufferEvent::CodeDone {
                props: Default::default(),
                code: "x = 1\n".into(),
            }),
        )
        .unwrap();
        assert!(done.block.unwrap().done);

        assert!(to_stream_event(
            RoutingMode::Debugger,
            TurnEvent::Buffer(BufferEvent::End {
                message: "bye".into()
            })
        )
        .is_none());
    }

    #[test]
    fn test_engine_error_maps_to_error_field() {
        let event = to_stream_event(
            RoutingMode::AgentRunner,
            TurnEvent::Engine(ConversationEvent::Error {
                message: "quota".into(),
                error_type: "upstream".into(),
            }),
        )
        .unwrap();
        assert_eq!(event.error.as_deref(), Some("quota"));
        assert_eq!(event.is_error, Some(true));
    }
}
