//! Conversation engines produce the raw events of one agent turn.
//!
//! `UpstreamEngine` talks to an OpenAI-compatible chat-completions endpoint and
//! maps its server-sent deltas to `ConversationEvent`s. Tool calls are reported,
//! not executed.

use crate::agent::Agent;
use crate::constants::MAX_STREAM_LINES;
use crate::types::*;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;

#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    Content(String),
    /// A tool call was announced by the model.
    ToolInfo { name: String, arguments: Value },
    /// A tool call is about to run with fully assembled arguments.
    BeforeToolCall { name: String, arguments: Value },
    AfterToolCall { name: String, result: String },
    Error { message: String, error_type: String },
}

#[async_trait]
pub trait ConversationEngine: Send + Sync {
    /// Starts a turn. Events arrive on the returned channel, which closes when
    /// the turn is over.
    async fn start(
        &self,
        agent: &Agent,
        history: &[ConvMessage],
        message: &str,
    ) -> Result<mpsc::Receiver<ConversationEvent>>;
}

pub struct UpstreamEngine {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
}

impl UpstreamEngine {
    pub fn new(client: reqwest::Client, url: String, model: String, api_key: Option<String>) -> Self {
        Self {
            client,
            url,
            model,
            api_key,
        }
    }

    fn build_payload(&self, agent: &Agent, history: &[ConvMessage], message: &str) -> Value {
        let mut messages = Vec::with_capacity(history.len() + 2);
        if !agent.behavior.is_empty() {
            messages.push(json!({ "role": "system", "content": agent.behavior }));
        }
        for turn in history {
            messages.push(json!({ "role": turn.role, "content": turn.message }));
        }
        messages.push(json!({ "role": "user", "content": message }));

        json!({
            "model": self.model,
            "stream": true,
            "messages": messages,
        })
    }
}

#[async_trait]
impl ConversationEngine for UpstreamEngine {
    async fn start(
        &self,
        agent: &Agent,
        history: &[ConvMessage],
        message: &str,
    ) -> Result<mpsc::Receiver<ConversationEvent>> {
        let payload = self.build_payload(agent, history, message);
        let mut request = self.client.post(&self.url).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        tracing::info!(
            agent = %agent.id.short(),
            model = %self.model,
            history = history.len(),
            "Starting upstream turn"
        );
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentryError::Upstream(status, body).into());
        }

        let (tx, rx) = mpsc::channel(64);
        let stream = response
            .bytes_stream()
            .map(|r| r.map_err(std::io::Error::other));
        tokio::spawn(pump_upstream(stream, tx));
        Ok(rx)
    }
}

#[derive(Debug, Deserialize)]
struct ChunkPayload {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Default)]
struct PendingToolCall {
    name: String,
    arguments: String,
}

/// Translates upstream SSE lines into events until the stream ends or the
/// receiver goes away.
async fn pump_upstream<S>(stream: S, tx: mpsc::Sender<ConversationEvent>)
where
    S: Stream<Item = std::result::Result<Bytes, std::io::Error>> + Unpin + Send,
{
    let mut lines = FramedRead::new(StreamReader::new(stream), LinesCodec::new());
    let mut tools: BTreeMap<u32, PendingToolCall> = BTreeMap::new();
    let mut line_count = 0;

    while let Some(line) = lines.next().await {
        line_count += 1;
        if line_count > MAX_STREAM_LINES {
            tracing::error!("Upstream stream exceeded max line limit ({})", MAX_STREAM_LINES);
            let _ = tx
                .send(ConversationEvent::Error {
                    message: "Upstream response too long".into(),
                    error_type: "stream_limit".into(),
                })
                .await;
            return;
        }

        let line = match line {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!("Upstream stream read failed: {}", e);
                let _ = tx
                    .send(ConversationEvent::Error {
                        message: "Connection to the model was interrupted".into(),
                        error_type: "network".into(),
                    })
                    .await;
                return;
            }
        };

        let events = parse_sse_line(&line, &mut tools);
        for event in events {
            if tx.send(event).await.is_err() {
                tracing::debug!("Turn receiver dropped, stopping upstream read");
                return;
            }
        }
    }
}

/// Handles one SSE line. Tool-call argument fragments are accumulated in `tools`
/// and released as `BeforeToolCall` once the model finishes the call.
fn parse_sse_line(line: &str, tools: &mut BTreeMap<u32, PendingToolCall>) -> Vec<ConversationEvent> {
    let data = match line.strip_prefix("data:") {
        Some(d) => d.trim(),
        None => return Vec::new(),
    };
    if data.is_empty() || data == "[DONE]" {
        return Vec::new();
    }

    let payload: ChunkPayload = match serde_json::from_str(data) {
        Ok(p) => p,
        Err(e) => {
            tracing::debug!("Skipping unparseable upstream chunk: {}", e);
            return Vec::new();
        }
    };

    let mut events = Vec::new();
    for choice in payload.choices {
        if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
            events.push(ConversationEvent::Content(content));
        }
        for call in choice.delta.tool_calls {
            let pending = tools.entry(call.index).or_default();
            if let Some(function) = call.function {
                if let Some(name) = function.name.filter(|n| !n.is_empty()) {
                    pending.name = name.clone();
                    events.push(ConversationEvent::ToolInfo {
                        name,
                        arguments: Value::Null,
                    });
                }
                if let Some(args) = function.arguments {
                    pending.arguments.push_str(&args);
                }
            }
        }
        if choice.finish_reason.as_deref() == Some("tool_calls") {
            for (_, call) in std::mem::take(tools) {
                let arguments = match serde_json::from_str(&call.arguments) {
                    Ok(v) => v,
                    Err(_) => Value::String(call.arguments),
                };
                events.push(ConversationEvent::BeforeToolCall {
                    name: call.name,
                    arguments,
                });
            }
        }
    }
    events
}
