//! Client side of a chat turn.
//!
//! `ChatClient::send` posts one message, reads the concatenated-JSON response as
//! it arrives and reports what a user should see through a callback. A turn
//! moves through three phases:
//!
//! - `Initial`: nothing shown yet, content is displayed as it comes;
//! - `Debug`: the agent is working, a thinking label is shown and content is
//!   not expected;
//! - `Final`: the first real content after `Debug` stops the label and the
//!   reply streams in.

use super::function_name::extract_function_name;
use super::scheduler::Scheduler;
use super::splitter::FragmentDecoder;
use super::thinking::{LabelCallback, ThinkingManager, ThinkingType};
use crate::constants::{AGENT_ID_HEADER, CANCELLED_MESSAGE, CODE_FENCE};
use crate::types::StreamEvent;
use futures_util::StreamExt;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub agent_id: String,
    pub message: String,
    pub conversation_id: Option<String>,
    /// Extra request headers, e.g. routing overrides.
    pub headers: Vec<(String, String)>,
}

impl ChatRequest {
    pub fn new(agent_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            message: message.into(),
            ..Default::default()
        }
    }
}

/// What the UI should do next. `content` is appended text; `status` replaces
/// the thinking label (empty clears it).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatResponseEvent {
    pub content: Option<String>,
    pub debug: Option<String>,
    pub title: Option<String>,
    pub function: Option<String>,
    pub status: Option<String>,
    pub end: bool,
}

impl ChatResponseEvent {
    fn content(text: String) -> Self {
        Self {
            content: Some(text),
            ..Default::default()
        }
    }

    fn status(text: impl Into<String>) -> Self {
        Self {
            status: Some(text.into()),
            ..Default::default()
        }
    }

    fn end() -> Self {
        Self {
            end: true,
            ..Default::default()
        }
    }
}

pub type ChatCallback = Arc<dyn Fn(ChatResponseEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessagePhase {
    Initial,
    Debug,
    Final,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatOutcome {
    pub message: String,
    pub phase: MessagePhase,
}

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{message}")]
    Status { status: StatusCode, message: String },

    #[error("{0}")]
    Agent(String),

    #[error("Request was cancelled")]
    Cancelled,
}

impl ChatError {
    /// Text shown in place of the thinking label.
    pub fn user_message(&self) -> String {
        match self {
            ChatError::Transport(_) => "Unable to reach the agent, please try again".to_string(),
            ChatError::Status { message, .. } => message.clone(),
            ChatError::Agent(message) => message.clone(),
            ChatError::Cancelled => CANCELLED_MESSAGE.to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ChatError::Cancelled)
    }
}

pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    scheduler: Arc<dyn Scheduler>,
}

struct TurnState {
    phase: MessagePhase,
    message: String,
    pending: String,
    function: Option<String>,
}

impl TurnState {
    fn new() -> Self {
        Self {
            phase: MessagePhase::Initial,
            message: String::new(),
            pending: String::new(),
            function: None,
        }
    }

    fn flush(&mut self, callback: &ChatCallback) {
        if self.pending.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.pending);
        self.message.push_str(&text);
        callback(ChatResponseEvent::content(text));
    }
}

impl ChatClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            scheduler,
        }
    }

    /// Runs one turn. The callback always receives a final `end` event, also
    /// when the turn fails or is cancelled.
    pub async fn send(
        &self,
        request: &ChatRequest,
        callback: ChatCallback,
        cancel: CancellationToken,
    ) -> Result<ChatOutcome, ChatError> {
        let thinking = ThinkingManager::new(self.scheduler.clone());
        let label: LabelCallback = {
            let callback = callback.clone();
            Arc::new(move |text: &str| callback(ChatResponseEvent::status(text)))
        };
        thinking.start(ThinkingType::General, label.clone(), None, None);

        let mut turn = TurnState::new();
        let result = self
            .stream_turn(request, &callback, &thinking, &label, &cancel, &mut turn)
            .await;

        thinking.stop();
        if let Err(e) = &result {
            if e.is_cancelled() {
                tracing::info!(agent = %request.agent_id, "Chat turn cancelled");
            } else {
                tracing::warn!(agent = %request.agent_id, "Chat turn failed: {}", e);
            }
            callback(ChatResponseEvent::status(e.user_message()));
        }
        callback(ChatResponseEvent::end());

        result.map(|()| ChatOutcome {
            message: turn.message,
            phase: turn.phase,
        })
    }

    async fn stream_turn(
        &self,
        request: &ChatRequest,
        callback: &ChatCallback,
        thinking: &ThinkingManager,
        label: &LabelCallback,
        cancel: &CancellationToken,
        turn: &mut TurnState,
    ) -> Result<(), ChatError> {
        let mut body = json!({ "message": request.message });
        if let Some(id) = &request.conversation_id {
            body["conversationId"] = json!(id);
        }
        let mut http = self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .header(AGENT_ID_HEADER, request.agent_id.as_str())
            .json(&body);
        for (name, value) in &request.headers {
            http = http.header(name.as_str(), value.as_str());
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ChatError::Cancelled),
            response = http.send() => response?,
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ChatError::Status {
                status,
                message: error_message(status, &text),
            });
        }

        let mut stream = response.bytes_stream();
        let mut decoder = FragmentDecoder::new();
        let mut carry: Vec<u8> = Vec::new();

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(ChatError::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            carry.extend_from_slice(&chunk?);

            let text = take_utf8(&mut carry);
            for event in decoder.push(&text) {
                apply_event(event, turn, callback, thinking, label)?;
            }
            turn.flush(callback);
        }

        if !carry.is_empty() {
            let text = String::from_utf8_lossy(&carry).into_owned();
            for event in decoder.push(&text) {
                apply_event(event, turn, callback, thinking, label)?;
            }
        }
        for event in decoder.finish() {
            apply_event(event, turn, callback, thinking, label)?;
        }
        turn.flush(callback);
        Ok(())
    }
}

fn apply_event(
    event: StreamEvent,
    turn: &mut TurnState,
    callback: &ChatCallback,
    thinking: &ThinkingManager,
    label: &LabelCallback,
) -> Result<(), ChatError> {
    if let Some(error) = event.error.as_deref().filter(|e| !e.is_empty()) {
        return Err(ChatError::Agent(error.to_string()));
    }

    if turn.phase == MessagePhase::Initial && event.debug.is_some() {
        turn.phase = MessagePhase::Debug;
    }

    let text = visible_text(&event);
    match turn.phase {
        MessagePhase::Debug => match text {
            Some(text) => {
                thinking.stop();
                callback(ChatResponseEvent::status(""));
                let shown = if turn.pending.is_empty() {
                    &turn.message
                } else {
                    &turn.pending
                };
                if !shown.is_empty() && !shown.ends_with('\n') {
                    turn.pending.push('\n');
                }
                turn.phase = MessagePhase::Final;
                turn.pending.push_str(&text);
            }
            None => {
                drive_thinking(&event, turn, thinking, label);
                if event.debug.is_some() {
                    callback(ChatResponseEvent {
                        debug: event.debug.clone(),
                        title: event.title.clone(),
                        function: event.function_name().map(str::to_string),
                        ..Default::default()
                    });
                }
            }
        },
        MessagePhase::Initial => {
            if event.status_message.is_some() {
                drive_thinking(&event, turn, thinking, label);
            }
            if let Some(text) = text {
                // content has started, the label goes away
                if thinking.is_active() {
                    thinking.stop();
                    callback(ChatResponseEvent::status(""));
                }
                turn.pending.push_str(&text);
            }
        }
        MessagePhase::Final => {
            if let Some(text) = text {
                turn.pending.push_str(&text);
            }
        }
    }
    Ok(())
}

/// Status beats a function name, which beats a plain debug line.
fn drive_thinking(event: &StreamEvent, turn: &mut TurnState, thinking: &ThinkingManager, label: &LabelCallback) {
    if let Some(status) = event.status_message.as_deref().filter(|s| !s.is_empty()) {
        if !thinking.update_status(status) {
            thinking.start(ThinkingType::Status, label.clone(), None, Some(status));
        }
        return;
    }

    let function = event
        .function_name()
        .map(str::to_string)
        .or_else(|| event.debug.as_deref().and_then(extract_function_name));
    if let Some(name) = function {
        let running = thinking.current() == Some(ThinkingType::Function)
            && turn.function.as_deref() == Some(name.as_str());
        if !running && thinking.start(ThinkingType::Function, label.clone(), Some(&name), None) {
            turn.function = Some(name);
        }
        return;
    }

    if event.debug.is_some() && !thinking.is_active() {
        thinking.start(ThinkingType::General, label.clone(), None, None);
    }
}

/// Content plus any finished code block, rendered back as a fence tagged with
/// the block's `lang` prop when it has one.
fn visible_text(event: &StreamEvent) -> Option<String> {
    let mut text = event.content.clone().filter(|c| !c.is_empty());
    if let Some(block) = event.block.as_ref().filter(|b| b.done) {
        let out = text.get_or_insert_with(String::new);
        out.push_str(CODE_FENCE);
        if let Some(lang) = block.props.get("lang") {
            out.push_str(lang);
        }
        out.push('\n');
        out.push_str(&block.code);
        if !block.code.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(CODE_FENCE);
        out.push('\n');
    }
    text
}

/// Moves the longest valid UTF-8 prefix out of `carry`. Invalid bytes in the
/// middle are replaced rather than held back.
fn take_utf8(carry: &mut Vec<u8>) -> String {
    match std::str::from_utf8(carry) {
        Ok(text) => {
            let text = text.to_string();
            carry.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let rest = carry.split_off(valid);
            let text = String::from_utf8_lossy(carry).into_owned();
            *carry = rest;
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(carry).into_owned();
            carry.clear();
            text
        }
    }
}

/// Best-effort message from a JSON error body: `error` as a string,
/// `error.message`, then `message`.
pub fn error_message(status: StatusCode, body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let found = parsed.as_ref().and_then(|v| {
        v.get("error")
            .and_then(Value::as_str)
            .or_else(|| v.get("error").and_then(|e| e.get("message")).and_then(Value::as_str))
            .or_else(|| v.get("message").and_then(Value::as_str))
            .map(str::to_string)
    });
    match found {
        Some(message) if !message.is_empty() => message,
        _ => format!("Request failed with status {}", status.as_u16()),
    }
}
