//! Server-side chat sessions.
//!
//! A `Chatbot` is one conversation with one agent. It feeds engine output into
//! its `DisplayBuffer` line by line and forwards everything that is not prose
//! (tool activity, errors) straight to the turn's event channel.

use super::buffer::{BufferCallback, BufferEvent, CodeBlockSink, DisplayBuffer};
use crate::agent::Agent;
use crate::engine::{ConversationEngine, ConversationEvent};
use crate::types::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    Buffer(BufferEvent),
    Engine(ConversationEvent),
}

pub struct Chatbot {
    agent: Arc<Agent>,
    engine: Arc<dyn ConversationEngine>,
    buffer: DisplayBuffer,
    turn: Mutex<Option<CancellationToken>>,
}

impl Chatbot {
    pub fn new(
        agent: Arc<Agent>,
        engine: Arc<dyn ConversationEngine>,
        pacing: Duration,
        sink: Arc<dyn CodeBlockSink>,
    ) -> Self {
        Self {
            agent,
            engine,
            buffer: DisplayBuffer::new(pacing, sink),
            turn: Mutex::new(None),
        }
    }

    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    pub fn history(&self) -> Vec<ConvMessage> {
        self.buffer.history()
    }

    /// Runs one turn, sending its events to `tx`. A turn already in flight on
    /// this chatbot is cancelled first.
    ///
    /// The channel closes once both this future has returned and the buffer has
    /// emitted its final event.
    pub async fn run_turn(self: Arc<Self>, message: String, tx: mpsc::UnboundedSender<TurnEvent>) {
        let token = CancellationToken::new();
        let previous = self.lock_turn().replace(token.clone());
        if let Some(previous) = previous {
            tracing::debug!(agent = %self.agent.id.short(), "Cancelling previous turn");
            previous.cancel();
        }

        let history = self.buffer.history();
        let events = tx.clone();
        let callback: BufferCallback = Arc::new(move |event: BufferEvent| {
            let _ = events.send(TurnEvent::Buffer(event));
        });
        self.buffer.begin_turn(&message, callback);

        let mut rx = match self.engine.start(&self.agent, &history, &message).await {
            Ok(rx) => rx,
            Err(e) => {
                tracing::error!(agent = %self.agent.id.short(), "Conversation engine failed to start: {}", e.inner);
                let _ = tx.send(TurnEvent::Engine(ConversationEvent::Error {
                    message: "The agent could not process this request".into(),
                    error_type: "engine".into(),
                }));
                self.buffer.abort_turn();
                return;
            }
        };

        let mut partial = String::new();
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!(agent = %self.agent.id.short(), "Turn cancelled");
                    return;
                }
                event = rx.recv() => event,
            };
            let Some(event) = event else { break };

            match event {
                ConversationEvent::Content(text) => {
                    partial.push_str(&text);
                    let lines = take_complete_lines(&mut partial);
                    if !lines.is_empty() {
                        self.buffer.append_lines(lines);
                        let buffer = self.buffer.clone();
                        tokio::spawn(async move { buffer.process_buffer().await });
                    }
                }
                error @ ConversationEvent::Error { .. } => {
                    tracing::warn!(agent = %self.agent.id.short(), "Engine reported an error: {:?}", error);
                    let _ = tx.send(TurnEvent::Engine(error));
                    self.buffer.abort_turn();
                    return;
                }
                other => {
                    let _ = tx.send(TurnEvent::Engine(other));
                }
            }
        }

        if !partial.is_empty() {
            self.buffer.append_lines(std::iter::once(partial));
        }
        self.buffer.finish_input();
        self.buffer.process_buffer().await;
    }

    /// Interrupts the running turn, if any.
    pub fn stop(&self) {
        if let Some(token) = self.lock_turn().take() {
            token.cancel();
        }
        self.buffer.stop_chat();
    }

    fn lock_turn(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        match self.turn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Splits off every complete line (keeping its `\n`), leaving the unfinished
/// tail in `partial`.
fn take_complete_lines(partial: &mut String) -> Vec<String> {
    let Some(end) = partial.rfind('\n') else {
        return Vec::new();
    };
    let rest = partial.split_off(end + 1);
    let complete = std::mem::replace(partial, rest);
    complete.split_inclusive('\n').map(str::to_string).collect()
}

/// Live chatbots keyed by agent and conversation id.
pub struct ChatSessions {
    sessions: RwLock<HashMap<(AgentId, String), Arc<Chatbot>>>,
    engine: Arc<dyn ConversationEngine>,
    pacing: Duration,
    sink: Arc<dyn CodeBlockSink>,
}

impl ChatSessions {
    pub fn new(engine: Arc<dyn ConversationEngine>, pacing: Duration, sink: Arc<dyn CodeBlockSink>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            engine,
            pacing,
            sink,
        }
    }

    pub async fn get(&self, agent_id: &AgentId, conversation_id: &str) -> Option<Arc<Chatbot>> {
        self.sessions
            .read()
            .await
            .get(&(agent_id.clone(), conversation_id.to_string()))
            .cloned()
    }

    pub async fn get_or_create(&self, agent: &Arc<Agent>, conversation_id: &str) -> Arc<Chatbot> {
        if let Some(bot) = self.get(&agent.id, conversation_id).await {
            return bot;
        }
        let mut sessions = self.sessions.write().await;
        sessions
            .entry((agent.id.clone(), conversation_id.to_string()))
            .or_insert_with(|| {
                tracing::info!(agent = %agent.id.short(), conversation = conversation_id, "Creating chat session");
                Arc::new(Chatbot::new(
                    agent.clone(),
                    self.engine.clone(),
                    self.pacing,
                    self.sink.clone(),
                ))
            })
            .clone()
    }

    /// Returns `false` when no such session exists.
    pub async fn stop(&self, agent_id: &AgentId, conversation_id: &str) -> bool {
        match self.get(agent_id, conversation_id).await {
            Some(bot) => {
                bot.stop();
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}
