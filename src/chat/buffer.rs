//! Paced playback of an agent reply.
//!
//! Lines produced by the conversation engine are appended to the buffer and
//! drained by `process_buffer`, which emits prose in small chunks and code blocks
//! line by line. At most one pump runs at a time; the guard is checked and
//! released under the same lock that appends lines, so a line appended while a
//! pump is finishing is never stranded.

use crate::constants::{CHUNK_SIZE, CODE_FENCE, CODE_FENCE_LANG};
use crate::str_utils::{chunk_chars, strip_quotes};
use crate::types::*;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

lazy_static! {
    static ref FENCE_ATTR: Regex = Regex::new(r#"([\w-]+)=("[^"]*"|'[^']*'|\S+)"#).unwrap();
}

pub type BlockProps = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq)]
pub enum BufferEvent {
    /// A piece of prose, at most `CHUNK_SIZE` characters.
    Content(String),
    /// One line inside an open code block.
    Code { props: BlockProps, line: String },
    /// A code block closed; `code` is everything between the fences.
    CodeDone { props: BlockProps, code: String },
    /// The turn drained completely and was added to history.
    End { message: String },
    Interrupted,
}

/// Invoked with the buffer lock held; must not call back into the buffer.
pub type BufferCallback = Arc<dyn Fn(BufferEvent) + Send + Sync>;

/// Receives finished code blocks. Failures are logged and otherwise ignored.
#[async_trait]
pub trait CodeBlockSink: Send + Sync {
    async fn save(&self, props: &BlockProps, code: &str) -> Result<()>;
}

/// Default sink: records the block in the log only.
pub struct LogCodeSink;

#[async_trait]
impl CodeBlockSink for LogCodeSink {
    async fn save(&self, props: &BlockProps, code: &str) -> Result<()> {
        tracing::debug!(
            id = props.get("id").map(String::as_str).unwrap_or("-"),
            file = props.get("file").map(String::as_str).unwrap_or("-"),
            "Code block completed ({} bytes)",
            code.len()
        );
        Ok(())
    }
}

#[derive(Default)]
struct BufferState {
    lines: Vec<String>,
    index: usize,
    content: String,
    in_code_block: bool,
    block_props: BlockProps,
    block_code: String,
    processing: bool,
    interrupted: bool,
    buffering: bool,
    epoch: u64,
    history: Vec<ConvMessage>,
    callback: Option<BufferCallback>,
}

impl BufferState {
    fn reset_turn(&mut self) {
        self.lines.clear();
        self.index = 0;
        self.content.clear();
        self.in_code_block = false;
        self.block_props.clear();
        self.block_code.clear();
        self.processing = false;
        self.buffering = false;
    }

    fn emit(&self, event: BufferEvent) {
        if let Some(callback) = &self.callback {
            callback(event);
        }
    }
}

enum Step {
    Prose(String),
    CodeLine(BlockProps, String),
    CloseBlock(BlockProps, String),
    Nothing,
}

/// Snapshot for assertions and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferStatus {
    pub lines: usize,
    pub index: usize,
    pub content_len: usize,
    pub in_code_block: bool,
    pub processing: bool,
    pub interrupted: bool,
    pub buffering: bool,
}

#[derive(Clone)]
pub struct DisplayBuffer {
    state: Arc<Mutex<BufferState>>,
    pacing: Duration,
    sink: Arc<dyn CodeBlockSink>,
}

impl DisplayBuffer {
    /// `pacing` is the pause between prose chunks; zero only yields to the
    /// scheduler.
    pub fn new(pacing: Duration, sink: Arc<dyn CodeBlockSink>) -> Self {
        Self {
            state: Arc::new(Mutex::new(BufferState::default())),
            pacing,
            sink,
        }
    }

    /// Starts a turn: records the user message and routes the turn's events to
    /// `callback`. Input stays open until `finish_input`.
    pub fn begin_turn(&self, user_message: &str, callback: BufferCallback) {
        let mut state = self.lock();
        state.reset_turn();
        state.interrupted = false;
        state.epoch += 1;
        state.buffering = true;
        state.callback = Some(callback);
        state.history.push(ConvMessage::user(user_message));
    }

    pub fn append_lines<I>(&self, lines: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut state = self.lock();
        if state.interrupted {
            return;
        }
        state.lines.extend(lines);
    }

    /// No more lines will arrive for this turn.
    pub fn finish_input(&self) {
        self.lock().buffering = false;
    }

    /// Drains buffered lines. Returns immediately if another pump is active.
    pub async fn process_buffer(&self) {
        let epoch = {
            let mut state = self.lock();
            if state.processing || state.interrupted {
                return;
            }
            state.processing = true;
            state.epoch
        };

        loop {
            let step = {
                let mut state = self.lock();
                if state.interrupted || state.epoch != epoch {
                    return;
                }
                if state.index >= state.lines.len() {
                    state.processing = false;
                    if !state.buffering {
                        Self::finalize(&mut state);
                    }
                    return;
                }
                let line = state.lines[state.index].clone();
                state.index += 1;
                state.content.push_str(&line);
                Self::classify(&mut state, line)
            };

            match step {
                Step::Prose(line) => {
                    for chunk in chunk_chars(&line, CHUNK_SIZE) {
                        if !self.emit_current(epoch, BufferEvent::Content(chunk.to_string())) {
                            return;
                        }
                        self.pause().await;
                    }
                }
                Step::CodeLine(props, line) => {
                    if !self.emit_current(epoch, BufferEvent::Code { props, line }) {
                        return;
                    }
                }
                Step::CloseBlock(props, code) => {
                    if let Err(e) = self.sink.save(&props, &code).await {
                        tracing::warn!("Failed to save code block: {}", e.inner);
                    }
                    if !self.emit_current(epoch, BufferEvent::CodeDone { props, code }) {
                        return;
                    }
                }
                Step::Nothing => {}
            }
        }
    }

    /// Interrupts the current turn. Buffered data is dropped and nothing is added
    /// to history.
    pub fn stop_chat(&self) {
        let callback = {
            let mut state = self.lock();
            state.interrupted = true;
            state.epoch += 1;
            state.reset_turn();
            state.callback.take()
        };
        if let Some(callback) = callback {
            callback(BufferEvent::Interrupted);
        }
    }

    /// Drops the current turn without emitting anything, used when the engine
    /// fails mid-turn. The unanswered user message is removed from history.
    pub fn abort_turn(&self) {
        let mut state = self.lock();
        state.epoch += 1;
        state.reset_turn();
        state.callback = None;
        if state.history.last().map(|m| m.role) == Some(Role::User) {
            state.history.pop();
        }
    }

    pub fn history(&self) -> Vec<ConvMessage> {
        self.lock().history.clone()
    }

    pub fn status(&self) -> BufferStatus {
        let state = self.lock();
        BufferStatus {
            lines: state.lines.len(),
            index: state.index,
            content_len: state.content.len(),
            in_code_block: state.in_code_block,
            processing: state.processing,
            interrupted: state.interrupted,
            buffering: state.buffering,
        }
    }

    fn classify(state: &mut BufferState, line: String) -> Step {
        let trimmed = line.trim();
        if trimmed.starts_with(CODE_FENCE) {
            if state.in_code_block {
                state.in_code_block = false;
                let props = std::mem::take(&mut state.block_props);
                let code = std::mem::take(&mut state.block_code);
                return Step::CloseBlock(props, code);
            }
            let spec = trimmed[CODE_FENCE.len()..].trim_start();
            if let Some(attrs) = spec.strip_prefix(CODE_FENCE_LANG) {
                state.in_code_block = true;
                state.block_props = parse_fence_attributes(attrs);
                state.block_code.clear();
                return Step::Nothing;
            }
        }

        if state.in_code_block {
            state.block_code.push_str(&line);
            return Step::CodeLine(state.block_props.clone(), line);
        }
        Step::Prose(line)
    }

    fn finalize(state: &mut BufferState) {
        let message = state.content.trim_end().to_string();
        if !message.is_empty() {
            state.history.push(ConvMessage::assistant(message.clone()));
        }
        state.reset_turn();
        if let Some(callback) = state.callback.take() {
            callback(BufferEvent::End { message });
        }
    }

    fn emit_current(&self, epoch: u64, event: BufferEvent) -> bool {
        let state = self.lock();
        if state.interrupted || state.epoch != epoch {
            return false;
        }
        state.emit(event);
        true
    }

    async fn pause(&self) {
        if self.pacing.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.pacing).await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// `id=code_1 file="a.py"` -> `{id: code_1, file: a.py}`
pub fn parse_fence_attributes(attrs: &str) -> BlockProps {
    FENCE_ATTR
        .captures_iter(attrs)
        .filter_map(|c| {
            let key = c.get(1)?.as_str().to_string();
            let value = strip_quotes(c.get(2)?.as_str()).to_string();
            Some((key, value))
        })
        .collect()
}
