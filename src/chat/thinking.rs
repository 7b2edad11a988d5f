//! Rotating "thinking" label shown while an agent turn is in progress.
//!
//! Three sources compete for the label with a fixed priority: an explicit status
//! message beats a running function, which beats the generic filler. A start
//! request with lower priority than the active source is ignored. Each chat
//! session owns its own manager.

use super::function_name::humanize;
use super::scheduler::{Scheduler, TimerHandle};
use crate::constants::{FUNCTION_ROTATION, FUNCTION_TEMPLATES, GENERAL_PHRASES, GENERAL_ROTATION};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThinkingType {
    General,
    Function,
    Status,
}

impl ThinkingType {
    pub fn priority(self) -> u8 {
        match self {
            ThinkingType::General => 1,
            ThinkingType::Function => 2,
            ThinkingType::Status => 3,
        }
    }
}

pub type LabelCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct ThinkingState {
    current: Option<ThinkingType>,
    index: usize,
    function_name: Option<String>,
    status_message: Option<String>,
    callback: Option<LabelCallback>,
    timer: Option<TimerHandle>,
    // Bumped on every start/stop so ticks from a replaced timer are ignored.
    epoch: u64,
}

impl ThinkingState {
    fn message(&self) -> String {
        match self.current {
            Some(ThinkingType::General) => GENERAL_PHRASES[self.index % GENERAL_PHRASES.len()].to_string(),
            Some(ThinkingType::Function) => {
                let name = humanize(self.function_name.as_deref().unwrap_or(""));
                FUNCTION_TEMPLATES[self.index % FUNCTION_TEMPLATES.len()].replace("{name}", &name)
            }
            Some(ThinkingType::Status) => self.status_message.clone().unwrap_or_default(),
            None => String::new(),
        }
    }

    fn rotation_len(&self) -> usize {
        match self.current {
            Some(ThinkingType::General) => GENERAL_PHRASES.len(),
            Some(ThinkingType::Function) => FUNCTION_TEMPLATES.len(),
            _ => 1,
        }
    }
}

pub struct ThinkingManager {
    state: Arc<Mutex<ThinkingState>>,
    scheduler: Arc<dyn Scheduler>,
}

impl ThinkingManager {
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ThinkingState::default())),
            scheduler,
        }
    }

    /// Returns `false` when a higher-priority label is already active and the
    /// request was ignored.
    pub fn start(
        &self,
        kind: ThinkingType,
        callback: LabelCallback,
        function_name: Option<&str>,
        status_message: Option<&str>,
    ) -> bool {
        let (first, epoch) = {
            let mut state = lock(&self.state);
            let active = state.current.map(ThinkingType::priority).unwrap_or(0);
            if kind.priority() < active {
                tracing::trace!(?kind, "Ignoring lower-priority thinking label");
                return false;
            }

            if let Some(timer) = state.timer.take() {
                timer.cancel();
            }
            state.epoch += 1;
            state.current = Some(kind);
            state.index = 0;
            state.function_name = function_name.map(str::to_string);
            state.status_message = status_message.map(str::to_string);
            state.callback = Some(callback.clone());
            (state.message(), state.epoch)
        };

        callback(&first);

        let period = match kind {
            ThinkingType::General => GENERAL_ROTATION,
            ThinkingType::Function => FUNCTION_ROTATION,
            ThinkingType::Status => return true,
        };

        let shared = Arc::clone(&self.state);
        let handle = self.scheduler.repeat(
            period,
            Box::new(move || {
                let (message, callback) = {
                    let mut state = lock(&shared);
                    if state.epoch != epoch {
                        return;
                    }
                    state.index = (state.index + 1) % state.rotation_len();
                    (state.message(), state.callback.clone())
                };
                if let Some(callback) = callback {
                    callback(&message);
                }
            }),
        );

        let mut state = lock(&self.state);
        if state.epoch == epoch {
            state.timer = Some(handle);
        }
        true
    }

    /// Replaces the shown message while a status label is active. Does nothing
    /// otherwise.
    pub fn update_status(&self, message: &str) -> bool {
        let callback = {
            let mut state = lock(&self.state);
            if state.current != Some(ThinkingType::Status) {
                return false;
            }
            state.status_message = Some(message.to_string());
            state.callback.clone()
        };
        if let Some(callback) = callback {
            callback(message);
        }
        true
    }

    pub fn stop(&self) {
        let mut state = lock(&self.state);
        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }
        state.epoch += 1;
        state.current = None;
        state.index = 0;
        state.function_name = None;
        state.status_message = None;
        state.callback = None;
    }

    pub fn current(&self) -> Option<ThinkingType> {
        lock(&self.state).current
    }

    pub fn current_index(&self) -> usize {
        lock(&self.state).index
    }

    pub fn is_active(&self) -> bool {
        self.current().is_some()
    }
}

impl Drop for ThinkingManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock(state: &Mutex<ThinkingState>) -> MutexGuard<'_, ThinkingState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
