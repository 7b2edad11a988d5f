//! Cancellable repeating timers.
//!
//! `TokioScheduler` drives real timers on the runtime. `ManualScheduler` keeps a
//! virtual clock that only moves when `advance` is called, so timer-driven code
//! can be tested without waiting.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub type Tick = Box<dyn FnMut() + Send + 'static>;

/// Stops its timer when cancelled or dropped.
#[derive(Debug)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

pub trait Scheduler: Send + Sync {
    /// Calls `tick` every `period`, first after one full period.
    fn repeat(&self, period: Duration, tick: Tick) -> TimerHandle;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn repeat(&self, period: Duration, mut tick: Tick) -> TimerHandle {
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = interval.tick() => tick(),
                }
            }
        });
        TimerHandle::new(token)
    }
}

struct ManualTimer {
    period: Duration,
    due: Duration,
    tick: Option<Tick>,
    token: CancellationToken,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    timers: Vec<ManualTimer>,
}

/// Virtual clock for tests.
#[derive(Clone, Default)]
pub struct ManualScheduler {
    state: Arc<Mutex<ManualState>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> Duration {
        self.lock().now
    }

    /// Number of timers that have not been cancelled.
    pub fn active_timers(&self) -> usize {
        self.lock()
            .timers
            .iter()
            .filter(|t| !t.token.is_cancelled())
            .count()
    }

    /// Moves the clock forward, firing every timer that falls due on the way in
    /// chronological order. Ticks run without the scheduler lock held, so they may
    /// schedule or cancel timers themselves.
    pub fn advance(&self, by: Duration) {
        let target = self.lock().now + by;
        loop {
            let (idx, mut tick) = {
                let mut state = self.lock();
                state.timers.retain(|t| !t.token.is_cancelled());
                let next = state
                    .timers
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.due <= target && t.tick.is_some())
                    .min_by_key(|(_, t)| t.due)
                    .map(|(i, _)| i);
                let Some(idx) = next else {
                    state.now = target;
                    return;
                };
                let due = state.timers[idx].due;
                state.now = due;
                match state.timers[idx].tick.take() {
                    Some(tick) => (idx, tick),
                    None => continue,
                }
            };

            tick();

            let mut state = self.lock();
            // Indices are stable here: timers are only removed at the top of the loop.
            if let Some(timer) = state.timers.get_mut(idx) {
                timer.due += timer.period;
                timer.tick = Some(tick);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Scheduler for ManualScheduler {
    fn repeat(&self, period: Duration, tick: Tick) -> TimerHandle {
        let token = CancellationToken::new();
        let mut state = self.lock();
        let due = state.now + period;
        state.timers.push(ManualTimer {
            period,
            due,
            tick: Some(tick),
            token: token.clone(),
        });
        TimerHandle::new(token)
    }
}
