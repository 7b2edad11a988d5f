//! Debugging affordances of the debugger mode: per-agent debug sessions and a
//! monitor hub that fans processed chat events out to SSE subscribers.

use crate::constants::{DEBUG_MARKER_HEADERS, DEBUG_SESSION_ROUTE};
use crate::pipeline::{MiddlewareFlow, RequestContext, RequestMiddleware};
use crate::types::*;
use async_trait::async_trait;
use axum::response::sse::Event;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

const MONITOR_CAPACITY: usize = 256;

/// One debug session id per agent, created on first use.
#[derive(Debug, Default)]
pub struct DebugSessions {
    sessions: RwLock<HashMap<AgentId, String>>,
}

impl DebugSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, agent_id: &AgentId) -> Option<String> {
        self.sessions.read().await.get(agent_id).cloned()
    }

    pub async fn get_or_create(&self, agent_id: &AgentId) -> String {
        if let Some(id) = self.get(agent_id).await {
            return id;
        }
        self.sessions
            .write()
            .await
            .entry(agent_id.clone())
            .or_insert_with(|| {
                let id = Uuid::new_v4().to_string();
                tracing::info!(agent = %agent_id.short(), session = %id, "Debug session created");
                id
            })
            .clone()
    }
}

/// Attaches the agent's debug session to the context. A session is created
/// when the request carries debug marker headers or asks for the session
/// itself; otherwise an existing one is attached if there is one.
pub struct DebugSessionMiddleware {
    sessions: Arc<DebugSessions>,
}

impl DebugSessionMiddleware {
    pub fn new(sessions: Arc<DebugSessions>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl RequestMiddleware for DebugSessionMiddleware {
    async fn handle(&self, ctx: &mut RequestContext) -> Result<MiddlewareFlow> {
        let Some(agent_id) = ctx.agent_id.clone() else {
            return Ok(MiddlewareFlow::Continue);
        };

        let marked = DEBUG_MARKER_HEADERS
            .iter()
            .any(|name| ctx.headers.contains_key(*name));
        ctx.debug_session = if marked || ctx.path == DEBUG_SESSION_ROUTE {
            Some(self.sessions.get_or_create(&agent_id).await)
        } else {
            self.sessions.get(&agent_id).await
        };
        Ok(MiddlewareFlow::Continue)
    }

    fn name(&self) -> &'static str {
        "debug_session"
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MonitorEvent {
    pub agent_id: AgentId,
    /// Only this subscriber receives the event when set.
    pub subscription_id: Option<SubscriptionId>,
    pub event: String,
    pub payload: serde_json::Value,
}

#[derive(Clone)]
pub struct MonitorHub {
    sender: broadcast::Sender<MonitorEvent>,
    subscribers: Arc<Mutex<HashMap<SubscriptionId, AgentId>>>,
}

impl Default for MonitorHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(MONITOR_CAPACITY);
        Self {
            sender,
            subscribers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Registers a subscriber for `agent_id`. The returned stream yields the
    /// agent's events until it is dropped, which unregisters it.
    pub fn subscribe(
        &self,
        agent_id: AgentId,
    ) -> (SubscriptionId, impl Stream<Item = MonitorEvent> + Send + 'static) {
        let id = SubscriptionId::new();
        self.lock().insert(id.clone(), agent_id.clone());
        tracing::info!(agent = %agent_id.short(), subscription = %id, "Monitor subscribed");

        let guard = Unsubscribe {
            hub: self.clone(),
            id: id.clone(),
        };
        let target = id.clone();
        let stream = BroadcastStream::new(self.sender.subscribe()).filter_map(move |msg| {
            let _registered = &guard;
            let out = match msg {
                Ok(event)
                    if event.agent_id == agent_id
                        && event.subscription_id.as_ref().map_or(true, |s| *s == target) =>
                {
                    Some(event)
                }
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(subscription = %target, "Monitor subscriber lagged: {}", e);
                    None
                }
            };
            futures_util::future::ready(out)
        });
        (id, stream)
    }

    /// `subscribe` rendered as SSE: an `init` frame carrying the subscription id,
    /// then one frame per event named after `MonitorEvent::event`.
    pub fn event_stream(
        &self,
        agent_id: AgentId,
    ) -> (SubscriptionId, BoxStream<'static, std::result::Result<Event, Infallible>>) {
        let (subscription, updates) = self.subscribe(agent_id);
        let init = Event::default().event("init").data(subscription.to_string());
        let updates = updates.map(|update| {
            Event::default()
                .event(update.event.as_str())
                .json_data(&update.payload)
                .unwrap_or_else(|_| Event::default().comment("unencodable event"))
        });
        let stream = futures_util::stream::once(futures_util::future::ready(init))
            .chain(updates)
            .map(Ok)
            .boxed();
        (subscription, stream)
    }

    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let removed = self.lock().remove(id).is_some();
        if removed {
            tracing::info!(subscription = %id, "Monitor unsubscribed");
        }
        removed
    }

    /// Returns how many subscribers could see the event.
    pub fn publish(&self, event: MonitorEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_subscribed(&self, id: &SubscriptionId) -> bool {
        self.lock().contains_key(id)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriptionId, AgentId>> {
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

struct Unsubscribe {
    hub: MonitorHub,
    id: SubscriptionId,
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.hub.unsubscribe(&self.id);
    }
}
