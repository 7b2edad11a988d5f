//! Agent definitions and the middleware that attaches one to a request.
//!
//! Agents are read once at startup (from a JSON file or built in code) and are
//! never written back.

use crate::constants::AGENT_ID_HEADER;
use crate::pipeline::{MiddlewareFlow, ProcessorResponse, RequestContext, RequestMiddleware};
use crate::types::*;
use async_trait::async_trait;
use axum::http::header::HOST;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    pub id: AgentId,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub domain: Option<String>,
    /// System prompt handed to the conversation engine.
    #[serde(default)]
    pub behavior: String,
    #[serde(default)]
    pub name: Option<String>,
}

fn default_version() -> String {
    "latest".to_string()
}

impl Agent {
    pub fn new(id: impl Into<AgentId>, behavior: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: default_version(),
            domain: None,
            behavior: behavior.into(),
            name: None,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "name": self.name,
            "version": self.version,
            "domain": self.domain,
        })
    }
}

/// Read-only set of known agents, looked up by id or by domain.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    by_id: HashMap<AgentId, Arc<Agent>>,
    by_domain: HashMap<String, AgentId>,
}

impl AgentRegistry {
    pub fn new(agents: Vec<Agent>) -> Self {
        let mut registry = Self::default();
        for agent in agents {
            if let Some(domain) = &agent.domain {
                registry
                    .by_domain
                    .insert(domain.to_ascii_lowercase(), agent.id.clone());
            }
            registry.by_id.insert(agent.id.clone(), Arc::new(agent));
        }
        registry
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        let agents: Vec<Agent> = serde_json::from_str(&raw)?;
        tracing::info!("Loaded {} agents from {}", agents.len(), path.display());
        Ok(Self::new(agents))
    }

    pub fn get(&self, id: &AgentId) -> Option<Arc<Agent>> {
        self.by_id.get(id).cloned()
    }

    pub fn by_domain(&self, host: &str) -> Option<Arc<Agent>> {
        // Host headers may carry a port.
        let domain = host.split(':').next().unwrap_or(host).to_ascii_lowercase();
        self.by_domain.get(&domain).and_then(|id| self.get(id))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// Resolves the request's agent and stores it on the context.
///
/// Lookup order: path id, `x-agent-id` header, then `Host` matched against agent
/// domains. An unknown agent is answered with 404 directly.
pub struct AgentLoader {
    registry: Arc<AgentRegistry>,
}

impl AgentLoader {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl RequestMiddleware for AgentLoader {
    async fn handle(&self, ctx: &mut RequestContext) -> Result<MiddlewareFlow> {
        if ctx.agent_id.is_none() {
            ctx.agent_id = ctx.header(AGENT_ID_HEADER).map(AgentId::from);
        }

        let agent = match &ctx.agent_id {
            Some(id) => self.registry.get(id),
            None => ctx.header(HOST.as_str()).and_then(|h| self.registry.by_domain(h)),
        };

        match agent {
            Some(agent) => {
                tracing::debug!(agent = %agent.id.short(), version = %agent.version, "Agent resolved");
                ctx.agent_id = Some(agent.id.clone());
                ctx.agent = Some(agent);
                Ok(MiddlewareFlow::Continue)
            }
            None => {
                let wanted = match &ctx.agent_id {
                    Some(id) => id.to_string(),
                    None => "<unspecified>".to_string(),
                };
                tracing::info!("Agent not found: {}", wanted);
                Ok(MiddlewareFlow::Respond(ProcessorResponse::not_found(
                    format!("Agent not found: {}", wanted),
                )))
            }
        }
    }

    fn name(&self) -> &'static str {
        "agent_loader"
    }
}
