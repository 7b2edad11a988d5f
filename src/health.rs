use crate::main_helper::AppState;
use crate::metrics::ModeMetrics;
use axum::{extract::State, Json};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
    pub agents: usize,
    pub chat_sessions: usize,
    pub monitors: usize,
    pub modes: HashMap<&'static str, ModeMetrics>,
}

pub async fn liveness(State(state): State<Arc<AppState>>) -> Json<LivenessResponse> {
    Json(LivenessResponse {
        status: "ok",
        agents: state.registry.len(),
        chat_sessions: state.sessions.len().await,
        monitors: state.monitor.subscriber_count(),
        modes: state.metrics.snapshot().await,
    })
}
