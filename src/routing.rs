//! Header-driven routing decision.
//!
//! `decide` looks only at header names and values. It performs no I/O, so it can
//! be exercised with a plain map in tests as well as with the live `HeaderMap`.

use crate::constants::{
    DEBUG_MARKER_HEADERS, FORCE_AGENT_RUNNER_HEADER, FORCE_DEBUGGER_HEADER, MODE_AGENT_RUNNER,
    MODE_DEBUGGER, ROUTING_MODE_HEADER,
};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// The two execution paths a request can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingMode {
    /// Primary mode, with debugging affordances attached.
    Debugger,
    /// Alternate mode, the production path.
    AgentRunner,
}

impl RoutingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingMode::Debugger => MODE_DEBUGGER,
            RoutingMode::AgentRunner => MODE_AGENT_RUNNER,
        }
    }

    pub fn from_header_value(value: &str) -> Option<Self> {
        match value.trim() {
            MODE_DEBUGGER => Some(RoutingMode::Debugger),
            MODE_AGENT_RUNNER => Some(RoutingMode::AgentRunner),
            _ => None,
        }
    }
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RoutingDecision {
    pub mode: RoutingMode,
    pub reason: &'static str,
}

impl RoutingDecision {
    pub fn use_alternate_mode(&self) -> bool {
        self.mode == RoutingMode::AgentRunner
    }
}

/// Read access to request headers by (case-insensitive) name.
pub trait HeaderSource {
    fn header(&self, name: &str) -> Option<&str>;

    fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }
}

impl HeaderSource for axum::http::HeaderMap {
    fn header(&self, name: &str) -> Option<&str> {
        // Non-ASCII values still count as present for the marker checks.
        self.get(name).map(|v| v.to_str().unwrap_or(""))
    }
}

impl HeaderSource for HashMap<String, String> {
    fn header(&self, name: &str) -> Option<&str> {
        self.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Classifies a request. Rules are evaluated in order and the first match wins.
pub fn decide<H: HeaderSource + ?Sized>(headers: &H) -> RoutingDecision {
    if headers.has_header(FORCE_AGENT_RUNNER_HEADER) {
        return RoutingDecision {
            mode: RoutingMode::AgentRunner,
            reason: "explicit override",
        };
    }

    if DEBUG_MARKER_HEADERS.iter().any(|h| headers.has_header(h)) {
        return RoutingDecision {
            mode: RoutingMode::Debugger,
            reason: "debug headers present",
        };
    }

    if headers.has_header(FORCE_DEBUGGER_HEADER) {
        return RoutingDecision {
            mode: RoutingMode::Debugger,
            reason: "explicit debugger request",
        };
    }

    if let Some(mode) = headers
        .header(ROUTING_MODE_HEADER)
        .and_then(RoutingMode::from_header_value)
    {
        return RoutingDecision {
            mode,
            reason: "explicit routing mode",
        };
    }

    RoutingDecision {
        mode: RoutingMode::AgentRunner,
        reason: "production-safe default",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_override_beats_debug_headers() {
        let d = decide(&map(&[("X-FORCE-AGENT-RUNNER", "true"), ("X-DEBUG-RUN", "true")]));
        assert_eq!(d.mode, RoutingMode::AgentRunner);
        assert_eq!(d.reason, "explicit override");
        assert!(d.use_alternate_mode());
    }

    #[test]
    fn test_debug_header_alone() {
        let d = decide(&map(&[("X-DEBUG-RUN", "true")]));
        assert_eq!(d.mode, RoutingMode::Debugger);
        assert_eq!(d.reason, "debug headers present");
    }

    #[test]
    fn test_every_debug_marker_routes_to_debugger() {
        for marker in DEBUG_MARKER_HEADERS {
            let d = decide(&map(&[(*marker, "1")]));
            assert_eq!(d.mode, RoutingMode::Debugger, "marker {}", marker);
        }
    }

    #[test]
    fn test_empty_headers_default() {
        let d = decide(&map(&[]));
        assert_eq!(d.mode, RoutingMode::AgentRunner);
        assert_eq!(d.reason, "production-safe default");
    }

    #[test]
    fn test_force_debugger_beats_routing_mode() {
        let d = decide(&map(&[
            ("x-force-debugger", ""),
            ("x-routing-mode", "agent-runner"),
        ]));
        assert_eq!(d.mode, RoutingMode::Debugger);
        assert_eq!(d.reason, "explicit debugger request");
    }

    #[test]
    fn test_routing_mode_literals() {
        let d = decide(&map(&[("x-routing-mode", "debugger")]));
        assert_eq!(d.mode, RoutingMode::Debugger);
        assert_eq!(d.reason, "explicit routing mode");

        let d = decide(&map(&[("x-routing-mode", "agent-runner")]));
        assert_eq!(d.mode, RoutingMode::AgentRunner);
        assert_eq!(d.reason, "explicit routing mode");

        let d = decide(&map(&[("x-routing-mode", "Debugger-ish")]));
        assert_eq!(d.reason, "production-safe default");
    }

    #[test]
    fn test_header_map_source() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert("x-debug-inject", "yes".parse().unwrap());
        assert_eq!(decide(&headers).mode, RoutingMode::Debugger);
    }

    #[test]
    fn test_deterministic() {
        let h = map(&[("x-debug-skip", "1"), ("x-routing-mode", "agent-runner")]);
        assert_eq!(decide(&h), decide(&h));
    }
}
