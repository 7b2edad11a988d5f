use std::time::Duration;

/// Routing headers. Header names are matched case-insensitively.
pub const FORCE_AGENT_RUNNER_HEADER: &str = "x-force-agent-runner";
pub const FORCE_DEBUGGER_HEADER: &str = "x-force-debugger";
pub const ROUTING_MODE_HEADER: &str = "x-routing-mode";
pub const MONITOR_ID_HEADER: &str = "x-monitor-id";

/// Any of these puts a request on the debugger path.
pub const DEBUG_MARKER_HEADERS: &[&str] = &[
    "x-debug-run",
    "x-debug-read",
    "x-debug-inject",
    "x-debug-stop",
    "x-debug-skip",
    MONITOR_ID_HEADER,
];

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";
pub const AGENT_ID_HEADER: &str = "x-agent-id";
pub const CONVERSATION_ID_HEADER: &str = "x-conversation-id";

/// Processor route answering the fixed debug-session endpoint.
pub const DEBUG_SESSION_ROUTE: &str = "debugSession";
pub const MONITOR_ROUTE: &str = "monitor";

/// Literal values accepted by `ROUTING_MODE_HEADER`.
pub const MODE_DEBUGGER: &str = "debugger";
pub const MODE_AGENT_RUNNER: &str = "agent-runner";

/// Chat pacing
pub const CHUNK_SIZE: usize = 3;
pub const CODE_FENCE: &str = "```";
pub const CODE_FENCE_LANG: &str = "smyth";

/// Thinking label rotation
pub const GENERAL_ROTATION: Duration = Duration::from_secs(3);
pub const FUNCTION_ROTATION: Duration = Duration::from_secs(5);

pub const GENERAL_PHRASES: &[&str] = &[
    "Thinking...",
    "Analyzing your request...",
    "Gathering context...",
    "Putting together a response...",
    "Almost there...",
];

/// `{name}` is replaced by the humanised function name.
pub const FUNCTION_TEMPLATES: &[&str] = &[
    "Using skill: {name}",
    "Running {name}...",
    "Waiting for {name} to respond...",
    "Processing {name} results...",
];

pub const CANCELLED_MESSAGE: &str = "Request was cancelled";
pub const GENERIC_FAILURE_MESSAGE: &str = "Internal Server Error";

/// Upstream conversation engine defaults
pub const DEFAULT_UPSTREAM_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_UPSTREAM_MODEL: &str = "gpt-4o-mini";
pub const UPSTREAM_API_KEY_ENV: &str = "AGENTRY_UPSTREAM_API_KEY";
pub const MAX_STREAM_LINES: usize = 100_000;
