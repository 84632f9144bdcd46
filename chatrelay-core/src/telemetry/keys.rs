/// Span/log field names for relay calls.
/// Keep these stable; log queries and dashboards match on them.
pub const SPAN_RELAY: &str = "relay";

pub const KEY_RELAY: &str = "relay.name";
pub const KEY_MODE: &str = "relay.mode";
pub const KEY_REQUEST_ID: &str = "req.id";
pub const KEY_UPSTREAM_STATUS: &str = "upstream.status";
pub const KEY_LATENCY_MS: &str = "latency.ms";

/// Error-related (if applicable)
pub const KEY_ERROR_KIND: &str = "error.kind";
