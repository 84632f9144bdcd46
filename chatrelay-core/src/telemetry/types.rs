use serde::{Deserialize, Serialize};

/// One record per relay call, handed to the installed [`super::TelemetrySink`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RelayTrace {
    /// Relay profile name, e.g. "gpt", "fallback".
    pub relay: Option<String>,

    /// Response mode: "stream", "collect" or "json_string".
    pub mode: Option<String>,

    /// Caller-supplied request id, if any.
    pub request_id: Option<String>,

    /// Time until the upstream answered (headers for streams, full body otherwise).
    pub latency_ms: Option<u64>,

    /// Characters of reply text, when the relay read the whole reply.
    pub reply_chars: Option<usize>,

    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

impl RelayTrace {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn relay(mut self, name: &str) -> Self {
        self.relay = Some(name.to_string());
        self
    }
    pub fn mode(mut self, mode: &str) -> Self {
        self.mode = Some(mode.to_string());
        self
    }
    pub fn request_id_opt(mut self, rid: Option<&str>) -> Self {
        self.request_id = rid.map(|s| s.to_string());
        self
    }
    pub fn latency_ms(mut self, ms: u64) -> Self {
        self.latency_ms = Some(ms);
        self
    }
    pub fn reply_chars(mut self, n: usize) -> Self {
        self.reply_chars = Some(n);
        self
    }
    pub fn error(mut self, kind: &str, msg: &str) -> Self {
        self.error_kind = Some(kind.to_string());
        self.error_message = Some(msg.to_string());
        self
    }
    pub fn is_error(&self) -> bool {
        self.error_kind.is_some()
    }
}
