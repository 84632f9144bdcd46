use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Stop,
    Length,
    ToolUse,
    ContentFilter,
    Other,
}

impl StopReason {
    /// Map an OpenAI-style `finish_reason` string.
    pub fn from_finish(s: Option<&str>) -> Option<Self> {
        match s {
            Some("stop") => Some(Self::Stop),
            Some("length") => Some(Self::Length),
            Some("content_filter") => Some(Self::ContentFilter),
            Some("tool_calls") => Some(Self::ToolUse),
            Some(_) => Some(Self::Other),
            None => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Body accepted by POST relay routes. `messages` stays optional so a missing
/// list is reported as a validation error rather than a decode failure.
#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
pub struct RelayBody {
    #[serde(default)]
    pub messages: Option<Vec<ChatMessage>>,
}

/// Outbound chat-completion request (OpenAI-compatible).
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct UpstreamChatRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

// ---- Streaming chunk shape ----

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Delta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: Delta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// One incremental unit of an upstream streaming response.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

impl ChatCompletionChunk {
    /// Delta content of the first choice (`index == 0`), if any.
    pub fn primary_content(&self) -> Option<&str> {
        self.choices
            .iter()
            .find(|c| c.index == 0)
            .and_then(|c| c.delta.content.as_deref())
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.choices
            .iter()
            .find(|c| c.index == 0)
            .and_then(|c| StopReason::from_finish(c.finish_reason.as_deref()))
    }
}

// ---- Non-streaming completion shape (json_string mode) ----

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct CompletionMessage {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct CompletionChoice {
    pub message: CompletionMessage,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ChatCompletion {
    #[serde(default)]
    pub choices: Vec<CompletionChoice>,
}

/// Entry returned by the models endpoint.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ModelEntry {
    pub id: String,
    pub name: String,
}
