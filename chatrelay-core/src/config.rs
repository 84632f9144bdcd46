use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::Path};

use crate::error::{CoreResult, RelayError};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RelayMethod {
    /// JSON body `{ "messages": [...] }`.
    #[default]
    Post,
    /// `?prompt=...` query parameter.
    Get,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthScheme {
    /// `Authorization: Bearer <key>`
    #[default]
    Bearer,
    /// Raw key in the header named by `auth_header`.
    Header,
    None,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RequestShape {
    /// POST `{model, messages, temperature?, stream?}`.
    #[default]
    ChatCompletion,
    /// GET with `prompt`, `conversation_id` and the profile's fixed query pairs.
    PromptQuery,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    /// Forward upstream SSE bytes unmodified.
    #[default]
    Stream,
    /// Read the upstream SSE stream to the end and answer with one reply event.
    Collect,
    /// Non-streaming upstream call; answer with the reply as a JSON string.
    JsonString,
}

impl ResponseMode {
    /// Whether the upstream is asked for a streaming response.
    pub fn upstream_streams(self) -> bool {
        !matches!(self, Self::JsonString)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Collect => "collect",
            Self::JsonString => "json_string",
        }
    }
}

fn default_model() -> String {
    "gpt-4".to_string()
}

/// Everything needed to build one relay endpoint.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RelayProfile {
    pub name: String,
    /// Path the router mounts this relay at, e.g. `/api/gpt`.
    pub route: String,
    #[serde(default)]
    pub method: RelayMethod,
    /// Literal upstream URL; takes precedence over `upstream_url_env`.
    #[serde(default)]
    pub upstream_url: Option<String>,
    /// Name of the environment variable holding the upstream URL.
    #[serde(default)]
    pub upstream_url_env: Option<String>,
    /// Appended to the resolved upstream URL.
    #[serde(default)]
    pub upstream_path: Option<String>,
    /// Name of the environment variable holding the credential.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub auth: AuthScheme,
    #[serde(default)]
    pub auth_header: Option<String>,
    #[serde(default)]
    pub request: RequestShape,
    #[serde(default)]
    pub response: ResponseMode,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Prepended as a `system` message when set (an empty string still counts).
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Fixed query pairs for `prompt_query` requests.
    #[serde(default)]
    pub query: BTreeMap<String, String>,
}

/// A plain upstream JSON endpoint (status, model catalog).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct UpstreamCfg {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub url_env: Option<String>,
}

impl UpstreamCfg {
    pub fn from_env(var: &str) -> Self {
        Self {
            url: None,
            url_env: Some(var.to_string()),
        }
    }

    /// Literal URL first, then the named environment variable. Empty values
    /// count as missing.
    pub fn resolve(&self, env: &dyn Fn(&str) -> Option<String>) -> Option<String> {
        resolve_url(self.url.as_deref(), self.url_env.as_deref(), env)
    }
}

pub(crate) fn resolve_url(
    literal: Option<&str>,
    env_var: Option<&str>,
    env: &dyn Fn(&str) -> Option<String>,
) -> Option<String> {
    literal
        .map(str::to_string)
        .or_else(|| env_var.and_then(env))
        .filter(|u| !u.trim().is_empty())
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerCfg {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerCfg {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Total request timeout for non-streaming calls in milliseconds (default 60000ms)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Longest gap between reads of a streamed upstream body (default 60000ms)
    #[serde(default = "default_stream_idle_timeout_ms")]
    pub stream_idle_timeout_ms: u64,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            stream_idle_timeout_ms: default_stream_idle_timeout_ms(),
            pool_max_idle_per_host: None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_request_timeout_ms() -> u64 {
    60_000
}
fn default_stream_idle_timeout_ms() -> u64 {
    60_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerCfg,
    /// HTTP client configuration (timeouts, pooling). Missing → defaults.
    #[serde(default)]
    pub http: HttpCfg,
    #[serde(default)]
    pub relays: Vec<RelayProfile>,
    #[serde(default)]
    pub status: Option<UpstreamCfg>,
    #[serde(default)]
    pub models: Option<UpstreamCfg>,
}

/// Paths the server mounts itself; relays may not claim them.
pub const RESERVED_ROUTES: &[&str] = &[
    "/api/status",
    "/api/models",
    "/api/blocks",
    "/api/prettify",
    "/health",
];

impl Config {
    /// Load a Config from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(RelayError::from)?;
        let s = std::str::from_utf8(&bytes)
            .map_err(|e| RelayError::Config(format!("{}: {e}", path.display())))?;
        let json = |s: &str| {
            serde_json::from_str::<Self>(s)
                .map_err(|e| RelayError::Config(format!("{}: {e}", path.display())))
        };
        let toml = |s: &str| {
            toml::from_str::<Self>(s)
                .map_err(|e| RelayError::Config(format!("{}: {e}", path.display())))
        };
        let cfg = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => json(s)?,
            Some("toml") => toml(s)?,
            _ => json(s).or_else(|_| toml(s))?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Route paths must be absolute, unique and not reserved; names must be unique.
    pub fn validate(&self) -> CoreResult<()> {
        let mut names = std::collections::HashSet::new();
        let mut routes = std::collections::HashSet::new();
        for r in &self.relays {
            if !r.route.starts_with('/') {
                return Err(RelayError::Config(format!(
                    "relay '{}': route '{}' must start with '/'",
                    r.name, r.route
                )));
            }
            if RESERVED_ROUTES.contains(&r.route.as_str()) {
                return Err(RelayError::Config(format!(
                    "relay '{}': route '{}' is reserved",
                    r.name, r.route
                )));
            }
            if !names.insert(r.name.as_str()) {
                return Err(RelayError::Config(format!("duplicate relay name '{}'", r.name)));
            }
            if !routes.insert(r.route.as_str()) {
                return Err(RelayError::Config(format!("duplicate relay route '{}'", r.route)));
            }
        }
        Ok(())
    }

    /// The stock endpoint set, wired to the conventional `SECRET_*`
    /// environment variables.
    pub fn builtin() -> Self {
        let sse_query = [
            ("conversation_id", "bxdxxysdsdl"),
            ("first", "false"),
            ("user_id", ""),
            ("model_version", "gpt-4-32k"),
            ("web_search", "false"),
            ("summarize", "false"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            server: ServerCfg::default(),
            http: HttpCfg::default(),
            relays: vec![
                RelayProfile {
                    name: "gpt".into(),
                    route: "/api/gpt".into(),
                    method: RelayMethod::Post,
                    upstream_url: None,
                    upstream_url_env: Some("SECRET_API_URL".into()),
                    upstream_path: None,
                    api_key_env: Some("SECRET_API_KEY".into()),
                    auth: AuthScheme::Bearer,
                    auth_header: None,
                    request: RequestShape::ChatCompletion,
                    response: ResponseMode::Stream,
                    model: "gpt-4".into(),
                    temperature: Some(0.1),
                    system_prompt: Some(String::new()),
                    query: BTreeMap::new(),
                },
                RelayProfile {
                    name: "openai".into(),
                    route: "/api/openai".into(),
                    method: RelayMethod::Get,
                    upstream_url: Some("https://api.openai.com/v1/chat/completions".into()),
                    upstream_url_env: None,
                    upstream_path: None,
                    api_key_env: Some("SECRET_OPENAI_KEY".into()),
                    auth: AuthScheme::Bearer,
                    auth_header: None,
                    request: RequestShape::ChatCompletion,
                    response: ResponseMode::Stream,
                    model: "gpt-4-1106-preview".into(),
                    temperature: Some(0.0),
                    system_prompt: Some("You are a helpful assistant. Your name is GPT-4".into()),
                    query: BTreeMap::new(),
                },
                RelayProfile {
                    name: "fallback".into(),
                    route: "/api/fallback".into(),
                    method: RelayMethod::Get,
                    upstream_url: None,
                    upstream_url_env: Some("SECRET_FALLBACK_API_URL".into()),
                    upstream_path: Some("/chat/completions".into()),
                    api_key_env: Some("SECRET_FALLBACK_API_KEY".into()),
                    auth: AuthScheme::Bearer,
                    auth_header: None,
                    request: RequestShape::ChatCompletion,
                    response: ResponseMode::Collect,
                    model: "gpt-4-32k-0314".into(),
                    temperature: Some(0.0),
                    system_prompt: Some("You are a helpful assistant.".into()),
                    query: BTreeMap::new(),
                },
                RelayProfile {
                    name: "sse".into(),
                    route: "/api/sse".into(),
                    method: RelayMethod::Get,
                    upstream_url: None,
                    upstream_url_env: Some("SECRET_API_URL".into()),
                    upstream_path: Some("/chat".into()),
                    api_key_env: None,
                    auth: AuthScheme::None,
                    auth_header: None,
                    request: RequestShape::PromptQuery,
                    response: ResponseMode::Stream,
                    model: default_model(),
                    temperature: None,
                    system_prompt: None,
                    query: sse_query,
                },
                RelayProfile {
                    name: "complete".into(),
                    route: "/api/complete".into(),
                    method: RelayMethod::Post,
                    upstream_url: None,
                    upstream_url_env: Some("SECRET_API_URL".into()),
                    upstream_path: None,
                    api_key_env: Some("SECRET_API_KEY".into()),
                    auth: AuthScheme::Bearer,
                    auth_header: None,
                    request: RequestShape::ChatCompletion,
                    response: ResponseMode::JsonString,
                    model: "gpt-4".into(),
                    temperature: None,
                    system_prompt: None,
                    query: BTreeMap::new(),
                },
            ],
            status: Some(UpstreamCfg::from_env("SECRET_STATUS_URL")),
            models: Some(UpstreamCfg::from_env("SECRET_API_MODELS")),
        }
    }
}
