use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use secrecy::{ExposeSecret, SecretString};
use tracing::{Instrument, Span, field::Empty};

use crate::config::{
    AuthScheme, RelayMethod, RelayProfile, RequestShape, ResponseMode, resolve_url,
};
use crate::error::{CoreResult, RelayError};
use crate::http_client::{HttpClient, RequestCtx, body_stream, sse_lines};
use crate::model::{ChatCompletion, ChatMessage, Role, UpstreamChatRequest};
use crate::normalizer::{normalize_messages, normalize_prompt, normalize_temperature};
use crate::stream::{ByteStream, chunk_events, collect_reply, reply_frames};
use crate::telemetry::{
    self, KEY_ERROR_KIND, KEY_LATENCY_MS, KEY_REQUEST_ID, KEY_UPSTREAM_STATUS, RelayTrace,
};

/// Prompt used when a GET relay is called without a usable `?prompt=`.
pub const DEFAULT_PROMPT: &str = "Hello";

/// What the caller sent, before any profile defaults are applied.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayInput {
    /// POST body. `None` when the body had no `messages` field.
    Messages(Option<Vec<ChatMessage>>),
    /// GET query parameters.
    Prompt {
        prompt: Option<String>,
        conversation_id: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelayRequest {
    pub input: RelayInput,
    pub request_id: Option<String>,
}

impl RelayRequest {
    pub fn messages(messages: Option<Vec<ChatMessage>>) -> Self {
        Self {
            input: RelayInput::Messages(messages),
            request_id: None,
        }
    }

    pub fn prompt(prompt: Option<String>, conversation_id: Option<String>) -> Self {
        Self {
            input: RelayInput::Prompt {
                prompt,
                conversation_id,
            },
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, rid: Option<String>) -> Self {
        self.request_id = rid;
        self
    }
}

/// Relay result, ready to be written to the caller.
pub enum RelayOutput {
    /// `text/event-stream` body.
    Stream(ByteStream),
    /// `application/json` body.
    Json(serde_json::Value),
}

impl std::fmt::Debug for RelayOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stream(_) => f.write_str("Stream(..)"),
            Self::Json(v) => f.debug_tuple("Json").field(v).finish(),
        }
    }
}

#[async_trait]
pub trait ChatRelay: Send + Sync {
    fn name(&self) -> &str;
    fn route(&self) -> &str;
    fn method(&self) -> RelayMethod;
    async fn relay(&self, req: RelayRequest) -> CoreResult<RelayOutput>;
}

/// A relay endpoint driven entirely by its [`RelayProfile`].
pub struct Relay {
    profile: RelayProfile,
    http: HttpClient,
    /// Full upstream URL, `upstream_path` already appended.
    url: Option<String>,
    api_key: Option<SecretString>,
}

struct Dispatched {
    output: RelayOutput,
    reply_chars: Option<usize>,
}

impl Relay {
    pub fn new(
        profile: RelayProfile,
        http: HttpClient,
        url: Option<String>,
        api_key: Option<SecretString>,
    ) -> Self {
        Self {
            profile,
            http,
            url,
            api_key,
        }
    }

    /// Resolve the upstream URL and credential through `env`. Missing values
    /// are kept as `None` and reported when the relay is called.
    pub fn from_profile(
        profile: RelayProfile,
        http: HttpClient,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Self {
        let url = resolve_url(
            profile.upstream_url.as_deref(),
            profile.upstream_url_env.as_deref(),
            env,
        )
        .map(|base| match &profile.upstream_path {
            Some(path) => format!("{}{}", base.trim_end_matches('/'), path),
            None => base,
        });
        let api_key = profile
            .api_key_env
            .as_deref()
            .and_then(env)
            .filter(|k| !k.trim().is_empty())
            .map(SecretString::from);
        Self::new(profile, http, url, api_key)
    }

    /// True when the URL and, if the scheme needs one, the credential are set.
    pub fn is_configured(&self) -> bool {
        self.url.is_some() && (self.profile.auth == AuthScheme::None || self.api_key.is_some())
    }

    fn upstream_url(&self) -> CoreResult<&str> {
        self.url.as_deref().ok_or_else(|| {
            RelayError::Config(format!("relay '{}': upstream URL is not set", self.profile.name))
        })
    }

    fn auth_headers(&self) -> CoreResult<Vec<(String, String)>> {
        let key = match self.profile.auth {
            AuthScheme::None => return Ok(Vec::new()),
            _ => self.api_key.as_ref().ok_or_else(|| {
                RelayError::Config(format!("relay '{}': API key is not set", self.profile.name))
            })?,
        };
        let header = match self.profile.auth {
            AuthScheme::Header => (
                self.profile
                    .auth_header
                    .clone()
                    .unwrap_or_else(|| "api-key".to_string()),
                key.expose_secret().to_string(),
            ),
            _ => (
                "Authorization".to_string(),
                format!("Bearer {}", key.expose_secret()),
            ),
        };
        Ok(vec![header])
    }

    /// Caller messages with the profile's system prompt in front.
    fn chat_messages(&self, input: RelayInput) -> CoreResult<Vec<ChatMessage>> {
        let messages = match input {
            RelayInput::Messages(Some(m)) if !m.is_empty() => normalize_messages(m),
            RelayInput::Messages(_) => {
                return Err(RelayError::Validation("request carries no messages".into()));
            }
            RelayInput::Prompt { prompt, .. } => vec![ChatMessage::user(prompt_or_default(prompt))],
        };
        let mut out = Vec::with_capacity(messages.len() + 1);
        if let Some(system) = &self.profile.system_prompt {
            out.push(ChatMessage::system(system.clone()));
        }
        out.extend(messages);
        Ok(out)
    }

    /// Query pairs for `prompt_query` upstreams. A non-empty caller-supplied
    /// `conversation_id` replaces the profile default.
    fn prompt_query(&self, input: RelayInput) -> CoreResult<Vec<(String, String)>> {
        let (prompt, conversation_id) = match input {
            RelayInput::Prompt {
                prompt,
                conversation_id,
            } => (prompt_or_default(prompt), conversation_id),
            RelayInput::Messages(messages) => {
                let last_user = messages
                    .unwrap_or_default()
                    .into_iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .ok_or_else(|| {
                        RelayError::Validation("request carries no user message".into())
                    })?;
                (prompt_or_default(Some(last_user.content)), None)
            }
        };
        let mut pairs = vec![("prompt".to_string(), prompt)];
        let mut cid = conversation_id.filter(|c| !c.is_empty());
        for (k, v) in &self.profile.query {
            let v = if k == "conversation_id" {
                cid.take().unwrap_or_else(|| v.clone())
            } else {
                v.clone()
            };
            pairs.push((k.clone(), v));
        }
        if let Some(given) = cid {
            pairs.push(("conversation_id".to_string(), given));
        }
        Ok(pairs)
    }

    async fn dispatch(&self, req: RelayRequest, span: &Span) -> CoreResult<Dispatched> {
        let url = self.upstream_url()?;
        let owned_headers = self.auth_headers()?;
        let headers: Vec<(&str, &str)> = owned_headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let ctx = RequestCtx {
            relay: Some(self.profile.name.as_str()),
            request_id: req.request_id.as_deref(),
        };
        let mode = self.profile.response;
        let start = Instant::now();

        if !mode.upstream_streams() {
            let messages = self.chat_messages(req.input)?;
            let body = self.chat_body(&messages, false);
            let (completion, latency) = self
                .http
                .post_json::<_, ChatCompletion>(url, &body, &headers, &ctx)
                .await?;
            span.record(KEY_UPSTREAM_STATUS, 200u64);
            span.record(KEY_LATENCY_MS, u64::from(latency));
            let content = completion
                .choices
                .into_iter()
                .next()
                .map(|c| c.message.content.unwrap_or_default())
                .ok_or_else(|| RelayError::ProviderError {
                    provider: self.profile.name.clone(),
                    code: "empty".into(),
                    message: "completion has no choices".into(),
                })?;
            return Ok(Dispatched {
                reply_chars: Some(content.chars().count()),
                output: RelayOutput::Json(serde_json::Value::String(content)),
            });
        }

        let resp = match self.profile.request {
            RequestShape::ChatCompletion => {
                let messages = self.chat_messages(req.input)?;
                let body = self.chat_body(&messages, true);
                self.http.post_json_stream(url, &body, &headers, &ctx).await?
            }
            RequestShape::PromptQuery => {
                let owned_query = self.prompt_query(req.input)?;
                let query: Vec<(&str, &str)> = owned_query
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.as_str()))
                    .collect();
                self.http.get_stream(url, &query, &headers, &ctx).await?
            }
        };
        span.record(KEY_UPSTREAM_STATUS, u64::from(resp.status().as_u16()));
        span.record(KEY_LATENCY_MS, start.elapsed().as_millis() as u64);
        let body = body_stream(resp, &self.profile.name);

        match mode {
            ResponseMode::Collect => {
                let reply = collect_reply(chunk_events(sse_lines(body))).await?;
                tracing::debug!(chunks = reply.chunk_count(), "collected upstream reply");
                let frames = reply_frames(reply.as_str());
                Ok(Dispatched {
                    reply_chars: Some(reply.as_str().chars().count()),
                    output: RelayOutput::Stream(Box::pin(futures::stream::once(
                        futures::future::ready(Ok(Bytes::from(frames))),
                    ))),
                })
            }
            _ => Ok(Dispatched {
                reply_chars: None,
                output: RelayOutput::Stream(body),
            }),
        }
    }

    fn chat_body<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        stream: bool,
    ) -> UpstreamChatRequest<'a> {
        UpstreamChatRequest {
            model: &self.profile.model,
            messages,
            temperature: normalize_temperature(self.profile.temperature),
            stream: stream.then_some(true),
        }
    }
}

/// Missing, empty and whitespace-only prompts all fall back to the default.
fn prompt_or_default(prompt: Option<String>) -> String {
    prompt
        .map(|p| normalize_prompt(&p))
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| DEFAULT_PROMPT.to_string())
}

#[async_trait]
impl ChatRelay for Relay {
    fn name(&self) -> &str {
        &self.profile.name
    }

    fn route(&self) -> &str {
        &self.profile.route
    }

    fn method(&self) -> RelayMethod {
        self.profile.method
    }

    async fn relay(&self, req: RelayRequest) -> CoreResult<RelayOutput> {
        let span = tracing::info_span!(
            "relay",
            relay.name = %self.profile.name,
            relay.mode = self.profile.response.as_str(),
            req.id = Empty,
            upstream.status = Empty,
            latency.ms = Empty,
            error.kind = Empty
        );
        if let Some(rid) = req.request_id.as_deref() {
            span.record(KEY_REQUEST_ID, rid);
        }
        let request_id = req.request_id.clone();
        let start = Instant::now();
        let result = self.dispatch(req, &span).instrument(span.clone()).await;

        let mut trace = RelayTrace::new()
            .relay(&self.profile.name)
            .mode(self.profile.response.as_str())
            .request_id_opt(request_id.as_deref())
            .latency_ms(start.elapsed().as_millis() as u64);
        match &result {
            Ok(done) => {
                if let Some(n) = done.reply_chars {
                    trace = trace.reply_chars(n);
                }
            }
            Err(e) => {
                span.record(KEY_ERROR_KIND, e.kind());
                trace = trace.error(e.kind(), &e.to_string());
            }
        }
        telemetry::emit(trace);
        result.map(|d| d.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, HttpCfg};
    use crate::test_upstream::paced_sse;
    use futures::TryStreamExt;
    use httpmock::Method::{GET, POST};
    use httpmock::MockServer;
    use once_cell::sync::Lazy;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    static TRACES: Lazy<Mutex<Vec<RelayTrace>>> = Lazy::new(|| Mutex::new(Vec::new()));

    struct VecSink;
    impl telemetry::TelemetrySink for VecSink {
        fn record(&self, trace: RelayTrace) {
            TRACES.lock().unwrap().push(trace);
        }
    }

    fn builtin(name: &str) -> RelayProfile {
        Config::builtin()
            .relays
            .into_iter()
            .find(|r| r.name == name)
            .unwrap()
    }

    fn relay_for(profile: RelayProfile, url: String, key: Option<&str>) -> Relay {
        Relay::new(
            profile,
            HttpClient::new_default().unwrap(),
            Some(url),
            key.map(|k| SecretString::from(k.to_string())),
        )
    }

    async fn body_text(out: RelayOutput) -> String {
        match out {
            RelayOutput::Stream(s) => {
                let parts: Vec<Bytes> = s.try_collect().await.unwrap();
                String::from_utf8(parts.concat()).unwrap()
            }
            other => panic!("expected stream, got {other:?}"),
        }
    }

    const SSE_BODY: &str = "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\"}}]}\n\n\
data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\\n\"}}]}\n\n\
data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"there\"},\"finish_reason\":\"stop\"}]}\n\n\
data: [DONE]\n\n";

    #[tokio::test]
    async fn stream_mode_forwards_upstream_bytes() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/chat")
                .header("authorization", "Bearer sk-test")
                .json_body(json!({
                    "model": "gpt-4",
                    "messages": [
                        {"role": "system", "content": ""},
                        {"role": "user", "content": "  hi "}
                    ],
                    "temperature": 0.1,
                    "stream": true
                }));
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(SSE_BODY);
        });

        let relay = relay_for(builtin("gpt"), server.url("/v1/chat"), Some("sk-test"));
        let out = relay
            .relay(RelayRequest::messages(Some(vec![ChatMessage::user("  hi ")])))
            .await
            .unwrap();
        assert_eq!(body_text(out).await, SSE_BODY);
        m.assert();
    }

    #[tokio::test]
    async fn missing_key_is_a_config_error() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(POST);
            then.status(200);
        });
        let relay = relay_for(builtin("gpt"), server.url("/"), None);
        let err = relay
            .relay(RelayRequest::messages(Some(vec![ChatMessage::user("hi")])))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Config(_)), "got {err:?}");
        m.assert_hits(0);
    }

    #[tokio::test]
    async fn missing_url_is_a_config_error() {
        let http = HttpClient::new_default().unwrap();
        let relay = Relay::from_profile(builtin("gpt"), http, &|_| None);
        let err = relay
            .relay(RelayRequest::messages(Some(vec![ChatMessage::user("hi")])))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Config(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn empty_or_missing_messages_are_rejected() {
        let relay = relay_for(builtin("gpt"), "http://127.0.0.1:9".into(), Some("k"));
        for messages in [None, Some(vec![])] {
            let err = relay.relay(RelayRequest::messages(messages)).await.unwrap_err();
            assert!(matches!(err, RelayError::Validation(_)), "got {err:?}");
        }
    }

    #[tokio::test]
    async fn get_relay_defaults_prompt_and_prepends_system() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions").json_body(json!({
                "model": "gpt-4-1106-preview",
                "messages": [
                    {"role": "system", "content": "You are a helpful assistant. Your name is GPT-4"},
                    {"role": "user", "content": "Hello"}
                ],
                "temperature": 0.0,
                "stream": true
            }));
            then.status(200).body("data: [DONE]\n\n");
        });
        let relay = relay_for(builtin("openai"), server.url("/v1/chat/completions"), Some("k"));
        let out = relay.relay(RelayRequest::prompt(None, None)).await.unwrap();
        assert_eq!(body_text(out).await, "data: [DONE]\n\n");
        m.assert();
    }

    #[tokio::test]
    async fn blank_prompt_falls_back_to_default() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .body_contains(r#"{"role":"user","content":"Hello"}"#);
            then.status(200).body("data: [DONE]\n\n");
        });
        let relay = relay_for(builtin("openai"), server.url("/v1/chat/completions"), Some("k"));
        for prompt in ["", "  \r\n "] {
            relay
                .relay(RelayRequest::prompt(Some(prompt.into()), None))
                .await
                .unwrap();
        }
        m.assert_hits(2);
    }

    #[tokio::test]
    async fn empty_query_values_keep_defaults() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(GET)
                .path("/chat")
                .query_param("prompt", "Hello")
                .query_param("conversation_id", "bxdxxysdsdl");
            then.status(200).body("data: ok\n\n");
        });
        let env = |k: &str| (k == "SECRET_API_URL").then(|| server.base_url());
        let relay = Relay::from_profile(builtin("sse"), HttpClient::new_default().unwrap(), &env);
        let out = relay
            .relay(RelayRequest::prompt(Some(String::new()), Some(String::new())))
            .await
            .unwrap();
        assert_eq!(body_text(out).await, "data: ok\n\n");
        m.assert();
    }

    #[tokio::test]
    async fn stream_mode_is_not_cut_by_request_timeout() {
        let (addr, expected) = paced_sse(6, Duration::from_millis(150)).await;
        let cfg = HttpCfg {
            request_timeout_ms: 300,
            ..HttpCfg::default()
        };
        let relay = Relay::new(
            builtin("sse"),
            HttpClient::new(&cfg).unwrap(),
            Some(format!("http://{addr}/chat")),
            None,
        );
        let out = relay.relay(RelayRequest::prompt(Some("long".into()), None)).await.unwrap();
        assert_eq!(body_text(out).await, expected);
    }

    #[tokio::test]
    async fn collect_mode_emits_one_reply_event() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200).body(SSE_BODY);
        });
        let relay = relay_for(builtin("fallback"), server.url("/chat/completions"), Some("k"));
        let out = relay.relay(RelayRequest::prompt(Some("hey".into()), None)).await.unwrap();
        assert_eq!(
            body_text(out).await,
            "data: Hi\ndata: there\n\nevent: end\ndata: \n\n"
        );
    }

    #[tokio::test]
    async fn json_string_mode_returns_message_content() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(POST).path("/complete").json_body(json!({
                "model": "gpt-4",
                "messages": [{"role": "user", "content": "2+2?"}]
            }));
            then.status(200).json_body(json!({
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "4"}}]
            }));
        });
        let relay = relay_for(builtin("complete"), server.url("/complete"), Some("k"));
        let out = relay
            .relay(RelayRequest::messages(Some(vec![ChatMessage::user("2+2?")])))
            .await
            .unwrap();
        match out {
            RelayOutput::Json(v) => assert_eq!(v, json!("4")),
            other => panic!("expected json, got {other:?}"),
        }
        m.assert();
    }

    #[tokio::test]
    async fn prompt_query_sends_fixed_pairs() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(GET)
                .path("/chat")
                .query_param("prompt", "what is rust?")
                .query_param("conversation_id", "c-42")
                .query_param("first", "false")
                .query_param("model_version", "gpt-4-32k");
            then.status(200).body("data: ok\n\n");
        });
        let env = |k: &str| (k == "SECRET_API_URL").then(|| server.base_url());
        let relay = Relay::from_profile(builtin("sse"), HttpClient::new_default().unwrap(), &env);
        let out = relay
            .relay(RelayRequest::prompt(
                Some("what is rust?".into()),
                Some("c-42".into()),
            ))
            .await
            .unwrap();
        assert_eq!(body_text(out).await, "data: ok\n\n");
        m.assert();
    }

    #[tokio::test]
    async fn header_auth_uses_configured_header() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(POST).path("/c").header("x-api-key", "secret");
            then.status(200).body("data: [DONE]\n\n");
        });
        let mut profile = builtin("gpt");
        profile.auth = AuthScheme::Header;
        profile.auth_header = Some("x-api-key".into());
        let relay = relay_for(profile, server.url("/c"), Some("secret"));
        relay
            .relay(RelayRequest::messages(Some(vec![ChatMessage::user("hi")])))
            .await
            .unwrap();
        m.assert();
    }

    #[tokio::test]
    async fn upstream_failure_is_an_error() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST);
            then.status(502).body("bad gateway");
        });
        let relay = relay_for(builtin("gpt"), server.url("/c"), Some("k"));
        let err = relay
            .relay(RelayRequest::messages(Some(vec![ChatMessage::user("hi")])))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::ProviderUnavailable { .. }), "got {err:?}");
    }

    #[test]
    fn from_profile_appends_path_and_resolves_key() {
        let env = |k: &str| match k {
            "SECRET_FALLBACK_API_URL" => Some("http://up/".to_string()),
            "SECRET_FALLBACK_API_KEY" => Some("k".to_string()),
            _ => None,
        };
        let http = HttpClient::new_default().unwrap();
        let relay = Relay::from_profile(builtin("fallback"), http, &env);
        assert_eq!(relay.upstream_url().unwrap(), "http://up/chat/completions");
        assert_eq!(relay.auth_headers().unwrap()[0].1, "Bearer k");
    }

    #[tokio::test]
    async fn span_and_trace_record_the_call() {
        let _ = telemetry::set_telemetry_sink(Arc::new(VecSink));
        telemetry::test_set_capture_enabled(true);
        let (store, _guard) = telemetry::test_span::install_capture();

        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST);
            then.status(200).body(SSE_BODY);
        });
        let relay = relay_for(builtin("fallback"), server.url("/c"), Some("k"));
        relay
            .relay(RelayRequest::prompt(None, None).with_request_id(Some("req-span".into())))
            .await
            .unwrap();

        let span = store.last(telemetry::SPAN_RELAY).expect("relay span");
        assert_eq!(span.field(telemetry::KEY_RELAY).as_deref(), Some("fallback"));
        assert_eq!(span.field(telemetry::KEY_MODE).as_deref(), Some("collect"));
        assert_eq!(span.field(KEY_REQUEST_ID).as_deref(), Some("req-span"));
        assert_eq!(span.field(KEY_UPSTREAM_STATUS).as_deref(), Some("200"));
        assert!(span.field(KEY_LATENCY_MS).is_some());
        assert!(span.field(KEY_ERROR_KIND).is_none());

        let traces = TRACES.lock().unwrap().clone();
        let trace = traces
            .iter()
            .find(|t| t.request_id.as_deref() == Some("req-span"))
            .expect("trace emitted");
        assert_eq!(trace.reply_chars, Some("Hi\nthere".chars().count()));
        assert!(!trace.is_error());
        telemetry::test_set_capture_enabled(false);
    }
}
