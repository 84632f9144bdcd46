use std::time::{Duration, Instant};

use futures_util::{StreamExt, TryStreamExt};
use reqwest::{Client, ClientBuilder, RequestBuilder, Response, StatusCode};
use serde::{Serialize, de::DeserializeOwned};

use crate::config::HttpCfg;
use crate::error::{CoreResult, RelayError};
use crate::stream::ByteStream;

/// Request context carries the relay label and the caller's request id.
#[derive(Clone, Copy, Default)]
pub struct RequestCtx<'a> {
    pub relay: Option<&'a str>,
    pub request_id: Option<&'a str>,
}

impl RequestCtx<'_> {
    fn provider(&self) -> &str {
        self.relay.unwrap_or("http")
    }
}

/// Represents a single Server-Sent-Event line (already split on `\n`).
#[derive(Debug, Clone)]
pub struct SseLine {
    pub line: String,
}

/// A boxed stream of `SseLine` results.
pub type SseStream =
    std::pin::Pin<Box<dyn futures_util::stream::Stream<Item = CoreResult<SseLine>> + Send>>;

/// Thin wrapper around reqwest::Client with defaults and helpers.
///
/// Two pools: `inner` bounds each call by the total request timeout;
/// `streaming` only bounds the gap between body reads.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
    streaming: Client,
    user_agent: String,
}

fn build_client(
    cfg: &HttpCfg,
    limit: impl FnOnce(ClientBuilder) -> ClientBuilder,
) -> CoreResult<Client> {
    let mut builder = limit(
        Client::builder().connect_timeout(Duration::from_millis(cfg.connect_timeout_ms)),
    );
    if let Some(n) = cfg.pool_max_idle_per_host {
        builder = builder.pool_max_idle_per_host(n);
    }
    builder
        .build()
        .map_err(|e| RelayError::Other(anyhow::anyhow!("http client build failed: {e}")))
}

impl HttpClient {
    pub fn new(cfg: &HttpCfg) -> CoreResult<Self> {
        let total = Duration::from_millis(cfg.request_timeout_ms);
        let idle = Duration::from_millis(cfg.stream_idle_timeout_ms);
        Ok(Self {
            inner: build_client(cfg, |b| b.timeout(total))?,
            streaming: build_client(cfg, |b| b.read_timeout(idle))?,
            user_agent: "chatrelay/0.1".to_string(),
        })
    }

    pub fn new_default() -> CoreResult<Self> {
        Self::new(&HttpCfg::default())
    }

    fn decorate(
        &self,
        mut req: RequestBuilder,
        headers: &[(&str, &str)],
        ctx: &RequestCtx<'_>,
    ) -> RequestBuilder {
        req = req.header("User-Agent", &self.user_agent);
        for (k, v) in headers {
            req = req.header(*k, *v);
        }
        if let Some(rid) = ctx.request_id {
            req = req.header("X-Request-Id", rid);
        }
        req
    }

    /// Send and reject non-2xx statuses. The upstream error body is logged,
    /// truncated into the error, and never forwarded to the caller.
    async fn send_checked(
        &self,
        req: RequestBuilder,
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<Response> {
        let provider = ctx.provider();
        let resp = req.send().await.map_err(|e| {
            tracing::warn!(relay = provider, error = %e, "upstream request failed");
            RelayError::ProviderUnavailable {
                provider: provider.to_string(),
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let headers = resp.headers().clone();
            let ra = parse_retry_after(&headers);
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(
                relay = provider,
                status = status.as_u16(),
                body = %truncate(&body, 300),
                "upstream returned an error status"
            );
            return Err(map_http_error(provider, status, ra, &body));
        }
        Ok(resp)
    }

    /// POST a JSON body and return the status-checked response, body unread.
    /// The body is bounded by the total request timeout.
    pub async fn post_json_response<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<Response> {
        let req = self.decorate(self.inner.post(url).json(body), headers, ctx);
        self.send_checked(req, ctx).await
    }

    /// Like [`Self::post_json_response`] for bodies read as a stream: only the
    /// idle gap between reads is bounded.
    pub async fn post_json_stream<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<Response> {
        let req = self.decorate(self.streaming.post(url).json(body), headers, ctx);
        self.send_checked(req, ctx).await
    }

    /// GET with query pairs on the streaming pool; the body is left unread.
    pub async fn get_stream(
        &self,
        url: &str,
        query: &[(&str, &str)],
        headers: &[(&str, &str)],
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<Response> {
        let req = self.decorate(self.streaming.get(url).query(query), headers, ctx);
        self.send_checked(req, ctx).await
    }

    pub async fn post_json<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<(R, u32)> {
        let start = Instant::now();
        let resp = self.post_json_response(url, body, headers, ctx).await?;
        let parsed = decode_json::<R>(resp, ctx).await?;
        Ok((parsed, start.elapsed().as_millis() as u32))
    }

    pub async fn get_json<R: DeserializeOwned>(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<(R, u32)> {
        let start = Instant::now();
        let req = self.decorate(self.inner.get(url), headers, ctx);
        let resp = self.send_checked(req, ctx).await?;
        let parsed = decode_json::<R>(resp, ctx).await?;
        Ok((parsed, start.elapsed().as_millis() as u32))
    }
}

async fn decode_json<R: DeserializeOwned>(resp: Response, ctx: &RequestCtx<'_>) -> CoreResult<R> {
    let status = resp.status();
    resp.json::<R>()
        .await
        .map_err(|e| RelayError::ProviderError {
            provider: ctx.provider().to_string(),
            code: status.as_u16().to_string(),
            message: format!("json decode error: {e}"),
        })
}

/// Expose a response body as a byte stream. Dropping the stream releases the
/// upstream connection.
pub fn body_stream(resp: Response, provider: &str) -> ByteStream {
    let provider = provider.to_string();
    Box::pin(resp.bytes_stream().map_err(move |e| {
        tracing::warn!(relay = %provider, error = %e, "upstream body read failed");
        RelayError::ProviderUnavailable {
            provider: provider.clone(),
        }
    }))
}

/// Split a byte stream into SSE lines.
pub fn sse_lines(body: ByteStream) -> SseStream {
    Box::pin(LineStream::new(body))
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    if let Some(v) = headers.get("retry-after")
        && let Ok(s) = v.to_str()
        && let Ok(secs) = s.trim().parse::<u64>()
    {
        return Some(secs);
    }
    // HTTP-date forms are ignored.
    None
}

fn map_http_error(
    provider: &str,
    status: StatusCode,
    retry_after: Option<u64>,
    body: &str,
) -> RelayError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => RelayError::RateLimited {
            provider: provider.to_string(),
            retry_after,
        },
        s if s.is_server_error() => RelayError::ProviderUnavailable {
            provider: provider.to_string(),
        },
        s => RelayError::ProviderError {
            provider: provider.to_string(),
            code: s.as_u16().to_string(),
            message: truncate(body, 300),
        },
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() > max {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        let mut t = s[..cut].to_string();
        t.push_str("...");
        t
    } else {
        s.to_string()
    }
}

/// Internal line splitter over a bytes stream; yields `SseLine`s separated by '\n'.
///
/// Bytes are buffered until a newline arrives so multi-byte characters split
/// across network chunks decode correctly.
struct LineStream {
    inner: ByteStream,
    buf: Vec<u8>,
    flushed_tail: bool,
}

impl LineStream {
    fn new(inner: ByteStream) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            flushed_tail: false,
        }
    }

    fn take_line(&mut self, end: usize) -> SseLine {
        let mut raw: Vec<u8> = self.buf.drain(..end).collect();
        if raw.last() == Some(&b'\n') {
            raw.pop();
        }
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
        SseLine {
            line: String::from_utf8_lossy(&raw).into_owned(),
        }
    }
}

impl futures_util::stream::Stream for LineStream {
    type Item = CoreResult<SseLine>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        use std::task::Poll;
        loop {
            // If we already have a newline in the buffer, split and yield immediately.
            if let Some(idx) = self.buf.iter().position(|&b| b == b'\n') {
                let line = self.take_line(idx + 1);
                return Poll::Ready(Some(Ok(line)));
            }

            match self.inner.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    self.buf.extend_from_slice(&chunk);
                    continue;
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => {
                    if !self.flushed_tail && !self.buf.is_empty() {
                        self.flushed_tail = true;
                        let len = self.buf.len();
                        let line = self.take_line(len);
                        return Poll::Ready(Some(Ok(line)));
                    } else {
                        return Poll::Ready(None);
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
