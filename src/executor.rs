//! The Codex executor: request preparation, the upstream call and response
//! translation for one credential at a time.
//!
//! Upstream application errors (any non-2xx status, a body without a
//! terminal event) are returned as `Ok` with an error-shaped body in the
//! client's wire format. Callers should answer those with HTTP 200 and pass
//! the body through; only transport failures come back as `Err`.

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONNECTION, CONTENT_TYPE};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::cache::ConversationCache;
use crate::config::{BridgeConfig, DEFAULT_BASE_URL};
use crate::credential::Credential;
use crate::error::{BridgeError, Result};
use crate::logging::SharedExchangeLog;
use crate::models::{resolve_original_model, Metadata};
use crate::normalize::{normalize_codex_body, set_prompt_cache_key};
use crate::refresh::refresh_credential;
use crate::sse::{data_payload, trim_ascii, LineBuffer};
use crate::tokenizer::{rune_fallback, TiktokenEstimator, TokenEstimator};
use crate::translate::response::{upstream_error_message, DISCONNECTED_MESSAGE};
use crate::translate::{self, Format, TranslationState};
use crate::usage::{parse_codex_usage, NoopUsageSink, UsageReporter, UsageSink};

pub const PROVIDER: &str = "codex";

const HEADER_VERSION: &str = "version";
const HEADER_OPENAI_BETA: &str = "openai-beta";
const HEADER_SESSION_ID: &str = "session_id";
const HEADER_CONVERSATION_ID: &str = "conversation_id";
const HEADER_ORIGINATOR: &str = "originator";
const HEADER_ACCOUNT_ID: &str = "chatgpt-account-id";

/// Custom credential headers may not replace these.
const PROTECTED_HEADERS: &[&str] = &["authorization", "content-type", "accept", "host", "content-length"];

/// One item of a streaming response: a complete client SSE record, or the
/// terminal error after which the channel closes.
pub type StreamChunk = Result<Bytes>;

/// The client's request as handed to the executor.
#[derive(Debug, Clone, Default)]
pub struct BridgeRequest {
    /// Model name as the client sent it.
    pub model: String,
    /// Body in the client's wire format.
    pub payload: Vec<u8>,
    /// Routing metadata (`thinking_original_model`, `base_model`,
    /// `reasoning_effort`).
    pub metadata: Metadata,
}

impl BridgeRequest {
    pub fn new(model: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            model: model.into(),
            payload: payload.into(),
            metadata: Metadata::new(),
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone)]
pub struct Options {
    pub source_format: Format,
    /// The untranslated client body. Only used as translation context
    /// (tool-name restoration, token counting); never re-sent.
    pub original_request: Vec<u8>,
    /// Inbound client headers. `Version`, `Openai-Beta` and `Session_id` are
    /// forwarded when present.
    pub headers: HeaderMap,
}

impl Options {
    pub fn new(source_format: Format) -> Self {
        Self {
            source_format,
            original_request: Vec::new(),
            headers: HeaderMap::new(),
        }
    }

    pub fn with_original_request(mut self, original_request: impl Into<Vec<u8>>) -> Self {
        self.original_request = original_request.into();
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeResponse {
    pub payload: Vec<u8>,
}

/// Everything needed to issue one upstream call.
struct PreparedCall {
    url: String,
    headers: HeaderMap,
    body: Vec<u8>,
    reporter: UsageReporter,
    client_model: String,
}

pub struct CodexExecutor {
    client: reqwest::Client,
    config: Arc<BridgeConfig>,
    cache: Arc<ConversationCache>,
    usage: Arc<dyn UsageSink>,
    estimator: Arc<dyn TokenEstimator>,
    exchange_log: Option<SharedExchangeLog>,
}

impl CodexExecutor {
    pub fn new(config: BridgeConfig, client: reqwest::Client) -> Self {
        let cache = Arc::new(ConversationCache::new(config.cache_ttl()));
        Self {
            client,
            config: Arc::new(config),
            cache,
            usage: Arc::new(NoopUsageSink),
            estimator: Arc::new(TiktokenEstimator::new()),
            exchange_log: None,
        }
    }

    pub fn with_usage_sink(mut self, sink: Arc<dyn UsageSink>) -> Self {
        self.usage = sink;
        self
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    /// Share one conversation cache between executors.
    pub fn with_cache(mut self, cache: Arc<ConversationCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_exchange_log(mut self, log: SharedExchangeLog) -> Self {
        self.exchange_log = Some(log);
        self
    }

    pub fn identifier(&self) -> &'static str {
        PROVIDER
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ConversationCache> {
        &self.cache
    }

    /// One-shot call. The upstream always streams; the body is scanned for
    /// the terminal event, which is translated into one client object.
    pub async fn execute(
        &self,
        credential: &Credential,
        req: &BridgeRequest,
        opts: &Options,
    ) -> Result<BridgeResponse> {
        let call = self.prepare(credential, req, opts, false)?;
        let resp = self.send(&call).await?;
        let status = resp.status();

        let body = match resp.bytes().await {
            Ok(b) => b,
            Err(e) => {
                self.log_error(&e);
                return Err(e.into());
            }
        };
        if let Some(log) = &self.exchange_log {
            log.response_chunk(PROVIDER, &body);
        }

        if !status.is_success() {
            let message = upstream_error_message(&body)
                .unwrap_or_else(|| format!("upstream {}", status.as_u16()));
            warn!(provider = PROVIDER, status = status.as_u16(), error = %message, "upstream returned an error");
            return Ok(BridgeResponse {
                payload: translate::error_body(opts.source_format, &message),
            });
        }

        let original = original_request(req, opts);
        let mut error_line: Option<&[u8]> = None;
        for line in body.split(|b| *b == b'\n') {
            if let Some(payload) = translate::terminal_payload(line) {
                publish_usage(&call.reporter, payload);
                let payload = translate::translate_non_stream(
                    Format::Codex,
                    opts.source_format,
                    &call.client_model,
                    original,
                    payload,
                );
                debug!(provider = PROVIDER, bytes = payload.len(), "translated terminal event");
                return Ok(BridgeResponse { payload });
            }
            if error_line.is_none() {
                error_line = data_payload(line).filter(|p| is_error_event(p));
            }
        }

        let payload = match error_line {
            Some(err) => translate::translate_non_stream(
                Format::Codex,
                opts.source_format,
                &call.client_model,
                original,
                err,
            ),
            None => translate::error_body(opts.source_format, DISCONNECTED_MESSAGE),
        };
        warn!(provider = PROVIDER, "upstream body ended without a terminal event");
        Ok(BridgeResponse { payload })
    }

    /// Streaming call. Returns once upstream headers arrive; the receiver
    /// then yields translated SSE records in upstream order and closes after
    /// the last record or a terminal `Err`.
    pub async fn execute_stream(
        &self,
        credential: &Credential,
        req: &BridgeRequest,
        opts: &Options,
    ) -> Result<mpsc::Receiver<StreamChunk>> {
        let call = self.prepare(credential, req, opts, true)?;
        let resp = self.send(&call).await?;
        let status = resp.status();

        if !status.is_success() {
            let body = match resp.bytes().await {
                Ok(b) => b,
                Err(e) => {
                    self.log_error(&e);
                    return Err(e.into());
                }
            };
            if let Some(log) = &self.exchange_log {
                log.response_chunk(PROVIDER, &body);
            }
            let line = trim_ascii(&body);
            let record = if line.starts_with(b"event:") {
                let mut record = line.to_vec();
                record.extend_from_slice(b"\n\n");
                Bytes::from(record)
            } else {
                let message = upstream_error_message(line)
                    .unwrap_or_else(|| format!("upstream {}", status.as_u16()));
                translate::error_event(&message)
            };
            warn!(provider = PROVIDER, status = status.as_u16(), "upstream stream returned an error");

            let (tx, rx) = mpsc::channel(1);
            if tx.try_send(Ok(record)).is_err() {
                debug!(provider = PROVIDER, "stream receiver dropped before the error record");
            }
            return Ok(rx);
        }

        let (tx, rx) = mpsc::channel(self.config.stream.channel_capacity.max(1));
        let pump = StreamPump {
            reporter: call.reporter,
            client_format: opts.source_format,
            client_model: call.client_model,
            original_request: original_request(req, opts).to_vec(),
            lines: LineBuffer::new(self.config.stream.max_line_bytes),
            state: TranslationState::new(),
            exchange_log: self.exchange_log.clone(),
        };
        tokio::spawn(pump.run(resp, tx));
        Ok(rx)
    }

    /// Local token estimate; Codex has no counting endpoint.
    pub async fn count_tokens(
        &self,
        _credential: &Credential,
        req: &BridgeRequest,
        opts: &Options,
    ) -> Result<BridgeResponse> {
        let raw = original_request(req, opts);
        let mut count = self.estimator.estimate(&req.model, raw);
        if count <= 0 {
            count = rune_fallback(raw);
        }
        debug!(provider = PROVIDER, model = %req.model, count, "estimated input tokens");
        Ok(BridgeResponse {
            payload: translate::token_count_body(count),
        })
    }

    /// Refresh OAuth tokens. Credentials without a refresh token come back
    /// unchanged.
    pub async fn refresh(&self, mut credential: Credential) -> Result<Credential> {
        debug!(provider = PROVIDER, credential = %credential.id, "refresh called");
        refresh_credential(&self.client, &self.config.oauth, &mut credential).await?;
        Ok(credential)
    }

    fn prepare(
        &self,
        credential: &Credential,
        req: &BridgeRequest,
        opts: &Options,
        stream: bool,
    ) -> Result<PreparedCall> {
        // Created first so that every early return still reports a failure.
        let reporter = UsageReporter::new(PROVIDER, &req.model, credential, Arc::clone(&self.usage));

        let (token, base_url) = credential.codex_creds();
        let base_url = [base_url.as_str(), self.config.upstream.base_url.as_str()]
            .into_iter()
            .map(str::trim)
            .find(|u| !u.is_empty())
            .unwrap_or(DEFAULT_BASE_URL)
            .to_string();

        let body = translate::translate_request(
            opts.source_format,
            Format::Codex,
            &req.model,
            &req.payload,
            stream,
        )?;
        let (mut body, resolved) =
            normalize_codex_body(&body, &req.model, &req.metadata, &self.config)?;

        let cache_id = self
            .cache
            .cache_id_for(opts.source_format, &req.payload, &req.model);
        if let (Some(id), Format::Claude) = (&cache_id, opts.source_format) {
            body = set_prompt_cache_key(&body, id)?;
        }

        let headers = self.codex_headers(credential, &token, cache_id.as_deref(), &opts.headers);
        let url = format!("{}/responses", base_url.trim_end_matches('/'));

        info!(
            provider = PROVIDER,
            model = %req.model,
            upstream_model = %resolved.model,
            effort = resolved.effort.as_deref().unwrap_or("-"),
            stream,
            url = %url,
            "forwarding request upstream"
        );

        Ok(PreparedCall {
            url,
            headers,
            body,
            reporter,
            client_model: resolve_original_model(&req.model, &req.metadata),
        })
    }

    async fn send(&self, call: &PreparedCall) -> Result<reqwest::Response> {
        if let Some(log) = &self.exchange_log {
            log.request(PROVIDER, &call.url, &call.headers, &call.body);
        }

        let resp = self
            .client
            .post(&call.url)
            .headers(call.headers.clone())
            .body(call.body.clone())
            .send()
            .await
            .map_err(|e| {
                error!(provider = PROVIDER, url = %call.url, error = %e, "upstream request failed");
                self.log_error(&e);
                BridgeError::from(e)
            })?;

        if let Some(log) = &self.exchange_log {
            log.response_meta(PROVIDER, resp.status().as_u16(), resp.headers());
        }
        debug!(provider = PROVIDER, status = resp.status().as_u16(), "upstream responded");
        Ok(resp)
    }

    fn codex_headers(
        &self,
        credential: &Credential,
        token: &str,
        cache_id: Option<&str>,
        inbound: &HeaderMap,
    ) -> HeaderMap {
        let upstream = &self.config.upstream;
        let mut headers = HeaderMap::new();

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
            headers.insert(AUTHORIZATION, value);
        }
        ensure_header(&mut headers, inbound, HEADER_VERSION, &upstream.version);
        ensure_header(&mut headers, inbound, HEADER_OPENAI_BETA, &upstream.openai_beta);

        match cache_id {
            Some(id) => {
                set_header(&mut headers, HEADER_CONVERSATION_ID, id);
                set_header(&mut headers, HEADER_SESSION_ID, id);
            }
            None => {
                let session = uuid::Uuid::new_v4().to_string();
                ensure_header(&mut headers, inbound, HEADER_SESSION_ID, &session);
            }
        }

        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        headers.insert(CONNECTION, HeaderValue::from_static("Keep-Alive"));

        if !credential.is_api_key() {
            set_header(&mut headers, HEADER_ORIGINATOR, &upstream.originator);
            if let Some(account_id) = credential.account_id().filter(|a| !a.is_empty()) {
                set_header(&mut headers, HEADER_ACCOUNT_ID, account_id);
            }
        }

        for (name, value) in credential.custom_headers() {
            if PROTECTED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                debug!(header = %name, "ignoring custom header that overrides a protected header");
                continue;
            }
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(header = %name, "skipping invalid custom header"),
            }
        }

        headers
    }

    fn log_error(&self, err: &reqwest::Error) {
        if let Some(log) = &self.exchange_log {
            log.error(PROVIDER, err);
        }
    }
}

/// Reads the upstream body, translates it line by line and feeds the
/// bounded channel. A slow consumer stalls the upstream read.
struct StreamPump {
    reporter: UsageReporter,
    client_format: Format,
    client_model: String,
    original_request: Vec<u8>,
    lines: LineBuffer,
    state: TranslationState,
    exchange_log: Option<SharedExchangeLog>,
}

impl StreamPump {
    async fn run(mut self, resp: reqwest::Response, tx: mpsc::Sender<StreamChunk>) {
        let body = resp.bytes_stream();
        tokio::pin!(body);

        loop {
            let next = tokio::select! {
                _ = tx.closed() => {
                    debug!(provider = PROVIDER, "stream receiver closed, aborting upstream read");
                    return;
                }
                chunk = body.next() => chunk,
            };

            match next {
                Some(Ok(chunk)) => {
                    let lines = match self.lines.push(&chunk) {
                        Ok(lines) => lines,
                        Err(e) => {
                            self.fail(&tx, e).await;
                            return;
                        }
                    };
                    for line in lines {
                        if !self.forward(&tx, &line).await {
                            return;
                        }
                    }
                }
                Some(Err(e)) => {
                    self.fail(&tx, BridgeError::stream(format!("upstream read failed: {e}")))
                        .await;
                    return;
                }
                None => {
                    if let Some(tail) = self.lines.finish() {
                        self.forward(&tx, &tail).await;
                    }
                    debug!(
                        provider = PROVIDER,
                        events = self.state.sequence(),
                        "upstream stream finished"
                    );
                    return;
                }
            }
        }
    }

    /// Translate one line and send its records. False once the receiver is
    /// gone.
    async fn forward(&mut self, tx: &mpsc::Sender<StreamChunk>, line: &[u8]) -> bool {
        if let Some(log) = &self.exchange_log {
            log.response_chunk(PROVIDER, line);
        }
        if let Some(payload) = translate::terminal_payload(line) {
            publish_usage(&self.reporter, payload);
        }

        let records = translate::translate_stream(
            Format::Codex,
            self.client_format,
            &self.client_model,
            &self.original_request,
            line,
            &mut self.state,
        );
        for record in records {
            if tx.send(Ok(record)).await.is_err() {
                return false;
            }
        }
        true
    }

    async fn fail(&self, tx: &mpsc::Sender<StreamChunk>, err: BridgeError) {
        warn!(provider = PROVIDER, error = %err, "upstream stream failed");
        if let Some(log) = &self.exchange_log {
            log.error(PROVIDER, &err);
        }
        self.reporter.publish_failure();
        if tx.send(Err(err)).await.is_err() {
            debug!(provider = PROVIDER, "stream receiver dropped before the terminal error");
        }
    }
}

/// Wrap a chunk receiver as a `futures::Stream`.
pub fn into_stream(rx: mpsc::Receiver<StreamChunk>) -> ReceiverStream<StreamChunk> {
    ReceiverStream::new(rx)
}

fn original_request<'a>(req: &'a BridgeRequest, opts: &'a Options) -> &'a [u8] {
    if opts.original_request.is_empty() {
        &req.payload
    } else {
        &opts.original_request
    }
}

fn publish_usage(reporter: &UsageReporter, terminal_payload: &[u8]) {
    let detail = serde_json::from_slice::<serde_json::Value>(terminal_payload)
        .ok()
        .and_then(|v| parse_codex_usage(&v))
        .unwrap_or_default();
    reporter.publish(detail);
}

fn is_error_event(payload: &[u8]) -> bool {
    serde_json::from_slice::<serde_json::Value>(payload)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string))
        .is_some_and(|t| t == "error" || t == "response.failed")
}

/// Use the inbound value for `name` when the client sent one, else `default`.
fn ensure_header(headers: &mut HeaderMap, inbound: &HeaderMap, name: &'static str, default: &str) {
    let inbound_value = inbound
        .get(name)
        .filter(|v| !v.as_bytes().iter().all(u8::is_ascii_whitespace))
        .cloned();
    match inbound_value {
        Some(value) => {
            headers.insert(HeaderName::from_static(name), value);
        }
        None => set_header(headers, name, default),
    }
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if value.is_empty() {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> CodexExecutor {
        CodexExecutor::new(BridgeConfig::default(), reqwest::Client::new())
    }

    #[test]
    fn test_oauth_headers() {
        let cred = Credential::new("c1")
            .with_metadata("access_token", "tok")
            .with_metadata("account_id", "acct-1")
            .with_attribute("header:X-Team", "blue")
            .with_attribute("header:Authorization", "Bearer hijack");
        let headers = executor().codex_headers(&cred, "tok", Some("conv-1"), &HeaderMap::new());

        assert_eq!(headers[AUTHORIZATION], "Bearer tok");
        assert_eq!(headers[ACCEPT], "text/event-stream");
        assert_eq!(headers[CONNECTION], "Keep-Alive");
        assert_eq!(headers[HEADER_VERSION], "0.21.0");
        assert_eq!(headers[HEADER_OPENAI_BETA], "responses=experimental");
        assert_eq!(headers[HEADER_CONVERSATION_ID], "conv-1");
        assert_eq!(headers[HEADER_SESSION_ID], "conv-1");
        assert_eq!(headers[HEADER_ORIGINATOR], "codex_cli_rs");
        assert_eq!(headers[HEADER_ACCOUNT_ID], "acct-1");
        assert_eq!(headers["x-team"], "blue");
    }

    #[test]
    fn test_api_key_headers() {
        let cred = Credential::new("c2")
            .with_attribute("api_key", "sk-test")
            .with_metadata("account_id", "acct-1");
        let mut inbound = HeaderMap::new();
        inbound.insert("version", HeaderValue::from_static("9.9.9"));
        inbound.insert("session_id", HeaderValue::from_static("client-session"));
        let headers = executor().codex_headers(&cred, "sk-test", None, &inbound);

        assert_eq!(headers[HEADER_VERSION], "9.9.9");
        assert_eq!(headers[HEADER_SESSION_ID], "client-session");
        assert!(headers.get(HEADER_CONVERSATION_ID).is_none());
        assert!(headers.get(HEADER_ORIGINATOR).is_none());
        assert!(headers.get(HEADER_ACCOUNT_ID).is_none());
    }

    #[test]
    fn test_minted_session_without_cache_id() {
        let headers = executor().codex_headers(&Credential::new("c3"), "t", None, &HeaderMap::new());
        let session = headers[HEADER_SESSION_ID].to_str().unwrap();
        assert!(uuid::Uuid::parse_str(session).is_ok());
    }

    #[tokio::test]
    async fn test_count_tokens_uses_original_request() {
        let exec = executor();
        let req = BridgeRequest::new("gpt-5", b"ignored payload ignored payload".to_vec());
        let opts = Options::new(Format::Claude).with_original_request(b"hello world".to_vec());
        let resp = exec.count_tokens(&Credential::default(), &req, &opts).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&resp.payload).unwrap();
        assert!(value["input_tokens"].as_i64().unwrap() >= 1);
    }

    #[test]
    fn test_count_tokens_falls_back_when_estimator_returns_zero() {
        struct Zero;
        impl TokenEstimator for Zero {
            fn estimate(&self, _model: &str, _content: &[u8]) -> i64 {
                0
            }
        }
        let exec = executor().with_estimator(Arc::new(Zero));
        let req = BridgeRequest::new("gpt-5", b"abcdefghijkl".to_vec());
        let opts = Options::new(Format::Claude);
        let resp = tokio_test::block_on(exec.count_tokens(&Credential::default(), &req, &opts));
        let resp = tokio_test::assert_ok!(resp);
        assert_eq!(resp.payload, br#"{"input_tokens":3}"#.to_vec());
    }

    #[tokio::test]
    async fn test_refresh_without_token_is_noop() {
        let cred = Credential::new("c4").with_metadata("access_token", "old");
        let out = executor().refresh(cred).await.unwrap();
        assert_eq!(out.metadata_str("access_token"), Some("old"));
    }

    #[tokio::test]
    async fn test_invalid_payload_reports_failure() {
        let sink = Arc::new(crate::usage::MemoryUsageSink::new());
        let exec = executor().with_usage_sink(sink.clone());
        let req = BridgeRequest::new("claude-sonnet-4-5", b"not json".to_vec());
        let err = exec
            .execute(&Credential::new("c5"), &req, &Options::new(Format::Claude))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Translation { .. }));
        assert_eq!(sink.len(), 1);
        assert!(sink.records()[0].failed);
    }
}
