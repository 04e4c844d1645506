//! Chat generation backends.
//!
//! A [`ChatProvider`] declares its [`Capabilities`] up front and then serves
//! either a streamed reply ([`FragmentStream`]) or a single-shot one. The
//! session picks how to call it from the capabilities alone; providers never
//! have to fail a request to signal a missing feature.
//!
//! | Config Value | Endpoint | Stream format | Usage source |
//! |-------------|----------|---------------|--------------|
//! | `"ollama"` | `POST /api/chat` | NDJSON | `prompt_eval_count` + `eval_count` |
//! | `"openai"` | `POST /chat/completions` | SSE | `usage.total_tokens` |

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::GenerationConfig;
use crate::models::{ChatMessage, Fragment, Usage};

/// Where a provider can take the system instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemPromptSlot {
    /// A request-level instruction field, separate from the messages.
    Instruction,
    /// A `system` message at the head of the message list.
    LeadingMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub streaming: bool,
    pub system_slots: Vec<SystemPromptSlot>,
}

impl Capabilities {
    pub fn supports(&self, slot: SystemPromptSlot) -> bool {
        self.system_slots.contains(&slot)
    }
}

/// One request to a chat model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatRequest {
    /// Only set when the provider declares [`SystemPromptSlot::Instruction`].
    pub instruction: Option<String>,
    pub messages: Vec<ChatMessage>,
}

/// Pull-based sequence of reply fragments. `Ok(None)` ends the reply.
#[async_trait]
pub trait FragmentStream: Send {
    async fn next_fragment(&mut self) -> Result<Option<Fragment>>;
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;
    fn capabilities(&self) -> Capabilities;

    /// Start a streamed reply. Only called when `capabilities().streaming`.
    async fn stream(&self, request: ChatRequest) -> Result<Box<dyn FragmentStream>>;

    /// Produce the whole reply in one response.
    async fn complete(&self, request: ChatRequest) -> Result<Fragment>;
}

/// A finished reply presented as a one-element stream.
pub struct SingleFragment(Option<Fragment>);

impl SingleFragment {
    pub fn new(fragment: Fragment) -> Self {
        Self(Some(fragment))
    }
}

#[async_trait]
impl FragmentStream for SingleFragment {
    async fn next_fragment(&mut self) -> Result<Option<Fragment>> {
        Ok(self.0.take())
    }
}

/// Create the [`ChatProvider`] named by `config.provider`.
pub fn create_chat_provider(config: &GenerationConfig) -> Result<Box<dyn ChatProvider>> {
    let api = match config.provider.as_str() {
        "ollama" => ChatApi::Ollama,
        "openai" => ChatApi::OpenAI,
        other => bail!("Unknown generation provider: {}", other),
    };
    Ok(Box::new(HttpChatProvider::new(api, config)?))
}

/// Which wire protocol an [`HttpChatProvider`] speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatApi {
    Ollama,
    OpenAI,
}

impl ChatApi {
    fn label(self) -> &'static str {
        match self {
            ChatApi::Ollama => "ollama",
            ChatApi::OpenAI => "openai",
        }
    }
}

pub struct HttpChatProvider {
    api: ChatApi,
    model: String,
    endpoint: String,
    api_key: Option<String>,
    streaming: bool,
    temperature: Option<f32>,
    client: reqwest::Client,
}

impl HttpChatProvider {
    pub fn new(api: ChatApi, config: &GenerationConfig) -> Result<Self> {
        let (endpoint, api_key) = match api {
            ChatApi::Ollama => {
                let url = config.url.as_deref().unwrap_or("http://localhost:11434");
                (format!("{}/api/chat", url.trim_end_matches('/')), None)
            }
            ChatApi::OpenAI => {
                let key = std::env::var("OPENAI_API_KEY")
                    .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
                let url = config.url.as_deref().unwrap_or("https://api.openai.com/v1");
                (
                    format!("{}/chat/completions", url.trim_end_matches('/')),
                    Some(key),
                )
            }
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            api,
            model: config.model.clone(),
            endpoint,
            api_key,
            streaming: config.stream,
            temperature: config.temperature,
            client,
        })
    }

    fn body(&self, request: &ChatRequest, stream: bool) -> Result<Value> {
        if request.instruction.is_some() {
            bail!("{} does not take a separate instruction field", self.api.label());
        }
        let mut body = json!({
            "model": self.model,
            "messages": request.messages,
            "stream": stream,
        });
        match self.api {
            ChatApi::Ollama => {
                if let Some(t) = self.temperature {
                    body["options"] = json!({ "temperature": t });
                }
            }
            ChatApi::OpenAI => {
                if let Some(t) = self.temperature {
                    body["temperature"] = json!(t);
                }
                if stream {
                    body["stream_options"] = json!({ "include_usage": true });
                }
            }
        }
        Ok(body)
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response> {
        let mut req = self.client.post(&self.endpoint).json(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let response = req
            .send()
            .await
            .with_context(|| format!("{} connection error ({})", self.api.label(), self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("{} API error {}: {}", self.api.label(), status, text);
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatProvider for HttpChatProvider {
    fn name(&self) -> &str {
        self.api.label()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            streaming: self.streaming,
            system_slots: vec![SystemPromptSlot::LeadingMessage],
        }
    }

    async fn stream(&self, request: ChatRequest) -> Result<Box<dyn FragmentStream>> {
        let body = self.body(&request, true)?;
        let response = self.send(&body).await?;
        let lines = LineReader::new(response);
        let stream: Box<dyn FragmentStream> = match self.api {
            ChatApi::Ollama => Box::new(OllamaStream { lines, done: false }),
            ChatApi::OpenAI => Box::new(OpenAIStream { lines, done: false }),
        };
        Ok(stream)
    }

    async fn complete(&self, request: ChatRequest) -> Result<Fragment> {
        let body = self.body(&request, false)?;
        let json: Value = self.send(&body).await?.json().await?;
        match self.api {
            ChatApi::Ollama => parse_ollama_complete(&json),
            ChatApi::OpenAI => parse_openai_complete(&json),
        }
    }
}

// ============ Streaming ============

/// Splits a streamed response body into lines as chunks arrive.
struct LineReader {
    response: reqwest::Response,
    buf: Vec<u8>,
    eof: bool,
}

impl LineReader {
    fn new(response: reqwest::Response) -> Self {
        Self {
            response,
            buf: Vec::new(),
            eof: false,
        }
    }

    async fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(line) = take_line(&mut self.buf, self.eof)? {
                return Ok(Some(line));
            }
            if self.eof {
                return Ok(None);
            }
            match self.response.chunk().await? {
                Some(bytes) => self.buf.extend_from_slice(&bytes),
                None => self.eof = true,
            }
        }
    }
}

/// Remove the first complete line from `buf`. At end of input the
/// remainder counts as a line.
fn take_line(buf: &mut Vec<u8>, eof: bool) -> Result<Option<String>> {
    let end = match buf.iter().position(|b| *b == b'\n') {
        Some(pos) => pos + 1,
        None if eof && !buf.is_empty() => buf.len(),
        None => return Ok(None),
    };
    let raw: Vec<u8> = buf.drain(..end).collect();
    let line = String::from_utf8(raw).context("Stream line is not valid UTF-8")?;
    Ok(Some(line.trim_end_matches(|c: char| c == '\n' || c == '\r').to_string()))
}

struct OllamaStream {
    lines: LineReader,
    done: bool,
}

#[async_trait]
impl FragmentStream for OllamaStream {
    async fn next_fragment(&mut self) -> Result<Option<Fragment>> {
        while !self.done {
            let Some(line) = self.lines.next_line().await? else {
                bail!("ollama stream ended before the final record");
            };
            if line.trim().is_empty() {
                continue;
            }
            let (fragment, done) = parse_ollama_line(&line)?;
            self.done = done;
            if !fragment.text.is_empty() || fragment.usage.is_some() {
                return Ok(Some(fragment));
            }
        }
        Ok(None)
    }
}

struct OpenAIStream {
    lines: LineReader,
    done: bool,
}

#[async_trait]
impl FragmentStream for OpenAIStream {
    async fn next_fragment(&mut self) -> Result<Option<Fragment>> {
        while !self.done {
            let Some(line) = self.lines.next_line().await? else {
                self.done = true;
                break;
            };
            match parse_sse_line(&line)? {
                SseEvent::Ignore => continue,
                SseEvent::Done => self.done = true,
                SseEvent::Fragment(fragment) => {
                    if !fragment.text.is_empty() || fragment.usage.is_some() {
                        return Ok(Some(fragment));
                    }
                }
            }
        }
        Ok(None)
    }
}

// ============ Wire parsing ============

/// Usage adapter for Ollama: input plus output token counts.
pub fn ollama_usage(json: &Value) -> Option<Usage> {
    let prompt = json.get("prompt_eval_count").and_then(Value::as_u64);
    let completion = json.get("eval_count").and_then(Value::as_u64);
    if prompt.is_none() && completion.is_none() {
        return None;
    }
    Some(Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: prompt.unwrap_or(0) + completion.unwrap_or(0),
    })
}

/// Usage adapter for OpenAI-style `usage` objects.
pub fn openai_usage(json: &Value) -> Option<Usage> {
    let usage = json.get("usage")?;
    Some(Usage {
        prompt_tokens: usage.get("prompt_tokens").and_then(Value::as_u64),
        completion_tokens: usage.get("completion_tokens").and_then(Value::as_u64),
        total_tokens: usage.get("total_tokens").and_then(Value::as_u64)?,
    })
}

fn api_error(json: &Value) -> Option<String> {
    match json.get("error")? {
        Value::String(s) => Some(s.clone()),
        other => Some(
            other
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| other.to_string()),
        ),
    }
}

/// Parse one NDJSON record. Returns the fragment and whether it was final.
fn parse_ollama_line(line: &str) -> Result<(Fragment, bool)> {
    let json: Value = serde_json::from_str(line).context("Invalid ollama stream record")?;
    if let Some(message) = api_error(&json) {
        bail!("ollama error: {}", message);
    }
    let text = json
        .pointer("/message/content")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let done = json.get("done").and_then(Value::as_bool).unwrap_or(false);

    let mut fragment = Fragment::text(text);
    if done {
        fragment.usage = ollama_usage(&json);
    }
    Ok((fragment, done))
}

fn parse_ollama_complete(json: &Value) -> Result<Fragment> {
    if let Some(message) = api_error(json) {
        bail!("ollama error: {}", message);
    }
    let text = json
        .pointer("/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("Invalid ollama response: missing message.content"))?;
    Ok(Fragment {
        text: text.to_string(),
        usage: ollama_usage(json),
    })
}

#[derive(Debug, PartialEq)]
enum SseEvent {
    Ignore,
    Done,
    Fragment(Fragment),
}

fn parse_sse_line(line: &str) -> Result<SseEvent> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseEvent::Ignore);
    };
    let data = data.trim();
    if data.is_empty() {
        return Ok(SseEvent::Ignore);
    }
    if data == "[DONE]" {
        return Ok(SseEvent::Done);
    }

    let json: Value = serde_json::from_str(data).context("Invalid openai stream event")?;
    if let Some(message) = api_error(&json) {
        bail!("openai error: {}", message);
    }
    let text = json
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Ok(SseEvent::Fragment(Fragment {
        text: text.to_string(),
        usage: openai_usage(&json),
    }))
}

fn parse_openai_complete(json: &Value) -> Result<Fragment> {
    if let Some(message) = api_error(json) {
        bail!("openai error: {}", message);
    }
    let text = json
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("Invalid openai response: missing choices[0].message.content"))?;
    Ok(Fragment {
        text: text.to_string(),
        usage: openai_usage(json),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ollama_config() -> GenerationConfig {
        GenerationConfig {
            temperature: Some(0.2),
            ..GenerationConfig::default()
        }
    }

    #[test]
    fn take_line_waits_for_newline() {
        let mut buf = b"{\"a\":1}\n{\"b\"".to_vec();
        assert_eq!(take_line(&mut buf, false).unwrap().as_deref(), Some("{\"a\":1}"));
        assert_eq!(take_line(&mut buf, false).unwrap(), None);
        buf.extend_from_slice(b":2}\r\n");
        assert_eq!(take_line(&mut buf, false).unwrap().as_deref(), Some("{\"b\":2}"));
        assert!(buf.is_empty());
    }

    #[test]
    fn take_line_flushes_remainder_at_eof() {
        let mut buf = b"tail".to_vec();
        assert_eq!(take_line(&mut buf, true).unwrap().as_deref(), Some("tail"));
        assert_eq!(take_line(&mut buf, true).unwrap(), None);
    }

    #[test]
    fn ollama_records() {
        let (f, done) =
            parse_ollama_line(r#"{"message":{"role":"assistant","content":"The "},"done":false}"#)
                .unwrap();
        assert_eq!(f, Fragment::text("The "));
        assert!(!done);

        let (f, done) = parse_ollama_line(
            r#"{"message":{"role":"assistant","content":""},"done":true,"prompt_eval_count":26,"eval_count":290}"#,
        )
        .unwrap();
        assert!(done);
        assert_eq!(
            f.usage,
            Some(Usage {
                prompt_tokens: Some(26),
                completion_tokens: Some(290),
                total_tokens: 316,
            })
        );
    }

    #[test]
    fn ollama_error_record() {
        let err = parse_ollama_line(r#"{"error":"model 'nope' not found"}"#).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn sse_events() {
        assert_eq!(parse_sse_line(": keep-alive").unwrap(), SseEvent::Ignore);
        assert_eq!(parse_sse_line("").unwrap(), SseEvent::Ignore);
        assert_eq!(parse_sse_line("data: [DONE]").unwrap(), SseEvent::Done);

        let event =
            parse_sse_line(r#"data: {"choices":[{"index":0,"delta":{"content":"sky "}}]}"#).unwrap();
        assert_eq!(event, SseEvent::Fragment(Fragment::text("sky ")));

        let event = parse_sse_line(
            r#"data: {"choices":[],"usage":{"prompt_tokens":9,"completion_tokens":4,"total_tokens":13}}"#,
        )
        .unwrap();
        match event {
            SseEvent::Fragment(f) => {
                assert_eq!(f.text, "");
                assert_eq!(f.usage.map(|u| u.total_tokens), Some(13));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn usage_adapters_absent() {
        assert_eq!(ollama_usage(&json!({"done": true})), None);
        assert_eq!(openai_usage(&json!({"choices": []})), None);
        assert_eq!(openai_usage(&json!({"usage": {"prompt_tokens": 3}})), None);
    }

    #[test]
    fn single_shot_parsing() {
        let f = parse_ollama_complete(&json!({
            "message": {"role": "assistant", "content": "Blue."},
            "done": true,
            "eval_count": 2
        }))
        .unwrap();
        assert_eq!(f.text, "Blue.");
        assert_eq!(f.usage.map(|u| u.total_tokens), Some(2));

        let f = parse_openai_complete(&json!({
            "choices": [{"message": {"role": "assistant", "content": "Blue."}}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
        }))
        .unwrap();
        assert_eq!(f.usage.map(|u| u.total_tokens), Some(7));
    }

    #[test]
    fn ollama_body() {
        let provider = HttpChatProvider::new(ChatApi::Ollama, &ollama_config()).unwrap();
        let request = ChatRequest {
            instruction: None,
            messages: vec![ChatMessage::system("Be brief."), ChatMessage::user("Hi")],
        };
        let body = provider.body(&request, true).unwrap();
        assert_eq!(body["model"], "llama3.2");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "Hi");
        assert!((body["options"]["temperature"].as_f64().unwrap() - 0.2).abs() < 1e-6);
        assert!(body.get("stream_options").is_none());
    }

    #[test]
    fn instruction_field_is_refused() {
        let provider = HttpChatProvider::new(ChatApi::Ollama, &ollama_config()).unwrap();
        let request = ChatRequest {
            instruction: Some("Be brief.".into()),
            messages: vec![ChatMessage::user("Hi")],
        };
        assert!(provider.body(&request, false).is_err());
    }

    #[test]
    fn stream_flag_sets_capabilities() {
        let config = GenerationConfig {
            stream: false,
            ..GenerationConfig::default()
        };
        let provider = create_chat_provider(&config).unwrap();
        let caps = provider.capabilities();
        assert!(!caps.streaming);
        assert!(caps.supports(SystemPromptSlot::LeadingMessage));
        assert!(!caps.supports(SystemPromptSlot::Instruction));
    }

    #[tokio::test]
    async fn single_fragment_yields_once() {
        let mut stream = SingleFragment::new(Fragment::text("all at once"));
        assert_eq!(
            stream.next_fragment().await.unwrap(),
            Some(Fragment::text("all at once"))
        );
        assert_eq!(stream.next_fragment().await.unwrap(), None);
    }
}
