//! [`LlmDriver`] – OpenAI-compatible LLM interface.
//!
//! Talks to any server exposing `/v1/chat/completions`: a hosted API with a
//! bearer key, or a local model server such as [Ollama](https://ollama.com)
//! (`http://localhost:11434`) without one.
//!
//! # Example
//!
//! ```rust,no_run
//! use warden_runtime::llm_driver::{ChatMessage, LlmDriver, Role};
//!
//! let driver = LlmDriver::new("http://localhost:11434", "llama3")
//!     .with_rate_limit(30);
//!
//! let messages = vec![
//!     ChatMessage { role: Role::System, content: "You are a careful agent.".into() },
//!     ChatMessage { role: Role::User, content: "What should I do next?".into() },
//! ];
//!
//! // Requires a running model server.
//! // let reply = driver.complete(&messages, None).await?;
//! ```

use std::num::NonZeroU32;

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use warden_types::{TaskState, WardenError};

use crate::capabilities::LlmCapability;

// ─────────────────────────────────────────────────────────────────────────────
// Stability guidelines and role prompts
// ─────────────────────────────────────────────────────────────────────────────

/// Anti-loop rules appended to every system message sent to the model.
pub const STABILITY_GUIDELINES: &str = "\
## Stability Guidelines (anti-loop rules)
- Do not repeat the same tool call with the same arguments.
- If an action fails, try a different approach rather than retrying immediately.
- Vary your strategy when the previous steps have not produced progress.
- When stuck, use help_request to ask the operator before continuing.";

pub const REFLECTION_PROMPT: &str = "\
You review the progress of an autonomous agent. Read the task state and give an \
honest assessment in at most five sentences: what has been achieved, what is \
blocking progress, and whether the agent is going in circles. Answer in plain text.";

pub const PLANNING_PROMPT: &str = "\
You are the planning engine of an autonomous agent. Decompose the goal into an \
ordered list of 3 to 10 subtasks, each finishable in 1 to 5 steps, with concrete \
success criteria. Only suggest tools from the Available Tools list.

Answer with a JSON object in a fenced block tagged plan:
```plan
{\"subtasks\": [{\"id\": 1, \"title\": \"...\", \"description\": \"...\", \
\"success_criteria\": \"...\", \"suggested_tools\": [\"...\"], \"estimated_steps\": 3}], \
\"risks\": [\"...\"], \"overall_strategy\": \"...\"}
```";

pub const COMPRESSION_PROMPT: &str = "\
You compress the execution history of an autonomous agent into working memory. \
Keep conclusions, drop intermediate detail. Always keep failed approaches.

Answer with a JSON object in a fenced block tagged memory:
```memory
{\"summary\": \"two or three sentences\", \"key_findings\": [\"...\"], \
\"failed_approaches\": [\"approach: reason\"], \"open_questions\": [\"...\"]}
```";

pub const CHECKPOINT_PROMPT: &str = "\
A subtask has just finished. Assess overall progress in at most 100 words and decide \
whether the remaining plan still holds. Revise only when it clearly does not.

Answer with a JSON object in a fenced block tagged checkpoint:
```checkpoint
{\"progress_assessment\": \"...\", \"plan_still_valid\": true, \"revised_subtasks\": null}
```
When plan_still_valid is false, revised_subtasks lists the subtasks that replace \
everything not yet finished.";

/// Token cap for the short structured answers (compression, checkpoint).
const SHORT_ANSWER_TOKENS: u32 = 1024;
const SHORT_ANSWER_TEMPERATURE: f32 = 0.3;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from LLM driver operations.
#[derive(Error, Debug)]
pub enum LlmError {
    /// The HTTP request to the model server failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// The response from the model server could not be parsed.
    #[error("Unexpected response format: {0}")]
    BadResponse(String),
}

impl From<LlmError> for WardenError {
    fn from(e: LlmError) -> Self {
        WardenError::Llm(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Message types (OpenAI-compatible)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
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

/// Sampling overrides for one request.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sampling {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

/// Append [`STABILITY_GUIDELINES`] to every system message, or prepend a
/// system message holding only the guidelines when there is none.
pub fn with_guidelines(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut augmented: Vec<ChatMessage> = messages
        .iter()
        .map(|m| {
            if m.role == Role::System {
                ChatMessage::system(format!("{}\n\n{}", m.content, STABILITY_GUIDELINES))
            } else {
                m.clone()
            }
        })
        .collect();
    if !augmented.iter().any(|m| m.role == Role::System) {
        augmented.insert(0, ChatMessage::system(STABILITY_GUIDELINES));
    }
    augmented
}

// ─────────────────────────────────────────────────────────────────────────────
// LlmDriver
// ─────────────────────────────────────────────────────────────────────────────

/// Async client for an OpenAI-compatible chat-completions endpoint.
///
/// Construct once per run; the inner `reqwest::Client` pools connections.
pub struct LlmDriver {
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
    limiter: Option<DefaultDirectRateLimiter>,
}

impl std::fmt::Debug for LlmDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmDriver")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("rate_limited", &self.limiter.is_some())
            .finish()
    }
}

impl LlmDriver {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key: None,
            client: reqwest::Client::new(),
            limiter: None,
        }
    }

    /// Send `Authorization: Bearer <key>` with every request. Empty keys are ignored.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.api_key = (!key.is_empty()).then_some(key);
        self
    }

    /// Allow at most `per_minute` requests per minute; 0 disables the limit.
    pub fn with_rate_limit(mut self, per_minute: u32) -> Self {
        self.limiter = NonZeroU32::new(per_minute).map(|n| RateLimiter::direct(Quota::per_minute(n)));
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'))
    }

    /// Send `messages` to the model and return the assistant's reply text.
    ///
    /// # Errors
    ///
    /// [`LlmError::Http`] if the request fails or returns an error status,
    /// [`LlmError::BadResponse`] if the response has no choices.
    pub async fn complete(
        &self,
        messages: &[ChatMessage],
        sampling: Option<Sampling>,
    ) -> Result<String, LlmError> {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        let augmented = with_guidelines(messages);
        let sampling = sampling.unwrap_or_default();
        let body = ChatRequest {
            model: &self.model,
            messages: &augmented,
            stream: false,
            max_tokens: sampling.max_tokens,
            temperature: sampling.temperature,
        };

        let mut request = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        debug!(model = %self.model, messages = augmented.len(), "sending chat completion");

        let response: ChatResponse = request
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::BadResponse("empty choices array".into()))
    }

    async fn ask(&self, system: &str, prompt: &str, sampling: Option<Sampling>) -> Result<String, WardenError> {
        let messages = [ChatMessage::system(system), ChatMessage::user(prompt)];
        self.complete(&messages, sampling).await.map_err(|e| {
            warn!(error = %e, model = %self.model, "LLM request failed");
            WardenError::from(e)
        })
    }
}

fn short_answer() -> Option<Sampling> {
    Some(Sampling {
        max_tokens: Some(SHORT_ANSWER_TOKENS),
        temperature: Some(SHORT_ANSWER_TEMPERATURE),
    })
}

#[async_trait]
impl LlmCapability for LlmDriver {
    async fn call(&self, prompt: &str, system_prompt: &str) -> Result<String, WardenError> {
        self.ask(system_prompt, prompt, None).await
    }

    async fn reflect(&self, state: &TaskState) -> Result<String, WardenError> {
        let context = serde_json::to_string_pretty(state)?;
        let prompt = format!("Task state:\n{context}\n\nHow is the agent doing?");
        self.ask(REFLECTION_PROMPT, &prompt, None).await
    }

    async fn plan(&self, prompt: &str) -> Result<String, WardenError> {
        self.ask(PLANNING_PROMPT, prompt, None).await
    }

    async fn compress(&self, prompt: &str) -> Result<String, WardenError> {
        self.ask(COMPRESSION_PROMPT, prompt, short_answer()).await
    }

    async fn checkpoint(&self, prompt: &str) -> Result<String, WardenError> {
        self.ask(CHECKPOINT_PROMPT, prompt, short_answer()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response and hand back the raw request text.
    async fn one_shot_server(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw);
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower.strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    if raw.len() >= end + 4 + length {
                        break;
                    }
                }
            }
            let reply = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&raw).into_owned()
        });
        (format!("http://{addr}"), handle)
    }

    #[test]
    fn chat_message_serializes_role() {
        let json = serde_json::to_string(&ChatMessage::system("hello")).unwrap();
        assert!(json.contains("\"system\""));
    }

    #[test]
    fn guidelines_are_appended_to_system_message() {
        let augmented = with_guidelines(&[ChatMessage::system("You are careful.")]);
        assert_eq!(augmented.len(), 1);
        assert!(augmented[0].content.starts_with("You are careful."));
        assert!(augmented[0].content.contains("Stability Guidelines"));
    }

    #[test]
    fn guidelines_prepended_when_no_system_message() {
        let augmented = with_guidelines(&[ChatMessage::user("What now?")]);
        assert_eq!(augmented.len(), 2);
        assert_eq!(augmented[0].role, Role::System);
        assert_eq!(augmented[1].content, "What now?");
    }

    #[test]
    fn endpoint_tolerates_trailing_slash() {
        let driver = LlmDriver::new("http://localhost:11434/", "llama3");
        assert_eq!(driver.endpoint(), "http://localhost:11434/v1/chat/completions");
    }

    #[test]
    fn debug_redacts_the_key() {
        let driver = LlmDriver::new("http://x", "m").with_api_key("sk-secret");
        let shown = format!("{driver:?}");
        assert!(!shown.contains("sk-secret"));
        assert!(shown.contains("REDACTED"));
    }

    #[test]
    fn request_omits_unset_sampling() {
        let messages = [ChatMessage::user("hi")];
        let body = ChatRequest {
            model: "m",
            messages: &messages,
            stream: false,
            max_tokens: None,
            temperature: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("max_tokens").is_none());
        assert_eq!(json["stream"], false);
    }

    #[test]
    fn llm_errors_become_warden_llm_errors() {
        let err: WardenError = LlmError::BadResponse("empty".into()).into();
        assert!(matches!(err, WardenError::Llm(msg) if msg.contains("empty")));
    }

    #[tokio::test]
    async fn complete_returns_first_choice_and_sends_key() {
        let (url, server) = one_shot_server(
            "200 OK",
            r#"{"choices":[{"message":{"role":"assistant","content":"next: read the file"}}]}"#,
        )
        .await;
        let driver = LlmDriver::new(url, "test-model").with_api_key("k-123").with_rate_limit(600);
        let reply = driver.call("goal", "system").await.unwrap();
        assert_eq!(reply, "next: read the file");

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /v1/chat/completions"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer k-123"));
        assert!(request.contains("\"test-model\""));
        assert!(request.contains("Stability Guidelines"));
    }

    #[tokio::test]
    async fn empty_choices_is_a_bad_response() {
        let (url, _server) = one_shot_server("200 OK", r#"{"choices":[]}"#).await;
        let driver = LlmDriver::new(url, "m");
        let err = driver.complete(&[ChatMessage::user("x")], None).await.unwrap_err();
        assert!(matches!(err, LlmError::BadResponse(_)));
    }

    #[tokio::test]
    async fn server_errors_surface_as_llm_errors() {
        let (url, _server) = one_shot_server("503 Service Unavailable", "{}").await;
        let driver = LlmDriver::new(url, "m");
        let err = driver.plan("goal").await.unwrap_err();
        assert!(matches!(err, WardenError::Llm(_)));
    }
}
