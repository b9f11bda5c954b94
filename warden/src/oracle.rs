//! External reasoning oracle
//!
//! The oracle is an opaque service: given a prompt and context it returns a
//! natural-language message plus a list of proposed actions. This module
//! owns the client seam only. The HTTP implementation targets an
//! OpenAI-compatible chat endpoint and retries transient provider errors
//! with exponential backoff; the stub implementation returns scripted
//! replies for tests and offline use.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::Mutex;

use crate::config::OracleConfig;
use crate::error::OracleError;
use crate::types::ActionKind;

/// Structured oracle output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleReply {
    pub message: String,
    #[serde(default)]
    pub proposed_actions: Vec<ActionKind>,
}

#[async_trait]
pub trait Oracle: Send + Sync {
    async fn submit(&self, prompt: &str, context: &str) -> Result<OracleReply, OracleError>;
}

// Chat-completions wire shapes; only the fields this client reads.

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

const SYSTEM_PROMPT: &str = "You are a coding assistant. Reply with a JSON object \
    {\"message\": string, \"proposed_actions\": [...]} where each action is one of \
    create_file/edit_file/run_command/install_tool/check_port/kill_port with its \
    fields, tagged by \"type\".";

/// reqwest-backed oracle client.
pub struct HttpOracle {
    client: reqwest::Client,
    config: OracleConfig,
}

impl HttpOracle {
    pub fn new(config: OracleConfig) -> Result<Self, OracleError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| OracleError::Request(e.to_string()))?;
        Ok(Self { client, config })
    }

    async fn submit_once(&self, prompt: &str, context: &str) -> Result<OracleReply, OracleError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: format!("{}\n\nContext:\n{}", prompt, context),
                },
            ],
            temperature: 0.0,
        };

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            // Connection/timeout failures may succeed on retry.
            OracleError::Request(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), message));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| OracleError::Malformed(e.to_string()))?;
        let content = parsed
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| OracleError::Malformed("empty choices".to_string()))?;
        parse_reply(content)
    }
}

#[async_trait]
impl Oracle for HttpOracle {
    /// Exponential backoff (`base_delay_ms * 2^attempt`) on retryable
    /// errors, capped at `max_attempts`.
    async fn submit(&self, prompt: &str, context: &str) -> Result<OracleReply, OracleError> {
        let mut last_error: Option<OracleError> = None;
        for attempt in 1..=self.config.max_attempts {
            match self.submit_once(prompt, context).await {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_retryable() && attempt < self.config.max_attempts => {
                    let delay = self.config.base_delay_ms * (1u64 << (attempt - 1));
                    log::warn!(
                        "[Oracle] attempt {}/{} failed ({}), retrying in {}ms",
                        attempt,
                        self.config.max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                    last_error = Some(e);
                }
                Err(e) if e.is_retryable() => {
                    return Err(OracleError::RetriesExhausted {
                        attempts: self.config.max_attempts,
                        last_error: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Err(OracleError::RetriesExhausted {
            attempts: self.config.max_attempts,
            last_error: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }
}

/// Rate limits and server-side overload are transient; other client errors
/// are terminal.
fn classify_status(status: u16, message: String) -> OracleError {
    if status == 429 || (500..600).contains(&status) {
        OracleError::Transient { status, message }
    } else {
        OracleError::Terminal { status, message }
    }
}

/// Pull the structured reply out of the model's message. Accepts raw JSON
/// or a fenced ```json block; anything else is malformed.
pub fn parse_reply(content: &str) -> Result<OracleReply, OracleError> {
    let trimmed = content.trim();
    let json = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        let end = rest.find("```").unwrap_or(rest.len());
        rest[..end].trim()
    } else if let Some(rest) = trimmed.strip_prefix("```") {
        let end = rest.find("```").unwrap_or(rest.len());
        rest[..end].trim()
    } else {
        trimmed
    };
    serde_json::from_str(json).map_err(|e| OracleError::Malformed(e.to_string()))
}

/// Deterministic oracle for tests and offline use: replies are scripted and
/// consumed in order.
#[derive(Default)]
pub struct StubOracle {
    replies: Mutex<VecDeque<OracleReply>>,
}

impl StubOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_replies(replies: Vec<OracleReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
        }
    }

    pub async fn push(&self, reply: OracleReply) {
        self.replies.lock().await.push_back(reply);
    }
}

#[async_trait]
impl Oracle for StubOracle {
    async fn submit(&self, _prompt: &str, _context: &str) -> Result<OracleReply, OracleError> {
        self.replies
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| OracleError::Malformed("stub oracle has no scripted reply".to_string()))
    }
}
