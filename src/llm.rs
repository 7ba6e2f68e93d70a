//! Model-call collaborator
//!
//! The core consumes an opaque, ordered, finite token stream. `GeminiClient`
//! produces one over the Gemini SSE endpoint; `ScriptedModel` produces one
//! offline for tests and keyless runs.
//! Uses a long-lived reqwest::Client for connection pooling.

use crate::error::RelayError;
use crate::memory::record::{Turn, TurnRole};
use crate::Result;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

/// Finite, non-restartable token sequence from one model call
pub type TokenStream = BoxStream<'static, Result<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptRole {
    System,
    User,
    Assistant,
}

/// One turn of model-call input
#[derive(Debug, Clone)]
pub struct PromptTurn {
    pub role: PromptRole,
    pub content: String,
}

impl PromptTurn {
    pub fn new(role: PromptRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(PromptRole::System, content)
    }

    pub fn from_turn(turn: &Turn) -> Self {
        let role = match turn.role {
            TurnRole::Human => PromptRole::User,
            TurnRole::Assistant => PromptRole::Assistant,
        };
        Self::new(role, turn.content.clone())
    }
}

/// Opaque producer of model output
#[async_trait::async_trait]
pub trait ModelClient: Send + Sync {
    /// Stream a reply token by token. Errors mid-stream surface as Err items;
    /// errors before any output surface as an Err return.
    async fn stream(&self, turns: &[PromptTurn]) -> Result<TokenStream>;

    /// Single-shot completion, used for summary folding
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Reusable Gemini client (connection-pooled)
pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(api_key: String) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url:
                "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash"
                    .to_string(),
        })
    }

    fn build_request(&self, turns: &[PromptTurn]) -> GeminiRequest {
        let mut system_parts = Vec::new();
        let mut contents = Vec::new();

        for turn in turns {
            match turn.role {
                PromptRole::System => system_parts.push(Part {
                    text: turn.content.clone(),
                }),
                PromptRole::User => contents.push(Content {
                    role: Some("user".to_string()),
                    parts: vec![Part {
                        text: turn.content.clone(),
                    }],
                }),
                PromptRole::Assistant => contents.push(Content {
                    role: Some("model".to_string()),
                    parts: vec![Part {
                        text: turn.content.clone(),
                    }],
                }),
            }
        }

        if system_parts.is_empty() {
            system_parts.push(Part {
                text: "You are a helpful, concise chat assistant.".to_string(),
            });
        }

        GeminiRequest {
            contents,
            generation_config: GenerationConfig {
                temperature: 0.7,
                top_p: 0.9,
                top_k: 40,
                max_output_tokens: 2048,
            },
            system_instruction: SystemInstruction {
                parts: system_parts,
            },
        }
    }

    fn ensure_key(&self) -> Result<()> {
        if self.api_key.is_empty() {
            return Err(RelayError::ModelStreamFailure(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ModelClient for GeminiClient {
    async fn stream(&self, turns: &[PromptTurn]) -> Result<TokenStream> {
        self.ensure_key()?;

        let url = format!(
            "{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, self.api_key
        );
        let request = self.build_request(turns);

        info!("Calling Gemini API (streaming)");

        let response = self.client.post(&url).json(&request).send().await.map_err(|e| {
            error!("Gemini stream request failed: {}", e);
            RelayError::ModelStreamFailure(format!("Gemini API error: {}", e))
        })?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Gemini API error response: {}", error_text);
            return Err(RelayError::ModelStreamFailure(format!(
                "Gemini API error: {}",
                error_text
            )));
        }

        let mut bytes = response.bytes_stream();

        let stream = async_stream::try_stream! {
            let mut buffer = SseLineBuffer::new();

            while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(|e| {
                    RelayError::ModelStreamFailure(format!("Gemini stream error: {}", e))
                })?;

                for line in buffer.push_chunk(&chunk) {
                    if let Some(text) = parse_sse_line(&line)? {
                        yield text;
                    }
                }
            }

            let tail = buffer.into_tail();
            if let Some(text) = parse_sse_line(&tail)? {
                yield text;
            }
        };

        Ok(Box::pin(stream))
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        self.ensure_key()?;

        let url = format!("{}:generateContent?key={}", self.base_url, self.api_key);
        let request = self.build_request(&[PromptTurn::new(PromptRole::User, prompt)]);

        info!("Calling Gemini API");

        let response = self.client.post(&url).json(&request).send().await.map_err(|e| {
            error!("Gemini API request failed: {}", e);
            RelayError::ModelStreamFailure(format!("Gemini API error: {}", e))
        })?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Gemini API error response: {}", error_text);
            return Err(RelayError::ModelStreamFailure(format!(
                "Gemini API error: {}",
                error_text
            )));
        }

        let gemini_response: GeminiResponse = response.json().await.map_err(|e| {
            error!("Failed to parse Gemini response: {}", e);
            RelayError::ModelStreamFailure(format!("Gemini parse error: {}", e))
        })?;

        extract_text(&gemini_response).ok_or_else(|| {
            RelayError::ModelStreamFailure("Empty response from Gemini".to_string())
        })
    }
}

/// Reassembles SSE lines from raw transfer chunks.
///
/// Chunk boundaries fall anywhere, including inside a multi-byte character,
/// so bytes are buffered as-is and decoded only once a full line is present.
struct SseLineBuffer {
    bytes: Vec<u8>,
}

impl SseLineBuffer {
    fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    /// Append one chunk, returning every line completed by it
    fn push_chunk(&mut self, chunk: &[u8]) -> Vec<String> {
        self.bytes.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.bytes.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.bytes.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).trim().to_string());
        }
        lines
    }

    /// Whatever remains after the last newline, once the stream ends
    fn into_tail(self) -> String {
        String::from_utf8_lossy(&self.bytes).trim().to_string()
    }
}

/// Parse one SSE line into a token, if it carries one
fn parse_sse_line(line: &str) -> Result<Option<String>> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let data = data.trim();

    if data.is_empty() || data == "[DONE]" {
        return Ok(None);
    }

    let response: GeminiResponse = serde_json::from_str(data)?;
    Ok(extract_text(&response).filter(|t| !t.is_empty()))
}

fn extract_text(response: &GeminiResponse) -> Option<String> {
    let parts = &response.candidates.first()?.content.parts;
    if parts.is_empty() {
        return None;
    }
    Some(
        parts
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join(""),
    )
}

/// Deterministic offline model: streams a fixed reply word by word
pub struct ScriptedModel {
    reply: String,
}

impl ScriptedModel {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
        }
    }
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self::new(
            "I can't reach a language model right now, but your message was \
             recorded and will be part of this conversation's context.",
        )
    }
}

#[async_trait::async_trait]
impl ModelClient for ScriptedModel {
    async fn stream(&self, _turns: &[PromptTurn]) -> Result<TokenStream> {
        let tokens: Vec<Result<String>> = self
            .reply
            .split_inclusive(' ')
            .map(|t| Ok(t.to_string()))
            .collect();

        Ok(futures::stream::iter(tokens).boxed())
    }

    async fn complete(&self, _prompt: &str) -> Result<String> {
        Ok(self.reply.clone())
    }
}

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
    system_instruction: SystemInstruction,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}
