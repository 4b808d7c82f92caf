//! Rewrite-generation client
//!
//! The generation call is an opaque collaborator: text in, text out. The
//! production implementation talks to an OpenAI-compatible chat-completion
//! endpoint.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::RewriteConfig;

const SYSTEM_PROMPT: &str = "You are a professional rewriting assistant. Rewrite the user's text so it reads \
naturally, as if written by a person.\n\
\n\
Requirements:\n\
1. Keep the meaning and every key piece of information unchanged.\n\
2. Remove obvious traces of machine generation such as stiff formality, overly regular structure or \
suspiciously perfect wording.\n\
3. Prefer natural, lightly conversational phrasing without overdoing it.\n\
4. Keep the tone and register of the original.\n\
5. Keep technical terms, numbers, names and places exactly as given.\n\
6. Keep the paragraph structure and the order of ideas.\n\
7. Stay within 20% of the original length.\n\
8. The result must be fluent and free of grammatical errors.\n\
\n\
Output only the rewritten text, with no explanation.";

const TEMPERATURE: f32 = 0.5;
const MAX_TOKENS: u32 = 2000;

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("Rewrite request timed out")]
    Timeout,
    #[error("Rewrite request failed: {0}")]
    Transport(String),
    #[error("Rewrite API returned {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("Rewrite API returned no text")]
    EmptyResponse,
}

impl From<reqwest::Error> for RewriteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RewriteError::Timeout
        } else {
            RewriteError::Transport(e.to_string())
        }
    }
}

#[async_trait]
pub trait Rewriter: Send + Sync {
    async fn rewrite(&self, text: &str) -> Result<String, RewriteError>;
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// Chat-completion backed rewriter
pub struct ChatCompletionRewriter {
    client: reqwest::Client,
    config: RewriteConfig,
}

impl ChatCompletionRewriter {
    pub fn new(config: RewriteConfig) -> Result<Self, RewriteError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Rewriter for ChatCompletionRewriter {
    async fn rewrite(&self, text: &str) -> Result<String, RewriteError> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: text,
                },
            ],
            temperature: TEMPERATURE,
            max_tokens: MAX_TOKENS,
        };

        let response = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RewriteError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or(RewriteError::EmptyResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn rewriter(url: String) -> ChatCompletionRewriter {
        ChatCompletionRewriter::new(RewriteConfig {
            api_url: url,
            api_key: "test-key".to_string(),
            model: "deepseek-chat".to_string(),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_rewrite_returns_first_choice() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer test-key")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "model": "deepseek-chat",
                "max_tokens": 2000,
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices":[{"message":{"role":"assistant","content":" Hi! \n"}}]}"#)
            .create_async()
            .await;

        let result = rewriter(format!("{}/v1/chat/completions", server.url()))
            .rewrite("Hello there.")
            .await
            .unwrap();

        assert_eq!(result, "Hi!");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rewrite_surfaces_upstream_errors() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(503)
            .with_body("overloaded")
            .create_async()
            .await;

        let err = rewriter(format!("{}/v1/chat/completions", server.url()))
            .rewrite("text")
            .await
            .unwrap_err();

        assert!(matches!(err, RewriteError::Upstream { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_rewrite_rejects_empty_choices() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices":[]}"#)
            .create_async()
            .await;

        let err = rewriter(format!("{}/v1/chat/completions", server.url()))
            .rewrite("text")
            .await
            .unwrap_err();

        assert!(matches!(err, RewriteError::EmptyResponse));
    }
}
