use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use fanout_core::ModelType;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

pub const API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-ada-002";
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseFormat {
    #[default]
    Text,
    JsonObject,
}

pub trait LlmHandler: Send + Sync {
    fn chat_completion(
        &self,
        messages: &[ChatMessage],
        model: ModelType,
        format: ResponseFormat,
    ) -> Result<String>;

    fn text_embedding(&self, input: &str) -> Result<Vec<f32>>;
}

/// Canned responses for tests and offline runs. Calls fail when nothing was configured.
#[derive(Debug, Clone, Default)]
pub struct MockLlmHandler {
    pub chat_completion: Option<String>,
    pub text_embedding: Option<Vec<f32>>,
}

impl MockLlmHandler {
    pub fn with_chat(response: impl Into<String>) -> Self {
        Self {
            chat_completion: Some(response.into()),
            text_embedding: None,
        }
    }
}

impl LlmHandler for MockLlmHandler {
    fn chat_completion(
        &self,
        _messages: &[ChatMessage],
        _model: ModelType,
        _format: ResponseFormat,
    ) -> Result<String> {
        self.chat_completion
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("mock chat completion not set"))
    }

    fn text_embedding(&self, _input: &str) -> Result<Vec<f32>> {
        self.text_embedding
            .clone()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow!("mock text embedding not set"))
    }
}

pub fn model_version(model: ModelType) -> &'static str {
    match model {
        ModelType::Gpt35Turbo => "gpt-3.5-turbo-0125",
        ModelType::Gpt4Turbo => "gpt-4-turbo-preview",
    }
}

pub fn read_key_file(path: &Path) -> Result<String> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read key file {}", path.display()))?;
    for line in text.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        if key.trim() == API_KEY_ENV && !value.trim().is_empty() {
            return Ok(value.trim().to_string());
        }
    }
    bail!("no {} in {}", API_KEY_ENV, path.display())
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    finish_reason: Option<String>,
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f64>,
}

fn single_completion(response: ChatResponse) -> Result<String> {
    if response.choices.len() != 1 {
        bail!(
            "expected one choice in response, got {}",
            response.choices.len()
        );
    }
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("missing choice"))?;
    let finish = choice.finish_reason.unwrap_or_default();
    match choice.message.content {
        Some(content) if finish == "stop" && !content.is_empty() => Ok(content),
        _ => bail!("choice did not complete correctly (finish_reason={})", finish),
    }
}

fn single_embedding(response: EmbeddingResponse) -> Result<Vec<f32>> {
    match response.data.as_slice() {
        [] => bail!("no embedding in response"),
        [item] => Ok(item.embedding.iter().map(|v| *v as f32).collect()),
        _ => bail!("more than one embedding in response"),
    }
}

pub struct OpenAiHandler {
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAiHandler {
    /// Key comes from `key_file` when given, otherwise from the environment.
    pub fn new(key_file: Option<&Path>) -> Result<Self> {
        let api_key = match key_file {
            Some(path) => read_key_file(path)?,
            None => std::env::var(API_KEY_ENV)
                .ok()
                .filter(|k| !k.is_empty())
                .ok_or_else(|| anyhow!("{} not found", API_KEY_ENV))?,
        };
        Self::with_key(api_key, DEFAULT_BASE_URL)
    }

    pub fn with_key(api_key: impl Into<String>, base_url: &str) -> Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn post(&self, path: &str, body: &Value) -> Result<reqwest::blocking::Response> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .with_context(|| format!("request to {} failed", url))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| {
                    v.pointer("/error/message")
                        .and_then(|m| m.as_str())
                        .map(str::to_string)
                })
                .unwrap_or(text);
            bail!("openai {} failed ({}): {}", path, status, message);
        }
        Ok(response)
    }
}

impl LlmHandler for OpenAiHandler {
    fn chat_completion(
        &self,
        messages: &[ChatMessage],
        model: ModelType,
        format: ResponseFormat,
    ) -> Result<String> {
        let mut body = json!({
            "model": model_version(model),
            "messages": messages,
            "n": 1,
        });
        if format == ResponseFormat::JsonObject {
            body["response_format"] = json!({"type": "json_object"});
        }
        debug!(model = model_version(model), messages = messages.len(), "chat completion");
        let response: ChatResponse = self.post("chat/completions", &body)?.json()?;
        single_completion(response)
    }

    fn text_embedding(&self, input: &str) -> Result<Vec<f32>> {
        let body = json!({
            "model": DEFAULT_EMBEDDING_MODEL,
            "encoding_format": "float",
            "input": input,
        });
        let response: EmbeddingResponse = self.post("embeddings", &body)?.json()?;
        single_embedding(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::temp_root;

    fn chat(value: Value) -> ChatResponse {
        serde_json::from_value(value).expect("chat response")
    }

    #[test]
    fn single_stopped_choice_is_accepted() {
        let response = chat(json!({
            "choices": [{"finish_reason": "stop", "message": {"content": "{\"solution\":\"x\"}"}}]
        }));
        assert_eq!(single_completion(response).expect("content"), "{\"solution\":\"x\"}");
    }

    #[test]
    fn truncated_or_multiple_choices_are_rejected() {
        let truncated = chat(json!({
            "choices": [{"finish_reason": "length", "message": {"content": "partial"}}]
        }));
        assert!(single_completion(truncated).is_err());
        let empty = chat(json!({
            "choices": [{"finish_reason": "stop", "message": {"content": ""}}]
        }));
        assert!(single_completion(empty).is_err());
        let two = chat(json!({
            "choices": [
                {"finish_reason": "stop", "message": {"content": "a"}},
                {"finish_reason": "stop", "message": {"content": "b"}}
            ]
        }));
        let err = single_completion(two).expect_err("two choices");
        assert!(err.to_string().contains("expected one choice"));
    }

    #[test]
    fn embedding_requires_exactly_one_item() {
        let one: EmbeddingResponse =
            serde_json::from_value(json!({"data": [{"embedding": [0.5, -1.0]}]})).expect("one");
        assert_eq!(single_embedding(one).expect("embedding"), vec![0.5, -1.0]);
        let none: EmbeddingResponse = serde_json::from_value(json!({"data": []})).expect("none");
        assert!(single_embedding(none).is_err());
    }

    #[test]
    fn key_file_lookup() {
        let root = temp_root("llm_key");
        let path = root.join(".env.secret");
        fs::write(&path, "OTHER=1\nOPENAI_API_KEY=sk-test\n").expect("write key");
        assert_eq!(read_key_file(&path).expect("key"), "sk-test");
        fs::write(&path, "OTHER=1\n").expect("rewrite key");
        assert!(read_key_file(&path).is_err());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn model_versions_are_pinned() {
        assert_eq!(model_version(ModelType::Gpt35Turbo), "gpt-3.5-turbo-0125");
        assert_eq!(model_version(ModelType::Gpt4Turbo), "gpt-4-turbo-preview");
    }

    #[test]
    fn mock_handler_errors_when_unset() {
        let mock = MockLlmHandler::default();
        assert!(mock
            .chat_completion(&[], ModelType::DEFAULT, ResponseFormat::Text)
            .is_err());
        assert!(mock.text_embedding("x").is_err());
        let mock = MockLlmHandler::with_chat("hi");
        assert_eq!(
            mock.chat_completion(&[ChatMessage::user("x")], ModelType::DEFAULT, ResponseFormat::Text)
                .expect("chat"),
            "hi"
        );
    }
}
