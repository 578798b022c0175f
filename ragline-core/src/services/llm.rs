//! Chat-completion providers.

use super::http::{build_client, post_json, probe};
use super::{ChatModel, Upstream};
use crate::error::{RagError, Result};
use crate::types::ChatMessage;
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

fn messages_to_json(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
        .collect()
}

/// Any OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiChat {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl OpenAiChat {
    pub fn new(base_url: String, model: String, api_key: String) -> Self {
        Self {
            client: build_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            api_key,
        }
    }

    fn parse_response(service: &str, json: &Value) -> Result<String> {
        json["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RagError::invalid_response(service, "No choices in response"))
    }
}

#[async_trait]
impl Upstream for OpenAiChat {
    fn name(&self) -> &str {
        "openai-chat"
    }

    async fn health_check(&self) -> bool {
        probe(
            &self.client,
            &format!("{}/models", self.base_url),
            Some(&self.api_key),
        )
        .await
    }
}

#[async_trait]
impl ChatModel for OpenAiChat {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: usize,
    ) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": messages_to_json(messages),
            "temperature": temperature,
            "max_tokens": max_tokens,
            "stream": false,
        });
        debug!(model = %self.model, messages = messages.len(), "Sending chat completion request");
        let response = post_json(
            &self.client,
            self.name(),
            &format!("{}/chat/completions", self.base_url),
            Some(&self.api_key),
            &body,
        )
        .await?;
        Self::parse_response(self.name(), &response)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Chat model served by a local Ollama instance.
pub struct OllamaChat {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaChat {
    pub fn new(base_url: String, model: String) -> Self {
        Self {
            client: build_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        }
    }

    fn parse_response(service: &str, json: &Value) -> Result<String> {
        json["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RagError::invalid_response(service, "Missing message content"))
    }
}

#[async_trait]
impl Upstream for OllamaChat {
    fn name(&self) -> &str {
        "ollama-chat"
    }

    async fn health_check(&self) -> bool {
        probe(&self.client, &format!("{}/api/tags", self.base_url), None).await
    }
}

#[async_trait]
impl ChatModel for OllamaChat {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: usize,
    ) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": messages_to_json(messages),
            "stream": false,
            "options": {
                "temperature": temperature,
                "num_predict": max_tokens,
            },
        });
        debug!(model = %self.model, messages = messages.len(), "Sending Ollama chat request");
        let response = post_json(
            &self.client,
            self.name(),
            &format!("{}/api/chat", self.base_url),
            None,
            &body,
        )
        .await?;
        Self::parse_response(self.name(), &response)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_to_json() {
        let messages = vec![ChatMessage::system("be brief"), ChatMessage::user("hi")];
        let json = messages_to_json(&messages);
        assert_eq!(json[0]["role"], "system");
        assert_eq!(json[1]["content"], "hi");
    }

    #[test]
    fn test_openai_parse_response() {
        let body = json!({"choices": [{"message": {"role": "assistant", "content": "42"}}]});
        assert_eq!(OpenAiChat::parse_response("llm", &body).unwrap(), "42");
        assert!(OpenAiChat::parse_response("llm", &json!({"choices": []})).is_err());
    }

    #[test]
    fn test_ollama_parse_response() {
        let body = json!({"message": {"role": "assistant", "content": "pong"}, "done": true});
        assert_eq!(OllamaChat::parse_response("llm", &body).unwrap(), "pong");
        let err = OllamaChat::parse_response("llm", &json!({"error": "model not found"}))
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
