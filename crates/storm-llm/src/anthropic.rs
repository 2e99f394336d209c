use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::instrument;

use storm_core::errors::ProviderError;
use storm_core::provider::{ChatProvider, ChatRequest, ChatRole};

use crate::config::{ModelConfig, ProviderKind};
use crate::http;

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Messages API client.
pub struct AnthropicProvider {
    client: Client,
    url: String,
    api_key: SecretString,
    config: ModelConfig,
}

impl AnthropicProvider {
    pub fn new(config: ModelConfig) -> Result<Self, ProviderError> {
        if config.provider != ProviderKind::Anthropic {
            return Err(ProviderError::Configuration(format!(
                "provider {} is not served by the Anthropic client",
                config.provider
            )));
        }
        config.validate()?;
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| ProviderError::Configuration("api key is required".into()))?;
        let base = config.base_url.as_deref().unwrap_or(ANTHROPIC_BASE_URL);

        Ok(Self {
            client: http::build_client(config.request_timeout),
            url: format!("{}/v1/messages", base.trim_end_matches('/')),
            api_key,
            config,
        })
    }

    /// System turns go to the top-level `system` field; the rest stay in order.
    fn build_body(&self, request: &ChatRequest) -> Value {
        let system: Vec<&str> = request
            .messages
            .iter()
            .filter(|m| m.role == ChatRole::System)
            .map(|m| m.content.as_str())
            .collect();
        let messages: Vec<Value> = request
            .messages
            .iter()
            .filter(|m| m.role != ChatRole::System)
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect();

        let mut body = json!({
            "model": self.config.model,
            "max_tokens": request.max_tokens.or(self.config.max_tokens).unwrap_or(DEFAULT_MAX_TOKENS),
            "temperature": request.temperature.unwrap_or(self.config.temperature),
            "messages": messages,
        });
        if !system.is_empty() {
            body["system"] = json!(system.join("\n\n"));
        }
        body
    }
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    #[instrument(skip_all, fields(provider = "anthropic", model = %self.config.model))]
    async fn complete(&self, request: &ChatRequest) -> Result<String, ProviderError> {
        let req = self
            .client
            .post(&self.url)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&self.build_body(request));

        let value = http::send_json(req, self.config.request_timeout).await?;
        let blocks = value["content"]
            .as_array()
            .ok_or_else(|| ProviderError::MalformedResponse("missing content blocks".into()))?;
        let text: String = blocks
            .iter()
            .filter(|b| b["type"] == "text")
            .filter_map(|b| b["text"].as_str())
            .collect();
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use storm_core::provider::ChatMessage;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn config(base_url: &str) -> ModelConfig {
        let mut cfg = ModelConfig::from_lookup(ProviderKind::Anthropic, |_| None);
        cfg.api_key = Some(SecretString::from("ant-key"));
        cfg.base_url = Some(base_url.to_owned());
        cfg
    }

    #[tokio::test]
    async fn system_prompt_is_lifted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "ant-key"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .and(body_partial_json(json!({
                "system": "be terse",
                "messages": [{"role": "user", "content": "q"}, {"role": "assistant", "content": "a"}],
                "max_tokens": 4096,
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{"type": "text", "text": "part one, "}, {"type": "text", "text": "part two"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new(config(&server.uri())).unwrap();
        let request = ChatRequest::new(vec![
            ChatMessage::system("be terse"),
            ChatMessage::user("q"),
            ChatMessage::assistant("a"),
        ]);
        assert_eq!(provider.complete(&request).await.unwrap(), "part one, part two");
    }

    #[tokio::test]
    async fn auth_failure_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new(config(&server.uri())).unwrap();
        let err = provider.complete(&ChatRequest::prompt("s", "u")).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("bad key"));
    }

    #[test]
    fn wrong_provider_kind_is_rejected() {
        let cfg = ModelConfig::from_lookup(ProviderKind::OpenAi, |_| Some("k".into()));
        assert!(AnthropicProvider::new(cfg).is_err());
    }
}
