use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::instrument;

use storm_core::errors::ProviderError;
use storm_core::provider::{ChatProvider, ChatRequest};

use crate::config::{ModelConfig, ProviderKind};
use crate::http;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

enum Endpoint {
    OpenAi { url: String },
    Azure { url: String },
}

/// Chat Completions client for OpenAI and Azure OpenAI deployments.
pub struct OpenAiProvider {
    client: Client,
    endpoint: Endpoint,
    api_key: SecretString,
    config: ModelConfig,
}

impl OpenAiProvider {
    pub fn new(config: ModelConfig) -> Result<Self, ProviderError> {
        config.validate()?;
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| ProviderError::Configuration("api key is required".into()))?;

        let endpoint = match config.provider {
            ProviderKind::OpenAi => {
                let base = config.base_url.as_deref().unwrap_or(OPENAI_BASE_URL);
                Endpoint::OpenAi {
                    url: format!("{}/chat/completions", base.trim_end_matches('/')),
                }
            }
            ProviderKind::AzureOpenAi => {
                let base = config
                    .azure_endpoint
                    .as_deref()
                    .ok_or_else(|| ProviderError::Configuration("azure endpoint is required".into()))?;
                let deployment = config.azure_deployment.as_deref().unwrap_or(&config.model);
                Endpoint::Azure {
                    url: format!(
                        "{}/openai/deployments/{}/chat/completions?api-version={}",
                        base.trim_end_matches('/'),
                        deployment,
                        config.api_version
                    ),
                }
            }
            other => {
                return Err(ProviderError::Configuration(format!(
                    "provider {other} is not served by the OpenAI client"
                )))
            }
        };

        Ok(Self {
            client: http::build_client(config.request_timeout),
            endpoint,
            api_key,
            config,
        })
    }

    fn build_body(&self, request: &ChatRequest) -> Value {
        let mut body = json!({
            "model": self.config.model,
            "messages": request.messages,
            "temperature": request.temperature.unwrap_or(self.config.temperature),
        });
        if let Some(max_tokens) = request.max_tokens.or(self.config.max_tokens) {
            body["max_tokens"] = json!(max_tokens);
        }
        body
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    fn name(&self) -> &str {
        self.config.provider.as_str()
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    #[instrument(skip_all, fields(provider = %self.config.provider, model = %self.config.model))]
    async fn complete(&self, request: &ChatRequest) -> Result<String, ProviderError> {
        let body = self.build_body(request);
        let req = match &self.endpoint {
            Endpoint::OpenAi { url } => self
                .client
                .post(url)
                .bearer_auth(self.api_key.expose_secret()),
            Endpoint::Azure { url } => self
                .client
                .post(url)
                .header("api-key", self.api_key.expose_secret()),
        };

        let value = http::send_json(req.json(&body), self.config.request_timeout).await?;
        let text = value["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| ProviderError::MalformedResponse("missing choices[0].message.content".into()))?;
        tracing::debug!(chars = text.len(), "completion received");
        Ok(text.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use storm_core::provider::ChatMessage;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn openai_config(base_url: &str) -> ModelConfig {
        let mut cfg = ModelConfig::from_lookup(ProviderKind::OpenAi, |_| None);
        cfg.api_key = Some(SecretString::from("sk-test"));
        cfg.base_url = Some(base_url.to_owned());
        cfg
    }

    fn completion(text: &str) -> Value {
        json!({"choices": [{"index": 0, "message": {"role": "assistant", "content": text}}]})
    }

    #[tokio::test]
    async fn openai_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({
                "model": "gpt-4o-mini",
                "messages": [{"role": "system", "content": "sys"}, {"role": "user", "content": "hi"}],
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("hello there")))
            .expect(1)
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new(openai_config(&server.uri())).unwrap();
        let text = provider.complete(&ChatRequest::prompt("sys", "hi")).await.unwrap();
        assert_eq!(text, "hello there");
        assert_eq!(provider.name(), "openai");
    }

    #[tokio::test]
    async fn azure_completion_uses_deployment_route() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/openai/deployments/research/chat/completions"))
            .and(query_param("api-version", "2024-12-01-preview"))
            .and(header("api-key", "az-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("azure says hi")))
            .mount(&server)
            .await;

        let cfg = ModelConfig::from_lookup(ProviderKind::AzureOpenAi, |_| None).with_overrides(
            Some("az-key".into()),
            Some(format!("{}/", server.uri())),
            Some("research".into()),
        );
        let provider = OpenAiProvider::new(cfg).unwrap();
        let text = provider
            .complete(&ChatRequest::new(vec![ChatMessage::user("hi")]))
            .await
            .unwrap();
        assert_eq!(text, "azure says hi");
    }

    #[tokio::test]
    async fn http_status_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "3"))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new(openai_config(&server.uri())).unwrap();
        let err = provider.complete(&ChatRequest::prompt("s", "u")).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.error_kind(), "rate_limited");
        assert_eq!(err.suggested_delay(), Some(std::time::Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn missing_content_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new(openai_config(&server.uri())).unwrap();
        let err = provider.complete(&ChatRequest::prompt("s", "u")).await.unwrap_err();
        assert!(matches!(err, ProviderError::MalformedResponse(_)));
    }

    #[test]
    fn missing_key_is_rejected() {
        let cfg = ModelConfig::from_lookup(ProviderKind::OpenAi, |_| None);
        assert!(matches!(OpenAiProvider::new(cfg), Err(ProviderError::Configuration(_))));
    }
}
