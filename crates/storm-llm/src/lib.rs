pub mod anthropic;
pub mod config;
mod http;
pub mod mock;
pub mod openai;
pub mod reliable;

use std::sync::Arc;

use storm_core::errors::ProviderError;
use storm_core::provider::ChatProvider;

pub use anthropic::AnthropicProvider;
pub use config::{ModelConfig, ProviderKind};
pub use mock::{MockProvider, MockResponse};
pub use openai::OpenAiProvider;
pub use reliable::{ReliableConfig, ReliableProvider};

/// Construct the HTTP-backed provider for `config`, wrapped in the default
/// retry policy.
///
/// `Scripted` has no chat backend and is rejected here; callers pick the
/// offline pipeline for it instead.
pub fn build_provider(config: ModelConfig) -> Result<Arc<dyn ChatProvider>, ProviderError> {
    build_provider_with(config, ReliableConfig::default())
}

pub fn build_provider_with(
    config: ModelConfig,
    reliability: ReliableConfig,
) -> Result<Arc<dyn ChatProvider>, ProviderError> {
    match config.provider {
        ProviderKind::OpenAi | ProviderKind::AzureOpenAi => Ok(Arc::new(ReliableProvider::new(
            OpenAiProvider::new(config)?,
            reliability,
        ))),
        ProviderKind::Anthropic => Ok(Arc::new(ReliableProvider::new(
            AnthropicProvider::new(config)?,
            reliability,
        ))),
        ProviderKind::Scripted => Err(ProviderError::Configuration(
            "scripted provider has no chat backend".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::*;

    #[test]
    fn builds_provider_per_kind() {
        let mut cfg = ModelConfig::from_lookup(ProviderKind::Anthropic, |_| None);
        cfg.api_key = Some(SecretString::from("k"));
        let provider = build_provider(cfg).unwrap();
        assert_eq!(provider.name(), "anthropic");

        let cfg = ModelConfig::from_lookup(ProviderKind::OpenAi, |k| {
            (k == "OPENAI_API_KEY").then(|| "sk".to_owned())
        });
        assert_eq!(build_provider(cfg).unwrap().name(), "openai");
    }

    #[tokio::test]
    async fn built_providers_retry_transient_failures() {
        use storm_core::provider::ChatRequest;
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"choices": [{"message": {"content": "second time lucky"}}]})),
            )
            .mount(&server)
            .await;

        let cfg = ModelConfig::from_lookup(ProviderKind::OpenAi, |k| match k {
            "OPENAI_API_KEY" => Some("sk".to_owned()),
            "OPENAI_BASE_URL" => Some(server.uri()),
            _ => None,
        });
        let reliability = ReliableConfig {
            base_delay: std::time::Duration::from_millis(1),
            max_delay: std::time::Duration::from_millis(5),
            ..ReliableConfig::default()
        };
        let provider = build_provider_with(cfg, reliability).unwrap();
        let text = provider.complete(&ChatRequest::prompt("s", "u")).await.unwrap();
        assert_eq!(text, "second time lucky");
    }

    #[test]
    fn scripted_has_no_backend() {
        let cfg = ModelConfig::from_lookup(ProviderKind::Scripted, |_| None);
        assert!(build_provider(cfg).is_err());
    }
}
