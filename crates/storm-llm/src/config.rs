use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use storm_core::errors::ProviderError;

pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_AZURE_MODEL: &str = "gpt-4.1-nano";
pub const DEFAULT_AZURE_API_VERSION: &str = "2024-12-01-preview";
pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-3-5-sonnet-20241022";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Which backend drives the research pipeline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[default]
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "azure_openai")]
    AzureOpenAi,
    Anthropic,
    /// Offline deterministic pipeline, no model calls.
    Scripted,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::AzureOpenAi => "azure_openai",
            Self::Anthropic => "anthropic",
            Self::Scripted => "scripted",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "azure_openai" | "azure" => Ok(Self::AzureOpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "scripted" => Ok(Self::Scripted),
            other => Err(ProviderError::Configuration(format!("unknown model provider '{other}'"))),
        }
    }
}

/// Connection settings for one chat backend.
#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub provider: ProviderKind,
    pub model: String,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub azure_endpoint: Option<String>,
    pub azure_deployment: Option<String>,
    pub api_version: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub request_timeout: Duration,
}

impl ModelConfig {
    fn bare(provider: ProviderKind, model: &str) -> Self {
        Self {
            provider,
            model: model.to_owned(),
            api_key: None,
            base_url: None,
            azure_endpoint: None,
            azure_deployment: None,
            api_version: DEFAULT_AZURE_API_VERSION.to_owned(),
            temperature: 0.0,
            max_tokens: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Build from process environment variables.
    pub fn from_env(provider: ProviderKind) -> Self {
        Self::from_lookup(provider, |key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup(provider: ProviderKind, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        match provider {
            ProviderKind::OpenAi => Self {
                model: get("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_owned()),
                api_key: get("OPENAI_API_KEY").map(SecretString::from),
                base_url: get("OPENAI_BASE_URL"),
                ..Self::bare(provider, DEFAULT_OPENAI_MODEL)
            },
            ProviderKind::AzureOpenAi => {
                let model = get("AZURE_OPENAI_MODEL").unwrap_or_else(|| DEFAULT_AZURE_MODEL.to_owned());
                Self {
                    api_key: get("AZURE_OPENAI_API_KEY").map(SecretString::from),
                    azure_endpoint: get("AZURE_OPENAI_ENDPOINT"),
                    azure_deployment: get("AZURE_OPENAI_DEPLOYMENT").or_else(|| Some(model.clone())),
                    api_version: get("AZURE_OPENAI_API_VERSION")
                        .unwrap_or_else(|| DEFAULT_AZURE_API_VERSION.to_owned()),
                    model,
                    ..Self::bare(provider, DEFAULT_AZURE_MODEL)
                }
            }
            ProviderKind::Anthropic => Self {
                model: get("ANTHROPIC_MODEL").unwrap_or_else(|| DEFAULT_ANTHROPIC_MODEL.to_owned()),
                api_key: get("ANTHROPIC_API_KEY").map(SecretString::from),
                base_url: get("ANTHROPIC_BASE_URL"),
                ..Self::bare(provider, DEFAULT_ANTHROPIC_MODEL)
            },
            ProviderKind::Scripted => Self::bare(provider, "scripted"),
        }
    }

    /// Apply per-request credentials on top of the environment defaults.
    #[must_use]
    pub fn with_overrides(
        mut self,
        api_key: Option<String>,
        azure_endpoint: Option<String>,
        azure_deployment: Option<String>,
    ) -> Self {
        if let Some(key) = api_key.filter(|k| !k.trim().is_empty()) {
            self.api_key = Some(SecretString::from(key));
        }
        if let Some(endpoint) = azure_endpoint.filter(|e| !e.trim().is_empty()) {
            self.azure_endpoint = Some(endpoint);
        }
        if let Some(deployment) = azure_deployment.filter(|d| !d.trim().is_empty()) {
            self.azure_deployment = Some(deployment);
        }
        self
    }

    /// Check that everything the provider needs is present.
    pub fn validate(&self) -> Result<(), ProviderError> {
        let missing = |what: &str| {
            Err(ProviderError::Configuration(format!(
                "{what} is required for provider {}",
                self.provider
            )))
        };
        match self.provider {
            ProviderKind::Scripted => Ok(()),
            ProviderKind::OpenAi | ProviderKind::Anthropic if self.api_key.is_none() => missing("api key"),
            ProviderKind::AzureOpenAi if self.api_key.is_none() => missing("api key"),
            ProviderKind::AzureOpenAi if self.azure_endpoint.is_none() => missing("azure endpoint"),
            _ => Ok(()),
        }
    }
}
