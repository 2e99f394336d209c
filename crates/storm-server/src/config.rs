//! Server configuration.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use storm_core::models::{MAX_ANALYSTS, MIN_ANALYSTS};
use storm_engine::{CountTimeoutPolicy, WorkflowConfig};
use storm_llm::ProviderKind;
use tracing::warn;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (default `"0.0.0.0"`).
    pub host: String,
    /// Port to bind. `0` picks a free port.
    pub port: u16,
    /// Outbound frames buffered per session before senders wait.
    pub max_send_queue: usize,
    /// Deadline for every operator question.
    pub ask_timeout_secs: u64,
    pub min_analysts: usize,
    pub max_analysts: usize,
    pub count_timeout_policy: CountTimeoutPolicy,
    /// Interval between WebSocket pings.
    pub ping_interval_secs: u64,
    /// How long shutdown waits for the listener to drain.
    pub shutdown_timeout_secs: u64,
    /// Provider used when a request does not name one.
    pub default_provider: ProviderKind,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8002,
            max_send_queue: 256,
            ask_timeout_secs: 300,
            min_analysts: MIN_ANALYSTS,
            max_analysts: MAX_ANALYSTS,
            count_timeout_policy: CountTimeoutPolicy::UseDefault,
            ping_interval_secs: 30,
            shutdown_timeout_secs: 10,
            default_provider: ProviderKind::default(),
        }
    }
}

impl ServerConfig {
    /// Overlay `STORM_*` environment variables.
    #[must_use]
    pub fn apply_env_overrides(self) -> Self {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Overlay values from `lookup`. Invalid values are logged and ignored.
    #[must_use]
    pub fn apply_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(host) = lookup("STORM_HOST").filter(|h| !h.trim().is_empty()) {
            self.host = host;
        }
        if let Some(port) = read_parsed::<u16>(&lookup, "STORM_PORT").or_else(|| read_parsed(&lookup, "PORT")) {
            self.port = port;
        }
        if let Some(secs) = read_parsed::<u64>(&lookup, "STORM_ASK_TIMEOUT_SECS") {
            if secs == 0 {
                warn!("STORM_ASK_TIMEOUT_SECS must be positive, keeping {}", self.ask_timeout_secs);
            } else {
                self.ask_timeout_secs = secs;
            }
        }
        if let Some(max) = read_parsed::<usize>(&lookup, "STORM_MAX_ANALYSTS") {
            if (MIN_ANALYSTS..=MAX_ANALYSTS).contains(&max) {
                self.max_analysts = max;
            } else {
                warn!(
                    value = max,
                    "STORM_MAX_ANALYSTS must be between {MIN_ANALYSTS} and {MAX_ANALYSTS}, keeping {}",
                    self.max_analysts
                );
            }
        }
        if let Some(policy) = read_parsed::<CountTimeoutPolicy>(&lookup, "STORM_COUNT_TIMEOUT_POLICY") {
            self.count_timeout_policy = policy;
        }
        if let Some(provider) = read_parsed::<ProviderKind>(&lookup, "STORM_DEFAULT_PROVIDER") {
            self.default_provider = provider;
        }
        self
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn ask_timeout(&self) -> Duration {
        Duration::from_secs(self.ask_timeout_secs)
    }

    /// Keepalive period for WebSocket pings, never below one second.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    /// How long shutdown waits for in-flight runs before aborting them.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// The subset of settings each research workflow runs with.
    pub fn workflow_config(&self) -> WorkflowConfig {
        WorkflowConfig {
            ask_timeout: self.ask_timeout(),
            min_analysts: self.min_analysts,
            max_analysts: self.max_analysts,
            count_timeout_policy: self.count_timeout_policy,
        }
    }
}

fn read_parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key, value = %raw, error = %e, "ignoring invalid environment value");
            None
        }
    }
}
