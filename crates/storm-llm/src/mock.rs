use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use storm_core::errors::ProviderError;
use storm_core::provider::{ChatProvider, ChatRequest};

/// Pre-programmed responses for deterministic testing without API calls.
pub enum MockResponse {
    Text(String),
    Error(ProviderError),
    /// Wait a duration, then yield the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock provider that returns pre-programmed responses in sequence.
/// Once the script is exhausted every call gets the fallback text.
pub struct MockProvider {
    responses: Mutex<VecDeque<MockResponse>>,
    fallback: String,
    requests: Mutex<Vec<ChatRequest>>,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            fallback: "mock response".into(),
            requests: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_fallback(mut self, text: impl Into<String>) -> Self {
        self.fallback = text.into();
        self
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Every request seen so far, in call order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ChatProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn complete(&self, request: &ChatRequest) -> Result<String, ProviderError> {
        self.requests.lock().push(request.clone());
        let mut next = self.responses.lock().pop_front();
        loop {
            match next {
                None => return Ok(self.fallback.clone()),
                Some(MockResponse::Text(text)) => return Ok(text),
                Some(MockResponse::Error(err)) => return Err(err),
                Some(MockResponse::Delay(delay, inner)) => {
                    tokio::time::sleep(delay).await;
                    next = Some(*inner);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn responses_in_order_then_fallback() {
        let provider = MockProvider::new(vec![
            MockResponse::text("first"),
            MockResponse::Error(ProviderError::ProviderOverloaded),
        ])
        .with_fallback("later");

        let req = ChatRequest::prompt("s", "u");
        assert_eq!(provider.complete(&req).await.unwrap(), "first");
        assert!(provider.complete(&req).await.is_err());
        assert_eq!(provider.complete(&req).await.unwrap(), "later");
        assert_eq!(provider.call_count(), 3);
        assert_eq!(provider.requests()[0].system(), Some("s"));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_response_waits() {
        let provider = MockProvider::new(vec![MockResponse::delayed(
            Duration::from_secs(5),
            MockResponse::text("slow"),
        )]);
        let start = tokio::time::Instant::now();
        let text = provider.complete(&ChatRequest::default()).await.unwrap();
        assert_eq!(text, "slow");
        assert!(start.elapsed() >= Duration::from_secs(5));
    }
}
