//! In-process backend with deterministic output.

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::ports::{BackendFailure, BackendRequest, BackendResponse, InferenceBackend};

/// Answers every request locally. Token counts come from whitespace-split
/// words; cost from per-token rates. Used by the CLI and in tests.
#[derive(Debug, Clone)]
pub struct OfflineBackend {
    pub input_rate: Decimal,
    pub output_rate: Decimal,
    /// Simulated round-trip time.
    pub latency: Duration,
}

impl Default for OfflineBackend {
    fn default() -> Self {
        Self {
            input_rate: dec!(0.000002),
            output_rate: dec!(0.000006),
            latency: Duration::ZERO,
        }
    }
}

impl OfflineBackend {
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn render(request: &BackendRequest) -> (String, u32, u32) {
        let words: Vec<&str> = request.prompt.split_whitespace().collect();
        let input_tokens = words.len() as u32;
        let preview: Vec<&str> = words.iter().take(12).copied().collect();
        let text = format!(
            "[{}] acknowledged {} words: {}",
            request.model,
            input_tokens,
            preview.join(" ")
        );
        let output_tokens = text.split_whitespace().count() as u32;
        (text, input_tokens, output_tokens)
    }
}

#[async_trait]
impl InferenceBackend for OfflineBackend {
    async fn complete(&self, request: BackendRequest) -> Result<BackendResponse, BackendFailure> {
        if request.prompt.trim().is_empty() {
            return Err(BackendFailure::Rejected("empty prompt".into()));
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let (text, input_tokens, output_tokens) = Self::render(&request);
        let cost = self.input_rate * Decimal::from(input_tokens)
            + self.output_rate * Decimal::from(output_tokens);
        Ok(BackendResponse {
            text,
            input_tokens,
            output_tokens,
            cost,
        })
    }
}
