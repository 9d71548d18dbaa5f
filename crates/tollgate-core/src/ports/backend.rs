//! InferenceBackend port - the remote model call.
//!
//! Backends are untrusted: callers wrap every call in a timeout and never
//! believe a reported cost above what was reserved.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendRequest {
    pub model: String,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendResponse {
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendFailure {
    /// Transient: unavailable, overloaded, malformed answer.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Permanent: the backend refused this request.
    #[error("backend rejected request: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn complete(&self, request: BackendRequest) -> Result<BackendResponse, BackendFailure>;
}
