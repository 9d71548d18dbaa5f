//! Task submission and execution result types.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Role;
use crate::domain::errors::GatewayError;

/// What a caller hands to `TaskStore::enqueue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSubmission {
    pub description: String,
    pub role: Role,
    pub min_spend: Decimal,
    pub max_spend: Decimal,
    #[serde(default)]
    pub priority: u8,

    /// Accounting identity. Defaults to the role name when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<String>,
}

impl TaskSubmission {
    pub fn new(
        description: impl Into<String>,
        role: Role,
        min_spend: Decimal,
        max_spend: Decimal,
    ) -> Self {
        Self {
            description: description.into(),
            role,
            min_spend,
            max_spend,
            priority: 0,
            principal: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    /// The principal this task is billed to.
    pub fn principal(&self) -> String {
        self.principal
            .clone()
            .unwrap_or_else(|| self.role.as_str().to_string())
    }

    /// Reject malformed submissions before they reach the queue.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.description.trim().is_empty() {
            return Err(GatewayError::Validation(
                "description must not be empty".to_string(),
            ));
        }
        if self.min_spend.is_sign_negative() || self.max_spend.is_sign_negative() {
            return Err(GatewayError::Validation(format!(
                "spend bounds must be non-negative (min={}, max={})",
                self.min_spend, self.max_spend
            )));
        }
        if self.min_spend > self.max_spend {
            return Err(GatewayError::Validation(format!(
                "spend bounds are inverted: min_spend {} > max_spend {}",
                self.min_spend, self.max_spend
            )));
        }
        if let Some(principal) = &self.principal
            && principal.trim().is_empty()
        {
            return Err(GatewayError::Validation(
                "principal must not be blank".to_string(),
            ));
        }
        Ok(())
    }
}

/// What a successful execution left behind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub text: String,
    pub backend: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost: Decimal,
}
