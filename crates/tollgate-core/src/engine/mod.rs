//! Engine Router: rule-based backend/model selection and the guarded
//! backend call.
//!
//! Selection order:
//! 1. `@engine:<backend>/<model>` anywhere in the description wins.
//! 2. Otherwise the first tier whose `max_chars` fits the description,
//!    bumped one tier for high-priority tasks, then degraded until the
//!    tier's estimate fits the task's `max_spend`.
//!
//! The estimate is clamped to `[min_spend, max_spend]`.

mod offline;
mod registry;

pub use offline::OfflineBackend;
pub use registry::{BackendRegistry, RegistryError};

use std::time::Duration;

use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::RouterConfig;
use crate::domain::{GatewayError, TaskResult};
use crate::ports::{BackendFailure, BackendRequest};
use crate::queue::TaskRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSelection {
    pub backend: String,
    pub model: String,
    /// Tier name, or `override` for an explicit token.
    pub tier: String,
    pub max_cost_estimate: Decimal,
}

pub struct EngineRouter {
    config: RouterConfig,
    registry: BackendRegistry,
    override_token: Regex,
}

impl EngineRouter {
    /// Fails when the default backend is not registered.
    pub fn new(config: RouterConfig, registry: BackendRegistry) -> Result<Self, GatewayError> {
        registry.require(&config.backend)?;
        if config.tiers.is_empty() {
            return Err(GatewayError::Config("router needs at least one tier".into()));
        }
        let override_token = Regex::new(r"@engine:([A-Za-z0-9_\-]+)/([A-Za-z0-9_.:\-]+)")
            .map_err(|e| GatewayError::Config(format!("override pattern: {e}")))?;
        Ok(Self {
            config,
            registry,
            override_token,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn select(&self, task: &TaskRecord) -> RouteSelection {
        let clamp = |estimate: Decimal| estimate.max(task.min_spend).min(task.max_spend);

        if let Some(caps) = self.override_token.captures(&task.description) {
            return RouteSelection {
                backend: caps[1].to_string(),
                model: caps[2].to_string(),
                tier: "override".to_string(),
                max_cost_estimate: clamp(task.max_spend),
            };
        }

        let tiers = &self.config.tiers;
        let len = self.prompt(task).chars().count();
        let mut idx = tiers
            .iter()
            .position(|t| t.max_chars.is_none_or(|max| len <= max))
            .unwrap_or(tiers.len() - 1);
        if task.priority >= self.config.escalate_priority {
            idx = (idx + 1).min(tiers.len() - 1);
        }
        while idx > 0 && tiers[idx].estimate > task.max_spend {
            idx -= 1;
        }

        let tier = &tiers[idx];
        RouteSelection {
            backend: self.config.backend.clone(),
            model: tier.model.clone(),
            tier: tier.name.clone(),
            max_cost_estimate: clamp(tier.estimate),
        }
    }

    /// The description with any override token removed.
    pub fn prompt(&self, task: &TaskRecord) -> String {
        let stripped = self.override_token.replace_all(&task.description, "");
        stripped.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// Calls the selected backend under `timeout`. The reported cost is
    /// capped at `cap` (the reservation) and floored at zero.
    pub async fn execute(
        &self,
        selection: &RouteSelection,
        prompt: &str,
        timeout: Duration,
        cap: Decimal,
    ) -> Result<TaskResult, GatewayError> {
        let backend = self.registry.get(&selection.backend).ok_or_else(|| {
            GatewayError::BackendRejected {
                backend: selection.backend.clone(),
                message: "backend is not registered".to_string(),
            }
        })?;

        let request = BackendRequest {
            model: selection.model.clone(),
            prompt: prompt.to_string(),
        };
        let response = match tokio::time::timeout(timeout, backend.complete(request)).await {
            Err(_) => {
                return Err(GatewayError::BackendTimeout {
                    backend: selection.backend.clone(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
            Ok(Err(BackendFailure::Unavailable(message))) => {
                return Err(GatewayError::BackendError {
                    backend: selection.backend.clone(),
                    message,
                });
            }
            Ok(Err(BackendFailure::Rejected(message))) => {
                return Err(GatewayError::BackendRejected {
                    backend: selection.backend.clone(),
                    message,
                });
            }
            Ok(Ok(response)) => response,
        };

        let cost = response.cost.max(Decimal::ZERO).min(cap);
        if cost != response.cost {
            tracing::warn!(
                backend = %selection.backend,
                reported = %response.cost,
                charged = %cost,
                "backend cost outside reservation, capped"
            );
        }

        Ok(TaskResult {
            text: response.text,
            backend: selection.backend.clone(),
            model: selection.model.clone(),
            input_tokens: response.input_tokens,
            output_tokens: response.output_tokens,
            cost,
        })
    }
}
