//! Safety Gateway: admission control in front of every execution.
//!
//! Four independent checks run in a fixed order:
//!
//! ```text
//! description, role ──► constitutional_policy ─┐
//!                  ├──► workspace_boundary ────┤
//!                  ├──► network_boundary ──────┼──► Verdict { passed = AND, checks, blocked_reason }
//!                  └──► prompt_sanitization ───┘
//! ```
//!
//! A failing check never short-circuits the others, so the verdict always
//! carries every diagnostic for the audit record. Evaluation depends only
//! on the description, the role and the tables built at construction (plus
//! the sandbox directory on disk for symlink resolution).

mod network;
mod policy;
mod sanitize;
mod workspace;

pub use network::{Endpoint, NetworkBoundary};
pub use policy::{ConstitutionalPolicy, PolicyRule, RuleScope};
pub use sanitize::PromptSanitizer;
pub use workspace::WorkspaceBoundary;

use serde::{Deserialize, Serialize};

use crate::config::SafetyConfig;
use crate::domain::{GatewayError, Role};

/// One admission check. Implementations must be pure with respect to their
/// inputs: no counters, no caching of earlier calls.
pub trait AdmissionCheck: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Err(reason)` denies.
    fn check(&self, description: &str, role: Role) -> Result<(), String>;
}

/// Outcome of one check inside a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub passed: bool,
    pub checks: Vec<CheckResult>,
    pub blocked_reason: Option<String>,
}

impl Verdict {
    fn from_checks(checks: Vec<CheckResult>) -> Self {
        let failures: Vec<String> = checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| match &c.reason {
                Some(reason) => format!("{}: {}", c.name, reason),
                None => c.name.clone(),
            })
            .collect();
        let passed = failures.is_empty();
        Self {
            passed,
            checks,
            blocked_reason: (!passed).then(|| failures.join("; ")),
        }
    }

    pub fn check(&self, name: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }

    /// `AdmissionDenied` for a failed verdict, `None` when admitted.
    pub fn to_error(&self) -> Option<GatewayError> {
        self.blocked_reason
            .as_ref()
            .map(|reason| GatewayError::AdmissionDenied {
                reason: reason.clone(),
            })
    }
}

pub struct SafetyGateway {
    checks: Vec<Box<dyn AdmissionCheck>>,
}

impl SafetyGateway {
    /// The standard four checks, in order.
    pub fn new(config: &SafetyConfig) -> Result<Self, GatewayError> {
        let checks: Vec<Box<dyn AdmissionCheck>> = vec![
            Box::new(ConstitutionalPolicy::standard()?),
            Box::new(WorkspaceBoundary::new(&config.sandbox_root)?),
            Box::new(NetworkBoundary::new(&config.allowed_endpoints)?),
            Box::new(PromptSanitizer::new(config.max_prompt_chars)?),
        ];
        Ok(Self { checks })
    }

    /// Custom check list. Order is preserved in the verdict.
    pub fn with_checks(checks: Vec<Box<dyn AdmissionCheck>>) -> Self {
        Self { checks }
    }

    pub fn check_names(&self) -> Vec<&'static str> {
        self.checks.iter().map(|c| c.name()).collect()
    }

    pub fn evaluate(&self, description: &str, role: Role) -> Verdict {
        let results = self
            .checks
            .iter()
            .map(|check| match check.check(description, role) {
                Ok(()) => CheckResult {
                    name: check.name().to_string(),
                    passed: true,
                    reason: None,
                },
                Err(reason) => CheckResult {
                    name: check.name().to_string(),
                    passed: false,
                    reason: Some(reason),
                },
            })
            .collect();
        let verdict = Verdict::from_checks(results);
        if !verdict.passed {
            tracing::info!(
                role = role.as_str(),
                blocked = verdict.blocked_reason.as_deref().unwrap_or_default(),
                "admission denied"
            );
        }
        verdict
    }
}

/// Pattern compilation failures are configuration errors.
pub(crate) fn compile(name: &str, pattern: &str) -> Result<regex::Regex, GatewayError> {
    regex::Regex::new(pattern)
        .map_err(|e| GatewayError::Config(format!("safety pattern '{name}' does not compile: {e}")))
}
