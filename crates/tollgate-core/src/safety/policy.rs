//! Constitutional policy: a denylist of forbidden intents.

use regex::Regex;

use super::{compile, AdmissionCheck};
use crate::domain::{GatewayError, Role};

/// Which roles a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleScope {
    AllRoles,
    /// Only roles where `Role::is_constrained` holds.
    Constrained,
}

impl RuleScope {
    fn applies_to(self, role: Role) -> bool {
        match self {
            RuleScope::AllRoles => true,
            RuleScope::Constrained => role.is_constrained(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PolicyRule {
    pub name: &'static str,
    pub pattern: Regex,
    pub scope: RuleScope,
}

/// (name, scope, pattern)
const STANDARD_RULES: &[(&str, RuleScope, &str)] = &[
    (
        "self_replication",
        RuleScope::AllRoles,
        r"(?i)\bself[-\s]?replicat\w*|\b(copy|clone|replicate)\s+(yourself|itself|your\s+own\s+(code|weights))|\bspawn\s+(more|additional|new)\s+(copies|instances)\s+of\s+(yourself|itself)",
    ),
    (
        "directive_tampering",
        RuleScope::AllRoles,
        r"(?i)\b(disable|bypass|override|circumvent|modify|rewrite|remove|delete|turn\s+off)\b.{0,40}\b(safety|guardrails?|constitution(al)?|kill[-\s]?switch|circuit[-\s]?breaker|budget\s+(limits?|ledger)|admission\s+checks?)\b",
    ),
    (
        "audit_tampering",
        RuleScope::AllRoles,
        r"(?i)\b(truncate|erase|wipe|rewrite|delete|forge|edit)\b.{0,30}\baudit\s*(log|records?|trail)",
    ),
    (
        "destructive_filesystem",
        RuleScope::Constrained,
        r"(?i)\brm\s+-[a-z]*[rf]|\brmdir\b|\bmkfs(\.\w+)?\b|\bdd\s+if=|\bshred\b|\btruncate\s+-s\b|\bformat\s+[a-z]:|>\s*/dev/(sd[a-z]|nvme|disk)|\bwipe\s+(the\s+)?(disk|drive|filesystem)",
    ),
    (
        "host_network_identity",
        RuleScope::Constrained,
        r"(?i)\bifconfig\b|\bip\s+(addr|address|link|route)\b|\bhostname\b|/etc/hosts\b|/etc/resolv\.conf\b|\biptables\b|\bnetsh\b|\bmac\s+address\b|\b(public|external)\s+ip\b|\barp\s+-a\b",
    ),
    (
        "privilege_escalation",
        RuleScope::Constrained,
        r"(?i)\bsudo\b|\bsu\s+-|\bchmod\s+(-R\s+)?[0-7]?7[0-7]7\b|\bchown\s+root\b|\bsetuid\b",
    ),
];

/// Denylist check. Guests get every rule, operators only the `AllRoles` ones.
pub struct ConstitutionalPolicy {
    rules: Vec<PolicyRule>,
}

impl ConstitutionalPolicy {
    pub fn standard() -> Result<Self, GatewayError> {
        let rules = STANDARD_RULES
            .iter()
            .map(|(name, scope, pattern)| {
                Ok(PolicyRule {
                    name: *name,
                    pattern: compile(name, pattern)?,
                    scope: *scope,
                })
            })
            .collect::<Result<Vec<_>, GatewayError>>()?;
        Ok(Self { rules })
    }

    pub fn with_rules(rules: Vec<PolicyRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    /// Names of every rule matching the description for this role.
    pub fn violations(&self, description: &str, role: Role) -> Vec<&'static str> {
        self.rules
            .iter()
            .filter(|rule| rule.scope.applies_to(role) && rule.pattern.is_match(description))
            .map(|rule| rule.name)
            .collect()
    }
}

impl AdmissionCheck for ConstitutionalPolicy {
    fn name(&self) -> &'static str {
        "constitutional_policy"
    }

    fn check(&self, description: &str, role: Role) -> Result<(), String> {
        let hits = self.violations(description, role);
        if hits.is_empty() {
            Ok(())
        } else {
            Err(format!("forbidden intent ({})", hits.join(", ")))
        }
    }
}
