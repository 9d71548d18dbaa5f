//! Requester roles.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The role a task was submitted under.
///
/// Roles select the policy table the Safety Gateway evaluates against and,
/// by default, name the principal the task is billed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Trusted local operator.
    Operator,
    /// Constrained remote/guest requester. Gets the stricter denylist.
    Guest,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Operator => "operator",
            Role::Guest => "guest",
        }
    }

    pub fn is_constrained(self) -> bool {
        matches!(self, Role::Guest)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role '{0}' (expected operator, guest or remote)")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "operator" => Ok(Role::Operator),
            // "remote" is the name remote callers use for the same constrained role
            "guest" | "remote" => Ok(Role::Guest),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("operator", Role::Operator)]
    #[case("Guest", Role::Guest)]
    #[case(" remote ", Role::Guest)]
    fn parses_known_roles(#[case] input: &str, #[case] expected: Role) {
        assert_eq!(input.parse::<Role>().unwrap(), expected);
    }

    #[test]
    fn rejects_unknown_role() {
        let err = "admin".parse::<Role>().unwrap_err();
        assert!(err.to_string().contains("admin"));
    }

    #[test]
    fn serializes_snake_case() {
        assert_eq!(serde_json::to_string(&Role::Guest).unwrap(), "\"guest\"");
        assert!(Role::Guest.is_constrained());
        assert!(!Role::Operator.is_constrained());
    }
}
