//! Workspace boundary: filesystem targets must stay inside the sandbox.

use std::path::{Component, Path, PathBuf};

use regex::Regex;

use super::{compile, AdmissionCheck};
use crate::domain::{GatewayError, Role};

pub struct WorkspaceBoundary {
    /// Absolute, lexically normalised.
    root: PathBuf,
    /// `root` with symlinks resolved. `None` while the directory does not
    /// exist; nothing inside it can be a symlink then.
    canonical_root: Option<PathBuf>,
    token: Regex,
    drive: Regex,
}

impl WorkspaceBoundary {
    pub fn new(root: &Path) -> Result<Self, GatewayError> {
        let absolute = if root.is_absolute() {
            root.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(|e| GatewayError::Config(format!("cannot resolve sandbox root: {e}")))?
                .join(root)
        };
        let root = normalize(&absolute);
        let canonical_root = std::fs::canonicalize(&root).ok();
        Ok(Self {
            root,
            canonical_root,
            token: compile("path_token", r#"[^\s"'`<>|;,()\[\]{}]+"#)?,
            drive: compile("drive_letter", r"^[A-Za-z]:/")?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Tokens of the description that look like filesystem paths.
    pub fn candidates<'a>(&self, description: &'a str) -> Vec<&'a str> {
        self.token
            .find_iter(description)
            .filter_map(|m| {
                let raw = m.as_str();
                let raw = strip_prefix_ignore_case(raw, "file://").unwrap_or(raw);
                if raw.contains("://") {
                    return None;
                }
                let token = if raw == ".." || raw.ends_with("/..") {
                    raw
                } else {
                    raw.trim_end_matches(['.', ':', '!', '?'])
                };
                let looks_like_path = token.contains('/')
                    || token.contains('\\')
                    || token.starts_with('~')
                    || token == "..";
                looks_like_path.then_some(token)
            })
            .collect()
    }

    fn resolve(&self, candidate: &str) -> Result<(), String> {
        let path = candidate.replace('\\', "/");
        if path.starts_with('~') {
            return Err(format!(
                "path '{candidate}' points into a home directory outside the sandbox"
            ));
        }
        if self.drive.is_match(&path) {
            return Err(format!("path '{candidate}' names a drive outside the sandbox"));
        }

        let joined = if Path::new(&path).is_absolute() {
            PathBuf::from(&path)
        } else {
            self.root.join(&path)
        };
        let normalized = normalize(&joined);
        if !normalized.starts_with(&self.root) {
            return Err(format!("path '{candidate}' escapes the sandbox root"));
        }

        let Some(canonical_root) = &self.canonical_root else {
            return Ok(());
        };
        let mut existing = normalized.as_path();
        while std::fs::symlink_metadata(existing).is_err() {
            match existing.parent() {
                Some(parent) => existing = parent,
                None => return Ok(()),
            }
        }
        match std::fs::canonicalize(existing) {
            Ok(real) if real.starts_with(canonical_root) => Ok(()),
            Ok(_) => Err(format!(
                "path '{candidate}' resolves through a symlink outside the sandbox root"
            )),
            Err(e) => Err(format!("path '{candidate}' cannot be resolved: {e}")),
        }
    }
}

impl AdmissionCheck for WorkspaceBoundary {
    fn name(&self) -> &'static str {
        "workspace_boundary"
    }

    fn check(&self, description: &str, _role: Role) -> Result<(), String> {
        let problems: Vec<String> = self
            .candidates(description)
            .into_iter()
            .filter_map(|c| self.resolve(c).err())
            .collect();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems.join("; "))
        }
    }
}

/// Lexical normalisation: drops `.`, applies `..` without touching the
/// filesystem. `..` at the root stays at the root.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}
