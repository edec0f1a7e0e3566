//! Path and identity policy
//!
//! Every path the pipeline touches comes through [`PathPolicy`]. A
//! [`TargetPath`] has no public constructor, so holding one means the
//! access check has passed.

use crate::config::SecurityConfig;
use crate::error::{PipelineError, Result};
use crate::util::{resolve_under_root, slash_path};
use regex::Regex;
use std::fmt;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

impl Access {
    fn label(&self) -> &'static str {
        match self {
            Access::Read => "read",
            Access::Write => "write",
        }
    }
}

/// A root-relative path that passed a policy check.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetPath {
    relative: String,
    absolute: PathBuf,
}

impl TargetPath {
    /// Slash-separated path relative to the root
    pub fn as_str(&self) -> &str {
        &self.relative
    }

    pub fn absolute(&self) -> &Path {
        &self.absolute
    }
}

impl fmt::Display for TargetPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.relative)
    }
}

#[derive(Debug, Clone)]
pub struct PathPolicy {
    root: PathBuf,
    read_prefixes: Vec<PathBuf>,
    write_prefixes: Vec<PathBuf>,
    forbidden: Vec<Regex>,
}

impl PathPolicy {
    pub fn new(root: &Path, security: &SecurityConfig) -> Result<Self> {
        let root = root.canonicalize().map_err(|e| {
            PipelineError::io(format!("Failed to resolve root {}", root.display()), e)
        })?;

        Ok(Self {
            root,
            read_prefixes: normalize_prefixes(&security.allowed_read_paths),
            write_prefixes: normalize_prefixes(&security.allowed_write_paths),
            forbidden: compile_patterns(&security.forbidden_patterns),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn check_read(&self, path: &str) -> Result<TargetPath> {
        self.check(path, Access::Read)
    }

    pub fn check_write(&self, path: &str) -> Result<TargetPath> {
        self.check(path, Access::Write)
    }

    /// Resolve `path` under the root and apply the allow list for `access`
    /// and the deny patterns. Performs no writes.
    pub fn check(&self, path: &str, access: Access) -> Result<TargetPath> {
        let violation = |reason: String| PipelineError::PolicyViolation {
            path: path.to_string(),
            reason,
        };

        let resolved = resolve_under_root(&self.root, Path::new(path.trim())).map_err(violation)?;

        let prefixes = match access {
            Access::Read => &self.read_prefixes,
            Access::Write => &self.write_prefixes,
        };
        if !prefixes.iter().any(|p| resolved.relative.starts_with(p)) {
            let allowed: Vec<String> = prefixes.iter().map(|p| slash_path(p)).collect();
            return Err(violation(format!(
                "{} access is limited to: {}",
                access.label(),
                if allowed.is_empty() {
                    "(nothing)".to_string()
                } else {
                    allowed.join(", ")
                }
            )));
        }

        let lowered = resolved.absolute.to_string_lossy().to_lowercase();
        if let Some(pattern) = self.forbidden.iter().find(|re| re.is_match(&lowered)) {
            tracing::warn!(path, pattern = pattern.as_str(), "path matched a forbidden pattern");
            return Err(violation("matches a forbidden pattern".to_string()));
        }

        Ok(TargetPath {
            relative: slash_path(&resolved.relative),
            absolute: resolved.absolute,
        })
    }
}

fn normalize_prefixes(prefixes: &[String]) -> Vec<PathBuf> {
    prefixes
        .iter()
        .map(|p| {
            Path::new(p.trim())
                .components()
                .filter(|c| matches!(c, Component::Normal(_)))
                .collect::<PathBuf>()
        })
        .collect()
}

/// Patterns are anchored at the start and case-insensitive. Invalid ones are
/// skipped with a warning rather than disabling the whole list.
fn compile_patterns(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|pattern| match Regex::new(&format!("(?i)^(?:{})", pattern)) {
            Ok(re) => Some(re),
            Err(err) => {
                tracing::warn!(
                    pattern = pattern.as_str(),
                    "ignoring invalid forbidden pattern: {}",
                    err
                );
                None
            }
        })
        .collect()
}

/// Who may drive privileged commands.
#[derive(Debug, Clone, Default)]
pub struct AdminPolicy {
    admins: Vec<String>,
}

impl AdminPolicy {
    pub fn new(admins: &[String]) -> Self {
        Self {
            admins: admins
                .iter()
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty())
                .collect(),
        }
    }

    /// An empty admin list admits everyone.
    pub fn is_admin(&self, identity: &str) -> bool {
        self.admins.is_empty() || self.admins.iter().any(|a| a == identity.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::fs;
    use tempfile::tempdir;

    fn policy(root: &Path) -> PathPolicy {
        PathPolicy::new(root, &SecurityConfig::default()).unwrap()
    }

    #[test]
    fn test_allowed_prefix_accepts_new_file() {
        let dir = tempdir().unwrap();
        let target = policy(dir.path()).check_write("src/pkg/new.py").unwrap();
        assert_eq!(target.as_str(), "src/pkg/new.py");
        assert!(target.absolute().ends_with("src/pkg/new.py"));
    }

    #[test]
    fn test_outside_allow_list_is_refused() {
        let dir = tempdir().unwrap();
        let err = policy(dir.path()).check_write("docs/readme.md").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Policy);
        assert!(err.to_string().contains("src, plugins"));
    }

    #[test]
    fn test_prefix_is_component_wise() {
        let dir = tempdir().unwrap();
        assert!(policy(dir.path()).check_write("src2/a.py").is_err());
    }

    #[test]
    fn test_traversal_and_absolute_are_refused() {
        let dir = tempdir().unwrap();
        let policy = policy(dir.path());
        assert!(policy.check_write("../outside.py").is_err());
        assert!(policy.check_write("src/../../outside.py").is_err());
        assert!(policy.check_write("/etc/passwd").is_err());
        assert!(!dir.path().join("src").exists());
    }

    #[test]
    fn test_forbidden_patterns_are_case_insensitive() {
        let dir = tempdir().unwrap();
        let policy = policy(dir.path());
        assert!(policy.check_write("src/Secrets.py").is_err());
        assert!(policy.check_write("src/.ENV").is_err());
        assert!(policy.check_write("src/tokenizer.py").is_err());
        assert!(policy.check_write("src/handler.py").is_ok());
    }

    #[test]
    fn test_read_and_write_lists_are_separate() {
        let dir = tempdir().unwrap();
        let security = SecurityConfig {
            allowed_read_paths: vec!["docs".to_string()],
            allowed_write_paths: vec!["src".to_string()],
            ..SecurityConfig::default()
        };
        let policy = PathPolicy::new(dir.path(), &security).unwrap();
        assert!(policy.check_read("docs/guide.md").is_ok());
        assert!(policy.check_write("docs/guide.md").is_err());
        assert!(policy.check_read("src/a.py").is_err());
    }

    #[test]
    fn test_invalid_pattern_is_skipped() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        let security = SecurityConfig {
            forbidden_patterns: vec!["(".to_string(), ".*blocked.*".to_string()],
            ..SecurityConfig::default()
        };
        let policy = PathPolicy::new(dir.path(), &security).unwrap();
        assert!(policy.check_write("src/blocked.py").is_err());
        assert!(policy.check_write("src/open.py").is_ok());
    }

    #[test]
    fn test_admin_policy() {
        assert!(AdminPolicy::new(&[]).is_admin("anyone"));
        let admins = AdminPolicy::new(&["alice".to_string()]);
        assert!(admins.is_admin("alice"));
        assert!(!admins.is_admin("bob"));
    }
}
