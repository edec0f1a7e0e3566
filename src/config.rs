//! Configuration management for self-iterate
//!
//! Stores settings in ~/.config/self-iterate/config.toml

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub security: SecurityConfig,
    pub iteration: IterationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Identities allowed to approve, reject, roll back and reset. Empty admits everyone.
    pub admins: Vec<String>,
    /// Root-relative prefixes that may be read
    pub allowed_read_paths: Vec<String>,
    /// Root-relative prefixes that may be written
    pub allowed_write_paths: Vec<String>,
    /// Case-insensitive regexes matched from the start of the absolute path
    pub forbidden_patterns: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            admins: Vec::new(),
            allowed_read_paths: vec!["src".to_string(), "plugins".to_string()],
            allowed_write_paths: vec!["src".to_string(), "plugins".to_string()],
            forbidden_patterns: [
                r".*\.env.*",
                r".*token.*",
                r".*password.*",
                r".*secret.*",
                r".*credential.*",
                r".*api_key.*",
                r".*private.*",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IterationConfig {
    /// Staging root, relative to the project root unless absolute
    pub shadow_workspace_path: PathBuf,
    /// Backup pool, relative to the project root unless absolute
    pub backup_path: PathBuf,
    pub max_backups: usize,
    pub shadow_max_age_days: u64,
    pub enable_syntax_check: bool,
    pub enable_diff_report: bool,
    /// A pending iteration older than this is flagged as overdue
    pub approval_timeout_secs: u64,
    pub diff_context_lines: usize,
    /// Cap for diffs rendered into messages
    pub diff_max_lines: usize,
}

impl Default for IterationConfig {
    fn default() -> Self {
        Self {
            shadow_workspace_path: PathBuf::from(".self-iterate/shadow"),
            backup_path: PathBuf::from(".self-iterate/backups"),
            max_backups: 50,
            shadow_max_age_days: 7,
            enable_syntax_check: true,
            enable_diff_report: true,
            approval_timeout_secs: 300,
            diff_context_lines: crate::diff::DEFAULT_CONTEXT_LINES,
            diff_max_lines: 50,
        }
    }
}

impl IterationConfig {
    pub fn shadow_max_age(&self) -> Duration {
        Duration::from_secs(self.shadow_max_age_days.saturating_mul(24 * 60 * 60))
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_secs)
    }

    pub fn shadow_root(&self, root: &Path) -> PathBuf {
        root.join(&self.shadow_workspace_path)
    }

    pub fn backup_root(&self, root: &Path) -> PathBuf {
        root.join(&self.backup_path)
    }
}

impl Config {
    /// Get the config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("self-iterate"))
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.toml"))
    }

    /// Load from an explicit path, else the default location, else defaults
    pub fn load(explicit: Option<&Path>) -> Self {
        match explicit.map(Path::to_path_buf).or_else(Self::default_path) {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Load config from disk, or return default. A file that fails to parse
    /// is moved aside so the next save does not silently discard it.
    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = fs::read_to_string(path) else {
            return Self::default();
        };
        match toml::from_str(&content) {
            Ok(config) => config,
            Err(err) => {
                preserve_corrupt_config(path, &content);
                tracing::warn!(
                    path = %path.display(),
                    "Config file was corrupted ({}). A backup was saved and defaults were loaded.",
                    err
                );
                Self::default()
            }
        }
    }

    /// Save config to disk
    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| format!("Failed to create config directory: {}", e))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        write_config_atomic(path, &content).map_err(|e| format!("Failed to write config: {}", e))
    }

    /// Get the config file location for display
    pub fn config_location() -> String {
        Self::default_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "~/.config/self-iterate/config.toml".to_string())
    }
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("toml.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

fn write_config_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = file.set_permissions(fs::Permissions::from_mode(0o600)) {
            tracing::warn!("Failed to set temp config file permissions: {}", e);
        }
    }

    file.write_all(content.as_bytes())?;
    drop(file);

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(config.security.admins.is_empty());
        assert_eq!(config.security.allowed_write_paths, vec!["src", "plugins"]);
        assert_eq!(config.iteration.max_backups, 50);
        assert_eq!(config.iteration.approval_timeout_secs, 300);
        assert_eq!(
            config.iteration.shadow_max_age(),
            Duration::from_secs(7 * 24 * 60 * 60)
        );
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[security]\nadmins = [\"alice\"]\n\n[iteration]\nmax_backups = 5\n",
        )
        .unwrap();

        let config = Config::load_from(&path);
        assert_eq!(config.security.admins, vec!["alice"]);
        assert_eq!(config.iteration.max_backups, 5);
        assert_eq!(config.iteration.diff_max_lines, 50);
        assert_eq!(config.security.allowed_read_paths, vec!["src", "plugins"]);
    }

    #[test]
    fn test_corrupt_file_is_preserved() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[iteration\nmax_backups = ").unwrap();

        let config = Config::load_from(&path);
        assert_eq!(config, Config::default());
        assert!(!path.exists());
        assert!(dir.path().join("config.toml.corrupt").exists());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.iteration.enable_syntax_check = false;
        config.security.admins.push("ops".to_string());

        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path), config);
    }

    #[test]
    fn test_config_location_names_the_file() {
        assert!(Config::config_location().ends_with("config.toml"));
    }

    #[test]
    fn test_missing_file_loads_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.toml"));
        assert_eq!(config, Config::default());
    }
}
