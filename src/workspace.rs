//! Shadow workspace: isolated staging area for proposed files
//!
//! A target `src/pkg/mod.py` is staged at
//! `<shadow_root>/src/pkg/mod_<hash8>.py`, where `hash8` is the first eight
//! hex digits of the target's path hash. The name is reversible, so the
//! mapping is rebuilt from disk whenever the workspace is opened.

use crate::error::{PipelineError, Result};
use crate::util::{hash_str, slash_path, write_atomic};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShadowEntry {
    /// Root-relative target the file stands in for
    pub target: String,
    pub path: PathBuf,
    pub staged_at: DateTime<Local>,
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShadowStats {
    pub file_count: usize,
    pub total_bytes: u64,
    pub oldest: Option<DateTime<Local>>,
    pub newest: Option<DateTime<Local>>,
}

#[derive(Debug)]
pub struct ShadowWorkspace {
    root: PathBuf,
    max_age: Duration,
    entries: BTreeMap<String, PathBuf>,
}

impl ShadowWorkspace {
    pub fn open(root: &Path, max_age: Duration) -> Result<Self> {
        fs::create_dir_all(root).map_err(|e| {
            PipelineError::io(format!("Failed to create shadow workspace {}", root.display()), e)
        })?;

        let mut workspace = Self {
            root: root.to_path_buf(),
            max_age,
            entries: BTreeMap::new(),
        };
        workspace.rebuild();
        Ok(workspace)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn rebuild(&mut self) {
        self.entries.clear();
        for entry in WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            match target_for_staged(relative) {
                Some(target) => {
                    self.entries.insert(target, entry.path().to_path_buf());
                }
                None => tracing::warn!(
                    path = %entry.path().display(),
                    "skipping unrecognized file in shadow workspace"
                ),
            }
        }
        if !self.entries.is_empty() {
            tracing::info!(count = self.entries.len(), "recovered staged files");
        }
    }

    /// Where `target` is (or would be) staged.
    pub fn staged_path_for(&self, target: &str) -> Result<PathBuf> {
        let relative = checked_relative(target)?;
        let file_name = relative
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                PipelineError::Internal(format!("Target has no file name: {}", target))
            })?;

        let key = slash_path(&relative);
        let hash8 = &hash_str(&key)[..8];
        let staged_name = match file_name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => format!("{}_{}.{}", stem, hash8, ext),
            _ => format!("{}_{}", file_name, hash8),
        };
        Ok(self.root.join(relative.with_file_name(staged_name)))
    }

    /// Write `content` as the staged copy of `target`, replacing any previous one.
    pub fn stage(&mut self, target: &str, content: &str) -> Result<PathBuf> {
        let staged = self.staged_path_for(target)?;
        if let Some(parent) = staged.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                PipelineError::io(format!("Failed to create {}", parent.display()), e)
            })?;
        }
        write_atomic(&staged, content.as_bytes()).map_err(|e| {
            PipelineError::io(format!("Failed to stage {}", target), e)
        })?;

        tracing::info!(
            file = target,
            staged = %staged.display(),
            bytes = content.len(),
            "staged file"
        );
        self.entries.insert(normalized_key(target)?, staged.clone());
        Ok(staged)
    }

    pub fn read_staged(&self, target: &str) -> Option<String> {
        let staged = self.staged_path_for(target).ok()?;
        fs::read_to_string(staged).ok()
    }

    /// Path of the staged copy, if one exists on disk.
    pub fn staged_path(&self, target: &str) -> Option<PathBuf> {
        self.staged_path_for(target).ok().filter(|p| p.is_file())
    }

    pub fn delete_staged(&mut self, target: &str) -> bool {
        let Ok(staged) = self.staged_path_for(target) else {
            return false;
        };
        if let Ok(key) = normalized_key(target) {
            self.entries.remove(&key);
        }
        match fs::remove_file(&staged) {
            Ok(()) => {
                self.prune_empty_dirs(staged.parent());
                tracing::debug!(file = target, "deleted staged file");
                true
            }
            Err(_) => false,
        }
    }

    /// Staged entries still on disk, sorted by target.
    pub fn list_staged(&self) -> Vec<ShadowEntry> {
        self.entries
            .iter()
            .filter_map(|(target, path)| {
                let meta = fs::metadata(path).ok().filter(|m| m.is_file())?;
                Some(ShadowEntry {
                    target: target.clone(),
                    path: path.clone(),
                    staged_at: meta.modified().map(DateTime::from).unwrap_or_else(|_| Local::now()),
                    size: meta.len(),
                })
            })
            .collect()
    }

    /// Remove every file under the staging root, then any empty directories.
    pub fn clear_all(&mut self) -> usize {
        let files: Vec<PathBuf> = WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect();

        let removed = files.iter().filter(|f| fs::remove_file(f).is_ok()).count();

        for dir in WalkDir::new(&self.root)
            .min_depth(1)
            .contents_first(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
        {
            let _ = fs::remove_dir(dir.path());
        }

        self.entries.clear();
        if removed > 0 {
            tracing::info!(removed, "cleared shadow workspace");
        }
        removed
    }

    pub fn expire(&mut self) -> usize {
        self.expire_older_than(self.max_age)
    }

    pub fn expire_older_than(&mut self, max_age: Duration) -> usize {
        let now = SystemTime::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, path)| {
                fs::metadata(path)
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|modified| now.duration_since(modified).ok())
                    .is_some_and(|age| age > max_age)
            })
            .map(|(target, _)| target.clone())
            .collect();

        let removed = expired.iter().filter(|t| self.delete_staged(t)).count();
        if removed > 0 {
            tracing::info!(removed, "expired stale staged files");
        }
        removed
    }

    pub fn stats(&self) -> ShadowStats {
        let mut stats = ShadowStats::default();
        for entry in self.list_staged() {
            stats.file_count += 1;
            stats.total_bytes += entry.size;
            stats.oldest = Some(stats.oldest.map_or(entry.staged_at, |o| o.min(entry.staged_at)));
            stats.newest = Some(stats.newest.map_or(entry.staged_at, |n| n.max(entry.staged_at)));
        }
        stats
    }

    fn prune_empty_dirs(&self, start: Option<&Path>) {
        let mut current = start.map(Path::to_path_buf);
        while let Some(dir) = current {
            if dir == self.root || !dir.starts_with(&self.root) {
                break;
            }
            // Fails on a non-empty directory, which ends the walk.
            if fs::remove_dir(&dir).is_err() {
                break;
            }
            current = dir.parent().map(Path::to_path_buf);
        }
    }
}

/// Only plain components; the staged path must stay inside the root.
fn checked_relative(target: &str) -> Result<PathBuf> {
    let path = Path::new(target);
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => {
                return Err(PipelineError::Internal(format!(
                    "Refusing to stage outside the workspace: {}",
                    target
                )))
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(PipelineError::Internal(format!("Empty staging target: {}", target)));
    }
    Ok(out)
}

fn normalized_key(target: &str) -> Result<String> {
    checked_relative(target).map(|p| slash_path(&p))
}

/// Invert the staged file name, accepting it only if the embedded hash
/// matches the reconstructed target.
fn target_for_staged(relative: &Path) -> Option<String> {
    let name = relative.file_name()?.to_str()?;
    let (base, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if stem.contains('_') => (stem, Some(ext)),
        _ => (name, None),
    };
    let (stem, hash8) = base.rsplit_once('_')?;
    if stem.is_empty() || hash8.len() != 8 {
        return None;
    }

    let original_name = match ext {
        Some(ext) => format!("{}.{}", stem, ext),
        None => stem.to_string(),
    };
    let target = slash_path(&relative.with_file_name(original_name));
    (hash_str(&target)[..8] == *hash8).then_some(target)
}
