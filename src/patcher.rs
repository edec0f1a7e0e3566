//! Patcher: backup, atomic overwrite, integrity check, rollback, retention
//!
//! Backups live in one flat pool named
//! `<flattened-origin>.<YYYYMMDD_HHMMSS>[-N].bak`. The origin path is
//! flattened by escaping `%` as `%25` and `/` as `%2F`, so the name maps
//! back to its origin exactly. The `<stamp>[-N]` token is the backup id;
//! `-N` only appears when another backup already holds the same second, so
//! ids are unique and `(stamp, N)` totally orders the pool.

use crate::error::{PipelineError, Result};
use crate::util::{copy_atomic, hash_bytes, hash_file, slash_path, write_atomic};
use chrono::{Local, NaiveDateTime};
use fs2::FileExt;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const BACKUP_EXTENSION: &str = ".bak";
const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const LOCK_FILE: &str = ".lock";
const LOCK_TIMEOUT_SECS: u64 = 10;
const LOCK_RETRY_MS: u64 = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupRecord {
    /// `<YYYYMMDD_HHMMSS>[-N]`, unique within the pool
    pub id: String,
    /// Origin as recorded in the name: root-relative when the target was
    /// under the origin root, otherwise the full path
    pub origin: String,
    /// Where the backup restores to
    pub target: PathBuf,
    pub path: PathBuf,
    pub created_at: NaiveDateTime,
    pub size: u64,
    #[serde(skip)]
    seq: u32,
}

impl BackupRecord {
    fn order_key(&self) -> (NaiveDateTime, u32) {
        (self.created_at, self.seq)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    pub target: PathBuf,
    /// `None` when the target did not exist before
    pub backup: Option<BackupRecord>,
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackReport {
    pub target: PathBuf,
    pub restored_from: String,
    pub pre_rollback_backup: Option<BackupRecord>,
}

#[derive(Debug)]
pub struct BatchItem {
    pub staged: PathBuf,
    pub target: PathBuf,
    pub outcome: Result<ApplyReport>,
}

#[derive(Debug, Default)]
pub struct BatchResult {
    pub success_count: usize,
    pub failed_count: usize,
    pub results: Vec<BatchItem>,
}

impl BatchResult {
    pub fn all_succeeded(&self) -> bool {
        self.failed_count == 0
    }
}

/// Held for the duration of a pool mutation; released on drop.
struct PoolLock {
    file: fs::File,
}

impl Drop for PoolLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[derive(Debug, Clone)]
pub struct Patcher {
    backup_dir: PathBuf,
    max_backups: usize,
    origin_root: Option<PathBuf>,
}

impl Patcher {
    /// Open the pool, creating it if needed. The bound is at least 1 so the
    /// backup taken before an overwrite is never evicted by that same call.
    pub fn open(backup_dir: &Path, max_backups: usize) -> Result<Self> {
        fs::create_dir_all(backup_dir).map_err(|e| {
            let context = format!("Failed to create backup directory {}", backup_dir.display());
            PipelineError::io(context, e)
        })?;
        if max_backups == 0 {
            tracing::warn!("max_backups = 0 would evict every backup; keeping 1");
        }
        Ok(Self {
            backup_dir: backup_dir.to_path_buf(),
            max_backups: max_backups.max(1),
            origin_root: None,
        })
    }

    /// Record origins relative to `root` for targets beneath it.
    pub fn with_origin_root(mut self, root: &Path) -> Self {
        self.origin_root = Some(root.to_path_buf());
        self
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn max_backups(&self) -> usize {
        self.max_backups
    }

    fn lock(&self) -> Result<PoolLock> {
        let lock_path = self.backup_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| PipelineError::io("Failed to open backup pool lock", e))?;

        let start = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => break,
                Err(err) => {
                    if err.kind() != ErrorKind::WouldBlock {
                        return Err(PipelineError::io("Failed to lock backup pool", err));
                    }
                    if start.elapsed() >= Duration::from_secs(LOCK_TIMEOUT_SECS) {
                        let context = format!(
                            "Timed out waiting for backup pool lock ({}s)",
                            LOCK_TIMEOUT_SECS
                        );
                        return Err(PipelineError::io(context, err));
                    }
                    std::thread::sleep(Duration::from_millis(LOCK_RETRY_MS));
                }
            }
        }
        Ok(PoolLock { file })
    }

    fn origin_of(&self, target: &Path) -> String {
        match &self.origin_root {
            Some(root) => match target.strip_prefix(root) {
                Ok(relative) => slash_path(relative),
                Err(_) => target.to_string_lossy().into_owned(),
            },
            None => target.to_string_lossy().into_owned(),
        }
    }

    fn target_of(&self, origin: &str) -> PathBuf {
        let path = PathBuf::from(origin);
        match &self.origin_root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path,
        }
    }

    /// Copy `target` into the pool. A missing target needs no backup.
    pub fn backup(&self, target: &Path) -> Result<Option<BackupRecord>> {
        if !target.exists() {
            return Ok(None);
        }

        let _lock = self.lock()?;
        let origin = self.origin_of(target);
        let now = Local::now().naive_local();
        let stamp = now.format(STAMP_FORMAT).to_string();
        // Second resolution, matching what the name can round-trip.
        let created_at = parse_stamp(&stamp).unwrap_or(now);

        let existing = self.scan();
        let seq = existing
            .iter()
            .filter(|r| r.id == stamp || r.id.starts_with(&format!("{}-", stamp)))
            .map(|r| r.seq + 1)
            .max()
            .unwrap_or(0);
        let id = if seq == 0 {
            stamp
        } else {
            format!("{}-{}", stamp, seq)
        };

        let path = self
            .backup_dir
            .join(format!("{}.{}{}", flatten(&origin), id, BACKUP_EXTENSION));
        let size = fs::copy(target, &path).map_err(|e| {
            PipelineError::io(format!("Failed to back up {}", target.display()), e)
        })?;
        preserve_mtime(target, &path);

        let record = BackupRecord {
            id,
            origin,
            target: target.to_path_buf(),
            path,
            created_at,
            size,
            seq,
        };
        tracing::info!(
            id = record.id.as_str(),
            origin = record.origin.as_str(),
            size,
            "created backup"
        );

        let mut pool = existing;
        pool.push(record.clone());
        self.evict(pool, self.max_backups);
        Ok(Some(record))
    }

    /// Back up the target, then replace it with the staged copy and confirm
    /// both files hash the same.
    pub fn apply(&self, staged: &Path, target: &Path) -> Result<ApplyReport> {
        if !staged.is_file() {
            return Err(PipelineError::StagedMissing(staged.to_path_buf()));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                PipelineError::io(format!("Failed to create {}", parent.display()), e)
            })?;
        }

        let backup = self.backup(target)?;

        copy_atomic(staged, target).map_err(|e| {
            PipelineError::io(format!("Failed to write {}", target.display()), e)
        })?;

        let expected = hash_file(staged)
            .map_err(|e| PipelineError::io(format!("Failed to read {}", staged.display()), e))?;
        let actual = hash_file(target)
            .map_err(|e| PipelineError::io(format!("Failed to read {}", target.display()), e))?;
        if expected != actual {
            tracing::error!(file = %target.display(), "checksum mismatch after apply");
            return Err(PipelineError::Integrity {
                target: target.display().to_string(),
                expected,
                actual,
            });
        }

        tracing::info!(
            file = %target.display(),
            backup = backup.as_ref().map(|b| b.id.as_str()).unwrap_or("none"),
            "applied staged file"
        );
        Ok(ApplyReport {
            target: target.to_path_buf(),
            backup,
            checksum: actual,
        })
    }

    /// Restore `backup` over `target`, optionally backing up the current
    /// target first.
    pub fn rollback(
        &self,
        backup: &BackupRecord,
        target: &Path,
        pre_backup: bool,
    ) -> Result<RollbackReport> {
        if !backup.path.is_file() {
            return Err(PipelineError::BackupMissing(backup.path.clone()));
        }

        // Read first: the pre-rollback backup may evict this very file.
        let content = fs::read(&backup.path).map_err(|e| {
            PipelineError::io(format!("Failed to read {}", backup.path.display()), e)
        })?;
        let permissions = fs::metadata(&backup.path).map(|m| m.permissions()).ok();

        let pre_rollback_backup = if pre_backup {
            self.backup(target)?
        } else {
            None
        };

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                PipelineError::io(format!("Failed to create {}", parent.display()), e)
            })?;
        }
        write_atomic(target, &content).map_err(|e| {
            PipelineError::io(format!("Failed to restore {}", target.display()), e)
        })?;
        if let Some(permissions) = permissions {
            let _ = fs::set_permissions(target, permissions);
        }

        let actual = hash_file(target)
            .map_err(|e| PipelineError::io(format!("Failed to read {}", target.display()), e))?;
        let expected = hash_bytes(&content);
        if expected != actual {
            return Err(PipelineError::Integrity {
                target: target.display().to_string(),
                expected,
                actual,
            });
        }

        tracing::info!(file = %target.display(), backup = backup.id.as_str(), "rolled back");
        Ok(RollbackReport {
            target: target.to_path_buf(),
            restored_from: backup.id.clone(),
            pre_rollback_backup,
        })
    }

    /// Apply `(staged, target)` pairs in order, reporting each outcome.
    pub fn apply_batch(
        &self,
        items: &[(PathBuf, PathBuf)],
        stop_on_first_error: bool,
    ) -> BatchResult {
        let mut batch = BatchResult::default();
        for (staged, target) in items {
            let outcome = self.apply(staged, target);
            let failed = outcome.is_err();
            if let Err(err) = &outcome {
                tracing::warn!(file = %target.display(), "apply failed: {}", err);
                batch.failed_count += 1;
            } else {
                batch.success_count += 1;
            }
            batch.results.push(BatchItem {
                staged: staged.clone(),
                target: target.clone(),
                outcome,
            });
            if failed && stop_on_first_error {
                break;
            }
        }
        batch
    }

    /// Backups newest first, optionally only those of one target.
    pub fn list_backups(&self, target: Option<&Path>) -> Vec<BackupRecord> {
        let origin = target.map(|t| self.origin_of(t));
        let mut records: Vec<BackupRecord> = self
            .scan()
            .into_iter()
            .filter(|r| origin.as_ref().is_none_or(|o| *o == r.origin))
            .collect();
        records.sort_by_key(|r| std::cmp::Reverse(r.order_key()));
        records
    }

    /// Exact id, else a unique id prefix.
    pub fn find_backup(&self, query: &str) -> Result<BackupRecord> {
        let query = query.trim();
        let records = self.list_backups(None);
        if let Some(exact) = records.iter().find(|r| r.id == query) {
            return Ok(exact.clone());
        }

        let mut matches: Vec<BackupRecord> = records
            .into_iter()
            .filter(|r| !query.is_empty() && r.id.starts_with(query))
            .collect();
        match matches.len() {
            0 => Err(PipelineError::BackupNotFound(query.to_string())),
            1 => Ok(matches.remove(0)),
            _ => Err(PipelineError::AmbiguousBackup {
                query: query.to_string(),
                candidates: matches.into_iter().map(|r| r.id).collect(),
            }),
        }
    }

    /// Evict the oldest backups beyond `max`; returns how many were removed.
    pub fn cleanup_old_backups(&self, max: usize) -> Result<usize> {
        let _lock = self.lock()?;
        Ok(self.evict(self.scan(), max))
    }

    pub fn delete_backup(&self, record: &BackupRecord) -> bool {
        match fs::remove_file(&record.path) {
            Ok(()) => {
                tracing::info!(id = record.id.as_str(), "deleted backup");
                true
            }
            Err(_) => false,
        }
    }

    /// Caller holds the pool lock.
    fn evict(&self, mut pool: Vec<BackupRecord>, max: usize) -> usize {
        if pool.len() <= max {
            return 0;
        }
        pool.sort_by_key(|r| r.order_key());
        let excess = pool.len() - max;
        let removed = pool[..excess].iter().filter(|r| self.delete_backup(r)).count();
        tracing::info!(removed, kept = max, "evicted old backups");
        removed
    }

    fn scan(&self) -> Vec<BackupRecord> {
        let Ok(entries) = fs::read_dir(&self.backup_dir) else {
            return Vec::new();
        };

        let mut records = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(BACKUP_EXTENSION) {
                continue;
            }
            match self.parse_name(&name) {
                Some(mut record) => {
                    record.path = entry.path();
                    record.size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                    records.push(record);
                }
                None => tracing::warn!(file = name.as_str(), "skipping unparseable backup name"),
            }
        }
        records
    }

    fn parse_name(&self, name: &str) -> Option<BackupRecord> {
        let stem = name.strip_suffix(BACKUP_EXTENSION)?;
        let (flat, id) = stem.rsplit_once('.')?;
        let (stamp, seq) = match id.split_once('-') {
            Some((stamp, n)) => (stamp, n.parse::<u32>().ok().filter(|n| *n > 0)?),
            None => (id, 0),
        };
        let created_at = parse_stamp(stamp)?;
        let origin = unflatten(flat)?;
        if origin.is_empty() {
            return None;
        }

        Some(BackupRecord {
            id: id.to_string(),
            target: self.target_of(&origin),
            origin,
            path: PathBuf::new(),
            created_at,
            size: 0,
            seq,
        })
    }
}

/// `fs::copy` carries permissions only; the backup also keeps the mtime.
fn preserve_mtime(source: &Path, dest: &Path) {
    let result = fs::metadata(source)
        .and_then(|meta| meta.modified())
        .and_then(|modified| {
            OpenOptions::new()
                .write(true)
                .open(dest)
                .or_else(|_| fs::File::open(dest))
                .and_then(|file| file.set_modified(modified))
        });
    if let Err(err) = result {
        tracing::warn!(file = %dest.display(), "could not keep modification time: {}", err);
    }
}

fn parse_stamp(stamp: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).ok()
}

fn flatten(origin: &str) -> String {
    origin.replace('%', "%25").replace(['/', '\\'], "%2F")
}

fn unflatten(flat: &str) -> Option<String> {
    let mut out = String::with_capacity(flat.len());
    let mut chars = flat.chars();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        let escape: String = chars.by_ref().take(2).collect();
        match escape.as_str() {
            "25" => out.push('%'),
            "2F" => out.push('/'),
            _ => return None,
        }
    }
    Some(out)
}
