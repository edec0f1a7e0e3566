use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Truncate to `max` characters, marking the cut with `...`.
pub fn truncate(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }

    let char_count = s.chars().count();
    if char_count <= max {
        return s.to_string();
    }

    if max <= 3 {
        return s.chars().take(max).collect();
    }

    let truncated: String = s.chars().take(max - 3).collect();
    format!("{}...", truncated)
}

/// A candidate path resolved against the trusted root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootedPath {
    pub absolute: PathBuf,
    pub relative: PathBuf,
}

/// Resolve `candidate` under `root` without requiring the file to exist.
///
/// Absolute paths and `..` components are refused. The nearest existing
/// ancestor is canonicalized so a symlinked directory cannot lead outside
/// the root.
pub fn resolve_under_root(root: &Path, candidate: &Path) -> Result<RootedPath, String> {
    if candidate.as_os_str().is_empty() {
        return Err("Path is empty".to_string());
    }
    if candidate.is_absolute() || candidate.has_root() {
        return Err(format!(
            "Absolute paths are not allowed: {}",
            candidate.display()
        ));
    }
    if candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
    {
        return Err(format!(
            "Parent traversal is not allowed: {}",
            candidate.display()
        ));
    }

    let root = root
        .canonicalize()
        .map_err(|e| format!("Failed to resolve root {}: {}", root.display(), e))?;

    // Drop `.` components so `./src/x.py` and `src/x.py` resolve alike.
    let normalized: PathBuf = candidate
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();
    if normalized.as_os_str().is_empty() {
        return Err(format!("Path names no file: {}", candidate.display()));
    }

    let joined = root.join(&normalized);
    let parent = joined
        .parent()
        .ok_or_else(|| format!("Invalid path: {}", candidate.display()))?;
    let parent_canon = canonicalize_existing_parent(parent)?;

    if !parent_canon.starts_with(&root) {
        return Err(format!("Path escapes the root: {}", candidate.display()));
    }
    if joined.is_symlink() {
        let resolved = joined
            .canonicalize()
            .map_err(|e| format!("Failed to resolve link {}: {}", candidate.display(), e))?;
        if !resolved.starts_with(&root) {
            return Err(format!("Link escapes the root: {}", candidate.display()));
        }
    }

    Ok(RootedPath {
        absolute: joined,
        relative: normalized,
    })
}

fn canonicalize_existing_parent(path: &Path) -> Result<PathBuf, String> {
    let mut current = path.to_path_buf();
    while !current.exists() {
        if !current.pop() {
            return Err("Path has no existing parent".to_string());
        }
    }
    current
        .canonicalize()
        .map_err(|e| format!("Failed to resolve path {}: {}", current.display(), e))
}

/// Render a relative path with `/` separators on every platform.
pub fn slash_path(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Compute a stable hash of file contents (FNV-1a 64-bit).
pub fn hash_bytes(content: &[u8]) -> String {
    const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET_BASIS;
    for byte in content {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }

    format!("{:016x}", hash)
}

pub fn hash_str(content: &str) -> String {
    hash_bytes(content.as_bytes())
}

/// Checksum of a file on disk.
pub fn hash_file(path: &Path) -> io::Result<String> {
    Ok(hash_bytes(&fs::read(path)?))
}

/// Copy `source` over `dest` through a sibling temp file and a rename, so
/// readers of `dest` see either the old or the new content.
///
/// Permissions of an existing `dest` are kept.
pub fn copy_atomic(source: &Path, dest: &Path) -> io::Result<()> {
    let tmp_path = sibling_tmp_path(dest);
    let existing_perms = fs::metadata(dest).ok().map(|m| m.permissions());

    fs::copy(source, &tmp_path)?;
    if let Some(perms) = existing_perms {
        let _ = fs::set_permissions(&tmp_path, perms);
    }

    if let Err(err) = fs::rename(&tmp_path, dest) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(())
}

/// Write `content` to `dest` through a sibling temp file and a rename.
pub fn write_atomic(dest: &Path, content: &[u8]) -> io::Result<()> {
    let tmp_path = sibling_tmp_path(dest);
    fs::write(&tmp_path, content)?;

    if let Err(err) = fs::rename(&tmp_path, dest) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(())
}

fn sibling_tmp_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    dest.with_file_name(format!(".{}.{}.tmp", name, std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_truncate_unicode_safe() {
        let input = "ééééé";
        assert_eq!(truncate(input, 4), "é...");
    }

    #[test]
    fn test_truncate_small_max() {
        let input = "こんにちは";
        assert_eq!(truncate(input, 3), "こんに");
        assert_eq!(truncate(input, 0), "");
    }

    #[test]
    fn test_hash_str_is_stable() {
        let a = hash_str("hello");
        let b = hash_str("hello");
        let c = hash_str("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_resolve_under_root_accepts_missing_file() {
        let root = tempdir().unwrap();
        let candidate = PathBuf::from("new_dir/new_file.py");
        let resolved = resolve_under_root(root.path(), &candidate).unwrap();
        assert_eq!(resolved.relative, candidate);
        assert!(resolved.absolute.ends_with("new_dir/new_file.py"));
    }

    #[test]
    fn test_resolve_under_root_strips_cur_dir() {
        let root = tempdir().unwrap();
        let resolved = resolve_under_root(root.path(), Path::new("./src/./a.py")).unwrap();
        assert_eq!(resolved.relative, PathBuf::from("src/a.py"));
    }

    #[test]
    fn test_resolve_under_root_rejects_escapes() {
        let root = tempdir().unwrap();
        assert!(resolve_under_root(root.path(), Path::new("../etc/passwd")).is_err());
        assert!(resolve_under_root(root.path(), Path::new("/etc/passwd")).is_err());
        assert!(resolve_under_root(root.path(), Path::new("")).is_err());
        assert!(resolve_under_root(root.path(), Path::new(".")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_under_root_rejects_symlinked_dir() {
        let root = tempdir().unwrap();
        let outside = tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("src")).unwrap();
        let err = resolve_under_root(root.path(), Path::new("src/evil.py")).unwrap_err();
        assert!(err.contains("escapes"));
    }

    #[test]
    fn test_copy_atomic_replaces_content() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src.txt");
        let dest = dir.path().join("dest.txt");
        fs::write(&src, "new").unwrap();
        fs::write(&dest, "old").unwrap();

        copy_atomic(&src, &dest).unwrap();
        assert_eq!(fs::read_to_string(&dest).unwrap(), "new");
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_slash_path_joins_components() {
        assert_eq!(slash_path(Path::new("src/core/a.py")), "src/core/a.py");
    }
}
