use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::BootstrapError;

pub fn ensure_parent(path: &Path) -> Result<(), BootstrapError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Writes through a sibling temp file renamed over `path`; readers see either
/// the old or the new content.
pub fn write_atomic_text_file(
    path: &Path,
    content: &str,
    mode: Option<u32>,
) -> Result<(), BootstrapError> {
    ensure_parent(path)?;
    let name = path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "chatti".to_string());
    let tmp_path = path.with_file_name(format!(".{name}.{}.tmp", std::process::id()));

    let written = fs::write(&tmp_path, content).and_then(|()| apply_mode(&tmp_path, mode));
    if let Err(err) = written.and_then(|()| fs::rename(&tmp_path, path)) {
        let _ = fs::remove_file(&tmp_path);
        return Err(BootstrapError::Io(err));
    }
    Ok(())
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: Option<u32>) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    match mode {
        Some(mode) => fs::set_permissions(path, fs::Permissions::from_mode(mode)),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: Option<u32>) -> io::Result<()> {
    Ok(())
}

/// Writes only when the content differs, leaving mtime alone otherwise.
pub fn write_if_changed(path: &Path, content: &str) -> Result<bool, BootstrapError> {
    if let Ok(existing) = fs::read_to_string(path) {
        if existing == content {
            return Ok(false);
        }
    }
    write_atomic_text_file(path, content, None)?;
    Ok(true)
}

pub fn path_exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

pub fn remove_path(path: &Path) -> Result<bool, BootstrapError> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(BootstrapError::Io(err)),
    };
    if meta.file_type().is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(true)
}

pub fn prune_empty_dir(path: &Path) {
    let _ = fs::remove_dir(path);
}

pub fn expand_home_path(input: &str, home: &Path, field: &str) -> Result<PathBuf, BootstrapError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(BootstrapError::Config(format!("{field} must be non-empty")));
    }
    if trimmed == "~" {
        return Ok(home.to_path_buf());
    }
    if let Some(stripped) = trimmed.strip_prefix("~/") {
        return Ok(home.join(stripped));
    }
    if trimmed.starts_with('~') {
        return Err(BootstrapError::Config(format!(
            "{field} uses unsupported '~' syntax; use '~/' or an absolute path"
        )));
    }
    Ok(PathBuf::from(trimmed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn expand_home_path_handles_tilde_forms() {
        let home = Path::new("/home/u");
        assert_eq!(expand_home_path("~", home, "f").unwrap(), home);
        assert_eq!(
            expand_home_path("~/.chatti/venv", home, "f").unwrap(),
            home.join(".chatti/venv")
        );
        assert_eq!(
            expand_home_path("/opt/x", home, "f").unwrap(),
            PathBuf::from("/opt/x")
        );
        assert!(expand_home_path("~other/x", home, "f").is_err());
        assert!(expand_home_path("  ", home, "f").is_err());
    }

    #[test]
    fn write_if_changed_skips_identical_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("file.txt");
        assert!(write_if_changed(&path, "a\n").unwrap());
        assert!(!write_if_changed(&path, "a\n").unwrap());
        assert!(write_if_changed(&path, "b\n").unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), "b\n");
    }

    #[test]
    fn remove_path_reports_missing() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("tree");
        fs::create_dir_all(target.join("inner")).unwrap();
        fs::write(target.join("inner").join("f"), "x").unwrap();
        assert!(remove_path(&target).unwrap());
        assert!(!path_exists(&target));
        assert!(!remove_path(&target).unwrap());
    }
}
