use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::error::BootstrapError;
use crate::fsutil::{ensure_parent, write_atomic_text_file};
use crate::platform::{Platform, LAUNCHER_MARKER};

pub const PATH_MARKER: &str = "# added by chatti-bootstrap (PATH)";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StartupFileStatus {
    Appended,
    AlreadyPresent,
    Missing,
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct StartupFileOutcome {
    pub path: PathBuf,
    #[serde(flatten)]
    pub status: StartupFileStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct LauncherOutcome {
    pub path: PathBuf,
    pub target: PathBuf,
    pub changed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MarkerLine {
    pub path: PathBuf,
    pub line_number: usize,
    pub text: String,
}

pub fn startup_files(home: &Path, configured: &[String], platform: Platform) -> Vec<PathBuf> {
    if configured.is_empty() {
        platform
            .default_startup_files()
            .into_iter()
            .map(|rel| home.join(rel))
            .collect()
    } else {
        configured
            .iter()
            .map(|rel| {
                let path = PathBuf::from(rel);
                if path.is_absolute() {
                    path
                } else {
                    home.join(rel.trim_start_matches("~/"))
                }
            })
            .collect()
    }
}

/// Appends a marked PATH line to every existing startup file that lacks one.
/// Files that do not exist are never created.
pub fn extend_search_path(
    dir: &Path,
    files: &[PathBuf],
    platform: Platform,
) -> Vec<StartupFileOutcome> {
    files
        .iter()
        .map(|file| StartupFileOutcome {
            path: file.clone(),
            status: extend_one(dir, file, platform),
        })
        .collect()
}

fn extend_one(dir: &Path, file: &Path, platform: Platform) -> StartupFileStatus {
    if !file.is_file() {
        return StartupFileStatus::Missing;
    }
    let existing = match fs::read_to_string(file) {
        Ok(text) => text,
        Err(err) => {
            return StartupFileStatus::Failed {
                error: err.to_string(),
            }
        }
    };
    if existing.contains(PATH_MARKER) {
        debug!(file = %file.display(), "search path marker already present");
        return StartupFileStatus::AlreadyPresent;
    }
    let mut block = String::new();
    if !existing.is_empty() && !existing.ends_with('\n') {
        block.push('\n');
    }
    block.push_str(PATH_MARKER);
    block.push('\n');
    block.push_str(&platform.search_path_line(file, dir));
    block.push('\n');

    let appended = OpenOptions::new()
        .append(true)
        .open(file)
        .and_then(|mut handle| handle.write_all(block.as_bytes()));
    match appended {
        Ok(()) => {
            info!(file = %file.display(), dir = %dir.display(), "extended search path");
            StartupFileStatus::Appended
        }
        Err(err) => StartupFileStatus::Failed {
            error: err.to_string(),
        },
    }
}

pub fn is_managed_launcher(path: &Path) -> bool {
    fs::read_to_string(path)
        .map(|body| body.contains(LAUNCHER_MARKER))
        .unwrap_or(false)
}

/// Writes the forwarding launcher. Rewrites are idempotent and always point at
/// `target`; a foreign file at `launcher_path` is left alone.
pub fn install_launcher(
    target: &Path,
    launcher_path: &Path,
    platform: Platform,
) -> Result<LauncherOutcome, BootstrapError> {
    if launcher_path.exists() && !is_managed_launcher(launcher_path) {
        return Err(BootstrapError::Integration(format!(
            "launcher install would overwrite an existing file not managed by chatti-bootstrap: {}",
            launcher_path.display()
        )));
    }
    ensure_parent(launcher_path)?;
    let body = platform.launcher_script(target);
    let changed = fs::read_to_string(launcher_path)
        .map(|existing| existing != body)
        .unwrap_or(true);
    write_atomic_text_file(launcher_path, &body, Some(0o755))?;
    platform.make_executable(launcher_path)?;
    Ok(LauncherOutcome {
        path: launcher_path.to_path_buf(),
        target: target.to_path_buf(),
        changed,
    })
}

/// Marker lines and the PATH line that follows each, for the removal advisory.
pub fn find_marker_lines(files: &[PathBuf]) -> Vec<MarkerLine> {
    let mut found = Vec::new();
    for file in files {
        let Ok(text) = fs::read_to_string(file) else {
            continue;
        };
        let lines: Vec<&str> = text.lines().collect();
        for (idx, line) in lines.iter().enumerate() {
            if !line.contains(PATH_MARKER) {
                continue;
            }
            found.push(MarkerLine {
                path: file.clone(),
                line_number: idx + 1,
                text: line.to_string(),
            });
            if let Some(next) = lines.get(idx + 1) {
                if next.contains("PATH") && !next.contains(PATH_MARKER) {
                    found.push(MarkerLine {
                        path: file.clone(),
                        line_number: idx + 2,
                        text: next.to_string(),
                    });
                }
            }
        }
    }
    found
}

pub fn removal_advisory(lines: &[MarkerLine]) -> Vec<String> {
    lines
        .iter()
        .map(|line| {
            format!(
                "remove manually if no longer wanted: {}:{}: {}",
                line.path.display(),
                line.line_number,
                line.text
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn extend_is_idempotent_and_skips_missing_files() {
        let dir = tempdir().unwrap();
        let bashrc = dir.path().join(".bashrc");
        let zshrc = dir.path().join(".zshrc");
        fs::write(&bashrc, "alias ll='ls -l'").unwrap();
        let bin = dir.path().join(".local/bin");
        let files = vec![bashrc.clone(), zshrc.clone()];

        let first = extend_search_path(&bin, &files, Platform::Unix);
        assert_eq!(first[0].status, StartupFileStatus::Appended);
        assert_eq!(first[1].status, StartupFileStatus::Missing);
        assert!(!zshrc.exists());

        let second = extend_search_path(&bin, &files, Platform::Unix);
        assert_eq!(second[0].status, StartupFileStatus::AlreadyPresent);

        let content = fs::read_to_string(&bashrc).unwrap();
        assert_eq!(content.matches(PATH_MARKER).count(), 1);
        assert!(content.starts_with("alias ll='ls -l'\n"));
        assert!(content.contains(&format!("export PATH='{}':\"$PATH\"", bin.display())));
    }

    #[test]
    fn fish_config_gets_fish_syntax() {
        let dir = tempdir().unwrap();
        let fish = dir.path().join(".config/fish/config.fish");
        fs::create_dir_all(fish.parent().unwrap()).unwrap();
        fs::write(&fish, "").unwrap();
        extend_search_path(Path::new("/opt/bin"), &[fish.clone()], Platform::Unix);
        let content = fs::read_to_string(&fish).unwrap();
        assert_eq!(
            content,
            format!("{PATH_MARKER}\nset -gx PATH '/opt/bin' $PATH\n")
        );
    }

    #[test]
    fn launcher_is_byte_identical_across_installs() {
        let dir = tempdir().unwrap();
        let launcher = dir.path().join("bin").join("chatti");
        let target = dir.path().join("venv/bin/chatti");

        let first = install_launcher(&target, &launcher, Platform::Unix).unwrap();
        assert!(first.changed);
        let bytes = fs::read(&launcher).unwrap();
        let second = install_launcher(&target, &launcher, Platform::Unix).unwrap();
        assert!(!second.changed);
        assert_eq!(fs::read(&launcher).unwrap(), bytes);
        assert!(is_managed_launcher(&launcher));
        #[cfg(unix)]
        assert!(is_executable::is_executable(&launcher));
    }

    #[test]
    fn launcher_follows_new_target() {
        let dir = tempdir().unwrap();
        let launcher = dir.path().join("chatti");
        install_launcher(Path::new("/old/bin/chatti"), &launcher, Platform::Unix).unwrap();
        let outcome = install_launcher(Path::new("/new/bin/chatti"), &launcher, Platform::Unix).unwrap();
        assert!(outcome.changed);
        let body = fs::read_to_string(&launcher).unwrap();
        assert!(body.contains("/new/bin/chatti"));
        assert!(!body.contains("/old/bin/chatti"));
    }

    #[test]
    fn launcher_refuses_foreign_file() {
        let dir = tempdir().unwrap();
        let launcher = dir.path().join("chatti");
        fs::write(&launcher, "#!/bin/sh\necho mine\n").unwrap();
        let err = install_launcher(Path::new("/x"), &launcher, Platform::Unix).unwrap_err();
        assert!(matches!(err, BootstrapError::Integration(_)));
        assert_eq!(fs::read_to_string(&launcher).unwrap(), "#!/bin/sh\necho mine\n");
    }

    #[test]
    fn marker_lines_include_following_export() {
        let dir = tempdir().unwrap();
        let profile = dir.path().join(".profile");
        fs::write(&profile, "umask 022\n").unwrap();
        extend_search_path(Path::new("/home/u/.local/bin"), &[profile.clone()], Platform::Unix);
        let lines = find_marker_lines(&[profile.clone(), dir.path().join(".zshrc")]);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].line_number, 2);
        assert_eq!(lines[1].line_number, 3);
        assert!(lines[1].text.starts_with("export PATH="));
        let advisory = removal_advisory(&lines);
        assert!(advisory[0].contains(".profile:2"));
    }

    #[test]
    fn configured_startup_files_resolve_against_home() {
        let home = Path::new("/home/u");
        let files = startup_files(
            home,
            &["~/.zshrc".to_string(), ".bashrc".to_string(), "/etc/x".to_string()],
            Platform::Unix,
        );
        assert_eq!(
            files,
            vec![
                home.join(".zshrc"),
                home.join(".bashrc"),
                PathBuf::from("/etc/x")
            ]
        );
        assert_eq!(startup_files(home, &[], Platform::Unix).len(), 5);
    }
}
