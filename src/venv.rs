use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::BootstrapError;
use crate::fsutil::{ensure_parent, path_exists, remove_path};
use crate::interpreter::InterpreterHandle;
use crate::lock::RuntimeLock;
use crate::platform::{render_command, CommandRunner, Platform};

pub const HEALTH_CHECK: &str = "import sys";

const TRANSIENT_CREATION_ERRORS: [&str; 2] = ["Text file busy", "being used by another process"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionAction {
    Created,
    Recreated,
    Reused,
}

#[derive(Debug, Clone, Serialize)]
pub struct IsolatedRuntimeRecord {
    pub root: PathBuf,
    pub interpreter: PathBuf,
    /// When pip, setuptools and wheel were last brought up to date.
    pub toolchain_upgraded_at: DateTime<Utc>,
    pub action: ProvisionAction,
}

pub fn runtime_is_healthy<R: CommandRunner>(root: &Path, platform: Platform, runner: &R) -> bool {
    let interpreter = platform.venv_interpreter(root);
    if !interpreter.is_file() {
        return false;
    }
    runner
        .run(&interpreter, &["-c".to_string(), HEALTH_CHECK.to_string()], true)
        .map(|out| out.success())
        .unwrap_or(false)
}

/// Creates the runtime at `root` if absent, rebuilds it from scratch if its
/// interpreter is missing or broken, then upgrades its packaging toolchain.
pub fn ensure<R: CommandRunner>(
    root: &Path,
    handle: &InterpreterHandle,
    platform: Platform,
    runner: &R,
    lock: &RuntimeLock<'_>,
) -> Result<IsolatedRuntimeRecord, BootstrapError> {
    lock.guards(root)?;

    let action = if !path_exists(root) {
        info!(root = %root.display(), "creating isolated runtime");
        create_runtime(root, handle, platform, runner)?;
        ProvisionAction::Created
    } else if runtime_is_healthy(root, platform, runner) {
        ProvisionAction::Reused
    } else {
        warn!(root = %root.display(), "isolated runtime interpreter is missing or broken; recreating");
        remove_path(root)?;
        create_runtime(root, handle, platform, runner)?;
        ProvisionAction::Recreated
    };

    let interpreter = platform.venv_interpreter(root);
    upgrade_toolchain(root, &interpreter, runner)?;
    Ok(IsolatedRuntimeRecord {
        root: root.to_path_buf(),
        interpreter,
        toolchain_upgraded_at: Utc::now(),
        action,
    })
}

fn create_runtime<R: CommandRunner>(
    root: &Path,
    handle: &InterpreterHandle,
    platform: Platform,
    runner: &R,
) -> Result<(), BootstrapError> {
    ensure_parent(root)?;
    let args = vec![
        "-m".to_string(),
        "venv".to_string(),
        root.to_string_lossy().to_string(),
    ];
    let command = render_command(&handle.path, &args);
    let mut retried = false;
    loop {
        let output = runner.run(&handle.path, &args, true).map_err(|err| {
            BootstrapError::RuntimeCreationFailed {
                root: root.to_path_buf(),
                message: format!("failed to run `{command}`: {err}"),
            }
        })?;
        let stderr = output.stderr_text();
        if output.success() {
            if platform.venv_interpreter(root).is_file() {
                return Ok(());
            }
            return Err(BootstrapError::RuntimeCreationFailed {
                root: root.to_path_buf(),
                message: format!("`{command}` succeeded but left no interpreter behind"),
            });
        }
        let transient = TRANSIENT_CREATION_ERRORS
            .iter()
            .any(|needle| stderr.contains(needle));
        if transient && !retried {
            warn!(root = %root.display(), %stderr, "transient runtime creation failure; retrying once");
            retried = true;
            remove_path(root)?;
            continue;
        }
        return Err(BootstrapError::RuntimeCreationFailed {
            root: root.to_path_buf(),
            message: format!(
                "`{command}` exited with status {}: {}",
                output.status_code, stderr
            ),
        });
    }
}

fn upgrade_toolchain<R: CommandRunner>(
    root: &Path,
    interpreter: &Path,
    runner: &R,
) -> Result<(), BootstrapError> {
    let args: Vec<String> = [
        "-m",
        "pip",
        "install",
        "--upgrade",
        "--disable-pip-version-check",
        "pip",
        "setuptools",
        "wheel",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    let command = render_command(interpreter, &args);
    let output = runner.run(interpreter, &args, false).map_err(|err| {
        BootstrapError::RuntimeCreationFailed {
            root: root.to_path_buf(),
            message: format!("failed to run `{command}`: {err}"),
        }
    })?;
    if !output.success() {
        return Err(BootstrapError::RuntimeCreationFailed {
            root: root.to_path_buf(),
            message: format!(
                "toolchain upgrade `{command}` exited with status {}: {}",
                output.status_code,
                output.stderr_text()
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::{InterpreterSource, PythonVersion};
    use crate::lock::RuntimeLockFile;
    use crate::testing::FakeRunner;
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::tempdir;

    fn handle() -> InterpreterHandle {
        InterpreterHandle {
            path: PathBuf::from("/usr/bin/python3"),
            version: PythonVersion {
                major: 3,
                minor: 12,
            },
            source: InterpreterSource::WellKnown,
        }
    }

    fn snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
        fn walk(dir: &Path, out: &mut BTreeMap<PathBuf, Vec<u8>>) {
            for entry in fs::read_dir(dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    walk(&path, out);
                } else {
                    out.insert(path.clone(), fs::read(&path).unwrap());
                }
            }
        }
        let mut out = BTreeMap::new();
        walk(root, &mut out);
        out
    }

    #[test]
    fn creates_missing_runtime_and_upgrades_toolchain() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("venv");
        let runner = FakeRunner::with_version("3.12");
        let mut lock_file = RuntimeLockFile::open(&root).unwrap();
        let lock = lock_file.acquire().unwrap();

        let record = ensure(&root, &handle(), Platform::current(), &runner, &lock).unwrap();
        assert_eq!(record.action, ProvisionAction::Created);
        assert!(record.interpreter.is_file());
        assert_eq!(runner.venv_creations(), 1);
        assert_eq!(runner.toolchain_upgrades(), 1);
    }

    #[test]
    fn second_ensure_reuses_and_leaves_disk_unchanged() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("venv");
        let runner = FakeRunner::with_version("3.12");
        let mut lock_file = RuntimeLockFile::open(&root).unwrap();
        let lock = lock_file.acquire().unwrap();

        ensure(&root, &handle(), Platform::current(), &runner, &lock).unwrap();
        let before = snapshot(&root);
        let record = ensure(&root, &handle(), Platform::current(), &runner, &lock).unwrap();
        assert_eq!(record.action, ProvisionAction::Reused);
        assert_eq!(snapshot(&root), before);
        assert_eq!(runner.venv_creations(), 1);
        assert_eq!(runner.toolchain_upgrades(), 2);
    }

    #[test]
    fn missing_interpreter_triggers_full_recreate() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("venv");
        let runner = FakeRunner::with_version("3.12");
        let mut lock_file = RuntimeLockFile::open(&root).unwrap();
        let lock = lock_file.acquire().unwrap();

        ensure(&root, &handle(), Platform::current(), &runner, &lock).unwrap();
        let leftover = root.join("leftover.txt");
        fs::write(&leftover, "stale").unwrap();
        fs::remove_file(Platform::current().venv_interpreter(&root)).unwrap();

        let record = ensure(&root, &handle(), Platform::current(), &runner, &lock).unwrap();
        assert_eq!(record.action, ProvisionAction::Recreated);
        assert!(!leftover.exists());
        assert!(record.interpreter.is_file());
        assert_eq!(runner.venv_creations(), 2);
    }

    #[test]
    fn interpreter_that_fails_to_run_is_recreated() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("venv");
        let runner = FakeRunner::with_version("3.12");
        let mut lock_file = RuntimeLockFile::open(&root).unwrap();
        let lock = lock_file.acquire().unwrap();

        ensure(&root, &handle(), Platform::current(), &runner, &lock).unwrap();
        runner.mark_broken(&Platform::current().venv_interpreter(&root));
        let record = ensure(&root, &handle(), Platform::current(), &runner, &lock).unwrap();
        assert_eq!(record.action, ProvisionAction::Recreated);
    }

    #[test]
    fn transient_creation_failure_is_retried_once() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("venv");
        let runner = FakeRunner::with_version("3.12");
        runner.push_venv_failure("Error: [Errno 26] Text file busy: 'python3'");
        let mut lock_file = RuntimeLockFile::open(&root).unwrap();
        let lock = lock_file.acquire().unwrap();

        let record = ensure(&root, &handle(), Platform::current(), &runner, &lock).unwrap();
        assert_eq!(record.action, ProvisionAction::Created);
        assert_eq!(runner.venv_creations(), 2);
    }

    #[test]
    fn persistent_or_unknown_creation_failure_is_fatal() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("venv");
        let runner = FakeRunner::with_version("3.12");
        runner.push_venv_failure("Error: Command '-m ensurepip' returned non-zero exit status 1.");
        let mut lock_file = RuntimeLockFile::open(&root).unwrap();
        let lock = lock_file.acquire().unwrap();

        let err = ensure(&root, &handle(), Platform::current(), &runner, &lock).unwrap_err();
        assert!(matches!(err, BootstrapError::RuntimeCreationFailed { .. }));
        assert_eq!(runner.venv_creations(), 1);

        runner.push_venv_failure("Text file busy");
        runner.push_venv_failure("Text file busy");
        let err = ensure(&root, &handle(), Platform::current(), &runner, &lock).unwrap_err();
        assert!(err.to_string().contains("Text file busy"));
        assert_eq!(runner.venv_creations(), 3);
    }

    #[test]
    fn failed_toolchain_upgrade_is_fatal() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("venv");
        let runner = FakeRunner::with_version("3.12");
        runner.fail_toolchain_upgrade(true);
        let mut lock_file = RuntimeLockFile::open(&root).unwrap();
        let lock = lock_file.acquire().unwrap();

        let err = ensure(&root, &handle(), Platform::current(), &runner, &lock).unwrap_err();
        assert!(matches!(err, BootstrapError::RuntimeCreationFailed { .. }));
        assert!(err.to_string().contains("toolchain upgrade"));
        assert!(err.remediation().is_some());
        assert_eq!(runner.toolchain_upgrades(), 1);
    }

    #[test]
    fn refuses_to_mutate_without_matching_lock() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("venv");
        let mut other_file = RuntimeLockFile::open(&dir.path().join("other")).unwrap();
        let other = other_file.acquire().unwrap();
        let runner = FakeRunner::with_version("3.12");
        assert!(ensure(&root, &handle(), Platform::current(), &runner, &other).is_err());
        assert!(runner.calls().is_empty());
    }
}
